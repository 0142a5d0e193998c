use diagnosis::{Config, CountingAllocator, Diagnosis, TraceLayer};
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: CountingAllocator = CountingAllocator;

#[tracing::instrument(level = "info")]
fn allocate_batch(round: u64) -> usize {
    let mut rng = rand::thread_rng();
    let num_arrays = rng.gen_range(1..=10);
    let mut total = 0;

    for _ in 0..num_arrays {
        let size = rng.gen_range(100..1000);
        let data: Vec<u64> = (0..size).map(|_| rng.gen()).collect();
        std::hint::black_box(&data);
        total += data.len();
    }

    tracing::debug!(total, "batch allocated");
    total
}

#[tracing::instrument(level = "info")]
async fn tick(round: u64) {
    let total = allocate_batch(round);
    std::hint::black_box(total);
    tokio::time::sleep(Duration::from_millis(rand::thread_rng().gen_range(5..20))).await;
}

fn spin(until: Instant) -> u64 {
    let mut acc = 0u64;
    while Instant::now() < until {
        for i in 0..10_000u64 {
            acc = acc.wrapping_mul(31).wrapping_add(i);
        }
    }
    acc
}

// RUNTIME_DIAGNOSIS_ENABLE=true RUNTIME_DIAGNOSIS_MODE=http TEST_SLEEP_SECONDS=30 cargo run -p test-diagnosis --example basic
#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(EnvFilter::from_default_env()))
        .with(TraceLayer)
        .init();

    let cfg = Config::from_env();
    let Some(diagnosis) = Diagnosis::new("test-diagnosis", &cfg)? else {
        eyre::bail!("diagnosis is disabled, set RUNTIME_DIAGNOSIS_ENABLE=true");
    };
    let diagnosis = Arc::new(diagnosis);
    let runner = Arc::clone(&diagnosis);
    let server = std::thread::Builder::new()
        .name("diag-runner".into())
        .spawn(move || runner.run())?;

    let seconds = std::env::var("TEST_SLEEP_SECONDS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);
    let until = Instant::now() + Duration::from_secs(seconds);

    let workers: Vec<_> = (0..2)
        .map(|i| {
            std::thread::Builder::new()
                .name(format!("worker-{i}"))
                .spawn(move || spin(until))
        })
        .collect::<Result<_, _>>()?;

    let mut round = 0;
    while Instant::now() < until {
        tick(round).await;
        round += 1;
    }

    for worker in workers {
        let _ = worker.join();
    }
    diagnosis.stop();
    server
        .join()
        .map_err(|_| eyre::eyre!("diagnosis thread panicked"))??;
    Ok(())
}
