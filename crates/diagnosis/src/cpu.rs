//! CPU sampling facility backed by `pprof`.
//!
//! Output is a gzip-free pprof protobuf readable by `go tool pprof` and
//! `pprof -http`. The profile is produced whole when the capture stops, so a
//! cancelled CPU capture writes nothing.

use crate::error::{CaptureError, FacilityError};
use crate::session::{ByteSink, Facility, Recording, Resource};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;

pub const DEFAULT_FREQUENCY: i32 = 100;

#[derive(Debug, Clone, Copy)]
pub struct CpuSampler {
    frequency: i32,
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self {
            frequency: DEFAULT_FREQUENCY,
        }
    }
}

impl CpuSampler {
    /// Samples per second; values below 1 fall back to the default.
    pub fn with_frequency(frequency: i32) -> Self {
        Self {
            frequency: if frequency > 0 {
                frequency
            } else {
                DEFAULT_FREQUENCY
            },
        }
    }

    pub fn frequency(&self) -> i32 {
        self.frequency
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(feature = "cpu", unix))] {
        use pprof::protos::Message;

        const BLOCKLIST: &[&str] = &["libc", "libgcc", "pthread", "vdso"];

        impl Facility for CpuSampler {
            fn start(&self, sink: ByteSink) -> Result<Box<dyn Recording>, FacilityError> {
                let guard = pprof::ProfilerGuardBuilder::default()
                    .frequency(self.frequency)
                    .blocklist(BLOCKLIST)
                    .build()
                    .map_err(|e| match e {
                        pprof::Error::Running => FacilityError::Busy("CPU profiler"),
                        other => FacilityError::Profiler(other.to_string()),
                    })?;
                Ok(Box::new(CpuRecording { guard, sink }))
            }
        }

        struct CpuRecording {
            guard: pprof::ProfilerGuard<'static>,
            sink: ByteSink,
        }

        impl Recording for CpuRecording {
            fn failed(&mut self) -> BoxFuture<'_, CaptureError> {
                async move {
                    self.sink.closed().await;
                    CaptureError::StreamWriteFailed
                }
                .boxed()
            }

            fn stop(self: Box<Self>) -> BoxFuture<'static, Result<(), CaptureError>> {
                let CpuRecording { guard, sink } = *self;
                async move {
                    let body = tokio::task::spawn_blocking(move || encode(guard))
                        .await
                        .map_err(|e| report_error(e.to_string()))??;
                    tracing::debug!(bytes = body.len(), "cpu profile encoded");
                    sink.write(body).await
                }
                .boxed()
            }
        }

        /// Builds the report while the guard is still alive; dropping it stops sampling.
        fn encode(guard: pprof::ProfilerGuard<'static>) -> Result<Vec<u8>, CaptureError> {
            let report = guard
                .report()
                .build()
                .map_err(|e| report_error(e.to_string()))?;
            let profile = report.pprof().map_err(|e| report_error(e.to_string()))?;
            Ok(profile.encode_to_vec())
        }

        fn report_error(message: String) -> CaptureError {
            CaptureError::Report {
                resource: Resource::Cpu,
                message,
            }
        }
    } else {
        impl Facility for CpuSampler {
            fn start(&self, _sink: ByteSink) -> Result<Box<dyn Recording>, FacilityError> {
                Err(FacilityError::Unsupported("CPU profiler"))
            }
        }
    }
}
