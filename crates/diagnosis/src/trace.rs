//! Execution tracing facility built on `tracing`.
//!
//! The host adds [`TraceLayer`] to its subscriber once at startup:
//!
//! ```rust,ignore
//! use tracing_subscriber::prelude::*;
//!
//! tracing_subscriber::registry()
//!     .with(tracing_subscriber::fmt::layer())
//!     .with(diagnosis::TraceLayer)
//!     .init();
//! ```
//!
//! While a trace capture runs, every span lifecycle transition and every event
//! seen by the layer is written to the capture as one JSON line. The stream is
//! framed by a `start` record and, unless the capture is cut short, a `stop`
//! record carrying the number of records dropped because the reader was slow.
//! Outside a capture the layer costs one atomic load per callback.

use crate::error::{CaptureError, FacilityError};
use crate::session::{ByteSink, Facility, Recording};
use crate::tid::current_tid;
use arc_swap::ArcSwapOption;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use parking_lot::RwLock;
use std::sync::{Arc, LazyLock};
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

static TRACING: AtomicBool = AtomicBool::new(false);
static TAP: LazyLock<ArcSwapOption<Tap>> = LazyLock::new(ArcSwapOption::empty);

/// Destination of trace records while a capture runs.
struct Tap {
    sink: ByteSink,
    started: Instant,
    dropped: AtomicU64,
    broken: CancellationToken,
    /// Emitters hold the read side while writing; closing takes the write
    /// side, so no record lands after the tap is closed.
    open: RwLock<bool>,
}

impl Tap {
    fn new(sink: ByteSink) -> Self {
        Self {
            sink,
            started: Instant::now(),
            dropped: AtomicU64::new(0),
            broken: CancellationToken::new(),
            open: RwLock::new(true),
        }
    }

    fn emit(&self, record: &TraceRecord<'_>) {
        let open = self.open.read();
        if !*open {
            return;
        }
        let mut line = match serde_json::to_vec(record) {
            Ok(line) => line,
            Err(_) => return,
        };
        line.push(b'\n');
        match self.sink.try_write(line) {
            Ok(true) => {}
            Ok(false) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => self.broken.cancel(),
        }
    }

    /// Waits out in-flight emitters and refuses later ones.
    fn close(&self) {
        *self.open.write() = false;
    }

    fn elapsed_us(&self) -> u64 {
        self.started.elapsed().as_micros() as u64
    }
}

#[derive(Serialize)]
struct TraceRecord<'a> {
    ts_us: u64,
    kind: &'static str,
    tid: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    thread: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    span: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    level: Option<&'a str>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    fields: Map<String, Value>,
}

impl<'a> TraceRecord<'a> {
    fn new(tap: &Tap, kind: &'static str) -> Self {
        Self {
            ts_us: tap.elapsed_us(),
            kind,
            tid: current_tid(),
            thread: None,
            span: None,
            parent: None,
            name: None,
            target: None,
            level: None,
            fields: Map::new(),
        }
    }
}

#[derive(Default)]
struct FieldVisitor(Map<String, Value>);

impl Visit for FieldVisitor {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0
            .insert(field.name().to_string(), Value::from(format!("{:?}", value)));
    }
}

fn with_tap(f: impl FnOnce(&Tap)) {
    if !TRACING.load(Ordering::Acquire) {
        return;
    }
    let guard = TAP.load();
    if let Some(tap) = &*guard {
        f(tap);
    }
}

/// `tracing-subscriber` layer feeding the execution tracer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceLayer;

impl<S> Layer<S> for TraceLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        with_tap(|tap| {
            let meta = attrs.metadata();
            let mut visitor = FieldVisitor::default();
            attrs.record(&mut visitor);
            let parent = if attrs.is_root() {
                None
            } else {
                attrs
                    .parent()
                    .cloned()
                    .or_else(|| ctx.current_span().id().cloned())
                    .map(|p| p.into_u64())
            };
            let thread = std::thread::current();
            let mut record = TraceRecord::new(tap, "span_new");
            record.thread = thread.name();
            record.span = Some(id.into_u64());
            record.parent = parent;
            record.name = Some(meta.name());
            record.target = Some(meta.target());
            record.level = Some(meta.level().as_str());
            record.fields = visitor.0;
            tap.emit(&record);
        });
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, _ctx: Context<'_, S>) {
        with_tap(|tap| {
            let mut visitor = FieldVisitor::default();
            values.record(&mut visitor);
            let mut record = TraceRecord::new(tap, "span_record");
            record.span = Some(id.into_u64());
            record.fields = visitor.0;
            tap.emit(&record);
        });
    }

    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        span_transition("enter", id, &ctx);
    }

    fn on_exit(&self, id: &Id, ctx: Context<'_, S>) {
        span_transition("exit", id, &ctx);
    }

    fn on_close(&self, id: Id, ctx: Context<'_, S>) {
        span_transition("close", &id, &ctx);
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        with_tap(|tap| {
            let meta = event.metadata();
            let mut visitor = FieldVisitor::default();
            event.record(&mut visitor);
            let span = ctx.event_span(event).map(|s| s.id().into_u64());
            let thread = std::thread::current();
            let mut record = TraceRecord::new(tap, "event");
            record.thread = thread.name();
            record.span = span;
            record.target = Some(meta.target());
            record.level = Some(meta.level().as_str());
            record.fields = visitor.0;
            tap.emit(&record);
        });
    }
}

fn span_transition<S>(kind: &'static str, id: &Id, ctx: &Context<'_, S>)
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    with_tap(|tap| {
        let span = ctx.span(id);
        let mut record = TraceRecord::new(tap, kind);
        record.span = Some(id.into_u64());
        record.name = span.as_ref().map(|s| s.name());
        tap.emit(&record);
    });
}

/// The process-wide execution tracer. At most one capture may own it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionTracer;

impl ExecutionTracer {
    pub fn is_running() -> bool {
        TRACING.load(Ordering::Acquire)
    }
}

#[derive(Serialize)]
struct StartRecord<'a> {
    kind: &'static str,
    started_at: String,
    pid: u32,
    version: &'a str,
}

#[derive(Serialize)]
struct StopRecord {
    kind: &'static str,
    ts_us: u64,
    dropped: u64,
}

impl Facility for ExecutionTracer {
    fn start(&self, sink: ByteSink) -> Result<Box<dyn Recording>, FacilityError> {
        if TRACING
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(FacilityError::Busy("execution tracer"));
        }

        let mut header = serde_json::to_vec(&StartRecord {
            kind: "start",
            started_at: chrono::Utc::now().to_rfc3339(),
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION"),
        })
        .map_err(|e| FacilityError::Profiler(e.to_string()))?;
        header.push(b'\n');

        let tap = Arc::new(Tap::new(sink));
        // The header goes first so readers can rely on it.
        if tap.sink.try_write(header).is_err() {
            TRACING.store(false, Ordering::Release);
            return Err(FacilityError::Profiler(
                "capture stream closed before tracing started".to_string(),
            ));
        }
        TAP.store(Some(Arc::clone(&tap)));
        Ok(Box::new(TraceRecording { tap }))
    }
}

struct TraceRecording {
    tap: Arc<Tap>,
}

impl TraceRecording {
    /// Closes the tap and hands the tracer back, unless another recording
    /// already owns it.
    fn release(&self) {
        self.tap.close();
        let current = TAP.load();
        if matches!(&*current, Some(owner) if Arc::ptr_eq(owner, &self.tap)) {
            TAP.store(None);
            TRACING.store(false, Ordering::Release);
        }
    }
}

impl Drop for TraceRecording {
    fn drop(&mut self) {
        self.release();
    }
}

impl Recording for TraceRecording {
    fn failed(&mut self) -> BoxFuture<'_, CaptureError> {
        async move {
            tokio::select! {
                _ = self.tap.broken.cancelled() => {}
                _ = self.tap.sink.closed() => {}
            }
            CaptureError::StreamWriteFailed
        }
        .boxed()
    }

    fn stop(self: Box<Self>) -> BoxFuture<'static, Result<(), CaptureError>> {
        self.release();
        let tap = Arc::clone(&self.tap);
        drop(self);
        async move {
            let dropped = tap.dropped.load(Ordering::Relaxed);
            if dropped > 0 {
                tracing::debug!(dropped, "trace records dropped by slow reader");
            }
            let mut trailer = serde_json::to_vec(&StopRecord {
                kind: "stop",
                ts_us: tap.elapsed_us(),
                dropped,
            })
            .map_err(|_| CaptureError::StreamWriteFailed)?;
            trailer.push(b'\n');
            tap.sink.write(trailer).await
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::prelude::*;

    fn lines(chunks: Vec<Vec<u8>>) -> Vec<Value> {
        chunks
            .iter()
            .map(|c| serde_json::from_slice(c).expect("each chunk is one JSON line"))
            .collect()
    }

    #[tokio::test]
    async fn closed_tap_drops_late_records() {
        let (sink, mut stream) = ByteSink::channel(8);
        let tap = Tap::new(sink);
        tap.emit(&TraceRecord::new(&tap, "event"));
        tap.close();
        tap.emit(&TraceRecord::new(&tap, "event"));
        tap.sink.write(b"trailer\n".to_vec()).await.unwrap();
        drop(tap);

        let mut chunks = Vec::new();
        while let Some(chunk) = stream.recv().await {
            chunks.push(chunk);
        }
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1], b"trailer\n");
    }

    // The tracer is process-wide, so all of its unit coverage lives in one test.
    #[tokio::test]
    async fn records_spans_and_events_between_start_and_stop() {
        let subscriber = tracing_subscriber::registry().with(TraceLayer);
        let _default = tracing::subscriber::set_default(subscriber);

        tracing::info!("before capture");

        let (sink, mut stream) = ByteSink::channel(64);
        let recording = ExecutionTracer.start(sink).expect("start");
        assert!(ExecutionTracer::is_running());

        let (other, _other_stream) = ByteSink::channel(1);
        assert!(matches!(
            ExecutionTracer.start(other),
            Err(FacilityError::Busy(_))
        ));

        {
            let span = tracing::info_span!("load_config", attempt = 2);
            let _entered = span.enter();
            tracing::warn!(path = "/etc/app.toml", "config missing");
        }

        recording.stop().await.expect("stop");
        assert!(!ExecutionTracer::is_running());
        tracing::info!("after capture");

        let mut chunks = Vec::new();
        while let Some(chunk) = stream.recv().await {
            chunks.push(chunk);
        }
        let records = lines(chunks);
        let kinds: Vec<&str> = records.iter().map(|r| r["kind"].as_str().unwrap()).collect();
        assert_eq!(
            kinds,
            vec!["start", "span_new", "enter", "event", "exit", "close", "stop"]
        );
        assert_eq!(records[1]["name"], "load_config");
        assert_eq!(records[1]["fields"]["attempt"], 2);
        assert_eq!(records[3]["fields"]["message"], "config missing");
        assert_eq!(records[3]["level"], "WARN");
        assert_eq!(records[3]["span"], records[1]["span"]);
        assert_eq!(records[6]["dropped"], 0);
    }
}
