//! Arbitration of the two exclusive, time-windowed profiling facilities.
//!
//! A capture walks `Idle -> Armed -> Capturing -> {Completed, Cancelled, Failed} -> Idle`:
//!
//! - [`ProfileSession::arm`] takes the per-resource lock or fails fast with
//!   [`CaptureError::AlreadyActive`]. Nothing ever waits for the lock.
//! - [`ArmedCapture::start`] starts the facility writing into a [`ByteSink`].
//!   A refusal drops the lock together with the armed capture.
//! - [`ActiveCapture::finish`] waits for the window, the cancel token or a
//!   recording failure, whichever happens first, then stops the facility.
//!   The lock is released when `finish` returns.
//!
//! `cpu` and `trace` have independent locks and may run at the same time.

use crate::error::{CaptureError, FacilityError};
use futures_util::future::BoxFuture;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Exclusive, process-wide profiling resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    Cpu,
    Trace,
}

impl Resource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resource::Cpu => "cpu",
            Resource::Trace => "trace",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a capture that did not fail came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The window elapsed.
    Completed,
    /// The cancel token fired first. Streamed formats hold a truncated but
    /// well-formed prefix, whole-snapshot formats may hold nothing.
    Cancelled,
}

pub(crate) const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

pub type ByteStream = mpsc::Receiver<Vec<u8>>;

/// Writing half of a capture's output stream.
#[derive(Debug, Clone)]
pub struct ByteSink {
    tx: mpsc::Sender<Vec<u8>>,
}

impl ByteSink {
    /// Creates a sink buffering at most `capacity` chunks.
    pub fn channel(capacity: usize) -> (Self, ByteStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub async fn write(&self, chunk: Vec<u8>) -> Result<(), CaptureError> {
        self.tx
            .send(chunk)
            .await
            .map_err(|_| CaptureError::StreamWriteFailed)
    }

    /// Non-blocking write. `Ok(false)` means the chunk was dropped because
    /// the reader is behind.
    pub fn try_write(&self, chunk: Vec<u8>) -> Result<bool, CaptureError> {
        match self.tx.try_send(chunk) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Ok(false),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(CaptureError::StreamWriteFailed),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Resolves once the reading half is gone.
    pub async fn closed(&self) {
        self.tx.closed().await
    }
}

/// An external profiling capability the session starts and stops.
pub trait Facility: Send + Sync {
    fn start(&self, sink: ByteSink) -> Result<Box<dyn Recording>, FacilityError>;
}

/// A running facility.
pub trait Recording: Send {
    /// Resolves only if the recording breaks down before it is stopped.
    fn failed(&mut self) -> BoxFuture<'_, CaptureError>;

    /// Stops the facility and flushes whatever it still holds into the sink.
    fn stop(self: Box<Self>) -> BoxFuture<'static, Result<(), CaptureError>>;
}

struct Slot {
    lock: Arc<Mutex<()>>,
    active: Arc<AtomicBool>,
    facility: Arc<dyn Facility>,
}

impl Slot {
    fn new(facility: Arc<dyn Facility>) -> Self {
        Self {
            lock: Arc::new(Mutex::new(())),
            active: Arc::new(AtomicBool::new(false)),
            facility,
        }
    }
}

/// Ownership of a resource. The flag is cleared just before the lock is
/// released, so observers never touch the lock itself.
struct Permit {
    active: Arc<AtomicBool>,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.active.store(false, Ordering::Release);
    }
}

pub struct ProfileSession {
    cpu: Slot,
    trace: Slot,
}

impl fmt::Debug for ProfileSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProfileSession")
            .field("cpu_active", &self.is_active(Resource::Cpu))
            .field("trace_active", &self.is_active(Resource::Trace))
            .finish()
    }
}

impl Default for ProfileSession {
    /// Backed by the pprof CPU sampler and the tracing-based execution tracer.
    fn default() -> Self {
        Self::new(
            Arc::new(crate::cpu::CpuSampler::default()),
            Arc::new(crate::trace::ExecutionTracer),
        )
    }
}

impl ProfileSession {
    pub fn new(cpu: Arc<dyn Facility>, trace: Arc<dyn Facility>) -> Self {
        Self {
            cpu: Slot::new(cpu),
            trace: Slot::new(trace),
        }
    }

    fn slot(&self, resource: Resource) -> &Slot {
        match resource {
            Resource::Cpu => &self.cpu,
            Resource::Trace => &self.trace,
        }
    }

    pub fn is_active(&self, resource: Resource) -> bool {
        self.slot(resource).active.load(Ordering::Acquire)
    }

    /// Idle -> Armed. Never waits for a capture already holding the resource.
    pub fn arm(&self, resource: Resource) -> Result<ArmedCapture, CaptureError> {
        let slot = self.slot(resource);
        let guard = Arc::clone(&slot.lock)
            .try_lock_owned()
            .map_err(|_| CaptureError::AlreadyActive(resource))?;
        slot.active.store(true, Ordering::Release);
        let permit = Permit {
            active: Arc::clone(&slot.active),
            _guard: guard,
        };
        debug!(%resource, "capture armed");
        Ok(ArmedCapture {
            resource,
            facility: Arc::clone(&slot.facility),
            permit,
        })
    }

    /// Runs a whole capture. `cancel` may be a token that never fires.
    pub async fn capture(
        &self,
        resource: Resource,
        sink: ByteSink,
        window: Duration,
        cancel: &CancellationToken,
    ) -> Result<Outcome, CaptureError> {
        self.arm(resource)?.start(sink)?.finish(window, cancel).await
    }
}

/// Holds the resource lock; the facility is not running yet.
pub struct ArmedCapture {
    resource: Resource,
    facility: Arc<dyn Facility>,
    permit: Permit,
}

impl ArmedCapture {
    pub fn resource(&self) -> Resource {
        self.resource
    }

    /// Armed -> Capturing, or Failed with the lock released.
    pub fn start(self, sink: ByteSink) -> Result<ActiveCapture, CaptureError> {
        let ArmedCapture {
            resource,
            facility,
            permit,
        } = self;
        match facility.start(sink) {
            Ok(recording) => {
                info!(%resource, "capture started");
                Ok(ActiveCapture {
                    resource,
                    started_at: Instant::now(),
                    recording,
                    _permit: permit,
                })
            }
            Err(source) => {
                warn!(%resource, error = %source, "capture could not start");
                Err(CaptureError::StartFailed { resource, source })
            }
        }
    }
}

/// A running capture; owns the resource lock until [`finish`](Self::finish) returns.
pub struct ActiveCapture {
    resource: Resource,
    started_at: Instant,
    recording: Box<dyn Recording>,
    _permit: Permit,
}

impl ActiveCapture {
    pub fn resource(&self) -> Resource {
        self.resource
    }

    pub async fn finish(
        self,
        window: Duration,
        cancel: &CancellationToken,
    ) -> Result<Outcome, CaptureError> {
        let ActiveCapture {
            resource,
            started_at,
            mut recording,
            _permit,
        } = self;
        let deadline = started_at
            .checked_add(window)
            .unwrap_or_else(|| started_at + FAR_FUTURE);

        let ended = tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(Outcome::Cancelled),
            err = recording.failed() => Err(err),
            _ = tokio::time::sleep_until(deadline) => Ok(Outcome::Completed),
        };
        let stopped = recording.stop().await;
        let elapsed = started_at.elapsed();

        let result = match (ended, stopped) {
            (Ok(Outcome::Completed), Ok(())) => Ok(Outcome::Completed),
            (Ok(Outcome::Completed), Err(e)) => Err(e),
            // The reader is usually gone after a cancel, so flush errors are expected.
            (Ok(Outcome::Cancelled), Err(e)) => {
                debug!(%resource, error = %e, "flush after cancel failed");
                Ok(Outcome::Cancelled)
            }
            (Ok(Outcome::Cancelled), Ok(())) => Ok(Outcome::Cancelled),
            (Err(e), _) => Err(e),
        };

        match &result {
            Ok(outcome) => info!(%resource, ?outcome, ?elapsed, "capture finished"),
            Err(e) => warn!(%resource, error = %e, ?elapsed, "capture failed"),
        }
        result
    }
}
