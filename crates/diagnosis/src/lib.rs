//! Runtime diagnosis exporter: heap, allocation, thread, CPU and execution-trace
//! profiles of a live process, served over HTTP under `/diagnosis`.
//!
//! ## Setup
//!
//! ```rust,ignore
//! #[global_allocator]
//! static GLOBAL: diagnosis::CountingAllocator = diagnosis::CountingAllocator;
//!
//! let cfg = diagnosis::Config::from_env();
//! if let Some(diagnosis) = diagnosis::Diagnosis::new("my-app", &cfg)? {
//!     let diagnosis = std::sync::Arc::new(diagnosis);
//!     let runner = std::sync::Arc::clone(&diagnosis);
//!     std::thread::spawn(move || runner.run());
//!     // ... later
//!     diagnosis.stop();
//! }
//! ```
//!
//! With `RUNTIME_DIAGNOSIS_ENABLE=true` and `RUNTIME_DIAGNOSIS_MODE=http` the
//! profiles are reachable at `http://localhost:7070/diagnosis/pprof/`.

pub(crate) mod alloc;
pub(crate) mod config;
pub(crate) mod cpu;
pub(crate) mod diagnosis;
pub(crate) mod error;
pub(crate) mod registry;
pub(crate) mod server;
pub(crate) mod session;
pub(crate) mod symbol;
pub(crate) mod tid;
pub(crate) mod trace;

pub mod sync;
pub mod threads;

pub use alloc::{AllocStats, CountingAllocator};
pub use config::{
    Config, DiagnosisConfig, HttpSettings, Mode, DEFAULT_HTTP_ADDRESS, DEFAULT_WRITE_TIMEOUT,
    KEY_ENABLE, KEY_HTTP_ADDRESS, KEY_HTTP_WRITE_TIMEOUT, KEY_MODE,
};
pub use cpu::CpuSampler;
pub use diagnosis::{Diagnosis, FileTarget, HttpStreamingTarget, Target};
pub use error::{CaptureError, ConfigError, DiagnosisError, FacilityError};
pub use registry::{NamedProfile, ProfileRegistry};
pub use server::{DiagnosisServer, Route, DEFAULT_CPU_SECONDS, DEFAULT_TRACE_SECONDS};
pub use session::{
    ActiveCapture, ArmedCapture, ByteSink, ByteStream, Facility, Outcome, ProfileSession,
    Recording, Resource,
};
pub use trace::{ExecutionTracer, TraceLayer};
