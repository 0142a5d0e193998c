use crate::session::Resource;
use std::io;
use thiserror::Error;

/// Construction-time configuration failures. These disable the diagnosis
/// feature only, never the host process.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("diagnosis: missing required config 'runtime.diagnosis.mode'")]
    MissingMode,
    #[error("diagnosis: unknown mode '{0}' for 'runtime.diagnosis.mode' (expected 'http' or 'file')")]
    UnknownMode(String),
}

/// Refusals reported by the underlying profiling facilities.
#[derive(Debug, Error)]
pub enum FacilityError {
    /// The facility is already recording for another owner in this process.
    #[error("{0} is already running in this process")]
    Busy(&'static str),
    #[error("{0} is not available in this build or on this platform")]
    Unsupported(&'static str),
    #[error("profiler error: {0}")]
    Profiler(String),
}

/// Failures of a time-windowed capture.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("diagnosis: a {0} capture is already in progress")]
    AlreadyActive(Resource),
    #[error("diagnosis: could not enable {resource} capture: {source}")]
    StartFailed {
        resource: Resource,
        #[source]
        source: FacilityError,
    },
    #[error("diagnosis: capture stream closed before the capture finished")]
    StreamWriteFailed,
    #[error("diagnosis: could not build {resource} report: {message}")]
    Report { resource: Resource, message: String },
}

#[derive(Debug, Error)]
pub enum DiagnosisError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("diagnosis: unknown profile '{0}'")]
    UnknownProfile(String),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("diagnosis: {0} mode is not implemented")]
    NotImplemented(&'static str),
    #[error("diagnosis: listener on {address} failed: {source}")]
    Listen {
        address: String,
        #[source]
        source: io::Error,
    },
    #[error("diagnosis: {0}")]
    Io(#[from] io::Error),
}
