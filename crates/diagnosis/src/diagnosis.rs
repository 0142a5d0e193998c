//! The controller the host application owns: reads configuration once, picks
//! a capture target and exposes `run` / `stop`.

use crate::config::{Config, DiagnosisConfig, Mode};
use crate::error::DiagnosisError;
use crate::server::DiagnosisServer;
use tracing::{error, info};

/// Where captured diagnostics go.
pub trait Target: Send + Sync {
    /// Blocks until the target is stopped or fails.
    fn run(&self) -> Result<(), DiagnosisError>;
    fn stop(&self);

    fn as_server(&self) -> Option<&DiagnosisServer> {
        None
    }
}

/// Serves every profile over HTTP.
pub struct HttpStreamingTarget {
    server: DiagnosisServer,
}

impl HttpStreamingTarget {
    pub fn new(server: DiagnosisServer) -> Self {
        Self { server }
    }
}

impl Target for HttpStreamingTarget {
    fn run(&self) -> Result<(), DiagnosisError> {
        self.server.run()
    }

    fn stop(&self) {
        self.server.stop();
    }

    fn as_server(&self) -> Option<&DiagnosisServer> {
        Some(&self.server)
    }
}

/// Writing captures to files is not supported yet.
#[derive(Debug, Default)]
pub struct FileTarget;

impl Target for FileTarget {
    fn run(&self) -> Result<(), DiagnosisError> {
        Err(DiagnosisError::NotImplemented("file"))
    }

    fn stop(&self) {}
}

pub struct Diagnosis {
    app_name: String,
    mode: Mode,
    target: Box<dyn Target>,
}

impl std::fmt::Debug for Diagnosis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Diagnosis")
            .field("app_name", &self.app_name)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl Diagnosis {
    /// `Ok(None)` when `runtime.diagnosis.enable` is off. Errors disable the
    /// feature, the host decides whether that is fatal.
    pub fn new(app_name: &str, cfg: &Config) -> Result<Option<Self>, DiagnosisError> {
        match DiagnosisConfig::from_config(cfg) {
            Ok(Some(settings)) => Ok(Some(Self::from_settings(app_name, &settings))),
            Ok(None) => Ok(None),
            Err(e) => {
                error!(app = app_name, error = %e, "diagnosis disabled");
                Err(e.into())
            }
        }
    }

    pub fn from_settings(app_name: &str, settings: &DiagnosisConfig) -> Self {
        let target: Box<dyn Target> = match settings.mode {
            Mode::Http => Box::new(HttpStreamingTarget::new(DiagnosisServer::new(
                app_name,
                &settings.http,
            ))),
            Mode::File => Box::new(FileTarget),
        };
        Self::with_target(app_name, settings.mode, target)
    }

    pub fn with_target(app_name: &str, mode: Mode, target: Box<dyn Target>) -> Self {
        Self {
            app_name: app_name.to_string(),
            mode,
            target,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn app_name(&self) -> &str {
        &self.app_name
    }

    pub fn server(&self) -> Option<&DiagnosisServer> {
        self.target.as_server()
    }

    /// Blocks the calling thread. A clean [`stop`](Self::stop) returns `Ok`.
    pub fn run(&self) -> Result<(), DiagnosisError> {
        if let Some(server) = self.server() {
            info!(app = %self.app_name, address = server.address(), "diagnosis server starting");
        }
        let result = self.target.run();
        if let Err(e) = &result {
            error!(app = %self.app_name, mode = %self.mode, error = %e, "diagnosis run failed");
        }
        result
    }

    pub fn stop(&self) {
        self.target.stop();
    }
}
