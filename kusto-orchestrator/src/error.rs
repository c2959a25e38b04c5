// Error taxonomy for the deployment driver.
//
// Collaborators work in `anyhow::Result` and add context; every component boundary maps
// into one of these kinds so the orchestrator branches on the kind, never on message text.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::models::phase::Phase;

#[derive(Debug, Error)]
pub enum DeployError {
    /// Not elevated, unsupported host, or a required tool is unusable. Fatal before any phase runs.
    #[error("precondition failed: {0}")]
    Precondition(String),

    /// A subsystem install/update/deploy command failed.
    #[error("{phase} failed: {source:#}")]
    Install {
        phase: Phase,
        #[source]
        source: anyhow::Error,
    },

    /// Every strategy in the download chain failed.
    #[error("download of {url} failed after {attempts} strategy attempt(s): {last_error}")]
    Download {
        url: String,
        attempts: usize,
        last_error: String,
    },

    /// The continuation task could not be registered or its registration could not be verified.
    #[error("continuation task scheduling failed: {0:#}")]
    Scheduling(anyhow::Error),

    /// A readiness wait ran out its bound.
    #[error("timed out after {}s waiting for {what}", .waited.as_secs())]
    ReadinessTimeout { what: String, waited: Duration },

    /// A configuration file or persisted record is malformed.
    #[error("invalid format in {}: {reason}", .path.display())]
    ConfigFormat { path: PathBuf, reason: String },

    /// Anything the driver did not anticipate.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl DeployError {
    pub fn install(phase: Phase, source: anyhow::Error) -> Self {
        DeployError::Install { phase, source }
    }

    pub fn config_format(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        DeployError::ConfigFormat {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether the checkpoint must stay on disk after this error so the next invocation can resume.
    ///
    /// Only unexpected errors trigger the top-level cleanup of checkpoint + continuation task.
    pub fn retains_checkpoint(&self) -> bool {
        !matches!(self, DeployError::Unexpected(_))
    }

    /// Short, kind-specific remediation text printed next to the failure.
    pub fn remediation(&self) -> &'static str {
        match self {
            DeployError::Precondition(_) => {
                "Re-run the orchestrator from an elevated (Administrator/root) shell on a supported host."
            }
            DeployError::Install { .. } => {
                "Inspect the log for the failing command, fix the cause, then re-run the same command; completed phases are detected and skipped."
            }
            DeployError::Download { .. } => {
                "Check network connectivity/proxy settings and free disk space, then re-run."
            }
            DeployError::Scheduling(_) => {
                "Reboot manually, then re-run the same command (or use --manual to skip task scheduling)."
            }
            DeployError::ReadinessTimeout { .. } => {
                "Start the container runtime manually, confirm `docker info` succeeds, then re-run."
            }
            DeployError::ConfigFormat { .. } => {
                "Fix or delete the named file, then re-run."
            }
            DeployError::Unexpected(_) => {
                "Re-run as Administrator/root, check connectivity, try --manual, and inspect the log."
            }
        }
    }
}

pub type DeployResult<T> = std::result::Result<T, DeployError>;
