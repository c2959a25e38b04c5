// Deployment phases.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One step of the deployment ladder, plus the two orchestrator-only bookkeeping states.
///
/// The serialized names are part of the checkpoint file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[serde(rename = "WSL2_INSTALL")]
    Wsl2Install,
    #[serde(rename = "DOCKER_INSTALL")]
    DockerInstall,
    #[serde(rename = "DOCKER_WAIT")]
    DockerWait,
    #[serde(rename = "KUSTO_DEPLOY")]
    KustoDeploy,
    #[serde(rename = "KUSTO_START")]
    KustoStart,
    #[serde(rename = "COMPLETE")]
    Complete,
    #[serde(rename = "REBOOT_REQUIRED")]
    RebootRequired,
    #[serde(rename = "FINAL_VERIFICATION")]
    FinalVerification,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Wsl2Install => "WSL2_INSTALL",
            Phase::DockerInstall => "DOCKER_INSTALL",
            Phase::DockerWait => "DOCKER_WAIT",
            Phase::KustoDeploy => "KUSTO_DEPLOY",
            Phase::KustoStart => "KUSTO_START",
            Phase::Complete => "COMPLETE",
            Phase::RebootRequired => "REBOOT_REQUIRED",
            Phase::FinalVerification => "FINAL_VERIFICATION",
        }
    }

    /// Lower-case label used in `[PHASE: ...]` log tags.
    pub fn log_label(&self) -> String {
        self.as_str().to_ascii_lowercase()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
