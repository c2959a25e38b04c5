// WSL2_INSTALL

use log::info;

use crate::config::DeployContext;
use crate::error::{DeployError, DeployResult};
use crate::installation::wsl;
use crate::models::phase::Phase;
use crate::phases::PhaseOutcome;

/// Enable the Windows features and install the WSL platform. Always needs a restart.
pub async fn install_virtualization(_ctx: &DeployContext) -> DeployResult<PhaseOutcome> {
    let reboot_pending = wsl::enable_features()
        .await
        .map_err(|e| DeployError::install(Phase::Wsl2Install, e))?;
    wsl::install()
        .await
        .map_err(|e| DeployError::install(Phase::Wsl2Install, e))?;

    info!(
        "[PHASE: wsl2_install] [STEP: done] Virtualization layer installed (dism_reboot_pending={}); restart required",
        reboot_pending
    );
    Ok(PhaseOutcome::RebootRequired)
}
