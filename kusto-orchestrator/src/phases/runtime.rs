// DOCKER_INSTALL and DOCKER_WAIT

use log::{error, info};
use std::future::Future;
use std::time::Duration;

use crate::config::DeployContext;
use crate::error::{DeployError, DeployResult};
use crate::installation::docker;
use crate::installation::download::{DownloadManager, DownloadResult};
use crate::installation::readiness::{wait_until, WaitBounds};
use crate::models::phase::Phase;
use crate::phases::{apply_bypass, PhaseOutcome};
use crate::utils::os_detection::OperatingSystem;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const RUNTIME_INSTALL_TIMEOUT: Duration = Duration::from_secs(30 * 60);

pub async fn download_installer(ctx: &DeployContext) -> DeployResult<DownloadResult> {
    let source = &ctx.config.runtime_installer;
    let manager = DownloadManager::standard(DOWNLOAD_TIMEOUT)
        .map_err(|e| DeployError::install(Phase::DockerInstall, e))?;
    manager
        .fetch(
            &source.url,
            &ctx.installer_path(),
            source.minimum_size_bytes,
            source.sha256.as_deref(),
        )
        .await
}

/// Download and run the runtime installer with the first-run overlays around it.
///
/// Docker Desktop needs a restart before its WSL2 backend is usable; Docker Engine does not.
pub async fn install_runtime(ctx: &DeployContext) -> DeployResult<PhaseOutcome> {
    apply_bypass(ctx, Phase::DockerInstall);

    let result = download_installer(ctx).await?;
    info!(
        "[PHASE: docker_install] [STEP: download] Installer ready (bytes_transferred={}, strategy={:?})",
        result.bytes, result.strategy
    );

    docker::install_runtime(ctx.os, &ctx.installer_path(), RUNTIME_INSTALL_TIMEOUT)
        .await
        .map_err(|e| DeployError::install(Phase::DockerInstall, e))?;

    apply_bypass(ctx, Phase::DockerInstall);

    Ok(if ctx.os == OperatingSystem::Windows {
        PhaseOutcome::RebootRequired
    } else {
        PhaseOutcome::Continue
    })
}

/// Start the runtime and wait for its daemon.
pub async fn wait_for_daemon(ctx: &DeployContext) -> DeployResult<PhaseOutcome> {
    apply_bypass(ctx, Phase::DockerWait);
    docker::start_runtime(ctx.os).await;

    let os = ctx.os;
    await_daemon(ctx, move || async move {
        docker::is_docker_daemon_running(&docker::resolve_docker_program(os))
            .await
            .unwrap_or(false)
    })
    .await?;
    Ok(PhaseOutcome::Continue)
}

/// Poll `check` within the configured daemon bounds; timeout is fatal.
pub async fn await_daemon<F, Fut>(ctx: &DeployContext, check: F) -> DeployResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let (max, interval) = ctx.daemon_wait();
    let bounds = WaitBounds::new(max, interval)
        .map_err(|e| DeployError::install(Phase::DockerWait, e))?;

    if wait_until("docker_daemon", bounds, check).await {
        info!("[PHASE: docker_wait] [STEP: readiness] Container runtime daemon is reachable");
        return Ok(());
    }

    error!(
        "[PHASE: docker_wait] [STEP: readiness] Daemon did not come up.\n{}",
        docker::daemon_troubleshooting(ctx.os)
    );
    Err(DeployError::ReadinessTimeout {
        what: "container runtime daemon".to_string(),
        waited: max,
    })
}
