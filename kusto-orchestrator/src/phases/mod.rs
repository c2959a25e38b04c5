// Phase action executors.
//
// One executor per ladder phase. Each maps collaborator failures into a `DeployError` kind at
// its boundary so the orchestrator never inspects message text.

pub mod container;
pub mod runtime;
pub mod verification;
pub mod virtualization;

use async_trait::async_trait;
use log::{info, warn};
use std::time::Instant;

use crate::config::DeployContext;
use crate::error::{DeployError, DeployResult};
use crate::installation::bypass;
use crate::installation::download::DownloadResult;
use crate::models::phase::Phase;
use verification::VerificationReport;

/// What the orchestrator does after a phase action succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Re-detect and keep going in this process.
    Continue,
    /// The host must restart before the next phase can be detected.
    RebootRequired,
}

#[async_trait]
pub trait PhaseActions: Send + Sync {
    /// Run the action for a detected phase.
    async fn execute(&self, phase: Phase, ctx: &DeployContext) -> DeployResult<PhaseOutcome>;

    /// Fetch the runtime installer only (`--download-only`).
    async fn download_installer(&self, ctx: &DeployContext) -> DeployResult<DownloadResult>;

    /// Post-deployment checks. Never fails; problems come back as warnings.
    async fn final_verification(&self, ctx: &DeployContext) -> VerificationReport;
}

/// Executors that act on the real host.
pub struct LiveActions;

#[async_trait]
impl PhaseActions for LiveActions {
    async fn execute(&self, phase: Phase, ctx: &DeployContext) -> DeployResult<PhaseOutcome> {
        let started = Instant::now();
        info!("[PHASE: {}] [STEP: action] entered", phase.log_label());

        let result = match phase {
            Phase::Wsl2Install => virtualization::install_virtualization(ctx).await,
            Phase::DockerInstall => runtime::install_runtime(ctx).await,
            Phase::DockerWait => runtime::wait_for_daemon(ctx).await,
            Phase::KustoDeploy => container::deploy(ctx).await,
            Phase::KustoStart => container::start(ctx).await,
            Phase::Complete => Ok(PhaseOutcome::Continue),
            Phase::RebootRequired | Phase::FinalVerification => Err(DeployError::Unexpected(
                anyhow::anyhow!("{} is not an executable phase", phase),
            )),
        };

        match &result {
            Ok(outcome) => info!(
                "[PHASE: {}] [STEP: action] exit (outcome={:?}, duration_ms={})",
                phase.log_label(),
                outcome,
                started.elapsed().as_millis()
            ),
            Err(_) => info!(
                "[PHASE: {}] [STEP: action] exit err (duration_ms={})",
                phase.log_label(),
                started.elapsed().as_millis()
            ),
        }
        result
    }

    async fn download_installer(&self, ctx: &DeployContext) -> DeployResult<DownloadResult> {
        runtime::download_installer(ctx).await
    }

    async fn final_verification(&self, ctx: &DeployContext) -> VerificationReport {
        verification::run_final_verification(ctx).await
    }
}

/// Apply the first-run settings overlay. The runtime can still come up without it, so a
/// failure is a warning.
pub(crate) fn apply_bypass(ctx: &DeployContext, phase: Phase) {
    let Some(overlay) = &ctx.config.settings_overlay else {
        return;
    };
    if let Err(e) = bypass::apply_overlay(overlay) {
        warn!(
            "[PHASE: {}] [STEP: bypass] Settings overlay not applied: {:#}",
            phase.log_label(),
            e
        );
    }
}
