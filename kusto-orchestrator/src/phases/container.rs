// KUSTO_DEPLOY and KUSTO_START

use log::{error, info, warn};
use std::time::Duration;

use crate::config::DeployContext;
use crate::error::{DeployError, DeployResult};
use crate::installation::docker::{self, ContainerState};
use crate::installation::readiness::{wait_until, WaitBounds};
use crate::models::phase::Phase;
use crate::phases::PhaseOutcome;

const CONTAINER_WAIT: Duration = Duration::from_secs(120);
const CONTAINER_POLL_INTERVAL: Duration = Duration::from_secs(5);
const LOG_TAIL_LINES: u32 = 50;

/// Remove any stale container, pull the image, and create the named container.
pub async fn deploy(ctx: &DeployContext) -> DeployResult<PhaseOutcome> {
    let docker = docker::resolve_docker_program(ctx.os);
    let name = &ctx.config.container_name;
    let fail = |e: anyhow::Error| DeployError::install(Phase::KustoDeploy, e);

    docker::remove_container(&docker, name).await.map_err(fail)?;
    docker::docker_pull(&docker, &ctx.config.image).await.map_err(fail)?;
    docker::run_container(&docker, ctx).await.map_err(fail)?;

    wait_for_running(ctx, &docker, Phase::KustoDeploy).await?;
    info!(
        "[PHASE: kusto_deploy] [STEP: done] Container {} is running on {}",
        name,
        ctx.service_url()
    );
    Ok(PhaseOutcome::Continue)
}

/// Start the existing (stopped) container.
pub async fn start(ctx: &DeployContext) -> DeployResult<PhaseOutcome> {
    let docker = docker::resolve_docker_program(ctx.os);
    docker::start_container(&docker, &ctx.config.container_name)
        .await
        .map_err(|e| DeployError::install(Phase::KustoStart, e))?;

    wait_for_running(ctx, &docker, Phase::KustoStart).await?;
    Ok(PhaseOutcome::Continue)
}

async fn wait_for_running(ctx: &DeployContext, docker: &str, phase: Phase) -> DeployResult<()> {
    let name = ctx.config.container_name.clone();
    let bounds = WaitBounds::new(CONTAINER_WAIT, CONTAINER_POLL_INTERVAL)
        .map_err(|e| DeployError::install(phase, e))?;

    let poll_docker = docker.to_string();
    let poll_name = name.clone();
    let running = wait_until("container", bounds, move || {
        let docker = poll_docker.clone();
        let name = poll_name.clone();
        async move {
            matches!(
                docker::inspect_container(&docker, &name).await,
                Ok(Some(ContainerState::Running))
            )
        }
    })
    .await;
    if running {
        return Ok(());
    }

    let state = docker::inspect_container(docker, &name).await.ok().flatten();
    let logs = match docker::get_container_logs(docker, &name, LOG_TAIL_LINES).await {
        Ok(l) => l,
        Err(e) => {
            warn!(
                "[PHASE: {}] [STEP: logs] Could not read container logs: {:#}",
                phase.log_label(),
                e
            );
            String::new()
        }
    };
    error!(
        "[PHASE: {}] [STEP: readiness] Container not running after {}s.\n{}",
        phase.log_label(),
        bounds.max().as_secs(),
        docker::container_troubleshooting(&name, state.as_ref(), &logs)
    );
    Err(DeployError::ReadinessTimeout {
        what: format!("container {} to run", name),
        waited: bounds.max(),
    })
}
