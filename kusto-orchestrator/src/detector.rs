// Phase detection from live host state.
//
// The detector is the only authority on "where are we": it samples the host every time it is
// asked and never consults the checkpoint. Checks are read-only, and a check that errors counts
// as "not satisfied" so detection itself cannot fail.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info};
use std::time::Instant;

use crate::config::DeployContext;
use crate::installation::docker::{self, ContainerState};
use crate::installation::wsl;
use crate::models::phase::Phase;
use crate::utils::os_detection::{requires_virtualization_layer, OperatingSystem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualizationStatus {
    Missing,
    NeedsUpdate,
    Ready,
}

/// Read-only checks of the host.
#[async_trait]
pub trait Environment: Send + Sync {
    async fn virtualization_status(&self) -> Result<VirtualizationStatus>;

    /// Runtime binary is present and answers a version query.
    async fn runtime_available(&self) -> Result<bool>;

    /// Runtime daemon answers an info query.
    async fn daemon_reachable(&self) -> Result<bool>;

    /// State of the named container; `None` when it does not exist.
    async fn container_state(&self, name: &str) -> Result<Option<ContainerState>>;
}

/// Checks backed by wsl.exe and the docker CLI.
pub struct LiveEnvironment {
    os: OperatingSystem,
}

impl LiveEnvironment {
    pub fn new(os: OperatingSystem) -> Self {
        Self { os }
    }

    // Re-resolved per check: an install earlier in this run can put docker on disk.
    fn docker(&self) -> String {
        docker::resolve_docker_program(self.os)
    }
}

#[async_trait]
impl Environment for LiveEnvironment {
    async fn virtualization_status(&self) -> Result<VirtualizationStatus> {
        Ok(match wsl::query_status().await? {
            None => VirtualizationStatus::Missing,
            Some(s) if !s.is_ready() => VirtualizationStatus::NeedsUpdate,
            Some(_) => VirtualizationStatus::Ready,
        })
    }

    async fn runtime_available(&self) -> Result<bool> {
        docker::get_docker_version(&self.docker()).await?;
        Ok(true)
    }

    async fn daemon_reachable(&self) -> Result<bool> {
        docker::is_docker_daemon_running(&self.docker()).await
    }

    async fn container_state(&self, name: &str) -> Result<Option<ContainerState>> {
        docker::inspect_container(&self.docker(), name).await
    }
}

fn check_failed(step: &str, e: &anyhow::Error) {
    debug!(
        "[PHASE: detection] [STEP: {}] Check failed, treating as not satisfied: {:#}",
        step, e
    );
}

/// First unsatisfied rung of the ladder, or `COMPLETE`.
pub async fn determine_current_phase(env: &dyn Environment, ctx: &DeployContext) -> Phase {
    let started = Instant::now();
    let phase = detect(env, ctx).await;
    info!(
        "[PHASE: detection] [STEP: ladder] Detected phase {} (duration_ms={})",
        phase,
        started.elapsed().as_millis()
    );
    phase
}

async fn detect(env: &dyn Environment, ctx: &DeployContext) -> Phase {
    let check_virtualization =
        requires_virtualization_layer(ctx.os) && !ctx.options.skip_virtualization_install;
    if check_virtualization {
        match env.virtualization_status().await {
            Ok(VirtualizationStatus::Ready) => {}
            Ok(status) => {
                debug!(
                    "[PHASE: detection] [STEP: wsl] Virtualization layer not ready ({:?})",
                    status
                );
                return Phase::Wsl2Install;
            }
            Err(e) => {
                check_failed("wsl", &e);
                return Phase::Wsl2Install;
            }
        }
    }

    match env.runtime_available().await {
        Ok(true) => {}
        Ok(false) => return Phase::DockerInstall,
        Err(e) => {
            check_failed("docker", &e);
            return Phase::DockerInstall;
        }
    }

    match env.daemon_reachable().await {
        Ok(true) => {}
        Ok(false) => return Phase::DockerWait,
        Err(e) => {
            check_failed("daemon", &e);
            return Phase::DockerWait;
        }
    }

    match env.container_state(&ctx.config.container_name).await {
        Ok(Some(state)) if state.is_running() => Phase::Complete,
        Ok(Some(_)) => Phase::KustoStart,
        Ok(None) => Phase::KustoDeploy,
        Err(e) => {
            check_failed("container", &e);
            Phase::KustoDeploy
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    /// Host state a test can mutate between detections.
    #[derive(Debug, Clone)]
    pub struct HostState {
        pub virtualization: Result<VirtualizationStatus, String>,
        pub runtime: Result<bool, String>,
        pub daemon: Result<bool, String>,
        pub container: Result<Option<ContainerState>, String>,
    }

    impl HostState {
        pub fn fresh() -> Self {
            HostState {
                virtualization: Ok(VirtualizationStatus::Missing),
                runtime: Ok(false),
                daemon: Ok(false),
                container: Ok(None),
            }
        }

        pub fn complete() -> Self {
            HostState {
                virtualization: Ok(VirtualizationStatus::Ready),
                runtime: Ok(true),
                daemon: Ok(true),
                container: Ok(Some(ContainerState::Running)),
            }
        }
    }

    pub struct FakeEnvironment {
        pub state: Mutex<HostState>,
    }

    impl FakeEnvironment {
        pub fn new(state: HostState) -> Self {
            Self {
                state: Mutex::new(state),
            }
        }

        pub fn update(&self, f: impl FnOnce(&mut HostState)) {
            if let Ok(mut s) = self.state.lock() {
                f(&mut s);
            }
        }

        fn snapshot(&self) -> HostState {
            self.state.lock().map(|s| s.clone()).unwrap_or_else(|_| HostState::fresh())
        }
    }

    #[async_trait]
    impl Environment for FakeEnvironment {
        async fn virtualization_status(&self) -> Result<VirtualizationStatus> {
            self.snapshot().virtualization.map_err(anyhow::Error::msg)
        }

        async fn runtime_available(&self) -> Result<bool> {
            self.snapshot().runtime.map_err(anyhow::Error::msg)
        }

        async fn daemon_reachable(&self) -> Result<bool> {
            self.snapshot().daemon.map_err(anyhow::Error::msg)
        }

        async fn container_state(&self, _name: &str) -> Result<Option<ContainerState>> {
            self.snapshot().container.map_err(anyhow::Error::msg)
        }
    }
}
