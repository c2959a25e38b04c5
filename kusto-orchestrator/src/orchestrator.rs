// Deployment state machine.
//
// Each pass detects the live phase, records it, and runs that phase's action. Live state always
// wins over the checkpoint, so re-running after any interruption is safe.

use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::time::Instant;

use crate::checkpoint::CheckpointStore;
use crate::config::DeployContext;
use crate::detector::{determine_current_phase, Environment};
use crate::error::{DeployError, DeployResult};
use crate::host::HostControl;
use crate::installation::scheduler::{ContinuationScheduler, ContinuationSpec};
use crate::models::checkpoint::{CheckpointData, DataValue};
use crate::models::phase::Phase;
use crate::phases::verification::VerificationReport;
use crate::phases::{PhaseActions, PhaseOutcome};

/// How many times a phase may still be detected after its own action succeeded.
pub const MAX_PHASE_REPEATS: u32 = 3;

#[derive(Debug)]
pub enum RunOutcome {
    Completed(VerificationReport),
    DownloadOnly,
    /// Continuation task registered. `restarting` is false under `--skip-reboot`.
    RebootScheduled { restarting: bool },
    /// Operator cancelled the countdown; the task stays registered.
    RebootCancelled,
    /// Manual mode stopped at a reboot boundary.
    ManualRebootRequired,
    CleanedUp,
    Failed(DeployError),
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Failed(_) => 1,
            _ => 0,
        }
    }
}

pub struct Orchestrator<'a> {
    ctx: &'a DeployContext,
    env: &'a dyn Environment,
    actions: &'a dyn PhaseActions,
    scheduler: &'a dyn ContinuationScheduler,
    host: &'a dyn HostControl,
    store: CheckpointStore,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        ctx: &'a DeployContext,
        env: &'a dyn Environment,
        actions: &'a dyn PhaseActions,
        scheduler: &'a dyn ContinuationScheduler,
        host: &'a dyn HostControl,
    ) -> Self {
        Self {
            ctx,
            env,
            actions,
            scheduler,
            host,
            store: CheckpointStore::for_context(ctx),
        }
    }

    /// Drive the deployment as far as it can go in this process.
    pub async fn run(&self) -> RunOutcome {
        let start = Instant::now();
        debug!(
            "[PHASE: initialization] [STEP: run] run entered (run_id={}, os={:?})",
            self.ctx.run_id, self.ctx.os
        );

        if let Some(previous) = self.store.load() {
            info!(
                "[PHASE: initialization] [STEP: checkpoint] Previous checkpoint: phase={} at {} (attempt={:?})",
                previous.phase,
                previous.timestamp,
                previous.data.get("attempt").and_then(DataValue::as_i64)
            );
        }

        let outcome = match self.drive().await {
            Ok(outcome) => outcome,
            Err(e) => self.handle_failure(e).await,
        };

        debug!(
            "[PHASE: initialization] [STEP: run] run exit (exit_code={}, duration_ms={})",
            outcome.exit_code(),
            start.elapsed().as_millis()
        );
        outcome
    }

    /// Remove the continuation task and the checkpoint, then stop.
    pub async fn cleanup_only(&self) -> RunOutcome {
        match self.cleanup().await {
            Ok(()) => {
                info!("[PHASE: cleanup] [STEP: done] Continuation task and checkpoint removed");
                RunOutcome::CleanedUp
            }
            Err(e) => self.report_failure(e),
        }
    }

    async fn drive(&self) -> DeployResult<RunOutcome> {
        self.host.check_preconditions(self.ctx).await?;

        if self.ctx.options.download_only {
            let result = self.actions.download_installer(self.ctx).await?;
            info!(
                "[PHASE: docker_install] [STEP: download] Download-only run finished ({} bytes at {:?})",
                result.file_size,
                self.ctx.installer_path()
            );
            return Ok(RunOutcome::DownloadOnly);
        }

        let mut successes: HashMap<Phase, u32> = HashMap::new();
        let mut attempt: u64 = 0;
        loop {
            let phase = determine_current_phase(self.env, self.ctx).await;
            attempt += 1;
            self.store.save(phase, self.checkpoint_data(attempt, None))?;

            if phase == Phase::Complete {
                return self.finish(attempt).await;
            }

            let done = successes.get(&phase).copied().unwrap_or(0);
            if done >= MAX_PHASE_REPEATS {
                return Err(DeployError::install(
                    phase,
                    anyhow::anyhow!(
                        "{} is still detected after {} successful attempts; the host is not converging",
                        phase,
                        done
                    ),
                ));
            }

            info!(
                "[PHASE: {}] [STEP: start] Running phase (attempt={})",
                phase.log_label(),
                attempt
            );
            match self.actions.execute(phase, self.ctx).await? {
                PhaseOutcome::Continue => {
                    *successes.entry(phase).or_insert(0) += 1;
                }
                PhaseOutcome::RebootRequired => {
                    return self.handle_reboot(phase, attempt).await;
                }
            }
        }
    }

    async fn handle_reboot(&self, after: Phase, attempt: u64) -> DeployResult<RunOutcome> {
        self.store
            .save(Phase::RebootRequired, self.checkpoint_data(attempt, Some(after)))?;
        let spec = ContinuationSpec::from_context(self.ctx);

        if self.ctx.options.manual {
            warn!(
                "[PHASE: reboot_required] [STEP: manual] {} needs a restart.\n{}",
                after,
                spec.manual_instructions()
            );
            return Ok(RunOutcome::ManualRebootRequired);
        }

        if let Err(e) = self.scheduler.register(&spec).await {
            error!(
                "[PHASE: reboot_required] [STEP: schedule] Could not register continuation task: {:#}\n{}",
                e,
                spec.manual_instructions()
            );
            return Err(DeployError::Scheduling(e));
        }
        info!(
            "[PHASE: reboot_required] [STEP: schedule] Continuation task '{}' registered",
            spec.task_name
        );

        if self.ctx.options.skip_reboot {
            info!(
                "[PHASE: reboot_required] [STEP: skip] Restart skipped; the deployment resumes at the next boot"
            );
            return Ok(RunOutcome::RebootScheduled { restarting: false });
        }

        if !self
            .host
            .countdown(self.ctx.config.reboot_countdown_seconds)
            .await
        {
            warn!(
                "[PHASE: reboot_required] [STEP: countdown] Restart cancelled. The continuation task stays registered; the deployment resumes at the next boot"
            );
            return Ok(RunOutcome::RebootCancelled);
        }

        self.host
            .restart(self.ctx.os)
            .await
            .map_err(|e| DeployError::install(Phase::RebootRequired, e))?;
        Ok(RunOutcome::RebootScheduled { restarting: true })
    }

    async fn finish(&self, attempt: u64) -> DeployResult<RunOutcome> {
        self.store
            .save(Phase::FinalVerification, self.checkpoint_data(attempt, None))?;
        let report = self.actions.final_verification(self.ctx).await;

        if self.ctx.options.manual {
            info!(
                "[PHASE: complete] [STEP: done] Deployment complete; checkpoint kept at {:?}",
                self.store.path()
            );
        } else {
            if let Err(e) = self.cleanup().await {
                warn!("[PHASE: complete] [STEP: cleanup] {}", e);
            }
            info!("[PHASE: complete] [STEP: done] Deployment complete");
        }
        info!(
            "[PHASE: complete] [STEP: summary] Service endpoint: {}",
            self.ctx.service_url()
        );
        Ok(RunOutcome::Completed(report))
    }

    async fn handle_failure(&self, e: DeployError) -> RunOutcome {
        if !e.retains_checkpoint() && !self.ctx.options.manual {
            if let Err(cleanup_err) = self.cleanup().await {
                warn!("[PHASE: cleanup] [STEP: failure] {}", cleanup_err);
            }
        }
        self.report_failure(e)
    }

    fn report_failure(&self, e: DeployError) -> RunOutcome {
        error!("[PHASE: failure] [STEP: fatal] {}", e);
        error!("[PHASE: failure] [STEP: remediation] {}", e.remediation());
        if e.retains_checkpoint() && self.store.path().exists() {
            info!(
                "[PHASE: failure] [STEP: checkpoint] Checkpoint kept at {:?}; re-run the same command to resume",
                self.store.path()
            );
        }
        RunOutcome::Failed(e)
    }

    /// Remove the continuation task and the checkpoint. Both steps always run.
    ///
    /// Manual mode never touches the scheduler.
    async fn cleanup(&self) -> DeployResult<()> {
        let unregistered = if self.ctx.options.manual {
            debug!("[PHASE: cleanup] [STEP: schedule] Manual mode; scheduler left untouched");
            Ok(())
        } else {
            self.scheduler
                .unregister(&self.ctx.config.continuation_task_name)
                .await
        };
        let cleared = self.store.clear();

        match (unregistered, cleared) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(task_err), Ok(())) => Err(DeployError::Scheduling(task_err)),
            (Ok(()), Err(store_err)) => Err(store_err),
            (Err(task_err), Err(store_err)) => Err(DeployError::Scheduling(
                task_err.context(format!("checkpoint not removed either: {}", store_err)),
            )),
        }
    }

    fn checkpoint_data(&self, attempt: u64, after: Option<Phase>) -> CheckpointData {
        let mut data = CheckpointData::new();
        data.insert("run_id".to_string(), self.ctx.run_id.as_str().into());
        data.insert("attempt".to_string(), attempt.into());
        data.insert("os".to_string(), format!("{:?}", self.ctx.os).into());
        if let Some(phase) = after {
            data.insert("after_phase".to_string(), phase.as_str().into());
        }
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_context;
    use crate::detector::fake::{FakeEnvironment, HostState};
    use crate::detector::VirtualizationStatus;
    use crate::installation::docker::ContainerState;
    use crate::installation::download::DownloadResult;
    use crate::utils::os_detection::OperatingSystem;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// Applies the effect each phase would have on the host.
    struct FakeActions {
        env: Arc<FakeEnvironment>,
        executed: Mutex<Vec<Phase>>,
        fail_on: Option<Phase>,
        unexpected_on: Option<Phase>,
        timeout_on: Option<Phase>,
        inert: Option<Phase>,
        downloads: AtomicU32,
        verifications: AtomicU32,
    }

    impl FakeActions {
        fn new(env: Arc<FakeEnvironment>) -> Self {
            Self {
                env,
                executed: Mutex::new(Vec::new()),
                fail_on: None,
                unexpected_on: None,
                timeout_on: None,
                inert: None,
                downloads: AtomicU32::new(0),
                verifications: AtomicU32::new(0),
            }
        }

        fn executed(&self) -> Vec<Phase> {
            self.executed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PhaseActions for FakeActions {
        async fn execute(&self, phase: Phase, ctx: &DeployContext) -> DeployResult<PhaseOutcome> {
            self.executed.lock().unwrap().push(phase);
            if self.fail_on == Some(phase) {
                return Err(DeployError::install(phase, anyhow::anyhow!("installer exited 1")));
            }
            if self.unexpected_on == Some(phase) {
                return Err(DeployError::Unexpected(anyhow::anyhow!("disk vanished")));
            }
            if self.timeout_on == Some(phase) {
                return Err(DeployError::ReadinessTimeout {
                    what: "container runtime daemon".into(),
                    waited: Duration::from_secs(900),
                });
            }
            if self.inert == Some(phase) {
                return Ok(PhaseOutcome::Continue);
            }
            let outcome = match phase {
                Phase::Wsl2Install => {
                    self.env
                        .update(|s| s.virtualization = Ok(VirtualizationStatus::Ready));
                    PhaseOutcome::RebootRequired
                }
                Phase::DockerInstall => {
                    self.env.update(|s| s.runtime = Ok(true));
                    if ctx.os == OperatingSystem::Windows {
                        PhaseOutcome::RebootRequired
                    } else {
                        PhaseOutcome::Continue
                    }
                }
                Phase::DockerWait => {
                    self.env.update(|s| s.daemon = Ok(true));
                    PhaseOutcome::Continue
                }
                Phase::KustoDeploy | Phase::KustoStart => {
                    self.env
                        .update(|s| s.container = Ok(Some(ContainerState::Running)));
                    PhaseOutcome::Continue
                }
                _ => PhaseOutcome::Continue,
            };
            Ok(outcome)
        }

        async fn download_installer(&self, _ctx: &DeployContext) -> DeployResult<DownloadResult> {
            self.downloads.fetch_add(1, Ordering::SeqCst);
            Ok(DownloadResult {
                bytes: 1024,
                file_size: 1024,
                average_throughput: 1024.0,
                strategy: None,
                elapsed: Duration::from_secs(1),
            })
        }

        async fn final_verification(&self, _ctx: &DeployContext) -> VerificationReport {
            self.verifications.fetch_add(1, Ordering::SeqCst);
            VerificationReport {
                service_healthy: true,
                sample_data_loaded: Some(true),
                bypass_intact: true,
                warnings: Vec::new(),
            }
        }
    }

    #[derive(Default)]
    struct FakeScheduler {
        fail_register: bool,
        fail_unregister: bool,
        registered: AtomicU32,
        unregistered: AtomicU32,
        last_spec: Mutex<Option<ContinuationSpec>>,
    }

    #[async_trait]
    impl ContinuationScheduler for FakeScheduler {
        async fn register(&self, spec: &ContinuationSpec) -> Result<()> {
            spec.validate()?;
            if self.fail_register {
                anyhow::bail!("Access is denied");
            }
            self.registered.fetch_add(1, Ordering::SeqCst);
            *self.last_spec.lock().unwrap() = Some(spec.clone());
            Ok(())
        }

        async fn unregister(&self, _task_name: &str) -> Result<()> {
            self.unregistered.fetch_add(1, Ordering::SeqCst);
            if self.fail_unregister {
                anyhow::bail!("The task is in use");
            }
            Ok(())
        }
    }

    struct FakeHost {
        precondition_error: Option<String>,
        confirm_restart: bool,
        countdowns: AtomicU32,
        restarts: AtomicU32,
    }

    impl FakeHost {
        fn new() -> Self {
            Self {
                precondition_error: None,
                confirm_restart: true,
                countdowns: AtomicU32::new(0),
                restarts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl HostControl for FakeHost {
        async fn check_preconditions(&self, _ctx: &DeployContext) -> DeployResult<()> {
            match &self.precondition_error {
                Some(msg) => Err(DeployError::Precondition(msg.clone())),
                None => Ok(()),
            }
        }

        async fn countdown(&self, _seconds: u64) -> bool {
            self.countdowns.fetch_add(1, Ordering::SeqCst);
            self.confirm_restart
        }

        async fn restart(&self, _os: OperatingSystem) -> Result<()> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn run_once(
        ctx: &DeployContext,
        env: &Arc<FakeEnvironment>,
        actions: &FakeActions,
        scheduler: &FakeScheduler,
        host: &FakeHost,
    ) -> RunOutcome {
        Orchestrator::new(ctx, env.as_ref(), actions, scheduler, host)
            .run()
            .await
    }

    #[tokio::test]
    async fn completed_host_is_an_idempotent_no_op() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_context(tmp.path());
        let env = Arc::new(FakeEnvironment::new(HostState::complete()));
        let actions = FakeActions::new(env.clone());
        let scheduler = FakeScheduler::default();
        let host = FakeHost::new();

        for _ in 0..2 {
            let outcome = run_once(&ctx, &env, &actions, &scheduler, &host).await;
            assert!(matches!(outcome, RunOutcome::Completed(_)), "{:?}", outcome);
            assert_eq!(outcome.exit_code(), 0);
        }
        assert!(actions.executed().is_empty());
        assert_eq!(actions.verifications.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.registered.load(Ordering::SeqCst), 0);
        // Each terminal run removes the (possibly absent) continuation task once.
        assert_eq!(scheduler.unregistered.load(Ordering::SeqCst), 2);
        assert!(!ctx.checkpoint_path.exists());
    }

    #[tokio::test]
    async fn terminal_run_unregisters_the_continuation_task_once() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_context(tmp.path());
        let env = Arc::new(FakeEnvironment::new(HostState::complete()));
        let actions = FakeActions::new(env.clone());
        let scheduler = FakeScheduler::default();
        let host = FakeHost::new();

        CheckpointStore::for_context(&ctx)
            .save(Phase::RebootRequired, CheckpointData::new())
            .unwrap();
        let outcome = run_once(&ctx, &env, &actions, &scheduler, &host).await;
        assert!(matches!(outcome, RunOutcome::Completed(_)), "{:?}", outcome);
        assert_eq!(scheduler.unregistered.load(Ordering::SeqCst), 1);
        assert!(!ctx.checkpoint_path.exists());
    }

    #[tokio::test]
    async fn fresh_windows_host_walks_the_ladder_across_reboots() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = test_context(tmp.path());
        let env = Arc::new(FakeEnvironment::new(HostState::fresh()));
        let actions = FakeActions::new(env.clone());
        let scheduler = FakeScheduler::default();
        let host = FakeHost::new();

        // First boot: virtualization layer, then restart.
        let outcome = run_once(&ctx, &env, &actions, &scheduler, &host).await;
        assert!(matches!(outcome, RunOutcome::RebootScheduled { restarting: true }));
        assert_eq!(host.countdowns.load(Ordering::SeqCst), 1);
        assert_eq!(host.restarts.load(Ordering::SeqCst), 1);

        let cp = CheckpointStore::for_context(&ctx).load().unwrap();
        assert_eq!(cp.phase, Phase::RebootRequired);
        assert_eq!(
            cp.data.get("after_phase").and_then(|v| v.as_str()),
            Some("WSL2_INSTALL")
        );
        let spec = scheduler.last_spec.lock().unwrap().clone().unwrap();
        assert!(spec.args.iter().any(|a| a == "--skip-reboot"));

        // Continuation after the restart runs with --skip-reboot.
        ctx.options.skip_reboot = true;
        let outcome = run_once(&ctx, &env, &actions, &scheduler, &host).await;
        assert!(matches!(outcome, RunOutcome::RebootScheduled { restarting: false }));
        assert_eq!(host.restarts.load(Ordering::SeqCst), 1);

        let outcome = run_once(&ctx, &env, &actions, &scheduler, &host).await;
        assert!(matches!(outcome, RunOutcome::Completed(_)), "{:?}", outcome);
        assert_eq!(
            actions.executed(),
            vec![
                Phase::Wsl2Install,
                Phase::DockerInstall,
                Phase::DockerWait,
                Phase::KustoDeploy
            ]
        );
        assert_eq!(scheduler.registered.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.unregistered.load(Ordering::SeqCst), 1);
        assert!(!ctx.checkpoint_path.exists());
    }

    #[tokio::test]
    async fn linux_host_completes_in_one_run() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = test_context(tmp.path());
        ctx.os = OperatingSystem::Linux;
        let env = Arc::new(FakeEnvironment::new(HostState::fresh()));
        let actions = FakeActions::new(env.clone());
        let scheduler = FakeScheduler::default();
        let host = FakeHost::new();

        let outcome = run_once(&ctx, &env, &actions, &scheduler, &host).await;
        assert!(matches!(outcome, RunOutcome::Completed(_)), "{:?}", outcome);
        assert_eq!(
            actions.executed(),
            vec![Phase::DockerInstall, Phase::DockerWait, Phase::KustoDeploy]
        );
        assert_eq!(host.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn scheduling_failure_exits_1_without_restart() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_context(tmp.path());
        let env = Arc::new(FakeEnvironment::new(HostState::fresh()));
        let actions = FakeActions::new(env.clone());
        let scheduler = FakeScheduler {
            fail_register: true,
            ..Default::default()
        };
        let host = FakeHost::new();

        let outcome = run_once(&ctx, &env, &actions, &scheduler, &host).await;
        assert!(
            matches!(outcome, RunOutcome::Failed(DeployError::Scheduling(_))),
            "{:?}",
            outcome
        );
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(host.countdowns.load(Ordering::SeqCst), 0);
        assert_eq!(host.restarts.load(Ordering::SeqCst), 0);
        let cp = CheckpointStore::for_context(&ctx).load().unwrap();
        assert_eq!(cp.phase, Phase::RebootRequired);
    }

    #[tokio::test]
    async fn daemon_timeout_is_fatal_and_keeps_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_context(tmp.path());
        let env = Arc::new(FakeEnvironment::new(HostState::fresh()));
        env.update(|s| {
            s.virtualization = Ok(VirtualizationStatus::Ready);
            s.runtime = Ok(true);
        });
        let mut actions = FakeActions::new(env.clone());
        actions.timeout_on = Some(Phase::DockerWait);
        let scheduler = FakeScheduler::default();
        let host = FakeHost::new();

        let outcome = run_once(&ctx, &env, &actions, &scheduler, &host).await;
        assert!(matches!(
            outcome,
            RunOutcome::Failed(DeployError::ReadinessTimeout { .. })
        ));
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(scheduler.unregistered.load(Ordering::SeqCst), 0);
        let cp = CheckpointStore::for_context(&ctx).load().unwrap();
        assert_eq!(cp.phase, Phase::DockerWait);
    }

    #[tokio::test]
    async fn install_failure_keeps_checkpoint_for_resume() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_context(tmp.path());
        let env = Arc::new(FakeEnvironment::new(HostState::fresh()));
        env.update(|s| s.virtualization = Ok(VirtualizationStatus::Ready));
        let mut actions = FakeActions::new(env.clone());
        actions.fail_on = Some(Phase::DockerInstall);
        let scheduler = FakeScheduler::default();
        let host = FakeHost::new();

        let outcome = run_once(&ctx, &env, &actions, &scheduler, &host).await;
        match outcome {
            RunOutcome::Failed(DeployError::Install { phase, .. }) => {
                assert_eq!(phase, Phase::DockerInstall)
            }
            other => panic!("expected Install failure, got {:?}", other),
        }
        assert!(ctx.checkpoint_path.exists());
    }

    #[tokio::test]
    async fn unexpected_error_cleans_up_task_and_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_context(tmp.path());
        let env = Arc::new(FakeEnvironment::new(HostState::complete()));
        env.update(|s| s.container = Ok(None));
        let mut actions = FakeActions::new(env.clone());
        actions.unexpected_on = Some(Phase::KustoDeploy);
        let scheduler = FakeScheduler::default();
        let host = FakeHost::new();

        let outcome = run_once(&ctx, &env, &actions, &scheduler, &host).await;
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(scheduler.unregistered.load(Ordering::SeqCst), 1);
        assert!(!ctx.checkpoint_path.exists());
    }

    #[tokio::test]
    async fn manual_mode_never_touches_the_scheduler() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = test_context(tmp.path());
        ctx.options.manual = true;
        let env = Arc::new(FakeEnvironment::new(HostState::fresh()));
        let actions = FakeActions::new(env.clone());
        let scheduler = FakeScheduler::default();
        let host = FakeHost::new();

        let outcome = run_once(&ctx, &env, &actions, &scheduler, &host).await;
        assert!(matches!(outcome, RunOutcome::ManualRebootRequired));
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(host.restarts.load(Ordering::SeqCst), 0);

        env.update(|s| *s = HostState::complete());
        let outcome = run_once(&ctx, &env, &actions, &scheduler, &host).await;
        assert!(matches!(outcome, RunOutcome::Completed(_)));
        assert_eq!(scheduler.registered.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.unregistered.load(Ordering::SeqCst), 0);
        let cp = CheckpointStore::for_context(&ctx).load().unwrap();
        assert_eq!(cp.phase, Phase::FinalVerification);
    }

    #[tokio::test]
    async fn cancelled_countdown_leaves_task_registered() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_context(tmp.path());
        let env = Arc::new(FakeEnvironment::new(HostState::fresh()));
        let actions = FakeActions::new(env.clone());
        let scheduler = FakeScheduler::default();
        let mut host = FakeHost::new();
        host.confirm_restart = false;

        let outcome = run_once(&ctx, &env, &actions, &scheduler, &host).await;
        assert!(matches!(outcome, RunOutcome::RebootCancelled));
        assert_eq!(outcome.exit_code(), 0);
        assert_eq!(scheduler.registered.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.unregistered.load(Ordering::SeqCst), 0);
        assert_eq!(host.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn phase_that_never_converges_hits_loop_guard() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_context(tmp.path());
        let env = Arc::new(FakeEnvironment::new(HostState::complete()));
        env.update(|s| s.container = Ok(Some(ContainerState::Stopped("exited".into()))));
        let mut actions = FakeActions::new(env.clone());
        actions.inert = Some(Phase::KustoStart);
        let scheduler = FakeScheduler::default();
        let host = FakeHost::new();

        let outcome = run_once(&ctx, &env, &actions, &scheduler, &host).await;
        match outcome {
            RunOutcome::Failed(DeployError::Install { phase, .. }) => {
                assert_eq!(phase, Phase::KustoStart)
            }
            other => panic!("expected loop guard, got {:?}", other),
        }
        assert_eq!(actions.executed().len(), MAX_PHASE_REPEATS as usize);
    }

    #[tokio::test]
    async fn precondition_failure_runs_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_context(tmp.path());
        let env = Arc::new(FakeEnvironment::new(HostState::fresh()));
        let actions = FakeActions::new(env.clone());
        let scheduler = FakeScheduler::default();
        let mut host = FakeHost::new();
        host.precondition_error = Some("not elevated".into());

        let outcome = run_once(&ctx, &env, &actions, &scheduler, &host).await;
        assert!(matches!(
            outcome,
            RunOutcome::Failed(DeployError::Precondition(_))
        ));
        assert!(actions.executed().is_empty());
        assert!(!ctx.checkpoint_path.exists());
    }

    #[tokio::test]
    async fn download_only_fetches_and_stops() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = test_context(tmp.path());
        ctx.options.download_only = true;
        let env = Arc::new(FakeEnvironment::new(HostState::fresh()));
        let actions = FakeActions::new(env.clone());
        let scheduler = FakeScheduler::default();
        let host = FakeHost::new();

        let outcome = run_once(&ctx, &env, &actions, &scheduler, &host).await;
        assert!(matches!(outcome, RunOutcome::DownloadOnly));
        assert_eq!(actions.downloads.load(Ordering::SeqCst), 1);
        assert!(actions.executed().is_empty());
    }

    #[tokio::test]
    async fn cleanup_only_removes_task_and_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_context(tmp.path());
        let env = Arc::new(FakeEnvironment::new(HostState::fresh()));
        let actions = FakeActions::new(env.clone());
        let scheduler = FakeScheduler::default();
        let host = FakeHost::new();

        CheckpointStore::for_context(&ctx)
            .save(Phase::RebootRequired, CheckpointData::new())
            .unwrap();
        let outcome = Orchestrator::new(&ctx, env.as_ref(), &actions, &scheduler, &host)
            .cleanup_only()
            .await;
        assert!(matches!(outcome, RunOutcome::CleanedUp));
        assert_eq!(scheduler.unregistered.load(Ordering::SeqCst), 1);
        assert!(!ctx.checkpoint_path.exists());
    }

    #[tokio::test]
    async fn failed_unregister_still_clears_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_context(tmp.path());
        let env = Arc::new(FakeEnvironment::new(HostState::fresh()));
        let actions = FakeActions::new(env.clone());
        let scheduler = FakeScheduler {
            fail_unregister: true,
            ..FakeScheduler::default()
        };
        let host = FakeHost::new();

        CheckpointStore::for_context(&ctx)
            .save(Phase::RebootRequired, CheckpointData::new())
            .unwrap();
        let outcome = Orchestrator::new(&ctx, env.as_ref(), &actions, &scheduler, &host)
            .cleanup_only()
            .await;
        assert!(
            matches!(outcome, RunOutcome::Failed(DeployError::Scheduling(_))),
            "{:?}",
            outcome
        );
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(scheduler.unregistered.load(Ordering::SeqCst), 1);
        assert!(!ctx.checkpoint_path.exists());
    }

    #[tokio::test]
    async fn manual_cleanup_only_clears_checkpoint() {
        let tmp = tempfile::tempdir().unwrap();
        let mut ctx = test_context(tmp.path());
        ctx.options.manual = true;
        let env = Arc::new(FakeEnvironment::new(HostState::fresh()));
        let actions = FakeActions::new(env.clone());
        let scheduler = FakeScheduler::default();
        let host = FakeHost::new();

        CheckpointStore::for_context(&ctx)
            .save(Phase::RebootRequired, CheckpointData::new())
            .unwrap();
        let outcome = Orchestrator::new(&ctx, env.as_ref(), &actions, &scheduler, &host)
            .cleanup_only()
            .await;
        assert!(matches!(outcome, RunOutcome::CleanedUp));
        assert_eq!(scheduler.unregistered.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.registered.load(Ordering::SeqCst), 0);
        assert!(!ctx.checkpoint_path.exists());
    }
}
