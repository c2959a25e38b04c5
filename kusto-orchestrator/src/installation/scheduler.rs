// Boot-time continuation task (Windows Task Scheduler / systemd)
//
// After a reboot the orchestrator is started again by the OS, as SYSTEM/root, with the original
// flags plus --skip-reboot. Registration is only reported successful once the task can be read
// back in a runnable state.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, info, warn};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::time::Duration;

use crate::config::DeployContext;
use crate::installation::readiness::{wait_until, WaitBounds};
use crate::installation::run_cmd;
use crate::models::options::FLAG_SKIP_REBOOT;
use crate::utils::os_detection::OperatingSystem;

const SCHEDULER_CMD_TIMEOUT: Duration = Duration::from_secs(30);
const VERIFY_BOUND: Duration = Duration::from_secs(10);
const VERIFY_INTERVAL: Duration = Duration::from_secs(1);
/// Execution time limit of the continuation task.
const CONTINUATION_TIME_LIMIT: Duration = Duration::from_secs(2 * 60 * 60);

/// Well-known SID of LocalSystem.
const SYSTEM_SID: &str = "S-1-5-18";

/// What the OS should run at the next boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContinuationSpec {
    pub task_name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub time_limit: Duration,
}

impl ContinuationSpec {
    pub fn from_context(ctx: &DeployContext) -> Self {
        ContinuationSpec {
            task_name: ctx.config.continuation_task_name.clone(),
            program: ctx.executable.clone(),
            args: ctx.options.continuation_args(),
            working_dir: ctx.state_dir.clone(),
            time_limit: CONTINUATION_TIME_LIMIT,
        }
    }

    /// A continuation without --skip-reboot could reboot the machine in a loop.
    pub fn validate(&self) -> Result<()> {
        if !self.args.iter().any(|a| a == FLAG_SKIP_REBOOT) {
            anyhow::bail!(
                "Continuation command line must contain {} (args=[{}])",
                FLAG_SKIP_REBOOT,
                self.args.join(" ")
            );
        }
        if self.task_name.trim().is_empty() {
            anyhow::bail!("Continuation task name must not be empty");
        }
        Ok(())
    }

    /// Arguments joined with Windows quoting rules.
    pub fn windows_arguments(&self) -> String {
        self.args
            .iter()
            .map(|a| quote_windows_arg(a))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// The full command line as an operator would type it.
    pub fn command_line(&self) -> String {
        let program = self.program.to_string_lossy();
        if cfg!(windows) {
            format!("{} {}", quote_windows_arg(&program), self.windows_arguments())
        } else {
            std::iter::once(quote_systemd_path(&program))
                .chain(self.args.iter().map(|a| quote_systemd_path(a)))
                .collect::<Vec<_>>()
                .join(" ")
        }
    }

    /// Shown when the task cannot be registered.
    pub fn manual_instructions(&self) -> String {
        format!(
            "Automatic continuation is unavailable.\n\
             1. Restart the machine now.\n\
             2. After it boots, open an elevated shell and run:\n   {}\n\
             3. Repeat after every restart the deployment asks for.",
            self.command_line()
        )
    }
}

#[async_trait]
pub trait ContinuationScheduler: Send + Sync {
    /// Replace any task of the same name and confirm the new one is runnable.
    async fn register(&self, spec: &ContinuationSpec) -> Result<()>;

    /// Remove the task; absent is success.
    async fn unregister(&self, task_name: &str) -> Result<()>;
}

/// Scheduler for the current host.
pub fn platform_scheduler(os: OperatingSystem, state_dir: &Path) -> Box<dyn ContinuationScheduler> {
    match os {
        OperatingSystem::Windows => Box::new(WindowsTaskScheduler::new(state_dir)),
        _ => Box::new(SystemdScheduler::new(PathBuf::from("/etc/systemd/system"))),
    }
}

/// Confirm registration by polling `check` for a short bound.
async fn verify_registered<F, Fut>(label: &str, check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let bounds = WaitBounds::new(VERIFY_BOUND, VERIFY_INTERVAL)?;
    if wait_until(label, bounds, check).await {
        return Ok(());
    }
    anyhow::bail!(
        "Task was created but could not be confirmed runnable within {}s",
        VERIFY_BOUND.as_secs()
    )
}

// ============================================================================
// Windows Task Scheduler
// ============================================================================

/// Quote one argument so `CommandLineToArgvW` yields it back unchanged.
pub fn quote_windows_arg(arg: &str) -> String {
    if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
        return arg.to_string();
    }
    let mut out = String::from("\"");
    let mut backslashes = 0usize;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                out.push_str(&"\\".repeat(backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            _ => {
                out.push_str(&"\\".repeat(backslashes));
                out.push(c);
                backslashes = 0;
            }
        }
    }
    out.push_str(&"\\".repeat(backslashes * 2));
    out.push('"');
    out
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// ISO 8601 duration as Task Scheduler expects it ("PT120M", "PT90S").
pub fn iso8601_duration(d: Duration) -> String {
    let secs = d.as_secs().max(1);
    if secs % 60 == 0 {
        format!("PT{}M", secs / 60)
    } else {
        format!("PT{}S", secs)
    }
}

/// Build the task definition: boot trigger, LocalSystem, highest privileges.
pub fn build_task_xml(spec: &ContinuationSpec) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-16"?>
<Task version="1.2" xmlns="http://schemas.microsoft.com/windows/2004/02/mit/task">
  <RegistrationInfo>
    <Description>Resumes the Kusto emulator deployment after a restart.</Description>
  </RegistrationInfo>
  <Triggers>
    <BootTrigger>
      <Enabled>true</Enabled>
      <Delay>PT1M</Delay>
    </BootTrigger>
  </Triggers>
  <Principals>
    <Principal id="Author">
      <UserId>{sid}</UserId>
      <RunLevel>HighestAvailable</RunLevel>
    </Principal>
  </Principals>
  <Settings>
    <MultipleInstancesPolicy>IgnoreNew</MultipleInstancesPolicy>
    <DisallowStartIfOnBatteries>false</DisallowStartIfOnBatteries>
    <StopIfGoingOnBatteries>false</StopIfGoingOnBatteries>
    <StartWhenAvailable>true</StartWhenAvailable>
    <ExecutionTimeLimit>{limit}</ExecutionTimeLimit>
    <Enabled>true</Enabled>
  </Settings>
  <Actions Context="Author">
    <Exec>
      <Command>{command}</Command>
      <Arguments>{arguments}</Arguments>
      <WorkingDirectory>{workdir}</WorkingDirectory>
    </Exec>
  </Actions>
</Task>
"#,
        sid = SYSTEM_SID,
        limit = iso8601_duration(spec.time_limit),
        command = xml_escape(&spec.program.to_string_lossy()),
        arguments = xml_escape(&spec.windows_arguments()),
        workdir = xml_escape(&spec.working_dir.to_string_lossy()),
    )
}

/// Task Scheduler rejects task XML that is not UTF-16 with a BOM when it declares UTF-16.
pub fn encode_utf16le_with_bom(text: &str) -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xFE];
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes
}

/// State read back from `schtasks /Query /TN <name> /XML`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredTask {
    pub enabled: bool,
    pub boot_trigger_enabled: bool,
}

impl RegisteredTask {
    pub fn is_runnable(&self) -> bool {
        self.enabled && self.boot_trigger_enabled
    }
}

/// `<Enabled>` inside the first `<section>` element; Task Scheduler treats a missing one as true.
fn section_enabled(xml: &str, section: &str) -> Option<bool> {
    let pattern = format!(r"(?s)<{0}>.*?</{0}>", regex::escape(section));
    let block = Regex::new(&pattern).ok()?.find(xml)?;
    let enabled = Regex::new(r"<Enabled>\s*(true|false)\s*</Enabled>").ok()?;
    Some(
        enabled
            .captures(block.as_str())
            .map(|c| &c[1] == "true")
            .unwrap_or(true),
    )
}

/// Parse the task definition exported by `schtasks /Query /XML`.
///
/// The XML element names are not localized, unlike the `/FO LIST` labels.
pub fn parse_task_xml(xml: &str) -> Option<RegisteredTask> {
    if !xml.contains("<Task") {
        return None;
    }
    Some(RegisteredTask {
        enabled: section_enabled(xml, "Settings").unwrap_or(true),
        boot_trigger_enabled: section_enabled(xml, "BootTrigger").unwrap_or(false),
    })
}

pub struct WindowsTaskScheduler {
    xml_dir: PathBuf,
}

impl WindowsTaskScheduler {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            xml_dir: state_dir.to_path_buf(),
        }
    }

    async fn query(task_name: &str) -> Result<Option<RegisteredTask>> {
        let out = run_cmd(
            "schtasks.exe",
            &["/Query", "/TN", task_name, "/XML"],
            SCHEDULER_CMD_TIMEOUT,
            "schtasks_query",
        )
        .await?;
        if !out.succeeded() {
            return Ok(None);
        }
        Ok(parse_task_xml(&out.stdout))
    }
}

#[async_trait]
impl ContinuationScheduler for WindowsTaskScheduler {
    async fn register(&self, spec: &ContinuationSpec) -> Result<()> {
        let started = Instant::now();
        spec.validate()?;
        info!(
            "[PHASE: reboot_required] [STEP: schedule] register entered (task={}, command={})",
            spec.task_name,
            spec.command_line()
        );

        if Self::query(&spec.task_name).await?.is_some() {
            self.unregister(&spec.task_name).await?;
        }

        tokio::fs::create_dir_all(&self.xml_dir)
            .await
            .with_context(|| format!("Failed to create {:?}", self.xml_dir))?;
        let xml_path = self.xml_dir.join("continuation-task.xml");
        tokio::fs::write(&xml_path, encode_utf16le_with_bom(&build_task_xml(spec)))
            .await
            .with_context(|| format!("Failed to write task definition {:?}", xml_path))?;

        let xml_arg = xml_path.to_string_lossy().to_string();
        let out = run_cmd(
            "schtasks.exe",
            &["/Create", "/TN", &spec.task_name, "/XML", &xml_arg, "/F"],
            SCHEDULER_CMD_TIMEOUT,
            "schtasks_create",
        )
        .await?;
        if !out.succeeded() {
            anyhow::bail!(
                "schtasks /Create failed (exit_code={:?}): {}",
                out.exit_code,
                out.combined()
            );
        }

        let name = spec.task_name.clone();
        verify_registered("continuation_task", || {
            let name = name.clone();
            async move {
                match Self::query(&name).await {
                    Ok(Some(task)) => task.is_runnable(),
                    _ => false,
                }
            }
        })
        .await?;

        info!(
            "[PHASE: reboot_required] [STEP: schedule] register exit ok (task={}, duration_ms={})",
            spec.task_name,
            started.elapsed().as_millis()
        );
        Ok(())
    }

    async fn unregister(&self, task_name: &str) -> Result<()> {
        if Self::query(task_name).await?.is_none() {
            debug!(
                "[PHASE: cleanup] [STEP: schedule] Task not registered (task={})",
                task_name
            );
            return Ok(());
        }
        let out = run_cmd(
            "schtasks.exe",
            &["/Delete", "/TN", task_name, "/F"],
            SCHEDULER_CMD_TIMEOUT,
            "schtasks_delete",
        )
        .await?;
        if !out.succeeded() {
            anyhow::bail!(
                "schtasks /Delete failed (exit_code={:?}): {}",
                out.exit_code,
                out.combined()
            );
        }
        info!(
            "[PHASE: cleanup] [STEP: schedule] Removed continuation task (task={})",
            task_name
        );
        Ok(())
    }
}

// ============================================================================
// systemd
// ============================================================================

/// Quote a path for systemd unit files if it contains spaces or special characters.
/// Returns the path unquoted if no spaces, or quoted with double-quotes if spaces present.
pub fn quote_systemd_path(path: &str) -> String {
    if path.is_empty() || path.contains([' ', '\t', '"']) {
        format!("\"{}\"", path.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        path.to_string()
    }
}

/// Unit file name for a task name.
pub fn unit_file_name(task_name: &str) -> String {
    format!("{}.service", task_name)
}

/// Build the oneshot unit that runs the continuation once per boot.
///
/// This is a pure function for testability on any OS.
pub fn build_continuation_unit_text(spec: &ContinuationSpec) -> String {
    let exec = std::iter::once(quote_systemd_path(&spec.program.to_string_lossy()))
        .chain(spec.args.iter().map(|a| quote_systemd_path(a)))
        .collect::<Vec<_>>()
        .join(" ");

    format!(
        r#"[Unit]
Description=Kusto emulator deployment continuation ({task_name})
Wants=network-online.target
After=network-online.target

[Service]
Type=oneshot
User=root
WorkingDirectory={workdir}
ExecStart={exec}
TimeoutStartSec={timeout}

[Install]
WantedBy=multi-user.target
"#,
        task_name = spec.task_name,
        workdir = quote_systemd_path(&spec.working_dir.to_string_lossy()),
        exec = exec,
        timeout = spec.time_limit.as_secs().max(1),
    )
}

pub struct SystemdScheduler {
    unit_dir: PathBuf,
}

impl SystemdScheduler {
    pub fn new(unit_dir: PathBuf) -> Self {
        Self { unit_dir }
    }

    fn unit_path(&self, task_name: &str) -> PathBuf {
        self.unit_dir.join(unit_file_name(task_name))
    }

    async fn systemctl(args: &[&str], operation: &str) -> Result<()> {
        let mut full: Vec<&str> = args.to_vec();
        full.push("--no-pager");
        let out = run_cmd("systemctl", &full, SCHEDULER_CMD_TIMEOUT, operation).await?;
        if !out.succeeded() {
            anyhow::bail!(
                "systemctl {} failed (exit_code={:?}): {}",
                args.join(" "),
                out.exit_code,
                out.combined()
            );
        }
        Ok(())
    }

    async fn is_enabled(unit: &str) -> bool {
        match run_cmd("systemctl", &["is-enabled", unit], SCHEDULER_CMD_TIMEOUT, "systemctl_is_enabled").await {
            Ok(out) => out.stdout.trim().eq_ignore_ascii_case("enabled"),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl ContinuationScheduler for SystemdScheduler {
    async fn register(&self, spec: &ContinuationSpec) -> Result<()> {
        let started = Instant::now();
        spec.validate()?;
        info!(
            "[PHASE: reboot_required] [STEP: schedule] register entered (unit={}, command={})",
            unit_file_name(&spec.task_name),
            spec.command_line()
        );

        if self.unit_path(&spec.task_name).exists() {
            self.unregister(&spec.task_name).await?;
        }

        let unit_path = self.unit_path(&spec.task_name);
        tokio::fs::write(&unit_path, build_continuation_unit_text(spec))
            .await
            .with_context(|| format!("Failed to write systemd unit file: {:?}", unit_path))?;
        info!(
            "[PHASE: reboot_required] [STEP: schedule] Wrote systemd unit file: {:?}",
            unit_path
        );

        let unit = unit_file_name(&spec.task_name);
        Self::systemctl(&["daemon-reload"], "systemctl_daemon_reload").await?;
        Self::systemctl(&["enable", &unit], "systemctl_enable").await?;

        verify_registered("continuation_unit", || {
            let unit = unit.clone();
            async move { Self::is_enabled(&unit).await }
        })
        .await?;

        info!(
            "[PHASE: reboot_required] [STEP: schedule] register exit ok (unit={}, duration_ms={})",
            unit,
            started.elapsed().as_millis()
        );
        Ok(())
    }

    async fn unregister(&self, task_name: &str) -> Result<()> {
        let unit_path = self.unit_path(task_name);
        if !unit_path.exists() {
            debug!(
                "[PHASE: cleanup] [STEP: schedule] Unit not present (path={:?})",
                unit_path
            );
            return Ok(());
        }
        let unit = unit_file_name(task_name);
        if let Err(e) = Self::systemctl(&["disable", &unit], "systemctl_disable").await {
            warn!(
                "[PHASE: cleanup] [STEP: schedule] disable failed, removing unit anyway: {:#}",
                e
            );
        }
        tokio::fs::remove_file(&unit_path)
            .await
            .with_context(|| format!("Failed to remove {:?}", unit_path))?;
        Self::systemctl(&["daemon-reload"], "systemctl_daemon_reload").await?;
        info!(
            "[PHASE: cleanup] [STEP: schedule] Removed continuation unit ({})",
            unit
        );
        Ok(())
    }
}
