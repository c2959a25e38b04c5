// Host-level controls: preconditions, the reboot countdown, and the restart itself.

use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::future::Future;
use std::io::Write;
use tokio::time::{sleep, Duration};

use crate::config::DeployContext;
use crate::error::{DeployError, DeployResult};
use crate::installation::run_cmd;
use crate::utils::os_detection::{
    has_systemd, is_supported_windows_build, parse_windows_build, OperatingSystem,
    MIN_WINDOWS_BUILD,
};

const HOST_CMD_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait HostControl: Send + Sync {
    /// Elevated and on a supported host; otherwise `Precondition`.
    async fn check_preconditions(&self, ctx: &DeployContext) -> DeployResult<()>;

    /// Count down before a restart. `false` when the operator cancelled.
    async fn countdown(&self, seconds: u64) -> bool;

    async fn restart(&self, os: OperatingSystem) -> Result<()>;
}

/// Tick once per second until `seconds` elapse or `cancel` resolves.
///
/// Returns `true` when the countdown ran to completion.
pub async fn run_countdown<C>(seconds: u64, cancel: C) -> bool
where
    C: Future,
{
    tokio::pin!(cancel);
    for remaining in (1..=seconds).rev() {
        print!("\rRestarting in {:>2}s (press Ctrl+C to cancel) ", remaining);
        let _ = std::io::stdout().flush();
        tokio::select! {
            _ = &mut cancel => {
                println!();
                return false;
            }
            _ = sleep(Duration::from_secs(1)) => {}
        }
    }
    println!();
    true
}

pub struct LiveHost;

impl LiveHost {
    async fn is_elevated(os: OperatingSystem) -> bool {
        match os {
            // `net session` needs administrator rights and has no side effects.
            OperatingSystem::Windows => run_cmd("net", &["session"], HOST_CMD_TIMEOUT, "net_session")
                .await
                .map(|o| o.succeeded())
                .unwrap_or(false),
            _ => is_running_as_root(),
        }
    }

    async fn windows_build() -> Option<u32> {
        let out = run_cmd("cmd", &["/c", "ver"], HOST_CMD_TIMEOUT, "windows_ver")
            .await
            .ok()?;
        parse_windows_build(&out.stdout)
    }
}

#[cfg(unix)]
fn is_running_as_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail.
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_running_as_root() -> bool {
    false
}

#[async_trait]
impl HostControl for LiveHost {
    async fn check_preconditions(&self, ctx: &DeployContext) -> DeployResult<()> {
        debug!("[PHASE: initialization] [STEP: preconditions] check_preconditions entered");

        if !Self::is_elevated(ctx.os).await {
            return Err(DeployError::Precondition(match ctx.os {
                OperatingSystem::Windows => "this tool must run from an elevated (Run as Administrator) shell".to_string(),
                _ => "this tool must run as root".to_string(),
            }));
        }

        match ctx.os {
            OperatingSystem::Windows => {
                let build = Self::windows_build().await.ok_or_else(|| {
                    DeployError::Precondition("unable to determine the Windows build number".to_string())
                })?;
                if !is_supported_windows_build(build) {
                    return Err(DeployError::Precondition(format!(
                        "Windows build {} is too old for WSL2 (need {} or newer)",
                        build, MIN_WINDOWS_BUILD
                    )));
                }
                info!(
                    "[PHASE: initialization] [STEP: preconditions] Windows build {} supported",
                    build
                );
            }
            OperatingSystem::Linux => {
                if !has_systemd() {
                    return Err(DeployError::Precondition(
                        "systemd is required for the boot-time continuation".to_string(),
                    ));
                }
            }
            OperatingSystem::Unknown => {
                return Err(DeployError::Precondition(
                    "unsupported operating system (Windows or Linux required)".to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn countdown(&self, seconds: u64) -> bool {
        run_countdown(seconds, async {
            // A missing signal handler must not look like a cancellation.
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(
                    "[PHASE: reboot_required] [STEP: countdown] Ctrl+C handler unavailable: {}",
                    e
                );
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    async fn restart(&self, os: OperatingSystem) -> Result<()> {
        info!("[PHASE: reboot_required] [STEP: restart] Restarting the host now");
        let out = match os {
            OperatingSystem::Windows => {
                run_cmd(
                    "shutdown.exe",
                    &["/r", "/t", "0", "/c", "Kusto emulator deployment continues after restart"],
                    HOST_CMD_TIMEOUT,
                    "shutdown_restart",
                )
                .await?
            }
            _ => run_cmd("systemctl", &["reboot"], HOST_CMD_TIMEOUT, "systemctl_reboot").await?,
        };
        if !out.succeeded() {
            anyhow::bail!(
                "restart command failed (exit_code={:?}): {}",
                out.exit_code,
                out.combined()
            );
        }
        Ok(())
    }
}
