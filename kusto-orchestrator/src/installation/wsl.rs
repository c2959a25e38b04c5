// WSL2 virtualization layer (Windows only)
//
// Checks are read-only; `enable_features` and `install` mutate the host and are only invoked by
// the WSL2_INSTALL phase.

use anyhow::Result;
use log::{debug, info, warn};
use tokio::time::Duration;

use crate::installation::{run_cmd, CommandOutput};

const WSL_QUERY_TIMEOUT: Duration = Duration::from_secs(30);
const DISM_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const WSL_INSTALL_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// dism.exe: "The operation completed successfully. Restart Windows to complete this operation."
pub const DISM_REBOOT_PENDING: i32 = 3010;

/// Optional Windows components WSL2 depends on.
pub const REQUIRED_FEATURES: [&str; 2] = [
    "Microsoft-Windows-Subsystem-Linux",
    "VirtualMachinePlatform",
];

/// Parsed `wsl --status` output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WslStatus {
    pub default_version: Option<u32>,
    /// Output asks for `wsl --update` or reports the kernel missing.
    pub needs_update: bool,
}

impl WslStatus {
    pub fn is_ready(&self) -> bool {
        !self.needs_update
    }
}

/// Parse `wsl --status` output (already decoded from UTF-16).
///
/// Expected lines: "Default Version: 2", and on stale installs
/// "The WSL 2 kernel file is not found. To update or restore the kernel please run 'wsl --update'."
pub fn parse_wsl_status(output: &str) -> WslStatus {
    let cleaned = output.replace('\0', "");
    let mut status = WslStatus::default();

    for line in cleaned.lines() {
        let line = line.trim();
        let lower = line.to_ascii_lowercase();
        if lower.starts_with("default version") {
            status.default_version = line
                .split(':')
                .nth(1)
                .and_then(|v| v.trim().parse().ok());
        }
        if lower.contains("wsl --update")
            || lower.contains("kernel file is not found")
            || lower.contains("requires an update")
        {
            status.needs_update = true;
        }
    }
    status
}

/// Whether a dism exit code means the feature is enabled (possibly pending a restart).
pub fn dism_succeeded(exit_code: Option<i32>) -> bool {
    matches!(exit_code, Some(0) | Some(DISM_REBOOT_PENDING))
}

/// Query the virtualization layer. `Ok(None)` means WSL is not installed at all.
pub async fn query_status() -> Result<Option<WslStatus>> {
    debug!("[PHASE: detection] [STEP: wsl] query_status entered");

    let out = run_cmd("wsl.exe", &["--status"], WSL_QUERY_TIMEOUT, "wsl_status").await?;
    if !out.succeeded() {
        debug!(
            "[PHASE: detection] [STEP: wsl] query_status exit (installed=false, exit_code={:?})",
            out.exit_code
        );
        return Ok(None);
    }

    let status = parse_wsl_status(&format!("{}\n{}", out.stdout, out.stderr));
    debug!(
        "[PHASE: detection] [STEP: wsl] query_status exit (default_version={:?}, needs_update={})",
        status.default_version, status.needs_update
    );
    Ok(Some(status))
}

/// Enable the optional Windows features. Returns whether dism asked for a restart.
pub async fn enable_features() -> Result<bool> {
    let mut reboot_pending = false;
    for feature in REQUIRED_FEATURES {
        let feature_arg = format!("/featurename:{}", feature);
        let out = run_cmd(
            "dism.exe",
            &["/online", "/enable-feature", &feature_arg, "/all", "/norestart"],
            DISM_TIMEOUT,
            "dism_enable_feature",
        )
        .await?;

        if !dism_succeeded(out.exit_code) {
            anyhow::bail!(
                "dism failed to enable {} (exit_code={:?}): {}",
                feature,
                out.exit_code,
                out.combined()
            );
        }
        if out.exit_code == Some(DISM_REBOOT_PENDING) {
            reboot_pending = true;
        }
        info!(
            "[PHASE: wsl2_install] [STEP: features] Feature enabled (feature={}, exit_code={:?})",
            feature, out.exit_code
        );
    }

    Ok(reboot_pending)
}

fn ensure_ok(out: &CommandOutput, what: &str) -> Result<()> {
    if out.succeeded() {
        return Ok(());
    }
    anyhow::bail!(
        "{} failed (exit_code={:?}): {}",
        what,
        out.exit_code,
        out.combined()
    )
}

/// Install the WSL platform without a distribution, update the kernel, and default to WSL2.
pub async fn install() -> Result<()> {
    let out = run_cmd(
        "wsl.exe",
        &["--install", "--no-distribution"],
        WSL_INSTALL_TIMEOUT,
        "wsl_install",
    )
    .await?;
    ensure_ok(&out, "wsl --install --no-distribution")?;

    // The kernel update needs network access; a failure here is retried on the next boot.
    match run_cmd("wsl.exe", &["--update"], WSL_INSTALL_TIMEOUT, "wsl_update").await {
        Ok(out) if out.succeeded() => {}
        Ok(out) => warn!(
            "[PHASE: wsl2_install] [STEP: install] wsl --update returned exit_code={:?}: {}",
            out.exit_code,
            out.combined()
        ),
        Err(e) => warn!(
            "[PHASE: wsl2_install] [STEP: install] wsl --update could not run: {:#}",
            e
        ),
    }

    let out = run_cmd(
        "wsl.exe",
        &["--set-default-version", "2"],
        WSL_QUERY_TIMEOUT,
        "wsl_set_default_version",
    )
    .await?;
    if !out.succeeded() {
        // Before the first reboot the platform is not active yet and this is expected to fail.
        warn!(
            "[PHASE: wsl2_install] [STEP: install] wsl --set-default-version 2 returned exit_code={:?}",
            out.exit_code
        );
    }
    Ok(())
}
