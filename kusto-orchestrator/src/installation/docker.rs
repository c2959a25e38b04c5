// Docker runtime and the named service container.
//
// The docker CLI may not be on the PATH of a process that was started before the runtime was
// installed, so every call goes through `resolve_docker_program`.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::path::Path;
use std::time::Duration;

use crate::config::DeployContext;
use crate::installation::{run_cmd, run_cmd_with_timeout};
use crate::utils::os_detection::OperatingSystem;

const DOCKER_CMD_TIMEOUT: Duration = Duration::from_secs(120);
const DOCKER_PULL_TIMEOUT: Duration = Duration::from_secs(30 * 60);
const DOCKER_QUERY_TIMEOUT: Duration = Duration::from_secs(15);
/// Web port the emulator listens on inside the container.
const CONTAINER_PORT: u16 = 8080;
/// Mount point of the persistent volume inside the container.
const CONTAINER_DATA_PATH: &str = "/kustodata";
const RESTART_POLICY: &str = "unless-stopped";

/// Where Docker Desktop puts its CLI on Windows.
pub const WINDOWS_DOCKER_CLI: &str = r"C:\Program Files\Docker\Docker\resources\bin\docker.exe";
/// Docker Desktop launcher; starting it brings up the daemon.
pub const WINDOWS_DOCKER_DESKTOP: &str = r"C:\Program Files\Docker\Docker\Docker Desktop.exe";

/// Docker version information.
#[derive(Debug, Clone, Default)]
pub struct DockerVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    /// Original version string for display/logging.
    pub raw: String,
}

/// Parse docker version output into a DockerVersion struct.
///
/// Expected format: "Docker version 24.0.5, build abcdef"
/// Also handles: "Docker version 20.10.21, build baeda1f82a" and similar variants.
pub fn parse_docker_version(output: &str) -> Option<DockerVersion> {
    let output = output.trim();

    let version_str = if let Some(pos) = output.to_lowercase().find("docker version ") {
        let start = pos + "docker version ".len();
        &output[start..]
    } else {
        output
    };

    // Extract version part (stop at comma, space, or end)
    let version_part = version_str
        .split(|c: char| c == ',' || c == ' ' || c == '-')
        .next()?;

    let parts: Vec<&str> = version_part.split('.').collect();
    let major: u32 = parts.first().and_then(|s| s.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.get(1).and_then(|s| s.parse().ok()).unwrap_or(0);
    let patch: u32 = parts.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);

    if major == 0 && minor == 0 && patch == 0 && !version_part.starts_with('0') {
        return None;
    }

    Some(DockerVersion {
        major,
        minor,
        patch,
        raw: output.to_string(),
    })
}

/// Locate the docker CLI: PATH first, then the well-known Docker Desktop location.
///
/// Falls back to plain `docker` so the failure surfaces as a normal spawn error.
pub fn resolve_docker_program(os: OperatingSystem) -> String {
    if let Ok(p) = which::which("docker") {
        return p.to_string_lossy().to_string();
    }
    if os == OperatingSystem::Windows && Path::new(WINDOWS_DOCKER_CLI).exists() {
        debug!(
            "[PHASE: detection] [STEP: docker] docker not on PATH; using {}",
            WINDOWS_DOCKER_CLI
        );
        return WINDOWS_DOCKER_CLI.to_string();
    }
    "docker".to_string()
}

/// Get Docker version information.
pub async fn get_docker_version(docker: &str) -> Result<DockerVersion> {
    debug!("[PHASE: detection] [STEP: docker] get_docker_version entered");

    let out = run_cmd(docker, &["--version"], DOCKER_QUERY_TIMEOUT, "docker_version").await?;
    if !out.succeeded() {
        anyhow::bail!(
            "docker --version returned non-zero exit code {:?}",
            out.exit_code
        );
    }

    let version = parse_docker_version(&out.stdout)
        .ok_or_else(|| anyhow::anyhow!("Failed to parse docker version from: {}", out.stdout))?;

    debug!(
        "[PHASE: detection] [STEP: docker] get_docker_version exit (major={}, minor={}, patch={})",
        version.major, version.minor, version.patch
    );
    Ok(version)
}

/// Check if the Docker daemon is running by executing `docker info`.
pub async fn is_docker_daemon_running(docker: &str) -> Result<bool> {
    debug!("[PHASE: detection] [STEP: docker] is_docker_daemon_running entered");

    let out = run_cmd(docker, &["info"], DOCKER_QUERY_TIMEOUT, "docker_info").await?;
    let running = out.succeeded();
    if !running && out.stderr.to_lowercase().contains("permission denied") {
        warn!("[PHASE: detection] [STEP: docker] Docker daemon check failed due to permission denied");
    }
    debug!(
        "[PHASE: detection] [STEP: docker] is_docker_daemon_running exit (running={}, exit_code={:?})",
        running, out.exit_code
    );
    Ok(running)
}

/// Observed state of the named container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    /// Exists but not running; carries docker's state word (exited, created, paused, ...).
    Stopped(String),
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }
}

/// Parse `docker ps -a --format {{.Names}}|{{.State}}` output for an exact name match.
///
/// The `name=` filter matches substrings, so the name is compared again here.
pub fn parse_container_ps_output(stdout: &str, name: &str) -> Option<ContainerState> {
    stdout.lines().find_map(|line| {
        let (n, state) = line.trim().split_once('|')?;
        if n.trim() != name {
            return None;
        }
        let state = state.trim().to_ascii_lowercase();
        Some(if state == "running" {
            ContainerState::Running
        } else {
            ContainerState::Stopped(state)
        })
    })
}

/// Look up the named container. `Ok(None)` means it does not exist.
pub async fn inspect_container(docker: &str, name: &str) -> Result<Option<ContainerState>> {
    let filter = format!("name={}", name);
    let out = run_cmd(
        docker,
        &["ps", "-a", "--filter", &filter, "--format", "{{.Names}}|{{.State}}"],
        DOCKER_QUERY_TIMEOUT,
        "docker_ps",
    )
    .await?;
    if !out.succeeded() {
        anyhow::bail!(
            "docker ps failed (exit_code={:?}): {}",
            out.exit_code,
            out.combined()
        );
    }
    let state = parse_container_ps_output(&out.stdout, name);
    debug!(
        "[PHASE: detection] [STEP: container] inspect_container exit (name={}, state={:?})",
        name, state
    );
    Ok(state)
}

/// Arguments for `docker run` creating the service container.
pub fn build_run_args(ctx: &DeployContext) -> Vec<String> {
    let cfg = &ctx.config;
    vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        cfg.container_name.clone(),
        "--restart".to_string(),
        RESTART_POLICY.to_string(),
        "-e".to_string(),
        "ACCEPT_EULA=Y".to_string(),
        "-p".to_string(),
        format!("{}:{}", ctx.options.listen_port, CONTAINER_PORT),
        "-v".to_string(),
        format!(
            "{}:{}",
            ctx.options.data_path.to_string_lossy(),
            CONTAINER_DATA_PATH
        ),
        cfg.image.clone(),
    ]
}

pub async fn docker_pull(docker: &str, image: &str) -> Result<()> {
    info!(
        "[PHASE: kusto_deploy] [STEP: pull] Pulling image {} (this can take several minutes)",
        image
    );
    let out = run_cmd(docker, &["pull", image], DOCKER_PULL_TIMEOUT, "docker_pull").await?;
    if out.succeeded() {
        return Ok(());
    }
    warn!(
        "[PHASE: kusto_deploy] [STEP: pull] docker pull failed: {}",
        out.stderr
    );
    anyhow::bail!("Docker image pull failed: {}", out.stderr.trim());
}

/// Force-remove a container. A missing container is not an error.
pub async fn remove_container(docker: &str, name: &str) -> Result<()> {
    let out = run_cmd(docker, &["rm", "-f", name], DOCKER_CMD_TIMEOUT, "docker_rm").await?;
    if out.succeeded() || out.stderr.to_lowercase().contains("no such container") {
        return Ok(());
    }
    anyhow::bail!(
        "docker rm -f {} failed (exit_code={:?}): {}",
        name,
        out.exit_code,
        out.combined()
    );
}

pub async fn run_container(docker: &str, ctx: &DeployContext) -> Result<()> {
    let data_path = &ctx.options.data_path;
    tokio::fs::create_dir_all(data_path)
        .await
        .with_context(|| format!("Failed to create data directory: {:?}", data_path))?;

    let args = build_run_args(ctx);
    let out = run_cmd_with_timeout(docker, &args, DOCKER_CMD_TIMEOUT, "docker_run").await?;
    if out.succeeded() {
        info!(
            "[PHASE: kusto_deploy] [STEP: run] Container created (name={}, id={})",
            ctx.config.container_name,
            out.stdout.trim()
        );
        return Ok(());
    }
    anyhow::bail!(
        "docker run failed (exit_code={:?}): {}",
        out.exit_code,
        out.combined()
    );
}

pub async fn start_container(docker: &str, name: &str) -> Result<()> {
    let out = run_cmd(docker, &["start", name], DOCKER_CMD_TIMEOUT, "docker_start").await?;
    if out.succeeded() {
        return Ok(());
    }
    anyhow::bail!(
        "docker start {} failed (exit_code={:?}): {}",
        name,
        out.exit_code,
        out.combined()
    );
}

/// Get logs from a specific container.
pub async fn get_container_logs(docker: &str, container_name: &str, lines: u32) -> Result<String> {
    debug!(
        "[PHASE: kusto_deploy] [STEP: logs] get_container_logs entered (container={}, lines={})",
        container_name, lines
    );

    let tail = lines.to_string();
    let out = run_cmd(
        docker,
        &["logs", "--tail", &tail, container_name],
        Duration::from_secs(30),
        "docker_logs",
    )
    .await?;

    // Docker logs go to both stdout and stderr depending on the log stream
    Ok(format!("{}{}", out.stdout, out.stderr))
}

/// Operator guidance when the container never reaches the running state.
pub fn container_troubleshooting(name: &str, state: Option<&ContainerState>, logs: &str) -> String {
    let state = match state {
        Some(ContainerState::Running) => "running".to_string(),
        Some(ContainerState::Stopped(s)) => s.clone(),
        None => "(not found)".to_string(),
    };
    format!(
        "Container Status: {}\n\n\
         Recent logs:\n{}\n\n\
         Troubleshooting:\n\
         1. Check container logs: docker logs {}\n\
         2. Check container status: docker ps -a --filter name={}\n\
         3. Verify Docker daemon is running: docker info\n\
         4. Make sure the host port is free and the data path is writable",
        state,
        if logs.trim().is_empty() { "(none)" } else { logs.trim() },
        name,
        name
    )
}

/// Operator guidance when the daemon never answers.
pub fn daemon_troubleshooting(os: OperatingSystem) -> &'static str {
    match os {
        OperatingSystem::Windows => {
            "Troubleshooting:\n\
             1. Start Docker Desktop manually and accept any prompts\n\
             2. Verify WSL2 is healthy: wsl --status\n\
             3. Check that virtualization is enabled in the firmware\n\
             4. Re-run the orchestrator once `docker info` succeeds"
        }
        _ => {
            "Troubleshooting:\n\
             1. Check the service: systemctl status docker\n\
             2. Inspect the journal: journalctl -u docker --no-pager -n 50\n\
             3. Re-run the orchestrator once `docker info` succeeds"
        }
    }
}

/// Kick the runtime so its daemon comes up. Best effort: failures are only logged.
pub async fn start_runtime(os: OperatingSystem) {
    match os {
        OperatingSystem::Windows => {
            if !Path::new(WINDOWS_DOCKER_DESKTOP).exists() {
                warn!(
                    "[PHASE: docker_wait] [STEP: start] Docker Desktop not found at {}",
                    WINDOWS_DOCKER_DESKTOP
                );
                return;
            }
            // The launcher stays alive with the UI; do not wait on it.
            match tokio::process::Command::new(WINDOWS_DOCKER_DESKTOP)
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .spawn()
            {
                Ok(_) => info!("[PHASE: docker_wait] [STEP: start] Docker Desktop launched"),
                Err(e) => warn!(
                    "[PHASE: docker_wait] [STEP: start] Failed to launch Docker Desktop: {}",
                    e
                ),
            }
        }
        _ => match run_cmd("systemctl", &["start", "docker"], DOCKER_CMD_TIMEOUT, "systemctl_start_docker").await {
            Ok(out) if out.succeeded() => {
                info!("[PHASE: docker_wait] [STEP: start] docker.service started")
            }
            Ok(out) => warn!(
                "[PHASE: docker_wait] [STEP: start] systemctl start docker returned exit_code={:?}: {}",
                out.exit_code,
                out.combined()
            ),
            Err(e) => warn!(
                "[PHASE: docker_wait] [STEP: start] systemctl start docker could not run: {:#}",
                e
            ),
        },
    }
}

/// Command used to run the downloaded runtime installer.
pub fn installer_command(os: OperatingSystem, installer: &Path) -> (String, Vec<String>) {
    match os {
        OperatingSystem::Windows => (
            installer.to_string_lossy().to_string(),
            vec![
                "install".to_string(),
                "--quiet".to_string(),
                "--accept-license".to_string(),
                "--backend=wsl-2".to_string(),
            ],
        ),
        _ => (
            "sh".to_string(),
            vec![installer.to_string_lossy().to_string()],
        ),
    }
}

/// Run the runtime installer unattended.
pub async fn install_runtime(os: OperatingSystem, installer: &Path, timeout_dur: Duration) -> Result<()> {
    let (program, args) = installer_command(os, installer);
    let out = run_cmd_with_timeout(&program, &args, timeout_dur, "runtime_installer").await?;
    if !out.succeeded() {
        anyhow::bail!(
            "Runtime installer failed (exit_code={:?}): {}",
            out.exit_code,
            out.combined()
        );
    }

    if os != OperatingSystem::Windows {
        let out = run_cmd(
            "systemctl",
            &["enable", "--now", "docker"],
            DOCKER_CMD_TIMEOUT,
            "systemctl_enable_docker",
        )
        .await?;
        if !out.succeeded() {
            anyhow::bail!(
                "systemctl enable --now docker failed (exit_code={:?}): {}",
                out.exit_code,
                out.combined()
            );
        }
    }
    Ok(())
}
