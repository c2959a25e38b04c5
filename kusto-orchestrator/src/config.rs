// Deployment configuration and the immutable run context.
//
// Defaults cover a standard Windows (WSL2 + Docker Desktop) or Linux (Docker Engine) host.
// An optional TOML file overrides them; CLI flags override the file. The resolved values are
// frozen into a `DeployContext` that every component receives explicitly.

use log::{debug, info};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DeployError, DeployResult};
use crate::installation::bypass::{default_overlay, SettingsOverlay};
use crate::models::options::RunOptions;
use crate::utils::os_detection::{detect_os, OperatingSystem};
use crate::utils::path_resolver;

pub const DEFAULT_CONTAINER_NAME: &str = "kusto-emulator";
pub const DEFAULT_IMAGE: &str = "mcr.microsoft.com/azuredataexplorer/kustainer-linux:latest";
pub const DEFAULT_CONTINUATION_TASK_NAME: &str = "KustoOrchestratorContinuation";
pub const DEFAULT_LISTEN_PORT: u16 = 8080;
/// Upper bound for the cancellable reboot countdown.
pub const MAX_REBOOT_COUNTDOWN_SECONDS: u64 = 60;
const DAEMON_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Where the container runtime installer comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InstallerSource {
    pub url: String,
    pub file_name: String,
    /// Anything smaller is a truncated/failed download, whatever the transfer reported.
    pub minimum_size_bytes: u64,
    /// Optional lower-case hex SHA-256 of the installer.
    #[serde(default)]
    pub sha256: Option<String>,
}

impl InstallerSource {
    pub fn default_for(os: OperatingSystem) -> Self {
        match os {
            OperatingSystem::Windows => InstallerSource {
                url: "https://desktop.docker.com/win/main/amd64/Docker%20Desktop%20Installer.exe"
                    .to_string(),
                file_name: "DockerDesktopInstaller.exe".to_string(),
                minimum_size_bytes: 100 * 1024 * 1024,
                sha256: None,
            },
            _ => InstallerSource {
                url: "https://get.docker.com".to_string(),
                file_name: "install-docker.sh".to_string(),
                minimum_size_bytes: 4 * 1024,
                sha256: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeployConfig {
    pub container_name: String,
    pub image: String,
    /// Host port; `--listen-port` overrides.
    pub listen_port: u16,
    /// Host data directory; `--data-path` overrides.
    pub data_path: Option<PathBuf>,
    pub runtime_installer: InstallerSource,
    pub continuation_task_name: String,
    pub daemon_wait_minutes: u64,
    pub health_wait_seconds: u64,
    pub reboot_countdown_seconds: u64,
    /// Materialize a small sample table during final verification.
    pub sample_data: bool,
    /// First-run settings the runtime needs to start unattended.
    pub settings_overlay: Option<SettingsOverlay>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        let os = detect_os();
        DeployConfig {
            container_name: DEFAULT_CONTAINER_NAME.to_string(),
            image: DEFAULT_IMAGE.to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            data_path: None,
            runtime_installer: InstallerSource::default_for(os),
            continuation_task_name: DEFAULT_CONTINUATION_TASK_NAME.to_string(),
            daemon_wait_minutes: 15,
            health_wait_seconds: 180,
            reboot_countdown_seconds: 10,
            sample_data: true,
            settings_overlay: default_overlay(os),
        }
    }
}

impl DeployConfig {
    /// Reject values that would only fail later, deep inside a phase.
    pub fn validate(&self, origin: &Path) -> DeployResult<()> {
        let fail = |reason: String| Err(DeployError::config_format(origin, reason));

        let name_re = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$")
            .map_err(|e| anyhow::anyhow!("Internal error: failed to compile name regex: {}", e))?;
        if !name_re.is_match(&self.container_name) {
            return fail(format!(
                "container_name '{}' is not a valid container name",
                self.container_name
            ));
        }
        if self.image.trim().is_empty() {
            return fail("image must not be empty".to_string());
        }
        if self.listen_port == 0 {
            return fail("listen_port must be between 1 and 65535".to_string());
        }
        if self.continuation_task_name.trim().is_empty()
            || self
                .continuation_task_name
                .contains(['/', '\\', '"', '\''])
        {
            return fail(format!(
                "continuation_task_name '{}' must be a plain name",
                self.continuation_task_name
            ));
        }

        match url::Url::parse(&self.runtime_installer.url) {
            Ok(u) if u.scheme() == "http" || u.scheme() == "https" => {}
            Ok(u) => {
                return fail(format!(
                    "runtime_installer.url has unsupported scheme '{}'",
                    u.scheme()
                ))
            }
            Err(e) => return fail(format!("runtime_installer.url is not a URL: {}", e)),
        }
        if self.runtime_installer.file_name.trim().is_empty()
            || self.runtime_installer.file_name.contains(['/', '\\'])
        {
            return fail("runtime_installer.file_name must be a bare file name".to_string());
        }
        if let Some(digest) = &self.runtime_installer.sha256 {
            if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
                return fail("runtime_installer.sha256 must be 64 hex characters".to_string());
            }
        }

        for (name, value) in [
            ("daemon_wait_minutes", self.daemon_wait_minutes),
            ("health_wait_seconds", self.health_wait_seconds),
        ] {
            if value == 0 {
                return fail(format!("{} must be greater than zero", name));
            }
        }
        if !(1..=MAX_REBOOT_COUNTDOWN_SECONDS).contains(&self.reboot_countdown_seconds) {
            return fail(format!(
                "reboot_countdown_seconds must be between 1 and {}",
                MAX_REBOOT_COUNTDOWN_SECONDS
            ));
        }
        Ok(())
    }
}

/// Parse and validate a TOML config document.
pub fn parse_config(text: &str, origin: &Path) -> DeployResult<DeployConfig> {
    let config: DeployConfig = toml::from_str(text)
        .map_err(|e| DeployError::config_format(origin, e.message().to_string()))?;
    config.validate(origin)?;
    Ok(config)
}

/// Load the configuration.
///
/// An explicit `--config` path must exist. Without one, `<state dir>/orchestrator.toml` is used
/// when present, otherwise built-in defaults apply.
pub fn load_config(explicit: Option<&Path>, state_dir: &Path) -> DeployResult<DeployConfig> {
    let candidate = match explicit {
        Some(p) => p.to_path_buf(),
        None => {
            let p = path_resolver::default_config_path(state_dir);
            if !p.exists() {
                debug!(
                    "[PHASE: initialization] [STEP: config] No config file at {:?}; using defaults",
                    p
                );
                return Ok(DeployConfig::default());
            }
            p
        }
    };

    let text = std::fs::read_to_string(&candidate).map_err(|e| {
        DeployError::config_format(&candidate, format!("cannot read config file: {}", e))
    })?;
    let config = parse_config(&text, &candidate)?;
    info!(
        "[PHASE: initialization] [STEP: config] Loaded config from {:?}",
        candidate
    );
    Ok(config)
}

/// Immutable per-run context threaded through every component call.
#[derive(Debug, Clone)]
pub struct DeployContext {
    pub run_id: String,
    pub os: OperatingSystem,
    pub options: RunOptions,
    pub config: DeployConfig,
    pub state_dir: PathBuf,
    pub checkpoint_path: PathBuf,
    pub download_dir: PathBuf,
    pub executable: PathBuf,
}

impl DeployContext {
    pub fn new(
        options: RunOptions,
        config: DeployConfig,
        state_dir: PathBuf,
        executable: PathBuf,
        os: OperatingSystem,
    ) -> Self {
        DeployContext {
            run_id: uuid::Uuid::new_v4().to_string(),
            os,
            options,
            config,
            checkpoint_path: path_resolver::checkpoint_path(&state_dir),
            download_dir: path_resolver::download_folder(&state_dir),
            state_dir,
            executable,
        }
    }

    pub fn installer_path(&self) -> PathBuf {
        self.download_dir
            .join(&self.config.runtime_installer.file_name)
    }

    /// Base URL of the deployed service on the host.
    pub fn service_url(&self) -> String {
        format!("http://localhost:{}", self.options.listen_port)
    }

    pub fn daemon_wait(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.config.daemon_wait_minutes * 60),
            DAEMON_POLL_INTERVAL,
        )
    }

    pub fn health_wait(&self) -> Duration {
        Duration::from_secs(self.config.health_wait_seconds)
    }
}

#[cfg(test)]
pub(crate) fn test_context(state_dir: &Path) -> DeployContext {
    let options = RunOptions {
        skip_virtualization_install: false,
        skip_reboot: false,
        download_only: false,
        manual: false,
        listen_port: DEFAULT_LISTEN_PORT,
        data_path: state_dir.join("data"),
        verbose: false,
        config: None,
    };
    let mut ctx = DeployContext::new(
        options,
        DeployConfig::default(),
        state_dir.to_path_buf(),
        PathBuf::from("/opt/kusto-orchestrator/kusto-orchestrator"),
        OperatingSystem::Windows,
    );
    ctx.config.settings_overlay = None;
    ctx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        DeployConfig::default()
            .validate(Path::new("defaults"))
            .expect("defaults must validate");
    }

    #[test]
    fn parse_config_overrides_selected_fields() {
        let text = r#"
container_name = "kusto-dev"
listen_port = 9090
daemon_wait_minutes = 20
sample_data = false

[runtime_installer]
url = "https://mirror.internal/DockerDesktopInstaller.exe"
file_name = "DockerDesktopInstaller.exe"
minimum_size_bytes = 1048576
"#;
        let cfg = parse_config(text, Path::new("orchestrator.toml")).unwrap();
        assert_eq!(cfg.container_name, "kusto-dev");
        assert_eq!(cfg.listen_port, 9090);
        assert_eq!(cfg.daemon_wait_minutes, 20);
        assert!(!cfg.sample_data);
        assert_eq!(cfg.image, DEFAULT_IMAGE);
        assert_eq!(cfg.runtime_installer.minimum_size_bytes, 1048576);
    }

    #[test]
    fn parse_config_rejects_unknown_keys_with_named_error() {
        let err = parse_config("contaner_name = \"typo\"", Path::new("orchestrator.toml"))
            .unwrap_err();
        match err {
            DeployError::ConfigFormat { path, reason } => {
                assert_eq!(path, PathBuf::from("orchestrator.toml"));
                assert!(reason.contains("contaner_name"), "{}", reason);
            }
            other => panic!("expected ConfigFormat, got {:?}", other),
        }
    }

    #[test]
    fn parse_config_rejects_invalid_values() {
        let cases = [
            "container_name = \"-bad\"",
            "listen_port = 0",
            "health_wait_seconds = 0",
            "reboot_countdown_seconds = 0",
            "reboot_countdown_seconds = 3600",
            "continuation_task_name = \"a\\\\b\"",
            "[runtime_installer]\nurl = \"ftp://x\"\nfile_name = \"a.exe\"\nminimum_size_bytes = 1",
            "[runtime_installer]\nurl = \"https://x\"\nfile_name = \"a.exe\"\nminimum_size_bytes = 1\nsha256 = \"abc\"",
        ];
        for text in cases {
            let res = parse_config(text, Path::new("c.toml"));
            assert!(
                matches!(res, Err(DeployError::ConfigFormat { .. })),
                "expected ConfigFormat for {:?}",
                text
            );
        }
    }

    #[test]
    fn reboot_countdown_accepts_the_short_window() {
        for secs in [1, 10, MAX_REBOOT_COUNTDOWN_SECONDS] {
            let text = format!("reboot_countdown_seconds = {}", secs);
            let cfg = parse_config(&text, Path::new("c.toml")).unwrap();
            assert_eq!(cfg.reboot_countdown_seconds, secs);
        }
        let text = format!("reboot_countdown_seconds = {}", MAX_REBOOT_COUNTDOWN_SECONDS + 1);
        assert!(parse_config(&text, Path::new("c.toml")).is_err());
    }

    #[test]
    fn load_config_without_file_uses_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = load_config(None, tmp.path()).unwrap();
        assert_eq!(cfg.container_name, DEFAULT_CONTAINER_NAME);
    }

    #[test]
    fn load_config_explicit_missing_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope.toml");
        assert!(matches!(
            load_config(Some(&missing), tmp.path()),
            Err(DeployError::ConfigFormat { .. })
        ));
    }

    #[test]
    fn load_config_picks_up_state_dir_file() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            path_resolver::default_config_path(tmp.path()),
            "image = \"registry.local/kustainer:pinned\"\n",
        )
        .unwrap();
        let cfg = load_config(None, tmp.path()).unwrap();
        assert_eq!(cfg.image, "registry.local/kustainer:pinned");
    }

    #[test]
    fn context_derives_paths_from_state_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = test_context(tmp.path());
        assert_eq!(
            ctx.checkpoint_path,
            tmp.path().join("deployment-checkpoint.json")
        );
        assert!(ctx.installer_path().starts_with(tmp.path().join("downloads")));
        assert_eq!(ctx.service_url(), "http://localhost:8080");
        assert_eq!(ctx.daemon_wait().0, Duration::from_secs(15 * 60));
    }
}
