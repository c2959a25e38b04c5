use anyhow::Result;
use std::path::{Path, PathBuf};

const STATE_FOLDER_NAME: &str = "kusto-orchestrator";
const CHECKPOINT_FILE_NAME: &str = "deployment-checkpoint.json";
const CONFIG_FILE_NAME: &str = "orchestrator.toml";

/// Resolve the state folder (absolute path).
///
/// The folder must be identical for the operator's elevated shell and for the boot-time
/// continuation (which runs as SYSTEM/root), and it must survive a reboot:
/// - Windows: `%SystemRoot%\Temp\kusto-orchestrator` (not the per-user `%TEMP%`)
/// - elsewhere: `/var/tmp/kusto-orchestrator` (`/tmp` may be a tmpfs cleared at boot)
pub fn resolve_state_folder() -> PathBuf {
    if cfg!(windows) {
        let system_root = std::env::var_os("SystemRoot")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(r"C:\Windows"));
        system_root.join("Temp").join(STATE_FOLDER_NAME)
    } else {
        PathBuf::from("/var/tmp").join(STATE_FOLDER_NAME)
    }
}

/// Fixed checkpoint location inside the state folder.
pub fn checkpoint_path(state_dir: &Path) -> PathBuf {
    state_dir.join(CHECKPOINT_FILE_NAME)
}

/// Config file picked up when `--config` is not given.
pub fn default_config_path(state_dir: &Path) -> PathBuf {
    state_dir.join(CONFIG_FILE_NAME)
}

/// Resolve log folder (absolute path), creating it if needed.
pub fn resolve_log_folder(state_dir: &Path) -> Result<PathBuf> {
    let log_dir = state_dir.join("logs");
    std::fs::create_dir_all(&log_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create log folder {:?}: {}", log_dir, e))?;
    Ok(log_dir)
}

/// Folder the runtime installer is downloaded into.
pub fn download_folder(state_dir: &Path) -> PathBuf {
    state_dir.join("downloads")
}

/// Absolute path of the running orchestrator binary.
pub fn resolve_executable() -> Result<PathBuf> {
    let exe = std::env::current_exe()
        .map_err(|e| anyhow::anyhow!("Unable to determine orchestrator executable path: {}", e))?;
    // Prefer the canonical path so the continuation does not depend on the caller's CWD.
    let canonical = exe.canonicalize().unwrap_or(exe);
    Ok(strip_verbatim_prefix(&canonical))
}

/// Drop the `\\?\` prefix `canonicalize` adds on Windows.
///
/// Task Scheduler and `cmd.exe` do not accept verbatim paths in a command line. Paths that only
/// exist in verbatim form (no drive letter, not UNC) are returned unchanged.
pub fn strip_verbatim_prefix(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    if let Some(rest) = text.strip_prefix(r"\\?\UNC\") {
        return PathBuf::from(format!(r"\\{}", rest));
    }
    if let Some(rest) = text.strip_prefix(r"\\?\") {
        let bytes = rest.as_bytes();
        if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
            return PathBuf::from(rest);
        }
    }
    path.to_path_buf()
}

/// Default host directory mounted into the service container.
pub fn default_data_path() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\KustoData")
    } else {
        PathBuf::from("/var/lib/kusto-emulator")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_and_config_live_in_state_folder() {
        let state = PathBuf::from("state");
        assert_eq!(
            checkpoint_path(&state),
            state.join("deployment-checkpoint.json")
        );
        assert_eq!(default_config_path(&state), state.join("orchestrator.toml"));
        assert_eq!(download_folder(&state), state.join("downloads"));
    }

    #[test]
    fn state_folder_survives_reboot() {
        let state = resolve_state_folder();
        assert!(state.ends_with(STATE_FOLDER_NAME));
        #[cfg(not(windows))]
        assert!(state.starts_with("/var/tmp"));
    }

    #[test]
    fn resolve_log_folder_creates_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let logs = resolve_log_folder(tmp.path()).unwrap();
        assert!(logs.is_dir());
    }

    #[test]
    fn verbatim_prefix_is_stripped_from_drive_and_unc_paths() {
        assert_eq!(
            strip_verbatim_prefix(Path::new(r"\\?\C:\Program Files\kusto-orchestrator.exe")),
            PathBuf::from(r"C:\Program Files\kusto-orchestrator.exe")
        );
        assert_eq!(
            strip_verbatim_prefix(Path::new(r"\\?\UNC\fileserver\tools\orch.exe")),
            PathBuf::from(r"\\fileserver\tools\orch.exe")
        );
        assert_eq!(
            strip_verbatim_prefix(Path::new(r"\\?\Volume{1234}\orch.exe")),
            PathBuf::from(r"\\?\Volume{1234}\orch.exe")
        );
        assert_eq!(
            strip_verbatim_prefix(Path::new("/opt/kusto/orch")),
            PathBuf::from("/opt/kusto/orch")
        );
    }

    #[test]
    fn resolved_executable_has_no_verbatim_prefix() {
        let exe = resolve_executable().unwrap();
        assert!(exe.is_absolute());
        assert!(!exe.to_string_lossy().starts_with(r"\\?\"));
    }
}
