// Resolved run options (the "Parameters" block of the checkpoint).
//
// Everything needed to reproduce the current invocation is stored here with defaults already
// resolved, so a continuation started by the OS under a different account (SYSTEM/root) sees
// exactly the same data path and port the operator ran with.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const FLAG_SKIP_VIRTUALIZATION_INSTALL: &str = "--skip-virtualization-install";
pub const FLAG_SKIP_REBOOT: &str = "--skip-reboot";
pub const FLAG_DOWNLOAD_ONLY: &str = "--download-only";
pub const FLAG_MANUAL: &str = "--manual";
pub const FLAG_LISTEN_PORT: &str = "--listen-port";
pub const FLAG_DATA_PATH: &str = "--data-path";
pub const FLAG_VERBOSE: &str = "--verbose";
pub const FLAG_CONFIG: &str = "--config";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct RunOptions {
    pub skip_virtualization_install: bool,
    pub skip_reboot: bool,
    pub download_only: bool,
    pub manual: bool,
    pub listen_port: u16,
    pub data_path: PathBuf,
    pub verbose: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<PathBuf>,
}

impl RunOptions {
    /// Command-line arguments (without the program) that reproduce these options.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.skip_virtualization_install {
            args.push(FLAG_SKIP_VIRTUALIZATION_INSTALL.to_string());
        }
        if self.skip_reboot {
            args.push(FLAG_SKIP_REBOOT.to_string());
        }
        if self.download_only {
            args.push(FLAG_DOWNLOAD_ONLY.to_string());
        }
        if self.manual {
            args.push(FLAG_MANUAL.to_string());
        }
        args.push(FLAG_LISTEN_PORT.to_string());
        args.push(self.listen_port.to_string());
        args.push(FLAG_DATA_PATH.to_string());
        args.push(self.data_path.to_string_lossy().to_string());
        if self.verbose {
            args.push(FLAG_VERBOSE.to_string());
        }
        if let Some(config) = &self.config {
            args.push(FLAG_CONFIG.to_string());
            args.push(config.to_string_lossy().to_string());
        }
        args
    }

    /// Arguments for the boot-time continuation: the original flags plus `--skip-reboot`,
    /// so the resumed process never restarts the machine on its own.
    pub fn continuation_args(&self) -> Vec<String> {
        let mut resumed = self.clone();
        resumed.skip_reboot = true;
        resumed.download_only = false;
        resumed.to_args()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RunOptions {
        RunOptions {
            skip_virtualization_install: false,
            skip_reboot: false,
            download_only: false,
            manual: false,
            listen_port: 8080,
            data_path: PathBuf::from("/var/lib/kusto emulator"),
            verbose: true,
            config: None,
        }
    }

    #[test]
    fn to_args_keeps_paths_with_spaces_as_single_argument() {
        let args = sample().to_args();
        let idx = args.iter().position(|a| a == FLAG_DATA_PATH).unwrap();
        assert_eq!(args[idx + 1], "/var/lib/kusto emulator");
        assert!(args.contains(&FLAG_VERBOSE.to_string()));
        assert!(!args.contains(&FLAG_SKIP_REBOOT.to_string()));
    }

    #[test]
    fn continuation_args_always_suppress_reboot() {
        let args = sample().continuation_args();
        assert_eq!(
            args.iter().filter(|a| a.as_str() == FLAG_SKIP_REBOOT).count(),
            1
        );

        let mut already = sample();
        already.skip_reboot = true;
        let args = already.continuation_args();
        assert_eq!(
            args.iter().filter(|a| a.as_str() == FLAG_SKIP_REBOOT).count(),
            1
        );
    }

    #[test]
    fn parameters_reject_unknown_fields() {
        let json = r#"{"SkipVirtualizationInstall":false,"SkipReboot":false,"DownloadOnly":false,
            "Manual":false,"ListenPort":8080,"DataPath":"C:\\KustoData","Verbose":false,"Force":true}"#;
        let err = serde_json::from_str::<RunOptions>(json).unwrap_err();
        assert!(err.to_string().contains("Force"), "{}", err);
    }
}
