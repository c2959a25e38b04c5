// Command-line surface.

use clap::Parser;
use std::path::PathBuf;

use crate::config::DeployConfig;
use crate::models::options::RunOptions;
use crate::utils::path_resolver;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "kusto-orchestrator",
    version,
    about = "Resumable deployment of the Kusto emulator (WSL2 -> Docker -> container)"
)]
pub struct Cli {
    /// Do not install or update WSL2
    #[arg(long)]
    pub skip_virtualization_install: bool,

    /// Never prompt for or perform a restart
    #[arg(long)]
    pub skip_reboot: bool,

    /// Only download the container runtime installer, then exit
    #[arg(long)]
    pub download_only: bool,

    /// Do not use a boot-time continuation task; keep the checkpoint for inspection
    #[arg(long)]
    pub manual: bool,

    /// Host port the service is published on
    #[arg(long, value_name = "PORT", value_parser = clap::value_parser!(u16).range(1..))]
    pub listen_port: Option<u16>,

    /// Host directory mounted as the service's persistent volume
    #[arg(long, value_name = "PATH")]
    pub data_path: Option<PathBuf>,

    /// Debug-level console output
    #[arg(long, short)]
    pub verbose: bool,

    /// Remove the continuation task and checkpoint, then exit
    #[arg(long)]
    pub cleanup_continuation_task: bool,

    /// TOML configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

impl Cli {
    /// Flags win over the config file, which wins over built-in defaults.
    pub fn resolve(&self, config: &DeployConfig) -> RunOptions {
        let data_path = self
            .data_path
            .clone()
            .or_else(|| config.data_path.clone())
            .unwrap_or_else(path_resolver::default_data_path);
        let data_path = if data_path.is_relative() {
            std::env::current_dir()
                .map(|cwd| cwd.join(&data_path))
                .unwrap_or(data_path)
        } else {
            data_path
        };

        RunOptions {
            skip_virtualization_install: self.skip_virtualization_install,
            skip_reboot: self.skip_reboot,
            download_only: self.download_only,
            manual: self.manual,
            listen_port: self.listen_port.unwrap_or(config.listen_port),
            data_path,
            verbose: self.verbose,
            config: self.config.clone(),
        }
    }
}
