// Kusto emulator deployment orchestrator
// Library entry point

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod detector;
pub mod error;
pub mod host;
pub mod installation;
pub mod models;
pub mod orchestrator;
pub mod phases;
pub mod utils;

use log::{error, info, warn};
use std::path::Path;

use cli::Cli;
use config::DeployContext;
use detector::LiveEnvironment;
use host::LiveHost;
use installation::scheduler::platform_scheduler;
use orchestrator::{Orchestrator, RunOutcome};
use phases::LiveActions;
use utils::os_detection::detect_os;
use utils::path_resolver;

/// Initialize logging with three sinks: console, JSON lines (.log) and human-readable (.txt).
///
/// Files always capture debug output; the console shows debug only with `--verbose`.
pub fn init_logging(log_dir: &Path, verbose: bool, run_id: &str) -> anyhow::Result<()> {
    std::fs::create_dir_all(log_dir)?;

    let timestamp = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");
    let json_log_file = log_dir.join(format!("orchestrator-{}.log", timestamp));
    let txt_log_file = log_dir.join(format!("orchestrator-{}.txt", timestamp));

    let console_level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    let json_run_id = run_id.to_string();

    fern::Dispatch::new()
        .level(log::LevelFilter::Debug)
        // Chatty transport crates stay at info even in verbose mode.
        .level_for("hyper", log::LevelFilter::Info)
        .level_for("hyper_util", log::LevelFilter::Info)
        .level_for("reqwest", log::LevelFilter::Info)
        .chain(
            fern::Dispatch::new()
                .level(console_level)
                .format(move |out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%H:%M:%S");
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}", line));
                })
                .chain(std::io::stdout()),
        )
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_utc = chrono::Utc::now().to_rfc3339();
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let json_line = utils::logging::format_json_log(
                        &timestamp_utc,
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                        Some(&json_run_id),
                    );
                    out.finish(format_args!("{}\n", json_line));
                })
                .chain(fern::log_file(json_log_file)?),
        )
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}\n", txt_line));
                })
                .chain(fern::log_file(txt_log_file)?),
        )
        .apply()?;

    info!(
        "[PHASE: initialization] Logging initialized, log directory: {:?}",
        log_dir
    );
    Ok(())
}

/// Run one invocation and return the process exit code.
pub async fn run(cli: Cli) -> i32 {
    let state_dir = path_resolver::resolve_state_folder();
    let run_id = uuid::Uuid::new_v4().to_string();

    match path_resolver::resolve_log_folder(&state_dir) {
        Ok(log_dir) => {
            if let Err(e) = init_logging(&log_dir, cli.verbose, &run_id) {
                eprintln!("Failed to initialize logging: {}", e);
            }
        }
        Err(e) => eprintln!("Failed to initialize logging: {}", e),
    }

    info!(
        "[PHASE: initialization] Orchestrator {} starting at {} (run_id={})",
        env!("CARGO_PKG_VERSION"),
        chrono::Utc::now(),
        run_id
    );

    let config = match config::load_config(cli.config.as_deref(), &state_dir) {
        Ok(c) => c,
        Err(e) => {
            error!("[PHASE: initialization] [STEP: config] {}", e);
            error!("[PHASE: initialization] [STEP: config] {}", e.remediation());
            return 1;
        }
    };

    let executable = match path_resolver::resolve_executable() {
        Ok(p) => p,
        Err(e) => {
            error!("[PHASE: initialization] [STEP: executable] {:#}", e);
            return 1;
        }
    };

    let options = cli.resolve(&config);
    let mut ctx = DeployContext::new(options, config, state_dir, executable, detect_os());
    ctx.run_id = run_id;
    info!(
        "[PHASE: initialization] [STEP: context] os={:?}, state_dir={:?}, data_path={:?}, listen_port={}",
        ctx.os, ctx.state_dir, ctx.options.data_path, ctx.options.listen_port
    );

    let env = LiveEnvironment::new(ctx.os);
    let scheduler = platform_scheduler(ctx.os, &ctx.state_dir);
    let orchestrator = Orchestrator::new(&ctx, &env, &LiveActions, scheduler.as_ref(), &LiveHost);

    let outcome = if cli.cleanup_continuation_task {
        orchestrator.cleanup_only().await
    } else {
        orchestrator.run().await
    };
    report_outcome(&ctx, &outcome);
    outcome.exit_code()
}

fn report_outcome(ctx: &DeployContext, outcome: &RunOutcome) {
    match outcome {
        RunOutcome::Completed(report) if report.is_clean() => info!(
            "[PHASE: complete] Kusto emulator is ready at {}",
            ctx.service_url()
        ),
        RunOutcome::Completed(report) => warn!(
            "[PHASE: complete] Kusto emulator deployed at {} with {} verification warning(s)",
            ctx.service_url(),
            report.warnings.len()
        ),
        RunOutcome::DownloadOnly => info!(
            "[PHASE: complete] Installer saved to {:?}",
            ctx.installer_path()
        ),
        RunOutcome::RebootScheduled { restarting: true } => {
            info!("[PHASE: reboot_required] Restarting; deployment continues automatically after boot")
        }
        RunOutcome::RebootScheduled { restarting: false } | RunOutcome::RebootCancelled => info!(
            "[PHASE: reboot_required] Restart the machine to continue; the continuation task '{}' resumes the deployment",
            ctx.config.continuation_task_name
        ),
        RunOutcome::ManualRebootRequired => info!(
            "[PHASE: reboot_required] Restart the machine, then run the same command again"
        ),
        RunOutcome::CleanedUp => {}
        RunOutcome::Failed(e) => error!("[PHASE: failure] Deployment stopped: {}", e),
    }
}
