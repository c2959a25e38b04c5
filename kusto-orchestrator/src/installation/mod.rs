// Host subsystem collaborators.
//
// This module contains the per-subsystem command wrappers (WSL, Docker, Task Scheduler /
// systemd, settings overlays), the download manager, the readiness waiter, and the shared
// utility for running external commands with timeouts/retries.
//
// IMPORTANT:
// - Never log secrets (signed download URLs, tokens).
// - All I/O should be async.

pub mod bypass;
pub mod docker;
pub mod download;
pub mod readiness;
pub mod scheduler;
pub mod wsl;

use anyhow::{Context, Result};
use log::{debug, error, warn};
use std::process::Stdio;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::time::{timeout, Duration};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl CommandOutput {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// stdout followed by stderr, trimmed; handy for error messages.
    pub fn combined(&self) -> String {
        format!("{}\n{}", self.stdout.trim(), self.stderr.trim())
            .trim()
            .to_string()
    }
}

const SENSITIVE_ARG_MARKERS: [&str; 5] = ["password", "secret", "token", "apikey", "api_key"];

fn mask_arg_for_log(arg: &str) -> String {
    let lower = arg.to_ascii_lowercase();

    if lower.starts_with("http://") || lower.starts_with("https://") {
        return crate::utils::logging::mask_url_query(arg);
    }

    // `--password=value`: keep the key readable, mask the value.
    if let Some((key, value)) = arg.split_once('=') {
        let key_lower = key.to_ascii_lowercase();
        if SENSITIVE_ARG_MARKERS.iter().any(|m| key_lower.contains(m)) {
            return format!("{}={}", key, crate::utils::logging::mask_sensitive(value));
        }
    }

    if SENSITIVE_ARG_MARKERS.iter().any(|m| lower.contains(m)) {
        return "***".to_string();
    }

    arg.to_string()
}

/// Decode console output that may be UTF-16LE (`wsl.exe` writes UTF-16 when its stdout is a pipe).
pub fn decode_console_output(bytes: &[u8]) -> String {
    let looks_utf16 = bytes.len() >= 2
        && (bytes.starts_with(&[0xFF, 0xFE])
            || bytes.iter().skip(1).step_by(2).take(64).all(|b| *b == 0));
    if looks_utf16 {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        return String::from_utf16_lossy(&units)
            .trim_start_matches('\u{feff}')
            .to_string();
    }
    String::from_utf8_lossy(bytes).to_string()
}

fn is_transient_exec_error(e: &anyhow::Error) -> bool {
    let msg = format!("{:#}", e).to_ascii_lowercase();
    msg.contains("temporarily")
        || msg.contains("temporary")
        || msg.contains("busy")
        || msg.contains("used by another process")
        || msg.contains("resource")
        || msg.contains("interrupted")
}

async fn run_cmd_with_timeout_once(
    program: &str,
    args: &[String],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    let started = Instant::now();

    debug!(
        "[PHASE: runner] [STEP: cmd] run_cmd_with_timeout_once entered (operation={}, program={}, args=[{}], timeout_ms={})",
        operation,
        program,
        args.iter().map(|a| mask_arg_for_log(a)).collect::<Vec<_>>().join(", "),
        timeout_dur.as_millis()
    );

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().with_context(|| {
        format!(
            "Failed to spawn command '{}' (operation={})",
            program, operation
        )
    })?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stdout (operation={})", operation))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow::anyhow!("Failed to capture stderr (operation={})", operation))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stdout.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(decode_console_output(&buf))
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        stderr.read_to_end(&mut buf).await?;
        Ok::<String, std::io::Error>(decode_console_output(&buf))
    });

    let status = match timeout(timeout_dur, child.wait()).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            return Err(anyhow::Error::new(e)).with_context(|| {
                format!(
                    "Command wait failed (operation={}, program={})",
                    operation, program
                )
            });
        }
        Err(_) => {
            warn!(
                "[PHASE: runner] [STEP: cmd] Timeout reached (operation={}, program={}, timeout_ms={}); attempting to kill process",
                operation,
                program,
                timeout_dur.as_millis()
            );

            if let Err(e) = child.kill().await {
                warn!(
                    "[PHASE: runner] [STEP: cmd] Failed to kill timed-out process (operation={}, program={}): {}",
                    operation, program, e
                );
            }

            // Best-effort reap (avoid zombies)
            let _ = timeout(Duration::from_secs(5), child.wait()).await;

            return Err(anyhow::anyhow!(
                "Command timed out after {}ms (operation={}, program={})",
                timeout_dur.as_millis(),
                operation,
                program
            ));
        }
    };

    let stdout_str = stdout_task
        .await
        .context("stdout join failed")?
        .context("stdout read failed")?;
    let stderr_str = stderr_task
        .await
        .context("stderr join failed")?
        .context("stderr read failed")?;

    let duration_ms = started.elapsed().as_millis();
    let out = CommandOutput {
        exit_code: status.code(),
        stdout: stdout_str,
        stderr: stderr_str,
        duration_ms,
    };

    debug!(
        "[PHASE: runner] [STEP: cmd] run_cmd_with_timeout_once exit (operation={}, program={}, exit_code={:?}, duration_ms={}, stdout_len={}, stderr_len={})",
        operation,
        program,
        out.exit_code,
        out.duration_ms,
        out.stdout.len(),
        out.stderr.len()
    );

    Ok(out)
}

/// Run an external command with a timeout and up to 3 retries for transient spawn failures.
///
/// Returns captured stdout/stderr even when exit code is non-zero (caller decides success).
/// A timeout is not retried: installers and daemons that hang once usually hang again.
pub async fn run_cmd_with_timeout(
    program: &str,
    args: &[String],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    let started = Instant::now();
    let program_owned = program.to_string();
    let args_owned = args.to_vec();
    let operation_owned = operation.to_string();

    let attempt = move || {
        let program = program_owned.clone();
        let args = args_owned.clone();
        let op = operation_owned.clone();
        async move { run_cmd_with_timeout_once(&program, &args, timeout_dur, &op).await }
    };

    let retry_strategy = ExponentialBackoff::from_millis(200)
        .factor(2)
        .max_delay(Duration::from_secs(2))
        .take(3)
        .map(jitter);

    let result = RetryIf::spawn(retry_strategy, attempt, |e: &anyhow::Error| {
        let transient = is_transient_exec_error(e);
        if transient {
            warn!(
                "[PHASE: runner] [STEP: cmd] Transient command failure detected; will retry (operation={}, program={}, err={:#})",
                operation,
                program,
                e
            );
        }
        transient
    })
    .await;

    match &result {
        Ok(out) => {
            debug!(
                "[PHASE: runner] [STEP: cmd] run_cmd_with_timeout exit (operation={}, program={}, exit_code={:?}, duration_ms={})",
                operation,
                program,
                out.exit_code,
                started.elapsed().as_millis()
            );
        }
        Err(e) => {
            error!(
                "[PHASE: runner] [STEP: cmd] run_cmd_with_timeout error (operation={}, program={}, duration_ms={}, err={:#})",
                operation,
                program,
                started.elapsed().as_millis(),
                e
            );
        }
    }

    result
}

/// Convenience: `&[&str]` arguments.
pub async fn run_cmd(
    program: &str,
    args: &[&str],
    timeout_dur: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    let owned: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    run_cmd_with_timeout(program, &owned, timeout_dur, operation).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_arg_for_log_redacts_secretish_values() {
        assert_eq!(mask_arg_for_log("token=abc"), "token=***");
        assert_eq!(mask_arg_for_log("--client-secret"), "***");
        assert_eq!(mask_arg_for_log("--name"), "--name");
    }

    #[test]
    fn mask_arg_for_log_masks_password_flag_values() {
        let masked = mask_arg_for_log("--password=correct-horse-battery");
        assert!(masked.starts_with("--password="), "{}", masked);
        assert!(!masked.contains("horse"), "{}", masked);
        assert_eq!(mask_arg_for_log("--Password=hunter2"), "--Password=***");
        assert_eq!(mask_arg_for_log("--data-path=/srv/kusto"), "--data-path=/srv/kusto");
    }

    #[test]
    fn mask_arg_for_log_masks_url_queries() {
        let masked = mask_arg_for_log("https://x.test/file.exe?sig=abcdef");
        assert_eq!(masked, "https://x.test/file.exe?sig=***");
    }

    #[test]
    fn decode_console_output_handles_utf16le() {
        let text = "Default Version: 2";
        let mut bytes: Vec<u8> = Vec::new();
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(decode_console_output(&bytes), text);
    }

    #[test]
    fn decode_console_output_handles_utf16le_with_bom() {
        let mut bytes = vec![0xFF, 0xFE];
        for unit in "ok".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(decode_console_output(&bytes), "ok");
    }

    #[test]
    fn decode_console_output_passes_utf8_through() {
        assert_eq!(decode_console_output(b"Docker version 24.0.5"), "Docker version 24.0.5");
        assert_eq!(decode_console_output(b""), "");
    }

    #[test]
    fn combined_output_joins_streams() {
        let out = CommandOutput {
            exit_code: Some(1),
            stdout: "out\n".into(),
            stderr: "  err ".into(),
            duration_ms: 1,
        };
        assert!(!out.succeeded());
        assert_eq!(out.combined(), "out\nerr");
    }

    #[tokio::test]
    async fn run_cmd_with_timeout_basic_smoke() {
        let timeout_dur = Duration::from_secs(5);

        #[cfg(windows)]
        let (program, args) = (
            "cmd",
            vec!["/C".to_string(), "echo".to_string(), "hello".to_string()],
        );

        #[cfg(not(windows))]
        let (program, args) = ("sh", vec!["-c".to_string(), "echo hello".to_string()]);

        let out = run_cmd_with_timeout(program, &args, timeout_dur, "test_echo")
            .await
            .expect("command should run");
        assert_eq!(out.exit_code, Some(0));
        assert!(out.stdout.to_ascii_lowercase().contains("hello"));
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn run_cmd_with_timeout_kills_hung_process() {
        let args = vec!["-c".to_string(), "sleep 5".to_string()];
        let err = run_cmd_with_timeout("sh", &args, Duration::from_millis(200), "test_sleep")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{}", err);
    }

    #[tokio::test]
    async fn run_cmd_with_timeout_missing_program_is_error() {
        let res = run_cmd(
            "definitely-not-a-real-program-kusto",
            &[],
            Duration::from_secs(2),
            "test_missing",
        )
        .await;
        assert!(res.is_err());
    }
}
