// Bounded polling for subsystems that come up asynchronously (daemon, container, HTTP endpoint).

use anyhow::Result;
use log::{debug, info, warn};
use std::future::Future;
use std::io::Write;
use tokio::time::{sleep, Duration, Instant};

/// No wait may exceed this, whatever the configuration says.
pub const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// A full status line is logged every this many ticks; the others print a marker.
const FULL_STATUS_EVERY: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitBounds {
    max: Duration,
    interval: Duration,
}

impl WaitBounds {
    pub fn new(max: Duration, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            anyhow::bail!("Poll interval must be greater than zero");
        }
        if max > MAX_WAIT {
            anyhow::bail!(
                "Wait bound of {}s exceeds the {}s ceiling",
                max.as_secs(),
                MAX_WAIT.as_secs()
            );
        }
        Ok(WaitBounds { max, interval })
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}

fn print_marker() {
    let mut out = std::io::stdout();
    let _ = write!(out, ".");
    let _ = out.flush();
}

/// Poll `predicate` until it holds or `bounds.max` elapses.
///
/// Returns `true` as soon as the predicate holds (including on the first evaluation) and
/// `false` on timeout. The predicate is evaluated one last time at the deadline.
pub async fn wait_until<F, Fut>(label: &str, bounds: WaitBounds, mut predicate: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let started = Instant::now();
    debug!(
        "[PHASE: readiness] [STEP: {}] wait_until entered (max_s={}, interval_s={})",
        label,
        bounds.max.as_secs(),
        bounds.interval.as_secs()
    );

    let mut tick: u32 = 0;
    loop {
        if predicate().await {
            info!(
                "[PHASE: readiness] [STEP: {}] Ready (elapsed_s={}, ticks={})",
                label,
                started.elapsed().as_secs(),
                tick
            );
            return true;
        }

        let elapsed = started.elapsed();
        if elapsed >= bounds.max {
            warn!(
                "[PHASE: readiness] [STEP: {}] Not ready within {}s",
                label,
                bounds.max.as_secs()
            );
            return false;
        }

        tick += 1;
        let remaining = bounds.max - elapsed;
        if tick % FULL_STATUS_EVERY == 0 {
            info!(
                "[PHASE: readiness] [STEP: {}] Still waiting (elapsed_s={}, remaining_s={})",
                label,
                elapsed.as_secs(),
                remaining.as_secs()
            );
        } else {
            print_marker();
        }

        sleep(bounds.interval.min(remaining)).await;
    }
}
