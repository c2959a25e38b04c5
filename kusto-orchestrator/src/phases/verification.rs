// FINAL_VERIFICATION
//
// Runs once the ladder reports COMPLETE. Every check is advisory: a failure is reported as a
// warning and the deployment still counts as successful.

use anyhow::{Context, Result};
use log::{info, warn};
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::DeployContext;
use crate::installation::bypass;
use crate::installation::readiness::{wait_until, WaitBounds};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);
pub const SAMPLE_DATABASE: &str = "NetDefaultDB";
pub const SAMPLE_TABLE: &str = "OrchestratorSample";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub service_healthy: bool,
    /// `None` when sample data is disabled or the service never became healthy.
    pub sample_data_loaded: Option<bool>,
    pub bypass_intact: bool,
    pub warnings: Vec<String>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Management endpoint of the emulator.
pub fn mgmt_url(service_url: &str) -> String {
    format!("{}/v1/rest/mgmt", service_url.trim_end_matches('/'))
}

pub fn health_request_body() -> Value {
    json!({ "csl": ".show cluster" })
}

/// Idempotent command that materializes a tiny sample table.
pub fn sample_data_command() -> String {
    format!(
        ".set-or-append {} <| datatable(Timestamp:datetime, Source:string, Value:long) \
         [datetime(2024-01-01T00:00:00Z), \"orchestrator\", 1, \
          datetime(2024-01-01T00:01:00Z), \"orchestrator\", 2]",
        SAMPLE_TABLE
    )
}

async fn post_mgmt(client: &reqwest::Client, url: &str, body: &Value) -> Result<()> {
    let resp = client
        .post(url)
        .json(body)
        .send()
        .await
        .with_context(|| format!("POST {} failed", url))?;
    let status = resp.status();
    if !status.is_success() {
        let text = resp.text().await.unwrap_or_default();
        anyhow::bail!("POST {} returned HTTP {}: {}", url, status, text.trim());
    }
    Ok(())
}

pub async fn run_final_verification(ctx: &DeployContext) -> VerificationReport {
    let mut report = VerificationReport::default();
    let url = mgmt_url(&ctx.service_url());

    let client = match reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .no_proxy()
        .build()
    {
        Ok(c) => Some(c),
        Err(e) => {
            report
                .warnings
                .push(format!("HTTP client unavailable: {}", e));
            None
        }
    };

    if let Some(client) = &client {
        report.service_healthy = match WaitBounds::new(ctx.health_wait(), HEALTH_POLL_INTERVAL) {
            Ok(bounds) => {
                let body = health_request_body();
                wait_until("health", bounds, || {
                    let client = client.clone();
                    let url = url.clone();
                    let body = body.clone();
                    async move { post_mgmt(&client, &url, &body).await.is_ok() }
                })
                .await
            }
            Err(e) => {
                report.warnings.push(format!("health check skipped: {:#}", e));
                false
            }
        };
        if !report.service_healthy {
            report.warnings.push(format!(
                "service did not answer {} within {}s",
                url,
                ctx.health_wait().as_secs()
            ));
        }

        if ctx.config.sample_data && report.service_healthy {
            let body = json!({ "db": SAMPLE_DATABASE, "csl": sample_data_command() });
            match post_mgmt(client, &url, &body).await {
                Ok(()) => report.sample_data_loaded = Some(true),
                Err(e) => {
                    report.sample_data_loaded = Some(false);
                    report.warnings.push(format!("sample data not loaded: {:#}", e));
                }
            }
        }
    }

    report.bypass_intact = match &ctx.config.settings_overlay {
        None => true,
        Some(overlay) => match bypass::overlay_satisfied(overlay) {
            Ok(true) => true,
            Ok(false) => {
                report.warnings.push(format!(
                    "settings overlay {:?} is not in effect",
                    overlay.path
                ));
                false
            }
            Err(e) => {
                report.warnings.push(format!(
                    "settings overlay {:?} unreadable: {:#}",
                    overlay.path, e
                ));
                false
            }
        },
    };

    for w in &report.warnings {
        warn!("[PHASE: final_verification] [STEP: check] {}", w);
    }
    info!(
        "[PHASE: final_verification] [STEP: summary] healthy={}, sample_data={:?}, bypass_intact={}, warnings={}",
        report.service_healthy,
        report.sample_data_loaded,
        report.bypass_intact,
        report.warnings.len()
    );
    report
}
