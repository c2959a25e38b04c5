// Runtime first-run settings bypass.
//
// Docker Desktop blocks on an interactive onboarding/license screen the first time it starts,
// which never completes when the daemon is launched by the boot-time continuation. Writing the
// acknowledgement keys into its settings file before and after the installer runs lets the
// daemon come up unattended.

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::utils::os_detection::OperatingSystem;

/// A JSON settings file plus the top-level keys that must hold the given values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SettingsOverlay {
    pub path: PathBuf,
    pub values: Map<String, Value>,
}

/// Docker Desktop's settings store under `%APPDATA%`; `None` on hosts without a first-run UI.
pub fn default_overlay(os: OperatingSystem) -> Option<SettingsOverlay> {
    if os != OperatingSystem::Windows {
        return None;
    }
    let appdata = std::env::var_os("APPDATA")?;
    let mut values = Map::new();
    values.insert("DisplayedOnboarding".to_string(), Value::Bool(true));
    values.insert("LicenseTermsVersion".to_string(), Value::from(2));
    values.insert("AutoStart".to_string(), Value::Bool(true));
    values.insert("OpenUIOnStartupDisabled".to_string(), Value::Bool(true));
    Some(SettingsOverlay {
        path: PathBuf::from(appdata)
            .join("Docker")
            .join("settings-store.json"),
        values,
    })
}

fn read_settings(path: &Path) -> Result<Map<String, Value>> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file {:?}", path))?;
    if text.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str::<Value>(&text)
        .with_context(|| format!("Settings file {:?} is not valid JSON", path))?
    {
        Value::Object(map) => Ok(map),
        _ => anyhow::bail!("Settings file {:?} must contain a JSON object", path),
    }
}

fn missing_keys(current: &Map<String, Value>, wanted: &Map<String, Value>) -> Vec<String> {
    wanted
        .iter()
        .filter(|(k, v)| current.get(k.as_str()) != Some(*v))
        .map(|(k, _)| k.clone())
        .collect()
}

/// Merge the overlay into its settings file. Returns whether the file changed.
///
/// Keys not named by the overlay are preserved untouched.
pub fn apply_overlay(overlay: &SettingsOverlay) -> Result<bool> {
    let path = &overlay.path;
    let mut current = read_settings(path)?;
    let missing = missing_keys(&current, &overlay.values);
    if missing.is_empty() {
        debug!(
            "[PHASE: bypass] [STEP: apply] Settings already satisfied (path={:?})",
            path
        );
        return Ok(false);
    }

    for key in &missing {
        if let Some(v) = overlay.values.get(key) {
            current.insert(key.clone(), v.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create settings directory {:?}", parent))?;
    }
    let text = serde_json::to_string_pretty(&Value::Object(current))
        .context("Failed to serialize settings")?;
    std::fs::write(path, text)
        .with_context(|| format!("Failed to write settings file {:?}", path))?;

    info!(
        "[PHASE: bypass] [STEP: apply] Updated settings (path={:?}, keys=[{}])",
        path,
        missing.join(", ")
    );
    Ok(true)
}

/// Whether every key of the overlay already holds its value on disk.
pub fn overlay_satisfied(overlay: &SettingsOverlay) -> Result<bool> {
    let current = read_settings(&overlay.path)?;
    Ok(missing_keys(&current, &overlay.values).is_empty())
}

#[cfg(test)]
pub(crate) fn overlay_at(path: &Path) -> SettingsOverlay {
    let mut values = Map::new();
    values.insert("DisplayedOnboarding".into(), Value::Bool(true));
    values.insert("LicenseTermsVersion".into(), Value::from(2));
    SettingsOverlay {
        path: path.to_path_buf(),
        values,
    }
}
