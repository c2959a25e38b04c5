// Durable progress record.
//
// Exactly one checkpoint exists, at a fixed path inside the state folder. It is advisory: the
// phase detector decides what runs next; the checkpoint records what was last attempted and
// with which parameters, for diagnostics and for the operator.

use anyhow::Context;
use chrono::Utc;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};

use crate::config::DeployContext;
use crate::error::{DeployError, DeployResult};
use crate::models::checkpoint::{Checkpoint, CheckpointData};
use crate::models::options::RunOptions;
use crate::models::phase::Phase;

pub struct CheckpointStore {
    path: PathBuf,
    script_path: PathBuf,
    parameters: RunOptions,
}

impl CheckpointStore {
    pub fn new(path: PathBuf, script_path: PathBuf, parameters: RunOptions) -> Self {
        Self {
            path,
            script_path,
            parameters,
        }
    }

    pub fn for_context(ctx: &DeployContext) -> Self {
        Self::new(
            ctx.checkpoint_path.clone(),
            ctx.executable.clone(),
            ctx.options.clone(),
        )
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Overwrite the checkpoint with `phase` and the current invocation.
    ///
    /// Written to a sibling temp file and renamed over the target, so a crash mid-write
    /// leaves either the old or the new record, never a torn one.
    pub fn save(&self, phase: Phase, data: CheckpointData) -> DeployResult<Checkpoint> {
        let checkpoint = Checkpoint {
            phase,
            timestamp: Utc::now(),
            data,
            script_path: self.script_path.clone(),
            parameters: self.parameters.clone(),
        };

        let json = serde_json::to_string_pretty(&checkpoint).context("Failed to serialize checkpoint")?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state folder {:?}", parent))?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)
            .with_context(|| format!("Failed to write checkpoint temp file {:?}", tmp))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to move checkpoint into place at {:?}", self.path))?;

        debug!(
            "[PHASE: {}] [STEP: checkpoint] Saved checkpoint (path={:?}, keys={})",
            phase.log_label(),
            self.path,
            checkpoint.data.len()
        );
        Ok(checkpoint)
    }

    /// Read the checkpoint. Absent or corrupt yields `None`; corrupt is logged, never fatal.
    pub fn load(&self) -> Option<Checkpoint> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(
                    "[PHASE: initialization] [STEP: checkpoint] Unable to read checkpoint {:?}: {}",
                    self.path, e
                );
                return None;
            }
        };
        match parse_checkpoint(&text, &self.path) {
            Ok(cp) => Some(cp),
            Err(e) => {
                warn!(
                    "[PHASE: initialization] [STEP: checkpoint] Ignoring corrupt checkpoint: {}",
                    e
                );
                None
            }
        }
    }

    /// Delete the checkpoint if present.
    pub fn clear(&self) -> DeployResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(
                    "[PHASE: cleanup] [STEP: checkpoint] Removed checkpoint {:?}",
                    self.path
                );
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e)
                .context(format!("Failed to remove checkpoint {:?}", self.path))
                .into()),
        }
    }
}

/// Parse a checkpoint document. Unknown or missing fields and nested data values are rejected.
pub fn parse_checkpoint(text: &str, origin: &Path) -> DeployResult<Checkpoint> {
    serde_json::from_str(text).map_err(|e| DeployError::config_format(origin, e.to_string()))
}
