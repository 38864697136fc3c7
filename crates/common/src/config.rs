//! Training configuration for zhmt.
//!
//! Serialised as JSON next to checkpoints. Every field has a default so a
//! minimal `{}` JSON yields a runnable (if small) configuration.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Hyper-parameters for one training run.
///
/// Backwards-compatible: missing fields fall back to their `#[serde(default)]`
/// values, unknown fields are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    // ── Optimiser ───────────────────────────────────────────────────────────
    /// Peak learning rate; the schedule multiplier scales this value.
    #[serde(default = "default_base_lr")]
    pub base_lr: f64,
    #[serde(default)]
    pub weight_decay: f64,
    /// Global gradient L2 clip (0 disables clipping).
    #[serde(default = "default_grad_clip")]
    pub grad_clip_max_norm: f64,
    /// Label smoothing applied by the translation loss.
    #[serde(default = "default_label_smoothing")]
    pub label_smoothing: f64,

    // ── Schedule ────────────────────────────────────────────────────────────
    /// Linear warmup length in optimiser steps.
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,
    /// Total planned optimiser steps. `0` derives it from `epochs` and the
    /// number of batches per epoch.
    #[serde(default)]
    pub total_steps: usize,
    /// Cosine half-periods (×2) over the post-warmup range.
    #[serde(default = "default_num_cycles")]
    pub num_cycles: f64,

    // ── Loop ────────────────────────────────────────────────────────────────
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum tokens per sentence including `<bos>` and `<eos>`.
    #[serde(default = "default_max_length")]
    pub max_length: usize,
    /// Hard cap on optimiser steps (0 = unlimited).
    #[serde(default)]
    pub max_steps: usize,
    #[serde(default = "default_log_every")]
    pub log_every: usize,

    // ── Checkpoints ─────────────────────────────────────────────────────────
    #[serde(default = "default_true")]
    pub save_checkpoints: bool,
    /// Keep only the newest N epoch checkpoints (0 = keep all).
    #[serde(default)]
    pub keep_checkpoints: usize,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

// ── Default value functions ─────────────────────────────────────────────────

fn default_base_lr() -> f64 {
    5e-4
}
fn default_grad_clip() -> f64 {
    1.0
}
fn default_label_smoothing() -> f64 {
    0.1
}
fn default_warmup_steps() -> usize {
    200
}
fn default_num_cycles() -> f64 {
    0.5
}
fn default_epochs() -> usize {
    10
}
fn default_batch_size() -> usize {
    64
}
fn default_max_length() -> usize {
    72
}
fn default_log_every() -> usize {
    100
}
fn default_true() -> bool {
    true
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("checkpoints")
}

// ── Impl ────────────────────────────────────────────────────────────────────

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            base_lr: default_base_lr(),
            weight_decay: 0.0,
            grad_clip_max_norm: default_grad_clip(),
            label_smoothing: default_label_smoothing(),
            warmup_steps: default_warmup_steps(),
            total_steps: 0,
            num_cycles: default_num_cycles(),
            epochs: default_epochs(),
            batch_size: default_batch_size(),
            max_length: default_max_length(),
            max_steps: 0,
            log_every: default_log_every(),
            save_checkpoints: true,
            keep_checkpoints: 0,
            output_dir: default_output_dir(),
        }
    }
}

impl TrainConfig {
    /// Save config to a JSON file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json =
            std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
        let config = serde_json::from_str(&json)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(config)
    }

    /// Reject values that would make the run meaningless before any step is
    /// taken.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.epochs == 0 {
            anyhow::bail!("epochs must be positive");
        }
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }
        if self.max_length < 3 {
            anyhow::bail!(
                "max_length ({}) must leave room for <bos>, <eos> and one token",
                self.max_length
            );
        }
        if !self.base_lr.is_finite() || self.base_lr <= 0.0 {
            anyhow::bail!("base_lr must be a positive finite number, got {}", self.base_lr);
        }
        if !self.num_cycles.is_finite() || self.num_cycles < 0.0 {
            anyhow::bail!("num_cycles must be finite and >= 0, got {}", self.num_cycles);
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            anyhow::bail!("label_smoothing must be in [0, 1), got {}", self.label_smoothing);
        }
        if self.total_steps > 0 && self.total_steps < self.warmup_steps {
            anyhow::bail!(
                "total_steps ({}) must be >= warmup_steps ({})",
                self.total_steps,
                self.warmup_steps
            );
        }
        Ok(())
    }

    /// Total optimiser steps the schedule should span.
    ///
    /// An explicit `total_steps` wins; otherwise `epochs × batches_per_epoch`,
    /// capped by `max_steps` when set.
    pub fn resolved_total_steps(&self, batches_per_epoch: usize) -> usize {
        if self.total_steps > 0 {
            return self.total_steps;
        }
        let planned = self.epochs.saturating_mul(batches_per_epoch);
        if self.max_steps > 0 {
            planned.min(self.max_steps)
        } else {
            planned
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
