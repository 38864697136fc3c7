//! Learning-rate schedule: linear warmup, then cosine annealing.

use std::f64::consts::PI;

use zhmt_common::TrainConfig;

use crate::error::{TrainError, TrainResult};
use crate::handles::LearningRate;

// ── Schedule function ───────────────────────────────────────────────────────

/// Learning-rate multiplier at `current_step`.
///
/// Ramps linearly from 0 to 1 over `num_warmup_steps`, then follows
/// `0.5 * (1 + cos(2π · num_cycles · progress))` clamped at 0. Both
/// denominators are floored at 1, so degenerate step counts never divide by
/// zero.
pub fn cosine_with_warmup(
    current_step: usize,
    num_warmup_steps: usize,
    num_training_steps: usize,
    num_cycles: f64,
) -> f64 {
    if current_step < num_warmup_steps {
        return current_step as f64 / num_warmup_steps.max(1) as f64;
    }
    let decay_steps = num_training_steps.saturating_sub(num_warmup_steps).max(1);
    let progress = (current_step - num_warmup_steps) as f64 / decay_steps as f64;
    let cos = (PI * num_cycles * 2.0 * progress).cos();
    // f64::max drops a NaN operand, so this also yields 0 for NaN.
    (0.5 * (1.0 + cos)).max(0.0)
}

// ── ScheduleConfig ──────────────────────────────────────────────────────────

/// Immutable schedule parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduleConfig {
    pub warmup_steps: usize,
    pub total_steps: usize,
    pub num_cycles: f64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            warmup_steps: 0,
            total_steps: 0,
            num_cycles: 0.5,
        }
    }
}

impl ScheduleConfig {
    pub fn new(warmup_steps: usize, total_steps: usize, num_cycles: f64) -> Self {
        Self {
            warmup_steps,
            total_steps,
            num_cycles,
        }
    }

    /// Schedule for `config` with `batches_per_epoch` optimiser steps per epoch.
    pub fn from_train_config(config: &TrainConfig, batches_per_epoch: usize) -> Self {
        Self {
            warmup_steps: config.warmup_steps,
            total_steps: config.resolved_total_steps(batches_per_epoch),
            num_cycles: config.num_cycles,
        }
    }

    pub fn validate(&self) -> TrainResult<()> {
        if self.total_steps < self.warmup_steps {
            return Err(TrainError::Config(format!(
                "total_steps ({}) must be >= warmup_steps ({})",
                self.total_steps, self.warmup_steps
            )));
        }
        if !self.num_cycles.is_finite() || self.num_cycles < 0.0 {
            return Err(TrainError::Config(format!(
                "num_cycles must be finite and >= 0, got {}",
                self.num_cycles
            )));
        }
        Ok(())
    }

    pub fn multiplier(&self, step: usize) -> f64 {
        cosine_with_warmup(step, self.warmup_steps, self.total_steps, self.num_cycles)
    }

    /// `(step, base_lr × multiplier)` for steps `0, every, 2·every, …` up to
    /// and including `total_steps`.
    pub fn curve(&self, base_lr: f64, every: usize) -> impl Iterator<Item = (usize, f64)> + '_ {
        let every = every.max(1);
        let last = self.total_steps;
        (0..=last)
            .step_by(every)
            .chain((last % every != 0).then_some(last))
            .map(move |s| (s, base_lr * self.multiplier(s)))
    }
}

// ── LrScheduler ─────────────────────────────────────────────────────────────

/// Owns the step counter and pushes `base_lr × multiplier` into an optimiser.
///
/// The optimiser is passed to every call rather than captured, so the caller
/// stays the only owner of optimiser state.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    schedule: ScheduleConfig,
    base_lr: f64,
    step: usize,
    multiplier: f64,
}

impl LrScheduler {
    pub fn new(base_lr: f64, schedule: ScheduleConfig) -> TrainResult<Self> {
        schedule.validate()?;
        if !base_lr.is_finite() || base_lr < 0.0 {
            return Err(TrainError::Config(format!(
                "base learning rate must be finite and >= 0, got {base_lr}"
            )));
        }
        Ok(Self {
            schedule,
            base_lr,
            step: 0,
            multiplier: schedule.multiplier(0),
        })
    }

    /// Apply the step-0 learning rate before the first update.
    pub fn attach<O: LearningRate + ?Sized>(&self, optimizer: &mut O) -> f64 {
        let lr = self.current_lr();
        optimizer.set_learning_rate(lr);
        lr
    }

    /// Advance one optimiser update and apply the new learning rate.
    pub fn step<O: LearningRate + ?Sized>(&mut self, optimizer: &mut O) -> f64 {
        self.step += 1;
        self.multiplier = self.schedule.multiplier(self.step);
        let lr = self.current_lr();
        optimizer.set_learning_rate(lr);
        lr
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn current_lr(&self) -> f64 {
        self.base_lr * self.multiplier
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }

    pub fn schedule(&self) -> &ScheduleConfig {
        &self.schedule
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
