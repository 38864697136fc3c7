//! Epoch driver: the training loop.
//!
//! For every epoch the driver puts the model in training mode, walks the
//! epoch's batches in source order (forward → loss → backward → optimiser
//! step → scheduler step), reports per-step metrics and, at the epoch
//! boundary, optionally persists a checkpoint.
//!
//! Any failure while fetching or computing a batch aborts the run before the
//! scheduler advances, so the step counter always equals the number of
//! applied optimiser updates. Checkpoint failures only produce a warning.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use zhmt_common::{BatchSource, TrainConfig};

use crate::error::{TrainError, TrainResult};
use crate::handles::{CheckpointStore, LossCompute, ModelLike, OptimizerLike, ScalarLoss};
use crate::scheduler::LrScheduler;

// ── Config ──────────────────────────────────────────────────────────────────

/// Loop-level knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    pub epochs: usize,
    pub save_checkpoints: bool,
    /// Stop after this many optimiser updates (0 = unlimited).
    pub max_steps: usize,
    pub log_every: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            save_checkpoints: false,
            max_steps: 0,
            log_every: 100,
        }
    }
}

impl From<&TrainConfig> for DriverConfig {
    fn from(config: &TrainConfig) -> Self {
        Self {
            epochs: config.epochs,
            save_checkpoints: config.save_checkpoints,
            max_steps: config.max_steps,
            log_every: config.log_every,
        }
    }
}

// ── Reporting types ─────────────────────────────────────────────────────────

/// Where the driver is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    NotStarted,
    EpochRunning(usize),
    Completed,
    /// Halted at a batch boundary by `max_steps` or a [`StopFlag`].
    Stopped,
    Failed,
}

/// Metrics emitted after every optimiser update.
#[derive(Debug, Clone, PartialEq)]
pub struct StepMetrics {
    pub epoch: usize,
    /// 1-based index of the batch within its epoch.
    pub step_in_epoch: usize,
    /// Step counter after this update.
    pub global_step: usize,
    pub loss: f64,
    /// Mean loss over the epoch so far.
    pub running_loss: f64,
    /// Learning rate after the scheduler step.
    pub lr: f64,
    pub multiplier: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CheckpointOutcome {
    Disabled,
    Saved(PathBuf),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub batches: usize,
    pub mean_loss: f64,
    pub last_lr: f64,
    pub checkpoint: CheckpointOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainingReport {
    pub epochs: Vec<EpochSummary>,
    pub global_step: usize,
    pub state: DriverState,
}

/// Hooks for progress reporting. All methods default to no-ops.
pub trait TrainingObserver {
    fn on_epoch_start(&mut self, _epoch: usize, _total_epochs: usize, _batches: Option<usize>) {}
    fn on_step(&mut self, _metrics: &StepMetrics) {}
    fn on_epoch_end(&mut self, _summary: &EpochSummary) {}
}

/// Default observer: an `indicatif` bar per epoch plus a `tracing` line every
/// `log_every` steps.
pub struct ProgressObserver {
    log_every: usize,
    bar: Option<ProgressBar>,
}

impl ProgressObserver {
    pub fn new(log_every: usize) -> Self {
        Self {
            log_every,
            bar: None,
        }
    }
}

impl TrainingObserver for ProgressObserver {
    fn on_epoch_start(&mut self, epoch: usize, total_epochs: usize, batches: Option<usize>) {
        tracing::info!(epoch, total_epochs, "Starting epoch");
        let bar = match batches {
            Some(n) => ProgressBar::new(n as u64),
            None => ProgressBar::new_spinner(),
        };
        if let Ok(style) = ProgressStyle::with_template(
            "[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} {msg}",
        ) {
            bar.set_style(style.progress_chars("##-"));
        }
        self.bar = Some(bar);
    }

    fn on_step(&mut self, m: &StepMetrics) {
        if let Some(bar) = &self.bar {
            bar.set_message(format!("loss {:.4} lr {:.2e}", m.running_loss, m.lr));
            bar.inc(1);
        }
        if self.log_every > 0 && m.global_step % self.log_every == 0 {
            tracing::info!(
                epoch = m.epoch,
                step = m.step_in_epoch,
                global_step = m.global_step,
                loss = format!("{:.4}", m.running_loss),
                lr = format!("{:.3e}", m.lr),
                "train"
            );
        }
    }

    fn on_epoch_end(&mut self, summary: &EpochSummary) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
        tracing::info!(
            epoch = summary.epoch,
            batches = summary.batches,
            mean_loss = format!("{:.4}", summary.mean_loss),
            "Epoch finished"
        );
    }
}

/// Shared cooperative stop request, honoured only between batches.
#[derive(Debug, Clone, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── EpochDriver ─────────────────────────────────────────────────────────────

/// Runs epochs `1..=epochs` strictly in order on the calling thread.
pub struct EpochDriver<O = ProgressObserver> {
    config: DriverConfig,
    scheduler: LrScheduler,
    observer: O,
    stop: StopFlag,
    state: DriverState,
}

impl EpochDriver<ProgressObserver> {
    pub fn new(config: DriverConfig, scheduler: LrScheduler) -> Self {
        let observer = ProgressObserver::new(config.log_every);
        Self {
            config,
            scheduler,
            observer,
            stop: StopFlag::new(),
            state: DriverState::NotStarted,
        }
    }
}

impl<O: TrainingObserver> EpochDriver<O> {
    pub fn with_observer<P: TrainingObserver>(self, observer: P) -> EpochDriver<P> {
        EpochDriver {
            config: self.config,
            scheduler: self.scheduler,
            observer,
            stop: self.stop,
            state: self.state,
        }
    }

    pub fn with_stop_flag(mut self, stop: StopFlag) -> Self {
        self.stop = stop;
        self
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Number of optimiser updates applied so far.
    pub fn global_step(&self) -> usize {
        self.scheduler.step_count()
    }

    pub fn scheduler(&self) -> &LrScheduler {
        &self.scheduler
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Train for the configured number of epochs.
    ///
    /// Returns the fatal error that aborted the run, if any; checkpoint
    /// failures are recorded in the returned [`EpochSummary`] list instead.
    pub fn run<M, S, L, P, C>(
        &mut self,
        model: &mut M,
        source: &mut S,
        loss_fn: &mut L,
        optimizer: &mut P,
        store: &mut C,
    ) -> TrainResult<TrainingReport>
    where
        M: ModelLike,
        S: BatchSource<Batch = M::Batch>,
        L: LossCompute<M::Output, M::Batch>,
        P: OptimizerLike<L::Loss>,
        C: CheckpointStore<M>,
    {
        if self.state != DriverState::NotStarted {
            return Err(TrainError::Config(format!(
                "driver already ran (state {:?}); create a new one to train again",
                self.state
            )));
        }
        if self.config.epochs == 0 {
            return Err(TrainError::Config("epochs must be positive".into()));
        }

        let lr = self.scheduler.attach(optimizer);
        tracing::info!(
            epochs = self.config.epochs,
            warmup_steps = self.scheduler.schedule().warmup_steps,
            total_steps = self.scheduler.schedule().total_steps,
            initial_lr = lr,
            "Starting training"
        );

        let mut summaries = Vec::with_capacity(self.config.epochs);
        let mut stopped = false;

        for epoch in 1..=self.config.epochs {
            if self.should_halt() {
                stopped = true;
                break;
            }
            self.state = DriverState::EpochRunning(epoch);
            model.set_training(true);
            self.observer
                .on_epoch_start(epoch, self.config.epochs, source.batches_per_epoch());

            let (batches, loss_sum, halted) =
                match self.run_epoch(epoch, model, source, loss_fn, optimizer) {
                    Ok(v) => v,
                    Err(e) => {
                        self.state = DriverState::Failed;
                        tracing::error!(error = %e, "Training aborted");
                        return Err(e);
                    }
                };

            let checkpoint = if self.config.save_checkpoints {
                self.save_checkpoint(epoch, model, store)
            } else {
                CheckpointOutcome::Disabled
            };

            let summary = EpochSummary {
                epoch,
                batches,
                mean_loss: if batches > 0 {
                    loss_sum / batches as f64
                } else {
                    0.0
                },
                last_lr: self.scheduler.current_lr(),
                checkpoint,
            };
            self.observer.on_epoch_end(&summary);
            summaries.push(summary);

            if halted {
                stopped = true;
                break;
            }
        }

        self.state = if stopped {
            DriverState::Stopped
        } else {
            DriverState::Completed
        };
        tracing::info!(
            global_step = self.global_step(),
            state = ?self.state,
            "Training finished"
        );

        Ok(TrainingReport {
            epochs: summaries,
            global_step: self.global_step(),
            state: self.state,
        })
    }

    /// One epoch. Returns `(batches, loss_sum, halted_early)`.
    fn run_epoch<M, S, L, P>(
        &mut self,
        epoch: usize,
        model: &mut M,
        source: &mut S,
        loss_fn: &mut L,
        optimizer: &mut P,
    ) -> TrainResult<(usize, f64, bool)>
    where
        M: ModelLike,
        S: BatchSource<Batch = M::Batch>,
        L: LossCompute<M::Output, M::Batch>,
        P: OptimizerLike<L::Loss>,
    {
        let mut iter = source
            .batches(epoch)
            .map_err(|source| TrainError::Data {
                epoch,
                step: 0,
                source,
            })?
            .peekable();

        let mut batches = 0usize;
        let mut loss_sum = 0.0f64;

        // An exhausted epoch is complete even when the halt condition is
        // also met; halting only counts when batches remain.
        while iter.peek().is_some() {
            if self.should_halt() {
                return Ok((batches, loss_sum, true));
            }
            let Some(item) = iter.next() else {
                break;
            };
            let step = batches + 1;
            let batch = item.map_err(|source| TrainError::Data {
                epoch,
                step,
                source,
            })?;

            let loss = train_batch(model, loss_fn, optimizer, &batch).map_err(|source| {
                TrainError::Computation {
                    epoch,
                    step,
                    source,
                }
            })?;

            let lr = self.scheduler.step(optimizer);
            batches = step;
            loss_sum += loss;

            let metrics = StepMetrics {
                epoch,
                step_in_epoch: step,
                global_step: self.scheduler.step_count(),
                loss,
                running_loss: loss_sum / batches as f64,
                lr,
                multiplier: self.scheduler.multiplier(),
            };
            self.observer.on_step(&metrics);
        }

        Ok((batches, loss_sum, false))
    }

    fn should_halt(&self) -> bool {
        if self.stop.is_stop_requested() {
            tracing::info!(global_step = self.global_step(), "Stop requested");
            return true;
        }
        if self.config.max_steps > 0 && self.global_step() >= self.config.max_steps {
            tracing::info!(max_steps = self.config.max_steps, "Reached max_steps");
            return true;
        }
        false
    }

    fn save_checkpoint<M, C: CheckpointStore<M>>(
        &self,
        epoch: usize,
        model: &M,
        store: &mut C,
    ) -> CheckpointOutcome {
        match store.save(epoch, model, self.global_step()) {
            Ok(path) => {
                tracing::info!(epoch, path = %path.display(), "Saved checkpoint");
                CheckpointOutcome::Saved(path)
            }
            Err(source) => {
                let err = TrainError::Persistence { epoch, source };
                tracing::warn!(error = %err, "Continuing without checkpoint");
                CheckpointOutcome::Failed(err.to_string())
            }
        }
    }
}

/// Forward, loss, backward and optimiser step for one batch. Returns the loss.
fn train_batch<M, L, P>(
    model: &mut M,
    loss_fn: &mut L,
    optimizer: &mut P,
    batch: &M::Batch,
) -> anyhow::Result<f64>
where
    M: ModelLike,
    L: LossCompute<M::Output, M::Batch>,
    P: OptimizerLike<L::Loss>,
{
    let output = model.forward(batch)?;
    let loss = loss_fn.compute(&output, batch)?;
    let value = loss.value()?;
    if !value.is_finite() {
        anyhow::bail!("non-finite loss {value}");
    }
    optimizer.backward(&loss)?;
    optimizer.step()?;
    Ok(value)
}

// ── Tests ───────────────────────────────────────────────────────────────────
