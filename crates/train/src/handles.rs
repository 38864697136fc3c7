//! Capabilities the epoch driver needs from its collaborators.
//!
//! The driver never sees tensors or autograd directly: a model turns a batch
//! into an output, a loss callable turns that into a loss, and the optimiser
//! owns gradient propagation and the parameter update. The candle-backed
//! implementations live in [`crate::candle`]; tests use plain stubs.

use std::path::PathBuf;

/// Model handle: a forward pass plus a train/eval toggle.
pub trait ModelLike {
    type Batch;
    type Output;

    fn set_training(&mut self, training: bool);
    fn forward(&mut self, batch: &Self::Batch) -> anyhow::Result<Self::Output>;
}

/// A loss value that can be reported as a plain number.
pub trait ScalarLoss {
    fn value(&self) -> anyhow::Result<f64>;
}

impl ScalarLoss for f64 {
    fn value(&self) -> anyhow::Result<f64> {
        Ok(*self)
    }
}

impl ScalarLoss for f32 {
    fn value(&self) -> anyhow::Result<f64> {
        Ok(f64::from(*self))
    }
}

/// `(model_output, batch) -> loss`. Any matching closure qualifies.
pub trait LossCompute<O, B> {
    type Loss: ScalarLoss;

    fn compute(&mut self, output: &O, batch: &B) -> anyhow::Result<Self::Loss>;
}

impl<O, B, L, F> LossCompute<O, B> for F
where
    F: FnMut(&O, &B) -> anyhow::Result<L>,
    L: ScalarLoss,
{
    type Loss = L;

    fn compute(&mut self, output: &O, batch: &B) -> anyhow::Result<L> {
        self(output, batch)
    }
}

/// Anything whose learning rate the scheduler can drive.
pub trait LearningRate {
    fn learning_rate(&self) -> f64;
    fn set_learning_rate(&mut self, lr: f64);
}

/// Optimiser handle. `backward` propagates gradients from `loss`; `step`
/// applies them.
pub trait OptimizerLike<L>: LearningRate {
    fn backward(&mut self, loss: &L) -> anyhow::Result<()>;
    fn step(&mut self) -> anyhow::Result<()>;
}

/// Persists a snapshot of `model` keyed by epoch. Failures are reported to the
/// driver, which logs them and keeps training.
pub trait CheckpointStore<M> {
    fn save(&mut self, epoch: usize, model: &M, global_step: usize) -> anyhow::Result<PathBuf>;
}

/// Store used when checkpointing is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCheckpoints;

impl<M> CheckpointStore<M> for NoCheckpoints {
    fn save(&mut self, epoch: usize, _model: &M, _global_step: usize) -> anyhow::Result<PathBuf> {
        anyhow::bail!("checkpointing disabled (epoch {epoch})")
    }
}
