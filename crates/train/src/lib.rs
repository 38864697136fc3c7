//! # zhmt-train — Schedule and Epoch Driver
//!
//! Learning-rate scheduling and the epoch loop for the translation model:
//!
//! * **[`cosine_with_warmup`]** / **[`LrScheduler`]** — linear warmup, then
//!   cosine annealing, applied to any [`LearningRate`] optimiser.
//! * **[`EpochDriver`]** — runs epochs of forward → loss → backward → step,
//!   reports metrics and saves per-epoch checkpoints.
//! * **[`FileCheckpointStore`]** — atomic safetensors checkpoints on disk.
//! * **[`CandleOptimizer`]** / **[`translation_loss`]** — candle-backed
//!   collaborators for the driver.

pub mod candle;
pub mod checkpoint;
pub mod error;
pub mod handles;
pub mod scheduler;
pub mod trainer;

pub use candle::{translation_loss, CandleOptimizer};
pub use checkpoint::{
    latest_checkpoint, list_checkpoints, read_meta, CheckpointMeta, Checkpointable,
    FileCheckpointStore,
};
pub use error::{TrainError, TrainResult};
pub use handles::{
    CheckpointStore, LearningRate, LossCompute, ModelLike, NoCheckpoints, OptimizerLike,
    ScalarLoss,
};
pub use scheduler::{cosine_with_warmup, LrScheduler, ScheduleConfig};
pub use trainer::{
    CheckpointOutcome, DriverConfig, DriverState, EpochDriver, EpochSummary, ProgressObserver,
    StepMetrics, StopFlag, TrainingObserver, TrainingReport,
};
