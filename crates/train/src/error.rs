//! Error types for the training loop.

use thiserror::Error;

/// Failures surfaced by the epoch driver.
///
/// `Config`, `Data` and `Computation` are fatal. `Persistence` is produced by
/// checkpoint stores and downgraded to a warning by the driver.
#[derive(Debug, Error)]
pub enum TrainError {
    /// Invalid schedule or training parameters, raised before any step.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The batch source failed to produce a batch.
    #[error("epoch {epoch}: failed to fetch batch {step}: {source}")]
    Data {
        epoch: usize,
        step: usize,
        #[source]
        source: anyhow::Error,
    },

    /// Forward, loss, backward or optimiser step failed.
    #[error("epoch {epoch}, batch {step}: computation failed: {source}")]
    Computation {
        epoch: usize,
        step: usize,
        #[source]
        source: anyhow::Error,
    },

    /// A checkpoint could not be written.
    #[error("epoch {epoch}: checkpoint save failed: {source}")]
    Persistence {
        epoch: usize,
        #[source]
        source: anyhow::Error,
    },
}

impl TrainError {
    /// Whether training must stop.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TrainError::Persistence { .. })
    }
}

pub type TrainResult<T> = Result<T, TrainError>;
