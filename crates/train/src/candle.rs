//! Candle-backed collaborators for the epoch driver.
//!
//! * **[`CandleOptimizer`]** — AdamW over a `VarMap` with global-norm
//!   gradient clipping.
//! * **[`translation_loss`]** — label-smoothed cross entropy that ignores
//!   padded target positions.

use candle_core::{backprop::GradStore, DType, Tensor, Var, D};
use candle_nn::{ops, AdamW, Optimizer, ParamsAdamW, VarMap};
use zhmt_common::TrainConfig;

use crate::handles::{LearningRate, OptimizerLike, ScalarLoss};

impl ScalarLoss for Tensor {
    fn value(&self) -> anyhow::Result<f64> {
        Ok(self.to_dtype(DType::F64)?.to_scalar::<f64>()?)
    }
}

// ── Optimiser ───────────────────────────────────────────────────────────────

/// AdamW over every variable of a `VarMap`.
///
/// `backward` stores the gradients; `step` clips and applies them. The
/// learning rate is owned by the scheduler and pushed in before each update.
pub struct CandleOptimizer {
    optimizer: AdamW,
    vars: Vec<Var>,
    grad_clip_max_norm: f64,
    pending: Option<GradStore>,
    last_grad_norm: Option<f64>,
}

impl CandleOptimizer {
    pub fn new(
        varmap: &VarMap,
        lr: f64,
        weight_decay: f64,
        grad_clip_max_norm: f64,
    ) -> candle_core::Result<Self> {
        let vars = varmap.all_vars();
        let optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr,
                weight_decay,
                ..Default::default()
            },
        )?;
        Ok(Self {
            optimizer,
            vars,
            grad_clip_max_norm,
            pending: None,
            last_grad_norm: None,
        })
    }

    pub fn from_config(varmap: &VarMap, config: &TrainConfig) -> candle_core::Result<Self> {
        Self::new(
            varmap,
            config.base_lr,
            config.weight_decay,
            config.grad_clip_max_norm,
        )
    }

    /// Pre-clip global gradient norm of the last update (when clipping is on).
    pub fn last_grad_norm(&self) -> Option<f64> {
        self.last_grad_norm
    }
}

impl LearningRate for CandleOptimizer {
    fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.optimizer.set_learning_rate(lr);
    }
}

impl OptimizerLike<Tensor> for CandleOptimizer {
    fn backward(&mut self, loss: &Tensor) -> anyhow::Result<()> {
        self.pending = Some(loss.backward()?);
        Ok(())
    }

    fn step(&mut self) -> anyhow::Result<()> {
        let mut grads = self
            .pending
            .take()
            .ok_or_else(|| anyhow::anyhow!("optimizer step without a preceding backward"))?;
        if self.grad_clip_max_norm > 0.0 {
            let norm = clip_grad_norm(&mut grads, &self.vars, self.grad_clip_max_norm)?;
            self.last_grad_norm = Some(norm);
        }
        self.optimizer.step(&grads)?;
        Ok(())
    }
}

/// Clip gradients so their global L2 norm ≤ `max_norm`. Returns the norm
/// before clipping.
fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> anyhow::Result<f64> {
    let mut total = 0.0f64;
    for var in vars {
        if let Some(g) = grads.get(var.as_tensor()) {
            total += g.sqr()?.sum_all()?.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        }
    }
    let norm = total.sqrt();
    if !norm.is_finite() {
        anyhow::bail!("gradient norm is {norm}");
    }
    if norm > max_norm {
        let scale = max_norm / norm.max(1e-12);
        for var in vars {
            if let Some(g) = grads.remove(var.as_tensor()) {
                grads.insert(var.as_tensor(), g.affine(scale, 0.0)?);
            }
        }
    }
    Ok(norm)
}

// ── Loss ────────────────────────────────────────────────────────────────────

/// Label-smoothed cross entropy averaged over non-pad target positions.
///
/// `logits` is `(batch, tgt_len, vocab)`, `targets` is `(batch, tgt_len)`.
/// Per token the loss is `(1-ε)·NLL + ε·mean_v(−log p_v)`.
pub fn translation_loss(
    logits: &Tensor,
    targets: &Tensor,
    pad_id: u32,
    smoothing: f64,
) -> candle_core::Result<Tensor> {
    let (b, t, v) = logits.dims3()?;
    let logits = logits.reshape((b * t, v))?;
    let targets = targets.reshape((b * t,))?.to_dtype(DType::U32)?;

    let log_probs = ops::log_softmax(&logits, D::Minus1)?;
    let nll = log_probs
        .gather(&targets.unsqueeze(1)?, 1)?
        .squeeze(1)?
        .neg()?;
    let per_token = if smoothing > 0.0 {
        let uniform = log_probs.mean(1)?.neg()?;
        ((nll * (1.0 - smoothing))? + (uniform * smoothing)?)?
    } else {
        nll
    };

    let mask = targets.ne(pad_id)?.to_dtype(per_token.dtype())?;
    let total = (per_token * &mask)?.sum_all()?;
    let count = mask.sum_all()?.maximum(1.0)?;
    total / count
}

// ── Tests ───────────────────────────────────────────────────────────────────
