//! Example: drive the epoch loop end to end with a bigram decoder baseline.
//!
//! The model only predicts the next target token from the current one, which
//! is enough to watch the warmup/cosine schedule, checkpointing and loss
//! reporting on real data.
//!
//! Prerequisites (optional, a synthetic corpus is used otherwise):
//!   `zhmt tokenize --corpus data/train.jsonl --src-tokenizer en.json --tgt-tokenizer zh.json --output data/train.zhp`
//!
//! Run:
//!   cargo run -p zhmt-train --example train_bigram -- --cache data/train.zhp --config config.json

use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{DType, Device, Tensor};
use candle_nn::{embedding, linear, Embedding, Linear, Module, VarBuilder, VarMap};
use clap::Parser;

use zhmt_common::{
    MmapPairs, PairBatch, Prefetched, TokenizedPair, TrainConfig, TranslationDataset,
    PREFETCH_BUFFER,
};
use zhmt_train::{
    translation_loss, CandleOptimizer, Checkpointable, DriverConfig, EpochDriver,
    FileCheckpointStore, LrScheduler, ModelLike, ScheduleConfig,
};

#[derive(Parser, Debug)]
struct Args {
    /// Training config; created with defaults when missing.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// ZHP1 cache from `zhmt tokenize`. A synthetic corpus is used without it.
    #[arg(long)]
    cache: Option<PathBuf>,
    /// Overrides `output_dir` from the config.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    #[arg(long, default_value = "64")]
    hidden: usize,
}

struct BigramDecoder {
    varmap: VarMap,
    emb: Embedding,
    head: Linear,
    device: Device,
}

impl BigramDecoder {
    fn new(vocab_size: usize, hidden: usize, device: &Device) -> candle_core::Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        Ok(Self {
            emb: embedding(vocab_size, hidden, vb.pp("emb"))?,
            head: linear(hidden, vocab_size, vb.pp("head"))?,
            varmap,
            device: device.clone(),
        })
    }
}

impl ModelLike for BigramDecoder {
    type Batch = PairBatch;
    type Output = Tensor;

    fn set_training(&mut self, _training: bool) {}

    fn forward(&mut self, batch: &PairBatch) -> anyhow::Result<Tensor> {
        let t = batch.to_tensors(&self.device)?;
        Ok(self.head.forward(&self.emb.forward(&t.tgt_in)?)?)
    }
}

impl Checkpointable for BigramDecoder {
    fn save_weights(&self, path: &Path) -> anyhow::Result<()> {
        self.varmap.save_weights(path)
    }
}

/// Counting sequences: target is the source shifted by one id.
fn synthetic_pairs() -> Vec<TokenizedPair> {
    (0..512u32)
        .map(|i| {
            let len = 3 + i % 8;
            let src: Vec<u32> = (0..len).map(|k| 3 + (i + k) % 60).collect();
            let tgt = src.iter().map(|&t| t + 1).collect::<Vec<_>>();
            TokenizedPair {
                src: [vec![1], src, vec![2]].concat(),
                tgt: [vec![1], tgt, vec![2]].concat(),
            }
        })
        .collect()
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut config = if args.config.exists() {
        TrainConfig::load(&args.config)?
    } else {
        let default = TrainConfig::default();
        default.save(&args.config)?;
        eprintln!("Created default config at {}", args.config.display());
        default
    };
    if let Some(dir) = args.output_dir {
        config.output_dir = dir;
    }
    config.validate()?;

    let dataset = match &args.cache {
        Some(path) => MmapPairs::open(path)
            .with_context(|| format!("open cache {}", path.display()))?
            .to_dataset(config.batch_size),
        None => TranslationDataset::from_tokenized(synthetic_pairs(), 0, 0, config.batch_size),
    };
    if dataset.is_empty() {
        anyhow::bail!("no training pairs");
    }
    let vocab_size = dataset
        .pairs()
        .iter()
        .flat_map(|p| p.tgt.iter())
        .max()
        .map_or(4, |&m| m as usize + 1);
    let batches_per_epoch = dataset.num_batches();
    eprintln!(
        "{} pairs, {} batches/epoch, vocab {}",
        dataset.len(),
        batches_per_epoch,
        vocab_size
    );

    let device = Device::cuda_if_available(0)?;
    let mut model = BigramDecoder::new(vocab_size, args.hidden, &device)?;
    let mut optimizer = CandleOptimizer::from_config(&model.varmap, &config)?;
    let mut store = FileCheckpointStore::new(&config.output_dir, config.keep_checkpoints);
    let mut source = Prefetched::new(dataset, PREFETCH_BUFFER);

    let schedule = ScheduleConfig::from_train_config(&config, batches_per_epoch);
    let scheduler = LrScheduler::new(config.base_lr, schedule)?;
    let mut driver = EpochDriver::new(DriverConfig::from(&config), scheduler);

    let smoothing = config.label_smoothing;
    let device_for_loss = device.clone();
    let mut loss_fn = move |logits: &Tensor, batch: &PairBatch| -> anyhow::Result<Tensor> {
        let targets = batch.to_tensors(&device_for_loss)?.tgt_out;
        Ok(translation_loss(logits, &targets, batch.tgt_pad, smoothing)?)
    };

    let report = driver.run(
        &mut model,
        &mut source,
        &mut loss_fn,
        &mut optimizer,
        &mut store,
    )?;

    for e in &report.epochs {
        eprintln!(
            "epoch {:>3}: {} batches, mean loss {:.4}, lr {:.3e}",
            e.epoch, e.batches, e.mean_loss, e.last_lr
        );
    }
    eprintln!(
        "{:?} after {} steps; checkpoints in {}",
        report.state,
        report.global_step,
        config.output_dir.display()
    );
    Ok(())
}
