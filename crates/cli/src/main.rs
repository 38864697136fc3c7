use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use zhmt_common::{
    read_pairs, train_bpe, BpeTrainerConfig, HfTokenizer, MmapPairs, Side, TokenizerLike,
    TrainConfig, TranslationDataset,
};
use zhmt_train::{LrScheduler, ScheduleConfig};

#[derive(Parser, Debug)]
#[command(name = "zhmt", about = "English→Chinese translation training toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the learning-rate curve for a config as CSV.
    Schedule(ScheduleArgs),
    /// Train a byte-level BPE tokenizer on one side of a parallel corpus.
    TrainTokenizer(TrainTokenizerArgs),
    /// Tokenise a parallel corpus into a .zhp mmap cache.
    Tokenize(TokenizeArgs),
    /// Corpus / cache statistics and the derived step counts.
    Inspect(InspectArgs),
    /// Write the default training config as JSON.
    InitConfig(InitConfigArgs),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Lang {
    En,
    Zh,
}

impl From<Lang> for Side {
    fn from(lang: Lang) -> Self {
        match lang {
            Lang::En => Side::English,
            Lang::Zh => Side::Chinese,
        }
    }
}

// ── Schedule ───────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct ScheduleArgs {
    /// Training config (defaults are used when omitted).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Optimiser steps per epoch; needed when the config leaves total_steps at 0.
    #[arg(long)]
    batches_per_epoch: Option<usize>,
    #[arg(long)]
    base_lr: Option<f64>,
    #[arg(long)]
    warmup_steps: Option<usize>,
    #[arg(long)]
    total_steps: Option<usize>,
    #[arg(long)]
    num_cycles: Option<f64>,
    #[arg(long)]
    epochs: Option<usize>,
    /// Emit one row every N steps (the last step is always included).
    #[arg(long, default_value = "100")]
    every: usize,
    /// Write the CSV here instead of stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

// ── Tokenizer ──────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct TrainTokenizerArgs {
    /// JSONL (`{"english": …, "chinese": …}`) or tab-separated corpus.
    #[arg(long)]
    corpus: PathBuf,
    #[arg(long, value_enum)]
    lang: Lang,
    #[arg(long)]
    output: PathBuf,
    #[arg(long, default_value = "16000")]
    vocab_size: usize,
    #[arg(long, default_value = "2")]
    min_frequency: u64,
    /// Read at most this many pairs.
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Parser, Debug)]
struct TokenizeArgs {
    #[arg(long)]
    corpus: PathBuf,
    #[arg(long)]
    src_tokenizer: PathBuf,
    #[arg(long)]
    tgt_tokenizer: PathBuf,
    #[arg(long)]
    output: PathBuf,
    #[arg(long, default_value = "72")]
    max_length: usize,
    #[arg(long)]
    limit: Option<usize>,
}

// ── Inspect / config ───────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
struct InspectArgs {
    /// Raw parallel corpus.
    #[arg(long, conflicts_with = "cache", required_unless_present = "cache")]
    corpus: Option<PathBuf>,
    /// Tokenised .zhp cache written by `zhmt tokenize`.
    #[arg(long)]
    cache: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    batch_size: Option<usize>,
}

#[derive(Parser, Debug)]
struct InitConfigArgs {
    #[arg(long, default_value = "config.json")]
    output: PathBuf,
    /// Overwrite an existing file.
    #[arg(long)]
    force: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Schedule(args) => cmd_schedule(args),
        Command::TrainTokenizer(args) => cmd_train_tokenizer(args),
        Command::Tokenize(args) => cmd_tokenize(args),
        Command::Inspect(args) => cmd_inspect(args),
        Command::InitConfig(args) => cmd_init_config(args),
    }
}

fn load_config(path: Option<&Path>) -> Result<TrainConfig> {
    match path {
        Some(p) => TrainConfig::load(p),
        None => Ok(TrainConfig::default()),
    }
}

fn cmd_schedule(args: ScheduleArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(v) = args.base_lr {
        config.base_lr = v;
    }
    if let Some(v) = args.warmup_steps {
        config.warmup_steps = v;
    }
    if let Some(v) = args.total_steps {
        config.total_steps = v;
    }
    if let Some(v) = args.num_cycles {
        config.num_cycles = v;
    }
    if let Some(v) = args.epochs {
        config.epochs = v;
    }
    config.validate()?;

    if config.total_steps == 0 && args.batches_per_epoch.is_none() {
        anyhow::bail!("total_steps is 0 in the config; pass --total-steps or --batches-per-epoch");
    }
    let schedule =
        ScheduleConfig::from_train_config(&config, args.batches_per_epoch.unwrap_or(0));
    // Validates the schedule and base_lr together.
    let scheduler = LrScheduler::new(config.base_lr, schedule)?;

    let mut out: Box<dyn Write> = match &args.output {
        Some(path) => Box::new(std::io::BufWriter::new(
            std::fs::File::create(path).with_context(|| format!("create {}", path.display()))?,
        )),
        None => Box::new(std::io::stdout().lock()),
    };
    writeln!(out, "step,multiplier,lr")?;
    for (step, lr) in schedule.curve(scheduler.base_lr(), args.every) {
        writeln!(out, "{step},{:.6},{lr:.6e}", schedule.multiplier(step))?;
    }
    out.flush()?;

    eprintln!(
        "Schedule: warmup {} / total {} steps, {} cycles, base lr {:.2e}",
        schedule.warmup_steps, schedule.total_steps, schedule.num_cycles, config.base_lr
    );
    if let Some(path) = &args.output {
        eprintln!("Wrote curve to {}", path.display());
    }
    Ok(())
}

fn cmd_train_tokenizer(args: TrainTokenizerArgs) -> Result<()> {
    let (pairs, stats) = read_pairs(&args.corpus, args.limit)?;
    if pairs.is_empty() {
        anyhow::bail!("no sentence pairs in {}", args.corpus.display());
    }
    tracing::info!(pairs = stats.pairs, skipped = stats.skipped, "Read corpus");

    let side = Side::from(args.lang);
    let config = BpeTrainerConfig {
        vocab_size: args.vocab_size,
        min_frequency: args.min_frequency,
        ..Default::default()
    };
    let tokenizer = train_bpe(pairs.iter().map(|p| p.side(side)), &config, &args.output)?;
    eprintln!(
        "Trained {:?} tokenizer: {} tokens, saved to {}",
        side,
        tokenizer.vocab_size(),
        args.output.display()
    );
    Ok(())
}

fn cmd_tokenize(args: TokenizeArgs) -> Result<()> {
    let src_tok = HfTokenizer::from_file(&args.src_tokenizer)?;
    let tgt_tok = HfTokenizer::from_file(&args.tgt_tokenizer)?;
    let (pairs, stats) = read_pairs(&args.corpus, args.limit)?;
    tracing::info!(pairs = stats.pairs, skipped = stats.skipped, "Read corpus");

    let dataset = TranslationDataset::from_pairs(&pairs, &src_tok, &tgt_tok, args.max_length, 1)?;
    dataset.write_tokenized(&args.output)?;
    eprintln!(
        "Wrote {} pairs ({} skipped lines) to {}",
        dataset.len(),
        stats.skipped,
        args.output.display()
    );
    eprintln!("Inspect with: zhmt inspect --cache {}", args.output.display());
    Ok(())
}

fn cmd_inspect(args: InspectArgs) -> Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(b) = args.batch_size {
        config.batch_size = b;
    }
    config.validate()?;

    let num_pairs = if let Some(cache) = &args.cache {
        let mmap = MmapPairs::open(cache)?;
        let dataset = mmap.to_dataset(config.batch_size);
        let (src_tokens, tgt_tokens) = dataset
            .pairs()
            .iter()
            .fold((0usize, 0usize), |(s, t), p| (s + p.src.len(), t + p.tgt.len()));
        let n = dataset.len().max(1) as f64;
        eprintln!("Cache {}: {} pairs", cache.display(), dataset.len());
        eprintln!(
            "  mean tokens/pair: src {:.1}, tgt {:.1}",
            src_tokens as f64 / n,
            tgt_tokens as f64 / n
        );
        dataset.len()
    } else if let Some(corpus) = &args.corpus {
        let (pairs, stats) = read_pairs(corpus, None)?;
        eprintln!(
            "Corpus {}: {} lines, {} pairs, {} skipped",
            corpus.display(),
            stats.lines,
            stats.pairs,
            stats.skipped
        );
        pairs.len()
    } else {
        anyhow::bail!("pass --corpus or --cache");
    };

    let batches_per_epoch = num_pairs.div_ceil(config.batch_size);
    let schedule = ScheduleConfig::from_train_config(&config, batches_per_epoch);
    eprintln!(
        "  batch size {} → {} batches/epoch, {} epochs",
        config.batch_size, batches_per_epoch, config.epochs
    );
    eprintln!(
        "  total steps {} (warmup {}), lr at end of warmup {:.2e}",
        schedule.total_steps,
        schedule.warmup_steps,
        config.base_lr * schedule.multiplier(schedule.warmup_steps)
    );
    if let Err(e) = schedule.validate() {
        tracing::warn!(error = %e, "Schedule would be rejected by the trainer");
    }
    Ok(())
}

fn cmd_init_config(args: InitConfigArgs) -> Result<()> {
    if args.output.exists() && !args.force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            args.output.display()
        );
    }
    TrainConfig::default().save(&args.output)?;
    eprintln!("Wrote default config to {}", args.output.display());
    Ok(())
}
