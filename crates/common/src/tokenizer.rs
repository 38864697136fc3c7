//! Tokeniser capability and a thin wrapper over Hugging Face `tokenizers`.
//!
//! The data pipeline only needs [`TokenizerLike`]; anything that can turn a
//! sentence into ids and back (a pretrained `tokenizer.json`, a test stub)
//! plugs in there.

use std::path::Path;

use anyhow::Context;
use tokenizers::models::bpe::{BpeTrainerBuilder, BPE};
use tokenizers::normalizers::{strip::Strip, unicode::NFC, utils::Sequence};
use tokenizers::pre_tokenizers::byte_level::ByteLevel;
use tokenizers::{AddedToken, TokenizerBuilder};

pub const PAD_TOKEN: &str = "<pad>";
pub const BOS_TOKEN: &str = "<bos>";
pub const EOS_TOKEN: &str = "<eos>";
pub const UNK_TOKEN: &str = "<unk>";

/// Minimal tokeniser surface used by batching.
///
/// `encode` must not add special tokens; the dataset wraps every sentence in
/// `<bos> … <eos>` itself.
pub trait TokenizerLike {
    fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>>;
    fn decode(&self, ids: &[u32]) -> anyhow::Result<String>;
    fn vocab_size(&self) -> usize;
    fn pad_id(&self) -> u32;
    fn bos_id(&self) -> u32;
    fn eos_id(&self) -> u32;
}

// ── HfTokenizer ─────────────────────────────────────────────────────────────

/// A `tokenizer.json` loaded through the `tokenizers` crate.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    pad_id: u32,
    bos_id: u32,
    eos_id: u32,
}

impl HfTokenizer {
    /// Load from `tokenizer.json`. Special ids are resolved by token text and
    /// fall back to 0 / 1 / 2 when the vocabulary does not define them.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| anyhow::anyhow!("load tokenizer {}: {e}", path.display()))?;
        Ok(Self::from_inner(inner))
    }

    pub fn from_inner(inner: tokenizers::Tokenizer) -> Self {
        let pad_id = inner.token_to_id(PAD_TOKEN).unwrap_or(0);
        let bos_id = inner.token_to_id(BOS_TOKEN).unwrap_or(1);
        let eos_id = inner.token_to_id(EOS_TOKEN).unwrap_or(2);
        Self {
            inner,
            pad_id,
            bos_id,
            eos_id,
        }
    }

    pub fn inner(&self) -> &tokenizers::Tokenizer {
        &self.inner
    }
}

impl TokenizerLike for HfTokenizer {
    fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        let enc = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("tokenize: {e}"))?;
        Ok(enc.get_ids().to_vec())
    }

    fn decode(&self, ids: &[u32]) -> anyhow::Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| anyhow::anyhow!("detokenize: {e}"))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn pad_id(&self) -> u32 {
        self.pad_id
    }

    fn bos_id(&self) -> u32 {
        self.bos_id
    }

    fn eos_id(&self) -> u32 {
        self.eos_id
    }
}

// ── BPE training ────────────────────────────────────────────────────────────

/// Settings for [`train_bpe`].
#[derive(Debug, Clone)]
pub struct BpeTrainerConfig {
    pub vocab_size: usize,
    pub min_frequency: u64,
    pub special_tokens: Vec<String>,
}

impl Default for BpeTrainerConfig {
    fn default() -> Self {
        Self {
            vocab_size: 16_000,
            min_frequency: 2,
            special_tokens: [PAD_TOKEN, BOS_TOKEN, EOS_TOKEN, UNK_TOKEN]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Train a byte-level BPE tokeniser on `texts` and save it to `output`.
///
/// Special tokens are inserted first, so with the default config `<pad>`,
/// `<bos>`, `<eos>` get the lowest ids.
pub fn train_bpe<I, S>(
    texts: I,
    config: &BpeTrainerConfig,
    output: &Path,
) -> anyhow::Result<HfTokenizer>
where
    I: Iterator<Item = S> + Send,
    S: AsRef<str> + Send,
{
    let special_tokens: Vec<AddedToken> = config
        .special_tokens
        .iter()
        .map(|s| AddedToken::from(s.clone(), true))
        .collect();

    let mut trainer = BpeTrainerBuilder::new()
        .show_progress(false)
        .vocab_size(config.vocab_size)
        .min_frequency(config.min_frequency)
        .special_tokens(special_tokens)
        .build();

    let mut tokenizer = TokenizerBuilder::new()
        .with_model(BPE::default())
        .with_normalizer(Some(Sequence::new(vec![
            Strip::new(true, true).into(),
            NFC.into(),
        ])))
        .with_pre_tokenizer(Some(ByteLevel::default()))
        .with_post_processor(Some(ByteLevel::default()))
        .with_decoder(Some(ByteLevel::default()))
        .build()
        .map_err(|e| anyhow::anyhow!("build tokenizer: {e}"))?;

    tokenizer
        .train(&mut trainer, texts)
        .map_err(|e| anyhow::anyhow!("train tokenizer: {e}"))?;

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("create tokenizer dir")?;
        }
    }
    tokenizer
        .save(output, false)
        .map_err(|e| anyhow::anyhow!("save tokenizer {}: {e}", output.display()))?;

    tracing::info!(
        vocab_size = tokenizer.get_vocab_size(true),
        path = %output.display(),
        "Trained BPE tokenizer"
    );

    HfTokenizer::from_file(output)
}

// ── Tests ───────────────────────────────────────────────────────────────────
