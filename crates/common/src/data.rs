//! Data pipeline: tokenised sentence pairs, padding, batching, prefetch.
//!
//! * **[`TranslationDataset`]** — tokenised pairs in memory; every sentence is
//!   wrapped in `<bos> … <eos>` and truncated to `max_length`.
//! * **[`PairBatch`]** — right-padded `src` / `tgt_in` / `tgt_out` rows.
//! * **[`MmapPairs`]** — read back a `ZHP1` tokenised cache via `memmap2`.
//! * **[`Prefetched`]** — run any cloneable [`BatchSource`] on a producer
//!   thread behind a bounded channel; order is preserved.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Context;
use candle_core::{Device, Tensor};
use memmap2::Mmap;

use crate::corpus::SentencePair;
use crate::tokenizer::TokenizerLike;

// ── BatchSource ─────────────────────────────────────────────────────────────

/// A lazy, finite, restartable sequence of batches.
///
/// `batches` is called once per epoch (1-based `epoch`) and must yield the
/// batches of that epoch in order.
pub trait BatchSource {
    type Batch;

    fn batches(
        &mut self,
        epoch: usize,
    ) -> anyhow::Result<Box<dyn Iterator<Item = anyhow::Result<Self::Batch>> + '_>>;

    /// Number of batches per epoch, if known up front.
    fn batches_per_epoch(&self) -> Option<usize> {
        None
    }
}

// ── Tokenised pairs ─────────────────────────────────────────────────────────

/// One sentence pair as token ids, both sides already `<bos> … <eos>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedPair {
    pub src: Vec<u32>,
    pub tgt: Vec<u32>,
}

/// Encode `text` and wrap it as `<bos> ids <eos>`, keeping at most
/// `max_length` ids in total.
pub fn encode_wrapped(
    tokenizer: &impl TokenizerLike,
    text: &str,
    max_length: usize,
) -> anyhow::Result<Vec<u32>> {
    let mut ids = tokenizer.encode(text)?;
    ids.truncate(max_length.saturating_sub(2));
    let mut out = Vec::with_capacity(ids.len() + 2);
    out.push(tokenizer.bos_id());
    out.extend(ids);
    out.push(tokenizer.eos_id());
    Ok(out)
}

// ── PairBatch ───────────────────────────────────────────────────────────────

/// A padded batch ready for a seq2seq model.
///
/// `tgt_in` is the target without its last token (decoder input), `tgt_out`
/// the target without its first token (what the decoder must predict).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairBatch {
    pub batch_size: usize,
    pub src_len: usize,
    pub tgt_len: usize,
    pub src: Vec<u32>,
    pub tgt_in: Vec<u32>,
    pub tgt_out: Vec<u32>,
    /// Non-pad tokens in `tgt_out`; the loss normaliser.
    pub ntokens: usize,
    pub src_pad: u32,
    pub tgt_pad: u32,
}

/// Candle view of a [`PairBatch`]. Masks are `1` for real tokens, `0` for pad.
pub struct BatchTensors {
    pub src: Tensor,
    pub tgt_in: Tensor,
    pub tgt_out: Tensor,
    pub src_mask: Tensor,
    pub tgt_mask: Tensor,
}

impl PairBatch {
    /// Right-pad a group of pairs to the longest row on each side.
    pub fn collate(pairs: &[TokenizedPair], src_pad: u32, tgt_pad: u32) -> Self {
        let batch_size = pairs.len();
        let src_len = pairs.iter().map(|p| p.src.len()).max().unwrap_or(0);
        let tgt_len = pairs
            .iter()
            .map(|p| p.tgt.len().saturating_sub(1))
            .max()
            .unwrap_or(0);

        let mut src = Vec::with_capacity(batch_size * src_len);
        let mut tgt_in = Vec::with_capacity(batch_size * tgt_len);
        let mut tgt_out = Vec::with_capacity(batch_size * tgt_len);
        let mut ntokens = 0;

        for pair in pairs {
            src.extend_from_slice(&pair.src);
            src.resize(src.len() + src_len - pair.src.len(), src_pad);

            let n = pair.tgt.len().saturating_sub(1);
            if n > 0 {
                tgt_in.extend_from_slice(&pair.tgt[..n]);
                tgt_out.extend_from_slice(&pair.tgt[1..]);
            }
            ntokens += n;
            tgt_in.resize(tgt_in.len() + tgt_len - n, tgt_pad);
            tgt_out.resize(tgt_out.len() + tgt_len - n, tgt_pad);
        }

        Self {
            batch_size,
            src_len,
            tgt_len,
            src,
            tgt_in,
            tgt_out,
            ntokens,
            src_pad,
            tgt_pad,
        }
    }

    pub fn to_tensors(&self, device: &Device) -> candle_core::Result<BatchTensors> {
        let src_shape = (self.batch_size, self.src_len);
        let tgt_shape = (self.batch_size, self.tgt_len);
        let src_mask: Vec<u8> = self.src.iter().map(|&t| u8::from(t != self.src_pad)).collect();
        let tgt_mask: Vec<u8> = self
            .tgt_in
            .iter()
            .map(|&t| u8::from(t != self.tgt_pad))
            .collect();
        Ok(BatchTensors {
            src: Tensor::from_vec(self.src.clone(), src_shape, device)?,
            tgt_in: Tensor::from_vec(self.tgt_in.clone(), tgt_shape, device)?,
            tgt_out: Tensor::from_vec(self.tgt_out.clone(), tgt_shape, device)?,
            src_mask: Tensor::from_vec(src_mask, src_shape, device)?,
            tgt_mask: Tensor::from_vec(tgt_mask, tgt_shape, device)?,
        })
    }
}

// ── TranslationDataset ──────────────────────────────────────────────────────

/// Tokenised parallel corpus held in memory. Cheap to clone.
#[derive(Debug, Clone)]
pub struct TranslationDataset {
    pairs: Arc<[TokenizedPair]>,
    batch_size: usize,
    src_pad: u32,
    tgt_pad: u32,
}

impl TranslationDataset {
    /// Tokenise `pairs` with one tokenizer per language.
    pub fn from_pairs(
        pairs: &[SentencePair],
        src_tokenizer: &impl TokenizerLike,
        tgt_tokenizer: &impl TokenizerLike,
        max_length: usize,
        batch_size: usize,
    ) -> anyhow::Result<Self> {
        let tokenized = pairs
            .iter()
            .map(|p| {
                Ok(TokenizedPair {
                    src: encode_wrapped(src_tokenizer, &p.english, max_length)?,
                    tgt: encode_wrapped(tgt_tokenizer, &p.chinese, max_length)?,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self::from_tokenized(
            tokenized,
            src_tokenizer.pad_id(),
            tgt_tokenizer.pad_id(),
            batch_size,
        ))
    }

    pub fn from_tokenized(
        pairs: Vec<TokenizedPair>,
        src_pad: u32,
        tgt_pad: u32,
        batch_size: usize,
    ) -> Self {
        Self {
            pairs: pairs.into(),
            batch_size: batch_size.max(1),
            src_pad,
            tgt_pad,
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[TokenizedPair] {
        &self.pairs
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn pad_ids(&self) -> (u32, u32) {
        (self.src_pad, self.tgt_pad)
    }

    /// Batches per epoch; the last partial batch counts.
    pub fn num_batches(&self) -> usize {
        self.pairs.len().div_ceil(self.batch_size)
    }

    /// Batches in corpus order.
    pub fn iter_batches(&self) -> impl Iterator<Item = PairBatch> + '_ {
        self.pairs
            .chunks(self.batch_size)
            .map(|chunk| PairBatch::collate(chunk, self.src_pad, self.tgt_pad))
    }

    /// Write the `ZHP1` cache read back by [`MmapPairs`].
    pub fn write_tokenized(&self, path: &Path) -> anyhow::Result<()> {
        write_tokenized_pairs(path, &self.pairs, self.src_pad, self.tgt_pad)
    }
}

impl BatchSource for TranslationDataset {
    type Batch = PairBatch;

    fn batches(
        &mut self,
        _epoch: usize,
    ) -> anyhow::Result<Box<dyn Iterator<Item = anyhow::Result<PairBatch>> + '_>> {
        Ok(Box::new(self.iter_batches().map(Ok)))
    }

    fn batches_per_epoch(&self) -> Option<usize> {
        Some(self.num_batches())
    }
}

// ── Tokenised cache format ──────────────────────────────────────────────────

/// Magic bytes for the tokenised pair cache.
const PAIRS_MAGIC: &[u8; 4] = b"ZHP1";
/// Header: magic (4) + num_pairs (8) + src_pad (4) + tgt_pad (4).
const PAIRS_HEADER_LEN: usize = 4 + 8 + 4 + 4;

/// Write tokenised pairs to a binary cache.
///
/// Layout (all little-endian): magic `ZHP1`, `num_pairs: u64`,
/// `src_pad: u32`, `tgt_pad: u32`, then per pair `src_len: u32`,
/// `tgt_len: u32`, `src_len` × u32, `tgt_len` × u32.
pub fn write_tokenized_pairs(
    path: &Path,
    pairs: &[TokenizedPair],
    src_pad: u32,
    tgt_pad: u32,
) -> anyhow::Result<()> {
    let file = File::create(path).context("create tokenized pairs file")?;
    let mut w = BufWriter::new(file);
    w.write_all(PAIRS_MAGIC)?;
    w.write_all(&(pairs.len() as u64).to_le_bytes())?;
    w.write_all(&src_pad.to_le_bytes())?;
    w.write_all(&tgt_pad.to_le_bytes())?;
    for pair in pairs {
        w.write_all(&(pair.src.len() as u32).to_le_bytes())?;
        w.write_all(&(pair.tgt.len() as u32).to_le_bytes())?;
        for &id in pair.src.iter().chain(&pair.tgt) {
            w.write_all(&id.to_le_bytes())?;
        }
    }
    let file = w.into_inner().context("flush tokenized pairs file")?;
    file.sync_all().context("sync tokenized pairs file")?;
    Ok(())
}

/// Memory-mapped view over a `ZHP1` cache.
///
/// Opening scans the record headers once to build an offset index; token ids
/// are read from the mapping on demand.
pub struct MmapPairs {
    mmap: Mmap,
    offsets: Vec<usize>,
    src_pad: u32,
    tgt_pad: u32,
}

impl MmapPairs {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path).context("open tokenized pairs file")?;
        // SAFETY: the file is opened read-only and not mutated while mapped.
        let mmap = unsafe { Mmap::map(&file).context("mmap tokenized pairs file")? };
        if mmap.len() < PAIRS_HEADER_LEN {
            anyhow::bail!("tokenized pairs file too short");
        }
        if &mmap[0..4] != PAIRS_MAGIC {
            anyhow::bail!("invalid tokenized pairs file: bad magic");
        }
        let mut count = [0u8; 8];
        count.copy_from_slice(&mmap[4..12]);
        let num_pairs = u64::from_le_bytes(count);
        // Every record carries at least its two length fields.
        let max_pairs = ((mmap.len() - PAIRS_HEADER_LEN) / 8) as u64;
        if num_pairs > max_pairs {
            anyhow::bail!(
                "tokenized pairs file claims {num_pairs} pairs but holds at most {max_pairs}"
            );
        }
        let num_pairs = num_pairs as usize;
        let src_pad = read_u32(&mmap, 12)?;
        let tgt_pad = read_u32(&mmap, 16)?;

        let mut offsets = Vec::with_capacity(num_pairs);
        let mut pos = PAIRS_HEADER_LEN;
        for i in 0..num_pairs {
            let src_len = read_u32(&mmap, pos)? as usize;
            let tgt_len = read_u32(&mmap, pos + 4)? as usize;
            offsets.push(pos);
            pos = src_len
                .checked_add(tgt_len)
                .and_then(|n| n.checked_mul(4))
                .and_then(|n| n.checked_add(8))
                .and_then(|n| pos.checked_add(n))
                .ok_or_else(|| anyhow::anyhow!("tokenized pairs file: pair {i} length overflows"))?;
            if pos > mmap.len() {
                anyhow::bail!(
                    "tokenized pairs file truncated at pair {i}: need {pos} bytes, have {}",
                    mmap.len()
                );
            }
        }

        Ok(Self {
            mmap,
            offsets,
            src_pad,
            tgt_pad,
        })
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Pair `index`, or `None` when out of range.
    pub fn get(&self, index: usize) -> Option<TokenizedPair> {
        let pos = *self.offsets.get(index)?;
        let src_len = read_u32(&self.mmap, pos).ok()? as usize;
        let tgt_len = read_u32(&self.mmap, pos + 4).ok()? as usize;
        let ids = |start: usize, n: usize| -> Option<Vec<u32>> {
            (0..n).map(|k| read_u32(&self.mmap, start + k * 4).ok()).collect()
        };
        let src_start = pos + 8;
        let tgt_start = src_start + src_len * 4;
        Some(TokenizedPair {
            src: ids(src_start, src_len)?,
            tgt: ids(tgt_start, tgt_len)?,
        })
    }

    /// Materialise the cache as a [`TranslationDataset`].
    pub fn to_dataset(&self, batch_size: usize) -> TranslationDataset {
        let pairs = (0..self.len()).filter_map(|i| self.get(i)).collect();
        TranslationDataset::from_tokenized(pairs, self.src_pad, self.tgt_pad, batch_size)
    }
}

fn read_u32(bytes: &[u8], at: usize) -> anyhow::Result<u32> {
    let b = bytes
        .get(at..at + 4)
        .ok_or_else(|| anyhow::anyhow!("read past end of tokenized pairs file at {at}"))?;
    Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

// ── Prefetch ────────────────────────────────────────────────────────────────

/// Default number of batches buffered ahead of the training loop.
pub const PREFETCH_BUFFER: usize = 8;

/// Wraps a cloneable [`BatchSource`] so each epoch's batches are produced on
/// a background thread. The consumer still sees them strictly in order.
pub struct Prefetched<S> {
    source: S,
    buffer: usize,
}

impl<S> Prefetched<S> {
    pub fn new(source: S, buffer: usize) -> Self {
        Self {
            source,
            buffer: buffer.max(1),
        }
    }

    pub fn inner(&self) -> &S {
        &self.source
    }
}

impl<S> BatchSource for Prefetched<S>
where
    S: BatchSource + Clone + Send + 'static,
    S::Batch: Send + 'static,
{
    type Batch = S::Batch;

    fn batches(
        &mut self,
        epoch: usize,
    ) -> anyhow::Result<Box<dyn Iterator<Item = anyhow::Result<S::Batch>> + '_>> {
        let (tx, rx) = mpsc::sync_channel(self.buffer);
        let mut source = self.source.clone();
        let producer = thread::Builder::new()
            .name(format!("prefetch-epoch-{epoch}"))
            .spawn(move || {
                let iter = match source.batches(epoch) {
                    Ok(iter) => iter,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                for item in iter {
                    let failed = item.is_err();
                    if tx.send(item).is_err() || failed {
                        return;
                    }
                }
            })
            .context("spawn prefetch thread")?;
        Ok(Box::new(PrefetchIter {
            rx: Some(rx),
            producer: Some(producer),
        }))
    }

    fn batches_per_epoch(&self) -> Option<usize> {
        self.source.batches_per_epoch()
    }
}

struct PrefetchIter<B> {
    rx: Option<Receiver<anyhow::Result<B>>>,
    producer: Option<JoinHandle<()>>,
}

impl<B> Iterator for PrefetchIter<B> {
    type Item = anyhow::Result<B>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.as_ref()?.recv().ok()
    }
}

impl<B> Drop for PrefetchIter<B> {
    fn drop(&mut self) {
        // Disconnect first so a blocked producer wakes up and exits.
        self.rx.take();
        if let Some(handle) = self.producer.take() {
            if handle.join().is_err() {
                tracing::warn!("prefetch producer panicked");
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// One id per char; 0/1/2 reserved for pad/bos/eos.
    struct CharTokenizer;

    impl TokenizerLike for CharTokenizer {
        fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
            Ok(text.chars().map(|c| (c as u32 % 1000) + 3).collect())
        }
        fn decode(&self, ids: &[u32]) -> anyhow::Result<String> {
            Ok(ids
                .iter()
                .filter(|&&i| i >= 3)
                .filter_map(|&i| char::from_u32(i - 3))
                .collect())
        }
        fn vocab_size(&self) -> usize {
            1003
        }
        fn pad_id(&self) -> u32 {
            0
        }
        fn bos_id(&self) -> u32 {
            1
        }
        fn eos_id(&self) -> u32 {
            2
        }
    }

    fn pair(en: &str, zh: &str) -> SentencePair {
        SentencePair {
            english: en.into(),
            chinese: zh.into(),
        }
    }

    fn dataset(batch_size: usize) -> TranslationDataset {
        let pairs = vec![pair("ab", "甲"), pair("abcd", "甲乙丙"), pair("a", "乙丙")];
        TranslationDataset::from_pairs(&pairs, &CharTokenizer, &CharTokenizer, 16, batch_size)
            .unwrap()
    }

    #[test]
    fn encode_wrapped_truncates_inside_specials() {
        let ids = encode_wrapped(&CharTokenizer, "abcdef", 5).unwrap();
        assert_eq!(ids.len(), 5);
        assert_eq!(ids[0], 1);
        assert_eq!(ids[4], 2);
    }

    #[test]
    fn collate_pads_and_shifts() {
        let ds = dataset(2);
        let batch = ds.iter_batches().next().unwrap();
        assert_eq!(batch.batch_size, 2);
        // "abcd" → bos + 4 + eos
        assert_eq!(batch.src_len, 6);
        // "甲乙丙" → 5 tokens, shifted → 4
        assert_eq!(batch.tgt_len, 4);
        assert_eq!(batch.src.len(), 12);
        assert_eq!(&batch.src[4..6], &[0, 0]);

        // Row 0 target: [bos, 甲, eos] → in [bos, 甲], out [甲, eos]
        assert_eq!(batch.tgt_in[0], 1);
        assert_eq!(batch.tgt_out[1], 2);
        assert_eq!(&batch.tgt_in[2..4], &[0, 0]);
        assert_eq!(batch.ntokens, 2 + 4);
    }

    #[test]
    fn batches_keep_order_and_partial_tail() {
        let mut ds = dataset(2);
        assert_eq!(ds.num_batches(), 2);
        let batches: Vec<_> = ds.batches(1).unwrap().map(|b| b.unwrap()).collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[1].batch_size, 1);
        // Restartable: a second epoch yields the same sequence.
        let again: Vec<_> = ds.batches(2).unwrap().map(|b| b.unwrap()).collect();
        assert_eq!(batches, again);
    }

    #[test]
    fn to_tensors_shapes_and_masks() {
        let ds = dataset(3);
        let batch = ds.iter_batches().next().unwrap();
        let t = batch.to_tensors(&Device::Cpu).unwrap();
        assert_eq!(t.src.dims(), &[3, 6]);
        assert_eq!(t.tgt_in.dims(), &[3, 4]);
        let mask: Vec<Vec<u8>> = t.src_mask.to_vec2().unwrap();
        assert_eq!(mask[0], vec![1, 1, 1, 1, 0, 0]);
        assert_eq!(mask[1], vec![1; 6]);
    }

    #[test]
    fn tokenized_cache_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.zhp");
        let ds = dataset(2);
        ds.write_tokenized(&path).unwrap();

        let cache = MmapPairs::open(&path).unwrap();
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.get(1).as_ref(), Some(&ds.pairs()[1]));
        assert!(cache.get(3).is_none());

        let loaded = cache.to_dataset(2);
        assert_eq!(loaded.pairs(), ds.pairs());
        assert_eq!(loaded.pad_ids(), (0, 0));
    }

    #[test]
    fn tokenized_cache_rejects_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let bad_magic = dir.path().join("bad.zhp");
        std::fs::write(&bad_magic, b"NOPE0000000000000000").unwrap();
        assert!(MmapPairs::open(&bad_magic).is_err());

        let truncated = dir.path().join("short.zhp");
        dataset(2).write_tokenized(&truncated).unwrap();
        let bytes = std::fs::read(&truncated).unwrap();
        std::fs::write(&truncated, &bytes[..bytes.len() - 4]).unwrap();
        assert!(MmapPairs::open(&truncated).is_err());
    }

    #[test]
    fn tokenized_cache_rejects_impossible_pair_count() {
        let dir = tempfile::tempdir().unwrap();
        for count in [u64::MAX, 1u64 << 40, 1] {
            let path = dir.path().join(format!("count-{count}.zhp"));
            let mut bytes = PAIRS_MAGIC.to_vec();
            bytes.extend_from_slice(&count.to_le_bytes());
            bytes.extend_from_slice(&0u32.to_le_bytes());
            bytes.extend_from_slice(&0u32.to_le_bytes());
            std::fs::write(&path, bytes).unwrap();
            assert!(MmapPairs::open(&path).is_err(), "count {count}");
        }

        // Record lengths far past the end of the mapping.
        let path = dir.path().join("huge-record.zhp");
        let mut bytes = PAIRS_MAGIC.to_vec();
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 8]);
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();
        assert!(MmapPairs::open(&path).is_err());
    }

    #[test]
    fn prefetched_preserves_order() {
        let ds = TranslationDataset::from_tokenized(
            (0..50)
                .map(|i| TokenizedPair {
                    src: vec![1, i + 3, 2],
                    tgt: vec![1, i + 3, 2],
                })
                .collect(),
            0,
            0,
            4,
        );
        let mut direct = ds.clone();
        let expected: Vec<_> = direct.batches(1).unwrap().map(|b| b.unwrap()).collect();

        let mut prefetched = Prefetched::new(ds, 2);
        assert_eq!(prefetched.batches_per_epoch(), Some(13));
        for epoch in 1..=2 {
            let got: Vec<_> = prefetched
                .batches(epoch)
                .unwrap()
                .map(|b| b.unwrap())
                .collect();
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn prefetched_early_drop_does_not_hang() {
        let ds = TranslationDataset::from_tokenized(
            (0..100)
                .map(|_| TokenizedPair {
                    src: vec![1, 2],
                    tgt: vec![1, 2],
                })
                .collect(),
            0,
            0,
            1,
        );
        let mut prefetched = Prefetched::new(ds, 1);
        let first: Vec<_> = prefetched.batches(1).unwrap().take(3).collect();
        assert_eq!(first.len(), 3);
    }
}
