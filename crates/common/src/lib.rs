//! # zhmt-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`TrainConfig`]** — training hyper-parameters (serialised as JSON).
//! * **[`TokenizerLike`]** / **[`HfTokenizer`]** — tokeniser capability and
//!   the `tokenizers`-backed implementation, plus [`train_bpe`].
//! * **[`read_pairs`]** — English/Chinese parallel corpus reader.
//! * **[`TranslationDataset`]** / **[`PairBatch`]** / **[`Prefetched`]** —
//!   tokenisation, padding and batching behind the [`BatchSource`] trait.

pub mod config;
pub mod corpus;
pub mod data;
pub mod tokenizer;

pub use config::TrainConfig;
pub use corpus::{parse_line, read_pairs, CorpusReadStats, SentencePair, Side};
pub use data::{
    encode_wrapped, write_tokenized_pairs, BatchSource, BatchTensors, MmapPairs, PairBatch,
    Prefetched, TokenizedPair, TranslationDataset, PREFETCH_BUFFER,
};
pub use tokenizer::{train_bpe, BpeTrainerConfig, HfTokenizer, TokenizerLike};
