//! Parallel English/Chinese corpus reader.
//!
//! Accepts JSONL in the translation2019zh layout
//! (`{"english": "...", "chinese": "..."}`) or tab-separated `en\tzh` lines.
//! Blank lines are ignored; malformed lines are skipped and counted.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// One aligned sentence pair.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SentencePair {
    pub english: String,
    pub chinese: String,
}

/// Which side of the corpus to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    English,
    Chinese,
}

impl SentencePair {
    pub fn side(&self, side: Side) -> &str {
        match side {
            Side::English => &self.english,
            Side::Chinese => &self.chinese,
        }
    }
}

/// Counters reported after a read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorpusReadStats {
    pub lines: usize,
    pub pairs: usize,
    pub skipped: usize,
}

/// Parse one corpus line. `None` for blank or malformed lines.
pub fn parse_line(line: &str) -> Option<SentencePair> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let pair = if line.starts_with('{') {
        serde_json::from_str::<SentencePair>(line).ok()?
    } else {
        let (en, zh) = line.split_once('\t')?;
        SentencePair {
            english: en.to_string(),
            chinese: zh.to_string(),
        }
    };
    let english = pair.english.trim();
    let chinese = pair.chinese.trim();
    if english.is_empty() || chinese.is_empty() {
        return None;
    }
    Some(SentencePair {
        english: english.to_string(),
        chinese: chinese.to_string(),
    })
}

/// Read up to `limit` pairs (all when `None`) from `path`.
pub fn read_pairs(
    path: &Path,
    limit: Option<usize>,
) -> anyhow::Result<(Vec<SentencePair>, CorpusReadStats)> {
    let file = File::open(path).with_context(|| format!("open corpus {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut stats = CorpusReadStats::default();
    let mut pairs = Vec::new();

    let mut buf = Vec::new();
    loop {
        if limit.is_some_and(|n| pairs.len() >= n) {
            break;
        }
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .with_context(|| format!("read corpus {}", path.display()))?;
        if n == 0 {
            break;
        }
        stats.lines += 1;
        // Invalid UTF-8 is a malformed line, not a read failure.
        let Ok(line) = std::str::from_utf8(&buf) else {
            stats.skipped += 1;
            continue;
        };
        if line.trim().is_empty() {
            continue;
        }
        match parse_line(line) {
            Some(pair) => pairs.push(pair),
            None => stats.skipped += 1,
        }
    }
    stats.pairs = pairs.len();

    if stats.skipped > 0 {
        tracing::warn!(
            skipped = stats.skipped,
            path = %path.display(),
            "Skipped malformed corpus lines"
        );
    }
    Ok((pairs, stats))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_jsonl_and_tsv() {
        let json = r#"{"english": " Hello. ", "chinese": "你好。"}"#;
        assert_eq!(
            parse_line(json),
            Some(SentencePair {
                english: "Hello.".into(),
                chinese: "你好。".into()
            })
        );
        let tsv = "Good night.\t晚安。";
        assert_eq!(parse_line(tsv).unwrap().chinese, "晚安。");
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!(parse_line(""), None);
        assert_eq!(parse_line("no tab here"), None);
        assert_eq!(parse_line(r#"{"english": "only one side"}"#), None);
        assert_eq!(parse_line(r#"{"english": "", "chinese": "空"}"#), None);
        assert_eq!(parse_line("{broken json"), None);
    }

    #[test]
    fn read_counts_and_limits() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        std::fs::write(
            &path,
            concat!(
                "{\"english\": \"a\", \"chinese\": \"甲\"}\n",
                "\n",
                "garbage\n",
                "b\t乙\n",
                "{\"english\": \"c\", \"chinese\": \"丙\"}\n",
            ),
        )
        .unwrap();

        let (pairs, stats) = read_pairs(&path, None).unwrap();
        assert_eq!(pairs.len(), 3);
        assert_eq!(stats.lines, 5);
        assert_eq!(stats.skipped, 1);
        assert_eq!(pairs[1].side(Side::English), "b");
        assert_eq!(pairs[2].side(Side::Chinese), "丙");

        let (limited, stats) = read_pairs(&path, Some(2)).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(stats.pairs, 2);
    }

    #[test]
    fn invalid_utf8_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mixed.tsv");
        let mut bytes = b"a\t\xe7\x94\xb2\n".to_vec();
        bytes.extend_from_slice(b"\xff\xfe\n");
        bytes.extend_from_slice(b"b\t\xe4\xb9\x99");
        std::fs::write(&path, bytes).unwrap();

        let (pairs, stats) = read_pairs(&path, None).unwrap();
        assert_eq!(stats.lines, 3);
        assert_eq!(stats.skipped, 1);
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].chinese, "甲");
        assert_eq!(pairs[1].chinese, "乙");
    }
}
