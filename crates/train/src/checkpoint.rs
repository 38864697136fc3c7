//! Epoch checkpoints on the local filesystem.
//!
//! Each checkpoint is `checkpoint-epoch-NNN.safetensors` plus a JSON sidecar
//! with the step counter. Both are written to a hidden temp file and renamed
//! into place, so a reader never observes a half-written checkpoint.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context;
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::handles::CheckpointStore;

const PREFIX: &str = "checkpoint-epoch-";
const WEIGHTS_EXT: &str = "safetensors";

/// Models whose parameters can be written to a single file.
pub trait Checkpointable {
    fn save_weights(&self, path: &Path) -> anyhow::Result<()>;
}

impl Checkpointable for VarMap {
    fn save_weights(&self, path: &Path) -> anyhow::Result<()> {
        self.save(path)?;
        Ok(())
    }
}

/// Sidecar written next to every weights file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub global_step: usize,
    pub created_unix: u64,
    pub weights: String,
}

/// Writes epoch checkpoints under `dir`, keeping the newest `keep_last`
/// (0 keeps all).
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
    keep_last: usize,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, keep_last: usize) -> Self {
        Self {
            dir: dir.into(),
            keep_last,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn weights_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("{PREFIX}{epoch:03}.{WEIGHTS_EXT}"))
    }

    pub fn meta_path(&self, epoch: usize) -> PathBuf {
        self.dir.join(format!("{PREFIX}{epoch:03}.json"))
    }

    fn write_checkpoint<M: Checkpointable>(
        &self,
        epoch: usize,
        model: &M,
        global_step: usize,
    ) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("create checkpoint dir {}", self.dir.display()))?;

        let weights = self.weights_path(epoch);
        let meta_path = self.meta_path(epoch);
        let meta = CheckpointMeta {
            epoch,
            global_step,
            created_unix: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
            weights: file_name(&weights),
        };
        let json = serde_json::to_string_pretty(&meta)?;

        // Sidecar first: listing is keyed on weights files, so a weights file
        // is only ever visible next to its metadata.
        atomic_write(&meta_path, |tmp| {
            std::fs::write(tmp, &json).context("write checkpoint meta")
        })?;
        if let Err(e) = atomic_write(&weights, |tmp| model.save_weights(tmp)) {
            let _ = std::fs::remove_file(&meta_path);
            return Err(e);
        }

        Ok(weights)
    }

    /// Delete all but the newest `keep_last` checkpoints.
    fn prune(&self) -> anyhow::Result<()> {
        if self.keep_last == 0 {
            return Ok(());
        }
        let checkpoints = list_checkpoints(&self.dir)?;
        let excess = checkpoints.len().saturating_sub(self.keep_last);
        for (epoch, weights) in checkpoints.into_iter().take(excess) {
            std::fs::remove_file(&weights)
                .with_context(|| format!("remove {}", weights.display()))?;
            let meta = self.meta_path(epoch);
            if meta.exists() {
                std::fs::remove_file(&meta)
                    .with_context(|| format!("remove {}", meta.display()))?;
            }
            tracing::debug!(epoch, "Pruned old checkpoint");
        }
        Ok(())
    }
}

impl<M: Checkpointable> CheckpointStore<M> for FileCheckpointStore {
    fn save(&mut self, epoch: usize, model: &M, global_step: usize) -> anyhow::Result<PathBuf> {
        let path = self.write_checkpoint(epoch, model, global_step)?;
        if let Err(e) = self.prune() {
            tracing::warn!(error = %e, "Failed to prune old checkpoints");
        }
        Ok(path)
    }
}

/// Run `write` against a temp file next to `path`, sync it, then rename it
/// over `path`. The temp file is removed if either step fails.
fn atomic_write<F>(path: &Path, write: F) -> anyhow::Result<()>
where
    F: FnOnce(&Path) -> anyhow::Result<()>,
{
    let tmp = path.with_file_name(format!(".{}.tmp", file_name(path)));
    let written = write(&tmp).and_then(|()| {
        std::fs::File::open(&tmp)
            .and_then(|f| f.sync_all())
            .with_context(|| format!("sync {}", tmp.display()))
    });
    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    std::fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Epoch checkpoints in `dir`, oldest first. A missing directory is empty.
pub fn list_checkpoints(dir: &Path) -> anyhow::Result<Vec<(usize, PathBuf)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out: Vec<(usize, PathBuf)> = std::fs::read_dir(dir)
        .with_context(|| format!("read checkpoint dir {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter_map(|p| parse_epoch(&p).map(|epoch| (epoch, p)))
        .collect();
    out.sort_by_key(|(epoch, _)| *epoch);
    Ok(out)
}

/// Highest-epoch checkpoint in `dir`, if any.
pub fn latest_checkpoint(dir: &Path) -> anyhow::Result<Option<(usize, PathBuf)>> {
    Ok(list_checkpoints(dir)?.pop())
}

/// Read the JSON sidecar belonging to a weights file.
pub fn read_meta(weights: &Path) -> anyhow::Result<CheckpointMeta> {
    let meta = weights.with_extension("json");
    let json = std::fs::read_to_string(&meta)
        .with_context(|| format!("read {}", meta.display()))?;
    Ok(serde_json::from_str(&json)?)
}

fn parse_epoch(path: &Path) -> Option<usize> {
    if path.extension()? != WEIGHTS_EXT {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix(PREFIX)?
        .parse()
        .ok()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarBuilder;

    struct BytesModel(Vec<u8>);

    impl Checkpointable for BytesModel {
        fn save_weights(&self, path: &Path) -> anyhow::Result<()> {
            std::fs::write(path, &self.0)?;
            Ok(())
        }
    }

    /// Writes part of the file, then fails.
    struct TornModel;

    impl Checkpointable for TornModel {
        fn save_weights(&self, path: &Path) -> anyhow::Result<()> {
            std::fs::write(path, b"half")?;
            anyhow::bail!("device lost mid-write")
        }
    }

    #[test]
    fn save_writes_weights_and_meta() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileCheckpointStore::new(dir.path().join("ckpt"), 0);

        let path = store.save(3, &BytesModel(vec![1, 2, 3]), 120).unwrap();
        assert_eq!(path, store.weights_path(3));
        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3]);
        assert!(path.ends_with("checkpoint-epoch-003.safetensors"));

        let meta = read_meta(&path).unwrap();
        assert_eq!(meta.epoch, 3);
        assert_eq!(meta.global_step, 120);
        assert_eq!(meta.weights, "checkpoint-epoch-003.safetensors");
    }

    #[test]
    fn failed_write_leaves_nothing_visible() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileCheckpointStore::new(dir.path(), 0);

        store.save(1, &BytesModel(vec![9]), 10).unwrap();
        assert!(store.save(2, &TornModel, 20).is_err());

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert!(!names.iter().any(|n| n.ends_with(".tmp")), "{names:?}");
        assert!(!store.weights_path(2).exists());
        assert!(!store.meta_path(2).exists());
        assert!(store.meta_path(1).exists());
        assert_eq!(latest_checkpoint(dir.path()).unwrap().unwrap().0, 1);
    }

    #[test]
    fn every_listed_checkpoint_has_meta() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileCheckpointStore::new(dir.path(), 0);
        store.save(1, &BytesModel(vec![1]), 5).unwrap();
        assert!(store.save(2, &TornModel, 10).is_err());
        store.save(3, &BytesModel(vec![3]), 15).unwrap();

        for (epoch, weights) in list_checkpoints(dir.path()).unwrap() {
            let meta = read_meta(&weights).unwrap();
            assert_eq!(meta.epoch, epoch);
        }
        let (epoch, latest) = latest_checkpoint(dir.path()).unwrap().unwrap();
        assert_eq!(epoch, 3);
        assert_eq!(read_meta(&latest).unwrap().global_step, 15);
    }

    #[test]
    fn keep_last_prunes_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileCheckpointStore::new(dir.path(), 2);
        for epoch in 1..=4 {
            store.save(epoch, &BytesModel(vec![epoch as u8]), epoch * 10).unwrap();
        }
        let epochs: Vec<usize> = list_checkpoints(dir.path())
            .unwrap()
            .into_iter()
            .map(|(e, _)| e)
            .collect();
        assert_eq!(epochs, vec![3, 4]);
        assert!(!store.meta_path(1).exists());
        assert!(store.meta_path(4).exists());
    }

    #[test]
    fn listing_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("model.safetensors"), b"x").unwrap();
        std::fs::write(dir.path().join("checkpoint-epoch-abc.safetensors"), b"x").unwrap();
        std::fs::write(dir.path().join("checkpoint-epoch-010.safetensors"), b"x").unwrap();
        std::fs::write(dir.path().join("checkpoint-epoch-002.safetensors"), b"x").unwrap();

        let found = list_checkpoints(dir.path()).unwrap();
        assert_eq!(found.iter().map(|(e, _)| *e).collect::<Vec<_>>(), vec![2, 10]);
        assert!(list_checkpoints(&dir.path().join("missing")).unwrap().is_empty());
    }

    #[test]
    fn varmap_checkpoint_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let _w = vb
            .get_with_hints((2, 3), "proj.weight", candle_nn::Init::Const(0.5))
            .unwrap();

        let mut store = FileCheckpointStore::new(dir.path(), 0);
        let path = store.save(1, &varmap, 7).unwrap();

        let mut restored = VarMap::new();
        let vb = VarBuilder::from_varmap(&restored, DType::F32, &Device::Cpu);
        let _w = vb
            .get_with_hints((2, 3), "proj.weight", candle_nn::Init::Const(0.0))
            .unwrap();
        restored.load(&path).unwrap();
        let data = restored.data().lock().unwrap();
        let values: Vec<Vec<f32>> = data["proj.weight"].as_tensor().to_vec2().unwrap();
        assert_eq!(values, vec![vec![0.5; 3]; 2]);
    }
}
