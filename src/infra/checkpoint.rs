// ============================================================
// Layer 6 — Checkpoint Manager
// ============================================================
// Two rolling checkpoint pairs live in the checkpoint directory:
//
//   last_state.json / last_model.mpk.gz / last_optim.mpk.gz
//   best_state.json / best_model.mpk.gz / best_optim.mpk.gz
//
// "last" is written after every epoch; on a best-validation
// epoch the last files are copied over the best files. The state
// JSON carries everything the training loop needs to resume
// exactly (epoch, phase, patience, best scores, scheduler step,
// seed); the records carry model and optimizer tensors via
// Burn's CompactRecorder (MessagePack + gzip, type-safe on
// load). The architecture config is saved separately so a model
// can be rebuilt before its weights are loaded into it.

use anyhow::{Context, Result};
use std::{fs, path::PathBuf};
use burn::{
    module::Module,
    prelude::*,
    record::{CompactRecorder, Record, Recorder},
};
use serde::{Deserialize, Serialize};

use crate::domain::schedule::TrainingSchedule;

/// Extension CompactRecorder appends to record stems.
const RECORD_EXT: &str = "mpk.gz";

/// Scalar training state persisted once per epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSnapshot {
    pub epoch: usize,
    pub val_loss: f64,
    pub val_cider: f64,
    pub schedule: TrainingSchedule,
    /// Warm-up scheduler position (number of optimizer steps)
    pub lr_step: usize,
    /// Base seed; epoch-dependent shuffling derives from it
    pub seed: u64,
}

pub struct CheckpointManager {
    dir: PathBuf,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        fs::create_dir_all(&dir).ok();
        Self { dir }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    pub fn exists(&self, stem: &str) -> bool {
        self.dir.join(format!("{stem}_state.json")).exists()
    }

    // ── Scalar state ─────────────────────────────────────────────────────────

    pub fn save_snapshot(&self, stem: &str, snapshot: &TrainingSnapshot) -> Result<()> {
        let path = self.dir.join(format!("{stem}_state.json"));
        fs::write(&path, serde_json::to_string_pretty(snapshot)?)
            .with_context(|| format!("Failed to write '{}'", path.display()))?;
        Ok(())
    }

    pub fn load_snapshot(&self, stem: &str) -> Result<TrainingSnapshot> {
        let path = self.dir.join(format!("{stem}_state.json"));
        let json = fs::read_to_string(&path)
            .with_context(|| format!("Cannot read checkpoint state '{}'", path.display()))?;
        Ok(serde_json::from_str(&json)?)
    }

    // ── Model / optimizer records ────────────────────────────────────────────

    /// Serialize any module's parameters under `{stem}_model`.
    pub fn save_model<B: Backend, M: Module<B>>(&self, model: &M, stem: &str) -> Result<()> {
        let path = self.dir.join(format!("{stem}_model"));
        CompactRecorder::new()
            .record(model.clone().into_record(), path.clone())
            .with_context(|| format!("Failed to save checkpoint to '{}'", path.display()))?;
        Ok(())
    }

    /// Load `{stem}_model` into a freshly-built module of the
    /// same architecture.
    pub fn load_model<B: Backend, M: Module<B>>(
        &self,
        model: M,
        stem: &str,
        device: &B::Device,
    ) -> Result<M> {
        let path = self.dir.join(format!("{stem}_model"));
        let record = CompactRecorder::new()
            .load(path.clone(), device)
            .with_context(|| {
                format!(
                    "Cannot load checkpoint '{}'. Have you trained the model first?",
                    path.display()
                )
            })?;
        Ok(model.load_record(record))
    }

    /// Serialize an optimizer (or any other) record under
    /// `{stem}_optim`.
    pub fn save_optimizer<B: Backend, R: Record<B>>(&self, record: R, stem: &str) -> Result<()> {
        let path = self.dir.join(format!("{stem}_optim"));
        CompactRecorder::new()
            .record(record, path.clone())
            .with_context(|| format!("Failed to save optimizer state to '{}'", path.display()))?;
        Ok(())
    }

    pub fn load_optimizer<B: Backend, R: Record<B>>(
        &self,
        stem: &str,
        device: &B::Device,
    ) -> Result<R> {
        let path = self.dir.join(format!("{stem}_optim"));
        CompactRecorder::new()
            .load(path.clone(), device)
            .with_context(|| format!("Cannot load optimizer state '{}'", path.display()))
    }

    /// Copy the whole "last" checkpoint over "best" — called on a
    /// best-validation epoch.
    pub fn promote_last_to_best(&self) -> Result<()> {
        for (from, to) in [
            ("last_state.json".to_string(), "best_state.json".to_string()),
            (format!("last_model.{RECORD_EXT}"), format!("best_model.{RECORD_EXT}")),
            (format!("last_optim.{RECORD_EXT}"), format!("best_optim.{RECORD_EXT}")),
        ] {
            let src = self.dir.join(&from);
            if src.exists() {
                fs::copy(&src, self.dir.join(&to))
                    .with_context(|| format!("Failed to copy '{from}' to '{to}'"))?;
            }
        }
        Ok(())
    }

    // ── Architecture config ──────────────────────────────────────────────────

    pub fn save_config<C: Serialize>(&self, config: &C) -> Result<()> {
        let path = self.dir.join("train_config.json");
        fs::write(&path, serde_json::to_string_pretty(config)?)
            .with_context(|| format!("Cannot write config to '{}'", path.display()))?;
        tracing::debug!("Saved training config to '{}'", path.display());
        Ok(())
    }

    pub fn load_config<C: for<'de> Deserialize<'de>>(&self) -> Result<C> {
        let path = self.dir.join("train_config.json");
        let json = fs::read_to_string(&path).with_context(|| {
            format!(
                "Cannot read config from '{}'. Make sure you have run 'train' first.",
                path.display()
            )
        })?;
        Ok(serde_json::from_str(&json)?)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::schedule::Phase;

    #[test]
    fn test_snapshot_round_trip() {
        let dir = std::env::temp_dir().join(format!("captioner-ckpt-{}", std::process::id()));
        let manager = CheckpointManager::new(&dir);

        let snapshot = TrainingSnapshot {
            epoch: 7,
            val_loss: 2.25,
            val_cider: 0.61,
            schedule: TrainingSchedule {
                phase: Phase::SelfCritical,
                patience: 3,
                best_val_cider: 0.66,
                best_test_cider: 0.59,
            },
            lr_step: 12345,
            seed: 13,
        };
        manager.save_snapshot("last", &snapshot).unwrap();
        assert!(manager.exists("last"));

        let loaded = manager.load_snapshot("last").unwrap();
        assert_eq!(loaded.epoch, 7);
        assert_eq!(loaded.schedule.phase, Phase::SelfCritical);
        assert_eq!(loaded.schedule.patience, 3);
        assert_eq!(loaded.lr_step, 12345);

        manager.promote_last_to_best().unwrap();
        let best = manager.load_snapshot("best").unwrap();
        assert_eq!(best.epoch, 7);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_missing_checkpoint_is_an_error() {
        let dir = std::env::temp_dir().join(format!("captioner-none-{}", std::process::id()));
        let manager = CheckpointManager::new(&dir);
        assert!(!manager.exists("last"));
        assert!(manager.load_snapshot("last").is_err());
        fs::remove_dir_all(&dir).ok();
    }
}
