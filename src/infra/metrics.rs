// ============================================================
// Layer 6 — Metrics Logger
// ============================================================
// Appends one CSV row per epoch so learning curves and the
// XE -> RL switch point can be inspected after a run.
//
// Output file: {checkpoint_dir}/metrics.csv

use anyhow::Result;
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::PathBuf,
};
use serde::{Deserialize, Serialize};

use crate::domain::schedule::Phase;

/// One row of metrics data for a single training epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub phase: Phase,
    /// Average training loss (NLL in the XE phase, SCST loss in
    /// the RL phase)
    pub train_loss: f64,
    pub val_loss: f64,
    pub val_cider: f64,
    pub best_val_cider: f64,
    pub patience: usize,
}

impl EpochMetrics {
    fn phase_label(&self) -> &'static str {
        match self.phase {
            Phase::CrossEntropy => "xe",
            Phase::SelfCritical => "rl",
        }
    }
}

/// Logs epoch metrics to a CSV file for later analysis.
pub struct MetricsLogger {
    csv_path: PathBuf,
}

impl MetricsLogger {
    /// Writes the CSV header if the file doesn't exist yet, so a
    /// resumed run appends to the same log.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let csv_path = dir.join("metrics.csv");
        if !csv_path.exists() {
            let mut f = fs::File::create(&csv_path)?;
            writeln!(f, "epoch,phase,train_loss,val_loss,val_cider,best_val_cider,patience")?;
            tracing::debug!("Created metrics CSV: '{}'", csv_path.display());
        }
        Ok(Self { csv_path })
    }

    pub fn log(&self, m: &EpochMetrics) -> Result<()> {
        let mut f = OpenOptions::new().append(true).open(&self.csv_path)?;
        writeln!(
            f,
            "{},{},{:.6},{:.6},{:.6},{:.6},{}",
            m.epoch,
            m.phase_label(),
            m.train_loss,
            m.val_loss,
            m.val_cider,
            m.best_val_cider,
            m.patience,
        )?;
        tracing::debug!(
            "Logged epoch {} metrics: train_loss={:.4}, val_cider={:.4}",
            m.epoch,
            m.train_loss,
            m.val_cider,
        );
        Ok(())
    }

    pub fn csv_path(&self) -> &PathBuf {
        &self.csv_path
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_appends_rows_with_phase_label() {
        let dir = std::env::temp_dir().join(format!("captioner-metrics-{}", std::process::id()));
        let logger = MetricsLogger::new(&dir).unwrap();
        logger
            .log(&EpochMetrics {
                epoch: 1,
                phase: Phase::CrossEntropy,
                train_loss: 3.2,
                val_loss: 3.0,
                val_cider: 0.21,
                best_val_cider: 0.21,
                patience: 0,
            })
            .unwrap();
        logger
            .log(&EpochMetrics {
                epoch: 2,
                phase: Phase::SelfCritical,
                train_loss: -0.1,
                val_loss: 3.1,
                val_cider: 0.25,
                best_val_cider: 0.25,
                patience: 0,
            })
            .unwrap();

        let contents = fs::read_to_string(logger.csv_path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("1,xe,"));
        assert!(lines[2].starts_with("2,rl,"));

        fs::remove_dir_all(&dir).ok();
    }
}
