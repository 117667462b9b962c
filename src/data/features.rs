// ============================================================
// Layer 4 — Feature Store
// ============================================================
// Precomputed visual features, one blob per image id:
//
//   {feature_dir}/{image_id}.json
//     { "features": [[f32; d_feature]; num_items],
//       "boxes":    [[x1, y1, x2, y2]; num_items] | absent }
//
// Region-extracted images carry detector boxes; grid-extracted
// images omit them (the grid layout lives in the model config).
// The store treats blobs as opaque — no shape policy beyond
// rectangularity is enforced here.

use anyhow::{Context, Result};
use std::path::PathBuf;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureRecord {
    pub features: Vec<Vec<f32>>,
    #[serde(default)]
    pub boxes: Option<Vec<[f32; 4]>>,
}

impl FeatureRecord {
    pub fn num_items(&self) -> usize {
        self.features.len()
    }

    pub fn d_feature(&self) -> usize {
        self.features.first().map_or(0, |row| row.len())
    }
}

pub struct FeatureStore {
    dir: PathBuf,
}

impl FeatureStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn load(&self, image_id: &str) -> Result<FeatureRecord> {
        let path = self.dir.join(format!("{image_id}.json"));
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("Cannot read feature blob '{}'", path.display()))?;
        let record: FeatureRecord = serde_json::from_str(&json)
            .with_context(|| format!("Malformed feature blob '{}'", path.display()))?;

        let d = record.d_feature();
        if record.features.iter().any(|row| row.len() != d) {
            anyhow::bail!("Ragged feature rows in '{}'", path.display());
        }
        if let Some(boxes) = &record.boxes {
            if boxes.len() != record.num_items() {
                anyhow::bail!(
                    "'{}' has {} boxes for {} feature rows",
                    path.display(),
                    boxes.len(),
                    record.num_items()
                );
            }
        }
        Ok(record)
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_and_validate() {
        let dir = std::env::temp_dir().join(format!("captioner-feat-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let record = FeatureRecord {
            features: vec![vec![0.1, 0.2], vec![0.3, 0.4]],
            boxes: Some(vec![[0.0, 0.0, 1.0, 1.0], [1.0, 1.0, 2.0, 2.0]]),
        };
        std::fs::write(dir.join("img1.json"), serde_json::to_string(&record).unwrap()).unwrap();

        let store = FeatureStore::new(&dir);
        let loaded = store.load("img1").unwrap();
        assert_eq!(loaded.num_items(), 2);
        assert_eq!(loaded.d_feature(), 2);
        assert!(store.load("missing").is_err());

        std::fs::remove_dir_all(&dir).ok();
    }
}
