// ============================================================
// Layer 4 — Annotation Loading
// ============================================================
// A split file is a JSON array of {image_id, caption} records,
// several records per image. The XE dataset uses the flat list;
// the dictionary dataset groups records per image so every
// caption of an image serves as a reference.

use anyhow::{Context, Result};
use std::path::Path;

use crate::domain::caption::CaptionAnnotation;

pub fn load_annotations(path: impl AsRef<Path>) -> Result<Vec<CaptionAnnotation>> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Cannot read annotation file '{}'", path.display()))?;
    let records: Vec<CaptionAnnotation> = serde_json::from_str(&json)
        .with_context(|| format!("Malformed annotation JSON '{}'", path.display()))?;
    tracing::info!("Loaded {} captions from '{}'", records.len(), path.display());
    Ok(records)
}

/// Group captions per image, preserving first-seen image order.
pub fn group_by_image(annotations: &[CaptionAnnotation]) -> Vec<(String, Vec<String>)> {
    let mut order: Vec<String> = Vec::new();
    let mut grouped: std::collections::HashMap<String, Vec<String>> =
        std::collections::HashMap::new();
    for record in annotations {
        let entry = grouped.entry(record.image_id.clone()).or_insert_with(|| {
            order.push(record.image_id.clone());
            Vec::new()
        });
        entry.push(record.caption.clone());
    }
    order
        .into_iter()
        .map(|id| {
            let captions = grouped.remove(&id).unwrap_or_default();
            (id, captions)
        })
        .collect()
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    fn record(image_id: &str, caption: &str) -> CaptionAnnotation {
        CaptionAnnotation { image_id: image_id.into(), caption: caption.into() }
    }

    #[test]
    fn test_grouping_preserves_order_and_collects_all() {
        let annotations = vec![
            record("img2", "a dog"),
            record("img1", "a man"),
            record("img2", "the dog runs"),
        ];
        let grouped = group_by_image(&annotations);
        assert_eq!(grouped.len(), 2);
        assert_eq!(grouped[0].0, "img2");
        assert_eq!(grouped[0].1, vec!["a dog".to_string(), "the dog runs".to_string()]);
        assert_eq!(grouped[1].0, "img1");
    }
}
