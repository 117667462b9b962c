// ============================================================
// Layer 3 — Caption Records
// ============================================================
// Annotation and submission record types shared by the data
// layer and the result-export step.

use serde::{Deserialize, Serialize};

/// One annotation row from a split JSON file:
/// a list of `{image_id, caption}` records, several rows per image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionAnnotation {
    pub image_id: String,
    pub caption: String,
}

/// One entry of the sample-submission JSON array. The export
/// step matches generated captions to `id` and fills `captions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionEntry {
    pub id: String,
    #[serde(default)]
    pub captions: String,
}

/// One generated result: image id plus the best decoded caption
/// and the references it was scored against.
#[derive(Debug, Clone)]
pub struct PredictionResult {
    pub image_id: String,
    pub generated: String,
    pub references: Vec<String>,
}
