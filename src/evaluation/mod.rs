// ============================================================
// Evaluation — Caption Scoring
// ============================================================
// The trainer consumes scoring through the `Scorer` trait only:
// it hands over reference and candidate captions and gets back a
// corpus score plus one score per candidate (the RL reward).
// CIDEr-D is the provided implementation.

use rayon::prelude::*;

pub mod cider;

pub use cider::CiderD;

/// Black-box scoring interface. `references[i]` are the
/// tokenized reference captions for `candidates[i]`; the
/// returned per-item scores correspond to inputs by index.
pub trait Scorer {
    fn compute(&self, references: &[Vec<String>], candidates: &[String]) -> (f64, Vec<f64>);
}

/// PTB-style caption normalization: lowercase, strip punctuation
/// into separate drops, collapse whitespace. The map is
/// embarrassingly parallel, so it fans out across a worker pool.
pub fn tokenize(captions: &[String]) -> Vec<String> {
    captions.par_iter().map(|c| tokenize_one(c)).collect()
}

fn tokenize_one(caption: &str) -> String {
    caption
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_normalizes() {
        let caps = vec!["A Man, riding a horse!".to_string()];
        assert_eq!(tokenize(&caps), vec!["a man riding a horse".to_string()]);
    }

    #[test]
    fn test_tokenize_preserves_order() {
        let caps: Vec<String> = (0..64).map(|i| format!("caption number {i}")).collect();
        let out = tokenize(&caps);
        for (i, t) in out.iter().enumerate() {
            assert_eq!(t, &format!("caption number {i}"));
        }
    }
}
