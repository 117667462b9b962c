// ============================================================
// Evaluation — CIDEr-D
// ============================================================
// Consensus-based caption scoring: tf-idf weighted n-gram
// (n = 1..4) cosine similarity between a candidate and each of
// its references, with a gaussian length penalty. Document
// frequencies come from a reference corpus — the training
// references for the RL reward, or the evaluation set's own
// references for metric reporting.
//
// Reference: Vedantam et al. (2015) CIDEr: Consensus-based Image
//            Description Evaluation

use std::collections::HashMap;

use crate::evaluation::Scorer;

const NGRAMS: usize = 4;
const SIGMA: f64 = 6.0;

type Ngram = Vec<String>;

/// CIDEr-D with document frequencies fixed at construction.
pub struct CiderD {
    doc_freq: HashMap<Ngram, f64>,
    log_ref_count: f64,
}

fn ngram_counts(caption: &str) -> Vec<HashMap<Ngram, f64>> {
    let words: Vec<String> = caption.split_whitespace().map(str::to_string).collect();
    let mut per_n = vec![HashMap::new(); NGRAMS];
    for n in 1..=NGRAMS {
        if words.len() < n {
            break;
        }
        for window in words.windows(n) {
            *per_n[n - 1].entry(window.to_vec()).or_insert(0.0) += 1.0;
        }
    }
    per_n
}

impl CiderD {
    /// Build document frequencies: one "document" per image, an
    /// n-gram counted once per image no matter how many of its
    /// references contain it.
    pub fn from_corpus(references: &[Vec<String>]) -> Self {
        let mut doc_freq: HashMap<Ngram, f64> = HashMap::new();
        for image_refs in references {
            let mut seen: HashMap<Ngram, ()> = HashMap::new();
            for reference in image_refs {
                for counts in ngram_counts(reference) {
                    for ngram in counts.keys() {
                        seen.entry(ngram.clone()).or_insert(());
                    }
                }
            }
            for ngram in seen.keys() {
                *doc_freq.entry(ngram.clone()).or_insert(0.0) += 1.0;
            }
        }
        Self { doc_freq, log_ref_count: (references.len().max(1) as f64).ln() }
    }

    /// tf-idf vector per n, its norms, and the caption length.
    fn vectorize(&self, caption: &str) -> (Vec<HashMap<Ngram, f64>>, Vec<f64>, usize) {
        let counts = ngram_counts(caption);
        let length = caption.split_whitespace().count();
        let mut vectors = vec![HashMap::new(); NGRAMS];
        let mut norms = vec![0.0; NGRAMS];
        for (n, count) in counts.iter().enumerate() {
            for (ngram, term_freq) in count {
                let df = self.doc_freq.get(ngram).copied().unwrap_or(0.0).max(1.0);
                let weight = term_freq * (self.log_ref_count - df.ln());
                vectors[n].insert(ngram.clone(), weight);
                norms[n] += weight * weight;
            }
            norms[n] = norms[n].sqrt();
        }
        (vectors, norms, length)
    }

    fn similarity(
        &self,
        hyp: &(Vec<HashMap<Ngram, f64>>, Vec<f64>, usize),
        reference: &(Vec<HashMap<Ngram, f64>>, Vec<f64>, usize),
    ) -> [f64; NGRAMS] {
        let (hyp_vec, hyp_norm, hyp_len) = hyp;
        let (ref_vec, ref_norm, ref_len) = reference;
        let delta = *hyp_len as f64 - *ref_len as f64;
        let penalty = (-(delta * delta) / (2.0 * SIGMA * SIGMA)).exp();

        let mut values = [0.0; NGRAMS];
        for n in 0..NGRAMS {
            for (ngram, hyp_weight) in &hyp_vec[n] {
                if let Some(ref_weight) = ref_vec[n].get(ngram) {
                    // CIDEr-D clips the hypothesis count at the
                    // reference count (min), then weights by the
                    // reference.
                    values[n] += hyp_weight.min(*ref_weight) * ref_weight;
                }
            }
            if hyp_norm[n] > 0.0 && ref_norm[n] > 0.0 {
                values[n] /= hyp_norm[n] * ref_norm[n];
            }
            values[n] *= penalty;
        }
        values
    }
}

impl Scorer for CiderD {
    fn compute(&self, references: &[Vec<String>], candidates: &[String]) -> (f64, Vec<f64>) {
        assert_eq!(
            references.len(),
            candidates.len(),
            "one reference set per candidate"
        );
        let mut per_item = Vec::with_capacity(candidates.len());
        for (candidate, refs) in candidates.iter().zip(references.iter()) {
            let hyp = self.vectorize(candidate);
            let mut accumulated = [0.0; NGRAMS];
            for reference in refs {
                let reference = self.vectorize(reference);
                let values = self.similarity(&hyp, &reference);
                for n in 0..NGRAMS {
                    accumulated[n] += values[n];
                }
            }
            let mean_over_n: f64 = accumulated.iter().sum::<f64>() / NGRAMS as f64;
            let score = if refs.is_empty() { 0.0 } else { mean_over_n / refs.len() as f64 * 10.0 };
            per_item.push(score);
        }
        let corpus = if per_item.is_empty() {
            0.0
        } else {
            per_item.iter().sum::<f64>() / per_item.len() as f64
        };
        (corpus, per_item)
    }
}
