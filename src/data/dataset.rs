// ============================================================
// Layer 4 — Datasets
// ============================================================
// Three Burn datasets:
//
//   CaptionDataset    — one sample per (image, caption): the
//                       teacher-forced XE phase
//   DictionaryDataset — one sample per image with all reference
//                       captions: beam-search evaluation and the
//                       self-critical RL phase
//   TokenDataset      — caption tokens only: language-model
//                       pre-training
//
// Feature blobs are loaded once per image and shared through an
// Arc; samples clone cheaply inside the data loader.

use anyhow::Result;
use std::{collections::HashMap, sync::Arc};
use burn::data::dataset::Dataset;

use crate::data::annotations::group_by_image;
use crate::data::features::{FeatureRecord, FeatureStore};
use crate::domain::caption::CaptionAnnotation;
use crate::domain::vocab::Vocab;

/// One teacher-forced training sample. `input_tokens` starts at
/// `<bos>`, `target_tokens` is the same sequence shifted one
/// position left and ending at `<eos>`.
#[derive(Debug, Clone)]
pub struct CaptionSample {
    pub image_id: String,
    pub record: Arc<FeatureRecord>,
    pub input_tokens: Vec<u32>,
    pub target_tokens: Vec<u32>,
}

#[derive(Clone)]
pub struct CaptionDataset {
    samples: Vec<CaptionSample>,
}

impl CaptionDataset {
    pub fn build(
        annotations: &[CaptionAnnotation],
        store: &FeatureStore,
        vocab: &Vocab,
    ) -> Result<Self> {
        let mut records: HashMap<String, Arc<FeatureRecord>> = HashMap::new();
        let mut samples = Vec::with_capacity(annotations.len());
        for annotation in annotations {
            let record = match records.get(&annotation.image_id) {
                Some(record) => record.clone(),
                None => {
                    let record = Arc::new(store.load(&annotation.image_id)?);
                    records.insert(annotation.image_id.clone(), record.clone());
                    record
                }
            };
            let ids = vocab.encode_caption(&annotation.caption)?;
            samples.push(CaptionSample {
                image_id: annotation.image_id.clone(),
                record,
                input_tokens: ids[..ids.len() - 1].to_vec(),
                target_tokens: ids[1..].to_vec(),
            });
        }
        Ok(Self { samples })
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

impl Dataset<CaptionSample> for CaptionDataset {
    fn get(&self, index: usize) -> Option<CaptionSample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// One sample per image carrying every reference caption.
#[derive(Debug, Clone)]
pub struct DictionarySample {
    pub image_id: String,
    pub record: Arc<FeatureRecord>,
    pub references: Vec<String>,
}

#[derive(Clone)]
pub struct DictionaryDataset {
    samples: Vec<DictionarySample>,
}

impl DictionaryDataset {
    pub fn build(annotations: &[CaptionAnnotation], store: &FeatureStore) -> Result<Self> {
        let mut samples = Vec::new();
        for (image_id, references) in group_by_image(annotations) {
            let record = Arc::new(store.load(&image_id)?);
            samples.push(DictionarySample { image_id, record, references });
        }
        Ok(Self { samples })
    }

    pub fn references(&self) -> Vec<Vec<String>> {
        self.samples.iter().map(|s| s.references.clone()).collect()
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }
}

impl Dataset<DictionarySample> for DictionaryDataset {
    fn get(&self, index: usize) -> Option<DictionarySample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Token-only sample for language-model pre-training.
#[derive(Debug, Clone)]
pub struct TokenSample {
    pub input_tokens: Vec<u32>,
    pub target_tokens: Vec<u32>,
}

#[derive(Clone)]
pub struct TokenDataset {
    samples: Vec<TokenSample>,
}

impl TokenDataset {
    pub fn build(annotations: &[CaptionAnnotation], vocab: &Vocab) -> Result<Self> {
        let mut samples = Vec::with_capacity(annotations.len());
        for annotation in annotations {
            let ids = vocab.encode_caption(&annotation.caption)?;
            samples.push(TokenSample {
                input_tokens: ids[..ids.len() - 1].to_vec(),
                target_tokens: ids[1..].to_vec(),
            });
        }
        Ok(Self { samples })
    }
}

impl Dataset<TokenSample> for TokenDataset {
    fn get(&self, index: usize) -> Option<TokenSample> {
        self.samples.get(index).cloned()
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::tokenizer_store::build_word_level_tokenizer;

    fn test_vocab() -> Vocab {
        let captions = vec!["a man rides a horse".to_string(), "a dog runs".to_string()];
        Vocab::new(build_word_level_tokenizer(&captions, 1).unwrap(), 8)
    }

    #[test]
    fn test_shifted_right_targets() {
        let vocab = test_vocab();
        let annotations = vec![CaptionAnnotation {
            image_id: "x".into(),
            caption: "a dog runs".into(),
        }];
        let dataset = TokenDataset::build(&annotations, &vocab).unwrap();
        let sample = dataset.get(0).unwrap();
        // input: <bos> a dog runs ; target: a dog runs <eos>
        assert_eq!(sample.input_tokens.len(), sample.target_tokens.len());
        assert_eq!(sample.input_tokens[0], 1);
        assert_eq!(*sample.target_tokens.last().unwrap(), 2);
        assert_eq!(&sample.input_tokens[1..], &sample.target_tokens[..sample.target_tokens.len() - 1]);
    }
}
