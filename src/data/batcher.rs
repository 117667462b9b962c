// ============================================================
// Layer 4 — Batchers
// ============================================================
// Convert lists of samples into padded tensors. Features are
// zero-padded to the batch's largest region count (the vision
// embedding turns those zero rows back into a padding mask);
// captions are padded with <pad>=0 to the batch's longest
// sequence. Boxes are all-or-nothing per batch: either every
// sample carries them or none does.

use burn::{data::dataloader::batcher::Batcher, prelude::*};

use crate::data::dataset::{CaptionSample, DictionarySample, TokenSample};

/// A teacher-forced XE batch.
#[derive(Debug, Clone)]
pub struct CaptionBatch<B: Backend> {
    /// (batch, max_items, d_feature), zero rows where padded
    pub features: Tensor<B, 3>,
    /// (batch, max_items, 4) when region boxes are present
    pub boxes: Option<Tensor<B, 3>>,
    /// (batch, max_len) starting at <bos>
    pub tokens: Tensor<B, 2, Int>,
    /// (batch, max_len) shifted one left, ending at <eos>
    pub targets: Tensor<B, 2, Int>,
}

#[derive(Clone, Debug)]
pub struct CaptionBatcher<B: Backend> {
    pub device: B::Device,
}

impl<B: Backend> CaptionBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

/// Stack feature records into one zero-padded (b, max_n, d)
/// tensor plus optional (b, max_n, 4) boxes.
fn batch_features<B: Backend>(
    records: Vec<&crate::data::features::FeatureRecord>,
    device: &B::Device,
) -> (Tensor<B, 3>, Option<Tensor<B, 3>>) {
    let batch_size = records.len();
    let max_items = records.iter().map(|r| r.num_items()).max().unwrap_or(0);
    let d_feature = records.iter().map(|r| r.d_feature()).max().unwrap_or(0);

    let with_boxes = records.iter().all(|r| r.boxes.is_some());
    let any_boxes = records.iter().any(|r| r.boxes.is_some());
    assert_eq!(
        with_boxes, any_boxes,
        "a batch must be uniformly region-based or grid-based"
    );

    let mut flat = vec![0.0f32; batch_size * max_items * d_feature];
    let mut flat_boxes = vec![0.0f32; batch_size * max_items * 4];
    for (i, record) in records.iter().enumerate() {
        for (j, row) in record.features.iter().enumerate() {
            let offset = (i * max_items + j) * d_feature;
            flat[offset..offset + row.len()].copy_from_slice(row);
        }
        if let Some(boxes) = &record.boxes {
            for (j, boxed) in boxes.iter().enumerate() {
                let offset = (i * max_items + j) * 4;
                flat_boxes[offset..offset + 4].copy_from_slice(boxed);
            }
        }
    }

    let features = Tensor::<B, 1>::from_floats(flat.as_slice(), device)
        .reshape([batch_size, max_items, d_feature]);
    let boxes = with_boxes.then(|| {
        Tensor::<B, 1>::from_floats(flat_boxes.as_slice(), device)
            .reshape([batch_size, max_items, 4])
    });
    (features, boxes)
}

/// Pad token sequences with <pad>=0 to the batch max and stack
/// into a (b, max_len) Int tensor.
fn batch_tokens<B: Backend>(sequences: Vec<&[u32]>, device: &B::Device) -> Tensor<B, 2, Int> {
    let batch_size = sequences.len();
    let max_len = sequences.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut flat = vec![0i32; batch_size * max_len];
    for (i, sequence) in sequences.iter().enumerate() {
        for (j, &token) in sequence.iter().enumerate() {
            flat[i * max_len + j] = token as i32;
        }
    }
    Tensor::<B, 1, Int>::from_ints(flat.as_slice(), device).reshape([batch_size, max_len])
}

impl<B: Backend> Batcher<CaptionSample, CaptionBatch<B>> for CaptionBatcher<B> {
    fn batch(&self, items: Vec<CaptionSample>) -> CaptionBatch<B> {
        let (features, boxes) =
            batch_features(items.iter().map(|s| s.record.as_ref()).collect(), &self.device);
        let tokens = batch_tokens(
            items.iter().map(|s| s.input_tokens.as_slice()).collect(),
            &self.device,
        );
        let targets = batch_tokens(
            items.iter().map(|s| s.target_tokens.as_slice()).collect(),
            &self.device,
        );
        CaptionBatch { features, boxes, tokens, targets }
    }
}

/// A per-image batch for beam-search evaluation and SCST.
#[derive(Debug, Clone)]
pub struct DictionaryBatch<B: Backend> {
    pub features: Tensor<B, 3>,
    pub boxes: Option<Tensor<B, 3>>,
    pub image_ids: Vec<String>,
    /// Reference captions per image
    pub references: Vec<Vec<String>>,
}

#[derive(Clone, Debug)]
pub struct DictionaryBatcher<B: Backend> {
    pub device: B::Device,
}

impl<B: Backend> DictionaryBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<DictionarySample, DictionaryBatch<B>> for DictionaryBatcher<B> {
    fn batch(&self, items: Vec<DictionarySample>) -> DictionaryBatch<B> {
        let (features, boxes) =
            batch_features(items.iter().map(|s| s.record.as_ref()).collect(), &self.device);
        DictionaryBatch {
            features,
            boxes,
            image_ids: items.iter().map(|s| s.image_id.clone()).collect(),
            references: items.iter().map(|s| s.references.clone()).collect(),
        }
    }
}

/// A token-only batch for language-model pre-training.
#[derive(Debug, Clone)]
pub struct TokenBatch<B: Backend> {
    pub tokens: Tensor<B, 2, Int>,
    pub targets: Tensor<B, 2, Int>,
}

#[derive(Clone, Debug)]
pub struct TokenBatcher<B: Backend> {
    pub device: B::Device,
}

impl<B: Backend> TokenBatcher<B> {
    pub fn new(device: B::Device) -> Self {
        Self { device }
    }
}

impl<B: Backend> Batcher<TokenSample, TokenBatch<B>> for TokenBatcher<B> {
    fn batch(&self, items: Vec<TokenSample>) -> TokenBatch<B> {
        let tokens = batch_tokens(
            items.iter().map(|s| s.input_tokens.as_slice()).collect(),
            &self.device,
        );
        let targets = batch_tokens(
            items.iter().map(|s| s.target_tokens.as_slice()).collect(),
            &self.device,
        );
        TokenBatch { tokens, targets }
    }
}
