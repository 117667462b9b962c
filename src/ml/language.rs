// ============================================================
// Layer 5 — Language Model
// ============================================================
// A compact causal language model over caption tokens: an
// embedding backbone at its own hidden width, a projection into
// model space, sinusoidal positions and one encoder-style
// self-attention layer for fine-tuning. It serves two roles:
//
//   (a) trained standalone on captions with the auxiliary
//       next-token objective (the `train-lm` command), producing
//       vocabulary log-probabilities;
//   (b) loaded from that checkpoint, frozen, and embedded in the
//       captioning model as an opaque feature producer whose
//       hidden states become the `language_signals` of the
//       adaptive attention variant.
//
// The captioning model never inspects the backbone's insides —
// it only calls `LanguageBackbone::encode`, and no gradient
// flows into frozen weights.

use burn::{
    module::Module,
    nn::{Embedding, EmbeddingConfig, Linear, LinearConfig},
    prelude::*,
    tensor::activation,
};
use serde::{Deserialize, Serialize};

use crate::ml::attention::{AttentionContext, AttentionKind};
use crate::ml::decoder::{decoding_prologue, DecoderState};
use crate::ml::embedding::sinusoid_position_encoding;
use crate::ml::encoder::{EncoderConfig, EncoderLayer};

/// Feature-producer seam the adaptive decoder consumes. The
/// caller owns the incremental state, same as the decoder.
pub trait LanguageBackbone<B: Backend> {
    /// tokens (b, s) -> hidden states (b, s, d_model)
    fn encode(&self, tokens: Tensor<B, 2, Int>, state: Option<&mut DecoderState<B>>)
        -> Tensor<B, 3>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageModelConfig {
    pub vocab_size: usize,
    pub padding_idx: usize,
    /// Backbone embedding width (projected down to d_model)
    pub hidden_size: usize,
    pub d_model: usize,
    pub d_k: usize,
    pub d_v: usize,
    pub n_heads: usize,
    pub d_ff: usize,
    pub dropout: f64,
}

impl LanguageModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> LanguageModel<B> {
        let refine_config = EncoderConfig {
            n_layers: 1,
            d_model: self.d_model,
            d_k: self.d_k,
            d_v: self.d_v,
            n_heads: self.n_heads,
            d_ff: self.d_ff,
            dropout: self.dropout,
            identity_map_reordering: false,
            use_aoa: false,
            attention: AttentionKind::Plain,
        };
        LanguageModel {
            word_emb: EmbeddingConfig::new(self.vocab_size, self.hidden_size).init(device),
            proj: LinearConfig::new(self.hidden_size, self.d_model).init(device),
            refine: EncoderLayer::new(&refine_config, AttentionKind::Plain, device),
            vocab_head: LinearConfig::new(self.d_model, self.vocab_size).init(device),
            d_model: self.d_model,
            padding_idx: self.padding_idx,
        }
    }
}

#[derive(Module, Debug)]
pub struct LanguageModel<B: Backend> {
    word_emb: Embedding<B>,
    proj: Linear<B>,
    refine: EncoderLayer<B>,
    vocab_head: Linear<B>,
    d_model: usize,
    padding_idx: usize,
}

impl<B: Backend> LanguageModel<B> {
    /// Number of stateful attention layers — sizes the caller's
    /// `DecoderState`.
    pub const STATEFUL_LAYERS: usize = 1;

    /// tokens (b, s) -> (vocabulary log-probs (b, s, vocab),
    /// hidden features (b, s, d_model)).
    pub fn forward(
        &self,
        tokens: Tensor<B, 2, Int>,
        state: Option<&mut DecoderState<B>>,
    ) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let mut state = state;
        let prologue = decoding_prologue(&tokens, self.padding_idx, &mut state);

        let hidden = self.word_emb.forward(tokens);
        let feature = self.proj.forward(hidden)
            + sinusoid_position_encoding(prologue.positions.clone(), self.d_model);

        let ctx = AttentionContext::new().with_mask(prologue.mask_self.clone());
        let cache = state.as_deref_mut().map(|s| &mut s.caches[0]);
        let feature = self.refine.forward(feature, &ctx, cache);

        let logits = self.vocab_head.forward(feature.clone());
        (activation::log_softmax(logits, 2), feature)
    }

    /// Freeze every parameter: the captioning model treats this
    /// as a fixed feature producer.
    pub fn frozen(self) -> Self {
        self.no_grad()
    }
}

impl<B: Backend> LanguageBackbone<B> for LanguageModel<B> {
    fn encode(
        &self,
        tokens: Tensor<B, 2, Int>,
        state: Option<&mut DecoderState<B>>,
    ) -> Tensor<B, 3> {
        self.forward(tokens, state).1
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    type TB = burn::backend::NdArray;
    type TDevice = <TB as Backend>::Device;

    fn config() -> LanguageModelConfig {
        LanguageModelConfig {
            vocab_size: 12,
            padding_idx: 0,
            hidden_size: 24,
            d_model: 16,
            d_k: 8,
            d_v: 8,
            n_heads: 2,
            d_ff: 32,
            dropout: 0.0,
        }
    }

    fn tokens(ids: &[i32], device: &TDevice) -> Tensor<TB, 2, Int> {
        Tensor::<TB, 1, Int>::from_ints(ids, device).reshape([1, ids.len()])
    }

    #[test]
    fn test_dual_outputs() {
        let device: TDevice = Default::default();
        let lm = config().init::<TB>(&device);
        let (log_probs, features) = lm.forward(tokens(&[1, 4, 6], &device), None);
        assert_eq!(log_probs.dims(), [1, 3, 12]);
        assert_eq!(features.dims(), [1, 3, 16]);
        let total = log_probs.exp().sum_dim(2).reshape([3]).into_data().to_vec::<f32>().unwrap();
        for p in total {
            assert!((p - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_incremental_features_match_full_pass() {
        let device: TDevice = Default::default();
        let lm = config().init::<TB>(&device);
        let sequence = [1i32, 4, 6, 8];

        let (_, full) = lm.forward(tokens(&sequence, &device), None);
        let full_last = full.slice([0..1, 3..4, 0..16]);

        let mut state = DecoderState::new(LanguageModel::<TB>::STATEFUL_LAYERS);
        let mut last = None;
        for &t in &sequence {
            let (_, features) = lm.forward(tokens(&[t], &device), Some(&mut state));
            last = Some(features);
        }

        let diff = (last.unwrap() - full_last).abs().max().into_scalar();
        assert!(diff < 1e-4, "incremental language features diverged: {diff}");
    }
}
