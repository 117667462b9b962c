// ============================================================
// Layer 5 — Captioning Model
// ============================================================
// Composition of vision embedding, multi-level encoder and a
// decoder variant, optionally carrying a frozen language model
// for the adaptive attention variant. Construction validates the
// fatal preconditions (meshed layer-count pairing, adaptive head
// dimensions) before any tensor is allocated.

use burn::{module::Module, prelude::*};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ml::attention::AttentionKind;
use crate::ml::decoder::{CaptionDecoder, Decoder, DecoderConfig, DecoderKind, DecoderState, MeshedDecoder};
use crate::ml::embedding::VisionEmbedding;
use crate::ml::encoder::{EncoderConfig, EncoderOutput, MultiLevelEncoder};
use crate::ml::geometry::GeometrySource;
use crate::ml::language::{LanguageBackbone, LanguageModel, LanguageModelConfig};

/// Fatal configuration errors, raised at construction — never
/// retried, never recovered.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("meshed decoder fuses over {decoder} encoder outputs but the encoder has {encoder} layers")]
    EncoderDecoderMismatch { encoder: usize, decoder: usize },
    #[error("adaptive attention reuses the projected signal as a value and needs d_k == d_v (got {d_k} and {d_v})")]
    AdaptiveHeadDims { d_k: usize, d_v: usize },
    #[error("d_model ({d_model}) must be divisible by the number of heads ({n_heads})")]
    HeadSplit { d_model: usize, n_heads: usize },
}

/// Everything needed to rebuild the exact architecture from a
/// checkpoint. Serialized into train_config.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptionModelConfig {
    pub vocab_size: usize,
    pub max_caption_length: usize,
    pub padding_idx: usize,
    pub bos_idx: usize,
    pub eos_idx: usize,
    /// Width of the precomputed visual features
    pub d_feature: usize,
    pub d_model: usize,
    pub d_k: usize,
    pub d_v: usize,
    pub n_heads: usize,
    pub n_enc_layers: usize,
    pub n_dec_layers: usize,
    pub d_ff: usize,
    pub dropout: f64,
    /// Encoder self-attention variant
    pub encoder_attention: AttentionKind,
    pub decoder: DecoderKind,
    pub use_aoa: bool,
    pub identity_map_reordering: bool,
    /// Language-conditioned variant: adaptive cross-attention fed
    /// by a frozen language model
    pub adaptive: bool,
    /// Backbone width of the language model (when adaptive)
    pub language_hidden_size: usize,
    /// Grid layout for grid-extracted features (no boxes)
    pub grid: Option<(usize, usize)>,
}

impl CaptionModelConfig {
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.d_model % self.n_heads != 0 {
            return Err(ModelError::HeadSplit { d_model: self.d_model, n_heads: self.n_heads });
        }
        if self.decoder == DecoderKind::Meshed && self.n_enc_layers != self.n_dec_layers {
            return Err(ModelError::EncoderDecoderMismatch {
                encoder: self.n_enc_layers,
                decoder: self.n_dec_layers,
            });
        }
        if self.adaptive && self.d_k != self.d_v {
            return Err(ModelError::AdaptiveHeadDims { d_k: self.d_k, d_v: self.d_v });
        }
        Ok(())
    }

    pub fn language_model_config(&self) -> LanguageModelConfig {
        LanguageModelConfig {
            vocab_size: self.vocab_size,
            padding_idx: self.padding_idx,
            hidden_size: self.language_hidden_size,
            d_model: self.d_model,
            d_k: self.d_k,
            d_v: self.d_v,
            n_heads: self.n_heads,
            d_ff: self.d_ff,
            dropout: self.dropout,
        }
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<CaptioningModel<B>, ModelError> {
        self.validate()?;

        let vision = VisionEmbedding::new(self.d_feature, self.d_model, self.dropout, device);

        let encoder_config = EncoderConfig {
            n_layers: self.n_enc_layers,
            d_model: self.d_model,
            d_k: self.d_k,
            d_v: self.d_v,
            n_heads: self.n_heads,
            d_ff: self.d_ff,
            dropout: self.dropout,
            identity_map_reordering: self.identity_map_reordering,
            use_aoa: self.use_aoa,
            attention: self.encoder_attention,
        };
        let encoder = MultiLevelEncoder::new(&encoder_config, device);

        let decoder_config = DecoderConfig {
            vocab_size: self.vocab_size,
            max_len: self.max_caption_length,
            n_layers: self.n_dec_layers,
            n_enc_layers: self.n_enc_layers,
            padding_idx: self.padding_idx,
            d_model: self.d_model,
            d_k: self.d_k,
            d_v: self.d_v,
            n_heads: self.n_heads,
            d_ff: self.d_ff,
            dropout: self.dropout,
            use_aoa: self.use_aoa,
            self_attention: AttentionKind::Plain,
            cross_attention: if self.adaptive { AttentionKind::Adaptive } else { AttentionKind::Plain },
        };
        let decoder = match self.decoder {
            DecoderKind::Simple => CaptionDecoder::Simple(Decoder::new(&decoder_config, device)),
            DecoderKind::Meshed => CaptionDecoder::Meshed(MeshedDecoder::new(&decoder_config, device)),
        };

        // A fresh language model; callers that trained one
        // separately swap it in frozen via `with_language_model`.
        let language_model = self
            .adaptive
            .then(|| self.language_model_config().init(device).frozen());

        Ok(CaptioningModel {
            vision,
            encoder,
            decoder,
            language_model,
            bos_idx: self.bos_idx,
            eos_idx: self.eos_idx,
            padding_idx: self.padding_idx,
        })
    }
}

/// Per-episode mutable decoding state: the decoder's running
/// caches plus the language model's own, when present.
#[derive(Debug, Clone)]
pub struct GenerationState<B: Backend> {
    pub decoder: DecoderState<B>,
    pub language: Option<DecoderState<B>>,
}

impl<B: Backend> GenerationState<B> {
    pub fn reorder(&mut self, indices: &Tensor<B, 1, Int>) {
        self.decoder.reorder(indices);
        if let Some(language) = &mut self.language {
            language.reorder(indices);
        }
    }

    pub fn expand_beams(&mut self, beam: usize) {
        self.decoder.expand_beams(beam);
        if let Some(language) = &mut self.language {
            language.expand_beams(beam);
        }
    }
}

#[derive(Module, Debug)]
pub struct CaptioningModel<B: Backend> {
    vision: VisionEmbedding<B>,
    encoder: MultiLevelEncoder<B>,
    decoder: CaptionDecoder<B>,
    language_model: Option<LanguageModel<B>>,
    bos_idx: usize,
    eos_idx: usize,
    padding_idx: usize,
}

impl<B: Backend> CaptioningModel<B> {
    pub fn bos_idx(&self) -> usize {
        self.bos_idx
    }

    pub fn eos_idx(&self) -> usize {
        self.eos_idx
    }

    pub fn padding_idx(&self) -> usize {
        self.padding_idx
    }

    /// Swap in a separately-trained language model; it is frozen
    /// on the way in.
    pub fn with_language_model(mut self, language_model: LanguageModel<B>) -> Self {
        self.language_model = Some(language_model.frozen());
        self
    }

    /// Project features to model space and run the encoder stack.
    pub fn encode(
        &self,
        features: Tensor<B, 3>,
        geometry: Option<&GeometrySource<B>>,
    ) -> EncoderOutput<B> {
        let (projected, padding_mask) = self.vision.forward(features);
        self.encoder.forward(projected, padding_mask, geometry)
    }

    /// Teacher-forced pass: full caption in, per-position
    /// vocabulary log-probabilities out.
    pub fn forward(
        &self,
        features: Tensor<B, 3>,
        geometry: Option<&GeometrySource<B>>,
        tokens: Tensor<B, 2, Int>,
    ) -> Tensor<B, 3> {
        let enc = self.encode(features, geometry);
        let signals = self
            .language_model
            .as_ref()
            .map(|lm| lm.encode(tokens.clone(), None));
        self.decoder.forward(tokens, &enc, signals.as_ref(), None)
    }

    /// Fresh per-episode state. Must be created (or reset) before
    /// every generation episode; never shared between episodes.
    pub fn begin_generation(&self) -> GenerationState<B> {
        GenerationState {
            decoder: DecoderState::new(self.decoder.num_layers()),
            language: self
                .language_model
                .as_ref()
                .map(|_| DecoderState::new(LanguageModel::<B>::STATEFUL_LAYERS)),
        }
    }

    /// One incremental decoding step: the current tokens (b, 1)
    /// against the cached prefix.
    pub fn step(
        &self,
        tokens: Tensor<B, 2, Int>,
        enc: &EncoderOutput<B>,
        state: &mut GenerationState<B>,
    ) -> Tensor<B, 3> {
        let signals = self
            .language_model
            .as_ref()
            .map(|lm| lm.encode(tokens.clone(), state.language.as_mut()));
        self.decoder
            .forward(tokens, enc, signals.as_ref(), Some(&mut state.decoder))
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    type TB = burn::backend::NdArray;
    type TDevice = <TB as Backend>::Device;

    pub(crate) fn tiny_config() -> CaptionModelConfig {
        CaptionModelConfig {
            vocab_size: 12,
            max_caption_length: 8,
            padding_idx: 0,
            bos_idx: 1,
            eos_idx: 2,
            d_feature: 8,
            d_model: 16,
            d_k: 8,
            d_v: 8,
            n_heads: 2,
            n_enc_layers: 2,
            n_dec_layers: 2,
            d_ff: 32,
            dropout: 0.0,
            encoder_attention: AttentionKind::Plain,
            decoder: DecoderKind::Simple,
            use_aoa: false,
            identity_map_reordering: false,
            adaptive: false,
            language_hidden_size: 24,
            grid: None,
        }
    }

    #[test]
    fn test_meshed_layer_mismatch_fails_before_any_tensor_work() {
        let mut config = tiny_config();
        config.decoder = DecoderKind::Meshed;
        config.n_dec_layers = 3; // encoder stays at 2
        let device: TDevice = Default::default();
        let err = config.init::<TB>(&device).unwrap_err();
        assert!(matches!(err, ModelError::EncoderDecoderMismatch { encoder: 2, decoder: 3 }));
    }

    #[test]
    fn test_adaptive_requires_matching_head_dims() {
        let mut config = tiny_config();
        config.adaptive = true;
        config.d_v = 4;
        let device: TDevice = Default::default();
        assert!(matches!(
            config.init::<TB>(&device).unwrap_err(),
            ModelError::AdaptiveHeadDims { .. }
        ));
    }

    #[test]
    fn test_teacher_forced_forward_shapes() {
        let device: TDevice = Default::default();
        let model = tiny_config().init::<TB>(&device).unwrap();
        let features = Tensor::random([2, 5, 8], burn::tensor::Distribution::Default, &device);
        let tokens = Tensor::<TB, 1, Int>::from_ints([1, 5, 7, 2, 1, 6, 8, 2].as_slice(), &device)
            .reshape([2, 4]);
        let out = model.forward(features, None, tokens);
        assert_eq!(out.dims(), [2, 4, 12]);
    }

    #[test]
    fn test_padded_region_does_not_influence_outputs() {
        // A batch element with 3 real regions and one all-zero
        // padded region must produce the same log-probabilities as
        // the same element without the padded row.
        let device: TDevice = Default::default();
        let model = tiny_config().init::<TB>(&device).unwrap();

        let real = Tensor::<TB, 3>::random([1, 3, 8], burn::tensor::Distribution::Default, &device);
        let padded = Tensor::cat(vec![real.clone(), Tensor::zeros([1, 1, 8], &device)], 1);

        let tokens = Tensor::<TB, 1, Int>::from_ints([1, 5, 7, 2, 0].as_slice(), &device)
            .reshape([1, 5]);

        let out_real = model.forward(real, None, tokens.clone());
        let out_padded = model.forward(padded, None, tokens);

        let diff = (out_real - out_padded).abs().max().into_scalar();
        assert!(diff < 1e-4, "padded region leaked into the outputs: {diff}");
    }

    #[test]
    fn test_adaptive_model_runs_end_to_end() {
        let mut config = tiny_config();
        config.adaptive = true;
        let device: TDevice = Default::default();
        let model = config.init::<TB>(&device).unwrap();
        let features = Tensor::random([1, 4, 8], burn::tensor::Distribution::Default, &device);
        let tokens = Tensor::<TB, 1, Int>::from_ints([1, 5, 7].as_slice(), &device).reshape([1, 3]);
        let out = model.forward(features, None, tokens);
        assert_eq!(out.dims(), [1, 3, 12]);
    }

    #[test]
    fn test_step_matches_teacher_forced_last_position() {
        let device: TDevice = Default::default();
        let model = tiny_config().init::<TB>(&device).unwrap();
        let features = Tensor::<TB, 3>::random([1, 4, 8], burn::tensor::Distribution::Default, &device);
        let sequence = [1i32, 5, 7];

        let full = model.forward(
            features.clone(),
            None,
            Tensor::<TB, 1, Int>::from_ints(sequence.as_slice(), &device).reshape([1, 3]),
        );
        let full_last = full.slice([0..1, 2..3, 0..12]);

        let enc = model.encode(features, None);
        let mut state = model.begin_generation();
        let mut last = None;
        for &t in &sequence {
            let step_tokens =
                Tensor::<TB, 1, Int>::from_ints([t].as_slice(), &device).reshape([1, 1]);
            last = Some(model.step(step_tokens, &enc, &mut state));
        }

        let diff = (last.unwrap() - full_last).abs().max().into_scalar();
        assert!(diff < 1e-4, "incremental step diverged from the full pass: {diff}");
    }
}
