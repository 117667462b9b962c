// ============================================================
// Layer 5 — Decoder Stack
// ============================================================
// Two decoder variants sharing the same embedding/masking
// prologue. The simple decoder cross-attends to the final
// encoder output; the meshed decoder cross-attends to every
// encoder layer output through learned sigmoid gates.
//
// Incremental decoding never hides state inside the modules: the
// caller owns a `DecoderState` (running causal mask, position
// counter, one key/value cache per layer) and passes it to
// `forward`. With a state the causal mask grows one column per
// step and the position advances by one even though only a
// single token is processed.
//
// Reference: Cornia et al. (2020) Meshed-Memory Transformer

use burn::{
    module::Module,
    nn::{
        attention::generate_autoregressive_mask, Embedding, EmbeddingConfig, Initializer, Linear,
        LinearConfig,
    },
    prelude::*,
    tensor::activation,
};

use crate::ml::attention::{
    AttentionContext, AttentionKind, KvCache, MultiHeadAttention, MultiHeadAttentionConfig,
};
use crate::ml::embedding::sinusoid_position_encoding;
use crate::ml::encoder::EncoderOutput;
use crate::ml::feed_forward::PositionWiseFeedForward;

/// Construction-time settings shared by both decoder variants.
#[derive(Debug, Clone)]
pub struct DecoderConfig {
    pub vocab_size: usize,
    pub max_len: usize,
    pub n_layers: usize,
    /// Encoder layer count the meshed decoder fuses over
    pub n_enc_layers: usize,
    pub padding_idx: usize,
    pub d_model: usize,
    pub d_k: usize,
    pub d_v: usize,
    pub n_heads: usize,
    pub d_ff: usize,
    pub dropout: f64,
    pub use_aoa: bool,
    /// Self-attention scoring variant (plain or memory-augmented)
    pub self_attention: AttentionKind,
    /// Cross-attention scoring variant (plain or adaptive)
    pub cross_attention: AttentionKind,
}

/// Caller-owned incremental decoding state. Exactly one exists
/// per generation episode; beam search expands and reorders it.
#[derive(Debug, Clone)]
pub struct DecoderState<B: Backend> {
    /// Running 1-based position of the next token
    pub step: usize,
    /// Accumulated causal/padding mask (b, 1, 1, len)
    pub running_mask: Option<Tensor<B, 4, Bool>>,
    /// One self-attention cache per decoder layer
    pub caches: Vec<KvCache<B>>,
}

impl<B: Backend> DecoderState<B> {
    pub fn new(n_layers: usize) -> Self {
        Self {
            step: 0,
            running_mask: None,
            caches: (0..n_layers).map(|_| KvCache::new()).collect(),
        }
    }

    pub fn reorder(&mut self, indices: &Tensor<B, 1, Int>) {
        self.running_mask = self
            .running_mask
            .take()
            .map(|m| m.int().select(0, indices.clone()).bool());
        for cache in &mut self.caches {
            cache.reorder(indices);
        }
    }

    pub fn expand_beams(&mut self, beam: usize) {
        self.running_mask = self.running_mask.take().map(|m| {
            let [b, one_a, one_b, len] = m.dims();
            m.unsqueeze_dim::<5>(1)
                .expand([b, beam, one_a, one_b, len])
                .reshape([b * beam, one_a, one_b, len])
        });
        for cache in &mut self.caches {
            cache.expand_beams(beam);
        }
    }
}

/// Shared embedding/masking prologue of both decoder variants
/// (the language model reuses it too).
pub(crate) struct Prologue<B: Backend> {
    /// (b, s) True = pad token
    pub(crate) mask_queries: Tensor<B, 2, Bool>,
    /// (b, s, 1) — the broadcastable form used to zero activations
    pub(crate) mask_pad: Tensor<B, 3, Bool>,
    /// (b, 1, s, len) look-ahead OR key-padding suppression
    pub(crate) mask_self: Tensor<B, 4, Bool>,
    /// (b, s) 1-based position ids, 0 at padding
    pub(crate) positions: Tensor<B, 2, Int>,
}

pub(crate) fn decoding_prologue<B: Backend>(
    tokens: &Tensor<B, 2, Int>,
    padding_idx: usize,
    state: &mut Option<&mut DecoderState<B>>,
) -> Prologue<B> {
    let [b, s] = tokens.dims();
    let device = tokens.device();

    let mask_queries = tokens.clone().equal_elem(padding_idx as i64);
    let causal = generate_autoregressive_mask::<B>(b, s, &device).unsqueeze_dim::<4>(1);
    let key_padding = mask_queries.clone().reshape([b, 1, 1, s]).expand([b, 1, s, s]);
    let mask_self = (causal.int() + key_padding.int()).greater_elem(0);

    let (mask_self, positions) = match state.as_deref_mut() {
        Some(state) => {
            // Keys accumulate in the running caches, so the mask
            // grows one column per step and the position counter
            // advances by one per call.
            let mask_self = match state.running_mask.take() {
                Some(previous) => Tensor::cat(vec![previous, mask_self], 3),
                None => mask_self,
            };
            state.running_mask = Some(mask_self.clone());
            state.step += 1;
            let positions = Tensor::<B, 2, Int>::full([b, s], state.step as i64, &device);
            (mask_self, positions)
        }
        None => {
            let positions = Tensor::<B, 1, Int>::arange(1..(s as i64) + 1, &device)
                .reshape([1, s])
                .expand([b, s])
                .mask_fill(mask_queries.clone(), 0);
            (mask_self, positions)
        }
    };

    let mask_pad = mask_queries.clone().reshape([b, s, 1]);
    Prologue { mask_queries, mask_pad, mask_self, positions }
}

/// Zero out padding positions so their activations cannot leak
/// into later layers through residual paths.
fn zero_padded<B: Backend>(x: Tensor<B, 3>, mask_pad: &Tensor<B, 3, Bool>) -> Tensor<B, 3> {
    let dims = x.dims();
    x.mask_fill(mask_pad.clone().expand(dims), 0.0)
}

// ─── Simple decoder ───────────────────────────────────────────────────────────

/// self-attention -> cross-attention to the final encoder output
/// -> feed-forward.
#[derive(Module, Debug)]
pub struct DecoderLayer<B: Backend> {
    self_attn: MultiHeadAttention<B>,
    enc_attn: MultiHeadAttention<B>,
    pwff: PositionWiseFeedForward<B>,
}

impl<B: Backend> DecoderLayer<B> {
    fn new(config: &DecoderConfig, device: &B::Device) -> Self {
        let self_attn =
            MultiHeadAttentionConfig::new(config.d_model, config.d_k, config.d_v, config.n_heads)
                .with_dropout(config.dropout)
                .with_aoa(config.use_aoa)
                .with_kind(config.self_attention)
                .init(device);
        let enc_attn =
            MultiHeadAttentionConfig::new(config.d_model, config.d_k, config.d_v, config.n_heads)
                .with_dropout(config.dropout)
                .with_aoa(config.use_aoa)
                .with_kind(config.cross_attention)
                .init(device);
        let pwff =
            PositionWiseFeedForward::new(config.d_model, config.d_ff, config.dropout, false, device);
        Self { self_attn, enc_attn, pwff }
    }

    #[allow(clippy::too_many_arguments)]
    fn forward(
        &self,
        input: Tensor<B, 3>,
        enc_output: &Tensor<B, 3>,
        language_signals: Option<&Tensor<B, 3>>,
        mask_pad: &Tensor<B, 3, Bool>,
        mask_self: Tensor<B, 4, Bool>,
        mask_enc: &Tensor<B, 4, Bool>,
        cache: Option<&mut KvCache<B>>,
    ) -> Tensor<B, 3> {
        let self_ctx = AttentionContext::new().with_mask(mask_self);
        let self_att =
            self.self_attn.forward(input.clone(), input.clone(), input, &self_ctx, cache);
        let self_att = zero_padded(self_att, mask_pad);

        let mut enc_ctx = AttentionContext::new().with_mask(mask_enc.clone());
        if let Some(signals) = language_signals {
            enc_ctx = enc_ctx.with_language_signals(signals.clone());
        }
        let enc_att = self.enc_attn.forward(
            self_att,
            enc_output.clone(),
            enc_output.clone(),
            &enc_ctx,
            None,
        );
        let enc_att = zero_padded(enc_att, mask_pad);

        zero_padded(self.pwff.forward(enc_att), mask_pad)
    }
}

/// N-layer decoder attending to the single final encoder output.
#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    word_emb: Embedding<B>,
    layers: Vec<DecoderLayer<B>>,
    fc_vocab: Linear<B>,
    d_model: usize,
    padding_idx: usize,
    max_len: usize,
}

impl<B: Backend> Decoder<B> {
    pub fn new(config: &DecoderConfig, device: &B::Device) -> Self {
        Self {
            word_emb: EmbeddingConfig::new(config.vocab_size, config.d_model).init(device),
            layers: (0..config.n_layers).map(|_| DecoderLayer::new(config, device)).collect(),
            fc_vocab: LinearConfig::new(config.d_model, config.vocab_size)
                .with_bias(false)
                .with_initializer(Initializer::XavierUniform { gain: 1.0 })
                .init(device),
            d_model: config.d_model,
            padding_idx: config.padding_idx,
            max_len: config.max_len,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// tokens (b, s) -> per-token vocabulary log-probabilities
    /// (b, s, vocab).
    pub fn forward(
        &self,
        tokens: Tensor<B, 2, Int>,
        enc: &EncoderOutput<B>,
        language_signals: Option<&Tensor<B, 3>>,
        state: Option<&mut DecoderState<B>>,
    ) -> Tensor<B, 3> {
        let mut state = state;
        let prologue = decoding_prologue(&tokens, self.padding_idx, &mut state);

        let emb = zero_padded(self.word_emb.forward(tokens), &prologue.mask_pad);
        let mut out = emb + sinusoid_position_encoding(prologue.positions.clone(), self.d_model);

        for (i, layer) in self.layers.iter().enumerate() {
            let cache = state.as_deref_mut().map(|s| &mut s.caches[i]);
            out = layer.forward(
                out,
                enc.last(),
                language_signals,
                &prologue.mask_pad,
                prologue.mask_self.clone(),
                &enc.mask,
                cache,
            );
        }

        activation::log_softmax(self.fc_vocab.forward(out), 2)
    }
}

// ─── Meshed decoder ───────────────────────────────────────────────────────────

/// Cross-attention runs once per encoder layer output; each
/// result is gated by a sigmoid over (self_att, cross_att) and
/// the gated results are summed and scaled by 1/sqrt(N).
#[derive(Module, Debug)]
pub struct MeshedDecoderLayer<B: Backend> {
    self_attn: MultiHeadAttention<B>,
    enc_attn: MultiHeadAttention<B>,
    pwff: PositionWiseFeedForward<B>,
    fc_alphas: Vec<Linear<B>>,
    n_enc: usize,
}

impl<B: Backend> MeshedDecoderLayer<B> {
    fn new(config: &DecoderConfig, device: &B::Device) -> Self {
        let self_attn =
            MultiHeadAttentionConfig::new(config.d_model, config.d_k, config.d_v, config.n_heads)
                .with_dropout(config.dropout)
                .with_aoa(config.use_aoa)
                .with_kind(config.self_attention)
                .init(device);
        let enc_attn =
            MultiHeadAttentionConfig::new(config.d_model, config.d_k, config.d_v, config.n_heads)
                .with_dropout(config.dropout)
                .with_aoa(config.use_aoa)
                .with_kind(config.cross_attention)
                .init(device);
        let pwff =
            PositionWiseFeedForward::new(config.d_model, config.d_ff, config.dropout, false, device);
        let fc_alphas = (0..config.n_enc_layers)
            .map(|_| {
                LinearConfig::new(2 * config.d_model, config.d_model)
                    .with_initializer(Initializer::XavierUniform { gain: 1.0 })
                    .init(device)
            })
            .collect();
        Self { self_attn, enc_attn, pwff, fc_alphas, n_enc: config.n_enc_layers }
    }

    #[allow(clippy::too_many_arguments)]
    fn forward(
        &self,
        input: Tensor<B, 3>,
        enc: &EncoderOutput<B>,
        language_signals: Option<&Tensor<B, 3>>,
        mask_pad: &Tensor<B, 3, Bool>,
        mask_self: Tensor<B, 4, Bool>,
        cache: Option<&mut KvCache<B>>,
    ) -> Tensor<B, 3> {
        assert_eq!(
            enc.num_layers(),
            self.n_enc,
            "meshed decoder fuses over {} encoder outputs but received {}",
            self.n_enc,
            enc.num_layers()
        );

        let self_ctx = AttentionContext::new().with_mask(mask_self);
        let self_att =
            self.self_attn.forward(input.clone(), input.clone(), input, &self_ctx, cache);
        let self_att = zero_padded(self_att, mask_pad);

        let mut enc_ctx = AttentionContext::new().with_mask(enc.mask.clone());
        if let Some(signals) = language_signals {
            enc_ctx = enc_ctx.with_language_signals(signals.clone());
        }

        let mut fused: Option<Tensor<B, 3>> = None;
        for (level, fc_alpha) in enc.layers.iter().zip(self.fc_alphas.iter()) {
            let cross = self.enc_attn.forward(
                self_att.clone(),
                level.clone(),
                level.clone(),
                &enc_ctx,
                None,
            );
            let cross = zero_padded(cross, mask_pad);
            let alpha = activation::sigmoid(
                fc_alpha.forward(Tensor::cat(vec![self_att.clone(), cross.clone()], 2)),
            );
            let gated = cross * alpha;
            fused = Some(match fused {
                Some(acc) => acc + gated,
                None => gated,
            });
        }
        let fused = fused.expect("meshed decoder requires at least one encoder output")
            / (self.n_enc as f32).sqrt();

        zero_padded(self.pwff.forward(fused), mask_pad)
    }
}

/// N-layer decoder whose every layer attends to all encoder
/// layer outputs.
#[derive(Module, Debug)]
pub struct MeshedDecoder<B: Backend> {
    word_emb: Embedding<B>,
    layers: Vec<MeshedDecoderLayer<B>>,
    fc_vocab: Linear<B>,
    d_model: usize,
    padding_idx: usize,
    max_len: usize,
    n_enc: usize,
}

impl<B: Backend> MeshedDecoder<B> {
    pub fn new(config: &DecoderConfig, device: &B::Device) -> Self {
        Self {
            word_emb: EmbeddingConfig::new(config.vocab_size, config.d_model).init(device),
            layers: (0..config.n_layers)
                .map(|_| MeshedDecoderLayer::new(config, device))
                .collect(),
            fc_vocab: LinearConfig::new(config.d_model, config.vocab_size)
                .with_bias(false)
                .with_initializer(Initializer::XavierUniform { gain: 1.0 })
                .init(device),
            d_model: config.d_model,
            padding_idx: config.padding_idx,
            max_len: config.max_len,
            n_enc: config.n_enc_layers,
        }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn forward(
        &self,
        tokens: Tensor<B, 2, Int>,
        enc: &EncoderOutput<B>,
        language_signals: Option<&Tensor<B, 3>>,
        state: Option<&mut DecoderState<B>>,
    ) -> Tensor<B, 3> {
        let mut state = state;
        let prologue = decoding_prologue(&tokens, self.padding_idx, &mut state);

        let emb = zero_padded(self.word_emb.forward(tokens), &prologue.mask_pad);
        let mut out = emb + sinusoid_position_encoding(prologue.positions.clone(), self.d_model);

        for (i, layer) in self.layers.iter().enumerate() {
            let cache = state.as_deref_mut().map(|s| &mut s.caches[i]);
            out = layer.forward(
                out,
                enc,
                language_signals,
                &prologue.mask_pad,
                prologue.mask_self.clone(),
                cache,
            );
        }

        activation::log_softmax(self.fc_vocab.forward(out), 2)
    }
}

// ─── Variant dispatch ─────────────────────────────────────────────────────────

/// Which decoder a model uses, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DecoderKind {
    Simple,
    Meshed,
}

#[derive(Module, Debug)]
pub enum CaptionDecoder<B: Backend> {
    Simple(Decoder<B>),
    Meshed(MeshedDecoder<B>),
}

impl<B: Backend> CaptionDecoder<B> {
    pub fn forward(
        &self,
        tokens: Tensor<B, 2, Int>,
        enc: &EncoderOutput<B>,
        language_signals: Option<&Tensor<B, 3>>,
        state: Option<&mut DecoderState<B>>,
    ) -> Tensor<B, 3> {
        match self {
            CaptionDecoder::Simple(decoder) => decoder.forward(tokens, enc, language_signals, state),
            CaptionDecoder::Meshed(decoder) => decoder.forward(tokens, enc, language_signals, state),
        }
    }

    pub fn num_layers(&self) -> usize {
        match self {
            CaptionDecoder::Simple(decoder) => decoder.num_layers(),
            CaptionDecoder::Meshed(decoder) => decoder.num_layers(),
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    type TB = burn::backend::NdArray;
    type TDevice = <TB as Backend>::Device;

    const VOCAB: usize = 12;
    const PAD: usize = 0;

    fn config(n_layers: usize, n_enc: usize) -> DecoderConfig {
        DecoderConfig {
            vocab_size: VOCAB,
            max_len: 10,
            n_layers,
            n_enc_layers: n_enc,
            padding_idx: PAD,
            d_model: 16,
            d_k: 8,
            d_v: 8,
            n_heads: 2,
            d_ff: 32,
            dropout: 0.0,
            use_aoa: false,
            self_attention: AttentionKind::Plain,
            cross_attention: AttentionKind::Plain,
        }
    }

    fn fake_encoder_output(n_layers: usize, b: usize, n: usize, device: &TDevice) -> EncoderOutput<TB> {
        let layers = (0..n_layers)
            .map(|_| Tensor::random([b, n, 16], burn::tensor::Distribution::Default, device))
            .collect();
        let mask = Tensor::<TB, 4>::zeros([b, 1, 1, n], device).equal_elem(1.0);
        EncoderOutput { layers, mask }
    }

    fn tokens(ids: &[i64], device: &TDevice) -> Tensor<TB, 2, Int> {
        let data: Vec<i32> = ids.iter().map(|&x| x as i32).collect();
        Tensor::<TB, 1, Int>::from_ints(data.as_slice(), device).reshape([1, ids.len()])
    }

    #[test]
    fn test_causal_mask_blocks_future_positions() {
        // Changing a later token must not change any earlier
        // position's distribution.
        let device: TDevice = Default::default();
        let decoder = Decoder::<TB>::new(&config(2, 1), &device);
        let enc = fake_encoder_output(1, 1, 4, &device);

        let out_a = decoder.forward(tokens(&[1, 5, 7, 9], &device), &enc, None, None);
        let out_b = decoder.forward(tokens(&[1, 5, 7, 3], &device), &enc, None, None);

        let prefix_a = out_a.slice([0..1, 0..3, 0..VOCAB]);
        let prefix_b = out_b.slice([0..1, 0..3, 0..VOCAB]);
        let diff = (prefix_a - prefix_b).abs().max().into_scalar();
        assert!(diff < 1e-5, "future token leaked into earlier positions: {diff}");
    }

    #[test]
    fn test_trailing_padding_does_not_change_prefix() {
        let device: TDevice = Default::default();
        let decoder = Decoder::<TB>::new(&config(2, 1), &device);
        let enc = fake_encoder_output(1, 1, 4, &device);

        let short = decoder.forward(tokens(&[1, 5, 7, 2], &device), &enc, None, None);
        let padded = decoder.forward(tokens(&[1, 5, 7, 2, 0], &device), &enc, None, None);

        let prefix = padded.slice([0..1, 0..4, 0..VOCAB]);
        let diff = (short - prefix).abs().max().into_scalar();
        assert!(diff < 1e-5, "padding changed non-padding outputs: {diff}");
    }

    #[test]
    fn test_incremental_matches_full_forward() {
        // Step-by-step decoding with a fresh state must produce
        // the same final-position distribution as one full pass.
        let device: TDevice = Default::default();
        let decoder = Decoder::<TB>::new(&config(2, 1), &device);
        let enc = fake_encoder_output(1, 1, 5, &device);
        let sequence = [1i64, 4, 6, 8];

        let full = decoder.forward(tokens(&sequence, &device), &enc, None, None);
        let full_last = full.slice([0..1, 3..4, 0..VOCAB]);

        let mut state = DecoderState::new(decoder.num_layers());
        let mut step_out = None;
        for &token in &sequence {
            step_out = Some(decoder.forward(tokens(&[token], &device), &enc, None, Some(&mut state)));
        }
        assert_eq!(state.step, sequence.len());

        let diff = (step_out.unwrap() - full_last).abs().max().into_scalar();
        assert!(diff < 1e-4, "incremental decoding diverged from the full pass: {diff}");
    }

    #[test]
    fn test_meshed_incremental_matches_full_forward() {
        let device: TDevice = Default::default();
        let decoder = MeshedDecoder::<TB>::new(&config(2, 3), &device);
        let enc = fake_encoder_output(3, 1, 4, &device);
        let sequence = [1i64, 3, 5];

        let full = decoder.forward(tokens(&sequence, &device), &enc, None, None);
        let full_last = full.slice([0..1, 2..3, 0..VOCAB]);

        let mut state = DecoderState::new(decoder.num_layers());
        let mut step_out = None;
        for &token in &sequence {
            step_out = Some(decoder.forward(tokens(&[token], &device), &enc, None, Some(&mut state)));
        }

        let diff = (step_out.unwrap() - full_last).abs().max().into_scalar();
        assert!(diff < 1e-4);
    }

    #[test]
    #[should_panic(expected = "meshed decoder fuses over")]
    fn test_meshed_rejects_wrong_encoder_layer_count() {
        let device: TDevice = Default::default();
        let decoder = MeshedDecoder::<TB>::new(&config(1, 3), &device);
        let enc = fake_encoder_output(2, 1, 4, &device);
        decoder.forward(tokens(&[1, 4], &device), &enc, None, None);
    }

    #[test]
    fn test_output_is_log_distribution() {
        let device: TDevice = Default::default();
        let decoder = Decoder::<TB>::new(&config(1, 1), &device);
        let enc = fake_encoder_output(1, 1, 3, &device);
        let out = decoder.forward(tokens(&[1, 5], &device), &enc, None, None);
        // each position's probabilities sum to one
        let total = out.exp().sum_dim(2).reshape([2]).into_data().to_vec::<f32>().unwrap();
        for p in total {
            assert!((p - 1.0).abs() < 1e-4);
        }
    }
}
