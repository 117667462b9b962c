// ============================================================
// Layer 5 — Encoder Stack
// ============================================================
// N identical layers of self-attention + position-wise
// feed-forward over the projected visual features. Every
// intermediate layer output is retained, not just the last one:
// the meshed decoder cross-attends to all of them.

use burn::{module::Module, prelude::*};

use crate::ml::attention::{
    AttentionContext, AttentionKind, KvCache, MultiHeadAttention, MultiHeadAttentionConfig,
};
use crate::ml::feed_forward::PositionWiseFeedForward;
use crate::ml::geometry::GeometrySource;

/// Self-attention + feed-forward. Also reused by the language
/// model as its fine-tuning layer, which needs the cache hook
/// for incremental decoding.
#[derive(Module, Debug)]
pub struct EncoderLayer<B: Backend> {
    mhatt: MultiHeadAttention<B>,
    pwff: PositionWiseFeedForward<B>,
}

impl<B: Backend> EncoderLayer<B> {
    pub fn new(config: &EncoderConfig, kind: AttentionKind, device: &B::Device) -> Self {
        let mhatt = MultiHeadAttentionConfig::new(config.d_model, config.d_k, config.d_v, config.n_heads)
            .with_dropout(config.dropout)
            .with_identity_map_reordering(config.identity_map_reordering)
            .with_aoa(config.use_aoa)
            .with_kind(kind)
            .init(device);
        let pwff = PositionWiseFeedForward::new(
            config.d_model,
            config.d_ff,
            config.dropout,
            config.identity_map_reordering,
            device,
        );
        Self { mhatt, pwff }
    }

    pub fn forward(
        &self,
        input: Tensor<B, 3>,
        ctx: &AttentionContext<B>,
        cache: Option<&mut KvCache<B>>,
    ) -> Tensor<B, 3> {
        let att = self.mhatt.forward(input.clone(), input.clone(), input, ctx, cache);
        self.pwff.forward(att)
    }
}

/// Construction-time settings shared by every encoder layer.
#[derive(Debug, Clone)]
pub struct EncoderConfig {
    pub n_layers: usize,
    pub d_model: usize,
    pub d_k: usize,
    pub d_v: usize,
    pub n_heads: usize,
    pub d_ff: usize,
    pub dropout: f64,
    pub identity_map_reordering: bool,
    pub use_aoa: bool,
    pub attention: AttentionKind,
}

/// All N per-layer feature tensors plus the key padding mask
/// (b, 1, 1, n) shared by every decoder cross-attention.
#[derive(Debug, Clone)]
pub struct EncoderOutput<B: Backend> {
    pub layers: Vec<Tensor<B, 3>>,
    pub mask: Tensor<B, 4, Bool>,
}

impl<B: Backend> EncoderOutput<B> {
    pub fn last(&self) -> &Tensor<B, 3> {
        self.layers.last().expect("encoder produced no layers")
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// Duplicate every batch row `beam` times for beam search.
    pub fn expand_beams(&self, beam: usize) -> Self {
        let layers = self
            .layers
            .iter()
            .map(|t| crate::ml::attention::expand_rows(t.clone(), beam))
            .collect();
        let [b, one_a, one_b, n] = self.mask.dims();
        let mask = self
            .mask
            .clone()
            .unsqueeze_dim::<5>(1)
            .expand([b, beam, one_a, one_b, n])
            .reshape([b * beam, one_a, one_b, n]);
        Self { layers, mask }
    }
}

/// Stack of encoder layers retaining per-layer outputs.
#[derive(Module, Debug)]
pub struct MultiLevelEncoder<B: Backend> {
    layers: Vec<EncoderLayer<B>>,
}

impl<B: Backend> MultiLevelEncoder<B> {
    pub fn new(config: &EncoderConfig, device: &B::Device) -> Self {
        let layers = (0..config.n_layers)
            .map(|_| EncoderLayer::new(config, config.attention, device))
            .collect();
        Self { layers }
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    /// features (b, n, d_model), padding_mask (b, n) True = pad.
    pub fn forward(
        &self,
        features: Tensor<B, 3>,
        padding_mask: Tensor<B, 2, Bool>,
        geometry: Option<&GeometrySource<B>>,
    ) -> EncoderOutput<B> {
        let [b, n] = padding_mask.dims();
        let attention_mask = padding_mask.reshape([b, 1, 1, n]);

        let mut ctx = AttentionContext::new().with_mask(attention_mask.clone());
        if let Some(geometry) = geometry {
            ctx = ctx.with_geometry(geometry.clone());
        }

        let mut out = features;
        let mut outputs = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            out = layer.forward(out, &ctx, None);
            outputs.push(out.clone());
        }

        EncoderOutput { layers: outputs, mask: attention_mask }
    }
}
