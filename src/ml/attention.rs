// ============================================================
// Layer 5 — Attention Engine
// ============================================================
// The four scoring variants over (query, key, value) triples and
// the multi-head wrapper that hosts them. The variant is chosen
// once at model construction; every variant keeps the same
// (b, nq, d_model) -> (b, nq, d_model) contract.
//
// Statefulness for incremental decoding is NOT hidden inside the
// module: the caller owns a `KvCache` and passes it in, so the
// same layer can serve unrelated generation episodes without
// aliasing surprises.
//
// Reference: Vaswani et al. (2017) Attention Is All You Need
//            Herdade et al. (2019) Objects into Words
//            Cornia et al. (2020) Meshed-Memory Transformer
//            Huang et al. (2019) Attention on Attention

use burn::{
    module::{Module, Param},
    nn::{
        Dropout, DropoutConfig, Initializer, LayerNorm, LayerNormConfig, Linear, LinearConfig,
    },
    prelude::*,
    tensor::activation,
};
use serde::{Deserialize, Serialize};

use crate::ml::geometry::{box_relational_embedding, GeometrySource};

/// Linear projection with Xavier-uniform weights, the
/// initialization every attention projection uses.
pub(crate) fn xavier_linear<B: Backend>(
    d_input: usize,
    d_output: usize,
    device: &B::Device,
) -> Linear<B> {
    LinearConfig::new(d_input, d_output)
        .with_initializer(Initializer::XavierUniform { gain: 1.0 })
        .init(device)
}

/// (b, n, h*d) -> (b, h, n, d)
pub(crate) fn split_heads<B: Backend>(
    x: Tensor<B, 3>,
    n_heads: usize,
    d_head: usize,
) -> Tensor<B, 4> {
    let [b, n, _] = x.dims();
    x.reshape([b, n, n_heads, d_head]).swap_dims(1, 2)
}

/// (b, h, n, d) -> (b, n, h*d)
pub(crate) fn merge_heads<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 3> {
    let [b, h, n, d] = x.dims();
    x.swap_dims(1, 2).reshape([b, n, h * d])
}

/// Apply optional multiplicative weights then the boolean
/// suppression mask (True = -inf before softmax).
fn weight_and_mask<B: Backend>(
    scores: Tensor<B, 4>,
    mask: Option<&Tensor<B, 4, Bool>>,
    weights: Option<&Tensor<B, 4>>,
) -> Tensor<B, 4> {
    let [b, h, nq, nk] = scores.dims();
    let mut scores = scores;
    if let Some(w) = weights {
        scores = scores * w.clone().expand([b, h, nq, nk]);
    }
    if let Some(m) = mask {
        scores = scores.mask_fill(m.clone().expand([b, h, nq, nk]), f32::NEG_INFINITY);
    }
    scores
}

// ─── Plain Scaled Dot-Product ─────────────────────────────────────────────────

/// score = Q·Kᵗ / sqrt(d_k), softmax over keys, weighted sum of V.
#[derive(Module, Debug)]
pub struct ScaledDotProductAttention<B: Backend> {
    pub(crate) fc_q: Linear<B>,
    pub(crate) fc_k: Linear<B>,
    pub(crate) fc_v: Linear<B>,
    pub(crate) fc_o: Linear<B>,
    pub(crate) n_heads: usize,
    pub(crate) d_k: usize,
    pub(crate) d_v: usize,
}

impl<B: Backend> ScaledDotProductAttention<B> {
    pub fn new(d_model: usize, d_k: usize, d_v: usize, n_heads: usize, device: &B::Device) -> Self {
        Self {
            fc_q: xavier_linear(d_model, n_heads * d_k, device),
            fc_k: xavier_linear(d_model, n_heads * d_k, device),
            fc_v: xavier_linear(d_model, n_heads * d_v, device),
            fc_o: xavier_linear(n_heads * d_v, d_model, device),
            n_heads,
            d_k,
            d_v,
        }
    }

    /// queries (b, nq, d_model), keys/values (b, nk, d_model)
    /// -> (b, nq, d_model)
    pub fn forward(
        &self,
        queries: Tensor<B, 3>,
        keys: Tensor<B, 3>,
        values: Tensor<B, 3>,
        mask: Option<&Tensor<B, 4, Bool>>,
        weights: Option<&Tensor<B, 4>>,
    ) -> Tensor<B, 3> {
        let q = split_heads(self.fc_q.forward(queries), self.n_heads, self.d_k);
        let k = split_heads(self.fc_k.forward(keys), self.n_heads, self.d_k);
        let v = split_heads(self.fc_v.forward(values), self.n_heads, self.d_v);

        let scores = q.matmul(k.transpose()) / (self.d_k as f32).sqrt(); // (b, h, nq, nk)
        let scores = weight_and_mask(scores, mask, weights);
        let att = activation::softmax(scores, 3);

        self.fc_o.forward(merge_heads(att.matmul(v)))
    }
}

// ─── Geometry-Augmented ───────────────────────────────────────────────────────

/// Scaled dot-product with a pairwise box-relation bias: the
/// relative-geometry embedding is projected per head to a scalar,
/// clamped to a positive floor and added in log space to the raw
/// score (equivalent to multiplying the softmax weights).
#[derive(Module, Debug)]
pub struct AugmentedGeometryAttention<B: Backend> {
    pub(crate) fc_q: Linear<B>,
    pub(crate) fc_k: Linear<B>,
    pub(crate) fc_v: Linear<B>,
    pub(crate) fc_o: Linear<B>,
    pub(crate) fc_gs: Vec<Linear<B>>,
    pub(crate) n_heads: usize,
    pub(crate) d_k: usize,
    pub(crate) d_v: usize,
    pub(crate) d_g: usize,
    pub(crate) trigonometric: bool,
}

impl<B: Backend> AugmentedGeometryAttention<B> {
    pub fn new(
        d_model: usize,
        d_k: usize,
        d_v: usize,
        n_heads: usize,
        trigonometric: bool,
        device: &B::Device,
    ) -> Self {
        let d_g = if trigonometric { d_model / n_heads } else { 4 };
        Self {
            fc_q: xavier_linear(d_model, n_heads * d_k, device),
            fc_k: xavier_linear(d_model, n_heads * d_k, device),
            fc_v: xavier_linear(d_model, n_heads * d_v, device),
            fc_o: xavier_linear(n_heads * d_v, d_model, device),
            fc_gs: (0..n_heads).map(|_| xavier_linear(d_g, 1, device)).collect(),
            n_heads,
            d_k,
            d_v,
            d_g,
            trigonometric,
        }
    }

    pub fn forward(
        &self,
        queries: Tensor<B, 3>,
        keys: Tensor<B, 3>,
        values: Tensor<B, 3>,
        geometry: &GeometrySource<B>,
        mask: Option<&Tensor<B, 4, Bool>>,
        weights: Option<&Tensor<B, 4>>,
    ) -> Tensor<B, 3> {
        let [b, nq, _] = queries.dims();
        let nk = keys.dims()[1];
        assert_eq!(nq, nk, "geometry attention is self-attention: nq must equal nk");
        let device = queries.device();

        // Per-head scalar weight from the pairwise geometry embedding
        let boxes = geometry.boxes(b, nk, &device);
        let embedding = box_relational_embedding(boxes, self.d_g, self.trigonometric);
        let flat = embedding.reshape([b * nk * nk, self.d_g]);
        let per_head: Vec<Tensor<B, 4>> = self
            .fc_gs
            .iter()
            .map(|fc_g| fc_g.forward(flat.clone()).reshape([b, 1, nk, nk]))
            .collect();
        let geometry_weights = activation::relu(Tensor::cat(per_head, 1)); // (b, h, nk, nk)

        let q = split_heads(self.fc_q.forward(queries), self.n_heads, self.d_k);
        let k = split_heads(self.fc_k.forward(keys), self.n_heads, self.d_k);
        let v = split_heads(self.fc_v.forward(values), self.n_heads, self.d_v);

        let scores = q.matmul(k.transpose()) / (self.d_k as f32).sqrt();
        let scores = weight_and_mask(scores, mask, weights);
        // log-space geometric bias; the clamp keeps the log in-domain
        let scores = geometry_weights.clamp_min(1e-6).log() + scores;
        let att = activation::softmax(scores, 3);

        self.fc_o.forward(merge_heads(att.matmul(v)))
    }
}

// ─── Memory-Augmented ─────────────────────────────────────────────────────────

/// Scaled dot-product with `m` learned key/value slots appended
/// to K and V. Masking and multiplicative weights only ever touch
/// the real (non-memory) columns; memory slots stay visible.
#[derive(Module, Debug)]
pub struct AugmentedMemoryAttention<B: Backend> {
    pub(crate) fc_q: Linear<B>,
    pub(crate) fc_k: Linear<B>,
    pub(crate) fc_v: Linear<B>,
    pub(crate) fc_o: Linear<B>,
    pub(crate) m_k: Param<Tensor<B, 3>>,
    pub(crate) m_v: Param<Tensor<B, 3>>,
    pub(crate) n_heads: usize,
    pub(crate) d_k: usize,
    pub(crate) d_v: usize,
    pub(crate) slots: usize,
}

impl<B: Backend> AugmentedMemoryAttention<B> {
    pub fn new(
        d_model: usize,
        d_k: usize,
        d_v: usize,
        n_heads: usize,
        slots: usize,
        device: &B::Device,
    ) -> Self {
        assert!(slots > 0, "memory attention needs at least one slot");
        Self {
            fc_q: xavier_linear(d_model, n_heads * d_k, device),
            fc_k: xavier_linear(d_model, n_heads * d_k, device),
            fc_v: xavier_linear(d_model, n_heads * d_v, device),
            fc_o: xavier_linear(n_heads * d_v, d_model, device),
            m_k: Initializer::Normal { mean: 0.0, std: 1.0 / d_k as f64 }
                .init([1, slots, n_heads * d_k], device),
            m_v: Initializer::Normal { mean: 0.0, std: 1.0 / slots as f64 }
                .init([1, slots, n_heads * d_v], device),
            n_heads,
            d_k,
            d_v,
            slots,
        }
    }

    pub fn forward(
        &self,
        queries: Tensor<B, 3>,
        keys: Tensor<B, 3>,
        values: Tensor<B, 3>,
        mask: Option<&Tensor<B, 4, Bool>>,
        weights: Option<&Tensor<B, 4>>,
    ) -> Tensor<B, 3> {
        let [b, nq, _] = queries.dims();
        let nk = keys.dims()[1];
        let m = self.slots;
        let h = self.n_heads;

        let m_k = self.m_k.val().mul_scalar((self.d_k as f32).sqrt()).expand([
            b,
            m,
            h * self.d_k,
        ]);
        let m_v = self.m_v.val().mul_scalar((m as f32).sqrt()).expand([b, m, h * self.d_v]);

        let q = split_heads(self.fc_q.forward(queries), h, self.d_k);
        let k = split_heads(Tensor::cat(vec![self.fc_k.forward(keys), m_k], 1), h, self.d_k);
        let v = split_heads(Tensor::cat(vec![self.fc_v.forward(values), m_v], 1), h, self.d_v);

        let scores = q.matmul(k.transpose()) / (self.d_k as f32).sqrt(); // (b, h, nq, nk + m)

        // Split into real and memory columns: adjustments apply to
        // the real part only.
        let real = scores.clone().slice([0..b, 0..h, 0..nq, 0..nk]);
        let memory = scores.slice([0..b, 0..h, 0..nq, nk..nk + m]);
        let real = weight_and_mask(real, mask, weights);
        let scores = Tensor::cat(vec![real, memory], 3);

        let att = activation::softmax(scores, 3);
        self.fc_o.forward(merge_heads(att.matmul(v)))
    }
}

// ─── Adaptive (language-gated) ────────────────────────────────────────────────

/// Scaled dot-product extended with one extra softmax choice per
/// query position: attention to that position's own language
/// signal. The language score is diagonal-only — query i is
/// scored against signal i and nothing else — and the signal
/// vector doubles as the value for the extra slot.
#[derive(Module, Debug)]
pub struct AdaptiveAttention<B: Backend> {
    pub(crate) fc_q: Linear<B>,
    pub(crate) fc_k: Linear<B>,
    pub(crate) fc_v: Linear<B>,
    pub(crate) fc_s: Linear<B>,
    pub(crate) fc_o: Linear<B>,
    pub(crate) n_heads: usize,
    pub(crate) d_k: usize,
    pub(crate) d_v: usize,
}

impl<B: Backend> AdaptiveAttention<B> {
    pub fn new(d_model: usize, d_k: usize, d_v: usize, n_heads: usize, device: &B::Device) -> Self {
        assert_eq!(
            d_k, d_v,
            "adaptive attention reuses the projected signal as a value, so d_k must equal d_v"
        );
        Self {
            fc_q: xavier_linear(d_model, n_heads * d_k, device),
            fc_k: xavier_linear(d_model, n_heads * d_k, device),
            fc_v: xavier_linear(d_model, n_heads * d_v, device),
            fc_s: xavier_linear(d_model, n_heads * d_k, device),
            fc_o: xavier_linear(n_heads * d_v, d_model, device),
            n_heads,
            d_k,
            d_v,
        }
    }

    pub fn forward(
        &self,
        queries: Tensor<B, 3>,
        keys: Tensor<B, 3>,
        values: Tensor<B, 3>,
        language_signals: Tensor<B, 3>,
        mask: Option<&Tensor<B, 4, Bool>>,
        weights: Option<&Tensor<B, 4>>,
    ) -> Tensor<B, 3> {
        let [b, nq, _] = queries.dims();
        let nk = keys.dims()[1];
        let h = self.n_heads;
        assert_eq!(
            language_signals.dims()[1],
            nq,
            "one language signal per query position"
        );

        let q = split_heads(self.fc_q.forward(queries), h, self.d_k);
        let s = split_heads(self.fc_s.forward(language_signals), h, self.d_k);
        let k = split_heads(self.fc_k.forward(keys), h, self.d_k);
        let v = split_heads(self.fc_v.forward(values), h, self.d_v);

        let scores = q.clone().matmul(k.transpose()) / (self.d_k as f32).sqrt();
        let scores = weight_and_mask(scores, mask, weights);

        // Diagonal-only language score: <q_i, s_i> / sqrt(d_k)
        let language_scores =
            (q * s.clone()).sum_dim(3) / (self.d_k as f32).sqrt(); // (b, h, nq, 1)

        // Extend the softmax with the signal slot, then split the
        // distribution back apart: real keys weight V, the extra
        // column weights the signal vector itself.
        let combined = Tensor::cat(vec![scores, language_scores], 3); // (b, h, nq, nk + 1)
        let att = activation::softmax(combined, 3);
        let att_keys = att.clone().slice([0..b, 0..h, 0..nq, 0..nk]);
        let att_signal = att.slice([0..b, 0..h, 0..nq, nk..nk + 1]);

        let out = att_keys.matmul(v) + att_signal * s; // (b, h, nq, d_v)
        self.fc_o.forward(merge_heads(out))
    }
}

// ─── Variant dispatch ─────────────────────────────────────────────────────────

/// Which scoring variant a multi-head layer uses. Decided once at
/// model construction, never per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttentionKind {
    Plain,
    Geometry { trigonometric: bool },
    Memory { slots: usize },
    Adaptive,
}

#[derive(Module, Debug)]
pub enum AttentionVariant<B: Backend> {
    Plain(ScaledDotProductAttention<B>),
    Geometry(AugmentedGeometryAttention<B>),
    Memory(AugmentedMemoryAttention<B>),
    Adaptive(AdaptiveAttention<B>),
}

// ─── Running key/value cache ──────────────────────────────────────────────────

/// Accumulated raw keys/values of every decode step consumed so
/// far. Owned by the generation episode, reset between episodes,
/// reordered and batch-expanded by beam search.
#[derive(Debug, Clone)]
pub struct KvCache<B: Backend> {
    keys: Option<Tensor<B, 3>>,
    values: Option<Tensor<B, 3>>,
}

impl<B: Backend> KvCache<B> {
    pub fn new() -> Self {
        Self { keys: None, values: None }
    }

    /// Append this step's keys/values and return the full
    /// accumulation, which becomes K/V for the current call.
    pub fn append(&mut self, keys: Tensor<B, 3>, values: Tensor<B, 3>) -> (Tensor<B, 3>, Tensor<B, 3>) {
        let keys = match self.keys.take() {
            Some(prev) => Tensor::cat(vec![prev, keys], 1),
            None => keys,
        };
        let values = match self.values.take() {
            Some(prev) => Tensor::cat(vec![prev, values], 1),
            None => values,
        };
        self.keys = Some(keys.clone());
        self.values = Some(values.clone());
        (keys, values)
    }

    /// Reorder the batch dimension (beam search survivor shuffle).
    pub fn reorder(&mut self, indices: &Tensor<B, 1, Int>) {
        self.keys = self.keys.take().map(|t| t.select(0, indices.clone()));
        self.values = self.values.take().map(|t| t.select(0, indices.clone()));
    }

    /// Duplicate every batch row `beam` times: (b, l, d) -> (b*beam, l, d).
    pub fn expand_beams(&mut self, beam: usize) {
        self.keys = self.keys.take().map(|t| expand_rows(t, beam));
        self.values = self.values.take().map(|t| expand_rows(t, beam));
    }

    pub fn len(&self) -> usize {
        self.keys.as_ref().map_or(0, |t| t.dims()[1])
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<B: Backend> Default for KvCache<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// (b, l, d) -> (b*beam, l, d), each row repeated contiguously.
pub(crate) fn expand_rows<B: Backend>(t: Tensor<B, 3>, beam: usize) -> Tensor<B, 3> {
    let [b, l, d] = t.dims();
    t.unsqueeze_dim::<4>(1).expand([b, beam, l, d]).reshape([b * beam, l, d])
}

// ─── Multi-Head wrapper ───────────────────────────────────────────────────────

/// Optional attention-on-attention gate:
/// out = info(cat(q, out)) ⊙ sigmoid(gate(cat(q, out)))
#[derive(Module, Debug)]
pub struct AoaGate<B: Backend> {
    informative: Linear<B>,
    gate: Linear<B>,
}

/// Per-call optional inputs, bundled so every variant shares one
/// forward signature.
#[derive(Debug, Clone)]
pub struct AttentionContext<B: Backend> {
    /// True = suppress; broadcastable to (b, h, nq, nk)
    pub attention_mask: Option<Tensor<B, 4, Bool>>,
    /// Multiplicative score weights, broadcastable to (b, h, nq, nk)
    pub attention_weights: Option<Tensor<B, 4>>,
    /// Required by the geometry variant
    pub geometry: Option<GeometrySource<B>>,
    /// Required by the adaptive variant, (b, nq, d_model)
    pub language_signals: Option<Tensor<B, 3>>,
}

impl<B: Backend> AttentionContext<B> {
    pub fn new() -> Self {
        Self {
            attention_mask: None,
            attention_weights: None,
            geometry: None,
            language_signals: None,
        }
    }

    pub fn with_mask(mut self, mask: Tensor<B, 4, Bool>) -> Self {
        self.attention_mask = Some(mask);
        self
    }

    pub fn with_geometry(mut self, geometry: GeometrySource<B>) -> Self {
        self.geometry = Some(geometry);
        self
    }

    pub fn with_language_signals(mut self, signals: Tensor<B, 3>) -> Self {
        self.language_signals = Some(signals);
        self
    }
}

impl<B: Backend> Default for AttentionContext<B> {
    fn default() -> Self {
        Self::new()
    }
}

/// Construction-time settings for one multi-head layer.
#[derive(Debug, Clone)]
pub struct MultiHeadAttentionConfig {
    pub d_model: usize,
    pub d_k: usize,
    pub d_v: usize,
    pub n_heads: usize,
    pub dropout: f64,
    /// Pre-norm arrangement: normalize inputs, attend, relu,
    /// dropout, residual — no final normalization.
    pub identity_map_reordering: bool,
    pub use_aoa: bool,
    pub kind: AttentionKind,
}

impl MultiHeadAttentionConfig {
    pub fn new(d_model: usize, d_k: usize, d_v: usize, n_heads: usize) -> Self {
        Self {
            d_model,
            d_k,
            d_v,
            n_heads,
            dropout: 0.1,
            identity_map_reordering: false,
            use_aoa: false,
            kind: AttentionKind::Plain,
        }
    }

    pub fn with_dropout(mut self, dropout: f64) -> Self {
        self.dropout = dropout;
        self
    }

    pub fn with_identity_map_reordering(mut self, enabled: bool) -> Self {
        self.identity_map_reordering = enabled;
        self
    }

    pub fn with_aoa(mut self, enabled: bool) -> Self {
        self.use_aoa = enabled;
        self
    }

    pub fn with_kind(mut self, kind: AttentionKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> MultiHeadAttention<B> {
        let attention = match self.kind {
            AttentionKind::Plain => AttentionVariant::Plain(ScaledDotProductAttention::new(
                self.d_model,
                self.d_k,
                self.d_v,
                self.n_heads,
                device,
            )),
            AttentionKind::Geometry { trigonometric } => {
                AttentionVariant::Geometry(AugmentedGeometryAttention::new(
                    self.d_model,
                    self.d_k,
                    self.d_v,
                    self.n_heads,
                    trigonometric,
                    device,
                ))
            }
            AttentionKind::Memory { slots } => AttentionVariant::Memory(
                AugmentedMemoryAttention::new(self.d_model, self.d_k, self.d_v, self.n_heads, slots, device),
            ),
            AttentionKind::Adaptive => AttentionVariant::Adaptive(AdaptiveAttention::new(
                self.d_model,
                self.d_k,
                self.d_v,
                self.n_heads,
                device,
            )),
        };
        let aoa = self.use_aoa.then(|| AoaGate {
            informative: xavier_linear(2 * self.d_model, self.d_model, device),
            gate: xavier_linear(2 * self.d_model, self.d_model, device),
        });
        MultiHeadAttention {
            attention,
            dropout: DropoutConfig::new(self.dropout).init(),
            layer_norm: LayerNormConfig::new(self.d_model).init(device),
            aoa,
            identity_map_reordering: self.identity_map_reordering,
        }
    }
}

/// Multi-head attention with dropout, residual + normalization
/// (post-norm or pre-norm), optional attention-on-attention and
/// optional caller-owned incremental state.
#[derive(Module, Debug)]
pub struct MultiHeadAttention<B: Backend> {
    attention: AttentionVariant<B>,
    dropout: Dropout,
    layer_norm: LayerNorm<B>,
    aoa: Option<AoaGate<B>>,
    identity_map_reordering: bool,
}

impl<B: Backend> MultiHeadAttention<B> {
    pub fn forward(
        &self,
        queries: Tensor<B, 3>,
        keys: Tensor<B, 3>,
        values: Tensor<B, 3>,
        ctx: &AttentionContext<B>,
        cache: Option<&mut KvCache<B>>,
    ) -> Tensor<B, 3> {
        // With a cache the incoming keys/values are only this
        // step's increment; the full accumulation attends.
        let (keys, values) = match cache {
            Some(cache) => cache.append(keys, values),
            None => (keys, values),
        };

        let (queries, keys, values) = if self.identity_map_reordering {
            (
                self.layer_norm.forward(queries),
                self.layer_norm.forward(keys),
                self.layer_norm.forward(values),
            )
        } else {
            (queries, keys, values)
        };

        let out = match &self.attention {
            AttentionVariant::Plain(attn) => attn.forward(
                queries.clone(),
                keys,
                values,
                ctx.attention_mask.as_ref(),
                ctx.attention_weights.as_ref(),
            ),
            AttentionVariant::Geometry(attn) => {
                let geometry = ctx
                    .geometry
                    .as_ref()
                    .expect("geometry-augmented attention requires boxes or a grid layout");
                attn.forward(
                    queries.clone(),
                    keys,
                    values,
                    geometry,
                    ctx.attention_mask.as_ref(),
                    ctx.attention_weights.as_ref(),
                )
            }
            AttentionVariant::Memory(attn) => attn.forward(
                queries.clone(),
                keys,
                values,
                ctx.attention_mask.as_ref(),
                ctx.attention_weights.as_ref(),
            ),
            AttentionVariant::Adaptive(attn) => {
                let signals = ctx
                    .language_signals
                    .clone()
                    .expect("adaptive attention requires language signals");
                attn.forward(
                    queries.clone(),
                    keys,
                    values,
                    signals,
                    ctx.attention_mask.as_ref(),
                    ctx.attention_weights.as_ref(),
                )
            }
        };

        let out = if self.identity_map_reordering {
            // residual over the normalized queries
            queries.clone() + self.dropout.forward(activation::relu(out))
        } else {
            self.layer_norm.forward(queries.clone() + self.dropout.forward(out))
        };

        match &self.aoa {
            Some(gate) => {
                let aoa_input = Tensor::cat(vec![queries, out], 2);
                let informative = gate.informative.forward(aoa_input.clone());
                let gated = activation::sigmoid(gate.gate.forward(aoa_input));
                informative * gated
            }
            None => out,
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    type TB = burn::backend::NdArray;
    type TDevice = <TB as Backend>::Device;

    const D_MODEL: usize = 16;
    const D_K: usize = 8;
    const D_V: usize = 8;
    const HEADS: usize = 2;

    fn random(shape: [usize; 3], device: &TDevice) -> Tensor<TB, 3> {
        Tensor::random(shape, burn::tensor::Distribution::Uniform(-1.0, 1.0), device)
    }

    #[test]
    fn test_output_shape_for_all_variants() {
        // (b, nq, d_model) out regardless of nk and variant.
        let device = Default::default();
        let q = random([2, 3, D_MODEL], &device);
        let k = random([2, 5, D_MODEL], &device);
        let v = random([2, 5, D_MODEL], &device);

        let plain = ScaledDotProductAttention::<TB>::new(D_MODEL, D_K, D_V, HEADS, &device);
        assert_eq!(plain.forward(q.clone(), k.clone(), v.clone(), None, None).dims(), [2, 3, D_MODEL]);

        let memory = AugmentedMemoryAttention::<TB>::new(D_MODEL, D_K, D_V, HEADS, 4, &device);
        assert_eq!(memory.forward(q.clone(), k.clone(), v.clone(), None, None).dims(), [2, 3, D_MODEL]);

        let adaptive = AdaptiveAttention::<TB>::new(D_MODEL, D_K, D_V, HEADS, &device);
        let signals = random([2, 3, D_MODEL], &device);
        assert_eq!(
            adaptive.forward(q.clone(), k, v, signals, None, None).dims(),
            [2, 3, D_MODEL]
        );

        // Geometry attention is self-attention over the regions
        let geometry = AugmentedGeometryAttention::<TB>::new(D_MODEL, D_K, D_V, HEADS, true, &device);
        let x = random([2, 4, D_MODEL], &device);
        let boxes = Tensor::random([2, 4, 4], burn::tensor::Distribution::Uniform(0.0, 20.0), &device);
        let source = GeometrySource::Boxes(boxes);
        assert_eq!(
            geometry.forward(x.clone(), x.clone(), x, &source, None, None).dims(),
            [2, 4, D_MODEL]
        );
    }

    #[test]
    fn test_memory_scores_prefix_matches_plain_scores() {
        // Before masking, the non-memory score sub-matrix must be
        // exactly the plain scaled dot-product of the same
        // projections.
        let device: TDevice = Default::default();
        let attn = AugmentedMemoryAttention::<TB>::new(D_MODEL, D_K, D_V, HEADS, 3, &device);
        let q = random([1, 3, D_MODEL], &device);
        let k = random([1, 5, D_MODEL], &device);

        let q_heads = split_heads(attn.fc_q.forward(q), HEADS, D_K);
        let k_proj = attn.fc_k.forward(k);
        let m_k = attn.m_k.val().mul_scalar((D_K as f32).sqrt()).expand([1, 3, HEADS * D_K]);
        let k_full = split_heads(Tensor::cat(vec![k_proj.clone(), m_k], 1), HEADS, D_K);

        let full_scores = q_heads.clone().matmul(k_full.transpose()) / (D_K as f32).sqrt();
        let prefix = full_scores.slice([0..1, 0..HEADS, 0..3, 0..5]);
        let plain_scores =
            q_heads.matmul(split_heads(k_proj, HEADS, D_K).transpose()) / (D_K as f32).sqrt();

        let diff = (prefix - plain_scores).abs().max().into_scalar();
        assert!(diff < 1e-5, "memory slots leaked into the real score columns: {diff}");
    }

    #[test]
    fn test_memory_slots_survive_a_full_mask() {
        // Even with every real key suppressed, the memory columns
        // stay unmasked, so the output must be finite.
        let device: TDevice = Default::default();
        let attn = AugmentedMemoryAttention::<TB>::new(D_MODEL, D_K, D_V, HEADS, 2, &device);
        let q = random([1, 2, D_MODEL], &device);
        let k = random([1, 4, D_MODEL], &device);
        let v = random([1, 4, D_MODEL], &device);
        let mask = Tensor::<TB, 4>::ones([1, 1, 1, 4], &device).equal_elem(1.0);
        let out = attn.forward(q, k, v, Some(&mask), None);
        let max_abs = out.abs().max().into_scalar();
        assert!(max_abs.is_finite());
    }

    #[test]
    fn test_stateful_cache_accumulates_and_matches_full_pass() {
        // Feeding k/v one step at a time through the cache must
        // give the same output for the latest query as attending
        // over the whole sequence at once.
        let device: TDevice = Default::default();
        let mha = MultiHeadAttentionConfig::new(D_MODEL, D_K, D_V, HEADS)
            .with_dropout(0.0)
            .init::<TB>(&device);
        let x = random([1, 4, D_MODEL], &device);

        // full pass, query = last position, keys = all positions
        let last = x.clone().slice([0..1, 3..4, 0..D_MODEL]);
        let full = mha.forward(last.clone(), x.clone(), x.clone(), &AttentionContext::new(), None);

        // incremental: append one position per step
        let mut cache = KvCache::new();
        let mut out = None;
        for t in 0..4 {
            let step = x.clone().slice([0..1, t..t + 1, 0..D_MODEL]);
            out = Some(mha.forward(
                step.clone(),
                step.clone(),
                step,
                &AttentionContext::new(),
                Some(&mut cache),
            ));
        }
        assert_eq!(cache.len(), 4);
        let diff = (out.unwrap() - full).abs().max().into_scalar();
        assert!(diff < 1e-5, "incremental cache diverged from the full pass: {diff}");
    }

    #[test]
    fn test_adaptive_softmax_includes_signal_slot() {
        // With keys projected to zero scores the language slot
        // still competes, so the output depends on the signal.
        let device: TDevice = Default::default();
        let attn = AdaptiveAttention::<TB>::new(D_MODEL, D_K, D_V, HEADS, &device);
        let q = random([1, 2, D_MODEL], &device);
        let k = random([1, 3, D_MODEL], &device);
        let v = random([1, 3, D_MODEL], &device);
        let s1 = random([1, 2, D_MODEL], &device);
        let s2 = random([1, 2, D_MODEL], &device);
        let out1 = attn.forward(q.clone(), k.clone(), v.clone(), s1, None, None);
        let out2 = attn.forward(q, k, v, s2, None, None);
        let diff = (out1 - out2).abs().max().into_scalar();
        assert!(diff > 1e-6, "language signal had no effect on the output");
    }
}
