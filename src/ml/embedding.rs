// ============================================================
// Layer 5 — Vision Embedding & Positional Encoding
// ============================================================
// The vision embedding projects precomputed region/grid features
// into model space and derives the padding mask from all-zero
// feature rows (the collate step pads short images with zero
// rows). The sinusoidal positional encoding is computed on the
// fly from 1-based position ids, so incremental decoding can
// keep advancing the position while processing one token per
// step; position 0 is reserved for padding and encodes to zero.

use burn::{
    module::Module,
    nn::{Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig},
    prelude::*,
    tensor::activation,
};

/// Projects (b, n, d_feature) precomputed features to
/// (b, n, d_model) and reports which rows are padding.
#[derive(Module, Debug)]
pub struct VisionEmbedding<B: Backend> {
    proj: Linear<B>,
    layer_norm: LayerNorm<B>,
    dropout: Dropout,
}

impl<B: Backend> VisionEmbedding<B> {
    pub fn new(d_feature: usize, d_model: usize, dropout: f64, device: &B::Device) -> Self {
        Self {
            proj: LinearConfig::new(d_feature, d_model).init(device),
            layer_norm: LayerNormConfig::new(d_model).init(device),
            dropout: DropoutConfig::new(dropout).init(),
        }
    }

    /// Returns the projected features and the padding mask
    /// (b, n), True = padded row.
    pub fn forward(&self, features: Tensor<B, 3>) -> (Tensor<B, 3>, Tensor<B, 2, Bool>) {
        let [b, n, _] = features.dims();
        // Zero-filled rows are padding; detect before the
        // projection bias can disturb them.
        let padding_mask = features
            .clone()
            .abs()
            .sum_dim(2)
            .reshape([b, n])
            .equal_elem(0.0);

        let projected = self
            .layer_norm
            .forward(self.dropout.forward(activation::relu(self.proj.forward(features))));
        // Keep padding rows exactly zero in model space too.
        let projected_dims = projected.dims();
        let projected = projected.mask_fill(
            padding_mask.clone().reshape([b, n, 1]).expand(projected_dims),
            0.0,
        );
        (projected, padding_mask)
    }
}

/// Sinusoidal positional encoding indexed by explicit 1-based
/// positions (b, s); position id 0 encodes to the zero vector.
///
/// pe[pos, 2i]   = sin(pos / 10000^(2i/d))
/// pe[pos, 2i+1] = cos(pos / 10000^(2i/d))
pub fn sinusoid_position_encoding<B: Backend>(
    positions: Tensor<B, 2, Int>,
    d_model: usize,
) -> Tensor<B, 3> {
    assert!(d_model % 2 == 0, "sinusoidal encoding needs an even model dimension");
    let [b, s] = positions.dims();
    let device = positions.device();
    let half = d_model / 2;

    // 1 / 10000^(2i/d) for i in 0..d/2
    let inv_freq = Tensor::<B, 1, Int>::arange(0..half as i64, &device)
        .float()
        .mul_scalar(2.0 / d_model as f32)
        .mul_scalar((10000f32).ln())
        .exp()
        .recip();

    let angles = positions
        .clone()
        .float()
        .reshape([b, s, 1])
        .mul(inv_freq.reshape([1, 1, half]).expand([b, s, half])); // (b, s, d/2)

    // Interleave: [sin0, cos0, sin1, cos1, ...]
    let encoding = Tensor::stack::<4>(vec![angles.clone().sin(), angles.cos()], 3)
        .reshape([b, s, d_model]);

    // Position 0 is the padding slot
    encoding.mask_fill(
        positions.equal_elem(0).reshape([b, s, 1]).expand([b, s, d_model]),
        0.0,
    )
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    type TB = burn::backend::NdArray;

    #[test]
    fn test_padding_mask_from_zero_rows() {
        let device = Default::default();
        let emb = VisionEmbedding::<TB>::new(8, 16, 0.0, &device);
        let mut data = vec![0.5f32; 2 * 3 * 8];
        // zero out the last row of the second batch element
        for v in data[(2 * 3 * 8 - 8)..].iter_mut() {
            *v = 0.0;
        }
        let features = Tensor::<TB, 1>::from_floats(data.as_slice(), &device).reshape([2, 3, 8]);
        let (projected, mask) = emb.forward(features);
        assert_eq!(projected.dims(), [2, 3, 16]);
        let mask_data = mask.into_data().to_vec::<bool>().unwrap();
        assert_eq!(mask_data, vec![false, false, false, false, false, true]);
        // padded row stays zero in model space
        let padded_row = projected.slice([1..2, 2..3, 0..16]).abs().max().into_scalar();
        assert_eq!(padded_row, 0.0);
    }

    #[test]
    fn test_position_zero_encodes_to_zero() {
        let device = Default::default();
        let positions = Tensor::<TB, 1, Int>::from_ints([0, 1, 2].as_slice(), &device).reshape([1, 3]);
        let enc = sinusoid_position_encoding(positions, 8);
        assert_eq!(enc.dims(), [1, 3, 8]);
        let row0 = enc.clone().slice([0..1, 0..1, 0..8]).abs().max().into_scalar();
        assert_eq!(row0, 0.0);
        // position 1, dim 1 is cos(1 / 10000^0) = cos(1)
        let row1 = enc.slice([0..1, 1..2, 0..8]).into_data().to_vec::<f32>().unwrap();
        assert!((row1[0] - 1f32.sin()).abs() < 1e-5);
        assert!((row1[1] - 1f32.cos()).abs() < 1e-5);
    }

    #[test]
    fn test_same_position_same_encoding() {
        // The encoding is a pure function of the position id —
        // step-by-step decoding must see the same values a full
        // forward pass sees.
        let device = Default::default();
        let full = sinusoid_position_encoding::<TB>(
            Tensor::<TB, 1, Int>::from_ints([1, 2, 3].as_slice(), &device).reshape([1, 3]),
            8,
        );
        let step = sinusoid_position_encoding::<TB>(
            Tensor::<TB, 1, Int>::from_ints([3].as_slice(), &device).reshape([1, 1]),
            8,
        );
        let diff = (full.slice([0..1, 2..3, 0..8]) - step).abs().max().into_scalar();
        assert!(diff < 1e-6);
    }
}
