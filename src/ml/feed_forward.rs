// ============================================================
// Layer 5 — Position-Wise Feed-Forward
// ============================================================
// Two linear maps with ReLU and dropout, applied independently
// at every sequence position, with the same two residual
// arrangements as the attention wrapper.

use burn::{
    module::Module,
    nn::{Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig},
    prelude::*,
    tensor::activation,
};

#[derive(Module, Debug)]
pub struct PositionWiseFeedForward<B: Backend> {
    fc1: Linear<B>,
    fc2: Linear<B>,
    dropout: Dropout,
    dropout_inner: Dropout,
    layer_norm: LayerNorm<B>,
    identity_map_reordering: bool,
}

impl<B: Backend> PositionWiseFeedForward<B> {
    pub fn new(
        d_model: usize,
        d_ff: usize,
        dropout: f64,
        identity_map_reordering: bool,
        device: &B::Device,
    ) -> Self {
        Self {
            fc1: LinearConfig::new(d_model, d_ff).init(device),
            fc2: LinearConfig::new(d_ff, d_model).init(device),
            dropout: DropoutConfig::new(dropout).init(),
            dropout_inner: DropoutConfig::new(dropout).init(),
            layer_norm: LayerNormConfig::new(d_model).init(device),
            identity_map_reordering,
        }
    }

    pub fn forward(&self, input: Tensor<B, 3>) -> Tensor<B, 3> {
        if self.identity_map_reordering {
            let normed = self.layer_norm.forward(input.clone());
            let out = self
                .fc2
                .forward(self.dropout_inner.forward(activation::relu(self.fc1.forward(normed))));
            input + self.dropout.forward(activation::relu(out))
        } else {
            let out = self
                .fc2
                .forward(self.dropout_inner.forward(activation::relu(self.fc1.forward(input.clone()))));
            self.layer_norm.forward(input + self.dropout.forward(out))
        }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    type TB = burn::backend::NdArray;

    #[test]
    fn test_preserves_shape() {
        let device = Default::default();
        let pwff = PositionWiseFeedForward::<TB>::new(16, 32, 0.0, false, &device);
        let x = Tensor::random([2, 5, 16], burn::tensor::Distribution::Default, &device);
        assert_eq!(pwff.forward(x).dims(), [2, 5, 16]);
    }
}
