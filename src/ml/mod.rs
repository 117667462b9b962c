// ============================================================
// Layer 5 — ML / Model Layer (Burn)
// ============================================================
// All Burn-specific code lives here: the attention engine and
// its variants, the encoder/decoder stacks, the language model,
// beam search and the two-phase training loop. No other layer
// imports from burn directly.
//
// Reference: Vaswani et al. (2017) Attention Is All You Need
//            Herdade et al. (2019) Objects into Words
//            Cornia et al. (2020) Meshed-Memory Transformer
//            Rennie et al. (2017) Self-Critical Sequence Training

/// Scoring variants, multi-head wrapper and the running k/v cache
pub mod attention;

/// Relative box geometry embedding and grid synthesis
pub mod geometry;

/// Position-wise feed-forward block
pub mod feed_forward;

/// Vision embedding and sinusoidal positions
pub mod embedding;

/// Encoder stack retaining per-layer outputs
pub mod encoder;

/// Simple and meshed decoders with explicit decoding state
pub mod decoder;

/// Frozen language backbone + auxiliary LM head
pub mod language;

/// Vision-to-caption model composition
pub mod model;

/// Top-k sequence generation over the stateful step function
pub mod beam_search;

/// Two-phase (XE -> RL) training loop
pub mod trainer;
