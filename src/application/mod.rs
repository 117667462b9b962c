// ============================================================
// Layer 2 — Application Layer
// ============================================================
// Use-case orchestration: each use case wires data, infra and ml
// together for one CLI command. No Burn types cross upward into
// the CLI layer.

/// Two-phase captioning-model training + LM pre-training
pub mod train_use_case;

/// Checkpoint reload, batch captioning, submission export
pub mod caption_use_case;
