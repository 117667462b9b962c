// ============================================================
// Layer 4 — Data Layer
// ============================================================
// Ingestion of the two external stores (caption annotation JSON
// and the precomputed feature blobs) and their conversion into
// Burn datasets and batches.

/// Split annotation JSON loading and grouping
pub mod annotations;

/// Per-image precomputed feature blobs
pub mod features;

/// Burn datasets: per-caption, per-image and token-only
pub mod dataset;

/// Batchers: padding and tensor assembly
pub mod batcher;
