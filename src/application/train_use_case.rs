// ============================================================
// Layer 2 — Train Use Cases
// ============================================================
// Orchestrates the full training pipeline in order:
//
//   Step 1: Load split annotations         (Layer 4 - data)
//   Step 2: Build / load the vocabulary    (Layer 6 - infra)
//   Step 3: Build datasets over the store  (Layer 4 - data)
//   Step 4: Save config for inference      (Layer 6 - infra)
//   Step 5: Run the two-phase loop         (Layer 5 - ml)
//
// `TrainLmUseCase` is the smaller sibling that pre-trains the
// auxiliary language model the adaptive variant consumes.

use anyhow::Result;
use std::sync::Arc;
use serde::{Deserialize, Serialize};

use crate::data::annotations::load_annotations;
use crate::data::dataset::{CaptionDataset, DictionaryDataset, TokenDataset};
use crate::data::features::FeatureStore;
use crate::domain::vocab::{Vocab, BOS_IDX, EOS_IDX, PAD_IDX};
use crate::infra::checkpoint::CheckpointManager;
use crate::infra::metrics::MetricsLogger;
use crate::infra::tokenizer_store::TokenizerStore;
use crate::ml::attention::AttentionKind;
use crate::ml::decoder::DecoderKind;
use crate::ml::model::CaptionModelConfig;
use crate::ml::trainer::{run_language_model_training, run_training, TrainingData};

// ─── Training Configuration ──────────────────────────────────────────────────
// All hyperparameters for a training run, serialisable so the
// captioning command can rebuild the exact model later.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    // paths
    pub train_json: String,
    pub val_json: String,
    pub test_json: Option<String>,
    pub feature_dir: String,
    pub checkpoint_dir: String,

    // vocabulary
    pub min_freq: usize,

    // model
    pub d_feature: usize,
    pub d_model: usize,
    pub d_k: usize,
    pub d_v: usize,
    pub n_heads: usize,
    pub n_enc_layers: usize,
    pub n_dec_layers: usize,
    pub d_ff: usize,
    pub dropout: f64,
    /// Encoder self-attention variant: plain | geometry | memory
    pub attention: String,
    /// Memory slots (memory attention only)
    pub memory_slots: usize,
    /// Use the raw 4-dim geometry features instead of the
    /// trigonometric embedding
    pub raw_geometry: bool,
    /// Decoder variant: simple | meshed
    pub decoder: String,
    pub use_aoa: bool,
    pub identity_map_reordering: bool,
    /// Language-conditioned variant (requires a trained LM
    /// checkpoint, see `train-lm`)
    pub adaptive: bool,
    pub language_hidden_size: usize,
    pub grid_height: Option<usize>,
    pub grid_width: Option<usize>,

    // training
    pub batch_size: usize,
    pub warmup: usize,
    pub beam_size: usize,
    pub rl_lr: f64,
    pub seed: u64,
    pub workers: usize,
    pub lm_epochs: usize,
    /// Checkpoint stem ("last" / "best") to resume from; an
    /// explicitly requested but missing checkpoint is fatal
    pub resume: Option<String>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            train_json: "features/annotations/captions_train.json".to_string(),
            val_json: "features/annotations/captions_val.json".to_string(),
            test_json: None,
            feature_dir: "features/region_features".to_string(),
            checkpoint_dir: "saved_models".to_string(),
            min_freq: 1,
            d_feature: 2048,
            d_model: 512,
            d_k: 64,
            d_v: 64,
            n_heads: 8,
            n_enc_layers: 3,
            n_dec_layers: 3,
            d_ff: 2048,
            dropout: 0.1,
            attention: "plain".to_string(),
            memory_slots: 40,
            raw_geometry: false,
            decoder: "simple".to_string(),
            use_aoa: false,
            identity_map_reordering: false,
            adaptive: false,
            language_hidden_size: 768,
            grid_height: None,
            grid_width: None,
            batch_size: 16,
            warmup: 10000,
            beam_size: 5,
            rl_lr: 5e-6,
            seed: 13,
            workers: 2,
            lm_epochs: 20,
            resume: None,
        }
    }
}

impl TrainConfig {
    /// Resolve the architecture config against a built vocabulary.
    /// Unknown variant names are fatal configuration errors.
    pub fn model_config(&self, vocab: &Vocab) -> Result<CaptionModelConfig> {
        let encoder_attention = match self.attention.as_str() {
            "plain" => AttentionKind::Plain,
            "geometry" => AttentionKind::Geometry { trigonometric: !self.raw_geometry },
            "memory" => AttentionKind::Memory { slots: self.memory_slots },
            other => anyhow::bail!("unknown attention variant '{other}' (plain|geometry|memory)"),
        };
        let decoder = match self.decoder.as_str() {
            "simple" => DecoderKind::Simple,
            "meshed" => DecoderKind::Meshed,
            other => anyhow::bail!("unknown decoder variant '{other}' (simple|meshed)"),
        };
        let grid = match (self.grid_height, self.grid_width) {
            (Some(height), Some(width)) => Some((height, width)),
            (None, None) => None,
            _ => anyhow::bail!("grid features need both --grid-height and --grid-width"),
        };

        let config = CaptionModelConfig {
            vocab_size: vocab.len(),
            max_caption_length: vocab.max_caption_length(),
            padding_idx: PAD_IDX,
            bos_idx: BOS_IDX,
            eos_idx: EOS_IDX,
            d_feature: self.d_feature,
            d_model: self.d_model,
            d_k: self.d_k,
            d_v: self.d_v,
            n_heads: self.n_heads,
            n_enc_layers: self.n_enc_layers,
            n_dec_layers: self.n_dec_layers,
            d_ff: self.d_ff,
            dropout: self.dropout,
            encoder_attention,
            decoder,
            use_aoa: self.use_aoa,
            identity_map_reordering: self.identity_map_reordering,
            adaptive: self.adaptive,
            language_hidden_size: self.language_hidden_size,
            grid,
        };
        config.validate()?;
        Ok(config)
    }
}

// ─── TrainUseCase ─────────────────────────────────────────────────────────────
pub struct TrainUseCase {
    config: TrainConfig,
}

impl TrainUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> Result<()> {
        let cfg = &self.config;

        // ── Step 1: Load split annotations ────────────────────────────────────
        let train_annotations = load_annotations(&cfg.train_json)?;
        let val_annotations = load_annotations(&cfg.val_json)?;
        let test_annotations = match &cfg.test_json {
            Some(path) => Some(load_annotations(path)?),
            None => None,
        };

        // ── Step 2: Build / load the vocabulary ───────────────────────────────
        let captions: Vec<String> =
            train_annotations.iter().map(|a| a.caption.clone()).collect();
        let tok_store = TokenizerStore::new(&cfg.checkpoint_dir);
        let vocab = Arc::new(tok_store.load_or_build(&captions, cfg.min_freq)?);
        tracing::info!(
            "Vocabulary: {} tokens, max caption length {}",
            vocab.len(),
            vocab.max_caption_length()
        );

        // ── Step 3: Build datasets over the feature store ─────────────────────
        let store = FeatureStore::new(&cfg.feature_dir);
        let train = CaptionDataset::build(&train_annotations, &store, &vocab)?;
        let val = CaptionDataset::build(&val_annotations, &store, &vocab)?;
        let train_dict = DictionaryDataset::build(&train_annotations, &store)?;
        let val_dict = DictionaryDataset::build(&val_annotations, &store)?;
        let test_dict = match &test_annotations {
            Some(annotations) => Some(DictionaryDataset::build(annotations, &store)?),
            None => None,
        };
        tracing::info!(
            "Datasets: {} train captions over {} images, {} val captions",
            train.sample_count(),
            train_dict.sample_count(),
            val.sample_count()
        );

        // ── Step 4: Save config for later inference ───────────────────────────
        let ckpt = CheckpointManager::new(&cfg.checkpoint_dir);
        ckpt.save_config(cfg)?;
        let metrics = MetricsLogger::new(&cfg.checkpoint_dir)?;

        // ── Step 5: Run the two-phase training loop ───────────────────────────
        run_training(
            cfg,
            vocab,
            TrainingData { train, val, train_dict, val_dict, test_dict },
            ckpt,
            metrics,
        )
    }
}

// ─── TrainLmUseCase ───────────────────────────────────────────────────────────
// Pre-trains the auxiliary language model on caption tokens; the
// adaptive captioning model later loads it frozen.
pub struct TrainLmUseCase {
    config: TrainConfig,
}

impl TrainLmUseCase {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    pub fn execute(&self) -> Result<()> {
        let cfg = &self.config;

        let train_annotations = load_annotations(&cfg.train_json)?;
        let val_annotations = load_annotations(&cfg.val_json)?;

        let captions: Vec<String> =
            train_annotations.iter().map(|a| a.caption.clone()).collect();
        let tok_store = TokenizerStore::new(&cfg.checkpoint_dir);
        let vocab = tok_store.load_or_build(&captions, cfg.min_freq)?;

        let train = TokenDataset::build(&train_annotations, &vocab)?;
        let val = TokenDataset::build(&val_annotations, &vocab)?;

        let ckpt = CheckpointManager::new(&cfg.checkpoint_dir);
        run_language_model_training(cfg, &vocab, train, val, &ckpt)
    }
}
