// ============================================================
// Layer 1 — CLI Commands and Arguments
// ============================================================
// Three subcommands: `train`, `train-lm` and `caption`.
// clap's derive macros generate the help text, error messages
// and type conversion; the application layer never sees clap
// types.

use clap::{Args, Subcommand};
use crate::application::train_use_case::TrainConfig;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Train the captioning model (cross-entropy, then
    /// self-critical learning)
    Train(TrainArgs),

    /// Pre-train the auxiliary language model on captions
    TrainLm(TrainArgs),

    /// Caption a split using a trained checkpoint and export a
    /// submission file
    Caption(CaptionArgs),
}

/// All arguments for the `train` / `train-lm` commands.
#[derive(Args, Debug)]
pub struct TrainArgs {
    /// Training split annotation JSON ({image_id, caption} records)
    #[arg(long, default_value = "features/annotations/captions_train.json")]
    pub train_json: String,

    /// Validation split annotation JSON
    #[arg(long, default_value = "features/annotations/captions_val.json")]
    pub val_json: String,

    /// Optional test split annotation JSON (reported, never trained on)
    #[arg(long)]
    pub test_json: Option<String>,

    /// Directory of per-image feature blobs ({image_id}.json)
    #[arg(long, default_value = "features/region_features")]
    pub feature_dir: String,

    /// Directory for checkpoints, tokenizer and metrics
    #[arg(long, default_value = "saved_models")]
    pub checkpoint_dir: String,

    /// Minimum word frequency to enter the vocabulary
    #[arg(long, default_value_t = 1)]
    pub min_freq: usize,

    /// Width of the precomputed visual features
    #[arg(long, default_value_t = 2048)]
    pub d_feature: usize,

    /// Hidden dimension of the transformer
    #[arg(long, default_value_t = 512)]
    pub d_model: usize,

    /// Per-head query/key dimension
    #[arg(long, default_value_t = 64)]
    pub d_k: usize,

    /// Per-head value dimension
    #[arg(long, default_value_t = 64)]
    pub d_v: usize,

    /// Number of attention heads
    #[arg(long, default_value_t = 8)]
    pub n_heads: usize,

    /// Number of encoder layers
    #[arg(long, default_value_t = 3)]
    pub n_enc_layers: usize,

    /// Number of decoder layers (must equal encoder layers for
    /// the meshed decoder)
    #[arg(long, default_value_t = 3)]
    pub n_dec_layers: usize,

    /// Inner dimension of the feed-forward network
    #[arg(long, default_value_t = 2048)]
    pub d_ff: usize,

    /// Dropout probability
    #[arg(long, default_value_t = 0.1)]
    pub dropout: f64,

    /// Encoder self-attention variant: plain | geometry | memory
    #[arg(long, default_value = "plain")]
    pub attention: String,

    /// Learned memory slots (memory attention)
    #[arg(long, default_value_t = 40)]
    pub memory_slots: usize,

    /// Use raw 4-dim geometry features instead of the
    /// trigonometric embedding
    #[arg(long, default_value_t = false)]
    pub raw_geometry: bool,

    /// Decoder variant: simple | meshed
    #[arg(long, default_value = "simple")]
    pub decoder: String,

    /// Attention-on-attention gating
    #[arg(long, default_value_t = false)]
    pub use_aoa: bool,

    /// Pre-norm (identity map reordering) residual arrangement
    #[arg(long, default_value_t = false)]
    pub identity_map_reordering: bool,

    /// Language-conditioned adaptive attention (needs `train-lm`
    /// first)
    #[arg(long, default_value_t = false)]
    pub adaptive: bool,

    /// Backbone width of the language model
    #[arg(long, default_value_t = 768)]
    pub language_hidden_size: usize,

    /// Grid height for grid-extracted features (no boxes)
    #[arg(long)]
    pub grid_height: Option<usize>,

    /// Grid width for grid-extracted features
    #[arg(long)]
    pub grid_width: Option<usize>,

    /// Samples per batch (the RL phase divides this by beam size)
    #[arg(long, default_value_t = 16)]
    pub batch_size: usize,

    /// Warm-up steps of the learning-rate schedule
    #[arg(long, default_value_t = 10000)]
    pub warmup: usize,

    /// Beam width for evaluation and self-critical sampling
    #[arg(long, default_value_t = 5)]
    pub beam_size: usize,

    /// Fixed learning rate of the self-critical phase
    #[arg(long, default_value_t = 5e-6)]
    pub rl_lr: f64,

    /// Base random seed (epoch shuffling derives from it)
    #[arg(long, default_value_t = 13)]
    pub seed: u64,

    /// Data-loading worker threads
    #[arg(long, default_value_t = 2)]
    pub workers: usize,

    /// Epochs of language-model pre-training (train-lm)
    #[arg(long, default_value_t = 20)]
    pub lm_epochs: usize,

    /// Resume from a checkpoint stem ("last" or "best"); missing
    /// checkpoint is a hard error
    #[arg(long)]
    pub resume: Option<String>,
}

impl From<TrainArgs> for TrainConfig {
    fn from(a: TrainArgs) -> Self {
        TrainConfig {
            train_json: a.train_json,
            val_json: a.val_json,
            test_json: a.test_json,
            feature_dir: a.feature_dir,
            checkpoint_dir: a.checkpoint_dir,
            min_freq: a.min_freq,
            d_feature: a.d_feature,
            d_model: a.d_model,
            d_k: a.d_k,
            d_v: a.d_v,
            n_heads: a.n_heads,
            n_enc_layers: a.n_enc_layers,
            n_dec_layers: a.n_dec_layers,
            d_ff: a.d_ff,
            dropout: a.dropout,
            attention: a.attention,
            memory_slots: a.memory_slots,
            raw_geometry: a.raw_geometry,
            decoder: a.decoder,
            use_aoa: a.use_aoa,
            identity_map_reordering: a.identity_map_reordering,
            adaptive: a.adaptive,
            language_hidden_size: a.language_hidden_size,
            grid_height: a.grid_height,
            grid_width: a.grid_width,
            batch_size: a.batch_size,
            warmup: a.warmup,
            beam_size: a.beam_size,
            rl_lr: a.rl_lr,
            seed: a.seed,
            workers: a.workers,
            lm_epochs: a.lm_epochs,
            resume: a.resume,
        }
    }
}

/// All arguments for the `caption` command.
#[derive(Args, Debug)]
pub struct CaptionArgs {
    /// Annotation JSON of the split to caption
    #[arg(long)]
    pub input_json: String,

    /// Directory where checkpoints were saved during training
    #[arg(long, default_value = "saved_models")]
    pub checkpoint_dir: String,

    /// Which checkpoint stem to load: best | last
    #[arg(long, default_value = "best")]
    pub checkpoint: String,

    /// Sample-submission JSON whose `captions` fields get filled
    #[arg(long)]
    pub sample_submission: Option<String>,

    /// Output JSON path
    #[arg(long, default_value = "results.json")]
    pub output: String,

    /// Images per beam-search batch
    #[arg(long, default_value_t = 16)]
    pub batch_size: usize,

    /// Beam width
    #[arg(long, default_value_t = 5)]
    pub beam_size: usize,
}
