// ============================================================
// Layer 1 — CLI / Presentation Layer
// ============================================================
// Entry point for all user interaction; parses arguments with
// clap and dispatches to the application layer. This layer only
// routes, never computes.

pub mod commands;

use anyhow::Result;
use clap::Parser;
use commands::{CaptionArgs, Commands, TrainArgs};

#[derive(Parser, Debug)]
#[command(
    name = "captioner",
    version = "0.1.0",
    about = "Train an attention-based image-captioning transformer, then generate captions."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn run(self) -> Result<()> {
        match self.command {
            Commands::Train(args) => Self::run_train(args),
            Commands::TrainLm(args) => Self::run_train_lm(args),
            Commands::Caption(args) => Self::run_caption(args),
        }
    }

    fn run_train(args: TrainArgs) -> Result<()> {
        use crate::application::train_use_case::TrainUseCase;
        tracing::info!("Starting training from '{}'", args.train_json);
        TrainUseCase::new(args.into()).execute()
    }

    fn run_train_lm(args: TrainArgs) -> Result<()> {
        use crate::application::train_use_case::TrainLmUseCase;
        tracing::info!("Pre-training the language model from '{}'", args.train_json);
        TrainLmUseCase::new(args.into()).execute()
    }

    fn run_caption(args: CaptionArgs) -> Result<()> {
        use crate::application::caption_use_case::CaptionUseCase;
        tracing::info!("Captioning '{}'", args.input_json);
        CaptionUseCase {
            input_json: args.input_json,
            checkpoint_dir: args.checkpoint_dir,
            checkpoint: args.checkpoint,
            sample_submission: args.sample_submission,
            output: args.output,
            batch_size: args.batch_size,
            beam_size: args.beam_size,
        }
        .execute()
    }
}
