// ============================================================
// Layer 2 — Caption Use Case
// ============================================================
// Loads the best checkpoint, beam-searches captions for a test
// split and exports results. When a sample-submission file is
// given its `captions` fields are filled in by id; otherwise a
// plain results JSON is written.

use anyhow::{Context, Result};
use std::path::PathBuf;
use burn::prelude::*;

use crate::application::train_use_case::TrainConfig;
use crate::data::annotations::load_annotations;
use crate::data::batcher::{DictionaryBatch, DictionaryBatcher};
use crate::data::dataset::DictionaryDataset;
use crate::data::features::FeatureStore;
use crate::domain::caption::{PredictionResult, SubmissionEntry};
use crate::infra::checkpoint::CheckpointManager;
use crate::infra::tokenizer_store::TokenizerStore;
use crate::ml::geometry::GeometrySource;
use crate::ml::model::CaptioningModel;

use burn::data::dataloader::DataLoaderBuilder;

type InferBackend = burn::backend::Wgpu;

pub struct CaptionUseCase {
    /// Annotation JSON of the split to caption
    pub input_json: String,
    pub checkpoint_dir: String,
    /// Load "best" (default) or "last" weights
    pub checkpoint: String,
    /// Sample-submission JSON to fill in, if any
    pub sample_submission: Option<String>,
    pub output: String,
    pub batch_size: usize,
    pub beam_size: usize,
}

impl CaptionUseCase {
    pub fn execute(&self) -> Result<()> {
        let device = burn::backend::wgpu::WgpuDevice::default();

        // Rebuild the exact trained architecture, then restore
        // its weights.
        let ckpt = CheckpointManager::new(&self.checkpoint_dir);
        let cfg: TrainConfig = ckpt.load_config()?;
        let vocab = TokenizerStore::new(&self.checkpoint_dir).load()?;
        let model_cfg = cfg.model_config(&vocab)?;

        let mut model: CaptioningModel<InferBackend> = model_cfg.init(&device)?;
        if model_cfg.adaptive {
            let lm = model_cfg.language_model_config().init::<InferBackend>(&device);
            let lm = ckpt.load_model(lm, "lm", &device)?;
            model = model.with_language_model(lm);
        }
        let model = ckpt.load_model(model, &self.checkpoint, &device)?;
        tracing::info!("Model loaded from '{}' checkpoint", self.checkpoint);

        // Caption the split.
        let annotations = load_annotations(&self.input_json)?;
        let store = FeatureStore::new(&cfg.feature_dir);
        let dataset = DictionaryDataset::build(&annotations, &store)?;
        let loader = DataLoaderBuilder::new(DictionaryBatcher::<InferBackend>::new(device))
            .batch_size(self.batch_size)
            .build(dataset);

        let max_len = vocab.max_caption_length();
        let mut results: Vec<PredictionResult> = Vec::new();
        for batch in loader.iter() {
            let DictionaryBatch { features, boxes, image_ids, references } = batch;
            let geometry = match (&boxes, model_cfg.grid) {
                (Some(boxes), _) => Some(GeometrySource::Boxes(boxes.clone())),
                (None, Some((height, width))) => Some(GeometrySource::Grid { height, width }),
                (None, None) => None,
            };
            let out = model.beam_search(features, geometry.as_ref(), max_len, self.beam_size, 1);

            let [b, _, t] = out.sequences.dims();
            let flat = out
                .sequences
                .into_data()
                .convert::<i64>()
                .to_vec::<i64>()
                .unwrap_or_default();
            for i in 0..b {
                let ids: Vec<u32> =
                    flat[i * t..(i + 1) * t].iter().map(|&x| x as u32).collect();
                results.push(PredictionResult {
                    image_id: image_ids[i].clone(),
                    generated: vocab.decode_caption(&ids, true, true),
                    references: references[i].clone(),
                });
            }
        }
        tracing::info!("Generated {} captions", results.len());

        self.export(results)
    }

    /// Match generated captions to ids and write the output file.
    fn export(&self, results: Vec<PredictionResult>) -> Result<()> {
        let output = PathBuf::from(&self.output);
        match &self.sample_submission {
            Some(sample_path) => {
                let json = std::fs::read_to_string(sample_path)
                    .with_context(|| format!("Cannot read sample submission '{sample_path}'"))?;
                let mut entries: Vec<SubmissionEntry> = serde_json::from_str(&json)?;
                for entry in &mut entries {
                    if let Some(result) = results.iter().find(|r| r.image_id == entry.id) {
                        entry.captions = result.generated.clone();
                    }
                }
                std::fs::write(&output, serde_json::to_string_pretty(&entries)?)?;
            }
            None => {
                let entries: Vec<SubmissionEntry> = results
                    .iter()
                    .map(|r| SubmissionEntry { id: r.image_id.clone(), captions: r.generated.clone() })
                    .collect();
                std::fs::write(&output, serde_json::to_string_pretty(&entries)?)?;
            }
        }
        tracing::info!("Wrote submission to '{}'", output.display());
        Ok(())
    }
}
