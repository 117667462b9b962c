// ============================================================
// Layer 5 — Training Loop
// ============================================================
// The two-phase training loop around the domain-level schedule
// state machine:
//
//   XE phase  — teacher-forced NLL, Adam under a Noam warm-up
//               schedule keyed to d_model
//   RL phase  — self-critical sequence training: beam_size
//               sampled captions per image, CIDEr-D reward, the
//               beam mean as baseline, Adam reinitialized at a
//               reduced fixed rate
//
// Every epoch ends with validation loss + CIDEr, a checkpoint
// write ("last", promoted to "best" on improvement) and one
// metrics CSV row. The schedule decides continue / switch /
// stop; a non-best switch epoch rolls the model back to the best
// checkpoint before the RL phase begins.
//
// Training uses Autodiff<Wgpu>; validation runs on the inner
// backend via model.valid() (dropout disabled, no autodiff
// overhead).
//
// Reference: Vaswani et al. (2017) (warm-up schedule)
//            Rennie et al. (2017) SCST

use anyhow::Result;
use std::sync::Arc;
use burn::{
    data::dataloader::{DataLoader, DataLoaderBuilder},
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
};

use crate::application::train_use_case::TrainConfig;
use crate::data::batcher::{
    CaptionBatch, CaptionBatcher, DictionaryBatch, DictionaryBatcher, TokenBatcher,
};
use crate::data::dataset::{CaptionDataset, DictionaryDataset, TokenDataset};
use crate::domain::schedule::{Action, Phase, TrainingSchedule};
use crate::domain::vocab::Vocab;
use crate::evaluation::{self, CiderD, Scorer};
use crate::infra::checkpoint::{CheckpointManager, TrainingSnapshot};
use crate::infra::metrics::{EpochMetrics, MetricsLogger};
use crate::ml::geometry::GeometrySource;
use crate::ml::model::CaptioningModel;

type TrainBackend = burn::backend::Autodiff<burn::backend::Wgpu>;
type InferBackend = burn::backend::Wgpu;

/// Warm-up-then-inverse-square-root learning rate:
/// lr(step) = d_model^-0.5 * min(step^-0.5, step * warmup^-1.5)
#[derive(Debug, Clone)]
pub struct NoamSchedule {
    d_model: f64,
    warmup: f64,
    step: usize,
}

impl NoamSchedule {
    pub fn new(d_model: usize, warmup: usize) -> Self {
        Self { d_model: d_model as f64, warmup: warmup as f64, step: 0 }
    }

    pub fn resume_from(d_model: usize, warmup: usize, step: usize) -> Self {
        Self { step, ..Self::new(d_model, warmup) }
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Advance one optimizer step and return its learning rate.
    pub fn next(&mut self) -> f64 {
        self.step += 1;
        let step = self.step as f64;
        self.d_model.powf(-0.5) * f64::min(step.powf(-0.5), step * self.warmup.powf(-1.5))
    }
}

/// Negative log-likelihood over log-probabilities, ignoring the
/// pad index (mean over non-padding tokens).
pub fn nll_loss<B: Backend>(
    log_probs: Tensor<B, 3>,
    targets: Tensor<B, 2, Int>,
    padding_idx: usize,
) -> Tensor<B, 1> {
    let [b, s, _] = log_probs.dims();
    let gathered = log_probs.gather(2, targets.clone().reshape([b, s, 1])).reshape([b, s]);
    let mask = targets.equal_elem(padding_idx as i64).bool_not().float();
    let token_count = mask.clone().sum().clamp_min(1.0);
    (gathered * mask).sum().neg() / token_count
}

/// Resolve the geometry input for a batch: detector boxes win,
/// a configured grid layout is the fallback for grid features.
fn geometry_from<B: Backend>(
    boxes: &Option<Tensor<B, 3>>,
    grid: Option<(usize, usize)>,
) -> Option<GeometrySource<B>> {
    match (boxes, grid) {
        (Some(boxes), _) => Some(GeometrySource::Boxes(boxes.clone())),
        (None, Some((height, width))) => Some(GeometrySource::Grid { height, width }),
        (None, None) => None,
    }
}

/// Decode generated id sequences into caption strings (stop at
/// <eos>, collapse stuttered words).
fn decode_sequences<B: Backend>(vocab: &Vocab, sequences: Tensor<B, 3, Int>) -> Vec<String> {
    let [b, k, t] = sequences.dims();
    let flat = sequences
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .unwrap_or_default();
    (0..b * k)
        .map(|row| {
            let ids: Vec<u32> = flat[row * t..(row + 1) * t].iter().map(|&x| x as u32).collect();
            vocab.decode_caption(&ids, true, true)
        })
        .collect()
}

/// Everything the two-phase loop trains and evaluates on.
pub struct TrainingData {
    pub train: CaptionDataset,
    pub val: CaptionDataset,
    pub train_dict: DictionaryDataset,
    pub val_dict: DictionaryDataset,
    pub test_dict: Option<DictionaryDataset>,
}

pub fn run_training(
    cfg: &TrainConfig,
    vocab: Arc<Vocab>,
    data: TrainingData,
    ckpt: CheckpointManager,
    metrics: MetricsLogger,
) -> Result<()> {
    let device = burn::backend::wgpu::WgpuDevice::default();
    tracing::info!("Using WGPU device: {:?}", device);

    let model_cfg = cfg.model_config(&vocab)?;
    let mut model: CaptioningModel<TrainBackend> = model_cfg.init(&device)?;
    if model_cfg.adaptive {
        // The adaptive variant consumes a separately-trained,
        // frozen language model; missing is a hard error.
        let lm = model_cfg.language_model_config().init::<TrainBackend>(&device);
        let lm = ckpt.load_model(lm, "lm", &device)?;
        model = model.with_language_model(lm);
        tracing::info!("Loaded frozen language model for adaptive attention");
    }
    tracing::info!(
        "Model ready: {} encoder / {} decoder layers, d_model={}",
        model_cfg.n_enc_layers,
        model_cfg.n_dec_layers,
        model_cfg.d_model
    );

    let grid = model_cfg.grid;
    let max_len = vocab.max_caption_length();
    let padding_idx = model_cfg.padding_idx;

    let mut optim = AdamConfig::new().with_beta_2(0.98).with_epsilon(1e-8).init();
    let mut scheduler = NoamSchedule::new(cfg.d_model, cfg.warmup);
    let mut schedule = TrainingSchedule::new();
    let mut epoch = 0usize;

    // Reward scorer: document frequencies over the training
    // references, fixed for the whole run.
    let train_refs: Vec<Vec<String>> = data
        .train_dict
        .references()
        .iter()
        .map(|refs| evaluation::tokenize(refs))
        .collect();
    let reward_scorer = CiderD::from_corpus(&train_refs);

    // Resume: an explicitly requested checkpoint must exist; no
    // request means start fresh.
    if let Some(stem) = &cfg.resume {
        anyhow::ensure!(
            ckpt.exists(stem),
            "requested resume checkpoint '{stem}' does not exist in {}",
            ckpt.dir().display()
        );
        let snapshot = ckpt.load_snapshot(stem)?;
        model = ckpt.load_model(model, stem, &device)?;
        let optim_record = ckpt.load_optimizer::<TrainBackend, _>(stem, &device)?;
        optim = optim.load_record(optim_record);
        scheduler = NoamSchedule::resume_from(cfg.d_model, cfg.warmup, snapshot.lr_step);
        schedule = snapshot.schedule.clone();
        epoch = snapshot.epoch + 1;
        tracing::info!(
            "Resumed from epoch {} - val loss {:.4} - best val CIDEr {:.4} - best test CIDEr {:.4}",
            snapshot.epoch,
            snapshot.val_loss,
            snapshot.schedule.best_val_cider,
            snapshot.schedule.best_test_cider
        );
    }

    let rl_batch_size = (cfg.batch_size / cfg.beam_size).max(1);

    loop {
        // Deterministic per-epoch shuffling: seed + epoch.
        let shuffle_seed = cfg.seed + epoch as u64;

        // ── Training phase ────────────────────────────────────────────────────
        let train_loss = match schedule.phase {
            Phase::CrossEntropy => {
                let loader = DataLoaderBuilder::new(CaptionBatcher::<TrainBackend>::new(
                    device.clone(),
                ))
                .batch_size(cfg.batch_size)
                .shuffle(shuffle_seed)
                .num_workers(cfg.workers)
                .build(data.train.clone());
                let (updated, loss) =
                    train_xe_epoch(model, loader, &mut optim, &mut scheduler, grid, padding_idx);
                model = updated;
                loss
            }
            Phase::SelfCritical => {
                let loader = DataLoaderBuilder::new(DictionaryBatcher::<TrainBackend>::new(
                    device.clone(),
                ))
                .batch_size(rl_batch_size)
                .shuffle(shuffle_seed)
                .num_workers(cfg.workers)
                .build(data.train_dict.clone());
                let (updated, loss, reward, baseline) = train_scst_epoch(
                    model,
                    loader,
                    &mut optim,
                    &reward_scorer,
                    &vocab,
                    grid,
                    max_len,
                    cfg.beam_size,
                    cfg.rl_lr,
                );
                model = updated;
                tracing::info!(
                    "Epoch {} SCST: reward={:.4} baseline={:.4}",
                    epoch,
                    reward,
                    baseline
                );
                loss
            }
        };

        // ── Validation ────────────────────────────────────────────────────────
        let model_valid = model.valid();

        let val_loader = DataLoaderBuilder::new(CaptionBatcher::<InferBackend>::new(
            device.clone(),
        ))
        .batch_size(cfg.batch_size)
        .num_workers(cfg.workers)
        .build(data.val.clone());
        let val_loss = evaluate_loss(&model_valid, val_loader, grid, padding_idx);

        let val_dict_loader = DataLoaderBuilder::new(DictionaryBatcher::<InferBackend>::new(
            device.clone(),
        ))
        .batch_size(rl_batch_size)
        .build(data.val_dict.clone());
        let val_cider =
            evaluate_metrics(&model_valid, val_dict_loader, &vocab, grid, max_len, cfg.beam_size);

        if let Some(test_dict) = &data.test_dict {
            let test_loader = DataLoaderBuilder::new(DictionaryBatcher::<InferBackend>::new(
                device.clone(),
            ))
            .batch_size(rl_batch_size)
            .build(test_dict.clone());
            let test_cider = evaluate_metrics(
                &model_valid,
                test_loader,
                &vocab,
                grid,
                max_len,
                cfg.beam_size,
            );
            schedule.observe_test(test_cider);
            tracing::info!("Epoch {} test CIDEr: {:.4}", epoch, test_cider);
        }

        let phase = schedule.phase;
        let verdict = schedule.observe_validation(val_cider);

        println!(
            "Epoch {:>3} [{}] | train_loss={:.4} | val_loss={:.4} | val_cider={:.4} | best={:.4} | patience={}",
            epoch,
            match phase {
                Phase::CrossEntropy => "xe",
                Phase::SelfCritical => "rl",
            },
            train_loss,
            val_loss,
            val_cider,
            schedule.best_val_cider,
            schedule.patience,
        );

        // ── Transition ────────────────────────────────────────────────────────
        if let Action::SwitchToSelfCritical { rollback } = verdict.action {
            if rollback {
                // RL must start from the best XE weights, not a
                // possibly-regressed epoch.
                let best = ckpt.load_snapshot("best")?;
                model = ckpt.load_model(model, "best", &device)?;
                tracing::info!(
                    "Rolled back to best epoch {} (val CIDEr {:.4}) before RL",
                    best.epoch,
                    best.val_cider
                );
            }
            optim = AdamConfig::new().init();
            tracing::info!("Switching to self-critical learning (lr={})", cfg.rl_lr);
        }

        // ── Checkpoint + metrics ──────────────────────────────────────────────
        let snapshot = TrainingSnapshot {
            epoch,
            val_loss,
            val_cider,
            schedule: schedule.clone(),
            lr_step: scheduler.step_count(),
            seed: cfg.seed,
        };
        ckpt.save_snapshot("last", &snapshot)?;
        ckpt.save_model(&model, "last")?;
        ckpt.save_optimizer::<TrainBackend, _>(optim.to_record(), "last")?;
        if verdict.best {
            ckpt.promote_last_to_best()?;
        }

        metrics.log(&EpochMetrics {
            epoch,
            phase,
            train_loss,
            val_loss,
            val_cider,
            best_val_cider: schedule.best_val_cider,
            patience: schedule.patience,
        })?;

        if verdict.action == Action::Stop {
            tracing::info!("Patience reached in the RL phase — training complete");
            break;
        }
        epoch += 1;
    }

    Ok(())
}

/// One teacher-forced pass over the training set.
fn train_xe_epoch<O>(
    mut model: CaptioningModel<TrainBackend>,
    loader: Arc<dyn DataLoader<CaptionBatch<TrainBackend>>>,
    optim: &mut O,
    scheduler: &mut NoamSchedule,
    grid: Option<(usize, usize)>,
    padding_idx: usize,
) -> (CaptioningModel<TrainBackend>, f64)
where
    O: Optimizer<CaptioningModel<TrainBackend>, TrainBackend>,
{
    let mut loss_sum = 0.0f64;
    let mut batches = 0usize;

    for batch in loader.iter() {
        let geometry = geometry_from(&batch.boxes, grid);
        let out = model.forward(batch.features, geometry.as_ref(), batch.tokens);
        let loss = nll_loss(out, batch.targets, padding_idx);

        loss_sum += loss.clone().into_scalar().elem::<f64>();
        batches += 1;

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &model);
        let lr = scheduler.next();
        model = optim.step(lr, model, grads);
    }

    let avg = if batches > 0 { loss_sum / batches as f64 } else { f64::NAN };
    (model, avg)
}

/// One self-critical pass over the dictionary set. Returns
/// (model, avg loss, avg reward, avg baseline).
#[allow(clippy::too_many_arguments)]
fn train_scst_epoch<O>(
    mut model: CaptioningModel<TrainBackend>,
    loader: Arc<dyn DataLoader<DictionaryBatch<TrainBackend>>>,
    optim: &mut O,
    scorer: &CiderD,
    vocab: &Vocab,
    grid: Option<(usize, usize)>,
    max_len: usize,
    beam_size: usize,
    rl_lr: f64,
) -> (CaptioningModel<TrainBackend>, f64, f64, f64)
where
    O: Optimizer<CaptioningModel<TrainBackend>, TrainBackend>,
{
    let device = burn::backend::wgpu::WgpuDevice::default();
    let mut loss_sum = 0.0f64;
    let mut reward_sum = 0.0f64;
    let mut baseline_sum = 0.0f64;
    let mut batches = 0usize;

    for batch in loader.iter() {
        let geometry = geometry_from(&batch.boxes, grid);
        let out =
            model.beam_search(batch.features, geometry.as_ref(), max_len, beam_size, beam_size);
        let [b, k, _] = out.sequences.dims();

        // Reward: CIDEr of every sampled caption against all of
        // its image's references; tokenization fans out over the
        // worker pool.
        let decoded = decode_sequences(vocab, out.sequences.clone());
        let candidates = evaluation::tokenize(&decoded);
        let references: Vec<Vec<String>> = batch
            .references
            .iter()
            .flat_map(|refs| {
                let tokenized = evaluation::tokenize(refs);
                std::iter::repeat(tokenized).take(k)
            })
            .collect();
        let (_, rewards) = scorer.compute(&references, &candidates);

        let rewards_f32: Vec<f32> = rewards.iter().map(|&r| r as f32).collect();
        let reward =
            Tensor::<TrainBackend, 1>::from_floats(rewards_f32.as_slice(), &device).reshape([b, k]);
        // Self-critical baseline: the beam mean, no learned
        // value function.
        let baseline = reward.clone().mean_dim(1); // (b, 1)
        let advantage = reward.clone() - baseline.clone().expand([b, k]);

        let mean_log_prob = out.log_probs.mean_dim(2).reshape([b, k]);
        let loss = (mean_log_prob.neg() * advantage).mean();

        loss_sum += loss.clone().into_scalar().elem::<f64>();
        reward_sum += reward.mean().into_scalar().elem::<f64>();
        baseline_sum += baseline.mean().into_scalar().elem::<f64>();
        batches += 1;

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &model);
        model = optim.step(rl_lr, model, grads);
    }

    let denom = batches.max(1) as f64;
    (model, loss_sum / denom, reward_sum / denom, baseline_sum / denom)
}

/// Average validation NLL on the inner backend.
fn evaluate_loss(
    model: &CaptioningModel<InferBackend>,
    loader: Arc<dyn DataLoader<CaptionBatch<InferBackend>>>,
    grid: Option<(usize, usize)>,
    padding_idx: usize,
) -> f64 {
    let mut loss_sum = 0.0f64;
    let mut batches = 0usize;
    for batch in loader.iter() {
        let geometry = geometry_from(&batch.boxes, grid);
        let out = model.forward(batch.features, geometry.as_ref(), batch.tokens);
        let loss = nll_loss(out, batch.targets, padding_idx);
        loss_sum += loss.into_scalar().elem::<f64>();
        batches += 1;
    }
    if batches > 0 {
        loss_sum / batches as f64
    } else {
        f64::NAN
    }
}

/// Corpus CIDEr of greedy-ish (out_size = 1) beam search output
/// against the split's own references.
fn evaluate_metrics(
    model: &CaptioningModel<InferBackend>,
    loader: Arc<dyn DataLoader<DictionaryBatch<InferBackend>>>,
    vocab: &Vocab,
    grid: Option<(usize, usize)>,
    max_len: usize,
    beam_size: usize,
) -> f64 {
    let mut generated: Vec<String> = Vec::new();
    let mut references: Vec<Vec<String>> = Vec::new();

    for batch in loader.iter() {
        let geometry = geometry_from(&batch.boxes, grid);
        let out = model.beam_search(batch.features, geometry.as_ref(), max_len, beam_size, 1);
        generated.extend(evaluation::tokenize(&decode_sequences(vocab, out.sequences)));
        references.extend(batch.references.iter().map(|refs| evaluation::tokenize(refs)));
    }

    let cider = CiderD::from_corpus(&references);
    cider.compute(&references, &generated).0
}

// ─── Language-model pre-training ──────────────────────────────────────────────

/// Train the auxiliary language model on caption tokens with the
/// same NLL objective and warm-up schedule, keeping the
/// best-validation weights under the "lm" checkpoint stem.
pub fn run_language_model_training(
    cfg: &TrainConfig,
    vocab: &Vocab,
    train: TokenDataset,
    val: TokenDataset,
    ckpt: &CheckpointManager,
) -> Result<()> {
    let device = burn::backend::wgpu::WgpuDevice::default();
    tracing::info!("Using WGPU device: {:?}", device);

    let lm_config = cfg.model_config(vocab)?.language_model_config();
    let mut lm = lm_config.init::<TrainBackend>(&device);
    let padding_idx = lm_config.padding_idx;

    let mut optim = AdamConfig::new().with_beta_2(0.98).with_epsilon(1e-8).init();
    let mut scheduler = NoamSchedule::new(cfg.d_model, cfg.warmup);
    let mut best_val_loss = f64::INFINITY;

    for epoch in 1..=cfg.lm_epochs {
        let loader = DataLoaderBuilder::new(TokenBatcher::<TrainBackend>::new(device.clone()))
            .batch_size(cfg.batch_size)
            .shuffle(cfg.seed + epoch as u64)
            .num_workers(cfg.workers)
            .build(train.clone());

        let mut loss_sum = 0.0f64;
        let mut batches = 0usize;
        for batch in loader.iter() {
            let (log_probs, _) = lm.forward(batch.tokens, None);
            let loss = nll_loss(log_probs, batch.targets, padding_idx);
            loss_sum += loss.clone().into_scalar().elem::<f64>();
            batches += 1;

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &lm);
            let lr = scheduler.next();
            lm = optim.step(lr, lm, grads);
        }
        let train_loss = loss_sum / batches.max(1) as f64;

        let lm_valid = lm.valid();
        let val_loader = DataLoaderBuilder::new(TokenBatcher::<InferBackend>::new(device.clone()))
            .batch_size(cfg.batch_size)
            .build(val.clone());
        let mut val_sum = 0.0f64;
        let mut val_batches = 0usize;
        for batch in val_loader.iter() {
            let (log_probs, _) = lm_valid.forward(batch.tokens, None);
            val_sum += nll_loss(log_probs, batch.targets, padding_idx)
                .into_scalar()
                .elem::<f64>();
            val_batches += 1;
        }
        let val_loss = val_sum / val_batches.max(1) as f64;

        println!(
            "LM epoch {:>3}/{} | train_loss={:.4} | val_loss={:.4}",
            epoch, cfg.lm_epochs, train_loss, val_loss
        );

        if val_loss < best_val_loss {
            best_val_loss = val_loss;
            ckpt.save_model(&lm, "lm")?;
            tracing::info!("Saved best language model (val_loss={:.4})", val_loss);
        }
    }

    Ok(())
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;

    type TB = burn::backend::NdArray;

    #[test]
    fn test_noam_schedule_warms_up_then_decays() {
        let mut schedule = NoamSchedule::new(512, 100);
        let mut rates: Vec<f64> = Vec::new();
        for _ in 0..300 {
            rates.push(schedule.next());
        }
        // rising through warm-up
        assert!(rates[10] < rates[50]);
        assert!(rates[50] < rates[99]);
        // decaying afterwards
        assert!(rates[99] > rates[200]);
        // exact closed form at an arbitrary step
        let step = 42f64;
        let expected = (512f64).powf(-0.5) * f64::min(step.powf(-0.5), step * (100f64).powf(-1.5));
        assert!((rates[41] - expected).abs() < 1e-12);
    }

    #[test]
    fn test_noam_schedule_resumes_at_step() {
        let mut fresh = NoamSchedule::new(512, 100);
        for _ in 0..50 {
            fresh.next();
        }
        let mut resumed = NoamSchedule::resume_from(512, 100, 50);
        assert!((fresh.next() - resumed.next()).abs() < 1e-15);
    }

    #[test]
    fn test_nll_loss_ignores_padding() {
        let device = Default::default();
        // Two positions, vocab 4; second position is padding.
        let log_probs = burn::tensor::activation::log_softmax(
            Tensor::<TB, 1>::from_floats(
                [1.0, 0.0, 0.0, 0.0, /* pos 2 */ 9.0, 9.0, 9.0, 9.0].as_slice(),
                &device,
            )
            .reshape([1, 2, 4]),
            2,
        );
        let targets =
            Tensor::<TB, 1, Int>::from_ints([2, 0].as_slice(), &device).reshape([1, 2]);
        let loss = nll_loss(log_probs.clone(), targets, 0).into_scalar();

        // expected: -log_softmax([1,0,0,0])[2], the pad position
        // contributes nothing
        let expected = -log_probs.slice([0..1, 0..1, 2..3]).into_scalar();
        assert!((loss - expected).abs() < 1e-6);
    }

    #[test]
    fn test_nll_loss_averages_over_non_pad_tokens() {
        let device = Default::default();
        let uniform = burn::tensor::activation::log_softmax(
            Tensor::<TB, 3>::zeros([1, 3, 5], &device),
            2,
        );
        let targets =
            Tensor::<TB, 1, Int>::from_ints([1, 2, 0].as_slice(), &device).reshape([1, 3]);
        let loss = nll_loss(uniform, targets, 0).into_scalar();
        // uniform over 5 classes -> -ln(1/5) per real token
        assert!((loss - (5f32).ln()).abs() < 1e-5);
    }
}
