// ============================================================
// Layer 5 — Beam Search
// ============================================================
// Drives the decoder's single-token step function. Step 0 runs
// at the original batch size and picks the first beam_size
// tokens; the encoder output and all running caches are then
// expanded to batch*beam and every later step selects the top
// beam_size continuations per batch element over beam*vocab
// candidates.
//
// A beam is finalized once it emits <eos>: its cumulative score
// is frozen (it occupies exactly one candidate slot, all other
// slots poisoned to -999) and its per-token log-probs contribute
// zeros from then on. The per-token log-probs of the surviving
// beams are returned alongside the sequences — the RL loss needs
// them with gradients attached.

use burn::prelude::*;

use crate::ml::encoder::EncoderOutput;
use crate::ml::geometry::GeometrySource;
use crate::ml::model::CaptioningModel;

/// Top `out_size` sequences per batch element, their per-token
/// log-probabilities and cumulative scores, all sorted by score
/// descending.
#[derive(Debug, Clone)]
pub struct BeamSearchOutput<B: Backend> {
    /// (batch, out_size, steps) generated token ids (no <bos>)
    pub sequences: Tensor<B, 3, Int>,
    /// (batch, out_size, steps) log-prob of each emitted token,
    /// zero after finalization
    pub log_probs: Tensor<B, 3>,
    /// (batch, out_size) cumulative sequence log-probabilities
    pub scores: Tensor<B, 2>,
}

impl<B: Backend> CaptioningModel<B> {
    /// Generate captions for a batch of images.
    ///
    /// `beam_size = 1` degenerates to greedy decoding. A batch
    /// element whose beams never emit <eos> still returns its top
    /// candidates at the full `max_len`.
    pub fn beam_search(
        &self,
        features: Tensor<B, 3>,
        geometry: Option<&GeometrySource<B>>,
        max_len: usize,
        beam_size: usize,
        out_size: usize,
    ) -> BeamSearchOutput<B> {
        assert!(beam_size > 0 && out_size > 0 && out_size <= beam_size);
        let b = features.dims()[0];
        let device = features.device();
        let eos = self.eos_idx() as i64;

        let mut enc = self.encode(features, geometry);
        let mut state = self.begin_generation();

        // (b, beam, 1) cumulative log-prob and 1/0 alive flag
        let mut seq_logprob = Tensor::<B, 3>::zeros([b, 1, 1], &device);
        let mut seq_mask = Tensor::<B, 3>::ones([b, beam_size, 1], &device);
        let mut outputs: Option<Tensor<B, 3, Int>> = None;
        let mut log_probs: Option<Tensor<B, 3>> = None;
        let mut selected_words =
            Tensor::<B, 2, Int>::full([b, 1], self.bos_idx() as i64, &device);
        let mut cur_beam = 1usize;

        for t in 0..max_len {
            let word_logprob = self.step(selected_words.clone(), &enc, &mut state);
            let vocab = word_logprob.dims()[2];
            let mut word_logprob = word_logprob.reshape([b, cur_beam, vocab]);

            let mut candidate_logprob = seq_logprob.clone() + word_logprob.clone();

            if t > 0 {
                // Beams whose previous token was <eos> are dead:
                // zero their token log-probs and pin their frozen
                // cumulative score into candidate slot 0.
                let alive = selected_words
                    .clone()
                    .reshape([b, cur_beam])
                    .equal_elem(eos)
                    .bool_not()
                    .float()
                    .reshape([b, cur_beam, 1]);
                seq_mask = seq_mask * alive;
                word_logprob = word_logprob * seq_mask.clone().expand([b, cur_beam, vocab]);

                let poisoned = Tensor::<B, 3>::full([b, cur_beam, vocab], -999.0, &device)
                    .slice_assign([0..b, 0..cur_beam, 0..1], seq_logprob.clone());
                let dead = (seq_mask.clone().neg() + 1.0).expand([b, cur_beam, vocab]);
                candidate_logprob = candidate_logprob
                    * seq_mask.clone().expand([b, cur_beam, vocab])
                    + poisoned * dead;
            }

            // Top beam_size candidates per batch element, stable
            // over the flattened (beam, word) axis.
            let flat = candidate_logprob.reshape([b, cur_beam * vocab]);
            let (selected_logprob, selected_idx) = flat.topk_with_indices(beam_size, 1);
            let selected_beam = selected_idx.clone().div_scalar(vocab as i64); // (b, beam)
            let selected_word =
                selected_idx - selected_beam.clone().mul_scalar(vocab as i64);

            if t == 0 {
                // All beams of an element share the prefix —
                // duplicate rather than reorder.
                enc = enc.expand_beams(beam_size);
                state.expand_beams(beam_size);
            } else {
                // Shuffle every cache row to its surviving beam.
                let flat_indices = (Tensor::<B, 1, Int>::arange(0..b as i64, &device)
                    .mul_scalar(cur_beam as i64)
                    .reshape([b, 1])
                    + selected_beam.clone())
                .reshape([b * beam_size]);
                state.reorder(&flat_indices);
            }

            // Carry histories over to the new beam order.
            let this_word_logprob = if t > 0 {
                let beam_gather =
                    selected_beam.clone().reshape([b, beam_size, 1]);
                seq_mask = seq_mask.gather(1, beam_gather.clone());
                outputs = outputs.map(|o| {
                    let steps = o.dims()[2];
                    o.gather(1, beam_gather.clone().expand([b, beam_size, steps]))
                });
                log_probs = log_probs.map(|lp| {
                    let steps = lp.dims()[2];
                    lp.gather(1, beam_gather.clone().expand([b, beam_size, steps]))
                });
                word_logprob
                    .gather(1, beam_gather.expand([b, beam_size, vocab]))
                    .gather(2, selected_word.clone().reshape([b, beam_size, 1]))
            } else {
                selected_logprob.clone().reshape([b, beam_size, 1])
            };

            seq_logprob = selected_logprob.reshape([b, beam_size, 1]);
            outputs = Some(match outputs.take() {
                Some(o) => Tensor::cat(vec![o, selected_word.clone().reshape([b, beam_size, 1])], 2),
                None => selected_word.clone().reshape([b, beam_size, 1]),
            });
            log_probs = Some(match log_probs.take() {
                Some(lp) => Tensor::cat(vec![lp, this_word_logprob], 2),
                None => this_word_logprob,
            });

            selected_words = selected_word.clone().reshape([b * beam_size, 1]);
            cur_beam = beam_size;

            // Every beam of every element finalized — stop early.
            let still_alive = seq_mask.clone()
                * selected_word
                    .equal_elem(eos)
                    .bool_not()
                    .float()
                    .reshape([b, beam_size, 1]);
            if still_alive.sum().into_scalar().elem::<f32>() == 0.0 {
                break;
            }
        }

        // Rank beams by cumulative score and keep the requested
        // top out_size.
        let outputs = outputs.expect("beam search ran zero steps");
        let log_probs = log_probs.expect("beam search ran zero steps");
        let steps = outputs.dims()[2];

        let (scores, sort_indices) =
            seq_logprob.reshape([b, beam_size]).topk_with_indices(out_size, 1);
        let gather = sort_indices.reshape([b, out_size, 1]);
        let sequences = outputs.gather(1, gather.clone().expand([b, out_size, steps]));
        let log_probs = log_probs.gather(1, gather.expand([b, out_size, steps]));

        BeamSearchOutput { sequences, log_probs, scores }
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::model::tests::tiny_config;

    type TB = burn::backend::NdArray;
    type TDevice = <TB as Backend>::Device;

    #[test]
    fn test_beam_of_one_is_greedy_decoding() {
        // beam_size = 1 must equal taking the argmax token at
        // every incremental step.
        let device: TDevice = Default::default();
        let model = tiny_config().init::<TB>(&device).unwrap();
        let features =
            Tensor::<TB, 3>::random([1, 4, 8], burn::tensor::Distribution::Default, &device);
        let max_len = 6;

        let out = model.beam_search(features.clone(), None, max_len, 1, 1);
        let beam_tokens = out
            .sequences
            .clone()
            .reshape([out.sequences.dims()[2]])
            .into_data()
            .to_vec::<i64>()
            .unwrap();

        // manual greedy rollout
        let enc = model.encode(features, None);
        let mut state = model.begin_generation();
        let mut token = model.bos_idx() as i32;
        let mut greedy = Vec::new();
        for _ in 0..beam_tokens.len() {
            let input = Tensor::<TB, 1, Int>::from_ints([token].as_slice(), &device).reshape([1, 1]);
            let log_probs = model.step(input, &enc, &mut state);
            let next = log_probs.argmax(2).reshape([1]).into_data().to_vec::<i64>().unwrap()[0];
            greedy.push(next);
            token = next as i32;
            if next == model.eos_idx() as i64 {
                break;
            }
        }

        assert_eq!(beam_tokens[..greedy.len()], greedy[..]);
    }

    #[test]
    fn test_output_shapes_and_score_order() {
        let device: TDevice = Default::default();
        let model = tiny_config().init::<TB>(&device).unwrap();
        let features =
            Tensor::<TB, 3>::random([2, 3, 8], burn::tensor::Distribution::Default, &device);
        let out = model.beam_search(features, None, 5, 3, 2);

        let [b, k, steps] = out.sequences.dims();
        assert_eq!((b, k), (2, 2));
        assert!(steps <= 5);
        assert_eq!(out.log_probs.dims(), [2, 2, steps]);

        // scores sorted descending per batch element
        let scores = out.scores.into_data().to_vec::<f32>().unwrap();
        assert!(scores[0] >= scores[1]);
        assert!(scores[2] >= scores[3]);
    }

    #[test]
    fn test_unterminated_beams_run_to_max_len() {
        // With an untrained tiny model some element will usually
        // fail to emit <eos>; whatever happens, the search never
        // exceeds max_len and always returns out_size candidates.
        let device: TDevice = Default::default();
        let model = tiny_config().init::<TB>(&device).unwrap();
        let features =
            Tensor::<TB, 3>::random([1, 3, 8], burn::tensor::Distribution::Default, &device);
        let max_len = 4;
        let out = model.beam_search(features, None, max_len, 2, 2);
        assert!(out.sequences.dims()[2] <= max_len);
        assert_eq!(out.sequences.dims()[1], 2);
    }
}
