// ============================================================
// Layer 3 — Vocabulary
// ============================================================
// Wraps a word-level `tokenizers::Tokenizer` built from the
// caption corpus and owns everything the model needs to know
// about token ids: the reserved special ids, the vocabulary
// size and the maximum caption length (which sizes the
// positional encoding).
//
// Built once before training, immutable afterwards, persisted
// next to the model checkpoint — both must agree at load time.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

/// Reserved ids, fixed across every run:
///   <pad> = 0, <bos> = 1, <eos> = 2, <unk> = 3
pub const PAD_IDX: usize = 0;
pub const BOS_IDX: usize = 1;
pub const EOS_IDX: usize = 2;
pub const UNK_IDX: usize = 3;

pub const PAD_TOKEN: &str = "<pad>";
pub const BOS_TOKEN: &str = "<bos>";
pub const EOS_TOKEN: &str = "<eos>";
pub const UNK_TOKEN: &str = "<unk>";

/// Caption-length statistics and the token <-> id mapping.
pub struct Vocab {
    tokenizer: Tokenizer,
    /// Longest encoded caption (bos + tokens + eos) seen at build time
    max_caption_length: usize,
}

/// The part of the vocabulary that is not stored inside the
/// tokenizer JSON — persisted as vocab_meta.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VocabMeta {
    pub max_caption_length: usize,
}

impl Vocab {
    pub fn new(tokenizer: Tokenizer, max_caption_length: usize) -> Self {
        Self { tokenizer, max_caption_length }
    }

    pub fn len(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_caption_length(&self) -> usize {
        self.max_caption_length
    }

    /// Encode a raw caption into `<bos> w1 .. wn <eos>`.
    /// Unknown words map to `<unk>`.
    pub fn encode_caption(&self, caption: &str) -> Result<Vec<u32>> {
        let enc = self
            .tokenizer
            .encode(caption, false)
            .map_err(|e| anyhow::anyhow!("caption tokenise: {e}"))?;
        let mut ids = Vec::with_capacity(enc.get_ids().len() + 2);
        ids.push(BOS_IDX as u32);
        ids.extend_from_slice(enc.get_ids());
        ids.push(EOS_IDX as u32);
        Ok(ids)
    }

    /// Decode generated token ids back into a caption string.
    ///
    /// * `stop_at_eos`   — truncate at the first `<eos>`
    /// * `collapse_runs` — keep only the first token of every
    ///   run of consecutive duplicates (beam search sometimes
    ///   stutters on a word)
    pub fn decode_caption(&self, ids: &[u32], stop_at_eos: bool, collapse_runs: bool) -> String {
        let mut words: Vec<String> = Vec::new();
        let mut previous: Option<u32> = None;
        for &id in ids {
            if stop_at_eos && id == EOS_IDX as u32 {
                break;
            }
            if id == PAD_IDX as u32 || id == BOS_IDX as u32 || id == EOS_IDX as u32 {
                previous = Some(id);
                continue;
            }
            if collapse_runs && previous == Some(id) {
                continue;
            }
            if let Some(word) = self.tokenizer.id_to_token(id) {
                words.push(word);
            }
            previous = Some(id);
        }
        words.join(" ")
    }
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::tokenizer_store::build_word_level_tokenizer;

    fn small_vocab() -> Vocab {
        let captions = vec![
            "a man rides a horse".to_string(),
            "a dog runs on grass".to_string(),
        ];
        let tokenizer = build_word_level_tokenizer(&captions, 1).unwrap();
        Vocab::new(tokenizer, 7)
    }

    #[test]
    fn test_encode_wraps_with_bos_eos() {
        let vocab = small_vocab();
        let ids = vocab.encode_caption("a man rides a horse").unwrap();
        assert_eq!(ids[0], BOS_IDX as u32);
        assert_eq!(*ids.last().unwrap(), EOS_IDX as u32);
        assert_eq!(ids.len(), 7);
    }

    #[test]
    fn test_decode_stops_at_eos() {
        let vocab = small_vocab();
        let ids = vocab.encode_caption("a man rides a horse").unwrap();
        let mut with_tail = ids.clone();
        with_tail.extend_from_slice(&ids[1..3]); // garbage after <eos>
        let decoded = vocab.decode_caption(&with_tail, true, false);
        assert_eq!(decoded, "a man rides a horse");
    }

    #[test]
    fn test_decode_collapses_duplicate_runs() {
        let vocab = small_vocab();
        let a = vocab.encode_caption("a").unwrap()[1];
        let dog = vocab.encode_caption("dog").unwrap()[1];
        let decoded = vocab.decode_caption(&[a, a, dog, dog, dog, a], false, true);
        assert_eq!(decoded, "a dog a");
    }

    #[test]
    fn test_unknown_word_maps_to_unk() {
        let vocab = small_vocab();
        let ids = vocab.encode_caption("a zebra").unwrap();
        assert_eq!(ids[2], UNK_IDX as u32);
    }
}
