// ============================================================
// Layer 6 — Tokenizer Store
// ============================================================
// Builds a word-level vocabulary from the caption corpus and
// persists it as a HuggingFace tokenizer JSON next to the
// checkpoints. The JSON is written directly (word frequencies ->
// vocab map) and loaded back through `Tokenizer::from_file`,
// which keeps the tokenizer and the model checkpoint in the same
// directory and guarantees they agree at load time.
//
// Reserved ids are fixed: <pad>=0 <bos>=1 <eos>=2 <unk>=3.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::domain::vocab::{Vocab, VocabMeta, BOS_TOKEN, EOS_TOKEN, PAD_TOKEN, UNK_TOKEN};

pub struct TokenizerStore {
    dir: PathBuf,
}

impl TokenizerStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Load an existing vocabulary or build one from the caption
    /// corpus. Words below `min_freq` fall back to `<unk>`.
    pub fn load_or_build(&self, captions: &[String], min_freq: usize) -> Result<Vocab> {
        let tok_path = self.dir.join("tokenizer.json");
        if tok_path.exists() {
            tracing::info!("Loading existing tokenizer from disk");
            self.load()
        } else {
            tracing::info!("Building new tokenizer (min_freq={})", min_freq);
            self.build_and_save(captions, min_freq)
        }
    }

    /// Load a previously saved vocabulary (tokenizer + metadata).
    pub fn load(&self) -> Result<Vocab> {
        let tok_path = self.dir.join("tokenizer.json");
        let tokenizer = Tokenizer::from_file(&tok_path).map_err(|e| {
            anyhow::anyhow!("Cannot load tokenizer from '{}': {}", tok_path.display(), e)
        })?;
        let meta_path = self.dir.join("vocab_meta.json");
        let meta: VocabMeta = serde_json::from_str(
            &std::fs::read_to_string(&meta_path)
                .with_context(|| format!("Cannot read '{}'", meta_path.display()))?,
        )?;
        Ok(Vocab::new(tokenizer, meta.max_caption_length))
    }

    fn build_and_save(&self, captions: &[String], min_freq: usize) -> Result<Vocab> {
        std::fs::create_dir_all(&self.dir).ok();

        let tokenizer = build_word_level_tokenizer(captions, min_freq)?;

        let tok_path = self.dir.join("tokenizer.json");
        tokenizer
            .save(tok_path.to_str().unwrap_or("tokenizer.json"), true)
            .map_err(|e| anyhow::anyhow!("Cannot write tokenizer JSON: {e}"))?;

        // Longest encoded caption (with <bos>/<eos>) sizes the
        // positional encoding.
        let mut max_caption_length = 2;
        for caption in captions {
            let enc = tokenizer
                .encode(caption.as_str(), false)
                .map_err(|e| anyhow::anyhow!("Tokenisation error: {e}"))?;
            max_caption_length = max_caption_length.max(enc.get_ids().len() + 2);
        }
        let meta = VocabMeta { max_caption_length };
        std::fs::write(
            self.dir.join("vocab_meta.json"),
            serde_json::to_string_pretty(&meta)?,
        )?;

        tracing::info!(
            "Tokenizer built: {} tokens, max caption length {}",
            tokenizer.get_vocab_size(true),
            max_caption_length
        );
        Ok(Vocab::new(tokenizer, max_caption_length))
    }
}

/// Build a word-level tokenizer JSON from raw captions and load
/// it back as a `Tokenizer`. Words are lowercased and split on
/// whitespace; ids are assigned by descending frequency after the
/// four reserved tokens.
pub fn build_word_level_tokenizer(captions: &[String], min_freq: usize) -> Result<Tokenizer> {
    let mut freq: HashMap<String, usize> = HashMap::new();
    for caption in captions {
        for word in caption.split_whitespace() {
            let w = word.to_lowercase();
            if !w.is_empty() {
                *freq.entry(w).or_insert(0) += 1;
            }
        }
    }

    let mut words: Vec<(String, usize)> = freq
        .into_iter()
        .filter(|(_, count)| *count >= min_freq.max(1))
        .collect();
    // Frequency descending, alphabetical tie-break so the id
    // assignment is deterministic across runs.
    words.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    let mut vocab = serde_json::Map::new();
    vocab.insert(PAD_TOKEN.into(), serde_json::json!(0));
    vocab.insert(BOS_TOKEN.into(), serde_json::json!(1));
    vocab.insert(EOS_TOKEN.into(), serde_json::json!(2));
    vocab.insert(UNK_TOKEN.into(), serde_json::json!(3));
    let mut next_id = 4usize;
    for (word, _) in &words {
        if !vocab.contains_key(word) {
            vocab.insert(word.clone(), serde_json::json!(next_id));
            next_id += 1;
        }
    }

    let tokenizer_json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [
            {"id": 0, "content": PAD_TOKEN, "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 1, "content": BOS_TOKEN, "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 2, "content": EOS_TOKEN, "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true},
            {"id": 3, "content": UNK_TOKEN, "single_word": false, "lstrip": false, "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": {
            "type": "Lowercase"
        },
        "pre_tokenizer": {
            "type": "Whitespace"
        },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": serde_json::Value::Object(vocab),
            "unk_token": UNK_TOKEN
        }
    });

    Tokenizer::from_bytes(serde_json::to_vec(&tokenizer_json)?)
        .map_err(|e| anyhow::anyhow!("Cannot build tokenizer: {e}"))
}

// ─── Unit Tests ───────────────────────────────────────────────────────────────
#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::vocab::{EOS_IDX, PAD_IDX, UNK_IDX};

    #[test]
    fn test_reserved_ids_are_fixed() {
        let captions = vec!["a man rides a horse".to_string()];
        let tokenizer = build_word_level_tokenizer(&captions, 1).unwrap();
        assert_eq!(tokenizer.token_to_id(PAD_TOKEN), Some(PAD_IDX as u32));
        assert_eq!(tokenizer.token_to_id(BOS_TOKEN), Some(1));
        assert_eq!(tokenizer.token_to_id(EOS_TOKEN), Some(EOS_IDX as u32));
        assert_eq!(tokenizer.token_to_id(UNK_TOKEN), Some(UNK_IDX as u32));
    }

    #[test]
    fn test_min_freq_filters_rare_words() {
        let captions = vec![
            "common common common rare".to_string(),
            "common words only".to_string(),
        ];
        let tokenizer = build_word_level_tokenizer(&captions, 2).unwrap();
        assert!(tokenizer.token_to_id("common").is_some());
        assert!(tokenizer.token_to_id("rare").is_none());
        // rare words encode to <unk>, not an error
        let enc = tokenizer.encode("rare", false).unwrap();
        assert_eq!(enc.get_ids(), &[UNK_IDX as u32]);
    }

    #[test]
    fn test_id_assignment_is_deterministic() {
        let captions = vec!["b a c a b a".to_string()];
        let t1 = build_word_level_tokenizer(&captions, 1).unwrap();
        let t2 = build_word_level_tokenizer(&captions, 1).unwrap();
        for word in ["a", "b", "c"] {
            assert_eq!(t1.token_to_id(word), t2.token_to_id(word));
        }
        // "a" (3 uses) gets the first free id
        assert_eq!(t1.token_to_id("a"), Some(4));
    }
}
