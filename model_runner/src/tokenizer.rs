use std::path::{Path, PathBuf};

use anyhow::Result;
use serde_json::Value;
use tokenizers::{PaddingDirection, PaddingParams, PaddingStrategy, Tokenizer};
use tracing::debug;

use crate::error::LoadError;
use crate::hub::ModelRepo;

/// Spellings tried, in order, when the repo doesn't say which token ends a sequence.
const EOS_CANDIDATES: &[&str] = &[
    "</s>",
    "<|endoftext|>",
    "<|end_of_text|>",
    "<|eot_id|>",
    "<eos>",
    "<|im_end|>",
];

/// A `tokenizers::Tokenizer` plus the end-of-sequence token it was shipped with.
pub struct EvalTokenizer {
    inner: Tokenizer,
    source: PathBuf,
    eos_token: String,
    eos_token_id: u32,
}

impl EvalTokenizer {
    pub fn from_repo(repo: &ModelRepo) -> Result<Self, LoadError> {
        let tokenizer_json = repo.get("tokenizer.json")?;
        let mut hint = None;
        for file in ["tokenizer_config.json", "special_tokens_map.json"] {
            if let Some(path) = repo.get_optional(file)? {
                hint = read_eos_hint(&path)?;
                if hint.is_some() {
                    break;
                }
            }
        }
        Self::from_file(&tokenizer_json, hint.as_deref())
    }

    pub fn from_file(path: &Path, eos_hint: Option<&str>) -> Result<Self, LoadError> {
        let inner = Tokenizer::from_file(path).map_err(|e| LoadError::Tokenizer {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let (eos_token, eos_token_id) = eos_hint
            .into_iter()
            .chain(EOS_CANDIDATES.iter().copied())
            .find_map(|token| inner.token_to_id(token).map(|id| (token.to_string(), id)))
            .ok_or_else(|| LoadError::MissingEosToken(path.to_path_buf()))?;
        debug!("EOS token for {} is {:?} ({})", path.display(), eos_token, eos_token_id);

        Ok(Self {
            inner,
            source: path.to_path_buf(),
            eos_token,
            eos_token_id,
        })
    }

    /// Pads with the EOS token on the left, the layout decoder-only generation expects.
    pub fn use_eos_as_padding(&mut self) {
        self.inner.with_padding(Some(PaddingParams {
            strategy: PaddingStrategy::BatchLongest,
            direction: PaddingDirection::Left,
            pad_id: self.eos_token_id,
            pad_token: self.eos_token.clone(),
            ..Default::default()
        }));
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn eos_token(&self) -> &str {
        &self.eos_token
    }

    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }

    pub fn pad_token(&self) -> Option<&str> {
        self.inner.get_padding().map(|p| p.pad_token.as_str())
    }

    pub fn pad_token_id(&self) -> Option<u32> {
        self.inner.get_padding().map(|p| p.pad_id)
    }

    pub fn padding_side(&self) -> Option<PaddingDirection> {
        self.inner.get_padding().map(|p| p.direction)
    }

    /// Vocabulary size including added tokens.
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    pub fn encode(&self, text: &str, add_special_tokens: bool) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, add_special_tokens)
            .map_err(anyhow::Error::msg)?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Encodes several texts to equal length using the configured padding.
    pub fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<u32>>> {
        let encodings = self
            .inner
            .encode_batch(texts.to_vec(), false)
            .map_err(anyhow::Error::msg)?;
        Ok(encodings.iter().map(|e| e.get_ids().to_vec()).collect())
    }

    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner.decode(ids, true).map_err(anyhow::Error::msg)
    }
}

/// Reads `eos_token` from a tokenizer_config.json or special_tokens_map.json, which store it
/// either as a plain string or as an added-token object with a `content` field.
fn read_eos_hint(path: &Path) -> Result<Option<String>, LoadError> {
    let raw = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let value: Value = serde_json::from_str(&raw).map_err(|source| LoadError::Config {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(match value.get("eos_token") {
        Some(Value::String(token)) => Some(token.clone()),
        Some(Value::Object(obj)) => obj
            .get("content")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    })
}
