use std::cell::RefCell;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};

use crate::device::Device;
use crate::error::LoadError;
use crate::family::ModelFamily;
use crate::model::{
    Generation, GenerationOptions, LanguageModel, LoadRequest, ModelBackend, ModelConfig,
};

type Scorer = Box<dyn FnMut(&[u32], &[u32]) -> f64>;

/// A call the mock model received, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Generate { input_ids: Vec<u32>, options: GenerationOptions },
    LogLikelihood { context: Vec<u32>, continuation: Vec<u32> },
}

/// Deterministic stand-in for a real backend: scripted generations and a pluggable scorer.
pub struct MockModel {
    family: ModelFamily,
    device: Device,
    config: ModelConfig,
    responses: VecDeque<Vec<u32>>,
    scorer: Scorer,
    calls: Vec<MockCall>,
}

impl MockModel {
    pub fn new(family: ModelFamily, config: ModelConfig) -> Self {
        Self {
            family,
            device: Device::Cpu,
            config,
            responses: VecDeque::new(),
            scorer: Box::new(|_, continuation| -(continuation.len() as f64)),
            calls: Vec::new(),
        }
    }

    pub fn on_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    /// Queues token sequences returned by successive `generate` calls.
    pub fn with_responses<I>(mut self, responses: I) -> Self
    where
        I: IntoIterator<Item = Vec<u32>>,
    {
        self.responses.extend(responses);
        self
    }

    pub fn with_scorer<F>(mut self, scorer: F) -> Self
    where
        F: FnMut(&[u32], &[u32]) -> f64 + 'static,
    {
        self.scorer = Box::new(scorer);
        self
    }

    pub fn calls(&self) -> &[MockCall] {
        &self.calls
    }
}

impl LanguageModel for MockModel {
    fn family(&self) -> ModelFamily {
        self.family
    }

    fn device(&self) -> Device {
        self.device
    }

    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn set_pad_token_id(&mut self, pad_token_id: Option<u32>) {
        self.config.pad_token_id = pad_token_id;
    }

    fn resize_token_embeddings(&mut self, new_num_tokens: usize) -> Result<()> {
        self.config.vocab_size = new_num_tokens;
        Ok(())
    }

    fn generate(&mut self, input_ids: &[u32], options: &GenerationOptions) -> Result<Generation> {
        if input_ids.is_empty() {
            bail!("Empty prompt");
        }
        self.calls.push(MockCall::Generate {
            input_ids: input_ids.to_vec(),
            options: options.clone(),
        });
        let mut tokens = match self.responses.pop_front() {
            Some(tokens) => tokens,
            None => input_ids[input_ids.len().saturating_sub(3)..].to_vec(),
        };
        tokens.truncate(options.max_new_tokens);
        Ok(Generation {
            tokens,
            prompt_tokens: input_ids.len(),
            duration: Duration::from_millis(1),
        })
    }

    fn log_likelihood(&mut self, context: &[u32], continuation: &[u32]) -> Result<f64> {
        self.calls.push(MockCall::LogLikelihood {
            context: context.to_vec(),
            continuation: continuation.to_vec(),
        });
        Ok((self.scorer)(context, continuation))
    }
}

/// Backend that hands out `MockModel`s and remembers what it was asked to load.
#[derive(Default)]
pub struct MockBackend {
    requests: RefCell<Vec<LoadRequest>>,
}

impl MockBackend {
    pub fn requests(&self) -> Vec<LoadRequest> {
        self.requests.borrow().clone()
    }
}

impl ModelBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn load(&self, request: &LoadRequest) -> Result<Box<dyn LanguageModel>, LoadError> {
        if !request.weights.is_file() {
            return Err(LoadError::backend(&request.weights, "weights file does not exist"));
        }
        self.requests.borrow_mut().push(request.clone());

        let mut config = request.config.clone().unwrap_or_default();
        if request.pad_token_id.is_some() {
            config.pad_token_id = request.pad_token_id;
        }
        if config.eos_token_id.is_none() {
            config.eos_token_id = request.pad_token_id;
        }
        Ok(Box::new(
            MockModel::new(request.family, config).on_device(request.device),
        ))
    }
}

/// Writes a whitespace word-level `tokenizer.json` into `dir`: `[UNK]` is id 0, `words`
/// follow from id 1, and `</s>` is an added special token after the last word.
pub fn write_tokenizer_fixture(dir: &Path, words: &[&str]) -> Result<PathBuf> {
    let mut vocab = Map::new();
    vocab.insert("[UNK]".to_string(), json!(0));
    for (i, word) in words.iter().enumerate() {
        vocab.insert(word.to_string(), json!(i + 1));
    }
    let eos_id = words.len() + 1;

    let tokenizer = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [{
            "id": eos_id,
            "content": "</s>",
            "single_word": false,
            "lstrip": false,
            "rstrip": false,
            "normalized": false,
            "special": true
        }],
        "normalizer": null,
        "pre_tokenizer": { "type": "Whitespace" },
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": Value::Object(vocab),
            "unk_token": "[UNK]"
        }
    });

    let path = dir.join("tokenizer.json");
    std::fs::write(&path, serde_json::to_string_pretty(&tokenizer)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}
