use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::config::RunnerConfig;
use crate::device::Device;
use crate::error::LoadError;
use crate::family::ModelFamily;

/// The subset of a hub `config.json` the harness cares about.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub vocab_size: usize,
    #[serde(default, deserialize_with = "first_token_id")]
    pub eos_token_id: Option<u32>,
    #[serde(default, deserialize_with = "first_token_id")]
    pub pad_token_id: Option<u32>,
    #[serde(default)]
    pub decoder_start_token_id: Option<u32>,
}

impl ModelConfig {
    pub fn from_file(path: &Path) -> Result<Self, LoadError> {
        let raw = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| LoadError::Config {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Some configs list several EOS ids; the first one is the canonical one.
fn first_token_id<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(u32),
        Many(Vec<u32>),
    }
    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        Some(OneOrMany::One(id)) => Some(id),
        Some(OneOrMany::Many(ids)) => ids.first().copied(),
        None => None,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub seed: u64,
}

impl GenerationOptions {
    pub fn greedy(max_new_tokens: usize, seed: u64) -> Self {
        Self {
            max_new_tokens,
            temperature: 0.0,
            top_p: 1.0,
            seed,
        }
    }

    pub fn is_greedy(&self) -> bool {
        self.temperature <= 0.0
    }

    /// Samplers take a 32-bit seed; both halves of the run seed feed into it.
    pub fn sampler_seed(&self) -> u32 {
        (self.seed ^ (self.seed >> 32)) as u32
    }
}

#[derive(Debug, Clone, Default)]
pub struct Generation {
    pub tokens: Vec<u32>,
    pub prompt_tokens: usize,
    pub duration: Duration,
}

/// A loaded model as the tasks see it.
///
/// Implementations reset any per-call state (KV cache, sampler) at the start of every
/// call, so whatever one task does is invisible to the next.
pub trait LanguageModel {
    fn family(&self) -> ModelFamily;
    fn device(&self) -> Device;
    fn config(&self) -> &ModelConfig;

    fn set_pad_token_id(&mut self, pad_token_id: Option<u32>);
    fn resize_token_embeddings(&mut self, new_num_tokens: usize) -> Result<()>;

    /// Continues `input_ids` (or, for seq2seq, decodes from the encoded input) and
    /// returns the new tokens only.
    fn generate(&mut self, input_ids: &[u32], options: &GenerationOptions) -> Result<Generation>;

    /// Sum of log-probabilities of `continuation` given `context`.
    fn log_likelihood(&mut self, context: &[u32], continuation: &[u32]) -> Result<f64>;
}

/// Everything a backend needs to put weights on a device.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub name: String,
    pub weights: PathBuf,
    pub family: ModelFamily,
    pub device: Device,
    pub config: Option<ModelConfig>,
    pub pad_token_id: Option<u32>,
    pub runner: RunnerConfig,
}

/// Natural-log probability of `token` under the softmax of `logits`.
pub fn log_softmax_at(logits: &[f32], token: usize) -> Option<f64> {
    let target = f64::from(*logits.get(token)?);
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let sum: f64 = logits.iter().map(|&l| (f64::from(l) - max).exp()).sum();
    Some(target - max - sum.ln())
}

pub trait ModelBackend {
    fn name(&self) -> &'static str;
    fn load(&self, request: &LoadRequest) -> Result<Box<dyn LanguageModel>, LoadError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hub_configs() -> anyhow::Result<()> {
        let config: ModelConfig = serde_json::from_str(
            r#"{"vocab_size": 250880, "eos_token_id": 2, "pad_token_id": 3, "model_type": "bloom"}"#,
        )?;
        assert_eq!(config.vocab_size, 250880);
        assert_eq!(config.eos_token_id, Some(2));
        assert_eq!(config.pad_token_id, Some(3));
        Ok(())
    }

    #[test]
    fn log_softmax_matches_closed_form() {
        let logits = [0.0_f32, 0.0, (2.0_f32).ln()];
        let lp = log_softmax_at(&logits, 2).unwrap();
        assert!((lp - 0.5_f64.ln()).abs() < 1e-6);
        assert!(log_softmax_at(&logits, 3).is_none());
    }

    #[test]
    fn sampler_seed_keeps_the_high_bits() {
        assert_eq!(GenerationOptions::greedy(1, 42).sampler_seed(), 42);
        let low = GenerationOptions::greedy(1, 7).sampler_seed();
        let high = GenerationOptions::greedy(1, (1 << 32) | 7).sampler_seed();
        assert_ne!(low, high);
        assert_eq!(high, 6);
    }

    #[test]
    fn takes_first_of_several_eos_ids() -> anyhow::Result<()> {
        let config: ModelConfig =
            serde_json::from_str(r#"{"eos_token_id": [128001, 128009], "pad_token_id": null}"#)?;
        assert_eq!(config.eos_token_id, Some(128001));
        assert_eq!(config.pad_token_id, None);
        assert_eq!(config.vocab_size, 0);
        Ok(())
    }
}
