use std::path::{Path, PathBuf};

use clap::{ArgAction, Args, Parser};
use model_runner::{Device, LoadOptions, RunnerConfig};

use crate::error::ConfigurationError;
use crate::tasks::TaskRegistry;

const DEFAULT_CACHE_DIR: &str = "datasets";

#[derive(Debug, Clone, Parser)]
#[command(
    name = "eval-harness",
    about = "Evaluate a pretrained language model on a list of tasks"
)]
pub struct Cli {
    #[command(flatten)]
    pub eval: EvaluationArgs,

    #[command(flatten)]
    pub run: RunArgs,
}

/// Arguments for any adjustable params of an evaluation run.
#[derive(Debug, Clone, Args)]
pub struct EvaluationArgs {
    /// The model checkpoint to evaluate: a hub id, a local directory or a .gguf file.
    #[arg(long = "model_name_or_path")]
    pub model_name_or_path: String,

    /// Tasks to run the evaluation on, e.g. tydiqa_secondary.
    #[arg(long = "eval_tasks", num_args = 1..)]
    pub eval_tasks: Vec<String>,

    /// Pretrained config name or path if not the same as model_name_or_path.
    #[arg(long = "config_name")]
    pub config_name: Option<String>,

    /// Pretrained tokenizer name or path if not the same as model_name_or_path.
    #[arg(long = "tokenizer_name")]
    pub tokenizer_name: Option<String>,

    /// Identifier for the evaluation run; defaults to a timestamp.
    #[arg(long)]
    pub tag: Option<String>,

    /// Whether to run evaluation in English only.
    #[arg(
        long = "english_only",
        default_value_t = true,
        num_args = 0..=1,
        default_missing_value = "true",
        action = ArgAction::Set
    )]
    pub english_only: bool,

    /// Path to the local dataset folder.
    #[arg(long = "data_dir")]
    pub data_dir: Option<PathBuf>,

    /// Weights file to use when the model repository has several.
    #[arg(long = "model_file")]
    pub model_file: Option<String>,

    /// Evaluate at most this many examples per task.
    #[arg(long)]
    pub limit: Option<usize>,

    /// Where downloaded datasets and hub files are kept.
    #[arg(long = "cache_dir", env = "EVAL_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,
}

/// Generic run parameters.
#[derive(Debug, Clone, Args)]
pub struct RunArgs {
    /// Root directory; each run writes into <output_dir>/<tag>.
    #[arg(long = "output_dir")]
    pub output_dir: PathBuf,

    /// cpu, cuda, cuda:<n> or metal.
    #[arg(long, default_value = "cpu")]
    pub device: String,

    /// Seed handed to every task.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    #[arg(long, default_value_t = 4)]
    pub threads: i32,

    #[arg(long = "context_size", default_value_t = RunnerConfig::DEFAULT_CONTEXT_SIZE)]
    pub context_size: u32,
}

impl EvaluationArgs {
    /// Checks everything that can be checked without touching the model.
    pub fn validate(&self, registry: &TaskRegistry) -> Result<(), ConfigurationError> {
        if self.eval_tasks.is_empty() {
            return Err(ConfigurationError::NoTasks);
        }

        for name in &self.eval_tasks {
            let entry = registry
                .get(name)
                .ok_or_else(|| ConfigurationError::UnknownTask {
                    name: name.clone(),
                    available: registry.names().join(", "),
                })?;
            if !entry.requires_data_dir {
                continue;
            }
            match self.data_dir.as_deref() {
                None => {
                    return Err(ConfigurationError::MissingDataDir {
                        task: name.clone(),
                        instructions: entry.data_instructions,
                    })
                }
                Some(path) if !path.exists() => {
                    return Err(ConfigurationError::DataDirNotFound {
                        task: name.clone(),
                        path: path.to_path_buf(),
                        instructions: entry.data_instructions,
                    })
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    pub fn cache_dir(&self) -> &Path {
        self.cache_dir
            .as_deref()
            .unwrap_or_else(|| Path::new(DEFAULT_CACHE_DIR))
    }
}

impl RunArgs {
    pub fn device(&self) -> Result<Device, ConfigurationError> {
        self.device
            .parse()
            .map_err(ConfigurationError::InvalidDevice)
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig::new(self.threads, self.context_size)
    }
}

impl Cli {
    pub fn load_options(&self, device: Device) -> LoadOptions {
        LoadOptions {
            model_name_or_path: self.eval.model_name_or_path.clone(),
            tokenizer_name: self.eval.tokenizer_name.clone(),
            config_name: self.eval.config_name.clone(),
            model_file: self.eval.model_file.clone(),
            cache_dir: self.eval.cache_dir.clone(),
            device,
            runner: self.run.runner_config(),
        }
    }
}

/// Where a task's data comes from.
#[derive(Debug, Clone)]
pub struct DataConfig {
    pub file_name: &'static str,
    pub url: Option<&'static str>,
    pub limit: Option<usize>,
}

/// How a task prompts the model.
#[derive(Debug, Clone)]
pub struct GenerationConfig {
    /// Longer prompts lose their oldest tokens.
    pub max_prompt_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct TaskConfig {
    pub data: DataConfig,
    pub generation: GenerationConfig,
}

impl TaskConfig {
    pub fn toxicity() -> Self {
        Self {
            data: DataConfig {
                file_name: "test.csv",
                url: None,
                limit: Some(1000),
            },
            generation: GenerationConfig {
                max_prompt_tokens: 1024,
            },
        }
    }

    pub fn tydiqa() -> Self {
        Self {
            data: DataConfig {
                file_name: "tydiqa-goldp-v1.1-dev.json",
                url: Some("https://storage.googleapis.com/tydiqa/v1.1/tydiqa-goldp-v1.1-dev.json"),
                limit: None,
            },
            generation: GenerationConfig {
                max_prompt_tokens: 1536,
            },
        }
    }

    pub fn classification() -> Self {
        Self {
            data: DataConfig {
                file_name: "mmlu_all_test.parquet",
                url: Some("https://huggingface.co/datasets/cais/mmlu/resolve/main/all/test-00000-of-00001.parquet"),
                limit: Some(1000),
            },
            generation: GenerationConfig {
                max_prompt_tokens: 1536,
            },
        }
    }

    /// A `--limit` from the command line replaces the preset.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        if limit.is_some() {
            self.data.limit = limit;
        }
        self
    }
}
