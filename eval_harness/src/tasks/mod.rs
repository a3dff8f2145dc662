pub mod classification;
pub mod toxicity;
pub mod tydiqa;

use std::path::{Path, PathBuf};

use anyhow::Result;
use model_runner::{Device, EvalTokenizer, LanguageModel};

use crate::config::DataConfig;
use crate::dataset::ensure_downloaded;
use crate::error::TaskError;
use crate::metrics::TaskMetrics;

pub trait Task {
    fn name(&self) -> &str;

    /// Runs the task over its dataset; `seed` drives subset selection and sampling.
    fn evaluate(&mut self, seed: u64) -> Result<()>;

    /// `None` until `evaluate` has succeeded.
    fn metrics(&self) -> Option<&TaskMetrics>;

    /// Writes the task's metrics and predictions into `output_dir`, returning the files.
    fn save_metrics(&self, output_dir: &Path) -> Result<Vec<PathBuf>>;
}

/// What every task is built from: borrows of the shared model and tokenizer plus the run's
/// data options.
pub struct TaskContext<'a> {
    pub model: &'a mut dyn LanguageModel,
    pub tokenizer: &'a EvalTokenizer,
    pub device: Device,
    pub english_only: bool,
    pub data_dir: Option<&'a Path>,
    pub cache_dir: &'a Path,
    pub limit: Option<usize>,
}

pub type TaskConstructor = for<'a> fn(TaskContext<'a>) -> Result<Box<dyn Task + 'a>>;

#[derive(Clone, Copy)]
pub struct TaskEntry {
    pub name: &'static str,
    pub requires_data_dir: bool,
    /// Shown when a required data directory is missing.
    pub data_instructions: &'static str,
    pub constructor: TaskConstructor,
}

impl std::fmt::Debug for TaskEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskEntry")
            .field("name", &self.name)
            .field("requires_data_dir", &self.requires_data_dir)
            .finish()
    }
}

/// Task names mapped to their constructors, in registration order.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    entries: Vec<TaskEntry>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        Self::new()
            .register(TaskEntry {
                name: toxicity::NAME,
                requires_data_dir: true,
                data_instructions: toxicity::DATA_INSTRUCTIONS,
                constructor: toxicity::build,
            })
            .register(TaskEntry {
                name: tydiqa::NAME,
                requires_data_dir: false,
                data_instructions: "",
                constructor: tydiqa::build,
            })
            .register(TaskEntry {
                name: classification::NAME,
                requires_data_dir: false,
                data_instructions: "",
                constructor: classification::build,
            })
    }

    /// Adds `entry`, replacing any entry of the same name.
    pub fn register(mut self, entry: TaskEntry) -> Self {
        match self.entries.iter_mut().find(|e| e.name == entry.name) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&TaskEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.name).collect()
    }

    pub fn from_task_name<'a>(
        &self,
        name: &str,
        ctx: TaskContext<'a>,
    ) -> Result<Box<dyn Task + 'a>, TaskError> {
        let entry = self
            .get(name)
            .ok_or_else(|| TaskError::Unknown(name.to_string()))?;
        (entry.constructor)(ctx).map_err(|source| TaskError::Setup {
            task: name.to_string(),
            source,
        })
    }
}

/// Keeps the last `max` tokens, where the question and answer cue live.
pub(crate) fn fit_context(ids: &mut Vec<u32>, max: usize) {
    if ids.len() > max {
        ids.drain(..ids.len() - max);
    }
}

/// Local path of a task's dataset under `cache_dir`, downloading it first if needed.
pub(crate) fn resolve_data_file(cache_dir: &Path, data: &DataConfig) -> Result<PathBuf> {
    let path = cache_dir.join(data.file_name);
    match data.url {
        Some(url) => ensure_downloaded(&path, url)?,
        None if !path.exists() => anyhow::bail!("Dataset file {} not found", path.display()),
        None => {}
    }
    Ok(path)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;

    use anyhow::Result;
    use model_runner::{
        write_tokenizer_fixture, EvalTokenizer, ModelConfig, ModelFamily, MockModel,
    };

    pub fn tokenizer(dir: &Path, words: &[&str]) -> Result<EvalTokenizer> {
        let path = write_tokenizer_fixture(dir, words)?;
        let mut tokenizer = EvalTokenizer::from_file(&path, None)?;
        tokenizer.use_eos_as_padding();
        Ok(tokenizer)
    }

    pub fn causal_model() -> MockModel {
        MockModel::new(ModelFamily::Causal, ModelConfig::default())
    }
}
