use std::path::PathBuf;

use model_runner::LoadError;
use thiserror::Error;

/// Bad command-line input. Always detected before the model is loaded.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Must provide at least one eval task!")]
    NoTasks,

    #[error("Unknown task '{name}'; available tasks: {available}")]
    UnknownTask { name: String, available: String },

    #[error("Must provide data path for {task}. {instructions}")]
    MissingDataDir {
        task: String,
        instructions: &'static str,
    },

    #[error("Data path {path} for {task} does not exist. {instructions}")]
    DataDirNotFound {
        task: String,
        path: PathBuf,
        instructions: &'static str,
    },

    #[error("Invalid device: {0}")]
    InvalidDevice(String),
}

/// A failure inside one task. The dispatcher stops at the first one.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Unknown task '{0}'")]
    Unknown(String),

    #[error("Failed to set up task {task}")]
    Setup {
        task: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Evaluation of task {task} failed")]
    Evaluate {
        task: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Saving metrics of task {task} failed")]
    SaveMetrics {
        task: String,
        #[source]
        source: anyhow::Error,
    },
}

impl TaskError {
    pub fn task(&self) -> &str {
        match self {
            TaskError::Unknown(task)
            | TaskError::Setup { task, .. }
            | TaskError::Evaluate { task, .. }
            | TaskError::SaveMetrics { task, .. } => task,
        }
    }
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("Failed to create output directory {path}")]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Task(#[from] TaskError),
}
