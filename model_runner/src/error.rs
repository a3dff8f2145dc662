use std::path::PathBuf;

use thiserror::Error;

/// Everything that can go wrong while resolving and loading a model or tokenizer.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Hub error for {repo}: {source}")]
    Hub {
        repo: String,
        #[source]
        source: hf_hub::api::sync::ApiError,
    },

    #[error("Could not find {file} for {repo}")]
    FileNotFound { repo: String, file: String },

    #[error("No weights file found for {repo}; pass --model_file to pick one")]
    NoWeights { repo: String },

    #[error("Failed to load tokenizer from {path}: {message}")]
    Tokenizer { path: PathBuf, message: String },

    #[error("Tokenizer at {0} has no end-of-sequence token")]
    MissingEosToken(PathBuf),

    #[error("Invalid model config {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Backend '{0}' is not available in this build")]
    BackendUnavailable(&'static str),

    #[error("Backend failed to load {path}: {message}")]
    Backend { path: PathBuf, message: String },
}

impl LoadError {
    pub(crate) fn backend(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        LoadError::Backend {
            path: path.into(),
            message: err.to_string(),
        }
    }
}
