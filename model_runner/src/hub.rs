use std::path::{Path, PathBuf};

use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use tracing::{debug, info, warn};

use crate::error::LoadError;

const WEIGHTS_EXTENSION: &str = "gguf";
const PREFERRED_QUANT: &str = "q8_0";

/// Where the files of a model live: a local checkout or a repository on the hub.
pub enum ModelRepo {
    Local {
        name: String,
        root: PathBuf,
        weights: Option<PathBuf>,
    },
    Hub {
        name: String,
        repo: ApiRepo,
    },
}

impl ModelRepo {
    /// An existing file is taken as the weights with its directory as the repo, an
    /// existing directory is the repo, anything else is a hub id.
    pub fn resolve(name_or_path: &str, cache_dir: Option<&Path>) -> Result<Self, LoadError> {
        let path = Path::new(name_or_path);
        if path.is_file() {
            let root = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."))
                .to_path_buf();
            debug!("Using local weights file {}", path.display());
            return Ok(ModelRepo::Local {
                name: name_or_path.to_string(),
                root,
                weights: Some(path.to_path_buf()),
            });
        }
        if path.is_dir() {
            debug!("Using local model directory {}", path.display());
            return Ok(ModelRepo::Local {
                name: name_or_path.to_string(),
                root: path.to_path_buf(),
                weights: None,
            });
        }

        info!("Resolving {} on the model hub", name_or_path);
        let mut builder = ApiBuilder::new();
        if let Some(dir) = cache_dir {
            builder = builder.with_cache_dir(dir.to_path_buf());
        }
        let api = builder.build().map_err(|source| LoadError::Hub {
            repo: name_or_path.to_string(),
            source,
        })?;
        Ok(ModelRepo::Hub {
            name: name_or_path.to_string(),
            repo: api.model(name_or_path.to_string()),
        })
    }

    pub fn name(&self) -> &str {
        match self {
            ModelRepo::Local { name, .. } | ModelRepo::Hub { name, .. } => name,
        }
    }

    /// File names at the top of the repository.
    pub fn files(&self) -> Result<Vec<String>, LoadError> {
        match self {
            ModelRepo::Local { root, .. } => {
                let entries = std::fs::read_dir(root).map_err(|source| LoadError::Io {
                    path: root.clone(),
                    source,
                })?;
                let mut files = Vec::new();
                for entry in entries {
                    let entry = entry.map_err(|source| LoadError::Io {
                        path: root.clone(),
                        source,
                    })?;
                    if entry.path().is_file() {
                        files.push(entry.file_name().to_string_lossy().into_owned());
                    }
                }
                files.sort();
                Ok(files)
            }
            ModelRepo::Hub { name, repo } => {
                let info = repo.info().map_err(|source| LoadError::Hub {
                    repo: name.clone(),
                    source,
                })?;
                let mut files: Vec<String> =
                    info.siblings.into_iter().map(|s| s.rfilename).collect();
                files.sort();
                Ok(files)
            }
        }
    }

    /// Local path of `file`, downloading it first when the repo is remote.
    pub fn get(&self, file: &str) -> Result<PathBuf, LoadError> {
        match self {
            ModelRepo::Local { name, root, .. } => {
                let path = root.join(file);
                if path.is_file() {
                    Ok(path)
                } else {
                    Err(LoadError::FileNotFound {
                        repo: name.clone(),
                        file: file.to_string(),
                    })
                }
            }
            ModelRepo::Hub { name, repo } => repo.get(file).map_err(|source| LoadError::Hub {
                repo: name.clone(),
                source,
            }),
        }
    }

    pub fn get_optional(&self, file: &str) -> Result<Option<PathBuf>, LoadError> {
        match self {
            ModelRepo::Local { root, .. } => {
                let path = root.join(file);
                Ok(path.is_file().then_some(path))
            }
            ModelRepo::Hub { .. } => {
                if self.files()?.iter().any(|f| f == file) {
                    self.get(file).map(Some)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Picks the weights file: an explicit file wins, then the only `.gguf` in the repo,
    /// then the `Q8_0` quantization, then the first by name.
    pub fn weights(&self, preferred: Option<&str>) -> Result<PathBuf, LoadError> {
        if let ModelRepo::Local {
            weights: Some(path),
            ..
        } = self
        {
            return Ok(path.clone());
        }
        if let Some(file) = preferred {
            return self.get(file);
        }

        let candidates: Vec<String> = self
            .files()?
            .into_iter()
            .filter(|f| {
                Path::new(f)
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(WEIGHTS_EXTENSION))
            })
            .collect();
        let chosen = match candidates.as_slice() {
            [] => {
                return Err(LoadError::NoWeights {
                    repo: self.name().to_string(),
                })
            }
            [only] => only.clone(),
            many => {
                let pick = many
                    .iter()
                    .find(|f| f.to_ascii_lowercase().contains(PREFERRED_QUANT))
                    .unwrap_or(&many[0])
                    .clone();
                warn!(
                    "{} has {} weights files, using {} (override with --model_file)",
                    self.name(),
                    many.len(),
                    pick
                );
                pick
            }
        };
        self.get(&chosen)
    }
}
