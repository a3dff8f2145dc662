use std::path::{Path, PathBuf};

use tracing::{info, instrument};

use crate::config::RunnerConfig;
use crate::device::Device;
use crate::error::LoadError;
use crate::family::ModelFamily;
use crate::hub::ModelRepo;
use crate::model::{LanguageModel, LoadRequest, ModelBackend, ModelConfig};
use crate::tokenizer::EvalTokenizer;

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub model_name_or_path: String,
    pub tokenizer_name: Option<String>,
    pub config_name: Option<String>,
    pub model_file: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub device: Device,
    pub runner: RunnerConfig,
}

/// The model and tokenizer shared by every task of a run.
pub struct LoadedModel {
    pub model: Box<dyn LanguageModel>,
    pub tokenizer: EvalTokenizer,
    pub family: ModelFamily,
    pub device: Device,
}

#[instrument(skip_all, fields(model = %options.model_name_or_path, backend = backend.name()))]
pub fn load_model_and_tokenizer(
    backend: &dyn ModelBackend,
    options: &LoadOptions,
) -> Result<LoadedModel, LoadError> {
    let cache_dir = options.cache_dir.as_deref();
    let model_repo = ModelRepo::resolve(&options.model_name_or_path, cache_dir)?;

    let mut tokenizer = match options.tokenizer_name.as_deref() {
        Some(name) => EvalTokenizer::from_repo(&ModelRepo::resolve(name, cache_dir)?)?,
        None => EvalTokenizer::from_repo(&model_repo)?,
    };
    tokenizer.use_eos_as_padding();
    info!(
        "Tokenizer from {} pads with {:?} on the left",
        tokenizer.source().display(),
        tokenizer.eos_token()
    );

    let request = LoadRequest {
        name: options.model_name_or_path.clone(),
        weights: model_repo.weights(options.model_file.as_deref())?,
        family: ModelFamily::for_model(&options.model_name_or_path),
        device: options.device,
        config: load_config(&model_repo, options.config_name.as_deref(), cache_dir)?,
        pad_token_id: Some(tokenizer.eos_token_id()),
        runner: options.runner.clone(),
    };
    let mut model = backend.load(&request)?;

    let eos_token_id = model.config().eos_token_id;
    model.set_pad_token_id(eos_token_id);
    model
        .resize_token_embeddings(tokenizer.vocab_size())
        .map_err(|e| LoadError::backend(&request.weights, e))?;

    let family = model.family();
    let device = model.device();
    info!(
        "Loaded {} model {} ({} tokens) on {}",
        family,
        options.model_name_or_path,
        model.config().vocab_size,
        device
    );
    Ok(LoadedModel {
        model,
        tokenizer,
        family,
        device,
    })
}

/// `config_name` (a config.json path or a repo) wins over the model repo's own config.
fn load_config(
    model_repo: &ModelRepo,
    config_name: Option<&str>,
    cache_dir: Option<&Path>,
) -> Result<Option<ModelConfig>, LoadError> {
    let path = match config_name {
        Some(name) if Path::new(name).is_file() => Some(PathBuf::from(name)),
        Some(name) => Some(ModelRepo::resolve(name, cache_dir)?.get("config.json")?),
        None => model_repo.get_optional("config.json")?,
    };
    path.map(|p| ModelConfig::from_file(&p)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_runner::{write_tokenizer_fixture, MockBackend};
    use std::fs;
    use tokenizers::PaddingDirection;

    fn model_dir(words: &[&str]) -> anyhow::Result<tempfile::TempDir> {
        let dir = tempfile::tempdir()?;
        write_tokenizer_fixture(dir.path(), words)?;
        fs::write(dir.path().join("model.gguf"), b"GGUF")?;
        fs::write(
            dir.path().join("config.json"),
            r#"{"vocab_size": 3, "eos_token_id": 1, "pad_token_id": 0}"#,
        )?;
        Ok(dir)
    }

    fn options(path: &Path) -> LoadOptions {
        LoadOptions {
            model_name_or_path: path.to_string_lossy().into_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn normalizes_padding_and_config() -> anyhow::Result<()> {
        let dir = model_dir(&["yes", "no", "maybe"])?;
        let backend = MockBackend::default();
        let loaded = load_model_and_tokenizer(&backend, &options(dir.path()))?;

        let tokenizer = &loaded.tokenizer;
        assert_eq!(tokenizer.pad_token(), Some(tokenizer.eos_token()));
        assert!(matches!(tokenizer.padding_side(), Some(PaddingDirection::Left)));

        let config = loaded.model.config();
        assert_eq!(config.pad_token_id, config.eos_token_id);
        assert_eq!(config.pad_token_id, Some(1));
        assert_eq!(config.vocab_size, tokenizer.vocab_size());
        assert_eq!(loaded.family, ModelFamily::Causal);

        let requests = backend.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].weights, dir.path().join("model.gguf"));
        assert_eq!(requests[0].pad_token_id, Some(tokenizer.eos_token_id()));
        Ok(())
    }

    #[test]
    fn tokenizer_override_is_used() -> anyhow::Result<()> {
        let model = model_dir(&["a"])?;
        let tokenizer_dir = tempfile::tempdir()?;
        write_tokenizer_fixture(tokenizer_dir.path(), &["a", "b", "c", "d", "e"])?;

        let mut opts = options(model.path());
        opts.tokenizer_name = Some(tokenizer_dir.path().to_string_lossy().into_owned());
        let loaded = load_model_and_tokenizer(&MockBackend::default(), &opts)?;

        assert_eq!(loaded.tokenizer.source(), tokenizer_dir.path().join("tokenizer.json"));
        assert_eq!(loaded.model.config().vocab_size, 7);
        Ok(())
    }

    #[test]
    fn config_name_overrides_repo_config() -> anyhow::Result<()> {
        let dir = model_dir(&["a"])?;
        let other = tempfile::tempdir()?;
        let config_path = other.path().join("config.json");
        fs::write(&config_path, r#"{"eos_token_id": 2}"#)?;

        let mut opts = options(dir.path());
        opts.config_name = Some(config_path.to_string_lossy().into_owned());
        let loaded = load_model_and_tokenizer(&MockBackend::default(), &opts)?;
        assert_eq!(loaded.model.config().pad_token_id, Some(2));
        Ok(())
    }

    #[test]
    fn device_is_passed_through() -> anyhow::Result<()> {
        let dir = model_dir(&["a"])?;
        let mut opts = options(dir.path());
        opts.device = Device::Cuda(1);
        let loaded = load_model_and_tokenizer(&MockBackend::default(), &opts)?;
        assert_eq!(loaded.device, Device::Cuda(1));
        assert_eq!(loaded.model.device(), Device::Cuda(1));
        Ok(())
    }

    /// Loads every checkpoint as a seq2seq model, whatever its name says.
    struct Seq2SeqBackend(MockBackend);

    impl ModelBackend for Seq2SeqBackend {
        fn name(&self) -> &'static str {
            "seq2seq"
        }

        fn load(&self, request: &LoadRequest) -> Result<Box<dyn LanguageModel>, LoadError> {
            let request = LoadRequest {
                family: ModelFamily::Seq2Seq,
                ..request.clone()
            };
            self.0.load(&request)
        }
    }

    #[test]
    fn family_comes_from_the_loaded_model() -> anyhow::Result<()> {
        let dir = model_dir(&["a"])?;
        let backend = Seq2SeqBackend(MockBackend::default());
        let loaded = load_model_and_tokenizer(&backend, &options(dir.path()))?;
        assert_eq!(backend.0.requests()[0].family, ModelFamily::Causal);
        assert_eq!(loaded.family, ModelFamily::Seq2Seq);
        Ok(())
    }

    #[test]
    fn missing_tokenizer_is_a_load_error() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("model.gguf"), b"GGUF")?;
        let result = load_model_and_tokenizer(&MockBackend::default(), &options(dir.path()));
        assert!(matches!(result, Err(LoadError::FileNotFound { .. })));
        Ok(())
    }

    #[cfg(not(feature = "llama-cpp"))]
    #[test]
    fn llama_backend_reports_when_compiled_out() -> anyhow::Result<()> {
        let dir = model_dir(&["a"])?;
        let result =
            load_model_and_tokenizer(&crate::runner::LlamaCppBackend, &options(dir.path()));
        assert!(matches!(result, Err(LoadError::BackendUnavailable("llama-cpp"))));
        Ok(())
    }
}
