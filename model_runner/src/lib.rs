pub mod config;
pub mod device;
pub mod error;
pub mod family;
pub mod hub;
pub mod loader;
pub mod mock_runner;
pub mod model;
pub mod runner;
pub mod tokenizer;

pub use config::RunnerConfig;
pub use device::Device;
pub use error::LoadError;
pub use family::{ModelFamily, SEQ2SEQ_MODELS};
pub use hub::ModelRepo;
pub use loader::{load_model_and_tokenizer, LoadOptions, LoadedModel};
pub use mock_runner::{write_tokenizer_fixture, MockBackend, MockCall, MockModel};
pub use model::{
    log_softmax_at, Generation, GenerationOptions, LanguageModel, LoadRequest, ModelBackend,
    ModelConfig,
};
pub use runner::LlamaCppBackend;
pub use tokenizer::EvalTokenizer;
