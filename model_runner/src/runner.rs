use crate::error::LoadError;
use crate::model::{LanguageModel, LoadRequest, ModelBackend};

/// GGUF models through llama.cpp.
#[derive(Debug, Default)]
pub struct LlamaCppBackend;

impl ModelBackend for LlamaCppBackend {
    fn name(&self) -> &'static str {
        "llama-cpp"
    }

    #[cfg(feature = "llama-cpp")]
    fn load(&self, request: &LoadRequest) -> Result<Box<dyn LanguageModel>, LoadError> {
        Ok(Box::new(llama::LlamaRunner::load(request)?))
    }

    #[cfg(not(feature = "llama-cpp"))]
    fn load(&self, _request: &LoadRequest) -> Result<Box<dyn LanguageModel>, LoadError> {
        Err(LoadError::BackendUnavailable(self.name()))
    }
}

#[cfg(feature = "llama-cpp")]
mod llama {
    use std::time::Instant;

    use anyhow::{bail, Context, Result};
    use llama_cpp_2::context::params::LlamaContextParams;
    use llama_cpp_2::context::LlamaContext;
    use llama_cpp_2::llama_backend::LlamaBackend;
    use llama_cpp_2::llama_batch::LlamaBatch;
    use llama_cpp_2::model::params::LlamaModelParams;
    use llama_cpp_2::model::LlamaModel;
    use llama_cpp_2::sampling::LlamaSampler;
    use llama_cpp_2::token::LlamaToken;
    use tracing::{debug, info, warn};

    use crate::device::Device;
    use crate::error::LoadError;
    use crate::family::ModelFamily;
    use crate::model::{
        log_softmax_at, Generation, GenerationOptions, LanguageModel, LoadRequest, ModelConfig,
    };

    /// A blocking llama.cpp runner. Not `Send`; it stays on the thread that loaded it.
    pub struct LlamaRunner {
        family: ModelFamily,
        device: Device,
        config: ModelConfig,
        native_vocab: usize,
        _backend: LlamaBackend,
        model: &'static LlamaModel,
        context: LlamaContext<'static>,
    }

    impl LlamaRunner {
        pub fn load(request: &LoadRequest) -> Result<Self, LoadError> {
            info!(
                "Loading {} model from path: {} on {}",
                request.family,
                request.weights.display(),
                request.device
            );
            let backend =
                LlamaBackend::init().map_err(|e| LoadError::backend(&request.weights, e))?;

            let model_params =
                LlamaModelParams::default().with_n_gpu_layers(request.device.gpu_layers());
            let model_box = Box::new(
                LlamaModel::load_from_file(&backend, &request.weights, &model_params)
                    .map_err(|e| LoadError::backend(&request.weights, e))?,
            );
            // Loaded once per process, so the model lives for the rest of it.
            let model: &'static LlamaModel = Box::leak(model_box);

            let ctx_params = LlamaContextParams::default()
                .with_n_ctx(Some(request.runner.context_size))
                .with_n_batch(request.runner.context_size.get())
                .with_n_threads(request.runner.threads);
            let context = model
                .new_context(&backend, ctx_params)
                .map_err(|e| LoadError::backend(&request.weights, e))?;

            let native_vocab = usize::try_from(model.n_vocab()).unwrap_or_default();
            let mut config = request.config.clone().unwrap_or_default();
            if config.vocab_size == 0 {
                config.vocab_size = native_vocab;
            }
            if config.eos_token_id.is_none() {
                config.eos_token_id = u32::try_from(model.token_eos().0).ok();
            }
            if request.pad_token_id.is_some() {
                config.pad_token_id = request.pad_token_id;
            }

            info!("Model loaded successfully!");
            Ok(Self {
                family: request.family,
                device: request.device,
                config,
                native_vocab,
                _backend: backend,
                model,
                context,
            })
        }

        fn token(&self, id: u32) -> Result<LlamaToken> {
            if id as usize >= self.native_vocab {
                bail!(
                    "Token id {} is outside the {} embeddings stored in the weights",
                    id,
                    self.native_vocab
                );
            }
            Ok(LlamaToken::new(id as i32))
        }

        fn tokens(&self, ids: &[u32]) -> Result<Vec<LlamaToken>> {
            ids.iter().map(|&id| self.token(id)).collect()
        }

        fn decoder_start(&self) -> LlamaToken {
            match self.config.decoder_start_token_id {
                Some(id) => LlamaToken::new(id as i32),
                None => {
                    let start = self.model.decode_start_token();
                    if start.0 < 0 {
                        self.model.token_bos()
                    } else {
                        start
                    }
                }
            }
        }

        fn check_fits(&self, needed: usize) -> Result<()> {
            let n_ctx = self.context.n_ctx() as usize;
            if needed > n_ctx {
                bail!("Need {} positions but the context holds {}", needed, n_ctx);
            }
            Ok(())
        }

        /// Runs the encoder over `input` and leaves `batch` empty for the decoder.
        fn encode(&mut self, batch: &mut LlamaBatch, input: &[LlamaToken]) -> Result<()> {
            for (pos, &token) in (0_i32..).zip(input.iter()) {
                batch.add(token, pos, &[0], false)?;
            }
            self.context
                .encode(batch)
                .context("Failed to encode input tokens")?;
            batch.clear();
            Ok(())
        }
    }

    impl LanguageModel for LlamaRunner {
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
            if new_num_tokens > self.native_vocab {
                warn!(
                    "GGUF weights hold {} embeddings; ids up to {} will be rejected",
                    self.native_vocab, new_num_tokens
                );
            }
            self.config.vocab_size = new_num_tokens;
            Ok(())
        }

        fn generate(
            &mut self,
            input_ids: &[u32],
            options: &GenerationOptions,
        ) -> Result<Generation> {
            if input_ids.is_empty() {
                bail!("Empty prompt");
            }
            let start = Instant::now();
            let prompt = self.tokens(input_ids)?;
            self.context.clear_kv_cache();

            let mut batch = LlamaBatch::new(prompt.len().max(1), 1);
            let mut n_cur: i32 = match self.family {
                ModelFamily::Causal => {
                    self.check_fits(prompt.len() + options.max_new_tokens)?;
                    let last_index = (prompt.len() - 1) as i32;
                    for (i, &token) in (0_i32..).zip(prompt.iter()) {
                        batch.add(token, i, &[0], i == last_index)?;
                    }
                    prompt.len() as i32
                }
                ModelFamily::Seq2Seq => {
                    self.check_fits(prompt.len().max(options.max_new_tokens + 1))?;
                    self.encode(&mut batch, &prompt)?;
                    batch.add(self.decoder_start(), 0, &[0], true)?;
                    1
                }
            };
            self.context
                .decode(&mut batch)
                .context("Failed to decode prompt tokens")?;

            let mut sampler = if options.is_greedy() {
                LlamaSampler::greedy()
            } else {
                LlamaSampler::chain_simple([
                    LlamaSampler::top_p(options.top_p, 1),
                    LlamaSampler::temp(options.temperature),
                    LlamaSampler::dist(options.sampler_seed()),
                ])
            };

            let mut tokens = Vec::with_capacity(options.max_new_tokens);
            while tokens.len() < options.max_new_tokens {
                let token = sampler.sample(&self.context, batch.n_tokens() - 1);
                sampler.accept(token);
                if self.model.is_eog_token(token) {
                    break;
                }
                tokens.push(token.0 as u32);

                batch.clear();
                batch.add(token, n_cur, &[0], true)?;
                n_cur += 1;
                self.context
                    .decode(&mut batch)
                    .context("Failed to decode next token")?;
            }

            let duration = start.elapsed();
            debug!(
                "Decoded {} tokens in {:.2}s, speed {:.2} t/s",
                tokens.len(),
                duration.as_secs_f32(),
                tokens.len() as f32 / duration.as_secs_f32().max(f32::EPSILON)
            );
            Ok(Generation {
                tokens,
                prompt_tokens: prompt.len(),
                duration,
            })
        }

        fn log_likelihood(&mut self, context: &[u32], continuation: &[u32]) -> Result<f64> {
            if continuation.is_empty() {
                return Ok(0.0);
            }
            let context_tokens = self.tokens(context)?;
            let continuation_tokens = self.tokens(continuation)?;
            self.context.clear_kv_cache();

            // Decoder inputs and the batch index whose logits predict continuation[0].
            let (decoder_inputs, first_logit) = match self.family {
                ModelFamily::Causal => {
                    if context_tokens.is_empty() {
                        bail!("Causal scoring needs a non-empty context");
                    }
                    let mut inputs = context_tokens.clone();
                    inputs.extend_from_slice(&continuation_tokens[..continuation_tokens.len() - 1]);
                    (inputs, context_tokens.len() - 1)
                }
                ModelFamily::Seq2Seq => {
                    let mut encoder_batch = LlamaBatch::new(context_tokens.len().max(1), 1);
                    self.encode(&mut encoder_batch, &context_tokens)?;
                    let mut inputs = vec![self.decoder_start()];
                    inputs.extend_from_slice(&continuation_tokens[..continuation_tokens.len() - 1]);
                    (inputs, 0)
                }
            };
            self.check_fits(decoder_inputs.len())?;

            let mut batch = LlamaBatch::new(decoder_inputs.len(), 1);
            for (i, &token) in decoder_inputs.iter().enumerate() {
                batch.add(token, i as i32, &[0], i >= first_logit)?;
            }
            self.context
                .decode(&mut batch)
                .context("Failed to decode scoring batch")?;

            let mut total = 0.0;
            for (j, &target) in continuation.iter().enumerate() {
                let logits = self.context.get_logits_ith((first_logit + j) as i32);
                total += log_softmax_at(logits, target as usize)
                    .context("Continuation token outside the logits")?;
            }
            Ok(total)
        }
    }
}
