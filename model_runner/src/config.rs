use std::num::NonZeroU32;

/// Settings for the inference backend that don't depend on the model itself.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub threads: i32,
    pub context_size: NonZeroU32,
    pub batch_size: usize,
}

impl RunnerConfig {
    pub const DEFAULT_CONTEXT_SIZE: u32 = 2048;

    pub fn new(threads: i32, context_size: u32) -> Self {
        let context_size = NonZeroU32::new(context_size)
            .or(NonZeroU32::new(Self::DEFAULT_CONTEXT_SIZE))
            .unwrap_or(NonZeroU32::MIN);
        Self {
            threads,
            context_size,
            batch_size: 512,
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self::new(4, Self::DEFAULT_CONTEXT_SIZE)
    }
}
