use std::time::Instant;

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, warn};

const TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) - {msg}";

pub struct ProgressTracker {
    bar: ProgressBar,
    start_time: Instant,
    tokens_generated: usize,
    completed_examples: usize,
}

impl ProgressTracker {
    pub fn new(total: usize) -> Self {
        let bar = ProgressBar::new(total as u64);
        match ProgressStyle::default_bar().template(TEMPLATE) {
            Ok(style) => bar.set_style(style.progress_chars("#>-")),
            Err(err) => warn!("Invalid progress template: {}", err),
        }

        Self {
            bar,
            start_time: Instant::now(),
            tokens_generated: 0,
            completed_examples: 0,
        }
    }

    pub fn update(&mut self, message: impl Into<String>) {
        self.completed_examples += 1;
        self.bar.inc(1);
        let msg = format!("{} - {:.2} tokens/sec", message.into(), self.tokens_per_sec());
        self.bar.set_message(msg);
    }

    pub fn add_tokens(&mut self, tokens: usize) {
        self.tokens_generated += tokens;
    }

    fn tokens_per_sec(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            self.tokens_generated as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn finish(&self, message: impl Into<String>) {
        self.bar.finish_with_message(message.into());
        debug!(
            "Processed {} tokens across {} examples in {:.2}s ({:.2} tokens/sec)",
            self.tokens_generated,
            self.completed_examples,
            self.start_time.elapsed().as_secs_f64(),
            self.tokens_per_sec()
        );
    }
}
