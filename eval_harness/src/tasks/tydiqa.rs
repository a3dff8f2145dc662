use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow::array::{Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use model_runner::GenerationOptions;
use tracing::{debug, info};

use super::{fit_context, resolve_data_file, Task, TaskContext};
use crate::config::TaskConfig;
use crate::dataset::{load_squad_file, sample, QaExample};
use crate::metrics::{best_over, exact_match, token_f1, TaskMetrics};
use crate::progress::ProgressTracker;
use crate::writer::ParquetWriter;

pub const NAME: &str = "tydiqa_secondary";
const MAX_ANSWER_TOKENS: usize = 32;

struct QaPromptBuilder;
impl QaPromptBuilder {
    fn build_prompt(&self, entry: &QaExample) -> String {
        format!(
            "{}\n\nQuestion: {}\nAnswer:",
            entry.context.trim(),
            entry.question.trim()
        )
    }
}

struct QaProcessor;
impl QaProcessor {
    /// The answer is whatever the model says before its first line break.
    fn process_response(&self, response: &str) -> String {
        response
            .trim_start()
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string()
    }
}

struct QaPrediction {
    id: String,
    language: String,
    prediction: String,
    exact_match: f64,
    f1: f64,
    prompt_tokens: usize,
    duration: f64,
}

#[derive(Default)]
struct LanguageScore {
    count: usize,
    exact_match: f64,
    f1: f64,
}

impl LanguageScore {
    fn add(&mut self, exact_match: f64, f1: f64) {
        self.count += 1;
        self.exact_match += exact_match;
        self.f1 += f1;
    }

    fn mean(&self) -> (f64, f64) {
        if self.count == 0 {
            return (0.0, 0.0);
        }
        let n = self.count as f64;
        (self.exact_match / n, self.f1 / n)
    }
}

pub struct TydiQaTask<'a> {
    ctx: TaskContext<'a>,
    config: TaskConfig,
    predictions: Vec<QaPrediction>,
    metrics: Option<TaskMetrics>,
}

pub fn build<'a>(ctx: TaskContext<'a>) -> Result<Box<dyn Task + 'a>> {
    let config = TaskConfig::tydiqa().with_limit(ctx.limit);
    Ok(Box::new(TydiQaTask {
        ctx,
        config,
        predictions: Vec::new(),
        metrics: None,
    }))
}

impl Task for TydiQaTask<'_> {
    fn name(&self) -> &str {
        NAME
    }

    fn evaluate(&mut self, seed: u64) -> Result<()> {
        debug!("Loading TyDi QA dataset...");
        let path = resolve_data_file(self.ctx.cache_dir, &self.config.data)?;
        let entries = sample(
            load_squad_file(&path, self.ctx.english_only)?,
            self.config.data.limit,
            seed,
        );
        info!(
            "Evaluating {} questions on {} (english_only: {})",
            entries.len(),
            self.ctx.device,
            self.ctx.english_only
        );

        let options = GenerationOptions::greedy(MAX_ANSWER_TOKENS, seed);
        let prompt_builder = QaPromptBuilder;
        let response_processor = QaProcessor;
        let mut progress = ProgressTracker::new(entries.len());
        let mut overall = LanguageScore::default();
        let mut by_language: BTreeMap<String, LanguageScore> = BTreeMap::new();
        self.predictions.clear();

        for entry in entries {
            let mut input_ids = self
                .ctx
                .tokenizer
                .encode(&prompt_builder.build_prompt(&entry), true)?;
            fit_context(&mut input_ids, self.config.generation.max_prompt_tokens);

            let generation = self
                .ctx
                .model
                .generate(&input_ids, &options)
                .with_context(|| format!("Failed to answer question {}", entry.id))?;
            let response = self.ctx.tokenizer.decode(&generation.tokens)?;
            let prediction = response_processor.process_response(&response);

            let em = best_over(&prediction, &entry.answers, |p, g| {
                f64::from(u8::from(exact_match(p, g)))
            });
            let f1 = best_over(&prediction, &entry.answers, token_f1);
            overall.add(em, f1);
            by_language.entry(entry.language.clone()).or_default().add(em, f1);

            progress.add_tokens(generation.tokens.len());
            progress.update(format!("Processing entry {}", entry.id));
            self.predictions.push(QaPrediction {
                id: entry.id,
                language: entry.language,
                prediction,
                exact_match: em,
                f1,
                prompt_tokens: generation.prompt_tokens,
                duration: generation.duration.as_secs_f64(),
            });
        }
        progress.finish("Question answering complete!");

        let mut metrics = TaskMetrics::new(NAME, overall.count);
        let (em, f1) = overall.mean();
        metrics.insert("exact_match", em);
        metrics.insert("f1", f1);
        for (language, score) in &by_language {
            let (em, f1) = score.mean();
            metrics.insert(format!("{language}/exact_match"), em);
            metrics.insert(format!("{language}/f1"), f1);
        }
        info!("Exact match: {:.4}, F1: {:.4}", em, f1);
        self.metrics = Some(metrics);
        Ok(())
    }

    fn metrics(&self) -> Option<&TaskMetrics> {
        self.metrics.as_ref()
    }

    fn save_metrics(&self, output_dir: &Path) -> Result<Vec<PathBuf>> {
        let metrics = self
            .metrics
            .as_ref()
            .context("Task has not been evaluated")?;

        let schema = Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("language", DataType::Utf8, false),
            Field::new("prediction", DataType::Utf8, false),
            Field::new("exact_match", DataType::Float64, false),
            Field::new("f1", DataType::Float64, false),
            Field::new("prompt_tokens", DataType::Int64, false),
            Field::new("duration", DataType::Float64, false),
        ]);
        let mut writer =
            ParquetWriter::create(output_dir.join(format!("{NAME}_predictions.parquet")), schema)?;
        for p in &self.predictions {
            writer.add_row(vec![
                Arc::new(StringArray::from(vec![p.id.clone()])),
                Arc::new(StringArray::from(vec![p.language.clone()])),
                Arc::new(StringArray::from(vec![p.prediction.clone()])),
                Arc::new(Float64Array::from(vec![p.exact_match])),
                Arc::new(Float64Array::from(vec![p.f1])),
                Arc::new(Int64Array::from(vec![p.prompt_tokens as i64])),
                Arc::new(Float64Array::from(vec![p.duration])),
            ])?;
        }

        Ok(vec![metrics.write_json(output_dir)?, writer.close()?])
    }
}
