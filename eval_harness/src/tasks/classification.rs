use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{BooleanArray, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use tracing::{debug, info};

use super::{fit_context, resolve_data_file, Task, TaskContext};
use crate::config::TaskConfig;
use crate::dataset::{sample, ChoiceQuestion, ParquetDatasetLoader};
use crate::metrics::{ratio, TaskMetrics};
use crate::progress::ProgressTracker;
use crate::writer::ParquetWriter;

pub const NAME: &str = "mmlu";

fn choice_letter(index: usize) -> Result<char> {
    u8::try_from(index)
        .ok()
        .filter(|&i| i < 26)
        .map(|i| (b'A' + i) as char)
        .with_context(|| format!("No answer letter for choice {index}"))
}

struct ClassificationPromptBuilder;
impl ClassificationPromptBuilder {
    fn build_prompt(&self, entry: &ChoiceQuestion) -> Result<String> {
        let mut prompt = format!(
            "The following is a multiple choice question about {}.\n\n{}\n",
            entry.subject.replace('_', " "),
            entry.question.trim()
        );
        for (i, choice) in entry.choices.iter().enumerate() {
            prompt.push_str(&format!("{}. {}\n", choice_letter(i)?, choice.trim()));
        }
        prompt.push_str("Answer:");
        Ok(prompt)
    }
}

struct ChoicePrediction {
    id: usize,
    subject: String,
    predicted: char,
    expected: char,
    correct: bool,
}

#[derive(Default)]
struct Tally {
    correct: usize,
    total: usize,
}

pub struct ClassificationTask<'a> {
    ctx: TaskContext<'a>,
    config: TaskConfig,
    predictions: Vec<ChoicePrediction>,
    metrics: Option<TaskMetrics>,
}

pub fn build<'a>(ctx: TaskContext<'a>) -> Result<Box<dyn Task + 'a>> {
    let config = TaskConfig::classification().with_limit(ctx.limit);
    Ok(Box::new(ClassificationTask {
        ctx,
        config,
        predictions: Vec::new(),
        metrics: None,
    }))
}

impl ClassificationTask<'_> {
    /// Index of the choice letter the model finds most likely; ties go to the earlier one.
    fn pick(&mut self, context: &[u32], choices: usize) -> Result<usize> {
        let mut best: Option<(usize, f64)> = None;
        for i in 0..choices {
            let letter = self
                .ctx
                .tokenizer
                .encode(&format!(" {}", choice_letter(i)?), false)?;
            if letter.is_empty() {
                bail!("Choice letter {} encodes to no tokens", choice_letter(i)?);
            }
            let score = self.ctx.model.log_likelihood(context, &letter)?;
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((i, score));
            }
        }
        best.map(|(i, _)| i).context("Question has no choices")
    }
}

impl Task for ClassificationTask<'_> {
    fn name(&self) -> &str {
        NAME
    }

    fn evaluate(&mut self, seed: u64) -> Result<()> {
        debug!("Loading classification dataset...");
        let path = resolve_data_file(self.ctx.cache_dir, &self.config.data)?;
        let questions = ParquetDatasetLoader::new(&path).load_choice_questions()?;
        let entries = sample(questions, self.config.data.limit, seed);
        info!("Evaluating {} questions on {}", entries.len(), self.ctx.device);

        let prompt_builder = ClassificationPromptBuilder;
        let mut progress = ProgressTracker::new(entries.len());
        let mut overall = Tally::default();
        let mut by_subject: BTreeMap<String, Tally> = BTreeMap::new();
        self.predictions.clear();

        for entry in entries {
            let mut context = self
                .ctx
                .tokenizer
                .encode(&prompt_builder.build_prompt(&entry)?, true)?;
            fit_context(&mut context, self.config.generation.max_prompt_tokens);

            let picked = self
                .pick(&context, entry.choices.len())
                .with_context(|| format!("Failed to score question {}", entry.id))?;
            let correct = picked == entry.answer_index;

            let subject = by_subject.entry(entry.subject.clone()).or_default();
            for tally in [&mut overall, subject] {
                tally.total += 1;
                tally.correct += usize::from(correct);
            }

            progress.add_tokens(context.len());
            progress.update(format!("Processing entry {}", entry.id));
            self.predictions.push(ChoicePrediction {
                id: entry.id,
                subject: entry.subject,
                predicted: choice_letter(picked)?,
                expected: choice_letter(entry.answer_index)?,
                correct,
            });
        }
        progress.finish("Classification complete!");

        let mut metrics = TaskMetrics::new(NAME, overall.total);
        metrics.insert("accuracy", ratio(overall.correct, overall.total));
        for (subject, tally) in &by_subject {
            metrics.insert(format!("{subject}/accuracy"), ratio(tally.correct, tally.total));
        }
        info!(
            "Accuracy: {:.2}% ({}/{})",
            100.0 * ratio(overall.correct, overall.total),
            overall.correct,
            overall.total
        );
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
            Field::new("id", DataType::Int64, false),
            Field::new("subject", DataType::Utf8, false),
            Field::new("response", DataType::Utf8, false),
            Field::new("expected", DataType::Utf8, false),
            Field::new("correct", DataType::Boolean, false),
        ]);
        let mut writer =
            ParquetWriter::create(output_dir.join(format!("{NAME}_predictions.parquet")), schema)?;
        for p in &self.predictions {
            writer.add_row(vec![
                Arc::new(Int64Array::from(vec![p.id as i64])),
                Arc::new(StringArray::from(vec![p.subject.clone()])),
                Arc::new(StringArray::from(vec![p.predicted.to_string()])),
                Arc::new(StringArray::from(vec![p.expected.to_string()])),
                Arc::new(BooleanArray::from(vec![p.correct])),
            ])?;
        }

        Ok(vec![metrics.write_json(output_dir)?, writer.close()?])
    }
}
