use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow::array::{BooleanArray, Float64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use tracing::{debug, info};

use super::{fit_context, Task, TaskContext};
use crate::config::TaskConfig;
use crate::dataset::{load_jigsaw_test, sample, LabeledComment};
use crate::metrics::{ratio, Confusion, TaskMetrics};
use crate::progress::ProgressTracker;
use crate::writer::ParquetWriter;

pub const NAME: &str = "jigsaw_toxicity_pred";
pub const DATA_INSTRUCTIONS: &str =
    "Data needs to be downloaded manually from Kaggle and saved into a local directory.";

struct ToxicityPromptBuilder;
impl ToxicityPromptBuilder {
    fn build_prompt(&self, entry: &LabeledComment) -> String {
        format!(
            "Comment: {}\nQuestion: Is this comment toxic? Answer yes or no.\nAnswer:",
            entry.text.trim()
        )
    }
}

struct ToxicityPrediction {
    id: String,
    text: String,
    expected_toxic: bool,
    predicted_toxic: bool,
    yes_logprob: f64,
    no_logprob: f64,
}

pub struct ToxicityTask<'a> {
    ctx: TaskContext<'a>,
    config: TaskConfig,
    data_dir: PathBuf,
    predictions: Vec<ToxicityPrediction>,
    metrics: Option<TaskMetrics>,
}

pub fn build<'a>(ctx: TaskContext<'a>) -> Result<Box<dyn Task + 'a>> {
    let data_dir = ctx
        .data_dir
        .with_context(|| format!("{NAME} needs a data directory. {DATA_INSTRUCTIONS}"))?
        .to_path_buf();
    let config = TaskConfig::toxicity().with_limit(ctx.limit);
    Ok(Box::new(ToxicityTask {
        ctx,
        config,
        data_dir,
        predictions: Vec::new(),
        metrics: None,
    }))
}

impl ToxicityTask<'_> {
    fn answer_ids(&self, answer: &str) -> Result<Vec<u32>> {
        let ids = self.ctx.tokenizer.encode(answer, false)?;
        if ids.is_empty() {
            bail!("Answer {:?} encodes to no tokens", answer);
        }
        Ok(ids)
    }
}

impl Task for ToxicityTask<'_> {
    fn name(&self) -> &str {
        NAME
    }

    fn evaluate(&mut self, seed: u64) -> Result<()> {
        debug!("Loading toxicity dataset from {}", self.data_dir.display());
        let entries = sample(load_jigsaw_test(&self.data_dir)?, self.config.data.limit, seed);
        info!("Evaluating {} comments on {}", entries.len(), self.ctx.device);

        let yes = self.answer_ids(" yes")?;
        let no = self.answer_ids(" no")?;
        let prompt_builder = ToxicityPromptBuilder;
        let mut progress = ProgressTracker::new(entries.len());
        let mut confusion = Confusion::default();
        self.predictions.clear();

        for entry in entries {
            let mut context = self
                .ctx
                .tokenizer
                .encode(&prompt_builder.build_prompt(&entry), true)?;
            fit_context(&mut context, self.config.generation.max_prompt_tokens);

            let yes_logprob = self
                .ctx
                .model
                .log_likelihood(&context, &yes)
                .with_context(|| format!("Failed to score comment {}", entry.id))?;
            let no_logprob = self
                .ctx
                .model
                .log_likelihood(&context, &no)
                .with_context(|| format!("Failed to score comment {}", entry.id))?;
            let predicted_toxic = yes_logprob > no_logprob;
            confusion.record(predicted_toxic, entry.toxic);

            progress.add_tokens(context.len());
            progress.update(format!("Processing entry {}", entry.id));
            self.predictions.push(ToxicityPrediction {
                id: entry.id,
                text: entry.text,
                expected_toxic: entry.toxic,
                predicted_toxic,
                yes_logprob,
                no_logprob,
            });
        }
        progress.finish("Toxicity scoring complete!");

        let mut metrics = TaskMetrics::new(NAME, confusion.total());
        metrics.insert("accuracy", confusion.accuracy());
        metrics.insert("precision", confusion.precision());
        metrics.insert("recall", confusion.recall());
        metrics.insert("f1", confusion.f1());
        let flagged = confusion.true_positive + confusion.false_positive;
        metrics.insert("toxic_rate", ratio(flagged, confusion.total()));
        info!(
            "Accuracy: {:.4}, F1: {:.4} over {} comments",
            confusion.accuracy(),
            confusion.f1(),
            confusion.total()
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
            Field::new("id", DataType::Utf8, false),
            Field::new("input", DataType::Utf8, false),
            Field::new("expected_toxic", DataType::Boolean, false),
            Field::new("predicted_toxic", DataType::Boolean, false),
            Field::new("yes_logprob", DataType::Float64, false),
            Field::new("no_logprob", DataType::Float64, false),
        ]);
        let mut writer =
            ParquetWriter::create(output_dir.join(format!("{NAME}_predictions.parquet")), schema)?;
        for p in &self.predictions {
            writer.add_row(vec![
                Arc::new(StringArray::from(vec![p.id.clone()])),
                Arc::new(StringArray::from(vec![p.text.clone()])),
                Arc::new(BooleanArray::from(vec![p.expected_toxic])),
                Arc::new(BooleanArray::from(vec![p.predicted_toxic])),
                Arc::new(Float64Array::from(vec![p.yes_logprob])),
                Arc::new(Float64Array::from(vec![p.no_logprob])),
            ])?;
        }

        Ok(vec![metrics.write_json(output_dir)?, writer.close()?])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::test_support;
    use model_runner::{Device, MockCall};
    use std::fs;

    fn write_jigsaw(dir: &Path) -> Result<()> {
        fs::write(
            dir.join("test.csv"),
            "id,comment_text\nc1,you are lovely\nc2,you are an idiot\nc3,never scored\nc4,idiot\n",
        )?;
        fs::write(
            dir.join("test_labels.csv"),
            "id,toxic\nc1,0\nc2,1\nc3,-1\nc4,0\n",
        )?;
        Ok(())
    }

    #[test]
    fn scores_yes_against_no() -> Result<()> {
        let data = tempfile::tempdir()?;
        let out = tempfile::tempdir()?;
        write_jigsaw(data.path())?;
        let tokenizer =
            test_support::tokenizer(out.path(), &["yes", "no", "idiot", "you", "are", "lovely"])?;
        let yes_id = tokenizer.encode(" yes", false)?[0];
        let idiot_id = tokenizer.encode("idiot", false)?[0];

        // Calls the comment toxic whenever it mentions "idiot".
        let mut model = test_support::causal_model().with_scorer(move |context, continuation| {
            let toxic = context.contains(&idiot_id);
            match (toxic, continuation[0] == yes_id) {
                (true, true) | (false, false) => -0.1,
                _ => -2.0,
            }
        });

        let ctx = TaskContext {
            model: &mut model,
            tokenizer: &tokenizer,
            device: Device::Cpu,
            english_only: true,
            data_dir: Some(data.path()),
            cache_dir: data.path(),
            limit: None,
        };
        let mut task = build(ctx)?;
        task.evaluate(42)?;

        let metrics = task.metrics().unwrap();
        assert_eq!(metrics.examples, 3);
        assert_eq!(metrics.get("accuracy"), Some(2.0 / 3.0));
        assert_eq!(metrics.get("precision"), Some(0.5));
        assert_eq!(metrics.get("recall"), Some(1.0));

        let files = task.save_metrics(out.path())?;
        assert_eq!(files[0], out.path().join("jigsaw_toxicity_pred_metrics.json"));
        assert!(out.path().join("jigsaw_toxicity_pred_predictions.parquet").is_file());
        drop(task);

        let scored = model
            .calls()
            .iter()
            .filter(|c| matches!(c, MockCall::LogLikelihood { .. }))
            .count();
        assert_eq!(scored, 6);
        Ok(())
    }

    #[test]
    fn limit_picks_a_seeded_subset() -> Result<()> {
        let data = tempfile::tempdir()?;
        write_jigsaw(data.path())?;
        let tokenizer = test_support::tokenizer(data.path(), &["yes", "no"])?;
        let mut model = test_support::causal_model();

        let ctx = TaskContext {
            model: &mut model,
            tokenizer: &tokenizer,
            device: Device::Cpu,
            english_only: true,
            data_dir: Some(data.path()),
            cache_dir: data.path(),
            limit: Some(2),
        };
        let mut task = build(ctx)?;
        task.evaluate(7)?;
        assert_eq!(task.metrics().unwrap().examples, 2);
        Ok(())
    }

    #[test]
    fn requires_a_data_dir() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let tokenizer = test_support::tokenizer(dir.path(), &["yes", "no"])?;
        let mut model = test_support::causal_model();
        let ctx = TaskContext {
            model: &mut model,
            tokenizer: &tokenizer,
            device: Device::Cpu,
            english_only: true,
            data_dir: None,
            cache_dir: dir.path(),
            limit: None,
        };
        assert!(build(ctx).is_err());
        Ok(())
    }
}
