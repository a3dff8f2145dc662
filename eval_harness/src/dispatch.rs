use std::path::{Path, PathBuf};

use model_runner::LoadedModel;
use tracing::{info, instrument};

use crate::error::{EvalError, TaskError};
use crate::metrics::TaskMetrics;
use crate::tasks::{TaskContext, TaskRegistry};

/// Run-wide options every task is built with.
#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions<'a> {
    pub english_only: bool,
    pub data_dir: Option<&'a Path>,
    pub cache_dir: &'a Path,
    pub limit: Option<usize>,
    pub seed: u64,
    pub output_dir: &'a Path,
}

#[derive(Debug, Clone)]
pub struct TaskReport {
    pub name: String,
    pub metrics: Option<TaskMetrics>,
    pub files: Vec<PathBuf>,
}

/// Builds, evaluates and saves each task in order against the shared model. Every task gets
/// the same seed; the first failure stops the run.
#[instrument(skip_all, fields(tasks = names.len(), seed = options.seed))]
pub fn run_tasks(
    registry: &TaskRegistry,
    names: &[String],
    loaded: &mut LoadedModel,
    options: &DispatchOptions<'_>,
) -> Result<Vec<TaskReport>, EvalError> {
    let mut reports = Vec::with_capacity(names.len());

    for name in names {
        info!("Benchmarking {}...", name);
        let ctx = TaskContext {
            model: loaded.model.as_mut(),
            tokenizer: &loaded.tokenizer,
            device: loaded.device,
            english_only: options.english_only,
            data_dir: options.data_dir,
            cache_dir: options.cache_dir,
            limit: options.limit,
        };
        let mut task = registry.from_task_name(name, ctx)?;

        task.evaluate(options.seed)
            .map_err(|source| TaskError::Evaluate {
                task: name.clone(),
                source,
            })?;
        info!("Task {} finished, saving metrics...", task.name());
        let files = task
            .save_metrics(options.output_dir)
            .map_err(|source| TaskError::SaveMetrics {
                task: name.clone(),
                source,
            })?;

        reports.push(TaskReport {
            name: name.clone(),
            metrics: task.metrics().cloned(),
            files,
        });
    }

    info!(
        "Completed {} tasks, results in {}",
        reports.len(),
        options.output_dir.display()
    );
    Ok(reports)
}
