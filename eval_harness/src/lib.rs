pub mod config;
pub mod dataset;
pub mod dispatch;
pub mod error;
pub mod metrics;
pub mod output;
pub mod progress;
pub mod tasks;
pub mod writer;

use std::path::PathBuf;

use chrono::Local;
use model_runner::{load_model_and_tokenizer, ModelBackend};
use tracing::info;

pub use config::{Cli, EvaluationArgs, RunArgs, TaskConfig};
pub use dispatch::{run_tasks, DispatchOptions, TaskReport};
pub use error::{ConfigurationError, EvalError, TaskError};
pub use metrics::TaskMetrics;
pub use tasks::{Task, TaskContext, TaskEntry, TaskRegistry};

#[derive(Debug)]
pub struct RunSummary {
    pub output_dir: PathBuf,
    pub reports: Vec<TaskReport>,
}

/// Validates `cli`, loads the model once and runs every requested task against it.
pub fn run(
    cli: &Cli,
    registry: &TaskRegistry,
    backend: &dyn ModelBackend,
) -> Result<RunSummary, EvalError> {
    cli.eval.validate(registry)?;
    let device = cli.run.device()?;

    info!("Beginning evaluation on device: {}", device);
    let mut loaded = load_model_and_tokenizer(backend, &cli.load_options(device))?;

    let tag = output::resolve_tag(cli.eval.tag.as_deref(), Local::now());
    let output_dir = output::prepare_output_dir(&cli.run.output_dir, &tag)?;
    info!("Writing results to {}", output_dir.display());

    let options = DispatchOptions {
        english_only: cli.eval.english_only,
        data_dir: cli.eval.data_dir.as_deref(),
        cache_dir: cli.eval.cache_dir(),
        limit: cli.eval.limit,
        seed: cli.run.seed,
        output_dir: &output_dir,
    };
    let reports = run_tasks(registry, &cli.eval.eval_tasks, &mut loaded, &options)?;

    Ok(RunSummary {
        output_dir,
        reports,
    })
}
