use anyhow::Result;
use clap::Parser;
use eval_harness::{Cli, TaskRegistry};
use model_runner::LlamaCppBackend;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let registry = TaskRegistry::builtin();
    let summary = eval_harness::run(&cli, &registry, &LlamaCppBackend)?;

    for report in &summary.reports {
        if let Some(metrics) = &report.metrics {
            info!("{}: {}", report.name, serde_json::to_string(&metrics.scores)?);
        }
    }
    info!("Results written to {}", summary.output_dir.display());
    Ok(())
}
