use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::Parser;
use eval_harness::{
    Cli, ConfigurationError, EvalError, Task, TaskContext, TaskEntry, TaskError, TaskMetrics,
    TaskRegistry,
};
use model_runner::{write_tokenizer_fixture, GenerationOptions, MockBackend};

thread_local! {
    static SEEN: RefCell<Vec<(String, u64)>> = const { RefCell::new(Vec::new()) };
}

fn seen() -> Vec<(String, u64)> {
    SEEN.with(|s| s.borrow().clone())
}

fn reset_seen() {
    SEEN.with(|s| s.borrow_mut().clear());
}

struct Recording<'a> {
    name: &'static str,
    fail: bool,
    ctx: TaskContext<'a>,
    metrics: Option<TaskMetrics>,
}

impl Task for Recording<'_> {
    fn name(&self) -> &str {
        self.name
    }

    fn evaluate(&mut self, seed: u64) -> Result<()> {
        SEEN.with(|s| s.borrow_mut().push((self.name.to_string(), seed)));
        if self.fail {
            bail!("{} blew up", self.name);
        }
        let prompt = self.ctx.tokenizer.encode("hello world", false)?;
        let generation = self
            .ctx
            .model
            .generate(&prompt, &GenerationOptions::greedy(4, seed))?;

        let mut metrics = TaskMetrics::new(self.name, 1);
        metrics.insert("tokens", generation.tokens.len() as f64);
        self.metrics = Some(metrics);
        Ok(())
    }

    fn metrics(&self) -> Option<&TaskMetrics> {
        self.metrics.as_ref()
    }

    fn save_metrics(&self, output_dir: &Path) -> Result<Vec<PathBuf>> {
        match &self.metrics {
            Some(metrics) => Ok(vec![metrics.write_json(output_dir)?]),
            None => bail!("not evaluated"),
        }
    }
}

fn alpha<'a>(ctx: TaskContext<'a>) -> Result<Box<dyn Task + 'a>> {
    Ok(Box::new(Recording {
        name: "alpha",
        fail: false,
        ctx,
        metrics: None,
    }))
}

fn beta<'a>(ctx: TaskContext<'a>) -> Result<Box<dyn Task + 'a>> {
    Ok(Box::new(Recording {
        name: "beta",
        fail: false,
        ctx,
        metrics: None,
    }))
}

fn broken<'a>(ctx: TaskContext<'a>) -> Result<Box<dyn Task + 'a>> {
    Ok(Box::new(Recording {
        name: "broken",
        fail: true,
        ctx,
        metrics: None,
    }))
}

fn entry(name: &'static str, constructor: eval_harness::tasks::TaskConstructor) -> TaskEntry {
    TaskEntry {
        name,
        requires_data_dir: false,
        data_instructions: "",
        constructor,
    }
}

fn recording_registry() -> TaskRegistry {
    TaskRegistry::builtin()
        .register(entry("alpha", alpha))
        .register(entry("beta", beta))
        .register(entry("broken", broken))
}

/// A local model directory the mock backend can load.
fn model_dir(root: &Path) -> Result<PathBuf> {
    let dir = root.join("tiny-model");
    fs::create_dir_all(&dir)?;
    write_tokenizer_fixture(&dir, &["hello", "world", "yes", "no", "A", "B", "C", "D"])?;
    fs::write(dir.join("tiny-model.q8_0.gguf"), b"GGUF")?;
    fs::write(dir.join("config.json"), r#"{"vocab_size": 8, "eos_token_id": 9}"#)?;
    Ok(dir)
}

fn cli(model: &Path, output: &Path, extra: &[&str]) -> Cli {
    let mut argv = vec![
        "eval-harness".to_string(),
        "--model_name_or_path".to_string(),
        model.display().to_string(),
        "--output_dir".to_string(),
        output.display().to_string(),
    ];
    argv.extend(extra.iter().map(|s| s.to_string()));
    Cli::try_parse_from(argv).unwrap()
}

#[test]
fn tasks_run_in_order_into_the_tagged_dir() -> Result<()> {
    reset_seen();
    let root = tempfile::tempdir()?;
    let model = model_dir(root.path())?;
    let out = root.path().join("out");
    let cli = cli(
        &model,
        &out,
        &["--eval_tasks", "beta", "alpha", "--tag", "run1", "--seed", "11"],
    );

    let backend = MockBackend::default();
    let summary = eval_harness::run(&cli, &recording_registry(), &backend)?;

    assert_eq!(summary.output_dir, out.join("run1"));
    let names: Vec<_> = summary.reports.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["beta", "alpha"]);
    assert!(out.join("run1/beta_metrics.json").is_file());
    assert!(out.join("run1/alpha_metrics.json").is_file());
    assert_eq!(
        seen(),
        vec![("beta".to_string(), 11), ("alpha".to_string(), 11)]
    );

    // One load for the whole run, with the tokenizer's EOS as pad token.
    let requests = backend.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].pad_token_id, Some(9));
    assert!(requests[0].weights.ends_with("tiny-model.q8_0.gguf"));
    Ok(())
}

#[test]
fn seed_does_not_depend_on_task_order() -> Result<()> {
    reset_seen();
    let root = tempfile::tempdir()?;
    let model = model_dir(root.path())?;
    let out = root.path().join("out");

    for order in [["alpha", "beta"], ["beta", "alpha"]] {
        let cli = cli(&model, &out, &["--eval_tasks", order[0], order[1]]);
        eval_harness::run(&cli, &recording_registry(), &MockBackend::default())?;
    }
    assert!(seen().iter().all(|(_, seed)| *seed == 42));
    assert_eq!(seen().len(), 4);
    Ok(())
}

#[test]
fn configuration_errors_come_before_loading() -> Result<()> {
    reset_seen();
    let root = tempfile::tempdir()?;
    let model = model_dir(root.path())?;
    let out = root.path().join("out");
    let backend = MockBackend::default();

    let err = eval_harness::run(&cli(&model, &out, &[]), &recording_registry(), &backend)
        .unwrap_err();
    assert!(matches!(
        err,
        EvalError::Configuration(ConfigurationError::NoTasks)
    ));

    let jigsaw = cli(&model, &out, &["--eval_tasks", "alpha", "jigsaw_toxicity_pred"]);
    let err = eval_harness::run(&jigsaw, &recording_registry(), &backend).unwrap_err();
    assert!(matches!(
        err,
        EvalError::Configuration(ConfigurationError::MissingDataDir { .. })
    ));

    let missing = root.path().join("nope");
    let jigsaw = cli(
        &model,
        &out,
        &[
            "--eval_tasks",
            "jigsaw_toxicity_pred",
            "--data_dir",
            missing.to_str().unwrap(),
        ],
    );
    let err = eval_harness::run(&jigsaw, &recording_registry(), &backend).unwrap_err();
    assert!(matches!(
        err,
        EvalError::Configuration(ConfigurationError::DataDirNotFound { .. })
    ));

    assert!(backend.requests().is_empty());
    assert!(seen().is_empty());
    assert!(!out.exists());
    Ok(())
}

#[test]
fn first_failure_stops_the_run() -> Result<()> {
    reset_seen();
    let root = tempfile::tempdir()?;
    let model = model_dir(root.path())?;
    let out = root.path().join("out");
    let cli = cli(
        &model,
        &out,
        &["--eval_tasks", "alpha", "broken", "beta", "--tag", "t"],
    );

    let err = eval_harness::run(&cli, &recording_registry(), &MockBackend::default())
        .unwrap_err();
    match err {
        EvalError::Task(TaskError::Evaluate { task, .. }) => assert_eq!(task, "broken"),
        other => panic!("unexpected error {other:?}"),
    }
    let names: Vec<_> = seen().into_iter().map(|(name, _)| name).collect();
    assert_eq!(names, vec!["alpha", "broken"]);
    assert!(out.join("t/alpha_metrics.json").is_file());
    assert!(!out.join("t/beta_metrics.json").exists());
    Ok(())
}

#[test]
fn builtin_tasks_end_to_end() -> Result<()> {
    reset_seen();
    let root = tempfile::tempdir()?;
    let model = model_dir(root.path())?;
    let out = root.path().join("out");
    let cache = root.path().join("cache");
    let data = root.path().join("jigsaw");
    fs::create_dir_all(&cache)?;
    fs::create_dir_all(&data)?;

    fs::write(
        cache.join("tydiqa-goldp-v1.1-dev.json"),
        r#"{"data": [{"paragraphs": [{"context": "hello world", "qas": [
            {"id": "english-1", "question": "hello?", "answers": [{"text": "hello world"}]},
            {"id": "swahili-2", "question": "world?", "answers": [{"text": "world"}]}
        ]}]}]}"#,
    )?;
    fs::write(data.join("test.csv"), "id,comment_text\nx1,hello\nx2,world\n")?;
    fs::write(data.join("test_labels.csv"), "id,toxic\nx1,0\nx2,-1\n")?;

    let cli = cli(
        &model,
        &out,
        &[
            "--eval_tasks",
            "tydiqa_secondary",
            "jigsaw_toxicity_pred",
            "--tag",
            "e2e",
            "--data_dir",
            data.to_str().unwrap(),
            "--cache_dir",
            cache.to_str().unwrap(),
        ],
    );
    let summary = eval_harness::run(&cli, &TaskRegistry::builtin(), &MockBackend::default())?;

    let run_dir = out.join("e2e");
    for file in [
        "tydiqa_secondary_metrics.json",
        "tydiqa_secondary_predictions.parquet",
        "jigsaw_toxicity_pred_metrics.json",
        "jigsaw_toxicity_pred_predictions.parquet",
    ] {
        assert!(run_dir.join(file).is_file(), "missing {file}");
    }

    let tydiqa = summary.reports[0].metrics.as_ref().unwrap();
    assert_eq!(tydiqa.examples, 1);
    assert!(tydiqa.get("swahili/f1").is_none());
    let jigsaw = summary.reports[1].metrics.as_ref().unwrap();
    assert_eq!(jigsaw.examples, 1);
    Ok(())
}

#[test]
fn empty_tag_writes_into_a_timestamped_dir() -> Result<()> {
    reset_seen();
    let root = tempfile::tempdir()?;
    let model = model_dir(root.path())?;
    let out = root.path().join("out");
    let cli = cli(&model, &out, &["--eval_tasks", "alpha", "--tag", ""]);

    let summary = eval_harness::run(&cli, &recording_registry(), &MockBackend::default())?;
    assert_ne!(summary.output_dir, out);
    assert_eq!(summary.output_dir.parent(), Some(out.as_path()));
    assert!(summary.output_dir.join("alpha_metrics.json").is_file());
    assert!(!out.join("alpha_metrics.json").exists());
    Ok(())
}
