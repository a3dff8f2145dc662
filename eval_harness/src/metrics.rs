use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;

/// What a task reports once it has been evaluated.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TaskMetrics {
    pub task: String,
    pub examples: usize,
    pub scores: BTreeMap<String, f64>,
}

impl TaskMetrics {
    pub fn new(task: &str, examples: usize) -> Self {
        Self {
            task: task.to_string(),
            examples,
            scores: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.scores.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.scores.get(name).copied()
    }

    /// Writes `<task>_metrics.json` into `output_dir`.
    pub fn write_json(&self, output_dir: &Path) -> Result<PathBuf> {
        let path = output_dir.join(format!("{}_metrics.json", self.task));
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(path)
    }
}

/// Counts for a binary classifier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Confusion {
    pub true_positive: usize,
    pub false_positive: usize,
    pub true_negative: usize,
    pub false_negative: usize,
}

impl Confusion {
    pub fn record(&mut self, predicted: bool, actual: bool) {
        match (predicted, actual) {
            (true, true) => self.true_positive += 1,
            (true, false) => self.false_positive += 1,
            (false, false) => self.true_negative += 1,
            (false, true) => self.false_negative += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.true_positive + self.false_positive + self.true_negative + self.false_negative
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.true_positive + self.true_negative, self.total())
    }

    pub fn precision(&self) -> f64 {
        ratio(self.true_positive, self.true_positive + self.false_positive)
    }

    pub fn recall(&self) -> f64 {
        ratio(self.true_positive, self.true_positive + self.false_negative)
    }

    pub fn f1(&self) -> f64 {
        let (p, r) = (self.precision(), self.recall());
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }
}

pub fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// SQuAD answer normalization: lowercase, drop punctuation and English articles,
/// collapse whitespace.
pub fn normalize_answer(text: &str) -> String {
    let lowered: String = text
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_ascii_punctuation())
        .collect();
    lowered
        .split_whitespace()
        .filter(|w| !matches!(*w, "a" | "an" | "the"))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn exact_match(prediction: &str, gold: &str) -> bool {
    normalize_answer(prediction) == normalize_answer(gold)
}

/// Token-overlap F1 between normalized answers.
pub fn token_f1(prediction: &str, gold: &str) -> f64 {
    let prediction = normalize_answer(prediction);
    let gold = normalize_answer(gold);
    let pred_tokens: Vec<&str> = prediction.split_whitespace().collect();
    let gold_tokens: Vec<&str> = gold.split_whitespace().collect();
    if pred_tokens.is_empty() || gold_tokens.is_empty() {
        return if pred_tokens == gold_tokens { 1.0 } else { 0.0 };
    }

    let mut gold_counts: HashMap<&str, usize> = HashMap::new();
    for token in &gold_tokens {
        *gold_counts.entry(token).or_default() += 1;
    }
    let mut common = 0;
    for token in &pred_tokens {
        if let Some(count) = gold_counts.get_mut(token) {
            if *count > 0 {
                *count -= 1;
                common += 1;
            }
        }
    }
    if common == 0 {
        return 0.0;
    }
    let precision = common as f64 / pred_tokens.len() as f64;
    let recall = common as f64 / gold_tokens.len() as f64;
    2.0 * precision * recall / (precision + recall)
}

/// Best score of `prediction` against any of the gold answers.
pub fn best_over<F>(prediction: &str, golds: &[String], score: F) -> f64
where
    F: Fn(&str, &str) -> f64,
{
    golds
        .iter()
        .map(|gold| score(prediction, gold))
        .fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_matches_squad() {
        assert_eq!(normalize_answer("The  Eiffel Tower!"), "eiffel tower");
        assert_eq!(normalize_answer("an apple, a pear"), "apple pear");
        assert!(exact_match("the Nile.", "Nile"));
        assert!(!exact_match("Nile river", "Nile"));
    }

    #[test]
    fn f1_counts_shared_tokens_once() {
        assert_eq!(token_f1("Barack Obama", "Barack Obama"), 1.0);
        assert_eq!(token_f1("Obama", "Barack Obama"), 2.0 * (1.0 * 0.5) / 1.5);
        assert_eq!(token_f1("red red red", "red blue"), 2.0 * (1.0 / 3.0 * 0.5) / (1.0 / 3.0 + 0.5));
        assert_eq!(token_f1("green", "blue"), 0.0);
        assert_eq!(token_f1("the", "a"), 1.0);
    }

    #[test]
    fn best_over_all_golds() {
        let golds = vec!["Paris".to_string(), "the city of Paris".to_string()];
        assert_eq!(best_over("city of Paris", &golds, token_f1), 1.0);
        assert_eq!(best_over("x", &[], token_f1), 0.0);
    }

    #[test]
    fn confusion_scores() {
        let mut c = Confusion::default();
        for (p, a) in [(true, true), (true, false), (false, false), (false, true), (true, true)] {
            c.record(p, a);
        }
        assert_eq!(c.total(), 5);
        assert_eq!(c.accuracy(), 0.6);
        assert_eq!(c.precision(), 2.0 / 3.0);
        assert_eq!(c.recall(), 2.0 / 3.0);
        assert!((c.f1() - 2.0 / 3.0).abs() < 1e-12);
        assert_eq!(Confusion::default().f1(), 0.0);
    }

    #[test]
    fn metrics_json_is_named_after_the_task() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut metrics = TaskMetrics::new("mmlu", 3);
        metrics.insert("accuracy", 0.5);
        let path = metrics.write_json(dir.path())?;
        assert_eq!(path, dir.path().join("mmlu_metrics.json"));

        let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(path)?)?;
        assert_eq!(value["examples"], 3);
        assert_eq!(value["scores"]["accuracy"], 0.5);
        Ok(())
    }
}
