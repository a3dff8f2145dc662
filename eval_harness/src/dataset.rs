use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use arrow::array::{Array, ArrayRef, Int64Array, ListArray, StringArray};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use tracing::{debug, info};

/// Downloads `url` to `path` unless the file is already there.
pub fn ensure_downloaded(path: &Path, url: &str) -> Result<()> {
    if path.exists() {
        debug!("Using cached dataset {}", path.display());
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create dataset directory")?;
    }

    info!("Dataset not found, downloading {}", url);
    let mut response = reqwest::blocking::get(url)
        .and_then(|r| r.error_for_status())
        .with_context(|| format!("Failed to download dataset from {url}"))?;

    // Write next to the target and rename, so an interrupted download is never mistaken
    // for a cached file.
    let partial = path.with_extension("part");
    let mut file = File::create(&partial).context("Failed to create file")?;
    response
        .copy_to(&mut file)
        .context("Failed to write dataset to file")?;
    std::fs::rename(&partial, path).context("Failed to move downloaded dataset into place")?;
    info!("Dataset downloaded successfully to {}", path.display());
    Ok(())
}

/// Picks `limit` example indices with a shuffle seeded by `seed`, returned in file order.
/// Without a limit (or with one at least `len`) every index is kept.
pub fn sample_indices(len: usize, limit: Option<usize>, seed: u64) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..len).collect();
    match limit {
        Some(limit) if limit < len => {
            let mut rng = StdRng::seed_from_u64(seed);
            indices.shuffle(&mut rng);
            indices.truncate(limit);
            indices.sort_unstable();
            indices
        }
        _ => indices,
    }
}

/// Keeps the entries chosen by `sample_indices`.
pub fn sample<T>(entries: Vec<T>, limit: Option<usize>, seed: u64) -> Vec<T> {
    let keep = sample_indices(entries.len(), limit, seed);
    let mut keep = keep.into_iter().peekable();
    entries
        .into_iter()
        .enumerate()
        .filter_map(|(i, entry)| {
            if keep.peek() == Some(&i) {
                keep.next();
                Some(entry)
            } else {
                None
            }
        })
        .collect()
}

pub trait DatasetContent: Sized {
    fn parse_record(headers: &csv::StringRecord, record: &csv::StringRecord) -> Result<Self>;
}

fn field<'r>(
    headers: &csv::StringRecord,
    record: &'r csv::StringRecord,
    name: &str,
) -> Result<&'r str> {
    let index = headers
        .iter()
        .position(|h| h == name)
        .with_context(|| format!("Missing {name} column"))?;
    record
        .get(index)
        .with_context(|| format!("Missing {name} field"))
}

/// A comment from the Jigsaw `test.csv`.
#[derive(Debug, Clone)]
pub struct ToxicComment {
    pub id: String,
    pub comment_text: String,
}

/// A row of the Jigsaw `test_labels.csv`; `-1` marks rows that were never scored.
#[derive(Debug, Clone)]
pub struct ToxicLabel {
    pub id: String,
    pub toxic: i8,
}

impl DatasetContent for ToxicComment {
    fn parse_record(headers: &csv::StringRecord, record: &csv::StringRecord) -> Result<Self> {
        Ok(Self {
            id: field(headers, record, "id")?.to_string(),
            comment_text: field(headers, record, "comment_text")?.to_string(),
        })
    }
}

impl DatasetContent for ToxicLabel {
    fn parse_record(headers: &csv::StringRecord, record: &csv::StringRecord) -> Result<Self> {
        Ok(Self {
            id: field(headers, record, "id")?.to_string(),
            toxic: field(headers, record, "toxic")?
                .trim()
                .parse()
                .context("Failed to parse toxic label")?,
        })
    }
}

#[derive(Debug)]
pub struct CsvLoader<T: DatasetContent> {
    path: PathBuf,
    _phantom: PhantomData<T>,
}

impl<T: DatasetContent> CsvLoader<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _phantom: PhantomData,
        }
    }

    pub fn load(&self) -> Result<Vec<T>> {
        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open dataset file {}", self.path.display()))?;
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_reader(BufReader::new(file));
        let headers = reader.headers().context("Failed to read CSV header")?.clone();

        let mut entries = Vec::new();
        for (idx, result) in reader.records().enumerate() {
            let record = result.with_context(|| {
                format!("Failed to read CSV record {idx} of {}", self.path.display())
            })?;
            entries.push(T::parse_record(&headers, &record)?);
        }
        debug!("Loaded {} rows from {}", entries.len(), self.path.display());
        Ok(entries)
    }
}

/// A scored Jigsaw comment.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledComment {
    pub id: String,
    pub text: String,
    pub toxic: bool,
}

/// Joins the Jigsaw test comments with their labels, dropping unscored rows.
pub fn load_jigsaw_test(data_dir: &Path) -> Result<Vec<LabeledComment>> {
    let comments = CsvLoader::<ToxicComment>::new(data_dir.join("test.csv")).load()?;
    let labels: HashMap<String, i8> = CsvLoader::<ToxicLabel>::new(data_dir.join("test_labels.csv"))
        .load()?
        .into_iter()
        .map(|l| (l.id, l.toxic))
        .collect();

    let mut entries = Vec::with_capacity(comments.len());
    for comment in comments {
        match labels.get(&comment.id) {
            Some(-1) => continue,
            Some(&label) => entries.push(LabeledComment {
                id: comment.id,
                text: comment.comment_text,
                toxic: label == 1,
            }),
            None => bail!("Comment {} has no entry in test_labels.csv", comment.id),
        }
    }
    if entries.is_empty() {
        bail!("No labeled entries found in {}", data_dir.display());
    }
    info!("Loaded {} labeled comments from {}", entries.len(), data_dir.display());
    Ok(entries)
}

#[derive(Debug, Deserialize)]
struct SquadFile {
    data: Vec<SquadArticle>,
}

#[derive(Debug, Deserialize)]
struct SquadArticle {
    paragraphs: Vec<SquadParagraph>,
}

#[derive(Debug, Deserialize)]
struct SquadParagraph {
    context: String,
    qas: Vec<SquadQa>,
}

#[derive(Debug, Deserialize)]
struct SquadQa {
    id: String,
    question: String,
    answers: Vec<SquadAnswer>,
}

#[derive(Debug, Deserialize)]
struct SquadAnswer {
    text: String,
}

/// One TyDi QA GoldP question; ids start with the language name, e.g. `english-123`.
#[derive(Debug, Clone, PartialEq)]
pub struct QaExample {
    pub id: String,
    pub language: String,
    pub context: String,
    pub question: String,
    pub answers: Vec<String>,
}

/// Reads a SQuAD-format file, keeping only English questions when `english_only`.
pub fn load_squad_file(path: &Path, english_only: bool) -> Result<Vec<QaExample>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open dataset file {}", path.display()))?;
    let squad: SquadFile =
        serde_json::from_reader(BufReader::new(file)).context("Failed to parse QA dataset")?;

    let mut examples = Vec::new();
    for paragraph in squad.data.into_iter().flat_map(|a| a.paragraphs) {
        for qa in paragraph.qas {
            let language = qa
                .id
                .split('-')
                .next()
                .unwrap_or_default()
                .to_string();
            if english_only && language != "english" {
                continue;
            }
            examples.push(QaExample {
                id: qa.id,
                language,
                context: paragraph.context.clone(),
                question: qa.question,
                answers: qa.answers.into_iter().map(|a| a.text).collect(),
            });
        }
    }
    if examples.is_empty() {
        bail!("No questions found in {}", path.display());
    }
    info!("Loaded {} questions from {}", examples.len(), path.display());
    Ok(examples)
}

/// A multiple-choice question with the index of the right choice.
#[derive(Debug, Clone, PartialEq)]
pub struct ChoiceQuestion {
    pub id: usize,
    pub subject: String,
    pub question: String,
    pub choices: Vec<String>,
    pub answer_index: usize,
}

#[derive(Debug)]
pub struct ParquetDatasetLoader {
    path: PathBuf,
    batch_size: usize,
}

impl ParquetDatasetLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            batch_size: 1024,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Reads `question`, `subject`, `choices` (list of strings) and `answer` (index) columns.
    pub fn load_choice_questions(&self) -> Result<Vec<ChoiceQuestion>> {
        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open dataset file {}", self.path.display()))?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)
            .context("Failed to create parquet reader")?
            .with_batch_size(self.batch_size)
            .build()
            .context("Failed to build parquet reader")?;

        let mut entries = Vec::new();
        for batch_result in reader {
            let batch = batch_result.context("Failed to read record batch")?;
            let questions = string_column(batch.column_by_name("question"), "question")?;
            let subjects = string_column(batch.column_by_name("subject"), "subject")?;
            let choices = batch
                .column_by_name("choices")
                .context("Missing choices column")?;
            let answers = batch
                .column_by_name("answer")
                .context("Missing answer column")?
                .as_any()
                .downcast_ref::<Int64Array>()
                .context("Failed to get answer column as Int64Array")?;

            for row in 0..batch.num_rows() {
                let question = valid_string(questions, row).context("Question is null")?;
                let subject = valid_string(subjects, row).context("Subject is null")?;
                let choices = Self::extract_choices(choices, row)?;
                let answer_index = answers
                    .is_valid(row)
                    .then(|| answers.value(row))
                    .context("Answer is null")?;
                let answer_index = usize::try_from(answer_index)
                    .ok()
                    .filter(|&i| i < choices.len())
                    .with_context(|| format!("Answer index {answer_index} out of bounds"))?;

                entries.push(ChoiceQuestion {
                    id: entries.len(),
                    subject,
                    question,
                    choices,
                    answer_index,
                });
            }
        }

        if entries.is_empty() {
            bail!("No entries found in {}", self.path.display());
        }
        info!("Loaded {} entries from parquet dataset", entries.len());
        Ok(entries)
    }

    fn extract_choices(choices: &ArrayRef, row: usize) -> Result<Vec<String>> {
        let list = choices
            .as_any()
            .downcast_ref::<ListArray>()
            .context("Choices column is not a list array")?;
        if !list.is_valid(row) {
            bail!("Choices list is null at row {}", row);
        }
        let values = list.value(row);
        let strings = values
            .as_any()
            .downcast_ref::<StringArray>()
            .context("Choices values are not strings")?;
        (0..strings.len())
            .map(|i| valid_string(strings, i).with_context(|| format!("Choice {i} is null")))
            .collect()
    }
}

fn string_column<'b>(column: Option<&'b ArrayRef>, name: &str) -> Result<&'b StringArray> {
    column
        .with_context(|| format!("Missing {name} column"))?
        .as_any()
        .downcast_ref::<StringArray>()
        .with_context(|| format!("Failed to get {name} column as StringArray"))
}

fn valid_string(array: &StringArray, row: usize) -> Option<String> {
    array.is_valid(row).then(|| array.value(row).to_string())
}
