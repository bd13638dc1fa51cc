//! Pipeline for encoding conversation datasets into token records.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::BindOptions;
use crate::encoder::{BoundTemplate, EncodedExample};
use crate::error::{Result, TemplateError};
use crate::example::{ConversationExample, RawExample};
use crate::stats::LengthStats;
use crate::truncation::TruncationStrategy;
use crate::Tokenizer;

/// A row from a CSV dataset. `history` holds a JSON list of `[query, response]`.
#[derive(Debug, Deserialize)]
struct CsvRow {
    query: String,
    response: Option<String>,
    system: Option<String>,
    history: Option<String>,
}

impl CsvRow {
    fn into_raw(self) -> Result<RawExample> {
        let history = match self.history.as_deref().map(str::trim) {
            Some(h) if !h.is_empty() => Some(serde_json::from_str(h)?),
            _ => None,
        };
        Ok(RawExample {
            query: Some(self.query),
            response: self.response.filter(|r| !r.is_empty()),
            system: self.system.filter(|s| !s.is_empty()),
            history,
            ..Default::default()
        })
    }
}

/// Configuration for the pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_length: Option<usize>,
    pub truncation_strategy: TruncationStrategy,
    /// Overrides the template's default system text.
    pub system: Option<String>,
    pub val_ratio: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_length: Some(2048),
            truncation_strategy: TruncationStrategy::Delete,
            system: None,
            val_ratio: 0.1,
        }
    }
}

impl PipelineConfig {
    pub fn bind_options(&self) -> BindOptions {
        BindOptions {
            default_system: self.system.clone(),
            max_length: self.max_length,
            truncation_strategy: self.truncation_strategy.clone(),
            ..Default::default()
        }
    }
}

/// Encoded records plus what was left out.
#[derive(Debug, Default)]
pub struct EncodedDataset {
    pub records: Vec<EncodedExample>,
    /// Dropped by the truncation strategy.
    pub dropped: usize,
    /// Failed to encode.
    pub failed: usize,
}

/// Result of writing an encoded dataset.
#[derive(Debug, Serialize)]
pub struct PipelineResult {
    pub total_examples: usize,
    pub train_examples: usize,
    pub val_examples: usize,
    pub dropped_examples: usize,
    pub failed_examples: usize,
    pub total_tokens: usize,
    pub length_stats: LengthStats,
}

/// Discover all `.jsonl` and `.csv` files under `root`, sorted.
pub fn discover_dataset_files(root: &Path) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .map_or(false, |ext| ext == "jsonl" || ext == "csv")
        })
        .map(|e| e.path().to_path_buf())
        .collect();
    paths.sort();
    paths
}

fn push_row(examples: &mut Vec<ConversationExample>, raw: Result<RawExample>, path: &Path, row: usize) {
    match raw.and_then(ConversationExample::try_from) {
        Ok(example) => examples.push(example),
        Err(e) => warn!(path = %path.display(), row, error = %e, "skipping row"),
    }
}

/// Load every example from one dataset file. Malformed rows are skipped.
pub fn load_examples(path: &Path) -> Result<Vec<ConversationExample>> {
    let mut examples = Vec::new();
    if path.extension().map_or(false, |ext| ext == "csv") {
        let mut reader = csv::Reader::from_path(path)?;
        for (row, result) in reader.deserialize::<CsvRow>().enumerate() {
            let raw = result.map_err(TemplateError::from).and_then(CsvRow::into_raw);
            push_row(&mut examples, raw, path, row + 1);
        }
    } else {
        let reader = BufReader::new(File::open(path)?);
        for (row, line) in reader.split(b'\n').enumerate() {
            let line = match String::from_utf8(line?) {
                Ok(line) => line,
                Err(e) => {
                    let raw = Err(TemplateError::InvalidExample(format!("invalid UTF-8: {e}")));
                    push_row(&mut examples, raw, path, row + 1);
                    continue;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let raw = serde_json::from_str::<RawExample>(&line).map_err(TemplateError::from);
            push_row(&mut examples, raw, path, row + 1);
        }
    }
    Ok(examples)
}

/// Load every dataset file under `root` in parallel.
pub fn load_all_examples(root: &Path) -> Result<Vec<ConversationExample>> {
    let files = discover_dataset_files(root);
    if files.is_empty() {
        return Err(TemplateError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no .jsonl or .csv files found under {}", root.display()),
        )));
    }

    let error_count = AtomicUsize::new(0);
    let per_file: Vec<Vec<ConversationExample>> = files
        .par_iter()
        .filter_map(|path| match load_examples(path) {
            Ok(examples) => Some(examples),
            Err(e) => {
                error_count.fetch_add(1, Ordering::Relaxed);
                warn!(path = %path.display(), error = %e, "failed to load dataset file");
                None
            }
        })
        .collect();

    let errors = error_count.load(Ordering::Relaxed);
    if errors > 0 {
        warn!("{} of {} files failed to load", errors, files.len());
    }
    Ok(per_file.into_iter().flatten().collect())
}

/// Encode `examples` in parallel, keeping input order.
pub fn encode_dataset<T>(examples: &[ConversationExample], template: &BoundTemplate<T>) -> EncodedDataset
where
    T: Tokenizer + Sync + Send,
{
    let total = examples.len();
    let processed = AtomicUsize::new(0);
    let dropped = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);

    let records: Vec<EncodedExample> = examples
        .par_iter()
        .enumerate()
        .filter_map(|(idx, example)| {
            let result = template.encode(example);
            let count = processed.fetch_add(1, Ordering::Relaxed) + 1;
            if count % 1000 == 0 || count == total {
                info!("Encoded {}/{} examples", count, total);
            }
            match result {
                Ok(Some((encoded, _))) => Some(encoded),
                Ok(None) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    None
                }
                Err(e) => {
                    failed.fetch_add(1, Ordering::Relaxed);
                    warn!(index = idx, error = %e, "failed to encode example");
                    None
                }
            }
        })
        .collect();

    EncodedDataset {
        records,
        dropped: dropped.into_inner(),
        failed: failed.into_inner(),
    }
}

/// Write encoded records to `training.jsonl` and `validation.jsonl`.
pub fn write_jsonl_output(dataset: EncodedDataset, output_dir: &Path, val_ratio: f64) -> Result<PipelineResult> {
    std::fs::create_dir_all(output_dir)?;

    // Deterministic shuffle keyed on the original index.
    let mut records: Vec<_> = dataset.records.into_iter().enumerate().collect();
    records.sort_by_key(|(i, _)| ((i * 2654435761) % 1000, *i));

    let total_examples = records.len();
    let val_count = (total_examples as f64 * val_ratio).round() as usize;
    let train_count = total_examples - val_count.min(total_examples);

    let mut train_file = BufWriter::new(File::create(output_dir.join("training.jsonl"))?);
    let mut val_file = BufWriter::new(File::create(output_dir.join("validation.jsonl"))?);

    let mut lengths = Vec::with_capacity(total_examples);
    for (idx, (_, record)) in records.into_iter().enumerate() {
        let json_line = serde_json::to_string(&record)?;
        if idx >= train_count {
            writeln!(val_file, "{}", json_line)?;
        } else {
            writeln!(train_file, "{}", json_line)?;
        }
        lengths.push(record.len());
    }

    train_file.flush()?;
    val_file.flush()?;

    Ok(PipelineResult {
        total_examples,
        train_examples: train_count,
        val_examples: total_examples - train_count,
        dropped_examples: dataset.dropped,
        failed_examples: dataset.failed,
        total_tokens: lengths.iter().sum(),
        length_stats: LengthStats::from_lengths(&lengths),
    })
}
