//! Generation result sets produced by the VLM step.
//!
//! A result set is a table with one row per described image:
//! `image_id, prompt_version, prompt, model, model_output`. CSV and JSON
//! (an array of row objects) are accepted. A file `X.csv` may carry its run
//! identity in a sidecar `X.meta.json`.

use crate::error::{EvalError, Result};
use crate::identity::RunMetadata;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// One produced description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub image_id: String,
    pub prompt_version: String,
    /// The exact prompt sent to the VLM.
    #[serde(rename = "prompt", default)]
    pub prompt_text: String,
    #[serde(rename = "model")]
    pub model_name: String,
    /// Trimmed model output.
    #[serde(default)]
    pub model_output: String,
}

impl GenerationRecord {
    pub fn new(
        image_id: impl Into<String>,
        model_name: impl Into<String>,
        prompt_version: impl Into<String>,
        model_output: impl Into<String>,
    ) -> Self {
        Self {
            image_id: image_id.into(),
            prompt_version: prompt_version.into(),
            prompt_text: String::new(),
            model_name: model_name.into(),
            model_output: model_output.into().trim().to_string(),
        }
    }
}

/// Row as read from disk, before validation.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRecord {
    image_id: String,
    prompt_version: String,
    prompt: String,
    model: String,
    model_output: String,
}

impl RawRecord {
    fn into_record(self) -> GenerationRecord {
        GenerationRecord {
            image_id: self.image_id.trim().to_string(),
            prompt_version: self.prompt_version.trim().to_string(),
            prompt_text: self.prompt,
            model_name: self.model.trim().to_string(),
            model_output: self.model_output.trim().to_string(),
        }
    }
}

/// Table format of a result file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableFormat {
    Csv,
    Json,
}

impl TableFormat {
    /// Determine format from file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => Some(TableFormat::Csv),
            Some(ext) if ext.eq_ignore_ascii_case("json") => Some(TableFormat::Json),
            _ => None,
        }
    }
}

/// A loaded result file with any sidecar metadata.
#[derive(Debug, Clone)]
pub struct ResultSet {
    pub source: PathBuf,
    pub records: Vec<GenerationRecord>,
    pub metadata: Option<RunMetadata>,
}

impl ResultSet {
    /// Load records and sidecar metadata, validating the records.
    pub fn load(path: &Path) -> Result<Self> {
        let records = load_results(path)?;
        let metadata = load_metadata_sidecar(path)?;
        Ok(Self {
            source: path.to_path_buf(),
            records,
            metadata,
        })
    }

    /// File name used for identity fallback.
    pub fn file_name(&self) -> String {
        self.source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Load and validate a generation result table.
pub fn load_results(path: &Path) -> Result<Vec<GenerationRecord>> {
    if !path.exists() {
        return Err(EvalError::ResultsNotFound(path.to_path_buf()));
    }

    let source_name = path.display().to_string();
    let malformed = |message: String| EvalError::MalformedResults {
        source_name: source_name.clone(),
        message,
    };

    let format = TableFormat::from_path(path)
        .ok_or_else(|| malformed("unsupported extension, expected .csv or .json".to_string()))?;

    let raw: Vec<RawRecord> = match format {
        TableFormat::Csv => {
            let mut reader = csv::ReaderBuilder::new()
                .has_headers(true)
                .from_path(path)
                .map_err(|e| malformed(e.to_string()))?;
            let mut rows = Vec::new();
            for (idx, row) in reader.deserialize().enumerate() {
                rows.push(row.map_err(|e| malformed(format!("row {}: {}", idx + 1, e)))?);
            }
            rows
        }
        TableFormat::Json => {
            let content = fs::read_to_string(path).map_err(|e| EvalError::io(path, e))?;
            serde_json::from_str(&content).map_err(|e| malformed(e.to_string()))?
        }
    };

    let records: Vec<GenerationRecord> = raw.into_iter().map(RawRecord::into_record).collect();
    validate_records(&source_name, &records)?;

    info!(path = %path.display(), records = records.len(), "loaded result set");
    Ok(records)
}

/// Check required fields and the one-record-per-(image, model, prompt) rule.
pub fn validate_records(source_name: &str, records: &[GenerationRecord]) -> Result<()> {
    let mut seen = HashSet::new();

    for (idx, record) in records.iter().enumerate() {
        for (field, value) in [
            ("image_id", &record.image_id),
            ("model", &record.model_name),
            ("prompt_version", &record.prompt_version),
        ] {
            if value.is_empty() {
                return Err(EvalError::MalformedResults {
                    source_name: source_name.to_string(),
                    message: format!("record {} has an empty '{}'", idx + 1, field),
                });
            }
        }

        let key = (
            record.image_id.as_str(),
            record.model_name.as_str(),
            record.prompt_version.as_str(),
        );
        if !seen.insert(key) {
            return Err(EvalError::DuplicateRecord {
                image_id: record.image_id.clone(),
                model: record.model_name.clone(),
                prompt_version: record.prompt_version.clone(),
            });
        }
    }

    Ok(())
}

/// Path of the metadata sidecar for a result file: `X.csv` -> `X.meta.json`.
pub fn sidecar_path(results: &Path) -> PathBuf {
    let stem = results
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    results.with_file_name(format!("{}.meta.json", stem))
}

/// Read the sidecar, if one exists.
pub fn load_metadata_sidecar(results: &Path) -> Result<Option<RunMetadata>> {
    let path = sidecar_path(results);
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(&path).map_err(|e| EvalError::io(&path, e))?;
    let metadata: RunMetadata =
        serde_json::from_str(&content).map_err(|e| EvalError::MalformedResults {
            source_name: path.display().to_string(),
            message: e.to_string(),
        })?;
    debug!(path = %path.display(), "loaded run metadata sidecar");
    Ok(Some(metadata))
}

/// Whether a file is a generation result table rather than one of our own outputs.
fn is_result_file(path: &Path) -> bool {
    if TableFormat::from_path(path).is_none() {
        return false;
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    !(name.contains("__eval") || name.ends_with(".meta.json") || name.ends_with(".summary.json"))
}

/// Expand files and directories into a sorted list of result files.
pub fn discover_result_files(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for input in inputs {
        if input.is_dir() {
            for entry in WalkDir::new(input).follow_links(true) {
                let entry = entry.map_err(|e| EvalError::io(input, e.into()))?;
                if entry.file_type().is_file() && is_result_file(entry.path()) {
                    files.push(entry.path().to_path_buf());
                }
            }
        } else if input.exists() {
            files.push(input.clone());
        } else {
            return Err(EvalError::ResultsNotFound(input.clone()));
        }
    }

    files.sort();
    files.dedup();
    Ok(files)
}
