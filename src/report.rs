//! Persistence for evaluation reports.
//!
//! A run produces:
//! - `{stem}__eval.csv`: one row per sample,
//! - `{stem}__eval.summary.json`: identity, counts and per-criterion statistics,
//! - optionally a full snapshot of the [`RunReport`] in JSON or bincode.

use crate::aggregate::{RunReport, RunSummary, Skipped, aggregate, print_run_summary};
use crate::error::{EvalError, Result};
use crate::identity::{IdentitySource, RunIdentity, resolve};
use crate::rubric::{Criterion, CriterionScore};
use crate::scorer::{CriterionFailure, CriterionOutcome, SampleEvaluation};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Save format for report snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveFormat {
    /// JSON format (human-readable, larger).
    Json,
    /// Bincode format (binary, compact).
    Bincode,
}

impl SaveFormat {
    /// Determine format from file extension.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => SaveFormat::Json,
            Some("bin") | Some("bincode") => SaveFormat::Bincode,
            _ => SaveFormat::Json, // Default to JSON
        }
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| EvalError::io(parent, e))?;
        }
    }
    Ok(())
}

/// Save a full report snapshot, format chosen by extension.
pub fn save_report(report: &RunReport, path: &Path) -> Result<()> {
    save_report_with_format(report, path, SaveFormat::from_path(path))
}

/// Save a full report snapshot with specific format.
pub fn save_report_with_format(report: &RunReport, path: &Path, format: SaveFormat) -> Result<()> {
    ensure_parent(path)?;

    let data = match format {
        SaveFormat::Json => serde_json::to_string_pretty(report)
            .map_err(|e| EvalError::Serialization(e.to_string()))?
            .into_bytes(),
        SaveFormat::Bincode => {
            let config = bincode::config::standard();
            bincode::encode_to_vec(report, config)
                .map_err(|e| EvalError::Serialization(e.to_string()))?
        }
    };

    fs::write(path, &data).map_err(|e| EvalError::io(path, e))?;
    Ok(())
}

/// Load a full report snapshot.
pub fn load_report(path: &Path) -> Result<RunReport> {
    let data = fs::read(path).map_err(|e| EvalError::io(path, e))?;

    let report = match SaveFormat::from_path(path) {
        SaveFormat::Json => serde_json::from_slice(&data)
            .map_err(|e| EvalError::Serialization(e.to_string()))?,
        SaveFormat::Bincode => {
            let config = bincode::config::standard();
            let (report, _): (RunReport, usize) = bincode::decode_from_slice(&data, config)
                .map_err(|e| EvalError::Serialization(e.to_string()))?;
            report
        }
    };

    Ok(report)
}

/// One row of the evaluation table.
#[derive(Debug, Serialize, Deserialize)]
struct EvalRow {
    image_id: String,
    reference_coverage_score: Option<f64>,
    reference_coverage_passed: Option<bool>,
    must_include_score: Option<f64>,
    must_include_passed: Option<bool>,
    overall_pass: Option<bool>,
    #[serde(default)]
    reference_coverage_rationale: String,
    #[serde(default)]
    must_include_rationale: String,
    #[serde(default)]
    reference_coverage_error: String,
    #[serde(default)]
    must_include_error: String,
}

/// Flattened columns of one outcome: score, passed, rationale, error.
fn outcome_columns(outcome: &CriterionOutcome) -> (Option<f64>, Option<bool>, String, String) {
    match outcome {
        CriterionOutcome::Scored(s) => (Some(s.score), Some(s.passed), s.rationale.clone(), String::new()),
        CriterionOutcome::Failed(f) => (None, None, String::new(), f.message.clone()),
    }
}

impl EvalRow {
    fn from_sample(sample: &SampleEvaluation) -> Self {
        let (rs, rp, rr, re) = outcome_columns(&sample.reference_coverage);
        let (ms, mp, mr, me) = outcome_columns(&sample.must_include);
        Self {
            image_id: sample.image_id.clone(),
            reference_coverage_score: rs,
            reference_coverage_passed: rp,
            must_include_score: ms,
            must_include_passed: mp,
            overall_pass: sample.overall_pass,
            reference_coverage_rationale: rr,
            must_include_rationale: mr,
            reference_coverage_error: re,
            must_include_error: me,
        }
    }

    fn into_sample(self, source: &Path) -> Result<SampleEvaluation> {
        let reference = rebuild_outcome(
            Criterion::ReferenceCoverage,
            self.reference_coverage_score,
            self.reference_coverage_passed,
            self.reference_coverage_rationale,
            self.reference_coverage_error,
        );
        let must_include = rebuild_outcome(
            Criterion::MustIncludeCoverage,
            self.must_include_score,
            self.must_include_passed,
            self.must_include_rationale,
            self.must_include_error,
        );

        match (reference, must_include) {
            (Some(r), Some(m)) => Ok(SampleEvaluation::new(self.image_id, r, m)),
            _ => Err(EvalError::MalformedResults {
                source_name: source.display().to_string(),
                message: format!("row '{}' has a score without a pass flag", self.image_id),
            }),
        }
    }
}

fn rebuild_outcome(
    criterion: Criterion,
    score: Option<f64>,
    passed: Option<bool>,
    rationale: String,
    error: String,
) -> Option<CriterionOutcome> {
    match (score, passed) {
        (Some(score), Some(passed)) => Some(CriterionOutcome::Scored(CriterionScore {
            criterion,
            score,
            rationale,
            passed,
        })),
        (None, _) => Some(CriterionOutcome::Failed(CriterionFailure {
            criterion,
            message: error,
        })),
        (Some(_), None) => None,
    }
}

/// Write the per-sample table into `dir`, named after the run identity.
pub fn write_eval_csv(report: &RunReport, dir: &Path) -> Result<PathBuf> {
    let path = dir.join(report.identity.eval_csv_name());
    ensure_parent(&path)?;

    let mut writer = csv::Writer::from_path(&path).map_err(|e| EvalError::Serialization(e.to_string()))?;
    for sample in &report.samples {
        writer
            .serialize(EvalRow::from_sample(sample))
            .map_err(|e| EvalError::Serialization(e.to_string()))?;
    }
    writer.flush().map_err(|e| EvalError::io(&path, e))?;

    Ok(path)
}

/// Read a per-sample table back into samples.
pub fn read_eval_csv(path: &Path) -> Result<Vec<SampleEvaluation>> {
    if !path.exists() {
        return Err(EvalError::ResultsNotFound(path.to_path_buf()));
    }

    let mut reader = csv::Reader::from_path(path).map_err(|e| EvalError::MalformedResults {
        source_name: path.display().to_string(),
        message: e.to_string(),
    })?;

    let mut samples = Vec::new();
    for (idx, row) in reader.deserialize::<EvalRow>().enumerate() {
        let row = row.map_err(|e| EvalError::MalformedResults {
            source_name: path.display().to_string(),
            message: format!("row {}: {}", idx + 1, e),
        })?;
        samples.push(row.into_sample(path)?);
    }

    Ok(samples)
}

/// Companion summary stored next to the evaluation table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSummary {
    pub identity: RunIdentity,
    pub summary: RunSummary,
    pub skipped: Skipped,
    pub evaluated_at: Option<String>,
}

impl From<&RunReport> for StoredSummary {
    fn from(report: &RunReport) -> Self {
        Self {
            identity: report.identity.clone(),
            summary: report.summary.clone(),
            skipped: report.skipped.clone(),
            evaluated_at: report.evaluated_at.clone(),
        }
    }
}

/// Write the summary JSON into `dir`.
pub fn write_summary(report: &RunReport, dir: &Path) -> Result<PathBuf> {
    let path = dir.join(report.identity.summary_name());
    ensure_parent(&path)?;

    let json = serde_json::to_string_pretty(&StoredSummary::from(report))
        .map_err(|e| EvalError::Serialization(e.to_string()))?;
    fs::write(&path, json).map_err(|e| EvalError::io(&path, e))?;
    Ok(path)
}

pub fn load_summary(path: &Path) -> Result<StoredSummary> {
    let content = fs::read_to_string(path).map_err(|e| EvalError::io(path, e))?;
    serde_json::from_str(&content).map_err(|e| EvalError::Serialization(e.to_string()))
}

/// Paths written for one run.
#[derive(Debug, Clone)]
pub struct RunOutputs {
    pub eval_csv: PathBuf,
    pub summary: PathBuf,
}

/// Write the evaluation table and its summary.
pub fn write_run_outputs(report: &RunReport, dir: &Path) -> Result<RunOutputs> {
    let eval_csv = write_eval_csv(report, dir)?;
    let summary = write_summary(report, dir)?;
    info!(
        run = %report.identity,
        eval_csv = %eval_csv.display(),
        summary = %summary.display(),
        "report written"
    );
    Ok(RunOutputs { eval_csv, summary })
}

/// Summary file that belongs to an evaluation table.
pub fn summary_path_for(eval_csv: &Path) -> PathBuf {
    eval_csv.with_extension("summary.json")
}

/// Rebuild a report from a stored evaluation table.
///
/// Identity and skip lists come from the companion summary when present;
/// otherwise identity is parsed from the file name. Statistics are always
/// recomputed from the rows.
pub fn load_stored_run(eval_csv: &Path) -> Result<RunReport> {
    let samples = read_eval_csv(eval_csv)?;
    let summary_path = summary_path_for(eval_csv);

    let (identity, skipped, evaluated_at) = if summary_path.exists() {
        let stored = load_summary(&summary_path)?;
        (stored.identity, stored.skipped, stored.evaluated_at)
    } else {
        let name = eval_csv
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        (resolve(IdentitySource::Filename(&name))?, Skipped::default(), None)
    };

    let mut report = aggregate(identity, samples, skipped);
    report.evaluated_at = evaluated_at;
    Ok(report)
}

/// Evaluation table a summary file was written next to.
pub fn eval_csv_for_summary(summary: &Path) -> PathBuf {
    let name = summary
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name.strip_suffix(".summary.json").unwrap_or(&name);
    summary.with_file_name(format!("{}.csv", stem))
}

/// A stored run, with per-sample rows when they are available.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredRun {
    Full(RunReport),
    /// Summary file whose evaluation table is gone.
    SummaryOnly(StoredSummary),
}

impl StoredRun {
    pub fn print_summary(&self) {
        match self {
            StoredRun::Full(report) => report.print_summary(),
            StoredRun::SummaryOnly(stored) => print_run_summary(&stored.identity, &stored.summary),
        }
    }
}

/// Load a stored run for display. A summary file is resolved to its
/// evaluation table when present, so statistics are recomputed from rows.
pub fn load_stored(path: &Path) -> Result<StoredRun> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if name.ends_with(".summary.json") {
        let table = eval_csv_for_summary(path);
        if table.exists() {
            load_stored_run(&table).map(StoredRun::Full)
        } else {
            load_summary(path).map(StoredRun::SummaryOnly)
        }
    } else if name.ends_with(".csv") {
        load_stored_run(path).map(StoredRun::Full)
    } else {
        load_report(path).map(StoredRun::Full)
    }
}

/// Load any stored form of a run: snapshot, summary or evaluation table.
pub fn load_any(path: &Path) -> Result<StoredSummary> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if name.ends_with(".summary.json") {
        load_summary(path)
    } else if name.ends_with(".csv") {
        load_stored_run(path).map(|r| StoredSummary::from(&r))
    } else {
        load_report(path).map(|r| StoredSummary::from(&r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn report() -> RunReport {
        let ok = |c: Criterion, s: f64| CriterionOutcome::Scored(CriterionScore::new(c, s, "fine, \"quoted\"", 0.5));
        let samples = vec![
            SampleEvaluation::new(
                "img_1",
                ok(Criterion::ReferenceCoverage, 0.9),
                ok(Criterion::MustIncludeCoverage, 0.4),
            ),
            SampleEvaluation::new(
                "img_2",
                CriterionOutcome::Failed(CriterionFailure {
                    criterion: Criterion::ReferenceCoverage,
                    message: "judge error: timeout".to_string(),
                }),
                ok(Criterion::MustIncludeCoverage, 1.0 / 3.0),
            ),
        ];
        let mut report = aggregate(
            RunIdentity::new("org/vlm", "saliency", "20250301_101500"),
            samples,
            Skipped {
                unmatched: vec!["img_9".to_string()],
                not_evaluated: vec![],
            },
        );
        report.evaluated_at = Some("2025-03-01T10:20:00+00:00".to_string());
        report
    }

    #[test]
    fn test_eval_csv_round_trip_reaggregates_identically() {
        let dir = TempDir::new().unwrap();
        let original = report();

        let outputs = write_run_outputs(&original, dir.path()).unwrap();
        assert_eq!(
            outputs.eval_csv.file_name().unwrap(),
            "org_vlm__saliency__20250301_101500__eval.csv"
        );
        assert_eq!(summary_path_for(&outputs.eval_csv), outputs.summary);

        let reloaded = load_stored_run(&outputs.eval_csv).unwrap();
        assert_eq!(reloaded.samples, original.samples);
        assert_eq!(reloaded.summary, original.summary);
        assert_eq!(reloaded.identity, original.identity);
        assert_eq!(reloaded.skipped, original.skipped);
    }

    #[test]
    fn test_stored_run_without_summary_uses_filename() {
        let dir = TempDir::new().unwrap();
        let original = report();
        let csv_path = write_eval_csv(&original, dir.path()).unwrap();

        let reloaded = load_stored_run(&csv_path).unwrap();
        assert_eq!(reloaded.identity, RunIdentity::new("org_vlm", "saliency", "20250301_101500"));
        assert_eq!(reloaded.summary.unmatched, 0);
        assert_eq!(reloaded.summary.reference_coverage, original.summary.reference_coverage);
    }

    #[test]
    fn test_snapshot_formats() {
        let dir = TempDir::new().unwrap();
        let original = report();

        for name in ["run.json", "run.bin"] {
            let path = dir.path().join(name);
            save_report(&original, &path).unwrap();
            let loaded = load_report(&path).unwrap();
            assert_eq!(loaded.identity, original.identity);
            assert_eq!(loaded.samples.len(), 2);
            assert_eq!(loaded.summary.partial, 1);
        }

        let bin = load_report(&dir.path().join("run.bin")).unwrap();
        assert_eq!(bin, original);
    }

    #[test]
    fn test_summary_file_resolves_to_its_table() {
        let dir = TempDir::new().unwrap();
        let original = report();
        let outputs = write_run_outputs(&original, dir.path()).unwrap();
        assert_eq!(eval_csv_for_summary(&outputs.summary), outputs.eval_csv);

        match load_stored(&outputs.summary).unwrap() {
            StoredRun::Full(loaded) => {
                assert_eq!(loaded.summary, original.summary);
                assert_eq!(loaded.samples.len(), 2);
            }
            other => panic!("expected full run, got {:?}", other),
        }

        fs::remove_file(&outputs.eval_csv).unwrap();
        match load_stored(&outputs.summary).unwrap() {
            StoredRun::SummaryOnly(stored) => {
                assert_eq!(stored.identity, original.identity);
                assert_eq!(stored.summary, original.summary);
            }
            other => panic!("expected summary only, got {:?}", other),
        }

        let snapshot = dir.path().join("run.report.json");
        save_report(&original, &snapshot).unwrap();
        assert_eq!(load_stored(&snapshot).unwrap(), StoredRun::Full(original));
    }

    #[test]
    fn test_format_detection() {
        assert_eq!(SaveFormat::from_path(Path::new("r.json")), SaveFormat::Json);
        assert_eq!(SaveFormat::from_path(Path::new("r.bin")), SaveFormat::Bincode);
        assert_eq!(SaveFormat::from_path(Path::new("r.bincode")), SaveFormat::Bincode);
        assert_eq!(SaveFormat::from_path(Path::new("r")), SaveFormat::Json);
    }

    #[test]
    fn test_load_any_dispatch() {
        let dir = TempDir::new().unwrap();
        let original = report();
        let outputs = write_run_outputs(&original, dir.path()).unwrap();

        for path in [&outputs.eval_csv, &outputs.summary] {
            let stored = load_any(path).unwrap();
            assert_eq!(stored.identity, original.identity);
            assert_eq!(stored.summary.evaluated, 2);
        }
    }

    #[test]
    fn test_read_missing_csv() {
        assert!(read_eval_csv(Path::new("/nonexistent/x__eval.csv")).is_err());
    }
}
