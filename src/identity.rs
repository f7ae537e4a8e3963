//! Run identity: which model and prompt variant produced a result set, and when.
//!
//! Identity comes from explicit metadata when the producer wrote it, and
//! otherwise from the file name pattern `{model}__{prompt_version}__{timestamp}`
//! (optionally followed by `__eval` and an extension). Slashes in model names
//! are replaced by underscores when building file names; the mapping is not
//! reversible, so a model parsed from a file name is the sanitized form.

use crate::error::{EvalError, Result};
use crate::generation::GenerationRecord;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

const SEPARATOR: &str = "__";
const EVAL_SUFFIX: &str = "__eval";

/// Resolved identity of one evaluation run.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode,
)]
pub struct RunIdentity {
    pub model: String,
    pub prompt_version: String,
    pub timestamp: String,
}

impl RunIdentity {
    pub fn new(
        model: impl Into<String>,
        prompt_version: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Self {
        Self {
            model: model.into(),
            prompt_version: prompt_version.into(),
            timestamp: timestamp.into(),
        }
    }

    /// `{sanitized model}__{prompt_version}__{timestamp}`.
    pub fn file_stem(&self) -> String {
        [
            sanitize_model_name(&self.model).as_str(),
            self.prompt_version.as_str(),
            self.timestamp.as_str(),
        ]
        .join(SEPARATOR)
    }

    /// Whether a record was produced under this identity. Models compare in
    /// sanitized form because an identity read from a file name has no other.
    pub fn covers(&self, record: &GenerationRecord) -> bool {
        record.prompt_version == self.prompt_version
            && sanitize_model_name(&record.model_name) == sanitize_model_name(&self.model)
    }

    /// Name of the per-sample evaluation table.
    pub fn eval_csv_name(&self) -> String {
        format!("{}{}.csv", self.file_stem(), EVAL_SUFFIX)
    }

    /// Name of the companion summary file.
    pub fn summary_name(&self) -> String {
        format!("{}{}.summary.json", self.file_stem(), EVAL_SUFFIX)
    }
}

impl fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} / {} @ {}", self.model, self.prompt_version, self.timestamp)
    }
}

/// Identity fields carried alongside a result table. Any field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunMetadata {
    pub model: Option<String>,
    pub prompt_version: Option<String>,
    pub timestamp: Option<String>,
}

impl RunMetadata {
    /// Model and prompt version shared by every record, if they all agree.
    pub fn from_records(records: &[GenerationRecord]) -> Self {
        let unanimous = |field: fn(&GenerationRecord) -> &str| {
            let first = field(records.first()?);
            records
                .iter()
                .all(|r| field(r) == first)
                .then(|| first.to_string())
        };

        Self {
            model: unanimous(|r| r.model_name.as_str()),
            prompt_version: unanimous(|r| r.prompt_version.as_str()),
            timestamp: None,
        }
    }

    /// Fill fields missing here from `other`.
    pub fn or(self, other: RunMetadata) -> Self {
        Self {
            model: self.model.or(other.model),
            prompt_version: self.prompt_version.or(other.prompt_version),
            timestamp: self.timestamp.or(other.timestamp),
        }
    }

    pub fn is_complete(&self) -> bool {
        [&self.model, &self.prompt_version, &self.timestamp]
            .iter()
            .all(|f| f.as_deref().is_some_and(|v| !v.is_empty()))
    }
}

/// Where an identity is read from.
#[derive(Debug, Clone, Copy)]
pub enum IdentitySource<'a> {
    Metadata(&'a RunMetadata),
    Filename(&'a str),
}

/// Resolve an identity from a single source.
pub fn resolve(source: IdentitySource<'_>) -> Result<RunIdentity> {
    match source {
        IdentitySource::Metadata(metadata) => from_metadata(metadata),
        IdentitySource::Filename(name) => parse_filename(name),
    }
}

/// Prefer metadata; fill whatever it lacks from the file name.
pub fn resolve_with_fallback(metadata: Option<&RunMetadata>, file_name: &str) -> Result<RunIdentity> {
    let metadata = metadata.cloned().unwrap_or_default();
    if metadata.is_complete() {
        return from_metadata(&metadata);
    }

    let parsed = parse_filename(file_name)?;
    let merged = metadata.or(RunMetadata {
        model: Some(parsed.model),
        prompt_version: Some(parsed.prompt_version),
        timestamp: Some(parsed.timestamp),
    });
    from_metadata(&merged)
}

fn from_metadata(metadata: &RunMetadata) -> Result<RunIdentity> {
    let field = |value: &Option<String>, name: &str| {
        value
            .as_deref()
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .ok_or_else(|| EvalError::UnresolvedIdentity(format!("metadata lacks '{}'", name)))
    };

    Ok(RunIdentity {
        model: field(&metadata.model, "model")?,
        prompt_version: field(&metadata.prompt_version, "prompt_version")?,
        timestamp: field(&metadata.timestamp, "timestamp")?,
    })
}

/// Strip directories, extensions and the evaluation suffix from a file name.
fn identity_stem(name: &str) -> &str {
    let mut stem = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(name);

    for ext in [".csv", ".json", ".bin", ".bincode"] {
        if let Some(s) = stem.strip_suffix(ext) {
            stem = s;
            break;
        }
    }
    for marker in [".summary", ".meta", ".report"] {
        if let Some(s) = stem.strip_suffix(marker) {
            stem = s;
            break;
        }
    }
    stem.strip_suffix(EVAL_SUFFIX).unwrap_or(stem)
}

fn parse_filename(name: &str) -> Result<RunIdentity> {
    let stem = identity_stem(name);
    let parts: Vec<&str> = stem.split(SEPARATOR).collect();

    match parts.as_slice() {
        [model, prompt_version, timestamp]
            if !model.is_empty() && !prompt_version.is_empty() && !timestamp.is_empty() =>
        {
            Ok(RunIdentity::new(*model, *prompt_version, *timestamp))
        }
        _ => Err(EvalError::UnresolvedIdentity(format!(
            "'{}' does not match {{model}}__{{prompt_version}}__{{timestamp}}",
            name
        ))),
    }
}

/// Make a model name safe for use in a file name.
pub fn sanitize_model_name(model: &str) -> String {
    model.replace(['/', '\\'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_round_trip_is_lossy_for_slashes() {
        let identity = RunIdentity::new("a/b", "saliency", "20250301_101500");
        let name = identity.eval_csv_name();
        assert_eq!(name, "a_b__saliency__20250301_101500__eval.csv");

        let resolved = resolve(IdentitySource::Filename(&name)).unwrap();
        assert_eq!(resolved, RunIdentity::new("a_b", "saliency", "20250301_101500"));
        assert_ne!(resolved.model, identity.model);
    }

    #[test]
    fn test_parse_accepts_result_and_summary_names() {
        for name in [
            "qwen__v2__t1.csv",
            "runs/qwen__v2__t1.json",
            "qwen__v2__t1__eval.summary.json",
            "qwen__v2__t1__eval.bin",
            "qwen__v2__t1__eval.report.json",
        ] {
            let id = resolve(IdentitySource::Filename(name)).unwrap();
            assert_eq!(id, RunIdentity::new("qwen", "v2", "t1"), "{}", name);
        }
    }

    #[test]
    fn test_parse_is_strict() {
        for name in [
            "qwen__v2.csv",
            "qwen__v2__t1__extra.csv",
            "qwen____t1.csv",
            "plain.csv",
        ] {
            let err = resolve(IdentitySource::Filename(name)).unwrap_err();
            assert!(matches!(err, EvalError::UnresolvedIdentity(_)), "{}", name);
        }
    }

    #[test]
    fn test_metadata_preferred_over_filename() {
        let metadata = RunMetadata {
            model: Some("org/model-7b".into()),
            prompt_version: Some("saliency".into()),
            timestamp: Some("t9".into()),
        };
        let id = resolve_with_fallback(Some(&metadata), "org_model-7b__saliency__t1.csv").unwrap();
        assert_eq!(id.model, "org/model-7b");
        assert_eq!(id.timestamp, "t9");
    }

    #[test]
    fn test_partial_metadata_filled_from_filename() {
        let metadata = RunMetadata {
            model: Some("org/model-7b".into()),
            ..Default::default()
        };
        let id = resolve_with_fallback(Some(&metadata), "org_model-7b__saliency__t1.csv").unwrap();
        assert_eq!(id, RunIdentity::new("org/model-7b", "saliency", "t1"));

        assert!(resolve_with_fallback(Some(&metadata), "results.csv").is_err());
    }

    #[test]
    fn test_metadata_from_records() {
        let records = vec![
            GenerationRecord::new("a", "m", "v1", "x"),
            GenerationRecord::new("b", "m", "v2", "y"),
        ];
        let metadata = RunMetadata::from_records(&records);
        assert_eq!(metadata.model.as_deref(), Some("m"));
        assert_eq!(metadata.prompt_version, None);
        assert!(!metadata.is_complete());

        assert_eq!(RunMetadata::from_records(&[]), RunMetadata::default());
    }

    #[test]
    fn test_covers_compares_sanitized_model() {
        let from_file = RunIdentity::new("org_vlm-7b", "v1", "t0");
        assert!(from_file.covers(&GenerationRecord::new("a", "org/vlm-7b", "v1", "x")));
        assert!(!from_file.covers(&GenerationRecord::new("a", "org/vlm-7b", "v2", "x")));
        assert!(!from_file.covers(&GenerationRecord::new("a", "other", "v1", "x")));
    }

    #[test]
    fn test_incomplete_metadata_source() {
        let metadata = RunMetadata {
            model: Some("m".into()),
            prompt_version: Some("".into()),
            timestamp: Some("t".into()),
        };
        assert!(resolve(IdentitySource::Metadata(&metadata)).is_err());
    }
}
