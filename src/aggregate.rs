//! Run-level aggregation of sample evaluations.
//!
//! Statistics are a pure function of the multiset of samples: scores are
//! sorted before summation, so permuting the input yields bit-identical
//! means and rates.

use crate::annotations::AnnotationStore;
use crate::identity::RunIdentity;
use crate::rubric::Criterion;
use crate::scorer::{CriterionOutcome, SampleEvaluation};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// Statistics for one criterion across a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct CriterionStats {
    pub criterion: Criterion,
    /// Samples on which the criterion was attempted, including judge errors.
    pub attempted: usize,
    /// Samples that produced a score.
    pub scored: usize,
    /// Samples whose judge call failed.
    pub errors: usize,
    pub passed: usize,
    /// Mean over scored samples; errors excluded.
    pub mean_score: Option<f64>,
    /// `passed / attempted`.
    pub pass_rate: Option<f64>,
}

impl CriterionStats {
    fn compute(criterion: Criterion, samples: &[SampleEvaluation]) -> Self {
        let mut scores = Vec::with_capacity(samples.len());
        let mut passed = 0;
        let mut errors = 0;

        for sample in samples {
            match sample.outcome(criterion) {
                CriterionOutcome::Scored(score) => {
                    scores.push(score.score);
                    if score.passed {
                        passed += 1;
                    }
                }
                CriterionOutcome::Failed(_) => errors += 1,
            }
        }

        let attempted = samples.len();
        Self {
            criterion,
            attempted,
            scored: scores.len(),
            errors,
            passed,
            mean_score: order_independent_mean(&mut scores),
            pass_rate: (attempted > 0).then(|| passed as f64 / attempted as f64),
        }
    }
}

fn order_independent_mean(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_by(f64::total_cmp);
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Counts and per-criterion statistics for a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct RunSummary {
    /// Samples scored (pass + fail + partial).
    pub evaluated: usize,
    pub passed: usize,
    pub failed: usize,
    /// Samples with at least one criterion error.
    pub partial: usize,
    /// Records with no annotation.
    pub unmatched: usize,
    /// Matched records never scored because the run was cancelled.
    pub not_evaluated: usize,
    pub reference_coverage: CriterionStats,
    pub must_include: CriterionStats,
}

impl RunSummary {
    pub fn criterion(&self, criterion: Criterion) -> &CriterionStats {
        match criterion {
            Criterion::ReferenceCoverage => &self.reference_coverage,
            Criterion::MustIncludeCoverage => &self.must_include,
        }
    }

    /// Some samples are partial, unmatched or not evaluated, so the means do
    /// not cover the whole result set.
    pub fn is_incomplete(&self) -> bool {
        self.partial > 0 || self.unmatched > 0 || self.not_evaluated > 0
    }
}

/// Records that did not become samples.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Skipped {
    pub unmatched: Vec<String>,
    pub not_evaluated: Vec<String>,
}

/// Output of one evaluation pass over a result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct RunReport {
    pub identity: RunIdentity,
    /// One per matched and scored image.
    pub samples: Vec<SampleEvaluation>,
    pub summary: RunSummary,
    pub skipped: Skipped,
    /// RFC 3339 time the evaluation finished, when known.
    pub evaluated_at: Option<String>,
}

impl RunReport {
    /// Print summary to stdout.
    pub fn print_summary(&self) {
        print_run_summary(&self.identity, &self.summary);
    }
}

/// Print a run's counts and statistics to stdout.
pub fn print_run_summary(identity: &RunIdentity, summary: &RunSummary) {
    let s = summary;
    let pct = |n: usize| {
        if s.evaluated > 0 {
            n as f64 / s.evaluated as f64 * 100.0
        } else {
            0.0
        }
    };

    println!("\n========== Evaluation Report ==========");
    println!("Model:          {}", identity.model);
    println!("Prompt version: {}", identity.prompt_version);
    println!("Timestamp:      {}", identity.timestamp);
    println!("----------------------------------------");
    println!("Evaluated:      {}", s.evaluated);
    println!("  Pass:         {} ({:.1}%)", s.passed, pct(s.passed));
    println!("  Fail:         {} ({:.1}%)", s.failed, pct(s.failed));
    println!("  Partial:      {} ({:.1}%)", s.partial, pct(s.partial));
    println!("Unmatched:      {}", s.unmatched);
    println!("Not evaluated:  {}", s.not_evaluated);
    println!("----------------------------------------");
    for stats in [&s.reference_coverage, &s.must_include] {
        println!(
            "{:<22} mean {}  pass rate {}  errors {}",
            stats.criterion.as_str(),
            stats
                .mean_score
                .map(|m| format!("{:.3}", m))
                .unwrap_or_else(|| "n/a".to_string()),
            stats
                .pass_rate
                .map(|r| format!("{:.1}%", r * 100.0))
                .unwrap_or_else(|| "n/a".to_string()),
            stats.errors
        );
    }
    if s.is_incomplete() {
        println!("----------------------------------------");
        println!("Note: means cover scored samples only, not the full result set.");
    }
    println!("========================================\n");
}

/// Build a report from scored samples and the records that were skipped.
pub fn aggregate(identity: RunIdentity, samples: Vec<SampleEvaluation>, skipped: Skipped) -> RunReport {
    let passed = samples.iter().filter(|s| s.overall_pass == Some(true)).count();
    let failed = samples.iter().filter(|s| s.overall_pass == Some(false)).count();
    let partial = samples.iter().filter(|s| s.is_partial()).count();

    let summary = RunSummary {
        evaluated: samples.len(),
        passed,
        failed,
        partial,
        unmatched: skipped.unmatched.len(),
        not_evaluated: skipped.not_evaluated.len(),
        reference_coverage: CriterionStats::compute(Criterion::ReferenceCoverage, &samples),
        must_include: CriterionStats::compute(Criterion::MustIncludeCoverage, &samples),
    };

    RunReport {
        identity,
        samples,
        summary,
        skipped,
        evaluated_at: None,
    }
}

/// Drop samples with no annotation, returning their ids. Used when
/// re-aggregating stored samples against a (possibly changed) annotation set.
pub fn exclude_unmatched(
    samples: Vec<SampleEvaluation>,
    store: &AnnotationStore,
) -> (Vec<SampleEvaluation>, Vec<String>) {
    let (matched, unmatched): (Vec<_>, Vec<_>) =
        samples.into_iter().partition(|s| store.contains(&s.image_id));
    (matched, unmatched.into_iter().map(|s| s.image_id).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::AnnotationEntry;
    use crate::rubric::CriterionScore;
    use crate::scorer::CriterionFailure;

    fn scored(criterion: Criterion, score: f64) -> CriterionOutcome {
        CriterionOutcome::Scored(CriterionScore::new(criterion, score, "ok", 0.5))
    }

    fn failed(criterion: Criterion) -> CriterionOutcome {
        CriterionOutcome::Failed(CriterionFailure {
            criterion,
            message: "judge error".to_string(),
        })
    }

    fn sample(id: &str, reference: f64, must: f64) -> SampleEvaluation {
        SampleEvaluation::new(
            id,
            scored(Criterion::ReferenceCoverage, reference),
            scored(Criterion::MustIncludeCoverage, must),
        )
    }

    fn identity() -> RunIdentity {
        RunIdentity::new("model", "v1", "t0")
    }

    #[test]
    fn test_means_and_counts() {
        let report = aggregate(
            identity(),
            vec![sample("a", 0.9, 0.4), sample("b", 1.0, 1.0)],
            Skipped {
                unmatched: vec!["zzz".to_string()],
                not_evaluated: vec![],
            },
        );

        let s = &report.summary;
        assert_eq!(s.evaluated, 2);
        assert_eq!(s.passed, 1);
        assert_eq!(s.failed, 1);
        assert_eq!(s.partial, 0);
        assert_eq!(s.unmatched, 1);
        assert!((s.reference_coverage.mean_score.unwrap() - 0.95).abs() < 1e-12);
        assert!((s.must_include.mean_score.unwrap() - 0.7).abs() < 1e-12);
        assert_eq!(s.must_include.pass_rate, Some(0.5));
        assert_eq!(s.reference_coverage.pass_rate, Some(1.0));
    }

    #[test]
    fn test_errors_excluded_from_mean_but_counted() {
        let partial = SampleEvaluation::new(
            "c",
            failed(Criterion::ReferenceCoverage),
            scored(Criterion::MustIncludeCoverage, 0.2),
        );
        let report = aggregate(identity(), vec![sample("a", 0.8, 1.0), partial], Skipped::default());

        let reference = &report.summary.reference_coverage;
        assert_eq!(reference.attempted, 2);
        assert_eq!(reference.scored, 1);
        assert_eq!(reference.errors, 1);
        assert_eq!(reference.mean_score, Some(0.8));
        assert_eq!(reference.pass_rate, Some(0.5));

        assert_eq!(report.summary.partial, 1);
        assert_eq!(report.summary.passed, 1);
        assert_eq!(report.summary.failed, 0);
        assert!(report.summary.is_incomplete());
    }

    #[test]
    fn test_empty_run() {
        let report = aggregate(identity(), vec![], Skipped::default());
        assert_eq!(report.summary.evaluated, 0);
        assert_eq!(report.summary.reference_coverage.mean_score, None);
        assert_eq!(report.summary.reference_coverage.pass_rate, None);
        assert!(!report.summary.is_incomplete());
    }

    #[test]
    fn test_exclude_unmatched() {
        let store = AnnotationStore::from_entries(vec![AnnotationEntry {
            image_id: "a".to_string(),
            reference_description: "r".to_string(),
            must_include: vec![],
        }])
        .unwrap();

        let (kept, dropped) = exclude_unmatched(vec![sample("a", 1.0, 1.0), sample("x", 1.0, 1.0)], &store);
        assert_eq!(kept.len(), 1);
        assert_eq!(dropped, vec!["x".to_string()]);
    }

    #[test]
    fn test_reversed_input_gives_identical_summary() {
        let samples = vec![
            sample("a", 0.1, 0.3),
            sample("b", 0.7, 0.2),
            sample("c", 0.3, 0.9),
        ];
        let mut reversed = samples.clone();
        reversed.reverse();

        let forward = aggregate(identity(), samples, Skipped::default());
        let backward = aggregate(identity(), reversed, Skipped::default());
        assert_eq!(forward.summary, backward.summary);
    }
}
