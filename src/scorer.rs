//! Per-sample scoring against both criteria.

use crate::annotations::AnnotationEntry;
use crate::error::{EvalError, Result};
use crate::generation::GenerationRecord;
use crate::rubric::{Criterion, CriterionScore, RubricEvaluator, Target};
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Pass thresholds per criterion.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Thresholds {
    pub reference_coverage: f64,
    pub must_include_coverage: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::uniform(0.5)
    }
}

impl Thresholds {
    pub fn uniform(threshold: f64) -> Self {
        Self {
            reference_coverage: threshold,
            must_include_coverage: threshold,
        }
    }

    pub fn for_criterion(&self, criterion: Criterion) -> f64 {
        match criterion {
            Criterion::ReferenceCoverage => self.reference_coverage,
            Criterion::MustIncludeCoverage => self.must_include_coverage,
        }
    }
}

/// Judge failure recorded in place of a score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct CriterionFailure {
    pub criterion: Criterion,
    pub message: String,
}

/// Result of one criterion on one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "snake_case")]
pub enum CriterionOutcome {
    Scored(CriterionScore),
    Failed(CriterionFailure),
}

impl CriterionOutcome {
    fn from_result(criterion: Criterion, result: Result<CriterionScore>) -> Self {
        match result {
            Ok(score) => CriterionOutcome::Scored(score),
            Err(err) => CriterionOutcome::Failed(CriterionFailure {
                criterion,
                message: err.to_string(),
            }),
        }
    }

    pub fn score(&self) -> Option<&CriterionScore> {
        match self {
            CriterionOutcome::Scored(score) => Some(score),
            CriterionOutcome::Failed(_) => None,
        }
    }

    pub fn failure(&self) -> Option<&CriterionFailure> {
        match self {
            CriterionOutcome::Scored(_) => None,
            CriterionOutcome::Failed(failure) => Some(failure),
        }
    }
}

/// Both criteria for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct SampleEvaluation {
    pub image_id: String,
    pub reference_coverage: CriterionOutcome,
    pub must_include: CriterionOutcome,
    /// `None` when either criterion failed.
    pub overall_pass: Option<bool>,
}

impl SampleEvaluation {
    /// Assemble a sample, deriving `overall_pass` from the two outcomes.
    pub fn new(
        image_id: impl Into<String>,
        reference_coverage: CriterionOutcome,
        must_include: CriterionOutcome,
    ) -> Self {
        let overall_pass = match (reference_coverage.score(), must_include.score()) {
            (Some(r), Some(m)) => Some(r.passed && m.passed),
            _ => None,
        };
        Self {
            image_id: image_id.into(),
            reference_coverage,
            must_include,
            overall_pass,
        }
    }

    pub fn outcome(&self, criterion: Criterion) -> &CriterionOutcome {
        match criterion {
            Criterion::ReferenceCoverage => &self.reference_coverage,
            Criterion::MustIncludeCoverage => &self.must_include,
        }
    }

    /// Some criterion failed, so the sample is neither pass nor fail.
    pub fn is_partial(&self) -> bool {
        self.overall_pass.is_none()
    }
}

/// Runs both rubrics for a sample.
#[derive(Clone)]
pub struct CoverageScorer {
    evaluator: RubricEvaluator,
    thresholds: Thresholds,
}

impl CoverageScorer {
    pub fn new(evaluator: RubricEvaluator, thresholds: Thresholds) -> Self {
        Self {
            evaluator,
            thresholds,
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Score one record against its annotation. Each criterion is attempted
    /// regardless of the other's outcome.
    pub async fn evaluate(
        &self,
        record: &GenerationRecord,
        entry: &AnnotationEntry,
    ) -> Result<SampleEvaluation> {
        if record.image_id != entry.image_id {
            return Err(EvalError::MalformedResults {
                source_name: record.model_name.clone(),
                message: format!(
                    "record '{}' paired with annotation '{}'",
                    record.image_id, entry.image_id
                ),
            });
        }

        let candidate = record.model_output.as_str();

        let reference = self
            .run(
                Criterion::ReferenceCoverage,
                &record.image_id,
                candidate,
                Target::Reference(&entry.reference_description),
            )
            .await;
        let must_include = self
            .run(
                Criterion::MustIncludeCoverage,
                &record.image_id,
                candidate,
                Target::Checklist(&entry.must_include),
            )
            .await;

        Ok(SampleEvaluation::new(record.image_id.clone(), reference, must_include))
    }

    async fn run(
        &self,
        criterion: Criterion,
        image_id: &str,
        candidate: &str,
        target: Target<'_>,
    ) -> CriterionOutcome {
        let rubric = criterion.rubric();
        let result = self
            .evaluator
            .evaluate(&rubric, image_id, candidate, target, self.thresholds.for_criterion(criterion))
            .await;

        if let Err(err) = &result {
            warn!(image_id, criterion = %criterion, error = %err, "criterion not scored");
        }
        CriterionOutcome::from_result(criterion, result)
    }
}
