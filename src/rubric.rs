//! Rubric evaluation: one criterion, one candidate, one judge verdict.
//!
//! The judge is injected as a [`JudgeOracle`] handle. Its call is the only
//! side effect here and the only place a run can stall, so it is wrapped in
//! an optional deadline and a bounded retry on timeout. Any other judge
//! failure is reported as [`EvalError::Judge`]; no default score is invented.

use crate::annotations::render_checklist;
use crate::error::{EvalError, Result};
use crate::llm::Prompts;
use async_trait::async_trait;
use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The two scoring criteria.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode,
)]
#[serde(rename_all = "snake_case")]
pub enum Criterion {
    ReferenceCoverage,
    MustIncludeCoverage,
}

/// How a judge turns its assessment into a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoringMode {
    /// One overall score for the pair.
    Holistic,
    /// One verdict per checklist item; score is the fraction found.
    Checklist,
}

impl Criterion {
    pub const ALL: [Criterion; 2] = [Criterion::ReferenceCoverage, Criterion::MustIncludeCoverage];

    pub fn as_str(&self) -> &'static str {
        match self {
            Criterion::ReferenceCoverage => "reference_coverage",
            Criterion::MustIncludeCoverage => "must_include_coverage",
        }
    }

    pub fn scoring(&self) -> ScoringMode {
        match self {
            Criterion::ReferenceCoverage => ScoringMode::Holistic,
            Criterion::MustIncludeCoverage => ScoringMode::Checklist,
        }
    }

    /// The fixed rubric for this criterion.
    pub fn rubric(&self) -> Rubric {
        match self {
            Criterion::ReferenceCoverage => Rubric {
                criterion: *self,
                description: Prompts::reference_coverage_description(),
                evaluation_steps: Prompts::reference_coverage_steps(),
            },
            Criterion::MustIncludeCoverage => Rubric {
                criterion: *self,
                description: Prompts::must_include_description(),
                evaluation_steps: Prompts::must_include_steps(),
            },
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named criterion with its grading instructions.
#[derive(Debug, Clone, Copy)]
pub struct Rubric {
    pub criterion: Criterion,
    pub description: &'static str,
    pub evaluation_steps: &'static [&'static str],
}

/// What a candidate is graded against.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    /// Free-text reference description.
    Reference(&'a str),
    /// Must-include items, graded by set membership.
    Checklist(&'a [String]),
}

impl<'a> Target<'a> {
    /// Text form shown to the judge.
    pub fn render(&self) -> String {
        match self {
            Target::Reference(text) => text.to_string(),
            Target::Checklist(items) => render_checklist(items),
        }
    }

    pub fn checklist(&self) -> Option<&'a [String]> {
        match *self {
            Target::Reference(_) => None,
            Target::Checklist(items) => Some(items),
        }
    }
}

/// One grading request handed to the judge.
#[derive(Debug, Clone, Copy)]
pub struct JudgeRequest<'a> {
    pub criterion: Criterion,
    pub rubric_description: &'a str,
    pub evaluation_steps: &'a [&'a str],
    pub candidate: &'a str,
    /// Rendered target text.
    pub target: &'a str,
    /// Item list behind `target` for checklist criteria.
    pub checklist: Option<&'a [String]>,
}

/// Raw judge output. The rationale is diagnostic only.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeVerdict {
    pub score: f64,
    pub rationale: String,
}

/// The external grader.
#[async_trait]
pub trait JudgeOracle: Send + Sync {
    async fn judge(&self, request: &JudgeRequest<'_>) -> Result<JudgeVerdict>;
}

/// Score for one criterion on one sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct CriterionScore {
    pub criterion: Criterion,
    /// Always within [0, 1].
    pub score: f64,
    pub rationale: String,
    /// `score >= threshold` at evaluation time.
    pub passed: bool,
}

impl CriterionScore {
    pub fn new(criterion: Criterion, score: f64, rationale: impl Into<String>, threshold: f64) -> Self {
        let score = score.clamp(0.0, 1.0);
        Self {
            criterion,
            score,
            rationale: rationale.into(),
            passed: score >= threshold,
        }
    }
}

/// Deadline and retry settings for judge calls.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Per-call deadline; `None` waits indefinitely.
    pub timeout: Option<Duration>,
    /// Retries after a timeout. Zero means one attempt in total.
    pub max_retries: u32,
    /// Delay before the first retry; doubled each time.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Some(Duration::from_secs(60)),
            max_retries: 2,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Runs one rubric against one (candidate, target) pair.
#[derive(Clone)]
pub struct RubricEvaluator {
    oracle: Arc<dyn JudgeOracle>,
    policy: RetryPolicy,
}

impl RubricEvaluator {
    pub fn new(oracle: Arc<dyn JudgeOracle>, policy: RetryPolicy) -> Self {
        Self { oracle, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Grade `candidate` against `target` under `rubric`.
    pub async fn evaluate(
        &self,
        rubric: &Rubric,
        image_id: &str,
        candidate: &str,
        target: Target<'_>,
        threshold: f64,
    ) -> Result<CriterionScore> {
        let rendered = target.render();
        let request = JudgeRequest {
            criterion: rubric.criterion,
            rubric_description: rubric.description,
            evaluation_steps: rubric.evaluation_steps,
            candidate,
            target: &rendered,
            checklist: target.checklist(),
        };

        let verdict = self.call_with_retry(&request, image_id).await?;

        if !verdict.score.is_finite() {
            return Err(EvalError::Judge {
                criterion: rubric.criterion,
                image_id: image_id.to_string(),
                message: format!("non-numeric score {}", verdict.score),
            });
        }

        let score = CriterionScore::new(rubric.criterion, verdict.score, verdict.rationale, threshold);
        debug!(
            image_id,
            criterion = %rubric.criterion,
            score = score.score,
            passed = score.passed,
            "criterion scored"
        );
        Ok(score)
    }

    async fn call_with_retry(&self, request: &JudgeRequest<'_>, image_id: &str) -> Result<JudgeVerdict> {
        let mut attempt = 0u32;
        loop {
            match self.call_once(request, image_id).await {
                Err(err) if err.is_timeout() => {
                    if attempt >= self.policy.max_retries {
                        return Err(EvalError::Judge {
                            criterion: request.criterion,
                            image_id: image_id.to_string(),
                            message: format!("{} (gave up after {} attempts)", err, attempt + 1),
                        });
                    }
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        image_id,
                        criterion = %request.criterion,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "judge call timed out, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn call_once(&self, request: &JudgeRequest<'_>, image_id: &str) -> Result<JudgeVerdict> {
        let call = self.oracle.judge(request);
        let outcome = match self.policy.timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                EvalError::JudgeTimeout {
                    criterion: request.criterion,
                    image_id: image_id.to_string(),
                    timeout_ms: limit.as_millis() as u64,
                }
            })?,
            None => call.await,
        };

        outcome.map_err(|err| match err {
            EvalError::Judge { .. } | EvalError::JudgeTimeout { .. } => err,
            other => EvalError::Judge {
                criterion: request.criterion,
                image_id: image_id.to_string(),
                message: other.to_string(),
            },
        })
    }
}
