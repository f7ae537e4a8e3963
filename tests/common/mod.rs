//! Stub judges shared by integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use screen_eval::error::{EvalError, Result};
use screen_eval::rubric::{Criterion, JudgeOracle, JudgeRequest, JudgeVerdict};
use std::collections::HashMap;

/// Returns fixed (reference, must-include) scores keyed by candidate text.
pub struct TableJudge {
    scores: HashMap<String, (f64, f64)>,
}

impl TableJudge {
    pub fn new(entries: &[(&str, f64, f64)]) -> Self {
        Self {
            scores: entries
                .iter()
                .map(|(candidate, r, m)| (candidate.to_string(), (*r, *m)))
                .collect(),
        }
    }
}

#[async_trait]
impl JudgeOracle for TableJudge {
    async fn judge(&self, request: &JudgeRequest<'_>) -> Result<JudgeVerdict> {
        let (reference, must_include) = self
            .scores
            .get(request.candidate)
            .copied()
            .ok_or_else(|| EvalError::LlmParse(format!("no score for '{}'", request.candidate)))?;

        let score = match request.criterion {
            Criterion::ReferenceCoverage => reference,
            Criterion::MustIncludeCoverage => must_include,
        };
        Ok(JudgeVerdict {
            score,
            rationale: format!("table score {}", score),
        })
    }
}

/// Exact set membership: the fraction of must-include items that occur
/// verbatim in the candidate.
pub struct MembershipJudge;

#[async_trait]
impl JudgeOracle for MembershipJudge {
    async fn judge(&self, request: &JudgeRequest<'_>) -> Result<JudgeVerdict> {
        let items = request
            .checklist
            .ok_or_else(|| EvalError::LlmParse("membership judge needs a checklist".to_string()))?;
        if items.is_empty() {
            return Ok(JudgeVerdict {
                score: 1.0,
                rationale: "empty checklist".to_string(),
            });
        }

        let found = items.iter().filter(|item| request.candidate.contains(item.as_str())).count();
        Ok(JudgeVerdict {
            score: found as f64 / items.len() as f64,
            rationale: format!("{}/{} items present", found, items.len()),
        })
    }
}
