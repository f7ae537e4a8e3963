//! Evaluation pipeline: match records to annotations, score them on a
//! bounded worker pool, aggregate.
//!
//! All input validation and identity resolution happens before the first
//! judge call. Samples share no mutable state, so they are scored
//! concurrently up to the configured limit. The judge endpoint is the only
//! shared resource.

use crate::aggregate::{RunReport, Skipped, aggregate};
use crate::annotations::{AnnotationEntry, AnnotationStore};
use crate::error::{EvalError, Result};
use crate::generation::{GenerationRecord, ResultSet, validate_records};
use crate::identity::{RunIdentity, RunMetadata, resolve_with_fallback};
use crate::scorer::{CoverageScorer, SampleEvaluation};
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Cooperative cancellation. Once set, no new sample is started.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Records split by whether an annotation exists for them.
#[derive(Debug)]
pub struct MatchedRecords<'a> {
    pub matched: Vec<(&'a GenerationRecord, &'a AnnotationEntry)>,
    pub unmatched: Vec<String>,
}

/// Pair each record with its annotation, in record order.
pub fn match_records<'a>(records: &'a [GenerationRecord], store: &'a AnnotationStore) -> MatchedRecords<'a> {
    let mut matched = Vec::with_capacity(records.len());
    let mut unmatched = Vec::new();

    for record in records {
        match store.get(&record.image_id) {
            Some(entry) => matched.push((record, entry)),
            None => unmatched.push(record.image_id.clone()),
        }
    }

    MatchedRecords { matched, unmatched }
}

/// Every record must belong to `identity`, and each image may appear once.
pub fn check_run_membership(identity: &RunIdentity, records: &[GenerationRecord]) -> Result<()> {
    let mut seen = HashSet::new();

    for record in records {
        if !identity.covers(record) {
            return Err(EvalError::MalformedResults {
                source_name: identity.file_stem(),
                message: format!(
                    "record '{}' comes from {} / {}, not from run {}",
                    record.image_id, record.model_name, record.prompt_version, identity
                ),
            });
        }
        if !seen.insert(record.image_id.as_str()) {
            return Err(EvalError::DuplicateRecord {
                image_id: record.image_id.clone(),
                model: record.model_name.clone(),
                prompt_version: record.prompt_version.clone(),
            });
        }
    }

    Ok(())
}

/// Scores result sets against an annotation store.
pub struct EvaluationPipeline {
    scorer: CoverageScorer,
    concurrency: usize,
}

impl EvaluationPipeline {
    /// `concurrency` is the number of samples in flight; 1 is sequential.
    pub fn new(scorer: CoverageScorer, concurrency: usize) -> Self {
        Self {
            scorer,
            concurrency: concurrency.max(1),
        }
    }

    /// Resolve identity for a loaded result set and evaluate it.
    ///
    /// Identity precedence: `overrides`, then the sidecar metadata, then
    /// values shared by all records, then the file name.
    pub async fn evaluate_result_set(
        &self,
        set: &ResultSet,
        store: &AnnotationStore,
        overrides: &RunMetadata,
        cancel: &CancelFlag,
    ) -> Result<RunReport> {
        let metadata = overrides
            .clone()
            .or(set.metadata.clone().unwrap_or_default())
            .or(RunMetadata::from_records(&set.records));
        let identity = resolve_with_fallback(Some(&metadata), &set.file_name())?;

        self.run(identity, &set.records, store, cancel).await
    }

    /// Evaluate records under a known identity.
    pub async fn run(
        &self,
        identity: RunIdentity,
        records: &[GenerationRecord],
        store: &AnnotationStore,
        cancel: &CancelFlag,
    ) -> Result<RunReport> {
        validate_records(&identity.file_stem(), records)?;
        check_run_membership(&identity, records)?;

        let MatchedRecords { matched, unmatched } = match_records(records, store);
        for image_id in &unmatched {
            warn!(%image_id, run = %identity, "no annotation for generation record, skipping");
        }

        let total = matched.len();
        info!(
            run = %identity,
            samples = total,
            unmatched = unmatched.len(),
            concurrency = self.concurrency,
            "starting evaluation"
        );

        let scorer = &self.scorer;
        let mut work = stream::iter(matched.into_iter().enumerate())
            .map(|(idx, (record, entry))| async move {
                if cancel.is_cancelled() {
                    return (idx, record.image_id.clone(), None);
                }
                let outcome = scorer.evaluate(record, entry).await;
                (idx, record.image_id.clone(), Some(outcome))
            })
            .buffer_unordered(self.concurrency);

        let mut finished: Vec<(usize, SampleEvaluation)> = Vec::with_capacity(total);
        let mut not_evaluated: Vec<(usize, String)> = Vec::new();

        while let Some((idx, image_id, outcome)) = work.next().await {
            match outcome {
                Some(sample) => {
                    let sample = sample?;
                    debug!(
                        %image_id,
                        completed = finished.len() + 1,
                        total,
                        overall_pass = ?sample.overall_pass,
                        "sample scored"
                    );
                    finished.push((idx, sample));
                }
                None => not_evaluated.push((idx, image_id)),
            }
        }

        finished.sort_by_key(|(idx, _)| *idx);
        not_evaluated.sort_by_key(|(idx, _)| *idx);

        if !not_evaluated.is_empty() {
            warn!(
                run = %identity,
                not_evaluated = not_evaluated.len(),
                "run cancelled before all samples were scored"
            );
        }

        let samples = finished.into_iter().map(|(_, s)| s).collect();
        let skipped = Skipped {
            unmatched,
            not_evaluated: not_evaluated.into_iter().map(|(_, id)| id).collect(),
        };

        let mut report = aggregate(identity, samples, skipped);
        report.evaluated_at = Some(chrono::Utc::now().to_rfc3339());

        info!(
            run = %report.identity,
            evaluated = report.summary.evaluated,
            passed = report.summary.passed,
            partial = report.summary.partial,
            unmatched = report.summary.unmatched,
            "evaluation finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rubric::{JudgeOracle, JudgeRequest, JudgeVerdict, RetryPolicy, RubricEvaluator};
    use crate::scorer::Thresholds;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Tracks the peak number of concurrent judge calls.
    #[derive(Default)]
    struct CountingJudge {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        cancel_on_first_call: Option<CancelFlag>,
    }

    #[async_trait]
    impl JudgeOracle for CountingJudge {
        async fn judge(&self, _request: &JudgeRequest<'_>) -> crate::error::Result<JudgeVerdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(flag) = &self.cancel_on_first_call {
                flag.cancel();
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(JudgeVerdict {
                score: 1.0,
                rationale: String::new(),
            })
        }
    }

    fn store(ids: &[&str]) -> AnnotationStore {
        AnnotationStore::from_entries(
            ids.iter()
                .map(|id| AnnotationEntry {
                    image_id: id.to_string(),
                    reference_description: format!("Reference for {}.", id),
                    must_include: vec!["title".to_string()],
                })
                .collect(),
        )
        .unwrap()
    }

    fn records(ids: &[&str]) -> Vec<GenerationRecord> {
        ids.iter()
            .map(|id| GenerationRecord::new(*id, "m", "v1", format!("Output for {}.", id)))
            .collect()
    }

    fn pipeline(judge: Arc<CountingJudge>, concurrency: usize) -> EvaluationPipeline {
        let evaluator = RubricEvaluator::new(judge, RetryPolicy::default());
        EvaluationPipeline::new(CoverageScorer::new(evaluator, Thresholds::default()), concurrency)
    }

    fn identity() -> RunIdentity {
        RunIdentity::new("m", "v1", "t0")
    }

    #[test]
    fn test_match_records() {
        let store = store(&["a", "b"]);
        let records = records(&["b", "x", "a"]);
        let matched = match_records(&records, &store);

        let ids: Vec<_> = matched.matched.iter().map(|(r, _)| r.image_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(matched.unmatched, vec!["x".to_string()]);
    }

    #[tokio::test]
    async fn test_sequential_by_default() {
        let judge = Arc::new(CountingJudge::default());
        let report = pipeline(judge.clone(), 1)
            .run(identity(), &records(&["a", "b", "c"]), &store(&["a", "b", "c"]), &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(report.summary.evaluated, 3);
        assert_eq!(judge.peak.load(Ordering::SeqCst), 1);
        assert_eq!(judge.calls.load(Ordering::SeqCst), 6);
        assert!(report.evaluated_at.is_some());
    }

    #[tokio::test]
    async fn test_concurrency_ceiling_and_order() {
        let ids = ["a", "b", "c", "d", "e", "f"];
        let judge = Arc::new(CountingJudge::default());
        let report = pipeline(judge.clone(), 2)
            .run(identity(), &records(&ids), &store(&ids), &CancelFlag::new())
            .await
            .unwrap();

        assert!(judge.peak.load(Ordering::SeqCst) <= 2);
        let order: Vec<_> = report.samples.iter().map(|s| s.image_id.as_str()).collect();
        assert_eq!(order, ids.to_vec());
    }

    #[tokio::test]
    async fn test_unmatched_records_are_counted_not_scored() {
        let judge = Arc::new(CountingJudge::default());
        let report = pipeline(judge.clone(), 1)
            .run(identity(), &records(&["a", "ghost"]), &store(&["a", "b"]), &CancelFlag::new())
            .await
            .unwrap();

        assert_eq!(report.summary.evaluated, 1);
        assert_eq!(report.summary.unmatched, 1);
        assert_eq!(report.skipped.unmatched, vec!["ghost".to_string()]);
        assert!(report.samples.iter().all(|s| s.image_id != "ghost"));
        assert_eq!(judge.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancel_stops_new_samples() {
        let cancel = CancelFlag::new();
        let judge = Arc::new(CountingJudge {
            cancel_on_first_call: Some(cancel.clone()),
            ..Default::default()
        });

        let report = pipeline(judge.clone(), 1)
            .run(identity(), &records(&["a", "b", "c"]), &store(&["a", "b", "c"]), &cancel)
            .await
            .unwrap();

        assert_eq!(report.summary.evaluated, 1);
        assert_eq!(report.samples[0].image_id, "a");
        assert_eq!(report.skipped.not_evaluated, vec!["b".to_string(), "c".to_string()]);
        assert_eq!(report.summary.not_evaluated, 2);
    }

    #[tokio::test]
    async fn test_invalid_input_fails_before_judging() {
        let judge = Arc::new(CountingJudge::default());
        let mut bad = records(&["a", "a"]);
        bad[1].model_output = "different".to_string();

        let err = pipeline(judge.clone(), 1)
            .run(identity(), &bad, &store(&["a"]), &CancelFlag::new())
            .await
            .unwrap_err();

        assert!(matches!(err, EvalError::DuplicateRecord { .. }));
        assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_result_set_identity_from_records_and_filename() {
        let judge = Arc::new(CountingJudge::default());
        let set = ResultSet {
            source: "runs/m__v1__20250101_000000.csv".into(),
            records: records(&["a"]),
            metadata: None,
        };

        let report = pipeline(judge, 1)
            .evaluate_result_set(&set, &store(&["a"]), &RunMetadata::default(), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(report.identity, RunIdentity::new("m", "v1", "20250101_000000"));
    }

    #[tokio::test]
    async fn test_unresolvable_identity_fails_before_judging() {
        let judge = Arc::new(CountingJudge::default());
        let set = ResultSet {
            source: "results.csv".into(),
            records: records(&["a"]),
            metadata: None,
        };

        let err = pipeline(judge.clone(), 1)
            .evaluate_result_set(&set, &store(&["a"]), &RunMetadata::default(), &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(err.is_data_error());
        assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_mixed_prompt_versions_fail_before_judging() {
        let judge = Arc::new(CountingJudge::default());
        let set = ResultSet {
            source: "m__v1__t0.csv".into(),
            records: vec![
                GenerationRecord::new("a", "m", "v1", "one"),
                GenerationRecord::new("a", "m", "v2", "two"),
            ],
            metadata: None,
        };

        let err = pipeline(judge.clone(), 1)
            .evaluate_result_set(&set, &store(&["a"]), &RunMetadata::default(), &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EvalError::MalformedResults { .. }));
        assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sidecar_contradicting_records_fails() {
        let judge = Arc::new(CountingJudge::default());
        let set = ResultSet {
            source: "results.csv".into(),
            records: records(&["a", "b"]),
            metadata: Some(RunMetadata {
                model: Some("other-model".into()),
                prompt_version: Some("v1".into()),
                timestamp: Some("t0".into()),
            }),
        };

        let err = pipeline(judge.clone(), 1)
            .evaluate_result_set(&set, &store(&["a", "b"]), &RunMetadata::default(), &CancelFlag::new())
            .await
            .unwrap_err();
        assert!(err.is_data_error());
        assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_sanitized_aliases_cannot_repeat_an_image() {
        let identity = RunIdentity::new("org_m", "v1", "t0");
        let records = vec![
            GenerationRecord::new("a", "org/m", "v1", "one"),
            GenerationRecord::new("a", "org_m", "v1", "two"),
        ];
        let err = check_run_membership(&identity, &records).unwrap_err();
        assert!(matches!(err, EvalError::DuplicateRecord { .. }));

        assert!(check_run_membership(&identity, &records[..1]).is_ok());
    }
}
