//! Screen Eval - an LLM-judged benchmark harness for VLM screen descriptions.
//!
//! A vision-language model describes a fixed corpus of annotated screenshots.
//! This crate scores each description against a human-written reference and a
//! checklist of must-include elements, using a second model as judge, and
//! aggregates the scores into per-run reports that can be compared across
//! models and prompt variants.
//!
//! # Quick Start
//!
//! ```no_run
//! use screen_eval::{
//!     annotations::AnnotationStore,
//!     config::Config,
//!     generation::ResultSet,
//!     identity::RunMetadata,
//!     judge::LlmJudge,
//!     pipeline::{CancelFlag, EvaluationPipeline},
//!     report::write_run_outputs,
//!     rubric::RubricEvaluator,
//!     scorer::CoverageScorer,
//! };
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     config.validate()?;
//!
//!     let store = AnnotationStore::load(Path::new("annotations.json"))?;
//!     let results = ResultSet::load(Path::new("qwen__saliency__20250301_101500.csv"))?;
//!
//!     let judge = Arc::new(LlmJudge::from_config(config.judge.clone()));
//!     let evaluator = RubricEvaluator::new(judge, config.eval.retry_policy());
//!     let scorer = CoverageScorer::new(evaluator, config.eval.thresholds());
//!     let pipeline = EvaluationPipeline::new(scorer, config.eval.concurrency);
//!
//!     let report = pipeline
//!         .evaluate_result_set(&results, &store, &RunMetadata::default(), &CancelFlag::new())
//!         .await?;
//!     report.print_summary();
//!     write_run_outputs(&report, Path::new("reports"))?;
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - **AnnotationStore**: ground-truth reference descriptions and checklists
//! - **ResultSet**: one generation result table plus optional identity metadata
//! - **RubricEvaluator**: one criterion, one judge call (with timeout and retry)
//! - **CoverageScorer**: both criteria for one sample
//! - **EvaluationPipeline**: bounded worker pool over a result set
//! - **RunReport**: aggregated statistics, persisted by the `report` module

pub mod aggregate;
pub mod annotations;
pub mod config;
pub mod error;
pub mod generation;
pub mod identity;
pub mod judge;
pub mod llm;
pub mod pipeline;
pub mod report;
pub mod rubric;
pub mod scorer;

// Re-export commonly used types
pub use aggregate::{RunReport, RunSummary, aggregate};
pub use annotations::{AnnotationEntry, AnnotationStore};
pub use config::Config;
pub use error::{EvalError, Result};
pub use generation::{GenerationRecord, ResultSet};
pub use identity::{RunIdentity, RunMetadata};
pub use judge::LlmJudge;
pub use pipeline::{CancelFlag, EvaluationPipeline};
pub use rubric::{Criterion, CriterionScore, JudgeOracle, RubricEvaluator, Target};
pub use scorer::{CoverageScorer, SampleEvaluation};
