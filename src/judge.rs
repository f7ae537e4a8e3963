//! LLM-as-judge implementation of [`JudgeOracle`].

use crate::config::LlmConfig;
use crate::error::{EvalError, Result};
use crate::llm::{LlmClient, Message, Prompts};
use crate::rubric::{JudgeOracle, JudgeRequest, JudgeVerdict, ScoringMode};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// Grades candidates by prompting a chat model.
pub struct LlmJudge {
    client: LlmClient,
}

impl LlmJudge {
    /// Create a new judge with the given LLM client.
    pub fn new(client: LlmClient) -> Self {
        Self { client }
    }

    /// Create from LLM config.
    pub fn from_config(config: LlmConfig) -> Self {
        Self::new(LlmClient::new(config))
    }

    /// Build the grading prompt for a request.
    fn build_prompt(request: &JudgeRequest<'_>) -> String {
        let steps = request
            .evaluation_steps
            .iter()
            .enumerate()
            .map(|(i, step)| format!("{}. {}", i + 1, step))
            .collect::<Vec<_>>()
            .join("\n");

        let (target_label, reply_format) = match request.criterion.scoring() {
            ScoringMode::Holistic => ("Reference Description", Prompts::holistic_reply_format()),
            ScoringMode::Checklist => ("Must-Include Items", Prompts::checklist_reply_format()),
        };

        format!(
            r#"Criterion: {}

Evaluation Steps:
{}

Candidate Description:
{}

{}:
{}

{}"#,
            request.rubric_description,
            steps,
            request.candidate,
            target_label,
            request.target,
            reply_format
        )
    }

    /// Parse a holistic reply; the 0-10 score is mapped onto [0, 1].
    fn parse_holistic_response(response: &str) -> Result<JudgeVerdict> {
        let json_str = Self::extract_json(response);

        #[derive(Deserialize)]
        struct RawHolistic {
            score: f64,
            #[serde(alias = "explanation", default)]
            reason: String,
        }

        let raw: RawHolistic = serde_json::from_str(&json_str).map_err(|e| {
            EvalError::LlmParse(format!(
                "Failed to parse judge response: {}. Response: {}",
                e, response
            ))
        })?;

        Ok(JudgeVerdict {
            score: raw.score / 10.0,
            rationale: raw.reason,
        })
    }

    /// Parse a checklist reply. The score is the fraction of items marked
    /// present; the reply must carry exactly one verdict per item.
    fn parse_checklist_response(response: &str, expected_items: usize) -> Result<JudgeVerdict> {
        let json_str = Self::extract_json(response);

        #[derive(Deserialize)]
        struct RawItem {
            #[serde(default)]
            item: String,
            present: bool,
        }

        #[derive(Deserialize)]
        struct RawChecklist {
            items: Vec<RawItem>,
            #[serde(alias = "explanation", default)]
            reason: String,
        }

        let raw: RawChecklist = serde_json::from_str(&json_str).map_err(|e| {
            EvalError::LlmParse(format!(
                "Failed to parse checklist response: {}. Response: {}",
                e, response
            ))
        })?;

        if raw.items.len() != expected_items {
            return Err(EvalError::LlmParse(format!(
                "Expected {} item verdicts, got {}",
                expected_items,
                raw.items.len()
            )));
        }

        let present = raw.items.iter().filter(|i| i.present).count();
        let missing: Vec<&str> = raw
            .items
            .iter()
            .filter(|i| !i.present)
            .map(|i| i.item.as_str())
            .collect();

        let rationale = if missing.is_empty() || raw.reason.contains(missing[0]) {
            raw.reason
        } else {
            format!("{} (missing: {})", raw.reason, missing.join("; "))
        };

        Ok(JudgeVerdict {
            score: present as f64 / expected_items as f64,
            rationale,
        })
    }

    /// Extract JSON from response.
    fn extract_json(response: &str) -> String {
        let response = response.trim();

        if response.starts_with("```json") {
            if let Some(end) = response.rfind("```") {
                let start = "```json".len();
                if end > start {
                    return response[start..end].trim().to_string();
                }
            }
        }

        if response.starts_with("```") {
            if let Some(end) = response.rfind("```") {
                let start = response.find('\n').map(|n| n + 1).unwrap_or(3);
                if end > start {
                    return response[start..end].trim().to_string();
                }
            }
        }

        if let Some(start) = response.find('{') {
            if let Some(end) = response.rfind('}') {
                if end > start {
                    return response[start..=end].to_string();
                }
            }
        }

        response.to_string()
    }
}

/// Items a checklist request is graded on. The count comes from the
/// annotation itself, never from the rendered text.
fn checklist_items<'a>(request: &JudgeRequest<'a>) -> Result<&'a [String]> {
    request.checklist.ok_or_else(|| {
        EvalError::LlmParse(format!(
            "{} request carries no item list",
            request.criterion
        ))
    })
}

#[async_trait]
impl JudgeOracle for LlmJudge {
    async fn judge(&self, request: &JudgeRequest<'_>) -> Result<JudgeVerdict> {
        let expected_items = match request.criterion.scoring() {
            ScoringMode::Holistic => 0,
            ScoringMode::Checklist => checklist_items(request)?.len(),
        };
        if request.criterion.scoring() == ScoringMode::Checklist && expected_items == 0 {
            return Ok(JudgeVerdict {
                score: 1.0,
                rationale: "No must-include items.".to_string(),
            });
        }

        let messages = vec![
            Message::system(Prompts::judge_system()),
            Message::user(Self::build_prompt(request)),
        ];
        let response = self.client.chat(messages).await?;

        if let Some(usage) = &response.usage {
            debug!(
                model = self.client.model(),
                criterion = %request.criterion,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                finish_reason = response.finish_reason.as_deref().unwrap_or("unknown"),
                "judge call completed"
            );
        }

        if response.is_truncated() {
            return Err(EvalError::LlmParse(format!(
                "judge reply cut off at {} tokens",
                self.client.max_tokens()
            )));
        }

        match request.criterion.scoring() {
            ScoringMode::Holistic => Self::parse_holistic_response(&response.content),
            ScoringMode::Checklist => {
                Self::parse_checklist_response(&response.content, expected_items)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations::render_checklist;
    use crate::rubric::{Criterion, Target};

    #[test]
    fn test_parse_holistic_response() {
        let response = r#"{"score": 7, "reason": "Most facts conveyed"}"#;
        let result = LlmJudge::parse_holistic_response(response).unwrap();

        assert!((result.score - 0.7).abs() < 1e-9);
        assert_eq!(result.rationale, "Most facts conveyed");
    }

    #[test]
    fn test_parse_holistic_fenced_with_alias() {
        let response = "```json\n{\"score\": 10, \"explanation\": \"All there\"}\n```";
        let result = LlmJudge::parse_holistic_response(response).unwrap();
        assert_eq!(result.score, 1.0);
        assert_eq!(result.rationale, "All there");
    }

    #[test]
    fn test_parse_checklist_is_fraction_present() {
        let response = r#"Here you go:
{"items": [
    {"item": "search bar", "present": true},
    {"item": "profile icon", "present": false},
    {"item": "tab bar", "present": true},
    {"item": "logo", "present": true}
], "reason": "One item absent."}"#;
        let result = LlmJudge::parse_checklist_response(response, 4).unwrap();

        assert_eq!(result.score, 0.75);
        assert!(result.rationale.contains("profile icon"));
    }

    #[test]
    fn test_parse_checklist_count_mismatch() {
        let response = r#"{"items": [{"item": "a", "present": true}], "reason": ""}"#;
        assert!(LlmJudge::parse_checklist_response(response, 2).is_err());
    }

    #[test]
    fn test_parse_garbage() {
        assert!(LlmJudge::parse_holistic_response("I think it is good").is_err());
    }

    #[test]
    fn test_prompt_contains_rubric_parts() {
        let rubric = Criterion::MustIncludeCoverage.rubric();
        let items = vec!["back arrow".to_string(), "title".to_string()];
        let target = render_checklist(&items);
        let request = JudgeRequest {
            criterion: rubric.criterion,
            rubric_description: rubric.description,
            evaluation_steps: rubric.evaluation_steps,
            candidate: "A page with a back arrow.",
            target: &target,
            checklist: Some(&items),
        };

        let prompt = LlmJudge::build_prompt(&request);
        assert!(prompt.contains("Must-Include Items"));
        assert!(prompt.contains("1. back arrow"));
        assert!(prompt.contains(rubric.evaluation_steps[0]));
        assert!(prompt.contains("\"present\""));
    }

    #[tokio::test]
    async fn test_empty_checklist_needs_no_call() {
        let judge = LlmJudge::from_config(LlmConfig::default());
        let rubric = Criterion::MustIncludeCoverage.rubric();
        let request = JudgeRequest {
            criterion: rubric.criterion,
            rubric_description: rubric.description,
            evaluation_steps: rubric.evaluation_steps,
            candidate: "Anything.",
            target: "",
            checklist: Some(&[]),
        };

        let verdict = judge.judge(&request).await.unwrap();
        assert_eq!(verdict.score, 1.0);
    }

    #[test]
    fn test_multi_line_item_counts_once() {
        let rubric = Criterion::MustIncludeCoverage.rubric();
        let items = vec!["search bar\n(top)".to_string(), "tab bar".to_string()];
        let target = Target::Checklist(&items);
        let rendered = target.render();
        let request = JudgeRequest {
            criterion: rubric.criterion,
            rubric_description: rubric.description,
            evaluation_steps: rubric.evaluation_steps,
            candidate: "A search bar at the top and a tab bar.",
            target: &rendered,
            checklist: target.checklist(),
        };

        let expected = checklist_items(&request).unwrap().len();
        assert_eq!(expected, 2);
        assert!(LlmJudge::build_prompt(&request).contains("1. search bar (top)\n2. tab bar"));

        let reply = r#"{"items": [
            {"item": "search bar (top)", "present": true},
            {"item": "tab bar", "present": true}
        ], "reason": "Both present."}"#;
        let verdict = LlmJudge::parse_checklist_response(reply, expected).unwrap();
        assert_eq!(verdict.score, 1.0);
    }

    #[tokio::test]
    async fn test_checklist_without_items_is_rejected() {
        let judge = LlmJudge::from_config(LlmConfig::default());
        let rubric = Criterion::MustIncludeCoverage.rubric();
        let request = JudgeRequest {
            criterion: rubric.criterion,
            rubric_description: rubric.description,
            evaluation_steps: rubric.evaluation_steps,
            candidate: "Anything.",
            target: "1. title",
            checklist: None,
        };

        let err = judge.judge(&request).await.unwrap_err();
        assert!(matches!(err, EvalError::LlmParse(_)));
    }
}
