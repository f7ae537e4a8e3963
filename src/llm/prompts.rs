//! Rubric texts and judge instructions.
//!
//! Each criterion has a fixed description and a numbered list of evaluation
//! steps. The two rubrics are deliberately different in kind: reference
//! coverage is a holistic meaning comparison, must-include coverage is a
//! per-item membership check.

/// Collection of prompts used for grading.
pub struct Prompts;

impl Prompts {
    /// System message for every grading call.
    pub fn judge_system() -> &'static str {
        "You are a strict, consistent evaluator of screen descriptions written for blind and low-vision users. You grade only what the candidate text says, never what the screenshot might contain."
    }

    pub fn reference_coverage_description() -> &'static str {
        "Does the candidate description convey the same key facts and overall meaning as the reference description, independent of exact wording or sentence order?"
    }

    pub fn reference_coverage_steps() -> &'static [&'static str] {
        &[
            "Read the reference description and list the key facts it states about the screen: its purpose, main regions, prominent controls and their state.",
            "Check, fact by fact, whether the candidate conveys each key fact. Paraphrases and different ordering count as conveyed.",
            "Penalize statements in the candidate that contradict the reference.",
            "Do not reward or penalize extra detail that neither contradicts nor replaces a reference fact.",
            "Give a score from 0 (none of the meaning conveyed) to 10 (all key facts and the overall meaning conveyed).",
        ]
    }

    pub fn must_include_description() -> &'static str {
        "For each item in the must-include list, is a semantically equivalent mention present in the candidate description? Exact wording is not required."
    }

    pub fn must_include_steps() -> &'static [&'static str] {
        &[
            "Take the must-include items one at a time, in the order given.",
            "For each item, decide whether the candidate mentions the same concept. Synonyms and paraphrases count; a merely related concept does not.",
            "Judge every item independently. Missing one item must not affect the verdict on any other item.",
            "Report a present/absent verdict for every item, and nothing else about scoring.",
        ]
    }

    /// Reply format for holistic rubrics.
    pub fn holistic_reply_format() -> &'static str {
        r#"Respond in JSON format:
{
    "score": <integer 0-10>,
    "reason": "<one or two sentences justifying the score>"
}

Respond with only the JSON, no other text."#
    }

    /// Reply format for checklist rubrics.
    pub fn checklist_reply_format() -> &'static str {
        r#"Respond in JSON format, with exactly one entry per numbered item, in the same order:
{
    "items": [
        {"item": "<item text>", "present": <true/false>}
    ],
    "reason": "<one or two sentences naming the missing items, if any>"
}

Respond with only the JSON, no other text."#
    }
}
