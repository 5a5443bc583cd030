//! Reflection Engine
//!
//! One bounded self-review pass over a draft response before delivery.
//! The model judges the draft against the user's intent and the gathered
//! tool results; a `revise` verdict carries a note that the orchestrator
//! feeds into exactly one re-synthesis. Malformed judge output is treated
//! as acceptance, never as a reason to guess.

use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::executor::ToolResult;
use crate::intent::ClassifiedIntent;
use crate::llm::{extract_json, LlmClient};

/// Review outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accept,
    /// Revise once, with this note appended to the synthesis context.
    Revise { note: String },
}

#[derive(Deserialize)]
struct VerdictJson {
    verdict: String,
    #[serde(default)]
    note: Option<String>,
}

pub struct ReflectionEngine {
    llm: Arc<dyn LlmClient>,
}

impl ReflectionEngine {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Score a draft. Errors and malformed output degrade to `Accept`.
    pub async fn review(
        &self,
        draft: &str,
        intent: &ClassifiedIntent,
        tool_results: &[ToolResult],
    ) -> Verdict {
        let results_summary: Vec<String> = tool_results
            .iter()
            .map(|r| {
                if let Some(kind) = r.error {
                    format!("{}: failed ({})", r.label, kind.as_str())
                } else {
                    format!("{}: ok", r.label)
                }
            })
            .collect();

        let prompt = format!(
            r#"You are reviewing a draft assistant reply for correctness, tone and safety.

User intent: {}
Tool outcomes:
{}

Draft reply:
"{}"

Accept the draft unless it contradicts the tool outcomes, leaks internal
details, or strikes the wrong tone. Return one JSON object only:
{{"verdict": "accept"}} or {{"verdict": "revise", "note": "<what to fix>"}}"#,
            intent.intent.as_str(),
            results_summary.join("\n"),
            draft
        );

        let response = match self.llm.generate(&prompt).await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "reflection model call failed; accepting draft");
                return Verdict::Accept;
            }
        };

        let Some(json) = extract_json(&response) else {
            return Verdict::Accept;
        };

        match serde_json::from_str::<VerdictJson>(json) {
            Ok(parsed) if parsed.verdict == "revise" => {
                let note = parsed.note.unwrap_or_default();
                if note.is_empty() {
                    // A revise verdict with nothing to act on is noise.
                    Verdict::Accept
                } else {
                    debug!(note = %note, "reflection requested revision");
                    Verdict::Revise { note }
                }
            }
            Ok(_) => Verdict::Accept,
            Err(e) => {
                warn!(error = %e, "malformed reflection output; accepting draft");
                Verdict::Accept
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{Intent, IntentParams};
    use anyhow::Result;
    use async_trait::async_trait;

    struct FixedModel(String);

    #[async_trait]
    impl LlmClient for FixedModel {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    fn intent() -> ClassifiedIntent {
        ClassifiedIntent {
            intent: Intent::GeneralChat,
            params: IntentParams::default(),
            degraded: false,
        }
    }

    fn review_with(output: &str) -> Verdict {
        let engine = ReflectionEngine::new(Arc::new(FixedModel(output.to_string())));
        tokio_test::block_on(engine.review("draft", &intent(), &[]))
    }

    #[test]
    fn test_accept_verdict() {
        assert_eq!(review_with(r#"{"verdict": "accept"}"#), Verdict::Accept);
    }

    #[test]
    fn test_revise_with_note() {
        let verdict = review_with(r#"{"verdict": "revise", "note": "mention all three events"}"#);
        assert_eq!(
            verdict,
            Verdict::Revise {
                note: "mention all three events".to_string()
            }
        );
    }

    #[test]
    fn test_revise_without_note_is_accept() {
        assert_eq!(review_with(r#"{"verdict": "revise"}"#), Verdict::Accept);
    }

    #[test]
    fn test_malformed_output_is_accept() {
        assert_eq!(review_with("looks fine to me"), Verdict::Accept);
    }
}
