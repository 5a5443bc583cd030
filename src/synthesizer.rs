//! Response Synthesizer
//!
//! Produces the final natural-language reply from the intent, the
//! gathered tool results, the memory summary and the personality
//! configuration. Partial failures are narrated as graceful degradation;
//! internal identifiers, error kinds and stack traces never reach the
//! prompt, let alone the user.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::TurnError;
use crate::executor::ToolResult;
use crate::intent::ClassifiedIntent;
use crate::llm::LlmClient;
use crate::memory::MemorySummary;
use crate::planner::Plan;

/// Personality configuration: trait weights and tone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonalityConfig {
    pub traits: Vec<String>,
    pub tone: String,
    /// 0-100
    pub warmth: u8,
    /// 0-100
    pub humor: u8,
}

impl Default for PersonalityConfig {
    fn default() -> Self {
        Self {
            traits: vec![
                "attentive".to_string(),
                "practical".to_string(),
                "encouraging".to_string(),
            ],
            tone: "warm and conversational".to_string(),
            warmth: 70,
            humor: 30,
        }
    }
}

pub struct ResponseSynthesizer {
    llm: Arc<dyn LlmClient>,
    personality: PersonalityConfig,
}

impl ResponseSynthesizer {
    pub fn new(llm: Arc<dyn LlmClient>, personality: PersonalityConfig) -> Self {
        Self { llm, personality }
    }

    /// Produce the final reply text. Identical inputs against a
    /// deterministic model yield identical output; the only failure mode
    /// is `SynthesisFailure`.
    pub async fn synthesize(
        &self,
        user_text: &str,
        intent: &ClassifiedIntent,
        plan: &Plan,
        tool_results: &[ToolResult],
        memory: &MemorySummary,
        revision_note: Option<&str>,
    ) -> Result<String, TurnError> {
        let prompt = self.build_prompt(user_text, intent, plan, tool_results, memory, revision_note);

        match self.llm.generate(&prompt).await {
            Ok(text) if !text.trim().is_empty() => Ok(text.trim().to_string()),
            Ok(_) => Err(TurnError::SynthesisFailure("empty model output".to_string())),
            Err(e) => Err(TurnError::SynthesisFailure(e.to_string())),
        }
    }

    fn build_prompt(
        &self,
        user_text: &str,
        intent: &ClassifiedIntent,
        plan: &Plan,
        tool_results: &[ToolResult],
        memory: &MemorySummary,
        revision_note: Option<&str>,
    ) -> String {
        let mut context = String::new();

        for result in tool_results {
            match (&result.data, result.error) {
                (Some(data), _) => {
                    context.push_str(&format!(
                        "Data from {}: {}\n",
                        result.subject,
                        serde_json::to_string(data).unwrap_or_default()
                    ));
                }
                (None, Some(kind)) => {
                    // Pre-translated degradation text; the raw kind stays
                    // on the server side.
                    context.push_str(&kind.degradation(&result.subject));
                    context.push('\n');
                }
                (None, None) => {}
            }
        }

        for note in &plan.notes {
            context.push_str(&format!("Guidance: {}\n", note));
        }

        if let Some(note) = revision_note {
            context.push_str(&format!("Reviewer note, address it this time: {}\n", note));
        }

        format!(
            r#"You are a personal assistant. Personality traits: {}. Tone: {} (warmth {}/100, humor {}/100).

{}
The user asked ({}): "{}"

Context gathered for this turn:
{}
Reply to the user directly. If some information could not be fetched, say
so briefly and apologetically in plain words and still be as helpful as
possible with what you have. Never mention internal systems, error codes
or identifiers."#,
            self.personality.traits.join(", "),
            self.personality.tone,
            self.personality.warmth,
            self.personality.humor,
            memory.render(),
            intent.intent.as_str(),
            user_text,
            if context.is_empty() { "(none)".to_string() } else { context },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ToolErrorKind;
    use crate::intent::{Intent, IntentParams};
    use anyhow::Result;
    use async_trait::async_trait;

    /// Echoes the prompt so tests can inspect what synthesis sees.
    struct EchoModel;

    #[async_trait]
    impl LlmClient for EchoModel {
        async fn generate(&self, prompt: &str) -> Result<String> {
            Ok(prompt.to_string())
        }
    }

    struct FailingModel;

    #[async_trait]
    impl LlmClient for FailingModel {
        async fn generate(&self, _prompt: &str) -> Result<String> {
            anyhow::bail!("backend down")
        }
    }

    fn intent() -> ClassifiedIntent {
        ClassifiedIntent {
            intent: Intent::CalendarQuery,
            params: IntentParams::default(),
            degraded: false,
        }
    }

    fn synthesizer(llm: Arc<dyn LlmClient>) -> ResponseSynthesizer {
        ResponseSynthesizer::new(llm, PersonalityConfig::default())
    }

    #[tokio::test]
    async fn test_failures_are_narrated_not_leaked() {
        let synth = synthesizer(Arc::new(EchoModel));
        let results = vec![ToolResult::failure(
            "calendar",
            "your calendar",
            ToolErrorKind::Timeout,
        )];

        let output = synth
            .synthesize("what's on today?", &intent(), &Plan::default(), &results, &MemorySummary::default(), None)
            .await
            .unwrap();

        assert!(output.contains("couldn't reach your calendar"));
        assert!(!output.contains("timeout"));
        assert!(!output.contains("ToolErrorKind"));
    }

    #[tokio::test]
    async fn test_successful_data_reaches_prompt() {
        let synth = synthesizer(Arc::new(EchoModel));
        let results = vec![ToolResult::success(
            "calendar",
            "your calendar",
            serde_json::json!({"events": ["standup", "lunch", "review"]}),
        )];

        let output = synth
            .synthesize("what's on today?", &intent(), &Plan::default(), &results, &MemorySummary::default(), None)
            .await
            .unwrap();

        assert!(output.contains("standup"));
        assert!(output.contains("review"));
    }

    #[tokio::test]
    async fn test_revision_note_included() {
        let synth = synthesizer(Arc::new(EchoModel));
        let output = synth
            .synthesize("hi", &intent(), &Plan::default(), &[], &MemorySummary::default(), Some("be more specific"))
            .await
            .unwrap();
        assert!(output.contains("be more specific"));
    }

    #[tokio::test]
    async fn test_idempotent_given_deterministic_model() {
        let synth = synthesizer(Arc::new(EchoModel));
        let memory = MemorySummary::default();
        let plan = Plan::default();

        let a = synth
            .synthesize("hello", &intent(), &plan, &[], &memory, None)
            .await
            .unwrap();
        let b = synth
            .synthesize("hello", &intent(), &plan, &[], &memory, None)
            .await
            .unwrap();
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_model_failure_is_synthesis_failure() {
        let synth = synthesizer(Arc::new(FailingModel));
        let err = synth
            .synthesize("hi", &intent(), &Plan::default(), &[], &MemorySummary::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, TurnError::SynthesisFailure(_)));
    }
}
