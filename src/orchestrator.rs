//! Turn Orchestrator
//!
//! Drives one turn through the fixed stage sequence: classify, plan,
//! execute, synthesize, reflect (at most one revision), complete. The
//! whole turn runs under the session lock, transitions are recorded on
//! the persisted turn, and a cancellation flag is honored between stages
//! so an abandoned turn never mutates memory.

use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{TurnError, APOLOGY};
use crate::executor::{ActionExecutor, ToolResult};
use crate::intent::IntentClassifier;
use crate::llm::LlmClient;
use crate::memory::MemoryStore;
use crate::planner::{CapabilityGrants, PlanningEngine};
use crate::reflection::{ReflectionEngine, Verdict};
use crate::session::{SessionStore, TurnDraft, TurnRecord, TurnStatus};
use crate::synthesizer::ResponseSynthesizer;

/// Pipeline stages, in the order a successful turn visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Received,
    Classifying,
    Planning,
    Executing,
    Synthesizing,
    Reflecting,
    Completed,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Classifying => "classifying",
            Self::Planning => "planning",
            Self::Executing => "executing",
            Self::Synthesizing => "synthesizing",
            Self::Reflecting => "reflecting",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// One incoming turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub user_id: String,
    pub text: String,
    /// Raw image bytes; captioned and merged into the turn context.
    pub image: Option<Vec<u8>>,
    /// Client-supplied location, used when the classifier extracts none.
    pub weather_location: Option<String>,
    pub grants: CapabilityGrants,
    /// Delegated credential passed through to capability adapters.
    pub auth_grant: Option<String>,
}

/// What a finished turn produced.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub record: TurnRecord,
    pub response: String,
    pub tool_results: Vec<ToolResult>,
}

impl TurnOutcome {
    pub fn is_failed(&self) -> bool {
        self.record.status == TurnStatus::Failed
    }
}

pub struct Orchestrator {
    classifier: IntentClassifier,
    planner: PlanningEngine,
    executor: ActionExecutor,
    reflection: ReflectionEngine,
    synthesizer: ResponseSynthesizer,
    memory: Arc<MemoryStore>,
    sessions: Arc<SessionStore>,
    llm: Arc<dyn LlmClient>,
    turn_deadline: Duration,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        classifier: IntentClassifier,
        planner: PlanningEngine,
        executor: ActionExecutor,
        reflection: ReflectionEngine,
        synthesizer: ResponseSynthesizer,
        memory: Arc<MemoryStore>,
        sessions: Arc<SessionStore>,
        llm: Arc<dyn LlmClient>,
        turn_deadline: Duration,
    ) -> Self {
        Self {
            classifier,
            planner,
            executor,
            reflection,
            synthesizer,
            memory,
            sessions,
            llm,
            turn_deadline,
        }
    }

    /// Run one turn end to end under the session lock.
    ///
    /// `cancelled` is set by the transport when the client goes away; it
    /// is checked between stages and always before memory writes, so a
    /// cancelled turn leaves no trace beyond its log lines.
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        cancelled: Arc<AtomicBool>,
    ) -> Result<TurnOutcome, TurnError> {
        self.sessions
            .ensure_session(&request.session_id, &request.user_id)?;
        let _guard = self.sessions.acquire(&request.session_id).await?;

        let mut stages = vec![Stage::Received.as_str().to_string()];
        let check = |stages: &[String]| -> Result<(), TurnError> {
            if cancelled.load(Ordering::SeqCst) {
                info!(session_id = %request.session_id, at = ?stages.last(), "turn cancelled");
                Err(TurnError::Cancelled)
            } else {
                Ok(())
            }
        };

        // Vision merge: a caption failure degrades to a fixed context
        // marker, never aborts the turn.
        let mut turn_text = request.text.clone();
        if let Some(ref image) = request.image {
            match self.llm.caption_image(image).await {
                Ok(caption) => {
                    turn_text.push_str(&format!("\n[Attached image: {}]", caption.trim()));
                }
                Err(e) => {
                    warn!(error = %e, "image caption failed");
                    turn_text.push_str("\n[An image was provided but could not be processed.]");
                }
            }
        }

        check(&stages)?;
        stages.push(Stage::Classifying.as_str().to_string());
        let memory_summary = self.memory.summarize(&request.user_id)?;
        let mut classified = self
            .classifier
            .classify(&turn_text, &memory_summary, chrono::Utc::now())
            .await;
        if classified.params.location.is_none() {
            classified.params.location = request.weather_location.clone();
        }
        debug!(intent = classified.intent.as_str(), degraded = classified.degraded, "intent classified");

        check(&stages)?;
        stages.push(Stage::Planning.as_str().to_string());
        let plan = self.planner.plan(&classified, &request.grants, &memory_summary);

        check(&stages)?;
        stages.push(Stage::Executing.as_str().to_string());
        let tool_results = self
            .executor
            .execute_plan(
                &request.user_id,
                request.auth_grant.as_deref(),
                &plan,
                self.turn_deadline,
            )
            .await;

        // The reflecting stage covers draft generation and its review; the
        // synthesizing stage produces the final text (the accepted draft,
        // or exactly one revision).
        check(&stages)?;
        stages.push(Stage::Reflecting.as_str().to_string());
        let draft = self
            .synthesizer
            .synthesize(&turn_text, &classified, &plan, &tool_results, &memory_summary, None)
            .await;

        let response = match draft {
            Ok(draft) => {
                let verdict = self.reflection.review(&draft, &classified, &tool_results).await;
                check(&stages)?;
                stages.push(Stage::Synthesizing.as_str().to_string());
                match verdict {
                    Verdict::Accept => Ok(draft),
                    Verdict::Revise { note } => {
                        // A failed revision falls back to the draft; its
                        // outcome is final either way.
                        match self
                            .synthesizer
                            .synthesize(
                                &turn_text,
                                &classified,
                                &plan,
                                &tool_results,
                                &memory_summary,
                                Some(&note),
                            )
                            .await
                        {
                            Ok(revised) => Ok(revised),
                            Err(_) => Ok(draft),
                        }
                    }
                }
            }
            Err(e) => Err(e),
        };

        check(&stages)?;
        match response {
            Ok(response) => {
                stages.push(Stage::Completed.as_str().to_string());
                self.memory
                    .append_turn(&request.user_id, &request.text, &response)?;
                for (key, text) in extract_durable_facts(&request.text) {
                    self.memory.promote(&request.user_id, &key, &text)?;
                }
                let record = self.sessions.record_turn(TurnDraft {
                    session_id: &request.session_id,
                    user_text: &request.text,
                    response_text: &response,
                    status: TurnStatus::Completed,
                    intent: classified.intent.as_str(),
                    plan_json: serde_json::to_string(&plan).map_err(anyhow::Error::from)?,
                    tool_results_json: serde_json::to_string(&tool_results)
                        .map_err(anyhow::Error::from)?,
                    stages: &stages,
                })?;
                Ok(TurnOutcome {
                    record,
                    response,
                    tool_results,
                })
            }
            Err(e) => {
                // Structural failure: generic apology, no memory write.
                warn!(error = %e, session_id = %request.session_id, "turn failed");
                stages.push(Stage::Failed.as_str().to_string());
                let record = self.sessions.record_turn(TurnDraft {
                    session_id: &request.session_id,
                    user_text: &request.text,
                    response_text: APOLOGY,
                    status: TurnStatus::Failed,
                    intent: classified.intent.as_str(),
                    plan_json: serde_json::to_string(&plan).map_err(anyhow::Error::from)?,
                    tool_results_json: serde_json::to_string(&tool_results)
                        .map_err(anyhow::Error::from)?,
                    stages: &stages,
                })?;
                Ok(TurnOutcome {
                    record,
                    response: APOLOGY.to_string(),
                    tool_results,
                })
            }
        }
    }
}

static NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bmy name is\s+([A-Z][\w'-]*)").unwrap());
static LOCATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bi live in\s+([A-Za-z][\w .'-]*?)[.!?]?\s*$").unwrap());
static PREFERENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bi (?:prefer|love)\s+(.{2,80}?)[.!?]?\s*$").unwrap());
static REMEMBER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:please )?remember (?:that )?(.{2,120}?)[.!?]?\s*$").unwrap());

/// Statements worth promoting to long-term memory, as (key, text) pairs.
///
/// Deliberately conservative: only explicit self-disclosures and direct
/// "remember" requests qualify, so casual mentions never pollute the
/// fact set.
pub fn extract_durable_facts(text: &str) -> Vec<(String, String)> {
    let mut facts = Vec::new();

    if let Some(caps) = NAME_RE.captures(text) {
        facts.push(("name".to_string(), caps[1].to_string()));
    }
    if let Some(caps) = LOCATION_RE.captures(text) {
        facts.push(("location".to_string(), caps[1].trim().to_string()));
    }
    if let Some(caps) = PREFERENCE_RE.captures(text) {
        facts.push(("preference".to_string(), caps[1].trim().to_string()));
    }
    if let Some(caps) = REMEMBER_RE.captures(text) {
        facts.push(("note".to_string(), caps[1].trim().to_string()));
    }

    facts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_extraction() {
        let facts = extract_durable_facts("Hi, my name is Alex.");
        assert!(facts.contains(&("name".to_string(), "Alex".to_string())));
    }

    #[test]
    fn test_location_extraction() {
        let facts = extract_durable_facts("I live in Lisbon");
        assert!(facts.contains(&("location".to_string(), "Lisbon".to_string())));
    }

    #[test]
    fn test_remember_request() {
        let facts = extract_durable_facts("Please remember that my dentist is on Oak Street.");
        assert!(facts.contains(&("note".to_string(), "my dentist is on Oak Street".to_string())));
    }

    #[test]
    fn test_casual_text_yields_nothing() {
        assert!(extract_durable_facts("what's the weather like?").is_empty());
        assert!(extract_durable_facts("the name is misleading").is_empty());
    }
}
