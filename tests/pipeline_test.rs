//! End-to-end turn pipeline tests against deterministic model and
//! adapter stubs. The model stub routes on prompt shape: classification
//! prompts get a fixed intent, review prompts get a fixed verdict, and
//! synthesis prompts are echoed back so assertions can inspect exactly
//! what context synthesis saw.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use concierge::budget::BudgetLedger;
use concierge::capability::{AdapterRegistry, Capability, CapabilityAdapter, InvokeResult};
use concierge::error::{ToolErrorKind, TurnError, APOLOGY};
use concierge::executor::ActionExecutor;
use concierge::intent::IntentClassifier;
use concierge::llm::LlmClient;
use concierge::memory::MemoryStore;
use concierge::orchestrator::{Orchestrator, TurnRequest};
use concierge::planner::{CapabilityGrants, PlanningEngine};
use concierge::reflection::ReflectionEngine;
use concierge::retrieval::{Embedder, RetrievalIndex};
use concierge::session::{SessionStore, TurnStatus};
use concierge::synthesizer::{PersonalityConfig, ResponseSynthesizer};

/// Deterministic model stub. Synthesis echoes its prompt.
struct ScriptedLlm {
    intent_json: String,
    review_json: String,
    fail_synthesis: bool,
}

impl ScriptedLlm {
    fn classifying(intent_json: &str) -> Self {
        Self {
            intent_json: intent_json.to_string(),
            review_json: r#"{"verdict": "accept"}"#.to_string(),
            fail_synthesis: false,
        }
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn generate(&self, prompt: &str) -> Result<String> {
        if prompt.contains("Classify this user request") {
            return Ok(self.intent_json.clone());
        }
        if prompt.contains("reviewing a draft") {
            return Ok(self.review_json.clone());
        }
        if self.fail_synthesis {
            anyhow::bail!("model backend down");
        }
        Ok(prompt.to_string())
    }
}

struct ConstEmbedder;

#[async_trait]
impl Embedder for ConstEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(vec![1.0, 0.0, 0.0])
    }
}

struct StaticAdapter(Value);

#[async_trait]
impl CapabilityAdapter for StaticAdapter {
    async fn invoke(&self, _params: &Value, _auth: Option<&str>) -> InvokeResult {
        Ok(self.0.clone())
    }
}

struct SlowAdapter(Duration);

#[async_trait]
impl CapabilityAdapter for SlowAdapter {
    async fn invoke(&self, _params: &Value, _auth: Option<&str>) -> InvokeResult {
        tokio::time::sleep(self.0).await;
        Ok(Value::Null)
    }
}

struct Harness {
    orchestrator: Orchestrator,
    memory: Arc<MemoryStore>,
    sessions: Arc<SessionStore>,
    budget: Arc<BudgetLedger>,
}

fn harness(llm: ScriptedLlm, registry: AdapterRegistry, ceiling_usd: f64) -> Harness {
    let llm: Arc<dyn LlmClient> = Arc::new(llm);
    let memory = Arc::new(MemoryStore::open_in_memory(10, 100).unwrap());
    let sessions = Arc::new(SessionStore::open_in_memory(Duration::from_secs(5)).unwrap());
    let budget = Arc::new(BudgetLedger::open_in_memory(ceiling_usd).unwrap());

    let executor = ActionExecutor::new(
        registry,
        Arc::clone(&budget),
        Arc::new(RetrievalIndex::open_in_memory().unwrap()),
        Arc::new(ConstEmbedder),
        Duration::from_millis(200),
    );

    let orchestrator = Orchestrator::new(
        IntentClassifier::new(Arc::clone(&llm)),
        PlanningEngine::new(),
        executor,
        ReflectionEngine::new(Arc::clone(&llm)),
        ResponseSynthesizer::new(Arc::clone(&llm), PersonalityConfig::default()),
        Arc::clone(&memory),
        Arc::clone(&sessions),
        llm,
        Duration::from_secs(10),
    );

    Harness {
        orchestrator,
        memory,
        sessions,
        budget,
    }
}

fn calendar_llm() -> ScriptedLlm {
    ScriptedLlm::classifying(r#"{"intent": "calendar.query", "params": {"time_range": "today"}}"#)
}

fn request(session_id: &str, text: &str) -> TurnRequest {
    TurnRequest {
        session_id: session_id.to_string(),
        user_id: "u1".to_string(),
        text: text.to_string(),
        image: None,
        weather_location: None,
        grants: CapabilityGrants::new(["calendar.read".to_string()]),
        auth_grant: Some("token".to_string()),
    }
}

fn not_cancelled() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(false))
}

#[tokio::test]
async fn test_calendar_happy_path() {
    let mut registry = AdapterRegistry::new();
    registry.register(
        Capability::Calendar,
        Arc::new(StaticAdapter(serde_json::json!({
            "events": ["standup at 9", "design review at 11", "1:1 at 15"],
        }))),
    );
    let h = harness(calendar_llm(), registry, 1.0);

    let outcome = h
        .orchestrator
        .run_turn(request("s1", "What's on my calendar today?"), not_cancelled())
        .await
        .unwrap();

    assert_eq!(outcome.record.status, TurnStatus::Completed);
    assert!(outcome.response.contains("standup at 9"));
    assert!(outcome.response.contains("1:1 at 15"));
    assert_eq!(
        outcome.record.stages,
        vec![
            "received",
            "classifying",
            "planning",
            "executing",
            "reflecting",
            "synthesizing",
            "completed"
        ]
    );

    // One calendar invocation was charged.
    assert!((h.budget.spent("u1").unwrap() - 0.002).abs() < 1e-9);

    // The exchange landed in short-term memory.
    let summary = h.memory.summarize("u1").unwrap();
    assert_eq!(summary.recent.len(), 1);
}

#[tokio::test]
async fn test_slow_capability_degrades_to_apologetic_completion() {
    let mut registry = AdapterRegistry::new();
    registry.register(Capability::Calendar, Arc::new(SlowAdapter(Duration::from_secs(60))));
    let h = harness(calendar_llm(), registry, 1.0);

    let outcome = h
        .orchestrator
        .run_turn(request("s1", "What's on my calendar?"), not_cancelled())
        .await
        .unwrap();

    // The turn completes; the failure is narrated, not fatal.
    assert_eq!(outcome.record.status, TurnStatus::Completed);
    assert_eq!(outcome.tool_results[0].error, Some(ToolErrorKind::Timeout));
    assert!(outcome.response.contains("couldn't reach your calendar"));
    // The reservation for the timed-out call was rolled back.
    assert_eq!(h.budget.spent("u1").unwrap(), 0.0);
}

#[tokio::test]
async fn test_exhausted_budget_skips_paid_action_but_turn_completes() {
    let mut registry = AdapterRegistry::new();
    registry.register(
        Capability::Calendar,
        Arc::new(StaticAdapter(serde_json::json!({"events": []}))),
    );
    let h = harness(calendar_llm(), registry, 0.0);

    let outcome = h
        .orchestrator
        .run_turn(request("s1", "What's on my calendar?"), not_cancelled())
        .await
        .unwrap();

    assert_eq!(outcome.record.status, TurnStatus::Completed);
    assert_eq!(outcome.tool_results[0].error, Some(ToolErrorKind::BudgetExceeded));
    assert!(outcome.response.contains("usage limit"));
}

#[tokio::test]
async fn test_self_disclosure_promotes_durable_fact() {
    let llm = ScriptedLlm::classifying(r#"{"intent": "general.chat", "params": {}}"#);
    let h = harness(llm, AdapterRegistry::new(), 1.0);

    h.orchestrator
        .run_turn(request("s1", "Hi, my name is Alex."), not_cancelled())
        .await
        .unwrap();

    let summary = h.memory.summarize("u1").unwrap();
    assert_eq!(summary.fact("name").unwrap().text, "Alex");

    // The fact is visible to the next turn's prompt context.
    let outcome = h
        .orchestrator
        .run_turn(request("s1", "What do you know about me?"), not_cancelled())
        .await
        .unwrap();
    assert!(outcome.response.contains("name: Alex"));
}

#[tokio::test]
async fn test_concurrent_turns_in_one_session_are_serialized() {
    let llm = ScriptedLlm::classifying(r#"{"intent": "general.chat", "params": {}}"#);
    let h = Arc::new(harness(llm, AdapterRegistry::new(), 1.0));

    let a = h.orchestrator.run_turn(request("s1", "first message"), not_cancelled());
    let b = h.orchestrator.run_turn(request("s1", "second message"), not_cancelled());
    let (a, b) = tokio::join!(a, b);
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.record.status, TurnStatus::Completed);
    assert_eq!(b.record.status, TurnStatus::Completed);

    // Whole turns were serialized: distinct, gapless sequence numbers.
    let mut seqs = vec![a.record.seq, b.record.seq];
    seqs.sort_unstable();
    assert_eq!(seqs, vec![1, 2]);

    let turns = h.sessions.turns("s1").unwrap();
    assert_eq!(turns.len(), 2);
}

#[tokio::test]
async fn test_synthesis_failure_yields_apology_and_failed_turn() {
    let llm = ScriptedLlm {
        intent_json: r#"{"intent": "general.chat", "params": {}}"#.to_string(),
        review_json: r#"{"verdict": "accept"}"#.to_string(),
        fail_synthesis: true,
    };
    let h = harness(llm, AdapterRegistry::new(), 1.0);

    let outcome = h
        .orchestrator
        .run_turn(request("s1", "hello"), not_cancelled())
        .await
        .unwrap();

    assert_eq!(outcome.record.status, TurnStatus::Failed);
    assert_eq!(outcome.response, APOLOGY);
    assert_eq!(outcome.record.stages.last().map(String::as_str), Some("failed"));

    // A failed turn never mutates memory.
    assert!(h.memory.summarize("u1").unwrap().recent.is_empty());
}

#[tokio::test]
async fn test_revision_runs_exactly_once() {
    let llm = ScriptedLlm {
        intent_json: r#"{"intent": "general.chat", "params": {}}"#.to_string(),
        review_json: r#"{"verdict": "revise", "note": "close with a question"}"#.to_string(),
        fail_synthesis: false,
    };
    let h = harness(llm, AdapterRegistry::new(), 1.0);

    let outcome = h
        .orchestrator
        .run_turn(request("s1", "hello"), not_cancelled())
        .await
        .unwrap();

    // The revise verdict triggers exactly one revision: the note is in
    // the final response, and reflection never ran a second time.
    assert!(outcome.response.contains("close with a question"));
    let reflect_count = outcome.record.stages.iter().filter(|s| *s == "reflecting").count();
    assert_eq!(reflect_count, 1);
    assert_eq!(outcome.record.status, TurnStatus::Completed);
}

#[tokio::test]
async fn test_cancelled_turn_leaves_no_trace() {
    let llm = ScriptedLlm::classifying(r#"{"intent": "general.chat", "params": {}}"#);
    let h = harness(llm, AdapterRegistry::new(), 1.0);

    let cancelled = Arc::new(AtomicBool::new(true));
    let err = h
        .orchestrator
        .run_turn(request("s1", "hello"), cancelled)
        .await
        .unwrap_err();

    assert!(matches!(err, TurnError::Cancelled));
    assert!(h.memory.summarize("u1").unwrap().recent.is_empty());
    assert!(h.sessions.turns("s1").unwrap().is_empty());
}

#[tokio::test]
async fn test_ungranted_capability_becomes_authorization_request() {
    let mut registry = AdapterRegistry::new();
    registry.register(
        Capability::Calendar,
        Arc::new(StaticAdapter(serde_json::json!({"events": []}))),
    );
    let h = harness(calendar_llm(), registry, 1.0);

    let req = TurnRequest {
        grants: CapabilityGrants::default(),
        auth_grant: None,
        ..request("s1", "What's on my calendar?")
    };
    let outcome = h.orchestrator.run_turn(req, not_cancelled()).await.unwrap();

    assert_eq!(outcome.record.status, TurnStatus::Completed);
    assert!(outcome.tool_results.is_empty());
    assert!(outcome.response.contains("calendar.read"));
    // Nothing paid ran.
    assert_eq!(h.budget.spent("u1").unwrap(), 0.0);
}
