//! HTTP API
//!
//! Endpoints:
//! - `POST /chat` - run one turn, streamed back as NDJSON chunk/final events
//! - `POST /feedback` - rate a completed turn
//! - `POST /memory` - promote an explicit long-term fact
//! - `GET /memory/{user_id}` - inspect a user's memory summary
//! - `POST /index_doc` - chunk, embed and index a document
//! - `GET /health` - liveness probe
//!
//! The chat stream doubles as the cancellation signal: when the client
//! disconnects mid-turn, the orchestrator's cancellation flag is raised
//! and the turn unwinds without touching memory.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::budget::BudgetLedger;
use crate::capability::{AdapterRegistry, Capability, DelegatedHttpAdapter, WeatherAdapter};
use crate::config::Config;
use crate::error::APOLOGY;
use crate::executor::ActionExecutor;
use crate::feedback::FeedbackStore;
use crate::intent::IntentClassifier;
use crate::llm::{HttpLlmClient, HttpLlmConfig, LlmClient};
use crate::memory::MemoryStore;
use crate::orchestrator::{Orchestrator, TurnRequest};
use crate::planner::{CapabilityGrants, PlanningEngine};
use crate::reflection::ReflectionEngine;
use crate::retrieval::{split_into_chunks, Embedder, HttpEmbedder, RetrievalIndex};
use crate::session::SessionStore;
use crate::synthesizer::{PersonalityConfig, ResponseSynthesizer};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub memory: Arc<MemoryStore>,
    pub retrieval: Arc<RetrievalIndex>,
    pub embedder: Arc<dyn Embedder>,
    pub feedback: Arc<FeedbackStore>,
}

/// Wire the full pipeline from configuration.
pub fn build_state(config: &Config) -> anyhow::Result<AppState> {
    let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(HttpLlmConfig {
        url: config.model_url.clone(),
        api_key: config.model_api_key.clone(),
        ..HttpLlmConfig::default()
    }));
    let embedder: Arc<dyn Embedder> = Arc::new(HttpEmbedder::new(&config.embedding_url));

    let memory = Arc::new(MemoryStore::open(
        &config.db_path,
        config.short_term_capacity,
        config.long_term_capacity,
    )?);
    let sessions = Arc::new(SessionStore::open(
        &config.db_path,
        config.session_lock_timeout,
    )?);
    let budget = Arc::new(BudgetLedger::open(&config.db_path, config.budget_ceiling_usd)?);
    let retrieval = Arc::new(RetrievalIndex::open(&config.db_path)?);
    let feedback = Arc::new(FeedbackStore::open(&config.db_path)?);

    let mut registry = AdapterRegistry::new();
    if let Some(ref key) = config.weather_api_key {
        registry.register(Capability::Weather, Arc::new(WeatherAdapter::new(key)));
    } else {
        warn!("OWM_API_KEY not set; weather capability disabled");
    }
    if let Some(ref url) = config.workspace_api_url {
        for capability in [
            Capability::Calendar,
            Capability::Mail,
            Capability::Drive,
            Capability::Contacts,
        ] {
            registry.register(capability, Arc::new(DelegatedHttpAdapter::new(capability, url)));
        }
    } else {
        warn!("CONCIERGE_WORKSPACE_URL not set; delegated capabilities disabled");
    }

    let executor = ActionExecutor::new(
        registry,
        budget,
        Arc::clone(&retrieval),
        Arc::clone(&embedder),
        config.action_timeout,
    );

    let orchestrator = Arc::new(Orchestrator::new(
        IntentClassifier::new(Arc::clone(&llm)),
        PlanningEngine::new(),
        executor,
        ReflectionEngine::new(Arc::clone(&llm)),
        ResponseSynthesizer::new(Arc::clone(&llm), PersonalityConfig::default()),
        Arc::clone(&memory),
        sessions,
        llm,
        config.turn_deadline,
    ));

    Ok(AppState {
        orchestrator,
        memory,
        retrieval,
        embedder,
        feedback,
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(chat))
        .route("/feedback", post(feedback))
        .route("/memory", post(promote_memory))
        .route("/memory/{user_id}", get(memory_summary))
        .route("/index_doc", post(index_doc))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bind and serve until shutdown.
pub async fn serve(config: Config) -> anyhow::Result<()> {
    let state = build_state(&config)?;
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Internal errors become an opaque 500; the detail stays in the logs.
struct ApiError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error!(error = %self.0, "request failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
    }
}

#[derive(Deserialize)]
struct ChatRequest {
    user_id: String,
    message: String,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    image_base64: Option<String>,
    /// Delegated credential; its presence unlocks the delegated scopes.
    #[serde(default)]
    access_token: Option<String>,
    /// Fallback location for weather lookups.
    #[serde(default)]
    weather_location: Option<String>,
}

/// Wire events for the chat stream. Both carry the text under `data`;
/// failure detail never appears here, only the narrated response text.
#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ChatEvent {
    Chunk {
        data: String,
    },
    Final {
        data: String,
        turn_id: String,
        session_id: String,
        seq: i64,
        status: String,
    },
}

const DELEGATED_SCOPES: &[&str] = &["calendar.read", "mail.read", "drive.read", "contacts.read"];

async fn chat(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Response {
    let session_id = req
        .session_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let image = match req.image_base64 {
        Some(ref encoded) => {
            use base64::Engine as _;
            match base64::engine::general_purpose::STANDARD.decode(encoded) {
                Ok(bytes) => Some(bytes),
                Err(_) => {
                    return (StatusCode::BAD_REQUEST, "invalid image_base64").into_response()
                }
            }
        }
        None => None,
    };

    let grants = if req.access_token.is_some() {
        CapabilityGrants::new(DELEGATED_SCOPES.iter().map(|s| s.to_string()))
    } else {
        CapabilityGrants::default()
    };

    let request = TurnRequest {
        session_id: session_id.clone(),
        user_id: req.user_id,
        text: req.message,
        image,
        weather_location: req.weather_location,
        grants,
        auth_grant: req.access_token,
    };

    let orchestrator = Arc::clone(&state.orchestrator);
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<String, std::io::Error>>(16);

    tokio::spawn(async move {
        let cancelled = Arc::new(AtomicBool::new(false));
        let run = orchestrator.run_turn(request, Arc::clone(&cancelled));
        tokio::pin!(run);

        // Client disconnect raises the cancellation flag; the turn then
        // unwinds at its next stage boundary.
        let outcome = loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                _ = tx.closed(), if !cancelled.load(Ordering::SeqCst) => {
                    cancelled.store(true, Ordering::SeqCst);
                }
            }
        };

        let events = match outcome {
            Ok(outcome) => {
                let mut events: Vec<ChatEvent> = split_into_chunks(&outcome.response, 80)
                    .into_iter()
                    .map(|data| ChatEvent::Chunk { data })
                    .collect();
                events.push(ChatEvent::Final {
                    data: outcome.response.clone(),
                    turn_id: outcome.record.id.clone(),
                    session_id,
                    seq: outcome.record.seq,
                    status: outcome.record.status.as_str().to_string(),
                });
                events
            }
            Err(e) => {
                warn!(error = %e, "turn aborted");
                vec![ChatEvent::Final {
                    data: APOLOGY.to_string(),
                    turn_id: String::new(),
                    session_id,
                    seq: 0,
                    status: "failed".to_string(),
                }]
            }
        };

        for event in events {
            let Ok(line) = serde_json::to_string(&event) else {
                continue;
            };
            if tx.send(Ok(line + "\n")).await.is_err() {
                break;
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/x-ndjson")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[derive(Deserialize)]
struct FeedbackRequest {
    user_id: String,
    session_id: String,
    turn_id: String,
    rating: i64,
    #[serde(default)]
    notes: Option<String>,
}

async fn feedback(
    State(state): State<AppState>,
    Json(req): Json<FeedbackRequest>,
) -> Result<StatusCode, Response> {
    state
        .feedback
        .record(
            &req.turn_id,
            &req.user_id,
            &req.session_id,
            req.rating,
            req.notes.as_deref(),
        )
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()).into_response())?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct PromoteRequest {
    user_id: String,
    text: String,
    /// Optional explicit fact key; derived from the text when absent.
    #[serde(default)]
    key: Option<String>,
}

async fn promote_memory(
    State(state): State<AppState>,
    Json(req): Json<PromoteRequest>,
) -> Result<StatusCode, ApiError> {
    let key = req.key.unwrap_or_else(|| derive_fact_key(&req.text));
    state.memory.promote(&req.user_id, &key, &req.text)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Stable key for an explicitly promoted fact: the first few words,
/// normalized. Re-promoting the same statement updates in place.
fn derive_fact_key(text: &str) -> String {
    let key: String = text
        .split_whitespace()
        .take(3)
        .collect::<Vec<_>>()
        .join("-")
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-')
        .collect();
    if key.is_empty() {
        "note".to_string()
    } else {
        key
    }
}

#[derive(Serialize)]
struct MemoryResponse {
    facts: Vec<FactJson>,
    rapport: i64,
    trust: i64,
}

#[derive(Serialize)]
struct FactJson {
    key: String,
    text: String,
}

async fn memory_summary(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<MemoryResponse>, ApiError> {
    let summary = state.memory.summarize(&user_id)?;
    Ok(Json(MemoryResponse {
        facts: summary
            .facts
            .into_iter()
            .map(|f| FactJson {
                key: f.key,
                text: f.text,
            })
            .collect(),
        rapport: summary.rapport,
        trust: summary.trust,
    }))
}

#[derive(Deserialize)]
struct IndexRequest {
    user_id: String,
    doc_id: String,
    text: String,
}

#[derive(Serialize)]
struct IndexResponse {
    doc_id: String,
    chunks: usize,
}

async fn index_doc(
    State(state): State<AppState>,
    Json(req): Json<IndexRequest>,
) -> Result<Json<IndexResponse>, ApiError> {
    let chunks = state
        .retrieval
        .index_document(state.embedder.as_ref(), &req.user_id, &req.doc_id, &req.text)
        .await?;
    Ok(Json(IndexResponse {
        doc_id: req.doc_id,
        chunks,
    }))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
