//! Action Executor
//!
//! Runs a plan against the capability adapters and the retrieval index,
//! enforcing the budget ledger and per-action timeouts. Failures are
//! captured as data and flow forward into synthesis; one bad action never
//! aborts the rest of the plan. Independent actions run concurrently;
//! actions with declared dependencies run sequentially afterwards in
//! declaration order.

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::budget::BudgetLedger;
use crate::capability::{AdapterRegistry, Capability};
use crate::error::ToolErrorKind;
use crate::planner::{Action, ActionKind, Plan};
use crate::retrieval::{Embedder, RetrievalIndex};

/// Attributed cost of one retrieval query (embedding invocation), USD.
const RETRIEVE_COST_USD: f64 = 0.0005;

/// Outcome of one executed action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorKind>,
    /// What the action touched, in user-facing words ("your calendar").
    pub subject: String,
}

impl ToolResult {
    pub fn success(label: &str, subject: &str, data: Value) -> Self {
        Self {
            label: label.to_string(),
            data: Some(data),
            error: None,
            subject: subject.to_string(),
        }
    }

    pub fn failure(label: &str, subject: &str, kind: ToolErrorKind) -> Self {
        Self {
            label: label.to_string(),
            data: None,
            error: Some(kind),
            subject: subject.to_string(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// Executes plans with budget gating, timeouts and bounded concurrency.
pub struct ActionExecutor {
    registry: AdapterRegistry,
    budget: Arc<BudgetLedger>,
    retrieval: Arc<RetrievalIndex>,
    embedder: Arc<dyn Embedder>,
    action_timeout: Duration,
}

impl ActionExecutor {
    pub fn new(
        registry: AdapterRegistry,
        budget: Arc<BudgetLedger>,
        retrieval: Arc<RetrievalIndex>,
        embedder: Arc<dyn Embedder>,
        action_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            budget,
            retrieval,
            embedder,
            action_timeout,
        }
    }

    /// Execute all actions of a plan. `deadline` is the soft per-turn
    /// budget for this stage: actions that cannot start before it expires
    /// are recorded as timed out rather than executed.
    ///
    /// Results come back in plan declaration order, one per action except
    /// `RespondDirectly` (which produces no tool result).
    pub async fn execute_plan(
        &self,
        user_id: &str,
        auth_grant: Option<&str>,
        plan: &Plan,
        deadline: Duration,
    ) -> Vec<ToolResult> {
        let started = Instant::now();

        let mut indexed: Vec<(usize, ToolResult)> = Vec::new();
        let mut independent = Vec::new();
        let mut dependent = Vec::new();

        for (idx, action) in plan.actions.iter().enumerate() {
            if matches!(action.kind, ActionKind::RespondDirectly) {
                continue;
            }
            if action.depends_on.is_empty() {
                independent.push((idx, action));
            } else {
                dependent.push((idx, action));
            }
        }

        // Independent batch, concurrently.
        let futures = independent
            .iter()
            .map(|(_, action)| self.execute_action(user_id, auth_grant, action, deadline, &[]));
        let batch = join_all(futures).await;
        for ((idx, _), result) in independent.iter().zip(batch) {
            indexed.push((*idx, result));
        }

        // Dependent actions, sequentially in declaration order, each with
        // whatever deadline remains and its predecessors' results as
        // context.
        for (idx, action) in dependent {
            let remaining = deadline.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                let subject = self.subject_of(action);
                warn!(label = %action.label, "turn deadline reached before dependent action");
                indexed.push((idx, ToolResult::failure(&action.label, &subject, ToolErrorKind::Timeout)));
                continue;
            }
            let predecessors: Vec<ToolResult> = action
                .depends_on
                .iter()
                .filter_map(|label| {
                    indexed.iter().find(|(_, r)| &r.label == label).map(|(_, r)| r.clone())
                })
                .collect();
            let result = self
                .execute_action(user_id, auth_grant, action, remaining, &predecessors)
                .await;
            indexed.push((idx, result));
        }

        indexed.sort_by_key(|(idx, _)| *idx);
        indexed.into_iter().map(|(_, r)| r).collect()
    }

    fn subject_of(&self, action: &Action) -> String {
        match &action.kind {
            ActionKind::InvokeCapability { capability, .. } => capability.user_facing().to_string(),
            ActionKind::Retrieve { .. } => "your indexed documents".to_string(),
            ActionKind::RespondDirectly => String::new(),
        }
    }

    async fn execute_action(
        &self,
        user_id: &str,
        auth_grant: Option<&str>,
        action: &Action,
        remaining: Duration,
        predecessors: &[ToolResult],
    ) -> ToolResult {
        let subject = self.subject_of(action);
        let cost = match &action.kind {
            ActionKind::InvokeCapability { capability, .. } => capability.cost_usd(),
            ActionKind::Retrieve { .. } => RETRIEVE_COST_USD,
            ActionKind::RespondDirectly => 0.0,
        };

        // Budget gate: a refused reservation skips only this action.
        if action.is_paid() {
            match self.budget.reserve(user_id, cost) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(label = %action.label, "action refused by budget ledger");
                    return ToolResult::failure(&action.label, &subject, ToolErrorKind::BudgetExceeded);
                }
                Err(e) => {
                    warn!(error = %e, "budget ledger unavailable");
                    return ToolResult::failure(&action.label, &subject, ToolErrorKind::Unknown);
                }
            }
        }

        let timeout = self.action_timeout.min(remaining);
        let result = match &action.kind {
            ActionKind::InvokeCapability { capability, params } => {
                let params = with_context(params, predecessors);
                self.invoke_capability(*capability, &params, auth_grant, timeout).await
            }
            ActionKind::Retrieve { query, k } => {
                self.retrieve(user_id, query, *k, timeout).await
            }
            ActionKind::RespondDirectly => Ok(Value::Null),
        };

        match result {
            Ok(data) => ToolResult::success(&action.label, &subject, data),
            Err(kind) => {
                // The reservation paid for work that did not happen.
                if action.is_paid() {
                    if let Err(e) = self.budget.release(user_id, cost) {
                        warn!(error = %e, "budget release failed");
                    }
                }
                debug!(label = %action.label, kind = kind.as_str(), "action failed");
                ToolResult::failure(&action.label, &subject, kind)
            }
        }
    }

    async fn invoke_capability(
        &self,
        capability: Capability,
        params: &Value,
        auth_grant: Option<&str>,
        timeout: Duration,
    ) -> Result<Value, ToolErrorKind> {
        let Some(adapter) = self.registry.get(capability) else {
            warn!(capability = capability.as_str(), "no adapter registered");
            return Err(ToolErrorKind::Unknown);
        };

        match tokio::time::timeout(timeout, adapter.invoke(params, auth_grant)).await {
            Ok(result) => result,
            Err(_) => Err(ToolErrorKind::Timeout),
        }
    }

    async fn retrieve(
        &self,
        user_id: &str,
        query: &str,
        k: usize,
        timeout: Duration,
    ) -> Result<Value, ToolErrorKind> {
        let fut = self.retrieval.query(self.embedder.as_ref(), user_id, query, k);
        match tokio::time::timeout(timeout, fut).await {
            Ok(Ok(chunks)) => Ok(serde_json::json!({
                "chunks": chunks.iter().map(|c| c.content.clone()).collect::<Vec<_>>(),
            })),
            Ok(Err(e)) => {
                warn!(error = %e, "retrieval query failed");
                Err(ToolErrorKind::Unknown)
            }
            Err(_) => Err(ToolErrorKind::Timeout),
        }
    }
}

/// Merge predecessor outputs into an invocation's params under a
/// `context` key, one entry per successful predecessor label. Failed
/// predecessors contribute nothing; the adapter sees only data.
fn with_context(params: &Value, predecessors: &[ToolResult]) -> Value {
    let gathered: serde_json::Map<String, Value> = predecessors
        .iter()
        .filter_map(|r| r.data.clone().map(|d| (r.label.clone(), d)))
        .collect();
    if gathered.is_empty() {
        return params.clone();
    }

    let mut merged = match params {
        Value::Object(map) => map.clone(),
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("params".to_string(), other.clone());
            map
        }
    };
    merged.insert("context".to_string(), Value::Object(gathered));
    Value::Object(merged)
}
