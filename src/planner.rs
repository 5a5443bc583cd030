//! Planning Engine
//!
//! Expands a classified intent into an ordered plan of actions. Planning
//! is fully deterministic over (intent, grants, memory summary): there is
//! no model call in this stage, so identical inputs always produce the
//! identical plan. Capabilities the user has not authorized are omitted
//! and replaced by a plan note telling the synthesizer to ask for
//! authorization.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::capability::Capability;
use crate::intent::{ClassifiedIntent, Intent};
use crate::memory::MemorySummary;

/// One planned step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionKind {
    /// Call an external capability through its adapter.
    InvokeCapability { capability: Capability, params: Value },
    /// Similarity search over the user's indexed documents.
    Retrieve { query: String, k: usize },
    /// No external work; answer from context alone.
    RespondDirectly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Stable label used to join results back to the plan.
    pub label: String,
    pub kind: ActionKind,
    /// Labels of actions whose output this one needs. Dependent actions
    /// run sequentially after the independent batch.
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl Action {
    pub fn invoke(label: &str, capability: Capability, params: Value) -> Self {
        Self {
            label: label.to_string(),
            kind: ActionKind::InvokeCapability { capability, params },
            depends_on: vec![],
        }
    }

    pub fn retrieve(label: &str, query: &str, k: usize) -> Self {
        Self {
            label: label.to_string(),
            kind: ActionKind::Retrieve {
                query: query.to_string(),
                k,
            },
            depends_on: vec![],
        }
    }

    pub fn respond_directly() -> Self {
        Self {
            label: "respond".to_string(),
            kind: ActionKind::RespondDirectly,
            depends_on: vec![],
        }
    }

    pub fn after(mut self, label: &str) -> Self {
        self.depends_on.push(label.to_string());
        self
    }

    /// Whether executing this action costs money.
    pub fn is_paid(&self) -> bool {
        !matches!(self.kind, ActionKind::RespondDirectly)
    }
}

/// Ordered action sequence plus notes for the synthesizer. A plan with
/// zero actions is a valid, purely conversational turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub actions: Vec<Action>,
    /// Free-text guidance for the synthesizer (authorization requests,
    /// degradation hints). Never shown verbatim to the user.
    pub notes: Vec<String>,
}

/// Which delegated-auth scopes the user has granted.
#[derive(Debug, Clone, Default)]
pub struct CapabilityGrants {
    scopes: HashSet<String>,
}

impl CapabilityGrants {
    pub fn new<I: IntoIterator<Item = String>>(scopes: I) -> Self {
        Self {
            scopes: scopes.into_iter().collect(),
        }
    }

    /// True when the capability either needs no scope or its scope was
    /// granted.
    pub fn allows(&self, capability: Capability) -> bool {
        match capability.required_scope() {
            None => true,
            Some(scope) => self.scopes.contains(scope),
        }
    }
}

/// Deterministic intent → plan expansion.
pub struct PlanningEngine {
    retrieve_k: usize,
}

impl Default for PlanningEngine {
    fn default() -> Self {
        Self { retrieve_k: 5 }
    }
}

impl PlanningEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn plan(
        &self,
        classified: &ClassifiedIntent,
        grants: &CapabilityGrants,
        memory: &MemorySummary,
    ) -> Plan {
        let mut plan = Plan::default();
        let params = &classified.params;

        match classified.intent {
            Intent::CalendarQuery => {
                self.push_capability(
                    &mut plan,
                    grants,
                    Capability::Calendar,
                    serde_json::json!({
                        "time_range": params.time_range.as_deref().unwrap_or("today"),
                    }),
                );
                self.push_query_retrieve(&mut plan, params.query.as_deref());
            }
            Intent::MailSearch => {
                let mail_params = serde_json::json!({
                    "sender": params.sender,
                    "query": params.query,
                });
                // A dated mail search fetches the matching calendar
                // window first so the mail lookup runs with the events
                // in context.
                if params.time_range.is_some()
                    && grants.allows(Capability::Calendar)
                    && grants.allows(Capability::Mail)
                {
                    plan.actions.push(Action::invoke(
                        "calendar",
                        Capability::Calendar,
                        serde_json::json!({ "time_range": params.time_range }),
                    ));
                    plan.actions.push(
                        Action::invoke("mail", Capability::Mail, mail_params).after("calendar"),
                    );
                } else {
                    self.push_capability(&mut plan, grants, Capability::Mail, mail_params);
                }
                self.push_query_retrieve(&mut plan, params.query.as_deref());
            }
            Intent::DriveSearch => {
                self.push_capability(
                    &mut plan,
                    grants,
                    Capability::Drive,
                    serde_json::json!({ "query": params.query }),
                );
                self.push_query_retrieve(&mut plan, params.query.as_deref());
            }
            Intent::WeatherQuery => {
                // Fall back to the user's remembered location.
                let location = params
                    .location
                    .clone()
                    .or_else(|| memory.fact("location").map(|f| f.text.clone()));
                match location {
                    Some(location) => {
                        plan.actions.push(Action::invoke(
                            "weather",
                            Capability::Weather,
                            serde_json::json!({ "location": location }),
                        ));
                    }
                    None => {
                        plan.notes.push(
                            "No location known; ask the user where they are.".to_string(),
                        );
                        plan.actions.push(Action::respond_directly());
                    }
                }
            }
            Intent::DocQuery => {
                let query = params.query.clone().unwrap_or_default();
                if query.is_empty() {
                    plan.actions.push(Action::respond_directly());
                } else {
                    plan.actions.push(Action::retrieve("retrieve", &query, self.retrieve_k));
                }
            }
            Intent::GeneralChat => {
                // A question from a user with accumulated facts may be
                // answerable from their indexed documents.
                match params.query.as_deref() {
                    Some(query) if !memory.facts.is_empty() => {
                        plan.actions.push(Action::retrieve("retrieve", query, self.retrieve_k));
                    }
                    _ => plan.actions.push(Action::respond_directly()),
                }
            }
        }

        plan
    }

    fn push_query_retrieve(&self, plan: &mut Plan, query: Option<&str>) {
        if let Some(query) = query {
            if !query.is_empty() {
                plan.actions.push(Action::retrieve("retrieve", query, self.retrieve_k));
            }
        }
    }

    fn push_capability(
        &self,
        plan: &mut Plan,
        grants: &CapabilityGrants,
        capability: Capability,
        params: Value,
    ) {
        if grants.allows(capability) {
            plan.actions
                .push(Action::invoke(capability.as_str(), capability, params));
        } else {
            // Not an error: the synthesizer turns this into an
            // authorization request instead of silently failing.
            plan.notes.push(format!(
                "Access to {} is not authorized; ask the user to grant the {} scope.",
                capability.user_facing(),
                capability.required_scope().unwrap_or("required"),
            ));
            plan.actions.push(Action::respond_directly());
        }
    }
}
