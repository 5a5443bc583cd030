//! Concierge: a personal-assistant backend.
//!
//! Each chat turn runs through a fixed pipeline: intent classification,
//! deterministic planning, budget-gated execution against capability
//! adapters and the retrieval index, response synthesis, and one bounded
//! reflection pass. Per-user memory, the spend ledger, sessions and the
//! document index persist in SQLite. Turns within a session are strictly
//! serialized; component failures degrade the reply instead of aborting
//! the turn.

pub mod budget;
pub mod capability;
pub mod config;
pub mod error;
pub mod executor;
pub mod feedback;
pub mod intent;
pub mod llm;
pub mod memory;
pub mod orchestrator;
pub mod planner;
pub mod reflection;
pub mod retrieval;
pub mod server;
pub mod session;
pub mod synthesizer;

pub use config::Config;
pub use error::{ToolErrorKind, TurnError};
pub use orchestrator::{Orchestrator, TurnOutcome, TurnRequest};
