//! Reading Agent Orchestrator
//!
//! The orchestration core of a guided paper-reading assistant:
//! - Walks each session through a guided intro (report → reading plan)
//! - Routes free-form questions to chapter-specialist agents
//! - Tracks which specialists a session has consulted
//! - Assembles document context for every generation call
//! - Degrades gracefully when the generation service fails
//!
//! SESSION FLOW:
//! GUIDE_PENDING_REPORT → GUIDE_PENDING_PLAN → CONTROL_ROUTING ⇄ CHAPTERS

pub mod api;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod inquiry;
pub mod models;
pub mod orchestrator;
pub mod prompts;
pub mod routing;
pub mod store;

pub use error::Result;

// Re-export common types
pub use models::*;
pub use orchestrator::{Orchestrator, TurnEvent};
