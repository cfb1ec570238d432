//! Routing decision parser
//!
//! LLM output is expected to carry a machine-readable JSON hint, but the
//! surrounding text is free-form and the hint is frequently malformed or
//! wrapped in prose. Extraction is best-effort across three tiers, applied
//! in order:
//!
//! 1. parse the whole response as JSON
//! 2. parse the first ```json fenced block
//! 3. parse the first brace-delimited substring
//!
//! All tiers fail soft: no usable hint means `NotFound`, never an error.

use crate::models::AgentKind;
use serde_json::Value;
use tracing::{debug, warn};

/// Outcome of scanning a control-agent response for a target agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingHint {
    Found(AgentKind),
    NotFound,
}

impl RoutingHint {
    /// Resolve to a concrete agent, defaulting to the generic fallback.
    pub fn unwrap_or_general(self) -> AgentKind {
        match self {
            RoutingHint::Found(agent) => agent,
            RoutingHint::NotFound => AgentKind::General,
        }
    }
}

/// Tier 1: the whole response is a JSON object.
fn parse_whole(text: &str) -> Option<Value> {
    serde_json::from_str::<Value>(text.trim())
        .ok()
        .filter(Value::is_object)
}

/// Tier 2: the first fenced block (```json or bare ```) holds a JSON object.
fn parse_fenced(text: &str) -> Option<Value> {
    let start = text.find("```")?;
    let body = &text[start + 3..];
    let body = body.strip_prefix("json").unwrap_or(body);
    let end = body.find("```")?;
    serde_json::from_str::<Value>(body[..end].trim())
        .ok()
        .filter(Value::is_object)
}

/// Tier 3: the first `{ ... }` substring (non-nested, matching the first
/// closing brace). Only the first candidate is attempted; multiple hints
/// in one response are not disambiguated.
fn parse_braced(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text[start..].find('}')? + start;
    serde_json::from_str::<Value>(&text[start..=end])
        .ok()
        .filter(Value::is_object)
}

/// Run the tiers in order and return the first JSON object found.
fn extract_hint_object(text: &str) -> Option<Value> {
    parse_whole(text)
        .or_else(|| parse_fenced(text))
        .or_else(|| parse_braced(text))
}

/// Extract the target agent from a control-agent response containing an
/// `{"agent_name": "..."}` hint. Unknown names and missing hints resolve
/// to `NotFound`; the caller falls back to the general agent.
pub fn resolve_target_agent(response: &str) -> RoutingHint {
    let Some(hint) = extract_hint_object(response) else {
        warn!("no routing hint found in control response");
        return RoutingHint::NotFound;
    };

    let Some(name) = hint.get("agent_name").and_then(Value::as_str) else {
        warn!("routing hint parsed but carries no agent_name");
        return RoutingHint::NotFound;
    };

    match AgentKind::parse(name) {
        Some(agent) => {
            debug!(agent = %agent, raw = name, "routing decision resolved");
            RoutingHint::Found(agent)
        }
        None => {
            warn!(raw = name, "routing hint names an unknown agent");
            RoutingHint::NotFound
        }
    }
}

/// Detect the guidance agent's `{"route": "content_question"}` marker,
/// which asks the controller to answer the user's original question via
/// content routing instead of returning the plan text.
pub fn detect_content_reroute(response: &str) -> bool {
    extract_hint_object(response)
        .and_then(|hint| {
            hint.get("route")
                .and_then(Value::as_str)
                .map(|route| route == "content_question")
        })
        .unwrap_or(false)
}
