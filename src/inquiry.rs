//! Per-session inquiry status tracking
//!
//! Records, per chapter agent, whether the user has reached that agent's
//! chapter before. Drives the first-time vs routine framing annotation in
//! the assembled context.

use crate::models::AgentKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Agent → "has been consulted" map. Monotone: a true entry is never
/// reset within a session's lifetime.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InquiryStatus(BTreeMap<AgentKind, bool>);

impl InquiryStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff the user has never reached this agent's chapter.
    pub fn is_first(&self, agent: AgentKind) -> bool {
        !self.0.get(&agent).copied().unwrap_or(false)
    }

    /// Mark an agent as consulted. Idempotent: marking an already-true
    /// entry is a no-op. Returns whether anything changed.
    pub fn mark_consulted(&mut self, agent: AgentKind) -> bool {
        let entry = self.0.entry(agent).or_insert(false);
        let changed = !*entry;
        *entry = true;
        changed
    }

    pub fn iter(&self) -> impl Iterator<Item = (AgentKind, bool)> + '_ {
        self.0.iter().map(|(k, v)| (*k, *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_first() {
        let status = InquiryStatus::new();
        assert!(status.is_first(AgentKind::Review));
        assert!(status.is_first(AgentKind::General));
    }

    #[test]
    fn test_mark_consulted_idempotent() {
        let mut status = InquiryStatus::new();

        assert!(status.mark_consulted(AgentKind::Method));
        assert!(!status.is_first(AgentKind::Method));

        // Second call is a no-op and the flag stays true.
        assert!(!status.mark_consulted(AgentKind::Method));
        assert!(!status.is_first(AgentKind::Method));
    }

    #[test]
    fn test_agents_tracked_independently() {
        let mut status = InquiryStatus::new();
        status.mark_consulted(AgentKind::Introduction);

        assert!(!status.is_first(AgentKind::Introduction));
        assert!(status.is_first(AgentKind::Discussion));
    }

    #[test]
    fn test_serde_round_trip() {
        let mut status = InquiryStatus::new();
        status.mark_consulted(AgentKind::Review);

        let json = serde_json::to_string(&status).unwrap();
        let restored: InquiryStatus = serde_json::from_str(&json).unwrap();
        assert!(!restored.is_first(AgentKind::Review));
        assert!(restored.is_first(AgentKind::Method));
    }
}
