//! Core data types: agents, session states, sessions, and turns

use crate::inquiry::InquiryStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// The fixed set of response generators a turn can be routed to.
///
/// Guidance and Control drive the guided workflow; the rest answer
/// questions about a specific part of the paper (or anything, for General).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Guidance,
    Control,
    Introduction,
    Review,
    Method,
    Result,
    Discussion,
    General,
    Concept,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Guidance => "guidance",
            AgentKind::Control => "control",
            AgentKind::Introduction => "introduction",
            AgentKind::Review => "review",
            AgentKind::Method => "method",
            AgentKind::Result => "result",
            AgentKind::Discussion => "discussion",
            AgentKind::General => "general",
            AgentKind::Concept => "concept",
        }
    }

    /// Parse a bare identifier, tolerating the conventional `_agent` suffix
    /// the control agent tends to produce ("review_agent" → Review).
    pub fn parse(name: &str) -> Option<Self> {
        let bare = name.trim().strip_suffix("_agent").unwrap_or(name.trim());
        match bare {
            "guidance" => Some(AgentKind::Guidance),
            "control" => Some(AgentKind::Control),
            "introduction" => Some(AgentKind::Introduction),
            "review" => Some(AgentKind::Review),
            "method" => Some(AgentKind::Method),
            "result" => Some(AgentKind::Result),
            "discussion" => Some(AgentKind::Discussion),
            "general" => Some(AgentKind::General),
            "concept" => Some(AgentKind::Concept),
            _ => None,
        }
    }

    /// Human-readable label used in the response trailer.
    pub fn display_name(&self) -> &'static str {
        match self {
            AgentKind::Guidance => "Guidance",
            AgentKind::Control => "Control",
            AgentKind::Introduction => "Introduction",
            AgentKind::Review => "Literature Review",
            AgentKind::Method => "Methods",
            AgentKind::Result => "Results",
            AgentKind::Discussion => "Discussion",
            AgentKind::General => "General",
            AgentKind::Concept => "Concepts",
        }
    }

    /// Chapter state this agent maps to. Agents without a chapter
    /// (guidance, control, general, concept) return None and the
    /// session stays in `ControlRouting`.
    pub fn chapter_state(&self) -> Option<SessionState> {
        match self {
            AgentKind::Introduction => Some(SessionState::Introduction),
            AgentKind::Review => Some(SessionState::Review),
            AgentKind::Method => Some(SessionState::Method),
            AgentKind::Result => Some(SessionState::Result),
            AgentKind::Discussion => Some(SessionState::Discussion),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// FSM state of a guided reading session.
///
/// GUIDE_PENDING_REPORT → GUIDE_PENDING_PLAN → CONTROL_ROUTING ⇄ chapters.
/// No terminal state; the machine runs for the life of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    GuidePendingReport,
    GuidePendingPlan,
    ControlRouting,
    Introduction,
    Review,
    Method,
    Result,
    Discussion,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::GuidePendingReport => "GUIDE_PENDING_REPORT",
            SessionState::GuidePendingPlan => "GUIDE_PENDING_PLAN",
            SessionState::ControlRouting => "CONTROL_ROUTING",
            SessionState::Introduction => "INTRODUCTION",
            SessionState::Review => "REVIEW",
            SessionState::Method => "METHOD",
            SessionState::Result => "RESULT",
            SessionState::Discussion => "DISCUSSION",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "GUIDE_PENDING_REPORT" => Some(SessionState::GuidePendingReport),
            "GUIDE_PENDING_PLAN" => Some(SessionState::GuidePendingPlan),
            "CONTROL_ROUTING" => Some(SessionState::ControlRouting),
            "INTRODUCTION" => Some(SessionState::Introduction),
            "REVIEW" => Some(SessionState::Review),
            "METHOD" => Some(SessionState::Method),
            "RESULT" => Some(SessionState::Result),
            "DISCUSSION" => Some(SessionState::Discussion),
            _ => None,
        }
    }

    /// Agent that answers turns arriving in this state.
    pub fn agent(&self) -> AgentKind {
        match self {
            SessionState::GuidePendingReport => AgentKind::Guidance,
            SessionState::GuidePendingPlan => AgentKind::Guidance,
            SessionState::ControlRouting => AgentKind::Control,
            SessionState::Introduction => AgentKind::Introduction,
            SessionState::Review => AgentKind::Review,
            SessionState::Method => AgentKind::Method,
            SessionState::Result => AgentKind::Result,
            SessionState::Discussion => AgentKind::Discussion,
        }
    }

    /// States where every incoming question is re-routed through the
    /// control agent. Deliberately excludes GUIDE_PENDING_PLAN, which is
    /// sticky so the guidance agent can decide the reroute itself.
    pub fn reroutes_on_message(&self) -> bool {
        matches!(
            self,
            SessionState::ControlRouting
                | SessionState::Introduction
                | SessionState::Review
                | SessionState::Method
                | SessionState::Result
                | SessionState::Discussion
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role of a turn in the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }
}

/// One message exchange unit. Immutable once appended to a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// One guided-conversation instance.
///
/// Owned exclusively by the orchestration core for the duration of a turn;
/// the store persists it between turns (single writer per session assumed,
/// not enforced here).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub current_state: SessionState,
    /// Reference to the uploaded source document.
    pub paper_path: Option<String>,
    /// Derived full text of the document, stored as a markdown file.
    pub markdown_path: Option<String>,
    /// Ordered, append-only turn log.
    pub chat_history: Vec<Turn>,
    /// Per-agent "has been consulted" flags. Monotone: never reset.
    pub inquiry_status: InquiryStatus,
    /// Free-form side-channel notes attached to the session.
    pub context_packages: BTreeMap<String, String>,
    /// Cached reading plan, computed once by the guidance agent.
    pub reading_plan: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(user_id: Uuid, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            user_id,
            title: title.into(),
            current_state: SessionState::GuidePendingReport,
            paper_path: None,
            markdown_path: None,
            chat_history: Vec::new(),
            inquiry_status: InquiryStatus::default(),
            context_packages: BTreeMap::new(),
            reading_plan: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update applied by `SessionStore::update`. Unset fields are
/// left untouched; each call is atomic but calls do not compose into a
/// transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionPatch {
    pub current_state: Option<SessionState>,
    pub inquiry_status: Option<InquiryStatus>,
    pub reading_plan: Option<String>,
}

impl SessionPatch {
    pub fn state(state: SessionState) -> Self {
        Self {
            current_state: Some(state),
            ..Default::default()
        }
    }

    pub fn inquiry(status: InquiryStatus) -> Self {
        Self {
            inquiry_status: Some(status),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_parse_strips_suffix() {
        assert_eq!(AgentKind::parse("review_agent"), Some(AgentKind::Review));
        assert_eq!(AgentKind::parse("review"), Some(AgentKind::Review));
        assert_eq!(AgentKind::parse(" method_agent "), Some(AgentKind::Method));
        assert_eq!(AgentKind::parse("unknown_agent"), None);
    }

    #[test]
    fn test_state_agent_mapping_is_total() {
        let states = [
            SessionState::GuidePendingReport,
            SessionState::GuidePendingPlan,
            SessionState::ControlRouting,
            SessionState::Introduction,
            SessionState::Review,
            SessionState::Method,
            SessionState::Result,
            SessionState::Discussion,
        ];
        for state in states {
            // Every state resolves to some agent without panicking.
            let _ = state.agent();
            assert_eq!(SessionState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn test_chapter_state_round_trip() {
        for agent in [
            AgentKind::Introduction,
            AgentKind::Review,
            AgentKind::Method,
            AgentKind::Result,
            AgentKind::Discussion,
        ] {
            let state = agent.chapter_state().unwrap();
            assert_eq!(state.agent(), agent);
        }
        assert_eq!(AgentKind::General.chapter_state(), None);
        assert_eq!(AgentKind::Concept.chapter_state(), None);
    }

    #[test]
    fn test_reroute_states() {
        assert!(SessionState::Review.reroutes_on_message());
        assert!(SessionState::ControlRouting.reroutes_on_message());
        assert!(!SessionState::GuidePendingPlan.reroutes_on_message());
        assert!(!SessionState::GuidePendingReport.reroutes_on_message());
    }

    #[test]
    fn test_session_state_serde_wire_format() {
        let json = serde_json::to_string(&SessionState::GuidePendingReport).unwrap();
        assert_eq!(json, "\"GUIDE_PENDING_REPORT\"");
        let state: SessionState = serde_json::from_str("\"CONTROL_ROUTING\"").unwrap();
        assert_eq!(state, SessionState::ControlRouting);
    }
}
