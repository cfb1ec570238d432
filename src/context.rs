//! Context assembly for generation calls
//!
//! Builds the single text blob handed to the LLM alongside the agent's
//! system prompt: document reference, derived full text (truncated),
//! side-channel context packages, the cached reading plan, and — for
//! routed chapter calls — the interaction-status annotation.

use crate::inquiry::InquiryStatus;
use crate::models::{AgentKind, Session};
use std::path::Path;
use tracing::{debug, warn};

/// Character budget for the inlined document text. Trades completeness
/// against the generation service's input-size limit.
const DEFAULT_MAX_DOCUMENT_CHARS: usize = 50_000;

const TRUNCATION_MARKER: &str = "\n\n... (content truncated)";

#[derive(Clone)]
pub struct ContextAssembler {
    max_document_chars: usize,
}

impl ContextAssembler {
    pub fn new() -> Self {
        Self {
            max_document_chars: DEFAULT_MAX_DOCUMENT_CHARS,
        }
    }

    pub fn with_max_document_chars(max_document_chars: usize) -> Self {
        Self { max_document_chars }
    }

    /// Build the base context string for a session.
    pub fn assemble(&self, session: &Session) -> String {
        let mut parts: Vec<String> = Vec::new();

        if let Some(paper_path) = &session.paper_path {
            parts.push(format!("Paper file: {}", paper_path));
        }

        if let Some(markdown_path) = &session.markdown_path {
            match self.read_document(markdown_path) {
                Some(content) => parts.push(format!("Paper content:\n{}", content)),
                None => warn!(path = %markdown_path, "document text unavailable, skipping"),
            }
        }

        if !session.context_packages.is_empty() {
            let mut block = String::from("Context packages:");
            for (key, value) in &session.context_packages {
                block.push_str(&format!("\n  - {}: {}", key, value));
            }
            parts.push(block);
        }

        if let Some(plan) = &session.reading_plan {
            parts.push(format!("Reading plan:\n{}", plan));
        }

        if parts.is_empty() {
            return "No session context available yet.".to_string();
        }

        parts.join("\n\n")
    }

    /// Build context for a routed chapter call, with the interaction-status
    /// annotation appended as the final segment so it carries maximal
    /// salience. Recomputed on every call: status may have changed since
    /// the last build.
    pub fn assemble_for_agent(
        &self,
        session: &Session,
        target: AgentKind,
        status: &InquiryStatus,
    ) -> String {
        let base = self.assemble(session);
        let is_first = status.is_first(target);

        debug!(
            agent = %target,
            first_inquiry = is_first,
            "attaching interaction-status annotation"
        );

        let mode_line = if is_first {
            "This is the user's FIRST question for this module. Respond in first-time guided framing."
        } else {
            "The user has asked about this module before. Respond in routine framing."
        };

        format!(
            "{base}\n\n===== Module interaction status =====\n\
             Current module: {module}\n\
             {mode_line}\n\
             =====================================",
            base = base,
            module = target.display_name(),
            mode_line = mode_line,
        )
    }

    fn read_document(&self, path: &str) -> Option<String> {
        if !Path::new(path).exists() {
            return None;
        }
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) => {
                warn!(path, error = %e, "failed to read document text");
                return None;
            }
        };

        debug!(path, chars = content.len(), "document text loaded");

        if content.chars().count() > self.max_document_chars {
            let truncated: String = content.chars().take(self.max_document_chars).collect();
            Some(format!("{}{}", truncated, TRUNCATION_MARKER))
        } else {
            Some(content)
        }
    }
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self::new()
    }
}
