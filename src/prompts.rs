//! Prompt template provider
//!
//! Each agent has a system prompt stored under a versioned directory
//! (`<dir>/<version>/<agent>.md`). A missing template is a configuration
//! error, fatal to the turn that needs it but not to the process.

use crate::error::OrchestratorError;
use crate::models::AgentKind;
use crate::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use tracing::debug;

/// Provider seam so tests and the demo binary can supply prompts inline.
pub trait PromptProvider: Send + Sync {
    fn get(&self, agent: AgentKind) -> Result<String>;
}

/// File-backed provider with an in-process cache. Templates are versioned
/// externally; this reads one version per process.
pub struct FilePromptProvider {
    root: PathBuf,
    version: String,
    cache: RwLock<HashMap<AgentKind, String>>,
}

impl FilePromptProvider {
    pub fn new(root: impl Into<PathBuf>, version: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            version: version.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn template_path(&self, agent: AgentKind) -> PathBuf {
        self.root
            .join(&self.version)
            .join(format!("{}.md", agent.as_str()))
    }
}

impl PromptProvider for FilePromptProvider {
    fn get(&self, agent: AgentKind) -> Result<String> {
        {
            let cache = self.cache.read().expect("prompt cache poisoned");
            if let Some(prompt) = cache.get(&agent) {
                return Ok(prompt.clone());
            }
        }

        let path = self.template_path(agent);
        let prompt = std::fs::read_to_string(&path).map_err(|e| {
            OrchestratorError::PromptError(format!(
                "no template for agent '{}' at {}: {}",
                agent,
                path.display(),
                e
            ))
        })?;

        debug!(agent = %agent, path = %path.display(), "prompt template loaded");

        let mut cache = self.cache.write().expect("prompt cache poisoned");
        cache.insert(agent, prompt.clone());
        Ok(prompt)
    }
}

/// In-memory provider for tests and demos.
pub struct StaticPromptProvider {
    prompts: HashMap<AgentKind, String>,
}

impl StaticPromptProvider {
    pub fn new(prompts: HashMap<AgentKind, String>) -> Self {
        Self { prompts }
    }

    /// Same placeholder prompt for every agent.
    pub fn uniform(text: impl Into<String>) -> Self {
        let text = text.into();
        let prompts = [
            AgentKind::Guidance,
            AgentKind::Control,
            AgentKind::Introduction,
            AgentKind::Review,
            AgentKind::Method,
            AgentKind::Result,
            AgentKind::Discussion,
            AgentKind::General,
            AgentKind::Concept,
        ]
        .into_iter()
        .map(|agent| (agent, text.clone()))
        .collect();

        Self { prompts }
    }
}

impl PromptProvider for StaticPromptProvider {
    fn get(&self, agent: AgentKind) -> Result<String> {
        self.prompts.get(&agent).cloned().ok_or_else(|| {
            OrchestratorError::PromptError(format!("no template registered for agent '{}'", agent))
        })
    }
}
