//! Generation client for the external chat-completion service
//!
//! Translates (system prompt, context, user text, bounded history) into a
//! wire request and returns either a complete response string or a stream
//! of incremental fragments. Owns the retry/backoff policy (batch only)
//! and the apology fallbacks — callers above this layer never see a
//! transport failure as an error.
//!
//! Uses a long-lived reqwest::Client for connection pooling.

use crate::config::LlmConfig;
use crate::error::OrchestratorError;
use crate::models::{Turn, TurnRole};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Most recent history entries included verbatim; older entries are
/// dropped, not summarized.
const HISTORY_LIMIT: usize = 20;

/// Returned when the service produced an empty or whitespace-only reply.
pub const EMPTY_RESPONSE_APOLOGY: &str =
    "Sorry, I could not come up with a reply just now. Please try again or rephrase your question.";

/// Terminal, non-throwing outcome after retry exhaustion or a mid-stream
/// failure. Carries the last error's description for support/debugging.
pub fn apology_for(error: &OrchestratorError) -> String {
    format!(
        "Sorry, I ran into a problem and could not reply. Please try again later.\n\nError detail: {}",
        error
    )
}

/// One message in the wire-format conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// Transport seam to the chat-completion service. The production
/// implementation speaks the OpenAI wire format; tests and the demo
/// binary use [`MockTransport`].
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// One-shot completion. Empty choice lists and null content are
    /// errors so the retry policy above can see them.
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String>;

    /// Incremental completion. Each item is one opaque text fragment;
    /// an `Err` item ends the stream.
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<mpsc::UnboundedReceiver<Result<String>>>;
}

// =============================
// OpenAI-compatible transport
// =============================

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkResponse {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Debug, Deserialize, Default)]
struct ChunkDelta {
    content: Option<String>,
}

pub struct OpenAiTransport {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl OpenAiTransport {
    pub fn new(cfg: &LlmConfig) -> Self {
        let client = Client::builder()
            .timeout(cfg.request_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            api_key: cfg.api_key.clone(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            max_tokens: cfg.max_tokens,
        }
    }

    fn request_body(&self, messages: Vec<ChatMessage>, stream: bool) -> CompletionRequest {
        CompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream,
        }
    }

    async fn post(&self, body: &CompletionRequest) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!(%status, "chat completion request rejected");
            return Err(OrchestratorError::LlmError(format!(
                "API returned {}: {}",
                status, error_text
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl ChatTransport for OpenAiTransport {
    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String> {
        let body = self.request_body(messages, false);
        let response = self.post(&body).await?;

        let completion: CompletionResponse = response.json().await.map_err(|e| {
            OrchestratorError::LlmError(format!("failed to parse completion response: {}", e))
        })?;

        let Some(choice) = completion.choices.first() else {
            return Err(OrchestratorError::LlmError(
                "API returned an empty choices list".to_string(),
            ));
        };

        choice
            .message
            .content
            .clone()
            .ok_or_else(|| OrchestratorError::LlmError("API returned null content".to_string()))
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<mpsc::UnboundedReceiver<Result<String>>> {
        let body = self.request_body(messages, true);
        let mut response = self.post(&body).await?;

        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut buffer = String::new();

            loop {
                let chunk = match response.chunk().await {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => break,
                    Err(e) => {
                        let _ = tx.send(Err(OrchestratorError::LlmError(format!(
                            "stream interrupted: {}",
                            e
                        ))));
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&chunk));

                for data in drain_data_lines(&mut buffer) {
                    if data == "[DONE]" {
                        return;
                    }
                    let Ok(parsed) = serde_json::from_str::<ChunkResponse>(&data) else {
                        continue;
                    };
                    // A chunk without choices is skipped, not fatal.
                    let Some(choice) = parsed.choices.first() else {
                        continue;
                    };
                    if let Some(content) = &choice.delta.content {
                        if tx.send(Ok(content.clone())).is_err() {
                            return; // receiver dropped
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Extract complete `data:` payloads from an SSE buffer. Events are
/// delimited by `\n\n`; consumed bytes are drained in place and any
/// trailing partial event stays for the next call.
fn drain_data_lines(buffer: &mut String) -> Vec<String> {
    let mut data_lines = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        for line in block.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    data_lines.push(data.to_string());
                }
            }
        }
    }

    data_lines
}

// =============================
// Generation client
// =============================

/// Client wrapper owning message shaping, the history bound, retry with
/// exponential backoff, and apology substitution.
#[derive(Clone)]
pub struct GenerationClient {
    transport: Arc<dyn ChatTransport>,
    model: String,
    max_retries: u32,
    retry_base_delay: Duration,
}

impl GenerationClient {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        model: impl Into<String>,
        max_retries: u32,
        retry_base_delay: Duration,
    ) -> Self {
        Self {
            transport,
            model: model.into(),
            max_retries: max_retries.max(1),
            retry_base_delay,
        }
    }

    pub fn from_config(cfg: &LlmConfig) -> Self {
        Self::new(
            Arc::new(OpenAiTransport::new(cfg)),
            cfg.model.clone(),
            cfg.max_retries,
            cfg.retry_base_delay,
        )
    }

    /// Shape the wire conversation. Standard mode sends the system prompt
    /// and context as leading system messages. Model families without a
    /// system role (currently the gemini family) get both folded into the
    /// final user turn, with the assistant role label remapped to "model".
    pub(crate) fn build_messages(
        &self,
        system_prompt: &str,
        context: &str,
        user_message: &str,
        history: &[Turn],
    ) -> Vec<ChatMessage> {
        let recent = if history.len() > HISTORY_LIMIT {
            &history[history.len() - HISTORY_LIMIT..]
        } else {
            history
        };

        let no_system_role = self.model.to_lowercase().contains("gemini");

        let mut messages = Vec::with_capacity(recent.len() + 3);

        if no_system_role {
            for turn in recent {
                let role = match turn.role {
                    TurnRole::User => "user",
                    TurnRole::Assistant => "model",
                };
                messages.push(ChatMessage::new(role, turn.content.clone()));
            }

            let mut combined = system_prompt.to_string();
            if !context.is_empty() {
                combined.push_str("\n\nContext for the current session:\n\n");
                combined.push_str(context);
            }
            combined.push_str("\n\nUser question: ");
            combined.push_str(user_message);
            messages.push(ChatMessage::new("user", combined));
        } else {
            messages.push(ChatMessage::new("system", system_prompt));
            if !context.is_empty() {
                messages.push(ChatMessage::new(
                    "system",
                    format!("Context for the current session:\n\n{}", context),
                ));
            }
            for turn in recent {
                messages.push(ChatMessage::new(turn.role.as_str(), turn.content.clone()));
            }
            messages.push(ChatMessage::new("user", user_message));
        }

        messages
    }

    /// Batch generation. Never fails: transient errors are retried with
    /// exponential backoff (base delay doubling per attempt), exhaustion
    /// yields an apology string, and an empty/whitespace-only success is
    /// replaced by a fixed fallback.
    pub async fn generate(
        &self,
        system_prompt: &str,
        context: &str,
        user_message: &str,
        history: &[Turn],
    ) -> String {
        let messages = self.build_messages(system_prompt, context, user_message, history);

        let mut last_error = OrchestratorError::LlmError("no attempt made".to_string());

        for attempt in 0..self.max_retries {
            match self.transport.complete(messages.clone()).await {
                Ok(text) => {
                    if text.trim().is_empty() {
                        warn!("generation returned an empty response, substituting fallback");
                        return EMPTY_RESPONSE_APOLOGY.to_string();
                    }
                    return text;
                }
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max = self.max_retries,
                        error = %e,
                        "generation attempt failed"
                    );
                    last_error = e;

                    if attempt + 1 < self.max_retries {
                        let wait = self.retry_base_delay * 2u32.pow(attempt);
                        info!(wait_ms = wait.as_millis() as u64, "backing off before retry");
                        tokio::time::sleep(wait).await;
                    }
                }
            }
        }

        apology_for(&last_error)
    }

    /// Streaming generation. No retry: a failure before or during the
    /// stream emits one final apology fragment and ends the sequence.
    /// Unlike batch mode, an empty overall response is not post-checked.
    pub async fn generate_stream(
        &self,
        system_prompt: &str,
        context: &str,
        user_message: &str,
        history: &[Turn],
    ) -> mpsc::UnboundedReceiver<String> {
        let messages = self.build_messages(system_prompt, context, user_message, history);
        let transport = Arc::clone(&self.transport);

        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut upstream = match transport.stream(messages).await {
                Ok(upstream) => upstream,
                Err(e) => {
                    error!(error = %e, "stream could not be opened");
                    let _ = tx.send(apology_for(&e));
                    return;
                }
            };

            while let Some(item) = upstream.recv().await {
                match item {
                    Ok(fragment) => {
                        if tx.send(fragment).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        error!(error = %e, "stream failed mid-flight");
                        let _ = tx.send(apology_for(&e));
                        return;
                    }
                }
            }
        });

        rx
    }
}

// =============================
// Mock transport
// =============================

/// Scripted transport for tests and the demo binary. Responses are
/// consumed front to back; a scripted error fails that one call. Running
/// past the end of the script is a bug in the caller's scenario and
/// panics, so a path that makes more calls than scripted cannot pass
/// unnoticed. [`MockTransport::always`] repeats one answer instead.
pub struct MockTransport {
    script: std::sync::Mutex<std::collections::VecDeque<Result<String>>>,
    fallback: Option<String>,
}

impl MockTransport {
    pub fn new(script: Vec<Result<String>>) -> Self {
        Self {
            script: std::sync::Mutex::new(script.into_iter().collect()),
            fallback: None,
        }
    }

    /// Answer every call with the same response, forever.
    pub fn always(response: impl Into<String>) -> Self {
        Self {
            script: std::sync::Mutex::new(std::collections::VecDeque::new()),
            fallback: Some(response.into()),
        }
    }

    fn next(&self) -> Result<String> {
        let mut script = self.script.lock().expect("mock script poisoned");
        if let Some(item) = script.pop_front() {
            return item;
        }
        match &self.fallback {
            Some(text) => Ok(text.clone()),
            None => panic!("mock transport script exhausted: unscripted call made"),
        }
    }
}

#[async_trait]
impl ChatTransport for MockTransport {
    async fn complete(&self, _messages: Vec<ChatMessage>) -> Result<String> {
        self.next()
    }

    async fn stream(
        &self,
        _messages: Vec<ChatMessage>,
    ) -> Result<mpsc::UnboundedReceiver<Result<String>>> {
        let next = self.next();
        let (tx, rx) = mpsc::unbounded_channel();

        match next {
            Ok(text) => {
                // Deliver in small fragments so consumers exercise real
                // incremental assembly.
                let chars: Vec<char> = text.chars().collect();
                for piece in chars.chunks(8) {
                    let _ = tx.send(Ok(piece.iter().collect()));
                }
            }
            Err(e) => {
                let _ = tx.send(Err(e));
            }
        }

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Turn, TurnRole};
    use std::time::Instant;

    fn fast_client(transport: MockTransport) -> GenerationClient {
        GenerationClient::new(
            Arc::new(transport),
            "gpt-4o",
            3,
            Duration::from_millis(20),
        )
    }

    fn llm_err(msg: &str) -> OrchestratorError {
        OrchestratorError::LlmError(msg.to_string())
    }

    #[tokio::test]
    async fn test_retry_backoff_then_success() {
        let transport = MockTransport::new(vec![
            Err(llm_err("connection reset")),
            Err(llm_err("connection reset")),
            Ok("RSI stands for relative strength index.".to_string()),
        ]);
        let client = fast_client(transport);

        let started = Instant::now();
        let answer = client.generate("prompt", "", "what is RSI?", &[]).await;
        let elapsed = started.elapsed();

        assert_eq!(answer, "RSI stands for relative strength index.");
        // Two backoff sleeps: base + 2*base.
        assert!(elapsed >= Duration::from_millis(60), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_retry_exhaustion_returns_apology() {
        let transport = MockTransport::new(vec![
            Err(llm_err("503")),
            Err(llm_err("503")),
            Err(llm_err("503 final")),
        ]);
        let client = fast_client(transport);

        let answer = client.generate("prompt", "", "hello", &[]).await;
        assert!(answer.contains("Sorry"));
        assert!(answer.contains("503 final"));
    }

    #[tokio::test]
    async fn test_empty_response_substituted() {
        let client = fast_client(MockTransport::new(vec![Ok("   \n".to_string())]));
        let answer = client.generate("prompt", "", "hello", &[]).await;
        assert_eq!(answer, EMPTY_RESPONSE_APOLOGY);
    }

    #[tokio::test]
    async fn test_stream_concatenation_matches_batch() {
        let text = "The methods section describes a transformer encoder.";
        let batch_client = fast_client(MockTransport::new(vec![Ok(text.to_string())]));
        let stream_client = fast_client(MockTransport::new(vec![Ok(text.to_string())]));

        let batch = batch_client.generate("prompt", "", "q", &[]).await;

        let mut rx = stream_client.generate_stream("prompt", "", "q", &[]).await;
        let mut streamed = String::new();
        while let Some(fragment) = rx.recv().await {
            streamed.push_str(&fragment);
        }

        assert_eq!(batch, streamed);
    }

    #[tokio::test]
    async fn test_stream_failure_emits_single_apology_fragment() {
        let client = fast_client(MockTransport::new(vec![Err(llm_err("socket closed"))]));

        let mut rx = client.generate_stream("prompt", "", "q", &[]).await;
        let mut fragments = Vec::new();
        while let Some(fragment) = rx.recv().await {
            fragments.push(fragment);
        }

        assert_eq!(fragments.len(), 1);
        assert!(fragments[0].contains("socket closed"));
    }

    #[test]
    fn test_history_bounded_to_recent_entries() {
        let client = fast_client(MockTransport::always("ok"));

        let history: Vec<Turn> = (0..30)
            .map(|i| Turn::new(TurnRole::User, format!("question {}", i)))
            .collect();

        let messages = client.build_messages("prompt", "ctx", "latest", &history);

        // system prompt + system context + 20 history + current user turn
        assert_eq!(messages.len(), 23);
        // Oldest retained entry is turn 10.
        assert!(messages[2].content.contains("question 10"));
        assert!(!messages.iter().any(|m| m.content.contains("question 9")));
    }

    #[test]
    fn test_gemini_shaping_has_no_system_role() {
        let client = GenerationClient::new(
            Arc::new(MockTransport::always("ok")),
            "gemini-2.0-flash",
            3,
            Duration::from_millis(1),
        );

        let history = vec![
            Turn::new(TurnRole::User, "hi"),
            Turn::new(TurnRole::Assistant, "hello"),
        ];
        let messages = client.build_messages("You are a guide.", "some context", "next q", &history);

        assert!(messages.iter().all(|m| m.role != "system"));
        assert_eq!(messages[1].role, "model");
        let last = messages.last().unwrap();
        assert_eq!(last.role, "user");
        assert!(last.content.contains("You are a guide."));
        assert!(last.content.contains("some context"));
        assert!(last.content.contains("User question: next q"));
    }

    #[tokio::test]
    #[should_panic(expected = "script exhausted")]
    async fn test_scripted_transport_panics_past_end_of_script() {
        let transport = MockTransport::new(vec![Ok("only answer".to_string())]);
        let _ = transport.complete(vec![]).await;
        let _ = transport.complete(vec![]).await;
    }

    #[tokio::test]
    async fn test_always_transport_repeats() {
        let transport = MockTransport::always("steady answer");
        assert_eq!(transport.complete(vec![]).await.unwrap(), "steady answer");
        assert_eq!(transport.complete(vec![]).await.unwrap(), "steady answer");
    }

    #[test]
    fn test_drain_data_lines() {
        let mut buffer = String::from(
            "data: {\"a\":1}\n\ndata: [DONE]\n\ndata: {\"partial\":",
        );
        let lines = drain_data_lines(&mut buffer);
        assert_eq!(lines, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
        // Partial event retained for the next chunk.
        assert_eq!(buffer, "data: {\"partial\":");
    }
}
