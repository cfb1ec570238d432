//! FSM controller - the orchestration core
//!
//! Owns the state transition rules, decides which agent handles the
//! current turn, and computes the resulting state. Persistence of turns
//! and the final state belongs to the caller; the one store write this
//! module performs itself is the inquiry-status update after a routed
//! chapter response.
//!
//! Workflow: GUIDE_PENDING_REPORT → GUIDE_PENDING_PLAN → CONTROL_ROUTING
//! ⇄ chapter states. Once past the guided intro, every user message is
//! treated as a fresh question and re-routed through the control agent,
//! even an apparent follow-up to the same chapter.

use crate::client::GenerationClient;
use crate::context::ContextAssembler;
use crate::models::{AgentKind, Session, SessionPatch, SessionState};
use crate::prompts::PromptProvider;
use crate::routing;
use crate::store::SessionStore;
use crate::Result;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Event emitted by the streaming turn variant. Consumers receive zero
/// or more fragments followed by exactly one `Done`.
#[derive(Debug, Clone)]
pub enum TurnEvent {
    Fragment(String),
    Done {
        state: SessionState,
        full_response: String,
    },
}

#[derive(Clone)]
pub struct Orchestrator {
    client: GenerationClient,
    prompts: Arc<dyn PromptProvider>,
    store: Arc<dyn SessionStore>,
    assembler: ContextAssembler,
}

impl Orchestrator {
    pub fn new(
        client: GenerationClient,
        prompts: Arc<dyn PromptProvider>,
        store: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            client,
            prompts,
            store,
            assembler: ContextAssembler::new(),
        }
    }

    /// Process one user turn. Returns the response text and the session's
    /// next state; appending turns and writing the final state are the
    /// caller's responsibility.
    ///
    /// Generation failures never abort the turn (the client substitutes
    /// an apology); only configuration errors (missing prompt template)
    /// and store failures surface as errors.
    pub async fn process_turn(
        &self,
        user_text: &str,
        session: &Session,
    ) -> Result<(String, SessionState)> {
        let state = session.current_state;

        info!(
            session_id = %session.session_id,
            state = %state,
            empty_turn = user_text.is_empty(),
            "processing turn"
        );

        // Chapter states and CONTROL_ROUTING always re-route a new
        // question. GUIDE_PENDING_PLAN is sticky: the guidance agent
        // decides the reroute itself via the embedded hint.
        if state.reroutes_on_message() && !user_text.is_empty() {
            return self.handle_control_routing(user_text, session).await;
        }

        let agent = state.agent();
        let system_prompt = self.prompts.get(agent)?;
        let context = self.assembler.assemble(session);

        let response = self
            .client
            .generate(&system_prompt, &context, user_text, &session.chat_history)
            .await;

        if state == SessionState::GuidePendingPlan && routing::detect_content_reroute(&response) {
            // The plan agent flagged the message as a content question.
            // Substitute the routed answer; the hint-bearing text is
            // never shown to the user.
            info!(session_id = %session.session_id, "reroute hint detected, forwarding to content routing");
            return self.handle_control_routing(user_text, session).await;
        }

        let new_state = Self::next_state(state, user_text, session);
        debug!(from = %state, to = %new_state, "state transition");

        Ok((response, new_state))
    }

    /// Streaming variant: yields fragments as they arrive, terminated by
    /// one `Done` carrying the final state and assembled response. The
    /// final state is only known once the full response is (hint
    /// detection needs the whole text), so `GUIDE_PENDING_PLAN` buffers
    /// the guidance response before emitting anything.
    pub async fn process_turn_stream(
        &self,
        user_text: &str,
        session: &Session,
    ) -> mpsc::UnboundedReceiver<TurnEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let this = self.clone();
        let user_text = user_text.to_string();
        let session = session.clone();

        tokio::spawn(async move {
            this.drive_stream(&user_text, &session, tx).await;
        });

        rx
    }

    async fn drive_stream(
        &self,
        user_text: &str,
        session: &Session,
        tx: mpsc::UnboundedSender<TurnEvent>,
    ) {
        let state = session.current_state;

        if state.reroutes_on_message() && !user_text.is_empty() {
            self.stream_control_routing(user_text, session, &tx).await;
            return;
        }

        let agent = state.agent();
        let system_prompt = match self.prompts.get(agent) {
            Ok(prompt) => prompt,
            Err(e) => {
                // Configuration failure: the turn still yields a response
                // and an (unchanged) state rather than a dropped stream.
                warn!(error = %e, "prompt unavailable for streamed turn");
                let text = crate::client::apology_for(&e);
                let _ = tx.send(TurnEvent::Fragment(text.clone()));
                let _ = tx.send(TurnEvent::Done {
                    state,
                    full_response: text,
                });
                return;
            }
        };
        let context = self.assembler.assemble(session);

        if state == SessionState::GuidePendingPlan {
            // Collect the full guidance response first; the reroute hint
            // can only be detected on the complete text.
            let mut upstream = self
                .client
                .generate_stream(&system_prompt, &context, user_text, &session.chat_history)
                .await;
            let mut full_response = String::new();
            while let Some(fragment) = upstream.recv().await {
                full_response.push_str(&fragment);
            }

            if routing::detect_content_reroute(&full_response) {
                info!(session_id = %session.session_id, "reroute hint detected in streamed plan turn");
                self.stream_control_routing(user_text, session, &tx).await;
                return;
            }

            let _ = tx.send(TurnEvent::Fragment(full_response.clone()));
            let _ = tx.send(TurnEvent::Done {
                state: Self::next_state(state, user_text, session),
                full_response,
            });
            return;
        }

        let mut upstream = self
            .client
            .generate_stream(&system_prompt, &context, user_text, &session.chat_history)
            .await;
        let mut full_response = String::new();
        while let Some(fragment) = upstream.recv().await {
            full_response.push_str(&fragment);
            if tx.send(TurnEvent::Fragment(fragment)).is_err() {
                return;
            }
        }

        let _ = tx.send(TurnEvent::Done {
            state: Self::next_state(state, user_text, session),
            full_response,
        });
    }

    /// Batch-mode content routing: control decision, target-agent call,
    /// inquiry-status update, agent→state mapping.
    async fn handle_control_routing(
        &self,
        user_text: &str,
        session: &Session,
    ) -> Result<(String, SessionState)> {
        let target = self.route(user_text, session).await?;
        let target_prompt = self.prompts.get(target)?;

        // Framing decision must reflect status BEFORE this turn's update.
        let is_first = session.inquiry_status.is_first(target);
        let context = self
            .assembler
            .assemble_for_agent(session, target, &session.inquiry_status);

        let mut response = self
            .client
            .generate(&target_prompt, &context, user_text, &session.chat_history)
            .await;

        self.mark_consulted(session, target).await?;

        response.push_str(&Self::mode_trailer(target, is_first));

        let new_state = target
            .chapter_state()
            .unwrap_or(SessionState::ControlRouting);

        info!(
            session_id = %session.session_id,
            agent = %target,
            first_inquiry = is_first,
            new_state = %new_state,
            "routed turn complete"
        );

        Ok((response, new_state))
    }

    /// Streaming-mode content routing. The routing decision itself is a
    /// quick batch call; only the target agent's answer is streamed.
    async fn stream_control_routing(
        &self,
        user_text: &str,
        session: &Session,
        tx: &mpsc::UnboundedSender<TurnEvent>,
    ) {
        let state = session.current_state;

        let prepared = async {
            let target = self.route(user_text, session).await?;
            let prompt = self.prompts.get(target)?;
            Ok::<_, crate::error::OrchestratorError>((target, prompt))
        }
        .await;

        let (target, target_prompt) = match prepared {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "streamed routing setup failed");
                let text = crate::client::apology_for(&e);
                let _ = tx.send(TurnEvent::Fragment(text.clone()));
                let _ = tx.send(TurnEvent::Done {
                    state,
                    full_response: text,
                });
                return;
            }
        };

        let is_first = session.inquiry_status.is_first(target);
        let context = self
            .assembler
            .assemble_for_agent(session, target, &session.inquiry_status);

        let mut upstream = self
            .client
            .generate_stream(&target_prompt, &context, user_text, &session.chat_history)
            .await;

        let mut full_response = String::new();
        while let Some(fragment) = upstream.recv().await {
            full_response.push_str(&fragment);
            if tx.send(TurnEvent::Fragment(fragment)).is_err() {
                return;
            }
        }

        let trailer = Self::mode_trailer(target, is_first);
        full_response.push_str(&trailer);
        let _ = tx.send(TurnEvent::Fragment(trailer));

        if let Err(e) = self.mark_consulted(session, target).await {
            // The response already streamed; surface the persistence
            // problem in the log and let the caller's final write retry.
            warn!(error = %e, "inquiry-status update failed after streamed response");
        }

        let _ = tx.send(TurnEvent::Done {
            state: target
                .chapter_state()
                .unwrap_or(SessionState::ControlRouting),
            full_response,
        });
    }

    /// Ask the control agent where the question belongs. Unresolvable
    /// hints fall back to the general agent; the guided-workflow agents
    /// themselves are never valid routing targets.
    async fn route(&self, user_text: &str, session: &Session) -> Result<AgentKind> {
        let control_prompt = self.prompts.get(AgentKind::Control)?;
        let context = self.assembler.assemble(session);

        let routing_question = format!(
            "User question: {}\n\nDecide which agent should handle this question.",
            user_text
        );

        // Routing runs with empty history: the decision depends only on
        // the question and the document context.
        let routing_response = self
            .client
            .generate(&control_prompt, &context, &routing_question, &[])
            .await;

        let target = routing::resolve_target_agent(&routing_response).unwrap_or_general();

        let target = match target {
            AgentKind::Guidance | AgentKind::Control => {
                warn!(agent = %target, "control routed to a workflow agent, using general instead");
                AgentKind::General
            }
            other => other,
        };

        debug!(agent = %target, "routing decision");
        Ok(target)
    }

    async fn mark_consulted(&self, session: &Session, target: AgentKind) -> Result<()> {
        let mut status = session.inquiry_status.clone();
        if status.mark_consulted(target) {
            self.store
                .update(session.session_id, SessionPatch::inquiry(status))
                .await?;
        }
        Ok(())
    }

    fn mode_trailer(target: AgentKind, is_first: bool) -> String {
        let mode = if is_first { "first-time" } else { "routine" };
        format!("\n\n---\n[{} · {}]", target.display_name(), mode)
    }

    /// Transition table for the non-routed paths.
    fn next_state(current: SessionState, user_text: &str, session: &Session) -> SessionState {
        match current {
            SessionState::GuidePendingReport => {
                // Initial report produced (system-triggered empty turn) or
                // the user replied while a document exists: either way the
                // guided plan phase is next.
                if session.paper_path.is_some() {
                    SessionState::GuidePendingPlan
                } else {
                    current
                }
            }
            SessionState::GuidePendingPlan => {
                if user_text.is_empty() {
                    // Report just shown; wait for the user's reply.
                    current
                } else {
                    SessionState::ControlRouting
                }
            }
            // Routed states are handled elsewhere; anything reaching here
            // (e.g. an empty turn in a chapter state) stays put.
            other => other,
        }
    }

    /// Out-of-band state override for administrative correction. Bypasses
    /// all transition logic.
    pub async fn force_transition(&self, session_id: Uuid, new_state: SessionState) -> Result<()> {
        self.store
            .update(session_id, SessionPatch::state(new_state))
            .await?;
        info!(%session_id, state = %new_state, "state forced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{GenerationClient, MockTransport};
    use crate::error::OrchestratorError;
    use crate::prompts::StaticPromptProvider;
    use crate::store::{InMemorySessionStore, SessionStore};
    use std::time::Duration;

    fn scripted(script: Vec<crate::Result<String>>) -> GenerationClient {
        GenerationClient::new(
            Arc::new(MockTransport::new(script)),
            "gpt-4o",
            3,
            Duration::from_millis(1),
        )
    }

    async fn orchestrator_with(
        script: Vec<crate::Result<String>>,
        session: &Session,
    ) -> (Arc<Orchestrator>, Arc<InMemorySessionStore>) {
        let store = Arc::new(InMemorySessionStore::new());
        store.create(session).await.unwrap();

        let orchestrator = Arc::new(Orchestrator::new(
            scripted(script),
            Arc::new(StaticPromptProvider::uniform("You are a reading assistant.")),
            store.clone(),
        ));
        (orchestrator, store)
    }

    fn session_with_paper(state: SessionState) -> Session {
        let mut session = Session::new(Uuid::new_v4(), "Attention Is All You Need");
        session.paper_path = Some("uploads/attention.pdf".to_string());
        session.current_state = state;
        session
    }

    #[tokio::test]
    async fn test_initial_empty_turn_produces_report_and_advances() {
        let session = session_with_paper(SessionState::GuidePendingReport);
        let (orchestrator, _) = orchestrator_with(
            vec![Ok("Here is a guided report of the paper.".to_string())],
            &session,
        )
        .await;

        let (response, new_state) = orchestrator.process_turn("", &session).await.unwrap();

        assert!(!response.is_empty());
        assert_eq!(new_state, SessionState::GuidePendingPlan);
    }

    #[tokio::test]
    async fn test_report_state_without_document_stays() {
        let mut session = session_with_paper(SessionState::GuidePendingReport);
        session.paper_path = None;
        let (orchestrator, _) =
            orchestrator_with(vec![Ok("Please upload a paper first.".to_string())], &session)
                .await;

        let (_, new_state) = orchestrator.process_turn("", &session).await.unwrap();
        assert_eq!(new_state, SessionState::GuidePendingReport);
    }

    #[tokio::test]
    async fn test_plan_state_empty_turn_is_sticky() {
        let session = session_with_paper(SessionState::GuidePendingPlan);
        let (orchestrator, _) =
            orchestrator_with(vec![Ok("Waiting for your goals.".to_string())], &session).await;

        let (_, new_state) = orchestrator.process_turn("", &session).await.unwrap();
        assert_eq!(new_state, SessionState::GuidePendingPlan);
    }

    #[tokio::test]
    async fn test_plan_reply_without_hint_moves_to_routing() {
        let session = session_with_paper(SessionState::GuidePendingPlan);
        let (orchestrator, _) = orchestrator_with(
            vec![Ok("Great, here is your personalized reading plan.".to_string())],
            &session,
        )
        .await;

        let (response, new_state) = orchestrator
            .process_turn("I want to understand the architecture", &session)
            .await
            .unwrap();

        assert_eq!(response, "Great, here is your personalized reading plan.");
        assert_eq!(new_state, SessionState::ControlRouting);
    }

    #[tokio::test]
    async fn test_plan_reroute_hint_substitutes_routed_answer() {
        let session = session_with_paper(SessionState::GuidePendingPlan);
        let (orchestrator, _) = orchestrator_with(
            vec![
                // Guidance flags the turn as a content question.
                Ok(r#"Good question! {"route": "content_question"}"#.to_string()),
                // Control routes it to the review agent.
                Ok(r#"{"agent_name": "review_agent"}"#.to_string()),
                // Review agent answers.
                Ok("Prior work relied on recurrent encoders.".to_string()),
            ],
            &session,
        )
        .await;

        let (response, new_state) = orchestrator
            .process_turn("what did earlier models use?", &session)
            .await
            .unwrap();

        // The hint-bearing guidance text is never surfaced.
        assert!(!response.contains("content_question"));
        assert!(response.contains("Prior work relied on recurrent encoders."));
        assert_eq!(new_state, SessionState::Review);
    }

    #[tokio::test]
    async fn test_chapter_state_always_reroutes() {
        let session = session_with_paper(SessionState::Review);
        let (orchestrator, store) = orchestrator_with(
            vec![
                Ok(r#"{"agent_name": "method"}"#.to_string()),
                Ok("They trained on WMT 2014 with label smoothing.".to_string()),
            ],
            &session,
        )
        .await;

        let (response, new_state) = orchestrator
            .process_turn("how was the model trained?", &session)
            .await
            .unwrap();

        assert_eq!(new_state, SessionState::Method);
        assert!(response.contains("label smoothing"));
        assert!(response.contains("[Methods · first-time]"));

        // Inquiry status was persisted for the routed agent.
        let stored = store.get(session.session_id).await.unwrap().unwrap();
        assert!(!stored.inquiry_status.is_first(AgentKind::Method));
        assert!(stored.inquiry_status.is_first(AgentKind::Review));
    }

    #[tokio::test]
    async fn test_unresolvable_routing_falls_back_to_general() {
        let session = session_with_paper(SessionState::ControlRouting);
        let (orchestrator, _) = orchestrator_with(
            vec![
                Ok("I am not sure which agent fits here.".to_string()),
                Ok("Here is a general answer.".to_string()),
            ],
            &session,
        )
        .await;

        let (response, new_state) = orchestrator
            .process_turn("what's the weather?", &session)
            .await
            .unwrap();

        // General has no chapter state: routing remains active.
        assert_eq!(new_state, SessionState::ControlRouting);
        assert!(response.contains("[General · first-time]"));
    }

    #[tokio::test]
    async fn test_workflow_agent_decision_remapped_to_general() {
        let session = session_with_paper(SessionState::ControlRouting);
        let (orchestrator, store) = orchestrator_with(
            vec![
                // Control names a workflow agent, which is never a valid
                // question handler.
                Ok(r#"{"agent_name": "guidance"}"#.to_string()),
                Ok("Happy to help with that.".to_string()),
            ],
            &session,
        )
        .await;

        let (response, new_state) = orchestrator
            .process_turn("take me back to the plan", &session)
            .await
            .unwrap();

        assert!(response.contains("[General · first-time]"));
        assert_eq!(new_state, SessionState::ControlRouting);

        // Only the general agent is marked consulted; the workflow agents
        // never are.
        let stored = store.get(session.session_id).await.unwrap().unwrap();
        assert!(!stored.inquiry_status.is_first(AgentKind::General));
        assert!(stored.inquiry_status.is_first(AgentKind::Guidance));
        assert!(stored.inquiry_status.is_first(AgentKind::Control));
    }

    #[tokio::test]
    async fn test_framing_reflects_pre_update_status() {
        let session = session_with_paper(SessionState::ControlRouting);
        let (orchestrator, store) = orchestrator_with(
            vec![
                Ok(r#"{"agent_name": "result"}"#.to_string()),
                Ok("BLEU of 28.4 on EN-DE.".to_string()),
                Ok(r#"{"agent_name": "result"}"#.to_string()),
                Ok("Also 41.8 on EN-FR.".to_string()),
            ],
            &session,
        )
        .await;

        let (first, _) = orchestrator
            .process_turn("what was the main result?", &session)
            .await
            .unwrap();
        assert!(first.contains("first-time"));

        // Caller reloads the session between turns.
        let reloaded = store.get(session.session_id).await.unwrap().unwrap();
        let (second, _) = orchestrator
            .process_turn("any other benchmarks?", &reloaded)
            .await
            .unwrap();
        assert!(second.contains("routine"));
    }

    #[tokio::test]
    async fn test_missing_prompt_is_turn_fatal() {
        let session = session_with_paper(SessionState::GuidePendingReport);
        let store = Arc::new(InMemorySessionStore::new());
        store.create(&session).await.unwrap();

        let orchestrator = Orchestrator::new(
            scripted(vec![Ok("unused".to_string())]),
            Arc::new(StaticPromptProvider::new(Default::default())),
            store,
        );

        let err = orchestrator.process_turn("", &session).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::PromptError(_)));
    }

    #[tokio::test]
    async fn test_generation_failure_still_yields_state_and_apology() {
        let session = session_with_paper(SessionState::GuidePendingReport);
        let (orchestrator, _) = orchestrator_with(
            vec![
                Err(OrchestratorError::LlmError("boom".to_string())),
                Err(OrchestratorError::LlmError("boom".to_string())),
                Err(OrchestratorError::LlmError("boom again".to_string())),
            ],
            &session,
        )
        .await;

        let (response, new_state) = orchestrator.process_turn("", &session).await.unwrap();
        assert!(response.contains("boom again"));
        assert_eq!(new_state, SessionState::GuidePendingPlan);
    }

    #[tokio::test]
    async fn test_streamed_routed_turn_matches_contract() {
        let session = session_with_paper(SessionState::Discussion);
        let (orchestrator, store) = orchestrator_with(
            vec![
                Ok(r#"{"agent_name": "introduction"}"#.to_string()),
                Ok("The introduction motivates attention.".to_string()),
            ],
            &session,
        )
        .await;

        let mut rx = orchestrator
            .process_turn_stream("why attention?", &session)
            .await;

        let mut fragments = String::new();
        let mut done = None;
        while let Some(event) = rx.recv().await {
            match event {
                TurnEvent::Fragment(fragment) => fragments.push_str(&fragment),
                TurnEvent::Done {
                    state,
                    full_response,
                } => done = Some((state, full_response)),
            }
        }

        let (state, full_response) = done.expect("stream must terminate with Done");
        assert_eq!(state, SessionState::Introduction);
        assert_eq!(fragments, full_response);
        assert!(full_response.contains("[Introduction · first-time]"));

        let stored = store.get(session.session_id).await.unwrap().unwrap();
        assert!(!stored.inquiry_status.is_first(AgentKind::Introduction));
    }

    #[tokio::test]
    async fn test_streamed_plan_turn_buffers_before_reroute() {
        let session = session_with_paper(SessionState::GuidePendingPlan);
        let (orchestrator, _) = orchestrator_with(
            vec![
                Ok(r#"{"route": "content_question"}"#.to_string()),
                Ok(r#"{"agent_name": "method"}"#.to_string()),
                Ok("Multi-head attention splits the projection.".to_string()),
            ],
            &session,
        )
        .await;

        let mut rx = orchestrator
            .process_turn_stream("how does multi-head attention work?", &session)
            .await;

        let mut fragments = String::new();
        let mut final_state = None;
        while let Some(event) = rx.recv().await {
            match event {
                TurnEvent::Fragment(fragment) => fragments.push_str(&fragment),
                TurnEvent::Done { state, .. } => final_state = Some(state),
            }
        }

        assert!(!fragments.contains("content_question"));
        assert!(fragments.contains("Multi-head attention"));
        assert_eq!(final_state, Some(SessionState::Method));
    }

    #[tokio::test]
    async fn test_force_transition_bypasses_rules() {
        let session = session_with_paper(SessionState::GuidePendingReport);
        let (orchestrator, store) = orchestrator_with(vec![], &session).await;

        orchestrator
            .force_transition(session.session_id, SessionState::Discussion)
            .await
            .unwrap();

        let stored = store.get(session.session_id).await.unwrap().unwrap();
        assert_eq!(stored.current_state, SessionState::Discussion);
    }
}
