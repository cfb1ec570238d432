use reading_agent_orchestrator::{
    client::{GenerationClient, MockTransport},
    models::Session,
    orchestrator::Orchestrator,
    prompts::StaticPromptProvider,
    store::{InMemorySessionStore, SessionStore},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    info!("Reading Agent Orchestrator starting (offline demo)");

    // Scripted transport: one guided report, one routing decision, one
    // chapter answer. Enough to walk the full state machine locally.
    let transport = Arc::new(MockTransport::new(vec![
        Ok("Welcome! This paper introduces the Transformer architecture. \
            Here is a guided report of its structure."
            .to_string()),
        Ok(r#"{"agent_name": "method_agent"}"#.to_string()),
        Ok("Multi-head attention projects queries, keys and values eight \
            times with different learned projections."
            .to_string()),
    ]));

    let client = GenerationClient::new(transport, "gpt-4o", 3, Duration::from_millis(10));
    let prompts = Arc::new(StaticPromptProvider::uniform(
        "You are a guided paper-reading assistant.",
    ));
    let store = Arc::new(InMemorySessionStore::new());

    // Create a sample session with an attached document
    let mut session = Session::new(Uuid::new_v4(), "Attention Is All You Need");
    session.paper_path = Some("uploads/attention.pdf".to_string());
    store.create(&session).await?;

    let orchestrator = Orchestrator::new(client, prompts, store.clone());

    println!("\n=== GUIDED REPORT (empty system turn) ===");
    let (report, state) = orchestrator.process_turn("", &session).await?;
    println!("{}\n→ state: {}", report, state);
    store
        .update(
            session.session_id,
            reading_agent_orchestrator::models::SessionPatch::state(state),
        )
        .await?;

    println!("\n=== CONTENT QUESTION ===");
    let mut session = store.get(session.session_id).await?.unwrap();
    // Skip the plan exchange; jump straight to content routing.
    session.current_state = reading_agent_orchestrator::models::SessionState::ControlRouting;
    let (answer, state) = orchestrator
        .process_turn("how does multi-head attention work?", &session)
        .await?;
    println!("{}\n→ state: {}", answer, state);

    Ok(())
}
