use reading_agent_orchestrator::{
    api::start_server,
    client::GenerationClient,
    config::AppConfig,
    orchestrator::Orchestrator,
    prompts::FilePromptProvider,
    store::{InMemorySessionStore, PgSessionStore, SessionStore},
};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let config = AppConfig::from_env();

    if config.llm.api_key.is_empty() {
        warn!("OPENAI_API_KEY not set; generation calls will fail and return apologies");
    }

    info!("Reading Agent Orchestrator - API Server");
    info!("Port: {}", config.port);
    info!("Model: {}", config.llm.model);
    info!(
        "Prompts: {}/{}",
        config.prompt_dir, config.prompt_version
    );

    // Create components
    let client = GenerationClient::from_config(&config.llm);
    let prompts = Arc::new(FilePromptProvider::new(
        &config.prompt_dir,
        config.prompt_version.clone(),
    ));

    let store: Arc<dyn SessionStore> = match &config.database_url {
        Some(url) => {
            info!("Using Postgres session store");
            Arc::new(PgSessionStore::connect_lazy(url)?)
        }
        None => {
            warn!("DATABASE_URL not set; sessions are in-memory and lost on restart");
            Arc::new(InMemorySessionStore::new())
        }
    };

    // Create orchestrator
    let orchestrator = Arc::new(Orchestrator::new(client, prompts, store.clone()));

    info!("Orchestrator initialized, starting API server");

    // Start API server
    start_server(orchestrator, store, config.port).await?;

    Ok(())
}
