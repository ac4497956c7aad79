//! MediPredict - conversational disease-risk assessment server
//!
//! Clients talk over a WebSocket event channel; each conversation is driven
//! by its own actor that consults the dialog model, collects clinical
//! parameters through a workflow state machine and dispatches them to a
//! prediction model.

mod api;
mod config;
mod context;
mod db;
mod llm;
mod parameters;
mod predictor;
mod runtime;
mod state_machine;
mod system_prompt;

use api::{create_router, AppState, TokenAuthenticator};
use config::AppConfig;
use context::ContextAssembler;
use db::Database;
use llm::dialog_from_config;
use parameters::ParameterRegistry;
use predictor::PredictorRegistry;
use runtime::{DatabaseStorage, SessionManager};
use std::net::SocketAddr;
use std::sync::Arc;
use system_prompt::build_system_prompt;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "medipredict=info,tower_http=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = AppConfig::from_env()?;

    // Ensure database directory exists
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path.display(), "Opening database");
    let storage = DatabaseStorage::new(Database::open(&config.db_path)?);

    let registry = Arc::new(ParameterRegistry::builtin());
    let dialog = dialog_from_config(&config.dialog, build_system_prompt(&registry))?;
    tracing::info!(model = dialog.model_id(), "Dialog backend ready");

    let predictors = PredictorRegistry::from_config(&config.predictor)?;
    let available = predictors.diseases();
    if available.is_empty() {
        tracing::warn!("No predictors configured. Set PREDICTOR_URL to enable predictions.");
    } else {
        tracing::info!(diseases = ?available, "Predictors registered");
    }

    let context = ContextAssembler::new(storage.clone(), config.context_limit);
    let sessions = SessionManager::new(
        storage,
        context,
        dialog,
        Arc::new(predictors),
        registry,
        config.session,
    );

    let auth = TokenAuthenticator::new(config.api_tokens.iter().map(|(u, t)| (u.as_str(), t.as_str())));
    if auth.user_count() == 0 {
        tracing::warn!("MEDIPREDICT_API_TOKENS is empty; every connection will be rejected");
    }

    let state = AppState::new(sessions, auth);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let compression = CompressionLayer::new()
        .gzip(true)
        .br(true)
        .deflate(true)
        .zstd(true);

    let app = create_router(state)
        .layer(cors)
        .layer(compression)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("MediPredict server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
