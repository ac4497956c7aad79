//! Event gateway: WebSocket endpoint plus a couple of plain HTTP routes

mod auth;
mod handlers;
mod types;
mod ws;

pub use auth::TokenAuthenticator;
pub use handlers::create_router;

use crate::runtime::ProductionSessionManager;
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub sessions: Arc<ProductionSessionManager>,
    pub auth: Arc<TokenAuthenticator>,
}

impl AppState {
    pub fn new(sessions: ProductionSessionManager, auth: TokenAuthenticator) -> Self {
        Self {
            sessions: Arc::new(sessions),
            auth: Arc::new(auth),
        }
    }
}

/// State over an in-memory database with no dialog key and no predictors
#[cfg(test)]
pub(crate) fn test_state() -> AppState {
    use crate::context::{ContextAssembler, DEFAULT_CONTEXT_LIMIT};
    use crate::db::Database;
    use crate::llm::UnavailableDialog;
    use crate::parameters::ParameterRegistry;
    use crate::predictor::PredictorRegistry;
    use crate::runtime::{DatabaseStorage, SessionManager, SessionSettings};

    let storage = DatabaseStorage::new(Database::open_in_memory().unwrap());
    let sessions = SessionManager::new(
        storage.clone(),
        ContextAssembler::new(storage, DEFAULT_CONTEXT_LIMIT),
        Arc::new(UnavailableDialog),
        Arc::new(PredictorRegistry::new()),
        Arc::new(ParameterRegistry::builtin()),
        SessionSettings::default(),
    );
    AppState::new(sessions, TokenAuthenticator::new([("alice", "alice-token")]))
}
