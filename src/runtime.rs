//! Conversation session manager
//!
//! Every state-changing operation on a conversation goes through that
//! conversation's actor: a task owning an mpsc receiver and handling one
//! command at a time. Distinct conversations run in parallel; commands for
//! the same conversation apply in receipt order, and reads of a
//! conversation queue behind its pending writes. Predictions that are not
//! attached to a conversation get an actor of their own.
//!
//! Per-user listings go straight to the store.

mod error;
mod executor;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use error::{ErrorKind, SessionError};
pub use traits::*;

use crate::context::ContextAssembler;
use crate::db::{Conversation, Message, MessageMetadata, PredictionRecord};
use crate::llm::Dialog;
use crate::parameters::{DiseaseType, ParameterRegistry};
use crate::predictor::{PredictionOutcome, PredictorRegistry};
use crate::state_machine::WorkflowSnapshot;
use executor::{Command, ConversationActor, Operation};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Type alias for the production manager
pub type ProductionSessionManager = SessionManager<DatabaseStorage>;

/// Where a client's events are delivered
pub type EventSink = mpsc::UnboundedSender<ServerEvent>;

const COMMAND_BUFFER: usize = 32;

/// Events sent to clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        user_id: String,
    },
    ConversationCreated {
        conversation: Conversation,
    },
    ConversationsLoaded {
        conversations: Vec<Conversation>,
    },
    MessagesLoaded {
        conversation_id: String,
        messages: Vec<Message>,
    },
    MessageSaved {
        conversation_id: String,
        message: Message,
    },
    AiResponse {
        conversation_id: String,
        message: Message,
        intent: String,
        entities: Vec<String>,
        confidence: f64,
    },
    MetadataUpdated {
        conversation_id: String,
        message_index: usize,
        metadata: MessageMetadata,
    },
    Metadata {
        conversation_id: String,
        message_index: usize,
        metadata: Option<MessageMetadata>,
    },
    ConversationClosed {
        conversation_id: String,
    },
    ConversationDeleted {
        conversation_id: String,
    },
    PredictionCreated {
        prediction: PredictionRecord,
    },
    ParameterUpdated {
        prediction_id: String,
        parameter_name: String,
        parameter_value: Option<String>,
    },
    PredictionUpdated {
        prediction: PredictionRecord,
    },
    WorkflowUpdated {
        prediction_id: String,
        workflow: WorkflowSnapshot,
    },
    PredictionCompleted {
        prediction_id: String,
        result: PredictionOutcome,
    },
    PredictionCancelled {
        prediction_id: String,
    },
    PredictionDeleted {
        prediction_id: String,
    },
    PredictionsLoaded {
        predictions: Vec<PredictionRecord>,
    },
    Error {
        message: String,
        kind: ErrorKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        field: Option<String>,
    },
}

/// Parameter edits for one prediction, validated together
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterChanges {
    pub set: Vec<(String, String)>,
    pub remove: Vec<String>,
}

impl ParameterChanges {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }
}

/// Deadlines for collaborator calls and idle actors
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionSettings {
    pub dialog_timeout: Duration,
    pub predictor_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            dialog_timeout: Duration::from_secs(30),
            predictor_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(600),
        }
    }
}

/// Everything an actor needs, shared by all actors
pub(crate) struct Services<S> {
    pub storage: S,
    pub context: ContextAssembler<S>,
    pub dialog: Arc<dyn Dialog>,
    pub predictors: Arc<PredictorRegistry>,
    pub registry: Arc<ParameterRegistry>,
    pub settings: SessionSettings,
}

/// Handle to a running actor
pub(crate) struct SessionHandle {
    /// Distinguishes a retired actor's entry from its replacement's
    id: u64,
    tx: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

/// Live actors by session key; each actor removes its own entry on exit
pub(crate) type SessionMap = RwLock<HashMap<String, SessionHandle>>;

/// Manager for all conversation actors
pub struct SessionManager<S>
where
    S: Storage + Clone + 'static,
{
    services: Arc<Services<S>>,
    sessions: Arc<SessionMap>,
    next_actor: AtomicU64,
}

impl<S> SessionManager<S>
where
    S: Storage + Clone + 'static,
{
    pub fn new(
        storage: S,
        context: ContextAssembler<S>,
        dialog: Arc<dyn Dialog>,
        predictors: Arc<PredictorRegistry>,
        registry: Arc<ParameterRegistry>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            services: Arc::new(Services {
                storage,
                context,
                dialog,
                predictors,
                registry,
                settings,
            }),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_actor: AtomicU64::new(0),
        }
    }

    // ==================== Conversations ====================

    /// Create a conversation and, if `content` is given, process it as the
    /// first message
    pub async fn new_conversation(&self, user_id: &str, content: Option<String>, sink: &EventSink) {
        let window = match self.services.context.build_context(user_id, None).await {
            Ok(window) => window,
            Err(e) => return report("new_conversation", &e.into(), sink),
        };
        let conversation_id = window.conversation.id.clone();
        let _ = sink.send(ServerEvent::ConversationCreated {
            conversation: window.conversation,
        });

        if let Some(content) = content.filter(|c| !c.trim().is_empty()) {
            self.send_message(user_id, &conversation_id, content, sink).await;
        }
    }

    pub async fn send_message(
        &self,
        user_id: &str,
        conversation_id: &str,
        content: String,
        sink: &EventSink,
    ) {
        let op = Operation::SendMessage {
            conversation_id: conversation_id.to_string(),
            content,
        };
        self.dispatch(conversation_id, user_id, op, sink).await;
    }

    pub async fn update_message_metadata(
        &self,
        user_id: &str,
        conversation_id: &str,
        index: usize,
        metadata: MessageMetadata,
        sink: &EventSink,
    ) {
        let op = Operation::UpdateMetadata {
            conversation_id: conversation_id.to_string(),
            index,
            metadata,
        };
        self.dispatch(conversation_id, user_id, op, sink).await;
    }

    pub async fn close_conversation(&self, user_id: &str, conversation_id: &str, sink: &EventSink) {
        let op = Operation::CloseConversation {
            conversation_id: conversation_id.to_string(),
        };
        self.dispatch(conversation_id, user_id, op, sink).await;
    }

    pub async fn delete_conversation(&self, user_id: &str, conversation_id: &str, sink: &EventSink) {
        let op = Operation::DeleteConversation {
            conversation_id: conversation_id.to_string(),
        };
        self.dispatch(conversation_id, user_id, op, sink).await;
    }

    pub async fn list_conversations(&self, user_id: &str, sink: &EventSink) {
        match self.services.storage.list_conversations(user_id).await {
            Ok(conversations) => {
                let _ = sink.send(ServerEvent::ConversationsLoaded { conversations });
            }
            Err(e) => report("get_conversations", &e.into(), sink),
        }
    }

    pub async fn get_messages(&self, user_id: &str, conversation_id: &str, sink: &EventSink) {
        let op = Operation::GetMessages {
            conversation_id: conversation_id.to_string(),
        };
        self.dispatch(conversation_id, user_id, op, sink).await;
    }

    /// Metadata of the `index`-th message; `None` for AI messages
    pub async fn get_message_metadata(
        &self,
        user_id: &str,
        conversation_id: &str,
        index: usize,
        sink: &EventSink,
    ) {
        let op = Operation::GetMetadata {
            conversation_id: conversation_id.to_string(),
            index,
        };
        self.dispatch(conversation_id, user_id, op, sink).await;
    }

    // ==================== Predictions ====================

    /// Start a prediction, attached to a conversation or standalone
    pub async fn new_prediction(
        &self,
        user_id: &str,
        disease: DiseaseType,
        conversation_id: Option<String>,
        sink: &EventSink,
    ) {
        let prediction_id = Uuid::new_v4().to_string();
        let key = conversation_id
            .clone()
            .unwrap_or_else(|| prediction_key(&prediction_id));
        let op = Operation::NewPrediction {
            prediction_id,
            disease,
            conversation_id,
        };
        self.dispatch(&key, user_id, op, sink).await;
    }

    pub async fn update_prediction(
        &self,
        user_id: &str,
        prediction_id: &str,
        changes: ParameterChanges,
        sink: &EventSink,
    ) {
        let op = Operation::UpdatePrediction {
            prediction_id: prediction_id.to_string(),
            changes,
        };
        self.dispatch_prediction(user_id, prediction_id, op, sink).await;
    }

    pub async fn cancel_prediction(&self, user_id: &str, prediction_id: &str, sink: &EventSink) {
        let op = Operation::CancelPrediction {
            prediction_id: prediction_id.to_string(),
        };
        self.dispatch_prediction(user_id, prediction_id, op, sink).await;
    }

    /// Confirm the collected values and run the predictor
    pub async fn predict(&self, user_id: &str, prediction_id: &str, sink: &EventSink) {
        let op = Operation::Predict {
            prediction_id: prediction_id.to_string(),
        };
        self.dispatch_prediction(user_id, prediction_id, op, sink).await;
    }

    pub async fn delete_prediction(&self, user_id: &str, prediction_id: &str, sink: &EventSink) {
        let op = Operation::DeletePrediction {
            prediction_id: prediction_id.to_string(),
        };
        self.dispatch_prediction(user_id, prediction_id, op, sink).await;
    }

    pub async fn list_predictions(&self, user_id: &str, sink: &EventSink) {
        match self.services.storage.list_predictions(user_id).await {
            Ok(predictions) => {
                let _ = sink.send(ServerEvent::PredictionsLoaded { predictions });
            }
            Err(e) => report("get_predictions", &e.into(), sink),
        }
    }

    /// Number of live actors
    pub async fn active_sessions(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|h| !h.tx.is_closed())
            .count()
    }

    /// Entries in the session map, live or draining
    #[cfg(test)]
    pub(crate) async fn tracked_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    // ==================== Routing ====================

    /// Predictions are serialized with their conversation when they have one
    async fn dispatch_prediction(
        &self,
        user_id: &str,
        prediction_id: &str,
        op: Operation,
        sink: &EventSink,
    ) {
        let record = match self
            .services
            .storage
            .prediction_for_user(prediction_id, user_id)
            .await
        {
            Ok(record) => record,
            Err(e) => return report(op.name(), &e.into(), sink),
        };
        let key = record
            .conversation_id
            .unwrap_or_else(|| prediction_key(prediction_id));
        self.dispatch(&key, user_id, op, sink).await;
    }

    /// Enqueue without waiting: a full queue is reported to the caller so
    /// that one busy conversation never stalls the socket feeding it
    async fn dispatch(&self, key: &str, user_id: &str, op: Operation, sink: &EventSink) {
        let mut command = Command {
            user_id: user_id.to_string(),
            sink: sink.clone(),
            op,
        };

        // An actor may retire between lookup and send; retry once on a fresh one
        for _ in 0..2 {
            let tx = self.handle_for(key).await;
            match tx.try_send(command) {
                Ok(()) => return,
                Err(TrySendError::Full(returned)) => {
                    tracing::warn!(session = %key, operation = returned.op.name(), "Session queue full");
                    return report(
                        returned.op.name(),
                        &SessionError::ExternalService {
                            message: "Conversation is busy, please retry".to_string(),
                            detail: format!("{COMMAND_BUFFER} commands already queued for {key}"),
                        },
                        sink,
                    );
                }
                Err(TrySendError::Closed(returned)) => command = returned,
            }
        }

        tracing::error!(session = %key, operation = command.op.name(), "Session actor unavailable");
        report(
            command.op.name(),
            &SessionError::ExternalService {
                message: "Session is unavailable, please retry".to_string(),
                detail: format!("actor for {key} did not accept the command"),
            },
            sink,
        );
    }

    /// Sender for the live actor of `key`, spawning one if needed
    async fn handle_for(&self, key: &str) -> mpsc::Sender<Command> {
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(key).filter(|h| !h.tx.is_closed()) {
                return handle.tx.clone();
            }
        }

        let mut sessions = self.sessions.write().await;
        // Double-check: another caller may have spawned it meanwhile
        if let Some(handle) = sessions.get(key).filter(|h| !h.tx.is_closed()) {
            return handle.tx.clone();
        }

        // A retired actor may still be draining; the new one waits for it
        let previous = sessions.remove(key).map(|h| h.task);
        let id = self.next_actor.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let actor = ConversationActor::new(
            key.to_string(),
            id,
            self.services.clone(),
            Arc::downgrade(&self.sessions),
            rx,
        );
        let task = tokio::spawn(actor.run(previous));
        tracing::debug!(session = %key, actor = id, "Spawned session actor");

        sessions.insert(
            key.to_string(),
            SessionHandle {
                id,
                tx: tx.clone(),
                task,
            },
        );
        tx
    }
}

fn prediction_key(prediction_id: &str) -> String {
    format!("prediction:{prediction_id}")
}

pub(crate) fn report(operation: &str, error: &SessionError, sink: &EventSink) {
    error.log(operation);
    let _ = sink.send(error.to_event());
}
