//! Trait abstractions for the store the session manager writes through
//!
//! The manager and the context assembler only see these traits, so the store
//! can be swapped for a wrapper in tests.

use crate::db::{
    Conversation, ConversationStatus, Database, DbError, Message, MessageMetadata, NewMessage,
    PredictionRecord,
};
use crate::parameters::DiseaseType;
use crate::predictor::PredictionOutcome;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Conversation lifecycle
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(&self, id: &str, user_id: &str) -> Result<Conversation, DbError>;

    /// Fetch a conversation owned by `user_id`; anyone else's is not found
    async fn conversation_for_user(&self, id: &str, user_id: &str)
        -> Result<Conversation, DbError>;

    /// Most recently updated first
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, DbError>;

    async fn set_conversation_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> Result<(), DbError>;

    async fn delete_conversation(&self, id: &str, user_id: &str) -> Result<(), DbError>;
}

/// Ordered message log
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append a user turn and its reply atomically, user first
    async fn append_exchange(
        &self,
        conversation_id: &str,
        user: &NewMessage,
        ai: &NewMessage,
    ) -> Result<(Message, Message), DbError>;

    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, DbError>;

    /// Last `limit` messages in chronological order
    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, DbError>;

    async fn get_message(&self, conversation_id: &str, index: usize) -> Result<Message, DbError>;

    async fn update_message_metadata(
        &self,
        conversation_id: &str,
        index: usize,
        metadata: &MessageMetadata,
    ) -> Result<Message, DbError>;
}

/// Prediction records
#[async_trait]
pub trait PredictionStore: Send + Sync {
    async fn create_prediction(
        &self,
        id: &str,
        user_id: &str,
        conversation_id: Option<&str>,
        disease: DiseaseType,
    ) -> Result<PredictionRecord, DbError>;

    async fn prediction_for_user(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<PredictionRecord, DbError>;

    async fn list_predictions(&self, user_id: &str) -> Result<Vec<PredictionRecord>, DbError>;

    async fn latest_pending_prediction(
        &self,
        conversation_id: &str,
    ) -> Result<Option<PredictionRecord>, DbError>;

    async fn update_prediction_parameters(
        &self,
        id: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<(), DbError>;

    async fn update_prediction_guidance(
        &self,
        id: &str,
        follow_up_questions: &[String],
        recommendations: &[String],
    ) -> Result<(), DbError>;

    async fn complete_prediction(&self, id: &str, outcome: &PredictionOutcome)
        -> Result<(), DbError>;

    async fn delete_prediction(&self, id: &str, user_id: &str) -> Result<(), DbError>;
}

/// Combined storage trait for convenience
pub trait Storage: ConversationStore + MessageStore + PredictionStore {}
impl<T: ConversationStore + MessageStore + PredictionStore> Storage for T {}

// ============================================================================
// Production Adapter
// ============================================================================

/// Adapter to use Database as Storage
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[cfg(test)]
    pub fn inner(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl ConversationStore for DatabaseStorage {
    async fn create_conversation(&self, id: &str, user_id: &str) -> Result<Conversation, DbError> {
        self.db.create_conversation(id, user_id)
    }

    async fn conversation_for_user(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<Conversation, DbError> {
        self.db.conversation_for_user(id, user_id)
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, DbError> {
        self.db.list_conversations(user_id)
    }

    async fn set_conversation_status(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> Result<(), DbError> {
        self.db.set_conversation_status(id, status)
    }

    async fn delete_conversation(&self, id: &str, user_id: &str) -> Result<(), DbError> {
        self.db.delete_conversation(id, user_id)
    }
}

#[async_trait]
impl MessageStore for DatabaseStorage {
    async fn append_exchange(
        &self,
        conversation_id: &str,
        user: &NewMessage,
        ai: &NewMessage,
    ) -> Result<(Message, Message), DbError> {
        self.db.append_exchange(conversation_id, user, ai)
    }

    async fn get_messages(&self, conversation_id: &str) -> Result<Vec<Message>, DbError> {
        self.db.get_messages(conversation_id)
    }

    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, DbError> {
        self.db.recent_messages(conversation_id, limit)
    }

    async fn get_message(&self, conversation_id: &str, index: usize) -> Result<Message, DbError> {
        self.db.get_message(conversation_id, index)
    }

    async fn update_message_metadata(
        &self,
        conversation_id: &str,
        index: usize,
        metadata: &MessageMetadata,
    ) -> Result<Message, DbError> {
        self.db.update_message_metadata(conversation_id, index, metadata)
    }
}

#[async_trait]
impl PredictionStore for DatabaseStorage {
    async fn create_prediction(
        &self,
        id: &str,
        user_id: &str,
        conversation_id: Option<&str>,
        disease: DiseaseType,
    ) -> Result<PredictionRecord, DbError> {
        self.db.create_prediction(id, user_id, conversation_id, disease)
    }

    async fn prediction_for_user(
        &self,
        id: &str,
        user_id: &str,
    ) -> Result<PredictionRecord, DbError> {
        self.db.prediction_for_user(id, user_id)
    }

    async fn list_predictions(&self, user_id: &str) -> Result<Vec<PredictionRecord>, DbError> {
        self.db.list_predictions(user_id)
    }

    async fn latest_pending_prediction(
        &self,
        conversation_id: &str,
    ) -> Result<Option<PredictionRecord>, DbError> {
        self.db.latest_pending_prediction(conversation_id)
    }

    async fn update_prediction_parameters(
        &self,
        id: &str,
        parameters: &BTreeMap<String, String>,
    ) -> Result<(), DbError> {
        self.db.update_prediction_parameters(id, parameters)
    }

    async fn update_prediction_guidance(
        &self,
        id: &str,
        follow_up_questions: &[String],
        recommendations: &[String],
    ) -> Result<(), DbError> {
        self.db
            .update_prediction_guidance(id, follow_up_questions, recommendations)
    }

    async fn complete_prediction(
        &self,
        id: &str,
        outcome: &PredictionOutcome,
    ) -> Result<(), DbError> {
        self.db.complete_prediction(id, outcome)
    }

    async fn delete_prediction(&self, id: &str, user_id: &str) -> Result<(), DbError> {
        self.db.delete_prediction(id, user_id)
    }
}
