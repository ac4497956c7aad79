//! Context window assembly
//!
//! The dialog model never sees a whole conversation, only its most recent
//! messages, so the cost of a turn does not grow with conversation age.

use crate::db::{Conversation, DbError, Message};
use crate::runtime::{ConversationStore, MessageStore};
use uuid::Uuid;

pub const DEFAULT_CONTEXT_LIMIT: usize = 10;

/// Bounded, chronological slice of a conversation
#[derive(Debug, Clone)]
pub struct ContextWindow {
    pub conversation: Conversation,
    pub messages: Vec<Message>,
}

/// Builds context windows from the store
#[derive(Clone)]
pub struct ContextAssembler<S> {
    store: S,
    limit: usize,
}

impl<S: ConversationStore + MessageStore> ContextAssembler<S> {
    pub fn new(store: S, limit: usize) -> Self {
        Self {
            store,
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Window for `conversation_id`, or for a freshly created conversation
    /// when no id is given. Another user's conversation is not found.
    pub async fn build_context(
        &self,
        user_id: &str,
        conversation_id: Option<&str>,
    ) -> Result<ContextWindow, DbError> {
        let conversation = match conversation_id {
            Some(id) => self.store.conversation_for_user(id, user_id).await?,
            None => {
                let id = Uuid::new_v4().to_string();
                let conversation = self.store.create_conversation(&id, user_id).await?;
                tracing::info!(conv_id = %id, user_id, "Created conversation");
                return Ok(ContextWindow {
                    conversation,
                    messages: Vec::new(),
                });
            }
        };

        let messages = self
            .store
            .recent_messages(&conversation.id, self.limit)
            .await?;
        Ok(ContextWindow {
            conversation,
            messages,
        })
    }
}
