//! Per-conversation actor

use super::traits::Storage;
use super::{report, EventSink, ParameterChanges, ServerEvent, Services, SessionError, SessionMap};
use crate::db::{ConversationStatus, MessageMetadata, NewMessage, PredictionRecord, PredictionStatus};
use crate::llm::{DialogReply, DialogRequest, Intent, LlmError};
use crate::parameters::DiseaseType;
use crate::predictor::PredictorError;
use crate::state_machine::{transition, Effect, Event, Workflow};
use crate::system_prompt::guidance_request;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// A unit of work for an actor
pub(crate) struct Command {
    pub user_id: String,
    pub sink: EventSink,
    pub op: Operation,
}

pub(crate) enum Operation {
    SendMessage {
        conversation_id: String,
        content: String,
    },
    UpdateMetadata {
        conversation_id: String,
        index: usize,
        metadata: MessageMetadata,
    },
    GetMessages {
        conversation_id: String,
    },
    GetMetadata {
        conversation_id: String,
        index: usize,
    },
    CloseConversation {
        conversation_id: String,
    },
    DeleteConversation {
        conversation_id: String,
    },
    NewPrediction {
        prediction_id: String,
        disease: DiseaseType,
        conversation_id: Option<String>,
    },
    UpdatePrediction {
        prediction_id: String,
        changes: ParameterChanges,
    },
    CancelPrediction {
        prediction_id: String,
    },
    Predict {
        prediction_id: String,
    },
    DeletePrediction {
        prediction_id: String,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::SendMessage { .. } => "message",
            Operation::UpdateMetadata { .. } => "update_message_metadata",
            Operation::GetMessages { .. } => "get_messages",
            Operation::GetMetadata { .. } => "get_message_metadata",
            Operation::CloseConversation { .. } => "close_conversation",
            Operation::DeleteConversation { .. } => "delete_conversation",
            Operation::NewPrediction { .. } => "new_prediction",
            Operation::UpdatePrediction { .. } => "update_prediction",
            Operation::CancelPrediction { .. } => "cancel_prediction",
            Operation::Predict { .. } => "predict",
            Operation::DeletePrediction { .. } => "delete_prediction",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Processes one session's commands strictly in order
pub(crate) struct ConversationActor<S>
where
    S: Storage + Clone + 'static,
{
    key: String,
    id: u64,
    services: Arc<Services<S>>,
    sessions: Weak<SessionMap>,
    rx: mpsc::Receiver<Command>,
}

impl<S> ConversationActor<S>
where
    S: Storage + Clone + 'static,
{
    pub fn new(
        key: String,
        id: u64,
        services: Arc<Services<S>>,
        sessions: Weak<SessionMap>,
        rx: mpsc::Receiver<Command>,
    ) -> Self {
        Self {
            key,
            id,
            services,
            sessions,
            rx,
        }
    }

    pub async fn run(mut self, previous: Option<JoinHandle<()>>) {
        if let Some(previous) = previous {
            let _ = previous.await;
        }
        tracing::debug!(session = %self.key, "Starting session actor");

        let idle = self.services.settings.idle_timeout;
        loop {
            tokio::select! {
                command = self.rx.recv() => match command {
                    Some(command) => {
                        if self.handle(command).await == Flow::Stop {
                            break;
                        }
                    }
                    None => break,
                },
                () = tokio::time::sleep(idle) => {
                    tracing::debug!(session = %self.key, "Session idle, shutting down");
                    break;
                }
            }
        }

        // Refuse new commands, then finish the ones already queued
        self.rx.close();
        while let Ok(command) = self.rx.try_recv() {
            self.handle(command).await;
        }
        self.deregister().await;
        tracing::debug!(session = %self.key, "Session actor stopped");
    }

    /// Drop this actor's map entry unless a successor already replaced it
    async fn deregister(&self) {
        let Some(sessions) = self.sessions.upgrade() else {
            return;
        };
        let mut sessions = sessions.write().await;
        if sessions.get(&self.key).is_some_and(|h| h.id == self.id) {
            sessions.remove(&self.key);
        }
    }

    async fn handle(&self, command: Command) -> Flow {
        let Command { user_id, sink, op } = command;
        let name = op.name();
        let stop = matches!(op, Operation::DeleteConversation { .. });

        let start = std::time::Instant::now();
        let result = self.execute(&user_id, op, &sink).await;
        tracing::debug!(
            session = %self.key,
            operation = name,
            duration_ms = %start.elapsed().as_millis(),
            ok = result.is_ok(),
            "Handled command"
        );

        match result {
            Ok(()) if stop => Flow::Stop,
            Ok(()) => Flow::Continue,
            Err(e) => {
                report(name, &e, &sink);
                Flow::Continue
            }
        }
    }

    async fn execute(&self, user_id: &str, op: Operation, sink: &EventSink) -> Result<(), SessionError> {
        match op {
            Operation::SendMessage {
                conversation_id,
                content,
            } => self.send_message(user_id, &conversation_id, &content, sink).await,
            Operation::UpdateMetadata {
                conversation_id,
                index,
                metadata,
            } => {
                let storage = &self.services.storage;
                storage.conversation_for_user(&conversation_id, user_id).await?;
                storage
                    .update_message_metadata(&conversation_id, index, &metadata)
                    .await?;
                emit(sink, ServerEvent::MetadataUpdated {
                    conversation_id,
                    message_index: index,
                    metadata,
                });
                Ok(())
            }
            Operation::GetMessages { conversation_id } => {
                let storage = &self.services.storage;
                storage.conversation_for_user(&conversation_id, user_id).await?;
                let messages = storage.get_messages(&conversation_id).await?;
                emit(sink, ServerEvent::MessagesLoaded {
                    conversation_id,
                    messages,
                });
                Ok(())
            }
            Operation::GetMetadata {
                conversation_id,
                index,
            } => {
                let storage = &self.services.storage;
                storage.conversation_for_user(&conversation_id, user_id).await?;
                let message = storage.get_message(&conversation_id, index).await?;
                emit(sink, ServerEvent::Metadata {
                    conversation_id,
                    message_index: index,
                    metadata: message.metadata,
                });
                Ok(())
            }
            Operation::CloseConversation { conversation_id } => {
                let storage = &self.services.storage;
                storage.conversation_for_user(&conversation_id, user_id).await?;
                storage
                    .set_conversation_status(&conversation_id, ConversationStatus::Closed)
                    .await?;
                tracing::info!(conv_id = %conversation_id, "Conversation closed");
                emit(sink, ServerEvent::ConversationClosed { conversation_id });
                Ok(())
            }
            Operation::DeleteConversation { conversation_id } => {
                self.services
                    .storage
                    .delete_conversation(&conversation_id, user_id)
                    .await?;
                tracing::info!(conv_id = %conversation_id, "Conversation deleted");
                emit(sink, ServerEvent::ConversationDeleted { conversation_id });
                Ok(())
            }
            Operation::NewPrediction {
                prediction_id,
                disease,
                conversation_id,
            } => {
                self.start_prediction(user_id, &prediction_id, disease, conversation_id.as_deref(), sink)
                    .await
            }
            Operation::UpdatePrediction {
                prediction_id,
                changes,
            } => self.update_prediction(user_id, &prediction_id, changes, sink).await,
            Operation::CancelPrediction { prediction_id } => {
                let record = self.prediction(user_id, &prediction_id).await?;
                self.drive(&record, vec![Event::Cancel], sink).await?;
                emit(sink, ServerEvent::PredictionCancelled { prediction_id });
                Ok(())
            }
            Operation::Predict { prediction_id } => {
                let record = self.prediction(user_id, &prediction_id).await?;
                self.drive(&record, vec![Event::Confirm], sink).await.map(drop)
            }
            Operation::DeletePrediction { prediction_id } => {
                self.services
                    .storage
                    .delete_prediction(&prediction_id, user_id)
                    .await?;
                emit(sink, ServerEvent::PredictionDeleted { prediction_id });
                Ok(())
            }
        }
    }

    // ==================== Dialogue ====================

    async fn send_message(
        &self,
        user_id: &str,
        conversation_id: &str,
        content: &str,
        sink: &EventSink,
    ) -> Result<(), SessionError> {
        if content.trim().is_empty() {
            return Err(SessionError::invalid_field("content", "Message content is required"));
        }

        let window = self
            .services
            .context
            .build_context(user_id, Some(conversation_id))
            .await?;
        if window.conversation.status == ConversationStatus::Closed {
            return Err(SessionError::invalid_field(
                "conversation_id",
                "Conversation is closed",
            ));
        }

        let request = DialogRequest::new(content).with_history(&window.messages);
        // A failed dialog call persists nothing
        let reply = self.ask_dialog(&request).await?;

        let user = NewMessage::user(content, Some(reply.metadata()));
        let ai = NewMessage::ai(reply.response.clone());
        let (user_message, ai_message) = self
            .services
            .storage
            .append_exchange(conversation_id, &user, &ai)
            .await?;

        emit(sink, ServerEvent::MessageSaved {
            conversation_id: conversation_id.to_string(),
            message: user_message,
        });
        emit(sink, ServerEvent::AiResponse {
            conversation_id: conversation_id.to_string(),
            message: ai_message,
            intent: reply.intent.as_str().to_string(),
            entities: reply.entities.clone(),
            confidence: reply.confidence,
        });

        self.follow_intent(user_id, conversation_id, &reply, sink).await
    }

    async fn ask_dialog(&self, request: &DialogRequest) -> Result<DialogReply, SessionError> {
        let deadline = self.services.settings.dialog_timeout;
        match tokio::time::timeout(deadline, self.services.dialog.process(request)).await {
            Ok(result) => result.map_err(SessionError::from),
            Err(_) => Err(LlmError::timed_out(format!(
                "No dialog reply within {}ms",
                deadline.as_millis()
            ))
            .into()),
        }
    }

    /// Drive the conversation's active prediction from the reply's intent
    async fn follow_intent(
        &self,
        user_id: &str,
        conversation_id: &str,
        reply: &DialogReply,
        sink: &EventSink,
    ) -> Result<(), SessionError> {
        let events = match &reply.intent {
            Intent::StartPrediction => {
                let Some(disease) = reply.disease_entity() else {
                    tracing::debug!(conv_id = %conversation_id, "Prediction intent without a disease");
                    return Ok(());
                };
                let prediction_id = Uuid::new_v4().to_string();
                return self
                    .start_prediction(user_id, &prediction_id, disease, Some(conversation_id), sink)
                    .await;
            }
            Intent::UpdateParameter => {
                let mut values = reply.parameter_entities();
                match values.len() {
                    0 => return Ok(()),
                    1 => {
                        let (name, value) = values.remove(0);
                        vec![Event::SetParameter { name, value }]
                    }
                    _ => vec![Event::SetParameters { values }],
                }
            }
            Intent::DeleteParameter => reply
                .parameter_names()
                .into_iter()
                .map(|name| Event::DeleteParameter { name })
                .collect(),
            Intent::ConfirmPrediction => vec![Event::Confirm],
            Intent::CancelPrediction => vec![Event::Cancel],
            Intent::Other(_) => return Ok(()),
        };

        let Some(record) = self
            .services
            .storage
            .latest_pending_prediction(conversation_id)
            .await?
        else {
            tracing::debug!(
                conv_id = %conversation_id,
                intent = reply.intent.as_str(),
                "No active prediction for workflow intent"
            );
            return Ok(());
        };

        let cancelled = matches!(reply.intent, Intent::CancelPrediction);
        self.drive(&record, events, sink).await?;
        if cancelled {
            emit(sink, ServerEvent::PredictionCancelled {
                prediction_id: record.id,
            });
        }
        Ok(())
    }

    // ==================== Predictions ====================

    async fn prediction(&self, user_id: &str, prediction_id: &str) -> Result<PredictionRecord, SessionError> {
        Ok(self
            .services
            .storage
            .prediction_for_user(prediction_id, user_id)
            .await?)
    }

    fn workflow_for(&self, record: &PredictionRecord) -> Result<Workflow, SessionError> {
        let schema = self.services.registry.require(record.disease_type)?;
        Ok(Workflow::restore(
            schema,
            &record.parameters,
            record.status == PredictionStatus::Completed,
        ))
    }

    async fn start_prediction(
        &self,
        user_id: &str,
        prediction_id: &str,
        disease: DiseaseType,
        conversation_id: Option<&str>,
        sink: &EventSink,
    ) -> Result<(), SessionError> {
        let schema = self.services.registry.require(disease)?;
        let storage = &self.services.storage;
        if let Some(conversation_id) = conversation_id {
            storage.conversation_for_user(conversation_id, user_id).await?;
        }

        let record = storage
            .create_prediction(prediction_id, user_id, conversation_id, disease)
            .await?;
        tracing::info!(prediction_id, %disease, conv_id = ?conversation_id, "Prediction started");

        emit(sink, ServerEvent::PredictionCreated { prediction: record });
        emit(sink, ServerEvent::WorkflowUpdated {
            prediction_id: prediction_id.to_string(),
            workflow: Workflow::new(schema).snapshot(),
        });
        Ok(())
    }

    async fn update_prediction(
        &self,
        user_id: &str,
        prediction_id: &str,
        changes: ParameterChanges,
        sink: &EventSink,
    ) -> Result<(), SessionError> {
        if changes.is_empty() {
            return Err(SessionError::invalid_field("parameters", "No parameter changes given"));
        }
        let record = self.prediction(user_id, prediction_id).await?;

        let mut events = Vec::with_capacity(changes.remove.len() + 1);
        if !changes.set.is_empty() {
            events.push(Event::SetParameters { values: changes.set });
        }
        events.extend(
            changes
                .remove
                .into_iter()
                .map(|name| Event::DeleteParameter { name }),
        );
        let workflow = self.drive(&record, events, sink).await?;

        let (follow_up_questions, recommendations) = self.guidance(&record, &workflow).await;
        self.services
            .storage
            .update_prediction_guidance(prediction_id, &follow_up_questions, &recommendations)
            .await?;

        let prediction = self.prediction(user_id, prediction_id).await?;
        emit(sink, ServerEvent::PredictionUpdated { prediction });
        Ok(())
    }

    /// Follow-up questions and recommendations for the current values.
    /// A dialog failure yields empty lists.
    async fn guidance(&self, record: &PredictionRecord, workflow: &Workflow) -> (Vec<String>, Vec<String>) {
        let mut request = DialogRequest::new(guidance_request(workflow.schema(), workflow.collected()));
        if let Some(conversation_id) = record.conversation_id.as_deref() {
            let limit = self.services.context.limit();
            match self.services.storage.recent_messages(conversation_id, limit).await {
                Ok(messages) => request = request.with_history(&messages),
                Err(e) => tracing::warn!(conv_id = %conversation_id, error = %e, "Could not load guidance context"),
            }
        }

        match self.ask_dialog(&request).await {
            Ok(reply) => (reply.follow_up_questions, reply.recommendations),
            Err(e) => {
                e.log("prediction_guidance");
                (Vec::new(), Vec::new())
            }
        }
    }

    /// Run events through the workflow, executing effects as they come.
    ///
    /// Every event is checked against a scratch copy first, so a batch is
    /// applied all-or-nothing. Effects that produce an event (dispatch)
    /// have it processed next.
    async fn drive(
        &self,
        record: &PredictionRecord,
        events: Vec<Event>,
        sink: &EventSink,
    ) -> Result<Workflow, SessionError> {
        let mut workflow = self.workflow_for(record)?;

        let mut scratch = workflow.clone();
        for event in &events {
            scratch = transition(&scratch, event.clone())?.new_state;
        }

        let mut pending: VecDeque<Event> = events.into();
        while let Some(event) = pending.pop_front() {
            let result = transition(&workflow, event)?;
            for effect in result.effects {
                if let Some(generated) = self
                    .execute_effect(&record.id, &result.new_state, effect, sink)
                    .await?
                {
                    pending.push_front(generated);
                }
            }
            workflow = result.new_state;
        }

        Ok(workflow)
    }

    async fn execute_effect(
        &self,
        prediction_id: &str,
        state: &Workflow,
        effect: Effect,
        sink: &EventSink,
    ) -> Result<Option<Event>, SessionError> {
        match effect {
            Effect::PersistParameters { parameters } => {
                self.services
                    .storage
                    .update_prediction_parameters(prediction_id, &parameters)
                    .await?;
                Ok(None)
            }

            Effect::NotifyParameterUpdated { name, value } => {
                emit(sink, ServerEvent::ParameterUpdated {
                    prediction_id: prediction_id.to_string(),
                    parameter_name: name,
                    parameter_value: value,
                });
                Ok(None)
            }

            Effect::NotifyWorkflow => {
                emit(sink, ServerEvent::WorkflowUpdated {
                    prediction_id: prediction_id.to_string(),
                    workflow: state.snapshot(),
                });
                Ok(None)
            }

            Effect::DispatchPrediction {
                disease,
                parameters,
            } => {
                let predictor = self.services.predictors.get(disease)?;
                let deadline = self.services.settings.predictor_timeout;
                let outcome = tokio::time::timeout(deadline, predictor.predict(state.schema(), &parameters))
                    .await
                    .map_err(|_| PredictorError::TimedOut)??;
                Ok(Some(Event::Dispatched { outcome }))
            }

            Effect::PersistOutcome { outcome } => {
                self.services
                    .storage
                    .complete_prediction(prediction_id, &outcome)
                    .await?;
                Ok(None)
            }

            Effect::NotifyCompleted { outcome } => {
                tracing::info!(prediction_id, label = %outcome.label, "Prediction completed");
                emit(sink, ServerEvent::PredictionCompleted {
                    prediction_id: prediction_id.to_string(),
                    result: outcome,
                });
                Ok(None)
            }
        }
    }
}

fn emit(sink: &EventSink, event: ServerEvent) {
    // A client that went away just stops receiving
    let _ = sink.send(event);
}
