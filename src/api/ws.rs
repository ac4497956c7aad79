//! WebSocket event gateway
//!
//! One socket per client. Outgoing events flow through an unbounded channel
//! so actors never wait on a slow client; incoming frames are decoded and
//! routed to the session manager.

use super::types::{ClientEvent, Frame};
use super::AppState;
use crate::runtime::{report, EventSink, ProductionSessionManager, ServerEvent, SessionError};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// `GET /ws`. The token comes from the `Authorization: Bearer` header or the
/// `token` query parameter (browsers cannot set headers on upgrades).
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    Query(query): Query<TokenQuery>,
) -> Response {
    let token = bearer
        .map(|TypedHeader(Authorization(b))| b.token().to_string())
        .or(query.token);
    let user_id = token
        .as_deref()
        .and_then(|t| state.auth.authenticate(t))
        .map(String::from);

    if user_id.is_none() {
        tracing::warn!(token_present = token.is_some(), "Unauthenticated gateway connection");
    }

    ws.on_upgrade(move |socket| handle_socket(socket, user_id, state))
}

async fn handle_socket(socket: WebSocket, user_id: Option<String>, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (sink, mut events) = mpsc::unbounded_channel::<ServerEvent>();

    let greeting = match &user_id {
        Some(user_id) => ServerEvent::Connected {
            user_id: user_id.clone(),
        },
        None => SessionError::Unauthenticated.to_event(),
    };
    let _ = sink.send(greeting);
    tracing::info!(user_id = ?user_id, "Client connected");

    let mut send_task = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize event");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let sessions = state.sessions.clone();
    let recv_user = user_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = receiver.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    handle_frame(&sessions, recv_user.as_deref(), &text, &sink).await;
                }
                Ok(Message::Binary(_)) => {
                    let err = SessionError::validation("Binary frames are not supported");
                    report("frame", &err, &sink);
                }
                Ok(Message::Close(_)) => break,
                // Ping/pong is answered by axum
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(error = %e, "Receive error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    tracing::info!(user_id = ?user_id, "Client disconnected");
}

/// Decode one text frame and route it. Every failure becomes an `error` event.
pub async fn handle_frame(
    sessions: &ProductionSessionManager,
    user_id: Option<&str>,
    text: &str,
    sink: &EventSink,
) {
    let Some(user_id) = user_id else {
        return report("frame", &SessionError::Unauthenticated, sink);
    };

    let event = serde_json::from_str::<Frame>(text)
        .map_err(|e| SessionError::validation(format!("Malformed event: {e}")))
        .and_then(ClientEvent::from_frame);
    match event {
        Ok(event) => route(sessions, user_id, event, sink).await,
        Err(e) => report("frame", &e, sink),
    }
}

async fn route(sessions: &ProductionSessionManager, user_id: &str, event: ClientEvent, sink: &EventSink) {
    match event {
        ClientEvent::NewConversation { content } => {
            sessions.new_conversation(user_id, content, sink).await;
        }
        ClientEvent::GetConversations => sessions.list_conversations(user_id, sink).await,
        ClientEvent::GetMessages { conversation_id } => {
            sessions.get_messages(user_id, &conversation_id, sink).await;
        }
        ClientEvent::Message {
            conversation_id,
            content,
        } => sessions.send_message(user_id, &conversation_id, content, sink).await,
        ClientEvent::UpdateMessageMetadata {
            conversation_id,
            message_index,
            metadata,
        } => {
            sessions
                .update_message_metadata(user_id, &conversation_id, message_index, metadata, sink)
                .await;
        }
        ClientEvent::GetMessageMetadata {
            conversation_id,
            message_index,
        } => {
            sessions
                .get_message_metadata(user_id, &conversation_id, message_index, sink)
                .await;
        }
        ClientEvent::CloseConversation { conversation_id } => {
            sessions.close_conversation(user_id, &conversation_id, sink).await;
        }
        ClientEvent::DeleteConversation { conversation_id } => {
            sessions.delete_conversation(user_id, &conversation_id, sink).await;
        }
        ClientEvent::NewPrediction {
            disease,
            conversation_id,
        } => sessions.new_prediction(user_id, disease, conversation_id, sink).await,
        ClientEvent::UpdatePrediction {
            prediction_id,
            changes,
        } => sessions.update_prediction(user_id, &prediction_id, changes, sink).await,
        ClientEvent::CancelPrediction { prediction_id } => {
            sessions.cancel_prediction(user_id, &prediction_id, sink).await;
        }
        ClientEvent::Predict { prediction_id } => sessions.predict(user_id, &prediction_id, sink).await,
        ClientEvent::DeletePrediction { prediction_id } => {
            sessions.delete_prediction(user_id, &prediction_id, sink).await;
        }
        ClientEvent::GetPredictions => sessions.list_predictions(user_id, sink).await,
    }
}
