//! Gateway wire types
//!
//! Clients send `{"event": <name>, "data": {...}}` frames; the reply side is
//! `runtime::ServerEvent`, which serializes to the same envelope.

use crate::db::MessageMetadata;
use crate::parameters::DiseaseType;
use crate::runtime::{ParameterChanges, SessionError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Raw incoming envelope
#[derive(Debug, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

/// A decoded client request
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    NewConversation {
        content: Option<String>,
    },
    GetConversations,
    GetMessages {
        conversation_id: String,
    },
    Message {
        conversation_id: String,
        content: String,
    },
    UpdateMessageMetadata {
        conversation_id: String,
        message_index: usize,
        metadata: MessageMetadata,
    },
    GetMessageMetadata {
        conversation_id: String,
        message_index: usize,
    },
    CloseConversation {
        conversation_id: String,
    },
    DeleteConversation {
        conversation_id: String,
    },
    NewPrediction {
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
    GetPredictions,
}

#[derive(Deserialize)]
struct NewConversationData {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ConversationRef {
    conversation_id: String,
}

#[derive(Deserialize)]
struct MessageData {
    conversation_id: String,
    content: String,
}

#[derive(Deserialize)]
struct MessageRef {
    conversation_id: String,
    message_index: usize,
}

#[derive(Deserialize)]
struct MetadataData {
    conversation_id: String,
    message_index: usize,
    metadata: MessageMetadata,
}

#[derive(Deserialize)]
struct NewPredictionData {
    #[serde(alias = "disease_type")]
    disease: String,
    conversation_id: Option<String>,
}

#[derive(Deserialize)]
struct PredictionRef {
    prediction_id: String,
}

/// Either a batch `parameters` map or a single `parameter_name` and
/// `parameter_value`; a null value removes the parameter
#[derive(Deserialize)]
struct UpdatePredictionData {
    prediction_id: String,
    #[serde(default)]
    parameters: BTreeMap<String, Value>,
    parameter_name: Option<String>,
    parameter_value: Option<Value>,
    #[serde(default)]
    remove: Vec<String>,
}

impl UpdatePredictionData {
    fn into_changes(self) -> Result<ClientEvent, SessionError> {
        let mut values = self.parameters;
        if let Some(name) = self.parameter_name {
            let value = self.parameter_value.unwrap_or(Value::Null);
            values.insert(name, value);
        }

        let mut changes = ParameterChanges {
            set: Vec::with_capacity(values.len()),
            remove: self.remove,
        };
        for (name, value) in values {
            match value {
                Value::Null => changes.remove.push(name),
                Value::String(s) => changes.set.push((name, s)),
                Value::Number(n) => changes.set.push((name, n.to_string())),
                _ => {
                    let message = format!("Value for {name} must be a number");
                    return Err(SessionError::invalid_field(name, message));
                }
            }
        }

        Ok(ClientEvent::UpdatePrediction {
            prediction_id: self.prediction_id,
            changes,
        })
    }
}

fn payload<T: DeserializeOwned>(event: &str, data: Value) -> Result<T, SessionError> {
    // A missing `data` is an empty payload
    let data = if data.is_null() {
        Value::Object(Map::new())
    } else {
        data
    };
    serde_json::from_value(data)
        .map_err(|e| SessionError::validation(format!("Invalid payload for {event}: {e}")))
}

impl ClientEvent {
    pub fn from_frame(frame: Frame) -> Result<Self, SessionError> {
        let Frame { event, data } = frame;
        let name = event.as_str();

        let decoded = match name {
            "new_conversation" => {
                let d: NewConversationData = payload(name, data)?;
                ClientEvent::NewConversation { content: d.content }
            }
            "get_conversations" => ClientEvent::GetConversations,
            "get_messages" => {
                let d: ConversationRef = payload(name, data)?;
                ClientEvent::GetMessages {
                    conversation_id: d.conversation_id,
                }
            }
            "message" => {
                let d: MessageData = payload(name, data)?;
                ClientEvent::Message {
                    conversation_id: d.conversation_id,
                    content: d.content,
                }
            }
            "update_message_metadata" => {
                let d: MetadataData = payload(name, data)?;
                ClientEvent::UpdateMessageMetadata {
                    conversation_id: d.conversation_id,
                    message_index: d.message_index,
                    metadata: d.metadata,
                }
            }
            "get_message_metadata" => {
                let d: MessageRef = payload(name, data)?;
                ClientEvent::GetMessageMetadata {
                    conversation_id: d.conversation_id,
                    message_index: d.message_index,
                }
            }
            "close_conversation" => {
                let d: ConversationRef = payload(name, data)?;
                ClientEvent::CloseConversation {
                    conversation_id: d.conversation_id,
                }
            }
            "delete_conversation" => {
                let d: ConversationRef = payload(name, data)?;
                ClientEvent::DeleteConversation {
                    conversation_id: d.conversation_id,
                }
            }
            "new_prediction" => {
                let d: NewPredictionData = payload(name, data)?;
                ClientEvent::NewPrediction {
                    disease: d.disease.parse()?,
                    conversation_id: d.conversation_id,
                }
            }
            "update_prediction" | "parameter_received" => {
                let d: UpdatePredictionData = payload(name, data)?;
                d.into_changes()?
            }
            "cancel_prediction" => {
                let d: PredictionRef = payload(name, data)?;
                ClientEvent::CancelPrediction {
                    prediction_id: d.prediction_id,
                }
            }
            "predict" => {
                let d: PredictionRef = payload(name, data)?;
                ClientEvent::Predict {
                    prediction_id: d.prediction_id,
                }
            }
            "delete_prediction" => {
                let d: PredictionRef = payload(name, data)?;
                ClientEvent::DeletePrediction {
                    prediction_id: d.prediction_id,
                }
            }
            "get_predictions" => ClientEvent::GetPredictions,
            other => {
                return Err(SessionError::invalid_field(
                    "event",
                    format!("Unknown event: {other}"),
                ))
            }
        };
        Ok(decoded)
    }
}

/// `GET /health`
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_sessions: usize,
}
