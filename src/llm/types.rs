//! Dialog request and reply types

use super::LlmError;
use crate::db::{Message, MessageMetadata, MessageType};
use crate::parameters::DiseaseType;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Speaker of a history turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: Role,
    pub content: String,
}

/// One dialogue turn: the new message plus the bounded history window
#[derive(Debug, Clone, PartialEq)]
pub struct DialogRequest {
    pub message: String,
    pub history: Vec<HistoryTurn>,
}

impl DialogRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            history: Vec::new(),
        }
    }

    /// Build the history from stored messages, skipping empty turns
    pub fn with_history(mut self, messages: &[Message]) -> Self {
        self.history = messages
            .iter()
            .filter_map(|m| {
                let content = m.content.clone()?;
                let role = match m.message_type {
                    MessageType::User => Role::User,
                    MessageType::Ai => Role::Assistant,
                };
                Some(HistoryTurn { role, content })
            })
            .collect();
        self
    }
}

/// What the user wants, as classified by the dialog model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Intent {
    StartPrediction,
    UpdateParameter,
    DeleteParameter,
    ConfirmPrediction,
    CancelPrediction,
    Other(String),
}

impl Intent {
    pub fn as_str(&self) -> &str {
        match self {
            Intent::StartPrediction => "start_prediction",
            Intent::UpdateParameter => "update_parameter",
            Intent::DeleteParameter => "delete_parameter",
            Intent::ConfirmPrediction => "confirm_prediction",
            Intent::CancelPrediction => "cancel_prediction",
            Intent::Other(s) => s,
        }
    }
}

impl From<String> for Intent {
    fn from(s: String) -> Self {
        match s.trim().to_lowercase().as_str() {
            "start_prediction" | "disease_prediction" | "prediction_request" => {
                Intent::StartPrediction
            }
            "update_parameter" | "provide_parameter" | "parameter_update" => Intent::UpdateParameter,
            "delete_parameter" | "remove_parameter" => Intent::DeleteParameter,
            "confirm_prediction" | "confirm" | "predict" => Intent::ConfirmPrediction,
            "cancel_prediction" | "cancel" => Intent::CancelPrediction,
            _ => Intent::Other(s),
        }
    }
}

impl From<Intent> for String {
    fn from(intent: Intent) -> Self {
        intent.as_str().to_string()
    }
}

/// Structured reply from the dialog model
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DialogReply {
    pub intent: Intent,
    pub entities: Vec<String>,
    pub confidence: f64,
    pub response: String,
    pub follow_up_questions: Vec<String>,
    pub recommendations: Vec<String>,
}

#[derive(Deserialize)]
struct RawReply {
    #[serde(default)]
    intent: Option<String>,
    #[serde(default)]
    entities: Value,
    #[serde(default)]
    confidence: Value,
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    follow_up_questions: Value,
    #[serde(default)]
    recommendations: Value,
}

pub const UNAVAILABLE_RESPONSE: &str = "AI service unavailable.";

impl DialogReply {
    /// Fixed reply used when no dialog backend is configured
    pub fn unavailable() -> Self {
        Self {
            intent: Intent::Other("service_unavailable".to_string()),
            entities: Vec::new(),
            confidence: 0.0,
            response: UNAVAILABLE_RESPONSE.to_string(),
            follow_up_questions: Vec::new(),
            recommendations: Vec::new(),
        }
    }

    /// Parse the model's JSON reply. Surrounding prose or code fences are
    /// tolerated; a missing `response` is not.
    pub fn parse(raw: &str) -> Result<Self, LlmError> {
        let json = match (raw.find('{'), raw.rfind('}')) {
            (Some(start), Some(end)) if start < end => raw.get(start..=end).unwrap_or(raw),
            _ => return Err(LlmError::malformed("Reply is not a JSON object")),
        };
        let reply: RawReply = serde_json::from_str(json)
            .map_err(|e| LlmError::malformed(format!("Reply is not valid JSON: {e}")))?;
        let response = reply
            .response
            .filter(|r| !r.trim().is_empty())
            .ok_or_else(|| LlmError::malformed("Reply has no response text"))?;

        Ok(Self {
            intent: Intent::from(reply.intent.unwrap_or_else(|| "general".to_string())),
            entities: flatten_entities(&reply.entities),
            confidence: parse_confidence(&reply.confidence),
            response,
            follow_up_questions: string_list(&reply.follow_up_questions),
            recommendations: string_list(&reply.recommendations),
        })
    }

    /// Metadata recorded on the user message of this exchange
    pub fn metadata(&self) -> MessageMetadata {
        MessageMetadata {
            intent: self.intent.as_str().to_string(),
            entities: self.entities.clone(),
            confidence: self.confidence,
        }
    }

    /// `(name, value)` pairs carried by the entities. Accepts `name=value`,
    /// `name: value`, or bare alternating `name`, `value` entries.
    pub fn parameter_entities(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        let mut bare = Vec::new();
        for entity in &self.entities {
            match entity.split_once('=').or_else(|| entity.split_once(':')) {
                Some((name, value)) => pairs.push((parameter_name(name), value.trim().to_string())),
                None => bare.push(entity.trim()),
            }
        }
        for chunk in bare.chunks(2) {
            if let [name, value] = chunk {
                pairs.push((parameter_name(name), (*value).to_string()));
            }
        }
        pairs
    }

    /// Parameter names mentioned for deletion
    pub fn parameter_names(&self) -> Vec<String> {
        self.entities
            .iter()
            .map(|e| {
                let name = e.split_once('=').map_or(e.as_str(), |(n, _)| n);
                parameter_name(name)
            })
            .collect()
    }

    /// First entity naming a known disease
    pub fn disease_entity(&self) -> Option<DiseaseType> {
        self.entities.iter().find_map(|e| {
            let candidate = e.split_once('=').map_or(e.as_str(), |(_, v)| v);
            candidate.parse().ok()
        })
    }
}

fn parameter_name(raw: &str) -> String {
    raw.trim().to_lowercase().replace([' ', '-'], "_")
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn flatten_entities(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::Object(map) => {
                    let name = map.get("name").or_else(|| map.get("parameter"));
                    match (name.and_then(scalar_to_string), map.get("value").and_then(scalar_to_string)) {
                        (Some(n), Some(v)) => Some(format!("{n}={v}")),
                        _ => map
                            .iter()
                            .next()
                            .and_then(|(k, v)| scalar_to_string(v).map(|v| format!("{k}={v}"))),
                    }
                }
                other => scalar_to_string(other),
            })
            .collect(),
        Value::Object(map) => map
            .iter()
            .filter_map(|(k, v)| scalar_to_string(v).map(|v| format!("{k}={v}")))
            .collect(),
        other => scalar_to_string(other).into_iter().collect(),
    }
}

fn string_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(scalar_to_string).collect(),
        Value::String(s) if !s.trim().is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn parse_confidence(value: &Value) -> f64 {
    let raw = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    raw.filter(|c| c.is_finite()).map_or(0.0, |c| c.clamp(0.0, 1.0))
}
