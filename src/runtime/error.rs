//! Error taxonomy surfaced to clients
//!
//! Every failure is scoped to the event that caused it and reported as an
//! `error` event; the kind lets callers branch without reading the text.

use super::ServerEvent;
use crate::db::DbError;
use crate::llm::{LlmError, LlmErrorKind};
use crate::parameters::{ParameterRejection, UnknownDisease};
use crate::predictor::PredictorError;
use crate::state_machine::TransitionError;
use serde::Serialize;
use thiserror::Error;

const DIALOG_FAILED: &str = "The assistant is unavailable right now. Please try again.";
const DIALOG_TIMED_OUT: &str = "The assistant took too long to respond. Please try again.";
const PREDICTOR_FAILED: &str = "The prediction service failed. Please try again.";
const PREDICTOR_TIMED_OUT: &str = "The prediction service took too long to respond. Please try again.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    ExternalService,
    Persistence,
    Unauthenticated,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{message}")]
    Validation {
        field: Option<String>,
        message: String,
    },
    #[error("{0}")]
    NotFound(String),
    /// `message` is shown to the client, `detail` is only logged
    #[error("{message}")]
    ExternalService { message: String, detail: String },
    #[error("Failed to save changes")]
    Persistence(#[source] DbError),
    #[error("Authentication required")]
    Unauthenticated,
}

impl SessionError {
    pub fn validation(message: impl Into<String>) -> Self {
        SessionError::Validation {
            field: None,
            message: message.into(),
        }
    }

    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        SessionError::Validation {
            field: Some(field.into()),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Validation { .. } => ErrorKind::Validation,
            SessionError::NotFound(_) => ErrorKind::NotFound,
            SessionError::ExternalService { .. } => ErrorKind::ExternalService,
            SessionError::Persistence(_) => ErrorKind::Persistence,
            SessionError::Unauthenticated => ErrorKind::Unauthenticated,
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            SessionError::Validation { field, .. } => field.as_deref(),
            _ => None,
        }
    }

    pub fn to_event(&self) -> ServerEvent {
        ServerEvent::Error {
            message: self.to_string(),
            kind: self.kind(),
            field: self.field().map(String::from),
        }
    }

    /// Log with full detail. Validation and not-found are routine.
    pub fn log(&self, operation: &str) {
        match self {
            SessionError::ExternalService { message, detail } => {
                tracing::warn!(operation, %message, %detail, "External service error");
            }
            SessionError::Persistence(e) => {
                tracing::error!(operation, error = %e, "Persistence error");
            }
            other => {
                tracing::debug!(operation, kind = ?other.kind(), error = %other, "Request rejected");
            }
        }
    }
}

impl From<DbError> for SessionError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::ConversationNotFound(_) => SessionError::NotFound("Conversation not found".to_string()),
            DbError::PredictionNotFound(_) => SessionError::NotFound("Prediction not found".to_string()),
            DbError::IndexOutOfRange { .. } | DbError::NotUserMessage(_) => {
                SessionError::invalid_field("message_index", e.to_string())
            }
            other => SessionError::Persistence(other),
        }
    }
}

impl From<ParameterRejection> for SessionError {
    fn from(e: ParameterRejection) -> Self {
        SessionError::invalid_field(e.field(), e.to_string())
    }
}

impl From<TransitionError> for SessionError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::Rejected(rejection) => rejection.into(),
            TransitionError::Incomplete { ref missing } => SessionError::Validation {
                field: missing.first().cloned(),
                message: e.to_string(),
            },
            other => SessionError::validation(other.to_string()),
        }
    }
}

impl From<UnknownDisease> for SessionError {
    fn from(e: UnknownDisease) -> Self {
        SessionError::NotFound(e.to_string())
    }
}

impl From<PredictorError> for SessionError {
    fn from(e: PredictorError) -> Self {
        match e {
            PredictorError::Unavailable(_) => SessionError::NotFound(e.to_string()),
            PredictorError::InvalidInput(_) => SessionError::validation(e.to_string()),
            PredictorError::TimedOut => SessionError::ExternalService {
                message: PREDICTOR_TIMED_OUT.to_string(),
                detail: e.to_string(),
            },
            PredictorError::Failed(_) => SessionError::ExternalService {
                message: PREDICTOR_FAILED.to_string(),
                detail: e.to_string(),
            },
        }
    }
}

impl From<LlmError> for SessionError {
    fn from(e: LlmError) -> Self {
        let message = if e.kind == LlmErrorKind::TimedOut {
            DIALOG_TIMED_OUT
        } else {
            DIALOG_FAILED
        };
        SessionError::ExternalService {
            message: message.to_string(),
            detail: e.message,
        }
    }
}
