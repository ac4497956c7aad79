//! Effects produced by workflow transitions

use crate::parameters::DiseaseType;
use crate::predictor::PredictionOutcome;
use std::collections::BTreeMap;

/// Effects to be executed by the session runtime after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Store the collected map on the prediction record
    PersistParameters { parameters: BTreeMap<String, String> },

    /// Tell the client a single parameter changed (`None` = removed)
    NotifyParameterUpdated { name: String, value: Option<String> },

    /// Broadcast the workflow snapshot
    NotifyWorkflow,

    /// Invoke the predictor with the frozen parameters
    DispatchPrediction {
        disease: DiseaseType,
        parameters: BTreeMap<String, String>,
    },

    /// Store the predictor's answer and mark the record completed
    PersistOutcome { outcome: PredictionOutcome },

    NotifyCompleted { outcome: PredictionOutcome },
}

impl Effect {
    pub fn persist(parameters: &BTreeMap<String, String>) -> Self {
        Effect::PersistParameters {
            parameters: parameters.clone(),
        }
    }

    pub fn parameter_set(name: impl Into<String>, value: impl Into<String>) -> Self {
        Effect::NotifyParameterUpdated {
            name: name.into(),
            value: Some(value.into()),
        }
    }

    pub fn parameter_removed(name: impl Into<String>) -> Self {
        Effect::NotifyParameterUpdated {
            name: name.into(),
            value: None,
        }
    }
}
