//! Events that drive a workflow

use crate::predictor::PredictionOutcome;

/// Events that trigger workflow transitions
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Collect or correct one value
    SetParameter { name: String, value: String },
    /// Several values at once; applied only if every one is valid
    SetParameters { values: Vec<(String, String)> },
    DeleteParameter { name: String },
    Confirm,
    /// The predictor answered for a confirmed workflow
    Dispatched { outcome: PredictionOutcome },
    Cancel,
}
