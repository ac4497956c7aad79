//! Predictor collaborator
//!
//! Disease-outcome inference is an opaque capability keyed by disease type.
//! A disease with no registered predictor is reported as
//! [`PredictorError::Unavailable`], distinct from a prediction that fails.

use crate::parameters::{DiseaseSchema, DiseaseType};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Label and confidence returned by a predictor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionOutcome {
    pub label: String,
    pub confidence: f64,
}

impl PredictionOutcome {
    /// Confidence is clamped into [0, 1]
    pub fn new(label: impl Into<String>, confidence: f64) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            label: label.into(),
            confidence,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PredictorError {
    #[error("No predictor found for {0}")]
    Unavailable(DiseaseType),
    #[error("Invalid predictor input: {0}")]
    InvalidInput(String),
    #[error("Prediction failed: {0}")]
    Failed(String),
    #[error("Prediction timed out")]
    TimedOut,
}

/// Common interface for outcome models
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(
        &self,
        schema: &DiseaseSchema,
        parameters: &BTreeMap<String, String>,
    ) -> Result<PredictionOutcome, PredictorError>;
}

/// Feature vector in schema order. Every schema parameter must be present.
pub fn feature_vector(
    schema: &DiseaseSchema,
    parameters: &BTreeMap<String, String>,
) -> Result<Vec<f64>, PredictorError> {
    schema
        .parameters()
        .iter()
        .map(|spec| {
            let raw = parameters
                .get(spec.name)
                .ok_or_else(|| PredictorError::InvalidInput(format!("missing {}", spec.name)))?;
            raw.trim()
                .parse::<f64>()
                .map_err(|_| PredictorError::InvalidInput(format!("{} is not a number", spec.name)))
        })
        .collect()
}

/// Predictors keyed by disease
#[derive(Default, Clone)]
pub struct PredictorRegistry {
    predictors: HashMap<DiseaseType, Arc<dyn Predictor>>,
}

impl PredictorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// HTTP predictors for each enabled disease, each wrapped for logging
    pub fn from_config(config: &PredictorConfig) -> Result<Self, PredictorError> {
        let mut registry = Self::new();
        let Some(base_url) = config.base_url.as_deref() else {
            return Ok(registry);
        };
        for disease in &config.diseases {
            let http = HttpPredictor::new(base_url, *disease, config.timeout)?;
            registry.register(*disease, Arc::new(LoggingPredictor::new(*disease, Arc::new(http))));
        }
        Ok(registry)
    }

    pub fn register(&mut self, disease: DiseaseType, predictor: Arc<dyn Predictor>) {
        self.predictors.insert(disease, predictor);
    }

    pub fn get(&self, disease: DiseaseType) -> Result<Arc<dyn Predictor>, PredictorError> {
        self.predictors
            .get(&disease)
            .cloned()
            .ok_or(PredictorError::Unavailable(disease))
    }

    pub fn diseases(&self) -> Vec<DiseaseType> {
        let mut diseases: Vec<_> = self.predictors.keys().copied().collect();
        diseases.sort();
        diseases
    }
}

/// Model-server settings
#[derive(Debug, Clone, PartialEq)]
pub struct PredictorConfig {
    /// Base URL of the model server; `None` registers no predictors
    pub base_url: Option<String>,
    pub diseases: Vec<DiseaseType>,
    pub timeout: Duration,
}

// ============================================================================
// HTTP model server
// ============================================================================

#[derive(Debug, Serialize)]
struct PredictRequest<'a> {
    disease: DiseaseType,
    feature_names: Vec<&'a str>,
    features: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    prediction: Value,
    #[serde(default)]
    confidence: Option<f64>,
}

impl PredictResponse {
    fn into_outcome(self) -> Result<PredictionOutcome, PredictorError> {
        let label = match self.prediction {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => {
                return Err(PredictorError::Failed(format!(
                    "unexpected prediction value: {other}"
                )))
            }
        };
        Ok(PredictionOutcome::new(label, self.confidence.unwrap_or(0.0)))
    }
}

/// Predictor backed by a model server at `POST {base}/predict/{disease}`
pub struct HttpPredictor {
    client: Client,
    endpoint: String,
}

impl HttpPredictor {
    pub fn new(base_url: &str, disease: DiseaseType, timeout: Duration) -> Result<Self, PredictorError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PredictorError::Failed(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{}/predict/{disease}", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl Predictor for HttpPredictor {
    async fn predict(
        &self,
        schema: &DiseaseSchema,
        parameters: &BTreeMap<String, String>,
    ) -> Result<PredictionOutcome, PredictorError> {
        let request = PredictRequest {
            disease: schema.disease,
            feature_names: schema.names().collect(),
            features: feature_vector(schema, parameters)?,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    PredictorError::TimedOut
                } else {
                    PredictorError::Failed(format!("Request failed: {e}"))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| PredictorError::Failed(format!("Failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(PredictorError::Failed(format!("HTTP {status}: {body}")));
        }

        serde_json::from_str::<PredictResponse>(&body)
            .map_err(|e| PredictorError::Failed(format!("Malformed response: {e}")))?
            .into_outcome()
    }
}

/// Logging wrapper for predictors
pub struct LoggingPredictor {
    inner: Arc<dyn Predictor>,
    disease: DiseaseType,
}

impl LoggingPredictor {
    pub fn new(disease: DiseaseType, inner: Arc<dyn Predictor>) -> Self {
        Self { inner, disease }
    }
}

#[async_trait]
impl Predictor for LoggingPredictor {
    async fn predict(
        &self,
        schema: &DiseaseSchema,
        parameters: &BTreeMap<String, String>,
    ) -> Result<PredictionOutcome, PredictorError> {
        let start = std::time::Instant::now();
        let result = self.inner.predict(schema, parameters).await;
        let duration = start.elapsed();

        match &result {
            Ok(outcome) => tracing::info!(
                disease = %self.disease,
                duration_ms = %duration.as_millis(),
                label = %outcome.label,
                confidence = outcome.confidence,
                "Prediction completed"
            ),
            Err(e) => tracing::error!(
                disease = %self.disease,
                duration_ms = %duration.as_millis(),
                error = %e,
                "Prediction failed"
            ),
        }

        result
    }
}
