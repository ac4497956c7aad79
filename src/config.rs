//! Environment-driven configuration

use crate::context::DEFAULT_CONTEXT_LIMIT;
use crate::llm::{DialogConfig, DEFAULT_BASE_URL, DEFAULT_MODEL};
use crate::parameters::DiseaseType;
use crate::predictor::PredictorConfig;
use crate::runtime::SessionSettings;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_PREDICTOR_DISEASES: &str = "diabetes,heart,liver,breast_cancer,parkinsons";

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got {value:?}")]
    Invalid {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("Unknown disease in PREDICTOR_DISEASES: {0}")]
    UnknownDisease(String),
    #[error("MEDIPREDICT_API_TOKENS entries must be user_id:token, got {0:?}")]
    MalformedToken(String),
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub port: u16,
    pub dialog: DialogConfig,
    pub predictor: PredictorConfig,
    pub context_limit: usize,
    pub session: SessionSettings,
    /// `(user_id, token)` pairs accepted by the gateway
    pub api_tokens: Vec<(String, String)>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let db_path = var("MEDIPREDICT_DB_PATH").map_or_else(
            || {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".medipredict").join("medipredict.db")
            },
            PathBuf::from,
        );

        let dialog_timeout = Duration::from_secs(parse(&var, "DIALOG_TIMEOUT_SECS", 30)?);
        let predictor_timeout = Duration::from_secs(parse(&var, "PREDICTOR_TIMEOUT_SECS", 15)?);
        let idle_timeout = Duration::from_secs(parse(&var, "SESSION_IDLE_SECS", 600)?);

        let dialog = DialogConfig {
            api_key: var("GROQ_API_KEY"),
            base_url: var("DIALOG_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: var("DIALOG_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            timeout: dialog_timeout,
            ..DialogConfig::default()
        };

        let diseases = var("PREDICTOR_DISEASES").unwrap_or_else(|| DEFAULT_PREDICTOR_DISEASES.to_string());
        let predictor = PredictorConfig {
            base_url: var("PREDICTOR_URL"),
            diseases: parse_diseases(&diseases)?,
            timeout: predictor_timeout,
        };

        Ok(Self {
            db_path,
            port: parse(&var, "MEDIPREDICT_PORT", DEFAULT_PORT)?,
            dialog,
            predictor,
            context_limit: parse(&var, "CONTEXT_WINDOW_LIMIT", DEFAULT_CONTEXT_LIMIT)?,
            session: SessionSettings {
                dialog_timeout,
                predictor_timeout,
                idle_timeout,
            },
            api_tokens: parse_tokens(var("MEDIPREDICT_API_TOKENS").as_deref().unwrap_or_default())?,
        })
    }
}

fn parse<T, F>(var: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            name,
            expected: "a non-negative integer",
            value,
        }),
    }
}

fn parse_diseases(raw: &str) -> Result<Vec<DiseaseType>, ConfigError> {
    let mut diseases = Vec::new();
    for name in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let disease: DiseaseType = name
            .parse()
            .map_err(|_| ConfigError::UnknownDisease(name.to_string()))?;
        if !diseases.contains(&disease) {
            diseases.push(disease);
        }
    }
    Ok(diseases)
}

fn parse_tokens(raw: &str) -> Result<Vec<(String, String)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((user, token)) if !user.trim().is_empty() && !token.trim().is_empty() => {
                Ok((user.trim().to_string(), token.trim().to_string()))
            }
            _ => Err(ConfigError::MalformedToken(entry.to_string())),
        })
        .collect()
}
