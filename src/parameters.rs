//! Disease parameter schema registry
//!
//! Static catalog of every supported disease: which parameters are collected,
//! in which order, and the numeric range each one accepts. Binary and
//! categorical inputs are numeric codes checked against the same ranges.

mod catalog;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

/// Diseases with a parameter schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiseaseType {
    Diabetes,
    Heart,
    Parkinsons,
    Kidney,
    Liver,
    BreastCancer,
}

impl DiseaseType {
    pub const ALL: [DiseaseType; 6] = [
        DiseaseType::Diabetes,
        DiseaseType::Heart,
        DiseaseType::Parkinsons,
        DiseaseType::Kidney,
        DiseaseType::Liver,
        DiseaseType::BreastCancer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            DiseaseType::Diabetes => "diabetes",
            DiseaseType::Heart => "heart",
            DiseaseType::Parkinsons => "parkinsons",
            DiseaseType::Kidney => "kidney",
            DiseaseType::Liver => "liver",
            DiseaseType::BreastCancer => "breast_cancer",
        }
    }
}

impl fmt::Display for DiseaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown disease type: {0}")]
pub struct UnknownDisease(pub String);

impl FromStr for DiseaseType {
    type Err = UnknownDisease;

    /// Accepts the canonical names plus the spellings people type in chat
    /// ("Parkinson's", "breast cancer", "heart disease").
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .to_lowercase()
            .chars()
            .filter(|c| *c != '\'')
            .map(|c| if c == ' ' || c == '-' { '_' } else { c })
            .collect();
        let normalized = normalized.strip_suffix("_disease").unwrap_or(&normalized);

        match normalized {
            "diabetes" => Ok(DiseaseType::Diabetes),
            "heart" | "cardiac" => Ok(DiseaseType::Heart),
            "parkinsons" | "parkinson" => Ok(DiseaseType::Parkinsons),
            "kidney" | "chronic_kidney" => Ok(DiseaseType::Kidney),
            "liver" => Ok(DiseaseType::Liver),
            "breast_cancer" | "breast" => Ok(DiseaseType::BreastCancer),
            _ => Err(UnknownDisease(s.to_string())),
        }
    }
}

/// One collectable parameter
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParameterSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub lo: f64,
    pub hi: f64,
    pub unit: &'static str,
}

impl ParameterSpec {
    pub const fn new(
        name: &'static str,
        description: &'static str,
        lo: f64,
        hi: f64,
        unit: &'static str,
    ) -> Self {
        Self {
            name,
            description,
            lo,
            hi,
            unit,
        }
    }

    /// Prompt asking the user for this parameter
    pub fn prompt(&self) -> String {
        let mut prompt = format!(
            "Please provide {} (Range: {} to {})",
            self.description, self.lo, self.hi
        );
        if !self.unit.is_empty() {
            prompt.push_str(&format!(" [{}]", self.unit));
        }
        prompt.push(':');
        prompt
    }
}

/// Ordered parameters for one disease. Declaration order is prompting order.
#[derive(Debug, Clone, PartialEq)]
pub struct DiseaseSchema {
    pub disease: DiseaseType,
    parameters: Vec<ParameterSpec>,
}

impl DiseaseSchema {
    pub fn new(disease: DiseaseType, parameters: Vec<ParameterSpec>) -> Self {
        Self {
            disease,
            parameters,
        }
    }

    pub fn get(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    pub fn parameters(&self) -> &[ParameterSpec] {
        &self.parameters
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.parameters.iter().map(|p| p.name)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.parameters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Check a raw value against the named parameter's range
    pub fn range_check(&self, parameter: &str, raw: &str) -> RangeCheck {
        let Some(spec) = self.get(parameter) else {
            return RangeCheck::UnknownParameter;
        };
        match raw.trim().parse::<f64>() {
            Ok(value) if value.is_finite() => {
                if value >= spec.lo && value <= spec.hi {
                    RangeCheck::Valid(value)
                } else {
                    RangeCheck::OutOfRange {
                        lo: spec.lo,
                        hi: spec.hi,
                    }
                }
            }
            _ => RangeCheck::NotNumeric,
        }
    }

    /// Like [`range_check`](Self::range_check), but as a `Result` carrying
    /// the user-facing rejection message.
    pub fn validate(&self, parameter: &str, raw: &str) -> Result<f64, ParameterRejection> {
        self.range_check(parameter, raw).into_result(parameter)
    }
}

/// Outcome of a range check
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RangeCheck {
    Valid(f64),
    OutOfRange { lo: f64, hi: f64 },
    NotNumeric,
    UnknownParameter,
}

impl RangeCheck {
    pub fn into_result(self, name: &str) -> Result<f64, ParameterRejection> {
        let name = name.to_string();
        match self {
            RangeCheck::Valid(v) => Ok(v),
            RangeCheck::OutOfRange { lo, hi } => Err(ParameterRejection::OutOfRange { name, lo, hi }),
            RangeCheck::NotNumeric => Err(ParameterRejection::NotNumeric { name }),
            RangeCheck::UnknownParameter => Err(ParameterRejection::UnknownParameter { name }),
        }
    }
}

/// Why a parameter value was refused
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParameterRejection {
    #[error("Unknown parameter: {name}")]
    UnknownParameter { name: String },
    #[error("Value for {name} must be between {lo} and {hi}")]
    OutOfRange { name: String, lo: f64, hi: f64 },
    #[error("Value for {name} must be a number")]
    NotNumeric { name: String },
}

impl ParameterRejection {
    /// Parameter the rejection refers to
    pub fn field(&self) -> &str {
        match self {
            ParameterRejection::UnknownParameter { name }
            | ParameterRejection::OutOfRange { name, .. }
            | ParameterRejection::NotNumeric { name } => name,
        }
    }
}

/// Process-wide, read-only set of disease schemas
#[derive(Debug, Clone)]
pub struct ParameterRegistry {
    schemas: HashMap<DiseaseType, Arc<DiseaseSchema>>,
}

impl ParameterRegistry {
    /// Registry with the built-in clinical catalog
    pub fn builtin() -> Self {
        let schemas = DiseaseType::ALL
            .into_iter()
            .map(|d| (d, Arc::new(DiseaseSchema::new(d, catalog::parameters_for(d).to_vec()))))
            .collect();
        Self { schemas }
    }

    /// Registry with exactly the given schemas
    #[cfg(test)]
    pub fn from_schemas(schemas: impl IntoIterator<Item = DiseaseSchema>) -> Self {
        Self {
            schemas: schemas
                .into_iter()
                .map(|s| (s.disease, Arc::new(s)))
                .collect(),
        }
    }

    pub fn schema(&self, disease: DiseaseType) -> Option<Arc<DiseaseSchema>> {
        self.schemas.get(&disease).cloned()
    }

    /// Schema for a disease, treating an absent or empty schema as an error
    pub fn require(&self, disease: DiseaseType) -> Result<Arc<DiseaseSchema>, UnknownDisease> {
        self.schema(disease)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| UnknownDisease(disease.to_string()))
    }

    #[cfg(test)]
    pub fn range_check(&self, disease: DiseaseType, parameter: &str, raw: &str) -> RangeCheck {
        // No schema means no known parameters
        self.schemas
            .get(&disease)
            .map_or(RangeCheck::UnknownParameter, |s| s.range_check(parameter, raw))
    }

    pub fn diseases(&self) -> Vec<DiseaseType> {
        let mut diseases: Vec<_> = self.schemas.keys().copied().collect();
        diseases.sort();
        diseases
    }
}

impl Default for ParameterRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
