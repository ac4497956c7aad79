//! Workflow state types

use super::transition::{transition, TransitionError};
use super::{Effect, Event};
use crate::parameters::{DiseaseSchema, DiseaseType, ParameterSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Where a workflow is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// At least one parameter is still missing
    Collecting,
    /// Every parameter collected, waiting for the user to confirm
    ReadyToConfirm,
    /// Frozen and eligible for dispatch
    Confirmed,
    /// Prediction delivered
    Dispatched,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Collecting => "collecting",
            Phase::ReadyToConfirm => "ready_to_confirm",
            Phase::Confirmed => "confirmed",
            Phase::Dispatched => "dispatched",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Confirmed | Phase::Dispatched)
    }

    /// Actions a client may offer in this phase
    pub fn actions(self) -> &'static [&'static str] {
        match self {
            Phase::Collecting => &["update", "delete", "cancel"],
            Phase::ReadyToConfirm => &["update", "delete", "confirm", "cancel"],
            Phase::Confirmed => &["predict"],
            Phase::Dispatched => &[],
        }
    }
}

/// In-progress parameter collection for one prediction
#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    schema: Arc<DiseaseSchema>,
    collected: BTreeMap<String, String>,
    phase: Phase,
}

impl Workflow {
    pub fn new(schema: Arc<DiseaseSchema>) -> Self {
        Self::with_collected(schema, BTreeMap::new(), Phase::Collecting)
    }

    /// Rebuild a workflow from persisted parameters. Names the schema does not
    /// know are dropped; the phase is re-derived unless `dispatched`.
    pub fn restore(
        schema: Arc<DiseaseSchema>,
        collected: &BTreeMap<String, String>,
        dispatched: bool,
    ) -> Self {
        let collected = collected
            .iter()
            .filter(|(name, _)| schema.get(name).is_some())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let phase = if dispatched {
            Phase::Dispatched
        } else {
            Phase::Collecting
        };
        Self::with_collected(schema, collected, phase)
    }

    pub(crate) fn with_collected(
        schema: Arc<DiseaseSchema>,
        collected: BTreeMap<String, String>,
        phase: Phase,
    ) -> Self {
        let mut workflow = Self {
            schema,
            collected,
            phase,
        };
        if !phase.is_terminal() {
            workflow.phase = workflow.derived_phase();
        }
        workflow
    }

    pub fn disease(&self) -> DiseaseType {
        self.schema.disease
    }

    pub fn schema(&self) -> &Arc<DiseaseSchema> {
        &self.schema
    }

    pub fn collected(&self) -> &BTreeMap<String, String> {
        &self.collected
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Schema parameters not yet collected, in schema order
    pub fn pending(&self) -> impl Iterator<Item = &ParameterSpec> {
        self.schema
            .parameters()
            .iter()
            .filter(|p| !self.collected.contains_key(p.name))
    }

    pub fn is_complete(&self) -> bool {
        self.pending().next().is_none()
    }

    /// Prompt for the earliest missing parameter, if any
    pub fn next_prompt(&self) -> Option<String> {
        self.pending().next().map(ParameterSpec::prompt)
    }

    pub(crate) fn derived_phase(&self) -> Phase {
        if self.is_complete() {
            Phase::ReadyToConfirm
        } else {
            Phase::Collecting
        }
    }

    /// Run an event through [`transition`] and adopt the resulting state
    pub fn apply(&mut self, event: Event) -> Result<Vec<Effect>, TransitionError> {
        let result = transition(self, event)?;
        *self = result.new_state;
        Ok(result.effects)
    }

    /// Validate and upsert one value. On rejection the state is unchanged.
    pub fn set_parameter(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), TransitionError> {
        self.apply(Event::SetParameter {
            name: name.into(),
            value: value.into(),
        })
        .map(drop)
    }

    /// Remove a collected value. Returns whether anything was removed.
    pub fn delete(&mut self, name: &str) -> Result<bool, TransitionError> {
        let had = self.collected.contains_key(name);
        self.apply(Event::DeleteParameter {
            name: name.to_string(),
        })?;
        Ok(had)
    }

    /// Freeze the collected values and return them as the dispatch payload
    pub fn confirm(&mut self) -> Result<BTreeMap<String, String>, TransitionError> {
        self.apply(Event::Confirm)?;
        Ok(self.collected.clone())
    }

    pub fn cancel(&mut self) -> Result<(), TransitionError> {
        self.apply(Event::Cancel).map(drop)
    }

    pub(crate) fn replace(&self, collected: BTreeMap<String, String>, phase: Phase) -> Self {
        Self::with_collected(self.schema.clone(), collected, phase)
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            disease_type: self.disease(),
            collected: self.collected.clone(),
            pending: self.pending().map(|p| p.name.to_string()).collect(),
            is_complete: self.is_complete(),
            next_prompt: self.next_prompt(),
            phase: self.phase,
            actions: self.phase.actions().to_vec(),
        }
    }
}

/// Client-facing view of a workflow
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowSnapshot {
    pub disease_type: DiseaseType,
    pub collected: BTreeMap<String, String>,
    pub pending: Vec<String>,
    pub is_complete: bool,
    pub next_prompt: Option<String>,
    pub phase: Phase,
    pub actions: Vec<&'static str>,
}
