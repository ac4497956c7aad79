//! Pure workflow transition function

use super::{Effect, Event, Phase, Workflow};
use crate::parameters::ParameterRejection;
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: Workflow,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: Workflow) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionError {
    #[error(transparent)]
    Rejected(#[from] ParameterRejection),
    #[error("Missing parameters: {}", .missing.join(", "))]
    Incomplete { missing: Vec<String> },
    #[error("Prediction is {} and can no longer be changed", .phase.as_str())]
    Terminal { phase: Phase },
    #[error("Prediction has not been confirmed")]
    NotConfirmed,
}

/// Pure transition function
///
/// Given the same workflow and event it always yields the same result; all
/// I/O is expressed as returned effects.
pub fn transition(state: &Workflow, event: Event) -> Result<TransitionResult, TransitionError> {
    let phase = state.phase();

    match (phase, event) {
        // Confirmed and dispatched workflows are frozen
        (
            Phase::Confirmed | Phase::Dispatched,
            Event::SetParameter { .. }
            | Event::SetParameters { .. }
            | Event::DeleteParameter { .. }
            | Event::Cancel,
        ) => Err(TransitionError::Terminal { phase }),

        // ============================================================
        // Collection
        // ============================================================
        (_, Event::SetParameter { name, value }) => {
            state.schema().validate(&name, &value)?;
            let mut collected = state.collected().clone();
            collected.insert(name.clone(), value.clone());
            let next = state.replace(collected, Phase::Collecting);
            Ok(TransitionResult::new(next.clone())
                .with_effect(Effect::persist(next.collected()))
                .with_effect(Effect::parameter_set(name, value))
                .with_effect(Effect::NotifyWorkflow))
        }

        (_, Event::SetParameters { values }) => {
            if values.is_empty() {
                return Ok(TransitionResult::new(state.clone()));
            }
            // All-or-nothing: the first rejection leaves the state untouched
            for (name, value) in &values {
                state.schema().validate(name, value)?;
            }
            let mut collected = state.collected().clone();
            collected.extend(values.iter().cloned());
            let next = state.replace(collected, Phase::Collecting);
            Ok(TransitionResult::new(next.clone())
                .with_effect(Effect::persist(next.collected()))
                .with_effects(
                    values
                        .into_iter()
                        .map(|(name, value)| Effect::parameter_set(name, value)),
                )
                .with_effect(Effect::NotifyWorkflow))
        }

        (_, Event::DeleteParameter { name }) => {
            if state.schema().get(&name).is_none() {
                return Err(ParameterRejection::UnknownParameter { name }.into());
            }
            if !state.collected().contains_key(&name) {
                return Ok(TransitionResult::new(state.clone()));
            }
            let mut collected = state.collected().clone();
            collected.remove(&name);
            let next = state.replace(collected, Phase::Collecting);
            Ok(TransitionResult::new(next.clone())
                .with_effect(Effect::persist(next.collected()))
                .with_effect(Effect::parameter_removed(name))
                .with_effect(Effect::NotifyWorkflow))
        }

        (_, Event::Cancel) => {
            let next = state.replace(Default::default(), Phase::Collecting);
            Ok(TransitionResult::new(next.clone())
                .with_effect(Effect::persist(next.collected()))
                .with_effect(Effect::NotifyWorkflow))
        }

        // ============================================================
        // Confirmation and dispatch
        // ============================================================
        (Phase::Collecting, Event::Confirm) => Err(TransitionError::Incomplete {
            missing: state.pending().map(|p| p.name.to_string()).collect(),
        }),

        // Confirmed + Confirm re-dispatches, so a failed prediction can be retried
        (Phase::ReadyToConfirm | Phase::Confirmed, Event::Confirm) => {
            let next = state.replace(state.collected().clone(), Phase::Confirmed);
            Ok(TransitionResult::new(next).with_effect(Effect::DispatchPrediction {
                disease: state.disease(),
                parameters: state.collected().clone(),
            }))
        }

        (Phase::Dispatched, Event::Confirm) => Err(TransitionError::Terminal { phase }),

        (Phase::Confirmed, Event::Dispatched { outcome }) => {
            let next = state.replace(state.collected().clone(), Phase::Dispatched);
            Ok(TransitionResult::new(next)
                .with_effect(Effect::PersistOutcome {
                    outcome: outcome.clone(),
                })
                .with_effect(Effect::NotifyCompleted { outcome })
                .with_effect(Effect::NotifyWorkflow))
        }

        (_, Event::Dispatched { .. }) => Err(TransitionError::NotConfirmed),
    }
}
