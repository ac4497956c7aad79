//! Parameter collection workflow
//!
//! Elm-style pure transitions: `transition(state, event)` returns the next
//! workflow state plus the effects the session runtime must carry out.

mod effect;
pub mod event;
pub mod state;
pub(crate) mod transition;


pub use effect::Effect;
pub use event::Event;
pub use state::{Phase, Workflow, WorkflowSnapshot};
pub use transition::{transition, TransitionError};
