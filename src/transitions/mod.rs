//! Status transitions: the data-driven rule table and the engine that
//! enforces it.

pub mod engine;
pub mod rules;

pub use engine::{DEFAULT_REJECT_THRESHOLD, TransitionEngine};
pub use rules::{AllowedRole, RuleStore, TransitionRule};
