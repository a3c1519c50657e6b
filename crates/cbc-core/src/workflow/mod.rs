//! Durable workflow engine.
//!
//! [`definition`] describes the state machine, [`run`] the per-event
//! instance, [`db`] persists runs with their wake-up timers and [`engine`]
//! drives runs from state to state.

pub mod clock;
pub mod db;
pub mod definition;
pub mod engine;
pub mod retry;
pub mod run;

pub use clock::{Clock, ManualClock, SystemClock};
pub use db::RunDb;
pub use definition::{DefinitionParams, State, StateMachine, TaskKind};
pub use engine::{Engine, EngineSettings, Services, TickReport};
pub use retry::{CatchRule, RetryPolicy};
pub use run::{Run, RunContext, RunStatus, StepOutcome, StepRecord};
