//! Builder runner and LLM orchestration for patchsmith.

pub mod builder;
pub mod error;
pub mod events;
pub mod interpreter;
pub mod llm;
pub mod patch;

pub use builder::history::{LaneHistory, LaneTurn};
pub use builder::ladder::{AttemptStep, LadderState, RetryLadder};
pub use builder::{BuilderRunner, RunOutcome, RunRequest, RunResult, RunnerOptions};
pub use error::{AttemptRecord, BuilderError, FailureClass};
pub use events::{RecordingPhaseLogger, TracingPhaseLogger};
pub use interpreter::Interpreter;

pub mod config {
    pub use patchsmith_adapters::config::*;
}
