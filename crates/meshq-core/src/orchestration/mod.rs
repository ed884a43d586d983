pub mod cancellation;
pub mod control;
pub mod envelope;
pub mod runner;
pub mod substitution;

pub use cancellation::AbortGate;
pub use control::QueueControl;
pub use envelope::{ENGINE_NOT_ALIVE, EnvelopeConfig, ExecutionEnvelope, ExecutionOutcome};
pub use runner::{QueueRunner, RecoveryOutcome, RunnerConfig};
pub use substitution::{substitute, substitute_str};

use crate::models::CoreError;

pub type OrchestrationResult<T> = Result<T, CoreError>;
