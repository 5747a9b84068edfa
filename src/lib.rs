pub mod agent;
pub mod annotate;
pub mod artifacts;
pub mod browser;
pub mod decide;
pub mod detect;
pub mod error;
pub mod executor;
pub mod history;
pub mod judge;
pub mod oracle;
pub mod perception;
pub mod prune;
pub mod script;
pub mod surface;

#[cfg(test)]
mod testing;

pub use agent::{AbortReason, Agent, AgentConfig, GoalReport, Outcome, StepLog};
pub use browser::{Browser, BrowserConfig};
pub use error::AgentError;
pub use history::{Action, Decision, ExecutionOutcome, History};
pub use judge::JudgeVerdict;
pub use perception::{Snapshot, Strategy};
pub use surface::{Key, Surface};
