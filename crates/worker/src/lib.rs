//! Job runtime for coaching analyses.
//!
//! [`RunOrchestrator`] turns one run request or baseline pack into a run
//! record, [`JobRunner`] adds task-level retries, and [`QueuePoller`] feeds
//! claimed work to a fixed pool of workers.

pub mod best_effort;
pub mod bootstrap;
pub mod orchestrator;
pub mod poller;
pub mod prompts;
pub mod runner;

pub use orchestrator::{OrchestratorError, RunOrchestrator, RunOutcome, RAW_OUTPUT_LIMIT};
pub use poller::{spawn_workers, QueuePoller};
pub use prompts::{PromptError, PromptSet};
pub use runner::{Job, JobRunner};
