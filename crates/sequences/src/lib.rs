//! Outreach sequence engine: multi-step contact engagement with business-day
//! scheduling, exit rules, A/B variants and an append-only execution ledger.
//!
//! Control flow: [`EnrollmentManager::enroll`] asks the [`Scheduler`] for the
//! first fire time, the deferred queue invokes [`StepExecutor::execute`] at
//! that time, the executor re-checks exit rules, dispatches to the step's
//! handler, records the outcome in the ledger and schedules the next step.

pub mod analytics;
pub mod clock;
pub mod engine;
pub mod enrollment;
pub mod error;
pub mod executions;
pub mod executor;
pub mod exit;
pub mod handlers;
pub mod ledger;
pub mod queue;
pub mod repo;
pub mod scheduler;
pub mod state_machine;
pub mod store;
pub mod templates;
pub mod types;
pub mod worker;

pub use engine::{Collaborators, SequenceEngine, SequenceEngineBuilder};
pub use enrollment::EnrollmentManager;
pub use error::{SequenceError, SequenceResult};
pub use executor::{ExecutionOutcome, StepExecutor};
pub use exit::ExitEvaluator;
pub use ledger::ExecutionLedger;
pub use scheduler::Scheduler;
pub use worker::SequenceWorker;
