//! # Workflows
//!
//! A workflow is an ordered list of capability ids with optional conditional branches. The
//! executor runs steps in declared order; after a step with a `conditional` entry it evaluates
//! the [`Condition`] against that step's response and jumps to `onTrue` / `onFalse`
//! (a step id, `$abort` or `$complete`).
//!
//! `Ready → Running(step) → Completed | Aborted | Failed`
//!
//! A step is never run twice in one run. There is no implicit rollback.

pub mod condition;
mod executor;

pub use condition::{CmpOp, Condition, ConditionError, Operand};
pub use executor::{
    BranchTaken, ConfirmationProvider, DeclineAll, RunState, StepOutcome, WorkflowExecutor,
    WorkflowRun,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkflowError {
    #[error("manifest declares no workflow '{workflow}'")]
    UnknownWorkflow { workflow: String },

    #[error("workflow '{workflow}' routes to unknown step '{step}'")]
    UnknownStep { workflow: String, step: String },

    #[error("workflow '{workflow}' revisited step '{step}'")]
    CycleDetected { workflow: String, step: String },

    #[error("workflow '{workflow}' has an invalid condition on '{step}': {reason}")]
    InvalidCondition {
        workflow: String,
        step: String,
        reason: String,
    },
}
