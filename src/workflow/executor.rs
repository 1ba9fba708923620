use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info, warn};

use super::{Condition, WorkflowError};
use crate::auth::Session;
use crate::client::validation::type_name;
use crate::client::{Acknowledgment, AgentClient, InvocationResult, InvokeOptions, ParameterError};
use crate::protocol::{BranchTarget, Capability, Workflow};
use crate::{Error, Result};

/// Supplies a fresh acknowledgment for each confirmation-gated step.
#[async_trait]
pub trait ConfirmationProvider: Send + Sync {
    /// Present the capability's confirmation message to a human. `None` declines.
    async fn confirm(&self, capability: &Capability) -> Option<Acknowledgment>;
}

/// Declines every confirmation, so gated steps fail with `ConfirmationRequiredError`.
pub struct DeclineAll;

#[async_trait]
impl ConfirmationProvider for DeclineAll {
    async fn confirm(&self, _capability: &Capability) -> Option<Acknowledgment> {
        None
    }
}

/// Run state. `Completed`, `Aborted` and `Failed` are final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Ready,
    Running { step: String },
    Completed,
    /// A branch routed to `$abort`.
    Aborted { at: String },
    Failed { at: String },
}

impl RunState {
    pub fn is_final(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Aborted { .. } | RunState::Failed { .. })
    }
}

/// Branch decision taken after a step.
#[derive(Debug, Clone, PartialEq)]
pub struct BranchTaken {
    pub condition: String,
    pub matched: bool,
    /// `None` continues with the next declared step.
    pub target: Option<BranchTarget>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub step: String,
    pub result: InvocationResult,
    pub branch: Option<BranchTaken>,
}

/// Everything a run produced. On failure the outcomes of earlier steps are kept.
#[derive(Debug)]
pub struct WorkflowRun {
    pub workflow_id: String,
    pub state: RunState,
    pub steps: Vec<StepOutcome>,
    pub error: Option<Error>,
}

impl WorkflowRun {
    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }

    pub fn outcome(&self, step: &str) -> Option<&StepOutcome> {
        self.steps.iter().find(|s| s.step == step)
    }

    /// Turn a failed run into its error; other runs pass through.
    pub fn into_result(mut self) -> Result<WorkflowRun> {
        if matches!(self.state, RunState::Failed { .. }) {
            if let Some(e) = self.error.take() {
                return Err(e);
            }
        }
        Ok(self)
    }
}

/// Sequential executor over one [`AgentClient`].
///
/// Workflows are advisory: nothing here stops a caller from invoking any step directly.
pub struct WorkflowExecutor<'a> {
    client: &'a AgentClient,
    confirmations: &'a dyn ConfirmationProvider,
    step_arguments: HashMap<String, Value>,
}

static DECLINE_ALL: DeclineAll = DeclineAll;

impl<'a> WorkflowExecutor<'a> {
    pub fn new(client: &'a AgentClient) -> Self {
        Self {
            client,
            confirmations: &DECLINE_ALL,
            step_arguments: HashMap::new(),
        }
    }

    pub fn with_confirmations(mut self, provider: &'a dyn ConfirmationProvider) -> Self {
        self.confirmations = provider;
        self
    }

    /// Extra arguments for one step, applied last.
    pub fn with_step_arguments(mut self, step: impl Into<String>, arguments: Value) -> Self {
        self.step_arguments.insert(step.into(), arguments);
        self
    }

    /// Execute `workflow_id` from its first step.
    pub async fn execute(&self, workflow_id: &str, initial: Value, session: &Session) -> Result<WorkflowRun> {
        let manifest = self.client.manifest();
        let workflow = manifest
            .workflow(workflow_id)
            .ok_or_else(|| WorkflowError::UnknownWorkflow {
                workflow: workflow_id.to_string(),
            })?;
        let initial = match initial {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(ParameterError::NotAnObject {
                    capability: workflow.id.clone(),
                    found: type_name(&other).to_string(),
                }
                .into())
            }
        };
        if let Some((step, extra)) = self.step_arguments.iter().find(|(_, v)| !v.is_object()) {
            return Err(ParameterError::NotAnObject {
                capability: step.clone(),
                found: type_name(extra).to_string(),
            }
            .into());
        }

        let mut run = WorkflowRun {
            workflow_id: workflow.id.clone(),
            state: RunState::Ready,
            steps: Vec::new(),
            error: None,
        };
        let mut carried = Map::new();
        let mut visited = HashSet::new();
        let mut index = 0usize;

        info!(workflow = %workflow.id, steps = workflow.steps.len(), "workflow started");
        while let Some(step) = workflow.steps.get(index) {
            if !visited.insert(step.clone()) {
                warn!(workflow = %workflow.id, step = %step, "step revisited; aborting run");
                return Ok(fail(run, step, WorkflowError::CycleDetected {
                    workflow: workflow.id.clone(),
                    step: step.clone(),
                }));
            }
            run.state = RunState::Running { step: step.clone() };
            debug!(workflow = %workflow.id, step = %step, "step running");

            let Some(cap) = manifest.capability(step) else {
                return Ok(fail(run, step, WorkflowError::UnknownStep {
                    workflow: workflow.id.clone(),
                    step: step.clone(),
                }));
            };

            let arguments = step_arguments(cap, &initial, &carried, self.step_arguments.get(step));
            let mut options = InvokeOptions::default();
            if cap.requires_confirmation() {
                if let Some(ack) = self.confirmations.confirm(cap).await {
                    options = options.acknowledge(ack);
                }
            }

            let result = match self.client.invoke(step, arguments, session, options).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(workflow = %workflow.id, step = %step, error = %e, "workflow step failed");
                    return Ok(fail(run, step, e));
                }
            };
            if let Value::Object(fields) = &result.body {
                for (k, v) in fields {
                    carried.insert(k.clone(), v.clone());
                }
            }

            let branch = match decide(workflow, step, &result.body) {
                Ok(b) => b,
                Err(e) => {
                    run.steps.push(StepOutcome {
                        step: step.clone(),
                        result,
                        branch: None,
                    });
                    return Ok(fail(run, step, e));
                }
            };
            let target = branch.as_ref().and_then(|b| b.target.clone());
            run.steps.push(StepOutcome {
                step: step.clone(),
                result,
                branch,
            });

            index = match target {
                None => index + 1,
                Some(BranchTarget::Complete) => break,
                Some(BranchTarget::Abort) => {
                    info!(workflow = %workflow.id, step = %step, "workflow aborted by branch");
                    run.state = RunState::Aborted { at: step.clone() };
                    return Ok(run);
                }
                Some(BranchTarget::Step(next)) => match workflow.position(&next) {
                    Some(i) => i,
                    None => {
                        return Ok(fail(run, step, WorkflowError::UnknownStep {
                            workflow: workflow.id.clone(),
                            step: next,
                        }))
                    }
                },
            };
        }

        run.state = RunState::Completed;
        info!(workflow = %workflow.id, steps = run.steps.len(), "workflow completed");
        Ok(run)
    }
}

fn fail(mut run: WorkflowRun, step: &str, error: impl Into<Error>) -> WorkflowRun {
    run.state = RunState::Failed { at: step.to_string() };
    run.error = Some(error.into());
    run
}

/// Evaluate the step's conditional, if any, against its response.
fn decide(workflow: &Workflow, step: &str, response: &Value) -> std::result::Result<Option<BranchTaken>, WorkflowError> {
    let Some(cond) = workflow.conditional.get(step) else {
        return Ok(None);
    };
    let parsed = Condition::parse(&cond.condition).map_err(|e| WorkflowError::InvalidCondition {
        workflow: workflow.id.clone(),
        step: step.to_string(),
        reason: e.to_string(),
    })?;
    let matched = parsed.evaluate(response);
    let target = if matched { cond.on_true.clone() } else { cond.on_false.clone() };
    debug!(workflow = %workflow.id, step, condition = %cond.condition, matched, "branch evaluated");
    Ok(Some(BranchTaken {
        condition: cond.condition.clone(),
        matched,
        target,
    }))
}

/// Initial arguments and carried response fields (declared parameters only), then per-step
/// arguments on top.
fn step_arguments(
    cap: &Capability,
    initial: &Map<String, Value>,
    carried: &Map<String, Value>,
    per_step: Option<&Value>,
) -> Value {
    let mut args = Map::new();
    for source in [initial, carried] {
        for (k, v) in source {
            if cap.parameter(k).is_some() {
                args.insert(k.clone(), v.clone());
            }
        }
    }
    if let Some(Value::Object(extra)) = per_step {
        for (k, v) in extra {
            args.insert(k.clone(), v.clone());
        }
    }
    Value::Object(args)
}
