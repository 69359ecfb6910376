//! Ordered maintenance steps

use super::registry::{OperationArgs, OperationContext, OperationHandler, OperationRegistry};
use crate::Result;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

/// What to do when a step fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    /// Log the failure and run the next step
    Continue,
    /// Stop the job and return the error
    #[default]
    Halt,
}

/// One named operation of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceStep {
    /// Position of the step; steps run in ascending order
    pub step: u32,
    /// Registered operation name
    pub name: String,
    #[serde(default)]
    pub args: OperationArgs,
    #[serde(default)]
    pub on_failure: FailureMode,
}

/// Result of one executed step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub step: u32,
    pub name: String,
    /// Error message if the step failed
    pub error: Option<String>,
}

/// A sequence of maintenance steps
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaintenanceJob {
    pub steps: Vec<MaintenanceStep>,
}

impl MaintenanceJob {
    pub fn new(steps: Vec<MaintenanceStep>) -> Self {
        Self { steps }
    }

    /// Run every step in order.
    ///
    /// All operation names are resolved before the first step runs, so an
    /// unknown name fails the job without side effects.
    pub async fn run(
        &self,
        registry: &OperationRegistry,
        ctx: &OperationContext,
    ) -> Result<Vec<StepOutcome>> {
        let mut steps: Vec<&MaintenanceStep> = self.steps.iter().collect();
        steps.sort_by_key(|s| s.step);
        let resolved: Vec<(&MaintenanceStep, OperationHandler)> = steps
            .into_iter()
            .map(|s| registry.resolve(&s.name).map(|handler| (s, handler)))
            .collect::<Result<_>>()?;

        let mut outcomes = Vec::with_capacity(resolved.len());
        for (step, handler) in resolved {
            info!(step = step.step, name = %step.name, "Running maintenance step");
            match handler(ctx.clone(), step.args.clone()).await {
                Ok(()) => outcomes.push(StepOutcome {
                    step: step.step,
                    name: step.name.clone(),
                    error: None,
                }),
                Err(e) if step.on_failure == FailureMode::Continue => {
                    warn!(step = step.step, name = %step.name, error = %e, "Maintenance step failed, continuing");
                    outcomes.push(StepOutcome {
                        step: step.step,
                        name: step.name.clone(),
                        error: Some(e.to_string()),
                    });
                }
                Err(e) => {
                    error!(step = step.step, name = %step.name, error = %e, "Maintenance step failed, halting job");
                    return Err(e);
                }
            }
        }
        Ok(outcomes)
    }
}
