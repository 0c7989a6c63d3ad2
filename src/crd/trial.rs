//! Trial Custom Resource Definition
//!
//! A Trial evaluates one parameter assignment by running a training job.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    clear_condition, find_condition, set_condition, Condition, ConditionStatus, ObjectiveSpec,
    Observation, ParameterAssignment,
};

/// Label carrying the owning experiment's name
pub const EXPERIMENT_LABEL: &str = "hypertune.dev/experiment";

/// Label carrying the owning trial's name, set on underlying jobs
pub const TRIAL_LABEL: &str = "hypertune.dev/trial";

/// Specification for a Trial
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hypertune.dev",
    version = "v1alpha1",
    kind = "Trial",
    plural = "trials",
    shortname = "tr",
    status = "TrialStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TrialSpec {
    /// Parameter values under evaluation
    pub parameter_assignments: Vec<ParameterAssignment>,

    /// Objective copied from the owning experiment
    pub objective: ObjectiveSpec,

    /// Rendered job manifest (YAML or JSON)
    pub run_spec: String,

    /// Container that runs the training code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_container_name: Option<String>,

    /// Keep the job after the trial completes
    #[serde(default)]
    pub retain_run: bool,
}

/// Trial lifecycle phase
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum TrialPhase {
    /// Accepted, job not yet observed running
    #[default]
    Created,
    /// Job running
    Running,
    /// Job succeeded and the objective metric was observed
    Succeeded,
    /// Job failed
    Failed,
    /// Removed by the experiment before completion
    Killed,
}

impl TrialPhase {
    /// Returns true for Succeeded, Failed and Killed
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Killed)
    }
}

impl std::fmt::Display for TrialPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

/// Condition types and reasons written on Trials
pub mod reasons {
    /// Trial accepted
    pub const CREATED: &str = "TrialCreated";
    /// Job running
    pub const RUNNING: &str = "TrialRunning";
    /// Job succeeded with metrics
    pub const SUCCEEDED: &str = "TrialSucceeded";
    /// Job failed
    pub const FAILED: &str = "TrialFailed";
    /// Deleted by the experiment over parallelism
    pub const KILLED: &str = "TrialKilled";
    /// Manifest could not be turned into a job
    pub const INVALID_RUN_SPEC: &str = "InvalidRunSpec";
    /// Condition type set while a succeeded job has no objective metric yet
    pub const METRICS_UNAVAILABLE: &str = "MetricsUnavailable";
}

/// Status for a Trial
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrialStatus {
    /// Current phase of the trial lifecycle
    #[serde(default)]
    pub phase: TrialPhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the trial state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// When the trial was first reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the trial reached a terminal phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    /// Best observed metric values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observation: Option<Observation>,
}

impl TrialStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: TrialPhase) -> Self {
        Self {
            phase,
            ..Default::default()
        }
    }

    /// Set the message and return self for chaining
    pub fn message(mut self, msg: impl Into<String>) -> Self {
        self.message = Some(msg.into());
        self
    }

    /// Add a condition and return self for chaining
    pub fn condition(mut self, condition: Condition) -> Self {
        set_condition(&mut self.conditions, condition);
        self
    }

    /// Move to `phase`, recording a True condition for it
    ///
    /// Terminal phases stamp the completion time and clear Running.
    pub fn transition(&mut self, phase: TrialPhase, reason: &str, message: impl Into<String>) {
        let message = message.into();
        if phase.is_completed() {
            clear_condition(&mut self.conditions, &TrialPhase::Running.to_string());
            clear_condition(&mut self.conditions, reasons::METRICS_UNAVAILABLE);
            if self.completion_time.is_none() {
                self.completion_time = Some(Utc::now());
            }
        }
        set_condition(
            &mut self.conditions,
            Condition::new(phase.to_string(), ConditionStatus::True, reason, &message),
        );
        self.phase = phase;
        self.message = Some(message);
    }
}

impl Trial {
    /// Current phase, Created when status has not been written yet
    pub fn phase(&self) -> TrialPhase {
        self.status
            .as_ref()
            .map(|s| s.phase.clone())
            .unwrap_or_default()
    }

    /// Returns true once the trial reached a terminal phase
    pub fn is_completed(&self) -> bool {
        self.phase().is_completed()
    }

    /// Name of the owning experiment, from the experiment label
    pub fn experiment_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(EXPERIMENT_LABEL))
            .map(String::as_str)
    }

    /// Observed value of the objective metric, reduced per its strategy
    pub fn objective_value(&self) -> Option<f64> {
        let name = &self.spec.objective.objective_metric_name;
        let metric = self.status.as_ref()?.observation.as_ref()?.metric(name)?;
        Some(metric.value(self.spec.objective.strategy_for(name)))
    }

    /// Returns true while a succeeded job is still waiting for its metric
    pub fn is_metrics_unavailable(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| find_condition(&s.conditions, reasons::METRICS_UNAVAILABLE))
            .is_some_and(|c| c.status == ConditionStatus::True)
    }
}
