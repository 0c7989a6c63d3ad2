//! Experiment Custom Resource Definition
//!
//! An Experiment is one search run: a search space, an objective, an
//! algorithm and a trial budget. The Experiment controller drives admission
//! of Trials and records the best observed result in status.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    clear_condition, set_condition, AlgorithmSpec, Condition, ConditionStatus, ObjectiveSpec,
    Observation, ParameterAssignment, ParameterSpec, ResumePolicy,
};

/// Default number of concurrently active trials
pub const DEFAULT_PARALLEL_TRIAL_COUNT: u32 = 3;

fn default_parallel_trial_count() -> u32 {
    DEFAULT_PARALLEL_TRIAL_COUNT
}

/// Template used to build each Trial's job manifest
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrialTemplate {
    /// Placeholders exposed to the manifest as `${trialParameters.<name>}`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trial_parameters: Vec<TrialParameterSpec>,

    /// Container that runs the training code, when the job kind cannot infer it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_container_name: Option<String>,

    /// Keep the underlying job after the Trial completes
    #[serde(default)]
    pub retain: bool,

    /// Job manifest (YAML or JSON) with placeholders
    pub trial_spec: String,
}

/// Binding between a template placeholder and a search parameter
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct TrialParameterSpec {
    /// Placeholder name
    pub name: String,
    /// Free-form description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Name of the search parameter supplying the value
    pub reference: String,
}

/// Specification for an Experiment
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hypertune.dev",
    version = "v1alpha1",
    kind = "Experiment",
    plural = "experiments",
    shortname = "exp",
    status = "ExperimentStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Best","type":"string","jsonPath":".status.currentOptimalTrial.bestTrialName"}"#,
    printcolumn = r#"{"name":"Running","type":"integer","jsonPath":".status.trialsRunning"}"#,
    printcolumn = r#"{"name":"Succeeded","type":"integer","jsonPath":".status.trialsSucceeded"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSpec {
    /// Search space
    pub parameters: Vec<ParameterSpec>,

    /// Metric and direction being optimized
    pub objective: ObjectiveSpec,

    /// Search algorithm
    pub algorithm: AlgorithmSpec,

    /// Template rendered into each Trial's job
    pub trial_template: TrialTemplate,

    /// Maximum number of concurrently active trials
    #[serde(default = "default_parallel_trial_count")]
    pub parallel_trial_count: u32,

    /// Total trial budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_trial_count: Option<u32>,

    /// Number of failed trials that fails the experiment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_failed_trial_count: Option<u32>,

    /// What happens to the algorithm endpoint on completion
    #[serde(default)]
    pub resume_policy: ResumePolicy,
}

impl ExperimentSpec {
    /// Validate the experiment specification
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.parameters.is_empty() {
            return Err(crate::Error::validation(
                "experiment must declare at least one parameter",
            ));
        }

        let mut names = HashSet::new();
        for param in &self.parameters {
            param.validate()?;
            if !names.insert(param.name.as_str()) {
                return Err(crate::Error::validation(format!(
                    "parameter '{}' is declared more than once",
                    param.name
                )));
            }
        }

        if self.objective.objective_metric_name.is_empty() {
            return Err(crate::Error::validation(
                "objective.objectiveMetricName must not be empty",
            ));
        }
        if self.algorithm.algorithm_name.is_empty() {
            return Err(crate::Error::validation(
                "algorithm.algorithmName must not be empty",
            ));
        }
        if self.parallel_trial_count == 0 {
            return Err(crate::Error::validation(
                "parallelTrialCount must be at least 1",
            ));
        }
        if self.trial_template.trial_spec.trim().is_empty() {
            return Err(crate::Error::validation(
                "trialTemplate.trialSpec must not be empty",
            ));
        }
        for tp in &self.trial_template.trial_parameters {
            if !names.contains(tp.reference.as_str()) {
                return Err(crate::Error::validation(format!(
                    "trial parameter '{}' references unknown parameter '{}'",
                    tp.name, tp.reference
                )));
            }
        }
        Ok(())
    }
}

/// Experiment lifecycle phase
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ExperimentPhase {
    /// Accepted, trials not yet admitted
    #[default]
    Created,
    /// Admitting and observing trials
    Running,
    /// Completed experiment resumed after its budget was raised
    Restarting,
    /// Goal, budget or search space exhausted
    Succeeded,
    /// Failure budget exceeded or unrecoverable error
    Failed,
}

impl ExperimentPhase {
    /// Returns true for Succeeded and Failed
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for ExperimentPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::Restarting => write!(f, "Restarting"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Condition reasons written by the Experiment controller
pub mod reasons {
    /// Experiment accepted
    pub const CREATED: &str = "ExperimentCreated";
    /// Trials are being admitted
    pub const RUNNING: &str = "ExperimentRunning";
    /// Budget raised on a long-running experiment
    pub const RESTARTING: &str = "ExperimentRestarting";
    /// Objective goal reached
    pub const GOAL_REACHED: &str = "GoalReached";
    /// Trial budget consumed
    pub const MAX_TRIALS_REACHED: &str = "MaxTrialsReached";
    /// Algorithm has nothing left to propose
    pub const SUGGESTION_EXHAUSTED: &str = "SuggestionExhausted";
    /// Failure budget consumed
    pub const MAX_FAILED_TRIALS_REACHED: &str = "MaxFailedTrialsReached";
    /// Suggestion reported failure
    pub const SUGGESTION_FAILED: &str = "SuggestionFailed";
    /// Spec rejected by validation
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
}

/// Best trial observed so far
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OptimalTrial {
    /// Name of the best trial
    pub best_trial_name: String,
    /// Its parameter values
    pub parameter_assignments: Vec<ParameterAssignment>,
    /// Its observed metrics
    pub observation: Observation,
}

/// Status for an Experiment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentStatus {
    /// Current phase of the experiment lifecycle
    #[serde(default)]
    pub phase: ExperimentPhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the experiment state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// When the experiment was first reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the experiment reached Succeeded or Failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    /// Best trial so far
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_optimal_trial: Option<OptimalTrial>,

    /// Total number of listed trials
    #[serde(default)]
    pub trials: u32,
    /// Trials created but not yet running
    #[serde(default)]
    pub trials_pending: u32,
    /// Trials running
    #[serde(default)]
    pub trials_running: u32,
    /// Trials succeeded with an objective observation
    #[serde(default)]
    pub trials_succeeded: u32,
    /// Trials failed
    #[serde(default)]
    pub trials_failed: u32,
    /// Trials killed before completion
    #[serde(default)]
    pub trials_killed: u32,

    /// Names of pending trials
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_trial_list: Vec<String>,
    /// Names of running trials
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub running_trial_list: Vec<String>,
    /// Names of succeeded trials
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub succeeded_trial_list: Vec<String>,
    /// Names of failed trials
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed_trial_list: Vec<String>,
    /// Names of killed trials
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub killed_trial_list: Vec<String>,

    /// Leading Suggestion assignments already turned into trials or skipped
    ///
    /// Never decreases; a killed trial is only deleted once this covers it.
    #[serde(default)]
    pub assignments_consumed: u32,
}

impl ExperimentStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: ExperimentPhase) -> Self {
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

    /// Trials pending or running
    pub fn active_count(&self) -> u32 {
        self.trials_pending + self.trials_running
    }

    /// Trials succeeded, failed or killed
    pub fn completed_count(&self) -> u32 {
        self.trials_succeeded + self.trials_failed + self.trials_killed
    }

    /// Reason of the current phase's condition
    pub fn phase_reason(&self) -> Option<&str> {
        super::types::find_condition(&self.conditions, &self.phase.to_string())
            .map(|c| c.reason.as_str())
    }

    /// Move to `phase`, recording a True condition for it
    ///
    /// Every other lifecycle condition that is True flips to False.
    pub fn transition(
        &mut self,
        phase: ExperimentPhase,
        reason: &str,
        message: impl Into<String>,
    ) {
        let message = message.into();
        for previous in [
            ExperimentPhase::Running,
            ExperimentPhase::Restarting,
            ExperimentPhase::Succeeded,
            ExperimentPhase::Failed,
        ] {
            if previous != phase {
                clear_condition(&mut self.conditions, &previous.to_string());
            }
        }
        if phase.is_completed() {
            if self.completion_time.is_none() {
                self.completion_time = Some(Utc::now());
            }
        } else {
            self.completion_time = None;
        }
        set_condition(
            &mut self.conditions,
            Condition::new(phase.to_string(), ConditionStatus::True, reason, &message),
        );
        self.phase = phase;
        self.message = Some(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::{FeasibleSpace, ObjectiveType, ParameterType};

    fn sample_spec() -> ExperimentSpec {
        ExperimentSpec {
            parameters: vec![ParameterSpec {
                name: "lr".to_string(),
                parameter_type: ParameterType::Double,
                feasible_space: FeasibleSpace {
                    min: Some("0.01".to_string()),
                    max: Some("0.1".to_string()),
                    ..Default::default()
                },
            }],
            objective: ObjectiveSpec {
                type_: ObjectiveType::Maximize,
                goal: Some(0.9),
                objective_metric_name: "accuracy".to_string(),
                ..Default::default()
            },
            algorithm: AlgorithmSpec {
                algorithm_name: "random".to_string(),
                algorithm_settings: vec![],
            },
            trial_template: TrialTemplate {
                trial_parameters: vec![TrialParameterSpec {
                    name: "learningRate".to_string(),
                    description: None,
                    reference: "lr".to_string(),
                }],
                primary_container_name: None,
                retain: false,
                trial_spec: "kind: Job".to_string(),
            },
            parallel_trial_count: 2,
            max_trial_count: Some(10),
            max_failed_trial_count: Some(3),
            resume_policy: ResumePolicy::Never,
        }
    }

    #[test]
    fn test_valid_spec() {
        assert!(sample_spec().validate().is_ok());
    }

    #[test]
    fn test_duplicate_parameter_rejected() {
        let mut spec = sample_spec();
        spec.parameters.push(spec.parameters[0].clone());
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_unknown_reference_rejected() {
        let mut spec = sample_spec();
        spec.trial_template.trial_parameters[0].reference = "momentum".to_string();
        let err = spec.validate().unwrap_err();
        assert!(err.to_string().contains("momentum"));
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let mut spec = sample_spec();
        spec.parallel_trial_count = 0;
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_parallel_trial_count_defaults() {
        let json = serde_json::json!({
            "parameters": [],
            "objective": {"type": "minimize", "objectiveMetricName": "loss"},
            "algorithm": {"algorithmName": "random"},
            "trialTemplate": {"trialSpec": "kind: Job"}
        });
        let spec: ExperimentSpec = serde_json::from_value(json).unwrap();
        assert_eq!(spec.parallel_trial_count, DEFAULT_PARALLEL_TRIAL_COUNT);
        assert_eq!(spec.resume_policy, ResumePolicy::Never);
        assert!(spec.max_trial_count.is_none());
    }

    #[test]
    fn test_transition_to_terminal_stamps_completion() {
        let mut status = ExperimentStatus::with_phase(ExperimentPhase::Running);
        status.transition(ExperimentPhase::Running, reasons::RUNNING, "running");
        assert!(status.completion_time.is_none());

        status.transition(
            ExperimentPhase::Succeeded,
            reasons::GOAL_REACHED,
            "goal reached",
        );
        assert!(status.completion_time.is_some());
        assert_eq!(status.phase_reason(), Some(reasons::GOAL_REACHED));

        let running = crate::crd::types::find_condition(&status.conditions, "Running").unwrap();
        assert_eq!(running.status, ConditionStatus::False);
    }

    #[test]
    fn test_repeated_transition_is_stable() {
        let mut status = ExperimentStatus::default();
        status.transition(ExperimentPhase::Running, reasons::RUNNING, "running");
        let snapshot = status.clone();
        status.transition(ExperimentPhase::Running, reasons::RUNNING, "running");
        assert_eq!(status, snapshot);
    }

    #[test]
    fn test_crd_metadata() {
        use kube::CustomResourceExt;
        let crd = Experiment::crd();
        assert_eq!(crd.spec.group, "hypertune.dev");
        assert_eq!(crd.spec.names.kind, "Experiment");
        assert_eq!(crd.spec.scope, "Namespaced");
    }
}
