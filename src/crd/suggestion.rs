//! Suggestion Custom Resource Definition
//!
//! A Suggestion is the running search algorithm for one Experiment. The
//! Experiment controller owns `spec.requests`; the Suggestion controller owns
//! `status.suggestions`. Neither writes the other's field.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    clear_condition, set_condition, AlgorithmSetting, AlgorithmSpec, Condition, ConditionStatus,
    ResumePolicy, TrialAssignment,
};

/// Specification for a Suggestion
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "hypertune.dev",
    version = "v1alpha1",
    kind = "Suggestion",
    plural = "suggestions",
    shortname = "sugg",
    status = "SuggestionStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Requests","type":"integer","jsonPath":".spec.requests"}"#,
    printcolumn = r#"{"name":"Assigned","type":"integer","jsonPath":".status.suggestionCount"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionSpec {
    /// Algorithm served for this experiment
    pub algorithm: AlgorithmSpec,

    /// Cumulative number of assignments requested; never decreases
    pub requests: u32,

    /// Copied from the owning experiment
    #[serde(default)]
    pub resume_policy: ResumePolicy,

    /// Set once the owning experiment completes
    #[serde(default)]
    pub experiment_completed: bool,
}

/// Suggestion lifecycle phase
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SuggestionPhase {
    /// Accepted, algorithm endpoint not yet available
    #[default]
    Created,
    /// Algorithm endpoint serving
    Running,
    /// Experiment completed and endpoint torn down
    Succeeded,
    /// Algorithm rejected the experiment or is not configured
    Failed,
}

impl SuggestionPhase {
    /// Returns true for Succeeded and Failed
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for SuggestionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Condition types and reasons written on Suggestions
pub mod reasons {
    /// Suggestion accepted
    pub const CREATED: &str = "SuggestionCreated";
    /// Condition type tracking the algorithm deployment
    pub const DEPLOYMENT_READY: &str = "DeploymentReady";
    /// Deployment has available replicas
    pub const DEPLOYMENT_AVAILABLE: &str = "DeploymentAvailable";
    /// Deployment has no available replicas yet
    pub const DEPLOYMENT_NOT_AVAILABLE: &str = "DeploymentNotAvailable";
    /// Algorithm endpoint serving
    pub const RUNNING: &str = "SuggestionRunning";
    /// Condition type set when the search space is exhausted
    pub const EXHAUSTED: &str = "Exhausted";
    /// Algorithm reported the end of the search
    pub const SEARCH_END: &str = "SearchEnd";
    /// Experiment finished and resources removed
    pub const SUCCEEDED: &str = "SuggestionSucceeded";
    /// No configuration for the requested algorithm
    pub const UNKNOWN_ALGORITHM: &str = "UnknownAlgorithm";
    /// Algorithm rejected the experiment's settings
    pub const ALGORITHM_REJECTED: &str = "AlgorithmSettingsRejected";
}

/// Status for a Suggestion
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionStatus {
    /// Current phase of the suggestion lifecycle
    #[serde(default)]
    pub phase: SuggestionPhase,

    /// Human-readable message about current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Conditions representing the suggestion state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// When the suggestion was first reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    /// When the suggestion reached a terminal phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    /// Append-only list of assignments; index `i` is the i-th admitted trial
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<TrialAssignment>,

    /// Number of assignments produced
    #[serde(default)]
    pub suggestion_count: u32,

    /// Settings reported back by the algorithm
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub algorithm_settings: Vec<AlgorithmSetting>,

    /// Algorithm reported it has nothing left to propose
    #[serde(default)]
    pub search_exhausted: bool,
}

impl SuggestionStatus {
    /// Create a new status with the given phase
    pub fn with_phase(phase: SuggestionPhase) -> Self {
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
    pub fn transition(
        &mut self,
        phase: SuggestionPhase,
        reason: &str,
        message: impl Into<String>,
    ) {
        let message = message.into();
        if phase.is_completed() {
            clear_condition(&mut self.conditions, &SuggestionPhase::Running.to_string());
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

    /// Append assignments, keeping existing positions untouched
    pub fn append(&mut self, assignments: impl IntoIterator<Item = TrialAssignment>) {
        self.suggestions.extend(assignments);
        self.suggestion_count = self.suggestions.len() as u32;
    }

    /// Merge settings reported by the algorithm, overwriting by name
    pub fn merge_algorithm_settings(&mut self, settings: Vec<AlgorithmSetting>) {
        for setting in settings {
            match self
                .algorithm_settings
                .iter_mut()
                .find(|s| s.name == setting.name)
            {
                Some(existing) => existing.value = setting.value,
                None => self.algorithm_settings.push(setting),
            }
        }
    }
}

impl Suggestion {
    /// Current phase, Created when status has not been written yet
    pub fn phase(&self) -> SuggestionPhase {
        self.status
            .as_ref()
            .map(|s| s.phase.clone())
            .unwrap_or_default()
    }

    /// Assignments produced so far
    pub fn assignments(&self) -> &[TrialAssignment] {
        self.status
            .as_ref()
            .map(|s| s.suggestions.as_slice())
            .unwrap_or_default()
    }

    /// Returns true when the algorithm reported exhaustion
    pub fn is_exhausted(&self) -> bool {
        self.status.as_ref().is_some_and(|s| s.search_exhausted)
    }

    /// Returns true when the suggestion reports failure
    pub fn is_failed(&self) -> bool {
        self.phase() == SuggestionPhase::Failed
    }

    /// Name shared by the algorithm Deployment and Service
    pub fn endpoint_name(&self) -> String {
        format!(
            "{}-{}",
            kube::ResourceExt::name_any(self),
            self.spec.algorithm.algorithm_name
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::types::ParameterAssignment;

    fn assignment(name: &str) -> TrialAssignment {
        TrialAssignment {
            name: name.to_string(),
            parameter_assignments: vec![ParameterAssignment::new("lr", "0.1")],
        }
    }

    #[test]
    fn test_append_preserves_positions() {
        let mut status = SuggestionStatus::default();
        status.append(vec![assignment("a"), assignment("b")]);
        let before = status.suggestions.clone();

        status.append(vec![assignment("c")]);
        assert_eq!(status.suggestion_count, 3);
        assert_eq!(&status.suggestions[..2], &before[..]);
        assert_eq!(status.suggestions[2].name, "c");
    }

    #[test]
    fn test_merge_algorithm_settings() {
        let mut status = SuggestionStatus::default();
        status.merge_algorithm_settings(vec![AlgorithmSetting {
            name: "seed".to_string(),
            value: "1".to_string(),
        }]);
        status.merge_algorithm_settings(vec![
            AlgorithmSetting {
                name: "seed".to_string(),
                value: "2".to_string(),
            },
            AlgorithmSetting {
                name: "n_startup".to_string(),
                value: "5".to_string(),
            },
        ]);
        assert_eq!(status.algorithm_settings.len(), 2);
        assert_eq!(status.algorithm_settings[0].value, "2");
    }

    #[test]
    fn test_requests_wire_name() {
        let spec = SuggestionSpec {
            algorithm: AlgorithmSpec {
                algorithm_name: "random".to_string(),
                algorithm_settings: vec![],
            },
            requests: 4,
            resume_policy: ResumePolicy::LongRunning,
            experiment_completed: false,
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["requests"], 4);
        assert_eq!(json["resumePolicy"], "LongRunning");
        assert_eq!(json["experimentCompleted"], false);
    }

    #[test]
    fn test_endpoint_name() {
        let s = Suggestion::new(
            "exp",
            SuggestionSpec {
                algorithm: AlgorithmSpec {
                    algorithm_name: "tpe".to_string(),
                    algorithm_settings: vec![],
                },
                requests: 0,
                resume_policy: ResumePolicy::Never,
                experiment_completed: false,
            },
        );
        assert_eq!(s.endpoint_name(), "exp-tpe");
        assert!(s.assignments().is_empty());
        assert!(!s.is_exhausted());
    }
}
