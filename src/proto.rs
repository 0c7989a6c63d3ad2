//! gRPC messages for the algorithm and observation services
//!
//! Messages are declared with `prost` derives rather than generated from
//! `.proto` files. Both services live in the `hypertune.v1alpha1` package:
//!
//! - `Suggestion` - served by each algorithm endpoint
//!   (`GetSuggestions`, `ValidateAlgorithmSettings`)
//! - `DBManager` - the shared observation store (`GetObservationLog`)

use kube::ResourceExt;

use crate::crd::{self, Experiment, Trial};

/// Full method path for `Suggestion.GetSuggestions`
pub const GET_SUGGESTIONS_PATH: &str = "/hypertune.v1alpha1.Suggestion/GetSuggestions";
/// Full method path for `Suggestion.ValidateAlgorithmSettings`
pub const VALIDATE_ALGORITHM_SETTINGS_PATH: &str =
    "/hypertune.v1alpha1.Suggestion/ValidateAlgorithmSettings";
/// Full method path for `DBManager.GetObservationLog`
pub const GET_OBSERVATION_LOG_PATH: &str = "/hypertune.v1alpha1.DBManager/GetObservationLog";

/// One parameter value
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParameterAssignment {
    /// Parameter name
    #[prost(string, tag = "1")]
    pub name: String,
    /// Value formatted as a string
    #[prost(string, tag = "2")]
    pub value: String,
}

/// One suggested trial; `name` may be empty
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrialAssignment {
    /// Trial name chosen by the algorithm, if any
    #[prost(string, tag = "1")]
    pub name: String,
    /// Parameter values
    #[prost(message, repeated, tag = "2")]
    pub assignments: Vec<ParameterAssignment>,
}

/// Feasible space of one parameter
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FeasibleSpace {
    /// Lower bound
    #[prost(string, tag = "1")]
    pub min: String,
    /// Upper bound
    #[prost(string, tag = "2")]
    pub max: String,
    /// Allowed values
    #[prost(string, repeated, tag = "3")]
    pub list: Vec<String>,
    /// Step
    #[prost(string, tag = "4")]
    pub step: String,
}

/// One search dimension
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ParameterSpec {
    /// Parameter name
    #[prost(string, tag = "1")]
    pub name: String,
    /// `double`, `int`, `discrete` or `categorical`
    #[prost(string, tag = "2")]
    pub parameter_type: String,
    /// Range or list
    #[prost(message, optional, tag = "3")]
    pub feasible_space: Option<FeasibleSpace>,
}

/// Objective definition
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ObjectiveSpec {
    /// `minimize` or `maximize`
    #[prost(string, tag = "1")]
    pub r#type: String,
    /// Goal, if set
    #[prost(double, optional, tag = "2")]
    pub goal: Option<f64>,
    /// Metric being optimized
    #[prost(string, tag = "3")]
    pub objective_metric_name: String,
    /// Extra collected metrics
    #[prost(string, repeated, tag = "4")]
    pub additional_metric_names: Vec<String>,
}

/// Algorithm tuning knob
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AlgorithmSetting {
    /// Setting name
    #[prost(string, tag = "1")]
    pub name: String,
    /// Setting value
    #[prost(string, tag = "2")]
    pub value: String,
}

/// Algorithm selection
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct AlgorithmSpec {
    /// Algorithm name
    #[prost(string, tag = "1")]
    pub algorithm_name: String,
    /// Settings
    #[prost(message, repeated, tag = "2")]
    pub algorithm_settings: Vec<AlgorithmSetting>,
}

/// Experiment as seen by an algorithm
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExperimentSpec {
    /// Search space
    #[prost(message, repeated, tag = "1")]
    pub parameters: Vec<ParameterSpec>,
    /// Objective
    #[prost(message, optional, tag = "2")]
    pub objective: Option<ObjectiveSpec>,
    /// Algorithm
    #[prost(message, optional, tag = "3")]
    pub algorithm: Option<AlgorithmSpec>,
    /// Parallelism
    #[prost(uint32, tag = "4")]
    pub parallel_trial_count: u32,
    /// Trial budget, 0 when unbounded
    #[prost(uint32, tag = "5")]
    pub max_trial_count: u32,
}

/// Named experiment
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ExperimentMessage {
    /// Experiment name
    #[prost(string, tag = "1")]
    pub name: String,
    /// Experiment spec
    #[prost(message, optional, tag = "2")]
    pub spec: Option<ExperimentSpec>,
}

/// One reduced metric value
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Metric {
    /// Metric name
    #[prost(string, tag = "1")]
    pub name: String,
    /// Value formatted as a string
    #[prost(string, tag = "2")]
    pub value: String,
}

/// Trial as seen by an algorithm
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TrialMessage {
    /// Trial name
    #[prost(string, tag = "1")]
    pub name: String,
    /// Parameter values
    #[prost(message, repeated, tag = "2")]
    pub parameter_assignments: Vec<ParameterAssignment>,
    /// Trial phase
    #[prost(string, tag = "3")]
    pub condition: String,
    /// Reduced metrics
    #[prost(message, repeated, tag = "4")]
    pub metrics: Vec<Metric>,
}

/// `GetSuggestions` request
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetSuggestionsRequest {
    /// Experiment being tuned
    #[prost(message, optional, tag = "1")]
    pub experiment: Option<ExperimentMessage>,
    /// Trials that have finished
    #[prost(message, repeated, tag = "2")]
    pub completed_trials: Vec<TrialMessage>,
    /// Trials still running
    #[prost(message, repeated, tag = "3")]
    pub running_trials: Vec<TrialMessage>,
    /// Assignments wanted by this call
    #[prost(uint32, tag = "4")]
    pub current_request_number: u32,
    /// Assignments requested over the Suggestion's lifetime
    #[prost(uint32, tag = "5")]
    pub total_request_number: u32,
}

/// `GetSuggestions` reply
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetSuggestionsReply {
    /// New assignments
    #[prost(message, repeated, tag = "1")]
    pub trials: Vec<TrialAssignment>,
    /// Settings the algorithm wants recorded
    #[prost(message, optional, tag = "2")]
    pub algorithm: Option<AlgorithmSpec>,
    /// The search space is exhausted
    #[prost(bool, tag = "3")]
    pub search_end: bool,
}

/// `ValidateAlgorithmSettings` request
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ValidateAlgorithmSettingsRequest {
    /// Experiment to validate
    #[prost(message, optional, tag = "1")]
    pub experiment: Option<ExperimentMessage>,
}

/// `ValidateAlgorithmSettings` reply
#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct ValidateAlgorithmSettingsReply {}

/// `GetObservationLog` request
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetObservationLogRequest {
    /// Trial whose log is read
    #[prost(string, tag = "1")]
    pub trial_name: String,
    /// Metric to read
    #[prost(string, tag = "2")]
    pub metric_name: String,
    /// RFC 3339 lower bound, empty for unbounded
    #[prost(string, tag = "3")]
    pub start_time: String,
    /// RFC 3339 upper bound, empty for unbounded
    #[prost(string, tag = "4")]
    pub end_time: String,
}

/// One reported sample
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MetricLog {
    /// RFC 3339 timestamp
    #[prost(string, tag = "1")]
    pub time_stamp: String,
    /// Reported value
    #[prost(message, optional, tag = "2")]
    pub metric: Option<Metric>,
}

/// `GetObservationLog` reply
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetObservationLogReply {
    /// Samples in report order
    #[prost(message, repeated, tag = "1")]
    pub metric_logs: Vec<MetricLog>,
}

impl From<&crd::ParameterAssignment> for ParameterAssignment {
    fn from(a: &crd::ParameterAssignment) -> Self {
        Self {
            name: a.name.clone(),
            value: a.value.clone(),
        }
    }
}

impl From<ParameterAssignment> for crd::ParameterAssignment {
    fn from(a: ParameterAssignment) -> Self {
        crd::ParameterAssignment::new(a.name, a.value)
    }
}

impl From<&crd::AlgorithmSetting> for AlgorithmSetting {
    fn from(s: &crd::AlgorithmSetting) -> Self {
        Self {
            name: s.name.clone(),
            value: s.value.clone(),
        }
    }
}

impl From<AlgorithmSetting> for crd::AlgorithmSetting {
    fn from(s: AlgorithmSetting) -> Self {
        crd::AlgorithmSetting {
            name: s.name,
            value: s.value,
        }
    }
}

impl From<&crd::AlgorithmSpec> for AlgorithmSpec {
    fn from(a: &crd::AlgorithmSpec) -> Self {
        Self {
            algorithm_name: a.algorithm_name.clone(),
            algorithm_settings: a.algorithm_settings.iter().map(Into::into).collect(),
        }
    }
}

impl From<&crd::ParameterSpec> for ParameterSpec {
    fn from(p: &crd::ParameterSpec) -> Self {
        let space = &p.feasible_space;
        Self {
            name: p.name.clone(),
            parameter_type: p.parameter_type.to_string(),
            feasible_space: Some(FeasibleSpace {
                min: space.min.clone().unwrap_or_default(),
                max: space.max.clone().unwrap_or_default(),
                list: space.list.clone(),
                step: space.step.clone().unwrap_or_default(),
            }),
        }
    }
}

impl From<&crd::ObjectiveSpec> for ObjectiveSpec {
    fn from(o: &crd::ObjectiveSpec) -> Self {
        Self {
            r#type: o.type_.to_string(),
            goal: o.goal,
            objective_metric_name: o.objective_metric_name.clone(),
            additional_metric_names: o.additional_metric_names.clone(),
        }
    }
}

impl From<&Experiment> for ExperimentMessage {
    fn from(e: &Experiment) -> Self {
        let spec = &e.spec;
        Self {
            name: e.name_any(),
            spec: Some(ExperimentSpec {
                parameters: spec.parameters.iter().map(Into::into).collect(),
                objective: Some((&spec.objective).into()),
                algorithm: Some((&spec.algorithm).into()),
                parallel_trial_count: spec.parallel_trial_count,
                max_trial_count: spec.max_trial_count.unwrap_or(0),
            }),
        }
    }
}

impl From<&Trial> for TrialMessage {
    fn from(t: &Trial) -> Self {
        let strategy_metrics = t
            .status
            .as_ref()
            .and_then(|s| s.observation.as_ref())
            .map(|obs| {
                obs.metrics
                    .iter()
                    .map(|m| Metric {
                        name: m.name.clone(),
                        value: m.value(t.spec.objective.strategy_for(&m.name)).to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Self {
            name: t.name_any(),
            parameter_assignments: t.spec.parameter_assignments.iter().map(Into::into).collect(),
            condition: t.phase().to_string(),
            metrics: strategy_metrics,
        }
    }
}

impl From<TrialAssignment> for crd::TrialAssignment {
    fn from(t: TrialAssignment) -> Self {
        crd::TrialAssignment {
            name: t.name,
            parameter_assignments: t.assignments.into_iter().map(Into::into).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        MetricStrategyType, ObjectiveType, Observation, TrialPhase, TrialSpec, TrialStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_trial_message_reduces_metrics_by_strategy() {
        let mut trial = Trial::new(
            "mnist-a",
            TrialSpec {
                parameter_assignments: vec![crd::ParameterAssignment::new("lr", "0.1")],
                objective: crd::ObjectiveSpec {
                    type_: ObjectiveType::Maximize,
                    objective_metric_name: "accuracy".to_string(),
                    ..Default::default()
                },
                run_spec: String::new(),
                primary_container_name: None,
                retain_run: false,
            },
        );
        trial.metadata = ObjectMeta {
            name: Some("mnist-a".to_string()),
            ..Default::default()
        };
        let mut status = TrialStatus::with_phase(TrialPhase::Succeeded);
        status.observation = Some(Observation {
            metrics: vec![crd::Metric {
                name: "accuracy".to_string(),
                min: 0.2,
                max: 0.9,
                latest: 0.8,
            }],
        });
        trial.status = Some(status);

        let msg = TrialMessage::from(&trial);
        assert_eq!(msg.condition, "Succeeded");
        assert_eq!(msg.metrics[0].value, "0.9");
        assert_eq!(msg.parameter_assignments[0].value, "0.1");
        assert_eq!(
            trial.spec.objective.strategy_for("accuracy"),
            MetricStrategyType::Max
        );
    }

    #[test]
    fn test_unnamed_assignment_keeps_empty_name() {
        let reply = TrialAssignment {
            name: String::new(),
            assignments: vec![ParameterAssignment {
                name: "lr".to_string(),
                value: "0.3".to_string(),
            }],
        };
        let assignment: crd::TrialAssignment = reply.into();
        assert!(assignment.name.is_empty());
        assert_eq!(assignment.parameter_assignments[0].name, "lr");
    }
}
