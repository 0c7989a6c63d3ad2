//! Supporting types shared by the Experiment, Trial and Suggestion CRDs

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Search parameter type
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    /// Continuous floating point range
    #[default]
    Double,
    /// Integer range
    Int,
    /// Explicit list of numeric values
    Discrete,
    /// Explicit list of string values
    Categorical,
}

impl std::fmt::Display for ParameterType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Double => write!(f, "double"),
            Self::Int => write!(f, "int"),
            Self::Discrete => write!(f, "discrete"),
            Self::Categorical => write!(f, "categorical"),
        }
    }
}

/// Feasible range or value list for a search parameter
///
/// Bounds are kept as strings so integer and float ranges share one shape.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeasibleSpace {
    /// Lower bound (double, int)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<String>,
    /// Upper bound (double, int)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<String>,
    /// Allowed values (discrete, categorical)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub list: Vec<String>,
    /// Optional step between values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
}

/// One named dimension of the search space
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSpec {
    /// Parameter name, referenced by trial template parameters
    pub name: String,
    /// Value type
    pub parameter_type: ParameterType,
    /// Range or list of allowed values
    pub feasible_space: FeasibleSpace,
}

impl ParameterSpec {
    /// Validates that the feasible space matches the parameter type
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.name.is_empty() {
            return Err(crate::Error::validation("parameter name must not be empty"));
        }
        let space = &self.feasible_space;
        match self.parameter_type {
            ParameterType::Double | ParameterType::Int => {
                let (min, max) = match (&space.min, &space.max) {
                    (Some(min), Some(max)) => (min, max),
                    _ => {
                        return Err(crate::Error::validation(format!(
                            "parameter '{}' requires feasibleSpace.min and feasibleSpace.max",
                            self.name
                        )))
                    }
                };
                let parse = |v: &str| {
                    v.parse::<f64>().map_err(|_| {
                        crate::Error::validation(format!(
                            "parameter '{}' has non-numeric bound '{v}'",
                            self.name
                        ))
                    })
                };
                if parse(min.as_str())? > parse(max.as_str())? {
                    return Err(crate::Error::validation(format!(
                        "parameter '{}' has min greater than max",
                        self.name
                    )));
                }
                if let Some(step) = &space.step {
                    if parse(step.as_str())? <= 0.0 {
                        return Err(crate::Error::validation(format!(
                            "parameter '{}' step must be positive",
                            self.name
                        )));
                    }
                }
            }
            ParameterType::Discrete | ParameterType::Categorical => {
                if space.list.is_empty() {
                    return Err(crate::Error::validation(format!(
                        "parameter '{}' requires a non-empty feasibleSpace.list",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Optimization direction
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ObjectiveType {
    /// Smaller values are better
    #[default]
    Minimize,
    /// Larger values are better
    Maximize,
}

impl ObjectiveType {
    /// Returns true if `candidate` strictly improves on `current`
    pub fn improves(&self, candidate: f64, current: f64) -> bool {
        match self {
            Self::Minimize => candidate < current,
            Self::Maximize => candidate > current,
        }
    }

    /// Returns true if `value` meets or beats `goal`
    pub fn reached(&self, value: f64, goal: f64) -> bool {
        match self {
            Self::Minimize => value <= goal,
            Self::Maximize => value >= goal,
        }
    }

    /// Metric reduction used when no explicit strategy is configured
    pub fn default_strategy(&self) -> MetricStrategyType {
        match self {
            Self::Minimize => MetricStrategyType::Min,
            Self::Maximize => MetricStrategyType::Max,
        }
    }
}

impl std::fmt::Display for ObjectiveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Minimize => write!(f, "minimize"),
            Self::Maximize => write!(f, "maximize"),
        }
    }
}

/// How a metric log is reduced to a single value
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MetricStrategyType {
    /// Smallest reported value
    #[default]
    Min,
    /// Largest reported value
    Max,
    /// Last reported value
    Latest,
}

/// Per-metric reduction override
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct MetricStrategy {
    /// Metric name
    pub name: String,
    /// Reduction to apply
    pub value: MetricStrategyType,
}

/// What is being optimized
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectiveSpec {
    /// Direction of optimization
    #[serde(rename = "type")]
    pub type_: ObjectiveType,

    /// Target value; reaching it completes the experiment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<f64>,

    /// Name of the metric being optimized
    pub objective_metric_name: String,

    /// Extra metrics collected alongside the objective
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_metric_names: Vec<String>,

    /// Reduction overrides by metric name
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metric_strategies: Vec<MetricStrategy>,
}

impl ObjectiveSpec {
    /// Reduction strategy for the named metric
    pub fn strategy_for(&self, metric: &str) -> MetricStrategyType {
        self.metric_strategies
            .iter()
            .find(|s| s.name == metric)
            .map(|s| s.value)
            .unwrap_or_else(|| self.type_.default_strategy())
    }

    /// Objective followed by additional metric names, deduplicated
    pub fn all_metric_names(&self) -> Vec<String> {
        let mut names = vec![self.objective_metric_name.clone()];
        for name in &self.additional_metric_names {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }
}

/// A single algorithm tuning knob
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct AlgorithmSetting {
    /// Setting name
    pub name: String,
    /// Setting value
    pub value: String,
}

/// Search algorithm selection
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AlgorithmSpec {
    /// Algorithm name, used to look up its serving configuration
    pub algorithm_name: String,

    /// Settings passed through to the algorithm
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub algorithm_settings: Vec<AlgorithmSetting>,
}

/// One parameter value in an assignment
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ParameterAssignment {
    /// Parameter name
    pub name: String,
    /// Parameter value, formatted as a string
    pub value: String,
}

impl ParameterAssignment {
    /// Create an assignment
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A proposed parameter vector and the name of the Trial that evaluates it
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrialAssignment {
    /// Name the resulting Trial must take
    pub name: String,
    /// Ordered parameter values
    pub parameter_assignments: Vec<ParameterAssignment>,
}

/// Resume behaviour once an experiment completes
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ResumePolicy {
    /// Tear down the algorithm endpoint on completion
    #[default]
    Never,
    /// Keep the algorithm endpoint so the experiment can be restarted
    LongRunning,
}

/// Reduced values of one metric
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Metric {
    /// Metric name
    pub name: String,
    /// Smallest reported value
    pub min: f64,
    /// Largest reported value
    pub max: f64,
    /// Last reported value
    pub latest: f64,
}

impl Metric {
    /// Reduce to a single value
    pub fn value(&self, strategy: MetricStrategyType) -> f64 {
        match strategy {
            MetricStrategyType::Min => self.min,
            MetricStrategyType::Max => self.max,
            MetricStrategyType::Latest => self.latest,
        }
    }
}

/// Metrics observed for a trial
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Observation {
    /// Reduced metrics, one entry per name
    #[serde(default)]
    pub metrics: Vec<Metric>,
}

impl Observation {
    /// Look up a metric by name
    pub fn metric(&self, name: &str) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.name == name)
    }

    /// Insert the metric, overwriting any entry with the same name
    pub fn merge(&mut self, metric: Metric) {
        match self.metrics.iter_mut().find(|m| m.name == metric.name) {
            Some(existing) => *existing = metric,
            None => self.metrics.push(metric),
        }
    }
}

/// Condition status values
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., Running, Succeeded)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    fn same_state(&self, other: &Condition) -> bool {
        self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

/// Insert or replace a condition by type
///
/// An unchanged condition keeps its original transition time so repeated
/// reconciles produce identical status.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) if existing.same_state(&condition) => {}
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}

/// Flip a True condition of the given type to False, keeping its reason
pub fn clear_condition(conditions: &mut [Condition], type_: &str) {
    if let Some(existing) = conditions
        .iter_mut()
        .find(|c| c.type_ == type_ && c.status == ConditionStatus::True)
    {
        existing.status = ConditionStatus::False;
        existing.last_transition_time = Utc::now();
    }
}

/// Look up a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

#[cfg(test)]
mod tests {
    use super::*;

    mod parameters {
        use super::*;

        fn double(min: &str, max: &str) -> ParameterSpec {
            ParameterSpec {
                name: "lr".to_string(),
                parameter_type: ParameterType::Double,
                feasible_space: FeasibleSpace {
                    min: Some(min.to_string()),
                    max: Some(max.to_string()),
                    ..Default::default()
                },
            }
        }

        #[test]
        fn test_valid_double_range() {
            assert!(double("0.01", "0.1").validate().is_ok());
        }

        #[test]
        fn test_inverted_range_rejected() {
            let err = double("1", "0.1").validate().unwrap_err();
            assert!(err.to_string().contains("min greater than max"));
        }

        #[test]
        fn test_non_numeric_bound_rejected() {
            assert!(double("low", "0.1").validate().is_err());
        }

        #[test]
        fn test_categorical_requires_list() {
            let spec = ParameterSpec {
                name: "optimizer".to_string(),
                parameter_type: ParameterType::Categorical,
                feasible_space: FeasibleSpace::default(),
            };
            assert!(spec.validate().is_err());

            let spec = ParameterSpec {
                feasible_space: FeasibleSpace {
                    list: vec!["sgd".to_string(), "adam".to_string()],
                    ..Default::default()
                },
                ..spec
            };
            assert!(spec.validate().is_ok());
        }

        #[test]
        fn test_parameter_type_wire_format() {
            let json = serde_json::to_string(&ParameterType::Categorical).unwrap();
            assert_eq!(json, "\"categorical\"");
            assert_eq!(ParameterType::Int.to_string(), "int");
        }
    }

    mod objective {
        use super::*;

        #[test]
        fn test_improvement_is_strict() {
            assert!(ObjectiveType::Maximize.improves(0.9, 0.7));
            assert!(!ObjectiveType::Maximize.improves(0.7, 0.7));
            assert!(ObjectiveType::Minimize.improves(0.1, 0.2));
            assert!(!ObjectiveType::Minimize.improves(0.2, 0.2));
        }

        #[test]
        fn test_goal_reached_is_inclusive() {
            assert!(ObjectiveType::Maximize.reached(0.85, 0.85));
            assert!(!ObjectiveType::Maximize.reached(0.84, 0.85));
            assert!(ObjectiveType::Minimize.reached(0.05, 0.05));
            assert!(!ObjectiveType::Minimize.reached(0.06, 0.05));
        }

        #[test]
        fn test_strategy_defaults_follow_direction() {
            let mut objective = ObjectiveSpec {
                type_: ObjectiveType::Maximize,
                objective_metric_name: "accuracy".to_string(),
                ..Default::default()
            };
            assert_eq!(objective.strategy_for("accuracy"), MetricStrategyType::Max);

            objective.metric_strategies.push(MetricStrategy {
                name: "accuracy".to_string(),
                value: MetricStrategyType::Latest,
            });
            assert_eq!(
                objective.strategy_for("accuracy"),
                MetricStrategyType::Latest
            );
        }

        #[test]
        fn test_all_metric_names_dedupes_objective() {
            let objective = ObjectiveSpec {
                objective_metric_name: "loss".to_string(),
                additional_metric_names: vec!["loss".to_string(), "accuracy".to_string()],
                ..Default::default()
            };
            assert_eq!(objective.all_metric_names(), vec!["loss", "accuracy"]);
        }
    }

    mod observation {
        use super::*;

        fn metric(name: &str, v: f64) -> Metric {
            Metric {
                name: name.to_string(),
                min: v,
                max: v,
                latest: v,
            }
        }

        #[test]
        fn test_merge_inserts_then_overwrites() {
            let mut obs = Observation::default();
            obs.merge(metric("loss", 0.5));
            obs.merge(metric("accuracy", 0.8));
            obs.merge(metric("loss", 0.3));

            assert_eq!(obs.metrics.len(), 2);
            assert_eq!(obs.metric("loss").unwrap().latest, 0.3);
            assert_eq!(obs.metrics[0].name, "loss");
        }
    }

    mod conditions {
        use super::*;

        #[test]
        fn test_unchanged_condition_keeps_timestamp() {
            let mut conditions = Vec::new();
            set_condition(
                &mut conditions,
                Condition::new("Running", ConditionStatus::True, "Running", "running"),
            );
            let first = conditions[0].last_transition_time;

            set_condition(
                &mut conditions,
                Condition::new("Running", ConditionStatus::True, "Running", "running"),
            );
            assert_eq!(conditions.len(), 1);
            assert_eq!(conditions[0].last_transition_time, first);
        }

        #[test]
        fn test_changed_condition_replaces_entry() {
            let mut conditions = vec![Condition::new(
                "Running",
                ConditionStatus::True,
                "Running",
                "running",
            )];
            set_condition(
                &mut conditions,
                Condition::new("Running", ConditionStatus::False, "Done", "done"),
            );
            assert_eq!(conditions.len(), 1);
            assert_eq!(conditions[0].status, ConditionStatus::False);
        }

        #[test]
        fn test_clear_condition_only_touches_true_entries() {
            let mut conditions = vec![
                Condition::new("Running", ConditionStatus::True, "Running", ""),
                Condition::new("Created", ConditionStatus::True, "Created", ""),
            ];
            clear_condition(&mut conditions, "Running");
            assert_eq!(
                find_condition(&conditions, "Running").unwrap().status,
                ConditionStatus::False
            );
            assert_eq!(
                find_condition(&conditions, "Created").unwrap().status,
                ConditionStatus::True
            );
        }
    }
}
