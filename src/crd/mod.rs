//! Custom Resource Definitions for hypertune
//!
//! This module contains all CRD definitions used by the hypertune operator.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

mod experiment;
mod suggestion;
mod trial;
mod types;

pub use experiment::{
    reasons as experiment_reasons, Experiment, ExperimentPhase, ExperimentSpec, ExperimentStatus,
    OptimalTrial, TrialParameterSpec, TrialTemplate, DEFAULT_PARALLEL_TRIAL_COUNT,
};
pub use suggestion::{
    reasons as suggestion_reasons, Suggestion, SuggestionPhase, SuggestionSpec, SuggestionStatus,
};
pub use trial::{
    reasons as trial_reasons, Trial, TrialPhase, TrialSpec, TrialStatus, EXPERIMENT_LABEL,
    TRIAL_LABEL,
};
pub use types::{
    clear_condition, find_condition, set_condition, AlgorithmSetting, AlgorithmSpec, Condition,
    ConditionStatus, FeasibleSpace, Metric, MetricStrategy, MetricStrategyType, ObjectiveSpec,
    ObjectiveType, Observation, ParameterAssignment, ParameterSpec, ParameterType, ResumePolicy,
    TrialAssignment,
};

/// Every CRD served by the operator, in install order
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![Experiment::crd(), Trial::crd(), Suggestion::crd()]
}

/// All CRDs as one multi-document YAML stream
pub fn crds_yaml() -> Result<String, crate::Error> {
    let mut out = String::new();
    for crd in all_crds() {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&crd)?);
    }
    Ok(out)
}
