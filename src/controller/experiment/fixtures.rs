//! Shared builders for experiment controller tests

use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};

use crate::crd::{
    AlgorithmSpec, Experiment, ExperimentSpec, FeasibleSpace, Metric, ObjectiveSpec, Observation,
    ParameterAssignment, ParameterSpec, ParameterType, ResumePolicy, Trial, TrialAssignment,
    TrialParameterSpec, TrialPhase, TrialSpec, TrialStatus, TrialTemplate, EXPERIMENT_LABEL,
};

pub fn sample_spec() -> ExperimentSpec {
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
            objective_metric_name: "loss".to_string(),
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
            trial_spec: "apiVersion: batch/v1\nkind: Job\n".to_string(),
        },
        parallel_trial_count: 2,
        max_trial_count: Some(3),
        max_failed_trial_count: None,
        resume_policy: ResumePolicy::Never,
    }
}

pub fn experiment(spec: ExperimentSpec) -> Experiment {
    Experiment {
        metadata: ObjectMeta {
            name: Some("exp".to_string()),
            namespace: Some("research".to_string()),
            uid: Some("exp-uid".to_string()),
            ..Default::default()
        },
        spec,
        status: None,
    }
}

pub fn assignment(name: &str, lr: &str) -> TrialAssignment {
    TrialAssignment {
        name: name.to_string(),
        parameter_assignments: vec![ParameterAssignment::new("lr", lr)],
    }
}

/// Trial created `minute` minutes after a fixed epoch
pub fn trial(name: &str, minute: u32, phase: TrialPhase, objective: Option<f64>) -> Trial {
    let spec = sample_spec();
    let created = Utc.with_ymd_and_hms(2026, 1, 1, 0, minute, 0).unwrap();

    let mut status = TrialStatus::with_phase(phase);
    status.observation = objective.map(|v| Observation {
        metrics: vec![Metric {
            name: "loss".to_string(),
            min: v,
            max: v,
            latest: v,
        }],
    });

    Trial {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("research".to_string()),
            creation_timestamp: Some(Time(created)),
            labels: Some(BTreeMap::from([(
                EXPERIMENT_LABEL.to_string(),
                "exp".to_string(),
            )])),
            ..Default::default()
        },
        spec: TrialSpec {
            parameter_assignments: vec![ParameterAssignment::new("lr", "0.05")],
            objective: spec.objective,
            run_spec: String::new(),
            primary_container_name: None,
            retain_run: false,
        },
        status: Some(status),
    }
}
