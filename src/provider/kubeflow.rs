//! Providers for job kinds that report a Kubeflow-style condition list

use k8s_openapi::api::core::v1::Container;
use kube::api::DynamicObject;
use serde::Deserialize;

use super::{containers_at, JobCondition};

#[derive(Debug, Deserialize)]
struct ListedCondition {
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    status: String,
}

/// Provider for a condition-list job kind
///
/// The job's condition is the type of the last entry in
/// `status.conditions`. By default the entry's status is not consulted, so
/// a stale `Succeeded=False` entry still reads as Succeeded.
#[derive(Clone, Debug)]
pub struct KubeflowJobProvider {
    kind: String,
    api_version: String,
    replica_specs_field: String,
    container_name: String,
    require_true_condition: bool,
}

impl KubeflowJobProvider {
    /// Create a provider for an arbitrary condition-list kind
    pub fn new(
        kind: impl Into<String>,
        api_version: impl Into<String>,
        replica_specs_field: impl Into<String>,
        container_name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            api_version: api_version.into(),
            replica_specs_field: replica_specs_field.into(),
            container_name: container_name.into(),
            require_true_condition: false,
        }
    }

    /// TensorFlow training job
    pub fn tfjob() -> Self {
        Self::new("TFJob", "kubeflow.org/v1", "tfReplicaSpecs", "tensorflow")
    }

    /// PyTorch training job
    pub fn pytorchjob() -> Self {
        Self::new("PyTorchJob", "kubeflow.org/v1", "pytorchReplicaSpecs", "pytorch")
    }

    /// Only honour the last condition whose status is "True"
    pub fn require_true_condition(mut self, enabled: bool) -> Self {
        self.require_true_condition = enabled;
        self
    }

    /// Kind handled by this provider
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// API version handled by this provider
    pub fn api_version(&self) -> &str {
        &self.api_version
    }

    /// Running by default, otherwise the type of the last listed condition
    pub fn status(&self, job: &DynamicObject) -> JobCondition {
        let conditions: Vec<ListedCondition> = job
            .data
            .pointer("/status/conditions")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let last = if self.require_true_condition {
            conditions.iter().rev().find(|c| c.status == "True")
        } else {
            conditions.last()
        };

        match last.map(|c| c.type_.as_str()) {
            Some("Succeeded") => JobCondition::Succeeded,
            Some("Failed") => JobCondition::Failed,
            _ => JobCondition::Running,
        }
    }

    /// The container named after the framework runs the training code
    pub fn is_training_container(&self, _index: usize, container: &Container) -> bool {
        container.name == self.container_name
    }

    /// Containers across all replica types, ordered by replica type name
    pub fn containers(&self, job: &DynamicObject) -> Vec<Container> {
        let Some(replicas) = job
            .data
            .get("spec")
            .and_then(|s| s.get(&self.replica_specs_field))
            .and_then(|r| r.as_object())
        else {
            return Vec::new();
        };

        let mut roles: Vec<&String> = replicas.keys().collect();
        roles.sort();
        roles
            .into_iter()
            .flat_map(|role| {
                containers_at(
                    job,
                    &format!(
                        "/spec/{}/{}/template/spec/containers",
                        self.replica_specs_field, role
                    ),
                )
            })
            .collect()
    }
}
