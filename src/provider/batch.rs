//! Kubernetes batch Job provider

use k8s_openapi::api::batch::v1::JobStatus;
use k8s_openapi::api::core::v1::Container;
use kube::api::{ApiResource, DynamicObject};

use super::{build_api_resource, containers_at, JobCondition};

/// Provider for `batch/v1` Job
#[derive(Clone, Copy, Debug, Default)]
pub struct BatchJobProvider;

impl BatchJobProvider {
    /// Kind handled by this provider
    pub const KIND: &'static str = "Job";
    /// API version handled by this provider
    pub const API_VERSION: &'static str = "batch/v1";

    /// ApiResource for batch Jobs
    pub fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }

    /// Succeeded iff nothing is active and at least one pod succeeded;
    /// Failed iff any pod failed; otherwise Running.
    pub fn status(&self, job: &DynamicObject) -> JobCondition {
        let status: JobStatus = job
            .data
            .get("status")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default();

        let active = status.active.unwrap_or(0);
        let succeeded = status.succeeded.unwrap_or(0);
        let failed = status.failed.unwrap_or(0);

        if active == 0 && succeeded > 0 {
            JobCondition::Succeeded
        } else if failed > 0 {
            JobCondition::Failed
        } else {
            JobCondition::Running
        }
    }

    /// The first container runs the training code
    pub fn is_training_container(&self, index: usize, _container: &Container) -> bool {
        index == 0
    }

    /// Containers of the Job's pod template
    pub fn containers(&self, job: &DynamicObject) -> Vec<Container> {
        containers_at(job, "/spec/template/spec/containers")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_with_status(status: serde_json::Value) -> DynamicObject {
        let mut job = DynamicObject::new("train", &BatchJobProvider::api_resource());
        job.data = serde_json::json!({
            "spec": {
                "template": {
                    "spec": {
                        "containers": [
                            {"name": "training", "image": "trainer:latest"},
                            {"name": "sidecar", "image": "logger:latest"}
                        ]
                    }
                }
            },
            "status": status
        });
        job
    }

    #[test]
    fn test_succeeded_when_idle_with_success() {
        let job = job_with_status(serde_json::json!({"active": 0, "succeeded": 1}));
        assert_eq!(BatchJobProvider.status(&job), JobCondition::Succeeded);
    }

    #[test]
    fn test_not_succeeded_while_pods_active() {
        let job = job_with_status(serde_json::json!({"active": 1, "succeeded": 1}));
        assert_eq!(BatchJobProvider.status(&job), JobCondition::Running);
    }

    #[test]
    fn test_failed_when_any_pod_failed() {
        let job = job_with_status(serde_json::json!({"active": 1, "failed": 1}));
        assert_eq!(BatchJobProvider.status(&job), JobCondition::Failed);
    }

    #[test]
    fn test_success_takes_precedence_over_failed_retries() {
        let job = job_with_status(serde_json::json!({"active": 0, "succeeded": 1, "failed": 2}));
        assert_eq!(BatchJobProvider.status(&job), JobCondition::Succeeded);
    }

    #[test]
    fn test_running_without_status() {
        let mut job = job_with_status(serde_json::json!({}));
        job.data.as_object_mut().unwrap().remove("status");
        assert_eq!(BatchJobProvider.status(&job), JobCondition::Running);
    }

    #[test]
    fn test_first_container_is_training_container() {
        let job = job_with_status(serde_json::json!({}));
        let containers = BatchJobProvider.containers(&job);
        assert_eq!(containers.len(), 2);
        assert!(BatchJobProvider.is_training_container(0, &containers[0]));
        assert!(!BatchJobProvider.is_training_container(1, &containers[1]));
    }
}
