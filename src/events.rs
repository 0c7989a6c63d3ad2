//! Kubernetes Event recording for hypertune controllers.
//!
//! Events are fire-and-forget: a failed publish is logged and never breaks
//! reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Publishes Kubernetes Events
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish an Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason (see [`reasons`])
    /// * `action` - Action taken (see [`actions`])
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publisher backed by `kube::runtime::events::Recorder`
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a publisher reporting as `controller_name`
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(reason, action, error = %e, "failed to publish event");
        }
    }
}

/// Publisher that drops every event
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons, shown in the REASON column of `kubectl get events`
pub mod reasons {
    /// Experiment passed validation and started
    pub const EXPERIMENT_STARTED: &str = "ExperimentStarted";
    /// Experiment was restarted with a larger trial budget
    pub const EXPERIMENT_RESTARTED: &str = "ExperimentRestarted";
    /// Experiment reached a terminal phase
    pub const EXPERIMENT_COMPLETED: &str = "ExperimentCompleted";
    /// Experiment spec failed validation
    pub const VALIDATION_FAILED: &str = "ValidationFailed";
    /// A Trial was created from an assignment
    pub const TRIAL_CREATED: &str = "TrialCreated";
    /// An active Trial was killed to honour parallelism
    pub const TRIAL_KILLED: &str = "TrialKilled";
    /// Trial template could not be rendered
    pub const TEMPLATE_FAILED: &str = "TemplateRenderFailed";
    /// Training job created for a Trial
    pub const JOB_CREATED: &str = "JobCreated";
    /// Training job deleted after completion
    pub const JOB_DELETED: &str = "JobDeleted";
    /// Trial completed successfully
    pub const TRIAL_SUCCEEDED: &str = "TrialSucceeded";
    /// Trial failed
    pub const TRIAL_FAILED: &str = "TrialFailed";
    /// Algorithm Deployment and Service created
    pub const DEPLOYMENT_CREATED: &str = "DeploymentCreated";
    /// Algorithm Deployment and Service removed
    pub const DEPLOYMENT_DELETED: &str = "DeploymentDeleted";
    /// Algorithm rejected the experiment's settings
    pub const ALGORITHM_REJECTED: &str = "AlgorithmRejected";
    /// No configuration for the requested algorithm
    pub const UNKNOWN_ALGORITHM: &str = "UnknownAlgorithm";
    /// Algorithm reported the end of the search space
    pub const SEARCH_EXHAUSTED: &str = "SearchExhausted";
}

/// Event actions, shown in the ACTION column of `kubectl get events`
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Creating a child resource
    pub const CREATE: &str = "Create";
    /// Deleting a child resource
    pub const DELETE: &str = "Delete";
    /// Rendering a trial template
    pub const RENDER: &str = "Render";
    /// Calling the search algorithm
    pub const SUGGEST: &str = "Suggest";
}
