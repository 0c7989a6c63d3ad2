//! Suggestion controller
//!
//! Runs one algorithm Deployment and Service per Suggestion and appends
//! assignments until `status.suggestions` covers `spec.requests`.

mod endpoint;
mod sync;

pub use endpoint::{address, is_available, ALGORITHM_LABEL, SUGGESTION_LABEL};
pub use sync::{generated_name, sync_assignments};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::algorithm::AlgorithmClient;
use crate::config::OperatorConfig;
use crate::crd::{
    set_condition, suggestion_reasons as reasons, Condition, ConditionStatus, Experiment,
    ResumePolicy, Suggestion, SuggestionPhase, SuggestionStatus, Trial, EXPERIMENT_LABEL,
};
use crate::events::{actions, reasons as event_reasons, EventPublisher, KubeEventPublisher};
use crate::proto::ValidateAlgorithmSettingsRequest;
use crate::{Error, FIELD_MANAGER};

use super::requeue_for;

/// Kubernetes operations needed by the Suggestion controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a Deployment, `None` if absent
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> Result<Option<Deployment>, Error>;

    /// Create a Deployment; an existing one is left alone
    async fn create_deployment(&self, namespace: &str, deployment: &Deployment)
        -> Result<(), Error>;

    /// Delete a Deployment; absent ones are ignored
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Returns true if the Service exists
    async fn service_exists(&self, namespace: &str, name: &str) -> Result<bool, Error>;

    /// Create a Service; an existing one is left alone
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), Error>;

    /// Delete a Service; absent ones are ignored
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Get the owning Experiment, `None` if absent
    async fn get_experiment(&self, namespace: &str, name: &str)
        -> Result<Option<Experiment>, Error>;

    /// Trials labelled with the experiment's name
    async fn list_trials(&self, namespace: &str, experiment: &str) -> Result<Vec<Trial>, Error>;

    /// Write the Suggestion's status
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &SuggestionStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeClientImpl {
    client: Client,
}

impl KubeClientImpl {
    /// Create a new KubeClientImpl wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn ignore_already_exists(result: Result<(), kube::Error>) -> Result<(), Error> {
    match result.map_err(Error::from) {
        Err(e) if e.is_already_exists() => Ok(()),
        other => other,
    }
}

fn ignore_not_found(result: Result<(), kube::Error>) -> Result<(), Error> {
    match result.map_err(Error::from) {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<(), Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        ignore_already_exists(api.create(&PostParams::default(), deployment).await.map(|_| ()))
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::background()).await.map(|_| ()))
    }

    async fn service_exists(&self, namespace: &str, name: &str) -> Result<bool, Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<(), Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        ignore_already_exists(api.create(&PostParams::default(), service).await.map(|_| ()))
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await.map(|_| ()))
    }

    async fn get_experiment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Experiment>, Error> {
        let api: Api<Experiment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_trials(&self, namespace: &str, experiment: &str) -> Result<Vec<Trial>, Error> {
        let api: Api<Trial> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&format!("{EXPERIMENT_LABEL}={experiment}"));
        Ok(api.list(&lp).await?.items)
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &SuggestionStatus,
    ) -> Result<(), Error> {
        let api: Api<Suggestion> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "apiVersion": "hypertune.dev/v1alpha1",
            "kind": "Suggestion",
            "metadata": {"name": name},
            "status": status
        });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&patch))
            .await?;
        Ok(())
    }
}

/// Shared state for Suggestion reconciles
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Per-algorithm serving configuration, loaded once at startup
    pub config: Arc<OperatorConfig>,
    /// Client for the algorithm endpoints
    pub algorithm: Arc<dyn AlgorithmClient>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Create a context backed by a real client
    pub fn new(
        client: Client,
        config: Arc<OperatorConfig>,
        algorithm: Arc<dyn AlgorithmClient>,
    ) -> Self {
        Self {
            kube: Arc::new(KubeClientImpl::new(client.clone())),
            config,
            algorithm,
            events: Arc::new(KubeEventPublisher::new(
                client,
                "hypertune-suggestion-controller",
            )),
        }
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        config: OperatorConfig,
        algorithm: Arc<dyn AlgorithmClient>,
    ) -> Self {
        Self {
            kube,
            config: Arc::new(config),
            algorithm,
            events: Arc::new(crate::events::NoopEventPublisher),
        }
    }
}

/// Requeue after creating the initial status
const INITIAL_REQUEUE: Duration = Duration::from_secs(1);
/// Poll interval while the algorithm Deployment is not available
const DEPLOYMENT_REQUEUE: Duration = Duration::from_secs(5);
/// Periodic resync while serving
const RUNNING_REQUEUE: Duration = Duration::from_secs(60);

/// Reconcile a Suggestion
#[instrument(skip(suggestion, ctx), fields(suggestion = %suggestion.name_any()))]
pub async fn reconcile(suggestion: Arc<Suggestion>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = suggestion.name_any();
    let namespace = suggestion
        .namespace()
        .ok_or_else(|| Error::validation("suggestion must be namespaced"))?;
    let current = suggestion.status.clone();

    let Some(mut status) = current.clone() else {
        let mut status = SuggestionStatus::default();
        status.start_time = Some(Utc::now());
        status.transition(SuggestionPhase::Created, reasons::CREATED, "Suggestion is created");
        ctx.kube.patch_status(&namespace, &name, &status).await?;
        return Ok(Action::requeue(INITIAL_REQUEUE));
    };

    if status.phase.is_completed() {
        return Ok(Action::await_change());
    }

    let endpoint_name = suggestion.endpoint_name();

    if suggestion.spec.experiment_completed
        && suggestion.spec.resume_policy == ResumePolicy::Never
    {
        ctx.kube.delete_deployment(&namespace, &endpoint_name).await?;
        ctx.kube.delete_service(&namespace, &endpoint_name).await?;
        ctx.algorithm.release(&address(&suggestion));
        info!(endpoint = %endpoint_name, "experiment completed, algorithm endpoint removed");
        status.transition(
            SuggestionPhase::Succeeded,
            reasons::SUCCEEDED,
            "Experiment completed, suggestion endpoint removed",
        );
        ctx.kube.patch_status(&namespace, &name, &status).await?;
        publish(
            &ctx,
            &suggestion,
            EventType::Normal,
            event_reasons::DEPLOYMENT_DELETED,
            Some(endpoint_name),
        )
        .await;
        return Ok(Action::await_change());
    }

    let algorithm_name = &suggestion.spec.algorithm.algorithm_name;
    let Some(config) = ctx.config.suggestion(algorithm_name) else {
        let message = format!("algorithm '{algorithm_name}' is not configured");
        warn!(algorithm = %algorithm_name, "unknown algorithm");
        status.transition(SuggestionPhase::Failed, reasons::UNKNOWN_ALGORITHM, &message);
        ctx.kube.patch_status(&namespace, &name, &status).await?;
        publish(
            &ctx,
            &suggestion,
            EventType::Warning,
            event_reasons::UNKNOWN_ALGORITHM,
            Some(message),
        )
        .await;
        return Ok(Action::await_change());
    };

    let deployment = match ctx.kube.get_deployment(&namespace, &endpoint_name).await? {
        Some(existing) => Some(existing),
        None => {
            ctx.kube
                .create_deployment(&namespace, &endpoint::deployment(&suggestion, config)?)
                .await?;
            info!(endpoint = %endpoint_name, "created algorithm deployment");
            publish(
                &ctx,
                &suggestion,
                EventType::Normal,
                event_reasons::DEPLOYMENT_CREATED,
                Some(endpoint_name.clone()),
            )
            .await;
            None
        }
    };
    if !ctx.kube.service_exists(&namespace, &endpoint_name).await? {
        ctx.kube
            .create_service(&namespace, &endpoint::service(&suggestion)?)
            .await?;
        debug!(endpoint = %endpoint_name, "created algorithm service");
    }

    if !deployment.as_ref().is_some_and(is_available) {
        set_condition(
            &mut status.conditions,
            Condition::new(
                reasons::DEPLOYMENT_READY,
                ConditionStatus::False,
                reasons::DEPLOYMENT_NOT_AVAILABLE,
                "Algorithm deployment is not available",
            ),
        );
        persist(&ctx, &namespace, &name, current.as_ref(), &status).await?;
        return Ok(Action::requeue(DEPLOYMENT_REQUEUE));
    }
    set_condition(
        &mut status.conditions,
        Condition::new(
            reasons::DEPLOYMENT_READY,
            ConditionStatus::True,
            reasons::DEPLOYMENT_AVAILABLE,
            "Algorithm deployment is available",
        ),
    );

    let experiment_name = suggestion
        .labels()
        .get(EXPERIMENT_LABEL)
        .cloned()
        .unwrap_or_else(|| name.clone());
    let Some(experiment) = ctx.kube.get_experiment(&namespace, &experiment_name).await? else {
        debug!(experiment = %experiment_name, "owning experiment not found");
        persist(&ctx, &namespace, &name, current.as_ref(), &status).await?;
        return Ok(Action::await_change());
    };

    let address = address(&suggestion);

    if status.phase != SuggestionPhase::Running {
        let request = ValidateAlgorithmSettingsRequest {
            experiment: Some((&experiment).into()),
        };
        match ctx.algorithm.validate_algorithm_settings(&address, request).await {
            Ok(()) => {
                status.transition(
                    SuggestionPhase::Running,
                    reasons::RUNNING,
                    "Suggestion is running",
                );
            }
            Err(e) if e.is_terminal() => {
                warn!(error = %e, "algorithm rejected experiment settings");
                status.transition(
                    SuggestionPhase::Failed,
                    reasons::ALGORITHM_REJECTED,
                    e.to_string(),
                );
                ctx.kube.patch_status(&namespace, &name, &status).await?;
                publish(
                    &ctx,
                    &suggestion,
                    EventType::Warning,
                    event_reasons::ALGORITHM_REJECTED,
                    Some(e.to_string()),
                )
                .await;
                return Ok(Action::await_change());
            }
            Err(e) => return Err(e),
        }
    }

    let mut trials = ctx.kube.list_trials(&namespace, &experiment_name).await?;
    let uid = experiment.uid();
    trials.retain(|t| {
        t.owner_references().is_empty()
            || t.owner_references().iter().any(|o| Some(&o.uid) == uid.as_ref())
    });

    let was_exhausted = status.search_exhausted;
    let appended = sync_assignments(
        ctx.algorithm.as_ref(),
        &address,
        suggestion.spec.requests,
        &experiment,
        &trials,
        &mut status,
    )
    .await?;
    if appended > 0 {
        info!(appended, total = status.suggestion_count, "assignments appended");
    }
    if status.search_exhausted && !was_exhausted {
        set_condition(
            &mut status.conditions,
            Condition::new(
                reasons::EXHAUSTED,
                ConditionStatus::True,
                reasons::SEARCH_END,
                "Algorithm has no more assignments",
            ),
        );
        publish(&ctx, &suggestion, EventType::Normal, event_reasons::SEARCH_EXHAUSTED, None).await;
    }

    persist(&ctx, &namespace, &name, current.as_ref(), &status).await?;
    Ok(Action::requeue(RUNNING_REQUEUE))
}

/// Requeue strategy for failed reconciles
pub fn error_policy(suggestion: Arc<Suggestion>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(?error, suggestion = %suggestion.name_any(), "reconciliation failed");
    requeue_for(error)
}

async fn persist(
    ctx: &Context,
    namespace: &str,
    name: &str,
    current: Option<&SuggestionStatus>,
    status: &SuggestionStatus,
) -> Result<(), Error> {
    if current == Some(status) {
        return Ok(());
    }
    ctx.kube.patch_status(namespace, name, status).await
}

async fn publish(
    ctx: &Context,
    suggestion: &Suggestion,
    type_: EventType,
    reason: &str,
    note: Option<String>,
) {
    ctx.events
        .publish(&suggestion.object_ref(&()), type_, reason, actions::SUGGEST, note)
        .await;
}
