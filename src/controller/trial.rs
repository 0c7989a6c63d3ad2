//! Trial controller
//!
//! Materializes a Trial's `runSpec` as a training job, tracks the job's
//! normalized condition, and collects metrics from the observation store
//! once the job succeeds.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kube::api::{Api, ApiResource, DynamicObject, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    set_condition, trial_reasons as reasons, Condition, ConditionStatus, Observation, Trial,
    TrialPhase, TrialStatus, EXPERIMENT_LABEL, TRIAL_LABEL,
};
use crate::events::{actions, reasons as event_reasons, EventPublisher, KubeEventPublisher};
use crate::observation::{reduce, ObservationStore};
use crate::provider::{JobCondition, JobProvider, JobProviderRegistry};
use crate::{Error, FIELD_MANAGER};

use super::requeue_for;

/// Kubernetes operations needed by the Trial controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Get a job of any kind, `None` if absent
    async fn get_job(
        &self,
        namespace: &str,
        name: &str,
        resource: &ApiResource,
    ) -> Result<Option<DynamicObject>, Error>;

    /// Create a job; an existing job with the same name is left alone
    async fn create_job(
        &self,
        namespace: &str,
        resource: &ApiResource,
        job: &DynamicObject,
    ) -> Result<(), Error>;

    /// Delete a job and its pods; absent jobs are ignored
    async fn delete_job(
        &self,
        namespace: &str,
        name: &str,
        resource: &ApiResource,
    ) -> Result<(), Error>;

    /// Write the Trial's status
    async fn patch_status(&self, namespace: &str, name: &str, status: &TrialStatus)
        -> Result<(), Error>;
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

    fn api(&self, namespace: &str, resource: &ApiResource) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, resource)
    }
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_job(
        &self,
        namespace: &str,
        name: &str,
        resource: &ApiResource,
    ) -> Result<Option<DynamicObject>, Error> {
        Ok(self.api(namespace, resource).get_opt(name).await?)
    }

    async fn create_job(
        &self,
        namespace: &str,
        resource: &ApiResource,
        job: &DynamicObject,
    ) -> Result<(), Error> {
        match self
            .api(namespace, resource)
            .create(&PostParams::default(), job)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = Error::from(e);
                if err.is_already_exists() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn delete_job(
        &self,
        namespace: &str,
        name: &str,
        resource: &ApiResource,
    ) -> Result<(), Error> {
        let dp = kube::api::DeleteParams::background();
        match self.api(namespace, resource).delete(name, &dp).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let err = Error::from(e);
                if err.is_not_found() {
                    Ok(())
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &TrialStatus,
    ) -> Result<(), Error> {
        let api: Api<Trial> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "apiVersion": "hypertune.dev/v1alpha1",
            "kind": "Trial",
            "metadata": {"name": name},
            "status": status
        });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&patch))
            .await?;
        Ok(())
    }
}

/// Shared state for Trial reconciles
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Job providers by kind
    pub providers: Arc<JobProviderRegistry>,
    /// Metric log reader
    pub observations: Arc<dyn ObservationStore>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Create a context backed by a real client
    pub fn new(
        client: Client,
        providers: Arc<JobProviderRegistry>,
        observations: Arc<dyn ObservationStore>,
    ) -> Self {
        Self {
            kube: Arc::new(KubeClientImpl::new(client.clone())),
            providers,
            observations,
            events: Arc::new(KubeEventPublisher::new(client, "hypertune-trial-controller")),
        }
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        observations: Arc<dyn ObservationStore>,
    ) -> Self {
        Self {
            kube,
            providers: Arc::new(JobProviderRegistry::with_defaults(false)),
            observations,
            events: Arc::new(crate::events::NoopEventPublisher),
        }
    }
}

/// Requeue after creating the initial status
const INITIAL_REQUEUE: Duration = Duration::from_secs(1);
/// Poll interval while a succeeded job's metrics are missing
const METRICS_REQUEUE: Duration = Duration::from_secs(10);
/// Periodic resync for running trials
const RUNNING_REQUEUE: Duration = Duration::from_secs(60);

/// Reconcile a Trial
#[instrument(skip(trial, ctx), fields(trial = %trial.name_any()))]
pub async fn reconcile(trial: Arc<Trial>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = trial.name_any();
    let namespace = trial
        .namespace()
        .ok_or_else(|| Error::validation("trial must be namespaced"))?;
    let current = trial.status.clone();

    let Some(mut status) = current.clone() else {
        let mut status = TrialStatus::default();
        status.start_time = Some(Utc::now());
        status.transition(TrialPhase::Created, reasons::CREATED, "Trial is created");
        ctx.kube.patch_status(&namespace, &name, &status).await?;
        return Ok(Action::requeue(INITIAL_REQUEUE));
    };

    let (provider, desired) = match desired_job(&trial, &ctx.providers) {
        Ok(decoded) => decoded,
        Err(e) if e.is_terminal() => {
            if !trial.is_completed() {
                warn!(error = %e, "run spec rejected");
                status.transition(TrialPhase::Failed, reasons::INVALID_RUN_SPEC, e.to_string());
                ctx.kube.patch_status(&namespace, &name, &status).await?;
                publish(
                    &ctx,
                    &trial,
                    EventType::Warning,
                    event_reasons::TRIAL_FAILED,
                    Some(e.to_string()),
                )
                .await;
            }
            return Ok(Action::await_change());
        }
        Err(e) => return Err(e),
    };
    let resource = provider.api_resource();

    let job = match ctx.kube.get_job(&namespace, &name, &resource).await? {
        None if trial.is_completed() => return Ok(Action::await_change()),
        None => {
            ctx.kube.create_job(&namespace, &resource, &desired).await?;
            info!(kind = %resource.kind, "created job");
            publish(
                &ctx,
                &trial,
                EventType::Normal,
                event_reasons::JOB_CREATED,
                Some(resource.kind.clone()),
            )
            .await;
            desired
        }
        Some(_) if trial.is_completed() => {
            if !trial.spec.retain_run {
                ctx.kube.delete_job(&namespace, &name, &resource).await?;
                debug!("deleted job of completed trial");
                publish(&ctx, &trial, EventType::Normal, event_reasons::JOB_DELETED, None).await;
            }
            return Ok(Action::await_change());
        }
        Some(existing) => existing,
    };

    let condition = provider.status(&job);
    debug!(%condition, "job condition");

    let action = match condition {
        JobCondition::Succeeded => {
            collect_metrics(&ctx, &trial, &mut status).await?;
            if observed_objective(&trial, &status) {
                status.transition(TrialPhase::Succeeded, reasons::SUCCEEDED, "Trial has succeeded");
                publish(
                    &ctx,
                    &trial,
                    EventType::Normal,
                    event_reasons::TRIAL_SUCCEEDED,
                    None,
                )
                .await;
                Action::await_change()
            } else {
                info!("job succeeded but objective metric is not reported yet");
                if status.phase != TrialPhase::Running {
                    status.transition(TrialPhase::Running, reasons::RUNNING, "Trial is running");
                }
                set_condition(
                    &mut status.conditions,
                    Condition::new(
                        reasons::METRICS_UNAVAILABLE,
                        ConditionStatus::True,
                        reasons::METRICS_UNAVAILABLE,
                        format!(
                            "Job succeeded but metric '{}' was not reported",
                            trial.spec.objective.objective_metric_name
                        ),
                    ),
                );
                Action::requeue(METRICS_REQUEUE)
            }
        }
        JobCondition::Failed => {
            status.transition(TrialPhase::Failed, reasons::FAILED, "Trial has failed");
            publish(&ctx, &trial, EventType::Warning, event_reasons::TRIAL_FAILED, None).await;
            Action::await_change()
        }
        JobCondition::Running => {
            if status.phase != TrialPhase::Running {
                status.transition(TrialPhase::Running, reasons::RUNNING, "Trial is running");
            }
            Action::requeue(RUNNING_REQUEUE)
        }
    };

    if current.as_ref() != Some(&status) {
        ctx.kube.patch_status(&namespace, &name, &status).await?;
    }
    Ok(action)
}

/// Requeue strategy for failed reconciles
pub fn error_policy(trial: Arc<Trial>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(?error, trial = %trial.name_any(), "reconciliation failed");
    requeue_for(error)
}

/// Decode the run spec and stamp identity, ownership and labels onto it
pub fn desired_job<'a>(
    trial: &Trial,
    providers: &'a JobProviderRegistry,
) -> Result<(&'a JobProvider, DynamicObject), Error> {
    let value: serde_json::Value = serde_yaml::from_str(&trial.spec.run_spec)
        .map_err(|e| Error::validation(format!("runSpec is not valid YAML: {e}")))?;
    let mut job: DynamicObject = serde_json::from_value(value)
        .map_err(|e| Error::validation(format!("runSpec is not a Kubernetes object: {e}")))?;

    let kind = job
        .types
        .as_ref()
        .map(|t| t.kind.clone())
        .ok_or_else(|| Error::validation("runSpec has no kind"))?;
    let provider = providers.get(&kind)?;

    let container = provider.training_container(&job, trial.spec.primary_container_name.as_deref());
    if container.is_none() {
        return Err(Error::validation(format!(
            "{kind} manifest has no training container"
        )));
    }

    let owner = trial
        .controller_owner_ref(&())
        .ok_or_else(|| Error::validation("trial has no uid"))?;
    job.metadata.name = Some(trial.name_any());
    job.metadata.namespace = trial.namespace();
    job.metadata.owner_references = Some(vec![owner]);

    let labels = job.metadata.labels.get_or_insert_with(BTreeMap::new);
    labels.insert(TRIAL_LABEL.to_string(), trial.name_any());
    if let Some(experiment) = trial.experiment_name() {
        labels.insert(EXPERIMENT_LABEL.to_string(), experiment.to_string());
    }

    Ok((provider, job))
}

/// Read every metric log and merge reduced values into the observation
async fn collect_metrics(
    ctx: &Context,
    trial: &Trial,
    status: &mut TrialStatus,
) -> Result<(), Error> {
    let name = trial.name_any();
    let start = status.start_time;
    let end = Some(Utc::now());
    let observation = status.observation.get_or_insert_with(Observation::default);

    for metric in trial.spec.objective.all_metric_names() {
        let samples = ctx
            .observations
            .metric_log(&name, &metric, start, end)
            .await?;
        match reduce(&metric, &samples) {
            Some(reduced) => observation.merge(reduced),
            None => debug!(%metric, "no samples reported"),
        }
    }

    if observation.metrics.is_empty() {
        status.observation = None;
    }
    Ok(())
}

fn observed_objective(trial: &Trial, status: &TrialStatus) -> bool {
    status
        .observation
        .as_ref()
        .and_then(|o| o.metric(&trial.spec.objective.objective_metric_name))
        .is_some()
}

async fn publish(
    ctx: &Context,
    trial: &Trial,
    type_: EventType,
    reason: &str,
    note: Option<String>,
) {
    ctx.events
        .publish(&trial.object_ref(&()), type_, reason, actions::RECONCILE, note)
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ObjectiveSpec, ParameterAssignment, TrialSpec};
    use crate::observation::{MetricSample, MockObservationStore};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::sync::Mutex;

    const JOB: &str = r#"apiVersion: batch/v1
kind: Job
metadata:
  name: ignored
spec:
  template:
    spec:
      restartPolicy: Never
      containers:
        - name: training
          image: trainer:latest
"#;

    fn trial(run_spec: &str, status: Option<TrialStatus>) -> Trial {
        Trial {
            metadata: ObjectMeta {
                name: Some("exp-a".to_string()),
                namespace: Some("research".to_string()),
                uid: Some("trial-uid".to_string()),
                labels: Some(BTreeMap::from([(
                    EXPERIMENT_LABEL.to_string(),
                    "exp".to_string(),
                )])),
                ..Default::default()
            },
            spec: TrialSpec {
                parameter_assignments: vec![ParameterAssignment::new("lr", "0.05")],
                objective: ObjectiveSpec {
                    objective_metric_name: "loss".to_string(),
                    additional_metric_names: vec!["accuracy".to_string()],
                    ..Default::default()
                },
                run_spec: run_spec.to_string(),
                primary_container_name: None,
                retain_run: false,
            },
            status,
        }
    }

    fn created() -> Option<TrialStatus> {
        let mut status = TrialStatus::default();
        status.start_time = Some(Utc::now());
        status.transition(TrialPhase::Created, reasons::CREATED, "Trial is created");
        Some(status)
    }

    fn job_with_status(job_status: serde_json::Value) -> DynamicObject {
        let t = trial(JOB, created());
        let registry = JobProviderRegistry::with_defaults(false);
        let (_, mut job) = desired_job(&t, &registry).unwrap();
        job.data["status"] = job_status;
        job
    }

    #[derive(Clone, Default)]
    struct StatusCapture {
        updates: Arc<Mutex<Vec<TrialStatus>>>,
        created_jobs: Arc<Mutex<Vec<DynamicObject>>>,
        deleted_jobs: Arc<Mutex<Vec<String>>>,
    }

    impl StatusCapture {
        fn last(&self) -> Option<TrialStatus> {
            self.updates.lock().unwrap().last().cloned()
        }
    }

    fn mock_context(
        job: Option<DynamicObject>,
        samples: Vec<(&'static str, Vec<&'static str>)>,
    ) -> (Arc<Context>, StatusCapture) {
        let capture = StatusCapture::default();
        let mut kube = MockKubeClient::new();
        kube.expect_get_job().returning(move |_, _, _| Ok(job.clone()));
        let c = capture.clone();
        kube.expect_create_job().returning(move |_, _, job| {
            c.created_jobs.lock().unwrap().push(job.clone());
            Ok(())
        });
        let c = capture.clone();
        kube.expect_delete_job().returning(move |_, name, _| {
            c.deleted_jobs.lock().unwrap().push(name.to_string());
            Ok(())
        });
        let c = capture.clone();
        kube.expect_patch_status().returning(move |_, _, status| {
            c.updates.lock().unwrap().push(status.clone());
            Ok(())
        });

        let mut store = MockObservationStore::new();
        store.expect_metric_log().returning(move |_, metric, _, _| {
            Ok(samples
                .iter()
                .find(|(name, _)| *name == metric)
                .map(|(_, values)| {
                    values
                        .iter()
                        .map(|v| MetricSample {
                            timestamp: "2026-01-01T00:00:00Z".to_string(),
                            value: v.to_string(),
                        })
                        .collect()
                })
                .unwrap_or_default())
        });

        (
            Arc::new(Context::for_testing(Arc::new(kube), Arc::new(store))),
            capture,
        )
    }

    #[test]
    fn test_desired_job_is_owned_and_labelled() {
        let t = trial(JOB, created());
        let registry = JobProviderRegistry::with_defaults(false);
        let (provider, job) = desired_job(&t, &registry).unwrap();
        assert_eq!(provider.kind(), "Job");
        assert_eq!(job.metadata.name.as_deref(), Some("exp-a"));
        assert_eq!(job.metadata.namespace.as_deref(), Some("research"));
        let owner = &job.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.uid, "trial-uid");
        assert_eq!(owner.controller, Some(true));
        let labels = job.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[TRIAL_LABEL], "exp-a");
        assert_eq!(labels[EXPERIMENT_LABEL], "exp");
    }

    #[test]
    fn test_primary_container_must_exist() {
        let mut t = trial(JOB, created());
        t.spec.primary_container_name = Some("trainer".to_string());
        let err = desired_job(&t, &JobProviderRegistry::with_defaults(false)).unwrap_err();
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn story_new_trial_is_marked_created() {
        let (ctx, capture) = mock_context(None, vec![]);
        let action = reconcile(Arc::new(trial(JOB, None)), ctx).await.unwrap();
        assert_eq!(action, Action::requeue(INITIAL_REQUEUE));
        assert_eq!(capture.last().unwrap().phase, TrialPhase::Created);
    }

    #[tokio::test]
    async fn story_missing_job_is_created_and_trial_runs() {
        let (ctx, capture) = mock_context(None, vec![]);
        reconcile(Arc::new(trial(JOB, created())), ctx).await.unwrap();

        assert_eq!(capture.created_jobs.lock().unwrap().len(), 1);
        assert_eq!(capture.last().unwrap().phase, TrialPhase::Running);
    }

    #[tokio::test]
    async fn story_unsupported_kind_fails_the_trial() {
        let spec = "apiVersion: kubeflow.org/v1\nkind: MPIJob\nspec: {}\n";
        let (ctx, capture) = mock_context(None, vec![]);
        let action = reconcile(Arc::new(trial(spec, created())), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        let status = capture.last().unwrap();
        assert_eq!(status.phase, TrialPhase::Failed);
        assert!(status.message.unwrap().contains("MPIJob"));
        assert!(capture.created_jobs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn story_succeeded_job_with_metrics_succeeds_the_trial() {
        let job = job_with_status(serde_json::json!({"active": 0, "succeeded": 1}));
        let (ctx, capture) = mock_context(
            Some(job),
            vec![("loss", vec!["0.9", "0.3", "0.4"]), ("accuracy", vec!["0.8"])],
        );

        let action = reconcile(Arc::new(trial(JOB, created())), ctx).await.unwrap();

        assert_eq!(action, Action::await_change());
        let status = capture.last().unwrap();
        assert_eq!(status.phase, TrialPhase::Succeeded);
        assert!(status.completion_time.is_some());
        let observation = status.observation.unwrap();
        let loss = observation.metric("loss").unwrap();
        assert_eq!((loss.min, loss.max, loss.latest), (0.3, 0.9, 0.4));
        assert!(observation.metric("accuracy").is_some());
    }

    #[tokio::test]
    async fn story_succeeded_job_without_metric_does_not_succeed() {
        let job = job_with_status(serde_json::json!({"active": 0, "succeeded": 1}));
        let (ctx, capture) = mock_context(Some(job), vec![("accuracy", vec!["0.8"])]);

        let action = reconcile(Arc::new(trial(JOB, created())), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(METRICS_REQUEUE));
        let status = capture.last().unwrap();
        assert_ne!(status.phase, TrialPhase::Succeeded);
        assert!(status.completion_time.is_none());
        assert!(trial(JOB, Some(status)).is_metrics_unavailable());
    }

    #[tokio::test]
    async fn story_failed_job_fails_the_trial() {
        let job = job_with_status(serde_json::json!({"failed": 1}));
        let (ctx, capture) = mock_context(Some(job), vec![]);

        reconcile(Arc::new(trial(JOB, created())), ctx).await.unwrap();

        let status = capture.last().unwrap();
        assert_eq!(status.phase, TrialPhase::Failed);
        assert!(status.completion_time.is_some());
    }

    #[tokio::test]
    async fn story_completed_trial_deletes_its_job() {
        let job = job_with_status(serde_json::json!({"failed": 1}));
        let mut status = created().unwrap();
        status.transition(TrialPhase::Failed, reasons::FAILED, "Trial has failed");
        let (ctx, capture) = mock_context(Some(job), vec![]);

        reconcile(Arc::new(trial(JOB, Some(status))), ctx).await.unwrap();

        assert_eq!(*capture.deleted_jobs.lock().unwrap(), vec!["exp-a"]);
        assert!(capture.last().is_none());
    }

    #[tokio::test]
    async fn story_retained_job_survives_completion() {
        let job = job_with_status(serde_json::json!({"failed": 1}));
        let mut status = created().unwrap();
        status.transition(TrialPhase::Failed, reasons::FAILED, "Trial has failed");
        let mut t = trial(JOB, Some(status));
        t.spec.retain_run = true;
        let (ctx, capture) = mock_context(Some(job), vec![]);

        reconcile(Arc::new(t), ctx).await.unwrap();

        assert!(capture.deleted_jobs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn story_running_job_is_not_rewritten() {
        let job = job_with_status(serde_json::json!({"active": 1}));
        let mut status = created().unwrap();
        status.transition(TrialPhase::Running, reasons::RUNNING, "Trial is running");
        let (ctx, capture) = mock_context(Some(job), vec![]);

        let action = reconcile(Arc::new(trial(JOB, Some(status))), ctx).await.unwrap();

        assert_eq!(action, Action::requeue(RUNNING_REQUEUE));
        assert!(capture.last().is_none());
    }
}
