//! Experiment controller
//!
//! Keeps the number of active Trials at `parallelTrialCount`, asks the
//! Suggestion for one assignment per admitted Trial, and decides when the
//! Experiment is done.
//!
//! The Suggestion is a producer/consumer channel: this controller only ever
//! raises `spec.requests`, and consumes `status.suggestions` positionally.

mod admission;
#[cfg(test)]
pub(crate) mod fixtures;
mod tally;

pub use admission::{plan, Admission};
pub use tally::{completion, is_restartable, Completion, TrialTally};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::crd::{
    experiment_reasons as reasons, trial_reasons, Experiment, ExperimentPhase, ExperimentStatus,
    Suggestion, SuggestionSpec, Trial, TrialAssignment, TrialPhase, TrialSpec, TrialStatus,
    EXPERIMENT_LABEL,
};
use crate::events::{actions, reasons as event_reasons, EventPublisher, KubeEventPublisher};
use crate::template::{ManifestRenderer, TrialTemplateRenderer};
use crate::{Error, FIELD_MANAGER};

use super::requeue_for;
use tally::creation_order;

/// Kubernetes operations needed by the Experiment controller
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Trials labelled with the experiment's name
    async fn list_trials(&self, namespace: &str, experiment: &str) -> Result<Vec<Trial>, Error>;

    /// Get a Suggestion, `None` if absent
    async fn get_suggestion(&self, namespace: &str, name: &str)
        -> Result<Option<Suggestion>, Error>;

    /// Create a Suggestion, returning the stored object
    ///
    /// If it already exists the existing object is returned.
    async fn create_suggestion(
        &self,
        namespace: &str,
        suggestion: &Suggestion,
    ) -> Result<Suggestion, Error>;

    /// Raise `spec.requests`
    async fn patch_suggestion_requests(
        &self,
        namespace: &str,
        name: &str,
        requests: u32,
    ) -> Result<(), Error>;

    /// Set `spec.experimentCompleted`
    async fn set_suggestion_completed(
        &self,
        namespace: &str,
        name: &str,
        completed: bool,
    ) -> Result<(), Error>;

    /// Create a Trial; an existing Trial with the same name is left alone
    async fn create_trial(&self, namespace: &str, trial: &Trial) -> Result<(), Error>;

    /// Write a Trial's status
    async fn patch_trial_status(
        &self,
        namespace: &str,
        name: &str,
        status: &TrialStatus,
    ) -> Result<(), Error>;

    /// Delete a Trial; absent Trials are ignored
    async fn delete_trial(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Write the Experiment's status
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &ExperimentStatus,
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

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn list_trials(&self, namespace: &str, experiment: &str) -> Result<Vec<Trial>, Error> {
        let api: Api<Trial> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&format!("{EXPERIMENT_LABEL}={experiment}"));
        Ok(api.list(&lp).await?.items)
    }

    async fn get_suggestion(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Suggestion>, Error> {
        let api: Api<Suggestion> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_suggestion(
        &self,
        namespace: &str,
        suggestion: &Suggestion,
    ) -> Result<Suggestion, Error> {
        let api: Api<Suggestion> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), suggestion).await {
            Ok(created) => Ok(created),
            Err(e) => {
                let err = Error::from(e);
                if err.is_already_exists() {
                    Ok(api.get(&suggestion.name_any()).await?)
                } else {
                    Err(err)
                }
            }
        }
    }

    async fn patch_suggestion_requests(
        &self,
        namespace: &str,
        name: &str,
        requests: u32,
    ) -> Result<(), Error> {
        let api: Api<Suggestion> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({"spec": {"requests": requests}});
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn set_suggestion_completed(
        &self,
        namespace: &str,
        name: &str,
        completed: bool,
    ) -> Result<(), Error> {
        let api: Api<Suggestion> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({"spec": {"experimentCompleted": completed}});
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn create_trial(&self, namespace: &str, trial: &Trial) -> Result<(), Error> {
        let api: Api<Trial> = Api::namespaced(self.client.clone(), namespace);
        match api.create(&PostParams::default(), trial).await {
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

    async fn patch_trial_status(
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

    async fn delete_trial(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<Trial> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &Default::default()).await {
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
        status: &ExperimentStatus,
    ) -> Result<(), Error> {
        let api: Api<Experiment> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "apiVersion": "hypertune.dev/v1alpha1",
            "kind": "Experiment",
            "metadata": {"name": name},
            "status": status
        });
        api.patch_status(name, &PatchParams::apply(FIELD_MANAGER).force(), &Patch::Apply(&patch))
            .await?;
        Ok(())
    }
}

/// Shared state for Experiment reconciles
pub struct Context {
    /// Kubernetes client for API operations (trait object for testability)
    pub kube: Arc<dyn KubeClient>,
    /// Renders trial job manifests
    pub renderer: Arc<dyn TrialTemplateRenderer>,
    /// Event publisher
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Create a builder for constructing a Context
    pub fn builder(client: Client) -> ContextBuilder {
        ContextBuilder::new(client)
    }

    /// Create a context for testing with custom mock clients
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn KubeClient>,
        renderer: Arc<dyn TrialTemplateRenderer>,
    ) -> Self {
        Self {
            kube,
            renderer,
            events: Arc::new(crate::events::NoopEventPublisher),
        }
    }
}

/// Builder for constructing [`Context`] instances
pub struct ContextBuilder {
    client: Client,
    kube: Option<Arc<dyn KubeClient>>,
    renderer: Option<Arc<dyn TrialTemplateRenderer>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl ContextBuilder {
    fn new(client: Client) -> Self {
        Self {
            client,
            kube: None,
            renderer: None,
            events: None,
        }
    }

    /// Override the Kubernetes client (primarily for testing)
    pub fn kube_client(mut self, kube: Arc<dyn KubeClient>) -> Self {
        self.kube = Some(kube);
        self
    }

    /// Override the trial template renderer
    pub fn renderer(mut self, renderer: Arc<dyn TrialTemplateRenderer>) -> Self {
        self.renderer = Some(renderer);
        self
    }

    /// Override the event publisher
    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the Context
    pub fn build(self) -> Result<Context, Error> {
        let renderer = match self.renderer {
            Some(r) => r,
            None => Arc::new(ManifestRenderer::new()?),
        };
        Ok(Context {
            kube: self
                .kube
                .unwrap_or_else(|| Arc::new(KubeClientImpl::new(self.client.clone()))),
            renderer,
            events: self.events.unwrap_or_else(|| {
                Arc::new(KubeEventPublisher::new(
                    self.client.clone(),
                    "hypertune-experiment-controller",
                ))
            }),
        })
    }
}

/// Requeue after creating the initial status
const INITIAL_REQUEUE: Duration = Duration::from_secs(1);
/// Periodic resync for running experiments
const RUNNING_REQUEUE: Duration = Duration::from_secs(60);

/// Reconcile an Experiment
#[instrument(skip(experiment, ctx), fields(experiment = %experiment.name_any()))]
pub async fn reconcile(experiment: Arc<Experiment>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = experiment.name_any();
    let namespace = experiment
        .namespace()
        .ok_or_else(|| Error::validation("experiment must be namespaced"))?;
    let current = experiment.status.clone();
    let mut status = current.clone().unwrap_or_default();

    if let Err(e) = experiment.spec.validate() {
        if status.phase != ExperimentPhase::Failed {
            warn!(error = %e, "experiment validation failed");
            status.transition(ExperimentPhase::Failed, reasons::VALIDATION_FAILED, e.to_string());
            publish(
                &ctx,
                &experiment,
                EventType::Warning,
                event_reasons::VALIDATION_FAILED,
                Some(e.to_string()),
            )
            .await;
        }
        persist(&ctx, &namespace, &name, current.as_ref(), &status).await?;
        return Ok(Action::await_change());
    }

    if current.is_none() {
        status.start_time = Some(chrono::Utc::now());
        status.transition(
            ExperimentPhase::Created,
            reasons::CREATED,
            "Experiment is created",
        );
        ctx.kube.patch_status(&namespace, &name, &status).await?;
        publish(
            &ctx,
            &experiment,
            EventType::Normal,
            event_reasons::EXPERIMENT_STARTED,
            None,
        )
        .await;
        info!("experiment created");
        return Ok(Action::requeue(INITIAL_REQUEUE));
    }

    if status.phase.is_completed() {
        if !is_restartable(&experiment.spec, &status) {
            ensure_suggestion_completed(&ctx, &namespace, &name).await?;
            return Ok(Action::await_change());
        }
        info!("budget raised, restarting experiment");
        status.transition(
            ExperimentPhase::Restarting,
            reasons::RESTARTING,
            "Experiment is restarting",
        );
        if let Some(s) = ctx.kube.get_suggestion(&namespace, &name).await? {
            if s.spec.experiment_completed {
                ctx.kube
                    .set_suggestion_completed(&namespace, &name, false)
                    .await?;
            }
        }
        publish(
            &ctx,
            &experiment,
            EventType::Normal,
            event_reasons::EXPERIMENT_RESTARTED,
            None,
        )
        .await;
    }

    let mut trials = ctx.kube.list_trials(&namespace, &name).await?;
    let uid = experiment.uid();
    trials.retain(|t| {
        t.owner_references().is_empty()
            || t.owner_references()
                .iter()
                .any(|o| Some(&o.uid) == uid.as_ref())
    });
    trials.sort_by(creation_order);

    let mut tally = TrialTally::from_trials(&trials, &experiment.spec.objective);
    let suggestion = ctx.kube.get_suggestion(&namespace, &name).await?;
    let exhausted = suggestion.as_ref().is_some_and(Suggestion::is_exhausted);
    let assignments = suggestion
        .as_ref()
        .map(Suggestion::assignments)
        .unwrap_or_default();

    // Read back from the object, so it already covers any killed trial it retires
    let recorded = status.assignments_consumed;
    retire_killed(&ctx, &namespace, &trials, assignments, recorded).await?;
    let mut consumed = admission::consumed(assignments, &tally, recorded);

    debug!(
        active = tally.active(),
        completed = tally.completed(),
        consumed,
        exhausted,
        "tallied trials"
    );

    if let Some(done) = completion(&experiment.spec, &tally, exhausted) {
        tally.apply(&mut status);
        status.assignments_consumed = consumed;
        let has_suggestion = suggestion.is_some();
        return complete(
            &ctx,
            &experiment,
            &namespace,
            current.as_ref(),
            status,
            done,
            has_suggestion,
        )
        .await;
    }

    let parallel = experiment.spec.parallel_trial_count;
    let mut add = match plan(
        parallel,
        experiment.spec.max_trial_count,
        tally.active(),
        tally.completed(),
    ) {
        Admission::Kill(count) => {
            kill_trials(&ctx, &experiment, &namespace, &trials, count, &mut tally).await?;
            0
        }
        Admission::Add(count) => count,
    };

    if exhausted {
        add = add.min(admission::unconsumed(assignments, consumed, &tally));
    }

    let requests = consumed + add;
    let suggestion = match suggestion {
        Some(s) => s,
        None => {
            let desired = desired_suggestion(&experiment, requests)?;
            ctx.kube.create_suggestion(&namespace, &desired).await?
        }
    };

    if suggestion.is_failed() {
        let reason = suggestion
            .status
            .as_ref()
            .and_then(|s| s.message.clone())
            .unwrap_or_else(|| "suggestion failed".to_string());
        tally.apply(&mut status);
        status.assignments_consumed = consumed;
        let done = Completion {
            phase: ExperimentPhase::Failed,
            reason: reasons::SUGGESTION_FAILED,
            message: format!("Suggestion failed: {reason}"),
        };
        return complete(&ctx, &experiment, &namespace, current.as_ref(), status, done, true).await;
    }

    if requests > suggestion.spec.requests {
        debug!(from = suggestion.spec.requests, to = requests, "raising suggestion requests");
        ctx.kube
            .patch_suggestion_requests(&namespace, &name, requests)
            .await?;
    }

    let picked: Vec<(u32, TrialAssignment)> =
        admission::new_assignments(suggestion.assignments(), consumed, &tally, add)
            .into_iter()
            .map(|(position, a)| (position, a.clone()))
            .collect();
    for (position, assignment) in picked {
        create_trial(&ctx, &experiment, &namespace, &assignment, &mut tally).await?;
        consumed = consumed.max(position + 1);
    }

    tally.apply(&mut status);
    status.assignments_consumed = consumed;
    status.transition(
        ExperimentPhase::Running,
        reasons::RUNNING,
        "Experiment is running",
    );
    persist(&ctx, &namespace, &name, current.as_ref(), &status).await?;

    Ok(Action::requeue(RUNNING_REQUEUE))
}

/// Requeue strategy for failed reconciles
pub fn error_policy(experiment: Arc<Experiment>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        experiment = %experiment.name_any(),
        "reconciliation failed"
    );
    requeue_for(error)
}

async fn persist(
    ctx: &Context,
    namespace: &str,
    name: &str,
    current: Option<&ExperimentStatus>,
    status: &ExperimentStatus,
) -> Result<(), Error> {
    if current == Some(status) {
        return Ok(());
    }
    ctx.kube.patch_status(namespace, name, status).await
}

async fn publish(
    ctx: &Context,
    experiment: &Experiment,
    type_: EventType,
    reason: &str,
    note: Option<String>,
) {
    let reference: ObjectReference = experiment.object_ref(&());
    ctx.events
        .publish(&reference, type_, reason, actions::RECONCILE, note)
        .await;
}

async fn ensure_suggestion_completed(
    ctx: &Context,
    namespace: &str,
    name: &str,
) -> Result<(), Error> {
    if let Some(s) = ctx.kube.get_suggestion(namespace, name).await? {
        if !s.spec.experiment_completed {
            ctx.kube.set_suggestion_completed(namespace, name, true).await?;
        }
    }
    Ok(())
}

async fn complete(
    ctx: &Context,
    experiment: &Experiment,
    namespace: &str,
    current: Option<&ExperimentStatus>,
    mut status: ExperimentStatus,
    done: Completion,
    has_suggestion: bool,
) -> Result<Action, Error> {
    let name = experiment.name_any();
    info!(phase = %done.phase, reason = done.reason, "experiment completed");
    status.transition(done.phase.clone(), done.reason, &done.message);
    if has_suggestion {
        ensure_suggestion_completed(ctx, namespace, &name).await?;
    }
    persist(ctx, namespace, &name, current, &status).await?;

    let type_ = if done.phase == ExperimentPhase::Failed {
        EventType::Warning
    } else {
        EventType::Normal
    };
    publish(
        ctx,
        experiment,
        type_,
        event_reasons::EXPERIMENT_COMPLETED,
        Some(done.message),
    )
    .await;
    Ok(Action::await_change())
}

async fn kill_trials(
    ctx: &Context,
    experiment: &Experiment,
    namespace: &str,
    trials: &[Trial],
    count: u32,
    tally: &mut TrialTally,
) -> Result<(), Error> {
    let victims = admission::victims(trials, count);
    info!(victims = ?admission::names(&victims), "killing trials above parallelism");

    for trial in victims {
        let trial_name = trial.name_any();
        let mut trial_status = trial.status.clone().unwrap_or_default();
        trial_status.transition(
            TrialPhase::Killed,
            trial_reasons::KILLED,
            "Trial killed to honour parallelTrialCount",
        );
        ctx.kube
            .patch_trial_status(namespace, &trial_name, &trial_status)
            .await?;
        tally.mark_killed(&trial_name);
        publish(
            ctx,
            experiment,
            EventType::Normal,
            event_reasons::TRIAL_KILLED,
            Some(trial_name),
        )
        .await;
    }
    Ok(())
}

/// Delete killed trials whose positions the stored status already records
async fn retire_killed(
    ctx: &Context,
    namespace: &str,
    trials: &[Trial],
    assignments: &[TrialAssignment],
    recorded: u32,
) -> Result<(), Error> {
    for trial in admission::retired(trials, assignments, recorded) {
        let trial_name = trial.name_any();
        ctx.kube.delete_trial(namespace, &trial_name).await?;
        debug!(trial = %trial_name, "deleted killed trial");
    }
    Ok(())
}

async fn create_trial(
    ctx: &Context,
    experiment: &Experiment,
    namespace: &str,
    assignment: &TrialAssignment,
    tally: &mut TrialTally,
) -> Result<(), Error> {
    let run_spec = match ctx.renderer.render(
        experiment,
        &assignment.name,
        &assignment.parameter_assignments,
    ) {
        Ok(rendered) => rendered,
        Err(e) => {
            warn!(trial = %assignment.name, error = %e, "failed to render trial template");
            let reference = experiment.object_ref(&());
            ctx.events
                .publish(
                    &reference,
                    EventType::Warning,
                    event_reasons::TEMPLATE_FAILED,
                    actions::RENDER,
                    Some(format!("{}: {e}", assignment.name)),
                )
                .await;
            return Ok(());
        }
    };

    let trial = desired_trial(experiment, assignment, run_spec)?;
    ctx.kube.create_trial(namespace, &trial).await?;
    tally.mark_created(&assignment.name);
    info!(trial = %assignment.name, "created trial");
    publish(
        ctx,
        experiment,
        EventType::Normal,
        event_reasons::TRIAL_CREATED,
        Some(assignment.name.clone()),
    )
    .await;
    Ok(())
}

fn owner_labels(experiment: &Experiment) -> BTreeMap<String, String> {
    BTreeMap::from([(EXPERIMENT_LABEL.to_string(), experiment.name_any())])
}

fn desired_suggestion(experiment: &Experiment, requests: u32) -> Result<Suggestion, Error> {
    let owner = experiment
        .controller_owner_ref(&())
        .ok_or_else(|| Error::validation("experiment has no uid"))?;
    let mut suggestion = Suggestion::new(
        &experiment.name_any(),
        SuggestionSpec {
            algorithm: experiment.spec.algorithm.clone(),
            requests,
            resume_policy: experiment.spec.resume_policy,
            experiment_completed: false,
        },
    );
    suggestion.metadata.namespace = experiment.namespace();
    suggestion.metadata.labels = Some(owner_labels(experiment));
    suggestion.metadata.owner_references = Some(vec![owner]);
    Ok(suggestion)
}

fn desired_trial(
    experiment: &Experiment,
    assignment: &TrialAssignment,
    run_spec: String,
) -> Result<Trial, Error> {
    let owner = experiment
        .controller_owner_ref(&())
        .ok_or_else(|| Error::validation("experiment has no uid"))?;
    let template = &experiment.spec.trial_template;
    let mut trial = Trial::new(
        &assignment.name,
        TrialSpec {
            parameter_assignments: assignment.parameter_assignments.clone(),
            objective: experiment.spec.objective.clone(),
            run_spec,
            primary_container_name: template.primary_container_name.clone(),
            retain_run: template.retain,
        },
    );
    trial.metadata.namespace = experiment.namespace();
    trial.metadata.labels = Some(owner_labels(experiment));
    trial.metadata.owner_references = Some(vec![owner]);
    Ok(trial)
}
