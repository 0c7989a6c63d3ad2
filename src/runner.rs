//! Controller runner - builds controller futures for each resource kind
//!
//! Each `build_*` function returns a Vec of boxed futures that the binary
//! joins. Construction stays separate from execution so `main` only decides
//! which controllers to run.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use kube::api::{ApiResource, DynamicObject};
use kube::runtime::controller::Config as ControllerConfig;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use crate::algorithm::AlgorithmClient;
use crate::config::OperatorConfig;
use crate::controller::{experiment, suggestion, trial};
use crate::crd::{Experiment, Suggestion, Trial};
use crate::observation::ObservationStore;
use crate::provider::JobProviderRegistry;
use crate::Error;

/// Watcher timeout (seconds), below the client read timeout (30s) so idle
/// watches are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Boxed controller future
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

fn controller_config(workers: u16) -> ControllerConfig {
    ControllerConfig::default().concurrency(workers)
}

/// Build the Experiment controller; it owns Trials and Suggestions
pub fn build_experiment_controllers(
    client: Client,
    workers: u16,
) -> Result<Vec<ControllerFuture>, Error> {
    let ctx = Arc::new(experiment::Context::builder(client.clone()).build()?);
    let experiments: Api<Experiment> = Api::all(client.clone());

    tracing::info!("- Experiment controller");

    Ok(vec![Box::pin(
        Controller::new(experiments, watcher())
            .with_config(controller_config(workers))
            .owns(Api::<Trial>::all(client.clone()), watcher())
            .owns(Api::<Suggestion>::all(client), watcher())
            .shutdown_on_signal()
            .run(experiment::reconcile, experiment::error_policy, ctx)
            .for_each(log_reconcile_result("Experiment")),
    )])
}

/// Build the Trial controller; it owns every installed job kind
pub fn build_trial_controllers(
    client: Client,
    workers: u16,
    providers: Arc<JobProviderRegistry>,
    installed: Vec<ApiResource>,
    observations: Arc<dyn ObservationStore>,
) -> Vec<ControllerFuture> {
    let ctx = Arc::new(trial::Context::new(client.clone(), providers, observations));
    let trials: Api<Trial> = Api::all(client.clone());

    let mut controller = Controller::new(trials, watcher()).with_config(controller_config(workers));
    for resource in &installed {
        tracing::info!(kind = %resource.kind, "  owns {}", resource.api_version);
        controller = controller.owns_with(
            Api::<DynamicObject>::all_with(client.clone(), resource),
            resource.clone(),
            watcher(),
        );
    }

    tracing::info!("- Trial controller");

    vec![Box::pin(
        controller
            .shutdown_on_signal()
            .run(trial::reconcile, trial::error_policy, ctx)
            .for_each(log_reconcile_result("Trial")),
    )]
}

/// Build the Suggestion controller; it owns algorithm Deployments and Services
pub fn build_suggestion_controllers(
    client: Client,
    workers: u16,
    config: Arc<OperatorConfig>,
    algorithm: Arc<dyn AlgorithmClient>,
) -> Vec<ControllerFuture> {
    let ctx = Arc::new(suggestion::Context::new(client.clone(), config, algorithm));
    let suggestions: Api<Suggestion> = Api::all(client.clone());

    tracing::info!("- Suggestion controller");

    vec![Box::pin(
        Controller::new(suggestions, watcher())
            .with_config(controller_config(workers))
            .owns(Api::<Deployment>::all(client.clone()), watcher())
            .owns(Api::<Service>::all(client), watcher())
            .shutdown_on_signal()
            .run(suggestion::reconcile, suggestion::error_policy, ctx)
            .for_each(log_reconcile_result("Suggestion")),
    )]
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
