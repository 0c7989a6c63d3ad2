//! Job provider abstraction layer
//!
//! A job provider translates one training-job kind's native status into a
//! normalized [`JobCondition`] and identifies the container that runs the
//! training code. Providers are a closed set of variants selected by kind
//! through a [`JobProviderRegistry`], which is built once at startup and
//! handed to the Trial controller through its context.
//!
//! # Supported Kinds
//!
//! - [`BatchJobProvider`] - `batch/v1` Job
//! - [`KubeflowJobProvider`] - condition-list kinds such as TFJob and PyTorchJob

mod batch;
mod kubeflow;

pub use batch::BatchJobProvider;
pub use kubeflow::KubeflowJobProvider;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Container;
use kube::api::{ApiResource, DynamicObject};
use kube::Client;
use tracing::{info, warn};

use crate::{Error, Result};

/// Normalized status of a deployed training job
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobCondition {
    /// Still running, or in any state that is neither success nor failure
    Running,
    /// Completed successfully
    Succeeded,
    /// Completed unsuccessfully
    Failed,
}

impl std::fmt::Display for JobCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// A supported training-job kind
#[derive(Clone, Debug)]
pub enum JobProvider {
    /// Kubernetes batch Job
    Batch(BatchJobProvider),
    /// Job kind reporting a Kubeflow-style condition list
    Kubeflow(KubeflowJobProvider),
}

impl JobProvider {
    /// Kind string this provider handles
    pub fn kind(&self) -> &str {
        match self {
            Self::Batch(_) => BatchJobProvider::KIND,
            Self::Kubeflow(p) => p.kind(),
        }
    }

    /// `group/version` of the kind
    pub fn api_version(&self) -> &str {
        match self {
            Self::Batch(_) => BatchJobProvider::API_VERSION,
            Self::Kubeflow(p) => p.api_version(),
        }
    }

    /// API resource used for dynamic access to jobs of this kind
    pub fn api_resource(&self) -> ApiResource {
        build_api_resource(self.api_version(), self.kind())
    }

    /// Normalized condition of a deployed job
    pub fn status(&self, job: &DynamicObject) -> JobCondition {
        match self {
            Self::Batch(p) => p.status(job),
            Self::Kubeflow(p) => p.status(job),
        }
    }

    /// Returns true if the container at `index` runs the training code
    pub fn is_training_container(&self, index: usize, container: &Container) -> bool {
        match self {
            Self::Batch(p) => p.is_training_container(index, container),
            Self::Kubeflow(p) => p.is_training_container(index, container),
        }
    }

    /// Pod template containers declared by the job
    pub fn containers(&self, job: &DynamicObject) -> Vec<Container> {
        match self {
            Self::Batch(p) => p.containers(job),
            Self::Kubeflow(p) => p.containers(job),
        }
    }

    /// Name of the training container
    ///
    /// An explicit `primary` name wins over the kind's own rule.
    pub fn training_container(&self, job: &DynamicObject, primary: Option<&str>) -> Option<String> {
        let containers = self.containers(job);
        match primary {
            Some(name) => containers
                .iter()
                .find(|c| c.name == name)
                .map(|c| c.name.clone()),
            None => containers
                .iter()
                .enumerate()
                .find(|(i, c)| self.is_training_container(*i, c))
                .map(|(_, c)| c.name.clone()),
        }
    }
}

/// Lookup of job providers by kind
#[derive(Clone, Debug, Default)]
pub struct JobProviderRegistry {
    providers: BTreeMap<String, JobProvider>,
}

impl JobProviderRegistry {
    /// Registry with no providers
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with Job, TFJob and PyTorchJob
    ///
    /// With `require_true_condition`, condition-list kinds only honour the
    /// last condition whose status is "True".
    pub fn with_defaults(require_true_condition: bool) -> Self {
        let mut registry = Self::new();
        registry.register(JobProvider::Batch(BatchJobProvider));
        registry.register(JobProvider::Kubeflow(
            KubeflowJobProvider::tfjob().require_true_condition(require_true_condition),
        ));
        registry.register(JobProvider::Kubeflow(
            KubeflowJobProvider::pytorchjob().require_true_condition(require_true_condition),
        ));
        registry
    }

    /// Add or replace the provider for its kind
    pub fn register(&mut self, provider: JobProvider) {
        self.providers.insert(provider.kind().to_string(), provider);
    }

    /// Look up the provider for `kind`
    pub fn get(&self, kind: &str) -> Result<&JobProvider> {
        self.providers
            .get(kind)
            .ok_or_else(|| Error::unsupported_job_kind(kind))
    }

    /// Registered providers, ordered by kind
    pub fn providers(&self) -> impl Iterator<Item = &JobProvider> {
        self.providers.values()
    }

    /// Resolve the registered kinds that are installed in the cluster
    ///
    /// Kinds whose CRD is missing are skipped so the Trial controller does
    /// not watch resources that cannot exist.
    pub async fn discover_installed(&self, client: Client) -> Vec<ApiResource> {
        use kube::discovery::Discovery;

        let discovery = match Discovery::new(client).run().await {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "API discovery failed, watching batch Jobs only");
                return vec![BatchJobProvider::api_resource()];
            }
        };

        let mut found = Vec::new();
        for provider in self.providers() {
            let (group, _) = parse_api_version(provider.api_version());
            let resolved = discovery
                .groups()
                .filter(|g| g.name() == group)
                .flat_map(|g| g.resources_by_stability())
                .find(|(ar, _)| ar.kind == provider.kind())
                .map(|(ar, _)| ar);
            match resolved {
                Some(ar) => {
                    info!(kind = %ar.kind, api_version = %ar.api_version, "job kind installed");
                    found.push(ar);
                }
                None => {
                    warn!(kind = %provider.kind(), "job kind not installed, not watching");
                }
            }
        }
        found
    }
}

/// Split `group/version` into its parts; core resources have an empty group
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build an ApiResource from apiVersion and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: format!("{}s", kind.to_lowercase()),
    }
}

/// Decode pod template containers at the given JSON pointer
fn containers_at(job: &DynamicObject, pointer: &str) -> Vec<Container> {
    job.data
        .pointer(pointer)
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default()
}
