//! Algorithm Deployment and Service composition

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, GRPCAction, PodSpec, PodTemplateSpec, Probe, Service, ServicePort,
    ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};

use crate::config::SuggestionConfig;
use crate::crd::{Suggestion, EXPERIMENT_LABEL};
use crate::{Error, ALGORITHM_PORT};

/// Label selecting a Suggestion's algorithm pods
pub const SUGGESTION_LABEL: &str = "hypertune.dev/suggestion";
/// Label carrying the algorithm name
pub const ALGORITHM_LABEL: &str = "hypertune.dev/algorithm";

const CONTAINER_NAME: &str = "suggestion";
const PORT_NAME: &str = "api";

fn labels(suggestion: &Suggestion) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (SUGGESTION_LABEL.to_string(), suggestion.name_any()),
        (
            ALGORITHM_LABEL.to_string(),
            suggestion.spec.algorithm.algorithm_name.clone(),
        ),
    ]);
    if let Some(experiment) = suggestion.labels().get(EXPERIMENT_LABEL) {
        labels.insert(EXPERIMENT_LABEL.to_string(), experiment.clone());
    }
    labels
}

fn metadata(suggestion: &Suggestion) -> Result<ObjectMeta, Error> {
    let owner = suggestion
        .controller_owner_ref(&())
        .ok_or_else(|| Error::validation("suggestion has no uid"))?;
    Ok(ObjectMeta {
        name: Some(suggestion.endpoint_name()),
        namespace: suggestion.namespace(),
        labels: Some(labels(suggestion)),
        owner_references: Some(vec![owner]),
        ..Default::default()
    })
}

fn grpc_probe(initial_delay_seconds: i32) -> Probe {
    Probe {
        grpc: Some(GRPCAction {
            port: ALGORITHM_PORT,
            service: None,
        }),
        initial_delay_seconds: Some(initial_delay_seconds),
        period_seconds: Some(10),
        failure_threshold: Some(12),
        ..Default::default()
    }
}

/// Single-replica Deployment serving the algorithm
pub fn deployment(suggestion: &Suggestion, config: &SuggestionConfig) -> Result<Deployment, Error> {
    let selector = labels(suggestion);
    Ok(Deployment {
        metadata: metadata(suggestion)?,
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(selector),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: config.service_account_name.clone(),
                    containers: vec![Container {
                        name: CONTAINER_NAME.to_string(),
                        image: Some(config.image.clone()),
                        image_pull_policy: config.image_pull_policy.clone(),
                        resources: config.resources.clone(),
                        ports: Some(vec![ContainerPort {
                            name: Some(PORT_NAME.to_string()),
                            container_port: ALGORITHM_PORT,
                            protocol: Some("TCP".to_string()),
                            ..Default::default()
                        }]),
                        readiness_probe: Some(grpc_probe(10)),
                        liveness_probe: Some(grpc_probe(30)),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// ClusterIP Service in front of the algorithm Deployment
pub fn service(suggestion: &Suggestion) -> Result<Service, Error> {
    Ok(Service {
        metadata: metadata(suggestion)?,
        spec: Some(ServiceSpec {
            selector: Some(labels(suggestion)),
            ports: Some(vec![ServicePort {
                name: Some(PORT_NAME.to_string()),
                port: ALGORITHM_PORT,
                target_port: Some(IntOrString::Int(ALGORITHM_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Returns true once at least one replica is available
pub fn is_available(deployment: &Deployment) -> bool {
    deployment
        .status
        .as_ref()
        .and_then(|s| s.available_replicas)
        .is_some_and(|n| n > 0)
}

/// In-cluster address of the algorithm Service
pub fn address(suggestion: &Suggestion) -> String {
    format!(
        "{}.{}:{}",
        suggestion.endpoint_name(),
        suggestion.namespace().unwrap_or_default(),
        ALGORITHM_PORT
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{AlgorithmSpec, ResumePolicy, SuggestionSpec};
    use k8s_openapi::api::apps::v1::DeploymentStatus;

    fn suggestion() -> Suggestion {
        let mut s = Suggestion::new(
            "mnist",
            SuggestionSpec {
                algorithm: AlgorithmSpec {
                    algorithm_name: "random".to_string(),
                    algorithm_settings: vec![],
                },
                requests: 2,
                resume_policy: ResumePolicy::Never,
                experiment_completed: false,
            },
        );
        s.metadata.namespace = Some("research".to_string());
        s.metadata.uid = Some("sugg-uid".to_string());
        s.metadata.labels = Some(BTreeMap::from([(
            EXPERIMENT_LABEL.to_string(),
            "mnist".to_string(),
        )]));
        s
    }

    fn config() -> SuggestionConfig {
        SuggestionConfig {
            image: "registry.local/hypertune/random:v1".to_string(),
            image_pull_policy: Some("IfNotPresent".to_string()),
            resources: None,
            service_account_name: Some("suggestion".to_string()),
        }
    }

    #[test]
    fn test_deployment_serves_the_configured_image() {
        let d = deployment(&suggestion(), &config()).unwrap();
        assert_eq!(d.metadata.name.as_deref(), Some("mnist-random"));
        assert_eq!(d.metadata.namespace.as_deref(), Some("research"));
        assert_eq!(d.metadata.owner_references.unwrap()[0].uid, "sugg-uid");

        let spec = d.spec.unwrap();
        assert_eq!(spec.replicas, Some(1));
        let pod = spec.template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("suggestion"));
        let container = &pod.containers[0];
        assert_eq!(
            container.image.as_deref(),
            Some("registry.local/hypertune/random:v1")
        );
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 6789);
        let probe = container.readiness_probe.as_ref().unwrap();
        assert_eq!(probe.grpc.as_ref().unwrap().port, 6789);
        assert!(container.liveness_probe.is_some());
    }

    #[test]
    fn test_service_selects_the_deployment_pods() {
        let s = suggestion();
        let svc = service(&s).unwrap();
        let d = deployment(&s, &config()).unwrap();
        assert_eq!(svc.metadata.name, d.metadata.name);
        assert_eq!(
            svc.spec.unwrap().selector,
            d.spec.unwrap().selector.match_labels
        );
    }

    #[test]
    fn test_availability_needs_a_ready_replica() {
        let mut d = deployment(&suggestion(), &config()).unwrap();
        assert!(!is_available(&d));
        d.status = Some(DeploymentStatus {
            available_replicas: Some(1),
            ..Default::default()
        });
        assert!(is_available(&d));
    }

    #[test]
    fn test_address_is_namespaced() {
        assert_eq!(address(&suggestion()), "mnist-random.research:6789");
    }
}
