//! Operator configuration
//!
//! Maps algorithm names to the image and pod settings used for their
//! Deployment. Loaded once at startup from a ConfigMap or a local file:
//!
//! ```yaml
//! suggestions:
//!   random:
//!     image: ghcr.io/hypertune/suggestion-random:v0.3.0
//!     imagePullPolicy: IfNotPresent
//!   tpe:
//!     image: ghcr.io/hypertune/suggestion-hyperopt:v0.3.0
//!     resources:
//!       limits:
//!         cpu: "1"
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use k8s_openapi::api::core::v1::{ConfigMap, ResourceRequirements};
use kube::{Api, Client};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Default ConfigMap name
pub const DEFAULT_CONFIG_MAP: &str = "hypertune-config";
/// Key within the ConfigMap holding the YAML document
pub const CONFIG_KEY: &str = "config.yaml";

/// Serving settings for one algorithm
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SuggestionConfig {
    /// Algorithm service image
    pub image: String,
    /// Pull policy, Kubernetes default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
    /// Container resources
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    /// Service account for the algorithm pod
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

/// Top-level operator configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OperatorConfig {
    /// Algorithm name to serving settings
    #[serde(default)]
    pub suggestions: BTreeMap<String, SuggestionConfig>,
}

impl OperatorConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| Error::config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read from a local file
    pub fn from_file(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_yaml(&yaml)
    }

    /// Read from the `config.yaml` key of a ConfigMap
    pub async fn load_from_configmap(client: &Client, namespace: &str, name: &str) -> Result<Self> {
        let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
        let cm = api.get(name).await?;
        let yaml = cm
            .data
            .as_ref()
            .and_then(|d| d.get(CONFIG_KEY))
            .ok_or_else(|| {
                Error::config(format!(
                    "configmap {namespace}/{name} has no '{CONFIG_KEY}' key"
                ))
            })?;
        Self::from_yaml(yaml)
    }

    /// Serving settings for an algorithm, if configured
    pub fn suggestion(&self, algorithm: &str) -> Option<&SuggestionConfig> {
        self.suggestions.get(algorithm)
    }

    fn validate(&self) -> Result<()> {
        for (name, suggestion) in &self.suggestions {
            if suggestion.image.is_empty() {
                return Err(Error::config(format!("algorithm '{name}' has no image")));
            }
        }
        Ok(())
    }
}
