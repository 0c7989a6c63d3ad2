//! Trial manifest templating
//!
//! Renders an Experiment's `trialTemplate.trialSpec` into a concrete job
//! manifest for one assignment. Placeholders use `${...}` syntax:
//!
//! - `${trialParameters.<name>}` - value of the search parameter bound to `<name>`
//! - `${trialSpec.Name}` - Trial name
//! - `${trialSpec.Namespace}` - Trial namespace
//! - `${trialSpec.Experiment}` - owning Experiment name
//!
//! Undefined placeholders are errors, so a template cannot silently produce
//! a job with an empty hyperparameter.

mod engine;
mod error;

pub use engine::{normalize_key, TemplateEngine};
pub use error::TemplateError;

use std::collections::BTreeMap;

use kube::ResourceExt;
#[cfg(test)]
use mockall::automock;

use crate::crd::{Experiment, ParameterAssignment};

/// Renders trial job manifests
#[cfg_attr(test, automock)]
pub trait TrialTemplateRenderer: Send + Sync {
    /// Render the experiment's trial template for one assignment
    ///
    /// # Arguments
    ///
    /// * `experiment` - Experiment owning the template
    /// * `trial_name` - Name the Trial will take
    /// * `assignments` - Parameter values for this Trial
    fn render(
        &self,
        experiment: &Experiment,
        trial_name: &str,
        assignments: &[ParameterAssignment],
    ) -> crate::Result<String>;
}

/// Renderer backed by [`TemplateEngine`]
pub struct ManifestRenderer {
    engine: TemplateEngine,
}

impl ManifestRenderer {
    /// Create a renderer
    pub fn new() -> Result<Self, TemplateError> {
        Ok(Self {
            engine: TemplateEngine::new()?,
        })
    }

    fn context(
        experiment: &Experiment,
        trial_name: &str,
        assignments: &[ParameterAssignment],
    ) -> Result<minijinja::Value, TemplateError> {
        let mut trial_parameters = BTreeMap::new();
        for tp in &experiment.spec.trial_template.trial_parameters {
            let value = assignments
                .iter()
                .find(|a| a.name == tp.reference)
                .map(|a| a.value.clone())
                .ok_or_else(|| TemplateError::missing_parameter(&tp.name))?;
            trial_parameters.insert(normalize_key(&tp.name), value);
        }

        let trial_spec = BTreeMap::from([
            ("Name", trial_name.to_string()),
            ("Namespace", experiment.namespace().unwrap_or_default()),
            ("Experiment", experiment.name_any()),
        ]);

        Ok(minijinja::context! {
            trialParameters => trial_parameters,
            trialSpec => trial_spec,
        })
    }
}

impl TrialTemplateRenderer for ManifestRenderer {
    fn render(
        &self,
        experiment: &Experiment,
        trial_name: &str,
        assignments: &[ParameterAssignment],
    ) -> crate::Result<String> {
        let ctx = Self::context(experiment, trial_name, assignments)?;
        let rendered = self
            .engine
            .render(&experiment.spec.trial_template.trial_spec, ctx)?;
        Ok(rendered)
    }
}
