//! Template engine for `${...}` placeholders
//!
//! Uses minijinja with custom syntax configuration:
//! - Variable delimiters: `${...}`
//! - Block delimiters: `{%...%}`
//! - Comment delimiters: `{#...#}`
//! - Escape: `$${...}` produces literal `${...}`

use minijinja::syntax::SyntaxConfig;
use minijinja::{Environment, UndefinedBehavior, Value};

use super::error::TemplateError;

/// Placeholder for escaped `$${` during preprocessing
const ESCAPED_PLACEHOLDER: &str = "\x00__HYPERTUNE_ESCAPED_DOLLAR_BRACE__\x00";

/// Template engine with strict undefined handling
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    /// Create a new template engine with `${...}` syntax
    pub fn new() -> Result<Self, TemplateError> {
        let syntax = SyntaxConfig::builder()
            .variable_delimiters("${", "}")
            .block_delimiters("{%", "%}")
            .comment_delimiters("{#", "#}")
            .build()
            .map_err(|e| TemplateError::Syntax(e.to_string()))?;

        let mut env = Environment::new();
        env.set_syntax(syntax);
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        env.set_keep_trailing_newline(true);

        Ok(Self { env })
    }

    /// Render a template string with the given context
    ///
    /// `$${foo}` renders as `${foo}`.
    pub fn render(&self, template: &str, ctx: Value) -> Result<String, TemplateError> {
        let preprocessed = template.replace("$${", ESCAPED_PLACEHOLDER);

        // MiniJinja reads `learning-rate` as a subtraction.
        let normalized = normalize_template_identifiers(&preprocessed);

        let rendered = self
            .env
            .render_str(&normalized, ctx)
            .map_err(TemplateError::from)?;

        Ok(rendered.replace(ESCAPED_PLACEHOLDER, "${"))
    }
}

/// Normalize a context key the same way template identifiers are normalized
pub fn normalize_key(key: &str) -> String {
    key.replace('-', "_")
}

/// Converts `${trialParameters.learning-rate}` to `${trialParameters.learning_rate}`.
///
/// Quoted strings inside expressions are preserved.
fn normalize_template_identifiers(template: &str) -> String {
    let mut result = String::with_capacity(template.len());
    let mut remaining = template;

    while let Some(start) = remaining.find("${") {
        result.push_str(&remaining[..start + 2]);
        remaining = &remaining[start + 2..];

        if let Some(end) = remaining.find('}') {
            let expression = &remaining[..end];
            result.push_str(&normalize_expression_hyphens(expression));
            result.push('}');
            remaining = &remaining[end + 1..];
        } else {
            result.push_str(remaining);
            remaining = "";
        }
    }

    result.push_str(remaining);
    result
}

/// Replace hyphens between identifier characters, skipping quoted strings
fn normalize_expression_hyphens(expr: &str) -> String {
    let mut result = String::with_capacity(expr.len());
    let mut chars = expr.chars().peekable();
    let mut in_single_quote = false;
    let mut in_double_quote = false;

    while let Some(ch) = chars.next() {
        match ch {
            '\'' if !in_double_quote => {
                in_single_quote = !in_single_quote;
                result.push(ch);
            }
            '"' if !in_single_quote => {
                in_double_quote = !in_double_quote;
                result.push(ch);
            }
            '-' if !in_single_quote && !in_double_quote => {
                let prev_is_ident = result
                    .chars()
                    .last()
                    .is_some_and(|c| c.is_alphanumeric() || c == '_');
                let next_is_ident = chars
                    .peek()
                    .is_some_and(|c| c.is_alphanumeric() || *c == '_');
                if prev_is_ident && next_is_ident {
                    result.push('_');
                } else {
                    result.push('-');
                }
            }
            _ => result.push(ch),
        }
    }

    result
}
