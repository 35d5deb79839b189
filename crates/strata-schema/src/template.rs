//! Tera rendering of resource properties, file payloads and managed blocks.
//!
//! Templates see `environment`, `layer`, `inputs.<key>` (resolved upstream
//! outputs) and `secrets.<NAME>` (values read from the process environment).

use crate::pipeline::PipelineError;
use serde_json::Value;
use std::collections::BTreeMap;
use tera::{Context, Tera};

#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub environment: String,
    pub layer: String,
    pub inputs: BTreeMap<String, Value>,
    pub secrets: BTreeMap<String, String>,
}

impl TemplateContext {
    fn to_tera(&self) -> Context {
        let mut ctx = Context::new();
        ctx.insert("environment", &self.environment);
        ctx.insert("layer", &self.layer);
        ctx.insert("inputs", &self.inputs);
        ctx.insert("secrets", &self.secrets);
        ctx
    }
}

fn is_template(s: &str) -> bool {
    s.contains("{{") || s.contains("{%")
}

/// Render `source` as a one-off template. `what` names the source in errors.
pub fn render_str(source: &str, ctx: &TemplateContext, what: &str) -> Result<String, PipelineError> {
    if !is_template(source) {
        return Ok(source.to_owned());
    }
    Tera::one_off(source, &ctx.to_tera(), false).map_err(|e| PipelineError::Template {
        context: what.to_owned(),
        message: describe(&e),
    })
}

/// Render every templated string inside a JSON value, leaving other values untouched.
pub fn render_value(value: &Value, ctx: &TemplateContext, what: &str) -> Result<Value, PipelineError> {
    match value {
        Value::String(s) if is_template(s) => Ok(Value::String(render_str(s, ctx, what)?)),
        Value::Array(items) => items
            .iter()
            .map(|v| render_value(v, ctx, what))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_value(v, ctx, what)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn describe(err: &tera::Error) -> String {
    let mut msg = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        msg.push_str(": ");
        msg.push_str(&inner.to_string());
        source = inner.source();
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> TemplateContext {
        let mut ctx = TemplateContext {
            environment: "dev".to_owned(),
            layer: "03-database".to_owned(),
            ..TemplateContext::default()
        };
        ctx.inputs.insert("network_id".to_owned(), json!("net-42"));
        ctx.inputs.insert("replicas".to_owned(), json!(3));
        ctx.secrets
            .insert("DB_PASSWORD".to_owned(), "hunter2".to_owned());
        ctx
    }

    #[test]
    fn renders_inputs_and_secrets() {
        let out = render_str(
            "net={{ inputs.network_id }} env={{ environment }} pw={{ secrets.DB_PASSWORD }}",
            &ctx(),
            "test",
        )
        .unwrap();
        assert_eq!(out, "net=net-42 env=dev pw=hunter2");
    }

    #[test]
    fn plain_strings_pass_through() {
        assert_eq!(render_str("no braces here", &ctx(), "test").unwrap(), "no braces here");
    }

    #[test]
    fn renders_nested_values() {
        let value = json!({
            "network": "{{ inputs.network_id }}",
            "size": 2,
            "tags": ["{{ environment }}", "static"]
        });
        let rendered = render_value(&value, &ctx(), "resource").unwrap();
        assert_eq!(
            rendered,
            json!({ "network": "net-42", "size": 2, "tags": ["dev", "static"] })
        );
    }

    #[test]
    fn unknown_variable_is_an_error() {
        let err = render_str("{{ inputs.missing }}", &ctx(), "files/app.env").unwrap_err();
        match err {
            PipelineError::Template { context, .. } => assert_eq!(context, "files/app.env"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
