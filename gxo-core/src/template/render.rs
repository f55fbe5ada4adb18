//! Template evaluation: variable lookup, the function map, and the
//! `render` / `resolve` / `extract_variables` contract (spec §4.2).

use super::ast::{self, Arg, Expr, Node, Template};
use crate::error::{GxoError, Result};
use crate::events::{Event, EventSink};
use crate::metrics::Metrics;
use crate::secret::{SecretProvider, SecretTracker};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Renders templates against nested state data, tracking secret access
/// through a caller-supplied [`SecretTracker`].
///
/// Parsed templates and variable-extraction results are memoized by source
/// text (spec §4.2 "Caching"); the funcmap is *not* part of the cached
/// value, since `secret` must bind to whichever tracker is active for the
/// current task instance.
pub struct Renderer {
    provider: Option<Arc<dyn SecretProvider>>,
    events: Option<Arc<dyn EventSink>>,
    metrics: Option<Arc<Metrics>>,
    secret_timeout: Duration,
    parse_cache: RwLock<HashMap<String, Arc<Template>>>,
    vars_cache: RwLock<HashMap<String, Arc<Vec<String>>>>,
}

impl Renderer {
    pub fn new() -> Self {
        Self {
            provider: None,
            events: None,
            metrics: None,
            secret_timeout: Duration::from_secs(5),
            parse_cache: RwLock::new(HashMap::new()),
            vars_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_secret_provider(mut self, provider: Arc<dyn SecretProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_secret_timeout(mut self, timeout: Duration) -> Self {
        self.secret_timeout = timeout;
        self
    }

    fn parsed(&self, source: &str) -> Result<Arc<Template>> {
        if let Some(t) = self.parse_cache.read().get(source) {
            return Ok(t.clone());
        }
        let parsed = Arc::new(ast::parse(source)?);
        self.parse_cache
            .write()
            .insert(source.to_string(), parsed.clone());
        Ok(parsed)
    }

    /// Render `template` against `data`, returning the expanded string.
    /// Undefined variables are errors.
    pub async fn render(&self, template: &str, data: &Value, tracker: &SecretTracker) -> Result<String> {
        let parsed = self.parsed(template)?;
        let mut out = String::new();
        for node in &parsed.nodes {
            match node {
                Node::Text(t) => out.push_str(t),
                Node::Action(expr) => {
                    let v = self.eval(expr, data, tracker).await?;
                    out.push_str(&display_value(&v));
                }
            }
        }
        Ok(out)
    }

    /// If `template` is exactly a single bare variable action, return the
    /// raw value from `data`, preserving its dynamic type. Otherwise fall
    /// back to [`Renderer::render`] and wrap the result as a string.
    pub async fn resolve(&self, template: &str, data: &Value, tracker: &SecretTracker) -> Result<Value> {
        let parsed = self.parsed(template)?;
        if let [Node::Action(Expr::Var(path))] = parsed.nodes.as_slice() {
            return lookup_var(data, path);
        }
        let rendered = self.render(template, data, tracker).await?;
        Ok(Value::String(rendered))
    }

    /// Dotted-path identifiers referenced as variables in `template`,
    /// excluding function names. Memoized by source text.
    pub fn extract_variables(&self, template: &str) -> Result<Vec<String>> {
        if let Some(v) = self.vars_cache.read().get(template) {
            return Ok((**v).clone());
        }
        let parsed = self.parsed(template)?;
        let mut vars = Vec::new();
        for node in &parsed.nodes {
            if let Node::Action(expr) = node {
                collect_vars(expr, &mut vars);
            }
        }
        self.vars_cache
            .write()
            .insert(template.to_string(), Arc::new(vars.clone()));
        Ok(vars)
    }

    async fn eval(&self, expr: &Expr, data: &Value, tracker: &SecretTracker) -> Result<Value> {
        match expr {
            Expr::Var(path) => lookup_var(data, path),
            Expr::Call(name, args) => {
                let mut values = Vec::with_capacity(args.len());
                for a in args {
                    values.push(match a {
                        Arg::Var(path) => lookup_var(data, path)?,
                        Arg::Str(s) => Value::String(s.clone()),
                    });
                }
                self.call(name, &values, tracker).await
            }
        }
    }

    async fn call(&self, name: &str, args: &[Value], tracker: &SecretTracker) -> Result<Value> {
        match name {
            "env" => {
                let key = arg_str(args, 0, "env")?;
                let val = std::env::var(&key).unwrap_or_default();
                Ok(Value::String(val))
            }
            "eq" => {
                let a = args.get(0).ok_or_else(|| arity_error("eq", 2, args.len()))?;
                let b = args.get(1).ok_or_else(|| arity_error("eq", 2, args.len()))?;
                Ok(Value::Bool(a == b))
            }
            "secret" => {
                let key = arg_str(args, 0, "secret")?;
                let provider = self
                    .provider
                    .as_ref()
                    .ok_or_else(|| GxoError::Config("no secret provider configured".to_string()))?;
                let fut = provider.get(&key, self.secret_timeout);
                let value = tokio::time::timeout(self.secret_timeout, fut)
                    .await
                    .map_err(|_| GxoError::Config(format!("secret {key:?} retrieval timed out")))?
                    .map_err(|e| GxoError::Config(format!("secret {key:?}: {e}")))?;
                if let Some(events) = &self.events {
                    events.emit(Event::SecretAccessed {
                        secret_key: key.clone(),
                    });
                }
                if let Some(metrics) = &self.metrics {
                    metrics.secrets_accessed_total.with_label_values(&[&key]).inc();
                }
                tracker.add(value.clone());
                Ok(Value::String(value))
            }
            other => Err(GxoError::Config(format!("unknown template function: {other}"))),
        }
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self::new()
    }
}

fn arity_error(func: &str, expected: usize, got: usize) -> GxoError {
    GxoError::Config(format!("{func}: expected {expected} arguments, got {got}"))
}

fn arg_str(args: &[Value], idx: usize, func: &str) -> Result<String> {
    match args.get(idx) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Ok(display_value(other)),
        None => Err(GxoError::Config(format!("{func}: missing argument {idx}"))),
    }
}

fn collect_vars(expr: &Expr, out: &mut Vec<String>) {
    match expr {
        Expr::Var(path) if !path.is_empty() => out.push(path.join(".")),
        Expr::Var(_) => {}
        Expr::Call(_, args) => {
            for a in args {
                if let Arg::Var(path) = a {
                    if !path.is_empty() {
                        out.push(path.join("."));
                    }
                }
            }
        }
    }
}

/// Look up a dotted path in a nested JSON value. An empty path returns the
/// whole value (the bare `.`). A missing key is an error, matching the
/// engine-wide "undefined variables are errors" rule.
pub fn lookup_var(data: &Value, path: &[String]) -> Result<Value> {
    if path.is_empty() {
        return Ok(data.clone());
    }
    let mut current = data;
    for (i, segment) in path.iter().enumerate() {
        match current.get(segment) {
            Some(v) => current = v,
            None => {
                return Err(GxoError::Config(format!(
                    "undefined variable: {}",
                    path[..=i].join(".")
                )))
            }
        }
    }
    Ok(current.clone())
}

fn display_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret::EnvSecretProvider;
    use serde_json::json;

    fn renderer() -> Renderer {
        Renderer::new().with_secret_provider(Arc::new(EnvSecretProvider))
    }

    #[tokio::test]
    async fn renders_simple_variable() {
        let r = renderer();
        let data = json!({"initial_var": "from_vars"});
        let out = r
            .render("{{ .initial_var }}", &data, &SecretTracker::new())
            .await
            .unwrap();
        assert_eq!(out, "from_vars");
    }

    #[tokio::test]
    async fn undefined_variable_is_an_error() {
        let r = renderer();
        let data = json!({});
        let err = r
            .render("{{ .missing }}", &data, &SecretTracker::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GxoError::Config(_)));
    }

    #[tokio::test]
    async fn resolve_preserves_type_for_bare_variable() {
        let r = renderer();
        let data = json!({"produced_data": {"input_val": "from_vars"}});
        let resolved = r
            .resolve("{{ .produced_data }}", &data, &SecretTracker::new())
            .await
            .unwrap();
        assert_eq!(resolved, json!({"input_val": "from_vars"}));
    }

    #[tokio::test]
    async fn resolve_falls_back_to_string_for_mixed_templates() {
        let r = renderer();
        let data = json!({"a": "x"});
        let resolved = r
            .resolve("prefix-{{ .a }}", &data, &SecretTracker::new())
            .await
            .unwrap();
        assert_eq!(resolved, json!("prefix-x"));
    }

    #[tokio::test]
    async fn eq_function_structural_equality() {
        let r = renderer();
        let data = json!({"a": 1, "b": 1});
        let out = r.render("{{ eq .a .b }}", &data, &SecretTracker::new()).await.unwrap();
        assert_eq!(out, "true");
    }

    #[tokio::test]
    async fn secret_taints_tracker_and_returns_raw_value() {
        std::env::set_var("GXO_TPL_SECRET", "my-super-secret-api-key-12345");
        let r = renderer();
        let data = json!({});
        let tracker = SecretTracker::new();
        let out = r
            .render(r#"{{ secret "GXO_TPL_SECRET" }}"#, &data, &tracker)
            .await
            .unwrap();
        assert_eq!(out, "my-super-secret-api-key-12345");
        assert!(tracker.is_tracked("my-super-secret-api-key-12345"));
    }

    #[test]
    fn extract_variables_ignores_function_names() {
        let r = renderer();
        let vars = r.extract_variables(r#"{{ eq .a .b }}"#).unwrap();
        assert_eq!(vars, vec!["a".to_string(), "b".to_string()]);

        let vars = r.extract_variables(r#"{{ secret "X" }}"#).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn extract_variables_finds_status_path() {
        let r = renderer();
        let vars = r
            .extract_variables("{{ ._gxo.tasks.task_fail.status }}")
            .unwrap();
        assert_eq!(vars, vec!["_gxo.tasks.task_fail.status".to_string()]);
    }
}
