//! The Task Runner (spec §4.5): turns one [`crate::dag::Node`] into zero or
//! more module invocations, handling `when` evaluation, `loop` expansion,
//! per-instance secret tracking, retry, channel lifecycle, and
//! register/redact-on-register.

use crate::channel::{ChannelManager, ManagedChannel};
use crate::dag::Node;
use crate::error::{GxoError, Result};
use crate::events::{Event, EventSink};
use crate::metrics::Metrics;
use crate::module::{ErrorSender, Module, ModuleContext, ModuleRegistry};
use crate::playbook::LoopSpec;
use crate::redact::redact_summary;
use crate::retry::{retry, CancellationToken};
use crate::secret::SecretTracker;
use crate::store::{status_key, StateStore};
use crate::template::Renderer;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "Pending",
            TaskStatus::Running => "Running",
            TaskStatus::Completed => "Completed",
            TaskStatus::Failed => "Failed",
            TaskStatus::Skipped => "Skipped",
        }
    }
}

pub struct TaskOutcome {
    pub status: TaskStatus,
    pub error: Option<GxoError>,
}

/// Everything the runner needs that is shared across all task instances in
/// a run. Cloning is cheap: every field is an `Arc` or already
/// internally-synchronized.
#[derive(Clone)]
pub struct RunnerContext {
    pub state: Arc<StateStore>,
    pub registry: ModuleRegistry,
    pub renderer: Arc<Renderer>,
    pub events: Arc<dyn EventSink>,
    pub channels: Arc<ChannelManager>,
    /// producer internal_id -> consumer internal_ids, precomputed once by
    /// the orchestrator from the DAG's stream edges.
    pub stream_consumers: Arc<HashMap<String, Vec<String>>>,
    pub cancel: CancellationToken,
    pub err_chan: ErrorSender,
    pub metrics: Arc<Metrics>,
}

/// Truthy-string semantics for `when` evaluation (spec §4.5 step 2): the
/// rendered text is falsy if it is empty or (case-insensitively) one of
/// `"false"` / `"0"` / `"no"` / `"off"`; otherwise, if it parses as a
/// number, the number's truthiness governs (zero is falsy, including
/// `"-0"` under IEEE-754 equality); anything else is truthy.
pub fn is_truthy(rendered: &str) -> bool {
    let trimmed = rendered.trim();
    if matches!(
        trimmed.to_ascii_lowercase().as_str(),
        "" | "false" | "0" | "no" | "off"
    ) {
        return false;
    }
    if let Ok(n) = trimmed.parse::<f64>() {
        return n != 0.0;
    }
    true
}

/// Execute a node to completion: `when` gate, loop expansion, retries, and
/// state registration. Context-terminal errors (cancellation, deadline)
/// and fatal failures not covered by `ignore_errors` are carried in the
/// returned [`TaskOutcome`] rather than propagated, so the orchestrator
/// keeps a single place to decide what halts the run.
pub async fn run_node(node: &Node, ctx: &RunnerContext) -> TaskOutcome {
    let internal_id = node.internal_id.clone();
    let span = tracing::debug_span!("task", id = %internal_id, module_type = %node.task.type_name);
    let _enter = span.enter();

    ctx.events.emit(Event::TaskStart {
        task: internal_id.clone(),
    });
    set_status(ctx, &internal_id, TaskStatus::Running);

    let outcome = run_node_inner(node, ctx).await;

    if let Some(err) = &outcome.error {
        tracing::debug!(status = outcome.status.as_str(), error = %err, "task finished");
    } else {
        tracing::debug!(status = outcome.status.as_str(), "task finished");
    }
    set_status(ctx, &internal_id, outcome.status);
    ctx.events.emit(Event::TaskEnd {
        task: internal_id.clone(),
        status: outcome.status.as_str().to_string(),
    });
    outcome
}

/// Run a node's `when`/loop/retry body, then unconditionally close its
/// producer channels and observe the secrets-redacted metric, regardless of
/// which branch the body returned through. Rust has no `finally`, so this
/// wrapper plays that role; `run_node_body` must never close the producer
/// itself. Also enforces the per-task `timeout`, shared across every loop
/// iteration rather than reset per instance (spec §4.5 step 4, §5).
async fn run_node_inner(node: &Node, ctx: &RunnerContext) -> TaskOutcome {
    let outcome = match non_zero(node.timeout) {
        Some(timeout) => match tokio::time::timeout(timeout, run_node_body(node, ctx)).await {
            Ok(outcome) => outcome,
            Err(_) => TaskOutcome {
                status: TaskStatus::Failed,
                error: Some(GxoError::DeadlineExceeded),
            },
        },
        None => run_node_body(node, ctx).await,
    };
    ctx.channels.close_producer(&node.internal_id).await;
    outcome
}

fn non_zero(d: Duration) -> Option<Duration> {
    if d.is_zero() {
        None
    } else {
        Some(d)
    }
}

async fn run_node_body(node: &Node, ctx: &RunnerContext) -> TaskOutcome {
    let tracker = SecretTracker::new();
    let data = ctx.state.get_all();

    if let Some(when) = &node.task.when {
        match ctx.renderer.render(when, &data, &tracker).await {
            Ok(rendered) if !is_truthy(&rendered) => {
                return TaskOutcome {
                    status: TaskStatus::Skipped,
                    error: Some(GxoError::Skipped(format!("when evaluated to {rendered:?}"))),
                };
            }
            Ok(_) => {}
            Err(e) => return to_failed(e),
        }
    }

    let module: Arc<dyn Module> = match ctx.registry.build(&node.task.type_name) {
        Ok(m) => Arc::from(m),
        Err(e) => return to_failed(e),
    };

    let items = match resolve_loop_items(node, ctx, &data, &tracker).await {
        Ok(items) => items,
        Err(e) => return to_failed(e),
    };

    let inputs: Vec<Arc<ManagedChannel>> = node
        .stream_deps
        .iter()
        .map(|producer| ctx.channels.channel(producer, &node.internal_id))
        .collect();
    let outputs: Vec<Arc<ManagedChannel>> = ctx
        .stream_consumers
        .get(&node.internal_id)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .map(|consumer| ctx.channels.channel(&node.internal_id, &consumer))
        .collect();

    let parallel = node.task.loop_control.parallel.max(1);
    let mut in_flight = FuturesUnordered::new();
    let mut results: Vec<Result<Value>> = Vec::with_capacity(items.len());
    let mut remaining = items.into_iter();

    for item in remaining.by_ref().take(parallel) {
        in_flight.push(run_instance(node, ctx, module.clone(), &tracker, &data, item, &inputs, &outputs));
    }
    while let Some(result) = in_flight.next().await {
        results.push(result);
        if let Some(item) = remaining.next() {
            in_flight.push(run_instance(node, ctx, module.clone(), &tracker, &data, item, &inputs, &outputs));
        }
    }

    let loop_used = node.task.loop_spec.is_some();
    let mut values = Vec::with_capacity(results.len());
    for r in results {
        match r {
            Ok(v) => values.push(v),
            Err(e) if e.is_cancellation_or_deadline() => {
                return TaskOutcome {
                    status: TaskStatus::Failed,
                    error: Some(e),
                };
            }
            Err(e) => return to_failed(e),
        }
    }

    let summary = if loop_used {
        Value::Array(values)
    } else {
        values.into_iter().next().unwrap_or(Value::Null)
    };

    if let Some(register) = &node.task.register {
        let (redacted, had_secret) = redact_summary(&summary, &tracker);
        if had_secret {
            ctx.metrics
                .secrets_redacted_total
                .with_label_values(&[node.task.name.as_deref().unwrap_or(&node.internal_id)])
                .inc();
        }
        ctx.state.set(register.clone(), redacted);
    }

    TaskOutcome {
        status: TaskStatus::Completed,
        error: None,
    }
}

async fn run_instance(
    node: &Node,
    ctx: &RunnerContext,
    module: Arc<dyn Module>,
    tracker: &SecretTracker,
    base_data: &Value,
    loop_item: Option<(String, Value)>,
    inputs: &[Arc<ManagedChannel>],
    outputs: &[Arc<ManagedChannel>],
) -> Result<Value> {
    let mut data = base_data.clone();
    if let Some((loop_var, item)) = &loop_item {
        if let Value::Object(map) = &mut data {
            map.insert(loop_var.clone(), item.clone());
        }
    }

    let rendered_params = render_params(&ctx.renderer, &node.task.params, &data, tracker).await?;
    let module_ctx = ModuleContext {
        task_name: node.internal_id.clone(),
        module_type: node.task.type_name.clone(),
    };

    let policy = node.retry_policy;
    let state = ctx.state.clone();
    let err_chan = ctx.err_chan.clone();
    let events = ctx.events.clone();
    let inputs = inputs.to_vec();
    let outputs = outputs.to_vec();

    let result = retry(&policy, &ctx.cancel, move |_attempt| {
        let module = module.clone();
        let module_ctx = module_ctx.clone();
        let params = rendered_params.clone();
        let state = state.clone();
        let inputs = inputs.clone();
        let outputs = outputs.clone();
        let err_chan = err_chan.clone();
        let events = events.clone();
        async move {
            events.emit(Event::ModuleExecutionStart {
                task: module_ctx.task_name.clone(),
                module_type: module_ctx.module_type.clone(),
            });
            let result = module
                .perform(&module_ctx, &params, &state, &inputs, &outputs, &err_chan)
                .await;
            events.emit(Event::ModuleExecutionEnd {
                task: module_ctx.task_name.clone(),
                module_type: module_ctx.module_type.clone(),
                ok: result.is_ok(),
            });
            result
        }
    })
    .await;

    if let Err(e) = &result {
        if node.task.ignore_errors && !e.is_cancellation_or_deadline() {
            ctx.events.emit(Event::RecordErrorOccurred {
                task: node.internal_id.clone(),
                message: e.to_string(),
            });
        }
    }

    result
}

async fn render_params(
    renderer: &Renderer,
    params: &Map<String, Value>,
    data: &Value,
    tracker: &SecretTracker,
) -> Result<Map<String, Value>> {
    let mut out = Map::with_capacity(params.len());
    for (k, v) in params {
        out.insert(k.clone(), render_value(renderer, v, data, tracker).await?);
    }
    Ok(out)
}

fn render_value<'a>(
    renderer: &'a Renderer,
    value: &'a Value,
    data: &'a Value,
    tracker: &'a SecretTracker,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value>> + Send + 'a>> {
    Box::pin(async move {
        match value {
            Value::String(s) => renderer.resolve(s, data, tracker).await,
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(render_value(renderer, item, data, tracker).await?);
                }
                Ok(Value::Array(out))
            }
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), render_value(renderer, v, data, tracker).await?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    })
}

/// Resolve the `loop` source into a list of `(loop_var, item)` pairs. When
/// no loop is declared, returns a single `None` entry so the instance
/// runner always iterates exactly once.
async fn resolve_loop_items(
    node: &Node,
    ctx: &RunnerContext,
    data: &Value,
    tracker: &SecretTracker,
) -> Result<Vec<Option<(String, Value)>>> {
    let Some(spec) = &node.task.loop_spec else {
        return Ok(vec![None]);
    };
    let loop_var = node.task.loop_control.loop_var.clone();
    let resolved = match spec {
        LoopSpec::Template(t) => ctx.renderer.resolve(t, data, tracker).await?,
        LoopSpec::Literal(v) => v.clone(),
    };
    let items: Vec<Value> = match resolved {
        Value::Array(items) => items,
        Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| Value::Array(vec![Value::String(k), v]))
            .collect(),
        Value::Null => Vec::new(),
        other => {
            return Err(GxoError::Config(format!(
                "loop source must resolve to an array or mapping, got {other:?}"
            )))
        }
    };
    Ok(items.into_iter().map(|item| Some((loop_var.clone(), item))).collect())
}

/// Wrap any non-cancellation error as a Failed outcome. `ignore_errors` no
/// longer changes a task's own terminal status — per spec §7, "any Failed
/// task (even `ignore_errors`) forces 'Failed'" at the report level;
/// `ignore_errors` only tells the orchestrator not to treat the failure as
/// fatal enough to halt scheduling of the rest of the run (see
/// `orchestrator::schedule`). A Failed task never signals its state
/// dependents regardless of `ignore_errors`, so they stay Pending.
fn to_failed(error: GxoError) -> TaskOutcome {
    TaskOutcome {
        status: TaskStatus::Failed,
        error: Some(error),
    }
}

fn set_status(ctx: &RunnerContext, internal_id: &str, status: TaskStatus) {
    ctx.state
        .set(status_key(internal_id), Value::String(status.as_str().to_string()));
    ctx.events.emit(Event::TaskStatusChanged {
        task: internal_id.to_string(),
        status: status.as_str().to_string(),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_rules() {
        assert!(is_truthy("true"));
        assert!(is_truthy("anything"));
        assert!(!is_truthy(""));
        assert!(!is_truthy("false"));
        assert!(!is_truthy("FALSE"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy("no"));
        assert!(!is_truthy("off"));
        assert!(!is_truthy("OFF"));
    }

    #[test]
    fn truthy_numeric_strings() {
        assert!(!is_truthy("0.0"));
        assert!(!is_truthy("-0"));
        assert!(is_truthy("3"));
        assert!(is_truthy("-1"));
        assert!(is_truthy("0.5"));
    }
}
