//! The Module contract (spec §6.1) and the name -> factory registry tasks
//! are dispatched through.

use crate::channel::ManagedChannel;
use crate::error::{GxoError, Result};
use crate::store::StateStore;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Context handed to every module invocation: whatever a module needs
/// beyond its own rendered params to do its job, without reaching into
/// engine internals it has no business touching.
#[derive(Clone)]
pub struct ModuleContext {
    pub task_name: String,
    pub module_type: String,
}

/// A non-fatal, per-record processing failure. Modules push these onto
/// `err_chan` instead of failing the whole task instance; `ignore_errors`
/// and retry have no bearing on what happens to an individual record.
#[derive(Debug, Clone)]
pub struct RecordError {
    pub record: Value,
    pub message: String,
}

pub type ErrorSender = mpsc::Sender<RecordError>;

/// A unit of work a playbook task dispatches to. Implementors are
/// expected to be cheap to construct (the registry calls the factory once
/// per task instance) and to respect cancellation signaled through
/// `ctx`'s surrounding `CancellationToken` at the call site in
/// [`crate::runner`].
#[async_trait]
pub trait Module: Send + Sync {
    /// Execute one task instance. `inputs` carries streamed values from
    /// `stream_inputs` producers (empty if the task declares none);
    /// `outputs` is a fan-out sink the module pushes streamed records onto
    /// for its own declared consumers (no-op if it has none). Returns a
    /// JSON summary to register under the task's `register` key, deep-copy
    /// read access to the state store, and any error channel writes are
    /// already flushed by the time `perform` returns.
    async fn perform(
        &self,
        ctx: &ModuleContext,
        params: &Map<String, Value>,
        state: &StateStore,
        inputs: &[Arc<ManagedChannel>],
        outputs: &[Arc<ManagedChannel>],
        err_chan: &ErrorSender,
    ) -> Result<Value>;
}

/// Constructs a fresh [`Module`] instance for a task type. Factories are
/// plain functions, not trait objects with state, since modules are meant
/// to be stateless aside from their rendered params.
pub type ModuleFactory = Arc<dyn Fn() -> Box<dyn Module> + Send + Sync>;

/// Name -> factory lookup used by the runner to dispatch a task's `type`
/// to a concrete [`Module`]. Registration happens once at startup; lookups
/// happen once per task instance, so a simple `RwLock<HashMap>` is more
/// than sufficient.
#[derive(Clone, Default)]
pub struct ModuleRegistry {
    factories: Arc<parking_lot::RwLock<HashMap<String, ModuleFactory>>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        let registry = Self::default();
        registry.register("mock", || Box::new(MockModule));
        registry
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Module> + Send + Sync + 'static,
    {
        self.factories.write().insert(name.into(), Arc::new(factory));
    }

    pub fn build(&self, type_name: &str) -> Result<Box<dyn Module>> {
        let factories = self.factories.read();
        let factory = factories
            .get(type_name)
            .ok_or_else(|| GxoError::ModuleNotFound(type_name.to_string()))?;
        Ok(factory())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.read().contains_key(type_name)
    }
}

/// Built-in test-fixture module: echoes its params back verbatim as the
/// registered summary, optionally failing or sleeping on request. Used by
/// the integration test suite and as a playground module for playbook
/// authors exercising the engine without a real side-effecting module.
///
/// Recognized params: `fail` (bool) forces a `TaskExecution` error,
/// `fail_message` (string) customizes it, `sleep_ms` (number) awaits
/// before returning. Every param (including `fail`/`fail_message`/
/// `sleep_ms` themselves) is echoed back as the summary.
pub struct MockModule;

#[async_trait]
impl Module for MockModule {
    async fn perform(
        &self,
        _ctx: &ModuleContext,
        params: &Map<String, Value>,
        _state: &StateStore,
        _inputs: &[Arc<ManagedChannel>],
        _outputs: &[Arc<ManagedChannel>],
        _err_chan: &ErrorSender,
    ) -> Result<Value> {
        if let Some(Value::Bool(true)) = params.get("fail") {
            let message = params
                .get("fail_message")
                .and_then(Value::as_str)
                .unwrap_or("mock module failure")
                .to_string();
            return Err(GxoError::TaskExecution(message));
        }
        if let Some(ms) = params.get("sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        }
        Ok(Value::Object(params.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx() -> ModuleContext {
        ModuleContext {
            task_name: "t".to_string(),
            module_type: "mock".to_string(),
        }
    }

    #[tokio::test]
    async fn mock_module_echoes_params() {
        let module = MockModule;
        let state = StateStore::new();
        let (tx, _rx) = mpsc::channel(1);
        let mut params = Map::new();
        params.insert("echo".to_string(), json!("hi"));
        params.insert("other".to_string(), json!(3));
        let result = module
            .perform(&ctx(), &params, &state, &[], &[], &tx)
            .await
            .unwrap();
        assert_eq!(result, json!({"echo": "hi", "other": 3}));
    }

    #[tokio::test]
    async fn mock_module_honors_fail_flag() {
        let module = MockModule;
        let state = StateStore::new();
        let (tx, _rx) = mpsc::channel(1);
        let mut params = Map::new();
        params.insert("fail".to_string(), json!(true));
        params.insert("fail_message".to_string(), json!("boom"));
        let err = module
            .perform(&ctx(), &params, &state, &[], &[], &tx)
            .await
            .unwrap_err();
        assert!(matches!(err, GxoError::TaskExecution(msg) if msg == "boom"));
    }

    #[test]
    fn registry_resolves_builtin_mock() {
        let registry = ModuleRegistry::new();
        assert!(registry.contains("mock"));
        assert!(registry.build("mock").is_ok());
    }

    #[test]
    fn registry_errors_on_unknown_type() {
        let registry = ModuleRegistry::new();
        assert!(matches!(registry.build("nope"), Err(GxoError::ModuleNotFound(_))));
    }

    #[test]
    fn custom_registration_overrides_lookup() {
        let registry = ModuleRegistry::empty();
        registry.register("custom", || Box::new(MockModule));
        assert!(registry.build("custom").is_ok());
    }
}
