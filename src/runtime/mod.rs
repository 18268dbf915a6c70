//! Worker: pulls activations from a [`Provider`], drives the matching [`WorkflowExecution`],
//! and reports each completion back.
//!
//! Executions hold `Rc` state and never leave the worker's thread, so the worker runs on the
//! caller's task (see [`Worker::run_until`]) rather than spawning.
use crate::activation::{ActivationCompletion, Command, ExecutionStatus};
use crate::dispatch::interceptors::{InboundChain, WorkflowInboundInterceptor};
use crate::dispatch::{DispatchOptions, UnhandledUpdatePolicy, WorkflowExecution};
use crate::error::ApplicationError;
use crate::providers::{ActivationItem, Provider};
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;
use tracing::{debug, error, warn};

pub mod observability;
pub mod registry;

pub use observability::{DispatchMetrics, LogFormat, MetricsSnapshot, ObservabilityConfig, init_logging};
pub use registry::{FnWorkflow, WorkflowFuture, WorkflowHandler, WorkflowRegistry, WorkflowRegistryBuilder};

/// Configuration options for the Worker.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Polling interval in milliseconds when the provider has no activation ready.
    /// Default: 10ms (100 Hz)
    pub dispatcher_idle_sleep_ms: u64,
    /// Drive passes allowed per job before the workflow is failed as non-settling.
    pub max_passes_per_activation: usize,
    pub unhandled_updates: UnhandledUpdatePolicy,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            dispatcher_idle_sleep_ms: 10,
            max_passes_per_activation: 10_000,
            unhandled_updates: UnhandledUpdatePolicy::default(),
        }
    }
}

impl WorkerOptions {
    pub fn dispatch_options(&self) -> DispatchOptions {
        DispatchOptions {
            max_passes_per_activation: self.max_passes_per_activation,
            unhandled_updates: self.unhandled_updates,
        }
    }
}

const MAX_COMPLETE_ATTEMPTS: u32 = 5;

pub struct Worker {
    provider: Arc<dyn Provider>,
    registry: WorkflowRegistry,
    chain: InboundChain,
    options: WorkerOptions,
    executions: HashMap<String, WorkflowExecution>,
    metrics: Arc<DispatchMetrics>,
}

impl Worker {
    pub fn new(provider: Arc<dyn Provider>, registry: WorkflowRegistry) -> Self {
        Self {
            provider,
            registry,
            chain: InboundChain::default(),
            options: WorkerOptions::default(),
            executions: HashMap::new(),
            metrics: Arc::new(DispatchMetrics::new()),
        }
    }

    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.options = options;
        self
    }

    /// Install inbound interceptors for every execution this worker drives. The first one is
    /// outermost.
    pub fn with_interceptors(mut self, interceptors: Vec<Rc<dyn WorkflowInboundInterceptor>>) -> Self {
        self.chain = InboundChain::new(interceptors);
        self
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Executions currently cached (started and not yet terminal).
    pub fn active_executions(&self) -> usize {
        self.executions.len()
    }

    /// Process one activation if the provider has one ready. Returns whether it did.
    pub async fn poll_once(&mut self) -> bool {
        let Some(item) = self.provider.fetch_activation().await else {
            return false;
        };
        let workflow_id = item.workflow_id.clone();
        let completion = self.process(item);
        self.complete_with_retry(&workflow_id, completion).await;
        true
    }

    /// Process activations until none is ready. Returns how many were processed.
    pub async fn run_until_idle(&mut self) -> usize {
        let mut processed = 0;
        while self.poll_once().await {
            processed += 1;
        }
        processed
    }

    /// Drive executions while `fut` is pending and return its output.
    pub async fn run_until<F: Future>(&mut self, fut: F) -> F::Output {
        let mut fut = std::pin::pin!(fut);
        let idle = Duration::from_millis(self.options.dispatcher_idle_sleep_ms);
        loop {
            if let Poll::Ready(out) = futures::poll!(fut.as_mut()) {
                return out;
            }
            if !self.poll_once().await {
                tokio::select! {
                    out = fut.as_mut() => return out,
                    _ = tokio::time::sleep(idle) => {}
                }
            }
        }
    }

    fn process(&mut self, item: ActivationItem) -> ActivationCompletion {
        let ActivationItem {
            workflow_id,
            workflow_type,
            activation,
        } = item;

        if let Some(existing) = self.executions.get(&workflow_id)
            && existing.run_id() != activation.run_id
        {
            debug!(
                workflow_id = %workflow_id,
                run_id = %existing.run_id(),
                new_run_id = %activation.run_id,
                "replacing cached execution with new run"
            );
            self.executions.remove(&workflow_id);
        }

        let execution = match self.executions.entry(workflow_id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let Some(workflow) = self.registry.resolve(&workflow_type) else {
                    error!(workflow_id = %workflow_id, workflow_type = %workflow_type, "workflow type not registered");
                    let failure =
                        ApplicationError::new(format!("workflow type not registered: {workflow_type}")).non_retryable();
                    let mut completion =
                        ActivationCompletion::empty(activation.run_id, ExecutionStatus::Failed(failure.clone()));
                    completion.commands.push(Command::FailWorkflowExecution { failure });
                    self.metrics.record_activation(&completion);
                    return completion;
                };
                entry.insert(WorkflowExecution::new(
                    workflow_id.clone(),
                    activation.run_id.clone(),
                    workflow_type,
                    workflow,
                    self.chain.clone(),
                    self.options.dispatch_options(),
                ))
            }
        };

        self.metrics.record_jobs(&activation.jobs);
        let completion = execution.activate(activation);
        self.metrics.record_activation(&completion);
        if completion.status.is_terminal() {
            debug!(workflow_id = %workflow_id, status = completion.status.label(), "evicting finished run");
            self.executions.remove(&workflow_id);
        }
        completion
    }

    /// Report a completion, retrying transient provider failures with exponential backoff.
    async fn complete_with_retry(&self, workflow_id: &str, completion: ActivationCompletion) {
        let mut attempts: u32 = 0;
        loop {
            match self.provider.complete_activation(workflow_id, completion.clone()).await {
                Ok(()) => {
                    debug!(workflow_id = %workflow_id, "complete_activation succeeded");
                    return;
                }
                Err(e) if e.is_retryable() && attempts < MAX_COMPLETE_ATTEMPTS => {
                    let backoff_ms = 10u64.saturating_mul(1 << attempts);
                    warn!(workflow_id = %workflow_id, attempts, backoff_ms, error = %e, "complete_activation failed; retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempts += 1;
                }
                Err(e) => {
                    warn!(workflow_id = %workflow_id, attempts, error = %e, "Failed to complete activation");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::JobKind;
    use crate::providers::InMemoryProvider;
    use serde_json::json;

    fn registry() -> WorkflowRegistry {
        WorkflowRegistry::builder()
            .register("echo", |_ctx, args| async move { Ok(args.first().cloned().unwrap_or_default()) })
            .build()
    }

    #[tokio::test]
    async fn unknown_workflow_type_fails_execution() {
        let provider = Arc::new(InMemoryProvider::new());
        let mut worker = Worker::new(provider.clone(), registry());
        provider.start_workflow("wf", "missing", vec![]).await.unwrap();

        assert!(worker.poll_once().await);
        let snapshot = provider.describe("wf").await.unwrap();
        match snapshot.status {
            ExecutionStatus::Failed(err) => assert_eq!(err.message, "workflow type not registered: missing"),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(worker.active_executions(), 0);
    }

    #[tokio::test]
    async fn finished_runs_are_evicted() {
        let provider = Arc::new(InMemoryProvider::new());
        let mut worker = Worker::new(provider.clone(), registry());
        provider.start_workflow("wf", "echo", vec![json!("hi")]).await.unwrap();

        assert_eq!(worker.run_until_idle().await, 1);
        assert_eq!(worker.active_executions(), 0);
        let snapshot = provider.describe("wf").await.unwrap();
        assert_eq!(snapshot.status, ExecutionStatus::Completed(json!("hi")));
        assert_eq!(
            snapshot.commands,
            vec![Command::CompleteWorkflowExecution { result: json!("hi") }]
        );
        assert_eq!(worker.metrics().workflows_finished, 1);
        assert!(provider.enqueue_job("wf", JobKind::signal("late", vec![])).await.is_err());
    }

    #[tokio::test]
    async fn run_until_drives_until_future_resolves() {
        let provider = Arc::new(InMemoryProvider::new());
        let mut worker = Worker::new(provider.clone(), registry());
        provider.start_workflow("wf", "echo", vec![json!(5)]).await.unwrap();
        let mut status = provider.subscribe_status("wf").await.unwrap();

        let finished = worker
            .run_until(async move {
                status
                    .wait_for(ExecutionStatus::is_terminal)
                    .await
                    .map(|s| s.clone())
                    .ok()
            })
            .await;
        assert_eq!(finished, Some(ExecutionStatus::Completed(json!(5))));
    }

    #[test]
    fn options_feed_dispatch() {
        let options = WorkerOptions {
            max_passes_per_activation: 7,
            unhandled_updates: UnhandledUpdatePolicy::BufferUntilRegistered,
            ..Default::default()
        };
        let dispatch = options.dispatch_options();
        assert_eq!(dispatch.max_passes_per_activation, 7);
        assert_eq!(dispatch.unhandled_updates, UnhandledUpdatePolicy::BufferUntilRegistered);
    }
}
