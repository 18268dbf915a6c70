//! Orchestration-layer boundary.
//!
//! A [`Provider`] owns every workflow execution's inbox: it assigns issuance sequence numbers to
//! incoming jobs, hands batches to the worker as activations, and routes what each activation
//! produced back to the callers waiting on it. The dispatcher itself never talks to a provider.

use crate::Payload;
use crate::activation::{Activation, ActivationCompletion, Command, ExecutionStatus, JobKind, SignalFailure};
use crate::correlator::UpdateProgress;
use crate::error::ErrorDetails;
use tokio::sync::{oneshot, watch};

/// An update as submitted by a caller.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateRequest {
    pub update_id: String,
    pub name: String,
    pub args: Vec<Payload>,
}

/// Workflow to start as part of signal-with-start or update-with-start.
#[derive(Debug, Clone, PartialEq)]
pub struct StartRequest {
    pub workflow_type: String,
    pub args: Vec<Payload>,
}

/// How update-with-start treats a workflow id that is already running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkflowStartPolicy {
    /// Deliver the update to the running execution instead of starting one.
    #[default]
    IfNotRunning,
    /// Always start; a running execution fails the call with `AlreadyStarted`.
    Always,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub name: String,
    pub args: Vec<Payload>,
}

/// One activation leased to a worker.
#[derive(Debug, Clone)]
pub struct ActivationItem {
    pub workflow_id: String,
    pub workflow_type: String,
    pub activation: Activation,
}

/// Point-in-time view of an execution, for inspection and tests.
#[derive(Debug, Clone)]
pub struct ExecutionSnapshot {
    pub workflow_type: String,
    pub run_id: String,
    /// Number of runs so far, counting continue-as-new.
    pub run_count: u32,
    pub status: ExecutionStatus,
    /// Commands of every activation of every run, in production order.
    pub commands: Vec<Command>,
    pub signal_failures: Vec<SignalFailure>,
    /// Jobs issued but not yet leased.
    pub pending_jobs: usize,
    /// Update ids the provider still correlates. Outcomes are kept until the execution closes.
    pub tracked_updates: usize,
}

pub type QueryReply = oneshot::Receiver<Result<Payload, ErrorDetails>>;

/// Storage and delivery for workflow executions.
///
/// Operations against an unknown workflow id fail with `NotFound("workflow execution not
/// found: <id>")`; operations that would add work to a terminal execution fail with
/// `NotFound("workflow execution already completed")`. Workflow ids are never reused: starting
/// an id that exists, running or finished, fails with `AlreadyStarted`.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Create an execution and issue its `StartWorkflow` job. Returns the run id.
    async fn start_workflow(
        &self,
        workflow_id: &str,
        workflow_type: &str,
        args: Vec<Payload>,
    ) -> Result<String, ProviderError>;

    /// Start the workflow unless it is already running, and issue `signal` to it in the same
    /// step. Returns the run id that received the signal.
    async fn signal_with_start(
        &self,
        workflow_id: &str,
        start: StartRequest,
        signal: String,
        signal_args: Vec<Payload>,
    ) -> Result<String, ProviderError>;

    /// Start the workflow as `policy` allows, and issue `update` to it in the same step.
    async fn update_with_start(
        &self,
        workflow_id: &str,
        start: StartRequest,
        policy: WorkflowStartPolicy,
        update: UpdateRequest,
    ) -> Result<(String, watch::Receiver<UpdateProgress>), ProviderError>;

    /// Issue a job to a running execution.
    async fn enqueue_job(&self, workflow_id: &str, job: JobKind) -> Result<(), ProviderError>;

    /// Issue an update and subscribe to its lifecycle.
    ///
    /// Submitting an id that is already known does not issue a second job; the returned
    /// receiver observes the original update.
    async fn submit_update(
        &self,
        workflow_id: &str,
        request: UpdateRequest,
    ) -> Result<watch::Receiver<UpdateProgress>, ProviderError>;

    async fn submit_query(&self, workflow_id: &str, request: QueryRequest) -> Result<QueryReply, ProviderError>;

    /// Lease the next execution with pending jobs. At most one activation per execution is
    /// in flight at a time.
    async fn fetch_activation(&self) -> Option<ActivationItem>;

    /// Record what an activation produced and release the lease.
    async fn complete_activation(
        &self,
        workflow_id: &str,
        completion: ActivationCompletion,
    ) -> Result<(), ProviderError>;

    /// Status of the workflow id across runs. Continue-as-new keeps it `Running`.
    async fn subscribe_status(&self, workflow_id: &str) -> Result<watch::Receiver<ExecutionStatus>, ProviderError>;

    async fn describe(&self, workflow_id: &str) -> Result<ExecutionSnapshot, ProviderError>;
}

pub mod error;
pub use error::{ProviderError, ProviderErrorKind};

/// In-memory provider for tests and embedding.
pub mod in_memory;
pub use in_memory::InMemoryProvider;
