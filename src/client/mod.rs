use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use uuid::Uuid;

use crate::Payload;
use crate::activation::{ExecutionStatus, JobKind};
use crate::codec::{Codec, Json};
use crate::correlator::UpdateProgress;
use crate::error::ErrorDetails;
use crate::providers::{Provider, QueryRequest, StartRequest, UpdateRequest};
pub use crate::providers::WorkflowStartPolicy;

pub mod interceptors;
pub use interceptors::{OutboundNext, SignalWorkflowInput, StartUpdateInput, WorkflowClientInterceptor};

/// Caller-side entry point.
///
/// The client talks to executions only through the shared [`Provider`]; it never touches a
/// worker. Update ids it generates are `"<workflow_id>-update-<uuid>"`, so clients sharing a
/// provider never hand out the same id.
#[derive(Clone)]
pub struct Client {
    provider: Arc<dyn Provider>,
    interceptors: Arc<[Arc<dyn WorkflowClientInterceptor>]>,
}

impl Client {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            interceptors: Arc::from(Vec::new()),
        }
    }

    /// Install outbound interceptors. The first one is outermost.
    pub fn with_interceptors(mut self, interceptors: Vec<Arc<dyn WorkflowClientInterceptor>>) -> Self {
        self.interceptors = Arc::from(interceptors);
        self
    }

    pub async fn start_workflow(
        &self,
        workflow_id: &str,
        workflow_type: &str,
        args: Vec<Payload>,
    ) -> Result<WorkflowHandle, ErrorDetails> {
        let run_id = self.provider.start_workflow(workflow_id, workflow_type, args).await?;
        Ok(WorkflowHandle {
            client: self.clone(),
            workflow_id: workflow_id.to_string(),
            first_run_id: Some(run_id),
        })
    }

    /// Start a workflow with a single typed argument.
    pub async fn start_workflow_typed<In: Serialize>(
        &self,
        workflow_id: &str,
        workflow_type: &str,
        input: In,
    ) -> Result<WorkflowHandle, ErrorDetails> {
        let payload = Json::encode(&input).map_err(|e| encode_error("start_workflow", e))?;
        self.start_workflow(workflow_id, workflow_type, vec![payload]).await
    }

    /// Start the workflow unless it is already running, and signal it in the same step.
    ///
    /// The signal bypasses outbound interceptors: it is part of the start request.
    pub async fn signal_with_start(
        &self,
        workflow_id: &str,
        workflow_type: &str,
        args: Vec<Payload>,
        signal: impl AsRef<str>,
        signal_args: Vec<Payload>,
    ) -> Result<WorkflowHandle, ErrorDetails> {
        let start = StartRequest {
            workflow_type: workflow_type.to_string(),
            args,
        };
        let run_id = self
            .provider
            .signal_with_start(workflow_id, start, signal.as_ref().to_string(), signal_args)
            .await?;
        Ok(WorkflowHandle {
            client: self.clone(),
            workflow_id: workflow_id.to_string(),
            first_run_id: Some(run_id),
        })
    }

    /// Start the workflow as `start.start_policy` allows, submit an update to it in the same
    /// step, and return once the update is accepted or has an outcome.
    ///
    /// Like signal-with-start, this bypasses outbound interceptors.
    pub async fn update_with_start(
        &self,
        workflow_id: &str,
        start: WorkflowStartOptions,
        update: impl AsRef<str>,
        options: UpdateOptions,
    ) -> Result<(WorkflowHandle, UpdateHandle), ErrorDetails> {
        let update_id = options
            .update_id
            .unwrap_or_else(|| self.generate_update_id(workflow_id));
        let request = UpdateRequest {
            update_id: update_id.clone(),
            name: update.as_ref().to_string(),
            args: options.args,
        };
        let (run_id, progress) = self
            .provider
            .update_with_start(
                workflow_id,
                StartRequest {
                    workflow_type: start.workflow_type,
                    args: start.args,
                },
                start.start_policy,
                request,
            )
            .await?;
        let update = UpdateHandle::settled(workflow_id.to_string(), update_id, progress, "update_with_start").await?;
        let handle = WorkflowHandle {
            client: self.clone(),
            workflow_id: workflow_id.to_string(),
            first_run_id: Some(run_id),
        };
        Ok((handle, update))
    }

    /// Handle to an existing execution. No lookup happens until an operation is issued.
    pub fn get_handle(&self, workflow_id: impl Into<String>) -> WorkflowHandle {
        WorkflowHandle {
            client: self.clone(),
            workflow_id: workflow_id.into(),
            first_run_id: None,
        }
    }

    fn generate_update_id(&self, workflow_id: &str) -> String {
        format!("{workflow_id}-update-{}", Uuid::new_v4())
    }
}

fn encode_error(operation: &str, message: String) -> ErrorDetails {
    ErrorDetails::Infrastructure {
        operation: operation.to_string(),
        message,
        retryable: false,
    }
}

fn channel_closed(operation: &str) -> ErrorDetails {
    ErrorDetails::Infrastructure {
        operation: operation.to_string(),
        message: "provider dropped the response channel".to_string(),
        retryable: true,
    }
}

/// Options for submitting an update.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub args: Vec<Payload>,
    /// Caller-chosen id; generated by the client when absent.
    pub update_id: Option<String>,
}

impl UpdateOptions {
    pub fn new(args: Vec<Payload>) -> Self {
        Self { args, update_id: None }
    }

    pub fn with_update_id(mut self, update_id: impl Into<String>) -> Self {
        self.update_id = Some(update_id.into());
        self
    }
}

/// Workflow to start for update-with-start.
#[derive(Debug, Clone)]
pub struct WorkflowStartOptions {
    pub workflow_type: String,
    pub args: Vec<Payload>,
    pub start_policy: WorkflowStartPolicy,
}

impl WorkflowStartOptions {
    pub fn new(workflow_type: impl Into<String>, args: Vec<Payload>) -> Self {
        Self {
            workflow_type: workflow_type.into(),
            args,
            start_policy: WorkflowStartPolicy::default(),
        }
    }

    pub fn with_start_policy(mut self, start_policy: WorkflowStartPolicy) -> Self {
        self.start_policy = start_policy;
        self
    }
}

#[derive(Clone)]
pub struct WorkflowHandle {
    client: Client,
    workflow_id: String,
    first_run_id: Option<String>,
}

impl WorkflowHandle {
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Run id assigned at start, when this handle came from `start_workflow`.
    pub fn first_run_id(&self) -> Option<&str> {
        self.first_run_id.as_deref()
    }

    pub async fn signal(&self, signal: impl AsRef<str>, args: Vec<Payload>) -> Result<(), ErrorDetails> {
        let input = SignalWorkflowInput {
            workflow_id: self.workflow_id.clone(),
            name: signal.as_ref().to_string(),
            args,
        };
        OutboundNext::new(&self.client.interceptors, self.client.provider.as_ref())
            .signal(input)
            .await
    }

    pub async fn query(&self, query: impl AsRef<str>, args: Vec<Payload>) -> Result<Payload, ErrorDetails> {
        let request = QueryRequest {
            name: query.as_ref().to_string(),
            args,
        };
        let reply = self.client.provider.submit_query(&self.workflow_id, request).await?;
        reply.await.map_err(|_| channel_closed("query"))?
    }

    pub async fn query_typed<Out: DeserializeOwned>(
        &self,
        query: impl AsRef<str>,
        args: Vec<Payload>,
    ) -> Result<Out, ErrorDetails> {
        let value = self.query(query, args).await?;
        Json::decode(&value).map_err(|e| encode_error("query", e))
    }

    /// Request cancellation. The workflow observes it at its next wait.
    pub async fn cancel(&self, reason: impl Into<String>) -> Result<(), ErrorDetails> {
        self.client
            .provider
            .enqueue_job(&self.workflow_id, JobKind::CancelWorkflow { reason: reason.into() })
            .await?;
        Ok(())
    }

    /// Submit an update and return once it has been accepted or has an outcome.
    ///
    /// A rejected update still yields a handle; its `result()` reports the rejection.
    pub async fn start_update(
        &self,
        update: impl AsRef<str>,
        options: UpdateOptions,
    ) -> Result<UpdateHandle, ErrorDetails> {
        let update_id = options
            .update_id
            .unwrap_or_else(|| self.client.generate_update_id(&self.workflow_id));
        let input = StartUpdateInput {
            workflow_id: self.workflow_id.clone(),
            update_id,
            name: update.as_ref().to_string(),
            args: options.args,
        };
        OutboundNext::new(&self.client.interceptors, self.client.provider.as_ref())
            .start_update(input)
            .await
    }

    /// Submit an update and wait for its outcome.
    pub async fn execute_update(&self, update: impl AsRef<str>, options: UpdateOptions) -> Result<Payload, ErrorDetails> {
        self.start_update(update, options).await?.result().await
    }

    pub async fn execute_update_typed<In: Serialize, Out: DeserializeOwned>(
        &self,
        update: impl AsRef<str>,
        input: In,
    ) -> Result<Out, ErrorDetails> {
        let payload = Json::encode(&input).map_err(|e| encode_error("execute_update", e))?;
        let value = self.execute_update(update, UpdateOptions::new(vec![payload])).await?;
        Json::decode(&value).map_err(|e| encode_error("execute_update", e))
    }

    /// Wait for the workflow id to finish, following continue-as-new.
    pub async fn result(&self) -> Result<Payload, ErrorDetails> {
        let mut status = self.client.provider.subscribe_status(&self.workflow_id).await?;
        let terminal = status
            .wait_for(ExecutionStatus::is_terminal)
            .await
            .map(|s| s.clone())
            .map_err(|_| channel_closed("result"))?;
        match terminal {
            ExecutionStatus::Completed(value) => Ok(value),
            ExecutionStatus::Failed(err) => Err(ErrorDetails::Application(err)),
            ExecutionStatus::Cancelled => Err(ErrorDetails::Cancelled {
                reason: "workflow execution cancelled".to_string(),
            }),
            other => Err(ErrorDetails::Infrastructure {
                operation: "result".to_string(),
                message: format!("unexpected terminal status {}", other.label()),
                retryable: false,
            }),
        }
    }
}

/// A submitted update.
#[derive(Debug, Clone)]
pub struct UpdateHandle {
    workflow_id: String,
    update_id: String,
    progress: watch::Receiver<UpdateProgress>,
}

impl UpdateHandle {
    pub(crate) fn new(workflow_id: String, update_id: String, progress: watch::Receiver<UpdateProgress>) -> Self {
        Self {
            workflow_id,
            update_id,
            progress,
        }
    }

    /// Wait until the update is accepted or has an outcome, then wrap it.
    pub(crate) async fn settled(
        workflow_id: String,
        update_id: String,
        progress: watch::Receiver<UpdateProgress>,
        operation: &str,
    ) -> Result<Self, ErrorDetails> {
        let mut waiting = progress.clone();
        let settled = waiting
            .wait_for(UpdateProgress::is_settled)
            .await
            .map(|p| p.clone())
            .map_err(|_| ErrorDetails::Infrastructure {
                operation: operation.to_string(),
                message: "update tracking closed before the update settled".to_string(),
                retryable: true,
            })?;
        tracing::debug!(
            workflow_id = %workflow_id,
            update_id = %update_id,
            settled = ?settled,
            "update settled"
        );
        Ok(Self::new(workflow_id, update_id, progress))
    }

    pub fn update_id(&self) -> &str {
        &self.update_id
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Latest known lifecycle position.
    pub fn progress(&self) -> UpdateProgress {
        self.progress.borrow().clone()
    }

    /// Wait for the outcome: the handler's value, its failure, the rejection, or `NotFound` when
    /// the execution ended first.
    pub async fn result(&self) -> Result<Payload, ErrorDetails> {
        let mut progress = self.progress.clone();
        let outcome = progress
            .wait_for(UpdateProgress::is_terminal)
            .await
            .map(|p| p.outcome())
            .map_err(|_| channel_closed("update_result"))?;
        outcome.unwrap_or_else(|| Err(channel_closed("update_result")))
    }
}
