use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::{Mutex, oneshot, watch};

use super::{
    ActivationItem, ExecutionSnapshot, Provider, ProviderError, QueryReply, QueryRequest, StartRequest, UpdateRequest,
    WorkflowStartPolicy,
};
use crate::Payload;
use crate::activation::{Activation, ActivationCompletion, Command, ExecutionStatus, Job, JobKind, SignalFailure, kind_of};
use crate::correlator::{CompletionCorrelator, UpdateProgress};
use crate::error::ErrorDetails;

/// Provider that keeps every execution in process memory.
///
/// Each workflow id has one inbox of pending jobs. A lease (`fetch_activation`) takes the whole
/// inbox; jobs issued while the lease is held wait for the next activation.
#[derive(Default)]
pub struct InMemoryProvider {
    inner: Mutex<State>,
}

#[derive(Default)]
struct State {
    executions: HashMap<String, ExecutionRecord>,
    // workflow ids with pending jobs and no activation in flight, oldest first
    ready: VecDeque<String>,
    next_run: u64,
    next_query: u64,
}

struct ExecutionRecord {
    workflow_type: String,
    run_id: String,
    run_count: u32,
    pending: Vec<Job>,
    next_sequence: u64,
    in_flight: bool,
    queued: bool,
    status: watch::Sender<ExecutionStatus>,
    updates: CompletionCorrelator,
    queries: HashMap<String, oneshot::Sender<Result<Payload, ErrorDetails>>>,
    commands: Vec<Command>,
    signal_failures: Vec<SignalFailure>,
}

impl ExecutionRecord {
    fn is_terminal(&self) -> bool {
        self.status.borrow().is_terminal()
    }

    fn issue(&mut self, ready: &mut VecDeque<String>, workflow_id: &str, kind: JobKind) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        tracing::debug!(workflow_id = %workflow_id, sequence, job = kind_of(&kind), "job issued");
        self.pending.push(Job::new(sequence, kind));
        self.schedule(ready, workflow_id);
    }

    fn schedule(&mut self, ready: &mut VecDeque<String>, workflow_id: &str) {
        if !self.in_flight && !self.queued && !self.pending.is_empty() {
            self.queued = true;
            ready.push_back(workflow_id.to_string());
        }
    }

    /// Register `request` with the correlator and issue its job unless the id is already known.
    fn submit_update(
        &mut self,
        ready: &mut VecDeque<String>,
        workflow_id: &str,
        request: UpdateRequest,
    ) -> watch::Receiver<UpdateProgress> {
        let (rx, is_new) = self.updates.register(&request.update_id);
        if is_new {
            self.issue(
                ready,
                workflow_id,
                JobKind::update(request.update_id, request.name, request.args),
            );
        } else {
            tracing::debug!(workflow_id = %workflow_id, update_id = %request.update_id, "update already submitted");
        }
        rx
    }

    /// Resolve everything still waiting on this execution once it is terminal.
    fn close(&mut self, workflow_id: &str) {
        let abandoned = self.updates.abandon_all(ErrorDetails::already_completed());
        self.updates.prune_terminal();
        let dropped_queries = self.queries.len();
        for (_, tx) in self.queries.drain() {
            let _ = tx.send(Err(ErrorDetails::already_completed()));
        }
        let dropped_jobs = self.pending.len();
        self.pending.clear();
        if abandoned + dropped_queries + dropped_jobs > 0 {
            tracing::debug!(
                workflow_id = %workflow_id,
                abandoned_updates = abandoned,
                dropped_queries,
                dropped_jobs,
                "execution closed with outstanding work"
            );
        }
    }
}

impl State {
    /// Create an execution and issue its `StartWorkflow` job. Returns the run id.
    fn create(
        &mut self,
        operation: &str,
        workflow_id: &str,
        workflow_type: &str,
        args: Vec<Payload>,
    ) -> Result<String, ProviderError> {
        if self.executions.contains_key(workflow_id) {
            return Err(ProviderError::already_started(operation, workflow_id, workflow_type));
        }
        self.next_run += 1;
        let run_id = format!("run-{}", self.next_run);
        let (status, _) = watch::channel(ExecutionStatus::Running);
        let mut record = ExecutionRecord {
            workflow_type: workflow_type.to_string(),
            run_id: run_id.clone(),
            run_count: 1,
            pending: Vec::new(),
            next_sequence: 0,
            in_flight: false,
            queued: false,
            status,
            updates: CompletionCorrelator::new(),
            queries: HashMap::new(),
            commands: Vec::new(),
            signal_failures: Vec::new(),
        };
        record.issue(
            &mut self.ready,
            workflow_id,
            JobKind::StartWorkflow {
                workflow_type: workflow_type.to_string(),
                args,
            },
        );
        self.executions.insert(workflow_id.to_string(), record);
        tracing::info!(workflow_id = %workflow_id, run_id = %run_id, workflow_type = %workflow_type, "workflow started");
        Ok(run_id)
    }

    fn is_running(&self, workflow_id: &str) -> bool {
        self.executions
            .get(workflow_id)
            .is_some_and(|record| !record.is_terminal())
    }
}

/// Look up an execution that can still accept work.
fn open_execution<'a>(
    executions: &'a mut HashMap<String, ExecutionRecord>,
    operation: &str,
    workflow_id: &str,
) -> Result<&'a mut ExecutionRecord, ProviderError> {
    match executions.get_mut(workflow_id) {
        None => Err(ProviderError::unknown_execution(operation, workflow_id)),
        Some(record) if record.is_terminal() => Err(ProviderError::already_completed(operation)),
        Some(record) => Ok(record),
    }
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    async fn start_workflow(
        &self,
        workflow_id: &str,
        workflow_type: &str,
        args: Vec<Payload>,
    ) -> Result<String, ProviderError> {
        self.inner
            .lock()
            .await
            .create("start_workflow", workflow_id, workflow_type, args)
    }

    async fn signal_with_start(
        &self,
        workflow_id: &str,
        start: StartRequest,
        signal: String,
        signal_args: Vec<Payload>,
    ) -> Result<String, ProviderError> {
        let mut g = self.inner.lock().await;
        if !g.is_running(workflow_id) {
            g.create("signal_with_start", workflow_id, &start.workflow_type, start.args)?;
        }
        let State { executions, ready, .. } = &mut *g;
        let record = open_execution(executions, "signal_with_start", workflow_id)?;
        record.issue(ready, workflow_id, JobKind::signal(signal, signal_args));
        Ok(record.run_id.clone())
    }

    async fn update_with_start(
        &self,
        workflow_id: &str,
        start: StartRequest,
        policy: WorkflowStartPolicy,
        update: UpdateRequest,
    ) -> Result<(String, watch::Receiver<UpdateProgress>), ProviderError> {
        let mut g = self.inner.lock().await;
        if !g.is_running(workflow_id) {
            g.create("update_with_start", workflow_id, &start.workflow_type, start.args)?;
        } else if policy == WorkflowStartPolicy::Always {
            return Err(ProviderError::already_started(
                "update_with_start",
                workflow_id,
                &start.workflow_type,
            ));
        }
        let State { executions, ready, .. } = &mut *g;
        let record = open_execution(executions, "update_with_start", workflow_id)?;
        let rx = record.submit_update(ready, workflow_id, update);
        Ok((record.run_id.clone(), rx))
    }

    async fn enqueue_job(&self, workflow_id: &str, job: JobKind) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().await;
        let State { executions, ready, .. } = &mut *g;
        let record = open_execution(executions, "enqueue_job", workflow_id)?;
        record.issue(ready, workflow_id, job);
        Ok(())
    }

    async fn submit_update(
        &self,
        workflow_id: &str,
        request: UpdateRequest,
    ) -> Result<watch::Receiver<UpdateProgress>, ProviderError> {
        let mut g = self.inner.lock().await;
        let State { executions, ready, .. } = &mut *g;
        let record = open_execution(executions, "submit_update", workflow_id)?;
        Ok(record.submit_update(ready, workflow_id, request))
    }

    async fn submit_query(&self, workflow_id: &str, request: QueryRequest) -> Result<QueryReply, ProviderError> {
        let mut g = self.inner.lock().await;
        let State {
            executions,
            ready,
            next_query,
            ..
        } = &mut *g;
        let record = open_execution(executions, "submit_query", workflow_id)?;
        *next_query += 1;
        let id = format!("query-{next_query}");
        let (tx, rx) = oneshot::channel();
        record.queries.insert(id.clone(), tx);
        record.issue(
            ready,
            workflow_id,
            JobKind::Query {
                id,
                name: request.name,
                args: request.args,
            },
        );
        Ok(rx)
    }

    async fn fetch_activation(&self) -> Option<ActivationItem> {
        let mut g = self.inner.lock().await;
        let State { executions, ready, .. } = &mut *g;
        while let Some(workflow_id) = ready.pop_front() {
            let Some(record) = executions.get_mut(&workflow_id) else {
                continue;
            };
            record.queued = false;
            if record.in_flight || record.pending.is_empty() {
                continue;
            }
            record.in_flight = true;
            let jobs = std::mem::take(&mut record.pending);
            return Some(ActivationItem {
                workflow_id,
                workflow_type: record.workflow_type.clone(),
                activation: Activation {
                    run_id: record.run_id.clone(),
                    is_replaying: false,
                    jobs,
                },
            });
        }
        None
    }

    async fn complete_activation(
        &self,
        workflow_id: &str,
        completion: ActivationCompletion,
    ) -> Result<(), ProviderError> {
        let mut g = self.inner.lock().await;
        let State {
            executions,
            ready,
            next_run,
            ..
        } = &mut *g;
        let Some(record) = executions.get_mut(workflow_id) else {
            return Err(ProviderError::unknown_execution("complete_activation", workflow_id));
        };
        if completion.run_id != record.run_id {
            return Err(ProviderError::permanent(
                "complete_activation",
                format!("stale run {} (current {})", completion.run_id, record.run_id),
            ));
        }
        record.in_flight = false;
        record.commands.extend(completion.commands);
        record.signal_failures.extend(completion.signal_failures);
        for response in &completion.update_responses {
            record.updates.observe(response);
        }
        for response in completion.query_responses {
            if let Some(tx) = record.queries.remove(&response.id) {
                let _ = tx.send(response.result);
            }
        }

        match completion.status {
            ExecutionStatus::Running => {}
            ExecutionStatus::ContinuedAsNew { args } => {
                *next_run += 1;
                let new_run_id = format!("run-{next_run}");
                tracing::info!(
                    workflow_id = %workflow_id,
                    run_id = %record.run_id,
                    new_run_id = %new_run_id,
                    "workflow continued as new"
                );
                // Jobs not yet delivered belong to the next run.
                let carried = std::mem::take(&mut record.pending);
                let carried_updates: HashSet<String> = carried
                    .iter()
                    .filter_map(|job| match &job.kind {
                        JobKind::Update { id, .. } => Some(id.clone()),
                        _ => None,
                    })
                    .collect();
                record
                    .updates
                    .abandon_unless(|id| carried_updates.contains(id), ErrorDetails::already_completed());
                record.run_id = new_run_id;
                record.run_count += 1;
                let workflow_type = record.workflow_type.clone();
                record.issue(ready, workflow_id, JobKind::StartWorkflow { workflow_type, args });
                record.pending.extend(carried);
            }
            status => {
                tracing::info!(workflow_id = %workflow_id, run_id = %record.run_id, status = status.label(), "workflow finished");
                record.status.send_replace(status);
                record.close(workflow_id);
                return Ok(());
            }
        }
        record.schedule(ready, workflow_id);
        Ok(())
    }

    async fn subscribe_status(&self, workflow_id: &str) -> Result<watch::Receiver<ExecutionStatus>, ProviderError> {
        let g = self.inner.lock().await;
        g.executions
            .get(workflow_id)
            .map(|record| record.status.subscribe())
            .ok_or_else(|| ProviderError::unknown_execution("subscribe_status", workflow_id))
    }

    async fn describe(&self, workflow_id: &str) -> Result<ExecutionSnapshot, ProviderError> {
        let g = self.inner.lock().await;
        let record = g
            .executions
            .get(workflow_id)
            .ok_or_else(|| ProviderError::unknown_execution("describe", workflow_id))?;
        Ok(ExecutionSnapshot {
            workflow_type: record.workflow_type.clone(),
            run_id: record.run_id.clone(),
            run_count: record.run_count,
            status: record.status.borrow().clone(),
            commands: record.commands.clone(),
            signal_failures: record.signal_failures.clone(),
            pending_jobs: record.pending.len(),
            tracked_updates: record.updates.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::UpdateResponse;
    use serde_json::json;

    fn update(id: &str) -> UpdateRequest {
        UpdateRequest {
            update_id: id.to_string(),
            name: "update".to_string(),
            args: vec![json!("1")],
        }
    }

    fn labels(item: &ActivationItem) -> Vec<String> {
        item.activation
            .jobs
            .iter()
            .map(|job| format!("{}#{}", kind_of(&job.kind), job.sequence))
            .collect()
    }

    #[tokio::test]
    async fn jobs_carry_issuance_sequence() {
        let provider = InMemoryProvider::new();
        let run_id = provider.start_workflow("wf", "counter", vec![]).await.unwrap();
        provider.enqueue_job("wf", JobKind::signal("inc", vec![])).await.unwrap();
        provider.submit_update("wf", update("u1")).await.unwrap();

        let item = provider.fetch_activation().await.unwrap();
        assert_eq!(item.workflow_type, "counter");
        assert_eq!(item.activation.run_id, run_id);
        assert_eq!(labels(&item), vec!["StartWorkflow#0", "Signal#1", "Update#2"]);
        assert!(provider.fetch_activation().await.is_none());
    }

    #[tokio::test]
    async fn one_activation_in_flight_per_execution() {
        let provider = InMemoryProvider::new();
        let run_id = provider.start_workflow("wf", "counter", vec![]).await.unwrap();
        let _first = provider.fetch_activation().await.unwrap();

        provider.enqueue_job("wf", JobKind::signal("inc", vec![])).await.unwrap();
        assert!(provider.fetch_activation().await.is_none());

        provider
            .complete_activation("wf", ActivationCompletion::empty(run_id, ExecutionStatus::Running))
            .await
            .unwrap();
        let second = provider.fetch_activation().await.unwrap();
        assert_eq!(labels(&second), vec!["Signal#1"]);
    }

    #[tokio::test]
    async fn duplicate_update_is_not_reissued() {
        let provider = InMemoryProvider::new();
        provider.start_workflow("wf", "w", vec![]).await.unwrap();
        let _ = provider.fetch_activation().await.unwrap();
        provider.submit_update("wf", update("u1")).await.unwrap();
        provider.submit_update("wf", update("u1")).await.unwrap();
        let snapshot = provider.describe("wf").await.unwrap();
        assert_eq!(snapshot.pending_jobs, 1);
    }

    #[tokio::test]
    async fn terminal_execution_rejects_new_work() {
        let provider = InMemoryProvider::new();
        let run_id = provider.start_workflow("wf", "w", vec![]).await.unwrap();
        let _ = provider.fetch_activation().await.unwrap();
        let accepted = provider.submit_update("wf", update("u1")).await.unwrap();

        let mut completion = ActivationCompletion::empty(run_id, ExecutionStatus::Completed(json!("done")));
        completion.commands.push(Command::CompleteWorkflowExecution { result: json!("done") });
        provider.complete_activation("wf", completion).await.unwrap();

        // The update never reached the execution; its caller is told the execution is gone.
        assert_eq!(
            *accepted.borrow(),
            UpdateProgress::Abandoned(ErrorDetails::already_completed())
        );
        let err = provider.submit_update("wf", update("u2")).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_error_details(), ErrorDetails::already_completed());
        let err = provider.enqueue_job("wf", JobKind::signal("s", vec![])).await.unwrap_err();
        assert_eq!(err.message, crate::error::ALREADY_COMPLETED);

        let status = provider.subscribe_status("wf").await.unwrap();
        assert_eq!(*status.borrow(), ExecutionStatus::Completed(json!("done")));
        assert!(provider.fetch_activation().await.is_none());
    }

    #[tokio::test]
    async fn unknown_workflow_is_not_found() {
        let provider = InMemoryProvider::new();
        let err = provider.submit_update("nope", update("u1")).await.unwrap_err();
        assert_eq!(err.to_error_details(), ErrorDetails::unknown_execution("nope"));
        assert!(provider.describe("nope").await.is_err());
    }

    fn start(workflow_type: &str) -> StartRequest {
        StartRequest {
            workflow_type: workflow_type.to_string(),
            args: vec![],
        }
    }

    #[tokio::test]
    async fn duplicate_start_is_already_started() {
        let provider = InMemoryProvider::new();
        provider.start_workflow("wf", "w", vec![]).await.unwrap();
        let err = provider.start_workflow("wf", "w", vec![]).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(!err.is_not_found());
        assert_eq!(err.to_error_details(), ErrorDetails::already_started("wf", "w"));
    }

    #[tokio::test]
    async fn signal_with_start_creates_then_reuses_running_execution() {
        let provider = InMemoryProvider::new();
        let run_id = provider
            .signal_with_start("wf", start("w"), "go".into(), vec![json!(1)])
            .await
            .unwrap();
        let again = provider
            .signal_with_start("wf", start("w"), "go".into(), vec![json!(2)])
            .await
            .unwrap();
        assert_eq!(run_id, again);

        let item = provider.fetch_activation().await.unwrap();
        assert_eq!(labels(&item), vec!["StartWorkflow#0", "Signal#1", "Signal#2"]);
        assert_eq!(provider.describe("wf").await.unwrap().run_count, 1);
    }

    #[tokio::test]
    async fn with_start_never_reuses_a_finished_workflow_id() {
        let provider = InMemoryProvider::new();
        let run_id = provider.start_workflow("wf", "w", vec![]).await.unwrap();
        let _ = provider.fetch_activation().await.unwrap();
        provider
            .complete_activation("wf", ActivationCompletion::empty(run_id, ExecutionStatus::Cancelled))
            .await
            .unwrap();

        let err = provider
            .signal_with_start("wf", start("w"), "go".into(), vec![])
            .await
            .unwrap_err();
        assert_eq!(err.to_error_details(), ErrorDetails::already_started("wf", "w"));
        let err = provider
            .update_with_start("wf", start("w"), WorkflowStartPolicy::IfNotRunning, update("u1"))
            .await
            .unwrap_err();
        assert_eq!(err.to_error_details(), ErrorDetails::already_started("wf", "w"));
    }

    #[tokio::test]
    async fn closing_an_execution_forgets_its_updates() {
        let provider = InMemoryProvider::new();
        let run_id = provider.start_workflow("wf", "w", vec![]).await.unwrap();
        let done = provider.submit_update("wf", update("u1")).await.unwrap();
        let open = provider.submit_update("wf", update("u2")).await.unwrap();
        let _ = provider.fetch_activation().await.unwrap();

        let mut completion = ActivationCompletion::empty(run_id.clone(), ExecutionStatus::Running);
        completion.update_responses.push(UpdateResponse::Accepted { id: "u1".into() });
        completion.update_responses.push(UpdateResponse::Completed {
            id: "u1".into(),
            value: json!(1),
        });
        provider.complete_activation("wf", completion).await.unwrap();
        assert_eq!(provider.describe("wf").await.unwrap().tracked_updates, 2);

        provider.enqueue_job("wf", JobKind::signal("wake", vec![])).await.unwrap();
        let item = provider.fetch_activation().await.unwrap();
        assert_eq!(item.activation.run_id, run_id);
        provider
            .complete_activation("wf", ActivationCompletion::empty(run_id, ExecutionStatus::Cancelled))
            .await
            .unwrap();

        assert_eq!(provider.describe("wf").await.unwrap().tracked_updates, 0);
        assert_eq!(done.borrow().outcome(), Some(Ok(json!(1))));
        assert_eq!(open.borrow().outcome(), Some(Err(ErrorDetails::already_completed())));
    }

    #[tokio::test]
    async fn update_with_start_respects_start_policy() {
        let provider = InMemoryProvider::new();
        let (run_id, first) = provider
            .update_with_start("wf", start("w"), WorkflowStartPolicy::IfNotRunning, update("u1"))
            .await
            .unwrap();
        assert_eq!(*first.borrow(), UpdateProgress::Admitted);

        let (same_run, _) = provider
            .update_with_start("wf", start("w"), WorkflowStartPolicy::IfNotRunning, update("u2"))
            .await
            .unwrap();
        assert_eq!(same_run, run_id);

        let err = provider
            .update_with_start("wf", start("w"), WorkflowStartPolicy::Always, update("u3"))
            .await
            .unwrap_err();
        assert_eq!(err.to_error_details(), ErrorDetails::already_started("wf", "w"));

        let item = provider.fetch_activation().await.unwrap();
        assert_eq!(labels(&item), vec!["StartWorkflow#0", "Update#1", "Update#2"]);
    }

    #[tokio::test]
    async fn responses_reach_waiting_callers() {
        let provider = InMemoryProvider::new();
        let run_id = provider.start_workflow("wf", "w", vec![]).await.unwrap();
        let _ = provider.fetch_activation().await.unwrap();
        let update_rx = provider.submit_update("wf", update("u1")).await.unwrap();
        let query_rx = provider
            .submit_query(
                "wf",
                QueryRequest {
                    name: "count".into(),
                    args: vec![],
                },
            )
            .await
            .unwrap();
        provider
            .complete_activation("wf", ActivationCompletion::empty(run_id.clone(), ExecutionStatus::Running))
            .await
            .unwrap();

        let item = provider.fetch_activation().await.unwrap();
        let query_id = match &item.activation.jobs[1].kind {
            JobKind::Query { id, .. } => id.clone(),
            other => panic!("expected query job, got {other:?}"),
        };
        let mut completion = ActivationCompletion::empty(run_id, ExecutionStatus::Running);
        completion.update_responses.push(UpdateResponse::Accepted { id: "u1".into() });
        completion.update_responses.push(UpdateResponse::Completed {
            id: "u1".into(),
            value: json!(2),
        });
        completion.query_responses.push(crate::activation::QueryResponse {
            id: query_id,
            result: Ok(json!(7)),
        });
        provider.complete_activation("wf", completion).await.unwrap();

        assert_eq!(*update_rx.borrow(), UpdateProgress::Completed(json!(2)));
        assert_eq!(query_rx.await.unwrap(), Ok(json!(7)));
    }

    #[tokio::test]
    async fn continue_as_new_starts_fresh_run_with_carried_jobs() {
        let provider = InMemoryProvider::new();
        let first_run = provider.start_workflow("wf", "looper", vec![json!(0)]).await.unwrap();
        let _ = provider.fetch_activation().await.unwrap();
        let in_flight = provider.submit_update("wf", update("old")).await.unwrap();
        // Delivered to the old run and accepted there, but never finished.
        provider
            .complete_activation(
                "wf",
                ActivationCompletion::empty(first_run.clone(), ExecutionStatus::Running),
            )
            .await
            .unwrap();
        let _ = provider.fetch_activation().await.unwrap();
        let carried = provider.submit_update("wf", update("new")).await.unwrap();

        let mut completion = ActivationCompletion::empty(
            first_run.clone(),
            ExecutionStatus::ContinuedAsNew { args: vec![json!(1)] },
        );
        completion.update_responses.push(UpdateResponse::Accepted { id: "old".into() });
        provider.complete_activation("wf", completion).await.unwrap();

        assert_eq!(
            *in_flight.borrow(),
            UpdateProgress::Abandoned(ErrorDetails::already_completed())
        );
        assert_eq!(*carried.borrow(), UpdateProgress::Admitted);

        let item = provider.fetch_activation().await.unwrap();
        assert_ne!(item.activation.run_id, first_run);
        assert_eq!(labels(&item), vec!["StartWorkflow#3", "Update#2"]);
        match &item.activation.jobs[0].kind {
            JobKind::StartWorkflow { args, .. } => assert_eq!(args, &vec![json!(1)]),
            other => panic!("expected start job, got {other:?}"),
        }
        let snapshot = provider.describe("wf").await.unwrap();
        assert_eq!(snapshot.run_count, 2);
        assert_eq!(snapshot.status, ExecutionStatus::Running);
    }
}
