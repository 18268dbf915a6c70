use super::admission::order_jobs;
use super::buffer::Offer;
use super::handlers::HandlerRecord;
use super::interceptors::{InboundChain, QueryInput, SignalFuture, SignalInput, UpdateFuture, UpdateInput};
use super::state::ExecutionState;
use super::updates::{Admission, UpdateState};
use super::{DispatchOptions, UnhandledUpdatePolicy};
use crate::Payload;
use crate::activation::{
    Activation, ActivationCompletion, Command, ExecutionStatus, Job, JobKind, QueryResponse, SignalFailure,
    UpdateResponse, kind_of,
};
use crate::context::WorkflowContext;
use crate::error::{ApplicationError, ErrorDetails, HandlerKind};
use crate::runtime::registry::{WorkflowFuture, WorkflowHandler};
use futures::future::LocalBoxFuture;
use futures::task::noop_waker;
use std::cell::{Cell, RefCell};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, warn};

const VALIDATE_SHORT_CIRCUIT: &str = "Update validation short-circuited by interceptor";
const HANDLE_SHORT_CIRCUIT: &str = "Update handler short-circuited by interceptor";

/// A signal or update handler invocation that suspended.
enum HandlerTask {
    Update {
        update_id: String,
        /// Set once the chain reached the registered handler.
        reached: Rc<Cell<bool>>,
        fut: UpdateFuture,
    },
    Signal {
        name: String,
        fut: SignalFuture,
    },
}

enum TaskOutcome {
    Update(Result<Payload, ApplicationError>),
    Signal(Result<(), ApplicationError>),
}

impl HandlerTask {
    fn poll(&mut self) -> Poll<TaskOutcome> {
        match self {
            HandlerTask::Update { fut, .. } => poll_guarded(fut, "update handler").map(TaskOutcome::Update),
            HandlerTask::Signal { fut, .. } => poll_guarded(fut, "signal handler").map(TaskOutcome::Signal),
        }
    }
}

/// Poll once with a no-op waker; a panic resolves the future with an error.
fn poll_guarded<T>(fut: &mut LocalBoxFuture<'static, Result<T, ApplicationError>>, context: &str) -> Poll<Result<T, ApplicationError>> {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    match catch_unwind(AssertUnwindSafe(|| fut.as_mut().poll(&mut cx))) {
        Ok(poll) => poll,
        Err(panic) => Poll::Ready(Err(ApplicationError::from_panic(panic, context))),
    }
}

/// Drives one workflow run from activation to activation until it reaches a terminal state.
pub struct WorkflowExecution {
    workflow_id: String,
    run_id: String,
    state: Rc<RefCell<ExecutionState>>,
    workflow: Arc<dyn WorkflowHandler>,
    chain: InboundChain,
    options: DispatchOptions,
    main: Option<WorkflowFuture>,
    main_polled: bool,
    tasks: Vec<HandlerTask>,
    status: ExecutionStatus,
}

impl WorkflowExecution {
    pub fn new(
        workflow_id: impl Into<String>,
        run_id: impl Into<String>,
        workflow_type: impl Into<String>,
        workflow: Arc<dyn WorkflowHandler>,
        chain: InboundChain,
        options: DispatchOptions,
    ) -> Self {
        let workflow_id = workflow_id.into();
        let run_id = run_id.into();
        let state = ExecutionState::new(workflow_id.clone(), run_id.clone(), workflow_type);
        Self {
            workflow_id,
            run_id,
            state: Rc::new(RefCell::new(state)),
            workflow,
            chain,
            options,
            main: None,
            main_polled: false,
            tasks: Vec::new(),
            status: ExecutionStatus::Running,
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn status(&self) -> &ExecutionStatus {
        &self.status
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Number of signal/update jobs still waiting for a handler.
    pub fn buffered_jobs(&self) -> usize {
        self.state.borrow().buffer.len()
    }

    /// Process one activation and return everything it produced.
    pub fn activate(&mut self, activation: Activation) -> ActivationCompletion {
        if activation.run_id != self.run_id {
            warn!(
                workflow_id = %self.workflow_id,
                run_id = %self.run_id,
                activation_run_id = %activation.run_id,
                "activation addressed to a different run"
            );
        }
        self.state.borrow_mut().begin_activation(activation.is_replaying);

        let jobs = order_jobs(activation.jobs);
        debug!(
            workflow_id = %self.workflow_id,
            run_id = %self.run_id,
            job_count = jobs.len(),
            replaying = activation.is_replaying,
            "processing activation"
        );

        for job in jobs {
            if self.is_terminal() {
                self.apply_after_terminal(job);
                continue;
            }
            self.apply(job);
            self.run_to_quiescence();
        }

        if !self.is_terminal()
            && self.options.unhandled_updates == UnhandledUpdatePolicy::RejectAtEndOfActivation
            && self.reject_unhandled_updates()
            && self.dispatch_ready()
        {
            // Signals queued behind the rejected updates ran; let the workflow react to them.
            self.run_to_quiescence();
        }

        let status = self.status.clone();
        self.state.borrow_mut().take_completion(status)
    }

    fn apply(&mut self, job: Job) {
        debug!(
            workflow_id = %self.workflow_id,
            sequence = job.sequence,
            job = kind_of(&job.kind),
            "applying job"
        );
        match job.kind {
            JobKind::StartWorkflow { .. } => self.start_main(job),
            JobKind::Signal { .. } => self.offer(job),
            JobKind::Update {
                ref id, ref name, ref args, ..
            } => {
                let admission = self
                    .state
                    .borrow_mut()
                    .updates
                    .admit(id, name, args.clone(), job.sequence);
                match admission {
                    Admission::New => self.offer(job),
                    Admission::Duplicate(state) => {
                        debug!(
                            workflow_id = %self.workflow_id,
                            update_id = %id,
                            state,
                            "duplicate update delivery ignored"
                        );
                    }
                }
            }
            JobKind::Query { id, name, args } => self.answer_query(id, name, args),
            JobKind::FireTimer { seq } => {
                let mut state = self.state.borrow_mut();
                state.fired_timers.insert(seq);
                state.bump_progress();
            }
            JobKind::ResolveActivity { seq, result } => {
                let mut state = self.state.borrow_mut();
                state.activity_results.insert(seq, result);
                state.bump_progress();
            }
            JobKind::ResolveChildWorkflow { seq, result } => {
                let mut state = self.state.borrow_mut();
                state.child_results.insert(seq, result);
                state.bump_progress();
            }
            JobKind::NotifyPatch { patch_id } => {
                self.state.borrow_mut().notified_patches.insert(patch_id);
            }
            JobKind::CancelWorkflow { reason } => {
                let mut state = self.state.borrow_mut();
                if state.cancel_requested.is_none() {
                    debug!(workflow_id = %self.workflow_id, reason = %reason, "cancellation requested");
                    state.cancel_requested = Some(reason);
                    state.bump_progress();
                }
            }
        }
    }

    /// Jobs that arrive in the same activation after the run finished.
    fn apply_after_terminal(&mut self, job: Job) {
        match job.kind {
            JobKind::Update { id, .. } => {
                self.state.borrow_mut().update_responses.push(UpdateResponse::Rejected {
                    id,
                    error: ErrorDetails::already_completed(),
                });
            }
            JobKind::Query { id, name, args } => self.answer_query(id, name, args),
            other => {
                debug!(
                    workflow_id = %self.workflow_id,
                    job = kind_of(&other),
                    status = self.status.label(),
                    "dropping job for finished execution"
                );
            }
        }
    }

    fn start_main(&mut self, job: Job) {
        let JobKind::StartWorkflow { workflow_type, args } = job.kind else {
            return;
        };
        if self.main.is_some() || self.main_polled {
            warn!(workflow_id = %self.workflow_id, "duplicate start job ignored");
            return;
        }
        let ctx = WorkflowContext::new(Rc::clone(&self.state));
        let workflow = Arc::clone(&self.workflow);
        match catch_unwind(AssertUnwindSafe(|| workflow.start(ctx, args))) {
            Ok(fut) => {
                debug!(workflow_id = %self.workflow_id, workflow_type = %workflow_type, "workflow started");
                self.main = Some(fut);
            }
            Err(panic) => self.complete_main(Err(ApplicationError::from_panic(panic, "workflow"))),
        }
    }

    /// Buffer a signal/update whose handler is missing, or dispatch it now.
    fn offer(&mut self, job: Job) {
        let update_id = match &job.kind {
            JobKind::Update { id, .. } => Some(id.clone()),
            _ => None,
        };
        let offered = {
            let mut guard = self.state.borrow_mut();
            let state = &mut *guard;
            let handlers = &state.handlers;
            state.buffer.offer(job, |key| handlers.contains(key))
        };
        match offered {
            Offer::Forward(job) => self.dispatch(job),
            Offer::Buffered => {
                if let Some(id) = update_id {
                    self.transition(&id, UpdateState::Buffered);
                }
            }
        }
    }

    fn dispatch(&mut self, job: Job) {
        match job.kind {
            JobKind::Signal { name, args } => self.run_signal(name, args),
            JobKind::Update {
                id, name, run_validator, ..
            } => self.run_update(id, name, run_validator),
            other => {
                debug!(job = kind_of(&other), "job has no handler dispatch");
            }
        }
    }

    fn run_signal(&mut self, name: String, args: Vec<Payload>) {
        let record = self
            .state
            .borrow()
            .handlers
            .lookup(HandlerKind::Signal, &name)
            .map(|r| r.record.clone());
        let Some(HandlerRecord::Signal { handler }) = record else {
            return;
        };
        let input = SignalInput { name: name.clone(), args };
        let chain = self.chain.clone();
        match catch_unwind(AssertUnwindSafe(|| {
            chain.handle_signal(input, move |input| handler(input.args))
        })) {
            Ok(fut) => self.spawn(HandlerTask::Signal { name, fut }),
            Err(panic) => self.record_signal_failure(name, ApplicationError::from_panic(panic, "signal handler")),
        }
    }

    fn run_update(&mut self, id: String, name: String, run_validator: bool) {
        let (record, args) = {
            let state = self.state.borrow();
            let record = state
                .handlers
                .lookup(HandlerKind::Update, &name)
                .map(|r| r.record.clone());
            (record, state.updates.args_snapshot(&id).unwrap_or_default())
        };
        let Some(HandlerRecord::Update { handler, validator }) = record else {
            self.reject_update(&id, ErrorDetails::no_handler(HandlerKind::Update, name));
            return;
        };

        self.transition(&id, UpdateState::Validating);
        if run_validator {
            let reached = Rc::new(Cell::new(false));
            let flag = Rc::clone(&reached);
            let input = UpdateInput {
                update_id: id.clone(),
                name: name.clone(),
                args: args.clone(),
            };
            let chain = self.chain.clone();
            let validated = catch_unwind(AssertUnwindSafe(|| {
                chain.validate_update(input, move |input| {
                    flag.set(true);
                    match &validator {
                        Some(validate) => validate(input.args),
                        None => Ok(()),
                    }
                })
            }))
            .unwrap_or_else(|panic| Err(ApplicationError::from_panic(panic, "update validator")));

            let validated = match validated {
                Ok(()) if !reached.get() => Err(ApplicationError::new(VALIDATE_SHORT_CIRCUIT)),
                other => other,
            };
            if let Err(err) = validated {
                debug!(workflow_id = %self.workflow_id, update_id = %id, error = %err, "update rejected by validation");
                self.reject_update(&id, ErrorDetails::Validation(err));
                return;
            }
        }

        self.transition(&id, UpdateState::Accepted);
        {
            let mut state = self.state.borrow_mut();
            state.update_responses.push(UpdateResponse::Accepted { id: id.clone() });
        }
        self.transition(&id, UpdateState::Executing);

        let reached = Rc::new(Cell::new(false));
        let flag = Rc::clone(&reached);
        // The handler gets a fresh snapshot, untouched by whatever validation did.
        let input = UpdateInput {
            update_id: id.clone(),
            name,
            args,
        };
        let chain = self.chain.clone();
        match catch_unwind(AssertUnwindSafe(|| {
            chain.handle_update(input, move |input| {
                flag.set(true);
                handler(input.args)
            })
        })) {
            Ok(fut) => self.spawn(HandlerTask::Update {
                update_id: id,
                reached,
                fut,
            }),
            Err(panic) => self.settle_update(&id, true, Err(ApplicationError::from_panic(panic, "update handler"))),
        }
    }

    fn answer_query(&mut self, id: String, name: String, args: Vec<Payload>) {
        let record = self
            .state
            .borrow()
            .handlers
            .lookup(HandlerKind::Query, &name)
            .map(|r| r.record.clone());
        let commands_before = self.state.borrow().commands.len();

        let result = match record {
            Some(HandlerRecord::Query { handler }) => {
                let input = QueryInput {
                    query_id: id.clone(),
                    name: name.clone(),
                    args,
                };
                let chain = self.chain.clone();
                catch_unwind(AssertUnwindSafe(|| {
                    chain.handle_query(input, move |input| handler(input.args))
                }))
                .unwrap_or_else(|panic| Err(ApplicationError::from_panic(panic, "query handler")))
                .map_err(ErrorDetails::Application)
            }
            _ => Err(ErrorDetails::no_handler(HandlerKind::Query, &name)),
        };

        let mut state = self.state.borrow_mut();
        let result = if state.commands.len() > commands_before {
            state.commands.truncate(commands_before);
            warn!(workflow_id = %self.workflow_id, query = %name, "query handler emitted commands");
            Err(ErrorDetails::Application(ApplicationError::new(format!(
                "query handler {name} must not emit commands"
            ))))
        } else {
            result
        };
        state.query_responses.push(QueryResponse { id, result });
    }

    /// Poll a fresh handler invocation once; keep it if it suspends.
    fn spawn(&mut self, mut task: HandlerTask) {
        self.state.borrow_mut().bump_progress();
        match task.poll() {
            Poll::Pending => self.tasks.push(task),
            Poll::Ready(outcome) => self.settle(task, outcome),
        }
    }

    fn settle(&mut self, task: HandlerTask, outcome: TaskOutcome) {
        match (task, outcome) {
            (HandlerTask::Update { update_id, reached, .. }, TaskOutcome::Update(result)) => {
                self.settle_update(&update_id, reached.get(), result)
            }
            (HandlerTask::Signal { name, .. }, TaskOutcome::Signal(Err(err))) => self.record_signal_failure(name, err),
            _ => {}
        }
    }

    fn settle_update(&mut self, id: &str, reached: bool, result: Result<Payload, ApplicationError>) {
        let result = match result {
            Ok(value) if !reached => Err(ApplicationError::new(HANDLE_SHORT_CIRCUIT).with_details(value)),
            other => other,
        };
        let response = match result {
            Ok(value) => {
                self.transition(id, UpdateState::Completed(value.clone()));
                UpdateResponse::Completed {
                    id: id.to_string(),
                    value,
                }
            }
            Err(error) => {
                debug!(workflow_id = %self.workflow_id, update_id = %id, error = %error, "update handler failed");
                self.transition(id, UpdateState::Failed(error.clone()));
                UpdateResponse::Failed {
                    id: id.to_string(),
                    error,
                }
            }
        };
        self.state.borrow_mut().update_responses.push(response);
    }

    fn reject_update(&mut self, id: &str, error: ErrorDetails) {
        self.transition(id, UpdateState::Rejected(error.clone()));
        self.state.borrow_mut().update_responses.push(UpdateResponse::Rejected {
            id: id.to_string(),
            error,
        });
    }

    fn record_signal_failure(&mut self, name: String, error: ApplicationError) {
        warn!(workflow_id = %self.workflow_id, signal = %name, error = %error, "signal handler failed");
        self.state
            .borrow_mut()
            .signal_failures
            .push(SignalFailure { name, error });
    }

    fn transition(&self, id: &str, next: UpdateState) {
        if let Err(err) = self.state.borrow_mut().updates.transition(id, next) {
            warn!(workflow_id = %self.workflow_id, error = %err, "update lifecycle violation");
        }
    }

    /// Repeat drain/poll passes until one pass changes nothing.
    fn run_to_quiescence(&mut self) {
        let mut passes = 0usize;
        while !self.is_terminal() {
            passes += 1;
            if passes > self.options.max_passes_per_activation {
                let err = ApplicationError::new(format!(
                    "workflow did not settle after {} dispatch passes",
                    self.options.max_passes_per_activation
                ))
                .non_retryable();
                warn!(workflow_id = %self.workflow_id, passes, "dispatch pass limit exceeded");
                self.terminate(
                    ExecutionStatus::Failed(err.clone()),
                    Command::FailWorkflowExecution { failure: err },
                );
                return;
            }

            let before = self.state.borrow().progress();
            let mut moved = self.drain_buffered();
            moved |= self.poll_main();
            moved |= self.poll_tasks();
            if self.check_continue_as_new() {
                return;
            }
            if !moved && self.state.borrow().progress() == before {
                return;
            }
        }
    }

    /// Dispatch buffered jobs whose handlers were registered, earliest arrival first.
    fn drain_buffered(&mut self) -> bool {
        let registered = self.state.borrow_mut().handlers.take_registrations();
        if registered.is_empty() {
            return false;
        }
        debug!(
            workflow_id = %self.workflow_id,
            registered = ?registered.iter().map(ToString::to_string).collect::<Vec<_>>(),
            "handlers registered, checking buffered jobs"
        );
        self.dispatch_ready()
    }

    /// Dispatch queue heads whose handler exists until none is left.
    fn dispatch_ready(&mut self) -> bool {
        let mut moved = false;
        while !self.is_terminal() {
            let next = {
                let mut guard = self.state.borrow_mut();
                let state = &mut *guard;
                let handlers = &state.handlers;
                state.buffer.take_next_ready(|key| handlers.contains(key))
            };
            let Some(job) = next else {
                break;
            };
            moved = true;
            debug!(
                workflow_id = %self.workflow_id,
                sequence = job.sequence,
                job = kind_of(&job.kind),
                "dispatching buffered job"
            );
            self.dispatch(job);
        }
        moved
    }

    fn poll_main(&mut self) -> bool {
        let Some(fut) = self.main.as_mut() else {
            return false;
        };
        let first_poll = !self.main_polled;
        self.main_polled = true;
        match poll_guarded(fut, "workflow") {
            Poll::Pending => {
                if first_poll {
                    self.state.borrow_mut().bump_progress();
                }
                first_poll
            }
            Poll::Ready(result) => {
                self.main = None;
                self.complete_main(result);
                true
            }
        }
    }

    fn poll_tasks(&mut self) -> bool {
        let mut moved = false;
        let mut i = 0;
        while i < self.tasks.len() && !self.is_terminal() {
            match self.tasks[i].poll() {
                Poll::Pending => i += 1,
                Poll::Ready(outcome) => {
                    let task = self.tasks.remove(i);
                    self.settle(task, outcome);
                    moved = true;
                }
            }
        }
        moved
    }

    fn check_continue_as_new(&mut self) -> bool {
        let requested = self.state.borrow_mut().continue_as_new.take();
        match requested {
            Some(args) => {
                debug!(workflow_id = %self.workflow_id, "workflow continued as new");
                self.terminate(
                    ExecutionStatus::ContinuedAsNew { args: args.clone() },
                    Command::ContinueAsNewWorkflowExecution { args },
                );
                true
            }
            None => false,
        }
    }

    fn complete_main(&mut self, result: Result<Payload, ApplicationError>) {
        let cancel_requested = self.state.borrow().is_cancel_requested();
        match result {
            Ok(value) => self.terminate(
                ExecutionStatus::Completed(value.clone()),
                Command::CompleteWorkflowExecution { result: value },
            ),
            Err(err) if err.is_cancellation() && cancel_requested => {
                self.terminate(ExecutionStatus::Cancelled, Command::CancelWorkflowExecution)
            }
            Err(err) => self.terminate(
                ExecutionStatus::Failed(err.clone()),
                Command::FailWorkflowExecution { failure: err },
            ),
        }
    }

    /// Enter a terminal state: emit the final command and drop everything still pending.
    fn terminate(&mut self, status: ExecutionStatus, command: Command) {
        if self.is_terminal() {
            return;
        }
        debug!(
            workflow_id = %self.workflow_id,
            run_id = %self.run_id,
            status = status.label(),
            "execution reached terminal state"
        );
        self.status = status;
        self.main = None;

        if !self.tasks.is_empty() {
            let unfinished: Vec<String> = self
                .tasks
                .iter()
                .map(|t| match t {
                    HandlerTask::Update { update_id, .. } => format!("update:{update_id}"),
                    HandlerTask::Signal { name, .. } => format!("signal:{name}"),
                })
                .collect();
            warn!(
                workflow_id = %self.workflow_id,
                unfinished = ?unfinished,
                "workflow finished while handlers were still running"
            );
        }
        self.tasks.clear();

        let abandoned = {
            let mut state = self.state.borrow_mut();
            state.commands.push(command);
            state.buffer.abandon()
        };
        for job in abandoned {
            match job.kind {
                JobKind::Update { id, name, .. } => {
                    self.reject_update(&id, ErrorDetails::no_handler(HandlerKind::Update, name));
                }
                other => {
                    debug!(
                        workflow_id = %self.workflow_id,
                        job = kind_of(&other),
                        "dropping buffered job at termination"
                    );
                }
            }
        }
    }

    /// Returns whether anything was rejected.
    fn reject_unhandled_updates(&mut self) -> bool {
        let unhandled = self.state.borrow_mut().buffer.take_kind(HandlerKind::Update);
        let rejected = !unhandled.is_empty();
        for job in unhandled {
            if let JobKind::Update { id, name, .. } = job.kind {
                debug!(workflow_id = %self.workflow_id, update_id = %id, update = %name, "rejecting unhandled update");
                self.reject_update(&id, ErrorDetails::no_handler(HandlerKind::Update, name));
            }
        }
        rejected
    }
}

// Include comprehensive tests
#[path = "execution_tests.rs"]
mod execution_tests;
