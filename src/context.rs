//! Workflow-facing API: handler definitions and registration, deterministic waits, and
//! commands for timers, activities and child workflows.
//!
//! Every future here is a leaf that resolves only from execution state; none of them use a
//! waker. The dispatcher re-polls workflow code after each step that could unblock it.

use crate::Payload;
use crate::activation::Command;
use crate::codec::{Codec, Json, decode_args};
use crate::dispatch::handlers::HandlerRecord;
use crate::dispatch::state::ExecutionState;
use crate::error::{ApplicationError, HandlerKind};
use futures::future::FusedFuture;
use serde::{Serialize, de::DeserializeOwned};
use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};
use std::time::Duration;

macro_rules! definition {
    ($(#[$meta:meta])* $ty:ident, $ctor:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub struct $ty {
            name: String,
        }

        impl $ty {
            pub fn name(&self) -> &str {
                &self.name
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.name
            }
        }

        pub fn $ctor(name: impl Into<String>) -> $ty {
            $ty { name: name.into() }
        }
    };
}

definition!(
    /// Named signal handle shared by workflow and client code.
    SignalDefinition,
    define_signal
);
definition!(
    /// Named update handle shared by workflow and client code.
    UpdateDefinition,
    define_update
);
definition!(
    /// Named query handle shared by workflow and client code.
    QueryDefinition,
    define_query
);

/// Handle to the running execution, passed to workflow code.
#[derive(Clone)]
pub struct WorkflowContext {
    state: Rc<RefCell<ExecutionState>>,
}

impl WorkflowContext {
    pub(crate) fn new(state: Rc<RefCell<ExecutionState>>) -> Self {
        Self { state }
    }

    pub fn workflow_id(&self) -> String {
        self.state.borrow().workflow_id.clone()
    }

    pub fn run_id(&self) -> String {
        self.state.borrow().run_id.clone()
    }

    pub fn workflow_type(&self) -> String {
        self.state.borrow().workflow_type.clone()
    }

    pub fn is_replaying(&self) -> bool {
        self.state.borrow().is_replaying
    }

    /// 1-based index of the activation currently being processed.
    pub fn activation_index(&self) -> u64 {
        self.state.borrow().activation_index
    }

    /// Workflow logs are suppressed while replaying history.
    pub fn is_logging_enabled(&self) -> bool {
        !self.is_replaying()
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.state.borrow().is_cancel_requested()
    }

    // ----- handler registration -----

    fn register(&self, name: &str, record: HandlerRecord) {
        let mut state = self.state.borrow_mut();
        state.handlers.register(name, record);
        state.bump_progress();
    }

    pub fn set_signal_handler<F, Fut>(&self, signal: &SignalDefinition, handler: F)
    where
        F: Fn(Vec<Payload>) -> Fut + 'static,
        Fut: Future<Output = Result<(), ApplicationError>> + 'static,
    {
        self.register(signal.name(), HandlerRecord::signal(handler));
    }

    pub fn set_update_handler<F, Fut>(&self, update: &UpdateDefinition, handler: F)
    where
        F: Fn(Vec<Payload>) -> Fut + 'static,
        Fut: Future<Output = Result<Payload, ApplicationError>> + 'static,
    {
        self.register(update.name(), HandlerRecord::update(handler));
    }

    /// Register an update handler guarded by a validator.
    ///
    /// The validator runs synchronously on its own copy of the arguments; returning `Err`
    /// rejects the update before the handler is invoked.
    pub fn set_update_handler_with_validator<F, Fut, V>(&self, update: &UpdateDefinition, handler: F, validator: V)
    where
        F: Fn(Vec<Payload>) -> Fut + 'static,
        Fut: Future<Output = Result<Payload, ApplicationError>> + 'static,
        V: Fn(Vec<Payload>) -> Result<(), ApplicationError> + 'static,
    {
        self.register(update.name(), HandlerRecord::update(handler).with_validator(validator));
    }

    /// Typed update handler: arguments decode as `A` (a tuple for multiple args).
    pub fn set_update_handler_typed<A, R, F, Fut>(&self, update: &UpdateDefinition, handler: F)
    where
        A: DeserializeOwned + 'static,
        R: Serialize + 'static,
        F: Fn(A) -> Fut + 'static,
        Fut: Future<Output = Result<R, ApplicationError>> + 'static,
    {
        let handler = Rc::new(handler);
        self.register(
            update.name(),
            HandlerRecord::update(move |args| {
                let handler = Rc::clone(&handler);
                async move {
                    let input: A = decode_args(args).map_err(ApplicationError::new)?;
                    let out = handler(input).await?;
                    Json::encode(&out).map_err(ApplicationError::new)
                }
            }),
        );
    }

    pub fn set_query_handler<F>(&self, query: &QueryDefinition, handler: F)
    where
        F: Fn(Vec<Payload>) -> Result<Payload, ApplicationError> + 'static,
    {
        self.register(query.name(), HandlerRecord::query(handler));
    }

    /// Remove a handler. Later signals and updates for it are buffered again.
    pub fn unset_handler(&self, kind: HandlerKind, name: &str) -> bool {
        self.state.borrow_mut().handlers.unregister(kind, name).is_some()
    }

    // ----- waits and commands -----

    /// Resolve once `predicate` holds. Fails if the workflow is cancelled first.
    pub fn condition<P>(&self, predicate: P) -> ConditionFuture
    where
        P: Fn() -> bool + 'static,
    {
        ConditionFuture {
            state: Rc::clone(&self.state),
            predicate: Box::new(predicate),
            done: false,
        }
    }

    pub fn sleep(&self, duration: Duration) -> TimerFuture {
        TimerFuture {
            state: Rc::clone(&self.state),
            duration_ms: duration.as_millis() as u64,
            seq: None,
            done: false,
        }
    }

    pub fn execute_activity(&self, activity_type: impl Into<String>, args: Vec<Payload>) -> OperationFuture {
        OperationFuture {
            state: Rc::clone(&self.state),
            op: Operation::Activity {
                activity_type: activity_type.into(),
                args,
            },
            seq: None,
            done: false,
        }
    }

    pub fn execute_child_workflow(&self, workflow_type: impl Into<String>, args: Vec<Payload>) -> OperationFuture {
        OperationFuture {
            state: Rc::clone(&self.state),
            op: Operation::ChildWorkflow {
                workflow_type: workflow_type.into(),
                args,
            },
            seq: None,
            done: false,
        }
    }

    /// Whether code guarded by `patch_id` should run.
    ///
    /// True for new executions, and during replay only when the history carries the marker.
    /// The answer is fixed the first time it is asked.
    pub fn patched(&self, patch_id: &str) -> bool {
        let mut state = self.state.borrow_mut();
        if let Some(decision) = state.patch_decisions.get(patch_id) {
            return *decision;
        }
        let decision = !state.is_replaying || state.notified_patches.contains(patch_id);
        state.patch_decisions.insert(patch_id.to_string(), decision);
        if decision {
            state.commands.push(Command::SetPatchMarker {
                patch_id: patch_id.to_string(),
            });
        }
        decision
    }

    /// End this run and start a fresh one with `args`. The returned future never resolves.
    pub fn continue_as_new(&self, args: Vec<Payload>) -> ContinueAsNewFuture {
        ContinueAsNewFuture {
            state: Rc::clone(&self.state),
            args: Some(args),
        }
    }

    // ----- replay-aware logging -----

    pub fn trace_info(&self, message: impl AsRef<str>) {
        if self.is_logging_enabled() {
            let (workflow_id, activation) = self.log_fields();
            tracing::info!(workflow_id = %workflow_id, activation, "{}", message.as_ref());
        }
    }

    pub fn trace_warn(&self, message: impl AsRef<str>) {
        if self.is_logging_enabled() {
            let (workflow_id, activation) = self.log_fields();
            tracing::warn!(workflow_id = %workflow_id, activation, "{}", message.as_ref());
        }
    }

    pub fn trace_error(&self, message: impl AsRef<str>) {
        if self.is_logging_enabled() {
            let (workflow_id, activation) = self.log_fields();
            tracing::error!(workflow_id = %workflow_id, activation, "{}", message.as_ref());
        }
    }

    fn log_fields(&self) -> (String, u64) {
        let state = self.state.borrow();
        (state.workflow_id.clone(), state.activation_index)
    }
}

impl std::fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("WorkflowContext")
            .field("workflow_id", &state.workflow_id)
            .field("run_id", &state.run_id)
            .finish()
    }
}

#[must_use = "futures do nothing unless awaited"]
pub struct ConditionFuture {
    state: Rc<RefCell<ExecutionState>>,
    predicate: Box<dyn Fn() -> bool>,
    done: bool,
}

impl Future for ConditionFuture {
    type Output = Result<(), ApplicationError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Pending;
        }
        // The predicate is user code: no state borrow may be held while it runs.
        let satisfied = (this.predicate)();
        let mut state = this.state.borrow_mut();
        let outcome = if satisfied {
            Ok(())
        } else if let Some(reason) = state.cancel_requested.clone() {
            Err(ApplicationError::cancelled(reason))
        } else {
            return Poll::Pending;
        };
        this.done = true;
        state.bump_progress();
        Poll::Ready(outcome)
    }
}

impl FusedFuture for ConditionFuture {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

#[must_use = "futures do nothing unless awaited"]
pub struct TimerFuture {
    state: Rc<RefCell<ExecutionState>>,
    duration_ms: u64,
    seq: Option<u32>,
    done: bool,
}

impl Future for TimerFuture {
    type Output = Result<(), ApplicationError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Pending;
        }
        let mut state = this.state.borrow_mut();
        let seq = match this.seq {
            Some(seq) => seq,
            None => {
                let seq = state.next_timer_seq();
                state.commands.push(Command::StartTimer {
                    seq,
                    duration_ms: this.duration_ms,
                });
                this.seq = Some(seq);
                seq
            }
        };
        let outcome = if state.fired_timers.remove(&seq) {
            Ok(())
        } else if let Some(reason) = state.cancel_requested.clone() {
            state.commands.push(Command::CancelTimer { seq });
            Err(ApplicationError::cancelled(reason))
        } else {
            return Poll::Pending;
        };
        this.done = true;
        state.bump_progress();
        Poll::Ready(outcome)
    }
}

impl FusedFuture for TimerFuture {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

enum Operation {
    Activity { activity_type: String, args: Vec<Payload> },
    ChildWorkflow { workflow_type: String, args: Vec<Payload> },
}

/// Activity or child workflow result. Resolves from the matching resolution job.
#[must_use = "futures do nothing unless awaited"]
pub struct OperationFuture {
    state: Rc<RefCell<ExecutionState>>,
    op: Operation,
    seq: Option<u32>,
    done: bool,
}

impl Future for OperationFuture {
    type Output = Result<Payload, ApplicationError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.done {
            return Poll::Pending;
        }
        let mut state = this.state.borrow_mut();
        let seq = match this.seq {
            Some(seq) => seq,
            None => {
                let seq = match &this.op {
                    Operation::Activity { activity_type, args } => {
                        let seq = state.next_activity_seq();
                        state.commands.push(Command::ScheduleActivity {
                            seq,
                            activity_type: activity_type.clone(),
                            args: args.clone(),
                        });
                        seq
                    }
                    Operation::ChildWorkflow { workflow_type, args } => {
                        let seq = state.next_child_seq();
                        state.commands.push(Command::StartChildWorkflow {
                            seq,
                            workflow_type: workflow_type.clone(),
                            args: args.clone(),
                        });
                        seq
                    }
                };
                this.seq = Some(seq);
                seq
            }
        };
        let resolved = match this.op {
            Operation::Activity { .. } => state.activity_results.remove(&seq),
            Operation::ChildWorkflow { .. } => state.child_results.remove(&seq),
        };
        match resolved {
            Some(result) => {
                this.done = true;
                state.bump_progress();
                Poll::Ready(result)
            }
            None => Poll::Pending,
        }
    }
}

impl FusedFuture for OperationFuture {
    fn is_terminated(&self) -> bool {
        self.done
    }
}

#[must_use = "futures do nothing unless awaited"]
pub struct ContinueAsNewFuture {
    state: Rc<RefCell<ExecutionState>>,
    args: Option<Vec<Payload>>,
}

impl Future for ContinueAsNewFuture {
    type Output = Result<Payload, ApplicationError>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(args) = this.args.take() {
            let mut state = this.state.borrow_mut();
            state.continue_as_new = Some(args);
            state.bump_progress();
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    fn ctx() -> (WorkflowContext, Rc<RefCell<ExecutionState>>) {
        let state = Rc::new(RefCell::new(ExecutionState::new("wf", "run-1", "test")));
        (WorkflowContext::new(Rc::clone(&state)), state)
    }

    fn poll<F: Future + Unpin>(fut: &mut F) -> Poll<F::Output> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(fut).poll(&mut cx)
    }

    #[test]
    fn definitions_carry_names() {
        let update = define_update("update");
        assert_eq!(update.name(), "update");
        assert_eq!(define_signal("s").as_ref(), "s");
        assert_eq!(define_query("q"), define_query("q"));
    }

    #[test]
    fn condition_resolves_when_predicate_holds() {
        let (ctx, _) = ctx();
        let flag = Rc::new(std::cell::Cell::new(false));
        let seen = flag.clone();
        let mut fut = ctx.condition(move || seen.get());
        assert!(poll(&mut fut).is_pending());
        flag.set(true);
        assert!(matches!(poll(&mut fut), Poll::Ready(Ok(()))));
        assert!(fut.is_terminated());
    }

    #[test]
    fn condition_fails_on_cancellation() {
        let (ctx, state) = ctx();
        let mut fut = ctx.condition(|| false);
        assert!(poll(&mut fut).is_pending());
        state.borrow_mut().cancel_requested = Some("stop".into());
        match poll(&mut fut) {
            Poll::Ready(Err(e)) => {
                assert!(e.is_cancellation());
                assert_eq!(e.message, "stop");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn timer_emits_command_once_and_fires() {
        let (ctx, state) = ctx();
        let mut timer = ctx.sleep(Duration::from_millis(250));
        assert!(poll(&mut timer).is_pending());
        assert!(poll(&mut timer).is_pending());
        assert_eq!(
            state.borrow().commands,
            vec![Command::StartTimer {
                seq: 1,
                duration_ms: 250
            }]
        );
        state.borrow_mut().fired_timers.insert(1);
        assert!(matches!(poll(&mut timer), Poll::Ready(Ok(()))));
    }

    #[test]
    fn activities_get_sequential_ids() {
        let (ctx, state) = ctx();
        let mut a = ctx.execute_activity("charge", vec![Payload::from(1)]);
        let mut b = ctx.execute_activity("ship", vec![]);
        assert!(poll(&mut a).is_pending());
        assert!(poll(&mut b).is_pending());
        state.borrow_mut().activity_results.insert(2, Ok(Payload::from("shipped")));
        assert!(poll(&mut a).is_pending());
        assert!(matches!(poll(&mut b), Poll::Ready(Ok(v)) if v == "shipped"));
    }

    #[test]
    fn patched_is_sticky_and_respects_replay() {
        let (ctx, state) = ctx();
        state.borrow_mut().is_replaying = true;
        assert!(!ctx.patched("fix-1"));
        state.borrow_mut().is_replaying = false;
        // Decision made during replay stands.
        assert!(!ctx.patched("fix-1"));
        assert!(ctx.patched("fix-2"));
        assert_eq!(
            state.borrow().commands,
            vec![Command::SetPatchMarker {
                patch_id: "fix-2".into()
            }]
        );
    }

    #[test]
    fn continue_as_new_records_args_and_stays_pending() {
        let (ctx, state) = ctx();
        let mut fut = ctx.continue_as_new(vec![Payload::from(3)]);
        assert!(poll(&mut fut).is_pending());
        assert!(poll(&mut fut).is_pending());
        assert_eq!(state.borrow().continue_as_new, Some(vec![Payload::from(3)]));
    }
}
