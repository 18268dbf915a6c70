#![allow(dead_code)]

pub mod tracing_capture;

use durable_dispatch::client::{Client, WorkflowClientInterceptor};
use durable_dispatch::providers::InMemoryProvider;
use durable_dispatch::runtime::{Worker, WorkerOptions, WorkflowRegistry};
use durable_dispatch::{
    ApplicationError, HandlerKind, Payload, WorkflowContext, WorkflowInboundInterceptor, define_query, define_signal,
    define_update,
};
use serde_json::json;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

/// Provider, worker and client wired together, the way an embedding process would.
pub struct Harness {
    pub provider: Arc<InMemoryProvider>,
    pub worker: Worker,
    pub client: Client,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(WorkerOptions::default(), Vec::new(), Vec::new())
    }

    pub fn with_options(options: WorkerOptions) -> Self {
        Self::build(options, Vec::new(), Vec::new())
    }

    pub fn with_interceptors(
        inbound: Vec<Rc<dyn WorkflowInboundInterceptor>>,
        outbound: Vec<Arc<dyn WorkflowClientInterceptor>>,
    ) -> Self {
        Self::build(WorkerOptions::default(), inbound, outbound)
    }

    fn build(
        options: WorkerOptions,
        inbound: Vec<Rc<dyn WorkflowInboundInterceptor>>,
        outbound: Vec<Arc<dyn WorkflowClientInterceptor>>,
    ) -> Self {
        let provider = Arc::new(InMemoryProvider::new());
        let worker = Worker::new(provider.clone(), registry())
            .with_options(WorkerOptions {
                dispatcher_idle_sleep_ms: 1,
                ..options
            })
            .with_interceptors(inbound);
        let client = Client::new(provider.clone()).with_interceptors(outbound);
        Self {
            provider,
            worker,
            client,
        }
    }
}

pub fn registry() -> WorkflowRegistry {
    WorkflowRegistry::builder()
        .register("updates", updates_workflow)
        .register("mutating-validator", mutating_validator_workflow)
        .register("late-signal", late_signal_workflow)
        .register("counter", counter_workflow)
        .register("blocking-update", blocking_update_workflow)
        .register("looper", looper_workflow)
        .register("logging", logging_workflow)
        .build()
}

pub fn arg_str(args: &[Payload]) -> String {
    args.first().and_then(Payload::as_str).unwrap_or_default().to_string()
}

/// Records update arguments in arrival order; finishes with `"$"` once "done-update" runs.
///
/// The "update" validator rejects `"bad-arg"`; its handler fails on `"fail-update"`.
pub async fn updates_workflow(ctx: WorkflowContext, _args: Vec<Payload>) -> Result<Payload, ApplicationError> {
    let state = Rc::new(RefCell::new(Vec::<String>::new()));
    let s = Rc::clone(&state);
    ctx.set_update_handler_with_validator(
        &define_update("update"),
        move |args| {
            let s = Rc::clone(&s);
            async move {
                let arg = arg_str(&args);
                s.borrow_mut().push(arg.clone());
                if arg == "fail-update" {
                    return Err(ApplicationError::new("Deliberate ApplicationFailure in handler"));
                }
                Ok(json!(s.borrow().clone()))
            }
        },
        |args| {
            if arg_str(&args) == "bad-arg" {
                Err(ApplicationError::new("Validation failed"))
            } else {
                Ok(())
            }
        },
    );
    let s = Rc::clone(&state);
    ctx.set_update_handler(&define_update("done-update"), move |_args| {
        s.borrow_mut().push("done".to_string());
        async { Ok(Payload::Null) }
    });
    let s = Rc::clone(&state);
    ctx.condition(move || s.borrow().iter().any(|v| v == "done")).await?;
    state.borrow_mut().push("$".to_string());
    Ok(json!(state.borrow().clone()))
}

/// The validator overwrites the first element of its argument copy.
pub async fn mutating_validator_workflow(ctx: WorkflowContext, _args: Vec<Payload>) -> Result<Payload, ApplicationError> {
    ctx.set_update_handler_with_validator(
        &define_update("updateWithMutableArg"),
        |args| async move { Ok(args.first().cloned().unwrap_or_default()) },
        |mut args| {
            if let Some(Payload::Array(inner)) = args.first_mut() {
                inner[0] = json!("mutated!");
            }
            Ok(())
        },
    );
    ctx.condition(|| false).await?;
    Ok(Payload::Null)
}

fn install_late_signal_handler(ctx: &WorkflowContext, name: &str, state: Rc<RefCell<Vec<String>>>) {
    let handler_ctx = ctx.clone();
    ctx.set_signal_handler(&define_signal(name), move |args| {
        let arg = arg_str(&args);
        state.borrow_mut().push(arg.clone());
        if arg == "register-handler" {
            install_late_signal_handler(&handler_ctx, "late-signal", Rc::clone(&state));
        }
        async { Ok(()) }
    });
}

/// "signal" is registered up front; "late-signal" only once "signal" receives "register-handler".
pub async fn late_signal_workflow(ctx: WorkflowContext, _args: Vec<Payload>) -> Result<Payload, ApplicationError> {
    let state = Rc::new(RefCell::new(Vec::<String>::new()));
    install_late_signal_handler(&ctx, "signal", Rc::clone(&state));
    let s = Rc::clone(&state);
    ctx.condition(move || s.borrow().iter().any(|v| v == "done")).await?;
    state.borrow_mut().push("$".to_string());
    Ok(json!(state.borrow().clone()))
}

/// Counter driven by an "increment" signal, read by "getValue", bumped by "incrementAndGetValue".
/// A negative increment fails the signal handler.
pub async fn counter_workflow(ctx: WorkflowContext, args: Vec<Payload>) -> Result<Payload, ApplicationError> {
    let count = Rc::new(Cell::new(args.first().and_then(Payload::as_i64).unwrap_or(0)));
    let c = Rc::clone(&count);
    ctx.set_signal_handler(&define_signal("increment"), move |args| {
        let by = args.first().and_then(Payload::as_i64).unwrap_or(0);
        let result = if by < 0 {
            Err(ApplicationError::new("negative increment"))
        } else {
            c.set(c.get() + by);
            Ok(())
        };
        async move { result }
    });
    let c = Rc::clone(&count);
    ctx.set_query_handler(&define_query("getValue"), move |_args| Ok(json!(c.get())));
    let c = Rc::clone(&count);
    ctx.set_update_handler(&define_update("incrementAndGetValue"), move |args| {
        c.set(c.get() + args.first().and_then(Payload::as_i64).unwrap_or(0));
        let value = c.get();
        async move { Ok(json!(value)) }
    });
    let c = Rc::clone(&count);
    ctx.condition(move || c.get() >= 100).await?;
    Ok(json!(count.get()))
}

/// "block" is accepted but never finishes; the "finish" signal completes the workflow.
pub async fn blocking_update_workflow(ctx: WorkflowContext, _args: Vec<Payload>) -> Result<Payload, ApplicationError> {
    let handler_ctx = ctx.clone();
    ctx.set_update_handler(&define_update("block"), move |_args| {
        let wait = handler_ctx.condition(|| false);
        async move {
            wait.await?;
            Ok(Payload::Null)
        }
    });
    let finished = Rc::new(Cell::new(false));
    let f = Rc::clone(&finished);
    ctx.set_signal_handler(&define_signal("finish"), move |_args| {
        f.set(true);
        async { Ok(()) }
    });
    let f = Rc::clone(&finished);
    ctx.condition(move || f.get()).await?;
    // Later signals for this name are buffered again and dropped at completion.
    ctx.unset_handler(HandlerKind::Signal, "finish");
    Ok(json!("finished"))
}

/// Continues as new with `n + 1` until `n` reaches 2.
pub async fn looper_workflow(ctx: WorkflowContext, args: Vec<Payload>) -> Result<Payload, ApplicationError> {
    let n = args.first().and_then(Payload::as_i64).unwrap_or(0);
    if n < 2 {
        return ctx.continue_as_new(vec![json!(n + 1)]).await;
    }
    Ok(json!(n))
}

pub async fn logging_workflow(ctx: WorkflowContext, _args: Vec<Payload>) -> Result<Payload, ApplicationError> {
    durable_dispatch::durable_info!(ctx, "workflow says hello");
    ctx.trace_warn("workflow warns");
    Ok(Payload::Null)
}
