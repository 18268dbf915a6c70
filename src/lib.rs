//! Deterministic job admission and handler dispatch for durable workflow executions.
//!
//! A workflow execution receives batches of jobs ("activations") from an orchestration layer:
//! start, signals, updates, queries, timer fires, activity and child results, cancellation.
//! This crate decides, identically on every replay, the order those jobs are applied in,
//! which handler runs each one, and what every update's caller observes.
//!
//! - [`dispatch`] orders each batch, buffers signals and updates that arrive before their
//!   handler is registered, and drives the update lifecycle through validation, acceptance
//!   and completion.
//! - [`WorkflowContext`] is what workflow code sees: handler registration, `condition`,
//!   timers, activities, child workflows, patches and continue-as-new.
//! - [`client::Client`] submits signals, updates and queries and waits on their results.
//! - [`providers::InMemoryProvider`] is the in-process orchestration layer and
//!   [`runtime::Worker`] connects it to executions.
//!
//! # Example
//!
//! ```rust,no_run
//! use durable_dispatch::client::{Client, UpdateOptions};
//! use durable_dispatch::providers::InMemoryProvider;
//! use durable_dispatch::runtime::{Worker, WorkflowRegistry};
//! use durable_dispatch::{ApplicationError, define_update};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = WorkflowRegistry::builder()
//!     .register("greeter", |ctx, _args| async move {
//!         let greet = define_update("greet");
//!         ctx.set_update_handler(&greet, |args| async move {
//!             Ok(json!(format!("hello {}", args[0])))
//!         });
//!         ctx.condition(|| false).await?;
//!         Ok::<_, ApplicationError>(json!(null))
//!     })
//!     .build();
//!
//! let provider = Arc::new(InMemoryProvider::new());
//! let mut worker = Worker::new(provider.clone(), registry);
//! let client = Client::new(provider);
//! let handle = client.start_workflow("wf-1", "greeter", vec![]).await?;
//! let reply = worker
//!     .run_until(handle.execute_update("greet", UpdateOptions::new(vec![json!("you")])))
//!     .await?;
//! assert_eq!(reply, json!("hello \"you\""));
//! # Ok(())
//! # }
//! ```

/// Opaque argument and result value carried by jobs, handlers and commands.
pub type Payload = serde_json::Value;

pub mod activation;
pub mod client;
pub mod codec;
pub mod context;
pub mod correlator;
pub mod dispatch;
pub mod error;
pub mod logging;
pub mod providers;
pub mod runtime;

pub use activation::{
    Activation, ActivationCompletion, Command, ExecutionStatus, Job, JobKind, QueryResponse, SignalFailure,
    UpdateResponse,
};
pub use codec::{Codec, Json};
pub use context::{
    QueryDefinition, SignalDefinition, UpdateDefinition, WorkflowContext, define_query, define_signal, define_update,
};
pub use correlator::{CompletionCorrelator, UpdateProgress};
pub use dispatch::interceptors::{Next, QueryInput, SignalInput, UpdateInput, WorkflowInboundInterceptor};
pub use dispatch::{DispatchOptions, UnhandledUpdatePolicy, WorkflowExecution};
pub use error::{ALREADY_COMPLETED, ApplicationError, ErrorDetails, HandlerKind};
