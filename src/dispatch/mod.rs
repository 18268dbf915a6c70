//! Per-execution dispatch core.
//!
//! An activation's jobs are ordered by [`admission::order_jobs`], then applied one at a time.
//! After each job the execution is driven to quiescence: buffered jobs whose handlers now
//! exist are dispatched, the main workflow future and every running handler are polled, and
//! this repeats until a full pass changes nothing.

pub mod admission;
pub mod buffer;
pub mod execution;
pub mod handlers;
pub mod interceptors;
pub mod state;
pub mod updates;

pub use execution::WorkflowExecution;

/// What happens to an update that is still waiting for its handler when an activation settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnhandledUpdatePolicy {
    /// Reject it with `"Update has no handler: <name>"`.
    #[default]
    RejectAtEndOfActivation,
    /// Keep it buffered, like a signal, until a handler appears or the execution ends.
    BufferUntilRegistered,
}

/// Options applied to every execution a worker drives.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Upper bound on drive passes per job; exceeding it fails the workflow.
    pub max_passes_per_activation: usize,
    pub unhandled_updates: UnhandledUpdatePolicy,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            max_passes_per_activation: 10_000,
            unhandled_updates: UnhandledUpdatePolicy::default(),
        }
    }
}
