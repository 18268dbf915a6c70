//! Workflow type registry.
//!
//! Maps a workflow type name to the function that runs it. Built once through
//! [`WorkflowRegistryBuilder`] and shared by every execution the worker drives.

use crate::Payload;
use crate::codec::{Codec, Json, decode_args};
use crate::context::WorkflowContext;
use crate::error::ApplicationError;
use futures::future::{FutureExt, LocalBoxFuture};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

pub type WorkflowFuture = LocalBoxFuture<'static, Result<Payload, ApplicationError>>;

/// Entry point of a workflow type.
///
/// The returned future runs on the execution's dispatch loop and is never sent across threads.
pub trait WorkflowHandler: Send + Sync {
    fn start(&self, ctx: WorkflowContext, args: Vec<Payload>) -> WorkflowFuture;
}

/// Function wrapper that implements `WorkflowHandler`.
pub struct FnWorkflow<F>(pub F);

impl<F, Fut> WorkflowHandler for FnWorkflow<F>
where
    F: Fn(WorkflowContext, Vec<Payload>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Payload, ApplicationError>> + 'static,
{
    fn start(&self, ctx: WorkflowContext, args: Vec<Payload>) -> WorkflowFuture {
        (self.0)(ctx, args).boxed_local()
    }
}

#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    inner: Arc<HashMap<String, Arc<dyn WorkflowHandler>>>,
}

pub struct WorkflowRegistryBuilder {
    map: HashMap<String, Arc<dyn WorkflowHandler>>,
    errors: Vec<String>,
}

impl WorkflowRegistry {
    pub fn builder() -> WorkflowRegistryBuilder {
        WorkflowRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn resolve(&self, workflow_type: &str) -> Option<Arc<dyn WorkflowHandler>> {
        let found = self.inner.get(workflow_type).cloned();
        if found.is_none() {
            self.log_registry_miss(workflow_type);
        }
        found
    }

    /// Registered workflow types, sorted.
    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has(&self, workflow_type: &str) -> bool {
        self.inner.contains_key(workflow_type)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }

    fn log_registry_miss(&self, workflow_type: &str) {
        let all_names = self.list_names();
        tracing::debug!(
            target: "durable_dispatch::runtime::registry",
            requested_name = %workflow_type,
            registered_count = all_names.len(),
            registered_names = ?all_names,
            "Registry lookup miss - dumping registered workflow types"
        );
    }
}

impl WorkflowRegistryBuilder {
    pub fn build(self) -> WorkflowRegistry {
        WorkflowRegistry {
            inner: Arc::new(self.map),
        }
    }

    /// Build the registry, returning an error if any registration was rejected.
    ///
    /// # Errors
    ///
    /// Returns all registration errors joined with `"; "`.
    pub fn build_result(self) -> Result<WorkflowRegistry, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    fn insert(&mut self, name: String, handler: Arc<dyn WorkflowHandler>) {
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate workflow registration: {name}"));
            return;
        }
        self.map.insert(name, handler);
    }

    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(WorkflowContext, Vec<Payload>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Payload, ApplicationError>> + 'static,
    {
        self.insert(name.into(), Arc::new(FnWorkflow(f)));
        self
    }

    /// Register a workflow whose arguments decode as `In` and whose result encodes from `Out`.
    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + 'static,
        Out: serde::Serialize + 'static,
        F: Fn(WorkflowContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<Out, ApplicationError>> + 'static,
    {
        let wrapper = move |ctx: WorkflowContext, args: Vec<Payload>| {
            let f_inner = f.clone();
            async move {
                let input: In = decode_args(args).map_err(ApplicationError::new)?;
                let out: Out = f_inner(ctx, input).await?;
                Json::encode(&out).map_err(ApplicationError::new)
            }
        };
        self.insert(name.into(), Arc::new(FnWorkflow(wrapper)));
        self
    }

    pub fn merge(mut self, other: WorkflowRegistry) -> Self {
        for (name, handler) in other.inner.iter() {
            if self.map.contains_key(name) {
                self.errors.push(format!("duplicate workflow in merge: {name}"));
            } else {
                self.map.insert(name.clone(), Arc::clone(handler));
            }
        }
        self
    }
}
