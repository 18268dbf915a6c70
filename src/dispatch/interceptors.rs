//! Inbound (handler-side) interceptors.
//!
//! Each hook receives its input and a [`Next`] continuation. Calling `next.run(input)` passes
//! control inward; not calling it short-circuits the invocation. Interceptors run in
//! registration order: the first registered is outermost, the last sits next to the handler.

use crate::Payload;
use crate::error::ApplicationError;
use futures::future::LocalBoxFuture;
use std::rc::Rc;

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateInput {
    pub update_id: String,
    pub name: String,
    pub args: Vec<Payload>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalInput {
    pub name: String,
    pub args: Vec<Payload>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryInput {
    pub query_id: String,
    pub name: String,
    pub args: Vec<Payload>,
}

pub type UpdateFuture = LocalBoxFuture<'static, Result<Payload, ApplicationError>>;
pub type SignalFuture = LocalBoxFuture<'static, Result<(), ApplicationError>>;

/// Continuation into the rest of the chain.
pub struct Next<I, O> {
    f: Rc<dyn Fn(I) -> O>,
}

impl<I, O> Next<I, O> {
    pub fn new(f: impl Fn(I) -> O + 'static) -> Self {
        Self { f: Rc::new(f) }
    }

    pub fn run(&self, input: I) -> O {
        (self.f)(input)
    }
}

impl<I, O> Clone for Next<I, O> {
    fn clone(&self) -> Self {
        Self { f: Rc::clone(&self.f) }
    }
}

pub trait WorkflowInboundInterceptor {
    /// Wraps the update validator. Returning `Err` rejects the update.
    fn validate_update(
        &self,
        input: UpdateInput,
        next: Next<UpdateInput, Result<(), ApplicationError>>,
    ) -> Result<(), ApplicationError> {
        next.run(input)
    }

    fn handle_update(&self, input: UpdateInput, next: Next<UpdateInput, UpdateFuture>) -> UpdateFuture {
        next.run(input)
    }

    fn handle_signal(&self, input: SignalInput, next: Next<SignalInput, SignalFuture>) -> SignalFuture {
        next.run(input)
    }

    fn handle_query(
        &self,
        input: QueryInput,
        next: Next<QueryInput, Result<Payload, ApplicationError>>,
    ) -> Result<Payload, ApplicationError> {
        next.run(input)
    }
}

type Hook<I, O> = fn(&dyn WorkflowInboundInterceptor, I, Next<I, O>) -> O;

/// Ordered, immutable interceptor list shared by every execution of a worker.
#[derive(Clone, Default)]
pub struct InboundChain {
    interceptors: Rc<[Rc<dyn WorkflowInboundInterceptor>]>,
}

impl InboundChain {
    pub fn new(interceptors: Vec<Rc<dyn WorkflowInboundInterceptor>>) -> Self {
        Self {
            interceptors: interceptors.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Fold the interceptors around `terminal`, innermost last.
    fn compose<I: 'static, O: 'static>(&self, terminal: Next<I, O>, hook: Hook<I, O>) -> Next<I, O> {
        self.interceptors.iter().rev().fold(terminal, |inner, interceptor| {
            let interceptor = Rc::clone(interceptor);
            Next::new(move |input| hook(&*interceptor, input, inner.clone()))
        })
    }

    pub fn validate_update(
        &self,
        input: UpdateInput,
        terminal: impl Fn(UpdateInput) -> Result<(), ApplicationError> + 'static,
    ) -> Result<(), ApplicationError> {
        self.compose(Next::new(terminal), |i, input, next| i.validate_update(input, next))
            .run(input)
    }

    pub fn handle_update(
        &self,
        input: UpdateInput,
        terminal: impl Fn(UpdateInput) -> UpdateFuture + 'static,
    ) -> UpdateFuture {
        self.compose(Next::new(terminal), |i, input, next| i.handle_update(input, next))
            .run(input)
    }

    pub fn handle_signal(
        &self,
        input: SignalInput,
        terminal: impl Fn(SignalInput) -> SignalFuture + 'static,
    ) -> SignalFuture {
        self.compose(Next::new(terminal), |i, input, next| i.handle_signal(input, next))
            .run(input)
    }

    pub fn handle_query(
        &self,
        input: QueryInput,
        terminal: impl Fn(QueryInput) -> Result<Payload, ApplicationError> + 'static,
    ) -> Result<Payload, ApplicationError> {
        self.compose(Next::new(terminal), |i, input, next| i.handle_query(input, next))
            .run(input)
    }
}
