//! Caller-side (outbound) interceptors.
//!
//! Interceptors wrap update submission and signal delivery before the request reaches the
//! provider. The first interceptor supplied to the client is the outermost; each decides whether
//! and with what input to call [`OutboundNext`].

use super::UpdateHandle;
use crate::Payload;
use crate::activation::JobKind;
use crate::error::ErrorDetails;
use crate::providers::{Provider, UpdateRequest};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct StartUpdateInput {
    pub workflow_id: String,
    pub update_id: String,
    pub name: String,
    pub args: Vec<Payload>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalWorkflowInput {
    pub workflow_id: String,
    pub name: String,
    pub args: Vec<Payload>,
}

/// Hooks around caller-side operations. Defaults pass the input through unchanged.
#[async_trait::async_trait]
pub trait WorkflowClientInterceptor: Send + Sync {
    async fn start_update(
        &self,
        input: StartUpdateInput,
        next: OutboundNext<'_>,
    ) -> Result<UpdateHandle, ErrorDetails> {
        next.start_update(input).await
    }

    async fn signal(&self, input: SignalWorkflowInput, next: OutboundNext<'_>) -> Result<(), ErrorDetails> {
        next.signal(input).await
    }
}

/// The remainder of the outbound chain.
pub struct OutboundNext<'a> {
    rest: &'a [Arc<dyn WorkflowClientInterceptor>],
    provider: &'a dyn Provider,
}

impl<'a> OutboundNext<'a> {
    pub(crate) fn new(interceptors: &'a [Arc<dyn WorkflowClientInterceptor>], provider: &'a dyn Provider) -> Self {
        Self {
            rest: interceptors,
            provider,
        }
    }

    pub async fn start_update(self, input: StartUpdateInput) -> Result<UpdateHandle, ErrorDetails> {
        match self.rest.split_first() {
            Some((first, rest)) => {
                first
                    .start_update(
                        input,
                        OutboundNext {
                            rest,
                            provider: self.provider,
                        },
                    )
                    .await
            }
            None => submit_update(self.provider, input).await,
        }
    }

    pub async fn signal(self, input: SignalWorkflowInput) -> Result<(), ErrorDetails> {
        match self.rest.split_first() {
            Some((first, rest)) => {
                first
                    .signal(
                        input,
                        OutboundNext {
                            rest,
                            provider: self.provider,
                        },
                    )
                    .await
            }
            None => {
                self.provider
                    .enqueue_job(&input.workflow_id, JobKind::signal(input.name, input.args))
                    .await?;
                Ok(())
            }
        }
    }
}

/// Submit to the provider and wait until the update is accepted or has an outcome.
async fn submit_update(provider: &dyn Provider, input: StartUpdateInput) -> Result<UpdateHandle, ErrorDetails> {
    let request = UpdateRequest {
        update_id: input.update_id.clone(),
        name: input.name,
        args: input.args,
    };
    let progress = provider.submit_update(&input.workflow_id, request).await?;
    UpdateHandle::settled(input.workflow_id, input.update_id, progress, "start_update").await
}
