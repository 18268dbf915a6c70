//! Error taxonomy shared by the dispatcher, the orchestration-layer boundary and the client.
//!
//! Workflow code, handlers, validators and interceptors fail with an [`ApplicationError`].
//! The dispatcher classifies what callers observe with [`ErrorDetails`]:
//!
//! - `Validation`: a validator (or validating interceptor) rejected an update; the handler never ran
//! - `NoHandler`: a signal/update/query name has no registered handler
//! - `Application`: a handler failed while executing; the workflow keeps running
//! - `NotFound`: the target execution is unknown or already terminal (never retried)
//! - `AlreadyStarted`: a start was refused because the workflow id is taken
//! - `Cancelled`: the workflow execution was cancelled
//! - `Infrastructure`: the orchestration layer itself failed

use crate::Payload;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;

/// Message carried by `NotFound` for operations against a terminal execution.
pub const ALREADY_COMPLETED: &str = "workflow execution already completed";

/// Error type used to tag cancellation failures.
pub const CANCELLED_ERROR_TYPE: &str = "CancelledFailure";

/// Failure raised by workflow-authored code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationError {
    pub message: String,
    /// Optional classification, e.g. `"CancelledFailure"` or a user-chosen type name.
    pub error_type: Option<String>,
    pub non_retryable: bool,
    pub details: Option<Payload>,
}

impl ApplicationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            non_retryable: false,
            details: None,
        }
    }

    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_details(mut self, details: Payload) -> Self {
        self.details = Some(details);
        self
    }

    pub fn non_retryable(mut self) -> Self {
        self.non_retryable = true;
        self
    }

    /// Failure produced when a wait is interrupted by a workflow cancellation request.
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(reason).with_type(CANCELLED_ERROR_TYPE).non_retryable()
    }

    pub fn is_cancellation(&self) -> bool {
        self.error_type.as_deref() == Some(CANCELLED_ERROR_TYPE)
    }

    /// Convert a caught panic payload into a failure scoped to `context`.
    pub(crate) fn from_panic(panic: Box<dyn Any + Send>, context: &str) -> Self {
        let msg = if let Some(s) = panic.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = panic.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        Self::new(format!("{context} panicked: {msg}")).with_type("Panic")
    }
}

impl fmt::Display for ApplicationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_type {
            Some(t) => write!(f, "{t}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for ApplicationError {}

impl From<String> for ApplicationError {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl From<&str> for ApplicationError {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// The three handler namespaces a workflow can register into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HandlerKind {
    Signal,
    Update,
    Query,
}

impl HandlerKind {
    pub fn label(&self) -> &'static str {
        match self {
            HandlerKind::Signal => "Signal",
            HandlerKind::Update => "Update",
            HandlerKind::Query => "Query",
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Caller-visible classification of a failed signal, update, query or workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ErrorDetails {
    /// A validator rejected the update before the handler ran.
    Validation(ApplicationError),
    /// No handler is registered for the target name.
    NoHandler { kind: HandlerKind, name: String },
    /// The handler (or workflow) raised an application-level failure.
    Application(ApplicationError),
    /// The execution does not exist or has already reached a terminal state.
    NotFound { message: String },
    /// A workflow with this id was already started.
    AlreadyStarted { workflow_id: String, workflow_type: String },
    /// The workflow execution was cancelled.
    Cancelled { reason: String },
    /// The orchestration layer failed to carry out the operation.
    Infrastructure {
        operation: String,
        message: String,
        retryable: bool,
    },
}

impl ErrorDetails {
    pub fn no_handler(kind: HandlerKind, name: impl Into<String>) -> Self {
        ErrorDetails::NoHandler {
            kind,
            name: name.into(),
        }
    }

    pub fn already_completed() -> Self {
        ErrorDetails::NotFound {
            message: ALREADY_COMPLETED.to_string(),
        }
    }

    pub fn already_started(workflow_id: impl Into<String>, workflow_type: impl Into<String>) -> Self {
        ErrorDetails::AlreadyStarted {
            workflow_id: workflow_id.into(),
            workflow_type: workflow_type.into(),
        }
    }

    pub fn unknown_execution(workflow_id: &str) -> Self {
        ErrorDetails::NotFound {
            message: format!("workflow execution not found: {workflow_id}"),
        }
    }

    /// Message surfaced to callers, verbatim from the validator/handler where one exists.
    pub fn display_message(&self) -> String {
        match self {
            ErrorDetails::Validation(e) | ErrorDetails::Application(e) => e.message.clone(),
            ErrorDetails::NoHandler { kind, name } => format!("{kind} has no handler: {name}"),
            ErrorDetails::NotFound { message } => message.clone(),
            ErrorDetails::AlreadyStarted { workflow_id, .. } => {
                format!("workflow execution already started: {workflow_id}")
            }
            ErrorDetails::Cancelled { reason } => reason.clone(),
            ErrorDetails::Infrastructure { operation, message, .. } => format!("{operation}: {message}"),
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            ErrorDetails::Validation(_) => "validation",
            ErrorDetails::NoHandler { .. } => "no_handler",
            ErrorDetails::Application(_) => "application",
            ErrorDetails::NotFound { .. } => "not_found",
            ErrorDetails::AlreadyStarted { .. } => "already_started",
            ErrorDetails::Cancelled { .. } => "cancelled",
            ErrorDetails::Infrastructure { .. } => "infrastructure",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ErrorDetails::NotFound { .. })
    }

    pub fn is_already_started(&self) -> bool {
        matches!(self, ErrorDetails::AlreadyStarted { .. })
    }

    /// Only infrastructure failures flagged retryable may be retried; `NotFound` never is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorDetails::Infrastructure { retryable: true, .. })
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_message())
    }
}

impl std::error::Error for ErrorDetails {}
