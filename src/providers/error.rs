/// Provider-specific error with retry classification
///
/// Providers return this error type so callers can tell a transient failure of the
/// orchestration layer apart from a request that can never succeed.
///
/// # Error Classification
///
/// **Transient (is_retryable = true)**:
/// - Lock contention
/// - Temporary resource exhaustion
///
/// **Permanent (is_retryable = false)**:
/// - Malformed request
/// - Stale run
///
/// **AlreadyStarted (is_retryable = false)**:
/// - Workflow id already taken
///
/// **NotFound (is_retryable = false)**:
/// - Unknown workflow id
/// - Execution already terminal
///
/// # Example Usage
///
/// ```rust,no_run
/// use durable_dispatch::providers::ProviderError;
///
/// # fn example() -> Result<(), ProviderError> {
/// return Err(ProviderError::retryable("submit_update", "queue is full"));
/// # }
///
/// # fn example2() -> Result<(), ProviderError> {
/// return Err(ProviderError::unknown_execution("submit_update", "wf-1"));
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    /// Operation that failed (e.g., "start_workflow", "submit_update")
    pub operation: String,
    /// Human-readable error message
    pub message: String,
    pub kind: ProviderErrorKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderErrorKind {
    Transient,
    Permanent,
    NotFound,
    AlreadyStarted { workflow_id: String, workflow_type: String },
}

impl ProviderError {
    /// Create a retryable (transient) error
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: ProviderErrorKind::Transient,
        }
    }

    /// Create a non-retryable (permanent) error
    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: ProviderErrorKind::Permanent,
        }
    }

    pub fn not_found(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind: ProviderErrorKind::NotFound,
        }
    }

    /// The execution exists but has already reached a terminal state.
    pub fn already_completed(operation: impl Into<String>) -> Self {
        Self::not_found(operation, crate::error::ALREADY_COMPLETED)
    }

    /// No execution with this id was ever started.
    pub fn unknown_execution(operation: impl Into<String>, workflow_id: &str) -> Self {
        Self::not_found(operation, format!("workflow execution not found: {workflow_id}"))
    }

    /// A start was refused because `workflow_id` is taken.
    pub fn already_started(operation: impl Into<String>, workflow_id: &str, workflow_type: &str) -> Self {
        Self {
            operation: operation.into(),
            message: format!("workflow execution already started: {workflow_id}"),
            kind: ProviderErrorKind::AlreadyStarted {
                workflow_id: workflow_id.to_string(),
                workflow_type: workflow_type.to_string(),
            },
        }
    }

    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        self.kind == ProviderErrorKind::Transient
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ProviderErrorKind::NotFound
    }

    /// Convert to the caller-visible classification.
    ///
    /// `NotFound` keeps its message verbatim so callers can match on it, `AlreadyStarted` keeps
    /// its own classification, and everything else becomes `ErrorDetails::Infrastructure`.
    pub fn to_error_details(&self) -> crate::ErrorDetails {
        match &self.kind {
            ProviderErrorKind::NotFound => crate::ErrorDetails::NotFound {
                message: self.message.clone(),
            },
            ProviderErrorKind::AlreadyStarted {
                workflow_id,
                workflow_type,
            } => crate::ErrorDetails::already_started(workflow_id, workflow_type),
            _ => crate::ErrorDetails::Infrastructure {
                operation: self.operation.clone(),
                message: self.message.clone(),
                retryable: self.is_retryable(),
            },
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.operation, self.message)
    }
}

impl std::error::Error for ProviderError {}

impl From<ProviderError> for crate::ErrorDetails {
    fn from(err: ProviderError) -> Self {
        err.to_error_details()
    }
}

/// String errors are treated as transient.
impl From<String> for ProviderError {
    fn from(s: String) -> Self {
        Self::retryable("unknown", s)
    }
}

impl From<&str> for ProviderError {
    fn from(s: &str) -> Self {
        s.to_string().into()
    }
}
