//! Types exchanged with the orchestration layer: the jobs of an activation going in,
//! and the commands and responses of an activation completion coming out.

use crate::Payload;
use crate::error::{ApplicationError, ErrorDetails, HandlerKind};
use serde::{Deserialize, Serialize};

/// A single unit of work within an activation.
///
/// `sequence` is the issuance order recorded by the orchestration layer. Batches are not
/// assumed to arrive sorted by it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub sequence: u64,
    #[serde(flatten)]
    pub kind: JobKind,
}

impl Job {
    pub fn new(sequence: u64, kind: JobKind) -> Self {
        Self { sequence, kind }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    StartWorkflow {
        workflow_type: String,
        args: Vec<Payload>,
    },
    Signal {
        name: String,
        args: Vec<Payload>,
    },
    Update {
        id: String,
        name: String,
        args: Vec<Payload>,
        /// False when replaying an update that was already accepted.
        #[serde(default = "default_true")]
        run_validator: bool,
    },
    Query {
        id: String,
        name: String,
        args: Vec<Payload>,
    },
    FireTimer {
        seq: u32,
    },
    ResolveActivity {
        seq: u32,
        result: Result<Payload, ApplicationError>,
    },
    ResolveChildWorkflow {
        seq: u32,
        result: Result<Payload, ApplicationError>,
    },
    NotifyPatch {
        patch_id: String,
    },
    CancelWorkflow {
        reason: String,
    },
}

fn default_true() -> bool {
    true
}

impl JobKind {
    pub fn update(id: impl Into<String>, name: impl Into<String>, args: Vec<Payload>) -> Self {
        JobKind::Update {
            id: id.into(),
            name: name.into(),
            args,
            run_validator: true,
        }
    }

    pub fn signal(name: impl Into<String>, args: Vec<Payload>) -> Self {
        JobKind::Signal {
            name: name.into(),
            args,
        }
    }

    /// Target handler name for signal, update and query jobs.
    pub fn target_name(&self) -> Option<&str> {
        match self {
            JobKind::Signal { name, .. } | JobKind::Update { name, .. } | JobKind::Query { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Handler namespace addressed by this job, if any.
    pub fn handler_kind(&self) -> Option<HandlerKind> {
        match self {
            JobKind::Signal { .. } => Some(HandlerKind::Signal),
            JobKind::Update { .. } => Some(HandlerKind::Update),
            JobKind::Query { .. } => Some(HandlerKind::Query),
            _ => None,
        }
    }

    pub fn is_signal_or_update(&self) -> bool {
        matches!(self, JobKind::Signal { .. } | JobKind::Update { .. })
    }
}

pub fn kind_of(job: &JobKind) -> &'static str {
    match job {
        JobKind::StartWorkflow { .. } => "StartWorkflow",
        JobKind::Signal { .. } => "Signal",
        JobKind::Update { .. } => "Update",
        JobKind::Query { .. } => "Query",
        JobKind::FireTimer { .. } => "FireTimer",
        JobKind::ResolveActivity { .. } => "ResolveActivity",
        JobKind::ResolveChildWorkflow { .. } => "ResolveChildWorkflow",
        JobKind::NotifyPatch { .. } => "NotifyPatch",
        JobKind::CancelWorkflow { .. } => "CancelWorkflow",
    }
}

/// One batch of jobs delivered to a single workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Activation {
    pub run_id: String,
    pub is_replaying: bool,
    pub jobs: Vec<Job>,
}

/// Instructions produced by workflow code for the orchestration layer to carry out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    StartTimer {
        seq: u32,
        duration_ms: u64,
    },
    CancelTimer {
        seq: u32,
    },
    ScheduleActivity {
        seq: u32,
        activity_type: String,
        args: Vec<Payload>,
    },
    StartChildWorkflow {
        seq: u32,
        workflow_type: String,
        args: Vec<Payload>,
    },
    SetPatchMarker {
        patch_id: String,
    },
    CompleteWorkflowExecution {
        result: Payload,
    },
    FailWorkflowExecution {
        failure: ApplicationError,
    },
    CancelWorkflowExecution,
    ContinueAsNewWorkflowExecution {
        args: Vec<Payload>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UpdateResponse {
    Accepted { id: String },
    Rejected { id: String, error: ErrorDetails },
    Completed { id: String, value: Payload },
    Failed { id: String, error: ApplicationError },
}

impl UpdateResponse {
    pub fn update_id(&self) -> &str {
        match self {
            UpdateResponse::Accepted { id }
            | UpdateResponse::Rejected { id, .. }
            | UpdateResponse::Completed { id, .. }
            | UpdateResponse::Failed { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub id: String,
    pub result: Result<Payload, ErrorDetails>,
}

/// A signal handler that failed; scoped to that signal, the workflow keeps running.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalFailure {
    pub name: String,
    pub error: ApplicationError,
}

/// Lifecycle status of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    Running,
    Completed(Payload),
    Failed(ApplicationError),
    Cancelled,
    ContinuedAsNew { args: Vec<Payload> },
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }

    pub fn label(&self) -> &'static str {
        match self {
            ExecutionStatus::Running => "Running",
            ExecutionStatus::Completed(_) => "Completed",
            ExecutionStatus::Failed(_) => "Failed",
            ExecutionStatus::Cancelled => "Cancelled",
            ExecutionStatus::ContinuedAsNew { .. } => "ContinuedAsNew",
        }
    }
}

/// Everything one activation produced, in the order it was produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationCompletion {
    pub run_id: String,
    pub commands: Vec<Command>,
    pub update_responses: Vec<UpdateResponse>,
    pub query_responses: Vec<QueryResponse>,
    pub signal_failures: Vec<SignalFailure>,
    pub status: ExecutionStatus,
}

impl ActivationCompletion {
    pub fn empty(run_id: impl Into<String>, status: ExecutionStatus) -> Self {
        Self {
            run_id: run_id.into(),
            commands: Vec::new(),
            update_responses: Vec::new(),
            query_responses: Vec::new(),
            signal_failures: Vec::new(),
            status,
        }
    }
}
