use super::buffer::BufferedJobStore;
use super::handlers::HandlerRegistry;
use super::updates::UpdateTracker;
use crate::Payload;
use crate::activation::{ActivationCompletion, Command, ExecutionStatus, QueryResponse, SignalFailure, UpdateResponse};
use crate::error::ApplicationError;
use std::collections::{BTreeMap, BTreeSet};

/// Everything one workflow execution owns: handlers, buffered jobs, pending updates and the
/// results of the sub-operations its code is waiting on.
///
/// Only the execution's own dispatch loop touches this, one step at a time.
#[derive(Debug)]
pub struct ExecutionState {
    pub workflow_id: String,
    pub run_id: String,
    pub workflow_type: String,

    pub handlers: HandlerRegistry,
    pub buffer: BufferedJobStore,
    pub updates: UpdateTracker,

    pub(crate) commands: Vec<Command>,
    pub(crate) update_responses: Vec<UpdateResponse>,
    pub(crate) query_responses: Vec<QueryResponse>,
    pub(crate) signal_failures: Vec<SignalFailure>,

    next_timer_seq: u32,
    next_activity_seq: u32,
    next_child_seq: u32,
    pub(crate) fired_timers: BTreeSet<u32>,
    pub(crate) activity_results: BTreeMap<u32, Result<Payload, ApplicationError>>,
    pub(crate) child_results: BTreeMap<u32, Result<Payload, ApplicationError>>,
    pub(crate) notified_patches: BTreeSet<String>,
    pub(crate) patch_decisions: BTreeMap<String, bool>,

    pub(crate) cancel_requested: Option<String>,
    pub(crate) continue_as_new: Option<Vec<Payload>>,

    pub(crate) is_replaying: bool,
    pub(crate) activation_index: u64,
    /// Bumped whenever something happens that may unblock workflow code.
    progress: u64,
}

impl ExecutionState {
    pub fn new(workflow_id: impl Into<String>, run_id: impl Into<String>, workflow_type: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
            workflow_type: workflow_type.into(),
            handlers: HandlerRegistry::new(),
            buffer: BufferedJobStore::new(),
            updates: UpdateTracker::new(),
            commands: Vec::new(),
            update_responses: Vec::new(),
            query_responses: Vec::new(),
            signal_failures: Vec::new(),
            next_timer_seq: 1,
            next_activity_seq: 1,
            next_child_seq: 1,
            fired_timers: BTreeSet::new(),
            activity_results: BTreeMap::new(),
            child_results: BTreeMap::new(),
            notified_patches: BTreeSet::new(),
            patch_decisions: BTreeMap::new(),
            cancel_requested: None,
            continue_as_new: None,
            is_replaying: false,
            activation_index: 0,
            progress: 0,
        }
    }

    pub(crate) fn begin_activation(&mut self, is_replaying: bool) {
        self.activation_index += 1;
        self.is_replaying = is_replaying;
    }

    pub(crate) fn next_timer_seq(&mut self) -> u32 {
        let seq = self.next_timer_seq;
        self.next_timer_seq += 1;
        seq
    }

    pub(crate) fn next_activity_seq(&mut self) -> u32 {
        let seq = self.next_activity_seq;
        self.next_activity_seq += 1;
        seq
    }

    pub(crate) fn next_child_seq(&mut self) -> u32 {
        let seq = self.next_child_seq;
        self.next_child_seq += 1;
        seq
    }

    pub(crate) fn bump_progress(&mut self) {
        self.progress += 1;
    }

    pub(crate) fn progress(&self) -> u64 {
        self.progress
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.is_some()
    }

    /// Move this activation's outputs into a completion.
    pub(crate) fn take_completion(&mut self, status: ExecutionStatus) -> ActivationCompletion {
        ActivationCompletion {
            run_id: self.run_id.clone(),
            commands: std::mem::take(&mut self.commands),
            update_responses: std::mem::take(&mut self.update_responses),
            query_responses: std::mem::take(&mut self.query_responses),
            signal_failures: std::mem::take(&mut self.signal_failures),
            status,
        }
    }
}
