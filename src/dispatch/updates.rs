//! Update lifecycle tracking.
//!
//! ```text
//! Admitted ─┬─> Buffered ─┬─> Validating ─┬─> Rejected
//!           │             └─> Rejected     └─> Accepted ─> Executing ─┬─> Completed
//!           ├─> Validating                                            └─> Failed
//!           └─> Rejected
//! ```

use crate::Payload;
use crate::error::{ApplicationError, ErrorDetails};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateState {
    Admitted,
    Buffered,
    Validating,
    Rejected(ErrorDetails),
    Accepted,
    Executing,
    Completed(Payload),
    Failed(ApplicationError),
}

impl UpdateState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpdateState::Rejected(_) | UpdateState::Completed(_) | UpdateState::Failed(_)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            UpdateState::Admitted => "Admitted",
            UpdateState::Buffered => "Buffered",
            UpdateState::Validating => "Validating",
            UpdateState::Rejected(_) => "Rejected",
            UpdateState::Accepted => "Accepted",
            UpdateState::Executing => "Executing",
            UpdateState::Completed(_) => "Completed",
            UpdateState::Failed(_) => "Failed",
        }
    }

    fn can_move_to(&self, next: &UpdateState) -> bool {
        use UpdateState::*;
        matches!(
            (self, next),
            (Admitted, Buffered)
                | (Admitted, Validating)
                | (Admitted, Rejected(_))
                | (Buffered, Validating)
                | (Buffered, Rejected(_))
                | (Validating, Rejected(_))
                | (Validating, Accepted)
                | (Accepted, Executing)
                | (Executing, Completed(_))
                | (Executing, Failed(_))
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub update_id: String,
    pub from: &'static str,
    pub to: &'static str,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid update transition for {}: {} -> {}",
            self.update_id, self.from, self.to
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// Tracked lifecycle record for one update.
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    pub id: String,
    pub name: String,
    /// Pristine argument snapshot; validator and handler each get their own clone.
    args: Vec<Payload>,
    pub sequence: u64,
    state: UpdateState,
}

impl PendingUpdate {
    fn new(id: String, name: String, args: Vec<Payload>, sequence: u64) -> Self {
        Self {
            id,
            name,
            args,
            sequence,
            state: UpdateState::Admitted,
        }
    }

    pub fn state(&self) -> &UpdateState {
        &self.state
    }

    pub fn args_snapshot(&self) -> Vec<Payload> {
        self.args.clone()
    }

    pub fn transition(&mut self, next: UpdateState) -> Result<(), InvalidTransition> {
        if !self.state.can_move_to(&next) {
            return Err(InvalidTransition {
                update_id: self.id.clone(),
                from: self.state.label(),
                to: next.label(),
            });
        }
        tracing::trace!(
            update_id = %self.id,
            from = self.state.label(),
            to = next.label(),
            "update transition"
        );
        self.state = next;
        Ok(())
    }
}

/// Outcome of admitting an update job.
#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    New,
    /// The id was already admitted; carries the state label it is in.
    Duplicate(&'static str),
}

#[derive(Debug, Default)]
pub struct UpdateTracker {
    updates: BTreeMap<String, PendingUpdate>,
}

impl UpdateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn admit(&mut self, id: &str, name: &str, args: Vec<Payload>, sequence: u64) -> Admission {
        if let Some(existing) = self.updates.get(id) {
            return Admission::Duplicate(existing.state.label());
        }
        self.updates.insert(
            id.to_string(),
            PendingUpdate::new(id.to_string(), name.to_string(), args, sequence),
        );
        Admission::New
    }

    pub fn get(&self, id: &str) -> Option<&PendingUpdate> {
        self.updates.get(id)
    }

    pub fn transition(&mut self, id: &str, next: UpdateState) -> Result<(), InvalidTransition> {
        match self.updates.get_mut(id) {
            Some(update) => update.transition(next),
            None => Err(InvalidTransition {
                update_id: id.to_string(),
                from: "Unknown",
                to: next.label(),
            }),
        }
    }

    pub fn state_of(&self, id: &str) -> Option<&UpdateState> {
        self.updates.get(id).map(PendingUpdate::state)
    }

    pub fn args_snapshot(&self, id: &str) -> Option<Vec<Payload>> {
        self.updates.get(id).map(PendingUpdate::args_snapshot)
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}
