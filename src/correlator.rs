//! Binds caller-side update handles to the lifecycle the dispatcher reports.
//!
//! Each update id owns a `watch` channel. Callers wait on it for `Accepted` (to obtain a handle)
//! or for a terminal outcome (to obtain the result). Progress only moves forward: a late or
//! repeated response never overwrites a terminal outcome.
//!
//! Terminal entries stay registered while the execution is open so a resubmitted update id
//! observes the recorded outcome instead of running again. Once the execution closes they are
//! pruned; handles already issued keep their receivers and still read the outcome.

use crate::Payload;
use crate::activation::UpdateResponse;
use crate::error::{ApplicationError, ErrorDetails};
use std::collections::BTreeMap;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateProgress {
    /// Delivered to the execution, no decision yet.
    Admitted,
    Accepted,
    Completed(Payload),
    Failed(ApplicationError),
    Rejected(ErrorDetails),
    /// The execution ended before the update reached an outcome.
    Abandoned(ErrorDetails),
}

impl UpdateProgress {
    /// Past the admission decision: a caller may be handed an update handle.
    pub fn is_settled(&self) -> bool {
        !matches!(self, UpdateProgress::Admitted)
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 2
    }

    fn rank(&self) -> u8 {
        match self {
            UpdateProgress::Admitted => 0,
            UpdateProgress::Accepted => 1,
            _ => 2,
        }
    }

    /// The caller-visible result of a terminal outcome.
    pub fn outcome(&self) -> Option<Result<Payload, ErrorDetails>> {
        match self {
            UpdateProgress::Completed(value) => Some(Ok(value.clone())),
            UpdateProgress::Failed(err) => Some(Err(ErrorDetails::Application(err.clone()))),
            UpdateProgress::Rejected(err) | UpdateProgress::Abandoned(err) => Some(Err(err.clone())),
            UpdateProgress::Admitted | UpdateProgress::Accepted => None,
        }
    }
}

impl From<&UpdateResponse> for UpdateProgress {
    fn from(response: &UpdateResponse) -> Self {
        match response {
            UpdateResponse::Accepted { .. } => UpdateProgress::Accepted,
            UpdateResponse::Rejected { error, .. } => UpdateProgress::Rejected(error.clone()),
            UpdateResponse::Completed { value, .. } => UpdateProgress::Completed(value.clone()),
            UpdateResponse::Failed { error, .. } => UpdateProgress::Failed(error.clone()),
        }
    }
}

#[derive(Debug, Default)]
pub struct CompletionCorrelator {
    updates: BTreeMap<String, watch::Sender<UpdateProgress>>,
}

impl CompletionCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `update_id`. The flag is true when this is the first time the id is seen.
    pub fn register(&mut self, update_id: &str) -> (watch::Receiver<UpdateProgress>, bool) {
        if let Some(tx) = self.updates.get(update_id) {
            return (tx.subscribe(), false);
        }
        let (tx, rx) = watch::channel(UpdateProgress::Admitted);
        self.updates.insert(update_id.to_string(), tx);
        (rx, true)
    }

    /// Apply a dispatcher response. Returns false for unknown ids and regressions.
    pub fn observe(&mut self, response: &UpdateResponse) -> bool {
        let Some(tx) = self.updates.get(response.update_id()) else {
            tracing::debug!(update_id = %response.update_id(), "response for unknown update");
            return false;
        };
        advance(tx, UpdateProgress::from(response))
    }

    /// Resolve every unfinished update with `error`.
    pub fn abandon_all(&mut self, error: ErrorDetails) -> usize {
        self.abandon_unless(|_| false, error)
    }

    /// Resolve every unfinished update with `error`, skipping ids for which `keep` holds.
    pub fn abandon_unless(&mut self, keep: impl Fn(&str) -> bool, error: ErrorDetails) -> usize {
        self.updates
            .iter()
            .filter(|(id, _)| !keep(id))
            .filter(|(_, tx)| advance(tx, UpdateProgress::Abandoned(error.clone())))
            .count()
    }

    pub fn progress(&self, update_id: &str) -> Option<UpdateProgress> {
        self.updates.get(update_id).map(|tx| tx.borrow().clone())
    }

    /// Updates without a terminal outcome.
    pub fn pending(&self) -> usize {
        self.updates.values().filter(|tx| !tx.borrow().is_terminal()).count()
    }

    /// Forget updates that have an outcome. Returns how many were dropped.
    pub fn prune_terminal(&mut self) -> usize {
        let before = self.updates.len();
        self.updates.retain(|_, tx| !tx.borrow().is_terminal());
        before - self.updates.len()
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

fn advance(tx: &watch::Sender<UpdateProgress>, next: UpdateProgress) -> bool {
    if tx.borrow().rank() >= next.rank() {
        return false;
    }
    tx.send_replace(next);
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn progress_moves_forward_only() {
        let mut correlator = CompletionCorrelator::new();
        let (rx, is_new) = correlator.register("u1");
        assert!(is_new);
        assert_eq!(*rx.borrow(), UpdateProgress::Admitted);

        assert!(correlator.observe(&UpdateResponse::Accepted { id: "u1".into() }));
        assert!(correlator.observe(&UpdateResponse::Completed {
            id: "u1".into(),
            value: json!(1)
        }));
        // Neither a repeated acceptance nor a second outcome changes the result.
        assert!(!correlator.observe(&UpdateResponse::Accepted { id: "u1".into() }));
        assert!(!correlator.observe(&UpdateResponse::Failed {
            id: "u1".into(),
            error: ApplicationError::new("late")
        }));
        assert_eq!(rx.borrow().outcome(), Some(Ok(json!(1))));
    }

    #[test]
    fn second_registration_shares_outcome() {
        let mut correlator = CompletionCorrelator::new();
        correlator.register("u1");
        correlator.observe(&UpdateResponse::Rejected {
            id: "u1".into(),
            error: ErrorDetails::Validation(ApplicationError::new("Validation failed")),
        });
        let (rx, is_new) = correlator.register("u1");
        assert!(!is_new);
        assert_eq!(
            rx.borrow().outcome().unwrap().unwrap_err().display_message(),
            "Validation failed"
        );
    }

    #[test]
    fn abandon_resolves_only_unfinished() {
        let mut correlator = CompletionCorrelator::new();
        correlator.register("done");
        correlator.register("running");
        correlator.observe(&UpdateResponse::Completed {
            id: "done".into(),
            value: json!(null),
        });
        correlator.observe(&UpdateResponse::Accepted { id: "running".into() });
        assert_eq!(correlator.pending(), 1);

        assert_eq!(correlator.abandon_all(ErrorDetails::already_completed()), 1);
        assert_eq!(correlator.progress("done"), Some(UpdateProgress::Completed(json!(null))));
        assert_eq!(
            correlator.progress("running"),
            Some(UpdateProgress::Abandoned(ErrorDetails::already_completed()))
        );
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn pruned_updates_keep_their_outcome_for_existing_handles() {
        let mut correlator = CompletionCorrelator::new();
        let (mut rx, _) = correlator.register("done");
        correlator.register("running");
        correlator.observe(&UpdateResponse::Completed {
            id: "done".into(),
            value: json!(7),
        });

        assert_eq!(correlator.prune_terminal(), 1);
        assert_eq!(correlator.len(), 1);
        assert!(correlator.progress("done").is_none());
        let outcome = rx.wait_for(UpdateProgress::is_terminal).await.map(|p| p.outcome());
        assert_eq!(outcome.unwrap(), Some(Ok(json!(7))));

        correlator.abandon_all(ErrorDetails::already_completed());
        assert_eq!(correlator.prune_terminal(), 1);
        assert!(correlator.is_empty());
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let mut correlator = CompletionCorrelator::new();
        assert!(!correlator.observe(&UpdateResponse::Accepted { id: "ghost".into() }));
        assert!(correlator.progress("ghost").is_none());
    }

    #[tokio::test]
    async fn waiter_sees_acceptance_then_outcome() {
        let mut correlator = CompletionCorrelator::new();
        let (mut rx, _) = correlator.register("u1");
        let waiter = tokio::spawn(async move {
            rx.wait_for(UpdateProgress::is_settled).await.map(|p| p.clone()).ok()
        });
        correlator.observe(&UpdateResponse::Accepted { id: "u1".into() });
        assert_eq!(waiter.await.unwrap(), Some(UpdateProgress::Accepted));
    }
}
