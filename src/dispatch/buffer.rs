//! Signal and update jobs waiting for their handler to be registered.
//!
//! Jobs are queued per target name in arrival order, signals and updates for the same name sharing
//! one queue. Only the head of a queue may be dispatched, so a job never overtakes an earlier job
//! for the same name. Queues for different names never interact.

use super::handlers::HandlerKey;
use crate::activation::Job;
use crate::error::HandlerKind;
use std::collections::{BTreeMap, VecDeque};

#[derive(Debug, Clone)]
struct BufferedJob {
    key: HandlerKey,
    job: Job,
    /// Position in the store-wide arrival order.
    arrival: u64,
}

/// Result of offering a job to the store.
#[derive(Debug)]
pub enum Offer {
    /// A handler exists; dispatch the job now.
    Forward(Job),
    Buffered,
}

#[derive(Debug, Default)]
pub struct BufferedJobStore {
    queues: BTreeMap<String, VecDeque<BufferedJob>>,
    next_arrival: u64,
    len: usize,
}

impl BufferedJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `job` unless its handler is registered, in which case it is handed straight back.
    ///
    /// Jobs without a handler namespace (start, timers, ...) are always forwarded.
    pub fn offer(&mut self, job: Job, is_registered: impl Fn(&HandlerKey) -> bool) -> Offer {
        let Some(key) = key_of(&job) else {
            return Offer::Forward(job);
        };
        // A queued job for the same name must go first, whatever its kind.
        if is_registered(&key) && !self.queues.contains_key(&key.name) {
            return Offer::Forward(job);
        }
        self.push(key, job);
        Offer::Buffered
    }

    fn push(&mut self, key: HandlerKey, job: Job) {
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.len += 1;
        self.queues
            .entry(key.name.clone())
            .or_default()
            .push_back(BufferedJob { key, job, arrival });
    }

    /// Pop the earliest-arrived queue head whose handler is ready.
    ///
    /// Only heads are candidates, so per-name FIFO holds even when the caller dispatches jobs one
    /// at a time and registrations change between calls.
    pub fn take_next_ready(&mut self, is_ready: impl Fn(&HandlerKey) -> bool) -> Option<Job> {
        let name = self
            .queues
            .iter()
            .filter_map(|(name, queue)| queue.front().map(|head| (name, head)))
            .filter(|(_, head)| is_ready(&head.key))
            .min_by_key(|(_, head)| head.arrival)
            .map(|(name, _)| name.clone())?;

        let queue = self.queues.get_mut(&name)?;
        let next = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(&name);
        }
        if next.is_some() {
            self.len -= 1;
        }
        next.map(|b| b.job)
    }

    /// Remove every queued job of one kind, in arrival order. Jobs of other kinds keep their
    /// places and may become queue heads.
    pub fn take_kind(&mut self, kind: HandlerKind) -> Vec<Job> {
        let mut taken: Vec<BufferedJob> = Vec::new();
        for queue in self.queues.values_mut() {
            let (matching, rest): (VecDeque<_>, VecDeque<_>) =
                std::mem::take(queue).into_iter().partition(|b| b.key.kind == kind);
            *queue = rest;
            taken.extend(matching);
        }
        self.queues.retain(|_, queue| !queue.is_empty());
        self.len -= taken.len();
        taken.sort_by_key(|b| b.arrival);
        taken.into_iter().map(|b| b.job).collect()
    }

    /// Drop everything; returns the abandoned jobs in arrival order.
    pub fn abandon(&mut self) -> Vec<Job> {
        let mut all: Vec<BufferedJob> = std::mem::take(&mut self.queues).into_values().flatten().collect();
        self.len = 0;
        all.sort_by_key(|b| b.arrival);
        all.into_iter().map(|b| b.job).collect()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

fn key_of(job: &Job) -> Option<HandlerKey> {
    let kind = job.kind.handler_kind()?;
    let name = job.kind.target_name()?;
    Some(HandlerKey::new(kind, name))
}
