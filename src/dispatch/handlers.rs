//! Runtime-mutable registry of signal, update and query handlers.
//!
//! Registration overwrites: the last `register` for a `(kind, name)` wins, which is what lets a
//! handler re-register itself (or register another name) mid-execution. Every registration is
//! recorded so the dispatcher can replay buffered jobs for that name.

use crate::Payload;
use crate::error::{ApplicationError, HandlerKind};
use futures::future::{FutureExt, LocalBoxFuture};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::rc::Rc;

pub(crate) type SignalFn = Rc<dyn Fn(Vec<Payload>) -> LocalBoxFuture<'static, Result<(), ApplicationError>>>;
pub(crate) type UpdateFn = Rc<dyn Fn(Vec<Payload>) -> LocalBoxFuture<'static, Result<Payload, ApplicationError>>>;
pub(crate) type ValidatorFn = Rc<dyn Fn(Vec<Payload>) -> Result<(), ApplicationError>>;
pub(crate) type QueryFn = Rc<dyn Fn(Vec<Payload>) -> Result<Payload, ApplicationError>>;

/// Handler namespace plus name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandlerKey {
    pub kind: HandlerKind,
    pub name: String,
}

impl HandlerKey {
    pub fn new(kind: HandlerKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for HandlerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Tagged handler record.
#[derive(Clone)]
pub enum HandlerRecord {
    Signal {
        handler: SignalFn,
    },
    Update {
        handler: UpdateFn,
        validator: Option<ValidatorFn>,
    },
    Query {
        handler: QueryFn,
    },
}

impl HandlerRecord {
    pub fn signal<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Payload>) -> Fut + 'static,
        Fut: Future<Output = Result<(), ApplicationError>> + 'static,
    {
        HandlerRecord::Signal {
            handler: Rc::new(move |args| f(args).boxed_local()),
        }
    }

    pub fn update<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Payload>) -> Fut + 'static,
        Fut: Future<Output = Result<Payload, ApplicationError>> + 'static,
    {
        HandlerRecord::Update {
            handler: Rc::new(move |args| f(args).boxed_local()),
            validator: None,
        }
    }

    /// Attach a validator; a no-op for non-update records.
    pub fn with_validator<V>(self, v: V) -> Self
    where
        V: Fn(Vec<Payload>) -> Result<(), ApplicationError> + 'static,
    {
        match self {
            HandlerRecord::Update { handler, .. } => HandlerRecord::Update {
                handler,
                validator: Some(Rc::new(v)),
            },
            other => other,
        }
    }

    pub fn query<F>(f: F) -> Self
    where
        F: Fn(Vec<Payload>) -> Result<Payload, ApplicationError> + 'static,
    {
        HandlerRecord::Query { handler: Rc::new(f) }
    }

    pub fn kind(&self) -> HandlerKind {
        match self {
            HandlerRecord::Signal { .. } => HandlerKind::Signal,
            HandlerRecord::Update { .. } => HandlerKind::Update,
            HandlerRecord::Query { .. } => HandlerKind::Query,
        }
    }

    pub fn has_validator(&self) -> bool {
        matches!(self, HandlerRecord::Update { validator: Some(_), .. })
    }
}

impl fmt::Debug for HandlerRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRecord")
            .field("kind", &self.kind())
            .field("has_validator", &self.has_validator())
            .finish()
    }
}

/// A registered handler and the registry generation it was installed at.
#[derive(Debug, Clone)]
pub struct HandlerRegistration {
    pub name: String,
    pub record: HandlerRecord,
    pub generation: u64,
}

#[derive(Debug, Default)]
pub struct HandlerRegistry {
    entries: BTreeMap<HandlerKey, HandlerRegistration>,
    generation: u64,
    pending_registrations: Vec<HandlerKey>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or replace the handler for `name`, returning the registration it replaced.
    pub fn register(&mut self, name: impl Into<String>, record: HandlerRecord) -> Option<HandlerRegistration> {
        let name = name.into();
        let key = HandlerKey::new(record.kind(), name.clone());
        self.generation += 1;
        let previous = self.entries.insert(
            key.clone(),
            HandlerRegistration {
                name,
                record,
                generation: self.generation,
            },
        );
        tracing::debug!(
            handler = %key,
            generation = self.generation,
            replaced = previous.is_some(),
            "handler registered"
        );
        self.pending_registrations.push(key);
        previous
    }

    /// Remove a handler; later jobs for it are buffered again.
    pub fn unregister(&mut self, kind: HandlerKind, name: &str) -> Option<HandlerRegistration> {
        let removed = self.entries.remove(&HandlerKey::new(kind, name));
        if removed.is_some() {
            self.generation += 1;
        }
        removed
    }

    pub fn lookup(&self, kind: HandlerKind, name: &str) -> Option<&HandlerRegistration> {
        let found = self.entries.get(&HandlerKey::new(kind, name));
        if found.is_none() {
            self.log_registry_miss(kind, name);
        }
        found
    }

    pub fn contains(&self, key: &HandlerKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Registered names for one namespace, in sorted order.
    pub fn names(&self, kind: HandlerKind) -> Vec<String> {
        self.entries
            .keys()
            .filter(|k| k.kind == kind)
            .map(|k| k.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registrations made since the last call, in registration order.
    pub fn take_registrations(&mut self) -> Vec<HandlerKey> {
        std::mem::take(&mut self.pending_registrations)
    }

    fn log_registry_miss(&self, kind: HandlerKind, name: &str) {
        tracing::debug!(
            requested_kind = %kind,
            requested_name = %name,
            registered_names = ?self.names(kind),
            "handler lookup miss"
        );
    }
}
