//! Ordered registry of schema customization callbacks.
//!
//! # Responsibility
//! - Store callbacks in registration order and hand out stable ids.
//! - Run every callback against one shared builder, stopping at the first
//!   failure.
//!
//! # Invariants
//! - `CallbackId` values are dense indexes in registration order.
//! - Entries are never removed or reordered.

use crate::error::BoxError;
use crate::schema::SchemaBuilder;
use std::fmt::{Debug, Display, Formatter};

/// Result returned by schema callbacks.
pub type CallbackResult = Result<(), BoxError>;

/// Boxed customization hook invoked with the schema builder.
pub type SchemaCallback = Box<dyn FnMut(&mut SchemaBuilder) -> CallbackResult + Send + 'static>;

/// Position of one callback in its registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CallbackId(usize);

impl CallbackId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl Display for CallbackId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct RegisteredCallback {
    label: Option<String>,
    callback: SchemaCallback,
}

/// Failure of one callback during [`CallbackRegistry::run_all`].
#[derive(Debug)]
pub struct CallbackFailure {
    pub id: CallbackId,
    pub label: Option<String>,
    pub source: BoxError,
}

/// Append-only arena of schema callbacks.
#[derive(Default)]
pub struct CallbackRegistry {
    entries: Vec<RegisteredCallback>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, label: Option<String>, callback: SchemaCallback) -> CallbackId {
        let id = CallbackId(self.entries.len());
        self.entries.push(RegisteredCallback { label, callback });
        id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn label(&self, id: CallbackId) -> Option<&str> {
        self.entries.get(id.0)?.label.as_deref()
    }

    /// Invokes callbacks in registration order until one fails.
    pub fn run_all(&mut self, builder: &mut SchemaBuilder) -> Result<(), CallbackFailure> {
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if let Err(source) = (entry.callback)(&mut *builder) {
                return Err(CallbackFailure {
                    id: CallbackId(index),
                    label: entry.label.clone(),
                    source,
                });
            }
        }
        Ok(())
    }
}

impl Debug for CallbackRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(
                self.entries
                    .iter()
                    .map(|entry| entry.label.as_deref().unwrap_or("<anonymous>")),
            )
            .finish()
    }
}
