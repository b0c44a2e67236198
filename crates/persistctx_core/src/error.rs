//! Error taxonomy for persistence context operations.
//!
//! # Responsibility
//! - Provide one error type surfaced by every public context operation.
//! - Preserve underlying causes through `Error::source` chaining.
//!
//! # Invariants
//! - `ConfigurationMissing` always names the setting that was looked up.
//! - No variant is produced by swallowing another error.

use crate::callbacks::CallbackId;
use crate::driver::DriverError;
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Boxed cause raised by user-supplied schema callbacks.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

pub type ContextResult<T> = Result<T, ContextError>;

/// Errors surfaced by [`crate::PersistenceContext`] and
/// [`crate::ConnectionResolver`].
#[derive(Debug)]
pub enum ContextError {
    /// No usable connection descriptor was found under `name`.
    ConfigurationMissing { name: String },
    /// A callback was registered after the schema had been built.
    SchemaAlreadyBuilt,
    /// A schema callback failed; the build was aborted.
    SchemaBuildFailed {
        callback: CallbackId,
        label: Option<String>,
        source: BoxError,
    },
    /// The driver could not establish a session.
    ConnectionFailed {
        driver_id: String,
        source: DriverError,
    },
    /// The context was closed and can no longer be used.
    ContextClosed,
    /// An open session failed while applying DDL or being released.
    SessionFailed {
        driver_id: String,
        source: DriverError,
    },
}

impl ContextError {
    /// Stable machine-readable code used in log events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConfigurationMissing { .. } => "configuration_missing",
            Self::SchemaAlreadyBuilt => "schema_already_built",
            Self::SchemaBuildFailed { .. } => "schema_build_failed",
            Self::ConnectionFailed { .. } => "connection_failed",
            Self::ContextClosed => "context_closed",
            Self::SessionFailed { .. } => "session_failed",
        }
    }
}

impl Display for ContextError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConfigurationMissing { name } => {
                write!(f, "no connection configured under the name `{name}`")
            }
            Self::SchemaAlreadyBuilt => {
                write!(f, "schema already built; callback registration is closed")
            }
            Self::SchemaBuildFailed {
                callback,
                label,
                source,
            } => match label {
                Some(label) => write!(
                    f,
                    "schema callback #{} (`{label}`) failed: {source}",
                    callback.index()
                ),
                None => write!(f, "schema callback #{} failed: {source}", callback.index()),
            },
            Self::ConnectionFailed { driver_id, source } => {
                write!(f, "failed to open `{driver_id}` connection: {source}")
            }
            Self::ContextClosed => write!(f, "persistence context is closed"),
            Self::SessionFailed { driver_id, source } => {
                write!(f, "`{driver_id}` session failed: {source}")
            }
        }
    }
}

impl Error for ContextError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::SchemaBuildFailed { source, .. } => Some(source.as_ref()),
            Self::ConnectionFailed { source, .. } | Self::SessionFailed { source, .. } => {
                Some(source)
            }
            Self::ConfigurationMissing { .. } | Self::SchemaAlreadyBuilt | Self::ContextClosed => {
                None
            }
        }
    }
}
