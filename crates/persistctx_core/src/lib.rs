//! Persistence context manager.
//! Binds a resolved connection descriptor to an ordered set of schema
//! customization callbacks and the session opened from it.

pub mod callbacks;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod logging;
pub mod resolver;
pub mod schema;

pub use callbacks::{CallbackId, CallbackResult, SchemaCallback};
pub use crate::config::{
    ConfigSource, ConnectionDescriptor, MapConfigSource, SettingsBuilder, SettingsConfigSource,
    SettingsError,
};
pub use context::{ContextId, ContextState, PersistenceContext};
pub use driver::{
    DatabaseDriver, DriverError, DriverRegistry, DriverResult, Session, SqliteDriver,
    SqliteSession,
};
pub use error::{BoxError, ContextError, ContextResult};
pub use logging::{init_logging, logging_status, LogLevel, LogSettings, LoggingError};
pub use resolver::{
    ConnectionResolver, ResolverSettings, DEFAULT_CONNECTION_NAME, DEFAULT_DRIVER_ID,
};
pub use schema::{ColumnType, EntityBuilder, EntityDef, Schema, SchemaBuilder, SchemaError};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
