//! Database driver contracts and driver selection.
//!
//! # Responsibility
//! - Define the narrow driver/session surface the context depends on.
//! - Select drivers by `ConnectionDescriptor::driver_id`.
//!
//! # Invariants
//! - Every `open` call yields an independent session.
//! - `Session::close` is idempotent.

use crate::config::ConnectionDescriptor;
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

mod sqlite;

pub use sqlite::{SqliteDriver, SqliteSession, SQLITE_DRIVER_ID};

pub type DriverResult<T> = Result<T, DriverError>;

/// Driver-level failures.
#[derive(Debug)]
pub enum DriverError {
    UnknownDriver(String),
    InvalidConnectionString(String),
    SessionClosed,
    Sqlite(rusqlite::Error),
}

impl Display for DriverError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownDriver(value) => write!(f, "no driver registered for `{value}`"),
            Self::InvalidConnectionString(message) => {
                write!(f, "invalid connection string: {message}")
            }
            Self::SessionClosed => write!(f, "session is closed"),
            Self::Sqlite(err) => write!(f, "{err}"),
        }
    }
}

impl Error for DriverError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Sqlite(err) => Some(err),
            Self::UnknownDriver(_) | Self::InvalidConnectionString(_) | Self::SessionClosed => {
                None
            }
        }
    }
}

impl From<rusqlite::Error> for DriverError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

/// Open, usable handle to a database.
pub trait Session: Send {
    fn driver_id(&self) -> &str;

    /// Executes a batch of statements without returning rows.
    fn execute_batch(&mut self, sql: &str) -> DriverResult<()>;

    fn is_open(&self) -> bool;

    /// Releases the underlying connection. Safe to call repeatedly.
    fn close(&mut self) -> DriverResult<()>;
}

/// Factory for sessions of one database engine.
pub trait DatabaseDriver: Send + Sync {
    fn driver_id(&self) -> &str;

    fn open(&self, descriptor: &ConnectionDescriptor) -> DriverResult<Box<dyn Session>>;
}

/// Drivers keyed by driver id.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, Arc<dyn DatabaseDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in SQLite driver.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SqliteDriver::new()));
        registry
    }

    /// Registers a driver, replacing any previous one with the same id.
    pub fn register(&mut self, driver: Arc<dyn DatabaseDriver>) {
        let driver_id = driver.driver_id().trim().to_ascii_lowercase();
        self.drivers.insert(driver_id, driver);
    }

    pub fn get(&self, driver_id: &str) -> Option<Arc<dyn DatabaseDriver>> {
        self.drivers
            .get(driver_id.trim().to_ascii_lowercase().as_str())
            .cloned()
    }

    /// Returns sorted driver ids.
    pub fn driver_ids(&self) -> Vec<String> {
        self.drivers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }

    /// Opens a session through the driver named by the descriptor.
    pub fn open(&self, descriptor: &ConnectionDescriptor) -> DriverResult<Box<dyn Session>> {
        let driver = self
            .get(descriptor.driver_id())
            .ok_or_else(|| DriverError::UnknownDriver(descriptor.driver_id().to_string()))?;
        driver.open(descriptor)
    }
}
