//! Connection configuration model and named-connection sources.
//!
//! # Responsibility
//! - Define the connection descriptor handed to database drivers.
//! - Abstract the hosting environment behind [`ConfigSource`].
//!
//! # Invariants
//! - Sources are read-only lookups; they never mutate shared state.
//! - A descriptor is immutable once constructed.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

mod settings;

pub use settings::{
    SettingsBuilder, SettingsConfigSource, SettingsError, CONNECTION_STRINGS_SECTION,
};

/// Driver identifier plus connection string needed to open a session.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ConnectionDescriptor {
    #[serde(default)]
    driver: String,
    connection_string: String,
}

impl ConnectionDescriptor {
    pub fn new(driver_id: impl Into<String>, connection_string: impl Into<String>) -> Self {
        Self {
            driver: driver_id.into(),
            connection_string: connection_string.into(),
        }
    }

    pub fn driver_id(&self) -> &str {
        &self.driver
    }

    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Returns whether both fields carry non-blank values.
    pub fn is_well_formed(&self) -> bool {
        !self.driver.trim().is_empty() && !self.connection_string.trim().is_empty()
    }

    /// Returns `<key>` when the connection string is an indirect
    /// `Name=<key>` reference into a configuration source.
    ///
    /// `Name` must be the only keyword; `Name=ConnectionStrings:<key>` is
    /// accepted as an alias. A trailing `;` is ignored.
    pub fn named_reference(&self) -> Option<&str> {
        let mut segments = self
            .connection_string
            .split(';')
            .map(str::trim)
            .filter(|segment| !segment.is_empty());
        let (keyword, value) = segments.next()?.split_once('=')?;
        if segments.next().is_some() || !keyword.trim().eq_ignore_ascii_case("name") {
            return None;
        }
        let value = value.trim();
        let value = match value.split_once(':') {
            Some((section, key)) if section.eq_ignore_ascii_case(CONNECTION_STRINGS_SECTION) => {
                key.trim()
            }
            _ => value,
        };
        (!value.is_empty()).then_some(value)
    }
}

// Connection strings may embed credentials; keep them out of debug output.
impl Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionDescriptor")
            .field("driver_id", &self.driver)
            .field("connection_string", &"<redacted>")
            .finish()
    }
}

/// Named connection lookup supplied by the hosting environment.
///
/// Implementations may return a descriptor with a blank driver id when the
/// source only knows the connection string; the resolver fills in its
/// configured default driver.
pub trait ConfigSource: Send + Sync {
    fn lookup_named_connection(&self, name: &str) -> Option<ConnectionDescriptor>;
}

impl<T: ConfigSource + ?Sized> ConfigSource for Arc<T> {
    fn lookup_named_connection(&self, name: &str) -> Option<ConnectionDescriptor> {
        (**self).lookup_named_connection(name)
    }
}

impl<T: ConfigSource + ?Sized> ConfigSource for Box<T> {
    fn lookup_named_connection(&self, name: &str) -> Option<ConnectionDescriptor> {
        (**self).lookup_named_connection(name)
    }
}

/// In-memory settings object injected at startup.
#[derive(Debug, Clone, Default)]
pub struct MapConfigSource {
    connections: BTreeMap<String, ConnectionDescriptor>,
}

impl MapConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces one named connection.
    pub fn with_connection(mut self, name: impl Into<String>, descriptor: ConnectionDescriptor) -> Self {
        self.insert(name, descriptor);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, descriptor: ConnectionDescriptor) {
        self.connections.insert(name.into(), descriptor);
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl ConfigSource for MapConfigSource {
    fn lookup_named_connection(&self, name: &str) -> Option<ConnectionDescriptor> {
        self.connections.get(name).cloned()
    }
}
