//! Connection descriptor resolution.
//!
//! # Responsibility
//! - Pick the descriptor a context connects with: explicit settings first,
//!   then the configured named default.
//! - Follow indirect `Name=<key>` references into the configuration source.
//!
//! # Invariants
//! - Resolution is a pure function of its inputs and the source.
//! - A resolved descriptor always has non-blank driver id and connection string.

use crate::config::{ConfigSource, ConnectionDescriptor};
use crate::error::{ContextError, ContextResult};
use log::debug;
use std::sync::Arc;

/// Logical name looked up when no explicit descriptor is supplied.
pub const DEFAULT_CONNECTION_NAME: &str = "SqliteConnection";
/// Driver assumed when a source only provides a connection string.
pub const DEFAULT_DRIVER_ID: &str = "sqlite";

/// Deployment conventions used by [`ConnectionResolver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverSettings {
    pub default_name: String,
    pub default_driver_id: String,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            default_name: DEFAULT_CONNECTION_NAME.to_string(),
            default_driver_id: DEFAULT_DRIVER_ID.to_string(),
        }
    }
}

/// Resolves connection descriptors against an injected [`ConfigSource`].
#[derive(Clone)]
pub struct ConnectionResolver {
    source: Arc<dyn ConfigSource>,
    settings: ResolverSettings,
}

impl ConnectionResolver {
    pub fn new(source: impl ConfigSource + 'static) -> Self {
        Self::with_settings(source, ResolverSettings::default())
    }

    pub fn with_settings(source: impl ConfigSource + 'static, settings: ResolverSettings) -> Self {
        Self {
            source: Arc::new(source),
            settings,
        }
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    /// Resolves the descriptor used to open connections.
    ///
    /// # Errors
    /// - `ConfigurationMissing` naming the looked-up setting when neither an
    ///   explicit descriptor nor a configured one is usable.
    pub fn resolve(
        &self,
        explicit: Option<&ConnectionDescriptor>,
    ) -> ContextResult<ConnectionDescriptor> {
        if let Some(explicit) = explicit {
            if let Some(name) = explicit.named_reference() {
                debug!("event=connection_resolve module=resolver status=indirect name={name}");
                let fallback_driver = non_blank(explicit.driver_id())
                    .unwrap_or(self.settings.default_driver_id.as_str());
                return self.lookup(name, fallback_driver);
            }
            if explicit.is_well_formed() {
                debug!(
                    "event=connection_resolve module=resolver status=explicit driver={}",
                    explicit.driver_id()
                );
                return Ok(explicit.clone());
            }
            debug!("event=connection_resolve module=resolver status=explicit_ignored reason=malformed");
        }

        self.lookup(
            &self.settings.default_name,
            &self.settings.default_driver_id,
        )
    }

    fn lookup(&self, name: &str, fallback_driver: &str) -> ContextResult<ConnectionDescriptor> {
        let missing = || ContextError::ConfigurationMissing {
            name: name.to_string(),
        };
        let found = self.source.lookup_named_connection(name).ok_or_else(missing)?;
        let Some(connection_string) = non_blank(found.connection_string()) else {
            return Err(missing());
        };
        let driver_id = non_blank(found.driver_id()).unwrap_or(fallback_driver);

        debug!("event=connection_resolve module=resolver status=named name={name} driver={driver_id}");
        Ok(ConnectionDescriptor::new(driver_id, connection_string))
    }
}

fn non_blank(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}
