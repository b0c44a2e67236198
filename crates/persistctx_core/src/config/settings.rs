//! Layered settings source built on the `config` crate.
//!
//! # Responsibility
//! - Load the `ConnectionStrings` section from settings files
//!   (`appsettings.json` layout) and `ConnectionStrings__<name>` environment
//!   variables.
//! - Snapshot the merged section into named connection descriptors.
//!
//! ```json
//! {
//!   "ConnectionStrings": {
//!     "SqliteConnection": "Data Source=dev.db",
//!     "Reports": { "driver": "sqlite", "connection_string": "Data Source=reports.db" }
//!   }
//! }
//! ```
//!
//! # Invariants
//! - Later files override earlier ones; environment variables override files.
//! - Connection names are matched case-insensitively.
//! - Entries with a blank connection string are treated as unset.

use super::{ConfigSource, ConnectionDescriptor};
use ::config::builder::DefaultState;
use ::config::{Config, ConfigBuilder, ConfigError, Environment, File, FileFormat, Map, Value, ValueKind};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;

/// Settings section holding named connections.
pub const CONNECTION_STRINGS_SECTION: &str = "ConnectionStrings";

const ENV_SEPARATOR: &str = "__";
// Sibling key carrying the driver id of a plain entry, e.g.
// `ConnectionStrings__SqliteConnection_ProviderName=sqlite`.
const PROVIDER_SUFFIX: &str = "_providername";

/// Settings load errors.
#[derive(Debug)]
pub enum SettingsError {
    Load(ConfigError),
    InvalidEntry { name: String, message: String },
}

impl Display for SettingsError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Load(err) => write!(f, "failed to load settings: {err}"),
            Self::InvalidEntry { name, message } => {
                write!(f, "invalid connection entry `{name}`: {message}")
            }
        }
    }
}

impl Error for SettingsError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Load(err) => Some(err),
            Self::InvalidEntry { .. } => None,
        }
    }
}

impl From<ConfigError> for SettingsError {
    fn from(value: ConfigError) -> Self {
        Self::Load(value)
    }
}

/// Collects settings layers before they are merged by [`Self::build`].
pub struct SettingsBuilder {
    section: String,
    layers: ConfigBuilder<DefaultState>,
    environment: Option<Option<Map<String, String>>>,
}

impl SettingsBuilder {
    fn new() -> Self {
        Self {
            section: CONNECTION_STRINGS_SECTION.to_string(),
            layers: Config::builder(),
            environment: None,
        }
    }

    /// Reads connections from another section name. Also renames the
    /// environment variable prefix.
    pub fn section(mut self, name: impl Into<String>) -> Self {
        self.section = name.into();
        self
    }

    /// Adds a required settings file; the format follows its extension.
    pub fn add_file(mut self, path: impl AsRef<Path>) -> Self {
        self.layers = self.layers.add_source(File::from(path.as_ref()));
        self
    }

    /// Adds a settings file that may be absent.
    pub fn add_optional_file(mut self, path: impl AsRef<Path>) -> Self {
        self.layers = self
            .layers
            .add_source(File::from(path.as_ref()).required(false));
        self
    }

    /// Adds an in-memory JSON settings document.
    pub fn add_json(mut self, raw: &str) -> Self {
        self.layers = self.layers.add_source(File::from_str(raw, FileFormat::Json));
        self
    }

    /// Reads `<section>__<name>` variables from the process environment.
    pub fn with_process_environment(mut self) -> Self {
        self.environment = Some(None);
        self
    }

    /// Reads `<section>__<name>` variables from a fixed set instead of the
    /// process environment.
    pub fn with_environment_vars<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.environment = Some(Some(
            vars.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        ));
        self
    }

    /// Merges every layer and snapshots the connection section.
    ///
    /// # Errors
    /// - `Load` when a required file is missing or a layer fails to parse.
    /// - `InvalidEntry` when an entry is neither a string nor a
    ///   `{driver, connection_string}` table.
    pub fn build(self) -> Result<SettingsConfigSource, SettingsError> {
        let mut layers = self.layers;
        if let Some(vars) = self.environment {
            layers = layers.add_source(
                Environment::with_prefix(&self.section)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .keep_prefix(true)
                    .ignore_empty(true)
                    .source(vars),
            );
        }
        SettingsConfigSource::from_config(&self.section, layers.build()?)
    }
}

/// Named connections loaded once from layered settings.
#[derive(Debug, Clone, Default)]
pub struct SettingsConfigSource {
    // Keyed by lowercased name; the value keeps the name as written.
    connections: BTreeMap<String, (String, ConnectionDescriptor)>,
}

impl SettingsConfigSource {
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::new()
    }

    /// Reads `ConnectionStrings__<name>` from the process environment only.
    pub fn from_environment() -> Result<Self, SettingsError> {
        Self::builder().with_process_environment().build()
    }

    /// Snapshots `section` from an already built configuration.
    pub fn from_config(section: &str, config: Config) -> Result<Self, SettingsError> {
        let root: Map<String, Value> = config.try_deserialize()?;
        let mut sections = root
            .into_iter()
            .filter(|(key, _)| key.eq_ignore_ascii_case(section))
            .collect::<Vec<_>>();
        // Environment keys arrive lowercased and may not merge with a
        // differently cased file section; apply the lowercase section last.
        sections.sort_by_key(|(key, _)| *key == key.to_ascii_lowercase());

        let mut connections = BTreeMap::new();
        for (_, value) in sections {
            collect_section(value.into_table()?, &mut connections)?;
        }
        Ok(Self { connections })
    }

    /// Returns configured connection names in case-insensitive order.
    pub fn names(&self) -> Vec<&str> {
        self.connections
            .values()
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl ConfigSource for SettingsConfigSource {
    fn lookup_named_connection(&self, name: &str) -> Option<ConnectionDescriptor> {
        self.connections
            .get(&name.to_ascii_lowercase())
            .map(|(_, descriptor)| descriptor.clone())
    }
}

fn collect_section(
    table: Map<String, Value>,
    connections: &mut BTreeMap<String, (String, ConnectionDescriptor)>,
) -> Result<(), SettingsError> {
    let mut providers = BTreeMap::new();
    let mut entries = Vec::new();
    for (key, value) in table {
        let lowered = key.to_ascii_lowercase();
        match lowered.strip_suffix(PROVIDER_SUFFIX) {
            Some(name) if !name.is_empty() => {
                providers.insert(name.to_string(), value.into_string()?);
            }
            _ => entries.push((key, value)),
        }
    }

    for (name, value) in entries {
        let lowered = name.to_ascii_lowercase();
        let provider = providers.get(&lowered).cloned();
        match parse_entry(&name, value, provider)? {
            Some(descriptor) => {
                connections.insert(lowered, (name, descriptor));
            }
            None => {
                connections.remove(&lowered);
            }
        }
    }
    Ok(())
}

fn parse_entry(
    name: &str,
    value: Value,
    provider: Option<String>,
) -> Result<Option<ConnectionDescriptor>, SettingsError> {
    let invalid = |message: String| SettingsError::InvalidEntry {
        name: name.to_string(),
        message,
    };
    let descriptor = match value.kind {
        ValueKind::Nil => return Ok(None),
        ValueKind::Array(_) => {
            return Err(invalid(
                "expected a connection string or a table".to_string(),
            ))
        }
        ValueKind::Table(_) => value
            .try_deserialize::<ConnectionDescriptor>()
            .map_err(|err| invalid(err.to_string()))?,
        _ => ConnectionDescriptor::new(provider.unwrap_or_default(), value.into_string()?),
    };
    if descriptor.connection_string().trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(descriptor))
}

#[cfg(test)]
mod tests {
    use super::{SettingsConfigSource, SettingsError};
    use crate::config::ConfigSource;

    const APPSETTINGS: &str = r#"{
        "Logging": { "LogLevel": { "Default": "Information" } },
        "ConnectionStrings": {
            "SqliteConnection": "Data Source=dev.db",
            "Reports": { "driver": "sqlite", "connection_string": "Data Source=reports.db" }
        }
    }"#;

    #[test]
    fn parses_plain_and_detailed_entries() {
        let source = SettingsConfigSource::builder()
            .add_json(APPSETTINGS)
            .build()
            .expect("valid settings");

        assert_eq!(source.len(), 2);
        assert!(source
            .names()
            .iter()
            .any(|name| name.eq_ignore_ascii_case("SqliteConnection")));
        let plain = source
            .lookup_named_connection("SqliteConnection")
            .expect("plain entry");
        assert_eq!(plain.driver_id(), "");
        assert_eq!(plain.connection_string(), "Data Source=dev.db");

        let detailed = source.lookup_named_connection("reports").expect("detailed entry");
        assert_eq!(detailed.driver_id(), "sqlite");
        assert_eq!(detailed.connection_string(), "Data Source=reports.db");
    }

    #[test]
    fn environment_reads_connection_string_and_provider() {
        let source = SettingsConfigSource::builder()
            .with_environment_vars([
                ("ConnectionStrings__SqliteConnection", "Data Source=env.db"),
                ("ConnectionStrings__SqliteConnection_ProviderName", "sqlite"),
                ("UNRELATED__Value", "ignored"),
            ])
            .build()
            .expect("environment layer");

        assert_eq!(source.len(), 1);
        let descriptor = source
            .lookup_named_connection("SqliteConnection")
            .expect("configured connection");
        assert_eq!(descriptor.driver_id(), "sqlite");
        assert_eq!(descriptor.connection_string(), "Data Source=env.db");
    }

    #[test]
    fn environment_overrides_files() {
        let source = SettingsConfigSource::builder()
            .add_json(APPSETTINGS)
            .with_environment_vars([("ConnectionStrings__SqliteConnection", "Data Source=env.db")])
            .build()
            .expect("layered settings");

        let default = source
            .lookup_named_connection("SqliteConnection")
            .expect("default connection");
        assert_eq!(default.connection_string(), "Data Source=env.db");
        let reports = source.lookup_named_connection("Reports").expect("file entry");
        assert_eq!(reports.connection_string(), "Data Source=reports.db");
    }

    #[test]
    fn blank_values_are_treated_as_unset() {
        let source = SettingsConfigSource::builder()
            .add_json(r#"{ "ConnectionStrings": { "Main": "   " } }"#)
            .with_environment_vars([("ConnectionStrings__Audit", "")])
            .build()
            .expect("settings");
        assert!(source.lookup_named_connection("Main").is_none());
        assert!(source.lookup_named_connection("Audit").is_none());
        assert!(source.is_empty());
    }

    #[test]
    fn custom_section_is_honored() {
        let source = SettingsConfigSource::builder()
            .section("Databases")
            .with_environment_vars([
                ("Databases__Main", ":memory:"),
                ("ConnectionStrings__Other", ":memory:"),
            ])
            .build()
            .expect("settings");
        assert!(source.lookup_named_connection("Main").is_some());
        assert!(source.lookup_named_connection("Other").is_none());
    }

    #[test]
    fn rejects_list_entries() {
        let err = SettingsConfigSource::builder()
            .add_json(r#"{ "ConnectionStrings": { "Main": ["a", "b"] } }"#)
            .build()
            .expect_err("list is not a connection");
        assert!(matches!(err, SettingsError::InvalidEntry { name, .. } if name.eq_ignore_ascii_case("Main")));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = SettingsConfigSource::builder()
            .add_json("{ not json")
            .build()
            .expect_err("parse must fail");
        assert!(matches!(err, SettingsError::Load(_)));
    }
}
