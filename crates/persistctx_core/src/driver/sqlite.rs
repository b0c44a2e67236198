//! SQLite driver backed by `rusqlite`.
//!
//! # Responsibility
//! - Parse `Keyword=Value;...` SQLite connection strings.
//! - Open file or in-memory connections and configure required pragmas.
//!
//! # Invariants
//! - Returned sessions have `foreign_keys` set per connection string (default ON).
//! - Returned sessions have a bounded busy timeout.
//! - Connection strings are never written to logs.

use super::{DatabaseDriver, DriverError, DriverResult, Session};
use crate::config::ConnectionDescriptor;
use log::{error, info};
use rusqlite::{Connection, OpenFlags};
use std::time::{Duration, Instant};

pub const SQLITE_DRIVER_ID: &str = "sqlite";

const MEMORY_DATA_SOURCE: &str = ":memory:";
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);
// sqlite3_busy_timeout takes an `int` millisecond count.
const MAX_BUSY_TIMEOUT: Duration = Duration::from_millis(i32::MAX as u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenMode {
    ReadWriteCreate,
    ReadWrite,
    ReadOnly,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SqliteOptions {
    data_source: String,
    mode: OpenMode,
    shared_cache: bool,
    foreign_keys: bool,
    busy_timeout: Option<Duration>,
}

impl SqliteOptions {
    fn parse(connection_string: &str) -> DriverResult<Self> {
        let mut options = Self {
            data_source: String::new(),
            mode: OpenMode::ReadWriteCreate,
            shared_cache: false,
            foreign_keys: true,
            busy_timeout: None,
        };

        let trimmed = connection_string.trim();
        if !trimmed.contains('=') {
            options.data_source = trimmed.to_string();
            return options.finish();
        }

        for segment in trimmed.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            let (keyword, value) = segment.split_once('=').ok_or_else(|| {
                DriverError::InvalidConnectionString(format!("expected `keyword=value`, got `{segment}`"))
            })?;
            let value = value.trim();
            match normalize_keyword(keyword).as_str() {
                "datasource" | "filename" => options.data_source = value.to_string(),
                "mode" => options.mode = parse_mode(value)?,
                "cache" => options.shared_cache = parse_cache(value)?,
                "foreignkeys" => options.foreign_keys = parse_bool(keyword, value)?,
                "defaulttimeout" | "commandtimeout" => {
                    options.busy_timeout = Some(parse_timeout(keyword, value)?);
                }
                _ => {
                    return Err(DriverError::InvalidConnectionString(format!(
                        "unsupported keyword `{}`",
                        keyword.trim()
                    )))
                }
            }
        }
        options.finish()
    }

    fn finish(mut self) -> DriverResult<Self> {
        if self.data_source == MEMORY_DATA_SOURCE {
            self.mode = OpenMode::Memory;
        }
        if self.data_source.is_empty() && self.mode != OpenMode::Memory {
            return Err(DriverError::InvalidConnectionString(
                "missing `Data Source`".to_string(),
            ));
        }
        Ok(self)
    }

    fn flags(&self) -> OpenFlags {
        let mut flags = OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        flags |= match self.mode {
            OpenMode::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY,
            OpenMode::ReadWrite => OpenFlags::SQLITE_OPEN_READ_WRITE,
            OpenMode::ReadWriteCreate | OpenMode::Memory => {
                OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
            }
        };
        if self.shared_cache {
            flags |= OpenFlags::SQLITE_OPEN_SHARED_CACHE;
        }
        flags
    }

    fn mode_label(&self) -> &'static str {
        match self.mode {
            OpenMode::Memory => "memory",
            _ => "file",
        }
    }
}

fn normalize_keyword(keyword: &str) -> String {
    keyword
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase()
}

fn parse_mode(value: &str) -> DriverResult<OpenMode> {
    match value.to_ascii_lowercase().as_str() {
        "readwritecreate" => Ok(OpenMode::ReadWriteCreate),
        "readwrite" => Ok(OpenMode::ReadWrite),
        "readonly" => Ok(OpenMode::ReadOnly),
        "memory" => Ok(OpenMode::Memory),
        other => Err(DriverError::InvalidConnectionString(format!(
            "unsupported mode `{other}`"
        ))),
    }
}

fn parse_cache(value: &str) -> DriverResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "shared" => Ok(true),
        "private" | "default" => Ok(false),
        other => Err(DriverError::InvalidConnectionString(format!(
            "unsupported cache `{other}`"
        ))),
    }
}

fn parse_timeout(keyword: &str, value: &str) -> DriverResult<Duration> {
    let timeout = value
        .parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|_| {
            DriverError::InvalidConnectionString(format!(
                "`{}` expects whole seconds, got `{value}`",
                keyword.trim()
            ))
        })?;
    if timeout > MAX_BUSY_TIMEOUT {
        return Err(DriverError::InvalidConnectionString(format!(
            "`{}` exceeds the maximum of {} seconds",
            keyword.trim(),
            MAX_BUSY_TIMEOUT.as_secs()
        )));
    }
    Ok(timeout)
}

fn parse_bool(keyword: &str, value: &str) -> DriverResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        other => Err(DriverError::InvalidConnectionString(format!(
            "`{}` expects a boolean, got `{other}`",
            keyword.trim()
        ))),
    }
}

/// Built-in driver for `driver_id = "sqlite"`.
#[derive(Debug, Clone)]
pub struct SqliteDriver {
    busy_timeout: Duration,
}

impl Default for SqliteDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl SqliteDriver {
    pub fn new() -> Self {
        Self {
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    /// Overrides the lock-wait bound used when the connection string sets none.
    /// Values above SQLite's limit (`i32::MAX` milliseconds) are clamped.
    pub fn with_busy_timeout(mut self, busy_timeout: Duration) -> Self {
        self.busy_timeout = busy_timeout.min(MAX_BUSY_TIMEOUT);
        self
    }

    pub fn busy_timeout(&self) -> Duration {
        self.busy_timeout
    }

    fn open_connection(&self, options: &SqliteOptions) -> DriverResult<Connection> {
        let conn = match options.mode {
            OpenMode::Memory => Connection::open_in_memory_with_flags(options.flags())?,
            _ => Connection::open_with_flags(&options.data_source, options.flags())?,
        };
        let foreign_keys = if options.foreign_keys { "ON" } else { "OFF" };
        conn.execute_batch(&format!("PRAGMA foreign_keys = {foreign_keys};"))?;
        let busy_timeout = options.busy_timeout.unwrap_or(self.busy_timeout);
        conn.busy_timeout(busy_timeout.min(MAX_BUSY_TIMEOUT))?;
        Ok(conn)
    }
}

impl DatabaseDriver for SqliteDriver {
    fn driver_id(&self) -> &str {
        SQLITE_DRIVER_ID
    }

    fn open(&self, descriptor: &ConnectionDescriptor) -> DriverResult<Box<dyn Session>> {
        let started_at = Instant::now();
        let options = SqliteOptions::parse(descriptor.connection_string())?;
        let mode = options.mode_label();
        info!("event=db_open module=driver.sqlite status=start mode={mode}");

        match self.open_connection(&options) {
            Ok(conn) => {
                info!(
                    "event=db_open module=driver.sqlite status=ok mode={mode} duration_ms={}",
                    started_at.elapsed().as_millis()
                );
                Ok(Box::new(SqliteSession { conn: Some(conn) }))
            }
            Err(err) => {
                error!(
                    "event=db_open module=driver.sqlite status=error mode={mode} duration_ms={} error_code=db_open_failed error={}",
                    started_at.elapsed().as_millis(),
                    err
                );
                Err(err)
            }
        }
    }
}

/// Session over one `rusqlite::Connection`.
#[derive(Debug)]
pub struct SqliteSession {
    conn: Option<Connection>,
}

impl SqliteSession {
    /// Returns the live connection, or `None` after close.
    pub fn connection(&self) -> Option<&Connection> {
        self.conn.as_ref()
    }
}

impl Session for SqliteSession {
    fn driver_id(&self) -> &str {
        SQLITE_DRIVER_ID
    }

    fn execute_batch(&mut self, sql: &str) -> DriverResult<()> {
        let conn = self.conn.as_mut().ok_or(DriverError::SessionClosed)?;
        let tx = conn.transaction()?;
        tx.execute_batch(sql)?;
        tx.commit()?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    fn close(&mut self) -> DriverResult<()> {
        let Some(conn) = self.conn.take() else {
            return Ok(());
        };
        conn.close().map_err(|(_, err)| DriverError::Sqlite(err))
    }
}
