//! Persistence context: connection binding plus schema customization hooks.
//!
//! # Responsibility
//! - Own the resolved connection descriptor for one unit of work.
//! - Run registered schema callbacks once, in order, and freeze the result.
//! - Open and release the context's database session.
//!
//! # Invariants
//! - Descriptor resolution is lazy and happens at most once successfully.
//! - Callback registration is closed once the schema is built.
//! - A failed resolution or build leaves the state unchanged except for the
//!   transient `SchemaBuilding` marker.
//! - `Closed` is terminal.
//!
//! # See also
//! - `resolver` for the descriptor lookup order.

use crate::callbacks::{CallbackId, CallbackRegistry, CallbackResult, SchemaCallback};
use crate::config::{ConnectionDescriptor, SettingsConfigSource, SettingsError};
use crate::driver::{DriverRegistry, Session};
use crate::error::{ContextError, ContextResult};
use crate::resolver::ConnectionResolver;
use crate::schema::{Schema, SchemaBuilder};
use log::{debug, error, info, warn};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Per-instance id used to correlate log events.
pub type ContextId = Uuid;

/// Lifecycle state of a [`PersistenceContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// No descriptor has been resolved yet.
    Unresolved,
    /// Descriptor resolved; schema not built.
    Resolved,
    /// Callbacks are running.
    SchemaBuilding,
    /// Schema frozen; registration closed.
    SchemaReady,
    /// Released; every further operation fails.
    Closed,
}

impl ContextState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unresolved => "unresolved",
            Self::Resolved => "resolved",
            Self::SchemaBuilding => "schema_building",
            Self::SchemaReady => "schema_ready",
            Self::Closed => "closed",
        }
    }
}

/// Owns one connection binding and its schema customization hooks.
///
/// Resolution is lazy: constructors never fail, and a missing configuration
/// surfaces as `ConfigurationMissing` from the first operation that needs the
/// descriptor (`resolve`, `build_schema`, `open_connection`, `ensure_created`).
pub struct PersistenceContext {
    id: ContextId,
    resolver: ConnectionResolver,
    drivers: DriverRegistry,
    explicit: Option<ConnectionDescriptor>,
    descriptor: Option<ConnectionDescriptor>,
    callbacks: CallbackRegistry,
    schema: Option<Arc<Schema>>,
    state: ContextState,
    session: Option<Box<dyn Session>>,
}

impl PersistenceContext {
    /// Creates a context that resolves the configured named default.
    pub fn new(resolver: ConnectionResolver, drivers: DriverRegistry) -> Self {
        Self::create(None, resolver, drivers)
    }

    /// Creates a context bound to caller-supplied settings.
    pub fn with_descriptor(
        explicit: ConnectionDescriptor,
        resolver: ConnectionResolver,
        drivers: DriverRegistry,
    ) -> Self {
        Self::create(Some(explicit), resolver, drivers)
    }

    /// Creates a context backed by `ConnectionStrings__<name>` process
    /// environment variables and the built-in drivers.
    ///
    /// # Errors
    /// - `SettingsError` when the environment cannot be read into settings.
    ///   Resolution itself stays lazy.
    pub fn from_environment(
        explicit: Option<ConnectionDescriptor>,
    ) -> Result<Self, SettingsError> {
        Ok(Self::create(
            explicit,
            ConnectionResolver::new(SettingsConfigSource::from_environment()?),
            DriverRegistry::with_defaults(),
        ))
    }

    pub fn create(
        explicit: Option<ConnectionDescriptor>,
        resolver: ConnectionResolver,
        drivers: DriverRegistry,
    ) -> Self {
        let id = Uuid::new_v4();
        debug!(
            "event=context_create module=context status=ok context_id={id} explicit={}",
            explicit.is_some()
        );
        Self {
            id,
            resolver,
            drivers,
            explicit,
            descriptor: None,
            callbacks: CallbackRegistry::new(),
            schema: None,
            state: ContextState::Unresolved,
            session: None,
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Returns the resolved descriptor, if resolution already happened.
    pub fn descriptor(&self) -> Option<&ConnectionDescriptor> {
        self.descriptor.as_ref()
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_schema_built(&self) -> bool {
        self.schema.is_some()
    }

    /// Returns the frozen schema once built. Safe to share across threads.
    pub fn schema(&self) -> Option<Arc<Schema>> {
        self.schema.clone()
    }

    pub fn has_open_session(&self) -> bool {
        self.session.as_ref().is_some_and(|session| session.is_open())
    }

    /// Resolves the connection descriptor if not already resolved.
    ///
    /// # Errors
    /// - `ContextClosed` after `close()`.
    /// - `ConfigurationMissing` when nothing usable is configured; the
    ///   context stays `Unresolved` and a later call may succeed.
    pub fn resolve(&mut self) -> ContextResult<&ConnectionDescriptor> {
        self.ensure_not_closed()?;
        let descriptor = match self.descriptor.take() {
            Some(descriptor) => descriptor,
            None => {
                let descriptor = self
                    .resolver
                    .resolve(self.explicit.as_ref())
                    .map_err(|err| {
                        error!(
                            "event=context_resolve module=context status=error context_id={} error_code={} error={}",
                            self.id,
                            err.code(),
                            err
                        );
                        err
                    })?;
                info!(
                    "event=context_resolve module=context status=ok context_id={} driver={}",
                    self.id,
                    descriptor.driver_id()
                );
                if self.state == ContextState::Unresolved {
                    self.state = ContextState::Resolved;
                }
                descriptor
            }
        };
        Ok(self.descriptor.insert(descriptor))
    }

    /// Appends an anonymous schema callback.
    pub fn register_schema_callback<F>(&mut self, callback: F) -> ContextResult<CallbackId>
    where
        F: FnMut(&mut SchemaBuilder) -> CallbackResult + Send + 'static,
    {
        self.push_callback(None, Box::new(callback))
    }

    /// Appends a schema callback whose label appears in logs and errors.
    pub fn register_named_schema_callback<F>(
        &mut self,
        label: impl Into<String>,
        callback: F,
    ) -> ContextResult<CallbackId>
    where
        F: FnMut(&mut SchemaBuilder) -> CallbackResult + Send + 'static,
    {
        self.push_callback(Some(label.into()), Box::new(callback))
    }

    fn push_callback(
        &mut self,
        label: Option<String>,
        callback: SchemaCallback,
    ) -> ContextResult<CallbackId> {
        self.ensure_not_closed()?;
        if self.schema.is_some() {
            warn!(
                "event=callback_register module=context status=rejected context_id={} error_code=schema_already_built",
                self.id
            );
            return Err(ContextError::SchemaAlreadyBuilt);
        }
        let id = self.callbacks.push(label, callback);
        debug!(
            "event=callback_register module=context status=ok context_id={} callback={id}",
            self.id
        );
        Ok(id)
    }

    /// Runs every registered callback once and freezes the schema.
    ///
    /// Idempotent: once the schema is built, further calls return `Ok(())`
    /// without invoking callbacks again.
    ///
    /// # Errors
    /// - `ContextClosed`, `ConfigurationMissing` as for [`Self::resolve`].
    /// - `SchemaBuildFailed` when a callback fails. The partially mutated
    ///   builder is discarded; a retry re-runs every callback from the start.
    pub fn build_schema(&mut self) -> ContextResult<()> {
        self.ensure_not_closed()?;
        if self.schema.is_some() {
            debug!(
                "event=schema_build module=context status=skipped context_id={} reason=already_built",
                self.id
            );
            return Ok(());
        }
        self.resolve()?;

        let started_at = Instant::now();
        let previous_state = self.state;
        self.state = ContextState::SchemaBuilding;
        info!(
            "event=schema_build module=context status=start context_id={} callbacks={}",
            self.id,
            self.callbacks.len()
        );

        let mut builder = SchemaBuilder::new();
        match self.callbacks.run_all(&mut builder) {
            Ok(()) => {
                let schema = builder.freeze();
                info!(
                    "event=schema_build module=context status=ok context_id={} entities={} duration_ms={}",
                    self.id,
                    schema.len(),
                    started_at.elapsed().as_millis()
                );
                self.schema = Some(Arc::new(schema));
                self.state = ContextState::SchemaReady;
                Ok(())
            }
            Err(failure) => {
                self.state = previous_state;
                error!(
                    "event=schema_build module=context status=error context_id={} callback={} duration_ms={} error_code=schema_build_failed error={}",
                    self.id,
                    failure.id,
                    started_at.elapsed().as_millis(),
                    failure.source
                );
                Err(ContextError::SchemaBuildFailed {
                    callback: failure.id,
                    label: failure.label,
                    source: failure.source,
                })
            }
        }
    }

    /// Returns the context's session, opening it through the driver selected
    /// by the descriptor's driver id on first use.
    ///
    /// # Errors
    /// - `ContextClosed`, `ConfigurationMissing` as for [`Self::resolve`].
    /// - `ConnectionFailed` for unknown drivers and driver-level failures.
    pub fn open_connection(&mut self) -> ContextResult<&mut (dyn Session + 'static)> {
        self.ensure_not_closed()?;
        let session = match self.session.take() {
            Some(session) if session.is_open() => session,
            _ => {
                let descriptor = self.resolve()?.clone();
                let session = self.drivers.open(&descriptor).map_err(|source| {
                    error!(
                        "event=context_open module=context status=error context_id={} driver={} error_code=connection_failed error={}",
                        self.id,
                        descriptor.driver_id(),
                        source
                    );
                    ContextError::ConnectionFailed {
                        driver_id: descriptor.driver_id().to_string(),
                        source,
                    }
                })?;
                info!(
                    "event=context_open module=context status=ok context_id={} driver={}",
                    self.id,
                    descriptor.driver_id()
                );
                session
            }
        };
        Ok(&mut **self.session.insert(session))
    }

    /// Builds the schema if needed and creates any missing tables and
    /// indexes through the context's session.
    ///
    /// Entities without properties are skipped. No session is opened when
    /// nothing needs to be created.
    ///
    /// # Errors
    /// - Everything [`Self::build_schema`] and [`Self::open_connection`] return.
    /// - `SessionFailed` when the session rejects the generated DDL.
    pub fn ensure_created(&mut self) -> ContextResult<()> {
        self.build_schema()?;
        let id = self.id;
        let script = match &self.schema {
            Some(schema) => {
                for entity in schema.entities().iter().filter(|entity| !entity.has_columns()) {
                    warn!(
                        "event=ensure_created module=context status=skipped context_id={id} entity={} reason=no_properties",
                        entity.name()
                    );
                }
                schema.create_script()
            }
            None => return Ok(()),
        };
        if script.is_empty() {
            return Ok(());
        }
        let session = self.open_connection()?;
        let driver_id = session.driver_id().to_string();
        session.execute_batch(&script).map_err(|source| {
            error!(
                "event=ensure_created module=context status=error context_id={id} driver={driver_id} error_code=session_failed error={source}"
            );
            ContextError::SessionFailed { driver_id, source }
        })?;
        info!("event=ensure_created module=context status=ok context_id={id}");
        Ok(())
    }

    /// Releases the held session, if any, and moves to `Closed`.
    ///
    /// Idempotent. The context is closed even when releasing the session
    /// reports an error; that error is still returned.
    pub fn close(&mut self) -> ContextResult<()> {
        if self.state == ContextState::Closed {
            return Ok(());
        }
        let previous_state = self.state;
        self.state = ContextState::Closed;
        let result = match self.session.take() {
            Some(mut session) => {
                let driver_id = session.driver_id().to_string();
                session
                    .close()
                    .map_err(|source| ContextError::SessionFailed { driver_id, source })
            }
            None => Ok(()),
        };
        match &result {
            Ok(()) => info!(
                "event=context_close module=context status=ok context_id={} from_state={}",
                self.id,
                previous_state.as_str()
            ),
            Err(err) => error!(
                "event=context_close module=context status=error context_id={} from_state={} error_code={} error={}",
                self.id,
                previous_state.as_str(),
                err.code(),
                err
            ),
        }
        result
    }

    fn ensure_not_closed(&self) -> ContextResult<()> {
        if self.state == ContextState::Closed {
            return Err(ContextError::ContextClosed);
        }
        Ok(())
    }
}

impl Drop for PersistenceContext {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(err) = session.close() {
                warn!(
                    "event=context_drop module=context status=error context_id={} error={}",
                    self.id, err
                );
            }
        }
    }
}

impl Debug for PersistenceContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceContext")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("descriptor", &self.descriptor)
            .field("callbacks", &self.callbacks)
            .field("schema_built", &self.schema.is_some())
            .field("session_open", &self.has_open_session())
            .finish()
    }
}
