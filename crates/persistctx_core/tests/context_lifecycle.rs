use persistctx_core::{
    ColumnType, ConnectionDescriptor, ConnectionResolver, ContextError, ContextState,
    DatabaseDriver, DriverError, DriverRegistry, DriverResult, MapConfigSource,
    PersistenceContext, Session,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

struct MemDriver {
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    fail_close: bool,
}

struct MemSession {
    open: bool,
    closed: Arc<AtomicUsize>,
    fail_close: bool,
    statements: Vec<String>,
}

impl DatabaseDriver for MemDriver {
    fn driver_id(&self) -> &str {
        "memdb"
    }

    fn open(&self, _descriptor: &ConnectionDescriptor) -> DriverResult<Box<dyn Session>> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemSession {
            open: true,
            closed: Arc::clone(&self.closed),
            fail_close: self.fail_close,
            statements: Vec::new(),
        }))
    }
}

impl Session for MemSession {
    fn driver_id(&self) -> &str {
        "memdb"
    }

    fn execute_batch(&mut self, sql: &str) -> DriverResult<()> {
        self.statements.push(sql.to_string());
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) -> DriverResult<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.closed.fetch_add(1, Ordering::SeqCst);
        if self.fail_close {
            return Err(DriverError::Sqlite(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                Some("unable to close due to unfinalized statements".to_string()),
            )));
        }
        Ok(())
    }
}

struct Fixture {
    opened: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
    fail_close: bool,
}

impl Fixture {
    fn new() -> Self {
        Self {
            opened: Arc::new(AtomicUsize::new(0)),
            closed: Arc::new(AtomicUsize::new(0)),
            fail_close: false,
        }
    }

    fn with_failing_close() -> Self {
        Self {
            fail_close: true,
            ..Self::new()
        }
    }

    fn drivers(&self) -> DriverRegistry {
        let mut drivers = DriverRegistry::new();
        drivers.register(Arc::new(MemDriver {
            opened: Arc::clone(&self.opened),
            closed: Arc::clone(&self.closed),
            fail_close: self.fail_close,
        }));
        drivers
    }

    fn context(&self) -> PersistenceContext {
        PersistenceContext::with_descriptor(
            ConnectionDescriptor::new("memdb", "test"),
            ConnectionResolver::new(MapConfigSource::new()),
            self.drivers(),
        )
    }
}

#[test]
fn widget_schema_is_built_from_explicit_descriptor() {
    let mut context = Fixture::new().context();
    context
        .register_schema_callback(|builder| {
            builder
                .entity("Widget")?
                .property("id", ColumnType::Integer)?
                .has_key(&["id"])?;
            Ok(())
        })
        .unwrap();

    context.build_schema().unwrap();

    assert_eq!(context.state(), ContextState::SchemaReady);
    let schema = context.schema().expect("schema is ready");
    assert!(schema.contains_entity("Widget"));
    assert_eq!(context.descriptor().unwrap().driver_id(), "memdb");
}

#[test]
fn build_schema_runs_callbacks_exactly_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut context = Fixture::new().context();
    let counter = Arc::clone(&calls);
    context
        .register_schema_callback(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    context.build_schema().unwrap();
    context.build_schema().unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn callbacks_observe_builder_in_registration_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut context = Fixture::new().context();

    let first = Arc::clone(&log);
    context
        .register_named_schema_callback("A", move |builder| {
            first
                .lock()
                .unwrap()
                .push(format!("A saw {:?}", builder.entity_names()));
            builder.entity("Widget")?;
            Ok(())
        })
        .unwrap();
    let second = Arc::clone(&log);
    context
        .register_named_schema_callback("B", move |builder| {
            second
                .lock()
                .unwrap()
                .push(format!("B saw {:?}", builder.entity_names()));
            Ok(())
        })
        .unwrap();

    context.build_schema().unwrap();

    assert_eq!(
        *log.lock().unwrap(),
        vec!["A saw []".to_string(), "B saw [\"Widget\"]".to_string()]
    );
}

#[test]
fn registration_after_build_is_rejected() {
    let mut context = Fixture::new().context();
    context.build_schema().unwrap();

    let err = context
        .register_schema_callback(|_| Ok(()))
        .expect_err("registry is frozen");
    assert!(matches!(err, ContextError::SchemaAlreadyBuilt));
    assert_eq!(context.callback_count(), 0);
}

#[test]
fn missing_default_configuration_fails_on_first_resolution() {
    let fixture = Fixture::new();
    let mut context = PersistenceContext::new(
        ConnectionResolver::new(MapConfigSource::new()),
        fixture.drivers(),
    );
    assert_eq!(context.state(), ContextState::Unresolved);

    let err = context.resolve().expect_err("nothing configured");
    match err {
        ContextError::ConfigurationMissing { name } => assert_eq!(name, "SqliteConnection"),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err_message_names_setting(&mut context));
    assert_eq!(context.state(), ContextState::Unresolved);
    assert_eq!(fixture.opened.load(Ordering::SeqCst), 0);
}

fn err_message_names_setting(context: &mut PersistenceContext) -> bool {
    match context.open_connection() {
        Err(err) => err.to_string().contains("SqliteConnection"),
        Ok(_) => false,
    }
}

#[test]
fn failed_callback_surfaces_build_failure_and_retry_succeeds() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let first_calls = Arc::new(AtomicUsize::new(0));
    let mut context = Fixture::new().context();

    let first = Arc::clone(&first_calls);
    context
        .register_schema_callback(move |builder| {
            first.fetch_add(1, Ordering::SeqCst);
            builder.entity("Widget")?;
            Ok(())
        })
        .unwrap();
    let flaky = Arc::clone(&attempts);
    context
        .register_named_schema_callback("flaky", move |builder| {
            if flaky.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err("mapping not ready".into());
            }
            builder.entity("Gadget")?;
            Ok(())
        })
        .unwrap();

    let err = context.build_schema().expect_err("first attempt fails");
    match &err {
        ContextError::SchemaBuildFailed {
            callback,
            label,
            source,
        } => {
            assert_eq!(callback.index(), 1);
            assert_eq!(label.as_deref(), Some("flaky"));
            assert_eq!(source.to_string(), "mapping not ready");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(std::error::Error::source(&err).is_some());
    assert_eq!(context.state(), ContextState::Resolved);
    assert!(context.schema().is_none());

    context.build_schema().expect("retry succeeds");
    assert_eq!(context.state(), ContextState::SchemaReady);
    assert_eq!(first_calls.load(Ordering::SeqCst), 2);
    let schema = context.schema().unwrap();
    assert_eq!(schema.len(), 2);
    assert!(schema.contains_entity("Gadget"));
}

#[test]
fn schema_errors_from_builder_abort_the_build() {
    let mut context = Fixture::new().context();
    context
        .register_schema_callback(|builder| {
            builder.entity("not a name")?;
            Ok(())
        })
        .unwrap();

    let err = context.build_schema().expect_err("invalid identifier");
    assert!(matches!(err, ContextError::SchemaBuildFailed { .. }));
    assert!(err.to_string().contains("not a name"));
}

#[test]
fn close_releases_session_and_is_terminal() {
    let fixture = Fixture::new();
    let mut context = fixture.context();
    context.open_connection().unwrap();
    context.open_connection().unwrap();
    assert_eq!(fixture.opened.load(Ordering::SeqCst), 1);

    context.close().unwrap();
    context.close().unwrap();
    assert_eq!(fixture.closed.load(Ordering::SeqCst), 1);
    assert_eq!(context.state(), ContextState::Closed);

    assert!(matches!(context.resolve(), Err(ContextError::ContextClosed)));
    assert!(matches!(
        context.build_schema(),
        Err(ContextError::ContextClosed)
    ));
    assert!(matches!(
        context.register_schema_callback(|_| Ok(())),
        Err(ContextError::ContextClosed)
    ));
    assert!(matches!(
        context.open_connection(),
        Err(ContextError::ContextClosed)
    ));
    assert!(matches!(
        context.ensure_created(),
        Err(ContextError::ContextClosed)
    ));
}

#[test]
fn dropping_context_releases_held_session() {
    let fixture = Fixture::new();
    {
        let mut context = fixture.context();
        context.open_connection().unwrap();
    }
    assert_eq!(fixture.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_session_release_still_closes_context() {
    let fixture = Fixture::with_failing_close();
    let mut context = fixture.context();
    context.open_connection().unwrap();

    let err = context.close().expect_err("session release fails");
    assert_eq!(err.code(), "session_failed");
    match &err {
        ContextError::SessionFailed { driver_id, source } => {
            assert_eq!(driver_id, "memdb");
            assert!(matches!(source, DriverError::Sqlite(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(context.state(), ContextState::Closed);
    assert!(!context.has_open_session());

    context.close().expect("second close is a no-op");
    assert_eq!(fixture.closed.load(Ordering::SeqCst), 1);
    assert!(matches!(
        context.open_connection(),
        Err(ContextError::ContextClosed)
    ));
}

#[test]
fn dropping_context_tolerates_failed_session_release() {
    let fixture = Fixture::with_failing_close();
    {
        let mut context = fixture.context();
        context.open_connection().unwrap();
    }
    assert_eq!(fixture.closed.load(Ordering::SeqCst), 1);
}

#[test]
fn bare_entity_builds_and_creates_nothing() {
    let fixture = Fixture::new();
    let mut context = fixture.context();
    context
        .register_schema_callback(|builder| {
            builder.entity("Widget")?;
            Ok(())
        })
        .unwrap();

    context.ensure_created().unwrap();

    assert_eq!(context.state(), ContextState::SchemaReady);
    assert!(context.schema().unwrap().contains_entity("Widget"));
    assert_eq!(fixture.opened.load(Ordering::SeqCst), 0);
}

#[test]
fn unknown_driver_fails_with_connection_failed() {
    let mut context = PersistenceContext::with_descriptor(
        ConnectionDescriptor::new("oracle", "whatever"),
        ConnectionResolver::new(MapConfigSource::new()),
        Fixture::new().drivers(),
    );
    let err = context.open_connection().err().expect("no oracle driver");
    assert!(matches!(err, ContextError::ConnectionFailed { driver_id, .. } if driver_id == "oracle"));
    assert_eq!(context.state(), ContextState::Resolved);
}

#[test]
fn built_schema_is_shared_read_only_across_threads() {
    let mut context = Fixture::new().context();
    context
        .register_schema_callback(|builder| {
            builder.entity("Widget")?.property("id", ColumnType::Integer)?;
            Ok(())
        })
        .unwrap();
    context.build_schema().unwrap();
    let schema = context.schema().unwrap();

    let handles = (0..4)
        .map(|_| {
            let schema = Arc::clone(&schema);
            std::thread::spawn(move || schema.contains_entity("Widget"))
        })
        .collect::<Vec<_>>();
    for handle in handles {
        assert!(handle.join().unwrap());
    }
}
