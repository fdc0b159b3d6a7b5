//! Shared DuckDB engine: one in-memory database per process, reached through
//! a bounded r2d2 pool.
//!
//! Every pooled connection is a clone of the same database instance, so the
//! extensions and the secret set up by [`bootstrap`] are visible to all of them.

use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant as StdInstant};

use duckdb::{params, Config as DuckConfig, Connection, DuckdbConnectionManager};
use r2d2::{ManageConnection, Pool, PooledConnection};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, CredentialBundle, PoolSettings, SECRET_NAME};
use crate::error::{BootstrapError, HandlerError};

// How long a canceled query may take to notice the interrupt and hand its
// connection back.
const CANCEL_GRACE: Duration = Duration::from_secs(5);
const INTERRUPT_RETRY: Duration = Duration::from_millis(50);

// A pooled DuckDB connection that can be marked for closing on release.
struct EngineConn {
    db: Connection,
    retire: bool,
}

// Wraps the duckdb manager so r2d2 discards retired connections on return
// instead of parking them as idle.
struct IdleCappedManager {
    inner: DuckdbConnectionManager,
}

impl ManageConnection for IdleCappedManager {
    type Connection = EngineConn;
    type Error = duckdb::Error;

    fn connect(&self) -> Result<EngineConn, duckdb::Error> {
        Ok(EngineConn {
            db: self.inner.connect()?,
            retire: false,
        })
    }

    fn is_valid(&self, conn: &mut EngineConn) -> Result<(), duckdb::Error> {
        self.inner.is_valid(&mut conn.db)
    }

    fn has_broken(&self, conn: &mut EngineConn) -> bool {
        conn.retire || self.inner.has_broken(&mut conn.db)
    }
}

struct Shared {
    pool: Pool<IdleCappedManager>,
    max_idle: u32,
    // Serializes releases so the idle check and the return are one step.
    release: Mutex<()>,
}

/// Connection checked out of the engine's pool. On drop it goes back as idle,
/// or is closed when the pool already holds `max idle` idle connections.
pub struct Checkout {
    shared: Arc<Shared>,
    conn: Option<PooledConnection<IdleCappedManager>>,
}

impl Deref for Checkout {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.conn {
            Some(pooled) => &pooled.db,
            None => unreachable!("connection is only taken in drop"),
        }
    }
}

impl Drop for Checkout {
    fn drop(&mut self) {
        let Some(mut pooled) = self.conn.take() else {
            return;
        };
        let _guard = self
            .shared
            .release
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.shared.pool.state().idle_connections >= self.shared.max_idle {
            pooled.retire = true;
        }
        drop(pooled);
    }
}

/// Process-wide engine handle. Cloning shares the same pool.
#[derive(Clone)]
pub struct Engine {
    shared: Arc<Shared>,
    acquire_timeout: Duration,
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolState {
    pub connections: u32,
    pub idle_connections: u32,
}

fn engine_flags() -> Result<DuckConfig, BootstrapError> {
    DuckConfig::default()
        .enable_autoload_extension(true)
        .map_err(BootstrapError::EngineOpen)
}

/// Runs the full cold-start sequence: open, load extensions, register secret.
///
/// Returns the first failure; nothing after a failed step runs.
pub fn bootstrap(config: &Config) -> Result<Engine, BootstrapError> {
    finish_bootstrap(Engine::open(&config.pool)?, config)
}

fn finish_bootstrap(engine: Engine, config: &Config) -> Result<Engine, BootstrapError> {
    engine.load_extensions(&config.extensions)?;
    engine.register_secret(&config.credentials)?;
    Ok(engine)
}

impl Engine {
    /// Open a transient in-memory database and build the pool around it.
    ///
    /// The pool is fully configured before the handle is returned.
    pub fn open(settings: &PoolSettings) -> Result<Self, BootstrapError> {
        Self::open_with_flags(settings, engine_flags()?)
    }

    #[instrument(skip(settings, flags), fields(max_open = settings.max_open, max_idle = settings.max_idle))]
    fn open_with_flags(settings: &PoolSettings, flags: DuckConfig) -> Result<Self, BootstrapError> {
        let inner =
            DuckdbConnectionManager::memory_with_flags(flags).map_err(BootstrapError::EngineOpen)?;

        // Connections open lazily; the idle ceiling is enforced on release.
        let pool = Pool::builder()
            .max_size(settings.max_open)
            .min_idle(Some(0))
            .max_lifetime(settings.max_lifetime)
            .idle_timeout(settings.max_idle_time)
            .connection_timeout(settings.acquire_timeout)
            .build(IdleCappedManager { inner })
            .map_err(BootstrapError::PoolBuild)?;

        info!("duckdb engine opened");
        Ok(Self {
            shared: Arc::new(Shared {
                pool,
                max_idle: settings.max_idle,
                release: Mutex::new(()),
            }),
            acquire_timeout: settings.acquire_timeout,
        })
    }

    fn checkout_timeout(&self, timeout: Duration) -> Result<Checkout, r2d2::Error> {
        checkout(&self.shared, timeout)
    }

    /// Load extensions with one combined `LOAD` batch.
    pub fn load_extensions(&self, names: &[String]) -> Result<(), BootstrapError> {
        if names.is_empty() {
            return Ok(());
        }
        let begin = StdInstant::now();
        let batch = load_batch(names);

        let conn = self
            .checkout_timeout(self.acquire_timeout)
            .map_err(BootstrapError::PoolBuild)?;
        conn.execute_batch(&batch)
            .map_err(BootstrapError::ExtensionLoad)?;

        info!(
            extensions = ?names,
            elapsed_ms = begin.elapsed().as_millis() as u64,
            "load extensions took"
        );
        Ok(())
    }

    /// Register the S3 secret with a single parameterized statement.
    pub fn register_secret(&self, bundle: &CredentialBundle) -> Result<(), BootstrapError> {
        let begin = StdInstant::now();
        let conn = self
            .checkout_timeout(self.acquire_timeout)
            .map_err(BootstrapError::PoolBuild)?;
        let result = conn.execute(
            &secret_statement(SECRET_NAME),
            params![
                bundle.endpoint,
                bundle.key_id,
                bundle.secret,
                bundle.session_token,
                bundle.region,
                bundle.use_ssl,
                bundle.url_style.as_str(),
            ],
        );
        info!(
            secret = SECRET_NAME,
            elapsed_ms = begin.elapsed().as_millis() as u64,
            "create secret took"
        );
        result.map_err(BootstrapError::SecretRegistration)?;
        Ok(())
    }

    pub fn state(&self) -> PoolState {
        let state = self.shared.pool.state();
        PoolState {
            connections: state.connections,
            idle_connections: state.idle_connections,
        }
    }

    #[cfg(test)]
    pub(crate) fn checkout(&self) -> Checkout {
        self.checkout_timeout(self.acquire_timeout)
            .expect("pooled connection")
    }

    /// Run a single-column scalar query on a pooled connection.
    ///
    /// `Ok(None)` means the query produced no row. With a deadline, waiting
    /// for a free connection lasts until the deadline; without one, until the
    /// configured acquire timeout. When the deadline passes mid-query the
    /// statement is interrupted and the call waits (bounded) for the
    /// connection to return to the pool before reporting `Canceled`.
    pub async fn query_count(
        &self,
        sql: String,
        deadline: Option<Instant>,
    ) -> Result<Option<i64>, HandlerError> {
        let shared = Arc::clone(&self.shared);
        let acquire = match deadline {
            Some(d) => d.saturating_duration_since(Instant::now()),
            None => self.acquire_timeout,
        };
        if acquire.is_zero() {
            return Err(HandlerError::Canceled);
        }
        let std_deadline = deadline.map(Instant::into_std);
        let (tx, mut rx) = oneshot::channel();

        let mut task = tokio::task::spawn_blocking(move || {
            let conn = checkout(&shared, acquire).map_err(HandlerError::Acquire)?;
            if std_deadline.is_some_and(|d| StdInstant::now() >= d) {
                return Err(HandlerError::Canceled);
            }
            let _ = tx.send(conn.interrupt_handle());
            let begin = StdInstant::now();
            let count = scalar_count(&conn, &sql)?;
            debug!(
                ?count,
                elapsed_ms = begin.elapsed().as_millis() as u64,
                "query finished"
            );
            Ok(count)
        });

        let Some(deadline) = deadline else {
            return task.await?;
        };
        if let Ok(joined) = tokio::time::timeout_at(deadline, &mut task).await {
            return joined?;
        }

        // Deadline hit: keep interrupting until the blocking task lets go of
        // its connection, or the grace period runs out.
        let give_up = Instant::now() + CANCEL_GRACE;
        let mut interrupt = None;
        loop {
            if interrupt.is_none() {
                interrupt = rx.try_recv().ok();
            }
            if let Some(handle) = &interrupt {
                handle.interrupt();
            }
            match tokio::time::timeout(INTERRUPT_RETRY, &mut task).await {
                Ok(Ok(Ok(count))) => {
                    // Finished just as the deadline passed.
                    return Ok(count);
                }
                Ok(_) => break,
                Err(_) if Instant::now() >= give_up => {
                    warn!("canceled query did not stop within grace period");
                    break;
                }
                Err(_) => {}
            }
        }
        Err(HandlerError::Canceled)
    }
}

fn checkout(shared: &Arc<Shared>, timeout: Duration) -> Result<Checkout, r2d2::Error> {
    let pooled = shared.pool.get_timeout(timeout)?;
    Ok(Checkout {
        shared: Arc::clone(shared),
        conn: Some(pooled),
    })
}

fn load_batch(names: &[String]) -> String {
    names
        .iter()
        .map(|name| format!("LOAD {};", quote_literal(name)))
        .collect::<Vec<_>>()
        .join("\n")
}

fn secret_statement(name: &str) -> String {
    format!(
        "CREATE OR REPLACE SECRET {name} (
    TYPE S3,
    PROVIDER config,
    ENDPOINT ?,
    KEY_ID ?,
    SECRET ?,
    SESSION_TOKEN ?,
    REGION ?,
    USE_SSL ?,
    URL_STYLE ?
);"
    )
}

// Quote `value` as a SQL string literal.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn scalar_count(conn: &Connection, sql: &str) -> Result<Option<i64>, HandlerError> {
    let mut stmt = conn.prepare(sql).map_err(HandlerError::QueryExecution)?;
    let mut rows = stmt.query([]).map_err(HandlerError::QueryExecution)?;
    let Some(row) = rows.next().map_err(HandlerError::QueryExecution)? else {
        return Ok(None);
    };
    row.get::<_, i64>(0)
        .map(Some)
        .map_err(HandlerError::ResultDecode)
}
