//! Database handles: descriptor parsing, pooled open and liveness checks.
//!
//! Neither opening a pool nor pinging it observes cancellation on its own,
//! so both run as spawned tasks raced against a [`CancellationToken`]. A task
//! that loses the race is still awaited in the background and its result
//! dropped.

use super::row::{DbRow, column_names};
use crate::errors::Error;
use futures::{StreamExt as _, TryStreamExt as _, stream::BoxStream};
use secrecy::{ExposeSecret, SecretString};
use sqlx::{
    Connection as _, Database, Executor as _, Statement as _,
    mysql::{MySql, MySqlConnectOptions, MySqlPool, MySqlStatement},
    pool::PoolOptions,
    postgres::{PgConnectOptions, PgPool, PgStatement, Postgres},
    sqlite::{Sqlite, SqliteConnectOptions, SqlitePool, SqliteStatement},
};
use std::{
    env,
    fmt,
    future::Future,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Database flavours, one per supported sqlx driver.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Driver {
    Postgres,
    MySql,
    Sqlite,
}

impl Driver {
    fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme.to_ascii_lowercase().as_str() {
            "pg" | "postgres" | "postgresql" | "pgsql" => Some(Self::Postgres),
            "my" | "mysql" | "mariadb" | "maria" => Some(Self::MySql),
            "sq" | "sqlite" | "sqlite3" | "file" => Some(Self::Sqlite),
            _ => None,
        }
    }

    const fn scheme(self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for Driver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// A parsed connection descriptor. Only the driver is ever surfaced; the
/// driver-specific DSN stays secret.
#[derive(Debug)]
pub struct ConnectionTarget {
    driver: Driver,
    dsn: SecretString,
}

impl ConnectionTarget {
    /// Expand environment references in `raw` and split it into driver and DSN.
    ///
    /// # Errors
    ///
    /// Returns an error that never contains the descriptor itself
    pub fn parse(raw: &str) -> Result<Self, Error> {
        let expanded = expand_env(raw);

        let url = url::Url::parse(&expanded).map_err(|e| Error::InvalidDescriptor(e.to_string()))?;
        let scheme = url.scheme();
        let driver =
            Driver::from_scheme(scheme).ok_or_else(|| Error::UnsupportedDriver(scheme.to_string()))?;

        // Normalise scheme aliases to what the sqlx driver registry expects.
        let rest = expanded.get(scheme.len()..).unwrap_or_default();
        let dsn = if driver == Driver::Sqlite && scheme.eq_ignore_ascii_case("file") {
            format!("sqlite:{}", rest.trim_start_matches(':'))
        } else {
            format!("{}{rest}", driver.scheme())
        };

        Ok(Self {
            driver,
            dsn: SecretString::from(dsn),
        })
    }

    #[must_use]
    pub const fn driver(&self) -> Driver {
        self.driver
    }
}

/// Pool sizing applied when a handle is opened.
#[derive(Clone, Copy, Debug)]
pub struct PoolLimits {
    pub max_connections: u32,
    pub max_idle_connections: u32,
    /// `Duration::ZERO` disables age-based recycling.
    pub max_lifetime: Duration,
}

impl PoolLimits {
    fn options<DB: Database>(self) -> PoolOptions<DB> {
        let options = PoolOptions::<DB>::new()
            .max_connections(self.max_connections.max(1))
            .min_connections(0)
            .max_lifetime((!self.max_lifetime.is_zero()).then_some(self.max_lifetime));

        // sqlx has no idle cap; with no idle connections allowed they are
        // reaped as soon as possible instead.
        if self.max_idle_connections == 0 {
            options.idle_timeout(Some(Duration::from_secs(1)))
        } else {
            options
        }
    }
}

/// A driver-native connection pool. Rows and statements keep the driver's
/// own types so every column type the driver knows can be decoded.
#[derive(Clone, Debug)]
pub enum DbPool {
    Postgres(PgPool),
    MySql(MySqlPool),
    Sqlite(SqlitePool),
}

impl DbPool {
    async fn connect(target: &ConnectionTarget, limits: PoolLimits) -> Result<Self, sqlx::Error> {
        let dsn = target.dsn.expose_secret();

        Ok(match target.driver {
            Driver::Postgres => Self::Postgres(
                limits
                    .options::<Postgres>()
                    .connect_with(PgConnectOptions::from_str(dsn)?)
                    .await?,
            ),
            Driver::MySql => Self::MySql(
                limits
                    .options::<MySql>()
                    .connect_with(MySqlConnectOptions::from_str(dsn)?)
                    .await?,
            ),
            Driver::Sqlite => Self::Sqlite(
                limits
                    .options::<Sqlite>()
                    .connect_with(SqliteConnectOptions::from_str(dsn)?)
                    .await?,
            ),
        })
    }

    #[must_use]
    pub const fn driver(&self) -> Driver {
        match self {
            Self::Postgres(_) => Driver::Postgres,
            Self::MySql(_) => Driver::MySql,
            Self::Sqlite(_) => Driver::Sqlite,
        }
    }

    /// Prepare `sql` on one of the pooled connections.
    ///
    /// # Errors
    ///
    /// Returns the driver error, e.g. a syntax error in `sql`
    pub async fn prepare(&self, sql: &str) -> Result<PreparedStatement, sqlx::Error> {
        Ok(match self {
            Self::Postgres(pool) => {
                PreparedStatement::Postgres(sqlx::Statement::to_owned(&pool.prepare(sql).await?))
            }
            Self::MySql(pool) => {
                PreparedStatement::MySql(sqlx::Statement::to_owned(&pool.prepare(sql).await?))
            }
            Self::Sqlite(pool) => {
                PreparedStatement::Sqlite(sqlx::Statement::to_owned(&pool.prepare(sql).await?))
            }
        })
    }

    /// Rows of `sql` run as a one-off statement that is not kept in the
    /// connection's statement cache.
    #[must_use]
    pub fn fetch_unprepared<'a>(&'a self, sql: &'a str) -> BoxStream<'a, Result<DbRow, sqlx::Error>> {
        match self {
            Self::Postgres(pool) => sqlx::query(sql)
                .persistent(false)
                .fetch(pool)
                .map_ok(DbRow::Postgres)
                .boxed(),
            Self::MySql(pool) => sqlx::query(sql)
                .persistent(false)
                .fetch(pool)
                .map_ok(DbRow::MySql)
                .boxed(),
            Self::Sqlite(pool) => sqlx::query(sql)
                .persistent(false)
                .fetch(pool)
                .map_ok(DbRow::Sqlite)
                .boxed(),
        }
    }

    async fn ping(&self) -> Result<(), sqlx::Error> {
        match self {
            Self::Postgres(pool) => pool.acquire().await?.ping().await,
            Self::MySql(pool) => pool.acquire().await?.ping().await,
            Self::Sqlite(pool) => pool.acquire().await?.ping().await,
        }
    }

    pub async fn close(&self) {
        match self {
            Self::Postgres(pool) => pool.close().await,
            Self::MySql(pool) => pool.close().await,
            Self::Sqlite(pool) => pool.close().await,
        }
    }
}

/// A statement prepared through a [`DbPool`], detached from the SQL text's
/// lifetime.
pub enum PreparedStatement {
    Postgres(PgStatement<'static>),
    MySql(MySqlStatement<'static>),
    Sqlite(SqliteStatement<'static>),
}

impl PreparedStatement {
    const fn driver(&self) -> Driver {
        match self {
            Self::Postgres(_) => Driver::Postgres,
            Self::MySql(_) => Driver::MySql,
            Self::Sqlite(_) => Driver::Sqlite,
        }
    }

    /// Names of the result columns, in result order.
    #[must_use]
    pub fn columns(&self) -> Vec<String> {
        match self {
            Self::Postgres(statement) => column_names(statement.columns()),
            Self::MySql(statement) => column_names(statement.columns()),
            Self::Sqlite(statement) => column_names(statement.columns()),
        }
    }

    /// Execute the statement on `pool`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ForeignStatement`] when `pool` is of another driver
    pub fn fetch<'a>(
        &'a self,
        pool: &'a DbPool,
    ) -> Result<BoxStream<'a, Result<DbRow, sqlx::Error>>, Error> {
        Ok(match (self, pool) {
            (Self::Postgres(statement), DbPool::Postgres(pool)) => statement
                .query()
                .fetch(pool)
                .map_ok(DbRow::Postgres)
                .boxed(),
            (Self::MySql(statement), DbPool::MySql(pool)) => {
                statement.query().fetch(pool).map_ok(DbRow::MySql).boxed()
            }
            (Self::Sqlite(statement), DbPool::Sqlite(pool)) => {
                statement.query().fetch(pool).map_ok(DbRow::Sqlite).boxed()
            }
            _ => return Err(Error::ForeignStatement(self.driver(), pool.driver())),
        })
    }
}

impl fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("driver", &self.driver())
            .field("columns", &self.columns())
            .finish_non_exhaustive()
    }
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// A live, pooled database handle. Clones share the pool and identity.
#[derive(Clone, Debug)]
pub struct DbHandle {
    id: u64,
    pool: DbPool,
}

impl DbHandle {
    /// Process-unique identity, used to pin prepared queries to one handle.
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub const fn driver(&self) -> Driver {
        self.pool.driver()
    }

    #[must_use]
    pub const fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Parse `dsn`, open a pooled handle with `limits` and return it, unless
/// `token` is cancelled first.
///
/// # Errors
///
/// Returns a descriptor error, the open error, or [`Error::Cancelled`]
pub async fn open_connection(
    token: &CancellationToken,
    log_context: &str,
    dsn: &SecretString,
    limits: PoolLimits,
) -> Result<DbHandle, Error> {
    let target = ConnectionTarget::parse(dsn.expose_secret())?;
    let driver = target.driver();

    let pool =
        run_cancellable(token, async move { DbPool::connect(&target, limits).await }).await??;

    debug!(log_context = %log_context, driver = %driver, "Database handle successfully opened");

    Ok(DbHandle {
        id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
        pool,
    })
}

/// Check out a connection and ping it, unless `token` is cancelled first.
///
/// # Errors
///
/// Returns the ping error or [`Error::Cancelled`]
pub async fn ping_db(token: &CancellationToken, handle: &DbHandle) -> Result<(), Error> {
    let pool = handle.pool.clone();
    run_cancellable(token, async move { pool.ping().await }).await??;
    Ok(())
}

/// Run `fut` on its own task and return its output, or [`Error::Cancelled`]
/// if `token` fires first. A losing task is drained in the background.
///
/// # Errors
///
/// Returns [`Error::Cancelled`] or [`Error::Task`] if the task panicked
pub async fn run_cancellable<F>(token: &CancellationToken, fut: F) -> Result<F::Output, Error>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let mut task = tokio::spawn(fut);

    tokio::select! {
        biased;
        () = token.cancelled() => {}
        result = &mut task => return Ok(result?),
    }

    tokio::spawn(async move {
        let _ = task.await;
    });
    Err(Error::Cancelled)
}

/// Expand `$NAME` and `${NAME}` references from the environment. Unknown
/// variables are kept as a literal `$NAME`.
#[must_use]
pub fn expand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(rest.get(..pos).unwrap_or_default());
        let after = rest.get(pos + 1..).unwrap_or_default();

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (braced.get(..end).unwrap_or_default(), end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (after.get(..end).unwrap_or_default(), end)
        };

        if name.is_empty() {
            out.push('$');
        } else {
            out.push_str(&lookup_env(name));
        }
        rest = after.get(consumed..).unwrap_or_default();
    }

    out.push_str(rest);
    out
}

fn lookup_env(name: &str) -> String {
    env::var(name).unwrap_or_else(|_| {
        warn!(env = %name, "Environment variable is not found, cannot expand");
        format!("${name}")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env() {
        temp_env::with_vars(
            [("SQLX_TEST_USER", Some("scott")), ("SQLX_TEST_UNSET", None)],
            || {
                assert_eq!(expand_env("pg://$SQLX_TEST_USER@h/db"), "pg://scott@h/db");
                assert_eq!(expand_env("pg://${SQLX_TEST_USER}@h/db"), "pg://scott@h/db");
                assert_eq!(expand_env("pg://$SQLX_TEST_UNSET@h"), "pg://$SQLX_TEST_UNSET@h");
                assert_eq!(expand_env("${SQLX_TEST_UNSET}/x"), "$SQLX_TEST_UNSET/x");
                assert_eq!(expand_env("cost: 5$"), "cost: 5$");
                assert_eq!(expand_env("no refs"), "no refs");
            },
        );
    }

    #[test]
    fn test_parse_driver_aliases() {
        let t = ConnectionTarget::parse("pg://u:p@localhost:5432/db").unwrap();
        assert_eq!(t.driver(), Driver::Postgres);
        assert_eq!(t.dsn.expose_secret(), "postgres://u:p@localhost:5432/db");

        let t = ConnectionTarget::parse("mariadb://u@localhost/db").unwrap();
        assert_eq!(t.driver(), Driver::MySql);
        assert_eq!(t.dsn.expose_secret(), "mysql://u@localhost/db");

        let t = ConnectionTarget::parse("sqlite::memory:").unwrap();
        assert_eq!(t.driver(), Driver::Sqlite);
        assert_eq!(t.dsn.expose_secret(), "sqlite::memory:");

        let t = ConnectionTarget::parse("file:/tmp/x.db").unwrap();
        assert_eq!(t.dsn.expose_secret(), "sqlite:/tmp/x.db");
    }

    #[test]
    fn test_parse_errors_do_not_leak_descriptor() {
        let err = ConnectionTarget::parse("not a url with hunter2").unwrap_err();
        assert!(matches!(err, Error::InvalidDescriptor(_)));
        assert!(!err.to_string().contains("hunter2"));

        let err = ConnectionTarget::parse("oracle://scott:hunter2@db/orcl").unwrap_err();
        assert!(matches!(err, Error::UnsupportedDriver(ref d) if d == "oracle"));
        assert!(!err.to_string().contains("hunter2"));
    }

    #[tokio::test]
    async fn test_run_cancellable_completes() {
        let token = CancellationToken::new();
        let value = run_cancellable(&token, async { 42 }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_run_cancellable_cancelled_drains_task() {
        let token = CancellationToken::new();
        let (done_tx, done_rx) = tokio::sync::oneshot::channel();

        let racing = token.clone();
        let result = tokio::join!(
            run_cancellable(&token, async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                let _ = done_tx.send(());
                7
            }),
            async move { racing.cancel() },
        )
        .0;

        assert!(matches!(result, Err(Error::Cancelled)));
        // The abandoned task still runs to completion.
        assert!(
            tokio::time::timeout(Duration::from_secs(2), done_rx)
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn test_open_connection_cancelled_before_open() {
        let token = CancellationToken::new();
        token.cancel();

        let dsn = SecretString::from("sqlite::memory:".to_string());
        let limits = PoolLimits {
            max_connections: 1,
            max_idle_connections: 1,
            max_lifetime: Duration::ZERO,
        };

        let result = open_connection(&token, "target=test", &dsn, limits).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_open_and_ping_sqlite() {
        let token = CancellationToken::new();
        let dsn = SecretString::from("sqlite::memory:".to_string());
        let limits = PoolLimits {
            max_connections: 2,
            max_idle_connections: 2,
            max_lifetime: Duration::from_secs(60),
        };

        let handle = open_connection(&token, "target=test", &dsn, limits).await.unwrap();
        assert_eq!(handle.driver(), Driver::Sqlite);
        assert!(ping_db(&token, &handle).await.is_ok());

        let other = open_connection(&token, "target=test", &dsn, limits).await.unwrap();
        assert_ne!(handle.id(), other.id());

        token.cancel();
        assert!(matches!(ping_db(&token, &handle).await, Err(Error::Cancelled)));
    }
}
