use super::{
    Metric, MetricSender,
    columns::{ColumnRole, ColumnRoles},
    connection::{DbHandle, PreparedStatement, run_cancellable},
    metric_family::MetricFamily,
    pipeline::{apply_transformations, should_include_row},
    row::{DbRow, Row, scan_column},
};
use crate::{
    config::QueryConfig,
    errors::{ContextError, Error, trim_missing_context},
};
use futures::{TryStreamExt, stream::BoxStream};
use std::{collections::HashSet, time::Instant};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn};
use tracing_futures::Instrument as _;

/// A configured SQL query and the metric families fed from its rows.
///
/// In prepared mode the statement is prepared on first execution and the
/// query is pinned to that handle for the rest of its life.
#[derive(Debug)]
pub struct Query {
    config: QueryConfig,
    families: Vec<MetricFamily>,
    roles: ColumnRoles,
    log_context: String,
    ignore_missing_values: bool,
    prepared: OnceCell<Prepared>,
}

#[derive(Debug)]
struct Prepared {
    handle_id: u64,
    columns: Vec<String>,
    statement: PreparedStatement,
}

/// Rows of one execution, plus the result-set shape once known.
pub struct RowCursor<'a> {
    token: CancellationToken,
    columns: Option<Vec<String>>,
    first: Option<DbRow>,
    stream: BoxStream<'a, Result<DbRow, sqlx::Error>>,
}

impl RowCursor<'_> {
    /// Column names of the result set, `None` when it is unknown because no
    /// row was returned.
    ///
    /// # Errors
    ///
    /// Returns the driver error or [`Error::Cancelled`]
    pub async fn columns(&mut self) -> Result<Option<&[String]>, Error> {
        if self.columns.is_none() {
            let Some(row) = self.fetch().await? else {
                return Ok(None);
            };
            self.columns = Some(row.columns());
            self.first = Some(row);
        }
        Ok(self.columns.as_deref())
    }

    /// Next row in cursor order.
    ///
    /// # Errors
    ///
    /// Returns the driver error or [`Error::Cancelled`]
    pub async fn next_row(&mut self) -> Result<Option<DbRow>, Error> {
        match self.first.take() {
            Some(row) => Ok(Some(row)),
            None => self.fetch().await,
        }
    }

    async fn fetch(&mut self) -> Result<Option<DbRow>, Error> {
        tokio::select! {
            biased;
            () = self.token.cancelled() => Err(Error::Cancelled),
            row = self.stream.try_next() => Ok(row?),
        }
    }
}

impl Query {
    /// Build a query for `families`, classifying the columns they need.
    ///
    /// # Errors
    ///
    /// Returns a role conflict if two families disagree on a column's role
    pub fn new(
        log_context: &str,
        config: QueryConfig,
        families: Vec<MetricFamily>,
        ignore_missing_values: bool,
    ) -> Result<Self, ContextError> {
        let log_context = trim_missing_context(&format!("{log_context},query={}", config.name));
        let roles = ColumnRoles::build(&log_context, families.iter().map(MetricFamily::config))?;

        debug!(log_context = %log_context, columns = ?roles.names(), "Expected columns from SQL");

        Ok(Self {
            config,
            families,
            roles,
            log_context,
            ignore_missing_values,
            prepared: OnceCell::new(),
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub const fn roles(&self) -> &ColumnRoles {
        &self.roles
    }

    #[must_use]
    pub fn families(&self) -> &[MetricFamily] {
        &self.families
    }

    /// Run the query on `handle` and push the resulting samples to `tx`.
    ///
    /// Failures before the first row is processed emit a single invalid
    /// metric; a row that cannot be scanned is reported and skipped. An empty
    /// result is still checked for missing columns.
    pub async fn collect(&self, token: &CancellationToken, handle: &DbHandle, tx: &MetricSender) {
        let started = Instant::now();

        if token.is_cancelled() {
            self.invalid(tx, Error::Cancelled);
            return;
        }

        let mut cursor = match self.run(token, handle).await {
            Ok(cursor) => cursor,
            Err(e) => {
                let _ = tx.send(Metric::Invalid(e));
                return;
            }
        };

        let columns = match cursor.columns().await {
            Ok(columns) => columns.map(<[String]>::to_vec),
            Err(e) => {
                self.invalid(tx, e);
                return;
            }
        };

        let Some(columns) = columns else {
            debug!(log_context = %self.log_context, "Query returned no rows");
            drop(cursor);
            match self.describe(token, handle).await {
                Ok(columns) => {
                    if let Err(e) = self.scan_dest(&columns) {
                        self.missing_values(tx, e);
                    }
                }
                Err(e) => {
                    let _ = tx.send(Metric::Invalid(e));
                }
            }
            return;
        };

        let dest = match self.scan_dest(&columns) {
            Ok(dest) => dest,
            Err(e) => {
                self.missing_values(tx, e);
                return;
            }
        };

        let mut rows_processed = 0_usize;
        let mut rows_filtered = 0_usize;
        let mut metrics_generated = 0_usize;

        loop {
            let raw = match cursor.next_row().await {
                Ok(Some(raw)) => raw,
                Ok(None) => break,
                Err(e) => {
                    self.invalid(tx, e);
                    break;
                }
            };
            rows_processed += 1;

            let row = match self.scan_row(&raw, &columns, &dest) {
                Ok(row) => row,
                Err(e) => {
                    let _ = tx.send(Metric::Invalid(e));
                    continue;
                }
            };

            for family in &self.families {
                if !should_include_row(&row, family.config()) {
                    rows_filtered += 1;
                    continue;
                }

                let transformed = apply_transformations(&row, family.config());
                family.collect(&transformed, tx);
                metrics_generated += 1;
            }
        }

        debug!(
            log_context = %self.log_context,
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            rows_processed,
            rows_filtered,
            metrics_generated,
            "Query collection completed"
        );
    }

    async fn run<'a>(
        &'a self,
        token: &CancellationToken,
        handle: &'a DbHandle,
    ) -> Result<RowCursor<'a>, ContextError> {
        let started = Instant::now();
        self.check_handle(handle);

        let span = info_span!(
            "db.query",
            otel.kind = "client",
            db.system = %handle.driver(),
            db.statement = %self.config.query,
            query = %self.config.name,
        );

        let (columns, stream) = if self.config.no_prepared_statement {
            (None, handle.pool().fetch_unprepared(&self.config.query))
        } else {
            let prepared = self
                .prepared
                .get_or_try_init(|| async {
                    let statement = handle
                        .pool()
                        .prepare(&self.config.query)
                        .instrument(span)
                        .await
                        .map_err(|e| self.context(Error::Prepare(e)))?;
                    Ok::<_, ContextError>(Prepared {
                        handle_id: handle.id(),
                        columns: statement.columns(),
                        statement,
                    })
                })
                .await?;
            self.check_handle(handle);

            let stream = prepared
                .statement
                .fetch(handle.pool())
                .map_err(|e| self.context(e))?;
            (Some(prepared.columns.clone()), stream)
        };

        debug!(
            log_context = %self.log_context,
            duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "Query execution time"
        );

        Ok(RowCursor {
            token: token.clone(),
            columns,
            first: None,
            stream,
        })
    }

    /// Result columns of the query, learned by preparing it without executing.
    async fn describe(
        &self,
        token: &CancellationToken,
        handle: &DbHandle,
    ) -> Result<Vec<String>, ContextError> {
        let pool = handle.pool().clone();
        let sql = self.config.query.clone();

        run_cancellable(token, async move { pool.prepare(&sql).await })
            .await
            .map_err(|e| self.context(e))?
            .map(|statement| PreparedStatement::columns(&statement))
            .map_err(|e| self.context(Error::Prepare(e)))
    }

    /// A prepared statement belongs to the handle it was prepared on; running
    /// it anywhere else means the caller's scheduling is broken.
    #[allow(clippy::panic)]
    fn check_handle(&self, handle: &DbHandle) {
        if let Some(prepared) = self.prepared.get()
            && prepared.handle_id != handle.id()
        {
            panic!(
                "[{}] Expecting to always run on the same database handle",
                self.log_context
            );
        }
    }

    /// One slot per returned column: the role to scan it as, or `None` to
    /// discard it.
    fn scan_dest(&self, columns: &[String]) -> Result<Vec<Option<ColumnRole>>, ContextError> {
        debug!(log_context = %self.log_context, columns = ?columns, "Returned columns");

        let mut have = HashSet::with_capacity(self.roles.len());
        let dest = columns
            .iter()
            .enumerate()
            .map(|(i, column)| {
                let role = self.roles.get(column);
                match role {
                    Some(_) => {
                        have.insert(column.as_str());
                    }
                    None if column.is_empty() => {
                        debug!(log_context = %self.log_context, column = i, "Unnamed column");
                    }
                    None => {
                        debug!(log_context = %self.log_context, column = %column, "Extra column returned by query");
                    }
                }
                role
            })
            .collect();

        if have.len() != self.roles.len() {
            let missing = self
                .roles
                .names()
                .into_iter()
                .filter(|c| !have.contains(c))
                .map(ToString::to_string)
                .collect();
            return Err(self.context(Error::MissingColumns(missing)));
        }

        Ok(dest)
    }

    fn scan_row(
        &self,
        raw: &DbRow,
        columns: &[String],
        dest: &[Option<ColumnRole>],
    ) -> Result<Row, ContextError> {
        let mut row = Row::with_capacity(self.roles.len());

        for (index, (column, role)) in columns.iter().zip(dest).enumerate() {
            let Some(role) = *role else {
                continue;
            };

            let value = scan_column(raw, index, column, role)
                .map_err(|e| self.context(e))?;

            if !value.is_valid() {
                debug!(log_context = %self.log_context, column = %column, role = %role, "Column is NULL");
            }
            row.insert(column.clone(), value);
        }

        Ok(row)
    }

    fn missing_values(&self, tx: &MetricSender, e: ContextError) {
        if self.ignore_missing_values {
            warn!(log_context = %self.log_context, error = %e, "Ignoring missing values");
        } else {
            let _ = tx.send(Metric::Invalid(e));
        }
    }

    fn context(&self, error: Error) -> ContextError {
        ContextError::new(self.log_context.as_str(), error)
    }

    fn invalid(&self, tx: &MetricSender, error: Error) {
        let _ = tx.send(Metric::Invalid(self.context(error)));
    }
}
