//! SQLite implementation of the database traits.
//!
//! Each handle owns one `rusqlite` connection behind a mutex. Work runs on
//! tokio's blocking pool; if the caller's context ends first, the running
//! statement is interrupted and the context error is returned.
//!
//! In-memory databases are opened in shared-cache mode under a unique name,
//! so dedicated connections from [`SqliteDb::conn`](crate::Database::conn)
//! see the same data as the parent handle.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection as RawConnection, InterruptHandle, OpenFlags, ToSql};
use tracing::{debug, info, trace, warn};

use super::row::{ExecResult, Row, Rows};
use super::value::{Params, Value};
use super::{Connection, Database, Executor, Statement};
use crate::context::{Context, ContextError};
use crate::error::{Error, Result};

/// How long SQLite retries on a locked database file before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Invalid UTF-8 text is replaced, not rejected.
fn value_from_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Real(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Blob(b.to_vec()),
    }
}

fn named_refs(pairs: &[(String, Value)]) -> Vec<(&str, &dyn ToSql)> {
    pairs
        .iter()
        .map(|(name, value)| (name.as_str(), value as &dyn ToSql))
        .collect()
}

fn bind_query<'s>(
    stmt: &'s mut rusqlite::Statement<'_>,
    params: &Params,
) -> rusqlite::Result<rusqlite::Rows<'s>> {
    match params {
        Params::None => stmt.query([]),
        Params::Positional(values) => stmt.query(rusqlite::params_from_iter(values.iter())),
        Params::Named(pairs) => {
            let named = named_refs(pairs);
            stmt.query(named.as_slice())
        }
    }
}

fn bind_execute(stmt: &mut rusqlite::Statement<'_>, params: &Params) -> rusqlite::Result<usize> {
    match params {
        Params::None => stmt.execute([]),
        Params::Positional(values) => stmt.execute(rusqlite::params_from_iter(values.iter())),
        Params::Named(pairs) => {
            let named = named_refs(pairs);
            stmt.execute(named.as_slice())
        }
    }
}

fn read_row(row: &rusqlite::Row<'_>, columns: &Arc<[String]>) -> rusqlite::Result<Row> {
    let values = (0..columns.len())
        .map(|i| row.get_ref(i).map(value_from_ref))
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(Row::new(Arc::clone(columns), values))
}

fn column_names(stmt: &rusqlite::Statement<'_>) -> Arc<[String]> {
    stmt.column_names().into_iter().map(String::from).collect()
}

fn query_all(conn: &RawConnection, sql: &str, params: &Params) -> Result<Rows> {
    let mut stmt = conn.prepare_cached(sql)?;
    let columns = column_names(&stmt);
    let mut raw = bind_query(&mut stmt, params)?;

    let mut rows = Vec::new();
    while let Some(row) = raw.next()? {
        rows.push(read_row(row, &columns)?);
    }
    Ok(Rows::new(columns, rows))
}

fn query_first(conn: &RawConnection, sql: &str, params: &Params) -> Result<Row> {
    let mut stmt = conn.prepare_cached(sql)?;
    let columns = column_names(&stmt);
    let mut raw = bind_query(&mut stmt, params)?;

    match raw.next()? {
        Some(row) => Ok(read_row(row, &columns)?),
        None => Err(Error::NoRows),
    }
}

fn execute(conn: &RawConnection, sql: &str, params: &Params) -> Result<ExecResult> {
    let mut stmt = conn.prepare_cached(sql)?;
    let changed = bind_execute(&mut stmt, params)?;
    Ok(ExecResult {
        rows_affected: changed as u64,
        last_insert_id: conn.last_insert_rowid(),
    })
}

fn open_raw(target: &str) -> Result<RawConnection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = RawConnection::open_with_flags(target, flags)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// One SQLite connection shared by a handle and its prepared statements.
struct Handle {
    target: String,
    conn: Mutex<Option<RawConnection>>,
    interrupt: InterruptHandle,
    /// Id of the operation currently holding the connection. Cleared before
    /// the connection lock is released.
    active: Mutex<Option<u64>>,
    next_op: AtomicU64,
    closed: AtomicBool,
}

impl Handle {
    fn open(target: String) -> Result<Arc<Self>> {
        let conn = open_raw(&target)?;
        let interrupt = conn.get_interrupt_handle();
        Ok(Arc::new(Self {
            target,
            conn: Mutex::new(Some(conn)),
            interrupt,
            active: Mutex::new(None),
            next_op: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Run `op` against the connection on the blocking pool, bounded by `ctx`.
    async fn run<T, F>(self: &Arc<Self>, ctx: &Context, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&RawConnection) -> Result<T> + Send + 'static,
    {
        if let Some(err) = ctx.err() {
            return Err(Error::Context(err));
        }
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let op_id = self.next_op.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::clone(self);
        let task_ctx = ctx.clone();

        let task = tokio::task::spawn_blocking(move || {
            let guard = handle.conn.lock().unwrap_or_else(PoisonError::into_inner);
            let conn = guard.as_ref().ok_or(Error::Closed)?;
            // mark active first, so a context that ends from here on interrupts us
            handle.set_active(Some(op_id));
            let result = match task_ctx.err() {
                Some(err) => Err(Error::Context(err)),
                None => op(conn),
            };
            handle.set_active(None);
            drop(guard);
            result
        });

        tokio::select! {
            biased;
            joined = task => joined?,
            err = ctx.done() => {
                self.interrupt_if_active(op_id, err);
                Err(Error::Context(err))
            }
        }
    }

    fn set_active(&self, op_id: Option<u64>) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = op_id;
    }

    /// Interrupt the connection only while `op_id` owns it. Holding `active`
    /// keeps the owner from finishing and handing over in between.
    fn interrupt_if_active(&self, op_id: u64, err: ContextError) -> bool {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if *active != Some(op_id) {
            return false;
        }
        warn!("Interrupting SQLite statement on {}: {}", self.target, err);
        self.interrupt.interrupt();
        true
    }

    async fn query(self: &Arc<Self>, ctx: &Context, sql: &str, params: Params) -> Result<Rows> {
        trace!(sql, "query");
        let sql = sql.to_string();
        self.run(ctx, move |conn| query_all(conn, &sql, &params)).await
    }

    async fn query_row(self: &Arc<Self>, ctx: &Context, sql: &str, params: Params) -> Result<Row> {
        trace!(sql, "query_row");
        let sql = sql.to_string();
        self.run(ctx, move |conn| query_first(conn, &sql, &params)).await
    }

    async fn exec(
        self: &Arc<Self>,
        ctx: &Context,
        sql: &str,
        params: Params,
    ) -> Result<ExecResult> {
        trace!(sql, "exec");
        let sql = sql.to_string();
        self.run(ctx, move |conn| execute(conn, &sql, &params)).await
    }

    async fn prepare(self: &Arc<Self>, ctx: &Context, sql: &str) -> Result<SqliteStatement> {
        trace!(sql, "prepare");
        let sql: Arc<str> = Arc::from(sql);
        let check = Arc::clone(&sql);
        self.run(ctx, move |conn| {
            conn.prepare_cached(&check)?;
            Ok(())
        })
        .await?;
        Ok(SqliteStatement {
            handle: Arc::clone(self),
            sql,
            closed: AtomicBool::new(false),
        })
    }

    async fn ping(self: &Arc<Self>, ctx: &Context) -> Result<()> {
        self.run(ctx, |conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
        .await
    }

    async fn close(self: &Arc<Self>) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let handle = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            let conn = handle
                .conn
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            match conn {
                Some(conn) => conn.close().map_err(|(_, e)| Error::Sqlite(e)),
                None => Ok(()),
            }
        })
        .await??;

        debug!("Closed SQLite connection to {}", self.target);
        Ok(())
    }
}

/// SQLite database handle.
///
/// Cloning yields another handle to the same connection.
#[derive(Clone)]
pub struct SqliteDb {
    handle: Arc<Handle>,
}

impl SqliteDb {
    /// Open (or create) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_target(path.as_ref().display().to_string())
    }

    /// Open a fresh in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::open_shared_memory(&uuid::Uuid::new_v4().to_string())
    }

    /// Open a named in-memory database. Handles opened with the same name
    /// in this process share data while at least one of them is open.
    pub fn open_shared_memory(name: &str) -> Result<Self> {
        Self::open_target(format!("file:{}?mode=memory&cache=shared", name))
    }

    fn open_target(target: String) -> Result<Self> {
        let handle = Handle::open(target)?;
        info!("Opened SQLite database {}", handle.target);
        Ok(Self { handle })
    }

    /// Path or URI the database was opened with.
    pub fn target(&self) -> &str {
        &self.handle.target
    }

    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

impl fmt::Debug for SqliteDb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteDb")
            .field("target", &self.handle.target)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Executor for SqliteDb {
    type Statement = SqliteStatement;

    async fn query(&self, ctx: &Context, sql: &str, params: Params) -> Result<Rows> {
        self.handle.query(ctx, sql, params).await
    }

    async fn query_row(&self, ctx: &Context, sql: &str, params: Params) -> Result<Row> {
        self.handle.query_row(ctx, sql, params).await
    }

    async fn exec(&self, ctx: &Context, sql: &str, params: Params) -> Result<ExecResult> {
        self.handle.exec(ctx, sql, params).await
    }

    async fn prepare(&self, ctx: &Context, sql: &str) -> Result<SqliteStatement> {
        self.handle.prepare(ctx, sql).await
    }
}

#[async_trait]
impl Connection for SqliteDb {
    async fn close(&self) -> Result<()> {
        self.handle.close().await
    }
}

#[async_trait]
impl Database for SqliteDb {
    type Conn = SqliteConn;

    async fn ping(&self, ctx: &Context) -> Result<()> {
        self.handle.ping(ctx).await
    }

    async fn conn(&self, ctx: &Context) -> Result<SqliteConn> {
        if let Some(err) = ctx.err() {
            return Err(Error::Context(err));
        }
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let target = self.handle.target.clone();
        let handle = tokio::task::spawn_blocking(move || Handle::open(target)).await??;
        debug!("Opened dedicated connection to {}", handle.target);
        Ok(SqliteConn { handle })
    }
}

/// Dedicated SQLite connection obtained from [`SqliteDb`].
///
/// Independent of its parent: closing one does not close the other.
pub struct SqliteConn {
    handle: Arc<Handle>,
}

impl SqliteConn {
    pub fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

impl fmt::Debug for SqliteConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteConn")
            .field("target", &self.handle.target)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl Executor for SqliteConn {
    type Statement = SqliteStatement;

    async fn query(&self, ctx: &Context, sql: &str, params: Params) -> Result<Rows> {
        self.handle.query(ctx, sql, params).await
    }

    async fn query_row(&self, ctx: &Context, sql: &str, params: Params) -> Result<Row> {
        self.handle.query_row(ctx, sql, params).await
    }

    async fn exec(&self, ctx: &Context, sql: &str, params: Params) -> Result<ExecResult> {
        self.handle.exec(ctx, sql, params).await
    }

    async fn prepare(&self, ctx: &Context, sql: &str) -> Result<SqliteStatement> {
        self.handle.prepare(ctx, sql).await
    }
}

#[async_trait]
impl Connection for SqliteConn {
    async fn close(&self) -> Result<()> {
        self.handle.close().await
    }
}

/// Statement prepared on a [`SqliteDb`] or [`SqliteConn`].
///
/// Executions go through the connection's statement cache and fail with
/// `Error::Closed` once the connection is closed.
pub struct SqliteStatement {
    handle: Arc<Handle>,
    sql: Arc<str>,
    closed: AtomicBool,
}

impl SqliteStatement {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::StatementClosed);
        }
        Ok(())
    }
}

impl fmt::Debug for SqliteStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteStatement")
            .field("sql", &self.sql)
            .finish()
    }
}

#[async_trait]
impl Statement for SqliteStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    async fn query(&self, ctx: &Context, params: Params) -> Result<Rows> {
        self.check_open()?;
        let sql = Arc::clone(&self.sql);
        self.handle
            .run(ctx, move |conn| query_all(conn, &sql, &params))
            .await
    }

    async fn query_row(&self, ctx: &Context, params: Params) -> Result<Row> {
        self.check_open()?;
        let sql = Arc::clone(&self.sql);
        self.handle
            .run(ctx, move |conn| query_first(conn, &sql, &params))
            .await
    }

    async fn exec(&self, ctx: &Context, params: Params) -> Result<ExecResult> {
        self.check_open()?;
        let sql = Arc::clone(&self.sql);
        self.handle
            .run(ctx, move |conn| execute(conn, &sql, &params))
            .await
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
