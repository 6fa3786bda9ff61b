//! Rate-limited database access.
//!
//! Wraps a database handle so that `query`, `query_row`, `exec` and
//! `prepare` each take one token from a shared token bucket before they run.
//! Callers wait for a token in first-come order; a caller whose [`Context`]
//! is cancelled or runs out of time is turned away without touching the
//! database.
//!
//! ```no_run
//! use ratelimited_db::{params, Context, Executor, Limit, RateLimitedDb, SqliteDb};
//!
//! # async fn run() -> ratelimited_db::Result<()> {
//! let db = RateLimitedDb::wrap(SqliteDb::open("app.db")?, Limit::per_second(10.0)?, 5)?;
//! let ctx = Context::background();
//!
//! db.exec(&ctx, "CREATE TABLE IF NOT EXISTS kv (k TEXT, v TEXT)", params![]).await?;
//! let rows = db.query(&ctx, "SELECT k, v FROM kv", params![]).await?;
//! println!("{} rows", rows.len());
//!
//! // maintenance work that should not be throttled
//! db.raw().exec(&ctx, "VACUUM", params![]).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod rate_limit;
pub mod throttled;

pub use config::{GatePolicy, RateLimitConfig, RateValue};
pub use context::{Context, ContextError};
pub use db::{
    ColumnIndex, Connection, Database, ExecResult, Executor, IntoValue, Params, Row, Rows,
    SqliteConn, SqliteDb, SqliteStatement, Statement, Value,
};
pub use error::{Error, Result};
pub use rate_limit::{Limit, RateLimiter, Reservation};
pub use throttled::RateLimitedDb;
