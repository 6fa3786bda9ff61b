//! Database collaborator interface.
//!
//! The rate-limited facade works with any type implementing [`Database`].
//! The traits are split by capability:
//! - [`Executor`]: anything that runs SQL (databases, dedicated connections)
//! - [`Connection`]: an executor that can be closed
//! - [`Database`]: a connection that can also be pinged and hand out
//!   dedicated sub-connections
//! - [`Statement`]: a prepared statement
//!
//! All operations take a [`Context`] and are safe to call concurrently.

mod row;
pub mod sqlite;
mod value;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::Result;

pub use row::{ColumnIndex, ExecResult, Row, Rows};
pub use sqlite::{SqliteConn, SqliteDb, SqliteStatement};
pub use value::{IntoValue, Params, Value};

/// Runs SQL.
#[async_trait]
pub trait Executor: Send + Sync {
    type Statement: Statement;

    /// Run a query and return all of its rows.
    async fn query(&self, ctx: &Context, sql: &str, params: Params) -> Result<Rows>;

    /// Run a query and return its first row, or `Error::NoRows`.
    async fn query_row(&self, ctx: &Context, sql: &str, params: Params) -> Result<Row>;

    /// Run a statement that does not return rows.
    async fn exec(&self, ctx: &Context, sql: &str, params: Params) -> Result<ExecResult>;

    /// Prepare a statement for repeated execution.
    async fn prepare(&self, ctx: &Context, sql: &str) -> Result<Self::Statement>;
}

/// An executor with an explicit end of life.
#[async_trait]
pub trait Connection: Executor {
    /// Release the underlying resources. Closing twice is not an error.
    async fn close(&self) -> Result<()>;
}

/// A database handle.
#[async_trait]
pub trait Database: Connection {
    /// Dedicated connection type handed out by [`Database::conn`].
    type Conn: Connection + 'static;

    /// Verify the database is reachable.
    async fn ping(&self, ctx: &Context) -> Result<()>;

    /// Obtain a dedicated connection, e.g. for a transaction.
    async fn conn(&self, ctx: &Context) -> Result<Self::Conn>;
}

/// A prepared statement.
#[async_trait]
pub trait Statement: Send + Sync {
    fn sql(&self) -> &str;

    async fn query(&self, ctx: &Context, params: Params) -> Result<Rows>;

    async fn query_row(&self, ctx: &Context, params: Params) -> Result<Row>;

    async fn exec(&self, ctx: &Context, params: Params) -> Result<ExecResult>;

    async fn close(&self) -> Result<()>;
}
