//! Rate-limited database facade.
//!
//! [`RateLimitedDb`] wraps any [`Database`] and makes `query`, `query_row`,
//! `exec` and `prepare` take one token from a shared [`RateLimiter`] before
//! reaching the database. `close` is never gated; `ping` and `conn` are
//! gated only when the [`GatePolicy`] asks for it. [`RateLimitedDb::raw`]
//! hands out the underlying database for work that must not be throttled.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::config::{GatePolicy, RateLimitConfig};
use crate::context::Context;
use crate::db::{Connection, Database, ExecResult, Executor, Params, Row, Rows};
use crate::error::{Error, Result};
use crate::rate_limit::{Limit, RateLimiter};

/// A database whose query operations are admitted by a token bucket.
///
/// Cheap to clone; clones share the database and the limiter.
pub struct RateLimitedDb<D> {
    db: Arc<D>,
    limiter: Arc<RateLimiter>,
    policy: GatePolicy,
}

impl<D> Clone for RateLimitedDb<D> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            limiter: Arc::clone(&self.limiter),
            policy: self.policy,
        }
    }
}

impl<D> fmt::Debug for RateLimitedDb<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitedDb")
            .field("limit", &self.limiter.limit())
            .field("burst", &self.limiter.burst())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<D: Database> RateLimitedDb<D> {
    /// Wrap `db` with a limiter allowing `limit` operations per second and
    /// bursts of up to `burst`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidBurst` if `burst` is zero.
    pub fn wrap(db: impl Into<Arc<D>>, limit: Limit, burst: u32) -> Result<Self> {
        let limiter = RateLimiter::new(limit, burst)?;
        debug!("Rate limiting database at {} (burst {})", limit, burst);
        Ok(Self::with_limiter(db, Arc::new(limiter)))
    }

    /// Wrap `db` as described by `config`, including its gate policy.
    pub fn from_config(db: impl Into<Arc<D>>, config: &RateLimitConfig) -> Result<Self> {
        let limiter = config.build_limiter()?;
        Ok(Self::with_limiter(db, Arc::new(limiter)).with_policy(config.gate))
    }

    /// Wrap `db` with an existing limiter. Facades sharing a limiter share
    /// one budget.
    pub fn with_limiter(db: impl Into<Arc<D>>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            db: db.into(),
            limiter,
            policy: GatePolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: GatePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The wrapped database. Calls made through it bypass the limiter.
    pub fn raw(&self) -> Arc<D> {
        Arc::clone(&self.db)
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn policy(&self) -> GatePolicy {
        self.policy
    }

    async fn admit(&self, ctx: &Context, op: &str) -> Result<()> {
        self.limiter.wait(ctx).await.map_err(|err| {
            debug!("Rate limit admission denied for {}: {}", op, err);
            Error::Admission(err)
        })
    }
}

#[async_trait]
impl<D: Database> Executor for RateLimitedDb<D> {
    type Statement = D::Statement;

    async fn query(&self, ctx: &Context, sql: &str, params: Params) -> Result<Rows> {
        self.admit(ctx, "query").await?;
        self.db.query(ctx, sql, params).await
    }

    async fn query_row(&self, ctx: &Context, sql: &str, params: Params) -> Result<Row> {
        self.admit(ctx, "query_row").await?;
        self.db.query_row(ctx, sql, params).await
    }

    async fn exec(&self, ctx: &Context, sql: &str, params: Params) -> Result<ExecResult> {
        self.admit(ctx, "exec").await?;
        self.db.exec(ctx, sql, params).await
    }

    async fn prepare(&self, ctx: &Context, sql: &str) -> Result<D::Statement> {
        self.admit(ctx, "prepare").await?;
        self.db.prepare(ctx, sql).await
    }
}

#[async_trait]
impl<D: Database> Connection for RateLimitedDb<D> {
    async fn close(&self) -> Result<()> {
        self.db.close().await
    }
}

#[async_trait]
impl<D: Database> Database for RateLimitedDb<D> {
    type Conn = D::Conn;

    async fn ping(&self, ctx: &Context) -> Result<()> {
        if self.policy.ping {
            self.admit(ctx, "ping").await?;
        }
        self.db.ping(ctx).await
    }

    async fn conn(&self, ctx: &Context) -> Result<D::Conn> {
        if self.policy.conn {
            self.admit(ctx, "conn").await?;
        }
        self.db.conn(ctx).await
    }
}
