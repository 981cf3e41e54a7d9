//! The driver boundary.
//!
//! A driver owns one physical database handle and speaks whatever protocol
//! the database needs. Everything above it ([`Connection`](crate::Connection),
//! the executor, sessions) only sees SQL text, bound values and
//! [`DriverResult`]s.

use crate::Result;
use crate::value::Value;
use std::future::Future;

/// What one statement invocation produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DriverResult {
    /// Result column labels (empty for statements without a rowset)
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    /// Rows changed by a DML statement
    pub affected: u64,
    /// Key generated by the last successful insert, when the driver reports one
    pub last_insert_id: Option<i64>,
}

/// A database driver.
///
/// All operations are async; each call is one suspension point and never
/// yields mid-statement. Implementations must be `Send + Sync` so connections
/// can move between tasks, but a handle is only ever driven by one
/// [`Connection`](crate::Connection) at a time.
pub trait Driver: Send + Sync + Sized {
    /// Driver-specific configuration, usually parsed from a DSN.
    type Config: Send + Sync;

    /// Acquire a driver handle.
    ///
    /// Fails with [`Error::Connection`](crate::Error::Connection) when the
    /// database is unreachable.
    fn open(config: &Self::Config) -> impl Future<Output = Result<Self>> + Send;

    /// Run one statement with positional parameters.
    fn execute(
        &self,
        sql: &str,
        params: &[Value],
    ) -> impl Future<Output = Result<DriverResult>> + Send;

    fn begin(&self) -> impl Future<Output = Result<()>> + Send;

    fn commit(&self) -> impl Future<Output = Result<()>> + Send;

    fn rollback(&self) -> impl Future<Output = Result<()>> + Send;

    /// Release the handle. Further calls fail with a connection error.
    fn close(&self) -> impl Future<Output = Result<()>> + Send;

    /// Whether `INSERT ... RETURNING` may be used instead of a
    /// select-after-insert.
    fn native_returning(&self) -> bool {
        false
    }

    /// Whether statement text should be logged at `info` level.
    fn echo(&self) -> bool {
        false
    }
}
