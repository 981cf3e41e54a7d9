//! Connection: one driver handle plus explicit transaction state.
//!
//! A connection is driven through `&mut self`, so at most one statement or
//! transaction call is in flight at a time. Concurrent units of work each
//! open their own connection.
//!
//! # Transaction states
//!
//! | state | `begin` | `commit` | `rollback` | `execute` |
//! |-------|---------|----------|------------|-----------|
//! | idle | ok | `StateError` | `StateError` | `StateError` |
//! | active | `StateError` | ok | ok | ok |
//! | rollback-only | `StateError` | rolls back, `StateError` | ok | `StateError` |
//!
//! A statement failing with a syntax or constraint error moves an active
//! transaction to rollback-only.
//!
//! # Cancellation
//!
//! If a future driving a driver call is dropped before it completes, the
//! connection is invalidated: every later call except [`Connection::close`]
//! fails with [`ConnectionErrorKind::Invalidated`]. `close` still rolls back
//! and releases the handle.

use crate::driver::{Driver, DriverResult};
use crate::error::{ConnectionErrorKind, Error, Result, StateErrorKind};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxState {
    Idle,
    Active,
    RollbackOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Health {
    Usable,
    Invalidated,
}

/// Marks the connection invalidated unless disarmed after the driver call
/// completes.
struct InFlight<'a> {
    health: &'a mut Health,
    armed: bool,
}

impl<'a> InFlight<'a> {
    fn new(health: &'a mut Health) -> Self {
        Self {
            health,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!("driver call cancelled mid-flight; connection invalidated");
            *self.health = Health::Invalidated;
        }
    }
}

/// A connection to a database through driver `D`.
pub struct Connection<D: Driver> {
    driver: Option<D>,
    state: TxState,
    health: Health,
    statements: u64,
}

impl<D: Driver> Connection<D> {
    /// Open a driver handle.
    #[tracing::instrument(level = "debug", skip(config))]
    pub async fn open(config: &D::Config) -> Result<Self> {
        let driver = D::open(config).await?;
        tracing::debug!("connection opened");
        Ok(Self::from_driver(driver))
    }

    /// Wrap an already open driver handle.
    pub fn from_driver(driver: D) -> Self {
        Self {
            driver: Some(driver),
            state: TxState::Idle,
            health: Health::Usable,
            statements: 0,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.state != TxState::Idle
    }

    pub fn is_rollback_only(&self) -> bool {
        self.state == TxState::RollbackOnly
    }

    pub fn is_closed(&self) -> bool {
        self.driver.is_none()
    }

    pub fn is_invalidated(&self) -> bool {
        self.health == Health::Invalidated
    }

    /// Number of statement invocations sent to the driver so far.
    ///
    /// Transaction control (`BEGIN`/`COMMIT`/`ROLLBACK`) is not counted.
    pub fn statement_count(&self) -> u64 {
        self.statements
    }

    /// The underlying driver, if the connection is still open.
    pub fn driver(&self) -> Option<&D> {
        self.driver.as_ref()
    }

    fn usable_driver(&self) -> Result<&D> {
        if self.health == Health::Invalidated {
            return Err(Error::connection(
                ConnectionErrorKind::Invalidated,
                "connection was invalidated by a cancelled statement; reopen it",
            ));
        }
        self.driver
            .as_ref()
            .ok_or_else(|| Error::connection(ConnectionErrorKind::Closed, "connection is closed"))
    }

    /// Start a transaction.
    pub async fn begin(&mut self) -> Result<()> {
        self.usable_driver()?;
        if self.state != TxState::Idle {
            return Err(Error::state(
                StateErrorKind::TransactionActive,
                "a transaction is already active",
            ));
        }
        let Some(driver) = self.driver.as_ref() else {
            return Err(Error::connection(ConnectionErrorKind::Closed, "connection is closed"));
        };
        let guard = InFlight::new(&mut self.health);
        let result = driver.begin().await;
        guard.disarm();
        result?;
        self.state = TxState::Active;
        tracing::debug!("BEGIN");
        Ok(())
    }

    /// Commit the active transaction.
    ///
    /// The transaction always ends. If the commit fails, a rollback is
    /// attempted; its failure is attached to the commit error.
    pub async fn commit(&mut self) -> Result<()> {
        self.usable_driver()?;
        match self.state {
            TxState::Idle => Err(Error::state(
                StateErrorKind::NoTransaction,
                "commit() called with no active transaction",
            )),
            TxState::RollbackOnly => {
                let rejected = Error::state(
                    StateErrorKind::RollbackOnly,
                    "transaction is rollback-only after a failed statement; it was rolled back",
                );
                match self.driver_rollback().await {
                    Ok(()) => Err(rejected),
                    Err(e) => Err(rejected.with_secondary(e)),
                }
            }
            TxState::Active => {
                let Some(driver) = self.driver.as_ref() else {
                    return Err(Error::connection(ConnectionErrorKind::Closed, "connection is closed"));
                };
                let guard = InFlight::new(&mut self.health);
                let result = driver.commit().await;
                guard.disarm();
                match result {
                    Ok(()) => {
                        self.state = TxState::Idle;
                        tracing::debug!("COMMIT");
                        Ok(())
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "commit failed; rolling back");
                        match self.driver_rollback().await {
                            Ok(()) => Err(err),
                            Err(secondary) => Err(err.with_secondary(secondary)),
                        }
                    }
                }
            }
        }
    }

    /// Roll back the active transaction.
    pub async fn rollback(&mut self) -> Result<()> {
        self.usable_driver()?;
        if self.state == TxState::Idle {
            return Err(Error::state(
                StateErrorKind::NoTransaction,
                "rollback() called with no active transaction",
            ));
        }
        self.driver_rollback().await
    }

    /// Issue ROLLBACK and end the transaction whatever the driver says.
    async fn driver_rollback(&mut self) -> Result<()> {
        self.state = TxState::Idle;
        let Some(driver) = self.driver.as_ref() else {
            return Ok(());
        };
        let guard = InFlight::new(&mut self.health);
        let result = driver.rollback().await;
        guard.disarm();
        if let Err(e) = &result {
            tracing::warn!(error = %e, "rollback failed");
        } else {
            tracing::debug!("ROLLBACK");
        }
        result
    }

    /// Close the connection, rolling back an active transaction first.
    ///
    /// Idempotent: closing a closed connection does nothing. The handle is
    /// released even when the rollback fails; that failure is returned.
    pub async fn close(&mut self) -> Result<()> {
        let Some(driver) = self.driver.take() else {
            return Ok(());
        };
        let mut first_error = None;
        if self.state != TxState::Idle {
            tracing::info!("closing connection with an active transaction; rolling back");
            if let Err(e) = driver.rollback().await {
                tracing::warn!(error = %e, "rollback during close failed");
                first_error = Some(e);
            }
            self.state = TxState::Idle;
        }
        if let Err(e) = driver.close().await {
            first_error.get_or_insert(e);
        }
        drop(driver);
        tracing::debug!("connection closed");
        first_error.map_or(Ok(()), Err)
    }

    /// Run `f` inside a transaction: commit on `Ok`, roll back on `Err`.
    pub async fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: AsyncFnOnce(&mut Self) -> Result<T>,
    {
        self.begin().await?;
        match f(self).await {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if self.in_transaction() {
                    if let Err(secondary) = self.driver_rollback().await {
                        return Err(err.with_secondary(secondary));
                    }
                }
                Err(err)
            }
        }
    }

    /// Send one statement to the driver. Transaction rules are checked by
    /// the executor.
    pub(crate) async fn run(&mut self, sql: &str, params: &[Value]) -> Result<DriverResult> {
        let Some(driver) = self.driver.as_ref() else {
            return Err(Error::connection(ConnectionErrorKind::Closed, "connection is closed"));
        };
        if driver.echo() {
            tracing::info!(sql, params = params.len(), "execute");
        } else {
            tracing::trace!(sql, params = params.len(), "execute");
        }
        self.statements += 1;
        let guard = InFlight::new(&mut self.health);
        let result = driver.execute(sql, params).await;
        guard.disarm();
        result
    }

    pub(crate) fn ensure_executable(&self) -> Result<()> {
        self.usable_driver()?;
        match self.state {
            TxState::Idle => Err(Error::state(
                StateErrorKind::NoTransaction,
                "statement issued outside transaction scope",
            )),
            TxState::RollbackOnly => Err(Error::state(
                StateErrorKind::RollbackOnly,
                "transaction is rollback-only after a failed statement; roll back first",
            )),
            TxState::Active => Ok(()),
        }
    }

    pub(crate) fn mark_rollback_only(&mut self) {
        if self.state == TxState::Active {
            tracing::debug!("transaction marked rollback-only");
            self.state = TxState::RollbackOnly;
        }
    }
}

impl<D: Driver> Drop for Connection<D> {
    fn drop(&mut self) {
        if self.driver.is_some() && self.state != TxState::Idle {
            tracing::warn!("connection dropped inside a transaction; the driver discards it");
        }
    }
}

impl<D: Driver> std::fmt::Debug for Connection<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("open", &self.driver.is_some())
            .field("state", &self.state)
            .field("health", &self.health)
            .field("statements", &self.statements)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockDriver, MockFailure};
    use std::future::Future;
    use std::pin::pin;
    use std::task::{Context, Poll, Waker};

    fn conn() -> (Connection<MockDriver>, MockDriver) {
        let driver = MockDriver::new();
        (Connection::from_driver(driver.clone()), driver)
    }

    #[tokio::test]
    async fn commit_without_transaction_is_state_error() {
        let (mut conn, _) = conn();
        let err = conn.commit().await.unwrap_err();
        assert_eq!(err.state_kind(), Some(StateErrorKind::NoTransaction));
        let err = conn.rollback().await.unwrap_err();
        assert_eq!(err.state_kind(), Some(StateErrorKind::NoTransaction));
    }

    #[tokio::test]
    async fn begin_twice_is_state_error() {
        let (mut conn, _) = conn();
        conn.begin().await.unwrap();
        let err = conn.begin().await.unwrap_err();
        assert_eq!(err.state_kind(), Some(StateErrorKind::TransactionActive));
        assert!(conn.in_transaction());
    }

    #[tokio::test]
    async fn failed_commit_rolls_back_and_attaches_secondary() {
        let (mut conn, driver) = conn();
        conn.begin().await.unwrap();
        driver.fail_next(MockFailure::Commit);
        driver.fail_next(MockFailure::Rollback);
        let err = conn.commit().await.unwrap_err();
        assert!(err.is_connection());
        assert!(err.secondary().is_some());
        assert!(!conn.in_transaction());
        assert_eq!(driver.log(), ["BEGIN", "COMMIT", "ROLLBACK"]);
    }

    #[tokio::test]
    async fn failed_commit_with_good_rollback_returns_original() {
        let (mut conn, driver) = conn();
        conn.begin().await.unwrap();
        driver.fail_next(MockFailure::Commit);
        let err = conn.commit().await.unwrap_err();
        assert!(err.secondary().is_none());
        assert!(!conn.in_transaction());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rolls_back() {
        let (mut conn, driver) = conn();
        conn.begin().await.unwrap();
        conn.close().await.unwrap();
        conn.close().await.unwrap();
        assert!(conn.is_closed());
        assert_eq!(driver.log(), ["BEGIN", "ROLLBACK", "CLOSE"]);
        let err = conn.begin().await.unwrap_err();
        assert!(err.is_connection());
    }

    #[tokio::test]
    async fn transaction_commits_on_ok_and_rolls_back_on_err() {
        let (mut conn, driver) = conn();
        let v = conn.transaction(async |_c| Ok(7)).await.unwrap();
        assert_eq!(v, 7);
        let err = conn
            .transaction(async |_c| Err::<(), _>(Error::Custom("boom".into())))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(driver.log(), ["BEGIN", "COMMIT", "BEGIN", "ROLLBACK"]);
        assert!(!conn.in_transaction());
    }

    #[tokio::test]
    async fn cancelled_call_invalidates_connection() {
        let (mut conn, driver) = conn();
        conn.begin().await.unwrap();
        driver.hold_next_execute();
        {
            let fut = pin!(conn.run("SELECT 1", &[]));
            let mut cx = Context::from_waker(Waker::noop());
            assert!(fut.poll(&mut cx).is_pending());
        }
        assert!(conn.is_invalidated());
        let err = conn.commit().await.unwrap_err();
        assert!(matches!(
            err,
            Error::Connection(ref c) if c.kind == ConnectionErrorKind::Invalidated
        ));
        conn.close().await.unwrap();
        assert!(driver.log().ends_with(&["ROLLBACK".to_string(), "CLOSE".to_string()]));
    }

    #[tokio::test]
    async fn poll_ready_keeps_connection_usable() {
        let (mut conn, _) = conn();
        conn.begin().await.unwrap();
        {
            let mut fut = pin!(conn.run("SELECT 1", &[]));
            let mut cx = Context::from_waker(Waker::noop());
            assert!(matches!(fut.as_mut().poll(&mut cx), Poll::Ready(Ok(_))));
        }
        assert!(!conn.is_invalidated());
    }
}
