//! Session, identity map and unit of work for minorm.
//!
//! `minorm-session` is the **unit-of-work layer**. A [`Session`] owns one
//! [`Connection`], tracks the entity instances it has loaded or been given,
//! and turns their changes into INSERT, UPDATE and DELETE statements when it
//! flushes.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: one in-memory instance per (entity type, primary key).
//! - **Change tracking**: per-column dirty flags and relationship slots.
//! - **Transactions**: flush, commit and rollback around the connection's
//!   transaction, beginning one on demand.
//! - **Loading**: lazy, joined and select-in relationship loading.
//!
//! # Lifecycle
//!
//! A session is *unbound* until it needs a transaction, *active* while one
//! is open, and *ended* after [`Session::close`]. Commit and rollback return
//! it to unbound. With `expire_on_commit` (the default) every tracked
//! instance is expired at commit; column reads then fail with
//! [`StateErrorKind::Expired`] until [`Session::attr`] or
//! [`Session::refresh`] reloads them.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(conn, mapper.clone());
//!
//! let spongebob = EntityRef::with_values(&mapper, "User", [("name", "spongebob")])?;
//! let address = EntityRef::with_values(&mapper, "Address", [("email_address", "sb@sqlalchemy.org")])?;
//! spongebob.append("addresses", &address)?;
//!
//! // the address is added by cascade
//! session.add(&spongebob)?;
//! session.commit().await?;
//!
//! let users = session
//!     .entities(&select_entity(user).options(selectinload("addresses")), ())
//!     .await?;
//! ```

pub mod flush;
pub mod identity;
pub mod instance;
pub mod loading;
pub mod result;

pub use flush::FlushResult;
pub use identity::{IdentityKey, IdentityMap};
pub use instance::{EntityRef, Lifecycle};
pub use result::{Item, OrmRow};

use minorm_core::error::StateErrorKind;
use minorm_core::{
    Compiled, Connection, Cursor, Driver, Error, Executable, Fetch, Params, Result, ScalarCursor,
    Value,
};
use minorm_query::{CompoundSelect, Delete, Insert, Select, TextStatement, Update};
use minorm_schema::Mapper;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Begin a transaction on the first operation that needs one.
    pub auto_begin: bool,
    /// Flush pending changes before executing a statement.
    pub auto_flush: bool,
    /// Expire every tracked instance after commit.
    pub expire_on_commit: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            auto_flush: true,
            expire_on_commit: true,
        }
    }
}

/// Where a session stands relative to its connection's transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No transaction begun by this session
    Unbound,
    /// A transaction is open
    Active,
    /// Closed; every operation fails
    Ended,
}

// ============================================================================
// Executable statements
// ============================================================================

/// Statements a session can execute. Selects are materialized through the
/// identity map; everything else yields plain value rows.
pub trait SessionExecutable: Executable {
    /// The statement as an entity-aware select.
    fn as_select(&self) -> Option<&Select> {
        None
    }
}

impl SessionExecutable for Select {
    fn as_select(&self) -> Option<&Select> {
        Some(self)
    }
}

impl SessionExecutable for TextStatement {}
impl SessionExecutable for CompoundSelect {}
impl SessionExecutable for Insert {}
impl SessionExecutable for Update {}
impl SessionExecutable for Delete {}
impl SessionExecutable for Compiled {}

impl<T: SessionExecutable + ?Sized> SessionExecutable for &T {
    fn as_select(&self) -> Option<&Select> {
        (**self).as_select()
    }
}

// ============================================================================
// Session
// ============================================================================

/// A unit of work over one connection.
///
/// Not safe for concurrent use: every operation takes `&mut self`. Give each
/// task its own session and connection.
pub struct Session<D: Driver> {
    pub(crate) conn: Connection<D>,
    pub(crate) mapper: Arc<Mapper>,
    pub(crate) config: SessionConfig,
    pub(crate) id: u64,
    pub(crate) state: SessionState,
    pub(crate) identity: IdentityMap,
    /// Added and not yet inserted, in add order
    pub(crate) pending: Vec<EntityRef>,
    /// Marked for deletion and not yet flushed
    pub(crate) deleted: Vec<EntityRef>,
    /// Inserted by a flush of the current transaction
    pub(crate) inserted_in_tx: Vec<EntityRef>,
    /// Deleted by a flush of the current transaction
    pub(crate) deleted_in_tx: Vec<EntityRef>,
}

impl<D: Driver> Session<D> {
    pub fn new(conn: Connection<D>, mapper: Arc<Mapper>) -> Self {
        Self::with_config(conn, mapper, SessionConfig::default())
    }

    pub fn with_config(conn: Connection<D>, mapper: Arc<Mapper>, config: SessionConfig) -> Self {
        let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(session = id, ?config, "session created");
        Self {
            conn,
            mapper,
            config,
            id,
            state: SessionState::Unbound,
            identity: IdentityMap::new(),
            pending: Vec::new(),
            deleted: Vec::new(),
            inserted_in_tx: Vec::new(),
            deleted_in_tx: Vec::new(),
        }
    }

    /// Run `f` with a new session and close it afterwards, whatever `f`
    /// returns. Uncommitted work is rolled back by the close.
    pub async fn scope<T, F>(conn: Connection<D>, mapper: Arc<Mapper>, f: F) -> Result<T>
    where
        F: AsyncFnOnce(&mut Session<D>) -> Result<T>,
    {
        let mut session = Session::new(conn, mapper);
        let result = f(&mut session).await;
        let closed = session.close().await;
        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(err)) | (Err(err), Ok(())) => Err(err),
            (Err(err), Err(secondary)) => Err(err.with_secondary(secondary)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn mapper(&self) -> &Arc<Mapper> {
        &self.mapper
    }

    /// The underlying connection.
    pub fn connection(&mut self) -> &mut Connection<D> {
        &mut self.conn
    }

    pub fn identity_map(&self) -> &IdentityMap {
        &self.identity
    }

    /// Pending instances, in the order they were added.
    pub fn new_instances(&self) -> &[EntityRef] {
        &self.pending
    }

    /// Persistent instances with unflushed changes.
    pub fn dirty_instances(&self) -> Vec<EntityRef> {
        self.identity
            .instances()
            .into_iter()
            .filter(|e| e.lifecycle() == Lifecycle::Persistent && e.is_modified())
            .collect()
    }

    /// Instances marked for deletion and not yet flushed.
    pub fn deleted_instances(&self) -> &[EntityRef] {
        &self.deleted
    }

    /// Whether `instance` is pending, persistent or deleted in this session.
    pub fn contains(&self, instance: &EntityRef) -> bool {
        instance.session_id() == Some(self.id)
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.state == SessionState::Ended {
            return Err(Error::state(StateErrorKind::SessionClosed, "session is closed"));
        }
        Ok(())
    }

    /// Make sure a transaction is open, beginning one if configured to.
    pub(crate) async fn ensure_active(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.conn.in_transaction() {
            if !self.config.auto_begin {
                return Err(Error::state(
                    StateErrorKind::NoTransaction,
                    "session has no active transaction and auto_begin is off; call begin() first",
                ));
            }
            self.conn.begin().await?;
            tracing::debug!(session = self.id, "transaction begun");
        }
        self.state = SessionState::Active;
        Ok(())
    }

    /// Begin a transaction explicitly.
    pub async fn begin(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.conn.in_transaction() {
            return Err(Error::state(
                StateErrorKind::TransactionActive,
                "session already has an active transaction",
            ));
        }
        self.conn.begin().await?;
        self.state = SessionState::Active;
        Ok(())
    }

    // ========================================================================
    // Tracking
    // ========================================================================

    /// Add an instance and, by cascade, every transient or detached instance
    /// reachable through its loaded relationships.
    #[allow(clippy::result_large_err)]
    pub fn add(&mut self, instance: &EntityRef) -> Result<()> {
        self.ensure_open()?;
        self.cascade(vec![instance.clone()])
    }

    #[allow(clippy::result_large_err)]
    pub fn add_all<'a, I>(&mut self, instances: I) -> Result<()>
    where
        I: IntoIterator<Item = &'a EntityRef>,
    {
        self.ensure_open()?;
        self.cascade(instances.into_iter().cloned().collect())
    }

    /// Walk the object graph from `roots`, attaching everything reached.
    #[allow(clippy::result_large_err)]
    pub(crate) fn cascade(&mut self, roots: Vec<EntityRef>) -> Result<()> {
        let mut seen = HashSet::new();
        // depth first, keeping the caller's order for pending inserts
        let mut stack: Vec<EntityRef> = roots.into_iter().rev().collect();
        while let Some(instance) = stack.pop() {
            if !seen.insert(instance.ptr_id()) {
                continue;
            }
            self.attach(&instance)?;
            stack.extend(instance.loaded_members().into_iter().rev());
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn attach(&mut self, instance: &EntityRef) -> Result<()> {
        let owner = instance.session_id();
        if owner.is_some_and(|s| s != self.id) {
            return Err(Error::state(
                StateErrorKind::Lifecycle,
                format!("{:?} is attached to another session", instance),
            ));
        }
        match instance.lifecycle() {
            Lifecycle::Transient => {
                instance.set_lifecycle(Lifecycle::Pending, Some(self.id));
                self.pending.push(instance.clone());
                tracing::trace!(entity = instance.entity_name(), "instance pending");
            }
            Lifecycle::Detached => {
                let key = IdentityKey::of(instance);
                if self.identity.get(&key).is_some_and(|e| e != instance) {
                    return Err(Error::state(
                        StateErrorKind::Lifecycle,
                        format!(
                            "another instance with identity {:?} is already in this session",
                            key.key
                        ),
                    ));
                }
                instance.set_lifecycle(Lifecycle::Persistent, Some(self.id));
                self.identity.insert(key, instance.clone());
            }
            Lifecycle::Pending | Lifecycle::Persistent | Lifecycle::Deleted => {}
        }
        Ok(())
    }

    /// Mark a persistent instance for deletion at the next flush. A pending
    /// instance is simply dropped from the session.
    #[allow(clippy::result_large_err)]
    pub fn delete(&mut self, instance: &EntityRef) -> Result<()> {
        self.ensure_open()?;
        self.require_member(instance)?;
        match instance.lifecycle() {
            Lifecycle::Persistent => {
                instance.set_lifecycle(Lifecycle::Deleted, Some(self.id));
                self.deleted.push(instance.clone());
            }
            Lifecycle::Pending => {
                self.pending.retain(|p| p != instance);
                instance.set_lifecycle(Lifecycle::Transient, None);
            }
            _ => {}
        }
        Ok(())
    }

    /// Stop tracking an instance. Persistent instances become detached,
    /// pending ones transient.
    #[allow(clippy::result_large_err)]
    pub fn expunge(&mut self, instance: &EntityRef) -> Result<()> {
        self.ensure_open()?;
        self.require_member(instance)?;
        match instance.lifecycle() {
            Lifecycle::Pending => {
                self.pending.retain(|p| p != instance);
                instance.set_lifecycle(Lifecycle::Transient, None);
            }
            _ => {
                self.identity.remove_instance(instance);
                self.deleted.retain(|d| d != instance);
                instance.set_lifecycle(Lifecycle::Detached, None);
            }
        }
        Ok(())
    }

    #[allow(clippy::result_large_err)]
    fn require_member(&self, instance: &EntityRef) -> Result<()> {
        if self.contains(instance) {
            Ok(())
        } else {
            Err(Error::state(
                StateErrorKind::Lifecycle,
                format!("{:?} is not in this session", instance),
            ))
        }
    }

    /// Expire one persistent instance.
    #[allow(clippy::result_large_err)]
    pub fn expire(&mut self, instance: &EntityRef) -> Result<()> {
        self.ensure_open()?;
        self.require_persistent(instance)?;
        instance.expire();
        Ok(())
    }

    /// Expire every tracked instance. Instances stay in the identity map.
    pub fn expire_all(&mut self) {
        for instance in self.identity.instances() {
            instance.expire();
        }
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn require_persistent(&self, instance: &EntityRef) -> Result<()> {
        if self.contains(instance) && instance.lifecycle() == Lifecycle::Persistent {
            Ok(())
        } else {
            Err(Error::state(
                StateErrorKind::Lifecycle,
                format!(
                    "{} instance is {:?}, not persistent in this session",
                    instance.entity_name(),
                    instance.lifecycle()
                ),
            ))
        }
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Execute a statement inside the session's transaction.
    ///
    /// Rows of entity selects hold identity-mapped instances; relationship
    /// load options of the select are applied. Statement failures roll the
    /// transaction back before they are returned.
    #[tracing::instrument(level = "debug", skip_all, fields(session = self.id))]
    pub async fn execute<S>(&mut self, statement: &S, params: impl Into<Params>) -> Result<Cursor<OrmRow>>
    where
        S: SessionExecutable + ?Sized,
    {
        let params = params.into();
        self.ensure_active().await?;
        if self.config.auto_flush {
            self.flush().await?;
        }
        let result = match statement.as_select() {
            Some(select) => self.load(select, params).await,
            None => match self.conn.execute(statement, params).await {
                Ok(cursor) => loading::value_rows(cursor),
                Err(err) => Err(err),
            },
        };
        match result {
            Ok(cursor) => Ok(cursor),
            Err(err) => Err(self.fail(err).await),
        }
    }

    /// Statement failures that leave the transaction unusable roll it back
    /// before they leave the session.
    pub(crate) async fn fail(&mut self, err: Error) -> Error {
        if err.poisons_transaction() || self.conn.is_invalidated() {
            self.abort(err).await
        } else {
            err
        }
    }

    /// Execute and narrow each row to its first element.
    pub async fn scalars<S>(&mut self, statement: &S, params: impl Into<Params>) -> Result<ScalarCursor<Item>>
    where
        S: SessionExecutable + ?Sized,
    {
        Ok(self.execute(statement, params).await?.scalars())
    }

    /// Execute and collect the entity in the first position of each row.
    pub async fn entities<S>(&mut self, statement: &S, params: impl Into<Params>) -> Result<Vec<EntityRef>>
    where
        S: SessionExecutable + ?Sized,
    {
        Ok(self
            .scalars(statement, params)
            .await?
            .all()
            .into_iter()
            .filter_map(Item::into_entity)
            .collect())
    }

    /// Execute and return the first column of the first row.
    pub async fn scalar<S>(&mut self, statement: &S, params: impl Into<Params>) -> Result<Option<Item>>
    where
        S: SessionExecutable + ?Sized,
    {
        Ok(self.execute(statement, params).await?.first().and_then(|r| r.into_items().into_iter().next()))
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Flush, then commit the connection's transaction.
    ///
    /// With nothing to flush and no transaction open this does nothing.
    #[tracing::instrument(level = "debug", skip_all, fields(session = self.id))]
    pub async fn commit(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.flush().await?;
        if !self.conn.in_transaction() {
            self.state = SessionState::Unbound;
            return Ok(());
        }
        if let Err(err) = self.conn.commit().await {
            // the connection has already rolled back
            self.reset_after_rollback();
            return Err(err);
        }

        for instance in self.deleted_in_tx.drain(..) {
            instance.set_lifecycle(Lifecycle::Detached, None);
        }
        self.inserted_in_tx.clear();
        if self.config.expire_on_commit {
            self.expire_all();
        }
        self.state = SessionState::Unbound;
        tracing::info!(session = self.id, tracked = self.identity.len(), "session committed");
        Ok(())
    }

    /// Roll back the transaction and discard unflushed changes.
    ///
    /// Pending instances become transient; instances inserted in the
    /// transaction become transient again and leave the identity map;
    /// instances deleted in it become persistent. Everything still tracked
    /// is expired.
    #[tracing::instrument(level = "debug", skip_all, fields(session = self.id))]
    pub async fn rollback(&mut self) -> Result<()> {
        self.ensure_open()?;
        let result = if self.conn.in_transaction() {
            self.conn.rollback().await
        } else {
            Ok(())
        };
        self.reset_after_rollback();
        tracing::info!(session = self.id, "session rolled back");
        result
    }

    /// Roll back after a failed operation, attaching a rollback failure to
    /// `err`.
    pub(crate) async fn abort(&mut self, err: Error) -> Error {
        tracing::warn!(session = self.id, error = %err, "operation failed; rolling back");
        let err = if self.conn.in_transaction() {
            match self.conn.rollback().await {
                Ok(()) => err,
                Err(secondary) => err.with_secondary(secondary),
            }
        } else {
            err
        };
        self.reset_after_rollback();
        err
    }

    fn reset_after_rollback(&mut self) {
        for instance in self.pending.drain(..) {
            instance.set_lifecycle(Lifecycle::Transient, None);
        }
        for instance in self.inserted_in_tx.drain(..) {
            self.identity.remove_instance(&instance);
            instance.set_lifecycle(Lifecycle::Transient, None);
        }
        for instance in self.deleted.drain(..) {
            instance.set_lifecycle(Lifecycle::Persistent, Some(self.id));
        }
        for instance in self.deleted_in_tx.drain(..) {
            instance.set_lifecycle(Lifecycle::Persistent, Some(self.id));
            self.identity.insert(IdentityKey::of(&instance), instance.clone());
        }
        self.expire_all();
        self.state = SessionState::Unbound;
    }

    /// Close the session: roll back any open transaction, detach every
    /// instance and close the connection. Closing twice does nothing.
    #[tracing::instrument(level = "debug", skip_all, fields(session = self.id))]
    pub async fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Ended {
            return Ok(());
        }
        let mut first_error = None;
        if self.conn.in_transaction() {
            if let Err(err) = self.conn.rollback().await {
                first_error = Some(err);
            }
            self.reset_after_rollback();
        } else {
            for instance in self.pending.drain(..) {
                instance.set_lifecycle(Lifecycle::Transient, None);
            }
        }
        for instance in self.identity.drain() {
            instance.set_lifecycle(Lifecycle::Detached, None);
        }
        self.state = SessionState::Ended;
        if let Err(err) = self.conn.close().await {
            first_error.get_or_insert(err);
        }
        tracing::debug!(session = self.id, "session closed");
        first_error.map_or(Ok(()), Err)
    }

    /// Look an instance up by primary key.
    ///
    /// An identity-map hit issues no SQL unless the instance is expired, in
    /// which case its columns are reloaded. A hit on an instance marked for
    /// deletion yields `None`.
    pub async fn get(&mut self, entity: &str, key: impl Into<Value>) -> Result<Option<EntityRef>> {
        self.get_by_key(entity, vec![key.into()]).await
    }

    /// [`Session::get`] for composite keys, in primary-key column order.
    pub async fn get_by_key(&mut self, entity: &str, key: Vec<Value>) -> Result<Option<EntityRef>> {
        self.ensure_open()?;
        let entity = Arc::clone(self.mapper.require(entity)?);
        let pk = entity.primary_key();
        if key.len() != pk.len() {
            return Err(Error::mapping(
                Some(&entity.name),
                format!("primary key has {} columns, {} values given", pk.len(), key.len()),
            ));
        }
        let identity = IdentityKey::new(entity.name.clone(), key.clone());
        if let Some(instance) = self.identity.get(&identity).cloned() {
            tracing::trace!(entity = %entity.name, "identity map hit");
            return match instance.lifecycle() {
                Lifecycle::Deleted => Ok(None),
                _ if instance.is_stale() => {
                    self.reload(&instance, true).await?;
                    Ok(Some(instance))
                }
                _ => Ok(Some(instance)),
            };
        }

        let select = minorm_query::select_entity(&entity)
            .where_(loading::key_predicate(entity.table_name(), &pk, &key));
        Ok(self.execute(&select, ()).await?.scalars().first().and_then(Item::into_entity))
    }
}

impl<D: Driver> std::fmt::Debug for Session<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("tracked", &self.identity.len())
            .field("pending", &self.pending.len())
            .field("deleted", &self.deleted.len())
            .field("connection", &self.conn)
            .finish_non_exhaustive()
    }
}

impl<D: Driver> Drop for Session<D> {
    fn drop(&mut self) {
        if self.state != SessionState::Ended && !self.pending.is_empty() {
            tracing::warn!(
                session = self.id,
                pending = self.pending.len(),
                "session dropped with unflushed instances"
            );
        }
    }
}
