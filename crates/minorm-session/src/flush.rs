//! Unit of work: turning tracked changes into DML.
//!
//! A flush runs in three phases, each in foreign-key dependency order:
//!
//! 1. **Inserts**, parent tables first. Generated primary keys are written
//!    back into the instance and copied into the foreign keys of related
//!    instances before they are written.
//! 2. **Updates** of the dirty columns of persistent instances, located by
//!    primary key.
//! 3. **Deletes**, child tables first, and child rows first within a
//!    self-referencing table. Loaded children of a deleted parent that are
//!    not deleted themselves get their foreign key cleared in phase 2.
//!
//! Any failure rolls the whole transaction back.

use crate::Session;
use crate::identity::IdentityKey;
use crate::instance::{EntityRef, Lifecycle, Slot};
use crate::loading::key_predicate;
use minorm_core::error::QueryErrorKind;
use minorm_core::{Driver, Error, Fetch, Result, StatementKind, Value};
use minorm_query::{Expr, delete, insert, lit, select_entity, update};
use minorm_schema::KeySide;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// Statement counts of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl FlushResult {
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

impl<D: Driver> Session<D> {
    /// Write pending inserts, updates and deletes to the database.
    ///
    /// Begins a transaction when none is open and there is something to
    /// write; a flush with no changes issues no statements.
    #[tracing::instrument(level = "debug", skip_all, fields(session = self.id))]
    pub async fn flush(&mut self) -> Result<FlushResult> {
        self.ensure_open()?;
        let roots: Vec<EntityRef> = self
            .pending
            .iter()
            .cloned()
            .chain(self.identity.instances().into_iter().filter(EntityRef::is_modified))
            .collect();
        if let Err(err) = self.cascade(roots) {
            return Err(self.abort(err).await);
        }
        if !self.has_changes() {
            return Ok(FlushResult::default());
        }
        self.ensure_active().await?;

        let started = Instant::now();
        match self.write_changes().await {
            Ok(result) => {
                tracing::info!(
                    session = self.id,
                    inserted = result.inserted,
                    updated = result.updated,
                    deleted = result.deleted,
                    elapsed_ms = started.elapsed().as_millis(),
                    "flush complete"
                );
                Ok(result)
            }
            Err(err) => Err(self.abort(err).await),
        }
    }

    fn has_changes(&self) -> bool {
        !self.pending.is_empty()
            || !self.deleted.is_empty()
            || self
                .identity
                .instances()
                .iter()
                .any(|e| e.lifecycle() == Lifecycle::Persistent && e.is_modified())
    }

    async fn write_changes(&mut self) -> Result<FlushResult> {
        let order: Vec<String> = self.mapper.table_order()?.into_iter().map(|t| t.name.clone()).collect();
        let mut result = FlushResult::default();

        for instance in self.pending.iter().chain(self.deleted.iter()) {
            copy_local_keys(instance);
        }
        for instance in self.identity.instances() {
            copy_local_keys(&instance);
            copy_remote_keys(&instance);
        }
        orphan_children(&self.deleted);

        let pending = self.pending.clone();
        for table in &order {
            let batch = pending.iter().filter(|p| p.entity().table.name == *table).cloned().collect();
            for instance in parents_first(batch) {
                self.insert_instance(&instance).await?;
                result.inserted += 1;
            }
        }

        for table in &order {
            let candidates: Vec<EntityRef> = self
                .identity
                .instances()
                .into_iter()
                .filter(|e| e.entity().table.name == *table && e.lifecycle() == Lifecycle::Persistent)
                .collect();
            for instance in candidates {
                copy_local_keys(&instance);
                if self.update_instance(&instance).await? {
                    result.updated += 1;
                }
            }
        }

        let deleted = self.deleted.clone();
        for table in order.iter().rev() {
            let batch: Vec<EntityRef> = deleted.iter().filter(|d| d.entity().table.name == *table).cloned().collect();
            if batch.len() > 1 {
                self.load_self_references(&batch).await?;
            }
            for instance in children_first(batch) {
                self.delete_instance(&instance).await?;
                result.deleted += 1;
            }
        }

        for instance in self.identity.instances().iter().chain(&self.inserted_in_tx) {
            instance.mark_clean();
        }
        Ok(result)
    }

    async fn insert_instance(&mut self, instance: &EntityRef) -> Result<()> {
        copy_local_keys(instance);
        let entity = Arc::clone(instance.entity());
        let table = &entity.table;
        let pk = instance.pk_indices().to_vec();
        let values = instance.read().values.clone();

        // null keys and null server-default columns are left to the database
        let omitted: Vec<usize> = table
            .columns
            .iter()
            .zip(&values)
            .enumerate()
            .filter(|(i, (column, value))| value.is_null() && (pk.contains(i) || column.server_default.is_some()))
            .map(|(i, _)| i)
            .collect();
        let columns: Vec<(String, Expr)> = table
            .columns
            .iter()
            .zip(values)
            .enumerate()
            .filter(|(i, _)| !omitted.contains(i))
            .map(|(_, (column, value))| (column.name.clone(), lit(value)))
            .collect();
        let cursor = self.conn.execute(&insert(table).values(columns), ()).await?;
        for &index in omitted.iter().filter(|i| !pk.contains(*i)) {
            instance.expire_column(index);
        }

        if let Some(generated) = cursor.inserted_primary_key() {
            for (&index, value) in pk.iter().zip(generated) {
                let missing = instance.read().values[index].is_null();
                if missing {
                    instance.assign_column(index, value.clone());
                }
            }
        }
        let key = IdentityKey::of(instance);
        if !key.is_complete() {
            return Err(Error::mapping(
                Some(&entity.name),
                format!("insert into '{}' produced no primary key; set it explicitly", table.name),
            ));
        }

        instance.set_lifecycle(Lifecycle::Persistent, Some(self.id));
        self.identity.insert(key, instance.clone());
        self.pending.retain(|p| p != instance);
        self.inserted_in_tx.push(instance.clone());
        copy_remote_keys(instance);
        tracing::trace!(entity = %entity.name, key = ?instance.key(), "row inserted");
        Ok(())
    }

    /// UPDATE the dirty columns; `false` when there were none.
    async fn update_instance(&mut self, instance: &EntityRef) -> Result<bool> {
        let (dirty, values) = {
            let state = instance.read();
            (state.dirty.iter().copied().collect::<Vec<_>>(), state.values.clone())
        };
        if dirty.is_empty() {
            return Ok(false);
        }
        let entity = Arc::clone(instance.entity());
        let table = &entity.table;

        let mut statement = update(table);
        for index in dirty {
            statement = statement.set(table.columns[index].name.clone(), lit(values[index].clone()));
        }
        let statement = statement.where_(key_predicate(&table.name, &entity.primary_key(), &instance.key()));
        let cursor = self.conn.execute(&statement, ()).await?;
        expect_one_row(&cursor, StatementKind::Update, &table.name, instance)?;

        instance.write().dirty.clear();
        Ok(true)
    }

    /// Reload expired foreign keys that point into the instance's own table,
    /// so rows of one table can be deleted children first.
    async fn load_self_references(&mut self, batch: &[EntityRef]) -> Result<()> {
        for instance in batch {
            let entity = Arc::clone(instance.entity());
            let expired = entity
                .relationships()
                .iter()
                .filter(|info| info.key_side == KeySide::Local && info.target == entity.name)
                .filter_map(|info| instance.column_index(&info.foreign_key).ok())
                .any(|column| !instance.is_column_loaded(column));
            if !expired {
                continue;
            }
            let select =
                select_entity(&entity).where_(key_predicate(&entity.table.name, &entity.primary_key(), &instance.key()));
            if let Some(row) = self.conn.execute(&select, ()).await?.first() {
                instance.populate(&row.into_values(), true);
            }
        }
        Ok(())
    }

    async fn delete_instance(&mut self, instance: &EntityRef) -> Result<()> {
        let entity = Arc::clone(instance.entity());
        let table = &entity.table;
        let statement = delete(table).where_(key_predicate(&table.name, &entity.primary_key(), &instance.key()));
        let cursor = self.conn.execute(&statement, ()).await?;
        expect_one_row(&cursor, StatementKind::Delete, &table.name, instance)?;

        self.identity.remove_instance(instance);
        self.deleted.retain(|d| d != instance);
        self.deleted_in_tx.push(instance.clone());
        tracing::trace!(entity = %entity.name, key = ?instance.key(), "row deleted");
        Ok(())
    }
}

/// A row located by primary key must be matched exactly once.
#[allow(clippy::result_large_err)]
fn expect_one_row(cursor: &minorm_core::Cursor, kind: StatementKind, table: &str, instance: &EntityRef) -> Result<()> {
    match cursor.rowcount() {
        1 => Ok(()),
        n => Err(Error::query(
            QueryErrorKind::Database,
            format!("{} of {:?} matched {} rows; expected 1", kind, instance, n),
        )
        .with_context(kind, Some(table))),
    }
}

/// Set this instance's foreign keys from its changed many-to-one slots.
fn copy_local_keys(instance: &EntityRef) {
    let entity = Arc::clone(instance.entity());
    for (index, info) in entity.relationships().iter().enumerate() {
        if info.key_side != KeySide::Local {
            continue;
        }
        let rel = instance.relation_state(index);
        if !rel.changed {
            continue;
        }
        let Ok(column) = instance.column_index(&info.foreign_key) else {
            continue;
        };
        match rel.slot {
            Slot::One(Some(target)) => {
                if let Some(value) = target.get(&info.referenced).ok().filter(|v| !v.is_null()) {
                    instance.assign_column(column, value);
                }
            }
            Slot::One(None) => instance.assign_column(column, Value::Null),
            Slot::Many(_) | Slot::Unloaded => {}
        }
    }
}

/// Set the foreign keys of members of this instance's changed one-to-many
/// slots to its referenced column.
fn copy_remote_keys(instance: &EntityRef) {
    let entity = Arc::clone(instance.entity());
    for (index, info) in entity.relationships().iter().enumerate() {
        if info.key_side != KeySide::Remote {
            continue;
        }
        let rel = instance.relation_state(index);
        if !rel.changed {
            continue;
        }
        let Some(value) = instance.get(&info.referenced).ok().filter(|v| !v.is_null()) else {
            continue;
        };
        for member in rel.members() {
            if let Ok(column) = member.column_index(&info.foreign_key) {
                member.assign_column(column, value.clone());
            }
        }
    }
}

/// Clear the foreign key of loaded children of deleted parents that stay.
fn orphan_children(deleted: &[EntityRef]) {
    let deleting: HashSet<usize> = deleted.iter().map(EntityRef::ptr_id).collect();
    for parent in deleted {
        let entity = Arc::clone(parent.entity());
        for (index, info) in entity.relationships().iter().enumerate() {
            if info.key_side != KeySide::Remote {
                continue;
            }
            for child in parent.relation_state(index).members() {
                if deleting.contains(&child.ptr_id()) || child.lifecycle() != Lifecycle::Persistent {
                    continue;
                }
                if let Ok(column) = child.column_index(&info.foreign_key) {
                    child.assign_column(column, Value::Null);
                }
            }
        }
    }
}

/// Order one table's rows so that rows referencing another row of the same
/// batch come after it.
fn parents_first(batch: Vec<EntityRef>) -> Vec<EntityRef> {
    let mut remaining = batch;
    let mut ordered = Vec::with_capacity(remaining.len());
    while !remaining.is_empty() {
        let ready = remaining
            .iter()
            .position(|candidate| {
                remaining
                    .iter()
                    .all(|target| target == candidate || !refers_to(candidate, target))
            })
            // a reference cycle; the database decides
            .unwrap_or(0);
        ordered.push(remaining.remove(ready));
    }
    ordered
}

fn children_first(batch: Vec<EntityRef>) -> Vec<EntityRef> {
    let mut ordered = parents_first(batch);
    ordered.reverse();
    ordered
}

/// Whether `instance` points at `target` through a many-to-one slot or,
/// for loaded columns, through its foreign key value.
fn refers_to(instance: &EntityRef, target: &EntityRef) -> bool {
    let entity = Arc::clone(instance.entity());
    entity
        .relationships()
        .iter()
        .enumerate()
        .filter(|(_, info)| info.key_side == KeySide::Local)
        .any(|(index, info)| {
            if instance.relation_state(index).members().contains(target) {
                return true;
            }
            info.target == target.entity().name
                && match (instance.get(&info.foreign_key), target.get(&info.referenced)) {
                    (Ok(key), Ok(referenced)) => !key.is_null() && key == referenced,
                    _ => false,
                }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use minorm_core::Connection;
    use minorm_core::error::StateErrorKind;
    use minorm_query::{Expr, select, select_entity};
    use minorm_schema::{Column, EntityType, Mapper, Relationship, TableSchema, create_all};
    use minorm_sqlite::{SqliteConfig, SqliteDriver};

    fn count(session: &mut Session<SqliteDriver>) -> u64 {
        session.connection().statement_count()
    }

    #[test]
    fn flush_result_totals() {
        let r = FlushResult {
            inserted: 2,
            updated: 1,
            deleted: 3,
        };
        assert_eq!(r.total(), 6);
        assert!(!r.is_empty());
        assert!(FlushResult::default().is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn clean_session_flushes_nothing() {
        let mut session = seeded().await;
        let before = count(&mut session);
        let result = session.flush().await.unwrap();
        assert!(result.is_empty());
        assert_eq!(count(&mut session), before);
        assert!(!session.connection().in_transaction());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn child_added_alone_inserts_parent_first() {
        let mut session = session().await;
        let mapper = session.mapper().clone();
        let user = EntityRef::with_values(&mapper, "User", [("name", "squidward")]).unwrap();
        let address = EntityRef::with_values(&mapper, "Address", [("email_address", "sq@sqlalchemy.org")]).unwrap();
        address.set_related("user", Some(&user)).unwrap();

        session.add(&address).unwrap();
        assert_eq!(user.lifecycle(), Lifecycle::Pending);
        let result = session.flush().await.unwrap();
        assert_eq!(result.inserted, 2);
        assert_eq!(address.get("user_id").unwrap(), user.get("id").unwrap());
        assert!(!user.get("id").unwrap().is_null());
        assert_eq!(user.lifecycle(), Lifecycle::Persistent);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn appending_to_persistent_parent_inserts_child() {
        let mut session = seeded().await;
        let sandy = session.get("User", 2).await.unwrap().unwrap();
        let mapper = session.mapper().clone();
        let address = EntityRef::with_values(&mapper, "Address", [("email_address", "sandy@gmail.com")]).unwrap();

        session.load_related(&sandy, "addresses").await.unwrap();
        sandy.append("addresses", &address).unwrap();
        let result = session.flush().await.unwrap();
        assert_eq!(result.inserted, 1);
        assert_eq!(result.updated, 0);
        assert_eq!(address.get("user_id").unwrap(), Value::Int(2));
        assert!(session.contains(&address));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn moving_child_updates_foreign_key() {
        let mut session = seeded().await;
        let spongebob = session.get("User", 1).await.unwrap().unwrap();
        let patrick = session.get("User", 3).await.unwrap().unwrap();
        let address = session.load_related(&spongebob, "addresses").await.unwrap().remove(0);

        address.set_related("user", Some(&patrick)).unwrap();
        assert!(spongebob.related("addresses").unwrap().is_empty());
        let result = session.flush().await.unwrap();
        assert_eq!(result.updated, 1);

        let user_id = session
            .scalar(
                &select([Expr::qualified("address", "user_id").label("user_id")])
                    .where_(Expr::qualified("address", "id").eq(1)),
                (),
            )
            .await
            .unwrap()
            .and_then(|i| i.as_value().cloned());
        assert_eq!(user_id, Some(Value::Int(3)));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn deletes_children_before_parents() {
        let mut session = seeded().await;
        let sandy = session.get("User", 2).await.unwrap().unwrap();
        let addresses = session.load_related(&sandy, "addresses").await.unwrap();

        // parent registered for deletion first
        session.delete(&sandy).unwrap();
        for address in &addresses {
            session.delete(address).unwrap();
        }
        let result = session.flush().await.unwrap();
        assert_eq!(result.deleted, 3);
        assert_eq!(result.updated, 0);
        assert!(session.get("User", 2).await.unwrap().is_none());

        session.commit().await.unwrap();
        assert_eq!(sandy.lifecycle(), Lifecycle::Detached);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn orphaned_not_null_children_fail_the_flush() {
        let mut session = seeded().await;
        let sandy = session.get("User", 2).await.unwrap().unwrap();
        session.load_related(&sandy, "addresses").await.unwrap();

        session.delete(&sandy).unwrap();
        let err = session.flush().await.unwrap_err();
        assert!(err.is_constraint(), "{err}");
        assert!(!session.connection().in_transaction());
        assert_eq!(sandy.lifecycle(), Lifecycle::Persistent);
        assert!(session.get("User", 2).await.unwrap().is_some());
    }

    fn nodes() -> Arc<Mapper> {
        Mapper::builder()
            .register(
                EntityType::new(
                    "Node",
                    TableSchema::new("node")
                        .column(Column::integer("id").primary_key())
                        .column(Column::integer("parent_id").references("node", "id"))
                        .column(Column::varchar("data", 30)),
                )
                .relationship(Relationship::one("parent", "Node").back_populates("children"))
                .relationship(Relationship::many("children", "Node").back_populates("parent")),
            )
            .unwrap()
            .build()
            .unwrap()
    }

    async fn node_session() -> Session<SqliteDriver> {
        let mapper = nodes();
        let mut conn = Connection::<SqliteDriver>::open(&SqliteConfig::memory()).await.unwrap();
        create_all(&mapper, &mut conn).await.unwrap();
        Session::new(conn, mapper)
    }

    #[tokio::test(flavor = "current_thread")]
    async fn self_referencing_rows_insert_parent_first() {
        let mut session = node_session().await;
        let mapper = session.mapper().clone();
        let root = EntityRef::with_values(&mapper, "Node", [("data", "root")]).unwrap();
        let leaf = EntityRef::with_values(&mapper, "Node", [("data", "leaf")]).unwrap();
        leaf.set_related("parent", Some(&root)).unwrap();

        // leaf first in add order
        session.add_all([&leaf, &root]).unwrap();
        session.flush().await.unwrap();
        assert_eq!(root.get("id").unwrap(), Value::Int(1));
        assert_eq!(leaf.get("parent_id").unwrap(), Value::Int(1));
        session.commit().await.unwrap();

        let children = session.load_related(&root, "children").await.unwrap();
        assert_eq!(children, vec![leaf]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn unset_server_default_columns_are_generated_and_reloaded() {
        let mapper = Mapper::builder()
            .register(EntityType::new(
                "Note",
                TableSchema::new("note")
                    .column(Column::integer("id").primary_key())
                    .column(Column::text("body"))
                    .column(Column::varchar("status", 10).server_default("'draft'"))
                    .column(Column::text("created_at").server_default("CURRENT_TIMESTAMP")),
            ))
            .unwrap()
            .build()
            .unwrap();
        let mut conn = Connection::<SqliteDriver>::open(&SqliteConfig::memory()).await.unwrap();
        create_all(&mapper, &mut conn).await.unwrap();
        let mut session = Session::new(conn, Arc::clone(&mapper));

        let draft = EntityRef::with_values(&mapper, "Note", [("body", "first")]).unwrap();
        let last = EntityRef::with_values(&mapper, "Note", [("body", "second"), ("status", "final")]).unwrap();
        session.add_all([&draft, &last]).unwrap();
        assert_eq!(session.flush().await.unwrap().inserted, 2);

        assert_eq!(
            draft.get("status").unwrap_err().state_kind(),
            Some(StateErrorKind::Expired)
        );
        assert_eq!(last.get("status").unwrap(), Value::Text("final".into()));
        let before = count(&mut session);
        assert_eq!(session.attr(&draft, "status").await.unwrap(), Value::Text("draft".into()));
        assert_eq!(count(&mut session) - before, 1);
        assert!(!session.attr(&last, "created_at").await.unwrap().is_null());
        session.commit().await.unwrap();
    }

    #[tokio::test(flavor = "current_thread")]
    async fn self_referencing_rows_delete_children_first() {
        let mut session = node_session().await;
        let mapper = session.mapper().clone();
        let root = EntityRef::with_values(&mapper, "Node", [("data", "root")]).unwrap();
        let mid = EntityRef::with_values(&mapper, "Node", [("data", "mid")]).unwrap();
        let leaf = EntityRef::with_values(&mapper, "Node", [("data", "leaf")]).unwrap();
        mid.set_related("parent", Some(&root)).unwrap();
        leaf.set_related("parent", Some(&mid)).unwrap();
        session.add_all([&root, &mid, &leaf]).unwrap();
        session.commit().await.unwrap();
        assert!(root.is_stale());

        // parents marked first, every instance expired
        session.delete(&root).unwrap();
        session.delete(&mid).unwrap();
        session.delete(&leaf).unwrap();
        let result = session.flush().await.unwrap();
        assert_eq!(result.deleted, 3);
        session.commit().await.unwrap();

        let node = Arc::clone(session.mapper().require("Node").unwrap());
        assert!(session.entities(&select_entity(&node), ()).await.unwrap().is_empty());
    }

    #[test]
    fn parents_first_follows_loaded_foreign_keys() {
        let mapper = nodes();
        let root = EntityRef::with_values(&mapper, "Node", [("id", 1)]).unwrap();
        let leaf = EntityRef::with_values(&mapper, "Node", [("id", 2), ("parent_id", 1)]).unwrap();
        let other = EntityRef::with_values(&mapper, "Node", [("id", 3)]).unwrap();

        let ordered = parents_first(vec![leaf.clone(), other.clone(), root.clone()]);
        let at = |e: &EntityRef| ordered.iter().position(|o| o == e).unwrap();
        assert!(at(&root) < at(&leaf));
        let reversed = children_first(vec![root.clone(), leaf.clone()]);
        assert_eq!(reversed, vec![leaf, root]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn deleting_parent_clears_nullable_child_keys() {
        let mut session = node_session().await;
        let mapper = session.mapper().clone();
        let root = EntityRef::with_values(&mapper, "Node", [("data", "root")]).unwrap();
        let leaf = EntityRef::with_values(&mapper, "Node", [("data", "leaf")]).unwrap();
        root.append("children", &leaf).unwrap();
        session.add(&root).unwrap();
        session.commit().await.unwrap();

        session.load_related(&root, "children").await.unwrap();
        session.delete(&root).unwrap();
        let result = session.flush().await.unwrap();
        assert_eq!(result.updated, 1);
        assert_eq!(result.deleted, 1);
        assert_eq!(leaf.get("parent_id").unwrap(), Value::Null);

        let node = Arc::clone(session.mapper().require("Node").unwrap());
        let remaining = session.entities(&select_entity(&node), ()).await.unwrap();
        assert_eq!(remaining, vec![leaf]);
    }
}
