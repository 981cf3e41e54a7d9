//! Row materialization and relationship loading.
//!
//! Entity columns of each row are turned into instances through the
//! identity map. Relationship options of a select are applied here:
//!
//! - `joinedload` adds a LEFT OUTER JOIN plus the target's columns under an
//!   alias, and fills the relationship from those columns;
//! - `contains_eager` fills it from target columns the caller already joined;
//! - `selectinload` issues one `IN (...)` select for all parents of the batch;
//! - anything else stays unloaded until [`Session::load_related`].
//!
//! Collections are ordered by the related primary key whichever strategy
//! filled them. A joined collection under LIMIT/OFFSET is joined to the
//! limited parents in a derived table, so the limit counts parents rather
//! than joined rows.

use crate::Session;
use crate::identity::{IdentityKey, hash_value};
use crate::instance::{EntityRef, Lifecycle};
use crate::result::{Item, OrmRow};
use minorm_core::error::{IdentityConflictError, QueryErrorKind, StateErrorKind};
use minorm_core::{ColumnInfo, Cursor, Driver, Error, Fetch, Params, Result, Value};
use minorm_query::{Expr, Join, LoadOption, Select, SelectItem, lit, select_entity};
use minorm_schema::{Cardinality, EntityType, KeySide, Mapper, RelationshipInfo};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A relationship of the first entity filled from another select item.
#[derive(Debug, Clone, Copy)]
struct EagerItem {
    relationship: usize,
    item: usize,
}

/// A select augmented for its load options.
#[derive(Debug)]
pub(crate) struct LoadPlan {
    select: Select,
    /// Items the caller asked for; later ones were added for eager loading
    visible: usize,
    eager: Vec<EagerItem>,
    selectin: Vec<usize>,
    /// Joined collections repeat the parent; keep one row per distinct row
    unique: bool,
}

#[allow(clippy::result_large_err)]
pub(crate) fn plan(mapper: &Mapper, select: &Select) -> Result<LoadPlan> {
    let mut plan = LoadPlan {
        select: select.clone(),
        visible: select.items().len(),
        eager: Vec::new(),
        selectin: Vec::new(),
        unique: false,
    };
    if select.load_options().is_empty() {
        return Ok(plan);
    }
    let Some(owner) = select.primary_entity().cloned() else {
        return Err(Error::mapping(
            None,
            "relationship load options need an entity as the first select item",
        ));
    };
    let owner_ref = select.items()[0]
        .reference()
        .unwrap_or(owner.table_name())
        .to_string();

    let adds_columns = select
        .load_options()
        .iter()
        .any(|o| matches!(o, LoadOption::Joined(_) | LoadOption::ContainsEager { .. }));
    if adds_columns && select.statement().is_some() {
        return Err(Error::query(
            QueryErrorKind::Unsupported,
            "joined and contains_eager loading cannot extend a select run from a statement",
        ));
    }
    if select.has_limit() && joins_collection(&owner, select) {
        plan.select = limited_parents(select, &owner_ref)?;
    }

    for option in select.load_options() {
        let name = option.relationship();
        let index = owner
            .relationship_index(name)
            .ok_or_else(|| Error::mapping(Some(&owner.name), format!("entity has no relationship '{}'", name)))?;
        let info = &owner.relationships()[index];
        let target = Arc::clone(mapper.require(&info.target)?);
        match option {
            LoadOption::Lazy(_) => {}
            LoadOption::SelectIn(_) => plan.selectin.push(index),
            LoadOption::Joined(_) => {
                let alias = format!("{}_1", info.name);
                let on = Expr::qualified(owner_ref.as_str(), info.local_column())
                    .eq(Expr::qualified(alias.as_str(), info.remote_column()));
                let item = plan.select.items().len();
                plan.select = plan
                    .select
                    .join_clause(Join::left(target.table_name(), on).alias(alias.as_str()))
                    .column(SelectItem::aliased_entity(&target, alias));
                plan.eager.push(EagerItem { relationship: index, item });
            }
            LoadOption::ContainsEager { alias, .. } => {
                let reference = alias.as_deref().unwrap_or(target.table_name());
                let existing = plan.select.items().iter().position(|i| {
                    matches!(i, SelectItem::Entity { entity, .. } if entity.name == target.name)
                        && i.reference() == Some(reference)
                });
                let item = match existing {
                    Some(item) => item,
                    None => {
                        let item = plan.select.items().len();
                        let column = if reference == target.table_name() {
                            SelectItem::entity(&target)
                        } else {
                            SelectItem::aliased_entity(&target, reference)
                        };
                        plan.select = plan.select.column(column);
                        item
                    }
                };
                plan.eager.push(EagerItem { relationship: index, item });
            }
        }
        if info.cardinality == Cardinality::Many && matches!(option, LoadOption::Joined(_) | LoadOption::ContainsEager { .. }) {
            plan.unique = true;
        }
    }
    Ok(plan)
}

fn joins_collection(owner: &EntityType, select: &Select) -> bool {
    select.load_options().iter().any(|option| {
        matches!(option, LoadOption::Joined(_))
            && owner
                .relationship_index(option.relationship())
                .is_some_and(|i| owner.relationships()[i].cardinality == Cardinality::Many)
    })
}

/// The parent select, limited, as a derived table named like the parent
/// reference so join conditions and ordering still resolve.
#[allow(clippy::result_large_err)]
fn limited_parents(select: &Select, owner_ref: &str) -> Result<Select> {
    let unsupported = |message: &str| Error::query(QueryErrorKind::Unsupported, message);
    if select.items().len() != 1 {
        return Err(unsupported(
            "joinedload of a collection under LIMIT/OFFSET needs the entity as the only select item",
        ));
    }
    if select
        .load_options()
        .iter()
        .any(|o| matches!(o, LoadOption::ContainsEager { .. }))
    {
        return Err(unsupported(
            "contains_eager cannot be combined with a joined collection under LIMIT/OFFSET",
        ));
    }
    let parents = select.clone().without_options().subquery(owner_ref);
    let mut outer = Select::new().column(select.items()[0].clone()).from_subquery(parents);
    for order in select.order_terms() {
        if order.expr.referenced_tables().iter().any(|t| t != owner_ref) {
            return Err(unsupported(
                "joinedload of a collection under LIMIT/OFFSET can only order by the parent's columns",
            ));
        }
        outer = outer.order_by(order.clone());
    }
    Ok(outer)
}

/// Parent to children pairs gathered from joined rows.
#[derive(Default)]
struct Collector {
    parents: Vec<EntityRef>,
    children: Vec<Vec<EntityRef>>,
    index: HashMap<usize, usize>,
}

impl Collector {
    fn add(&mut self, parent: &EntityRef, child: Option<&EntityRef>) {
        let pos = *self.index.entry(parent.ptr_id()).or_insert_with(|| {
            self.parents.push(parent.clone());
            self.children.push(Vec::new());
            self.parents.len() - 1
        });
        if let Some(child) = child {
            let list = &mut self.children[pos];
            if !list.contains(child) {
                list.push(child.clone());
            }
        }
    }
}

/// A materialized row used to drop duplicate rows.
#[derive(PartialEq)]
struct RowKey(Vec<Item>);

impl Eq for RowKey {}

impl Hash for RowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for item in &self.0 {
            match item {
                Item::Entity(e) => {
                    0u8.hash(state);
                    e.ptr_id().hash(state);
                }
                Item::Value(v) => {
                    1u8.hash(state);
                    hash_value(v, state);
                }
            }
        }
    }
}

/// Rows of a statement that selects no entities.
#[allow(clippy::result_large_err)]
pub(crate) fn value_rows(cursor: Cursor) -> Result<Cursor<OrmRow>> {
    let columns = cursor.column_info();
    cursor.try_map(Arc::clone(&columns), |row| {
        Ok(OrmRow::new(
            row.into_values().into_iter().map(Item::Value).collect(),
            Arc::clone(&columns),
        ))
    })
}

/// `table.pk1 = v1 AND table.pk2 = v2 ...`
pub(crate) fn key_predicate(table: &str, columns: &[String], values: &[Value]) -> Expr {
    columns
        .iter()
        .zip(values)
        .map(|(c, v)| Expr::qualified(table, c.as_str()).eq(v.clone()))
        .reduce(Expr::and)
        .unwrap_or_else(|| lit(true))
}

/// Order primary keys the way SQLite orders values.
pub(crate) fn compare_keys(a: &[Value], b: &[Value]) -> Ordering {
    a.iter()
        .zip(b)
        .map(|(x, y)| compare_values(x, y))
        .find(|o| o.is_ne())
        .unwrap_or(Ordering::Equal)
}

fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Double(x), Value::Double(y)) => x.total_cmp(y),
        (Value::Int(x), Value::Double(y)) => (*x as f64).total_cmp(y),
        (Value::Double(x), Value::Int(y)) => x.total_cmp(&(*y as f64)),
        (Value::Text(x), Value::Text(y)) => x.cmp(y),
        (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

fn rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) | Value::Int(_) | Value::Double(_) => 1,
        Value::Text(_) | Value::Json(_) => 2,
        Value::Bytes(_) => 3,
    }
}

fn identity_conflict(entity: &EntityType, key: &[Value], column: usize, existing: Value, incoming: Value) -> Error {
    let key = key.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
    Error::IdentityConflict(IdentityConflictError {
        entity: entity.name.clone(),
        key: format!("({})", key),
        column: entity.table.columns[column].name.clone(),
        existing,
        incoming,
    })
}

impl<D: Driver> Session<D> {
    /// Execute an entity-aware select and apply its load options.
    pub(crate) async fn load(&mut self, select: &Select, params: Params) -> Result<Cursor<OrmRow>> {
        let plan = plan(&self.mapper, select)?;
        let cursor = self.conn.execute(&plan.select, params).await?;
        let (cursor, parents) = self.materialize(&plan, cursor)?;
        for &relationship in &plan.selectin {
            self.load_selectin(&parents, relationship).await?;
        }
        Ok(cursor)
    }

    /// Turn raw rows into ORM rows. Also returns the distinct instances in
    /// the first position, in row order.
    #[allow(clippy::result_large_err)]
    fn materialize(&mut self, plan: &LoadPlan, cursor: Cursor) -> Result<(Cursor<OrmRow>, Vec<EntityRef>)> {
        let items = plan.select.items().to_vec();
        if items.is_empty() {
            return Ok((value_rows(cursor)?, Vec::new()));
        }
        let source = cursor.column_info();
        let mut offsets = Vec::with_capacity(items.len());
        let mut width = 0;
        for item in &items {
            offsets.push(width);
            width += item.width();
        }
        let labels = items
            .iter()
            .zip(&offsets)
            .take(plan.visible)
            .map(|(item, &offset)| match item {
                SelectItem::Entity { entity, .. } => entity.name.clone(),
                SelectItem::Column { .. } => source.name_at(offset).unwrap_or_default().to_string(),
            })
            .collect();
        let columns = Arc::new(ColumnInfo::new(labels));
        let rowcount = cursor.rowcount();

        let mut seen = HashSet::new();
        let mut collectors: Vec<Collector> = plan.eager.iter().map(|_| Collector::default()).collect();
        let mut parents = Vec::new();
        let mut parent_ids = HashSet::new();
        let mut emitted = HashSet::new();
        let mut rows = Vec::new();

        for row in cursor {
            let values = row.into_values();
            if values.len() < width {
                return Err(Error::state(
                    StateErrorKind::ResultShape,
                    format!("select produced {} columns, {} expected", values.len(), width),
                ));
            }
            let mut instances: Vec<Option<EntityRef>> = vec![None; items.len()];
            let mut out = Vec::with_capacity(plan.visible);
            for (i, item) in items.iter().enumerate() {
                let slice = &values[offsets[i]..offsets[i] + item.width()];
                match item {
                    SelectItem::Entity { entity, .. } => {
                        let instance = self.load_instance(entity, slice, &mut seen)?;
                        if i < plan.visible {
                            out.push(instance.clone().map_or(Item::Value(Value::Null), Item::Entity));
                        }
                        instances[i] = instance;
                    }
                    SelectItem::Column { .. } => {
                        if i < plan.visible {
                            out.push(Item::Value(slice[0].clone()));
                        }
                    }
                }
            }

            if let Some(parent) = &instances[0] {
                if parent_ids.insert(parent.ptr_id()) {
                    parents.push(parent.clone());
                }
                for (eager, collector) in plan.eager.iter().zip(&mut collectors) {
                    collector.add(parent, instances[eager.item].as_ref());
                }
            }
            if plan.unique && !emitted.insert(RowKey(out.clone())) {
                continue;
            }
            rows.push(OrmRow::new(out, Arc::clone(&columns)));
        }

        for (eager, collector) in plan.eager.iter().zip(collectors) {
            for (parent, children) in collector.parents.iter().zip(collector.children) {
                fill(parent, eager.relationship, children);
            }
        }
        tracing::debug!(rows = rows.len(), tracked = self.identity.len(), "rows materialized");
        Ok((Cursor::new(columns, rows).with_rowcount(rowcount), parents))
    }

    /// The instance for one row slice of `entity`: the identity-mapped one,
    /// refreshed in place, or a new persistent instance.
    #[allow(clippy::result_large_err)]
    fn load_instance(
        &mut self,
        entity: &Arc<EntityType>,
        values: &[Value],
        seen: &mut HashSet<usize>,
    ) -> Result<Option<EntityRef>> {
        let key: Vec<Value> = entity
            .table
            .primary_key_indices()
            .into_iter()
            .map(|i| values[i].clone())
            .collect();
        if key.iter().all(Value::is_null) {
            return Ok(None);
        }
        let identity = IdentityKey::new(entity.name.clone(), key);
        if let Some(existing) = self.identity.get(&identity).cloned() {
            let repeated = seen.contains(&existing.ptr_id());
            if let Some((column, current)) = existing.conflicting_column(values, repeated) {
                return Err(identity_conflict(entity, &identity.key, column, current, values[column].clone()));
            }
            if !repeated {
                existing.populate(values, false);
                seen.insert(existing.ptr_id());
            }
            return Ok(Some(existing));
        }
        let instance = EntityRef::persistent(entity, values.to_vec(), self.id);
        seen.insert(instance.ptr_id());
        self.identity.insert(identity, instance.clone());
        Ok(Some(instance))
    }

    /// Run a select and return the instances of its first item.
    async fn fetch_entities(&mut self, select: &Select) -> Result<Vec<EntityRef>> {
        let plan = plan(&self.mapper, select)?;
        let cursor = self.conn.execute(&plan.select, ()).await?;
        let (_, instances) = self.materialize(&plan, cursor)?;
        Ok(instances)
    }

    /// One `IN` select for relationship `index` of every parent.
    async fn load_selectin(&mut self, parents: &[EntityRef], index: usize) -> Result<()> {
        let Some(first) = parents.first() else {
            return Ok(());
        };
        let info = first.entity().relationships()[index].clone();
        let target = Arc::clone(self.mapper.require(&info.target)?);
        let parents: Vec<EntityRef> = parents
            .iter()
            .filter(|p| !p.relation_state(index).changed)
            .cloned()
            .collect();

        let mut keys: Vec<Value> = Vec::new();
        for parent in &parents {
            let value = parent.get(info.local_column())?;
            if !value.is_null() && !keys.contains(&value) {
                keys.push(value);
            }
        }
        let children = if keys.is_empty() {
            Vec::new()
        } else {
            let filter = Expr::qualified(target.table_name(), info.remote_column()).in_list(keys.iter().cloned().map(Expr::from));
            self.fetch_entities(&ordered_by_key(select_entity(&target).where_(filter), &target))
                .await?
        };
        tracing::debug!(
            relationship = %info.name,
            parents = parents.len(),
            children = children.len(),
            "select-in load"
        );

        for parent in &parents {
            let local = parent.get(info.local_column())?;
            let members = if local.is_null() {
                Vec::new()
            } else {
                children
                    .iter()
                    .filter(|c| c.get(info.remote_column()).is_ok_and(|v| v == local))
                    .cloned()
                    .collect()
            };
            fill(parent, index, members);
        }
        Ok(())
    }

    /// Load a relationship of a persistent instance, issuing a select only
    /// when needed. A loaded relationship is returned as is.
    pub async fn load_related(&mut self, instance: &EntityRef, relationship: &str) -> Result<Vec<EntityRef>> {
        self.ensure_open()?;
        if instance.is_loaded(relationship) {
            return instance.related(relationship);
        }
        let owner = Arc::clone(instance.entity());
        let index = owner.relationship_index(relationship).ok_or_else(|| {
            Error::mapping(Some(&owner.name), format!("entity has no relationship '{}'", relationship))
        })?;
        self.require_row(instance)?;
        let info = owner.relationships()[index].clone();
        let target = Arc::clone(self.mapper.require(&info.target)?);

        let local = self.attr(instance, info.local_column()).await?;
        let members = if local.is_null() {
            Vec::new()
        } else if let Some(hit) = self.lookup_target(&target, &info, &local) {
            vec![hit]
        } else {
            if self.config.auto_flush {
                self.flush().await?;
            }
            let select = ordered_by_key(
                select_entity(&target).where_(Expr::qualified(target.table_name(), info.remote_column()).eq(local)),
                &target,
            );
            match self.fetch_entities(&select).await {
                Ok(members) => members,
                Err(err) => return Err(self.fail(err).await),
            }
        };
        tracing::trace!(relationship, loaded = members.len(), "lazy load");
        fill(instance, index, members);
        instance.related(relationship)
    }

    /// Many-to-one on the target's primary key: the identity map may
    /// already hold the target.
    fn lookup_target(&self, target: &EntityType, info: &RelationshipInfo, local: &Value) -> Option<EntityRef> {
        let pk = target.primary_key();
        if info.key_side != KeySide::Local || pk.len() != 1 || pk[0] != info.remote_column() {
            return None;
        }
        self.identity
            .get(&IdentityKey::new(target.name.clone(), vec![local.clone()]))
            .cloned()
    }

    /// Read a column, reloading the instance's expired columns first when
    /// the column is not loaded.
    pub async fn attr(&mut self, instance: &EntityRef, column: &str) -> Result<Value> {
        let index = instance.column_index(column)?;
        if instance.is_column_loaded(index) {
            return instance.get(column);
        }
        self.ensure_open()?;
        self.require_row(instance)?;
        self.reload(instance, true).await?;
        instance.get(column)
    }

    /// Reload every column from the database, discarding unflushed changes
    /// and unloading relationships.
    pub async fn refresh(&mut self, instance: &EntityRef) -> Result<()> {
        self.ensure_open()?;
        self.require_row(instance)?;
        self.reload(instance, false).await
    }

    /// Select the instance's row by primary key and populate it.
    pub(crate) async fn reload(&mut self, instance: &EntityRef, only_unloaded: bool) -> Result<()> {
        self.ensure_active().await?;
        let entity = Arc::clone(instance.entity());
        let key = instance.key();
        let select = select_entity(&entity).where_(key_predicate(entity.table_name(), &entity.primary_key(), &key));
        let row = match self.conn.execute(&select, ()).await {
            Ok(mut cursor) => cursor.first(),
            Err(err) => return Err(self.fail(err).await),
        };
        let Some(row) = row else {
            return Err(Error::state(
                StateErrorKind::Lifecycle,
                format!(
                    "row for {}({}) no longer exists",
                    entity.name,
                    key.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
                ),
            ));
        };
        if !only_unloaded {
            instance.expire();
        }
        instance.populate(&row.into_values(), only_unloaded);
        tracing::trace!(entity = %entity.name, only_unloaded, "instance reloaded");
        Ok(())
    }

    /// Instances whose row can be selected: persistent or marked deleted in
    /// this session.
    #[allow(clippy::result_large_err)]
    fn require_row(&self, instance: &EntityRef) -> Result<()> {
        match instance.lifecycle() {
            Lifecycle::Persistent | Lifecycle::Deleted if self.contains(instance) => Ok(()),
            lifecycle => Err(Error::state(
                StateErrorKind::Lifecycle,
                format!(
                    "{} instance is {:?}; only instances persistent in this session can be loaded",
                    instance.entity_name(),
                    lifecycle
                ),
            )),
        }
    }
}

fn ordered_by_key(mut select: Select, target: &EntityType) -> Select {
    for pk in target.primary_key() {
        select = select.order_by(Expr::qualified(target.table_name(), pk));
    }
    select
}

/// Store loaded members in a relationship slot, ordered by primary key, and
/// point single-reference back-references at the parent.
fn fill(parent: &EntityRef, index: usize, mut members: Vec<EntityRef>) {
    let info = &parent.entity().relationships()[index];
    members.sort_by(|a, b| compare_keys(&a.key(), &b.key()));
    if let Some(back) = &info.back_populates {
        for member in &members {
            let target = member.entity();
            if let Some(back_index) = target.relationship_index(back) {
                if target.relationships()[back_index].cardinality == Cardinality::One {
                    member.fill_reference_if_unloaded(back_index, parent);
                }
            }
        }
    }
    parent.fill_relationship(index, members);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;
    use minorm_query::{contains_eager, joinedload, lazyload, select, selectinload, union_all};

    fn user_select(session: &Session<minorm_sqlite::SqliteDriver>) -> Select {
        let user = Arc::clone(session.mapper().entity("User").unwrap());
        select_entity(&user).order_by(Expr::qualified("user_account", "id"))
    }

    fn emails(user: &EntityRef) -> Vec<String> {
        user.related("addresses")
            .unwrap()
            .iter()
            .map(|a| a.get_as::<String>("email_address").unwrap())
            .collect()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn joined_and_selectin_agree() {
        let mut session = seeded().await;
        let before = session.connection().statement_count();
        let joined = session
            .entities(&user_select(&session).options(joinedload("addresses")), ())
            .await
            .unwrap();
        let joined_statements = session.connection().statement_count() - before;
        let joined_emails: Vec<_> = joined.iter().map(emails).collect();

        session.expire_all();
        let before = session.connection().statement_count();
        let selectin = session
            .entities(&user_select(&session).options(selectinload("addresses")), ())
            .await
            .unwrap();
        let selectin_statements = session.connection().statement_count() - before;

        assert_eq!(joined, selectin);
        assert_eq!(joined.len(), 3);
        assert_eq!(joined_emails, selectin.iter().map(emails).collect::<Vec<_>>());
        assert_eq!(joined_emails[1], vec!["sandy@sqlalchemy.org", "sandy@squirrelpower.org"]);
        assert!(joined_emails[2].is_empty());
        assert_eq!(joined_statements, 1);
        assert_eq!(selectin_statements, 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn limit_counts_parents_under_a_joined_collection() {
        let mut session = seeded().await;
        let joined = session
            .entities(&user_select(&session).limit(2).options(joinedload("addresses")), ())
            .await
            .unwrap();
        let joined_emails: Vec<_> = joined.iter().map(emails).collect();

        session.expire_all();
        let selectin = session
            .entities(&user_select(&session).limit(2).options(selectinload("addresses")), ())
            .await
            .unwrap();
        assert_eq!(joined, selectin);
        assert_eq!(joined.len(), 2);
        assert_eq!(joined_emails, selectin.iter().map(emails).collect::<Vec<_>>());
        assert_eq!(joined_emails[1], vec!["sandy@sqlalchemy.org", "sandy@squirrelpower.org"]);

        let skipped = session
            .entities(&user_select(&session).offset(1).limit(1).options(joinedload("addresses")), ())
            .await
            .unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(emails(&skipped[0]).len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn limited_joined_collection_rejects_foreign_ordering() {
        let mut session = seeded().await;
        let stmt = user_select(&session)
            .order_by(Expr::qualified("addresses_1", "id"))
            .limit(1)
            .options(joinedload("addresses"));
        let err = session.entities(&stmt, ()).await.unwrap_err();
        assert_eq!(err.query_kind(), Some(QueryErrorKind::Unsupported));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn from_statement_maps_compound_rows_to_entities() {
        let mut session = seeded().await;
        let user = Arc::clone(session.mapper().entity("User").unwrap());
        let sandy = session.get("User", 2).await.unwrap().unwrap();
        let both = union_all([
            select_entity(&user).where_(Expr::qualified("user_account", "id").lt(3)),
            select_entity(&user).where_(Expr::qualified("user_account", "id").eq(3)),
        ]);
        let users = session
            .entities(
                &select_entity(&user).from_statement(both.clone()).options(selectinload("addresses")),
                (),
            )
            .await
            .unwrap();
        let names: Vec<String> = users.iter().map(|u| u.get_as("name").unwrap()).collect();
        assert_eq!(names, ["spongebob", "sandy", "patrick"]);
        assert_eq!(users[1], sandy);
        assert_eq!(emails(&users[1]).len(), 2);

        let err = session
            .entities(&select_entity(&user).from_statement(both).options(joinedload("addresses")), ())
            .await
            .unwrap_err();
        assert_eq!(err.query_kind(), Some(QueryErrorKind::Unsupported));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn aliased_entities_over_subqueries() {
        let mut session = seeded().await;
        let mapper = Arc::clone(session.mapper());
        let user = Arc::clone(mapper.entity("User").unwrap());
        let address = Arc::clone(mapper.entity("Address").unwrap());

        let not_squirrel = select_entity(&address)
            .where_(Expr::qualified("address", "email_address").not_like("%@squirrelpower.org"))
            .subquery("address_subq");
        let stmt = select([SelectItem::entity(&user), SelectItem::aliased_entity(&address, "address_subq")])
            .join_subquery(
                not_squirrel,
                Expr::qualified("user_account", "id").eq(Expr::qualified("address_subq", "user_id")),
            )
            .order_by(Expr::qualified("address_subq", "id"));
        let rows = session.execute(&stmt, ()).await.unwrap().all();
        let pairs: Vec<(String, String)> = rows
            .iter()
            .map(|r| {
                (
                    r.entity("User").unwrap().get_as("name").unwrap(),
                    r.entity("Address").unwrap().get_as("email_address").unwrap(),
                )
            })
            .collect();
        assert_eq!(
            pairs,
            [
                ("spongebob".to_string(), "spongebob@sqlalchemy.org".to_string()),
                ("sandy".to_string(), "sandy@sqlalchemy.org".to_string()),
            ]
        );
        let first = session.get("Address", 1).await.unwrap().unwrap();
        assert_eq!(rows[0].entity("Address"), Some(&first));

        let u = union_all([
            select_entity(&user).where_(Expr::qualified("user_account", "id").lt(2)),
            select_entity(&user).where_(Expr::qualified("user_account", "id").eq(3)),
        ])
        .subquery("anon_1");
        let aliased = select([SelectItem::aliased_entity(&user, "anon_1")])
            .from_subquery(u)
            .order_by(Expr::qualified("anon_1", "id"));
        let names: Vec<String> = session
            .entities(&aliased, ())
            .await
            .unwrap()
            .iter()
            .map(|e| e.get_as("name").unwrap())
            .collect();
        assert_eq!(names, ["spongebob", "patrick"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn eager_loads_set_back_references() {
        let mut session = seeded().await;
        let users = session
            .entities(&user_select(&session).options(selectinload("addresses")), ())
            .await
            .unwrap();
        let address = users[0].related("addresses").unwrap().remove(0);
        assert_eq!(address.related_one("user").unwrap(), Some(users[0].clone()));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn lazy_load_issues_one_select_per_parent() {
        let mut session = seeded().await;
        let users = session
            .entities(&user_select(&session).options(lazyload("addresses")), ())
            .await
            .unwrap();
        assert!(!users[0].is_loaded("addresses"));
        assert_eq!(
            users[0].related("addresses").unwrap_err().state_kind(),
            Some(StateErrorKind::NotLoaded)
        );
        let before = session.connection().statement_count();
        for user in &users {
            session.load_related(user, "addresses").await.unwrap();
        }
        assert_eq!(session.connection().statement_count() - before, 3);
        assert_eq!(emails(&users[0]), vec!["spongebob@sqlalchemy.org"]);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn many_to_one_lazy_load_uses_identity_map() {
        let mut session = seeded().await;
        let sandy = session.get("User", 2).await.unwrap().unwrap();
        let address = session.get("Address", 2).await.unwrap().unwrap();
        let before = session.connection().statement_count();
        let owner = session.load_related(&address, "user").await.unwrap();
        assert_eq!(owner, vec![sandy]);
        assert_eq!(session.connection().statement_count(), before);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn contains_eager_reads_caller_join() {
        let mut session = seeded().await;
        let mapper = Arc::clone(session.mapper());
        let user = Arc::clone(mapper.entity("User").unwrap());
        let address = Arc::clone(mapper.entity("Address").unwrap());
        let stmt = select([SelectItem::entity(&address), SelectItem::entity(&user)])
            .join(
                "user_account",
                Expr::qualified("user_account", "id").eq(Expr::qualified("address", "user_id")),
            )
            .where_(Expr::qualified("user_account", "name").eq("sandy"))
            .order_by(Expr::qualified("address", "id"))
            .options(contains_eager("user"));
        let rows = session.execute(&stmt, ()).await.unwrap().all();
        assert_eq!(rows.len(), 2);
        let first = rows[0].entity("Address").unwrap();
        let owner = rows[0].entity("User").unwrap();
        assert_eq!(first.related_one("user").unwrap().as_ref(), Some(owner));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn dirty_column_conflicts_with_loaded_row() {
        let mut session = seeded().await;
        session.config.auto_flush = false;
        let sandy = session.get("User", 2).await.unwrap().unwrap();
        sandy.set("name", "squirrel").unwrap();
        let err = session.entities(&user_select(&session), ()).await.unwrap_err();
        assert!(matches!(err, Error::IdentityConflict(_)), "{err}");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn mixed_rows_keep_value_labels() {
        let mut session = seeded().await;
        let user = Arc::clone(session.mapper().entity("User").unwrap());
        let stmt = select([
            SelectItem::entity(&user),
            Expr::qualified("user_account", "name").label("username"),
        ])
        .where_(Expr::qualified("user_account", "id").eq(1));
        let row = session.execute(&stmt, ()).await.unwrap().one().unwrap();
        assert_eq!(row.labels(), ["User", "username"]);
        assert_eq!(row.value("username"), Some(&Value::Text("spongebob".into())));
        assert!(row.entity("User").is_some());
    }

    #[test]
    fn keys_order_like_sqlite() {
        assert_eq!(compare_keys(&[Value::Int(2)], &[Value::Int(10)]), Ordering::Less);
        assert_eq!(compare_keys(&[Value::Null], &[Value::Int(1)]), Ordering::Less);
        assert_eq!(
            compare_keys(&[Value::Int(1), Value::Text("b".into())], &[Value::Int(1), Value::Text("a".into())]),
            Ordering::Greater
        );
    }

    #[test]
    fn options_need_an_entity() {
        let mapper = mapper();
        let stmt = select([Expr::qualified("user_account", "id")]).options(joinedload("addresses"));
        assert!(matches!(plan(&mapper, &stmt), Err(Error::Mapping(_))));
    }

    #[test]
    fn joined_plan_adds_aliased_columns() {
        let mapper = mapper();
        let user = Arc::clone(mapper.entity("User").unwrap());
        let planned = plan(&mapper, &select_entity(&user).options(joinedload("addresses"))).unwrap();
        assert_eq!(planned.visible, 1);
        assert!(planned.unique);
        assert_eq!(planned.select.items().len(), 2);
        let (sql, _) = planned.select.build();
        assert!(sql.contains("LEFT OUTER JOIN \"address\" AS \"addresses_1\""), "{sql}");
    }
}
