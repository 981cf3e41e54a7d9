//! Entity instances.
//!
//! An [`EntityRef`] is a shared handle to one in-memory row of a mapped
//! entity. Handles compare by identity: two handles are equal only when they
//! point at the same instance, which is what the identity map guarantees for
//! two loads of the same row.
//!
//! Column values carry a per-column loaded flag. Expiring an instance clears
//! the flags of every non-key column; reading an unloaded column fails with
//! [`StateErrorKind::Expired`] until the session reloads it
//! ([`Session::attr`](crate::Session::attr) or
//! [`Session::refresh`](crate::Session::refresh)).
//!
//! Relationship fields are slots that are either unloaded, a single
//! reference, or a collection. Mutating one side of a relationship declared
//! with `back_populates` updates the other side in the same call.

use minorm_core::error::StateErrorKind;
use minorm_core::{Error, FromValue, Result, Value};
use minorm_schema::{Cardinality, EntityType, Mapper, RelationshipInfo};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Where an instance stands relative to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Constructed, not tracked by any session
    Transient,
    /// Added to a session, not yet flushed
    Pending,
    /// Has a row and is tracked in an identity map
    Persistent,
    /// Marked for removal
    Deleted,
    /// Was persistent; its session ended or let go of it
    Detached,
}

#[derive(Debug, Clone)]
pub(crate) enum Slot {
    Unloaded,
    One(Option<EntityRef>),
    Many(Vec<EntityRef>),
}

#[derive(Debug, Clone)]
pub(crate) struct RelState {
    pub(crate) slot: Slot,
    /// Set by caller mutations, cleared by flush
    pub(crate) changed: bool,
}

impl RelState {
    fn unloaded() -> Self {
        Self {
            slot: Slot::Unloaded,
            changed: false,
        }
    }

    fn empty(cardinality: Cardinality) -> Self {
        Self {
            slot: match cardinality {
                Cardinality::One => Slot::One(None),
                Cardinality::Many => Slot::Many(Vec::new()),
            },
            changed: false,
        }
    }

    pub(crate) fn members(&self) -> Vec<EntityRef> {
        match &self.slot {
            Slot::Unloaded | Slot::One(None) => Vec::new(),
            Slot::One(Some(e)) => vec![e.clone()],
            Slot::Many(items) => items.clone(),
        }
    }
}

#[derive(Debug)]
pub(crate) struct InstanceState {
    pub(crate) values: Vec<Value>,
    pub(crate) loaded: Vec<bool>,
    pub(crate) dirty: BTreeSet<usize>,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) relations: Vec<RelState>,
    /// Id of the owning session while pending, persistent or deleted
    pub(crate) session: Option<u64>,
}

#[derive(Debug)]
struct Instance {
    entity: Arc<EntityType>,
    pk: Vec<usize>,
    state: RwLock<InstanceState>,
}

/// Shared handle to an entity instance.
#[derive(Clone)]
pub struct EntityRef(Arc<Instance>);

impl EntityRef {
    /// A transient instance of the named entity, all columns NULL and every
    /// relationship loaded and empty.
    #[allow(clippy::result_large_err)]
    pub fn new(mapper: &Mapper, entity: &str) -> Result<Self> {
        let entity = Arc::clone(mapper.require(entity)?);
        let width = entity.table.columns.len();
        let relations = entity
            .relationships()
            .iter()
            .map(|r| RelState::empty(r.cardinality))
            .collect();
        Ok(Self::from_state(
            &entity,
            InstanceState {
                values: vec![Value::Null; width],
                loaded: vec![true; width],
                dirty: BTreeSet::new(),
                lifecycle: Lifecycle::Transient,
                relations,
                session: None,
            },
        ))
    }

    /// A transient instance with the given column values.
    #[allow(clippy::result_large_err)]
    pub fn with_values<I, C, V>(mapper: &Mapper, entity: &str, values: I) -> Result<Self>
    where
        I: IntoIterator<Item = (C, V)>,
        C: AsRef<str>,
        V: Into<Value>,
    {
        let instance = Self::new(mapper, entity)?;
        for (column, value) in values {
            instance.set(column.as_ref(), value)?;
        }
        Ok(instance)
    }

    /// A persistent instance materialized from a row.
    pub(crate) fn persistent(entity: &Arc<EntityType>, values: Vec<Value>, session: u64) -> Self {
        let width = values.len();
        let relations = entity.relationships().iter().map(|_| RelState::unloaded()).collect();
        Self::from_state(
            entity,
            InstanceState {
                values,
                loaded: vec![true; width],
                dirty: BTreeSet::new(),
                lifecycle: Lifecycle::Persistent,
                relations,
                session: Some(session),
            },
        )
    }

    fn from_state(entity: &Arc<EntityType>, state: InstanceState) -> Self {
        Self(Arc::new(Instance {
            entity: Arc::clone(entity),
            pk: entity.table.primary_key_indices(),
            state: RwLock::new(state),
        }))
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, InstanceState> {
        self.0.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, InstanceState> {
        self.0.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn entity(&self) -> &Arc<EntityType> {
        &self.0.entity
    }

    pub fn entity_name(&self) -> &str {
        &self.0.entity.name
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.read().lifecycle
    }

    /// Whether any column must be reloaded before it can be read.
    pub fn is_stale(&self) -> bool {
        self.read().loaded.iter().any(|l| !l)
    }

    /// Whether the instance carries changes a flush would write.
    pub fn is_modified(&self) -> bool {
        let state = self.read();
        !state.dirty.is_empty() || state.relations.iter().any(|r| r.changed)
    }

    /// Primary-key values of an instance that has (or had) a row.
    pub fn identity(&self) -> Option<Vec<Value>> {
        let state = self.read();
        match state.lifecycle {
            Lifecycle::Persistent | Lifecycle::Deleted | Lifecycle::Detached => {
                Some(self.key_of(&state))
            }
            Lifecycle::Transient | Lifecycle::Pending => None,
        }
    }

    pub(crate) fn key_of(&self, state: &InstanceState) -> Vec<Value> {
        self.0.pk.iter().map(|&i| state.values[i].clone()).collect()
    }

    pub(crate) fn key(&self) -> Vec<Value> {
        self.key_of(&self.read())
    }

    pub(crate) fn pk_indices(&self) -> &[usize] {
        &self.0.pk
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn column_index(&self, column: &str) -> Result<usize> {
        self.0.entity.table.column_index(column).ok_or_else(|| {
            Error::mapping(
                Some(&self.0.entity.name),
                format!("entity has no column '{}'", column),
            )
        })
    }

    #[allow(clippy::result_large_err)]
    fn relationship(&self, name: &str) -> Result<(usize, &RelationshipInfo)> {
        let entity = &self.0.entity;
        entity
            .relationship_index(name)
            .map(|i| (i, &entity.relationships()[i]))
            .ok_or_else(|| {
                Error::mapping(
                    Some(&entity.name),
                    format!("entity has no relationship '{}'", name),
                )
            })
    }

    pub(crate) fn is_column_loaded(&self, index: usize) -> bool {
        self.read().loaded[index]
    }

    /// Read a column.
    #[allow(clippy::result_large_err)]
    pub fn get(&self, column: &str) -> Result<Value> {
        let index = self.column_index(column)?;
        let state = self.read();
        if !state.loaded[index] {
            return Err(Error::state(
                StateErrorKind::Expired,
                format!(
                    "{}.{} is expired; reload it through the session",
                    self.0.entity.name, column
                ),
            ));
        }
        Ok(state.values[index].clone())
    }

    #[allow(clippy::result_large_err)]
    pub fn get_as<T: FromValue>(&self, column: &str) -> Result<T> {
        T::from_value(&self.get(column)?)
    }

    /// Set a column. On a persistent instance the column becomes dirty.
    #[allow(clippy::result_large_err)]
    pub fn set(&self, column: &str, value: impl Into<Value>) -> Result<()> {
        let index = self.column_index(column)?;
        let value = value.into();
        let mut state = self.write();
        match state.lifecycle {
            Lifecycle::Deleted => {
                return Err(Error::state(
                    StateErrorKind::Lifecycle,
                    format!("{} is deleted; it cannot be modified", self.0.entity.name),
                ));
            }
            Lifecycle::Persistent | Lifecycle::Detached if self.0.pk.contains(&index) => {
                return Err(Error::state(
                    StateErrorKind::Lifecycle,
                    format!(
                        "primary key '{}' of a persisted {} cannot change",
                        column, self.0.entity.name
                    ),
                ));
            }
            _ => {}
        }
        assign(&mut state, index, value);
        Ok(())
    }

    /// Contents of a relationship: zero or one element for a single
    /// reference.
    #[allow(clippy::result_large_err)]
    pub fn related(&self, relationship: &str) -> Result<Vec<EntityRef>> {
        let (index, _) = self.relationship(relationship)?;
        let state = self.read();
        match &state.relations[index].slot {
            Slot::Unloaded => Err(self.not_loaded(relationship)),
            _ => Ok(state.relations[index].members()),
        }
    }

    /// The target of a single-reference relationship.
    #[allow(clippy::result_large_err)]
    pub fn related_one(&self, relationship: &str) -> Result<Option<EntityRef>> {
        let (index, info) = self.relationship(relationship)?;
        if info.cardinality != Cardinality::One {
            return Err(Error::mapping(
                Some(&self.0.entity.name),
                format!("'{}' is a collection", relationship),
            ));
        }
        match &self.read().relations[index].slot {
            Slot::One(target) => Ok(target.clone()),
            _ => Err(self.not_loaded(relationship)),
        }
    }

    pub fn is_loaded(&self, relationship: &str) -> bool {
        self.0
            .entity
            .relationship_index(relationship)
            .is_some_and(|i| !matches!(self.read().relations[i].slot, Slot::Unloaded))
    }

    fn not_loaded(&self, relationship: &str) -> Error {
        Error::state(
            StateErrorKind::NotLoaded,
            format!(
                "{}.{} is not loaded; load it through the session or an eager option",
                self.0.entity.name, relationship
            ),
        )
    }

    #[allow(clippy::result_large_err)]
    fn check_target(&self, info: &RelationshipInfo, other: &EntityRef) -> Result<()> {
        if other.entity_name() == info.target {
            Ok(())
        } else {
            Err(Error::mapping(
                Some(&self.0.entity.name),
                format!(
                    "relationship '{}' holds {} instances, not {}",
                    info.name,
                    info.target,
                    other.entity_name()
                ),
            ))
        }
    }

    /// Append to a collection relationship.
    #[allow(clippy::result_large_err)]
    pub fn append(&self, relationship: &str, child: &EntityRef) -> Result<()> {
        let (index, info) = self.relationship(relationship)?;
        if info.cardinality != Cardinality::Many {
            return Err(Error::mapping(
                Some(&self.0.entity.name),
                format!("'{}' is not a collection; use set_related", relationship),
            ));
        }
        self.check_target(info, child)?;
        {
            let mut state = self.write();
            let rel = &mut state.relations[index];
            let Slot::Many(items) = &mut rel.slot else {
                drop(state);
                return Err(self.not_loaded(relationship));
            };
            if items.contains(child) {
                return Ok(());
            }
            items.push(child.clone());
            rel.changed = true;
        }
        if let Some(back) = &info.back_populates {
            child.sync_reference(back, Some(self));
        }
        Ok(())
    }

    /// Remove from a collection relationship. The child's foreign key is
    /// cleared at the next flush.
    #[allow(clippy::result_large_err)]
    pub fn remove(&self, relationship: &str, child: &EntityRef) -> Result<()> {
        let (index, info) = self.relationship(relationship)?;
        self.check_target(info, child)?;
        let removed = {
            let mut state = self.write();
            let rel = &mut state.relations[index];
            let Slot::Many(items) = &mut rel.slot else {
                drop(state);
                return Err(self.not_loaded(relationship));
            };
            let before = items.len();
            items.retain(|c| c != child);
            let removed = items.len() != before;
            rel.changed |= removed;
            removed
        };
        if !removed {
            return Ok(());
        }
        match &info.back_populates {
            Some(back) => {
                let points_here = child.reference_target(back).is_some_and(|p| p == *self);
                if points_here {
                    child.sync_reference(back, None);
                }
            }
            None => {
                if let Ok(fk) = child.column_index(&info.foreign_key) {
                    assign(&mut child.write(), fk, Value::Null);
                }
            }
        }
        Ok(())
    }

    /// Point a single-reference relationship at `target` (or at nothing).
    #[allow(clippy::result_large_err)]
    pub fn set_related(&self, relationship: &str, target: Option<&EntityRef>) -> Result<()> {
        let (index, info) = self.relationship(relationship)?;
        if info.cardinality != Cardinality::One {
            return Err(Error::mapping(
                Some(&self.0.entity.name),
                format!("'{}' is a collection; use append", relationship),
            ));
        }
        if let Some(t) = target {
            self.check_target(info, t)?;
        }
        let previous = {
            let mut state = self.write();
            let rel = &mut state.relations[index];
            let previous = match &rel.slot {
                Slot::One(p) => p.clone(),
                _ => None,
            };
            if matches!(rel.slot, Slot::One(_)) && previous.as_ref() == target {
                return Ok(());
            }
            rel.slot = Slot::One(target.cloned());
            rel.changed = true;
            previous
        };
        if let Some(back) = &info.back_populates {
            if let Some(old) = previous.filter(|p| Some(p) != target) {
                old.detach_back(back, self);
            }
            if let Some(new) = target {
                new.attach_back(back, self);
            }
        }
        Ok(())
    }

    /// Back-reference side of a single-reference relationship: set the slot
    /// and keep the previous and new owners' collections consistent.
    fn sync_reference(&self, relationship: &str, owner: Option<&EntityRef>) {
        let Some(index) = self.0.entity.relationship_index(relationship) else {
            return;
        };
        let info = &self.0.entity.relationships()[index];
        let previous = {
            let mut state = self.write();
            let rel = &mut state.relations[index];
            let previous = match &rel.slot {
                Slot::One(p) => p.clone(),
                _ => None,
            };
            if matches!(rel.slot, Slot::One(_)) && previous.as_ref() == owner {
                return;
            }
            rel.slot = Slot::One(owner.cloned());
            rel.changed = true;
            previous
        };
        // the owner's own collection was already updated by the caller;
        // a different previous owner must let go of this child
        if let (Some(old), Some(back)) = (previous, &info.back_populates) {
            if Some(&old) != owner {
                old.detach_back(back, self);
            }
        }
    }

    /// The current target of a loaded single-reference slot.
    fn reference_target(&self, relationship: &str) -> Option<EntityRef> {
        let index = self.0.entity.relationship_index(relationship)?;
        match &self.read().relations[index].slot {
            Slot::One(target) => target.clone(),
            _ => None,
        }
    }

    /// Remove `member` from this instance's side of a back-reference. An
    /// unloaded collection is left alone.
    fn detach_back(&self, relationship: &str, member: &EntityRef) {
        let Some(index) = self.0.entity.relationship_index(relationship) else {
            return;
        };
        let mut state = self.write();
        let rel = &mut state.relations[index];
        match &mut rel.slot {
            Slot::Many(items) => {
                let before = items.len();
                items.retain(|m| m != member);
                rel.changed |= items.len() != before;
            }
            Slot::One(Some(current)) if current == member => {
                rel.slot = Slot::One(None);
                rel.changed = true;
            }
            _ => {}
        }
    }

    /// Add `member` to this instance's side of a back-reference. An unloaded
    /// collection stays unloaded; it will read the new member from the
    /// database once flushed.
    fn attach_back(&self, relationship: &str, member: &EntityRef) {
        let Some(index) = self.0.entity.relationship_index(relationship) else {
            return;
        };
        let cardinality = self.0.entity.relationships()[index].cardinality;
        let previous = {
            let mut state = self.write();
            let rel = &mut state.relations[index];
            match (&mut rel.slot, cardinality) {
                (Slot::Many(items), _) => {
                    if !items.contains(member) {
                        items.push(member.clone());
                        rel.changed = true;
                    }
                    None
                }
                (slot, Cardinality::One) => {
                    let previous = match slot {
                        Slot::One(p) => p.clone(),
                        _ => None,
                    };
                    *slot = Slot::One(Some(member.clone()));
                    rel.changed = true;
                    previous
                }
                (Slot::Unloaded | Slot::One(_), Cardinality::Many) => None,
            }
        };
        // one-to-one: the member this instance pointed at before loses it
        if let Some(old) = previous.filter(|p| p != member) {
            let back = self.0.entity.relationships()[index].back_populates.clone();
            if let Some(back) = back {
                old.detach_back(&back, self);
            }
        }
    }

    // Session-side state transitions

    pub(crate) fn session_id(&self) -> Option<u64> {
        self.read().session
    }

    pub(crate) fn set_lifecycle(&self, lifecycle: Lifecycle, session: Option<u64>) {
        let mut state = self.write();
        state.lifecycle = lifecycle;
        state.session = session;
    }

    /// Relationship members reachable through loaded slots.
    pub(crate) fn loaded_members(&self) -> Vec<EntityRef> {
        self.read().relations.iter().flat_map(RelState::members).collect()
    }

    /// Discard unflushed changes and unload every non-key column and every
    /// relationship.
    pub(crate) fn expire(&self) {
        let pk = &self.0.pk;
        let mut state = self.write();
        for (i, loaded) in state.loaded.iter_mut().enumerate() {
            *loaded = pk.contains(&i);
        }
        state.dirty.clear();
        for rel in &mut state.relations {
            *rel = RelState::unloaded();
        }
    }

    /// Unload one column so the next session read fetches it.
    pub(crate) fn expire_column(&self, index: usize) {
        let mut state = self.write();
        state.loaded[index] = false;
        state.dirty.remove(&index);
    }

    /// Overwrite columns from a loaded row. `only_unloaded` keeps values
    /// that are already present.
    pub(crate) fn populate(&self, values: &[Value], only_unloaded: bool) {
        let mut state = self.write();
        for (i, value) in values.iter().enumerate() {
            if only_unloaded && state.loaded[i] {
                continue;
            }
            state.values[i] = value.clone();
            state.loaded[i] = true;
            state.dirty.remove(&i);
        }
    }

    /// First column whose loaded value differs from `values`, when the
    /// difference cannot be reconciled (the column is dirty, or `strict`).
    pub(crate) fn conflicting_column(&self, values: &[Value], strict: bool) -> Option<(usize, Value)> {
        let state = self.read();
        values.iter().enumerate().find_map(|(i, incoming)| {
            let current = &state.values[i];
            let relevant = state.loaded[i] && (strict || state.dirty.contains(&i));
            (relevant && current != incoming).then(|| (i, current.clone()))
        })
    }

    /// Replace a relationship slot with loaded contents. Slots holding
    /// unflushed changes are kept.
    pub(crate) fn fill_relationship(&self, index: usize, members: Vec<EntityRef>) {
        let cardinality = self.0.entity.relationships()[index].cardinality;
        let mut state = self.write();
        let rel = &mut state.relations[index];
        if rel.changed {
            return;
        }
        rel.slot = match cardinality {
            Cardinality::One => Slot::One(members.into_iter().next()),
            Cardinality::Many => Slot::Many(members),
        };
    }

    /// Set an unchanged single-reference slot that is still unloaded.
    pub(crate) fn fill_reference_if_unloaded(&self, index: usize, target: &EntityRef) {
        let mut state = self.write();
        let rel = &mut state.relations[index];
        if matches!(rel.slot, Slot::Unloaded) {
            rel.slot = Slot::One(Some(target.clone()));
        }
    }

    pub(crate) fn relation_state(&self, index: usize) -> RelState {
        self.read().relations[index].clone()
    }

    /// Write a column on behalf of the session (key write-back, derived
    /// foreign keys).
    pub(crate) fn assign_column(&self, index: usize, value: Value) {
        assign(&mut self.write(), index, value);
    }

    /// Mark everything flushed: no dirty columns, no changed slots.
    pub(crate) fn mark_clean(&self) {
        let mut state = self.write();
        state.dirty.clear();
        for rel in &mut state.relations {
            rel.changed = false;
        }
    }

    pub(crate) fn ptr_id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

/// Store a value; a persistent instance records the column as dirty when
/// the value changes or was not loaded.
fn assign(state: &mut InstanceState, index: usize, value: Value) {
    let changed = !state.loaded[index] || state.values[index] != value;
    state.values[index] = value;
    state.loaded[index] = true;
    if changed && state.lifecycle == Lifecycle::Persistent {
        state.dirty.insert(index);
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for EntityRef {}

impl Hash for EntityRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ptr_id().hash(state);
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // relationship slots are skipped: they form cycles
        let mut s = f.debug_struct(&self.0.entity.name);
        match self.0.state.try_read() {
            Ok(state) => {
                for (column, (value, loaded)) in self
                    .0
                    .entity
                    .table
                    .columns
                    .iter()
                    .zip(state.values.iter().zip(&state.loaded))
                {
                    if *loaded {
                        s.field(&column.name, value);
                    } else {
                        s.field(&column.name, &format_args!("<expired>"));
                    }
                }
                s.field("lifecycle", &state.lifecycle);
            }
            Err(_) => {
                s.field("state", &format_args!("<locked>"));
            }
        }
        s.finish()
    }
}
