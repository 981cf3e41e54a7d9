//! Entity registration and the immutable mapper catalog.
//!
//! Entity types are declared as plain data (a table schema plus named
//! relationships), registered on a [`MapperBuilder`], and resolved once by
//! [`MapperBuilder::build`]. After that the [`Mapper`] never changes.

use crate::table::{TableSchema, validate_identifier};
use minorm_core::error::DependencyError;
use minorm_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;

/// How many instances sit on the other side of a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cardinality {
    /// A single related instance (or none).
    One,
    /// A collection.
    Many,
}

/// Relationship declaration, as written at registration time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub name: String,
    /// Name of the target entity type
    pub target: String,
    pub cardinality: Cardinality,
    /// Foreign-key column, on either table. Inferred when unique.
    pub foreign_key: Option<String>,
    /// Reciprocal relationship on the target
    pub back_populates: Option<String>,
}

impl Relationship {
    /// A single-valued relationship (many-to-one or one-to-one).
    pub fn one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, Cardinality::One)
    }

    /// A collection relationship (one-to-many).
    pub fn many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, Cardinality::Many)
    }

    fn new(name: impl Into<String>, target: impl Into<String>, cardinality: Cardinality) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            cardinality,
            foreign_key: None,
            back_populates: None,
        }
    }

    pub fn foreign_key(mut self, column: impl Into<String>) -> Self {
        self.foreign_key = Some(column.into());
        self
    }

    pub fn back_populates(mut self, name: impl Into<String>) -> Self {
        self.back_populates = Some(name.into());
        self
    }
}

/// Which table holds the foreign-key column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySide {
    /// On the owning entity's table (many-to-one).
    Local,
    /// On the target's table (one-to-many, reverse one-to-one).
    Remote,
}

/// A relationship after resolution against the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipInfo {
    pub name: String,
    pub target: String,
    pub target_table: String,
    pub cardinality: Cardinality,
    pub key_side: KeySide,
    /// The foreign-key column
    pub foreign_key: String,
    /// Column the foreign key points at
    pub referenced: String,
    pub back_populates: Option<String>,
}

impl RelationshipInfo {
    /// Column on the owning table used to find related rows.
    pub fn local_column(&self) -> &str {
        match self.key_side {
            KeySide::Local => &self.foreign_key,
            KeySide::Remote => &self.referenced,
        }
    }

    /// Column on the target table matched against [`Self::local_column`].
    pub fn remote_column(&self) -> &str {
        match self.key_side {
            KeySide::Local => &self.referenced,
            KeySide::Remote => &self.foreign_key,
        }
    }
}

/// A record type mapped to exactly one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityType {
    pub name: String,
    pub table: TableSchema,
    declared: Vec<Relationship>,
    resolved: Vec<RelationshipInfo>,
}

impl EntityType {
    pub fn new(name: impl Into<String>, table: TableSchema) -> Self {
        Self {
            name: name.into(),
            table,
            declared: Vec::new(),
            resolved: Vec::new(),
        }
    }

    /// Declare a relationship field.
    pub fn relationship(mut self, relationship: Relationship) -> Self {
        self.declared.push(relationship);
        self
    }

    pub fn table_name(&self) -> &str {
        &self.table.name
    }

    pub fn primary_key(&self) -> Vec<String> {
        self.table.primary_key()
    }

    /// Resolved relationships, in declaration order. Empty before the
    /// mapper is built.
    pub fn relationships(&self) -> &[RelationshipInfo] {
        &self.resolved
    }

    pub fn get_relationship(&self, name: &str) -> Option<&RelationshipInfo> {
        self.resolved.iter().find(|r| r.name == name)
    }

    pub fn relationship_index(&self, name: &str) -> Option<usize> {
        self.resolved.iter().position(|r| r.name == name)
    }
}

/// Collects entity registrations.
#[derive(Debug, Default)]
pub struct MapperBuilder {
    entities: Vec<EntityType>,
}

impl MapperBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one entity type.
    ///
    /// Rejects invalid names, tables without a primary key, and any table or
    /// entity name registered before.
    #[allow(clippy::result_large_err)]
    pub fn register(mut self, entity: EntityType) -> Result<Self> {
        validate_identifier("entity", &entity.name, Some(&entity.name))?;
        entity
            .table
            .validate()
            .map_err(|e| match e {
                Error::Mapping(mut m) => {
                    m.entity = Some(entity.name.clone());
                    Error::Mapping(m)
                }
                other => other,
            })?;
        if self.entities.iter().any(|e| e.table.name == entity.table.name) {
            return Err(Error::mapping(
                Some(&entity.name),
                format!("table '{}' is already registered", entity.table.name),
            ));
        }
        if self.entities.iter().any(|e| e.name == entity.name) {
            return Err(Error::mapping(Some(&entity.name), "entity is already registered"));
        }
        for (i, rel) in entity.declared.iter().enumerate() {
            validate_identifier("relationship", &rel.name, Some(&entity.name))?;
            if entity.table.get_column(&rel.name).is_some()
                || entity.declared[..i].iter().any(|r| r.name == rel.name)
            {
                return Err(Error::mapping(
                    Some(&entity.name),
                    format!("relationship '{}' collides with another field", rel.name),
                ));
            }
        }
        tracing::debug!(entity = %entity.name, table = %entity.table.name, "entity registered");
        self.entities.push(entity);
        Ok(self)
    }

    /// Resolve every relationship and freeze the catalog.
    #[allow(clippy::result_large_err)]
    pub fn build(self) -> Result<Arc<Mapper>> {
        let mut entities = self.entities;

        for entity in &entities {
            for (column, fk) in entity.table.foreign_keys() {
                let target = entities
                    .iter()
                    .find(|e| e.table.name == fk.table)
                    .ok_or_else(|| {
                        Error::mapping(
                            Some(&entity.name),
                            format!(
                                "column '{}' references unregistered table '{}'",
                                column.name, fk.table
                            ),
                        )
                    })?;
                if target.table.get_column(&fk.column).is_none() {
                    return Err(Error::mapping(
                        Some(&entity.name),
                        format!(
                            "column '{}' references missing column '{}.{}'",
                            column.name, fk.table, fk.column
                        ),
                    ));
                }
            }
        }

        let mut resolved = Vec::with_capacity(entities.len());
        for entity in &entities {
            let infos = entity
                .declared
                .iter()
                .map(|rel| resolve(entity, rel, &entities))
                .collect::<Result<Vec<_>>>()?;
            resolved.push(infos);
        }
        for (entity, infos) in entities.iter_mut().zip(resolved) {
            entity.resolved = infos;
        }
        for entity in &entities {
            for rel in &entity.resolved {
                check_back_populates(entity, rel, &entities)?;
            }
        }

        let entities: Vec<Arc<EntityType>> = entities.into_iter().map(Arc::new).collect();
        let by_name = entities
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();
        let by_table = entities
            .iter()
            .enumerate()
            .map(|(i, e)| (e.table.name.clone(), i))
            .collect();
        tracing::info!(entities = entities.len(), "mapper configured");
        Ok(Arc::new(Mapper {
            entities,
            by_name,
            by_table,
        }))
    }
}

/// Candidate foreign-key columns between `owner` and `target`.
fn candidates(owner: &EntityType, rel: &Relationship, target: &EntityType) -> Vec<(KeySide, String, String)> {
    let self_ref = owner.table.name == target.table.name;
    let mut found = Vec::new();
    if rel.cardinality == Cardinality::One || !self_ref {
        for (col, fk) in owner.table.foreign_keys() {
            if fk.table == target.table.name {
                found.push((KeySide::Local, col.name.clone(), fk.column.clone()));
            }
        }
    }
    if rel.cardinality == Cardinality::Many || !self_ref {
        for (col, fk) in target.table.foreign_keys() {
            if fk.table == owner.table.name {
                found.push((KeySide::Remote, col.name.clone(), fk.column.clone()));
            }
        }
    }
    if let Some(wanted) = &rel.foreign_key {
        found.retain(|(_, col, _)| col == wanted);
    }
    if rel.cardinality == Cardinality::Many {
        found.retain(|(side, _, _)| *side == KeySide::Remote);
    } else if found.iter().any(|(side, _, _)| *side == KeySide::Local) {
        found.retain(|(side, _, _)| *side == KeySide::Local);
    }
    found
}

#[allow(clippy::result_large_err)]
fn resolve(owner: &EntityType, rel: &Relationship, entities: &[EntityType]) -> Result<RelationshipInfo> {
    let target = entities.iter().find(|e| e.name == rel.target).ok_or_else(|| {
        Error::mapping(
            Some(&owner.name),
            format!("relationship '{}' targets unknown entity '{}'", rel.name, rel.target),
        )
    })?;
    let mut found = candidates(owner, rel, target);
    let (key_side, foreign_key, referenced) = match found.len() {
        1 => found.remove(0),
        0 => {
            return Err(Error::mapping(
                Some(&owner.name),
                format!(
                    "relationship '{}': no foreign key links '{}' and '{}'{}",
                    rel.name,
                    owner.table.name,
                    target.table.name,
                    rel.foreign_key
                        .as_ref()
                        .map(|c| format!(" through column '{}'", c))
                        .unwrap_or_default()
                ),
            ));
        }
        _ => {
            return Err(Error::mapping(
                Some(&owner.name),
                format!(
                    "relationship '{}': several foreign keys link '{}' and '{}'; name one",
                    rel.name, owner.table.name, target.table.name
                ),
            ));
        }
    };
    Ok(RelationshipInfo {
        name: rel.name.clone(),
        target: target.name.clone(),
        target_table: target.table.name.clone(),
        cardinality: rel.cardinality,
        key_side,
        foreign_key,
        referenced,
        back_populates: rel.back_populates.clone(),
    })
}

#[allow(clippy::result_large_err)]
fn check_back_populates(owner: &EntityType, rel: &RelationshipInfo, entities: &[EntityType]) -> Result<()> {
    let Some(back) = &rel.back_populates else {
        return Ok(());
    };
    let reciprocal = entities
        .iter()
        .find(|e| e.name == rel.target)
        .and_then(|t| t.get_relationship(back));
    match reciprocal {
        Some(other)
            if other.target == owner.name
                && other.foreign_key == rel.foreign_key
                && other.key_side != rel.key_side =>
        {
            Ok(())
        }
        Some(_) => Err(Error::mapping(
            Some(&owner.name),
            format!(
                "relationship '{}': '{}.{}' is not its reciprocal",
                rel.name, rel.target, back
            ),
        )),
        None => Err(Error::mapping(
            Some(&owner.name),
            format!(
                "relationship '{}': back_populates names unknown relationship '{}.{}'",
                rel.name, rel.target, back
            ),
        )),
    }
}

/// The immutable catalog of entity types.
#[derive(Debug)]
pub struct Mapper {
    entities: Vec<Arc<EntityType>>,
    by_name: HashMap<String, usize>,
    by_table: HashMap<String, usize>,
}

impl Mapper {
    pub fn builder() -> MapperBuilder {
        MapperBuilder::new()
    }

    /// Registered entity types, in registration order.
    pub fn entities(&self) -> &[Arc<EntityType>] {
        &self.entities
    }

    pub fn entity(&self, name: &str) -> Option<&Arc<EntityType>> {
        self.by_name.get(name).map(|&i| &self.entities[i])
    }

    /// Like [`Mapper::entity`], failing with a mapping error.
    #[allow(clippy::result_large_err)]
    pub fn require(&self, name: &str) -> Result<&Arc<EntityType>> {
        self.entity(name)
            .ok_or_else(|| Error::mapping(Some(name), "entity type is not registered"))
    }

    pub fn entity_for_table(&self, table: &str) -> Option<&Arc<EntityType>> {
        self.by_table.get(table).map(|&i| &self.entities[i])
    }

    /// Tables ordered so that referenced tables precede referencing ones.
    ///
    /// Ties keep registration order. Self-references are ignored; any other
    /// cycle is a [`DependencyError`] listing the tables left unordered.
    #[allow(clippy::result_large_err)]
    pub fn table_order(&self) -> Result<Vec<&TableSchema>> {
        let deps: Vec<Vec<usize>> = self
            .entities
            .iter()
            .map(|e| {
                e.table
                    .dependencies()
                    .into_iter()
                    .filter_map(|t| self.by_table.get(t).copied())
                    .collect()
            })
            .collect();
        let mut pending: Vec<usize> = deps.iter().map(Vec::len).collect();
        let mut placed = vec![false; self.entities.len()];
        let mut order = Vec::with_capacity(self.entities.len());

        while let Some(next) = (0..self.entities.len()).find(|&i| !placed[i] && pending[i] == 0) {
            placed[next] = true;
            order.push(&self.entities[next].table);
            for (i, d) in deps.iter().enumerate() {
                if !placed[i] && d.contains(&next) {
                    pending[i] -= 1;
                }
            }
        }

        if order.len() < self.entities.len() {
            let tables: Vec<String> = self
                .entities
                .iter()
                .zip(&placed)
                .filter(|(_, p)| !**p)
                .map(|(e, _)| e.table.name.clone())
                .collect();
            return Err(Error::Dependency(DependencyError {
                tables,
                message: "unresolved foreign-key cycle between tables".to_string(),
            }));
        }
        Ok(order)
    }
}
