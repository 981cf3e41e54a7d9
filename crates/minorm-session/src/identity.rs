//! Identity map: at most one in-memory instance per (entity type, primary
//! key) within a session.

use crate::instance::EntityRef;
use minorm_core::Value;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Key of an identity map entry.
#[derive(Debug, Clone)]
pub struct IdentityKey {
    pub entity: String,
    pub key: Vec<Value>,
}

impl IdentityKey {
    pub fn new(entity: impl Into<String>, key: Vec<Value>) -> Self {
        Self {
            entity: entity.into(),
            key,
        }
    }

    /// Key of an instance, from its current primary-key values.
    pub fn of(instance: &EntityRef) -> Self {
        Self::new(instance.entity_name(), instance.key())
    }

    /// A key with a NULL component identifies nothing.
    pub fn is_complete(&self) -> bool {
        !self.key.is_empty() && self.key.iter().all(|v| !v.is_null())
    }
}

impl PartialEq for IdentityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity && self.key == other.key
    }
}

// Primary keys are integers, text or blobs in practice; NaN keys never match.
impl Eq for IdentityKey {}

impl Hash for IdentityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        for value in &self.key {
            hash_value(value, state);
        }
    }
}

/// Hash a value with a tag per variant, so that equal values hash equally.
pub(crate) fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Null => 0u8.hash(state),
        Value::Bool(b) => {
            1u8.hash(state);
            b.hash(state);
        }
        Value::Int(i) => {
            2u8.hash(state);
            i.hash(state);
        }
        Value::Double(f) => {
            3u8.hash(state);
            f.to_bits().hash(state);
        }
        Value::Text(s) => {
            4u8.hash(state);
            s.hash(state);
        }
        Value::Bytes(b) => {
            5u8.hash(state);
            b.hash(state);
        }
        Value::Json(j) => {
            6u8.hash(state);
            j.to_string().hash(state);
        }
    }
}

/// Instances by identity, iterated in the order they were registered.
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<IdentityKey, (u64, EntityRef)>,
    next_seq: u64,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&EntityRef> {
        self.entries.get(key).map(|(_, e)| e)
    }

    pub fn contains_key(&self, key: &IdentityKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Whether this exact instance is registered.
    pub fn contains(&self, instance: &EntityRef) -> bool {
        self.get(&IdentityKey::of(instance)) == Some(instance)
    }

    /// Register an instance, returning the one it displaced.
    pub fn insert(&mut self, key: IdentityKey, instance: EntityRef) -> Option<EntityRef> {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(key, (seq, instance)).map(|(_, e)| e)
    }

    pub fn remove(&mut self, key: &IdentityKey) -> Option<EntityRef> {
        self.entries.remove(key).map(|(_, e)| e)
    }

    /// Remove `instance` if it is the one registered under its key.
    pub fn remove_instance(&mut self, instance: &EntityRef) -> bool {
        let key = IdentityKey::of(instance);
        if self.get(&key) == Some(instance) {
            self.entries.remove(&key);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered instances, oldest registration first.
    pub fn instances(&self) -> Vec<EntityRef> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by_key(|(seq, _)| *seq);
        entries.into_iter().map(|(_, e)| e.clone()).collect()
    }

    /// Remove every entry, returning the instances oldest first.
    pub fn drain(&mut self) -> Vec<EntityRef> {
        let instances = self.instances();
        self.entries.clear();
        instances
    }
}
