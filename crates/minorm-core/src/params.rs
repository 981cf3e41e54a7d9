//! Bound parameter sets.

use crate::value::Value;

/// A mapping from placeholder name to value, in insertion order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    entries: Vec<(String, Value)>,
}

impl ParameterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a parameter, replacing an earlier value with the same name.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Builder form of [`ParameterSet::set`].
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for ParameterSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = ParameterSet::new();
        for (k, v) in iter {
            set.set(k, v);
        }
        set
    }
}

/// Parameters for one statement execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Params {
    /// No parameters
    #[default]
    None,
    /// One parameter set: a single invocation
    One(ParameterSet),
    /// Several parameter sets: the statement runs once per set, in order
    Many(Vec<ParameterSet>),
}

impl Params {
    /// Collapse degenerate batches: one set is a single invocation.
    pub fn normalize(self) -> Self {
        match self {
            Params::Many(mut sets) if sets.len() == 1 => Params::One(sets.remove(0)),
            other => other,
        }
    }

    /// The parameter set that decides the compiled statement's shape.
    pub fn shape(&self) -> Option<&ParameterSet> {
        match self {
            Params::None => None,
            Params::One(set) => Some(set),
            Params::Many(sets) => sets.first(),
        }
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, Params::Many(sets) if sets.len() > 1)
    }

    /// Number of invocations these parameters call for.
    pub fn invocations(&self) -> usize {
        match self {
            Params::None | Params::One(_) => 1,
            Params::Many(sets) => sets.len(),
        }
    }
}

impl From<ParameterSet> for Params {
    fn from(set: ParameterSet) -> Self {
        Params::One(set)
    }
}

impl From<Vec<ParameterSet>> for Params {
    fn from(sets: Vec<ParameterSet>) -> Self {
        Params::Many(sets)
    }
}

impl From<()> for Params {
    fn from((): ()) -> Self {
        Params::None
    }
}

/// Build a [`ParameterSet`] from `name => value` pairs.
///
/// # Example
///
/// ```
/// use minorm_core::{params, Value};
///
/// let p = params! { "x" => 6, "y" => 8 };
/// assert_eq!(p.get("y"), Some(&Value::Int(8)));
/// ```
#[macro_export]
macro_rules! params {
    () => {
        $crate::ParameterSet::new()
    };
    ($($name:expr => $value:expr),+ $(,)?) => {{
        let mut set = $crate::ParameterSet::new();
        $(set.set($name, $value);)+
        set
    }};
}
