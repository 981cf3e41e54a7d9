//! Relationship loading options attached to a select.
//!
//! Options name a relationship of the first entity in the select list. The
//! session decides what each strategy turns into at execution time.

/// How one relationship is loaded for the rows of a select.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOption {
    /// Load on first explicit request (the default).
    Lazy(String),
    /// LEFT OUTER JOIN the related table into the main statement.
    Joined(String),
    /// One extra `IN (...)` select for the whole batch of parents.
    SelectIn(String),
    /// The related columns are already joined by the caller under `alias`
    /// (the target table name when `None`).
    ContainsEager {
        relationship: String,
        alias: Option<String>,
    },
}

impl LoadOption {
    pub fn relationship(&self) -> &str {
        match self {
            LoadOption::Lazy(r) | LoadOption::Joined(r) | LoadOption::SelectIn(r) => r,
            LoadOption::ContainsEager { relationship, .. } => relationship,
        }
    }

    /// Set the alias of a `ContainsEager` option. Other options are
    /// returned unchanged.
    pub fn alias(self, alias: impl Into<String>) -> Self {
        match self {
            LoadOption::ContainsEager { relationship, .. } => LoadOption::ContainsEager {
                relationship,
                alias: Some(alias.into()),
            },
            other => other,
        }
    }
}

pub fn lazyload(relationship: impl Into<String>) -> LoadOption {
    LoadOption::Lazy(relationship.into())
}

pub fn joinedload(relationship: impl Into<String>) -> LoadOption {
    LoadOption::Joined(relationship.into())
}

pub fn selectinload(relationship: impl Into<String>) -> LoadOption {
    LoadOption::SelectIn(relationship.into())
}

pub fn contains_eager(relationship: impl Into<String>) -> LoadOption {
    LoadOption::ContainsEager {
        relationship: relationship.into(),
        alias: None,
    }
}
