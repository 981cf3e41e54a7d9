//! Compiled statements: the form every builder hands to the executor.

use crate::error::{Error, Result, StateErrorKind};
use crate::identifiers::quote_list;
use crate::params::ParameterSet;
use crate::value::Value;
use std::fmt;

/// What a statement does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    /// Textual SQL of unknown shape
    Text,
    /// Schema statements
    Ddl,
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StatementKind::Select => "SELECT",
            StatementKind::Insert => "INSERT",
            StatementKind::Update => "UPDATE",
            StatementKind::Delete => "DELETE",
            StatementKind::Text => "TEXT",
            StatementKind::Ddl => "DDL",
        })
    }
}

/// One positional placeholder and where its value comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum Bind {
    /// Resolved from the parameter set at execution time
    Named(String),
    /// Captured by the builder
    Value(Value),
}

/// SQL text with positional `?` placeholders plus the metadata the executor
/// needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Compiled {
    pub sql: String,
    pub binds: Vec<Bind>,
    pub kind: StatementKind,
    pub table: Option<String>,
    /// Target columns of an INSERT, aligned with `binds`
    pub columns: Vec<String>,
    /// Primary-key columns of `table`, for generated-key reporting
    pub primary_key: Vec<String>,
    /// Columns to hand back per inserted row
    pub returning: Vec<String>,
}

impl Compiled {
    pub fn new(kind: StatementKind, sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            binds: Vec::new(),
            kind,
            table: None,
            columns: Vec::new(),
            primary_key: Vec::new(),
            returning: Vec::new(),
        }
    }

    /// A schema statement against `table`.
    pub fn ddl(sql: impl Into<String>, table: &str) -> Self {
        Self::new(StatementKind::Ddl, sql).with_table(table)
    }

    #[must_use]
    pub fn with_table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    #[must_use]
    pub fn with_binds(mut self, binds: Vec<Bind>) -> Self {
        self.binds = binds;
        self
    }

    /// Resolve every placeholder against one parameter set.
    ///
    /// A named bind without a value is a caller error; values are never
    /// defaulted.
    #[allow(clippy::result_large_err)]
    pub fn resolve(&self, params: Option<&ParameterSet>) -> Result<Vec<Value>> {
        self.binds
            .iter()
            .map(|bind| match bind {
                Bind::Value(v) => Ok(v.clone()),
                Bind::Named(name) => params.and_then(|p| p.get(name)).cloned().ok_or_else(|| {
                    Error::state(
                        StateErrorKind::MissingParameter,
                        format!("no value supplied for bind parameter '{}'", name),
                    )
                }),
            })
            .collect()
    }

    /// The statement text extended with a native `RETURNING` clause.
    pub fn sql_with_returning(&self) -> String {
        if self.returning.is_empty() {
            self.sql.clone()
        } else {
            format!("{} RETURNING {}", self.sql, quote_list(&self.returning))
        }
    }

    /// Names of the named binds, in placeholder order.
    pub fn bind_names(&self) -> impl Iterator<Item = &str> {
        self.binds.iter().filter_map(|b| match b {
            Bind::Named(n) => Some(n.as_str()),
            Bind::Value(_) => None,
        })
    }
}

/// Anything the executor can run.
pub trait Executable {
    /// Compile to SQL. `shape` is the first parameter set of the execution,
    /// for statements whose column list follows the supplied parameters.
    #[allow(clippy::result_large_err)]
    fn compile(&self, shape: Option<&ParameterSet>) -> Result<Compiled>;
}

impl Executable for Compiled {
    fn compile(&self, _shape: Option<&ParameterSet>) -> Result<Compiled> {
        Ok(self.clone())
    }
}

impl<T: Executable + ?Sized> Executable for &T {
    fn compile(&self, shape: Option<&ParameterSet>) -> Result<Compiled> {
        (**self).compile(shape)
    }
}
