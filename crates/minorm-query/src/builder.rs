//! INSERT, UPDATE and DELETE statements against a [`TableSchema`].

use crate::expr::Expr;
use crate::select::Select;
use minorm_core::error::QueryErrorKind;
use minorm_core::{Bind, Compiled, Error, Executable, ParameterSet, Result, StatementKind, quote_ident, quote_list};
use minorm_schema::TableSchema;

/// Table facts a DML statement needs.
#[derive(Debug, Clone, PartialEq)]
struct Target {
    name: String,
    columns: Vec<String>,
    primary_key: Vec<String>,
}

impl Target {
    fn new(table: &TableSchema) -> Self {
        Self {
            name: table.name.clone(),
            columns: table.column_names(),
            primary_key: table.primary_key(),
        }
    }

    #[allow(clippy::result_large_err)]
    fn check_column(&self, column: &str) -> Result<()> {
        if self.columns.iter().any(|c| c == column) {
            Ok(())
        } else {
            Err(Error::mapping(
                Some(&self.name),
                format!("table has no column '{}'", column),
            ))
        }
    }
}

/// INSERT statement.
///
/// Without explicit values, the column list follows the first parameter set
/// of the execution: each table column present in it becomes a named bind
/// of the same name. [`Insert::from_select`] inserts the rows of a select
/// instead.
#[derive(Debug, Clone, PartialEq)]
pub struct Insert {
    target: Target,
    values: Vec<(String, Expr)>,
    returning: Vec<String>,
    source: Option<(Vec<String>, Box<Select>)>,
}

pub fn insert(table: &TableSchema) -> Insert {
    Insert {
        target: Target::new(table),
        values: Vec::new(),
        returning: Vec::new(),
        source: None,
    }
}

impl Insert {
    /// Set explicit column values. Later calls add to (or replace) earlier
    /// ones.
    pub fn values<I, C, E>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = (C, E)>,
        C: Into<String>,
        E: Into<Expr>,
    {
        for (column, expr) in values {
            let column = column.into();
            let expr = expr.into();
            match self.values.iter_mut().find(|(c, _)| *c == column) {
                Some(slot) => slot.1 = expr,
                None => self.values.push((column, expr)),
            }
        }
        self
    }

    /// Fill `columns` from the rows of `select`, matched by position.
    pub fn from_select<I, C>(mut self, columns: I, select: Select) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        let columns = columns.into_iter().map(Into::into).collect();
        self.source = Some((columns, Box::new(select)));
        self
    }

    /// Columns to hand back for each inserted row.
    pub fn returning<I, C>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        self.returning = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn table(&self) -> &str {
        &self.target.name
    }
}

impl Insert {
    #[allow(clippy::result_large_err)]
    fn compile_from_select(&self, columns: &[String], select: &Select) -> Result<Compiled> {
        if !self.values.is_empty() || !self.returning.is_empty() {
            return Err(Error::query(
                QueryErrorKind::Unsupported,
                format!("INSERT into '{}' from a select takes no VALUES or RETURNING", self.target.name),
            ));
        }
        for column in columns {
            self.target.check_column(column)?;
        }
        let (query, binds) = select.build();
        let sql = format!(
            "INSERT INTO {} ({}) {}",
            quote_ident(&self.target.name),
            quote_list(columns),
            query
        );
        let mut compiled = Compiled::new(StatementKind::Insert, sql)
            .with_table(&self.target.name)
            .with_binds(binds);
        compiled.columns = vec![String::new(); compiled.binds.len()];
        Ok(compiled)
    }
}

impl Executable for Insert {
    fn compile(&self, shape: Option<&ParameterSet>) -> Result<Compiled> {
        if let Some((columns, select)) = &self.source {
            return self.compile_from_select(columns, select);
        }
        let values: Vec<(String, Expr)> = if self.values.is_empty() {
            let shape = shape.map(|s| s.names().collect::<Vec<_>>()).unwrap_or_default();
            self.target
                .columns
                .iter()
                .filter(|c| shape.contains(&c.as_str()))
                .map(|c| (c.clone(), Expr::Param(c.clone())))
                .collect()
        } else {
            self.values.clone()
        };
        for (column, _) in &values {
            self.target.check_column(column)?;
        }
        for column in &self.returning {
            self.target.check_column(column)?;
        }

        let table = quote_ident(&self.target.name);
        let mut binds = Vec::new();
        let mut bound_columns = Vec::new();
        let sql = if values.is_empty() {
            format!("INSERT INTO {} DEFAULT VALUES", table)
        } else {
            let names: Vec<&String> = values.iter().map(|(c, _)| c).collect();
            let mut placeholders = Vec::with_capacity(values.len());
            for (column, expr) in &values {
                let before = binds.len();
                placeholders.push(expr.build(&mut binds));
                // keep `columns` aligned with `binds`
                let added = binds.len() - before;
                if added == 1 {
                    bound_columns.push(column.clone());
                } else {
                    bound_columns.extend(std::iter::repeat_n(String::new(), added));
                }
            }
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table,
                quote_list(&names),
                placeholders.join(", ")
            )
        };

        let mut compiled = Compiled::new(StatementKind::Insert, sql)
            .with_table(&self.target.name)
            .with_binds(binds);
        compiled.columns = bound_columns;
        compiled.primary_key.clone_from(&self.target.primary_key);
        compiled.returning.clone_from(&self.returning);
        Ok(compiled)
    }
}

/// UPDATE statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Update {
    target: Target,
    assignments: Vec<(String, Expr)>,
    filter: Option<Expr>,
}

pub fn update(table: &TableSchema) -> Update {
    Update {
        target: Target::new(table),
        assignments: Vec::new(),
        filter: None,
    }
}

impl Update {
    pub fn set(mut self, column: impl Into<String>, value: impl Into<Expr>) -> Self {
        let column = column.into();
        let value = value.into();
        match self.assignments.iter_mut().find(|(c, _)| *c == column) {
            Some(slot) => slot.1 = value,
            None => self.assignments.push((column, value)),
        }
        self
    }

    /// Add a WHERE condition, AND-combined with earlier ones.
    pub fn where_(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }
}

impl Executable for Update {
    fn compile(&self, _shape: Option<&ParameterSet>) -> Result<Compiled> {
        if self.assignments.is_empty() {
            return Err(Error::query(
                QueryErrorKind::Unsupported,
                format!("UPDATE of '{}' has no SET values", self.target.name),
            ));
        }
        let mut binds: Vec<Bind> = Vec::new();
        let mut sets = Vec::with_capacity(self.assignments.len());
        for (column, expr) in &self.assignments {
            self.target.check_column(column)?;
            sets.push(format!("{} = {}", quote_ident(column), expr.build(&mut binds)));
        }
        let mut sql = format!("UPDATE {} SET {}", quote_ident(&self.target.name), sets.join(", "));
        if let Some(filter) = &self.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&filter.build(&mut binds));
        }
        Ok(Compiled::new(StatementKind::Update, sql)
            .with_table(&self.target.name)
            .with_binds(binds))
    }
}

/// DELETE statement.
#[derive(Debug, Clone, PartialEq)]
pub struct Delete {
    target: Target,
    filter: Option<Expr>,
}

pub fn delete(table: &TableSchema) -> Delete {
    Delete {
        target: Target::new(table),
        filter: None,
    }
}

impl Delete {
    /// Add a WHERE condition, AND-combined with earlier ones.
    pub fn where_(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }
}

impl Executable for Delete {
    fn compile(&self, _shape: Option<&ParameterSet>) -> Result<Compiled> {
        let mut binds = Vec::new();
        let mut sql = format!("DELETE FROM {}", quote_ident(&self.target.name));
        if let Some(filter) = &self.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&filter.build(&mut binds));
        }
        Ok(Compiled::new(StatementKind::Delete, sql)
            .with_table(&self.target.name)
            .with_binds(binds))
    }
}
