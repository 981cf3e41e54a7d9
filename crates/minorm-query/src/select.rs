//! SELECT statements.
//!
//! A select list mixes whole entities and single expressions. An entity
//! item expands to every column of its table, qualified by the table name or
//! by the alias it was selected under; [`SelectItem::width`] tells how many
//! result columns each item occupies.
//!
//! FROM may also hold derived tables ([`Select::from_subquery`]). A select
//! built with [`Select::from_statement`] renders the given statement as is
//! and keeps its own select list only to map the result rows.

use crate::clause::{Join, JoinType, OrderBy};
use crate::eager::LoadOption;
use crate::expr::Expr;
use crate::set_ops::CompoundSelect;
use crate::subquery::Subquery;
use minorm_core::{Bind, Compiled, Executable, ParameterSet, Result, StatementKind, Value, quote_ident};
use minorm_schema::EntityType;
use std::sync::Arc;

/// One entry of a select list.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    /// All columns of an entity's table
    Entity {
        entity: Arc<EntityType>,
        alias: Option<String>,
    },
    /// A single expression
    Column { expr: Expr, label: Option<String> },
}

impl SelectItem {
    pub fn entity(entity: &Arc<EntityType>) -> Self {
        SelectItem::Entity {
            entity: Arc::clone(entity),
            alias: None,
        }
    }

    /// Entity columns read through a table alias introduced by a join or a
    /// derived table.
    pub fn aliased_entity(entity: &Arc<EntityType>, alias: impl Into<String>) -> Self {
        SelectItem::Entity {
            entity: Arc::clone(entity),
            alias: Some(alias.into()),
        }
    }

    /// Number of result columns this item produces.
    pub fn width(&self) -> usize {
        match self {
            SelectItem::Entity { entity, .. } => entity.table.columns.len(),
            SelectItem::Column { .. } => 1,
        }
    }

    /// Table name or alias an entity item reads from.
    pub fn reference(&self) -> Option<&str> {
        match self {
            SelectItem::Entity { entity, alias } => Some(alias.as_deref().unwrap_or(&entity.table.name)),
            SelectItem::Column { .. } => None,
        }
    }

    fn build(&self, binds: &mut Vec<Bind>) -> String {
        match self {
            SelectItem::Entity { entity, .. } => {
                let reference = quote_ident(self.reference().unwrap_or(&entity.table.name));
                entity
                    .table
                    .columns
                    .iter()
                    .map(|c| format!("{}.{}", reference, quote_ident(&c.name)))
                    .collect::<Vec<_>>()
                    .join(", ")
            }
            SelectItem::Column { expr, label } => {
                let sql = expr.build(binds);
                match label {
                    Some(l) => format!("{} AS {}", sql, quote_ident(l)),
                    None => sql,
                }
            }
        }
    }
}

impl From<Expr> for SelectItem {
    fn from(expr: Expr) -> Self {
        SelectItem::Column { expr, label: None }
    }
}

impl From<&Arc<EntityType>> for SelectItem {
    fn from(entity: &Arc<EntityType>) -> Self {
        SelectItem::entity(entity)
    }
}

impl From<Arc<EntityType>> for SelectItem {
    fn from(entity: Arc<EntityType>) -> Self {
        SelectItem::Entity { entity, alias: None }
    }
}

/// A SELECT statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Select {
    items: Vec<SelectItem>,
    from: Vec<String>,
    derived: Vec<Subquery>,
    joins: Vec<Join>,
    filter: Option<Expr>,
    order_by: Vec<OrderBy>,
    limit: Option<u64>,
    offset: Option<u64>,
    options: Vec<LoadOption>,
    statement: Option<Box<CompoundSelect>>,
}

/// Select the given items.
pub fn select<I, T>(items: I) -> Select
where
    I: IntoIterator<Item = T>,
    T: Into<SelectItem>,
{
    Select {
        items: items.into_iter().map(Into::into).collect(),
        ..Select::default()
    }
}

/// Select whole instances of one entity type.
pub fn select_entity(entity: &Arc<EntityType>) -> Select {
    select([SelectItem::entity(entity)])
}

impl Select {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an item to the select list.
    pub fn column(mut self, item: impl Into<SelectItem>) -> Self {
        self.items.push(item.into());
        self
    }

    /// Add an explicit FROM table.
    pub fn from(mut self, table: impl Into<String>) -> Self {
        let table = table.into();
        if !self.from.contains(&table) {
            self.from.push(table);
        }
        self
    }

    /// Add a derived table to FROM.
    pub fn from_subquery(mut self, subquery: Subquery) -> Self {
        self.derived.retain(|d| d.alias() != subquery.alias());
        self.derived.push(subquery);
        self
    }

    /// Run `statement` in place of this select; result rows map onto this
    /// select's items by position.
    pub fn from_statement(mut self, statement: impl Into<CompoundSelect>) -> Self {
        self.statement = Some(Box::new(statement.into()));
        self
    }

    /// Use this select as a derived table named `alias`.
    pub fn subquery(self, alias: impl Into<String>) -> Subquery {
        Subquery::new(self, alias)
    }

    pub fn join(self, table: impl Into<String>, on: Expr) -> Self {
        self.join_clause(Join::inner(table, on))
    }

    pub fn outer_join(self, table: impl Into<String>, on: Expr) -> Self {
        self.join_clause(Join::left(table, on))
    }

    pub fn join_subquery(self, subquery: Subquery, on: Expr) -> Self {
        self.join_clause(Join::derived(JoinType::Inner, subquery, on))
    }

    pub fn outer_join_subquery(self, subquery: Subquery, on: Expr) -> Self {
        self.join_clause(Join::derived(JoinType::Left, subquery, on))
    }

    /// Add a prepared join, e.g. one with an alias.
    pub fn join_clause(mut self, join: Join) -> Self {
        self.joins.push(join);
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

    pub fn order_by(mut self, order: impl Into<OrderBy>) -> Self {
        self.order_by.push(order.into());
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn offset(mut self, n: u64) -> Self {
        self.offset = Some(n);
        self
    }

    /// Attach a relationship loading option.
    pub fn options(mut self, option: LoadOption) -> Self {
        self.options.retain(|o| o.relationship() != option.relationship());
        self.options.push(option);
        self
    }

    pub fn items(&self) -> &[SelectItem] {
        &self.items
    }

    pub fn load_options(&self) -> &[LoadOption] {
        &self.options
    }

    pub fn joins(&self) -> &[Join] {
        &self.joins
    }

    pub fn order_terms(&self) -> &[OrderBy] {
        &self.order_by
    }

    /// Whether LIMIT or OFFSET restricts the rows.
    pub fn has_limit(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }

    /// The statement set by [`Select::from_statement`].
    pub fn statement(&self) -> Option<&CompoundSelect> {
        self.statement.as_deref()
    }

    /// A copy without relationship loading options.
    pub fn without_options(mut self) -> Self {
        self.options.clear();
        self
    }

    /// The first item, when it is an entity.
    pub fn primary_entity(&self) -> Option<&Arc<EntityType>> {
        match self.items.first() {
            Some(SelectItem::Entity { entity, .. }) => Some(entity),
            _ => None,
        }
    }

    /// Total number of result columns.
    pub fn width(&self) -> usize {
        self.items.iter().map(SelectItem::width).sum()
    }

    /// FROM table entries: explicit ones, then tables the select list refers
    /// to that no join or derived table provides.
    pub fn froms(&self) -> Vec<String> {
        let mut tables = self.from.clone();
        let mut referenced = Vec::new();
        for item in &self.items {
            match item {
                SelectItem::Entity { entity, alias: None } => {
                    if !referenced.contains(&entity.table.name) {
                        referenced.push(entity.table.name.clone());
                    }
                }
                SelectItem::Entity { alias: Some(_), .. } => {}
                SelectItem::Column { expr, .. } => expr.tables(&mut referenced),
            }
        }
        for table in referenced {
            let joined = self.joins.iter().any(|j| j.reference() == table);
            let derived = self.derived.iter().any(|d| d.alias() == table);
            if !joined && !derived && !tables.contains(&table) {
                tables.push(table);
            }
        }
        tables
    }

    /// Render the statement and its binds.
    pub fn build(&self) -> (String, Vec<Bind>) {
        if let Some(statement) = &self.statement {
            return statement.build();
        }
        let mut binds = Vec::new();
        let columns = if self.items.is_empty() {
            "*".to_string()
        } else {
            self.items
                .iter()
                .map(|i| i.build(&mut binds))
                .collect::<Vec<_>>()
                .join(", ")
        };
        let mut sql = format!("SELECT {}", columns);

        let mut froms: Vec<String> = self.froms().iter().map(|t| quote_ident(t)).collect();
        for subquery in &self.derived {
            froms.push(subquery.build(&mut binds));
        }
        if !froms.is_empty() {
            sql.push_str(" FROM ");
            sql.push_str(&froms.join(", "));
        }
        for join in &self.joins {
            sql.push_str(&join.build(&mut binds));
        }
        if let Some(filter) = &self.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&filter.build(&mut binds));
        }
        if !self.order_by.is_empty() {
            let terms: Vec<_> = self.order_by.iter().map(|o| o.build(&mut binds)).collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&terms.join(", "));
        }
        push_limit(&mut sql, &mut binds, self.limit, self.offset);
        (sql, binds)
    }

    /// Table named in error context for this statement.
    fn context_table(&self) -> Option<String> {
        if let Some(statement) = &self.statement {
            return statement.first_table();
        }
        self.froms()
            .into_iter()
            .next()
            .or_else(|| self.derived.first().map(|d| d.alias().to_string()))
    }
}

/// Append LIMIT/OFFSET with bound counts.
pub(crate) fn push_limit(sql: &mut String, binds: &mut Vec<Bind>, limit: Option<u64>, offset: Option<u64>) {
    match (limit, offset) {
        (Some(limit), offset) => {
            sql.push_str(" LIMIT ?");
            binds.push(Bind::Value(count_value(limit)));
            if let Some(offset) = offset {
                sql.push_str(" OFFSET ?");
                binds.push(Bind::Value(count_value(offset)));
            }
        }
        (None, Some(offset)) => {
            sql.push_str(" LIMIT -1 OFFSET ?");
            binds.push(Bind::Value(count_value(offset)));
        }
        (None, None) => {}
    }
}

fn count_value(n: u64) -> Value {
    Value::Int(i64::try_from(n).unwrap_or(i64::MAX))
}

impl Executable for Select {
    fn compile(&self, _shape: Option<&ParameterSet>) -> Result<Compiled> {
        let (sql, binds) = self.build();
        let mut compiled = Compiled::new(StatementKind::Select, sql).with_binds(binds);
        if let Some(table) = self.context_table() {
            compiled = compiled.with_table(&table);
        }
        Ok(compiled)
    }
}
