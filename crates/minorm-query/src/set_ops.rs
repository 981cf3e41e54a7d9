//! Compound selects: UNION, UNION ALL, INTERSECT and EXCEPT.
//!
//! ORDER BY, LIMIT and OFFSET belong to the compound as a whole; member
//! selects should not carry their own.
//!
//! ```ignore
//! let both = union_all([
//!     select_entity(&user).where_(Expr::qualified("user_account", "id").lt(2)),
//!     select_entity(&user).where_(Expr::qualified("user_account", "id").eq(3)),
//! ]);
//! let users = select_entity(&user).from_statement(both);
//! ```

use crate::clause::OrderBy;
use crate::select::{Select, push_limit};
use crate::subquery::Subquery;
use minorm_core::{Bind, Compiled, Executable, ParameterSet, Result, StatementKind};

/// Operator joining two members of a compound select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOpType {
    /// Combined rows, duplicates removed
    Union,
    /// Combined rows, duplicates kept
    UnionAll,
    Intersect,
    Except,
}

impl SetOpType {
    pub const fn as_sql(self) -> &'static str {
        match self {
            SetOpType::Union => "UNION",
            SetOpType::UnionAll => "UNION ALL",
            SetOpType::Intersect => "INTERSECT",
            SetOpType::Except => "EXCEPT",
        }
    }
}

/// Several selects combined by set operators.
#[derive(Debug, Clone, PartialEq)]
pub struct CompoundSelect {
    selects: Vec<Select>,
    /// `ops[i]` joins `selects[i]` and `selects[i + 1]`
    ops: Vec<SetOpType>,
    order_by: Vec<OrderBy>,
    limit: Option<u64>,
    offset: Option<u64>,
}

/// UNION ALL of the given selects.
pub fn union_all(selects: impl IntoIterator<Item = Select>) -> CompoundSelect {
    combine(SetOpType::UnionAll, selects)
}

/// UNION of the given selects.
pub fn union(selects: impl IntoIterator<Item = Select>) -> CompoundSelect {
    combine(SetOpType::Union, selects)
}

fn combine(op: SetOpType, selects: impl IntoIterator<Item = Select>) -> CompoundSelect {
    let selects: Vec<Select> = selects.into_iter().collect();
    let ops = vec![op; selects.len().saturating_sub(1)];
    CompoundSelect {
        selects,
        ops,
        order_by: Vec::new(),
        limit: None,
        offset: None,
    }
}

impl CompoundSelect {
    /// A compound of one member, to be extended with the operator methods.
    pub fn new(first: Select) -> Self {
        combine(SetOpType::UnionAll, [first])
    }

    pub fn union(self, other: Select) -> Self {
        self.add(SetOpType::Union, other)
    }

    pub fn union_all(self, other: Select) -> Self {
        self.add(SetOpType::UnionAll, other)
    }

    pub fn intersect(self, other: Select) -> Self {
        self.add(SetOpType::Intersect, other)
    }

    pub fn except(self, other: Select) -> Self {
        self.add(SetOpType::Except, other)
    }

    fn add(mut self, op: SetOpType, other: Select) -> Self {
        if !self.selects.is_empty() {
            self.ops.push(op);
        }
        self.selects.push(other);
        self
    }

    /// Order the combined rows. Terms must name result columns.
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

    /// Use the compound as a derived table named `alias`.
    pub fn subquery(self, alias: impl Into<String>) -> Subquery {
        Subquery::new(self, alias)
    }

    pub fn selects(&self) -> &[Select] {
        &self.selects
    }

    /// Table the first member reads from.
    pub fn first_table(&self) -> Option<String> {
        self.selects.first().and_then(|s| s.froms().into_iter().next())
    }

    /// Render the statement and its binds.
    pub fn build(&self) -> (String, Vec<Bind>) {
        let mut binds = Vec::new();
        let mut sql = String::new();
        for (i, select) in self.selects.iter().enumerate() {
            if i > 0 {
                let op = self.ops.get(i - 1).copied().unwrap_or(SetOpType::UnionAll);
                sql.push(' ');
                sql.push_str(op.as_sql());
                sql.push(' ');
            }
            let (member, member_binds) = select.build();
            sql.push_str(&member);
            binds.extend(member_binds);
        }
        if !self.order_by.is_empty() {
            let terms: Vec<_> = self.order_by.iter().map(|o| o.build(&mut binds)).collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&terms.join(", "));
        }
        push_limit(&mut sql, &mut binds, self.limit, self.offset);
        (sql, binds)
    }
}

impl From<Select> for CompoundSelect {
    fn from(select: Select) -> Self {
        CompoundSelect::new(select)
    }
}

impl Executable for CompoundSelect {
    fn compile(&self, _shape: Option<&ParameterSet>) -> Result<Compiled> {
        let (sql, binds) = self.build();
        let mut compiled = Compiled::new(StatementKind::Select, sql).with_binds(binds);
        if let Some(table) = self.first_table() {
            compiled = compiled.with_table(&table);
        }
        Ok(compiled)
    }
}
