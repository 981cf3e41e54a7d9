//! ORDER BY and JOIN clauses.

use crate::expr::Expr;
use crate::subquery::Subquery;
use minorm_core::{Bind, quote_ident};

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

/// One ORDER BY term.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub expr: Expr,
    pub direction: OrderDirection,
}

impl OrderBy {
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            direction: OrderDirection::Asc,
        }
    }

    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            direction: OrderDirection::Desc,
        }
    }

    pub fn build(&self, binds: &mut Vec<Bind>) -> String {
        let sql = self.expr.build(binds);
        match self.direction {
            OrderDirection::Asc => sql,
            OrderDirection::Desc => format!("{sql} DESC"),
        }
    }
}

impl From<Expr> for OrderBy {
    fn from(expr: Expr) -> Self {
        OrderBy::asc(expr)
    }
}

/// Types of SQL joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
}

impl JoinType {
    pub const fn as_str(self) -> &'static str {
        match self {
            JoinType::Inner => "JOIN",
            JoinType::Left => "LEFT OUTER JOIN",
        }
    }
}

/// A JOIN clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub join_type: JoinType,
    pub table: String,
    pub alias: Option<String>,
    pub on: Expr,
    /// Set when the joined source is a derived table
    pub subquery: Option<Subquery>,
}

impl Join {
    pub fn inner(table: impl Into<String>, on: Expr) -> Self {
        Self {
            join_type: JoinType::Inner,
            table: table.into(),
            alias: None,
            on,
            subquery: None,
        }
    }

    pub fn left(table: impl Into<String>, on: Expr) -> Self {
        Self {
            join_type: JoinType::Left,
            table: table.into(),
            alias: None,
            on,
            subquery: None,
        }
    }

    /// Join a derived table. It goes by the subquery's alias.
    pub fn derived(join_type: JoinType, subquery: Subquery, on: Expr) -> Self {
        Self {
            join_type,
            table: subquery.alias().to_string(),
            alias: None,
            on,
            subquery: Some(subquery),
        }
    }

    /// Set table alias.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Name the joined table goes by in the rest of the statement.
    pub fn reference(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }

    pub fn build(&self, binds: &mut Vec<Bind>) -> String {
        if let Some(subquery) = &self.subquery {
            let source = subquery.build(binds);
            return format!(" {} {} ON {}", self.join_type.as_str(), source, self.on.build(binds));
        }
        let mut sql = format!(" {} {}", self.join_type.as_str(), quote_ident(&self.table));
        if let Some(alias) = &self.alias {
            sql.push_str(" AS ");
            sql.push_str(&quote_ident(alias));
        }
        sql.push_str(" ON ");
        sql.push_str(&self.on.build(binds));
        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::col;

    #[test]
    fn aliased_outer_join() {
        let j = Join::left(
            "address",
            Expr::qualified("user_account", "id").eq(Expr::qualified("a1", "user_id")),
        )
        .alias("a1");
        let mut binds = Vec::new();
        assert_eq!(
            j.build(&mut binds),
            " LEFT OUTER JOIN \"address\" AS \"a1\" ON \"user_account\".\"id\" = \"a1\".\"user_id\""
        );
        assert_eq!(j.reference(), "a1");
    }

    #[test]
    fn derived_join_binds_inner_values_before_the_condition() {
        let sub = crate::select::select([col("user_id")])
            .from("address")
            .where_(col("id").gt(1))
            .subquery("a");
        let j = Join::derived(
            JoinType::Inner,
            sub,
            Expr::qualified("user_account", "id").eq(Expr::qualified("a", "user_id")).and(col("x").eq(2)),
        );
        let mut binds = Vec::new();
        assert_eq!(
            j.build(&mut binds),
            " JOIN (SELECT \"user_id\" FROM \"address\" WHERE \"id\" > ?) AS \"a\" \
             ON \"user_account\".\"id\" = \"a\".\"user_id\" AND \"x\" = ?"
        );
        assert_eq!(binds.len(), 2);
        assert_eq!(j.reference(), "a");
    }

    #[test]
    fn descending_order() {
        let mut binds = Vec::new();
        assert_eq!(OrderBy::desc(col("name")).build(&mut binds), "\"name\" DESC");
    }
}
