//! SQL expressions for predicates, ordering and value lists.
//!
//! Literal values never appear in the generated SQL text: every
//! [`Expr::Literal`] and [`Expr::Param`] compiles to a `?` placeholder plus a
//! [`Bind`].

use crate::select::SelectItem;
use minorm_core::{Bind, Value, quote_ident};

/// A SQL expression that can be used in WHERE, ORDER BY, SET and select lists.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Column reference with optional table qualifier
    Column {
        /// Optional table name or alias
        table: Option<String>,
        name: String,
    },

    /// Value bound at compile time
    Literal(Value),

    /// Named bind resolved from the parameter set
    Param(String),

    /// Binary operation (e.g., a = b, a > b)
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },

    /// NOT expr
    Not(Box<Expr>),

    /// IN expression
    In {
        expr: Box<Expr>,
        values: Vec<Expr>,
        negated: bool,
    },

    /// IS NULL / IS NOT NULL
    IsNull { expr: Box<Expr>, negated: bool },

    /// LIKE / NOT LIKE
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },

    /// Function call (e.g., COUNT(*), LOWER(name))
    Function { name: String, args: Vec<Expr> },

    /// `*`, only meaningful as a function argument
    Star,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Concat,
}

impl BinaryOp {
    /// Get the SQL representation of this operator.
    pub const fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Concat => "||",
        }
    }

    /// Higher binds tighter.
    pub const fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq
            | BinaryOp::Ne
            | BinaryOp::Lt
            | BinaryOp::Le
            | BinaryOp::Gt
            | BinaryOp::Ge => 3,
            BinaryOp::Add | BinaryOp::Sub | BinaryOp::Concat => 4,
        }
    }
}

/// Unqualified column reference.
pub fn col(name: impl Into<String>) -> Expr {
    Expr::col(name)
}

/// Named bind parameter, e.g. `bind("y")` for `:y`.
pub fn bind(name: impl Into<String>) -> Expr {
    Expr::Param(name.into())
}

/// Bound literal value.
pub fn lit(value: impl Into<Value>) -> Expr {
    Expr::Literal(value.into())
}

impl Expr {
    pub fn col(name: impl Into<String>) -> Self {
        Expr::Column {
            table: None,
            name: name.into(),
        }
    }

    /// Column qualified by a table name or alias.
    pub fn qualified(table: impl Into<String>, column: impl Into<String>) -> Self {
        Expr::Column {
            table: Some(table.into()),
            name: column.into(),
        }
    }

    fn binary(self, op: BinaryOp, other: impl Into<Expr>) -> Self {
        Expr::Binary {
            left: Box::new(self),
            op,
            right: Box::new(other.into()),
        }
    }

    pub fn eq(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Eq, other)
    }

    pub fn ne(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ne, other)
    }

    pub fn lt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Lt, other)
    }

    pub fn le(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Le, other)
    }

    pub fn gt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Gt, other)
    }

    pub fn ge(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ge, other)
    }

    pub fn and(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::And, other)
    }

    pub fn or(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Or, other)
    }

    pub fn add(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Add, other)
    }

    pub fn sub(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Sub, other)
    }

    pub fn concat(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Concat, other)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    pub fn is_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    pub fn in_list<I, E>(self, values: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Expr>,
    {
        Expr::In {
            expr: Box::new(self),
            values: values.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    pub fn not_in_list<I, E>(self, values: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Expr>,
    {
        Expr::In {
            expr: Box::new(self),
            values: values.into_iter().map(Into::into).collect(),
            negated: true,
        }
    }

    pub fn like(self, pattern: impl Into<Expr>) -> Self {
        Expr::Like {
            expr: Box::new(self),
            pattern: Box::new(pattern.into()),
            negated: false,
        }
    }

    pub fn not_like(self, pattern: impl Into<Expr>) -> Self {
        Expr::Like {
            expr: Box::new(self),
            pattern: Box::new(pattern.into()),
            negated: true,
        }
    }

    pub fn function(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Function {
            name: name.into(),
            args,
        }
    }

    /// COUNT(*)
    pub fn count_star() -> Self {
        Expr::function("count", vec![Expr::Star])
    }

    pub fn count(self) -> Self {
        Expr::function("count", vec![self])
    }

    pub fn lower(self) -> Self {
        Expr::function("lower", vec![self])
    }

    /// Select-list entry with an output label.
    pub fn label(self, label: impl Into<String>) -> SelectItem {
        SelectItem::Column {
            expr: self,
            label: Some(label.into()),
        }
    }

    /// Tables and aliases named by qualified column references.
    pub fn referenced_tables(&self) -> Vec<String> {
        let mut out = Vec::new();
        self.tables(&mut out);
        out
    }

    /// Tables named by qualified column references, in first-seen order.
    pub(crate) fn tables(&self, out: &mut Vec<String>) {
        match self {
            Expr::Column { table: Some(t), .. } => {
                if !out.contains(t) {
                    out.push(t.clone());
                }
            }
            Expr::Binary { left, right, .. } => {
                left.tables(out);
                right.tables(out);
            }
            Expr::Not(e) | Expr::IsNull { expr: e, .. } => e.tables(out),
            Expr::In { expr, values, .. } => {
                expr.tables(out);
                values.iter().for_each(|v| v.tables(out));
            }
            Expr::Like { expr, pattern, .. } => {
                expr.tables(out);
                pattern.tables(out);
            }
            Expr::Function { args, .. } => args.iter().for_each(|a| a.tables(out)),
            Expr::Column { table: None, .. } | Expr::Literal(_) | Expr::Param(_) | Expr::Star => {}
        }
    }

    /// Render SQL, appending one bind per placeholder.
    pub fn build(&self, binds: &mut Vec<Bind>) -> String {
        match self {
            Expr::Column { table, name } => match table {
                Some(t) => format!("{}.{}", quote_ident(t), quote_ident(name)),
                None => quote_ident(name),
            },

            Expr::Literal(value) => {
                binds.push(Bind::Value(value.clone()));
                "?".to_string()
            }

            Expr::Param(name) => {
                binds.push(Bind::Named(name.clone()));
                "?".to_string()
            }

            Expr::Binary { left, op, right } => {
                let left_sql = left.build_operand(*op, binds);
                let right_sql = right.build_operand(*op, binds);
                format!("{left_sql} {} {right_sql}", op.as_str())
            }

            Expr::Not(expr) => {
                let inner = expr.build(binds);
                if expr.is_compound() {
                    format!("NOT ({inner})")
                } else {
                    format!("NOT {inner}")
                }
            }

            Expr::In {
                expr,
                values,
                negated,
            } => {
                if values.is_empty() {
                    // Empty IN lists are not valid SQL; keep the truth value.
                    return if *negated { "1 = 1".to_string() } else { "1 = 0".to_string() };
                }
                let expr_sql = expr.build(binds);
                let not_str = if *negated { "NOT " } else { "" };
                let value_sqls: Vec<_> = values.iter().map(|v| v.build(binds)).collect();
                format!("{expr_sql} {not_str}IN ({})", value_sqls.join(", "))
            }

            Expr::IsNull { expr, negated } => {
                let expr_sql = expr.build(binds);
                let not_str = if *negated { " NOT" } else { "" };
                format!("{expr_sql} IS{not_str} NULL")
            }

            Expr::Like {
                expr,
                pattern,
                negated,
            } => {
                let expr_sql = expr.build(binds);
                let pattern_sql = pattern.build(binds);
                let not_str = if *negated { "NOT " } else { "" };
                format!("{expr_sql} {not_str}LIKE {pattern_sql}")
            }

            Expr::Function { name, args } => {
                let arg_sqls: Vec<_> = args.iter().map(|a| a.build(binds)).collect();
                format!("{}({})", name.to_uppercase(), arg_sqls.join(", "))
            }

            Expr::Star => "*".to_string(),
        }
    }

    fn build_operand(&self, parent: BinaryOp, binds: &mut Vec<Bind>) -> String {
        let sql = self.build(binds);
        match self {
            Expr::Binary { op, .. } if op.precedence() < parent.precedence() => format!("({sql})"),
            Expr::Binary { op, .. } if op.precedence() == parent.precedence() && *op != parent => {
                format!("({sql})")
            }
            _ => sql,
        }
    }

    fn is_compound(&self) -> bool {
        matches!(
            self,
            Expr::Binary { .. } | Expr::In { .. } | Expr::IsNull { .. } | Expr::Like { .. }
        )
    }
}

impl From<Value> for Expr {
    fn from(v: Value) -> Self {
        Expr::Literal(v)
    }
}

impl From<&str> for Expr {
    fn from(s: &str) -> Self {
        Expr::Literal(Value::Text(s.to_string()))
    }
}

impl From<String> for Expr {
    fn from(s: String) -> Self {
        Expr::Literal(Value::Text(s))
    }
}

impl From<i32> for Expr {
    fn from(n: i32) -> Self {
        Expr::Literal(Value::Int(i64::from(n)))
    }
}

impl From<i64> for Expr {
    fn from(n: i64) -> Self {
        Expr::Literal(Value::Int(n))
    }
}

impl From<f64> for Expr {
    fn from(n: f64) -> Self {
        Expr::Literal(Value::Double(n))
    }
}

impl From<bool> for Expr {
    fn from(b: bool) -> Self {
        Expr::Literal(Value::Bool(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(e: &Expr) -> (String, Vec<Bind>) {
        let mut binds = Vec::new();
        let sql = e.build(&mut binds);
        (sql, binds)
    }

    #[test]
    fn literals_become_placeholders() {
        let (sql, binds) = render(&col("name").eq("spongebob"));
        assert_eq!(sql, "\"name\" = ?");
        assert_eq!(binds, vec![Bind::Value(Value::Text("spongebob".into()))]);
    }

    #[test]
    fn or_inside_and_is_parenthesized() {
        let e = col("a").eq(1).and(col("b").eq(2).or(col("c").eq(bind("y"))));
        let (sql, binds) = render(&e);
        assert_eq!(sql, "\"a\" = ? AND (\"b\" = ? OR \"c\" = ?)");
        assert_eq!(binds[2], Bind::Named("y".into()));
    }

    #[test]
    fn in_list_and_null_checks() {
        let (sql, binds) = render(&Expr::qualified("address", "user_id").in_list([1, 2, 3]));
        assert_eq!(sql, "\"address\".\"user_id\" IN (?, ?, ?)");
        assert_eq!(binds.len(), 3);
        let (sql, _) = render(&col("fullname").is_null().not());
        assert_eq!(sql, "NOT (\"fullname\" IS NULL)");
        let (sql, binds) = render(&col("id").in_list(Vec::<i64>::new()));
        assert_eq!(sql, "1 = 0");
        assert!(binds.is_empty());
    }

    #[test]
    fn like_binds_pattern() {
        let (sql, binds) = render(&col("email_address").like("%@aol.com"));
        assert_eq!(sql, "\"email_address\" LIKE ?");
        assert_eq!(binds, vec![Bind::Value(Value::Text("%@aol.com".into()))]);
    }

    #[test]
    fn qualified_names_are_quoted() {
        let (sql, _) = render(&Expr::qualified("a\"b", "c"));
        assert_eq!(sql, "\"a\"\"b\".\"c\"");
    }

    #[test]
    fn collects_referenced_tables() {
        let mut tables = Vec::new();
        Expr::qualified("user_account", "id")
            .eq(Expr::qualified("address", "user_id"))
            .and(Expr::qualified("user_account", "name").eq("x"))
            .tables(&mut tables);
        assert_eq!(tables, ["user_account", "address"]);
    }
}
