//! Textual SQL with `:name` bind parameters.
//!
//! Placeholders are rewritten to positional `?` and resolved by name at
//! execution time. Quoted strings, quoted identifiers and `::` casts are left
//! alone, so `':x'` or `a::text` never become binds.

use minorm_core::{Bind, Compiled, Executable, ParameterSet, Result, StatementKind, Value};
use regex::Regex;
use std::sync::OnceLock;

/// A textual statement.
#[derive(Debug, Clone, PartialEq)]
pub struct TextStatement {
    sql: String,
    names: Vec<String>,
    kind: StatementKind,
    table: Option<String>,
    bound: ParameterSet,
}

/// Textual SQL; literal values must go through `:name` parameters.
pub fn text(sql: impl Into<String>) -> TextStatement {
    let source = sql.into();
    let (sql, names) = rewrite_placeholders(&source);
    let (kind, table) = classify(&source);
    TextStatement {
        sql,
        names,
        kind,
        table,
        bound: ParameterSet::new(),
    }
}

impl TextStatement {
    /// Bind a value into the statement itself. Values in the execution's
    /// parameter set take precedence.
    pub fn bind_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.bound.set(name, value);
        self
    }

    /// SQL after placeholder rewriting.
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Bind names in placeholder order (repeats included).
    pub fn bind_names(&self) -> &[String] {
        &self.names
    }

    pub fn kind(&self) -> StatementKind {
        self.kind
    }
}

impl Executable for TextStatement {
    fn compile(&self, shape: Option<&ParameterSet>) -> Result<Compiled> {
        let binds = self
            .names
            .iter()
            .map(|name| {
                let supplied = shape.is_some_and(|s| s.contains(name));
                match self.bound.get(name) {
                    Some(value) if !supplied => Bind::Value(value.clone()),
                    _ => Bind::Named(name.clone()),
                }
            })
            .collect();
        let mut compiled = Compiled::new(self.kind, self.sql.clone()).with_binds(binds);
        if let Some(table) = &self.table {
            compiled = compiled.with_table(table);
        }
        Ok(compiled)
    }
}

fn rewrite_placeholders(source: &str) -> (String, Vec<String>) {
    let mut sql = String::with_capacity(source.len());
    let mut names = Vec::new();
    let mut chars = source.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            sql.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' | '`' => {
                quote = Some(c);
                sql.push(c);
            }
            ':' if chars.peek() == Some(&':') => {
                sql.push_str("::");
                chars.next();
            }
            ':' if chars.peek().is_some_and(|n| n.is_ascii_alphabetic() || *n == '_') => {
                let mut name = String::new();
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        name.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                sql.push('?');
                names.push(name);
            }
            _ => sql.push(c),
        }
    }
    (sql, names)
}

fn target_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r#"(?is)^\s*(select|with|insert|replace|update|delete|create|drop|alter)\b(?:(?:.*?\b(?:into|from|table)\s+|\s+)(?:if\s+(?:not\s+)?exists\s+)?"?([A-Za-z_][A-Za-z0-9_]*)"?)?"#,
        )
        .unwrap_or_else(|e| panic!("statement pattern: {e}"))
    })
}

/// Statement kind and, for writes, the target table.
fn classify(sql: &str) -> (StatementKind, Option<String>) {
    let Some(caps) = target_pattern().captures(sql) else {
        return (StatementKind::Text, None);
    };
    let keyword = caps.get(1).map_or("", |m| m.as_str()).to_ascii_lowercase();
    let table = caps.get(2).map(|m| m.as_str().to_string());
    match keyword.as_str() {
        "select" | "with" => (StatementKind::Select, None),
        "insert" | "replace" => (StatementKind::Insert, table),
        "update" => (StatementKind::Update, table),
        "delete" => (StatementKind::Delete, table),
        _ => (StatementKind::Ddl, table),
    }
}
