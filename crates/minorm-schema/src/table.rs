//! Table schemas: the column catalog shared by raw statements and entity
//! mapping.

use minorm_core::{Error, Result, quote_ident, quote_list};
use regex::Regex;
use std::sync::OnceLock;

/// Column storage types, rendered as SQLite DDL type names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Integer,
    Real,
    Text,
    /// Text with a declared maximum length
    Varchar(u32),
    Blob,
    Boolean,
    /// JSON document stored as TEXT
    Json,
}

impl SqlType {
    pub fn sql_name(self) -> String {
        match self {
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::Real => "REAL".to_string(),
            SqlType::Text | SqlType::Json => "TEXT".to_string(),
            SqlType::Varchar(n) => format!("VARCHAR({})", n),
            SqlType::Blob => "BLOB".to_string(),
            SqlType::Boolean => "BOOLEAN".to_string(),
        }
    }
}

/// Target of a foreign key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKeyRef {
    pub table: String,
    pub column: String,
}

/// One column definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub sql_type: SqlType,
    pub nullable: bool,
    pub primary_key: bool,
    pub unique: bool,
    pub foreign_key: Option<ForeignKeyRef>,
    /// SQL expression the database fills in when an insert omits the column
    pub server_default: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            nullable: false,
            primary_key: false,
            unique: false,
            foreign_key: None,
            server_default: None,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, SqlType::Integer)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, SqlType::Text)
    }

    pub fn varchar(name: impl Into<String>, len: u32) -> Self {
        Self::new(name, SqlType::Varchar(len))
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, SqlType::Real)
    }

    pub fn blob(name: impl Into<String>) -> Self {
        Self::new(name, SqlType::Blob)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, SqlType::Boolean)
    }

    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, SqlType::Json)
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Declare a foreign key to `table.column`.
    ///
    /// Foreign-key columns are nullable unless `not_null` is called after.
    pub fn references(mut self, table: impl Into<String>, column: impl Into<String>) -> Self {
        self.foreign_key = Some(ForeignKeyRef {
            table: table.into(),
            column: column.into(),
        });
        self.nullable = true;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Let the database generate the value, e.g. `CURRENT_TIMESTAMP`.
    ///
    /// Inserts leave the column out while its value is unset, and the
    /// generated value is read back on the next load.
    pub fn server_default(mut self, sql: impl Into<String>) -> Self {
        self.server_default = Some(sql.into());
        self
    }

    fn definition(&self) -> String {
        let mut def = format!("{} {}", quote_ident(&self.name), self.sql_type.sql_name());
        if !self.nullable {
            def.push_str(" NOT NULL");
        }
        if self.unique && !self.primary_key {
            def.push_str(" UNIQUE");
        }
        if let Some(default) = &self.server_default {
            def.push_str(&format!(" DEFAULT ({default})"));
        }
        def
    }
}

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap_or_else(|e| panic!("identifier pattern: {e}"))
    })
}

/// Check a table, column or relationship name.
#[allow(clippy::result_large_err)]
pub(crate) fn validate_identifier(kind: &str, name: &str, owner: Option<&str>) -> Result<()> {
    if identifier_pattern().is_match(name) {
        Ok(())
    } else {
        Err(Error::mapping(owner, format!("invalid {} name '{}'", kind, name)))
    }
}

/// A table: name plus ordered columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
}

impl TableSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    /// Append a column.
    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    pub fn get_column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Primary-key column names, in declaration order.
    pub fn primary_key(&self) -> Vec<String> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.clone())
            .collect()
    }

    /// Positions of the primary-key columns.
    pub fn primary_key_indices(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.primary_key)
            .map(|(i, _)| i)
            .collect()
    }

    /// Columns with a foreign key, paired with their target.
    pub fn foreign_keys(&self) -> impl Iterator<Item = (&Column, &ForeignKeyRef)> {
        self.columns
            .iter()
            .filter_map(|c| c.foreign_key.as_ref().map(|fk| (c, fk)))
    }

    /// Tables this table references, excluding itself.
    pub fn dependencies(&self) -> Vec<&str> {
        let mut deps: Vec<&str> = Vec::new();
        for (_, fk) in self.foreign_keys() {
            if fk.table != self.name && !deps.contains(&fk.table.as_str()) {
                deps.push(&fk.table);
            }
        }
        deps
    }

    /// Structural checks: names, a primary key, no duplicate columns.
    #[allow(clippy::result_large_err)]
    pub fn validate(&self) -> Result<()> {
        validate_identifier("table", &self.name, Some(&self.name))?;
        if self.columns.is_empty() {
            return Err(Error::mapping(Some(&self.name), "table has no columns"));
        }
        for (i, col) in self.columns.iter().enumerate() {
            validate_identifier("column", &col.name, Some(&self.name))?;
            if self.columns[..i].iter().any(|c| c.name == col.name) {
                return Err(Error::mapping(
                    Some(&self.name),
                    format!("duplicate column '{}'", col.name),
                ));
            }
            if col.primary_key && col.nullable {
                return Err(Error::mapping(
                    Some(&self.name),
                    format!("primary-key column '{}' cannot be nullable", col.name),
                ));
            }
        }
        if self.primary_key().is_empty() {
            return Err(Error::mapping(Some(&self.name), "a primary-key column is mandatory"));
        }
        Ok(())
    }

    /// `CREATE TABLE IF NOT EXISTS` for this table.
    pub fn create_sql(&self) -> String {
        let mut parts: Vec<String> = self.columns.iter().map(Column::definition).collect();
        parts.push(format!("PRIMARY KEY ({})", quote_list(&self.primary_key())));
        for (col, fk) in self.foreign_keys() {
            parts.push(format!(
                "FOREIGN KEY ({}) REFERENCES {} ({})",
                quote_ident(&col.name),
                quote_ident(&fk.table),
                quote_ident(&fk.column)
            ));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  {}\n)",
            quote_ident(&self.name),
            parts.join(",\n  ")
        )
    }

    pub fn drop_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS {}", quote_ident(&self.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn address() -> TableSchema {
        TableSchema::new("address")
            .column(Column::integer("id").primary_key())
            .column(Column::text("email_address"))
            .column(Column::integer("user_id").references("user_account", "id"))
    }

    #[test]
    fn create_sql_lists_keys_after_columns() {
        assert_eq!(
            address().create_sql(),
            "CREATE TABLE IF NOT EXISTS \"address\" (\n  \
             \"id\" INTEGER NOT NULL,\n  \
             \"email_address\" TEXT NOT NULL,\n  \
             \"user_id\" INTEGER,\n  \
             PRIMARY KEY (\"id\"),\n  \
             FOREIGN KEY (\"user_id\") REFERENCES \"user_account\" (\"id\")\n)"
        );
    }

    #[test]
    fn varchar_and_unique_render() {
        let t = TableSchema::new("user_account")
            .column(Column::integer("id").primary_key())
            .column(Column::varchar("name", 30).unique())
            .column(Column::text("fullname").nullable());
        let sql = t.create_sql();
        assert!(sql.contains("\"name\" VARCHAR(30) NOT NULL UNIQUE"));
        assert!(sql.contains("\"fullname\" TEXT,"));
    }

    #[test]
    fn server_default_renders_as_parenthesized_default() {
        let t = TableSchema::new("user_account")
            .column(Column::integer("id").primary_key())
            .column(Column::text("created_at").server_default("CURRENT_TIMESTAMP"));
        assert!(t.create_sql().contains("\"created_at\" TEXT NOT NULL DEFAULT (CURRENT_TIMESTAMP),"));
    }

    #[test]
    fn missing_primary_key_is_rejected() {
        let t = TableSchema::new("t").column(Column::text("x"));
        let err = t.validate().unwrap_err();
        assert!(err.to_string().contains("primary-key column is mandatory"));
    }

    #[test]
    fn invalid_identifiers_are_rejected() {
        let t = TableSchema::new("bad name").column(Column::integer("id").primary_key());
        assert!(matches!(t.validate(), Err(Error::Mapping(_))));
        let t = TableSchema::new("t")
            .column(Column::integer("id").primary_key())
            .column(Column::text("x\"y"));
        assert!(matches!(t.validate(), Err(Error::Mapping(_))));
    }

    #[test]
    fn duplicate_column_is_rejected() {
        let t = TableSchema::new("t")
            .column(Column::integer("id").primary_key())
            .column(Column::text("id"));
        assert!(t.validate().unwrap_err().to_string().contains("duplicate column"));
    }

    #[test]
    fn self_reference_is_not_a_dependency() {
        let t = TableSchema::new("node")
            .column(Column::integer("id").primary_key())
            .column(Column::integer("parent_id").references("node", "id"))
            .column(Column::integer("owner_id").references("user_account", "id"));
        assert_eq!(t.dependencies(), ["user_account"]);
    }
}
