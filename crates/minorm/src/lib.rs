//! minorm - a small relational persistence layer.
//!
//! minorm provides:
//!
//! - Connections with explicit, connection-scoped transactions
//! - Parameterized statement execution, single or batched
//! - Declarative table and entity mapping with relationships
//! - Sessions with an identity map, change tracking and a unit of work
//! - Lazy, joined and select-in relationship loading
//!
//! # Quick Start
//!
//! ```ignore
//! use minorm::prelude::*;
//!
//! let mapper = Mapper::builder()
//!     .register(
//!         EntityType::new(
//!             "User",
//!             TableSchema::new("user_account")
//!                 .column(Column::integer("id").primary_key())
//!                 .column(Column::varchar("name", 30)),
//!         ),
//!     )?
//!     .build()?;
//!
//! let mut session = SessionBuilder::new(mapper.clone())
//!     .dsn("sqlite::memory:")?
//!     .create_all(true)
//!     .build()
//!     .await?;
//!
//! let spongebob = EntityRef::with_values(&mapper, "User", [("name", "spongebob")])?;
//! session.add(&spongebob)?;
//! session.commit().await?;
//!
//! let user = mapper.require("User")?.clone();
//! let users = session
//!     .entities(&select_entity(&user).order_by(Expr::qualified("user_account", "id")), ())
//!     .await?;
//! ```
//!
//! # Crates
//!
//! - `minorm-core`: values, rows, errors, the driver boundary, connections
//!   and cursors
//! - `minorm-schema`: tables, entities, the mapper and DDL
//! - `minorm-query`: statement builders and textual SQL
//! - `minorm-session`: sessions and entity instances
//! - `minorm-sqlite`: the SQLite driver

pub use minorm_core::error::{
    ConfigError, ConnectionError, ConnectionErrorKind, DependencyError, IdentityConflictError,
    MappingError, OperationContext, QueryError, QueryErrorKind, StateError, StateErrorKind,
    TypeError,
};
pub use minorm_core::{
    ColumnInfo, Compiled, Connection, Cursor, Driver, DriverResult, Error, Executable, Fetch,
    FromValue, MappingCursor, ParameterSet, Params, Result, ResultRow, Row, RowMapping,
    ScalarCursor, StatementKind, Value, params, quote_ident,
};

pub use minorm_schema::{
    Cardinality, Column, EntityType, ForeignKeyRef, KeySide, Mapper, MapperBuilder, Relationship,
    RelationshipInfo, SqlType, TableSchema, create_all, create_statements, drop_all,
    drop_statements,
};

pub use minorm_query::{
    BinaryOp, CompoundSelect, Delete, Expr, Insert, Join, JoinType, LoadOption, OrderBy,
    OrderDirection, Select, SelectItem, SetOpType, Subquery, TextStatement, Update, bind, col,
    contains_eager, delete, insert, joinedload, lazyload, lit, select, select_entity, selectinload,
    text, union, union_all, update,
};

pub use minorm_session::{
    EntityRef, FlushResult, IdentityKey, IdentityMap, Item, Lifecycle, OrmRow, Session,
    SessionConfig, SessionExecutable, SessionState,
};

pub use minorm_sqlite::{OpenFlags, SqliteConfig, SqliteDriver};

pub mod session;
pub use session::SessionBuilder;

/// Open a SQLite connection from a DSN such as `sqlite::memory:` or
/// `sqlite:///app.db?foreign_keys=on`.
#[tracing::instrument(level = "debug")]
pub async fn connect(dsn: &str) -> Result<Connection<SqliteDriver>> {
    let config = SqliteConfig::from_dsn(dsn)?;
    Connection::open(&config).await
}

pub mod prelude {
    pub use crate::{
        // Core
        Connection,
        Error,
        Fetch,
        Result,
        Row,
        Value,
        params,
        // Schema
        Column,
        EntityType,
        Mapper,
        Relationship,
        TableSchema,
        create_all,
        drop_all,
        // Statements
        Expr,
        Join,
        OrderBy,
        Select,
        delete,
        insert,
        select,
        select_entity,
        text,
        union_all,
        update,
        // Loading
        contains_eager,
        joinedload,
        lazyload,
        selectinload,
        // Session
        EntityRef,
        Item,
        Lifecycle,
        Session,
        SessionBuilder,
        SessionConfig,
        // SQLite
        SqliteConfig,
        SqliteDriver,
        connect,
    };
}
