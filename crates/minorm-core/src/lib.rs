//! Core types for minorm.
//!
//! `minorm-core` is the **foundation layer** of the workspace:
//!
//! - **Values and rows**: `Value`, `Row`, `ColumnInfo`, `FromValue`.
//! - **Parameters**: `ParameterSet`, `Params`, the `params!` macro.
//! - **Driver boundary**: the `Driver` trait every database backend implements.
//! - **Connection**: explicit begin/commit/rollback/close state machine with
//!   cancellation safety.
//! - **Executor**: `Connection::execute` for single and batched parameter sets.
//! - **Cursors**: forward-only `Cursor`, `ScalarCursor`, `MappingCursor`.
//! - **Errors**: the `Error` taxonomy shared by every crate.
//!
//! Statement builders (`minorm-query`), schema mapping (`minorm-schema`) and
//! sessions (`minorm-session`) are layered on top.

pub mod connection;
pub mod cursor;
pub mod driver;
pub mod error;
mod executor;
pub mod identifiers;
pub mod params;
pub mod row;
pub mod statement;
pub mod value;

#[cfg(test)]
pub(crate) mod testing;

pub use connection::Connection;
pub use cursor::{Cursor, Fetch, MappingCursor, ResultRow, RowMapping, ScalarCursor};
pub use driver::{Driver, DriverResult};
pub use error::{Error, Result};
pub use identifiers::{quote_ident, quote_list, quote_qualified};
pub use params::{ParameterSet, Params};
pub use row::{ColumnInfo, FromValue, Row};
pub use statement::{Bind, Compiled, Executable, StatementKind};
pub use value::Value;
