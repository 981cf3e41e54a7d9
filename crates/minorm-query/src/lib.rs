//! Statement builders for minorm.
//!
//! Every builder method consumes the statement and returns the extended one;
//! clone a statement to branch from it. All builders implement
//! [`minorm_core::Executable`] and compile to SQL with positional `?`
//! placeholders.
//!
//! - [`select`] / [`select_entity`] with joins, predicates, ordering, limits
//!   and relationship [`LoadOption`]s
//! - [`union_all`] / [`union`] compound selects, and derived tables via
//!   [`Select::subquery`]
//! - [`insert`], [`update`], [`delete`] against a table schema, including
//!   INSERT from a select
//! - [`text`] for textual SQL with `:name` parameters
//!
//! ```ignore
//! let stmt = select_entity(&user)
//!     .where_(Expr::qualified("user_account", "id").gt(1))
//!     .order_by(Expr::qualified("user_account", "name"))
//!     .options(selectinload("addresses"));
//! ```

pub mod builder;
pub mod clause;
pub mod eager;
pub mod expr;
pub mod select;
pub mod set_ops;
pub mod subquery;
pub mod text;

pub use builder::{Delete, Insert, Update, delete, insert, update};
pub use clause::{Join, JoinType, OrderBy, OrderDirection};
pub use eager::{LoadOption, contains_eager, joinedload, lazyload, selectinload};
pub use expr::{BinaryOp, Expr, bind, col, lit};
pub use select::{Select, SelectItem, select, select_entity};
pub use set_ops::{CompoundSelect, SetOpType, union, union_all};
pub use subquery::Subquery;
pub use text::{TextStatement, text};
