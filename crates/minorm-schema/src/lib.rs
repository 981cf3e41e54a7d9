//! Schema description and entity mapping for minorm.
//!
//! Tables are described as data ([`TableSchema`], [`Column`]); entity types
//! bind one table plus named [`Relationship`]s. A [`MapperBuilder`] validates
//! registrations and resolves relationships into an immutable [`Mapper`],
//! which also knows the foreign-key order used by [`create_all`] and
//! [`drop_all`].
//!
//! ```ignore
//! let mapper = Mapper::builder()
//!     .register(EntityType::new("User", user_table)
//!         .relationship(Relationship::many("addresses", "Address").back_populates("user")))?
//!     .register(EntityType::new("Address", address_table)
//!         .relationship(Relationship::one("user", "User").back_populates("addresses")))?
//!     .build()?;
//! create_all(&mapper, &mut conn).await?;
//! ```

pub mod create;
pub mod mapper;
pub mod table;

pub use create::{create_all, create_statements, drop_all, drop_statements};
pub use mapper::{
    Cardinality, EntityType, KeySide, Mapper, MapperBuilder, Relationship, RelationshipInfo,
};
pub use table::{Column, ForeignKeyRef, SqlType, TableSchema};
