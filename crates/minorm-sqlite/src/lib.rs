//! SQLite driver for minorm.
//!
// FFI bindings require unsafe code - this is expected for database drivers
#![allow(unsafe_code)]
//!
//! This crate implements the `Driver` trait from minorm-core on top of
//! `libsqlite3-sys` (SQLite is compiled from the bundled amalgamation).
//!
//! # Features
//!
//! - In-memory and file-based databases, opened from a DSN or a config struct
//! - Foreign key enforcement on by default
//! - Constraint and syntax failures reported as typed query errors
//! - Optional native `INSERT ... RETURNING`
//!
//! # Example
//!
//! ```rust,ignore
//! use minorm_core::Connection;
//! use minorm_sqlite::{SqliteConfig, SqliteDriver};
//!
//! let config: SqliteConfig = "sqlite::memory:?echo=true".parse()?;
//! let mut conn = Connection::<SqliteDriver>::open(&config).await?;
//! ```
//!
//! # Type Mapping
//!
//! | minorm `Value` | SQLite storage class |
//! |----------------|----------------------|
//! | `Null` | NULL |
//! | `Bool` | INTEGER (0/1) |
//! | `Int` | INTEGER |
//! | `Double` | REAL |
//! | `Text` | TEXT |
//! | `Bytes` | BLOB |
//! | `Json` | TEXT (serialized) |

pub mod config;
pub mod driver;
mod types;

pub use config::{OpenFlags, SqliteConfig};
pub use driver::SqliteDriver;

use libsqlite3_sys as ffi;
use std::ffi::CStr;

/// Version string of the linked SQLite library.
pub fn sqlite_version() -> &'static str {
    // SAFETY: sqlite3_libversion returns a static NUL-terminated string
    unsafe { CStr::from_ptr(ffi::sqlite3_libversion()) }
        .to_str()
        .unwrap_or("unknown")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_reported() {
        assert!(sqlite_version().starts_with('3'));
    }
}
