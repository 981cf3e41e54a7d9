//! Connection configuration and DSN parsing.
//!
//! Accepted DSNs:
//!
//! | DSN | database |
//! |-----|----------|
//! | `sqlite::memory:` | private in-memory database |
//! | `sqlite://` or `sqlite:///:memory:` | private in-memory database |
//! | `sqlite:///data/app.db` | `data/app.db`, relative to the working directory |
//! | `sqlite:////var/app.db` | `/var/app.db` |
//! | `sqlite://data/app.db` | `data/app.db` |
//!
//! Query options: `mode=ro|rw|rwc`, `busy_timeout=<ms>`,
//! `foreign_keys=on|off`, `echo=true|false`, `returning=native|select`.

use libsqlite3_sys as ffi;
use minorm_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ffi::c_int;
use std::str::FromStr;

pub(crate) const MEMORY: &str = ":memory:";

/// Configuration for opening a SQLite database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteConfig {
    /// Path to the database file, or ":memory:" for an in-memory database.
    pub path: String,
    /// Open flags (read-only, read-write, create)
    pub flags: OpenFlags,
    /// Busy timeout in milliseconds.
    pub busy_timeout_ms: u32,
    /// Enforce foreign key constraints (`PRAGMA foreign_keys = ON`).
    pub foreign_keys: bool,
    /// Log statement text at `info` level.
    pub echo: bool,
    /// Use `INSERT ... RETURNING` instead of a select-after-insert.
    pub native_returning: bool,
}

/// Flags controlling how the database is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenFlags {
    /// Open for reading only.
    pub read_only: bool,
    /// Open for reading and writing.
    pub read_write: bool,
    /// Create the database if it doesn't exist.
    pub create: bool,
    /// Enable URI filename interpretation.
    pub uri: bool,
}

impl OpenFlags {
    /// Create flags for read-only access.
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Default::default()
        }
    }

    /// Create flags for read-write access (database must exist).
    pub fn read_write() -> Self {
        Self {
            read_write: true,
            ..Default::default()
        }
    }

    /// Create flags for read-write access with creation if needed.
    pub fn create_read_write() -> Self {
        Self {
            read_write: true,
            create: true,
            ..Default::default()
        }
    }

    pub(crate) fn to_sqlite_flags(self) -> c_int {
        let mut flags = 0;
        if self.read_only {
            flags |= ffi::SQLITE_OPEN_READONLY;
        }
        if self.read_write {
            flags |= ffi::SQLITE_OPEN_READWRITE;
        }
        if self.create {
            flags |= ffi::SQLITE_OPEN_CREATE;
        }
        if self.uri {
            flags |= ffi::SQLITE_OPEN_URI;
        }

        // Default to read-write if no mode specified
        if flags & (ffi::SQLITE_OPEN_READONLY | ffi::SQLITE_OPEN_READWRITE) == 0 {
            flags |= ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE;
        }
        flags
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: MEMORY.to_string(),
            flags: OpenFlags::create_read_write(),
            busy_timeout_ms: 5000,
            foreign_keys: true,
            echo: false,
            native_returning: false,
        }
    }
}

impl SqliteConfig {
    /// A file-based database.
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    /// An in-memory database.
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn flags(mut self, flags: OpenFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn busy_timeout(mut self, ms: u32) -> Self {
        self.busy_timeout_ms = ms;
        self
    }

    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn native_returning(mut self, native: bool) -> Self {
        self.native_returning = native;
        self
    }

    pub fn is_memory(&self) -> bool {
        self.path == MEMORY
    }

    /// Parse a `sqlite:` DSN.
    #[allow(clippy::result_large_err)]
    pub fn from_dsn(dsn: &str) -> Result<Self> {
        let rest = dsn
            .strip_prefix("sqlite:")
            .ok_or_else(|| Error::config(format!("unsupported DSN '{}': expected a sqlite: URL", dsn)))?;
        let (location, query) = match rest.split_once('?') {
            Some((location, query)) => (location, Some(query)),
            None => (rest, None),
        };

        let path = if location == MEMORY {
            MEMORY.to_string()
        } else if let Some(path) = location.strip_prefix("//") {
            let path = path.strip_prefix('/').unwrap_or(path);
            if path.is_empty() { MEMORY.to_string() } else { path.to_string() }
        } else {
            return Err(Error::config(format!(
                "malformed DSN '{}': expected sqlite::memory: or sqlite://<path>",
                dsn
            )));
        };

        let mut config = Self::file(path);
        for option in query.into_iter().flat_map(|q| q.split('&')).filter(|o| !o.is_empty()) {
            let (key, value) = option
                .split_once('=')
                .ok_or_else(|| Error::config(format!("DSN option '{}' has no value", option)))?;
            config.apply_option(key, value)?;
        }
        Ok(config)
    }

    /// Parse a JSON document with the fields of this struct.
    #[allow(clippy::result_large_err)]
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::config(format!("invalid SQLite config: {}", e)))
    }

    #[allow(clippy::result_large_err)]
    fn apply_option(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "mode" => {
                self.flags = match value {
                    "ro" => OpenFlags::read_only(),
                    "rw" => OpenFlags::read_write(),
                    "rwc" => OpenFlags::create_read_write(),
                    _ => return Err(invalid_option(key, value)),
                };
            }
            "busy_timeout" => {
                self.busy_timeout_ms = value.parse().map_err(|_| invalid_option(key, value))?;
            }
            "foreign_keys" => self.foreign_keys = parse_flag(key, value)?,
            "echo" => self.echo = parse_flag(key, value)?,
            "returning" => {
                self.native_returning = match value {
                    "native" => true,
                    "select" => false,
                    _ => return Err(invalid_option(key, value)),
                };
            }
            _ => return Err(Error::config(format!("unknown DSN option '{}'", key))),
        }
        Ok(())
    }
}

impl FromStr for SqliteConfig {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_dsn(s)
    }
}

#[allow(clippy::result_large_err)]
fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" | "yes" => Ok(true),
        "off" | "false" | "0" | "no" => Ok(false),
        _ => Err(invalid_option(key, value)),
    }
}

fn invalid_option(key: &str, value: &str) -> Error {
    Error::config(format!("invalid value '{}' for DSN option '{}'", value, key))
}
