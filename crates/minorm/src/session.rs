//! Building sessions over SQLite.
//!
//! # Example
//!
//! ```rust,ignore
//! use minorm::prelude::*;
//!
//! let session = SessionBuilder::new(mapper)
//!     .dsn("sqlite:///tutorial.db?foreign_keys=on")?
//!     .config(SessionConfig { expire_on_commit: false, ..SessionConfig::default() })
//!     .create_all(true)
//!     .build()
//!     .await?;
//! ```

use minorm_core::{Connection, Error, Result};
use minorm_schema::Mapper;
use minorm_session::{Session, SessionConfig};
use minorm_sqlite::{SqliteConfig, SqliteDriver};
use std::sync::Arc;

/// Builder for a [`Session`] on its own SQLite connection.
#[derive(Debug)]
pub struct SessionBuilder {
    mapper: Arc<Mapper>,
    sqlite: SqliteConfig,
    config: SessionConfig,
    create_all: bool,
}

impl SessionBuilder {
    /// A builder for an in-memory database with default session settings.
    pub fn new(mapper: Arc<Mapper>) -> Self {
        Self {
            mapper,
            sqlite: SqliteConfig::memory(),
            config: SessionConfig::default(),
            create_all: false,
        }
    }

    /// Connect to the database named by a `sqlite:` DSN.
    #[allow(clippy::result_large_err)]
    pub fn dsn(mut self, dsn: &str) -> Result<Self> {
        self.sqlite = SqliteConfig::from_dsn(dsn)?;
        Ok(self)
    }

    pub fn sqlite(mut self, config: SqliteConfig) -> Self {
        self.sqlite = config;
        self
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Session settings from a JSON document; missing fields keep their
    /// defaults.
    #[allow(clippy::result_large_err)]
    pub fn config_json(mut self, json: &str) -> Result<Self> {
        self.config =
            serde_json::from_str(json).map_err(|e| Error::config(format!("invalid session config: {}", e)))?;
        Ok(self)
    }

    /// Create every mapped table (if missing) before handing out the session.
    pub fn create_all(mut self, create: bool) -> Self {
        self.create_all = create;
        self
    }

    /// Open the connection and build the session.
    pub async fn build(self) -> Result<Session<SqliteDriver>> {
        let mut conn = Connection::<SqliteDriver>::open(&self.sqlite).await?;
        if self.create_all {
            if let Err(err) = minorm_schema::create_all(&self.mapper, &mut conn).await {
                return Err(match conn.close().await {
                    Ok(()) => err,
                    Err(secondary) => err.with_secondary(secondary),
                });
            }
        }
        tracing::debug!(path = %self.sqlite.path, create_all = self.create_all, "session built");
        Ok(Session::with_config(conn, self.mapper, self.config))
    }
}
