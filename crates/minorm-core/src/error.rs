//! Error types for minorm operations.

use crate::statement::StatementKind;
use crate::value::Value;
use std::fmt;

/// The primary error type for all minorm operations.
#[derive(Debug)]
pub enum Error {
    /// Driver handle unreachable, lost, closed or invalidated
    Connection(ConnectionError),
    /// Transaction or session lifecycle misuse
    State(StateError),
    /// Statement rejected by the database
    Query(QueryError),
    /// Schema registration misuse
    Mapping(MappingError),
    /// Unresolvable foreign-key ordering
    Dependency(DependencyError),
    /// Two loaded rows disagree about one identity
    IdentityConflict(IdentityConflictError),
    /// Value conversion errors
    Type(TypeError),
    /// Configuration errors
    Config(ConfigError),
    /// An error whose rollback fallback failed as well
    Secondary {
        /// The error that ended the transaction
        error: Box<Error>,
        /// The failure of the fallback rollback
        secondary: Box<Error>,
    },
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to open the driver handle
    Connect,
    /// Handle lost during operation
    Disconnected,
    /// A statement was cancelled mid-flight; the connection must be reopened
    Invalidated,
    /// The connection was already closed
    Closed,
}

#[derive(Debug)]
pub struct StateError {
    pub kind: StateErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateErrorKind {
    /// `begin` while a transaction is active
    TransactionActive,
    /// Operation requires an active transaction
    NoTransaction,
    /// A failed statement left the transaction rollback-only
    RollbackOnly,
    /// The session has ended
    SessionClosed,
    /// Attribute read on an expired instance
    Expired,
    /// Relationship read before it was loaded
    NotLoaded,
    /// Instance is in the wrong lifecycle state for the operation
    Lifecycle,
    /// A named bind had no value in the parameter set
    MissingParameter,
    /// Result did not have the requested shape (`one()` etc.)
    ResultShape,
    /// Cursor view mode cannot change after the first fetch
    ViewMode,
}

/// Where a statement failure happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationContext {
    pub kind: StatementKind,
    pub table: Option<String>,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    /// Driver diagnostic text
    pub message: String,
    /// Driver result code, if any
    pub code: Option<i32>,
    pub sql: Option<String>,
    pub context: Option<OperationContext>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Malformed statement
    Syntax,
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// The requested behavior cannot be expressed for this statement
    Unsupported,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct MappingError {
    pub entity: Option<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct DependencyError {
    /// Tables participating in the cycle
    pub tables: Vec<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct IdentityConflictError {
    pub entity: String,
    pub key: String,
    pub column: String,
    pub existing: Value,
    pub incoming: Value,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl Error {
    /// Build a state error.
    pub fn state(kind: StateErrorKind, message: impl Into<String>) -> Self {
        Error::State(StateError {
            kind,
            message: message.into(),
        })
    }

    /// Build a mapping error.
    pub fn mapping(entity: Option<&str>, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError {
            entity: entity.map(str::to_string),
            message: message.into(),
        })
    }

    /// Build a connection error without a source.
    pub fn connection(kind: ConnectionErrorKind, message: impl Into<String>) -> Self {
        Error::Connection(ConnectionError {
            kind,
            message: message.into(),
            source: None,
        })
    }

    /// Build a query error that did not come from the driver.
    pub fn query(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Error::Query(QueryError {
            kind,
            message: message.into(),
            code: None,
            sql: None,
            context: None,
            source: None,
        })
    }

    /// Build a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
        })
    }

    /// Attach the statement kind and target table to a query error.
    ///
    /// Context already present is kept.
    #[must_use]
    pub fn with_context(mut self, kind: StatementKind, table: Option<&str>) -> Self {
        if let Error::Query(q) = &mut self {
            if q.context.is_none() {
                q.context = Some(OperationContext {
                    kind,
                    table: table.map(str::to_string),
                });
            }
        }
        self
    }

    /// Attach the failure of a fallback operation to this error.
    #[must_use]
    pub fn with_secondary(self, secondary: Error) -> Self {
        Error::Secondary {
            error: Box::new(self),
            secondary: Box::new(secondary),
        }
    }

    /// The error that started it all, looking through attached secondaries.
    pub fn primary(&self) -> &Error {
        match self {
            Error::Secondary { error, .. } => error.primary(),
            e => e,
        }
    }

    /// The fallback failure attached to this error, if any.
    pub fn secondary(&self) -> Option<&Error> {
        match self {
            Error::Secondary { secondary, .. } => Some(secondary),
            _ => None,
        }
    }

    pub fn query_kind(&self) -> Option<QueryErrorKind> {
        match self.primary() {
            Error::Query(q) => Some(q.kind),
            _ => None,
        }
    }

    pub fn state_kind(&self) -> Option<StateErrorKind> {
        match self.primary() {
            Error::State(s) => Some(s.kind),
            _ => None,
        }
    }

    pub fn is_constraint(&self) -> bool {
        self.query_kind() == Some(QueryErrorKind::Constraint)
    }

    pub fn is_syntax(&self) -> bool {
        self.query_kind() == Some(QueryErrorKind::Syntax)
    }

    pub fn is_state(&self) -> bool {
        matches!(self.primary(), Error::State(_))
    }

    pub fn is_connection(&self) -> bool {
        matches!(self.primary(), Error::Connection(_))
    }

    /// Statement failures after which the transaction may only be rolled back.
    pub fn poisons_transaction(&self) -> bool {
        matches!(
            self.query_kind(),
            Some(QueryErrorKind::Syntax | QueryErrorKind::Constraint | QueryErrorKind::Database)
        )
    }

    /// The statement context recorded on a query error.
    pub fn context(&self) -> Option<&OperationContext> {
        match self.primary() {
            Error::Query(q) => q.context.as_ref(),
            _ => None,
        }
    }
}

impl fmt::Display for OperationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{} on {}", self.kind, table),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::State(e) => write!(f, "State error: {}", e.message),
            Error::Query(e) => {
                let kind = match e.kind {
                    QueryErrorKind::Syntax => "Syntax error",
                    QueryErrorKind::Constraint => "Constraint error",
                    QueryErrorKind::Unsupported => "Unsupported statement",
                    QueryErrorKind::Database => "Query error",
                };
                match &e.context {
                    Some(ctx) => write!(f, "{} ({}): {}", kind, ctx, e.message),
                    None => write!(f, "{}: {}", kind, e.message),
                }
            }
            Error::Mapping(e) => match &e.entity {
                Some(entity) => write!(f, "Mapping error for '{}': {}", entity, e.message),
                None => write!(f, "Mapping error: {}", e.message),
            },
            Error::Dependency(e) => {
                write!(f, "Dependency error: {} [{}]", e.message, e.tables.join(", "))
            }
            Error::IdentityConflict(e) => write!(
                f,
                "Identity conflict for {}{}: column '{}' is {} in the identity map but {} in the loaded row",
                e.entity, e.key, e.column, e.existing, e.incoming
            ),
            Error::Type(e) => {
                if let Some(col) = &e.column {
                    write!(
                        f,
                        "Type error in column '{}': expected {}, found {}",
                        col, e.expected, e.actual
                    )
                } else {
                    write!(f, "Type error: expected {}, found {}", e.expected, e.actual)
                }
            }
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Secondary { error, secondary } => {
                write!(f, "{} (rollback also failed: {})", error, secondary)
            }
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e.source.as_ref().map(|e| e.as_ref() as _),
            Error::Query(e) => e.source.as_ref().map(|e| e.as_ref() as _),
            Error::Secondary { secondary, .. } => Some(secondary.as_ref()),
            _ => None,
        }
    }
}

impl From<StateError> for Error {
    fn from(err: StateError) -> Self {
        Error::State(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<DependencyError> for Error {
    fn from(err: DependencyError) -> Self {
        Error::Dependency(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::config(err.to_string())
    }
}

/// Result type alias for minorm operations.
pub type Result<T> = std::result::Result<T, Error>;
