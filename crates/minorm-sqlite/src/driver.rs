//! The SQLite driver.
//!
//! One [`SqliteDriver`] owns one `sqlite3*` handle behind a mutex. Every call
//! runs the FFI work on tokio's blocking pool, so a statement is a single
//! suspension point and the async runtime never blocks on SQLite.

use crate::config::SqliteConfig;
use crate::types;
use libsqlite3_sys as ffi;
use minorm_core::error::{ConnectionError, ConnectionErrorKind, QueryError, QueryErrorKind};
use minorm_core::{Driver, DriverResult, Error, Result, Value};
use std::ffi::{CStr, CString, c_int};
use std::future::Future;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Raw handle state. `db` is null once closed.
struct SqliteInner {
    db: *mut ffi::sqlite3,
}

// SAFETY: the handle is opened in SQLite's default serialized threading mode
// and every access goes through the Mutex in `SqliteDriver`.
unsafe impl Send for SqliteInner {}

/// A driver handle on one SQLite database.
pub struct SqliteDriver {
    inner: Arc<Mutex<SqliteInner>>,
    path: String,
    echo: bool,
    native_returning: bool,
}

impl SqliteDriver {
    /// Open a database synchronously.
    #[allow(clippy::result_large_err)]
    pub fn open_sync(config: &SqliteConfig) -> Result<Self> {
        let c_path = CString::new(config.path.as_str()).map_err(|_| {
            Error::connection(ConnectionErrorKind::Connect, "Invalid path: contains null byte")
        })?;

        let mut db: *mut ffi::sqlite3 = ptr::null_mut();
        let flags = config.flags.to_sqlite_flags();

        // SAFETY: We pass valid pointers and check the return value
        let rc = unsafe { ffi::sqlite3_open_v2(c_path.as_ptr(), &mut db, flags, ptr::null()) };

        if rc != ffi::SQLITE_OK {
            let msg = if db.is_null() {
                error_string(rc)
            } else {
                // SAFETY: db is valid even on failure and must still be closed
                unsafe {
                    let msg = errmsg(db);
                    ffi::sqlite3_close(db);
                    msg
                }
            };
            return Err(Error::connection(
                ConnectionErrorKind::Connect,
                format!("Failed to open database '{}': {}", config.path, msg),
            ));
        }

        let inner = SqliteInner { db };
        if config.busy_timeout_ms > 0 {
            // SAFETY: db is valid
            unsafe {
                ffi::sqlite3_busy_timeout(db, c_int::try_from(config.busy_timeout_ms).unwrap_or(c_int::MAX));
            }
        }
        if config.foreign_keys {
            inner.execute_raw("PRAGMA foreign_keys = ON").map_err(|e| {
                Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Connect,
                    message: "could not enable foreign key enforcement".to_string(),
                    source: Some(Box::new(e)),
                })
            })?;
        }

        tracing::debug!(path = %config.path, foreign_keys = config.foreign_keys, "sqlite database opened");
        if config.echo {
            tracing::info!(path = %config.path, "sqlite connection opened with statement echo");
        }

        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
            path: config.path.clone(),
            echo: config.echo,
            native_returning: config.native_returning,
        })
    }

    /// Get the database path.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, SqliteInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against the open handle on the blocking pool.
    fn with_handle<T, F>(&self, f: F) -> impl Future<Output = Result<T>> + Send + 'static
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteInner) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        async move {
            tokio::task::spawn_blocking(move || {
                let mut guard = inner.lock().unwrap_or_else(PoisonError::into_inner);
                if guard.db.is_null() {
                    return Err(closed());
                }
                f(&mut guard)
            })
            .await
            .map_err(|e| {
                Error::Connection(ConnectionError {
                    kind: ConnectionErrorKind::Disconnected,
                    message: "sqlite worker task failed".to_string(),
                    source: Some(Box::new(e)),
                })
            })?
        }
    }
}

impl Driver for SqliteDriver {
    type Config = SqliteConfig;

    fn open(config: &SqliteConfig) -> impl Future<Output = Result<Self>> + Send {
        let config = config.clone();
        async move {
            tokio::task::spawn_blocking(move || Self::open_sync(&config))
                .await
                .map_err(|e| {
                    Error::Connection(ConnectionError {
                        kind: ConnectionErrorKind::Connect,
                        message: "sqlite open task failed".to_string(),
                        source: Some(Box::new(e)),
                    })
                })?
        }
    }

    fn execute(&self, sql: &str, params: &[Value]) -> impl Future<Output = Result<DriverResult>> + Send {
        let sql = sql.to_string();
        let params = params.to_vec();
        self.with_handle(move |inner| inner.run(&sql, &params))
    }

    fn begin(&self) -> impl Future<Output = Result<()>> + Send {
        self.with_handle(|inner| inner.execute_raw("BEGIN"))
    }

    fn commit(&self) -> impl Future<Output = Result<()>> + Send {
        self.with_handle(|inner| inner.execute_raw("COMMIT"))
    }

    fn rollback(&self) -> impl Future<Output = Result<()>> + Send {
        self.with_handle(|inner| {
            // A failed COMMIT or an I/O error may already have ended the
            // transaction; there is nothing left to roll back then.
            if inner.autocommit() {
                return Ok(());
            }
            inner.execute_raw("ROLLBACK")
        })
    }

    fn close(&self) -> impl Future<Output = Result<()>> + Send {
        let inner = Arc::clone(&self.inner);
        let path = self.path.clone();
        async move {
            inner.lock().unwrap_or_else(PoisonError::into_inner).close();
            tracing::debug!(%path, "sqlite database closed");
            Ok(())
        }
    }

    fn native_returning(&self) -> bool {
        self.native_returning
    }

    fn echo(&self) -> bool {
        self.echo
    }
}

impl std::fmt::Debug for SqliteDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDriver")
            .field("path", &self.path)
            .field("open", &!self.lock().db.is_null())
            .finish_non_exhaustive()
    }
}

impl SqliteInner {
    fn autocommit(&self) -> bool {
        // SAFETY: db is valid
        unsafe { ffi::sqlite3_get_autocommit(self.db) != 0 }
    }

    fn close(&mut self) {
        if !self.db.is_null() {
            // SAFETY: db is valid and `run` finalizes every statement it prepares
            unsafe {
                ffi::sqlite3_close(self.db);
            }
            self.db = ptr::null_mut();
        }
    }

    /// Execute SQL directly without preparing (transaction control, pragmas).
    #[allow(clippy::result_large_err)]
    fn execute_raw(&self, sql: &str) -> Result<()> {
        let c_sql = CString::new(sql).map_err(|_| null_byte(sql))?;
        let mut err: *mut std::ffi::c_char = ptr::null_mut();

        // SAFETY: All pointers are valid
        let rc = unsafe { ffi::sqlite3_exec(self.db, c_sql.as_ptr(), None, ptr::null_mut(), &mut err) };

        if rc != ffi::SQLITE_OK {
            let message = if err.is_null() {
                error_string(rc)
            } else {
                // SAFETY: err was allocated by SQLite and is freed here
                unsafe {
                    let msg = CStr::from_ptr(err).to_string_lossy().into_owned();
                    ffi::sqlite3_free(err.cast());
                    msg
                }
            };
            return Err(query_error(error_code_to_kind(rc), message, rc, sql));
        }
        Ok(())
    }

    /// Prepare, bind and step one statement to completion.
    #[allow(clippy::result_large_err)]
    fn run(&mut self, sql: &str, params: &[Value]) -> Result<DriverResult> {
        let Some(stmt) = prepare_stmt(self.db, sql)? else {
            return Ok(DriverResult::default());
        };

        // SAFETY: stmt is valid
        let expected = unsafe { ffi::sqlite3_bind_parameter_count(stmt.0) } as usize;
        if expected != params.len() {
            return Err(query_error(
                QueryErrorKind::Database,
                format!("statement expects {} parameters, {} supplied", expected, params.len()),
                ffi::SQLITE_RANGE,
                sql,
            ));
        }
        for (i, param) in params.iter().enumerate() {
            // SAFETY: stmt is valid, index is 1-based
            let rc = unsafe { types::bind_value(stmt.0, (i + 1) as c_int, param) };
            if rc != ffi::SQLITE_OK {
                return Err(bind_error(self.db, sql, i + 1, rc));
            }
        }

        // SAFETY: stmt is valid
        let col_count = unsafe { ffi::sqlite3_column_count(stmt.0) };
        let columns = (0..col_count)
            // SAFETY: stmt is valid, i < col_count
            .map(|i| unsafe { types::column_name(stmt.0, i) }.unwrap_or_else(|| format!("col{}", i)))
            .collect();

        // SAFETY: db is valid
        let changes_before = unsafe { ffi::sqlite3_total_changes(self.db) };
        let mut rows = Vec::new();
        loop {
            // SAFETY: stmt is valid
            match unsafe { ffi::sqlite3_step(stmt.0) } {
                ffi::SQLITE_ROW => {
                    let row = (0..col_count)
                        // SAFETY: we just got SQLITE_ROW
                        .map(|i| unsafe { types::read_column(stmt.0, i) })
                        .collect();
                    rows.push(row);
                }
                ffi::SQLITE_DONE => break,
                _ => return Err(step_error(self.db, sql)),
            }
        }

        // SAFETY: stmt is valid
        let read_only = unsafe { ffi::sqlite3_stmt_readonly(stmt.0) } != 0;
        drop(stmt);

        let mut result = DriverResult {
            columns,
            rows,
            ..DriverResult::default()
        };
        if !read_only {
            // SAFETY: db is valid
            let changes_after = unsafe { ffi::sqlite3_total_changes(self.db) };
            result.affected = u64::try_from(changes_after - changes_before).unwrap_or(0);
            if result.affected > 0 && is_insert(sql) {
                // SAFETY: db is valid
                result.last_insert_id = Some(unsafe { ffi::sqlite3_last_insert_rowid(self.db) });
            }
        }
        Ok(result)
    }
}

impl Drop for SqliteInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Finalizes the prepared statement on every exit path.
struct Statement(*mut ffi::sqlite3_stmt);

impl Drop for Statement {
    fn drop(&mut self) {
        // SAFETY: the pointer came from a successful prepare
        unsafe {
            ffi::sqlite3_finalize(self.0);
        }
    }
}

fn is_insert(sql: &str) -> bool {
    let head = sql.trim_start();
    ["INSERT", "REPLACE"]
        .iter()
        .any(|kw| head.get(..kw.len()).is_some_and(|h| h.eq_ignore_ascii_case(kw)))
}

/// `None` for SQL that contains no statement (whitespace or comments).
///
/// SQL text holding a second statement is rejected: `sqlite3_prepare_v2`
/// would otherwise compile the first one and ignore the rest.
#[allow(clippy::result_large_err)]
fn prepare_stmt(db: *mut ffi::sqlite3, sql: &str) -> Result<Option<Statement>> {
    let c_sql = CString::new(sql).map_err(|_| null_byte(sql))?;
    let base = c_sql.as_ptr();
    let len = c_sql.as_bytes().len();
    let mut found: Option<Statement> = None;
    let mut offset = 0;

    while offset < len {
        let mut stmt: *mut ffi::sqlite3_stmt = ptr::null_mut();
        let mut tail: *const std::ffi::c_char = ptr::null();
        // SAFETY: offset < len, so the pointer and length stay inside c_sql
        let rc = unsafe {
            ffi::sqlite3_prepare_v2(
                db,
                base.add(offset),
                c_int::try_from(len - offset).unwrap_or(c_int::MAX),
                &mut stmt,
                &mut tail,
            )
        };
        if rc != ffi::SQLITE_OK {
            return Err(prepare_error(db, sql, rc));
        }
        if !stmt.is_null() {
            let stmt = Statement(stmt);
            if found.is_some() {
                return Err(query_error(
                    QueryErrorKind::Unsupported,
                    "SQL text holds more than one statement".to_string(),
                    ffi::SQLITE_MISUSE,
                    sql,
                ));
            }
            found = Some(stmt);
        }
        let next = if tail.is_null() {
            len
        } else {
            // SAFETY: SQLite points tail into the buffer it was given
            usize::try_from(unsafe { tail.offset_from(base) }).unwrap_or(len)
        };
        if next <= offset {
            break;
        }
        offset = next;
    }
    Ok(found)
}

/// Prepare failures are malformed statements unless SQLite says otherwise.
fn prepare_error(db: *mut ffi::sqlite3, sql: &str, rc: c_int) -> Error {
    // SAFETY: db is valid
    let message = unsafe { errmsg(db) };
    let kind = match rc & 0xff {
        ffi::SQLITE_ERROR => QueryErrorKind::Syntax,
        code => error_code_to_kind(code),
    };
    query_error(kind, message, rc, sql)
}

fn bind_error(db: *mut ffi::sqlite3, sql: &str, param_index: usize, rc: c_int) -> Error {
    // SAFETY: db is valid
    let msg = unsafe { errmsg(db) };
    query_error(
        QueryErrorKind::Database,
        format!("Failed to bind parameter {}: {}", param_index, msg),
        rc,
        sql,
    )
}

fn step_error(db: *mut ffi::sqlite3, sql: &str) -> Error {
    // SAFETY: db is valid
    let (message, code) = unsafe { (errmsg(db), ffi::sqlite3_errcode(db)) };
    query_error(error_code_to_kind(code), message, code, sql)
}

fn error_code_to_kind(code: c_int) -> QueryErrorKind {
    match code & 0xff {
        ffi::SQLITE_CONSTRAINT => QueryErrorKind::Constraint,
        _ => QueryErrorKind::Database,
    }
}

fn query_error(kind: QueryErrorKind, message: String, code: c_int, sql: &str) -> Error {
    Error::Query(QueryError {
        kind,
        message,
        code: Some(code),
        sql: Some(sql.to_string()),
        context: None,
        source: None,
    })
}

fn null_byte(sql: &str) -> Error {
    query_error(
        QueryErrorKind::Syntax,
        "SQL contains null byte".to_string(),
        ffi::SQLITE_MISUSE,
        sql,
    )
}

fn closed() -> Error {
    Error::connection(ConnectionErrorKind::Closed, "sqlite handle is closed")
}

/// # Safety
/// `db` must be a valid handle.
unsafe fn errmsg(db: *mut ffi::sqlite3) -> String {
    // SAFETY: caller guarantees db; errmsg returns a valid C string
    unsafe { CStr::from_ptr(ffi::sqlite3_errmsg(db)).to_string_lossy().into_owned() }
}

fn error_string(rc: c_int) -> String {
    // SAFETY: errstr returns a static string for every code
    unsafe { CStr::from_ptr(ffi::sqlite3_errstr(rc)).to_string_lossy().into_owned() }
}
