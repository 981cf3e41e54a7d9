//! Statement execution over a [`Connection`].
//!
//! Single parameter sets run once and return their rows. Batches run the
//! statement once per set, in order, and only report the summed affected
//! row count, except for inserts that declare returning columns: those get
//! one row per set, either through native `RETURNING` (when the driver
//! offers it) or by selecting each inserted row back by primary key.

use crate::connection::Connection;
use crate::cursor::Cursor;
use crate::driver::{Driver, DriverResult};
use crate::error::{Error, QueryError, QueryErrorKind, Result};
use crate::identifiers::{quote_ident, quote_list};
use crate::params::{ParameterSet, Params};
use crate::statement::{Compiled, Executable, StatementKind};
use crate::value::Value;

impl<D: Driver> Connection<D> {
    /// Execute a statement with zero, one or many parameter sets.
    ///
    /// Requires an active transaction. Syntax and constraint failures leave
    /// the transaction rollback-only.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn execute<S>(&mut self, statement: &S, params: impl Into<Params>) -> Result<Cursor>
    where
        S: Executable + ?Sized,
    {
        self.ensure_executable()?;
        let params = params.into().normalize();
        let compiled = statement.compile(params.shape())?;
        tracing::debug!(
            kind = %compiled.kind,
            table = compiled.table.as_deref().unwrap_or(""),
            sets = params.invocations(),
            "executing statement"
        );

        let result = match &params {
            Params::None => self.execute_one(&compiled, None).await,
            Params::One(set) => self.execute_one(&compiled, Some(set)).await,
            Params::Many(sets) if sets.is_empty() => Ok(Cursor::empty()),
            Params::Many(sets) => self.execute_batch(&compiled, sets).await,
        };

        result.map_err(|err| {
            let err = err.with_context(compiled.kind, compiled.table.as_deref());
            if err.poisons_transaction() {
                self.mark_rollback_only();
            }
            err
        })
    }

    async fn execute_one(&mut self, compiled: &Compiled, set: Option<&ParameterSet>) -> Result<Cursor> {
        let values = compiled.resolve(set)?;
        if wants_returning(compiled) {
            let (columns, rows, affected, last_id) = self.insert_returning(compiled, &values).await?;
            let key = inserted_key(compiled, &values, last_id)
                .or_else(|| key_from_returned(compiled, &columns, rows.first()));
            return Ok(Cursor::from_values(columns, rows)
                .with_rowcount(affected)
                .with_inserted_primary_key(key)
                .with_last_insert_id(last_id));
        }

        let result = self.run(&compiled.sql, &values).await?;
        let key = if compiled.kind == StatementKind::Insert {
            inserted_key(compiled, &values, result.last_insert_id)
        } else {
            None
        };
        let last_id = if compiled.kind == StatementKind::Select {
            None
        } else {
            result.last_insert_id
        };
        Ok(Cursor::from_values(result.columns, result.rows)
            .with_rowcount(result.affected)
            .with_inserted_primary_key(key)
            .with_last_insert_id(last_id))
    }

    async fn execute_batch(&mut self, compiled: &Compiled, sets: &[ParameterSet]) -> Result<Cursor> {
        let returning = wants_returning(compiled);
        let mut affected = 0;
        let mut rows = Vec::new();
        let mut columns = compiled.returning.clone();

        for set in sets {
            let values = compiled.resolve(Some(set))?;
            if returning {
                let (cols, mut got, n, _) = self.insert_returning(compiled, &values).await?;
                columns = cols;
                rows.append(&mut got);
                affected += n;
            } else {
                affected += self.run(&compiled.sql, &values).await?.affected;
            }
        }

        tracing::debug!(sets = sets.len(), affected, "batch executed");
        if !returning {
            columns.clear();
        }
        Ok(Cursor::from_values(columns, rows).with_rowcount(affected))
    }

    /// Insert one row and produce its returning columns.
    async fn insert_returning(
        &mut self,
        compiled: &Compiled,
        values: &[Value],
    ) -> Result<(Vec<String>, Vec<Vec<Value>>, u64, Option<i64>)> {
        let native = self.driver().is_some_and(D::native_returning);
        if native {
            let result = self.run(&compiled.sql_with_returning(), values).await?;
            return Ok((result.columns, result.rows, result.affected, result.last_insert_id));
        }

        let inserted = self.run(&compiled.sql, values).await?;
        let fetched = self.select_inserted(compiled, values, &inserted).await?;
        Ok((
            compiled.returning.clone(),
            fetched.rows,
            inserted.affected,
            inserted.last_insert_id,
        ))
    }

    /// Select-after-insert: read the returning columns of the row just
    /// inserted, located by its primary key.
    async fn select_inserted(
        &mut self,
        compiled: &Compiled,
        values: &[Value],
        inserted: &DriverResult,
    ) -> Result<DriverResult> {
        let table = compiled.table.as_deref().ok_or_else(|| unsupported(compiled, "insert has no target table"))?;
        let key = inserted_key(compiled, values, inserted.last_insert_id).ok_or_else(|| {
            unsupported(
                compiled,
                "cannot locate the inserted row: primary key is neither supplied nor generated",
            )
        })?;
        let predicate = compiled
            .primary_key
            .iter()
            .map(|col| format!("{} = ?", quote_ident(col)))
            .collect::<Vec<_>>()
            .join(" AND ");
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            quote_list(&compiled.returning),
            quote_ident(table),
            predicate
        );
        let mut result = self.run(&sql, &key).await?;
        result.columns.clone_from(&compiled.returning);
        Ok(result)
    }
}

fn wants_returning(compiled: &Compiled) -> bool {
    compiled.kind == StatementKind::Insert && !compiled.returning.is_empty()
}

fn unsupported(compiled: &Compiled, message: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Unsupported,
        message: message.to_string(),
        code: None,
        sql: Some(compiled.sql.clone()),
        context: None,
        source: None,
    })
}

/// Primary key of an inserted row: supplied values where present, the
/// driver-generated id for a single omitted key column.
fn inserted_key(compiled: &Compiled, values: &[Value], last_id: Option<i64>) -> Option<Vec<Value>> {
    if compiled.primary_key.is_empty() {
        return None;
    }
    compiled
        .primary_key
        .iter()
        .map(|pk| {
            let supplied = compiled
                .columns
                .iter()
                .position(|c| c == pk)
                .and_then(|i| values.get(i))
                .filter(|v| !v.is_null());
            match supplied {
                Some(v) => Some(v.clone()),
                None if compiled.primary_key.len() == 1 => last_id.map(Value::Int),
                None => None,
            }
        })
        .collect()
}

fn key_from_returned(compiled: &Compiled, columns: &[String], row: Option<&Vec<Value>>) -> Option<Vec<Value>> {
    let row = row?;
    compiled
        .primary_key
        .iter()
        .map(|pk| {
            columns
                .iter()
                .position(|c| c == pk)
                .and_then(|i| row.get(i).cloned())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::Fetch;
    use crate::error::StateErrorKind;
    use crate::params;
    use crate::statement::Bind;
    use crate::testing::{MockDriver, MockFailure};

    fn insert_user() -> Compiled {
        let mut c = Compiled::new(
            StatementKind::Insert,
            "INSERT INTO \"user_account\" (\"name\", \"fullname\") VALUES (?, ?)",
        )
        .with_table("user_account")
        .with_binds(vec![Bind::Named("name".into()), Bind::Named("fullname".into())]);
        c.columns = vec!["name".into(), "fullname".into()];
        c.primary_key = vec!["id".into()];
        c
    }

    async fn active(driver: &MockDriver) -> Connection<MockDriver> {
        let mut conn = Connection::from_driver(driver.clone());
        conn.begin().await.unwrap();
        conn
    }

    #[tokio::test]
    async fn execute_outside_transaction_is_state_error() {
        let mut conn = Connection::from_driver(MockDriver::new());
        let err = conn.execute(&insert_user(), ()).await.unwrap_err();
        assert_eq!(err.state_kind(), Some(StateErrorKind::NoTransaction));
        assert_eq!(conn.statement_count(), 0);
    }

    #[tokio::test]
    async fn batch_runs_once_per_set_and_sums_rowcount() {
        let driver = MockDriver::new();
        let mut conn = active(&driver).await;
        let sets = vec![
            params! { "name" => "sandy", "fullname" => "Sandy Cheeks" },
            params! { "name" => "patrick", "fullname" => "Patrick Star" },
            params! { "name" => "squidward", "fullname" => None::<String> },
        ];
        let mut cursor = conn.execute(&insert_user(), sets).await.unwrap();
        assert_eq!(conn.statement_count(), 3);
        assert_eq!(cursor.rowcount(), 3);
        assert!(cursor.all().is_empty());
        assert!(cursor.inserted_primary_key().is_none());
        assert_eq!(driver.params()[2], vec![Value::Text("squidward".into()), Value::Null]);
    }

    #[tokio::test]
    async fn single_insert_reports_generated_key() {
        let driver = MockDriver::new();
        let mut conn = active(&driver).await;
        let cursor = conn
            .execute(&insert_user(), params! { "name" => "sandy", "fullname" => "Sandy" })
            .await
            .unwrap();
        assert_eq!(cursor.inserted_primary_key(), Some(&[Value::Int(1)][..]));
    }

    #[tokio::test]
    async fn batched_returning_falls_back_to_select_after_insert() {
        let driver = MockDriver::new();
        let mut conn = active(&driver).await;
        let mut stmt = insert_user();
        stmt.returning = vec!["id".into(), "name".into()];
        for (id, name) in [(1, "a"), (2, "b")] {
            driver.push_result(DriverResult {
                affected: 1,
                last_insert_id: Some(id),
                ..DriverResult::default()
            });
            driver.push_result(DriverResult {
                columns: vec!["id".into(), "name".into()],
                rows: vec![vec![Value::Int(id), Value::Text(name.into())]],
                ..DriverResult::default()
            });
        }
        let sets = vec![
            params! { "name" => "a", "fullname" => None::<String> },
            params! { "name" => "b", "fullname" => None::<String> },
        ];
        let mut cursor = conn.execute(&stmt, sets).await.unwrap();
        let rows = cursor.all();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get_named::<String>("name").unwrap(), "b");
        assert_eq!(cursor.rowcount(), 2);
        let log = driver.log();
        assert!(log[2].starts_with("SELECT \"id\", \"name\" FROM \"user_account\" WHERE \"id\" = ?"));
        assert_eq!(driver.params()[1], vec![Value::Int(1)]);
    }

    #[tokio::test]
    async fn native_returning_appends_clause() {
        let driver = MockDriver::new().with_native_returning();
        let mut conn = active(&driver).await;
        let mut stmt = insert_user();
        stmt.returning = vec!["id".into()];
        driver.push_result(DriverResult {
            columns: vec!["id".into()],
            rows: vec![vec![Value::Int(42)]],
            affected: 1,
            last_insert_id: Some(42),
        });
        let cursor = conn
            .execute(&stmt, params! { "name" => "x", "fullname" => "y" })
            .await
            .unwrap();
        assert_eq!(cursor.inserted_primary_key(), Some(&[Value::Int(42)][..]));
        assert!(driver.log()[1].ends_with("RETURNING \"id\""));
        assert_eq!(conn.statement_count(), 1);
    }

    #[tokio::test]
    async fn constraint_failure_makes_transaction_rollback_only() {
        let driver = MockDriver::new();
        let mut conn = active(&driver).await;
        driver.fail_next(MockFailure::Execute(QueryErrorKind::Constraint));
        let err = conn
            .execute(&insert_user(), params! { "name" => "x", "fullname" => "y" })
            .await
            .unwrap_err();
        assert!(err.is_constraint());
        let ctx = err.context().unwrap();
        assert_eq!(ctx.kind, StatementKind::Insert);
        assert_eq!(ctx.table.as_deref(), Some("user_account"));
        assert!(conn.is_rollback_only());

        let err = conn.execute(&insert_user(), ()).await.unwrap_err();
        assert_eq!(err.state_kind(), Some(StateErrorKind::RollbackOnly));
        let err = conn.commit().await.unwrap_err();
        assert_eq!(err.state_kind(), Some(StateErrorKind::RollbackOnly));
        assert!(!conn.in_transaction());
        assert_eq!(driver.log().last().map(String::as_str), Some("ROLLBACK"));
    }

    #[tokio::test]
    async fn missing_parameter_does_not_reach_driver() {
        let driver = MockDriver::new();
        let mut conn = active(&driver).await;
        let err = conn
            .execute(&insert_user(), params! { "name" => "x" })
            .await
            .unwrap_err();
        assert_eq!(err.state_kind(), Some(StateErrorKind::MissingParameter));
        assert_eq!(conn.statement_count(), 0);
        assert!(!conn.is_rollback_only());
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let driver = MockDriver::new();
        let mut conn = active(&driver).await;
        let cursor = conn.execute(&insert_user(), Vec::<ParameterSet>::new()).await.unwrap();
        assert_eq!(cursor.rowcount(), 0);
        assert_eq!(conn.statement_count(), 0);
    }
}
