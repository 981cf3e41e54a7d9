//! Schema materialization: ordered CREATE / DROP for a whole catalog.

use crate::mapper::Mapper;
use minorm_core::{Compiled, Connection, Driver, Result};

/// CREATE TABLE statements for every registered table, parents first.
#[allow(clippy::result_large_err)]
pub fn create_statements(mapper: &Mapper) -> Result<Vec<Compiled>> {
    Ok(mapper
        .table_order()?
        .into_iter()
        .map(|t| Compiled::ddl(t.create_sql(), &t.name))
        .collect())
}

/// DROP TABLE statements in reverse dependency order.
#[allow(clippy::result_large_err)]
pub fn drop_statements(mapper: &Mapper) -> Result<Vec<Compiled>> {
    Ok(mapper
        .table_order()?
        .into_iter()
        .rev()
        .map(|t| Compiled::ddl(t.drop_sql(), &t.name))
        .collect())
}

/// Create every table of the catalog that does not exist yet.
///
/// Runs inside the caller's transaction if one is active, otherwise in a
/// transaction of its own.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn create_all<D: Driver>(mapper: &Mapper, conn: &mut Connection<D>) -> Result<()> {
    let statements = create_statements(mapper)?;
    run_ddl(conn, &statements).await?;
    tracing::info!(tables = statements.len(), "schema created");
    Ok(())
}

/// Drop every table of the catalog, referencing tables first.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn drop_all<D: Driver>(mapper: &Mapper, conn: &mut Connection<D>) -> Result<()> {
    let statements = drop_statements(mapper)?;
    run_ddl(conn, &statements).await?;
    tracing::info!(tables = statements.len(), "schema dropped");
    Ok(())
}

async fn run_ddl<D: Driver>(conn: &mut Connection<D>, statements: &[Compiled]) -> Result<()> {
    if conn.in_transaction() {
        for statement in statements {
            conn.execute(statement, ()).await?;
        }
        return Ok(());
    }
    conn.transaction(async |conn: &mut Connection<D>| {
        for statement in statements {
            conn.execute(statement, ()).await?;
        }
        Ok(())
    })
    .await
}
