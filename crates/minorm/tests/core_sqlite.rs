use minorm::prelude::*;
use minorm::{QueryErrorKind, StateErrorKind, bind};
use std::sync::Arc;

fn mapper() -> Arc<Mapper> {
    Mapper::builder()
        .register(
            EntityType::new(
                "User",
                TableSchema::new("user_account")
                    .column(Column::integer("id").primary_key())
                    .column(Column::varchar("name", 30))
                    .column(Column::text("fullname").nullable()),
            )
            .relationship(Relationship::many("addresses", "Address").back_populates("user")),
        )
        .unwrap()
        .register(
            EntityType::new(
                "Address",
                TableSchema::new("address")
                    .column(Column::integer("id").primary_key())
                    .column(Column::varchar("email_address", 100))
                    .column(Column::integer("user_id").references("user_account", "id").not_null()),
            )
            .relationship(Relationship::one("user", "User").back_populates("addresses")),
        )
        .unwrap()
        .build()
        .unwrap()
}

async fn with_schema() -> (Arc<Mapper>, Connection<SqliteDriver>) {
    let mapper = mapper();
    let mut conn = connect("sqlite::memory:").await.unwrap();
    create_all(&mapper, &mut conn).await.unwrap();
    (mapper, conn)
}

#[tokio::test(flavor = "current_thread")]
async fn sqlite_text_statements_bind_named_parameters() {
    let mut conn = connect("sqlite::memory:").await.unwrap();

    let inserted = conn
        .transaction(async |conn| {
            conn.execute(&text("CREATE TABLE some_table (x int, y int)"), ()).await?;
            let cursor = conn
                .execute(
                    &text("INSERT INTO some_table (x, y) VALUES (:x, :y)"),
                    vec![params! { "x" => 1, "y" => 1 }, params! { "x" => 2, "y" => 4 }],
                )
                .await?;
            Ok::<_, Error>(cursor.rowcount())
        })
        .await
        .unwrap();
    assert_eq!(inserted, 2);
    assert!(!conn.in_transaction());

    conn.begin().await.unwrap();
    let rows = conn
        .execute(
            &text("SELECT x, y FROM some_table WHERE y > :y ORDER BY x, y"),
            params! { "y" => 2 },
        )
        .await
        .unwrap()
        .all();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_named::<i64>("x").unwrap(), 2);
    assert_eq!(rows[0].get_named::<i64>("y").unwrap(), 4);
    conn.commit().await.unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn sqlite_transaction_rolls_back_on_error() {
    let mut conn = connect("sqlite::memory:").await.unwrap();
    conn.transaction(async |conn| {
        conn.execute(&text("CREATE TABLE t (x int)"), ()).await?;
        Ok::<_, Error>(())
    })
    .await
    .unwrap();

    let err = conn
        .transaction(async |conn| {
            conn.execute(&text("INSERT INTO t (x) VALUES (:x)"), params! { "x" => 1 }).await?;
            conn.execute(&text("INSERT INTO missing (x) VALUES (1)"), ()).await?;
            Ok::<_, Error>(())
        })
        .await
        .unwrap_err();
    assert!(matches!(err.query_kind(), Some(QueryErrorKind::Syntax | QueryErrorKind::Database)));
    assert!(!conn.in_transaction());

    conn.begin().await.unwrap();
    let count = conn.execute(&text("SELECT count(*) FROM t"), ()).await.unwrap().scalar();
    assert_eq!(count, Some(Value::Int(0)));
    conn.rollback().await.unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn sqlite_commit_without_transaction_is_a_state_error() {
    let mut conn = connect("sqlite::memory:").await.unwrap();
    let err = conn.commit().await.unwrap_err();
    assert_eq!(err.state_kind(), Some(StateErrorKind::NoTransaction));

    let err = conn.execute(&text("SELECT 1"), ()).await.unwrap_err();
    assert!(err.is_state(), "{err}");

    conn.begin().await.unwrap();
    let err = conn.begin().await.unwrap_err();
    assert_eq!(err.state_kind(), Some(StateErrorKind::TransactionActive));
    conn.rollback().await.unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn sqlite_constraint_failure_makes_transaction_rollback_only() {
    let (mapper, mut conn) = with_schema().await;
    let address = Arc::clone(mapper.require("Address").unwrap());

    conn.begin().await.unwrap();
    let err = conn
        .execute(
            &insert(&address.table),
            params! { "email_address" => "nobody@sqlalchemy.org", "user_id" => 99 },
        )
        .await
        .unwrap_err();
    assert!(err.is_constraint(), "{err}");
    assert!(conn.is_rollback_only());

    let err = conn.execute(&text("SELECT 1"), ()).await.unwrap_err();
    assert_eq!(err.state_kind(), Some(StateErrorKind::RollbackOnly));

    let err = conn.commit().await.unwrap_err();
    assert_eq!(err.state_kind(), Some(StateErrorKind::RollbackOnly));
    assert!(!conn.in_transaction());

    // the connection is usable again
    conn.begin().await.unwrap();
    conn.execute(&text("SELECT 1"), ()).await.unwrap();
    conn.commit().await.unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn sqlite_batched_insert_then_filtered_select() {
    let (mapper, mut conn) = with_schema().await;
    let user = Arc::clone(mapper.require("User").unwrap());

    conn.begin().await.unwrap();
    let cursor = conn
        .execute(
            &insert(&user.table),
            vec![
                params! { "name" => "spongebob", "fullname" => "Spongebob Squarepants" },
                params! { "name" => "sandy", "fullname" => "Sandy Cheeks" },
                params! { "name" => "patrick", "fullname" => "Patrick Star" },
            ],
        )
        .await
        .unwrap();
    assert_eq!(cursor.rowcount(), 3);

    let names = conn
        .execute(
            &select([Expr::qualified("user_account", "name").label("name")])
                .where_(Expr::qualified("user_account", "id").gt(1))
                .order_by(Expr::qualified("user_account", "name")),
            (),
        )
        .await
        .unwrap()
        .scalars()
        .all();
    assert_eq!(names, vec![Value::Text("patrick".into()), Value::Text("sandy".into())]);
    conn.commit().await.unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn sqlite_insert_returning_and_update_rowcount() {
    let (mapper, mut conn) = with_schema().await;
    let user = Arc::clone(mapper.require("User").unwrap());

    conn.begin().await.unwrap();
    let mut cursor = conn
        .execute(
            &insert(&user.table).returning(["id", "name"]),
            params! { "name" => "sandy", "fullname" => "Sandy Cheeks" },
        )
        .await
        .unwrap();
    assert_eq!(cursor.inserted_primary_key(), Some(&[Value::Int(1)][..]));
    let row = cursor.one().unwrap();
    assert_eq!(row.get_named::<String>("name").unwrap(), "sandy");

    let cursor = conn
        .execute(
            &update(&user.table)
                .set("fullname", bind("fullname"))
                .where_(Expr::qualified("user_account", "name").eq(bind("name"))),
            params! { "fullname" => "Sandy Squirrel", "name" => "sandy" },
        )
        .await
        .unwrap();
    assert_eq!(cursor.rowcount(), 1);

    let cursor = conn
        .execute(
            &delete(&user.table).where_(Expr::qualified("user_account", "name").eq("patrick")),
            (),
        )
        .await
        .unwrap();
    assert_eq!(cursor.rowcount(), 0);
    conn.commit().await.unwrap();
}

#[tokio::test(flavor = "current_thread")]
async fn sqlite_close_is_idempotent_and_rolls_back() {
    let (mapper, mut conn) = with_schema().await;
    let user = Arc::clone(mapper.require("User").unwrap());

    conn.begin().await.unwrap();
    conn.execute(&insert(&user.table), params! { "name" => "patrick" }).await.unwrap();
    conn.close().await.unwrap();
    conn.close().await.unwrap();
    assert!(conn.is_closed());

    let err = conn.begin().await.unwrap_err();
    assert!(matches!(err, Error::Connection(_)), "{err}");
}
