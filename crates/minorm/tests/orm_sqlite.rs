use minorm::prelude::*;
use minorm::StateErrorKind;
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

async fn session() -> Session<SqliteDriver> {
    SessionBuilder::new(mapper()).create_all(true).build().await.unwrap()
}

fn user(mapper: &Mapper, name: &str, fullname: &str, emails: &[&str]) -> EntityRef {
    let user = EntityRef::with_values(mapper, "User", [("name", name), ("fullname", fullname)]).unwrap();
    for email in emails {
        let address = EntityRef::with_values(mapper, "Address", [("email_address", *email)]).unwrap();
        user.append("addresses", &address).unwrap();
    }
    user
}

/// spongebob, sandy and patrick, committed.
async fn seeded() -> (Session<SqliteDriver>, [EntityRef; 3]) {
    let mut session = session().await;
    let mapper = session.mapper().clone();
    let spongebob = user(&mapper, "spongebob", "Spongebob Squarepants", &["spongebob@sqlalchemy.org"]);
    let sandy = user(
        &mapper,
        "sandy",
        "Sandy Cheeks",
        &["sandy@sqlalchemy.org", "sandy@squirrelpower.org"],
    );
    let patrick = user(&mapper, "patrick", "Patrick Star", &[]);
    session.add_all([&spongebob, &sandy, &patrick]).unwrap();
    session.commit().await.unwrap();
    (session, [spongebob, sandy, patrick])
}

fn emails(addresses: &[EntityRef]) -> Vec<String> {
    addresses
        .iter()
        .map(|a| a.get_as::<String>("email_address").unwrap())
        .collect()
}

#[tokio::test(flavor = "current_thread")]
async fn orm_add_cascades_and_flush_assigns_keys() {
    let mut session = session().await;
    let mapper = session.mapper().clone();
    let squidward = user(&mapper, "squidward", "Squidward Tentacles", &["squidward@sqlalchemy.org"]);
    let krabs = user(&mapper, "ehkrabs", "Eugene H. Krabs", &[]);

    session.add_all([&squidward, &krabs]).unwrap();
    assert_eq!(session.new_instances().len(), 3);
    assert_eq!(squidward.lifecycle(), Lifecycle::Pending);
    assert_eq!(squidward.identity(), None);

    let result = session.flush().await.unwrap();
    assert_eq!(result.inserted, 3);
    assert!(session.new_instances().is_empty());
    assert_eq!(squidward.identity(), Some(vec![Value::Int(1)]));
    assert_eq!(krabs.identity(), Some(vec![Value::Int(2)]));
    let address = squidward.related("addresses").unwrap().remove(0);
    assert_eq!(address.get("user_id").unwrap(), Value::Int(1));

    // identity map: the same key yields the same instance without SQL
    let before = session.connection().statement_count();
    let again = session.get("User", 1).await.unwrap().unwrap();
    assert_eq!(again, squidward);
    assert_eq!(session.connection().statement_count(), before);

    session.commit().await.unwrap();
    assert_eq!(squidward.lifecycle(), Lifecycle::Persistent);
}

#[tokio::test(flavor = "current_thread")]
async fn orm_commit_expires_and_attributes_reload() {
    let (mut session, [spongebob, ..]) = seeded().await;

    assert!(spongebob.is_stale());
    let err = spongebob.get("name").unwrap_err();
    assert_eq!(err.state_kind(), Some(StateErrorKind::Expired));

    let name = session.attr(&spongebob, "name").await.unwrap();
    assert_eq!(name, Value::Text("spongebob".into()));
    assert_eq!(spongebob.get_as::<String>("fullname").unwrap(), "Spongebob Squarepants");
}

#[tokio::test(flavor = "current_thread")]
async fn orm_dirty_changes_autoflush_and_roll_back() {
    let (mut session, [_, sandy, patrick]) = seeded().await;
    let user_type = Arc::clone(session.mapper().require("User").unwrap());

    session.refresh(&sandy).await.unwrap();
    sandy.set("fullname", "Sandy Squirrel").unwrap();
    assert_eq!(session.dirty_instances(), vec![sandy.clone()]);

    session.refresh(&patrick).await.unwrap();
    session.delete(&patrick).unwrap();

    let found = session
        .entities(
            &select_entity(&user_type).where_(Expr::qualified("user_account", "fullname").eq("Sandy Squirrel")),
            (),
        )
        .await
        .unwrap();
    assert_eq!(found, vec![sandy.clone()]);
    assert!(session.dirty_instances().is_empty());
    assert!(session.get("User", 3).await.unwrap().is_none());

    session.rollback().await.unwrap();
    assert_eq!(patrick.lifecycle(), Lifecycle::Persistent);
    assert_eq!(
        session.attr(&sandy, "fullname").await.unwrap(),
        Value::Text("Sandy Cheeks".into())
    );
    assert!(session.get("User", 3).await.unwrap().is_some());
}

#[tokio::test(flavor = "current_thread")]
async fn orm_joined_and_selectin_loading_agree() {
    let (mut session, _) = seeded().await;
    let user_type = Arc::clone(session.mapper().require("User").unwrap());
    let by_id = select_entity(&user_type).order_by(Expr::qualified("user_account", "id"));

    let before = session.connection().statement_count();
    let selectin = session.entities(&by_id.clone().options(selectinload("addresses")), ()).await.unwrap();
    assert_eq!(session.connection().statement_count() - before, 2);
    let selectin_emails: Vec<Vec<String>> =
        selectin.iter().map(|u| emails(&u.related("addresses").unwrap())).collect();

    session.expire_all();
    let before = session.connection().statement_count();
    let joined = session.entities(&by_id.options(joinedload("addresses")), ()).await.unwrap();
    assert_eq!(session.connection().statement_count() - before, 1);
    let joined_emails: Vec<Vec<String>> = joined.iter().map(|u| emails(&u.related("addresses").unwrap())).collect();

    assert_eq!(selectin, joined);
    assert_eq!(selectin_emails, joined_emails);
    assert_eq!(
        joined_emails,
        vec![
            vec!["spongebob@sqlalchemy.org".to_string()],
            vec!["sandy@sqlalchemy.org".to_string(), "sandy@squirrelpower.org".to_string()],
            vec![],
        ]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn orm_joined_collection_with_limit_keeps_whole_collections() {
    let (mut session, [spongebob, sandy, _]) = seeded().await;
    let user_type = Arc::clone(session.mapper().require("User").unwrap());
    let first_two = select_entity(&user_type)
        .order_by(Expr::qualified("user_account", "id"))
        .limit(2)
        .options(joinedload("addresses"));
    let users = session.entities(&first_two, ()).await.unwrap();
    assert_eq!(users, [spongebob, sandy]);
    assert_eq!(
        emails(&users[1].related("addresses").unwrap()),
        ["sandy@sqlalchemy.org", "sandy@squirrelpower.org"]
    );
}

#[tokio::test(flavor = "current_thread")]
async fn orm_insert_from_select_and_union_all() {
    let (mut session, [_, _, patrick]) = seeded().await;
    let mapper = session.mapper().clone();
    let user_type = Arc::clone(mapper.require("User").unwrap());
    let address_type = Arc::clone(mapper.require("Address").unwrap());

    let aol = select([
        Expr::qualified("user_account", "id"),
        Expr::qualified("user_account", "name").concat("@aol.com"),
    ])
    .where_(Expr::qualified("user_account", "name").eq("patrick"));
    let inserted = session
        .execute(&insert(&address_type.table).from_select(["user_id", "email_address"], aol), ())
        .await
        .unwrap();
    assert_eq!(inserted.rowcount(), 1);
    let addresses = session.load_related(&patrick, "addresses").await.unwrap();
    assert_eq!(emails(&addresses), ["patrick@aol.com"]);

    let names = union_all([
        select([Expr::qualified("user_account", "name")]).where_(Expr::qualified("user_account", "id").lt(2)),
        select([Expr::qualified("user_account", "name")]).where_(Expr::qualified("user_account", "id").eq(3)),
    ]);
    let rows = session.execute(&names, ()).await.unwrap().all();
    let names: Vec<Value> = rows.iter().map(|r| r.value("name").cloned().unwrap()).collect();
    assert_eq!(names, [Value::Text("spongebob".into()), Value::Text("patrick".into())]);

    let ids = session
        .entities(
            &select_entity(&user_type).from_statement(union_all([
                select_entity(&user_type).where_(Expr::qualified("user_account", "id").eq(3)),
                select_entity(&user_type).where_(Expr::qualified("user_account", "id").eq(1)),
            ])),
            (),
        )
        .await
        .unwrap();
    assert_eq!(ids[0], patrick);
    assert_eq!(ids.len(), 2);
}

#[tokio::test(flavor = "current_thread")]
async fn orm_lazy_load_and_back_references() {
    let (mut session, [_, sandy, _]) = seeded().await;

    let err = sandy.related("addresses").unwrap_err();
    assert_eq!(err.state_kind(), Some(StateErrorKind::NotLoaded));

    let addresses = session.load_related(&sandy, "addresses").await.unwrap();
    assert_eq!(emails(&addresses), ["sandy@sqlalchemy.org", "sandy@squirrelpower.org"]);
    for address in &addresses {
        assert_eq!(address.related_one("user").unwrap(), Some(sandy.clone()));
    }
}

#[tokio::test(flavor = "current_thread")]
async fn orm_text_and_mixed_rows() {
    let (mut session, [spongebob, ..]) = seeded().await;
    let user_type = Arc::clone(session.mapper().require("User").unwrap());
    let address_type = Arc::clone(session.mapper().require("Address").unwrap());

    let row = session
        .execute(&text("SELECT name FROM user_account WHERE id = :id"), params! { "id" => 2 })
        .await
        .unwrap()
        .one()
        .unwrap();
    assert_eq!(row.value("name"), Some(&Value::Text("sandy".into())));

    let rows = session
        .execute(
            &select_entity(&user_type)
                .column(Expr::qualified("address", "email_address").label("email_address"))
                .join(
                    "address",
                    Expr::qualified("user_account", "id").eq(Expr::qualified("address", "user_id")),
                )
                .where_(Expr::qualified("address", "email_address").eq("spongebob@sqlalchemy.org")),
            (),
        )
        .await
        .unwrap()
        .all();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].entity("User"), Some(&spongebob));
    assert_eq!(
        rows[0].value("email_address"),
        Some(&Value::Text("spongebob@sqlalchemy.org".into()))
    );

    let first = session
        .scalars(&select_entity(&address_type).order_by(Expr::qualified("address", "id")), ())
        .await
        .unwrap()
        .first()
        .and_then(Item::into_entity)
        .unwrap();
    assert_eq!(first.get("email_address").unwrap(), Value::Text("spongebob@sqlalchemy.org".into()));
}

#[tokio::test(flavor = "current_thread")]
async fn orm_close_detaches_and_is_idempotent() {
    let (mut session, [spongebob, ..]) = seeded().await;
    session.close().await.unwrap();
    session.close().await.unwrap();

    assert_eq!(spongebob.lifecycle(), Lifecycle::Detached);
    assert!(session.identity_map().is_empty());
    let err = session.add(&spongebob).unwrap_err();
    assert_eq!(err.state_kind(), Some(StateErrorKind::SessionClosed));
}

#[tokio::test(flavor = "current_thread")]
async fn orm_scoped_session_closes_connection() {
    let mapper = mapper();
    let mut conn = connect("sqlite::memory:").await.unwrap();
    create_all(&mapper, &mut conn).await.unwrap();

    let patrick = Session::scope(conn, Arc::clone(&mapper), async |session| {
        let patrick = EntityRef::with_values(session.mapper(), "User", [("name", "patrick")])?;
        session.add(&patrick)?;
        session.commit().await?;
        Ok::<_, Error>(patrick)
    })
    .await
    .unwrap();
    assert_eq!(patrick.lifecycle(), Lifecycle::Detached);
}
