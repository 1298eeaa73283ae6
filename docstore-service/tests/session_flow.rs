mod support;

use anyhow::Result;
use serde_json::{json, Value};

use support::{spawn_server, TestClient};

#[tokio::test(flavor = "multi_thread")]
async fn full_session_against_a_live_server() -> Result<()> {
    let server = spawn_server(&[("u1", "pw")]).await?;
    let mut client = TestClient::connect(server.addr).await?;

    let auth = client.auth("u1", "pw", false).await?;
    assert!(auth.is_ok(), "auth failed: {}", auth.error);

    // CREATE_DB writes a fresh, empty database file.
    let created = client
        .expect_ok("CREATE_DB", json!({"dbname": "d1", "force": true, "use": true}))
        .await?;
    assert_eq!(created, json!(""));
    let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(server.db_file("d1"))?)?;
    assert_eq!(on_disk, json!({"version": 2, "keys": {}}));

    // First insert adopts the record's sorted field set as the section keys.
    client
        .expect_ok("ADD_SECTION", json!({"section": "people", "use": true}))
        .await?;
    let id1 = client
        .expect_ok(
            "ADD",
            json!({"section": "people", "data": {"name": "A", "age": 30}, "ignore_missing_key": false}),
        )
        .await?;
    let id1 = id1.as_str().expect("id is a string").to_string();
    let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(server.db_file("d1"))?)?;
    assert_eq!(on_disk["keys"]["people"], json!(["age", "name"]));

    // A record missing a key is rejected and nothing changes.
    let rejected = client
        .send(
            "ADD",
            json!({"section": "people", "data": {"name": "B"}, "ignore_missing_key": false}),
        )
        .await?;
    assert_eq!(rejected.error, "UnknownKeyError");
    let unchanged: Value = serde_json::from_str(&std::fs::read_to_string(server.db_file("d1"))?)?;
    assert_eq!(unchanged["people"].as_object().map(|m| m.len()), Some(1));

    // Batch insert returns the allocated IDs in order.
    let ids = client
        .expect_ok(
            "ADD_MANY",
            json!({
                "section": "people",
                "data": [{"name": "C", "age": 10}, {"name": "D", "age": 40}],
                "json_response": true,
                "ignore_missing_key": false
            }),
        )
        .await?;
    let ids = ids.as_array().expect("ids are a list").clone();
    assert_eq!(ids.len(), 2);
    let id2 = ids[0].as_str().expect("id2").to_string();
    let id3 = ids[1].as_str().expect("id3").to_string();

    // Query selects exactly the records over 20.
    let hits = client
        .expect_ok("GET_BY_QUERY", json!({"section": "people", "query": "age > 20"}))
        .await?;
    let hits = hits.as_object().expect("query result is a map");
    assert_eq!(hits.len(), 2);
    assert!(hits.contains_key(&id1));
    assert!(hits.contains_key(&id3));

    // Delete by query returns the removed IDs.
    let deleted = client
        .expect_ok(
            "DELETE_BY_QUERY",
            json!({"section": "people", "query": "age < 20"}),
        )
        .await?;
    assert_eq!(deleted, json!([id2]));
    let remaining = client
        .expect_ok("GET_ALL_BY_SECTION", json!({"section": "people"}))
        .await?;
    assert_eq!(remaining.as_object().map(|m| m.len()), Some(2));

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn update_and_metadata_commands() -> Result<()> {
    let server = spawn_server(&[("u1", "pw")]).await?;
    let mut client = TestClient::connect(server.addr).await?;
    client.auth("u1", "pw", false).await?;
    client
        .expect_ok("CREATE_DB", json!({"dbname": "d2", "force": true, "use": true}))
        .await?;
    client
        .expect_ok("ADD_SECTION", json!({"section": "people", "use": true}))
        .await?;
    let id = client
        .expect_ok(
            "ADD",
            json!({"section": "people", "data": {"name": "A", "age": 30}, "ignore_missing_key": false}),
        )
        .await?;
    let id = id.as_str().expect("id").to_string();

    // UPDATE_BY_ID really updates (shallow merge), not a read.
    let updated = client
        .expect_ok(
            "UPDATE_BY_ID",
            json!({"section": "people", "id": id, "data": {"age": 31}}),
        )
        .await?;
    assert_eq!(updated, json!({"name": "A", "age": 31}));
    let fetched = client
        .expect_ok("GET_BY_ID", json!({"section": "people", "id": id}))
        .await?;
    assert_eq!(fetched, json!({"name": "A", "age": 31}));

    // ADD_NEW_KEY backfills every record and the change lands on disk.
    client
        .expect_ok(
            "ADD_NEW_KEY",
            json!({"section": "people", "key": "city", "default": null}),
        )
        .await?;
    let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(server.db_file("d2"))?)?;
    assert_eq!(on_disk["keys"]["people"], json!(["age", "city", "name"]));
    assert_eq!(on_disk["people"][&id]["city"], Value::Null);

    // USE_SECTION validates, USE_DB reports both selections.
    let selected = client
        .expect_ok("USE_DB", json!({"dbname": "d2", "section": "people"}))
        .await?;
    assert_eq!(selected, json!({"dbname": "d2", "section": "people"}));
    let missing = client
        .send("USE_SECTION", json!({"section": "ghost"}))
        .await?;
    assert_eq!(missing.error, "SectionNotFoundError");

    // PURGE_ALL leaves empty sections behind.
    client.expect_ok("PURGE_ALL", json!({})).await?;
    let all = client.expect_ok("GET_ALL", json!({})).await?;
    assert_eq!(all, json!({"people": {}}));

    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn wrong_password_leaves_the_session_unauthenticated() -> Result<()> {
    let server = spawn_server(&[("u1", "pw")]).await?;
    let mut client = TestClient::connect(server.addr).await?;

    let rejected = client.auth("u1", "nope", false).await?;
    assert_eq!(rejected.error, "InvalidUserError");

    // Still unauthenticated: no command but AUTH is honored.
    let denied = client.send("GET_ALL", json!({})).await?;
    assert_eq!(denied.error, "InvalidUserError");

    let accepted = client.auth("u1", "pw", false).await?;
    assert!(accepted.is_ok());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn encrypted_sessions_carry_the_same_protocol() -> Result<()> {
    let server = spawn_server(&[("u1", "pw")]).await?;
    let mut client = TestClient::connect(server.addr).await?;

    let auth = client.auth("u1", "pw", true).await?;
    assert!(auth.is_ok(), "auth failed: {}", auth.error);

    client
        .expect_ok("CREATE_DB", json!({"dbname": "enc", "force": true, "use": true}))
        .await?;
    client
        .expect_ok("ADD_SECTION", json!({"section": "notes", "use": false}))
        .await?;
    let id = client
        .expect_ok(
            "ADD",
            json!({"section": "notes", "data": {"text": "hello"}, "ignore_missing_key": false}),
        )
        .await?;
    let fetched = client
        .expect_ok(
            "GET_BY_ID",
            json!({"section": "notes", "id": id.as_str().expect("id")}),
        )
        .await?;
    assert_eq!(fetched, json!({"text": "hello"}));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn commands_require_a_selected_database() -> Result<()> {
    let server = spawn_server(&[("u1", "pw")]).await?;
    let mut client = TestClient::connect(server.addr).await?;
    client.auth("u1", "pw", false).await?;

    let response = client.send("GET_ALL", json!({})).await?;
    assert_eq!(response.error, "InvalidStateError");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn access_control_and_stale_session_keys() -> Result<()> {
    let server = spawn_server(&[("u1", "pw"), ("u2", "pw2")]).await?;

    // u1 creates a database; u2 has no access to it.
    let mut owner = TestClient::connect(server.addr).await?;
    owner.auth("u1", "pw", false).await?;
    owner
        .expect_ok("CREATE_DB", json!({"dbname": "mine", "force": true, "use": false}))
        .await?;

    let mut other = TestClient::connect(server.addr).await?;
    other.auth("u2", "pw2", false).await?;
    let denied = other.send("USE_DB", json!({"dbname": "mine"})).await?;
    assert_eq!(denied.error, "InvalidUserError");

    // A request carrying the wrong session key is rejected in-band.
    let mut forger = TestClient::connect(server.addr).await?;
    forger.auth("u1", "pw", false).await?;
    let response = forger
        .send_with_key("USE_DB", json!({"dbname": "mine"}), Some("forged-key"))
        .await?;
    assert_eq!(response.error, "InvalidUserError");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn databases_survive_reconnects() -> Result<()> {
    let server = spawn_server(&[("u1", "pw")]).await?;

    let mut first = TestClient::connect(server.addr).await?;
    first.auth("u1", "pw", false).await?;
    first
        .expect_ok("CREATE_DB", json!({"dbname": "persist", "force": true, "use": true}))
        .await?;
    first
        .expect_ok("ADD_SECTION", json!({"section": "items", "use": false}))
        .await?;
    first
        .expect_ok(
            "ADD",
            json!({"section": "items", "data": {"sku": "x"}, "ignore_missing_key": false}),
        )
        .await?;
    drop(first);

    let mut second = TestClient::connect(server.addr).await?;
    second.auth("u1", "pw", false).await?;
    second
        .expect_ok("USE_DB", json!({"dbname": "persist"}))
        .await?;
    let items = second
        .expect_ok("GET_ALL_BY_SECTION", json!({"section": "items"}))
        .await?;
    assert_eq!(items.as_object().map(|m| m.len()), Some(1));
    Ok(())
}
