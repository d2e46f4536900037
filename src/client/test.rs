use std::time::Duration;

use bson::{doc, Bson, Document, Timestamp};

use crate::{
    event::command::CommandEvent,
    options::ClientOptions,
    test::{replica_set_hello, standalone_hello, wait_until, EventBuffer, MockServer},
    Client,
};

struct ClientHarness {
    client: Client,
    events: EventBuffer,
    server: MockServer,
}

async fn standalone_client() -> ClientHarness {
    client_for_hello(standalone_hello()).await
}

/// A direct connection to the primary of a single-member replica set; unlike a standalone, such
/// a deployment supports retryable writes and transactions.
async fn single_member_rs_client() -> ClientHarness {
    let server = MockServer::start(doc! {}).await;
    let address = server.address();
    server.set_hello(replica_set_hello("rs0", true, &[&address]));

    harness_around(server).await
}

async fn client_for_hello(hello: Document) -> ClientHarness {
    let server = MockServer::start(hello).await;
    harness_around(server).await
}

async fn harness_around(server: MockServer) -> ClientHarness {
    let (events, registry) = EventBuffer::registry();

    let options = ClientOptions::builder()
        .hosts(vec![server.address()])
        .direct_connection(Some(true))
        .monitoring(Some(registry))
        .build();
    let client = Client::with_options(options).unwrap();

    ClientHarness {
        client,
        events,
        server,
    }
}

fn received_with_name<'a>(received: &'a [Document], name: &str) -> Vec<&'a Document> {
    received
        .iter()
        .filter(|doc| doc.keys().next().map(String::as_str) == Some(name))
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn run_command_attaches_session_and_emits_events() {
    let harness = standalone_client().await;

    let reply = harness
        .client
        .run_command("admin", doc! { "ping": 1 }, None)
        .await
        .unwrap();
    assert_eq!(reply.get_i32("ok").ok(), Some(1));

    let received = harness.server.received();
    let pings = received_with_name(&received, "ping");
    assert_eq!(pings.len(), 1);
    assert_eq!(pings[0].get_str("$db").unwrap(), "admin");
    // Sessions are supported by this deployment, so an implicit one is attached.
    assert!(pings[0].get_document("lsid").is_ok());

    let events = harness.events.command_events();
    assert!(events.iter().any(
        |event| matches!(event, CommandEvent::Started(e) if e.command_name == "ping")
    ));
    assert!(events.iter().any(
        |event| matches!(event, CommandEvent::Succeeded(e) if e.command_name == "ping")
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn implicit_sessions_are_pooled_and_reused() {
    let harness = standalone_client().await;

    harness
        .client
        .run_command("admin", doc! { "ping": 1 }, None)
        .await
        .unwrap();

    // The session is returned to the pool asynchronously when the implicit session drops.
    tokio::time::sleep(Duration::from_millis(100)).await;

    harness
        .client
        .run_command("admin", doc! { "ping": 1 }, None)
        .await
        .unwrap();

    let received = harness.server.received();
    let pings = received_with_name(&received, "ping");
    assert_eq!(pings.len(), 2);
    assert_eq!(
        pings[0].get_document("lsid").unwrap(),
        pings[1].get_document("lsid").unwrap(),
        "pooled server session should be reused"
    );
}

// A retryable read fails with a state-change error on the first attempt and is re-issued
// exactly once against a fresh selection.
#[tokio::test(flavor = "multi_thread")]
async fn retryable_read_is_retried_exactly_once() {
    let harness = standalone_client().await;

    harness.server.enqueue_reply(
        "find",
        doc! {
            "ok": 0,
            "code": 11602,
            "codeName": "InterruptedDueToReplStateChange",
            "errmsg": "interrupted",
        },
    );
    harness.server.enqueue_reply(
        "find",
        doc! {
            "ok": 1,
            "cursor": { "id": 0i64, "ns": "db.coll", "firstBatch": [ { "_id": 1 } ] },
        },
    );

    let batch = harness
        .client
        .find("db", "coll", doc! { "x": 1 }, None, None, None)
        .await
        .unwrap();
    assert_eq!(batch.first_batch, vec![doc! { "_id": 1 }]);
    assert_eq!(batch.id, 0);

    let received = harness.server.received();
    assert_eq!(received_with_name(&received, "find").len(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn retryable_write_reuses_transaction_number() {
    let harness = single_member_rs_client().await;

    harness.server.enqueue_reply(
        "insert",
        doc! {
            "ok": 0,
            "code": 91,
            "codeName": "ShutdownInProgress",
            "errmsg": "shutting down",
            "errorLabels": ["RetryableWriteError"],
        },
    );
    harness
        .server
        .enqueue_reply("insert", doc! { "ok": 1, "n": 1 });

    let result = harness
        .client
        .insert_many("db", "coll", vec![doc! { "x": 1 }], None, None)
        .await
        .unwrap();
    assert_eq!(result.inserted_ids.len(), 1);

    let received = harness.server.received();
    let inserts = received_with_name(&received, "insert");
    assert_eq!(inserts.len(), 2);

    // Retryable writes use the same session and transaction number across both attempts.
    assert_eq!(
        inserts[0].get_document("lsid").unwrap(),
        inserts[1].get_document("lsid").unwrap()
    );
    let txn_first = inserts[0].get_i64("txnNumber").unwrap();
    let txn_second = inserts[1].get_i64("txnNumber").unwrap();
    assert_eq!(txn_first, txn_second);
}

#[tokio::test(flavor = "multi_thread")]
async fn unretryable_write_error_is_surfaced() {
    let harness = standalone_client().await;

    harness.server.enqueue_reply(
        "insert",
        doc! {
            "ok": 1,
            "n": 0,
            "writeErrors": [ { "index": 0, "code": 11000, "errmsg": "duplicate key" } ],
        },
    );

    let err = harness
        .client
        .insert_many("db", "coll", vec![doc! { "_id": 1 }], None, None)
        .await
        .unwrap_err();

    match *err.kind {
        crate::error::ErrorKind::Write(crate::error::WriteFailure::WriteError(ref inner)) => {
            assert_eq!(inner.code, 11000);
        }
        ref other => panic!("expected write error, got {:?}", other),
    }

    // Write errors come from the server having applied the command, so no retry occurs.
    let received = harness.server.received();
    assert_eq!(received_with_name(&received, "insert").len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn transaction_fields_are_attached() {
    let harness = single_member_rs_client().await;

    let mut session = harness.client.start_session(None).await.unwrap();
    session.start_transaction(None).await.unwrap();

    harness
        .client
        .insert_many("db", "coll", vec![doc! { "x": 1 }], None, &mut session)
        .await
        .unwrap();
    harness
        .client
        .insert_many("db", "coll", vec![doc! { "x": 2 }], None, &mut session)
        .await
        .unwrap();

    session.commit_transaction().await.unwrap();

    let received = harness.server.received();
    let inserts = received_with_name(&received, "insert");
    assert_eq!(inserts.len(), 2);

    // The first command of the transaction starts it; subsequent ones only continue it.
    assert!(inserts[0].get_bool("startTransaction").unwrap());
    assert!(!inserts[0].get_bool("autocommit").unwrap());
    assert!(!inserts[1].contains_key("startTransaction"));
    assert!(!inserts[1].get_bool("autocommit").unwrap());
    assert_eq!(
        inserts[0].get_i64("txnNumber").unwrap(),
        inserts[1].get_i64("txnNumber").unwrap()
    );

    let commits = received_with_name(&received, "commitTransaction");
    assert_eq!(commits.len(), 1);
    assert!(!commits[0].get_bool("autocommit").unwrap());
    assert_eq!(
        commits[0].get_document("lsid").unwrap(),
        inserts[0].get_document("lsid").unwrap()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn commit_of_empty_transaction_is_local() {
    let harness = single_member_rs_client().await;

    let mut session = harness.client.start_session(None).await.unwrap();
    session.start_transaction(None).await.unwrap();
    session.commit_transaction().await.unwrap();

    // Nothing ran in the transaction, so no commitTransaction reaches the server.
    let received = harness.server.received();
    assert!(received_with_name(&received, "commitTransaction").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn causally_consistent_reads_carry_after_cluster_time() {
    let harness = standalone_client().await;

    let operation_time = Timestamp {
        time: 42,
        increment: 7,
    };
    harness.server.enqueue_reply(
        "insert",
        doc! { "ok": 1, "n": 1, "operationTime": Bson::Timestamp(operation_time) },
    );
    harness.server.enqueue_reply(
        "find",
        doc! {
            "ok": 1,
            "cursor": { "id": 0i64, "ns": "db.coll", "firstBatch": [] },
        },
    );

    let mut session = harness.client.start_session(None).await.unwrap();
    harness
        .client
        .insert_many("db", "coll", vec![doc! { "x": 1 }], None, &mut session)
        .await
        .unwrap();
    assert_eq!(session.operation_time(), Some(operation_time));

    harness
        .client
        .find("db", "coll", None, None, None, &mut session)
        .await
        .unwrap();

    let received = harness.server.received();
    let finds = received_with_name(&received, "find");
    assert_eq!(finds.len(), 1);
    let read_concern = finds[0].get_document("readConcern").unwrap();
    assert_eq!(
        read_concern.get("afterClusterTime"),
        Some(&Bson::Timestamp(operation_time))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn command_monitoring_can_be_disabled() {
    let server = MockServer::start(standalone_hello()).await;
    let (events, registry) = EventBuffer::registry();

    let options = ClientOptions::builder()
        .hosts(vec![server.address()])
        .direct_connection(Some(true))
        .monitoring(Some(registry))
        .command_events(Some(false))
        .build();
    let client = Client::with_options(options).unwrap();

    client
        .run_command("admin", doc! { "ping": 1 }, None)
        .await
        .unwrap();

    assert!(events.command_events().is_empty());

    // Heartbeats still drive discovery: SDAM events are unaffected by the flag.
    wait_until(
        Duration::from_secs(5),
        || !events.sdam_events().is_empty(),
        "sdam events to be emitted",
    )
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn bulk_write_groups_commands() {
    let harness = standalone_client().await;

    let models = vec![
        crate::WriteModel::InsertOne {
            document: doc! { "_id": 1 },
        },
        crate::WriteModel::InsertOne {
            document: doc! { "_id": 2 },
        },
        crate::WriteModel::DeleteOne {
            filter: doc! { "_id": 1 },
        },
    ];

    let replies = harness
        .client
        .bulk_write("db", "coll", &models, None)
        .await
        .unwrap();
    assert_eq!(replies.len(), 2);

    let received = harness.server.received();
    let inserts = received_with_name(&received, "insert");
    assert_eq!(inserts.len(), 1);
    assert_eq!(inserts[0].get_array("documents").unwrap().len(), 2);
    assert_eq!(received_with_name(&received, "delete").len(), 1);
}
