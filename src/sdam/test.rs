use std::time::Duration;

use bson::{doc, oid::ObjectId};

use crate::{
    event::sdam::SdamEvent,
    options::ClientOptions,
    test::{replica_set_hello, standalone_hello, wait_until, EventBuffer, MockServer},
    Client,
    ServerType,
    TopologyType,
};

async fn poll_topology_type(client: &Client, expected: TopologyType) {
    let client = client.clone();
    wait_until(
        Duration::from_secs(10),
        move || client.topology().description().topology_type() == expected,
        "topology to transition",
    )
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn standalone_discovery() {
    let server = MockServer::start(standalone_hello()).await;
    let (events, registry) = EventBuffer::registry();

    let options = ClientOptions::builder()
        .hosts(vec![server.address()])
        .direct_connection(Some(true))
        .monitoring(Some(registry))
        .build();
    let client = Client::with_options(options).unwrap();

    poll_topology_type(&client, TopologyType::Single).await;

    let description = client.topology().description();
    let servers = description.servers();
    assert_eq!(servers.len(), 1);
    assert_eq!(servers[0].server_type(), ServerType::Standalone);

    // The discovery sequence emits the full set of lifecycle events.
    let events = events.sdam_events();
    assert!(events
        .iter()
        .any(|e| matches!(e, SdamEvent::TopologyOpening(_))));
    assert!(events
        .iter()
        .any(|e| matches!(e, SdamEvent::ServerOpening(_))));
    assert!(events
        .iter()
        .any(|e| matches!(e, SdamEvent::ServerHeartbeatStarted(e) if !e.awaited)));
    assert!(events
        .iter()
        .any(|e| matches!(e, SdamEvent::ServerHeartbeatSucceeded(_))));
    assert!(events
        .iter()
        .any(|e| matches!(e, SdamEvent::TopologyDescriptionChanged(_))));

    // The discovered server is usable.
    let reply = client.run_command("admin", doc! { "ping": 1 }, None).await.unwrap();
    assert_eq!(reply.get_i32("ok").ok(), Some(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn replica_set_discovery_and_failover() {
    let server_a = MockServer::start(doc! {}).await;
    let server_b = MockServer::start(doc! {}).await;
    let (addr_a, addr_b) = (server_a.address(), server_b.address());

    let election_1 = ObjectId::new();
    let election_2 = ObjectId::new();

    let mut primary_hello = replica_set_hello("rs0", true, &[&addr_a, &addr_b]);
    primary_hello.insert("setVersion", 1);
    primary_hello.insert("electionId", election_1);
    server_a.set_hello(primary_hello);
    server_b.set_hello(replica_set_hello("rs0", false, &[&addr_a, &addr_b]));

    // Seeding with only A, the rest of the set is discovered from the primary's host list.
    let options = ClientOptions::builder()
        .hosts(vec![addr_a.clone()])
        .repl_set_name(Some("rs0".to_string()))
        .build();
    let client = Client::with_options(options).unwrap();

    poll_topology_type(&client, TopologyType::ReplicaSetWithPrimary).await;
    {
        let watch_client = client.clone();
        wait_until(
            Duration::from_secs(10),
            move || watch_client.topology().description().servers().len() == 2,
            "secondary to be discovered",
        )
        .await;
    }

    // The primary fails; B has won the election in the meantime.
    let mut new_primary_hello = replica_set_hello("rs0", true, &[&addr_a, &addr_b]);
    new_primary_hello.insert("setVersion", 1);
    new_primary_hello.insert("electionId", election_2);
    server_b.set_hello(new_primary_hello);
    server_a.stop();

    // A retryable read against the primary: the first attempt fails against the stopped A,
    // marking it Unknown and triggering immediate checks; the retry selects B once its election
    // is observed.
    server_b.enqueue_reply(
        "find",
        doc! {
            "ok": 1,
            "cursor": { "id": 0i64, "ns": "db.coll", "firstBatch": [ { "_id": 1 } ] },
        },
    );
    let batch = client
        .find("db", "coll", doc! {}, None, None, None)
        .await
        .unwrap();
    assert_eq!(batch.first_batch.len(), 1);

    {
        let watch_client = client.clone();
        let addr_b = addr_b.clone();
        wait_until(
            Duration::from_secs(10),
            move || {
                let description = watch_client.topology().description();
                description.topology_type() == TopologyType::ReplicaSetWithPrimary
                    && description.servers().iter().any(|s| {
                        s.server_type() == ServerType::RsPrimary && s.address() == &addr_b
                    })
            },
            "B to become the primary",
        )
        .await;
    }
}
