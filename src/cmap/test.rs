use std::time::Duration;

use bson::{doc, oid::ObjectId};

use super::{establish::ConnectionEstablisher, options::ConnectionPoolOptions, ConnectionPool};
use crate::{
    cmap::establish::EstablisherOptions,
    error::{Error, ErrorKind},
    event::cmap::{CmapEvent, ConnectionCheckoutFailedReason, ConnectionClosedReason},
    options::ClientOptions,
    runtime,
    sdam::TopologyUpdater,
    test::{standalone_hello, wait_until, EventBuffer, MockServer},
};

/// A topology updater whose receiving end acknowledges every message and otherwise ignores it.
fn detached_updater() -> TopologyUpdater {
    let (updater, mut receiver) = TopologyUpdater::channel();
    runtime::spawn(async move {
        while let Some(message) = receiver.recv().await {
            let (_, ack) = message.into_parts();
            ack.acknowledge(false);
        }
    });
    updater
}

fn establisher(options: &ClientOptions) -> ConnectionEstablisher {
    ConnectionEstablisher::new(EstablisherOptions::from_client_options(options)).unwrap()
}

struct PoolHarness {
    pool: ConnectionPool,
    events: EventBuffer,
    _server: MockServer,
}

async fn harness(configure: impl FnOnce(&mut ConnectionPoolOptions)) -> PoolHarness {
    harness_with_hello(standalone_hello(), false, configure).await
}

async fn harness_with_hello(
    hello: bson::Document,
    load_balanced: bool,
    configure: impl FnOnce(&mut ConnectionPoolOptions),
) -> PoolHarness {
    let server = MockServer::start(hello).await;
    let (events, registry) = EventBuffer::registry();

    let mut client_options = ClientOptions::builder().hosts(vec![server.address()]).build();
    client_options.load_balanced = load_balanced.then_some(true);

    let mut pool_options = ConnectionPoolOptions::from_client_options(&client_options);
    pool_options.wait_queue_timeout = Some(Duration::from_secs(5));
    configure(&mut pool_options);

    let pool = ConnectionPool::new(
        server.address(),
        establisher(&client_options),
        detached_updater(),
        registry,
        Some(pool_options),
    );
    pool.mark_as_ready().await;

    PoolHarness {
        pool,
        events,
        _server: server,
    }
}

fn closed_reasons(events: &EventBuffer) -> Vec<ConnectionClosedReason> {
    events
        .cmap_events()
        .iter()
        .filter_map(|event| match event {
            CmapEvent::ConnectionClosed(e) => Some(e.reason),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn checked_in_connection_is_reused_most_recently_used_first() {
    let harness = harness(|_| {}).await;

    let conn1 = harness.pool.check_out().await.unwrap();
    let first_id = conn1.id;
    drop(conn1);

    // Wait for the check-in to be processed before checking out again.
    wait_until(
        Duration::from_secs(5),
        || {
            harness
                .events
                .cmap_events()
                .iter()
                .any(|event| matches!(event, CmapEvent::ConnectionCheckedIn(_)))
        },
        "connection to be checked in",
    )
    .await;

    let conn2 = harness.pool.check_out().await.unwrap();
    assert_eq!(conn2.id, first_id, "idle connection should be reused");

    let names: Vec<&'static str> = harness.events.cmap_events().iter().map(|e| e.name()).collect();
    assert!(names.contains(&"ConnectionCreated"));
    assert!(names.contains(&"ConnectionReady"));
    assert!(names.contains(&"ConnectionCheckedOut"));
}

// Three concurrent checkouts against a pool of two: the first two succeed, the third parks and
// is satisfied by an early return, or fails with a timeout when nothing is returned in time.
#[tokio::test]
async fn wait_queue_timeout_applies_to_parked_checkouts() {
    let harness = harness(|options| {
        options.max_pool_size = Some(2);
        options.wait_queue_timeout = Some(Duration::from_millis(100));
    })
    .await;

    let conn1 = harness.pool.check_out().await.unwrap();
    let conn2 = harness.pool.check_out().await.unwrap();

    // An early return satisfies the parked checkout.
    let pool = harness.pool.clone();
    let parked = runtime::spawn(async move { pool.check_out().await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(conn1);
    let conn3 = parked.await.unwrap();

    // With both connections held past the timeout, the parked checkout fails.
    let pool = harness.pool.clone();
    let parked = runtime::spawn(async move { pool.check_out().await });
    let err: Error = parked.await.unwrap_err();
    assert!(matches!(*err.kind, ErrorKind::WaitQueueTimeout { .. }));

    wait_until(
        Duration::from_secs(5),
        || {
            harness.events.cmap_events().iter().any(|event| {
                matches!(
                    event,
                    CmapEvent::ConnectionCheckoutFailed(e)
                        if e.reason == ConnectionCheckoutFailedReason::Timeout
                )
            })
        },
        "checkout failed event with timeout reason",
    )
    .await;

    // Returns after the timeout still succeed for later checkouts.
    drop(conn2);
    drop(conn3);
    let _conn = harness.pool.check_out().await.unwrap();
}

#[tokio::test]
async fn wait_queue_is_fifo() {
    let harness = harness(|options| {
        options.max_pool_size = Some(1);
    })
    .await;

    let held = harness.pool.check_out().await.unwrap();

    let pool_a = harness.pool.clone();
    let waiter_a = runtime::spawn(async move {
        let conn = pool_a.check_out().await.unwrap();
        (std::time::Instant::now(), conn)
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let pool_b = harness.pool.clone();
    let waiter_b = runtime::spawn(async move {
        let _conn = pool_b.check_out().await.unwrap();
        std::time::Instant::now()
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Releasing the connection must serve A (the first parked waiter) before B.
    drop(held);
    let (a_time, conn_a) = waiter_a.await;
    drop(conn_a);
    let b_time = waiter_b.await;

    assert!(a_time < b_time, "first parked waiter should be served first");
}

#[tokio::test]
async fn clear_pauses_pool_and_closes_stale_connections() {
    let harness = harness(|_| {}).await;

    let conn = harness.pool.check_out().await.unwrap();
    let stale_id = conn.id;

    harness
        .pool
        .clear(Error::internal("testing"), None)
        .await;

    // A cleared pool fails checkouts until its server is confirmed healthy again.
    let err = harness.pool.check_out().await.unwrap_err();
    assert!(err.is_pool_cleared(), "{:?}", err);

    harness.pool.mark_as_ready().await;

    // The connection checked out before the clear must never be reused.
    drop(conn);
    let fresh = harness.pool.check_out().await.unwrap();
    assert_ne!(fresh.id, stale_id);

    wait_until(
        Duration::from_secs(5),
        || closed_reasons(&harness.events).contains(&ConnectionClosedReason::Stale),
        "stale connection to be closed",
    )
    .await;

    let pool_cleared_emitted = harness
        .events
        .cmap_events()
        .iter()
        .any(|event| matches!(event, CmapEvent::PoolCleared(_)));
    assert!(pool_cleared_emitted);
}

#[tokio::test]
async fn min_pool_size_is_populated_in_background() {
    let harness = harness(|options| {
        options.min_pool_size = Some(2);
    })
    .await;

    wait_until(
        Duration::from_secs(5),
        || {
            harness
                .events
                .cmap_events()
                .iter()
                .filter(|event| matches!(event, CmapEvent::ConnectionReady(_)))
                .count()
                >= 2
        },
        "min pool size to be populated",
    )
    .await;

    // Both connections are immediately available.
    let c1 = harness.pool.check_out().await.unwrap();
    let c2 = harness.pool.check_out().await.unwrap();
    assert_ne!(c1.id, c2.id);
}

// In load-balanced mode, clears are scoped to a backend: connections for other services stay
// usable.
#[tokio::test]
async fn load_balanced_clear_is_scoped_to_service() {
    let service_1 = ObjectId::new();
    let service_2 = ObjectId::new();

    let mut hello = standalone_hello();
    hello.insert("serviceId", service_1);
    hello.insert("msg", "isdbgrid");

    let harness = harness_with_hello(hello, true, |_| {}).await;

    let conn1 = harness.pool.check_out().await.unwrap();
    assert_eq!(conn1.service_id(), Some(service_1));
    let conn1_id = conn1.id;

    // The next connection is routed (by the load balancer) to a different backend.
    let mut hello = standalone_hello();
    hello.insert("serviceId", service_2);
    hello.insert("msg", "isdbgrid");
    harness._server.set_hello(hello);

    let conn2 = harness.pool.check_out().await.unwrap();
    assert_eq!(conn2.service_id(), Some(service_2));
    let conn2_id = conn2.id;

    // Park both connections in the pool, then clear service 1 only.
    drop(conn1);
    drop(conn2);
    wait_until(
        Duration::from_secs(5),
        || {
            harness
                .events
                .cmap_events()
                .iter()
                .filter(|event| matches!(event, CmapEvent::ConnectionCheckedIn(_)))
                .count()
                >= 2
        },
        "both connections to be checked in",
    )
    .await;

    harness
        .pool
        .clear(Error::internal("testing"), Some(service_1))
        .await;

    wait_until(
        Duration::from_secs(5),
        || {
            harness.events.cmap_events().iter().any(|event| {
                matches!(
                    event,
                    CmapEvent::ConnectionClosed(e)
                        if e.reason == ConnectionClosedReason::Stale && e.connection_id == conn1_id
                )
            })
        },
        "service 1 connection to be closed as stale",
    )
    .await;

    // A load-balanced pool is not paused by a clear, and the service-2 connection survives.
    let survivor = harness.pool.check_out().await.unwrap();
    assert_eq!(survivor.id, conn2_id);
    assert_eq!(survivor.service_id(), Some(service_2));
}
