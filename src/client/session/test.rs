use std::time::Duration;

use super::{ClientSession, ServerSession, ServerSessionPool, TransactionState};
use crate::{error::ErrorKind, options::ClientOptions, Client};

#[tokio::test]
async fn pool_returns_oldest_session_first() {
    let pool = ServerSessionPool::new();
    let timeout = Some(Duration::from_secs(30 * 60));

    let first = ServerSession::new();
    let second = ServerSession::new();
    let (first_id, second_id) = (first.id.clone(), second.id.clone());
    assert_ne!(first_id, second_id);

    pool.check_in(first, timeout).await;
    pool.check_in(second, timeout).await;

    assert_eq!(pool.check_out(timeout).await.id, first_id);
    assert_eq!(pool.check_out(timeout).await.id, second_id);

    // With the pool drained, a fresh session is created.
    let fresh = pool.check_out(timeout).await;
    assert_ne!(fresh.id, first_id);
    assert_ne!(fresh.id, second_id);
}

#[tokio::test]
async fn dirty_sessions_are_discarded() {
    let pool = ServerSessionPool::new();
    let timeout = Some(Duration::from_secs(30 * 60));

    let mut session = ServerSession::new();
    let id = session.id.clone();
    session.dirty = true;

    pool.check_in(session, timeout).await;
    assert!(!pool.contains(&id).await);
}

#[tokio::test]
async fn sessions_about_to_expire_are_discarded() {
    let pool = ServerSessionPool::new();

    // With a 30 second timeout, even a fresh session falls within the one minute expiration
    // buffer and must not be reused.
    let short_timeout = Some(Duration::from_secs(30));
    let session = ServerSession::new();
    let id = session.id.clone();
    pool.check_in(session, short_timeout).await;
    assert!(!pool.contains(&id).await);

    // Without a known timeout, sessions never expire client side.
    let session = ServerSession::new();
    let id = session.id.clone();
    pool.check_in(session, None).await;
    assert!(pool.contains(&id).await);
}

/// A client whose seed list points at nothing; useful for state-machine tests that never touch
/// the network.
fn detached_client() -> Client {
    let options = ClientOptions::builder()
        .hosts(vec![crate::options::ServerAddress::parse("localhost:9").unwrap()])
        .server_selection_timeout(Some(Duration::from_millis(100)))
        .build();
    Client::with_options(options).unwrap()
}

fn detached_session(client: &Client) -> ClientSession {
    ClientSession::new(ServerSession::new(), client.clone(), None, false)
}

#[tokio::test]
async fn transaction_state_transitions() {
    let client = detached_client();
    let mut session = detached_session(&client);

    assert_eq!(session.transaction.state, TransactionState::None);

    // Committing or aborting before starting is an error.
    assert!(matches!(
        *session.commit_transaction().await.unwrap_err().kind,
        ErrorKind::Transaction { .. }
    ));

    session.start_transaction(None).await.unwrap();
    assert_eq!(session.transaction.state, TransactionState::Starting);

    // Starting a transaction twice is an error.
    assert!(matches!(
        *session.start_transaction(None).await.unwrap_err().kind,
        ErrorKind::Transaction { .. }
    ));

    // Nothing ran, so the commit completes locally.
    session.commit_transaction().await.unwrap();
    assert_eq!(
        session.transaction.state,
        TransactionState::Committed {
            data_committed: false
        }
    );

    // A committed transaction cannot be aborted.
    assert!(matches!(
        *session.abort_transaction().await.unwrap_err().kind,
        ErrorKind::Transaction { .. }
    ));

    // But a new transaction can be started on the same session.
    session.start_transaction(None).await.unwrap();
    assert_eq!(session.transaction.state, TransactionState::Starting);
    session.abort_transaction().await.unwrap();
    assert_eq!(session.transaction.state, TransactionState::Aborted);

    // Aborting twice is an error.
    assert!(session.abort_transaction().await.is_err());
}

#[tokio::test]
async fn transaction_numbers_increase_per_transaction() {
    let client = detached_client();
    let mut session = detached_session(&client);

    session.start_transaction(None).await.unwrap();
    let first = session.txn_number();
    session.abort_transaction().await.unwrap();

    session.start_transaction(None).await.unwrap();
    assert_eq!(session.txn_number(), first + 1);
    session.abort_transaction().await.unwrap();
}

#[tokio::test]
async fn unacknowledged_transaction_write_concern_is_rejected() {
    use crate::{
        concern::{Acknowledgment, WriteConcern},
        options::TransactionOptions,
    };

    let client = detached_client();
    let mut session = detached_session(&client);

    let options = TransactionOptions::builder()
        .write_concern(Some(
            WriteConcern::builder().w(Some(Acknowledgment::Nodes(0))).build(),
        ))
        .build();

    assert!(session.start_transaction(options).await.is_err());
    assert_eq!(session.transaction.state, TransactionState::None);
}

#[tokio::test]
async fn session_ids_are_uuids() {
    let session = ServerSession::new();
    let binary = match session.id.get("id") {
        Some(bson::Bson::Binary(binary)) => binary,
        other => panic!("expected binary session id, got {:?}", other),
    };
    assert_eq!(binary.subtype, bson::spec::BinarySubtype::Uuid);
    assert_eq!(binary.bytes.len(), 16);
}
