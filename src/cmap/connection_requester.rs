use tokio::sync::{mpsc, oneshot};

use super::Connection;
use crate::{
    error::{Error, Result},
    runtime::{AsyncJoinHandle, WorkerHandle},
};

/// Returns a new requester/receiver pair.
pub(super) fn channel(handle: WorkerHandle) -> (ConnectionRequester, ConnectionRequestReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        ConnectionRequester {
            sender,
            _handle: handle,
        },
        ConnectionRequestReceiver { receiver },
    )
}

/// Handle for requesting Connections from the pool. This requester will keep the pool alive.
/// Once all requesters have been dropped, the pool will stop servicing requests, drop its
/// available connections, and close.
#[derive(Clone, Debug)]
pub(super) struct ConnectionRequester {
    sender: mpsc::UnboundedSender<ConnectionRequest>,
    _handle: WorkerHandle,
}

impl ConnectionRequester {
    /// Request a connection from the pool that owns the receiver end of this requester.
    /// Returns an error if the pool stops servicing requests before a connection could be
    /// delivered.
    pub(super) async fn request(&self) -> ConnectionRequestResult {
        let (sender, receiver) = oneshot::channel();

        // This only errors if the pool worker has stopped.
        if self.sender.send(ConnectionRequest { sender }).is_err() {
            return ConnectionRequestResult::PoolCleared(Box::new(Error::internal(
                "connection pool shut down while checking out a connection",
            )));
        }

        match receiver.await {
            Ok(ConnectionRequestResult::Establishing(handle)) => match handle.await {
                Ok(connection) => ConnectionRequestResult::Pooled(Box::new(connection)),
                Err(e) => ConnectionRequestResult::ConnectionEstablishmentFailed(Box::new(e)),
            },
            Ok(result) => result,
            Err(_) => ConnectionRequestResult::PoolCleared(Box::new(Error::internal(
                "connection pool shut down while checking out a connection",
            ))),
        }
    }
}

#[derive(Debug)]
pub(super) struct ConnectionRequestReceiver {
    receiver: mpsc::UnboundedReceiver<ConnectionRequest>,
}

impl ConnectionRequestReceiver {
    pub(super) async fn recv(&mut self) -> Option<ConnectionRequest> {
        self.receiver.recv().await
    }
}

/// Struct encapsulating a request for a connection.
#[derive(Debug)]
pub(super) struct ConnectionRequest {
    sender: oneshot::Sender<ConnectionRequestResult>,
}

impl ConnectionRequest {
    /// Respond to the connection request, either with a pooled connection or one that is
    /// establishing asynchronously. Returns the result back if the requester side stopped
    /// listening (e.g. because it hit its wait queue timeout).
    pub(super) fn fulfill(
        self,
        result: ConnectionRequestResult,
    ) -> std::result::Result<(), ConnectionRequestResult> {
        self.sender.send(result)
    }
}

#[derive(Debug)]
pub(super) enum ConnectionRequestResult {
    /// A connection that was already established and was simply checked out of the pool.
    Pooled(Box<Connection>),

    /// A new connection in the process of being established.
    /// The handle can be awaited upon to receive the established connection.
    Establishing(AsyncJoinHandle<Result<Connection>>),

    /// The request was rejected because the pool was cleared before it could
    /// be fulfilled. The error that caused the pool to be cleared is returned.
    PoolCleared(Box<Error>),

    /// The request set off an attempt to establish a new connection, and that attempt failed.
    ConnectionEstablishmentFailed(Box<Error>),
}

impl ConnectionRequestResult {
    pub(super) fn unwrap_pooled_connection(self) -> Connection {
        match self {
            ConnectionRequestResult::Pooled(c) => *c,
            _ => panic!("attempted to unwrap non-pooled connection request result"),
        }
    }
}
