use bson::oid::ObjectId;
use tokio::sync::mpsc;

use super::Connection;
use crate::{
    error::Error,
    runtime::{AcknowledgedMessage, AcknowledgmentReceiver},
};

/// Constructs a new channel for a pool manager and the worker end that receives its requests.
pub(super) fn channel() -> (PoolManager, ManagementRequestReceiver) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        PoolManager { sender },
        ManagementRequestReceiver { receiver },
    )
}

/// A handle used to manage the connection pool. This can be freely cloned and sent across tasks.
#[derive(Clone, Debug)]
pub(crate) struct PoolManager {
    sender: mpsc::UnboundedSender<PoolManagementRequest>,
}

impl PoolManager {
    /// Clear the pool, transitioning it to Paused (outside of load-balanced mode). The returned
    /// receiver resolves once the worker has processed the clear, guaranteeing that no
    /// subsequent checkout can be handed a connection from the old generation.
    pub(crate) fn clear(
        &self,
        cause: Error,
        service_id: Option<ObjectId>,
    ) -> AcknowledgmentReceiver<()> {
        let (completion_handler, receiver) = AcknowledgedMessage::package(());
        let _: std::result::Result<_, _> = self.sender.send(PoolManagementRequest::Clear {
            cause,
            service_id,
            completion_handler,
        });
        receiver
    }

    /// Mark the pool as ready, returning a receiver that resolves once the worker has processed
    /// the transition.
    pub(crate) fn mark_as_ready(&self) -> AcknowledgmentReceiver<()> {
        let (message, receiver) = AcknowledgedMessage::package(());
        let _: std::result::Result<_, _> = self.sender.send(PoolManagementRequest::MarkAsReady {
            completion_handler: message,
        });
        receiver
    }

    /// Check the provided connection back into the pool.
    pub(crate) fn check_in(&self, connection: Connection) {
        if let Err(request) = self
            .sender
            .send(PoolManagementRequest::CheckIn(Box::new(connection)))
        {
            // The worker has stopped; the connection is closed by dropping it.
            drop(request);
        }
    }

    /// Note that establishing a connection for a checkout succeeded. When the connection was
    /// established for the pool itself (min pool size population), it is included here.
    pub(super) fn handle_connection_succeeded(&self, connection: Option<Connection>) {
        let _: std::result::Result<_, _> = self.sender.send(
            PoolManagementRequest::HandleConnectionSucceeded(connection.map(Box::new)),
        );
    }

    /// Note that establishing a connection failed, releasing the pending slot.
    pub(super) fn handle_connection_failed(&self) {
        let _: std::result::Result<_, _> = self
            .sender
            .send(PoolManagementRequest::HandleConnectionFailed);
    }

    /// Send a broadcast message to the worker, returning a receiver that resolves once the
    /// message has been handled.
    pub(crate) fn broadcast(
        &self,
        message: BroadcastMessage,
    ) -> AcknowledgmentReceiver<()> {
        let (message, receiver) = AcknowledgedMessage::package(message);
        let _: std::result::Result<_, _> =
            self.sender.send(PoolManagementRequest::Broadcast(message));
        receiver
    }
}

#[derive(Debug)]
pub(super) struct ManagementRequestReceiver {
    pub(super) receiver: mpsc::UnboundedReceiver<PoolManagementRequest>,
}

impl ManagementRequestReceiver {
    pub(super) async fn recv(&mut self) -> Option<PoolManagementRequest> {
        self.receiver.recv().await
    }
}

/// Requests that can be sent to the pool's worker.
#[derive(Debug)]
pub(super) enum PoolManagementRequest {
    /// Clear the pool, transitioning it to Paused.
    Clear {
        cause: Error,
        service_id: Option<ObjectId>,
        completion_handler: AcknowledgedMessage<()>,
    },

    /// Mark the pool as Ready, allowing connections to be created and checked out.
    MarkAsReady {
        completion_handler: AcknowledgedMessage<()>,
    },

    /// Check in the given connection.
    CheckIn(Box<Connection>),

    /// Update the pool based on the given establishment success.
    HandleConnectionSucceeded(Option<Box<Connection>>),

    /// Update the pool after an establishment failure.
    HandleConnectionFailed,

    /// Handle a message broadcast from the topology.
    Broadcast(AcknowledgedMessage<BroadcastMessage>),
}

/// Messages broadcast from the topology to all of its pools.
#[derive(Debug, Clone)]
pub(crate) enum BroadcastMessage {
    /// Close all connections and stop servicing requests.
    Shutdown,

    /// Populate the pool up to `min_pool_size`.
    FillPool,
}
