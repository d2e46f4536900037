pub(crate) mod conn;
mod connection_requester;
pub(crate) mod establish;
mod manager;
pub(crate) mod options;
mod status;
#[cfg(test)]
mod test;
mod worker;

use std::{collections::HashMap, time::Duration, time::Instant};

use bson::oid::ObjectId;

use self::{
    connection_requester::{ConnectionRequestResult, ConnectionRequester},
    establish::ConnectionEstablisher,
    options::ConnectionPoolOptions,
    status::PoolGenerationSubscriber,
};
pub(crate) use self::{
    conn::{Command, CommandResponse, Connection, PooledConnection, StreamDescription},
    manager::BroadcastMessage,
};
use crate::{
    error::{Error, ErrorKind, Result},
    event::{
        cmap::{
            CmapEvent,
            ConnectionCheckoutFailedEvent,
            ConnectionCheckoutFailedReason,
            ConnectionCheckoutStartedEvent,
            PoolClearedEvent,
            PoolCreatedEvent,
        },
        MonitoringRegistry,
    },
    options::ServerAddress,
    sdam::TopologyUpdater,
};
use manager::PoolManager;
use worker::ConnectionPoolWorker;

const DEFAULT_MAX_POOL_SIZE: u32 = 100;
const DEFAULT_WAIT_QUEUE_TIMEOUT: Duration = Duration::from_secs(30);

/// A pool of connections implementing the CMAP spec.
///
/// This type is actually a handle to task that manages the connections and is cheap to clone and
/// pass around.
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub(crate) struct ConnectionPool {
    address: ServerAddress,
    manager: PoolManager,
    connection_requester: ConnectionRequester,
    generation_subscriber: PoolGenerationSubscriber,

    wait_queue_timeout: Option<Duration>,

    #[derivative(Debug = "ignore")]
    event_emitter: CmapEventEmitter,
}

impl ConnectionPool {
    pub(crate) fn new(
        address: ServerAddress,
        connection_establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        registry: MonitoringRegistry,
        options: Option<ConnectionPoolOptions>,
    ) -> Self {
        let event_emitter = CmapEventEmitter { registry };

        let wait_queue_timeout = options.as_ref().and_then(|opts| opts.wait_queue_timeout);

        let (manager, connection_requester, generation_subscriber) = ConnectionPoolWorker::start(
            address.clone(),
            connection_establisher,
            server_updater,
            event_emitter.clone(),
            options.clone(),
        );

        event_emitter.emit(CmapEvent::PoolCreated(PoolCreatedEvent {
            address: address.clone(),
            max_pool_size: options.as_ref().and_then(|o| o.max_pool_size),
            min_pool_size: options.as_ref().and_then(|o| o.min_pool_size),
        }));

        Self {
            address,
            manager,
            connection_requester,
            generation_subscriber,
            wait_queue_timeout,
            event_emitter,
        }
    }

    #[cfg(test)]
    pub(crate) fn new_mocked(address: ServerAddress) -> Self {
        use crate::runtime::WorkerHandle;

        let (manager, _) = manager::channel();
        let handle = WorkerHandle::new_mocked();
        let (connection_requester, _) = connection_requester::channel(handle);
        let (_, generation_subscriber) = status::channel(PoolGeneration::normal());

        Self {
            address,
            manager,
            connection_requester,
            generation_subscriber,
            wait_queue_timeout: None,
            event_emitter: CmapEventEmitter {
                registry: MonitoringRegistry::new(),
            },
        }
    }

    /// Checks out a connection from the pool. This method will block until this thread is at the
    /// front of the wait queue, and then will block again if no available connections are in the
    /// pool and the total number of connections is not less than the max pool size.
    pub(crate) async fn check_out(&self) -> Result<PooledConnection> {
        self.event_emitter
            .emit(CmapEvent::ConnectionCheckoutStarted(
                ConnectionCheckoutStartedEvent {
                    address: self.address.clone(),
                },
            ));

        let start_time = Instant::now();
        let timeout = self.wait_queue_timeout.unwrap_or(DEFAULT_WAIT_QUEUE_TIMEOUT);

        let response = crate::runtime::timeout(timeout, self.connection_requester.request()).await;

        let conn = match response {
            Ok(ConnectionRequestResult::Pooled(c)) => Ok(*c),
            Ok(ConnectionRequestResult::Establishing(_)) => Err(Error::internal(
                "pool handed back an in-progress establishment",
            )),
            Ok(ConnectionRequestResult::PoolCleared(e))
            | Ok(ConnectionRequestResult::ConnectionEstablishmentFailed(e)) => Err(*e),
            Err(_) => Err(ErrorKind::WaitQueueTimeout {
                address: self.address.clone(),
            }
            .into()),
        };

        match conn {
            Ok(ref conn) => {
                self.event_emitter.emit(CmapEvent::ConnectionCheckedOut(
                    conn.checked_out_event(start_time),
                ));
            }
            Err(ref err) => {
                let reason = if matches!(*err.kind, ErrorKind::WaitQueueTimeout { .. }) {
                    ConnectionCheckoutFailedReason::Timeout
                } else {
                    ConnectionCheckoutFailedReason::ConnectionError
                };
                self.event_emitter.emit(CmapEvent::ConnectionCheckoutFailed(
                    ConnectionCheckoutFailedEvent {
                        address: self.address.clone(),
                        reason,
                        duration: Instant::now().duration_since(start_time),
                    },
                ));
            }
        }

        conn.map(|c| PooledConnection::new(c, self.manager.clone()))
    }

    /// Increment the pool's generation, clearing its idle connections and (outside of
    /// load-balanced mode) pausing it until its server is confirmed healthy again. Returns once
    /// the clear has been processed, so no checkout started afterwards can observe the old
    /// generation.
    pub(crate) async fn clear(&self, cause: Error, service_id: Option<ObjectId>) {
        self.manager
            .clear(cause, service_id)
            .wait_for_acknowledgment()
            .await;
    }

    /// Mark the pool as "ready", allowing connections to be created and checked out.
    pub(crate) async fn mark_as_ready(&self) {
        self.manager.mark_as_ready().wait_for_acknowledgment().await;
    }

    pub(crate) fn generation(&self) -> PoolGeneration {
        self.generation_subscriber.generation()
    }

    /// Broadcast a message to the pool's worker, waiting until it has been handled.
    pub(crate) async fn broadcast(&self, message: BroadcastMessage) {
        self.manager.broadcast(message).wait_for_acknowledgment().await;
    }
}

/// The current generation of a pool, against which connection staleness is judged.
#[derive(Clone, Debug)]
pub(crate) enum PoolGeneration {
    /// The pool has a single global generation, bumped on every clear.
    Normal(u32),

    /// In load-balanced mode, generations are tracked per `serviceId` so that clears can be
    /// scoped to a single backend.
    LoadBalanced(HashMap<ObjectId, u32>),
}

impl PoolGeneration {
    pub(crate) fn normal() -> Self {
        Self::Normal(0)
    }

    pub(crate) fn load_balanced() -> Self {
        Self::LoadBalanced(HashMap::new())
    }
}

/// An event emitter scoped to a single pool; events are forwarded to the monitoring registry the
/// owning client was configured with.
#[derive(Clone)]
pub(crate) struct CmapEventEmitter {
    registry: MonitoringRegistry,
}

impl CmapEventEmitter {
    pub(crate) fn new(registry: MonitoringRegistry) -> Self {
        Self { registry }
    }

    pub(crate) fn emit(&self, event: CmapEvent) {
        self.registry.emit_cmap(&event);
    }
}

impl std::fmt::Debug for CmapEventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CmapEventEmitter").finish()
    }
}
