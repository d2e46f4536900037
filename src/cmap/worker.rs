use std::{collections::VecDeque, time::Duration};

use super::{
    conn::PendingConnection,
    connection_requester,
    connection_requester::{
        ConnectionRequest,
        ConnectionRequestReceiver,
        ConnectionRequestResult,
        ConnectionRequester,
    },
    establish::ConnectionEstablisher,
    manager,
    manager::{BroadcastMessage, ManagementRequestReceiver, PoolManagementRequest, PoolManager},
    options::ConnectionPoolOptions,
    status,
    status::{PoolGenerationPublisher, PoolGenerationSubscriber},
    CmapEventEmitter,
    Connection,
    PoolGeneration,
    DEFAULT_MAX_POOL_SIZE,
};
use crate::{
    error::Error,
    event::cmap::{
        CmapEvent,
        ConnectionClosedReason,
        PoolClearedEvent,
        PoolClosedEvent,
        PoolReadyEvent,
    },
    options::ServerAddress,
    runtime::{self, WorkerHandleListener},
    sdam::TopologyUpdater,
};

pub(crate) const DEFAULT_MAINTENANCE_FREQUENCY: Duration = Duration::from_millis(500);

/// The maximum number of connections the background populator will establish concurrently.
const MAX_CONNECTING: u32 = 2;

/// A worker task that manages the shared state of the pool.
#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct ConnectionPoolWorker {
    /// The address the pool's connections will connect to.
    address: ServerAddress,

    /// Current state of the pool. Determines if connections may be checked out
    /// and if min_pool_size connection creation should continue.
    state: PoolState,

    /// The total number of connections managed by the pool, including connections which are
    /// currently checked out of the pool or have yet to be established.
    total_connection_count: u32,

    /// The number of connections currently being established by this pool.
    pending_connection_count: u32,

    /// The ID of the next connection created by the pool.
    next_connection_id: u32,

    /// The current generation of the pool. The generation is incremented whenever the pool is
    /// cleared. Connections belonging to a previous generation are considered stale and will be
    /// closed when checked back in or when popped off of the set of available connections.
    generation: PoolGeneration,

    /// The established connections that are currently checked into the pool and awaiting usage in
    /// future operations.
    available_connections: VecDeque<Connection>,

    /// Contains the logic for "establishing" a connection. This includes handshaking and
    /// authenticating a connection when it's first created.
    establisher: ConnectionEstablisher,

    /// The event emitter attached to this pool.
    #[derivative(Debug = "ignore")]
    event_emitter: CmapEventEmitter,

    /// The time between maintenance tasks.
    maintenance_frequency: Duration,

    /// Connections that have been ready for usage in the pool for longer than `max_idle_time`
    /// will be closed either by the background thread or when popped off of the set of available
    /// connections. If `max_idle_time` is `None`, then connections will not be closed due to
    /// being idle.
    max_idle_time: Option<Duration>,

    /// The minimum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool. If fewer than `min_pool_size`
    /// connections are in the pool, the background thread will create more connections and add
    /// them to the pool.
    min_pool_size: Option<u32>,

    /// The maximum number of connections that the pool can manage, including connections checked
    /// out of the pool. If a checkout arrives when the pool is empty and there are already
    /// `max_pool_size` connections in use, it will block until an in-progress operation finishes
    /// and its connection is checked back in.
    max_pool_size: u32,

    /// Receiver used to determine if any threads hold references to this pool. If all the
    /// sender ends of this receiver drop, this worker will be notified and drop too.
    handle_listener: WorkerHandleListener,

    /// Receiver for incoming connection check out requests.
    request_receiver: ConnectionRequestReceiver,

    /// Ordered queue of incoming requests waiting for connections.
    wait_queue: VecDeque<ConnectionRequest>,

    /// Receiver for incoming pool management requests (e.g. checking in a connection).
    management_receiver: ManagementRequestReceiver,

    /// Sender used to publish the latest generation.
    generation_publisher: PoolGenerationPublisher,

    /// A pool manager that can be cloned and attached to connections checked out of the pool.
    manager: PoolManager,

    /// A handle used to notify SDAM that a connection establishment error happened. This will
    /// allow the server to transition to Unknown and clear the pool as necessary.
    server_updater: TopologyUpdater,
}

impl ConnectionPoolWorker {
    /// Starts a worker and returns a manager and connection requester.
    pub(super) fn start(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        server_updater: TopologyUpdater,
        event_emitter: CmapEventEmitter,
        options: Option<ConnectionPoolOptions>,
    ) -> (PoolManager, ConnectionRequester, PoolGenerationSubscriber) {
        // The CMAP spec indicates that a max idle time of zero means that connections should not
        // be closed due to idleness.
        let mut max_idle_time = options.as_ref().and_then(|opts| opts.max_idle_time);
        if max_idle_time == Some(Duration::from_millis(0)) {
            max_idle_time = None;
        }

        let max_pool_size = options
            .as_ref()
            .and_then(|opts| opts.max_pool_size)
            .unwrap_or(DEFAULT_MAX_POOL_SIZE);

        let min_pool_size = options.as_ref().and_then(|opts| opts.min_pool_size);

        let generation = if options
            .as_ref()
            .and_then(|opts| opts.load_balanced)
            .unwrap_or(false)
        {
            PoolGeneration::load_balanced()
        } else {
            PoolGeneration::normal()
        };

        let state = if options.as_ref().and_then(|opts| opts.ready).unwrap_or(false) {
            PoolState::Ready
        } else {
            // Pools are born paused and become ready on the first successful monitor check of
            // their server.
            PoolState::New
        };

        let maintenance_frequency = options
            .as_ref()
            .and_then(|opts| opts.maintenance_frequency_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_MAINTENANCE_FREQUENCY);

        let (handle, handle_listener) = WorkerHandleListener::channel();
        let (connection_requester, request_receiver) = connection_requester::channel(handle);
        let (manager, management_receiver) = manager::channel();
        let (generation_publisher, generation_subscriber) = status::channel(generation.clone());

        let worker = ConnectionPoolWorker {
            address,
            event_emitter,
            max_idle_time,
            min_pool_size,
            establisher,
            next_connection_id: 1,
            total_connection_count: 0,
            pending_connection_count: 0,
            generation,
            available_connections: VecDeque::new(),
            max_pool_size,
            request_receiver,
            wait_queue: Default::default(),
            management_receiver,
            manager: manager.clone(),
            handle_listener,
            state,
            generation_publisher,
            maintenance_frequency,
            server_updater,
        };

        runtime::spawn(async move {
            worker.execute().await;
        });

        (manager, connection_requester, generation_subscriber)
    }

    /// Run the worker, listening on the various receivers until all pool handles have been
    /// dropped. Once all handles are dropped, the pool will close any available connections and
    /// emit a pool closed event.
    async fn execute(mut self) {
        let mut maintenance_interval = runtime::interval(self.maintenance_frequency);

        loop {
            let task = tokio::select! {
                Some(request) = self.request_receiver.recv() => {
                    PoolTask::CheckOut(request)
                },
                Some(request) = self.management_receiver.recv() => request.into(),
                _ = self.handle_listener.wait_for_all_handle_drops() => {
                    // All worker handles have been dropped meaning this
                    // pool has no more references and can be dropped itself.
                    break
                },
                _ = maintenance_interval.tick() => {
                    PoolTask::Maintenance
                },
                else => {
                    break
                }
            };

            match task {
                PoolTask::CheckOut(request) => match self.state {
                    PoolState::Ready => {
                        self.wait_queue.push_back(request);
                    }
                    PoolState::New => {
                        let cause = Error::internal(
                            "attempted to check out a connection before the pool was ready",
                        );
                        let error = Error::pool_cleared_error(&self.address, &cause);
                        let _: std::result::Result<_, _> =
                            request.fulfill(ConnectionRequestResult::PoolCleared(Box::new(error)));
                    }
                    PoolState::Paused(ref cause) => {
                        let error = Error::pool_cleared_error(&self.address, cause);
                        // If the receiver doesn't listen to the error, that's ok.
                        let _: std::result::Result<_, _> =
                            request.fulfill(ConnectionRequestResult::PoolCleared(Box::new(error)));
                    }
                },
                PoolTask::HandleManagementRequest(request) => match request {
                    PoolManagementRequest::CheckIn(connection) => {
                        self.check_in(*connection);
                    }
                    PoolManagementRequest::Clear {
                        cause,
                        service_id,
                        completion_handler,
                    } => {
                        self.clear(cause, service_id);
                        let (_, ack) = completion_handler.into_parts();
                        ack.acknowledge(());
                    }
                    PoolManagementRequest::MarkAsReady { completion_handler } => {
                        self.mark_as_ready();
                        let (_, ack) = completion_handler.into_parts();
                        ack.acknowledge(());
                    }
                    PoolManagementRequest::HandleConnectionSucceeded(connection) => {
                        self.handle_connection_succeeded(connection.map(|c| *c));
                    }
                    PoolManagementRequest::HandleConnectionFailed => {
                        self.handle_connection_failed();
                    }
                    PoolManagementRequest::Broadcast(message) => {
                        let (message, ack) = message.into_parts();
                        match message {
                            BroadcastMessage::Shutdown => {
                                self.shutdown();
                                ack.acknowledge(());
                                return;
                            }
                            BroadcastMessage::FillPool => {
                                self.ensure_min_connections();
                                ack.acknowledge(());
                            }
                        }
                    }
                },
                PoolTask::Maintenance => self.perform_maintenance(),
            }

            while self.can_service_connection_request() {
                match self.wait_queue.pop_front() {
                    Some(request) => self.check_out(request),
                    None => break,
                }
            }
        }

        self.shutdown();
    }

    fn can_service_connection_request(&self) -> bool {
        if !matches!(self.state, PoolState::Ready) {
            return false;
        }

        if !self.available_connections.is_empty() {
            return true;
        }

        self.total_connection_count < self.max_pool_size
    }

    fn check_out(&mut self, request: ConnectionRequest) {
        // First attempt to check out an available connection, preferring the most recently used.
        while let Some(mut conn) = self.available_connections.pop_back() {
            // Close the connection if it's stale.
            if conn.is_stale(&self.generation) {
                self.close_connection(conn, ConnectionClosedReason::Stale);
                continue;
            }

            // Close the connection if it's idle.
            if conn.is_idle(self.max_idle_time) {
                self.close_connection(conn, ConnectionClosedReason::Idle);
                continue;
            }

            conn.mark_as_in_use();
            if let Err(result) = request.fulfill(ConnectionRequestResult::Pooled(Box::new(conn))) {
                // The checking-out task stopped listening, e.g. because it hit its wait queue
                // timeout, so the connection is put back into the pool.
                let mut connection = result.unwrap_pooled_connection();
                connection.mark_as_available();
                self.available_connections.push_back(connection);
            }

            return;
        }

        // Otherwise, attempt to create a connection.
        let pending_connection = self.create_pending_connection();
        let establisher = self.establisher.clone();
        let manager = self.manager.clone();
        let server_updater = self.server_updater.clone();
        let event_emitter = self.event_emitter.clone();
        let address = self.address.clone();

        let handle = runtime::spawn(async move {
            let mut establish_result =
                establisher.establish_connection(pending_connection).await;

            match establish_result {
                Ok(ref mut connection) => {
                    event_emitter.emit(CmapEvent::ConnectionReady(connection.ready_event()));
                    connection.mark_as_in_use();
                    manager.handle_connection_succeeded(None);
                }
                Err(ref e) => {
                    manager.handle_connection_failed();
                    server_updater
                        .handle_application_error(
                            address,
                            e.cause.clone(),
                            e.handshake_phase.clone(),
                        )
                        .await;
                }
            }

            establish_result.map_err(|e| e.cause)
        });

        // This only fails if the other end stopped listening (e.g. due to timeout), in
        // which case the connection is checked in once establishment completes.
        if let Err(ConnectionRequestResult::Establishing(handle)) =
            request.fulfill(ConnectionRequestResult::Establishing(handle))
        {
            let manager = self.manager.clone();
            runtime::spawn(async move {
                if let Ok(connection) = handle.await {
                    manager.check_in(connection);
                }
            });
        }
    }

    fn create_pending_connection(&mut self) -> PendingConnection {
        self.total_connection_count += 1;
        self.pending_connection_count += 1;

        let pending_connection = PendingConnection {
            id: self.next_connection_id,
            address: self.address.clone(),
            generation: self.generation.clone(),
            event_emitter: self.event_emitter.clone(),
        };
        self.next_connection_id += 1;
        self.event_emitter
            .emit(CmapEvent::ConnectionCreated(pending_connection.created_event()));

        pending_connection
    }

    /// Process a connection establishment failure.
    fn handle_connection_failed(&mut self) {
        // Establishing a pending connection failed, so that must be reflected in the total
        // connection count.
        self.total_connection_count -= 1;
        self.pending_connection_count -= 1;
    }

    /// Process a successful connection establishment, optionally populating the pool with the
    /// resulting connection.
    fn handle_connection_succeeded(&mut self, connection: Option<Connection>) {
        self.pending_connection_count -= 1;
        if let Some(mut connection) = connection {
            connection.mark_as_available();
            self.available_connections.push_back(connection);
        }
    }

    fn check_in(&mut self, mut conn: Connection) {
        self.event_emitter
            .emit(CmapEvent::ConnectionCheckedIn(conn.checked_in_event()));

        conn.mark_as_available();

        if conn.has_errored() {
            self.close_connection(conn, ConnectionClosedReason::Error);
        } else if conn.is_stale(&self.generation) {
            self.close_connection(conn, ConnectionClosedReason::Stale);
        } else if conn.is_executing() {
            self.close_connection(conn, ConnectionClosedReason::Dropped);
        } else {
            self.available_connections.push_back(conn);
        }
    }

    fn clear(&mut self, cause: Error, service_id: Option<bson::oid::ObjectId>) {
        let was_ready = matches!(self.state, PoolState::Ready);

        match (&mut self.generation, service_id) {
            (PoolGeneration::Normal(gen), None) => {
                *gen += 1;
                // Clearing a pool pauses it until its server is confirmed healthy again.
                self.state = PoolState::Paused(cause.clone());
            }
            (PoolGeneration::LoadBalanced(gen_map), Some(service_id)) => {
                // Load-balanced pools are never paused; generations are scoped to services.
                *gen_map.entry(service_id).or_insert(0) += 1;
            }
            // A load-balanced pool can only be cleared for a specific service.
            _ => return,
        }
        self.generation_publisher.publish(self.generation.clone());

        // Eagerly close any newly-stale idle connections.
        let generation = self.generation.clone();
        let mut retained = VecDeque::new();
        while let Some(conn) = self.available_connections.pop_front() {
            if conn.is_stale(&generation) {
                self.close_connection(conn, ConnectionClosedReason::Stale);
            } else {
                retained.push_back(conn);
            }
        }
        self.available_connections = retained;

        if was_ready || matches!(self.generation, PoolGeneration::LoadBalanced(_)) {
            self.event_emitter.emit(CmapEvent::PoolCleared(PoolClearedEvent {
                address: self.address.clone(),
                service_id,
            }));

            // Clearing wakes all parked waiters with an error.
            if !matches!(self.generation, PoolGeneration::LoadBalanced(_)) {
                for request in self.wait_queue.drain(..) {
                    let error = Error::pool_cleared_error(&self.address, &cause);
                    let _: std::result::Result<_, _> =
                        request.fulfill(ConnectionRequestResult::PoolCleared(Box::new(error)));
                }
            }
        }
    }

    fn mark_as_ready(&mut self) {
        if matches!(self.state, PoolState::Ready) {
            return;
        }

        self.state = PoolState::Ready;
        self.event_emitter.emit(CmapEvent::PoolReady(PoolReadyEvent {
            address: self.address.clone(),
        }));

        self.ensure_min_connections();
    }

    /// Close a connection, emit the event for it being closed, and decrement the
    /// total connection count.
    fn close_connection(&mut self, connection: Connection, reason: ConnectionClosedReason) {
        connection.close_and_drop(reason);
        self.total_connection_count -= 1;
    }

    /// Ensure all connections in the pool are valid and that the pool is managing at least
    /// min_pool_size connections.
    fn perform_maintenance(&mut self) {
        self.remove_perished_connections();
        if matches!(self.state, PoolState::Ready) {
            self.ensure_min_connections();
        }
    }

    /// Iterate over the connections and remove any that are stale or idle.
    fn remove_perished_connections(&mut self) {
        while let Some(connection) = self.available_connections.pop_front() {
            if connection.is_stale(&self.generation) {
                self.close_connection(connection, ConnectionClosedReason::Stale);
            } else if connection.is_idle(self.max_idle_time) {
                self.close_connection(connection, ConnectionClosedReason::Idle);
            } else {
                self.available_connections.push_front(connection);
                // All subsequent connections are either not idle or not stale since they were
                // checked into the pool later, so we can just quit early.
                break;
            }
        }
    }

    /// Populate the pool with enough connections to meet the min_pool_size requirement.
    fn ensure_min_connections(&mut self) {
        if let Some(min_pool_size) = self.min_pool_size {
            while self.total_connection_count < min_pool_size
                && self.pending_connection_count < MAX_CONNECTING
            {
                let pending_connection = self.create_pending_connection();
                let event_emitter = self.event_emitter.clone();
                let manager = self.manager.clone();
                let establisher = self.establisher.clone();
                let updater = self.server_updater.clone();
                let address = self.address.clone();
                runtime::spawn(async move {
                    let result = establisher.establish_connection(pending_connection).await;

                    match result {
                        Ok(connection) => {
                            event_emitter
                                .emit(CmapEvent::ConnectionReady(connection.ready_event()));
                            manager.handle_connection_succeeded(Some(connection));
                        }
                        Err(e) => {
                            manager.handle_connection_failed();
                            updater
                                .handle_application_error(
                                    address,
                                    e.cause.clone(),
                                    e.handshake_phase.clone(),
                                )
                                .await;
                        }
                    }
                });
            }
        }
    }

    fn shutdown(&mut self) {
        while let Some(connection) = self.available_connections.pop_front() {
            connection.close_and_drop(ConnectionClosedReason::PoolClosed);
        }

        self.event_emitter.emit(CmapEvent::PoolClosed(PoolClosedEvent {
            address: self.address.clone(),
        }));
    }
}

/// The possible states a pool can be in.
#[derive(Debug)]
enum PoolState {
    /// The pool was just created and has not yet been marked as ready by its server's first
    /// successful monitor check.
    New,

    /// Operations may not check out connections, and the background task does not create
    /// connections to satisfy `min_pool_size`. The error that caused the pool to pause is kept
    /// so that checkouts can be failed with the relevant context.
    Paused(Error),

    /// Pool is operational.
    Ready,
}

/// Task to be processed by the worker.
#[derive(Debug)]
enum PoolTask {
    /// Handle a management request from a `PoolManager`.
    HandleManagementRequest(PoolManagementRequest),

    /// Fulfill the given connection request.
    CheckOut(ConnectionRequest),

    /// Perform pool maintenance (ensure min connections, remove stale or idle connections).
    Maintenance,
}

impl From<PoolManagementRequest> for PoolTask {
    fn from(request: PoolManagementRequest) -> Self {
        PoolTask::HandleManagementRequest(request)
    }
}
