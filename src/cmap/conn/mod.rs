pub(crate) mod command;
mod stream_description;
pub(crate) mod wire;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use bson::oid::ObjectId;
use tokio::io::BufStream;

use self::wire::Message;
use super::manager::PoolManager;
use crate::{
    cmap::PoolGeneration,
    compression::Compressor,
    error::{Error, ErrorKind, Result},
    event::cmap::{
        CmapEvent,
        ConnectionCheckedInEvent,
        ConnectionCheckedOutEvent,
        ConnectionClosedEvent,
        ConnectionClosedReason,
        ConnectionCreatedEvent,
        ConnectionInfo,
        ConnectionReadyEvent,
    },
    options::ServerAddress,
    runtime::AsyncStream,
};
pub(crate) use command::{Command, CommandResponse};
pub(crate) use stream_description::StreamDescription;
pub(crate) use wire::next_request_id;

use super::CmapEventEmitter;

/// A wrapper around the stream for an established connection, along with the CMAP information
/// needed to maintain it.
#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct Connection {
    /// Driver-generated id for the connection, unique within the owning pool.
    pub(crate) id: u32,

    /// Server-generated id for the connection, as reported in its handshake reply.
    pub(crate) server_id: Option<i64>,

    pub(crate) address: ServerAddress,

    pub(crate) generation: ConnectionGeneration,

    /// The cached StreamDescription from the connection's handshake.
    pub(crate) stream_description: Option<StreamDescription>,

    /// Marks the time when the connection was last checked into the pool. This is used
    /// to detect if the connection is idle.
    ready_and_available_time: Option<Instant>,

    /// The compressor negotiated during the handshake, if any.
    pub(super) compressor: Option<Compressor>,

    /// Whether a command is currently being run on this connection. A connection dropped
    /// mid-command cannot be reused, because the reply can no longer be correlated.
    command_executing: bool,

    /// Set when a network error occurs while the connection is in use; the pool closes errored
    /// connections instead of reusing them.
    error: Option<Error>,

    #[derivative(Debug = "ignore")]
    stream: BufStream<AsyncStream>,

    #[derivative(Debug = "ignore")]
    event_emitter: Option<CmapEventEmitter>,
}

impl Connection {
    fn new(
        id: u32,
        address: ServerAddress,
        generation: ConnectionGeneration,
        stream: AsyncStream,
        event_emitter: Option<CmapEventEmitter>,
    ) -> Self {
        Self {
            id,
            server_id: None,
            address,
            generation,
            stream_description: None,
            ready_and_available_time: None,
            compressor: None,
            command_executing: false,
            error: None,
            stream: BufStream::new(stream),
            event_emitter,
        }
    }

    /// Create a connection intended to be pooled, associated with the pool's event emitter.
    pub(crate) fn new_pooled(pending_connection: &PendingConnection, stream: AsyncStream) -> Self {
        let generation = match pending_connection.generation {
            PoolGeneration::Normal(generation) => ConnectionGeneration::Normal(generation),
            // In load-balanced mode the generation is not known until the hello reply provides
            // the serviceId.
            PoolGeneration::LoadBalanced(_) => ConnectionGeneration::LoadBalanced(None),
        };
        Self::new(
            pending_connection.id,
            pending_connection.address.clone(),
            generation,
            stream,
            Some(pending_connection.event_emitter.clone()),
        )
    }

    /// Create a connection used for monitoring; monitoring connections do not belong to a pool
    /// and do not emit CMAP events.
    pub(crate) fn new_monitoring(address: ServerAddress, stream: AsyncStream, id: u32) -> Self {
        Self::new(id, address, ConnectionGeneration::Monitoring, stream, None)
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub(crate) fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            server_id: self.server_id,
            address: self.address.clone(),
        }
    }

    pub(crate) fn service_id(&self) -> Option<ObjectId> {
        self.generation
            .service_id()
            .or_else(|| self.stream_description.as_ref().and_then(|sd| sd.service_id))
    }

    /// Helper to mark the time that the connection was checked into the pool for the purpose of
    /// detecting when it becomes idle.
    pub(super) fn mark_as_available(&mut self) {
        self.ready_and_available_time = Some(Instant::now());
    }

    /// Helper to mark that the connection has been checked out of the pool.
    pub(super) fn mark_as_in_use(&mut self) {
        self.ready_and_available_time.take();
    }

    /// Checks if the connection is idle.
    pub(super) fn is_idle(&self, max_idle_time: Option<Duration>) -> bool {
        self.ready_and_available_time
            .and_then(|ready_and_available_time| {
                max_idle_time.map(|max_idle_time| {
                    Instant::now().duration_since(ready_and_available_time) >= max_idle_time
                })
            })
            .unwrap_or(false)
    }

    /// Checks if the connection is stale with respect to the pool's current generation.
    pub(super) fn is_stale(&self, current_generation: &PoolGeneration) -> bool {
        self.generation.is_stale(current_generation)
    }

    /// Whether an error occurred while this connection was in use.
    pub(super) fn has_errored(&self) -> bool {
        self.error.is_some()
    }

    pub(super) fn is_executing(&self) -> bool {
        self.command_executing
    }

    /// Executes a `Command` and returns a `CommandResponse` containing the result from the
    /// server.
    ///
    /// An `Ok(...)` result simply means the server received the command and that the driver
    /// received the response; it does not imply anything about the success of the command
    /// itself.
    pub(crate) async fn send_command(
        &mut self,
        command: Command,
        request_id: impl Into<Option<i32>>,
        deadline: Option<Instant>,
    ) -> Result<CommandResponse> {
        let message = Message::from_command(&command, request_id.into())?;

        self.command_executing = true;
        let result = self.send_message(message, &command, deadline).await;
        self.command_executing = false;

        if let Err(ref err) = result {
            if err.is_network_error() {
                self.error = Some(err.clone());
            }
        }

        result
    }

    async fn send_message(
        &mut self,
        message: Message,
        command: &Command,
        deadline: Option<Instant>,
    ) -> Result<CommandResponse> {
        let max_message_size = self
            .stream_description
            .as_ref()
            .map(|sd| sd.max_message_size_bytes);

        let round_trip = async {
            // Compression is negotiated during the handshake, so hello and auth-related commands
            // are always sent uncompressed.
            match self.compressor {
                Some(ref compressor) if !command.is_hello() && !command.should_redact() => {
                    message
                        .write_compressed_to(&mut self.stream, compressor)
                        .await?
                }
                _ => message.write_to(&mut self.stream).await?,
            };

            Message::read_from(&mut self.stream, max_message_size).await
        };

        let response_message = match deadline {
            Some(deadline) => {
                let timeout = deadline.saturating_duration_since(Instant::now());
                if timeout.is_zero() {
                    return Err(ErrorKind::Io(Arc::new(std::io::ErrorKind::TimedOut.into())).into());
                }
                crate::runtime::timeout(timeout, round_trip).await.and_then(|r| r)
            }
            None => round_trip.await,
        }?;

        CommandResponse::new(self.address.clone(), response_message)
    }

    /// Close this connection, emitting a `ConnectionClosedEvent` with the supplied reason.
    pub(super) fn close_and_drop(mut self, reason: ConnectionClosedReason) {
        self.close(reason);
    }

    /// Close this connection, emitting a `ConnectionClosedEvent` with the supplied reason.
    fn close(&mut self, reason: ConnectionClosedReason) {
        if let Some(ref emitter) = self.event_emitter {
            emitter.emit(CmapEvent::ConnectionClosed(self.closed_event(reason)));
        }
        self.event_emitter.take();
    }

    pub(super) fn ready_event(&self) -> ConnectionReadyEvent {
        ConnectionReadyEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }

    pub(super) fn checked_out_event(&self, checkout_started: Instant) -> ConnectionCheckedOutEvent {
        ConnectionCheckedOutEvent {
            address: self.address.clone(),
            connection_id: self.id,
            duration: Instant::now().duration_since(checkout_started),
        }
    }

    pub(super) fn checked_in_event(&self) -> ConnectionCheckedInEvent {
        ConnectionCheckedInEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }

    pub(super) fn closed_event(&self, reason: ConnectionClosedReason) -> ConnectionClosedEvent {
        ConnectionClosedEvent {
            address: self.address.clone(),
            connection_id: self.id,
            reason,
        }
    }

    /// Gets the connection's StreamDescription.
    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        self.stream_description.as_ref().ok_or_else(|| {
            ErrorKind::Internal {
                message: "stream checked out but not handshaked".to_string(),
            }
            .into()
        })
    }
}

/// A `Connection` checked out of a pool. When this is dropped, the connection is checked back
/// into its pool via the pool's manager handle.
#[derive(Debug)]
pub(crate) struct PooledConnection {
    connection: Option<Connection>,
    manager: PoolManager,
}

impl PooledConnection {
    pub(super) fn new(connection: Connection, manager: PoolManager) -> Self {
        Self {
            connection: Some(connection),
            manager,
        }
    }

    /// The generation this connection was created in, for error-handling bookkeeping after the
    /// connection has been returned.
    pub(crate) fn generation(&self) -> ConnectionGeneration {
        self.generation
    }
}

impl std::ops::Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        // The inner connection is only ever taken in `drop`.
        self.connection.as_ref().expect("connection already dropped")
    }
}

impl std::ops::DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.connection.as_mut().expect("connection already dropped")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.manager.check_in(connection);
        }
    }
}

/// Contains the information needed to establish a `Connection`.
#[derive(Debug)]
pub(crate) struct PendingConnection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,
    pub(crate) generation: PoolGeneration,
    pub(crate) event_emitter: CmapEventEmitter,
}

impl PendingConnection {
    pub(super) fn created_event(&self) -> ConnectionCreatedEvent {
        ConnectionCreatedEvent {
            address: self.address.clone(),
            connection_id: self.id,
        }
    }
}

/// The generation a connection was created in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ConnectionGeneration {
    /// The connection does not belong to a pool.
    Monitoring,

    /// The pool's generation when the connection was created.
    Normal(u32),

    /// In load-balanced mode, generations are tracked per service. The service id is only known
    /// once the hello reply has been processed.
    LoadBalanced(Option<LoadBalancedGeneration>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct LoadBalancedGeneration {
    pub(crate) generation: u32,
    pub(crate) service_id: ObjectId,
}

impl ConnectionGeneration {
    pub(crate) fn service_id(self) -> Option<ObjectId> {
        match self {
            ConnectionGeneration::LoadBalanced(Some(gen)) => Some(gen.service_id),
            _ => None,
        }
    }

    pub(crate) fn is_stale(self, current_generation: &PoolGeneration) -> bool {
        match (self, current_generation) {
            (ConnectionGeneration::Normal(cgen), PoolGeneration::Normal(pgen)) => cgen != *pgen,
            (ConnectionGeneration::LoadBalanced(cgen), PoolGeneration::LoadBalanced(gen_map)) => {
                match cgen {
                    Some(cgen) => {
                        cgen.generation != gen_map.get(&cgen.service_id).copied().unwrap_or(0)
                    }
                    // A load-balanced connection that never completed its hello has no service
                    // id and cannot be reused.
                    None => true,
                }
            }
            _ => false,
        }
    }
}

impl From<LoadBalancedGeneration> for ConnectionGeneration {
    fn from(gen: LoadBalancedGeneration) -> Self {
        ConnectionGeneration::LoadBalanced(Some(gen))
    }
}
