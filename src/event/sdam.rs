//! Contains the events and types related to monitoring the behavior of server discovery and
//! monitoring.

use std::time::Duration;

use bson::{oid::ObjectId, Document};

use crate::{error::Error, options::ServerAddress, sdam::public::ServerInfo};

pub use crate::sdam::description::topology::TopologyDescription;

/// Published when a topology description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyDescriptionChangedEvent {
    /// A unique identifier for the topology.
    pub topology_id: ObjectId,

    /// The old topology description.
    pub previous_description: TopologyDescription,

    /// The new topology description.
    pub new_description: TopologyDescription,
}

/// Published when a topology is initialized.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyOpeningEvent {
    /// A unique identifier for the topology.
    pub topology_id: ObjectId,
}

/// Published when a topology is shut down.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyClosedEvent {
    /// A unique identifier for the topology.
    pub topology_id: ObjectId,
}

/// Published when a server description changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerDescriptionChangedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// A unique identifier for the topology.
    pub topology_id: ObjectId,

    /// The server's previous description.
    pub previous_description: ServerInfo<'static>,

    /// The server's new description.
    pub new_description: ServerInfo<'static>,
}

/// Published when a server is initialized.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerOpeningEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// A unique identifier for the topology.
    pub topology_id: ObjectId,
}

/// Published when a server is closed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerClosedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// A unique identifier for the topology.
    pub topology_id: ObjectId,
}

/// Published when a heartbeat is started.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatStartedEvent {
    /// The address of the server.
    pub server_address: ServerAddress,

    /// Whether this heartbeat is an awaited (streaming) heartbeat held open by the server until
    /// its state changes or the heartbeat frequency elapses.
    pub awaited: bool,

    /// The driver-generated ID of the monitoring connection.
    pub driver_connection_id: u32,
}

/// Published when a heartbeat succeeds.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatSucceededEvent {
    /// The duration that the heartbeat took to complete.
    pub duration: Duration,

    /// The response from the heartbeat.
    pub reply: Document,

    /// The address of the server.
    pub server_address: ServerAddress,

    /// Whether this event came from an awaited (streaming) heartbeat.
    pub awaited: bool,

    /// The driver-generated ID of the monitoring connection.
    pub driver_connection_id: u32,
}

/// Published when a heartbeat fails.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatFailedEvent {
    /// The duration that the heartbeat took to complete.
    pub duration: Duration,

    /// The error that caused the heartbeat to fail.
    pub failure: Error,

    /// The address of the server.
    pub server_address: ServerAddress,

    /// Whether this event came from an awaited (streaming) heartbeat.
    pub awaited: bool,

    /// The driver-generated ID of the monitoring connection.
    pub driver_connection_id: u32,
}

/// Published when any server or topology monitoring occurs.
#[derive(Clone, Debug)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum SdamEvent {
    ServerDescriptionChanged(Box<ServerDescriptionChangedEvent>),
    ServerOpening(ServerOpeningEvent),
    ServerClosed(ServerClosedEvent),
    TopologyDescriptionChanged(Box<TopologyDescriptionChangedEvent>),
    TopologyOpening(TopologyOpeningEvent),
    TopologyClosed(TopologyClosedEvent),
    ServerHeartbeatStarted(ServerHeartbeatStartedEvent),
    ServerHeartbeatSucceeded(ServerHeartbeatSucceededEvent),
    ServerHeartbeatFailed(ServerHeartbeatFailedEvent),
}

macro_rules! from_event {
    ($variant:ident, $event:ty) => {
        impl From<$event> for SdamEvent {
            fn from(event: $event) -> Self {
                Self::$variant(event)
            }
        }
    };
}

from_event!(ServerOpening, ServerOpeningEvent);
from_event!(ServerClosed, ServerClosedEvent);
from_event!(TopologyOpening, TopologyOpeningEvent);
from_event!(TopologyClosed, TopologyClosedEvent);
from_event!(ServerHeartbeatStarted, ServerHeartbeatStartedEvent);
from_event!(ServerHeartbeatSucceeded, ServerHeartbeatSucceededEvent);
from_event!(ServerHeartbeatFailed, ServerHeartbeatFailedEvent);

impl From<ServerDescriptionChangedEvent> for SdamEvent {
    fn from(event: ServerDescriptionChangedEvent) -> Self {
        Self::ServerDescriptionChanged(Box::new(event))
    }
}

impl From<TopologyDescriptionChangedEvent> for SdamEvent {
    fn from(event: TopologyDescriptionChangedEvent) -> Self {
        Self::TopologyDescriptionChanged(Box::new(event))
    }
}
