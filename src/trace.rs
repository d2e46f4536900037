//! Experimental `tracing` integration, gated behind the `tracing-unstable` feature.
//!
//! The shape and targets of the emitted events are unstable and may change in any release.

use std::sync::Arc;

use crate::event::{
    cmap::CmapEvent,
    command::CommandEvent,
    sdam::SdamEvent,
    MonitoringRegistry,
};

pub(crate) const COMMAND_TRACING_EVENT_TARGET: &str = "mongodb_core::command";
pub(crate) const SDAM_TRACING_EVENT_TARGET: &str = "mongodb_core::sdam";
pub(crate) const CONNECTION_TRACING_EVENT_TARGET: &str = "mongodb_core::connection";

/// Registers subscribers on the given registry that re-emit all driver events as `tracing`
/// events at debug level.
pub fn register_tracing_subscribers(registry: &MonitoringRegistry) {
    registry.subscribe_command(Arc::new(|event: &CommandEvent| match event {
        CommandEvent::Started(e) => tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            command_name = e.command_name.as_str(),
            request_id = e.request_id,
            database_name = e.db.as_str(),
            server_host = e.connection.address.host(),
            "Command started"
        ),
        CommandEvent::Succeeded(e) => tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            command_name = e.command_name.as_str(),
            request_id = e.request_id,
            duration_ms = e.duration.as_millis() as u64,
            "Command succeeded"
        ),
        CommandEvent::Failed(e) => tracing::debug!(
            target: COMMAND_TRACING_EVENT_TARGET,
            command_name = e.command_name.as_str(),
            request_id = e.request_id,
            duration_ms = e.duration.as_millis() as u64,
            failure = %e.failure,
            "Command failed"
        ),
    }));

    registry.subscribe_sdam(Arc::new(|event: &SdamEvent| match event {
        SdamEvent::TopologyDescriptionChanged(e) => tracing::debug!(
            target: SDAM_TRACING_EVENT_TARGET,
            topology_id = %e.topology_id,
            previous_topology = %e.previous_description,
            new_topology = %e.new_description,
            "Topology description changed"
        ),
        SdamEvent::ServerDescriptionChanged(e) => tracing::debug!(
            target: SDAM_TRACING_EVENT_TARGET,
            topology_id = %e.topology_id,
            server_address = %e.address,
            "Server description changed"
        ),
        SdamEvent::ServerHeartbeatFailed(e) => tracing::debug!(
            target: SDAM_TRACING_EVENT_TARGET,
            server_address = %e.server_address,
            awaited = e.awaited,
            failure = %e.failure,
            "Server heartbeat failed"
        ),
        other => tracing::trace!(
            target: SDAM_TRACING_EVENT_TARGET,
            event = ?other,
            "SDAM event"
        ),
    }));

    registry.subscribe_cmap(Arc::new(|event: &CmapEvent| {
        tracing::trace!(
            target: CONNECTION_TRACING_EVENT_TARGET,
            event = event.name(),
            "Connection pool event"
        )
    }));
}
