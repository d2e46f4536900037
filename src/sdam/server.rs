use std::sync::Arc;

use crate::{
    cmap::{establish::ConnectionEstablisher, options::ConnectionPoolOptions, ConnectionPool},
    event::MonitoringRegistry,
    options::{ClientOptions, ServerAddress},
    sdam::TopologyUpdater,
};

/// Contains the state for a given server in the topology: its address and the connection pool
/// used to communicate with it. The server's monitors are owned by the topology worker and are
/// stopped when the server is removed from the topology.
#[derive(Debug)]
pub(crate) struct Server {
    pub(crate) address: ServerAddress,

    /// The connection pool for the server.
    pub(crate) pool: ConnectionPool,
}

impl Server {
    pub(crate) fn new(
        address: ServerAddress,
        options: &ClientOptions,
        connection_establisher: ConnectionEstablisher,
        topology_updater: TopologyUpdater,
        registry: MonitoringRegistry,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool: ConnectionPool::new(
                address.clone(),
                connection_establisher,
                topology_updater,
                registry,
                Some(ConnectionPoolOptions::from_client_options(options)),
            ),
            address,
        })
    }

    /// Creates a new Server without a monitor or pool worker, used for testing pure selection
    /// logic.
    #[cfg(test)]
    pub(crate) fn new_mocked(address: ServerAddress) -> Arc<Self> {
        Arc::new(Self {
            pool: ConnectionPool::new_mocked(address.clone()),
            address,
        })
    }
}
