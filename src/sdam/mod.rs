pub(crate) mod description;
mod monitor;
pub mod public;
mod server;
#[cfg(test)]
mod test;
mod topology;

pub(crate) use self::{
    description::{
        server::{ServerDescription, TopologyVersion},
        topology::{server_selection, TransactionSupportStatus},
    },
    monitor::DEFAULT_HEARTBEAT_FREQUENCY,
    server::Server,
    topology::{HandshakePhase, Topology, TopologyUpdater},
};
pub use self::public::{ServerInfo, ServerType, TopologyType};
