pub(crate) mod handshake;

use std::time::Duration;

use self::handshake::{Handshaker, HandshakerOptions};
use super::{
    conn::{Connection, LoadBalancedGeneration, PendingConnection},
    PoolGeneration,
};
use crate::{
    error::{Error, Result},
    hello::HelloReply,
    options::{ClientOptions, ServerAddress},
    runtime::{stream::DEFAULT_CONNECT_TIMEOUT, AsyncStream, TlsConfig},
    sdam::HandshakePhase,
};

/// Contains the logic to establish a connection, including handshaking, authenticating, and
/// compression negotiation.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionEstablisher {
    handshaker: Handshaker,

    tls_config: Option<TlsConfig>,

    connect_timeout: Duration,
}

#[derive(Debug)]
pub(crate) struct EstablisherOptions {
    handshake_options: HandshakerOptions,
    tls_options: Option<crate::options::TlsOptions>,
    connect_timeout: Option<Duration>,
}

impl EstablisherOptions {
    pub(crate) fn from_client_options(opts: &ClientOptions) -> Self {
        Self {
            handshake_options: HandshakerOptions {
                app_name: opts.app_name.clone(),
                compressors: opts.compressors.clone(),
                credential: opts.credential.clone(),
                load_balanced: opts.load_balanced.unwrap_or(false),
            },
            tls_options: opts.tls_options(),
            connect_timeout: opts.connect_timeout,
        }
    }
}

impl ConnectionEstablisher {
    /// Creates a new ConnectionEstablisher from the given options.
    pub(crate) fn new(options: EstablisherOptions) -> Result<Self> {
        let handshaker = Handshaker::new(options.handshake_options);

        let tls_config = if let Some(tls_options) = options.tls_options {
            Some(TlsConfig::new(tls_options)?)
        } else {
            None
        };

        let connect_timeout = match options.connect_timeout {
            Some(d) if d.is_zero() => Duration::MAX,
            Some(d) => d,
            None => DEFAULT_CONNECT_TIMEOUT,
        };

        Ok(Self {
            handshaker,
            tls_config,
            connect_timeout,
        })
    }

    async fn make_stream(&self, address: ServerAddress) -> Result<AsyncStream> {
        AsyncStream::connect(address, Some(self.connect_timeout), self.tls_config.as_ref()).await
    }

    /// Establishes a connection for use in a connection pool.
    pub(crate) async fn establish_connection(
        &self,
        pending_connection: PendingConnection,
    ) -> std::result::Result<Connection, EstablishError> {
        let pool_gen = pending_connection.generation.clone();

        let stream = self
            .make_stream(pending_connection.address.clone())
            .await
            .map_err(|e| EstablishError::pre_hello(e, pool_gen.clone()))?;

        let mut connection = Connection::new_pooled(&pending_connection, stream);

        let handshake_output = self
            .handshaker
            .handshake(&mut connection, None)
            .await
            .map_err(|e| EstablishError::pre_hello(e, pool_gen.clone()))?;

        // In load-balanced mode, the hello reply determines the service this connection belongs
        // to; its generation is the pool's generation for that service.
        if let PoolGeneration::LoadBalanced(ref gen_map) = pool_gen {
            match handshake_output.hello_reply.command_response.service_id {
                Some(service_id) => {
                    connection.generation = LoadBalancedGeneration {
                        generation: gen_map.get(&service_id).copied().unwrap_or(0),
                        service_id,
                    }
                    .into();
                }
                None => {
                    let err = Error::invalid_response(
                        "load-balanced mode was enabled, but the server does not support load \
                         balancing",
                    );
                    return Err(EstablishError::post_hello(err, connection.generation));
                }
            }
        }

        self.handshaker
            .authenticate(&mut connection, handshake_output)
            .await
            .map_err(|e| EstablishError::post_hello(e, connection.generation))?;

        Ok(connection)
    }

    /// Establishes a monitoring connection, including the initial handshake.
    ///
    /// Monitoring connections are never authenticated; the hello command is permitted before
    /// authentication. The hello reply is the source of the initial `ServerDescription` for the
    /// server, so it is returned alongside the connection.
    pub(crate) async fn establish_monitoring_connection(
        &self,
        address: ServerAddress,
        id: u32,
    ) -> Result<(Connection, HelloReply)> {
        let stream = self.make_stream(address.clone()).await?;
        let mut connection = Connection::new_monitoring(address, stream, id);

        let command = self.handshaker.base_command();
        let hello_reply = crate::hello::run_hello(&mut connection, command, None).await?;
        connection.stream_description =
            Some(crate::cmap::StreamDescription::from_hello_reply(&hello_reply));

        Ok((connection, hello_reply))
    }
}

/// An error that occurred during connection establishment, along with the phase of the handshake
/// the connection was in when it occurred. The phase determines the error-handling semantics in
/// the topology.
#[derive(Debug, Clone)]
pub(crate) struct EstablishError {
    pub(crate) cause: Error,
    pub(crate) handshake_phase: HandshakePhase,
}

impl EstablishError {
    fn pre_hello(cause: Error, generation: PoolGeneration) -> Self {
        Self {
            cause,
            handshake_phase: HandshakePhase::PreHello { generation },
        }
    }

    fn post_hello(cause: Error, generation: crate::cmap::conn::ConnectionGeneration) -> Self {
        Self {
            cause,
            handshake_phase: HandshakePhase::PostHello { generation },
        }
    }
}
