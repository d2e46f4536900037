use std::time::Instant;

use crate::{
    client::auth::{AuthMechanism, ClientFirst, Credential, FirstRound},
    cmap::{Command, Connection, StreamDescription},
    compression::Compressor,
    error::Result,
    hello::{append_metadata, hello_command, run_hello, HelloReply},
    options::ClientOptions,
};

/// Contains the logic needed to handshake a connection.
#[derive(Clone, Debug)]
pub(crate) struct Handshaker {
    /// The hello command to send when handshaking, sans the fields that change from connection
    /// to connection (speculative authentication).
    command: Command,

    credential: Option<Credential>,

    compressors: Option<Vec<Compressor>>,
}

/// Options used to create a `Handshaker`.
#[derive(Clone, Debug)]
pub(crate) struct HandshakerOptions {
    pub(crate) app_name: Option<String>,
    pub(crate) compressors: Option<Vec<Compressor>>,
    pub(crate) credential: Option<Credential>,
    pub(crate) load_balanced: bool,
}

/// The result of a successful handshake: the hello reply along with the in-progress speculative
/// authentication conversation, if one was started.
#[derive(Debug)]
pub(crate) struct HandshakeOutput {
    pub(crate) hello_reply: HelloReply,
    first_round: Option<FirstRound>,
}

impl Handshaker {
    /// The hello command this handshaker sends, without any speculative authentication payload.
    pub(crate) fn base_command(&self) -> Command {
        self.command.clone()
    }

    /// Creates a new Handshaker.
    pub(crate) fn new(options: HandshakerOptions) -> Self {
        let mut command = hello_command(Some(options.load_balanced).filter(|lb| *lb), None, None);

        append_metadata(
            &mut command.body,
            &ClientOptions {
                app_name: options.app_name.clone(),
                compressors: options.compressors.clone(),
                ..Default::default()
            },
        );

        Self {
            command,
            credential: options.credential,
            compressors: options.compressors,
        }
    }

    /// Handshakes a connection: sends the initial hello (including any speculative
    /// authentication payload), records the resulting `StreamDescription` on the connection, and
    /// negotiates compression.
    pub(crate) async fn handshake(
        &self,
        conn: &mut Connection,
        deadline: Option<Instant>,
    ) -> Result<HandshakeOutput> {
        let mut command = self.command.clone();

        let client_first: Option<ClientFirst> = match self.credential {
            Some(ref credential) => {
                credential.append_needed_mechanism_negotiation(&mut command.body);
                credential.append_speculative_authenticate(&mut command)?
            }
            None => None,
        };

        let mut hello_reply = run_hello(conn, command, deadline).await?;

        conn.stream_description = Some(StreamDescription::from_hello_reply(&hello_reply));
        conn.server_id = hello_reply.command_response.connection_id;

        // Compression is used only if the server agrees on one of the client's compressors.
        if let (Some(ref client_compressors), Some(server_compressors)) = (
            self.compressors.as_ref(),
            hello_reply.command_response.compressors.as_ref(),
        ) {
            conn.compressor = client_compressors
                .iter()
                .find(|c| server_compressors.iter().any(|s| s == c.name()))
                .cloned();
        }

        let first_round = client_first.and_then(|client_first| {
            hello_reply
                .command_response
                .speculative_authenticate
                .take()
                .map(|server_first| client_first.into_first_round(server_first))
        });

        Ok(HandshakeOutput {
            hello_reply,
            first_round,
        })
    }

    /// Authenticates the connection according to the handshaker's credential, continuing the
    /// speculative conversation started during `handshake` when the server replied to it.
    pub(crate) async fn authenticate(
        &self,
        conn: &mut Connection,
        output: HandshakeOutput,
    ) -> Result<HelloReply> {
        let HandshakeOutput {
            hello_reply,
            first_round,
        } = output;

        if let Some(ref credential) = self.credential {
            let mechanism = match credential.mechanism {
                Some(ref mechanism) => mechanism.clone(),
                None => AuthMechanism::from_stream_description(conn.stream_description()?),
            };
            mechanism
                .authenticate_stream(conn, credential, first_round)
                .await?;
        }

        Ok(hello_reply)
    }
}
