use bson::{doc, Document};

use crate::{
    client::auth::{Credential, FirstRound},
    cmap::{Command, Connection},
    error::{Error, Result},
};

/// Constructs the first message of the X.509 handshake for speculative authentication.
pub(super) fn build_speculative_client_first(credential: &Credential) -> Document {
    build_client_first(credential).body
}

/// Constructs the first message of the X.509 handshake.
pub(super) fn build_client_first(credential: &Credential) -> Command {
    let mut auth_command_doc = doc! {
        "authenticate": 1,
        "mechanism": "MONGODB-X509",
    };

    if let Some(ref username) = credential.username {
        auth_command_doc.insert("user", username.as_str());
    }

    Command::new("authenticate", "$external", auth_command_doc)
}

pub(super) async fn authenticate_stream(
    conn: &mut Connection,
    credential: &Credential,
    first_round: Option<FirstRound>,
) -> Result<()> {
    // If the server responded to the speculative authentication request, then the connection is
    // already authenticated.
    if let Some(FirstRound::X509(..)) = first_round {
        return Ok(());
    }

    let response = conn
        .send_command(build_client_first(credential), None, None)
        .await?;
    response
        .validate()
        .map_err(|_| Error::authentication_error("MONGODB-X509", "authentication failed"))
}
