use crate::{
    client::auth::{
        sasl::{SaslResponse, SaslStart},
        AuthMechanism,
        Credential,
    },
    cmap::Connection,
    error::{Error, Result},
};

pub(super) async fn authenticate_stream(
    conn: &mut Connection,
    credential: &Credential,
) -> Result<()> {
    let username = credential
        .username
        .as_ref()
        .ok_or_else(|| Error::authentication_error("PLAIN", "no username supplied"))?;

    let password = credential
        .password
        .as_ref()
        .ok_or_else(|| Error::authentication_error("PLAIN", "no password supplied"))?;

    let source = match credential.source.as_deref() {
        Some("$external") | None => "$external",
        Some(other) => other,
    };

    let sasl_start = SaslStart::new(
        source.to_string(),
        AuthMechanism::Plain,
        payload(username, password),
    )
    .into_command();

    let response = conn.send_command(sasl_start, None, None).await?;
    let sasl_response = SaslResponse::parse("PLAIN", response.raw_response)?;

    if !sasl_response.done {
        return Err(Error::invalid_authentication_response("PLAIN"));
    }

    Ok(())
}

fn payload(username: &str, password: &str) -> Vec<u8> {
    format!("\u{0}{}\u{0}{}", username, password).into_bytes()
}

#[cfg(test)]
mod test {
    #[test]
    fn payload_is_null_delimited() {
        assert_eq!(super::payload("user", "pencil"), b"\0user\0pencil".to_vec());
    }
}
