//! Contains the types needed to specify the auth configuration for a
//! [`Client`](../../struct.Client.html).

mod plain;
pub(crate) mod sasl;
pub(crate) mod scram;
mod x509;

use bson::Document;
use rand::Rng;
use serde::Deserialize;
use typed_builder::TypedBuilder;

use self::scram::ScramVersion;
use crate::{
    cmap::{Command, Connection, StreamDescription},
    error::{Error, ErrorKind, Result},
};

const SCRAM_SHA_1_STR: &str = "SCRAM-SHA-1";
const SCRAM_SHA_256_STR: &str = "SCRAM-SHA-256";
const MONGODB_X509_STR: &str = "MONGODB-X509";
const PLAIN_STR: &str = "PLAIN";
const GSSAPI_STR: &str = "GSSAPI";
const MONGODB_AWS_STR: &str = "MONGODB-AWS";

/// The authentication mechanisms supported by MongoDB.
///
/// Note: not all of these mechanisms are currently supported by the driver.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum AuthMechanism {
    /// Authenticate using the SCRAM-SHA-1 method, with the username and password hashed with
    /// SHA-1.
    ScramSha1,

    /// Authenticate using the SCRAM-SHA-256 method, with the username and password hashed with
    /// SHA-256.
    ScramSha256,

    /// Authenticate using a client certificate over TLS; the username is derived from the
    /// distinguished subject name of the certificate.
    MongoDbX509,

    /// Relay a plaintext username and password to the server, which typically proxies them to an
    /// external LDAP service. Should only be used over TLS.
    Plain,

    /// Authenticate using Kerberos via GSSAPI. Not currently supported.
    Gssapi,

    /// Authenticate using AWS IAM credentials. Not currently supported.
    MongoDbAws,
}

impl AuthMechanism {
    /// Determines the default auth mechanism to use for a connection, based on the mechanisms the
    /// server advertised for the user in its handshake reply.
    pub(crate) fn from_stream_description(description: &StreamDescription) -> AuthMechanism {
        let scram_sha_256_supported = description
            .sasl_supported_mechs
            .as_ref()
            .map(|mechs| mechs.iter().any(|mech| mech == SCRAM_SHA_256_STR))
            .unwrap_or(false);

        if scram_sha_256_supported {
            AuthMechanism::ScramSha256
        } else {
            AuthMechanism::ScramSha1
        }
    }

    /// Returns the string representation of this mechanism as it appears on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMechanism::ScramSha1 => SCRAM_SHA_1_STR,
            AuthMechanism::ScramSha256 => SCRAM_SHA_256_STR,
            AuthMechanism::MongoDbX509 => MONGODB_X509_STR,
            AuthMechanism::Plain => PLAIN_STR,
            AuthMechanism::Gssapi => GSSAPI_STR,
            AuthMechanism::MongoDbAws => MONGODB_AWS_STR,
        }
    }

    /// The database that commands for this mechanism should be run against, absent an explicit
    /// `authSource`.
    pub(crate) fn default_source<'a>(&'a self, uri_db: Option<&'a str>) -> &'a str {
        match self {
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 => uri_db.unwrap_or("admin"),
            AuthMechanism::MongoDbX509 | AuthMechanism::Plain | AuthMechanism::MongoDbAws => {
                "$external"
            }
            AuthMechanism::Gssapi => "$external",
        }
    }

    pub(crate) fn from_str(str: &str) -> Result<Self> {
        match str {
            SCRAM_SHA_1_STR => Ok(AuthMechanism::ScramSha1),
            SCRAM_SHA_256_STR => Ok(AuthMechanism::ScramSha256),
            MONGODB_X509_STR => Ok(AuthMechanism::MongoDbX509),
            PLAIN_STR => Ok(AuthMechanism::Plain),
            GSSAPI_STR => Ok(AuthMechanism::Gssapi),
            MONGODB_AWS_STR => Ok(AuthMechanism::MongoDbAws),
            _ => Err(ErrorKind::InvalidArgument {
                message: format!("invalid mechanism string: {}", str),
            }
            .into()),
        }
    }

    /// Checks that the credential is properly formatted for this mechanism.
    pub(crate) fn validate_credential(&self, credential: &Credential) -> Result<()> {
        match self {
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 => {
                if credential.username.is_none() {
                    return Err(ErrorKind::InvalidArgument {
                        message: "no username provided for SCRAM authentication".to_string(),
                    }
                    .into());
                }
                Ok(())
            }
            AuthMechanism::MongoDbX509 => {
                if credential.password.is_some() {
                    return Err(ErrorKind::InvalidArgument {
                        message: "a password cannot be specified with MONGODB-X509".to_string(),
                    }
                    .into());
                }
                if credential.source.as_deref().unwrap_or("$external") != "$external" {
                    return Err(ErrorKind::InvalidArgument {
                        message: "only $external may be specified as an auth source for \
                                  MONGODB-X509"
                            .to_string(),
                    }
                    .into());
                }
                Ok(())
            }
            AuthMechanism::Plain => {
                if credential.username.is_none() || credential.password.is_none() {
                    return Err(ErrorKind::InvalidArgument {
                        message: "both username and password must be specified for PLAIN \
                                  authentication"
                            .to_string(),
                    }
                    .into());
                }
                Ok(())
            }
            AuthMechanism::Gssapi | AuthMechanism::MongoDbAws => Err(ErrorKind::InvalidArgument {
                message: format!("{} authentication is not supported", self.as_str()),
            }
            .into()),
        }
    }

    /// Constructs the first message of the speculative authentication handshake, if this
    /// mechanism supports speculative authentication.
    pub(crate) fn build_speculative_client_first(
        &self,
        credential: &Credential,
    ) -> Result<Option<ClientFirst>> {
        match self {
            Self::ScramSha1 => Ok(Some(ClientFirst::Scram(
                ScramVersion::Sha1,
                ScramVersion::Sha1.build_speculative_client_first(credential)?,
            ))),
            Self::ScramSha256 => Ok(Some(ClientFirst::Scram(
                ScramVersion::Sha256,
                ScramVersion::Sha256.build_speculative_client_first(credential)?,
            ))),
            Self::MongoDbX509 => Ok(Some(ClientFirst::X509(Box::new(
                x509::build_speculative_client_first(credential),
            )))),
            Self::Plain => Ok(None),
            Self::Gssapi | Self::MongoDbAws => Err(ErrorKind::InvalidArgument {
                message: format!("{} authentication is not supported", self.as_str()),
            }
            .into()),
        }
    }

    /// Performs the authentication handshake for this mechanism on the given connection.
    pub(crate) async fn authenticate_stream(
        &self,
        stream: &mut Connection,
        credential: &Credential,
        first_round: Option<FirstRound>,
    ) -> Result<()> {
        self.validate_credential(credential)?;

        match self {
            AuthMechanism::ScramSha1 => {
                ScramVersion::Sha1
                    .authenticate_stream(stream, credential, first_round)
                    .await
            }
            AuthMechanism::ScramSha256 => {
                ScramVersion::Sha256
                    .authenticate_stream(stream, credential, first_round)
                    .await
            }
            AuthMechanism::MongoDbX509 => {
                x509::authenticate_stream(stream, credential, first_round).await
            }
            AuthMechanism::Plain => plain::authenticate_stream(stream, credential).await,
            AuthMechanism::Gssapi | AuthMechanism::MongoDbAws => Err(ErrorKind::InvalidArgument {
                message: format!("{} authentication is not supported", self.as_str()),
            }
            .into()),
        }
    }
}

impl<'de> Deserialize<'de> for AuthMechanism {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        AuthMechanism::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// A struct containing authentication information.
///
/// Some fields (mechanism and source) may be omitted and will either be negotiated or assigned a
/// default value, depending on the values of other fields in the credential.
#[derive(Clone, Default, Deserialize, TypedBuilder, Derivative)]
#[derivative(Debug, PartialEq)]
#[serde(rename_all = "camelCase", default)]
#[non_exhaustive]
pub struct Credential {
    /// The username to authenticate with. This applies to all mechanisms but may be omitted when
    /// authenticating via MONGODB-X509.
    #[builder(default)]
    pub username: Option<String>,

    /// The database used to authenticate. This applies to all mechanisms and defaults to "admin"
    /// in SCRAM authentication mechanisms and "$external" for MONGODB-X509 and PLAIN.
    #[builder(default)]
    pub source: Option<String>,

    /// The password to authenticate with. This does not apply to all mechanisms.
    #[builder(default)]
    #[derivative(Debug(format_with = "redact_password"))]
    pub password: Option<String>,

    /// Which authentication mechanism to use. If not provided, one will be negotiated with the
    /// server.
    #[builder(default)]
    pub mechanism: Option<AuthMechanism>,

    /// Additional properties for the given mechanism.
    #[builder(default)]
    pub mechanism_properties: Option<Document>,
}

fn redact_password(
    _password: &Option<String>,
    f: &mut std::fmt::Formatter,
) -> std::result::Result<(), std::fmt::Error> {
    f.write_str("REDACTED")
}

impl Credential {
    /// The database this credential should be authenticated against, taking mechanism defaults
    /// into account.
    pub(crate) fn resolved_source(&self) -> &str {
        let mechanism = self.mechanism.as_ref().unwrap_or(&AuthMechanism::ScramSha256);
        self.source
            .as_deref()
            .unwrap_or_else(|| mechanism.default_source(None))
    }

    /// If the mechanism is missing, append the appropriate mechanism negotiation key-value-pair
    /// to the provided hello command document.
    pub(crate) fn append_needed_mechanism_negotiation(&self, body: &mut Document) {
        if let (Some(username), None) = (self.username.as_ref(), self.mechanism.as_ref()) {
            body.insert(
                "saslSupportedMechs",
                format!("{}.{}", self.resolved_source(), username),
            );
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if let Some(ref mechanism) = self.mechanism {
            mechanism.validate_credential(self)?;
        } else if self.username.is_none() {
            return Err(ErrorKind::InvalidArgument {
                message: "cannot authenticate without a username".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Attaches the speculative authentication payload for this credential to the given hello
    /// command, returning the in-progress first round to resume once the reply arrives.
    pub(crate) fn append_speculative_authenticate(
        &self,
        command: &mut Command,
    ) -> Result<Option<ClientFirst>> {
        let client_first = match self.mechanism {
            Some(ref mechanism) => mechanism.build_speculative_client_first(self)?,
            None => return Ok(None),
        };

        if let Some(ref client_first) = client_first {
            command
                .body
                .insert("speculativeAuthenticate", client_first.to_document(self));
        }

        Ok(client_first)
    }
}

/// The first message sent by the client as part of speculative authentication, along with the
/// state needed to resume the conversation when the server's reply arrives.
#[derive(Debug)]
pub(crate) enum ClientFirst {
    Scram(ScramVersion, scram::ClientFirst),
    X509(Box<Document>),
}

impl ClientFirst {
    fn to_document(&self, credential: &Credential) -> Document {
        match self {
            Self::Scram(version, client_first) => {
                let mut doc = client_first.to_command(version).body;
                doc.insert("db", credential.resolved_source());
                doc.remove("$db");
                doc
            }
            Self::X509(doc) => doc.as_ref().clone(),
        }
    }

    pub(crate) fn into_first_round(self, server_first: Document) -> FirstRound {
        match self {
            Self::Scram(version, client_first) => FirstRound::Scram(
                version,
                scram::FirstRound {
                    client_first,
                    server_first,
                },
            ),
            Self::X509(..) => FirstRound::X509(server_first),
        }
    }
}

/// The first round of the authentication conversation, produced by a successful speculative
/// authentication reply.
#[derive(Debug)]
pub(crate) enum FirstRound {
    Scram(ScramVersion, scram::FirstRound),
    X509(Document),
}

/// Creates a new, random, base64-encoded nonce.
pub(crate) fn generate_nonce() -> String {
    let mut result = [0u8; 32];
    rand::thread_rng().fill(&mut result[..]);
    base64::encode(result)
}

pub(crate) fn auth_error(mechanism_name: &str, reason: impl AsRef<str>) -> Error {
    Error::authentication_error(mechanism_name, reason.as_ref())
}
