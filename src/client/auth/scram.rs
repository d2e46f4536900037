use std::{
    borrow::Cow,
    collections::HashMap,
    fmt::{self, Display, Formatter},
    ops::{BitXor, Range},
    str,
    sync::RwLock,
};

use bson::{Bson, Document};
use hmac::{digest::KeyInit, Hmac, Mac};
use lazy_static::lazy_static;
use md5::Md5;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::{
    client::auth::{
        self,
        sasl::{SaslContinue, SaslResponse, SaslStart},
        AuthMechanism,
        Credential,
        FirstRound as AuthFirstRound,
    },
    cmap::Connection,
    error::{Error, Result},
};

// The single letter attribute keys in SCRAM messages.
const ITERATION_COUNT_KEY: char = 'i';
const ERROR_KEY: char = 'e';
const PROOF_KEY: char = 'p';
const VERIFIER_KEY: char = 'v';
const NONCE_KEY: char = 'r';
const SALT_KEY: char = 's';
const CHANNEL_BINDING_KEY: char = 'c';
const USERNAME_KEY: char = 'n';

/// Constant specifying that we won't be using channel binding.
const NO_CHANNEL_BINDING: char = 'n';

/// The minimum number of iterations of the hash function that we will accept from the server.
const MIN_ITERATION_COUNT: u32 = 4096;

lazy_static! {
    /// Cache of pre-computed salted passwords.
    static ref CREDENTIAL_CACHE: RwLock<HashMap<CacheEntry, Vec<u8>>> = {
        RwLock::new(HashMap::new())
    };
}

#[derive(Hash, Eq, PartialEq)]
struct CacheEntry {
    password: String,
    salt: Vec<u8>,
    i: u32,
    mechanism: ScramVersion,
}

/// The versions of SCRAM supported by the driver (classified according to hash function used).
#[derive(Hash, Eq, PartialEq, Clone, Copy, Debug)]
pub(crate) enum ScramVersion {
    Sha1,
    Sha256,
}

/// The state carried from a speculative SCRAM `saslStart` embedded in the handshake to the rest
/// of the conversation.
#[derive(Debug)]
pub(crate) struct FirstRound {
    pub(crate) client_first: ClientFirst,
    pub(crate) server_first: Document,
}

impl ScramVersion {
    /// Builds the client-first message to be embedded in a hello command for speculative
    /// authentication.
    pub(crate) fn build_speculative_client_first(
        &self,
        credential: &Credential,
    ) -> Result<ClientFirst> {
        self.build_client_first(credential)
    }

    fn build_client_first(&self, credential: &Credential) -> Result<ClientFirst> {
        let username = credential
            .username
            .as_ref()
            .ok_or_else(|| Error::authentication_error("SCRAM", "no username supplied"))?;

        let nonce = auth::generate_nonce();

        Ok(ClientFirst::new(
            credential.resolved_source().to_string(),
            username.as_str(),
            nonce,
        ))
    }

    /// Perform SCRAM authentication for a given stream, resuming a speculative conversation if
    /// `first_round` is provided.
    pub(crate) async fn authenticate_stream(
        &self,
        conn: &mut Connection,
        credential: &Credential,
        first_round: Option<AuthFirstRound>,
    ) -> Result<()> {
        let (client_first, server_first_doc) = match first_round {
            Some(AuthFirstRound::Scram(_, FirstRound { client_first, server_first })) => {
                (client_first, server_first)
            }
            _ => {
                let client_first = self.build_client_first(credential)?;
                let command = client_first.to_command(self);
                let response = conn.send_command(command, None, None).await?;
                (client_first, response.raw_response)
            }
        };

        let password = credential
            .password
            .as_ref()
            .ok_or_else(|| Error::authentication_error("SCRAM", "no password supplied"))?;

        if credential.mechanism_properties.is_some() {
            return Err(Error::authentication_error(
                "SCRAM",
                "mechanism properties MUST NOT be specified",
            ));
        }

        let source = credential.resolved_source().to_string();

        let server_first = ServerFirst::parse(self, server_first_doc)?;
        server_first.validate(client_first.nonce())?;

        let cache_entry_key = CacheEntry {
            password: password.to_string(),
            salt: server_first.salt().to_vec(),
            i: server_first.i(),
            mechanism: *self,
        };
        let (should_update_cache, salted_password) = match CREDENTIAL_CACHE
            .read()
            .map_err(|_| Error::unknown_authentication_error("SCRAM"))?
            .get(&cache_entry_key)
        {
            Some(pwd) => (false, pwd.clone()),
            None => (
                true,
                self.compute_salted_password(
                    client_first.username(),
                    password,
                    server_first.i(),
                    server_first.salt(),
                )?,
            ),
        };

        let client_final = ClientFinal::new(
            self,
            salted_password.as_slice(),
            &client_first,
            &server_first,
        )?;

        let command = SaslContinue::new(
            source.clone(),
            server_first.conversation_id().clone(),
            client_final.message().as_bytes().to_vec(),
        )
        .into_command();

        let response = conn.send_command(command, None, None).await?;
        let sasl_response = SaslResponse::parse(self.mechanism_str(), response.raw_response)?;

        let server_final = ServerFinal::parse(sasl_response.payload.as_slice())?;
        server_final.validate(self, salted_password.as_slice(), &client_final)?;

        // With skipEmptyExchange, the server completes the conversation on the second round
        // trip; older servers require a final empty exchange.
        if !sasl_response.done {
            let noop = SaslContinue::new(
                source,
                sasl_response.conversation_id.clone(),
                Vec::new(),
            )
            .into_command();
            let response = conn.send_command(noop, None, None).await?;
            let noop_response = SaslResponse::parse(self.mechanism_str(), response.raw_response)?;

            if !noop_response.done {
                return Err(Error::authentication_error(
                    self.mechanism_str(),
                    "authentication did not complete successfully",
                ));
            }
        }

        if should_update_cache {
            if let Ok(ref mut cache) = CREDENTIAL_CACHE.write() {
                cache.entry(cache_entry_key).or_insert(salted_password);
            }
        }

        Ok(())
    }

    fn mechanism_str(&self) -> &'static str {
        match self {
            ScramVersion::Sha1 => AuthMechanism::ScramSha1.as_str(),
            ScramVersion::Sha256 => AuthMechanism::ScramSha256.as_str(),
        }
    }

    /// HMAC function used as part of SCRAM authentication.
    fn hmac(&self, key: &[u8], input: &[u8]) -> Result<Vec<u8>> {
        match self {
            ScramVersion::Sha1 => mac::<Hmac<Sha1>>(key, input, "SCRAM"),
            ScramVersion::Sha256 => mac::<Hmac<Sha256>>(key, input, "SCRAM"),
        }
    }

    /// Compute the HMAC of the given key and input and verify it matches the given signature.
    fn hmac_verify(&self, key: &[u8], input: &[u8], signature: &[u8]) -> Result<()> {
        let computed = self.hmac(key, input)?;
        if computed.as_slice() == signature {
            Ok(())
        } else {
            Err(Error::authentication_error("SCRAM", "authentication failed"))
        }
    }

    /// The "h" function defined in the SCRAM RFC.
    fn h(&self, str: &[u8]) -> Vec<u8> {
        match self {
            ScramVersion::Sha1 => hash::<Sha1>(str),
            ScramVersion::Sha256 => hash::<Sha256>(str),
        }
    }

    /// The "h_i" function as defined in the SCRAM RFC.
    fn h_i(&self, str: &str, salt: &[u8], iterations: u32) -> Vec<u8> {
        match self {
            ScramVersion::Sha1 => {
                let mut buf = vec![0u8; 160 / 8];
                pbkdf2::pbkdf2::<Hmac<Sha1>>(str.as_bytes(), salt, iterations, &mut buf);
                buf
            }
            ScramVersion::Sha256 => {
                let mut buf = vec![0u8; 256 / 8];
                pbkdf2::pbkdf2::<Hmac<Sha256>>(str.as_bytes(), salt, iterations, &mut buf);
                buf
            }
        }
    }

    /// Computes the salted password according to the SCRAM RFC and the MongoDB specific password
    /// hashing algorithm.
    fn compute_salted_password(
        &self,
        username: &str,
        password: &str,
        i: u32,
        salt: &[u8],
    ) -> Result<Vec<u8>> {
        let normalized_password: Cow<'_, str> = match self {
            ScramVersion::Sha1 => {
                let mut md5 = Md5::new();
                md5.update(format!("{}:mongo:{}", username, password));
                Cow::Owned(hex::encode(md5.finalize()))
            }
            ScramVersion::Sha256 => match stringprep::saslprep(password) {
                Ok(p) => p,
                Err(_) => {
                    return Err(Error::authentication_error(
                        "SCRAM-SHA-256",
                        "saslprep failure",
                    ))
                }
            },
        };

        Ok(self.h_i(normalized_password.as_ref(), salt, i))
    }
}

impl Display for ScramVersion {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.write_str(self.mechanism_str())
    }
}

fn xor(lhs: &[u8], rhs: &[u8]) -> Vec<u8> {
    debug_assert_eq!(lhs.len(), rhs.len());

    lhs.iter()
        .zip(rhs.iter())
        .map(|(l, r)| l.bitxor(r))
        .collect()
}

fn mac<M: Mac + KeyInit>(key: &[u8], input: &[u8], auth_mechanism: &str) -> Result<Vec<u8>> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|_| Error::unknown_authentication_error(auth_mechanism))?;
    mac.update(input);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn hash<D: Digest>(val: &[u8]) -> Vec<u8> {
    let mut hash = D::new();
    hash.update(val);
    hash.finalize().to_vec()
}

/// Parses a string slice of the form "<expected_key>=<body>" into "<body>", if possible.
fn parse_kvp(str: &str, expected_key: char) -> Result<String> {
    if !str.starts_with(expected_key) || str.chars().nth(1) != Some('=') {
        Err(Error::invalid_authentication_response("SCRAM"))
    } else {
        Ok(str.chars().skip(2).collect())
    }
}

/// Model of the first message sent by the client.
#[derive(Debug)]
pub(crate) struct ClientFirst {
    source: String,

    message: String,

    gs2_header: Range<usize>,

    bare: Range<usize>,

    nonce: String,

    username: String,
}

impl ClientFirst {
    fn new(source: String, username: &str, nonce: String) -> Self {
        let gs2_header = format!("{},,", NO_CHANNEL_BINDING);
        let bare = format!("{}={},{}={}", USERNAME_KEY, username, NONCE_KEY, nonce);
        let full = format!("{}{}", &gs2_header, &bare);
        let end = full.len();
        ClientFirst {
            source,
            message: full,
            gs2_header: Range {
                start: 0,
                end: gs2_header.len(),
            },
            bare: Range {
                start: gs2_header.len(),
                end,
            },
            nonce,
            username: username.to_string(),
        }
    }

    fn bare_message(&self) -> &str {
        &self.message[self.bare.clone()]
    }

    fn gs2_header(&self) -> &str {
        &self.message[self.gs2_header.clone()]
    }

    fn message(&self) -> &str {
        &self.message[..]
    }

    fn nonce(&self) -> &str {
        self.nonce.as_str()
    }

    fn username(&self) -> &str {
        self.username.as_str()
    }

    pub(crate) fn to_command(&self, scram: &ScramVersion) -> crate::cmap::Command {
        let mechanism = match scram {
            ScramVersion::Sha1 => AuthMechanism::ScramSha1,
            ScramVersion::Sha256 => AuthMechanism::ScramSha256,
        };
        SaslStart::new(
            self.source.clone(),
            mechanism,
            self.message().as_bytes().to_vec(),
        )
        .into_command()
    }
}

/// Model of the first message received from the server.
///
/// This MUST be validated before sending the `ClientFinal` message back to the server.
struct ServerFirst {
    conversation_id: Bson,
    done: bool,
    message: String,
    nonce: String,
    salt: Vec<u8>,
    i: u32,
}

impl ServerFirst {
    fn parse(scram: &ScramVersion, response: Document) -> Result<Self> {
        let sasl_response = SaslResponse::parse(scram.mechanism_str(), response)?;

        let message = str::from_utf8(&sasl_response.payload)
            .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;

        let parts: Vec<&str> = message.split(',').collect();

        if parts.len() < 3 {
            return Err(Error::invalid_authentication_response("SCRAM"));
        }

        let full_nonce = parse_kvp(parts[0], NONCE_KEY)?;

        let salt = base64::decode(parse_kvp(parts[1], SALT_KEY)?.as_str())
            .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;

        let i: u32 = parse_kvp(parts[2], ITERATION_COUNT_KEY)?
            .parse()
            .map_err(|_| Error::authentication_error("SCRAM", "iteration count invalid"))?;

        Ok(ServerFirst {
            conversation_id: sasl_response.conversation_id,
            done: sasl_response.done,
            message: message.to_string(),
            nonce: full_nonce,
            salt,
            i,
        })
    }

    fn conversation_id(&self) -> &Bson {
        &self.conversation_id
    }

    fn message(&self) -> &str {
        self.message.as_str()
    }

    fn nonce(&self) -> &str {
        self.nonce.as_str()
    }

    fn salt(&self) -> &[u8] {
        self.salt.as_slice()
    }

    fn i(&self) -> u32 {
        self.i
    }

    fn validate(&self, nonce: &str) -> Result<()> {
        if self.done {
            Err(Error::authentication_error(
                "SCRAM",
                "handshake terminated early",
            ))
        } else if !self.nonce.starts_with(nonce) {
            Err(Error::authentication_error("SCRAM", "mismatched nonce"))
        } else if self.i < MIN_ITERATION_COUNT {
            Err(Error::authentication_error(
                "SCRAM",
                "iteration count too low",
            ))
        } else {
            Ok(())
        }
    }
}

/// Model of the final message sent by the client.
///
/// Contains the "AuthMessage" mentioned in the RFC used in computing the client and server
/// signatures.
struct ClientFinal {
    message: String,
    auth_message: String,
}

impl ClientFinal {
    fn new(
        scram: &ScramVersion,
        salted_password: &[u8],
        client_first: &ClientFirst,
        server_first: &ServerFirst,
    ) -> Result<Self> {
        let client_key = scram.hmac(salted_password, b"Client Key")?;
        let stored_key = scram.h(client_key.as_slice());

        let without_proof = format!(
            "{}={},{}={}",
            CHANNEL_BINDING_KEY,
            base64::encode(client_first.gs2_header()),
            NONCE_KEY,
            server_first.nonce()
        );
        let auth_message = format!(
            "{},{},{}",
            client_first.bare_message(),
            server_first.message(),
            without_proof.as_str()
        );
        let client_signature = scram.hmac(stored_key.as_slice(), auth_message.as_bytes())?;
        let client_proof =
            base64::encode(xor(client_key.as_slice(), client_signature.as_slice()).as_slice());

        let message = format!("{},{}={}", without_proof, PROOF_KEY, client_proof);

        Ok(ClientFinal {
            message,
            auth_message,
        })
    }

    fn message(&self) -> &str {
        self.message.as_str()
    }

    fn auth_message(&self) -> &str {
        self.auth_message.as_str()
    }
}

enum ServerFinalBody {
    Error(String),
    Verifier(String),
}

/// Model of the final message received from the server.
struct ServerFinal {
    body: ServerFinalBody,
}

impl ServerFinal {
    fn parse(payload: &[u8]) -> Result<Self> {
        let message =
            str::from_utf8(payload).map_err(|_| Error::invalid_authentication_response("SCRAM"))?;

        let first = message
            .chars()
            .next()
            .ok_or_else(|| Error::invalid_authentication_response("SCRAM"))?;

        let body = if first == ERROR_KEY {
            let error = parse_kvp(message, ERROR_KEY)?;
            ServerFinalBody::Error(error)
        } else if first == VERIFIER_KEY {
            let verifier = parse_kvp(message, VERIFIER_KEY)?;
            ServerFinalBody::Verifier(verifier)
        } else {
            return Err(Error::invalid_authentication_response("SCRAM"));
        };

        Ok(ServerFinal { body })
    }

    fn validate(
        &self,
        scram: &ScramVersion,
        salted_password: &[u8],
        client_final: &ClientFinal,
    ) -> Result<()> {
        match self.body {
            ServerFinalBody::Verifier(ref body) => {
                let server_key = scram.hmac(salted_password, b"Server Key")?;
                let body_decoded = base64::decode(body.as_bytes())
                    .map_err(|_| Error::invalid_authentication_response("SCRAM"))?;

                scram.hmac_verify(
                    server_key.as_slice(),
                    client_final.auth_message().as_bytes(),
                    body_decoded.as_slice(),
                )
            }
            ServerFinalBody::Error(ref err) => {
                Err(Error::authentication_error("SCRAM", err.as_str()))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::ScramVersion;

    // Test vectors from RFC 5802 section 5 and RFC 7677 section 3.
    #[test]
    fn rfc_salted_password_sha256() {
        let salt = base64::decode("W22ZaJ0SNY7soEsUEjb6gQ==").unwrap();
        let salted = ScramVersion::Sha256.h_i("pencil", &salt, 4096);

        let client_key = ScramVersion::Sha256.hmac(&salted, b"Client Key").unwrap();
        let stored_key = ScramVersion::Sha256.h(&client_key);
        assert_eq!(
            base64::encode(stored_key),
            "WG5d8oPm3OtcPnkdi4Uo7BkeZkBFzpcXkuLmtbsT4qY="
        );
    }

    #[test]
    fn sha1_password_is_md5_prehashed() {
        // The MongoDB SCRAM-SHA-1 salted password is computed over
        // md5(username:mongo:password) rather than the raw password.
        let salt = b"0123456789abcdef";
        let direct = ScramVersion::Sha1.h_i("password", salt, 4096);
        let via_credential = ScramVersion::Sha1
            .compute_salted_password("user", "password", 4096, salt)
            .unwrap();
        assert_ne!(direct, via_credential);
        assert_eq!(via_credential.len(), 20);
    }

    #[test]
    fn server_first_validation() {
        use bson::doc;

        let response = doc! {
            "ok": 1,
            "conversationId": 1,
            "done": false,
            "payload": bson::Binary {
                subtype: bson::spec::BinarySubtype::Generic,
                bytes: b"r=fyko+d2lbbFgONRv9qkxdawLHo+Vgk7qvUOKUwuWLIWg4l/9SraGMHEE,s=QSXCR+Q6sek8bf92,i=4096".to_vec(),
            },
        };

        let server_first = super::ServerFirst::parse(&ScramVersion::Sha1, response).unwrap();
        assert!(server_first.validate("fyko+d2lbbFgONRv9qkxdawL").is_ok());
        assert!(server_first.validate("differentnonce").is_err());
    }

    #[test]
    fn low_iteration_count_is_rejected() {
        use bson::doc;

        let response = doc! {
            "ok": 1,
            "conversationId": 1,
            "done": false,
            "payload": bson::Binary {
                subtype: bson::spec::BinarySubtype::Generic,
                bytes: b"r=abcd,s=QSXCR+Q6sek8bf92,i=42".to_vec(),
            },
        };

        let server_first = super::ServerFirst::parse(&ScramVersion::Sha1, response).unwrap();
        assert!(server_first.validate("abcd").is_err());
    }
}
