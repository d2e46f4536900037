use std::{
    fs::File,
    io::BufReader,
    sync::Arc,
    time::SystemTime,
};

use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate,
    ClientConfig,
    OwnedTrustAnchor,
    RootCertStore,
    ServerName,
};
use rustls_pemfile::{read_one, Item};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::{
    error::{Error, ErrorKind, Result},
    options::TlsOptions,
};

/// Configuration required to use TLS. Creating this is expensive, so its best to cache this value
/// and reuse it for multiple connections.
#[derive(Clone)]
pub(crate) struct TlsConfig {
    connector: TlsConnector,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig").finish()
    }
}

impl TlsConfig {
    /// Create a new `TlsConfig` from the provided options.
    pub(crate) fn new(options: TlsOptions) -> Result<TlsConfig> {
        let config = make_rustls_config(options)?;
        Ok(TlsConfig {
            connector: TlsConnector::from(Arc::new(config)),
        })
    }

    pub(crate) async fn connect(
        &self,
        host: &str,
        tcp_stream: TcpStream,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
        let name = ServerName::try_from(host).map_err(|e| ErrorKind::InvalidTlsConfig {
            message: format!("invalid hostname {}: {}", host, e),
        })?;

        self.connector
            .connect(name, tcp_stream)
            .await
            .map_err(|e| ErrorKind::Io(Arc::new(e)).into())
    }
}

/// Converts `TlsOptions` into a rustls::ClientConfig.
fn make_rustls_config(cfg: TlsOptions) -> Result<ClientConfig> {
    let mut store = RootCertStore::empty();
    if let Some(path) = cfg.ca_file_path {
        let ders = rustls_pemfile::certs(&mut BufReader::new(File::open(&path)?)).map_err(|_| {
            ErrorKind::InvalidTlsConfig {
                message: format!(
                    "Unable to parse PEM-encoded root certificate from {}",
                    path.display()
                ),
            }
        })?;
        for der in ders {
            store
                .add(&Certificate(der))
                .map_err(|e| ErrorKind::InvalidTlsConfig {
                    message: format!("Unable to add root certificate: {}", e),
                })?;
        }
    } else {
        store.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
            OwnedTrustAnchor::from_subject_spki_name_constraints(
                ta.subject,
                ta.spki,
                ta.name_constraints,
            )
        }));
    }

    let config_builder = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(store);

    let mut config = if let Some(path) = cfg.cert_key_file_path {
        let mut file = BufReader::new(File::open(&path)?);
        let mut certs = vec![];
        let mut key = None;

        loop {
            match read_one(&mut file) {
                Ok(Some(Item::X509Certificate(bytes))) => certs.push(Certificate(bytes)),
                Ok(Some(Item::PKCS8Key(bytes)) | Some(Item::RSAKey(bytes))) => {
                    key = Some(rustls::PrivateKey(bytes))
                }
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(_) => {
                    return Err(ErrorKind::InvalidTlsConfig {
                        message: format!(
                            "Unable to parse PEM-encoded client certificate from {}",
                            path.display()
                        ),
                    }
                    .into())
                }
            }
        }

        let key = key.ok_or_else(|| {
            Error::from(ErrorKind::InvalidTlsConfig {
                message: format!("No PEM-encoded private key found in {}", path.display()),
            })
        })?;

        config_builder
            .with_client_auth_cert(certs, key)
            .map_err(|e| ErrorKind::InvalidTlsConfig {
                message: e.to_string(),
            })?
    } else {
        config_builder.with_no_client_auth()
    };

    if let Some(true) = cfg.allow_invalid_certificates {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertVerifier {}));
    }

    Ok(config)
}

struct NoCertVerifier {}

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _: &Certificate,
        _: &[Certificate],
        _: &ServerName,
        _: &mut dyn Iterator<Item = &[u8]>,
        _: &[u8],
        _: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
