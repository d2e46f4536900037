use std::{
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::{
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    runtime::TlsConfig,
};

pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A runtime-agnostic async stream possibly using TLS.
#[derive(Debug)]
pub(crate) enum AsyncStream {
    /// A basic TCP connection to the server.
    Tcp(TcpStream),

    /// A TLS connection over TCP.
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncStream {
    /// Creates a new stream connected to `address`, performing the TLS handshake with
    /// `tls_config` if one is given.
    pub(crate) async fn connect(
        address: ServerAddress,
        connect_timeout: Option<Duration>,
        tls_config: Option<&TlsConfig>,
    ) -> Result<Self> {
        let inner = tcp_connect(&address, connect_timeout).await?;

        // If there are TLS options, wrap the inner stream in an AsyncTlsStream.
        match tls_config {
            Some(cfg) => {
                let host = address.host().to_string();
                Ok(AsyncStream::Tls(Box::new(
                    cfg.connect(host.as_str(), inner).await?,
                )))
            }
            None => Ok(AsyncStream::Tcp(inner)),
        }
    }
}

async fn tcp_connect(address: &ServerAddress, connect_timeout: Option<Duration>) -> Result<TcpStream> {
    let timeout = match connect_timeout {
        Some(timeout) if timeout.is_zero() => None,
        Some(timeout) => Some(timeout),
        None => Some(DEFAULT_CONNECT_TIMEOUT),
    };

    let resolved: Vec<SocketAddr> = address.resolve().await?;
    if resolved.is_empty() {
        return Err(Error::from_resolve_error(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no addresses found for {}", address),
        )));
    }

    let mut last_error: Option<Error> = None;
    for socket_addr in resolved {
        let attempt = async {
            let stream = TcpStream::connect(socket_addr).await?;
            stream.set_nodelay(true)?;
            Ok::<_, Error>(stream)
        };

        let result = match timeout {
            Some(timeout) => super::timeout(timeout, attempt).await.and_then(|r| r),
            None => attempt.await,
        };

        match result {
            Ok(stream) => return Ok(stream),
            Err(e) => last_error = Some(e),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        ErrorKind::Io(std::sync::Arc::new(std::io::ErrorKind::ConnectionRefused.into())).into()
    }))
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_read(cx, buf),
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_write(cx, buf),
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_flush(cx),
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_shutdown(cx),
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(ref mut inner) => Pin::new(inner).poll_write_vectored(cx, bufs),
            Self::Tls(ref mut inner) => Pin::new(inner.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Self::Tcp(ref inner) => inner.is_write_vectored(),
            Self::Tls(ref inner) => inner.is_write_vectored(),
        }
    }
}
