use pki_types::ServerName;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

use crate::error::Error;

/// The byte-stream transport a connection runs over: plain TCP or TLS.
pub enum WsStream {
    Plain(TcpStream),
    Secure(Box<TlsStream<TcpStream>>),
}

impl WsStream {
    pub fn is_secure(&self) -> bool {
        matches!(self, WsStream::Secure(_))
    }

    /// Accept-side TLS handshake, bounded by `tls_timeout`.
    pub async fn accept_tls(
        stream: TcpStream,
        acceptor: &TlsAcceptor,
        tls_timeout: Duration,
    ) -> Result<Self, Error> {
        let tls = timeout(tls_timeout, acceptor.accept(stream)).await??;
        Ok(WsStream::Secure(Box::new(TlsStream::from(tls))))
    }

    /// Connect-side TLS handshake, bounded by `tls_timeout`.
    pub async fn connect_tls(
        stream: TcpStream,
        connector: &TlsConnector,
        domain: ServerName<'static>,
        tls_timeout: Duration,
    ) -> Result<Self, Error> {
        let tls = timeout(tls_timeout, connector.connect(domain, stream)).await??;
        Ok(WsStream::Secure(Box::new(TlsStream::from(tls))))
    }
}

/// Root store backed by the bundled webpki roots; used when the client is
/// not handed an explicit TLS config.
pub fn default_client_tls() -> Arc<rustls::ClientConfig> {
    let root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    };
    Arc::new(
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth(),
    )
}

impl AsyncRead for WsStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WsStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            WsStream::Secure(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for WsStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            WsStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            WsStream::Secure(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WsStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            WsStream::Secure(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WsStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            WsStream::Secure(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
        }
    }
}
