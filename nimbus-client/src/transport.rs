//! Socket transport: a single full-duplex byte stream, plain TCP or TLS.
//!
//! The transport owns the TLS upgrade rules. `Implicit` upgrades during
//! [`Transport::connect`], before any protocol byte is exchanged;
//! `Prefer`/`Require`/`Disabled` are applied by
//! [`Transport::negotiate_tls`] once the server's `INFO` is known. Peer
//! closure is reported as a zero-length read.

use crate::error::ClientError;
use crate::options::{ServerAddr, TlsMode, TlsOptions};
use crate::tls::create_tls_connector;
use pin_project_lite::pin_project;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::client::TlsStream as ClientTlsStream;

pin_project! {
    /// The connection's byte stream. Owned exclusively by the supervisor
    /// task.
    #[project = TransportProj]
    pub(crate) enum Transport {
        Plain { #[pin] stream: TcpStream },
        Tls { #[pin] stream: ClientTlsStream<TcpStream> },
    }
}

impl Transport {
    /// Dials `server` within `deadline` and, in `Implicit` mode, upgrades
    /// to TLS before the first byte is exchanged.
    pub(crate) async fn connect(
        server: &ServerAddr,
        tls: &TlsOptions,
        deadline: Instant,
    ) -> Result<Self, ClientError> {
        let tcp = tokio::time::timeout_at(
            deadline,
            TcpStream::connect((server.host.as_str(), server.port)),
        )
        .await
        .map_err(|_| ClientError::Timeout)??;
        tcp.set_nodelay(true).ok();

        let transport = Transport::Plain { stream: tcp };
        if Self::effective_mode(server, tls) == TlsMode::Implicit {
            return transport.upgrade(tls, &server.host).await;
        }
        Ok(transport)
    }

    /// The negotiation policy for one endpoint: a `tls://` URL hardens a
    /// `Disabled` default into `Require`.
    pub(crate) fn effective_mode(server: &ServerAddr, tls: &TlsOptions) -> TlsMode {
        if server.tls_required && tls.mode == TlsMode::Disabled {
            TlsMode::Require
        } else {
            tls.mode
        }
    }

    /// Applies the upgrade rules once the server's capabilities are known
    /// (from `INFO`): `tls_required`/`tls_available` advertisements against
    /// the configured mode.
    pub(crate) async fn negotiate_tls(
        self,
        server: &ServerAddr,
        tls: &TlsOptions,
        info: &nimbus_protocol::ServerInfo,
    ) -> Result<Self, ClientError> {
        if self.is_tls() {
            return Ok(self);
        }
        let server_offers = info.tls_available || info.tls_required;
        match Self::effective_mode(server, tls) {
            TlsMode::Disabled => {
                if info.tls_required {
                    return Err(ClientError::Tls("server requires TLS".into()));
                }
                Ok(self)
            }
            TlsMode::Prefer => {
                if server_offers {
                    self.upgrade(tls, &server.host).await
                } else {
                    Ok(self)
                }
            }
            TlsMode::Require => {
                if !server_offers {
                    return Err(ClientError::Tls("server does not offer TLS".into()));
                }
                self.upgrade(tls, &server.host).await
            }
            // Already handled at connect time.
            TlsMode::Implicit => Ok(self),
        }
    }

    /// Returns whether this transport is TLS-encrypted.
    pub(crate) fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls { .. })
    }

    async fn upgrade(self, tls: &TlsOptions, host: &str) -> Result<Self, ClientError> {
        match self {
            Transport::Plain { stream } => {
                let (connector, server_name) = create_tls_connector(tls, host)?;
                let stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| ClientError::Tls(format!("handshake failed: {e}")))?;
                Ok(Transport::Tls { stream })
            }
            tls_stream @ Transport::Tls { .. } => Ok(tls_stream),
        }
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            TransportProj::Plain { stream } => stream.poll_read(cx, buf),
            TransportProj::Tls { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            TransportProj::Plain { stream } => stream.poll_write(cx, buf),
            TransportProj::Tls { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            TransportProj::Plain { stream } => stream.poll_flush(cx),
            TransportProj::Tls { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            TransportProj::Plain { stream } => stream.poll_shutdown(cx),
            TransportProj::Tls { stream } => stream.poll_shutdown(cx),
        }
    }
}
