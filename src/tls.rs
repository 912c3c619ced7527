// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! TLS interception: one session toward the origin, one toward the browser.
//!
//! A CONNECT pair moves through [`Interception`] one handshake at a time.
//! Each variant owns exactly the streams valid in that state, so the
//! browser-facing handshake cannot start before the origin-facing one has
//! completed and the tunnel acknowledgment has been written. A failed step
//! consumes the pair, closing both sockets together.

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};
use tracing::{debug, error};

use crate::ca::ServerIdentity;
use crate::error::{HandshakeSide, ProxyError, Result};
use crate::request_line::TargetDescriptor;

/// Written in plaintext to the browser once the origin session is up.
pub const CONNECT_ACK: &[u8] = b"HTTP/1.0 200 Connection established\r\n\r\n";

#[derive(Debug)]
struct AlwaysResolves(Arc<CertifiedKey>);

impl ResolvesServerCert for AlwaysResolves {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Client-role and server-role TLS material shared by all workers.
pub struct TlsContexts {
    connector: TlsConnector,
    identity: ServerIdentity,
    handshake_timeout: Duration,
}

impl TlsContexts {
    /// `extra_roots` are trusted in addition to the bundled web PKI roots.
    pub fn new(
        identity: ServerIdentity,
        extra_roots: Vec<CertificateDer<'static>>,
        handshake_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let (added, ignored) = root_store.add_parsable_certificates(extra_roots);
        debug!(added, ignored, "extra upstream roots");

        let mut client_config = rustls::ClientConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(root_store)
            .with_no_client_auth();
        client_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client_config)),
            identity,
            handshake_timeout,
        })
    }

    /// Load the server identity and upstream roots named by configuration.
    pub async fn from_config(cfg: &crate::config::Config) -> anyhow::Result<Self> {
        let identity = ServerIdentity::from_config(&cfg.tls).await?;
        let mut roots = Vec::new();
        if let Some(path) = &cfg.tls.upstream_roots {
            let pem = tokio::fs::read(path).await?;
            roots = rustls_pemfile::certs(&mut pem.as_slice()).collect::<std::io::Result<_>>()?;
        }
        Self::new(
            identity,
            roots,
            Duration::from_secs(cfg.general.connect_timeout_secs),
        )
    }

    /// Handshake with the origin as a TLS client, verifying its certificate
    /// against `target.host`.
    pub async fn connect_origin<S>(
        &self,
        server: S,
        target: &TargetDescriptor,
    ) -> Result<client::TlsStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let name = ServerName::try_from(target.host.clone()).map_err(|e| {
            handshake_error(HandshakeSide::ProxyToServer, target, e.to_string())
        })?;
        let server =
            tokio::time::timeout(self.handshake_timeout, self.connector.connect(name, server))
                .await
                .map_err(|_| {
                    handshake_error(HandshakeSide::ProxyToServer, target, "timed out".into())
                })?
                .map_err(|e| {
                    error!(dest = %target.authority(), %e, "handshake proxy->server failed");
                    handshake_error(HandshakeSide::ProxyToServer, target, e.to_string())
                })?;
        debug!(dest = %target.authority(), "TLS handshake with server done");
        Ok(server)
    }

    fn acceptor_for(&self, host: &str) -> anyhow::Result<TlsAcceptor> {
        let cert = self.identity.cert_for_host(host)?;
        let mut server_config = rustls::ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(AlwaysResolves(cert)));
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(TlsAcceptor::from(Arc::new(server_config)))
    }
}

/// Observable progress of a pair.
///
/// "Client side" is the session where the proxy is the TLS client, i.e.
/// toward the origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    Plain,
    ClientSideEstablished,
    BothSidesEstablished,
}

pub enum Interception<C, S> {
    Plain {
        client: C,
        server: S,
    },
    ClientSideEstablished {
        client: C,
        server: client::TlsStream<S>,
    },
    BothSidesEstablished {
        client: server::TlsStream<C>,
        server: client::TlsStream<S>,
    },
}

fn handshake_error(side: HandshakeSide, target: &TargetDescriptor, reason: String) -> ProxyError {
    ProxyError::Handshake {
        side,
        target: target.authority(),
        reason,
    }
}

impl<C, S> Interception<C, S>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Both sockets connected in plaintext.
    pub fn new(client: C, server: S) -> Self {
        Interception::Plain { client, server }
    }

    pub fn state(&self) -> TlsState {
        match self {
            Interception::Plain { .. } => TlsState::Plain,
            Interception::ClientSideEstablished { .. } => TlsState::ClientSideEstablished,
            Interception::BothSidesEstablished { .. } => TlsState::BothSidesEstablished,
        }
    }

    /// Perform the next handshake. The terminal state is returned unchanged.
    pub async fn advance(self, ctx: &TlsContexts, target: &TargetDescriptor) -> Result<Self> {
        match self {
            Interception::Plain { client, server } => {
                let server = ctx.connect_origin(server, target).await?;
                Ok(Interception::ClientSideEstablished { client, server })
            }
            Interception::ClientSideEstablished { mut client, server } => {
                client
                    .write_all(CONNECT_ACK)
                    .await
                    .map_err(ProxyError::Write)?;
                client.flush().await.map_err(ProxyError::Write)?;

                let acceptor = ctx.acceptor_for(&target.host).map_err(|e| {
                    handshake_error(HandshakeSide::ProxyToClient, target, e.to_string())
                })?;
                let client = tokio::time::timeout(ctx.handshake_timeout, acceptor.accept(client))
                    .await
                    .map_err(|_| {
                        handshake_error(HandshakeSide::ProxyToClient, target, "timed out".into())
                    })?
                    .map_err(|e| {
                        error!(dest = %target.authority(), %e, "handshake proxy->client failed");
                        handshake_error(HandshakeSide::ProxyToClient, target, e.to_string())
                    })?;
                debug!(dest = %target.authority(), "TLS handshake with client done");
                Ok(Interception::BothSidesEstablished { client, server })
            }
            established @ Interception::BothSidesEstablished { .. } => Ok(established),
        }
    }
}

/// Run both handshakes in order and hand back the two TLS streams.
pub async fn intercept<C, S>(
    client: C,
    server: S,
    ctx: &TlsContexts,
    target: &TargetDescriptor,
) -> Result<(server::TlsStream<C>, client::TlsStream<S>)>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut pair = Interception::new(client, server);
    loop {
        pair = match pair {
            Interception::BothSidesEstablished { client, server } => return Ok((client, server)),
            other => other.advance(ctx, target).await?,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ca::CertificateAuthority;
    use crate::request_line;
    use tokio::io::AsyncReadExt;
    use uuid::Uuid;

    async fn contexts() -> anyhow::Result<TlsContexts> {
        let dir = std::env::temp_dir().join(format!("proxenet_tls_{}", Uuid::new_v4()));
        let ca = CertificateAuthority::generate_and_save(&dir.join("ca.crt"), &dir.join("ca.key"))
            .await?;
        let _ = tokio::fs::remove_dir_all(&dir).await;
        TlsContexts::new(ServerIdentity::Minted(ca), Vec::new(), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn origin_handshake_failure_sends_no_ack() -> anyhow::Result<()> {
        let ctx = contexts().await?;
        let target = request_line::parse(b"CONNECT origin.test:443 HTTP/1.1")?;

        let (client_proxy_side, mut browser) = tokio::io::duplex(4096);
        let (server_proxy_side, mut origin) = tokio::io::duplex(4096);

        // The origin answers the ClientHello with plaintext garbage.
        let origin_task = tokio::spawn(async move {
            let mut buf = [0u8; 512];
            let _ = origin.read(&mut buf).await;
            let _ = origin.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await;
        });

        let pair = Interception::new(client_proxy_side, server_proxy_side);
        assert_eq!(pair.state(), TlsState::Plain);
        let err = match pair.advance(&ctx, &target).await {
            Ok(_) => panic!("handshake unexpectedly succeeded"),
            Err(e) => e,
        };
        assert!(matches!(
            err,
            ProxyError::Handshake {
                side: HandshakeSide::ProxyToServer,
                ..
            }
        ));

        // The pair was consumed: the browser sees EOF without any ack bytes.
        let mut seen = Vec::new();
        browser.read_to_end(&mut seen).await?;
        assert!(seen.is_empty());
        origin_task.await?;
        Ok(())
    }

    #[test]
    fn connect_ack_is_http10_200() {
        assert_eq!(CONNECT_ACK.len(), 39);
        assert!(CONNECT_ACK.starts_with(b"HTTP/1.0 200 "));
    }

    /// TLS origin for `origin.test` on the other end of `io`, and its
    /// certificate for the proxy to trust.
    fn origin_on(
        io: tokio::io::DuplexStream,
    ) -> anyhow::Result<(CertificateDer<'static>, tokio::task::JoinHandle<()>)> {
        let key = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
        let cert = rcgen::CertificateParams::new(vec!["origin.test".to_string()])?
            .self_signed(&key)?;
        let certified = crate::ca::certified_key_from_pem(&cert.pem(), &key.serialize_pem())?;
        let config = rustls::ServerConfig::builder_with_provider(provider())
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(AlwaysResolves(certified)));
        let acceptor = TlsAcceptor::from(Arc::new(config));
        let task = tokio::spawn(async move {
            if let Ok(mut tls) = acceptor.accept(io).await {
                let mut buf = [0u8; 64];
                let _ = tls.read(&mut buf).await;
            }
        });
        Ok((cert.der().clone(), task))
    }

    #[tokio::test]
    async fn browser_handshake_failure_after_ack() -> anyhow::Result<()> {
        let target = request_line::parse(b"CONNECT origin.test:443 HTTP/1.1")?;
        let (client_proxy_side, mut browser) = tokio::io::duplex(16 * 1024);
        let (server_proxy_side, origin) = tokio::io::duplex(16 * 1024);
        let (origin_cert, origin_task) = origin_on(origin)?;

        let dir = std::env::temp_dir().join(format!("proxenet_tls_{}", Uuid::new_v4()));
        let ca = CertificateAuthority::generate_and_save(&dir.join("ca.crt"), &dir.join("ca.key"))
            .await?;
        let _ = tokio::fs::remove_dir_all(&dir).await;
        let ctx = TlsContexts::new(
            ServerIdentity::Minted(ca),
            vec![origin_cert],
            Duration::from_secs(2),
        )?;

        let pair = Interception::new(client_proxy_side, server_proxy_side)
            .advance(&ctx, &target)
            .await?;
        assert_eq!(pair.state(), TlsState::ClientSideEstablished);

        // The browser answers the ack with plaintext instead of a ClientHello.
        let browser_task = tokio::spawn(async move {
            let mut ack = vec![0u8; CONNECT_ACK.len()];
            browser.read_exact(&mut ack).await?;
            browser.write_all(b"GET / HTTP/1.1\r\n\r\n").await?;
            let mut rest = Vec::new();
            let _ = browser.read_to_end(&mut rest).await;
            anyhow::Ok((ack, rest))
        });

        let err = match pair.advance(&ctx, &target).await {
            Ok(_) => panic!("browser handshake unexpectedly succeeded"),
            Err(e) => e,
        };
        match &err {
            ProxyError::Handshake { side, target, .. } => {
                assert_eq!(*side, HandshakeSide::ProxyToClient);
                assert_eq!(target, "origin.test:443");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(!err.wants_error_page());

        let (ack, rest) = browser_task.await??;
        assert_eq!(ack, CONNECT_ACK);
        // Nothing but a TLS alert record may follow the ack.
        assert!(rest.is_empty() || rest[0] == 0x15, "got: {:?}", rest);
        origin_task.abort();
        Ok(())
    }
}
