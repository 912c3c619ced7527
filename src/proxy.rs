// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Accept loop and the per-client worker.
//!
//! A worker reads the first request, resolves its destination, sets up the
//! pair (intercepting TLS for CONNECT), and then shuttles request/response
//! messages through the plugin chain until either side is done.

use bytes::BytesMut;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, trace, warn, Instrument};

use crate::config::Config;
use crate::connection::ConnectionMetadata;
use crate::connector::{self, ConnectOptions};
use crate::error::{ProxyError, Result};
use crate::error_page::write_error_page;
use crate::plugin::{Direction, PluginChain};
use crate::request_line::{self, TargetDescriptor};
use crate::tls::{self, TlsContexts, CONNECT_ACK};
use crate::wire::MessageReader;

/// State shared by every worker.
pub struct Shared {
    cfg: Arc<Config>,
    connect: ConnectOptions,
    tls: Arc<TlsContexts>,
    plugins: PluginChain,
    io_timeout: Duration,
    body_limit: usize,
    next_request_id: AtomicU64,
}

impl Shared {
    pub fn new(cfg: Arc<Config>, tls: Arc<TlsContexts>, plugins: PluginChain) -> Self {
        Self {
            connect: ConnectOptions::from(cfg.as_ref()),
            io_timeout: Duration::from_secs(cfg.general.io_timeout_secs),
            body_limit: cfg.general.max_body_bytes,
            cfg,
            tls,
            plugins,
            next_request_id: AtomicU64::new(1),
        }
    }

    pub fn plugins(&self) -> &PluginChain {
        &self.plugins
    }

    fn request_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    fn reader<R: AsyncRead + Unpin>(&self, inner: R) -> MessageReader<R> {
        MessageReader::new(inner, self.io_timeout).with_body_limit(self.body_limit)
    }
}

/// Bind the configured address and serve forever.
pub async fn run_proxy(shared: Arc<Shared>) -> anyhow::Result<()> {
    run_proxy_with_limit(shared, None).await
}

/// Testable variant of `run_proxy` that returns after `accept_limit`
/// connections have been accepted. Workers may still be running then.
pub async fn run_proxy_with_limit(
    shared: Arc<Shared>,
    accept_limit: Option<usize>,
) -> anyhow::Result<()> {
    let listen = shared.cfg.listen_addr();
    let listener = TcpListener::bind(&listen).await?;
    info!(%listen, "listening");
    serve(listener, shared, accept_limit).await
}

/// Accept loop on an already bound listener.
pub async fn serve(
    listener: TcpListener,
    shared: Arc<Shared>,
    accept_limit: Option<usize>,
) -> anyhow::Result<()> {
    let workers = Arc::new(Semaphore::new(shared.cfg.general.max_workers.max(1)));

    let mut remaining = accept_limit;
    loop {
        if let Some(0) = remaining {
            break;
        }

        let permit = workers.clone().acquire_owned().await?;
        let (stream, remote_addr) = listener.accept().await?;

        if let Some(ref mut n) = remaining {
            *n -= 1;
        }

        let shared = shared.clone();
        let meta = ConnectionMetadata::new(remote_addr);
        let span = meta.span();
        tokio::spawn(
            async move {
                debug!("accepted");
                match handle_connection(stream, &shared).await {
                    Ok(()) => debug!(elapsed_ms = meta.elapsed_ms(), "closed"),
                    Err(e) => warn!(%e, elapsed_ms = meta.elapsed_ms(), "connection aborted"),
                }
                drop(permit);
            }
            .instrument(span),
        );
    }

    Ok(())
}

/// Serve one client end to end. Both sockets are dropped together when this
/// returns, whatever the outcome.
pub async fn handle_connection(client: TcpStream, shared: &Shared) -> Result<()> {
    let mut client = shared.reader(client);

    let request = match client.read_request().await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(e) => return Err(fail_with_page(client.get_mut(), e).await),
    };

    let target = match request_line::parse(&request) {
        Ok(target) => target,
        Err(e) => return Err(fail_with_page(client.get_mut(), e).await),
    };
    debug!(url = %target, "request target");

    let server = match connector::connect(&target.host, target.port, &shared.connect).await {
        Ok(server) => server,
        Err(e) => return Err(fail_with_page(client.get_mut(), e).await),
    };

    if target.is_connect() {
        let client = client.into_inner();
        if shared.cfg.is_passthrough(&target.host) {
            return passthrough(client, server, &target).await;
        }
        let (client, server) = tls::intercept(client, server, &shared.tls, &target).await?;
        let mut client = shared.reader(client);
        let mut server = shared.reader(server);
        loop {
            let request = match client.read_request().await {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(()),
                Err(e) => return Err(fail_with_page(client.get_mut(), e).await),
            };
            if !exchange(&mut client, &mut server, request, shared).await? {
                return Ok(());
            }
        }
    }

    let mut server = if target.is_tls() {
        // Absolute https:// URI on a plain proxy request: only the origin
        // side is encrypted.
        let server = shared.tls.connect_origin(server, &target).await?;
        shared.reader(Upstream::Tls(Box::new(server)))
    } else {
        shared.reader(Upstream::Plain(server))
    };
    exchange(&mut client, &mut server, request, shared).await?;
    Ok(())
}

async fn fail_with_page<W>(client: &mut W, e: ProxyError) -> ProxyError
where
    W: AsyncWrite + Unpin,
{
    if e.wants_error_page() {
        let _ = write_error_page(client, &e.to_string()).await;
    }
    e
}

/// Forward one request and its response. Returns false once the origin has
/// closed and the pair cannot carry another exchange.
async fn exchange<C, S>(
    client: &mut MessageReader<C>,
    server: &mut MessageReader<S>,
    mut request: BytesMut,
    shared: &Shared,
) -> Result<bool>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request_id = shared.request_id();

    if request_line::is_absolute_form(&request) {
        request_line::rewrite_to_origin_form(&mut request)?;
    }

    let request = shared
        .plugins
        .apply(request_id, request, Direction::Request)
        .await;
    let head_request = request.starts_with(b"HEAD ");
    trace!(request_id, len = request.len(), "forwarding request");

    let upstream = server.get_mut();
    upstream.write_all(&request).await.map_err(ProxyError::Write)?;
    upstream.flush().await.map_err(ProxyError::Write)?;

    let Some(response) = server.read_response(head_request).await? else {
        debug!(request_id, "origin closed before responding");
        return Ok(false);
    };

    let response = shared
        .plugins
        .apply(request_id, response, Direction::Response)
        .await;
    trace!(request_id, len = response.len(), "returning response");

    let downstream = client.get_mut();
    downstream
        .write_all(&response)
        .await
        .map_err(ProxyError::Write)?;
    downstream.flush().await.map_err(ProxyError::Write)?;
    Ok(true)
}

async fn passthrough(
    mut client: TcpStream,
    mut server: TcpStream,
    target: &TargetDescriptor,
) -> Result<()> {
    info!(dest = %target.authority(), "tunneling connection (passthrough)");
    client
        .write_all(CONNECT_ACK)
        .await
        .map_err(ProxyError::Write)?;
    match tokio::io::copy_bidirectional(&mut client, &mut server).await {
        Ok((up, down)) => trace!(up, down, "tunnel finished"),
        Err(e) => error!(%e, "tunnel error"),
    }
    Ok(())
}

/// Origin stream for non-CONNECT requests, plain or TLS.
enum Upstream {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Upstream {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Upstream::Plain(s) => std::pin::Pin::new(s).poll_read(cx, buf),
            Upstream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Upstream {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Upstream::Plain(s) => std::pin::Pin::new(s).poll_write(cx, buf),
            Upstream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Upstream::Plain(s) => std::pin::Pin::new(s).poll_flush(cx),
            Upstream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            Upstream::Plain(s) => std::pin::Pin::new(s).poll_shutdown(cx),
            Upstream::Tls(s) => std::pin::Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
