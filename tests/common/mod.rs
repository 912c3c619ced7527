// SPDX-FileCopyrightText: 2026 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use proxenet::ca::CertificateAuthority;
use proxenet::config::{Config, IpVersion};
use proxenet::plugin::{InterpreterRegistry, PluginChain};
use proxenet::proxy::{serve, Shared};
use proxenet::tls::TlsContexts;

pub struct TestProxy {
    pub addr: SocketAddr,
    pub dir: PathBuf,
    pub ca: Arc<CertificateAuthority>,
    pub shared: Arc<Shared>,
    pub handle: tokio::task::JoinHandle<()>,
}

impl TestProxy {
    pub async fn cleanup(self) {
        self.handle.abort();
        let _ = tokio::fs::remove_dir_all(&self.dir).await;
    }
}

/// Start a proxy on an ephemeral port with a fresh CA and the given
/// `(file name, contents)` plugin scripts.
pub async fn start_proxy(
    plugins: &[(&str, &str)],
    configure: impl FnOnce(&mut Config),
) -> anyhow::Result<TestProxy> {
    let dir = std::env::temp_dir().join(format!("proxenet_integ_{}", uuid::Uuid::new_v4()));
    let plugin_dir = dir.join("plugins");
    tokio::fs::create_dir_all(&plugin_dir).await?;
    for (name, body) in plugins {
        tokio::fs::write(plugin_dir.join(name), body).await?;
    }

    let cert_path = dir.join("proxenet.crt");
    let key_path = dir.join("proxenet.key");
    let ca = CertificateAuthority::generate_and_save(&cert_path, &key_path).await?;

    let mut cfg = Config::default();
    cfg.general.ip_version = IpVersion::V4;
    cfg.general.connect_timeout_secs = 5;
    cfg.general.io_timeout_secs = 5;
    cfg.plugins.directory = path_string(&plugin_dir)?;
    cfg.tls.cert_path = path_string(&cert_path)?;
    cfg.tls.key_path = path_string(&key_path)?;
    configure(&mut cfg);

    let cfg = Arc::new(cfg.validated().await?);
    let tls = Arc::new(TlsContexts::from_config(&cfg).await?);
    let registry = InterpreterRegistry::with_builtin_kinds();
    let chain = PluginChain::load_dir(&plugin_dir, &registry).await?;
    let shared = Arc::new(Shared::new(cfg, tls, chain));

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let shared2 = shared.clone();
    let handle = tokio::spawn(async move {
        let _ = serve(listener, shared2, None).await;
    });

    Ok(TestProxy {
        addr,
        dir,
        ca,
        shared,
        handle,
    })
}

pub fn path_string(p: &std::path::Path) -> anyhow::Result<String> {
    Ok(p.to_str()
        .ok_or_else(|| anyhow::anyhow!("tmp path not utf8"))?
        .to_string())
}

/// Send `request` through the proxy and read until it closes the socket.
pub async fn roundtrip(proxy: SocketAddr, request: &[u8]) -> anyhow::Result<String> {
    let mut s = TcpStream::connect(proxy).await?;
    s.write_all(request).await?;
    let mut out = Vec::new();
    tokio::time::timeout(std::time::Duration::from_secs(10), s.read_to_end(&mut out)).await??;
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// A port on 127.0.0.1 with nothing listening.
pub fn closed_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}
