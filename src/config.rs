// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Configuration loading and validation.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::path::Path;
use tracing::warn;

/// Hard ceiling for concurrent workers.
pub const MAX_WORKERS: usize = 64;

/// Address family used for outbound connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpVersion {
    #[default]
    Any,
    V4,
    V6,
}

impl IpVersion {
    pub fn accepts(self, addr: &std::net::SocketAddr) -> bool {
        match self {
            IpVersion::Any => true,
            IpVersion::V4 => addr.is_ipv4(),
            IpVersion::V6 => addr.is_ipv6(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Local bind address, e.g. 127.0.0.1
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Local bind port
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub ip_version: IpVersion,

    /// Ceiling on concurrently served client connections
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle read timeout on either side of a pair
    #[serde(default = "default_io_timeout")]
    pub io_timeout_secs: u64,

    /// Largest request or response body buffered for plugins
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8008
}

fn default_max_workers() -> usize {
    10
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_io_timeout() -> u64 {
    60
}

fn default_max_body_bytes() -> usize {
    crate::wire::DEFAULT_MAX_BODY
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            port: default_port(),
            ip_version: IpVersion::default(),
            max_workers: default_max_workers(),
            connect_timeout_secs: default_connect_timeout(),
            io_timeout_secs: default_io_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PluginsConfig {
    #[serde(default = "default_plugins_dir")]
    pub directory: String,
}

fn default_plugins_dir() -> String {
    "./plugins".to_string()
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            directory: default_plugins_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_cert_path")]
    pub cert_path: String,

    #[serde(default = "default_key_path")]
    pub key_path: String,

    /// Treat the configured pair as a CA and present a per-host leaf
    /// signed by it. When false the pair is presented as-is.
    #[serde(default = "default_mint_leaf_certs")]
    pub mint_leaf_certs: bool,

    /// Extra PEM bundle trusted when connecting to origins
    #[serde(default)]
    pub upstream_roots: Option<String>,

    /// CONNECT hosts (suffix match) that are tunnelled without interception
    #[serde(default)]
    pub passthrough_domains: Vec<String>,
}

fn default_cert_path() -> String {
    "./keys/proxenet.crt".to_string()
}

fn default_key_path() -> String {
    "./keys/proxenet.key".to_string()
}

fn default_mint_leaf_certs() -> bool {
    true
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: default_cert_path(),
            key_path: default_key_path(),
            mint_leaf_certs: default_mint_leaf_certs(),
            upstream_roots: None,
            passthrough_domains: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub plugins: PluginsConfig,

    #[serde(default)]
    pub tls: TlsConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// ```toml
    /// [general]
    /// listen = "127.0.0.1"
    /// port = 8008
    /// ip_version = "v4"
    ///
    /// [plugins]
    /// directory = "./plugins"
    ///
    /// [tls]
    /// cert_path = "./keys/proxenet.crt"
    /// key_path = "./keys/proxenet.key"
    /// ```
    pub async fn load_from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path_ref = path.as_ref();
        let s = tokio::fs::read_to_string(path_ref)
            .await
            .with_context(|| format!("failed to read config {}", path_ref.display()))?;
        let cfg: Self = toml::from_str(&s)?;
        Ok(cfg)
    }

    /// `listen:port` as handed to the listener.
    pub fn listen_addr(&self) -> String {
        if self.general.listen.contains(':') {
            format!("[{}]:{}", self.general.listen, self.general.port)
        } else {
            format!("{}:{}", self.general.listen, self.general.port)
        }
    }

    /// Returns true if `host` should be tunnelled without interception.
    pub fn is_passthrough(&self, host: &str) -> bool {
        self.tls
            .passthrough_domains
            .iter()
            .any(|d| !d.is_empty() && host.ends_with(d.as_str()))
    }

    /// Clamp out-of-range values and check every path is usable.
    pub async fn validated(mut self) -> anyhow::Result<Self> {
        if self.general.max_workers == 0 || self.general.max_workers > MAX_WORKERS {
            warn!(
                requested = self.general.max_workers,
                "worker count out of range, using default"
            );
            self.general.max_workers = default_max_workers();
        }
        if self.general.max_body_bytes == 0 {
            warn!("body limit of 0 bytes, using default");
            self.general.max_body_bytes = default_max_body_bytes();
        }

        let dir = Path::new(&self.plugins.directory);
        let meta = tokio::fs::metadata(dir)
            .await
            .with_context(|| format!("Invalid plugins path '{}'", dir.display()))?;
        if !meta.is_dir() {
            bail!("Invalid plugins path '{}': not a directory", dir.display());
        }

        check_readable(&self.tls.cert_path, "certificate").await?;
        check_readable(&self.tls.key_path, "private key").await?;
        if let Some(roots) = &self.tls.upstream_roots {
            check_readable(roots, "upstream roots").await?;
        }
        Ok(self)
    }
}

async fn check_readable(path: &str, what: &str) -> anyhow::Result<()> {
    let f = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to read {} '{}'", what, path))?;
    let meta = f.metadata().await?;
    if !meta.is_file() {
        bail!("Failed to read {} '{}': not a regular file", what, path);
    }
    Ok(())
}
