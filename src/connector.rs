// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Outbound connection to the origin server.

use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::config::{Config, IpVersion};
use crate::error::{ProxyError, Result};

/// Knobs the connector takes from configuration.
#[derive(Debug, Clone, Copy)]
pub struct ConnectOptions {
    pub ip_version: IpVersion,
    pub timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            ip_version: IpVersion::Any,
            timeout: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for ConnectOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            ip_version: cfg.general.ip_version,
            timeout: Duration::from_secs(cfg.general.connect_timeout_secs),
        }
    }
}

fn failure(host: &str, port: u16, detail: String) -> ProxyError {
    ProxyError::Connect {
        host: host.to_string(),
        port,
        detail,
    }
}

/// Resolve `host` once and connect to the first address of the configured
/// family that accepts. There is no retry; the error detail is safe to show
/// on the error page.
pub async fn connect(host: &str, port: u16, opts: &ConnectOptions) -> Result<TcpStream> {
    if host.is_empty() {
        return Err(failure(host, port, "Cannot connect: empty hostname".into()));
    }
    if port == 0 {
        return Err(failure(
            host,
            port,
            format!("Cannot connect to '{}': invalid port", host),
        ));
    }

    match tokio::time::timeout(opts.timeout, resolve_and_connect(host, port, opts.ip_version))
        .await
    {
        Ok(res) => res,
        Err(_) => Err(failure(
            host,
            port,
            format!("Connection to '{}:{}' timed out", host, port),
        )),
    }
}

async fn resolve_and_connect(host: &str, port: u16, family: IpVersion) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| failure(host, port, format!("Cannot resolve '{}': {}", host, e)))?
        .filter(|a| family.accepts(a))
        .collect();
    trace!(%host, port, count = addrs.len(), "resolved");

    if addrs.is_empty() {
        let fam = match family {
            IpVersion::V4 => "IPv4 ",
            IpVersion::V6 => "IPv6 ",
            IpVersion::Any => "",
        };
        return Err(failure(
            host,
            port,
            format!("No {}address found for '{}'", fam, host),
        ));
    }

    let mut last_err = None;
    for addr in &addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                debug!(%host, %addr, "connected to origin");
                return Ok(stream);
            }
            Err(e) => {
                debug!(%addr, %e, "connect failed");
                last_err = Some(e);
            }
        }
    }

    let reason = last_err
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no usable address".into());
    Err(failure(
        host,
        port,
        format!("Cannot connect to '{}:{}': {}", host, port, reason),
    ))
}
