// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Error types for the proxy core.

use std::fmt;
use thiserror::Error;

/// Which of the two TLS sessions failed to come up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeSide {
    /// Proxy acting as TLS client toward the origin.
    ProxyToServer,
    /// Proxy acting as TLS server toward the browser.
    ProxyToClient,
}

impl fmt::Display for HandshakeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeSide::ProxyToServer => f.write_str("proxy-to-server"),
            HandshakeSide::ProxyToClient => f.write_str("proxy-to-client"),
        }
    }
}

/// Errors scoped to a single client connection.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Malformed HTTP header")]
    MalformedHeader,

    #[error("Malformed HTTP/HTTPS URL, unknown proto")]
    UnknownProtocol,

    #[error("Cannot find protocol (http|https) in request line")]
    NoProtocolFound,

    #[error("{detail}")]
    Connect {
        host: String,
        port: u16,
        detail: String,
    },

    #[error("handshake {side} failed for '{target}': {reason}")]
    Handshake {
        side: HandshakeSide,
        target: String,
        reason: String,
    },

    #[error("write to peer failed: {0}")]
    Write(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("message head exceeds {limit} bytes")]
    HeadTooLarge { limit: usize },

    #[error("message body exceeds {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),
}

impl ProxyError {
    /// True when the error page may still be written to the client socket.
    pub fn wants_error_page(&self) -> bool {
        matches!(
            self,
            ProxyError::MalformedHeader
                | ProxyError::UnknownProtocol
                | ProxyError::Connect { .. }
                | ProxyError::HeadTooLarge { .. }
                | ProxyError::BodyTooLarge { .. }
        )
    }
}

/// Lifecycle and loading errors of interpreter instances.
#[derive(Error, Debug)]
pub enum PluginError {
    #[error("no interpreter registered for kind '{0}'")]
    UnknownKind(String),

    #[error("failed to load '{path}': {reason}")]
    Load { path: String, reason: String },

    #[error("interpreter instance '{0}' is destroyed")]
    Destroyed(String),

    #[error("refusing to destroy '{kind}' interpreter: {live} instance(s) still live")]
    InstancesStillLive { kind: String, live: usize },
}

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_error_displays_detail_only() {
        let e = ProxyError::Connect {
            host: "nowhere.invalid".into(),
            port: 80,
            detail: "Cannot resolve 'nowhere.invalid'".into(),
        };
        assert_eq!(e.to_string(), "Cannot resolve 'nowhere.invalid'");
        assert!(e.wants_error_page());
    }

    #[test]
    fn handshake_error_names_side_and_target() {
        let e = ProxyError::Handshake {
            side: HandshakeSide::ProxyToClient,
            target: "example.com:443".into(),
            reason: "eof".into(),
        };
        let s = e.to_string();
        assert!(s.contains("proxy-to-client"));
        assert!(s.contains("example.com:443"));
        assert!(!e.wants_error_page());
    }

    #[test]
    fn oversized_messages_get_an_error_page() {
        assert!(ProxyError::HeadTooLarge { limit: 1 }.wants_error_page());
        let e = ProxyError::BodyTooLarge { limit: 16 };
        assert!(e.wants_error_page());
        assert_eq!(e.to_string(), "message body exceeds 16 bytes");
    }
}
