// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Intercepting HTTP/HTTPS forward proxy.
//!
//! Requests and responses pass through a chain of plugins, each run by a
//! scripting interpreter, before being forwarded. CONNECT tunnels are
//! terminated on both sides with a certificate minted for the target host.

pub mod ca;
pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod error_page;
pub mod plugin;
pub mod proxy;
pub mod request_line;
pub mod tls;
pub mod wire;
