// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Per-client connection metadata.

use std::net::SocketAddr;
use std::time::Instant;
use tracing::Span;
use uuid::Uuid;

/// Identity of one accepted client, carried through its worker.
#[derive(Debug, Clone)]
pub struct ConnectionMetadata {
    pub id: Uuid,
    pub peer: SocketAddr,
    pub established: Instant,
}

impl ConnectionMetadata {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4(),
            peer,
            established: Instant::now(),
        }
    }

    /// Span every log line of this worker is recorded under.
    pub fn span(&self) -> Span {
        tracing::info_span!("conn", id = %self.id, peer = %self.peer)
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.established.elapsed().as_millis() as u64
    }
}
