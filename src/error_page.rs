// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Synthetic HTML error page written back to the client on setup failure.

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::error;

use crate::error::{ProxyError, Result};

pub const HTML_HEADER: &str = "<html><body><h1>proxenet error page</h1><br/>";
pub const HTML_FOOTER: &str = "</body></html>";

/// Render the page body. `message` is inserted verbatim, without escaping;
/// callers only pass diagnostics generated by the proxy itself.
pub fn render(message: &str) -> String {
    let mut page = String::with_capacity(HTML_HEADER.len() + message.len() + HTML_FOOTER.len());
    page.push_str(HTML_HEADER);
    page.push_str(message);
    page.push_str(HTML_FOOTER);
    page
}

/// Best-effort write of the error page. Failures are logged here and
/// returned as [`ProxyError::Write`]; callers tear the connection down
/// regardless of the outcome.
pub async fn write_error_page<W>(sock: &mut W, message: &str) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let parts = [
        ("header", HTML_HEADER),
        ("page", message),
        ("footer", HTML_FOOTER),
    ];
    for (what, part) in parts {
        if let Err(e) = sock.write_all(part.as_bytes()).await {
            error!(%e, "failed to write error HTML {}", what);
            return Err(ProxyError::Write(e));
        }
    }
    sock.flush().await.map_err(ProxyError::Write)
}
