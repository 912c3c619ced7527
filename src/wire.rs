// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! HTTP/1.x message framing over a byte stream.
//!
//! Only the head is inspected, and only far enough to find where the message
//! ends. Bodies are carried as opaque bytes, chunked encoding included.

use bytes::BytesMut;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProxyError, Result};

/// Upper bound on a message head (request/status line plus headers).
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Body size limit used unless configured otherwise.
pub const DEFAULT_MAX_BODY: usize = 16 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyLength {
    Empty,
    Fixed(usize),
    Chunked,
    UntilEof,
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn header_values<'a>(head: &'a [u8], name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    head.split(|&b| b == b'\n')
        .skip(1)
        .filter_map(|line| std::str::from_utf8(line).ok())
        .filter_map(move |line| {
            let (k, v) = line.split_once(':')?;
            k.trim().eq_ignore_ascii_case(name).then(|| v.trim())
        })
}

fn is_chunked(head: &[u8]) -> bool {
    header_values(head, "transfer-encoding")
        .last()
        .and_then(|v| v.rsplit(',').next())
        .map(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

fn content_length(head: &[u8]) -> Result<Option<usize>> {
    match header_values(head, "content-length").next() {
        Some(v) => v
            .parse::<usize>()
            .map(Some)
            .map_err(|_| ProxyError::MalformedHeader),
        None => Ok(None),
    }
}

fn status_code(head: &[u8]) -> Option<u16> {
    let line = head.split(|&b| b == b'\r' || b == b'\n').next()?;
    let code = line.split(|&b| b == b' ').nth(1)?;
    std::str::from_utf8(code).ok()?.parse().ok()
}

fn request_body(head: &[u8]) -> Result<BodyLength> {
    if is_chunked(head) {
        return Ok(BodyLength::Chunked);
    }
    Ok(match content_length(head)? {
        Some(0) | None => BodyLength::Empty,
        Some(n) => BodyLength::Fixed(n),
    })
}

fn response_body(head: &[u8], head_request: bool) -> Result<BodyLength> {
    let status = status_code(head).ok_or(ProxyError::MalformedHeader)?;
    if head_request || (100..200).contains(&status) || status == 204 || status == 304 {
        return Ok(BodyLength::Empty);
    }
    if is_chunked(head) {
        return Ok(BodyLength::Chunked);
    }
    Ok(match content_length(head)? {
        Some(0) => BodyLength::Empty,
        Some(n) => BodyLength::Fixed(n),
        None => BodyLength::UntilEof,
    })
}

/// Reads whole HTTP messages off a stream, keeping any bytes that belong to
/// the next message for the following call.
pub struct MessageReader<R> {
    inner: R,
    carry: BytesMut,
    idle: Duration,
    body_limit: usize,
}

impl<R> MessageReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R, idle: Duration) -> Self {
        Self {
            inner,
            carry: BytesMut::with_capacity(READ_CHUNK),
            idle,
            body_limit: DEFAULT_MAX_BODY,
        }
    }

    /// Refuse bodies longer than `limit` bytes with [`ProxyError::BodyTooLarge`].
    pub fn with_body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    async fn read_more(&mut self) -> Result<usize> {
        self.carry.reserve(READ_CHUNK);
        match tokio::time::timeout(self.idle, self.inner.read_buf(&mut self.carry)).await {
            Ok(res) => Ok(res?),
            Err(_) => Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "peer idle",
            ))),
        }
    }

    async fn fill_to(&mut self, need: usize) -> Result<()> {
        while self.carry.len() < need {
            if self.read_more().await? == 0 {
                return Err(ProxyError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
        }
        Ok(())
    }

    /// Returns the head length, or `None` on EOF before the first byte.
    async fn read_head(&mut self) -> Result<Option<usize>> {
        loop {
            if let Some(pos) = find(&self.carry, b"\r\n\r\n") {
                return Ok(Some(pos + 4));
            }
            if self.carry.len() > MAX_HEAD_SIZE {
                return Err(ProxyError::HeadTooLarge {
                    limit: MAX_HEAD_SIZE,
                });
            }
            if self.read_more().await? == 0 {
                if self.carry.is_empty() {
                    return Ok(None);
                }
                return Err(ProxyError::Io(std::io::ErrorKind::UnexpectedEof.into()));
            }
        }
    }

    fn too_large(&self) -> ProxyError {
        ProxyError::BodyTooLarge {
            limit: self.body_limit,
        }
    }

    /// Offset of the next CRLF at or after `from`. The body starting at
    /// `start` may not grow past the limit while looking for it.
    async fn line_end(&mut self, from: usize, start: usize) -> Result<usize> {
        loop {
            if let Some(p) = find(&self.carry[from..], b"\r\n") {
                return Ok(from + p);
            }
            if self.carry.len() - start > self.body_limit {
                return Err(self.too_large());
            }
            let need = self.carry.len() + 1;
            self.fill_to(need).await?;
        }
    }

    /// Offset one past the last byte of the chunked body starting at `start`.
    async fn chunked_end(&mut self, start: usize) -> Result<usize> {
        let mut off = start;
        loop {
            let line_end = self.line_end(off, start).await?;
            let size_field = std::str::from_utf8(&self.carry[off..line_end])
                .map_err(|_| ProxyError::MalformedHeader)?;
            let size_hex = size_field.split(';').next().unwrap_or("").trim();
            let size =
                usize::from_str_radix(size_hex, 16).map_err(|_| ProxyError::MalformedHeader)?;
            off = line_end + 2;

            if size == 0 {
                // Trailer section: lines until an empty one.
                loop {
                    let end = self.line_end(off, start).await?;
                    let empty = end == off;
                    off = end + 2;
                    if empty {
                        return Ok(off);
                    }
                }
            }

            off = off
                .checked_add(size)
                .and_then(|o| o.checked_add(2))
                .ok_or(ProxyError::MalformedHeader)?;
            if off - start > self.body_limit {
                return Err(self.too_large());
            }
            self.fill_to(off).await?;
        }
    }

    async fn read_body(&mut self, head_len: usize, body: BodyLength) -> Result<BytesMut> {
        let total = match body {
            BodyLength::Empty => head_len,
            BodyLength::Fixed(n) => {
                let total = head_len
                    .checked_add(n)
                    .ok_or(ProxyError::MalformedHeader)?;
                if n > self.body_limit {
                    return Err(self.too_large());
                }
                self.fill_to(total).await?;
                total
            }
            BodyLength::Chunked => self.chunked_end(head_len).await?,
            BodyLength::UntilEof => loop {
                if self.carry.len() - head_len > self.body_limit {
                    return Err(self.too_large());
                }
                if self.read_more().await? == 0 {
                    break self.carry.len();
                }
            },
        };
        Ok(self.carry.split_to(total))
    }

    /// Next request, or `None` when the peer closed between messages.
    pub async fn read_request(&mut self) -> Result<Option<BytesMut>> {
        let Some(head_len) = self.read_head().await? else {
            return Ok(None);
        };
        let body = request_body(&self.carry[..head_len])?;
        self.read_body(head_len, body).await.map(Some)
    }

    /// Next response. `head_request` suppresses the body as HEAD requires.
    pub async fn read_response(&mut self, head_request: bool) -> Result<Option<BytesMut>> {
        let Some(head_len) = self.read_head().await? else {
            return Ok(None);
        };
        let body = response_body(&self.carry[..head_len], head_request)?;
        self.read_body(head_len, body).await.map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::io::AsyncWriteExt;

    const IDLE: Duration = Duration::from_secs(2);

    async fn reader_over(bytes: &'static [u8]) -> MessageReader<tokio::io::DuplexStream> {
        let (mut tx, rx) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let _ = tx.write_all(bytes).await;
        });
        MessageReader::new(rx, IDLE)
    }

    #[tokio::test]
    async fn splits_pipelined_requests() -> anyhow::Result<()> {
        let mut r = reader_over(
            b"POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nabcGET /b HTTP/1.1\r\n\r\n",
        )
        .await;
        let first = r.read_request().await?.expect("first");
        assert_eq!(&first[..], b"POST /a HTTP/1.1\r\nContent-Length: 3\r\n\r\nabc");
        let second = r.read_request().await?.expect("second");
        assert_eq!(&second[..], b"GET /b HTTP/1.1\r\n\r\n");
        assert!(r.read_request().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn chunked_response_includes_trailers() -> anyhow::Result<()> {
        let raw: &'static [u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3;x=y\r\nabc\r\n0\r\nX-T: 1\r\n\r\nNEXT";
        let mut r = reader_over(raw).await;
        let msg = r.read_response(false).await?.expect("msg");
        assert_eq!(&msg[..], &raw[..raw.len() - 4]);
        Ok(())
    }

    #[tokio::test]
    async fn response_without_length_reads_to_eof() -> anyhow::Result<()> {
        let raw: &'static [u8] = b"HTTP/1.0 200 OK\r\n\r\nhello world";
        let mut r = reader_over(raw).await;
        let msg = r.read_response(false).await?.expect("msg");
        assert_eq!(&msg[..], raw);
        Ok(())
    }

    #[rstest]
    #[case(b"HTTP/1.1 204 No Content\r\n\r\n".as_slice(), false)]
    #[case(b"HTTP/1.1 304 Not Modified\r\nContent-Length: 10\r\n\r\n".as_slice(), false)]
    #[case(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n".as_slice(), true)]
    fn bodiless_responses(#[case] head: &[u8], #[case] head_request: bool) {
        assert_eq!(
            response_body(head, head_request).expect("framing"),
            BodyLength::Empty
        );
    }

    #[test]
    fn bad_content_length_is_malformed() {
        let head = b"POST / HTTP/1.1\r\nContent-Length: -1\r\n\r\n";
        assert!(matches!(
            request_body(head),
            Err(ProxyError::MalformedHeader)
        ));
    }

    #[tokio::test]
    async fn oversized_head_is_rejected() {
        let (mut tx, rx) = tokio::io::duplex(256 * 1024);
        tokio::spawn(async move {
            let junk = vec![b'a'; MAX_HEAD_SIZE + READ_CHUNK * 2];
            let _ = tx.write_all(&junk).await;
        });
        let mut r = MessageReader::new(rx, IDLE);
        assert!(matches!(
            r.read_request().await,
            Err(ProxyError::HeadTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let mut r = reader_over(b"POST / HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc").await;
        assert!(matches!(r.read_request().await, Err(ProxyError::Io(_))));
    }

    #[tokio::test]
    async fn huge_chunk_size_is_malformed() {
        let mut r = reader_over(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nffffffffffffffff\r\nabc",
        )
        .await;
        assert!(matches!(
            r.read_response(false).await,
            Err(ProxyError::MalformedHeader)
        ));
    }

    #[tokio::test]
    async fn huge_content_length_is_malformed() {
        let mut r = reader_over(
            b"POST / HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\nabc",
        )
        .await;
        assert!(matches!(
            r.read_request().await,
            Err(ProxyError::MalformedHeader)
        ));
    }

    #[rstest]
    #[case(b"POST / HTTP/1.1\r\nContent-Length: 17\r\n\r\n".as_slice())]
    #[case(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n20\r\n".as_slice())]
    #[tokio::test]
    async fn request_body_over_limit_is_refused(#[case] raw: &'static [u8]) {
        let mut r = reader_over(raw).await.with_body_limit(16);
        assert!(matches!(
            r.read_request().await,
            Err(ProxyError::BodyTooLarge { limit: 16 })
        ));
    }

    #[tokio::test]
    async fn unbounded_response_over_limit_is_refused() {
        let (mut tx, rx) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let _ = tx.write_all(b"HTTP/1.0 200 OK\r\n\r\n").await;
            let _ = tx.write_all(&[b'x'; 4096]).await;
        });
        let mut r = MessageReader::new(rx, IDLE).with_body_limit(1024);
        assert!(matches!(
            r.read_response(false).await,
            Err(ProxyError::BodyTooLarge { limit: 1024 })
        ));
    }

    #[tokio::test]
    async fn body_at_limit_is_accepted() -> anyhow::Result<()> {
        let mut r = reader_over(b"POST / HTTP/1.1\r\nContent-Length: 4\r\n\r\nabcd")
            .await
            .with_body_limit(4);
        let msg = r.read_request().await?.expect("msg");
        assert!(msg.ends_with(b"abcd"));
        Ok(())
    }
}
