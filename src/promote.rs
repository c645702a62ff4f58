// Copyright 2024 All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Taking a registering connection away from the HTTP/1.1 pipeline.

use core::pin::Pin;
use core::task::{Context, Poll};
use std::io;

use bytes::Bytes;
use futures::future::poll_fn;
use http::header::{CONNECTION, UPGRADE};
use http::{HeaderValue, Request, Response, StatusCode, Version};
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::upgrade::{OnUpgrade, Upgraded};
use pin_project::pin_project;
use tracing::debug;

use crate::error::ClientProxyError;
use crate::transport::{empty_body, ProxyBody};
use crate::{REGISTRATION_HEADER, UPGRADE_HEADER_VALUE};

/// Reports whether `req` presents `secret` in the registration header.
#[inline]
pub fn is_registration<B>(req: &Request<B>, secret: &HeaderValue) -> bool {
    req.headers()
        .get(REGISTRATION_HEADER)
        .is_some_and(|value| value.as_bytes() == secret.as_bytes())
}

/// Check that a registration request can be taken over and build the
/// `101 Switching Protocols` answer for it.
///
/// The returned [`OnUpgrade`] resolves once hyper has written the
/// response and released the connection; pass it to [`promote`].
///
/// # Errors
///
/// Returns [`ClientProxyError::ProtocolViolation`] when the request is
/// not an HTTP/1.1 upgrade to [`UPGRADE_HEADER_VALUE`] or the server
/// connection was not set up to allow upgrades.
#[inline]
pub fn accept<B>(req: &mut Request<B>) -> Result<(Response<ProxyBody>, OnUpgrade), ClientProxyError> {
    if req.version() != Version::HTTP_11 {
        return Err(ClientProxyError::ProtocolViolation(
            "registration must use HTTP/1.1",
        ));
    }
    let wants_upgrade = req
        .headers()
        .get(UPGRADE)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case(UPGRADE_HEADER_VALUE));
    if !wants_upgrade {
        return Err(ClientProxyError::ProtocolViolation(
            "registration must request `upgrade: client-proxy`",
        ));
    }
    let on_upgrade = req
        .extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or(ClientProxyError::ProtocolViolation(
            "server connection does not support upgrades",
        ))?;

    let mut response = Response::new(empty_body());
    *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    response
        .headers_mut()
        .insert(UPGRADE, HeaderValue::from_static(UPGRADE_HEADER_VALUE));
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("upgrade"));
    Ok((response, on_upgrade))
}

/// Wait for hyper to release the connection and take ownership of it.
///
/// When the server's connection type is `T` the raw connection is taken
/// out together with whatever the HTTP/1.1 parser had already read
/// past the request, and those bytes are replayed first. Otherwise the
/// hyper upgrade stream is used as is.
///
/// # Errors
///
/// Returns [`ClientProxyError::Upgrade`] if hyper could not hand the
/// connection over and [`ClientProxyError::Flush`] if pending writes
/// could not be flushed.
#[inline]
pub async fn promote<T>(on_upgrade: OnUpgrade) -> Result<PromotedConn<T>, ClientProxyError>
where
    T: Read + Write + Unpin + 'static,
{
    let upgraded = on_upgrade.await.map_err(ClientProxyError::Upgrade)?;
    let mut conn = match upgraded.downcast::<T>() {
        Ok(parts) => {
            debug!(buffered = parts.read_buf.len(), "took over raw connection");
            PromotedConn::Detached(Rewind::new(parts.io, parts.read_buf))
        }
        Err(upgraded) => {
            debug!("unknown connection type, keeping upgrade stream");
            PromotedConn::Upgraded(upgraded)
        }
    };
    poll_fn(|cx| Pin::new(&mut conn).poll_flush(cx))
        .await
        .map_err(ClientProxyError::Flush)?;
    Ok(conn)
}

/// The connection of a registered client once it left the HTTP/1.1
/// pipeline.
#[pin_project(project = PromotedConnProj)]
#[derive(Debug)]
pub enum PromotedConn<T> {
    /// The raw server connection, replaying read-ahead bytes first.
    Detached(#[pin] Rewind<T>),

    /// hyper's own upgrade stream.
    Upgraded(#[pin] Upgraded),
}

impl<T: Read> Read for PromotedConn<T> {
    #[inline]
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        match self.project() {
            PromotedConnProj::Detached(io) => io.poll_read(cx, buf),
            PromotedConnProj::Upgraded(io) => io.poll_read(cx, buf),
        }
    }
}

impl<T: Write> Write for PromotedConn<T> {
    #[inline]
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.project() {
            PromotedConnProj::Detached(io) => io.poll_write(cx, buf),
            PromotedConnProj::Upgraded(io) => io.poll_write(cx, buf),
        }
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            PromotedConnProj::Detached(io) => io.poll_flush(cx),
            PromotedConnProj::Upgraded(io) => io.poll_flush(cx),
        }
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.project() {
            PromotedConnProj::Detached(io) => io.poll_shutdown(cx),
            PromotedConnProj::Upgraded(io) => io.poll_shutdown(cx),
        }
    }
}

/// A connection whose first reads are served from bytes that were
/// already taken off it.
#[pin_project]
#[derive(Debug)]
pub struct Rewind<T> {
    /// Bytes read ahead by the previous owner, not yet replayed.
    pre: Option<Bytes>,

    /// The connection itself.
    #[pin]
    inner: T,
}

impl<T> Rewind<T> {
    /// Wrap `inner` so that `buffered` is read before anything else.
    #[inline]
    pub fn new(inner: T, buffered: Bytes) -> Self {
        Self {
            pre: (!buffered.is_empty()).then_some(buffered),
            inner,
        }
    }

    /// Number of replay bytes not yet read.
    #[inline]
    pub fn buffered(&self) -> usize {
        self.pre.as_ref().map_or(0, Bytes::len)
    }
}

impl<T: Read> Read for Rewind<T> {
    #[inline]
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        mut buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        // An empty read would look like end of stream.
        if buf.remaining() == 0 {
            return this.inner.poll_read(cx, buf);
        }
        if let Some(mut prefix) = this.pre.take() {
            let chunk = prefix.split_to(prefix.len().min(buf.remaining()));
            buf.put_slice(&chunk);
            if !prefix.is_empty() {
                *this.pre = Some(prefix);
            }
            return Poll::Ready(Ok(()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<T: Write> Write for Rewind<T> {
    #[inline]
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    #[inline]
    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }

    #[inline]
    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use hyper_util::rt::TokioIo;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    fn registration(version: Version) -> Request<()> {
        Request::builder()
            .version(version)
            .uri("/")
            .header(REGISTRATION_HEADER, "s3cret")
            .header(UPGRADE, UPGRADE_HEADER_VALUE)
            .body(())
            .unwrap()
    }

    #[test]
    fn matches_exact_secret_only() {
        let secret = HeaderValue::from_static("s3cret");
        assert!(is_registration(&registration(Version::HTTP_11), &secret));

        let other = HeaderValue::from_static("s3cret2");
        assert!(!is_registration(&registration(Version::HTTP_11), &other));

        let plain = Request::builder().uri("/").body(()).unwrap();
        assert!(!is_registration(&plain, &secret));
    }

    #[test]
    fn rejects_http2_registration() {
        let mut req = registration(Version::HTTP_2);
        assert!(matches!(
            accept(&mut req),
            Err(ClientProxyError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn rejects_registration_without_upgrade_header() {
        let mut req = Request::builder()
            .uri("/")
            .header(REGISTRATION_HEADER, "s3cret")
            .body(())
            .unwrap();
        assert!(matches!(
            accept(&mut req),
            Err(ClientProxyError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn rejects_registration_on_non_upgradable_connection() {
        // Requests that did not come through a hyper HTTP/1.1 server
        // carry no `OnUpgrade`.
        let mut req = registration(Version::HTTP_11);
        assert!(matches!(
            accept(&mut req),
            Err(ClientProxyError::ProtocolViolation(_))
        ));
    }

    #[tokio::test]
    async fn rewind_replays_buffered_bytes_before_the_connection() {
        let (near, mut far) = tokio::io::duplex(64);
        let rewind = Rewind::new(TokioIo::new(near), Bytes::from_static(b"PRI * "));
        assert_eq!(rewind.buffered(), 6);
        let mut io = TokioIo::new(rewind);

        far.write_all(b"HTTP/2.0").await.unwrap();
        let mut out = [0_u8; 14];
        io.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"PRI * HTTP/2.0");
    }

    #[tokio::test]
    async fn rewind_splits_replay_across_small_reads() {
        let (near, mut far) = tokio::io::duplex(64);
        let mut io = TokioIo::new(Rewind::new(
            TokioIo::new(near),
            Bytes::from_static(b"abcdef"),
        ));
        far.write_all(b"gh").await.unwrap();

        let mut seen = Vec::new();
        let mut chunk = [0_u8; 4];
        while seen.len() < 8 {
            let n = io.read(&mut chunk).await.unwrap();
            seen.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(seen, b"abcdefgh");
    }

    #[tokio::test]
    async fn rewind_never_reports_eof_into_a_full_buffer() {
        let (near, _far) = tokio::io::duplex(64);
        let mut rewind = Rewind::new(TokioIo::new(near), Bytes::from_static(b"abc"));
        let mut cx = Context::from_waker(futures::task::noop_waker_ref());
        let mut storage: [u8; 0] = [];
        let mut full = hyper::rt::ReadBuf::new(&mut storage);

        // Nothing is buffered on the pipe, so the read must wait rather
        // than complete empty.
        let polled = Pin::new(&mut rewind).poll_read(&mut cx, full.unfilled());
        assert!(polled.is_pending());
        assert_eq!(rewind.buffered(), 3);

        let mut io = TokioIo::new(rewind);
        let mut out = [0_u8; 3];
        io.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"abc");
    }

    #[tokio::test]
    async fn rewind_without_buffer_reads_through() {
        let (near, mut far) = tokio::io::duplex(64);
        let rewind = Rewind::new(TokioIo::new(near), Bytes::new());
        assert_eq!(rewind.buffered(), 0);
        let mut io = TokioIo::new(rewind);

        far.write_all(b"direct").await.unwrap();
        io.write_all(b"back").await.unwrap();
        let mut out = [0_u8; 6];
        io.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"direct");
        let mut back = [0_u8; 4];
        far.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"back");
    }
}
