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

//! Building an HTTP/2 client session on a connection this side did not
//! dial.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll};
use std::io;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Body;
use hyper::client::conn::http2::Builder as Http2Builder;
use hyper::client::conn::http2::{Connection as ClientConnection, SendRequest};
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::rt::{TokioExecutor, TokioTimer};
use pin_project::pin_project;
use tokio::sync::oneshot;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::error::ClientProxyError;
use crate::BoxError;

/// Body type of everything this crate sends or answers with.
pub type ProxyBody = BoxBody<Bytes, BoxError>;

/// The HTTP/2 connection future of a tunnel. It has to be polled for
/// requests on the matching [`SendRequest`] to make progress.
pub type TunnelConnection<T> = ClientConnection<GuardedIo<T>, ProxyBody, TokioExecutor>;

/// An empty [`ProxyBody`].
#[inline]
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// A [`ProxyBody`] holding `bytes`.
#[inline]
pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// Box any body into a [`ProxyBody`] without buffering it.
#[inline]
pub fn box_body<B>(body: B) -> ProxyBody
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    body.map_err(Into::into).boxed()
}

/// A freshly built tunnel session.
pub struct Session<T>
where
    T: Read + Write + Unpin + Send + 'static,
{
    /// Originates requests toward the remote side.
    pub sender: SendRequest<ProxyBody>,

    /// Drives the session; see [`TunnelConnection`].
    pub connection: TunnelConnection<T>,

    /// Observes and forces the end of the underlying stream.
    pub close: CloseHandle,
}

/// Start an HTTP/2 session in the client role over `io`, wherever `io`
/// came from.
///
/// The remote end is expected to answer as an HTTP/2 server. When
/// `keep_alive` is set, pings are sent at that interval and the session
/// fails once they go unanswered.
///
/// # Errors
///
/// Returns [`ClientProxyError::TransportInit`] if the connection
/// preface cannot be written.
#[inline]
pub async fn handshake<T>(
    io: T,
    keep_alive: Option<Duration>,
) -> Result<Session<T>, ClientProxyError>
where
    T: Read + Write + Unpin + Send + 'static,
{
    let (io, close) = GuardedIo::new(io);
    let mut builder = Http2Builder::new(TokioExecutor::new());
    builder.timer(TokioTimer::new());
    if let Some(interval) = keep_alive {
        builder
            .keep_alive_interval(interval)
            .keep_alive_while_idle(true);
    }
    let (sender, connection) = builder
        .handshake(io)
        .await
        .map_err(ClientProxyError::TransportInit)?;
    Ok(Session {
        sender,
        connection,
        close,
    })
}

/// Lets the owner of a [`GuardedIo`] tear it down and learn when it is
/// gone.
#[derive(Debug)]
pub struct CloseHandle {
    /// Fails all further IO on the stream once cancelled.
    abort: CancellationToken,

    /// Completes when the stream is dropped.
    closed: oneshot::Receiver<()>,

    /// Set once `closed` has completed.
    done: bool,
}

impl CloseHandle {
    /// Make every further read and write on the stream fail.
    #[inline]
    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// Wait until the stream has been dropped.
    #[inline]
    pub async fn closed(&mut self) {
        if !self.done {
            // The sender is never used, only dropped.
            let _: Result<(), oneshot::error::RecvError> = (&mut self.closed).await;
            self.done = true;
        }
    }
}

/// A stream that can be failed from the outside and reports when it
/// has been dropped.
#[pin_project]
#[derive(Debug)]
pub struct GuardedIo<T> {
    /// The stream itself.
    #[pin]
    inner: T,

    /// Cancelled to abort the stream.
    abort: CancellationToken,

    /// Wakes pending reads and writes on abort.
    aborted: Pin<Box<WaitForCancellationFutureOwned>>,

    /// Dropped together with the stream.
    _closed: oneshot::Sender<()>,
}

impl<T> GuardedIo<T> {
    /// Wrap `inner`, returning the handle that controls it.
    #[inline]
    pub fn new(inner: T) -> (Self, CloseHandle) {
        let abort = CancellationToken::new();
        let (tx, rx) = oneshot::channel();
        let io = Self {
            inner,
            aborted: Box::pin(abort.clone().cancelled_owned()),
            abort: abort.clone(),
            _closed: tx,
        };
        let handle = CloseHandle {
            abort,
            closed: rx,
            done: false,
        };
        (io, handle)
    }
}

/// Check the abort signal, registering for wake-up if not yet fired.
fn poll_aborted(
    abort: &CancellationToken,
    aborted: &mut Pin<Box<WaitForCancellationFutureOwned>>,
    cx: &mut Context<'_>,
) -> bool {
    abort.is_cancelled() || aborted.as_mut().poll(cx).is_ready()
}

/// The error every operation on an aborted stream returns.
fn aborted_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "tunnel closed")
}

impl<T: Read> Read for GuardedIo<T> {
    #[inline]
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if poll_aborted(this.abort, this.aborted, cx) {
            return Poll::Ready(Err(aborted_error()));
        }
        this.inner.poll_read(cx, buf)
    }
}

impl<T: Write> Write for GuardedIo<T> {
    #[inline]
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        if poll_aborted(this.abort, this.aborted, cx) {
            return Poll::Ready(Err(aborted_error()));
        }
        this.inner.poll_write(cx, buf)
    }

    #[inline]
    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        if poll_aborted(this.abort, this.aborted, cx) {
            return Poll::Ready(Err(aborted_error()));
        }
        this.inner.poll_write_vectored(cx, bufs)
    }

    #[inline]
    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    #[inline]
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        if poll_aborted(this.abort, this.aborted, cx) {
            return Poll::Ready(Err(aborted_error()));
        }
        this.inner.poll_flush(cx)
    }

    #[inline]
    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}
