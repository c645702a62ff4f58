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

//! Lifetime of one registered tunnel, from becoming current until its
//! connection is closed.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::uri::Authority;
use http::{Request, Response};
use hyper::body::{Body, Incoming};
use hyper::rt::{Read, Write};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{is_connection_closed, ClientProxyError, ForwardError};
use crate::forward::Forwarder;
use crate::slot::{Retire, Slot};
use crate::transport::Session;
use crate::BoxError;

/// Where a tunnel is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelState {
    /// The connection was taken over and the HTTP/2 session built, but
    /// no request can reach it yet.
    Registering,

    /// Current; every forwarded request goes here.
    Active,

    /// Displaced by a newer tunnel and draining.
    Retiring,

    /// The connection is closed. Terminal.
    Closed,
}

impl TunnelState {
    /// Whether a tunnel may move from `self` to `next`.
    #[inline]
    pub const fn can_become(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Registering, Self::Active)
                | (Self::Active, Self::Retiring | Self::Closed)
                | (Self::Retiring, Self::Closed)
        )
    }
}

/// A client connection that is, or was, the current tunnel.
#[derive(Debug)]
pub struct RegisteredTransport {
    /// Registration number, increasing per proxy.
    generation: u64,

    /// Relays requests over the tunnel.
    forwarder: Forwarder,

    /// Fired when another tunnel takes this one's place.
    retirement: CancellationToken,
}

impl RegisteredTransport {
    /// Create the record for a tunnel that is about to become current.
    #[inline]
    pub fn new(generation: u64, forwarder: Forwarder) -> Self {
        Self {
            generation,
            forwarder,
            retirement: CancellationToken::new(),
        }
    }

    /// Registration number of this tunnel.
    #[inline]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a newer tunnel has displaced this one.
    #[inline]
    pub fn is_retired(&self) -> bool {
        self.retirement.is_cancelled()
    }

    /// Whether the tunnel connection has gone away.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.forwarder.is_closed()
    }

    /// Relay `req` over this tunnel. See [`Forwarder::forward`].
    ///
    /// # Errors
    ///
    /// Same as [`Forwarder::forward`].
    #[inline]
    pub async fn forward<B>(&self, req: Request<B>) -> Result<Response<Incoming>, ForwardError>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        self.forwarder.forward(req).await
    }
}

impl Retire for RegisteredTransport {
    #[inline]
    fn retire(&self) {
        self.retirement.cancel();
    }
}

/// Tracks and logs the state of one tunnel.
struct Lifecycle {
    /// Registration number, for logs.
    generation: u64,

    /// Current state.
    state: TunnelState,
}

impl Lifecycle {
    /// Move to `next`.
    fn enter(&mut self, next: TunnelState) {
        debug_assert!(
            self.state.can_become(next),
            "invalid tunnel transition {:?} -> {:?}",
            self.state,
            next
        );
        debug!(
            generation = self.generation,
            from = ?self.state,
            to = ?next,
            "tunnel state changed"
        );
        self.state = next;
    }
}

/// Make `session` the current tunnel and keep it running until it is
/// displaced and drained, or until its connection ends by itself.
///
/// Storing the tunnel retires the previous one. Once this tunnel is
/// retired it gets `shutdown_timeout` to finish in-flight requests;
/// after that its connection is aborted.
pub(crate) async fn hold<T>(
    session: Session<T>,
    generation: u64,
    authority: Option<Authority>,
    slot: &Slot<RegisteredTransport>,
    shutdown_timeout: Duration,
) -> Result<(), ClientProxyError>
where
    T: Read + Write + Unpin + Send + 'static,
{
    let Session {
        sender,
        connection,
        mut close,
    } = session;
    let mut lifecycle = Lifecycle {
        generation,
        state: TunnelState::Registering,
    };

    let registered = Arc::new(RegisteredTransport::new(
        generation,
        Forwarder::new(sender, authority),
    ));
    let retirement = registered.retirement.clone();
    let weak = Arc::downgrade(&registered);
    match slot.store(registered) {
        Some(previous) => info!(
            generation,
            replaced = previous.generation(),
            "client registered, retiring previous tunnel"
        ),
        None => info!(generation, "client registered"),
    }
    lifecycle.enter(TunnelState::Active);

    let mut connection = Box::pin(connection);
    let ended = tokio::select! {
        result = connection.as_mut() => Some(result),
        () = retirement.cancelled() => None,
    };

    if let Some(result) = ended {
        // The session holds stream references of its own; release it
        // before waiting for the stream to go away.
        drop(connection);
        // Stop handing out a dead tunnel, unless a newer one took over.
        if let Some(registered) = weak.upgrade() {
            slot.clear_if(&registered);
        }
        close.abort();
        close.closed().await;
        lifecycle.enter(TunnelState::Closed);
        info!(generation, "client connection ended");
        return match result {
            Ok(()) => Ok(()),
            Err(err) if is_connection_closed(&err) => Ok(()),
            Err(err) => Err(ClientProxyError::ConnectionLost(err)),
        };
    }

    lifecycle.enter(TunnelState::Retiring);
    info!(generation, "tunnel displaced, draining");

    // The HTTP/2 session winds down once the last request handle is
    // released; the stream is dropped when in-flight exchanges finish.
    let drained = tokio::time::timeout(shutdown_timeout, async {
        let result = connection.await;
        close.closed().await;
        result
    })
    .await;

    let outcome = match drained {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) if is_connection_closed(&err) => Ok(()),
        Ok(Err(err)) => Err(ClientProxyError::Shutdown(err)),
        Err(_elapsed) => {
            warn!(
                generation,
                timeout = ?shutdown_timeout,
                "tunnel did not drain in time, closing"
            );
            Err(ClientProxyError::ShutdownTimeout(shutdown_timeout))
        }
    };
    close.abort();
    close.closed().await;
    lifecycle.enter(TunnelState::Closed);
    info!(generation, "tunnel closed");
    outcome
}
