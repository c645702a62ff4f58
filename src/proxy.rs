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

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use http::uri::Authority;
use http::{HeaderValue, Request, Response};
use hyper::rt::{Read, Write};
use hyper::upgrade::OnUpgrade;
use tracing::debug;

use crate::config::ClientProxyConfig;
use crate::error::{ClientProxyError, ConfigError};
use crate::promote::{accept, is_registration, promote};
use crate::slot::Slot;
use crate::transport::{handshake, ProxyBody};
use crate::tunnel::{hold, RegisteredTransport};

/// What to do with an inbound request.
#[derive(Debug)]
pub enum Dispatch<B> {
    /// The request presents the secret; take its connection over.
    Register(Request<B>),

    /// Relay the request over the current tunnel.
    Forward(Arc<RegisteredTransport>, Request<B>),

    /// Not ours; hand it to the next handler untouched.
    Next(Request<B>),
}

/// Server half of the tunnel: accepts client connections and forwards
/// requests over the most recent one.
///
/// Cloning is cheap and all clones share the same current tunnel.
#[derive(Debug, Clone)]
pub struct ClientProxy {
    /// State shared by all clones.
    inner: Arc<Inner>,
}

/// See [`ClientProxy`].
#[derive(Debug)]
struct Inner {
    /// The registration secret, marked sensitive.
    secret: HeaderValue,

    /// Authority override for forwarded requests.
    authority: Option<Authority>,

    /// Drain bound for displaced tunnels.
    shutdown_timeout: Duration,

    /// HTTP/2 ping interval on tunnels.
    keep_alive: Option<Duration>,

    /// The current tunnel.
    slot: Slot<RegisteredTransport>,

    /// Last registration number handed out.
    generations: AtomicU64,
}

impl ClientProxy {
    /// Create a proxy from a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns the [`ConfigError`] that [`ClientProxyConfig::validate`]
    /// reports.
    #[inline]
    pub fn new(config: &ClientProxyConfig) -> Result<Self, ConfigError> {
        let authority = config.parsed_authority()?;
        let mut secret =
            HeaderValue::from_str(&config.secret).map_err(|_| ConfigError::InvalidSecret)?;
        secret.set_sensitive(true);
        Ok(Self {
            inner: Arc::new(Inner {
                secret,
                authority,
                shutdown_timeout: config.shutdown_timeout(),
                keep_alive: config.keep_alive_interval(),
                slot: Slot::new(),
                generations: AtomicU64::new(0),
            }),
        })
    }

    /// Decide what happens to `req`. This is the only place a request
    /// is claimed or passed on.
    #[inline]
    pub fn dispatch<B>(&self, req: Request<B>) -> Dispatch<B> {
        if is_registration(&req, &self.inner.secret) {
            return Dispatch::Register(req);
        }
        match self.inner.slot.load() {
            Some(transport) => Dispatch::Forward(transport, req),
            None => {
                debug!("no client registered, passing request on");
                Dispatch::Next(req)
            }
        }
    }

    /// The current tunnel, if a client is registered.
    #[inline]
    pub fn current(&self) -> Option<Arc<RegisteredTransport>> {
        self.inner.slot.load()
    }

    /// Registration number of the current tunnel.
    #[inline]
    pub fn active_generation(&self) -> Option<u64> {
        self.current().map(|transport| transport.generation())
    }

    /// Validate a registration request and build its `101` answer.
    /// See [`crate::promote::accept`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientProxyError::ProtocolViolation`] when the
    /// connection cannot be taken over.
    #[inline]
    pub fn accept<B>(
        &self,
        req: &mut Request<B>,
    ) -> Result<(Response<ProxyBody>, OnUpgrade), ClientProxyError> {
        accept(req)
    }

    /// Take over the connection behind `on_upgrade` and make it the
    /// current tunnel.
    ///
    /// `T` is the connection type the HTTP server was given; when it
    /// matches, bytes the server read ahead are replayed to the tunnel.
    /// This future only completes once the tunnel has been displaced
    /// by a later registration and closed, or has failed.
    ///
    /// # Errors
    ///
    /// Setup failures leave the current tunnel untouched. Failures
    /// while closing are reported after the tunnel has been replaced.
    #[inline]
    pub async fn register<T>(&self, on_upgrade: OnUpgrade) -> Result<(), ClientProxyError>
    where
        T: Read + Write + Unpin + Send + 'static,
    {
        let conn = promote::<T>(on_upgrade).await?;
        self.adopt(conn).await
    }

    /// Make `io` the current tunnel, however it was obtained. The
    /// remote end must speak HTTP/2 as a server. Completes like
    /// [`ClientProxy::register`].
    ///
    /// # Errors
    ///
    /// See [`ClientProxy::register`].
    #[inline]
    pub async fn adopt<I>(&self, io: I) -> Result<(), ClientProxyError>
    where
        I: Read + Write + Unpin + Send + 'static,
    {
        let session = handshake(io, self.inner.keep_alive).await?;
        let generation = self
            .inner
            .generations
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1);
        hold(
            session,
            generation,
            self.inner.authority.clone(),
            &self.inner.slot,
            self.inner.shutdown_timeout,
        )
        .await
    }

    /// Retire the current tunnel without replacing it, for example when
    /// the server stops. Returns whether there was one.
    #[inline]
    pub fn shutdown(&self) -> bool {
        self.inner.slot.retire_current().is_some()
    }
}
