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

use core::future::Future;
use core::marker::PhantomData;
use core::pin::Pin;
use core::task::{Context, Poll};

use bytes::Bytes;
use futures::future::poll_fn;
use hyper::body::Body;
use hyper::rt::{Read, Write};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tower::Layer;
use tower_service::Service;
use tracing::{error, warn};

use crate::proxy::{ClientProxy, Dispatch};
use crate::transport::{box_body, full_body, ProxyBody};
use crate::BoxError;

/// Mounts a [`ClientProxy`] in front of another service.
///
/// `Io` is the connection type the hyper server runs on. The HTTP/1.1
/// connection must be served with upgrades enabled, otherwise
/// registrations are refused.
pub struct ClientProxyLayer<Io = TokioIo<TcpStream>> {
    /// The proxy every produced service shares.
    proxy: ClientProxy,

    /// Connection type used when taking over registrations.
    _io: PhantomData<fn() -> Io>,
}

impl ClientProxyLayer {
    /// Create a layer for servers running on [`TokioIo<TcpStream>`].
    #[inline]
    pub const fn new(proxy: ClientProxy) -> Self {
        Self::for_io(proxy)
    }
}

impl<Io> ClientProxyLayer<Io> {
    /// Create a layer for servers running on connections of type `Io`.
    #[inline]
    pub const fn for_io(proxy: ClientProxy) -> Self {
        Self {
            proxy,
            _io: PhantomData,
        }
    }
}

impl<Io> Clone for ClientProxyLayer<Io> {
    #[inline]
    fn clone(&self) -> Self {
        Self::for_io(self.proxy.clone())
    }
}

impl<S, Io> Layer<S> for ClientProxyLayer<Io> {
    type Service = ClientProxyService<S, Io>;

    #[inline]
    fn layer(&self, inner: S) -> Self::Service {
        ClientProxyService {
            inner,
            proxy: self.proxy.clone(),
            _io: PhantomData,
        }
    }
}

/// A service that takes over registering connections, forwards other
/// requests over the current tunnel and hands everything else to
/// `inner`.
pub struct ClientProxyService<S, Io = TokioIo<TcpStream>> {
    /// The next handler.
    inner: S,

    /// Shared tunnel state.
    proxy: ClientProxy,

    /// Connection type used when taking over registrations.
    _io: PhantomData<fn() -> Io>,
}

impl<S: Clone, Io> Clone for ClientProxyService<S, Io> {
    #[inline]
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            proxy: self.proxy.clone(),
            _io: PhantomData,
        }
    }
}

impl<S, Io, B, ResB> Service<Request<B>> for ClientProxyService<S, Io>
where
    S: Service<Request<B>, Response = Response<ResB>> + Clone + Send + 'static,
    S::Error: Into<BoxError>,
    S::Future: Send + 'static,
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
    ResB: Body<Data = Bytes> + Send + Sync + 'static,
    ResB::Error: Into<BoxError>,
    Io: Read + Write + Unpin + Send + 'static,
{
    type Response = Response<ProxyBody>;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    #[inline]
    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // `inner` is only driven to readiness when a request reaches it.
        Poll::Ready(Ok(()))
    }

    #[inline]
    fn call(&mut self, req: Request<B>) -> Self::Future {
        let proxy = self.proxy.clone();
        let mut inner = self.inner.clone();
        Box::pin(async move {
            match proxy.dispatch(req) {
                Dispatch::Register(mut req) => Ok(start_registration::<Io, B>(&proxy, &mut req)),
                Dispatch::Forward(transport, req) => {
                    let generation = transport.generation();
                    match transport.forward(req).await {
                        Ok(response) => Ok(response.map(box_body)),
                        Err(err) => {
                            error!(generation, error = %err, "failed to forward request");
                            Ok(status_response(StatusCode::BAD_GATEWAY, "Proxy error"))
                        }
                    }
                }
                Dispatch::Next(req) => {
                    poll_fn(|cx| inner.poll_ready(cx))
                        .await
                        .map_err(Into::into)?;
                    let response = inner.call(req).await.map_err(Into::into)?;
                    Ok(response.map(box_body))
                }
            }
        })
    }
}

/// Answer a registration and run the tunnel in the background once
/// hyper has released the connection.
fn start_registration<Io, B>(proxy: &ClientProxy, req: &mut Request<B>) -> Response<ProxyBody>
where
    Io: Read + Write + Unpin + Send + 'static,
{
    match proxy.accept(req) {
        Ok((response, on_upgrade)) => {
            let proxy = proxy.clone();
            tokio::spawn(async move {
                if let Err(err) = proxy.register::<Io>(on_upgrade).await {
                    warn!(error = %err, "client registration ended with an error");
                }
            });
            response
        }
        Err(err) => {
            warn!(error = %err, "rejected client registration");
            status_response(StatusCode::BAD_REQUEST, &err.to_string())
        }
    }
}

/// A plain-text response with `status`.
fn status_response(status: StatusCode, message: &str) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(Bytes::copy_from_slice(message.as_bytes())));
    *response.status_mut() = status;
    response
}
