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

//! Shared helpers for the integration tests.

#![allow(dead_code)]

use core::future::{ready, Ready};
use core::task::{Context, Poll};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use client_proxy::{client, BoxError, ClientProxy, ClientProxyLayer};
use http::header::HOST;
use http::{HeaderValue, Request, Response};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::{http1, http2};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::service::TowerToHyperService;
use tokio::io::DuplexStream;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tower::Layer;
use tower_service::Service;

pub const SECRET: &str = "s3cret";

/// Header the tunnel app sets to say which client answered.
pub const TAG_HEADER: &str = "x-tunnel-client";

/// Header the tunnel app sets to the URI it received.
pub const SEEN_URI_HEADER: &str = "x-seen-uri";

/// Body answered by the next handler.
pub const FALLBACK_BODY: &str = "fallback";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "client_proxy=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// The handler behind the proxy.
#[derive(Clone)]
pub struct Fallback;

impl Service<Request<Incoming>> for Fallback {
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<Incoming>) -> Self::Future {
        ready(Ok(Response::new(Full::new(Bytes::from_static(
            FALLBACK_BODY.as_bytes(),
        )))))
    }
}

/// Serve `proxy` in front of [`Fallback`] on a fresh port.
pub async fn start_server(proxy: ClientProxy) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let layer = ClientProxyLayer::new(proxy);
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            let service = TowerToHyperService::new(layer.layer(Fallback));
            tokio::spawn(async move {
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await;
            });
        }
    });
    addr
}

/// What a registered client serves: echoes the request body and says
/// who it is. `/hang` never answers.
pub async fn tunnel_app(
    req: Request<Incoming>,
    tag: &'static str,
) -> Result<Response<Incoming>, Infallible> {
    if req.uri().path() == "/hang" {
        core::future::pending::<()>().await;
    }
    let seen = HeaderValue::from_str(&req.uri().to_string()).unwrap();
    let mut response = Response::new(req.into_body());
    response
        .headers_mut()
        .insert(TAG_HEADER, HeaderValue::from_static(tag));
    response.headers_mut().insert(SEEN_URI_HEADER, seen);
    Ok(response)
}

/// Dial `addr`, register with `secret` and serve [`tunnel_app`].
pub fn start_tunnel_client(
    addr: SocketAddr,
    secret: &'static str,
    tag: &'static str,
) -> JoinHandle<Result<(), BoxError>> {
    tokio::spawn(async move {
        let stream = TcpStream::connect(addr).await?;
        let builder = Request::builder()
            .uri("/register")
            .header(HOST, addr.to_string());
        client::serve_tunnel(TokioIo::new(stream), builder, secret, |upgraded| {
            http2::Builder::new(TokioExecutor::new()).serve_connection(
                upgraded,
                service_fn(move |req| tunnel_app(req, tag)),
            )
        })
        .await
    })
}

/// Serve [`tunnel_app`] as HTTP/2 on one end of an in-memory pipe.
pub fn serve_app_on(io: DuplexStream, tag: &'static str) -> JoinHandle<Result<(), hyper::Error>> {
    tokio::spawn(
        http2::Builder::new(TokioExecutor::new())
            .serve_connection(TokioIo::new(io), service_fn(move |req| tunnel_app(req, tag))),
    )
}

/// Send `req` to `addr` over a new HTTP/1.1 connection and collect the
/// response.
pub async fn send(addr: SocketAddr, req: Request<Full<Bytes>>) -> (http::response::Parts, Bytes) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);
    let response = sender.send_request(req).await.unwrap();
    let (parts, body) = response.into_parts();
    let body = body.collect().await.unwrap().to_bytes();
    (parts, body)
}

/// Build a request to the server at `addr`.
pub fn request(addr: SocketAddr, path: &str, body: impl Into<Bytes>) -> Request<Full<Bytes>> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(HOST, addr.to_string())
        .body(Full::new(body.into()))
        .unwrap()
}

/// Poll `check` until it holds, failing the test after ten seconds.
pub async fn wait_for(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
