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

//! The client half: dial the server, register, then serve HTTP/2 on
//! the same connection.

use bytes::Bytes;
use http::header::{CONNECTION, UPGRADE};
use http::{request::Builder as RequestBuilder, StatusCode};
use http_body_util::Empty;
use hyper::body::{Body, Incoming};
use hyper::client::conn::http1::handshake as http1_handshake;
use hyper::rt::bounds::Http2ServerConnExec;
use hyper::rt::{Read, Write};
use hyper::server::conn::http2::Connection as Http2ServerConnection;
use hyper::service::HttpService;
use hyper::upgrade::{on as on_http_upgrade, Upgraded};
use tracing::debug;

use crate::{BoxError, REGISTRATION_HEADER, UPGRADE_HEADER_VALUE};

/// Register over `io`, then call `handler` with the donated connection
/// and run the HTTP/2 server it returns until the connection ends.
///
/// Returns when the server side retires this tunnel (after another
/// client registered) or the connection fails.
///
/// # Errors
///
/// This function will return an error if the registration is refused
/// or the connection is lost during or after the handover.
#[inline]
pub async fn serve_tunnel<Io, Handler, I, S, B, E>(
    io: Io,
    builder: RequestBuilder,
    secret: &str,
    handler: Handler,
) -> Result<(), BoxError>
where
    Io: Write + Read + Send + Unpin + 'static,
    Handler: FnOnce(Upgraded) -> Http2ServerConnection<I, S, E> + Send,
    S: HttpService<Incoming, ResBody = B> + Send,
    S::Error: Into<BoxError> + Send,
    I: Read + Write + Unpin + Send,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError> + Send,
    E: Http2ServerConnExec<S::Future, B> + Send,
{
    let upgraded = connect(io, builder, secret).await?;
    handler(upgraded).await.map_err(Into::into)
}

/// Send the registration request built from `builder` over `io` and
/// return the connection once the server has taken it over.
///
/// The server speaks HTTP/2 as a client on the returned connection, so
/// the caller is expected to serve HTTP/2 on it.
///
/// # Errors
///
/// This function will return an error if the request cannot be built
/// or sent, the server does not answer `101 Switching Protocols`, or
/// the connection is lost during the handover.
#[inline]
pub async fn connect<Io>(io: Io, builder: RequestBuilder, secret: &str) -> Result<Upgraded, BoxError>
where
    Io: Write + Read + Send + Unpin + 'static,
{
    let request = builder
        .header(REGISTRATION_HEADER, secret)
        .header(UPGRADE, UPGRADE_HEADER_VALUE)
        .header(CONNECTION, "upgrade")
        .body(Empty::<Bytes>::new())?;

    let (mut sender, conn) = http1_handshake(io).await?;
    // Driven separately: the connection only finishes once it has been
    // handed to the upgrade below.
    tokio::spawn(async move {
        if let Err(err) = conn.with_upgrades().await {
            debug!(error = %err, "registration connection failed");
        }
    });

    let response = sender.send_request(request).await?;
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(format!(
            "Failed to register. Expected {}, got {}",
            StatusCode::SWITCHING_PROTOCOLS,
            response.status()
        )
        .into());
    }
    Ok(on_http_upgrade(response).await?)
}
