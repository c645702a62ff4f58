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

//! Relaying requests over a registered tunnel.

use bytes::Bytes;
use http::header::{
    HeaderMap, HeaderName, CONNECTION, HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE,
    TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use http::request::Parts;
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{HeaderValue, Request, Response, Uri, Version};
use hyper::body::{Body, Incoming};
use hyper::client::conn::http2::SendRequest;

use crate::error::ForwardError;
use crate::transport::{box_body, ProxyBody};
use crate::{BoxError, REGISTRATION_HEADER};

/// Headers that only describe one hop and must not cross the tunnel.
const HOP_BY_HOP: [HeaderName; 9] = [
    CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

/// Sends requests over one tunnel, any number at a time.
#[derive(Debug, Clone)]
pub struct Forwarder {
    /// The HTTP/2 handle of the tunnel.
    sender: SendRequest<ProxyBody>,

    /// Replaces the inbound authority when set.
    authority: Option<Authority>,
}

impl Forwarder {
    /// Create a forwarder over `sender`.
    #[inline]
    pub const fn new(sender: SendRequest<ProxyBody>, authority: Option<Authority>) -> Self {
        Self { sender, authority }
    }

    /// Whether the tunnel has gone away.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Relay `req` and return the remote response, whose body streams
    /// from the tunnel as it arrives.
    ///
    /// # Errors
    ///
    /// Returns [`ForwardError::Transport`] when the tunnel fails, and
    /// the other variants when no valid target can be built. Nothing
    /// is retried.
    #[inline]
    pub async fn forward<B>(&self, req: Request<B>) -> Result<Response<Incoming>, ForwardError>
    where
        B: Body<Data = Bytes> + Send + Sync + 'static,
        B::Error: Into<BoxError>,
    {
        let version = req.version();
        let req = rewrite(req, self.authority.as_ref())?;
        let mut sender = self.sender.clone();
        sender.ready().await.map_err(ForwardError::Transport)?;
        let mut response = sender
            .send_request(req)
            .await
            .map_err(ForwardError::Transport)?;
        strip_hop_by_hop(response.headers_mut());
        *response.version_mut() = version;
        Ok(response)
    }
}

/// Point `req` at the tunnel: `https` scheme, authority from
/// `authority` or the inbound request, HTTP/2, no hop-by-hop headers.
///
/// # Errors
///
/// Fails if no authority is known or the result is not a valid URI.
#[inline]
pub fn rewrite<B>(
    req: Request<B>,
    authority: Option<&Authority>,
) -> Result<Request<ProxyBody>, ForwardError>
where
    B: Body<Data = Bytes> + Send + Sync + 'static,
    B::Error: Into<BoxError>,
{
    let (mut parts, body) = req.into_parts();
    let authority = match authority {
        Some(authority) => authority.clone(),
        None => inbound_authority(&parts)?,
    };
    let path_and_query = parts
        .uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    parts.uri = Uri::builder()
        .scheme(Scheme::HTTPS)
        .authority(authority)
        .path_and_query(path_and_query)
        .build()?;
    parts.version = Version::HTTP_2;

    let wants_trailers = accepts_trailers(&parts.headers);
    strip_hop_by_hop(&mut parts.headers);
    if wants_trailers {
        parts
            .headers
            .insert(TE, HeaderValue::from_static("trailers"));
    }
    // Carried as `:authority` from here on.
    parts.headers.remove(HOST);
    parts.headers.remove(REGISTRATION_HEADER);

    Ok(Request::from_parts(parts, box_body(body)))
}

/// The authority the caller addressed.
fn inbound_authority(parts: &Parts) -> Result<Authority, ForwardError> {
    if let Some(host) = parts.headers.get(HOST) {
        return Authority::try_from(host.as_bytes())
            .map_err(|err| ForwardError::InvalidTarget(err.into()));
    }
    parts
        .uri
        .authority()
        .cloned()
        .ok_or(ForwardError::MissingAuthority)
}

/// Whether the `te` header asks for trailers.
fn accepts_trailers(headers: &HeaderMap) -> bool {
    headers
        .get_all(TE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("trailers"))
}

/// Remove hop-by-hop headers, including any named by `connection`.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
}
