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

//! Error types for registration, forwarding and configuration.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// The configuration cannot be used to start a [`crate::ClientProxy`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No secret was configured.
    #[error("client_proxy: no secret")]
    MissingSecret,

    /// The secret cannot be carried in an HTTP header.
    #[error("client_proxy: secret is not a valid header value")]
    InvalidSecret,

    /// The authority override does not parse.
    #[error("client_proxy: invalid authority {authority:?}: {source}")]
    InvalidAuthority {
        /// The configured value.
        authority: String,
        /// Why it was rejected.
        #[source]
        source: http::uri::InvalidUri,
    },

    /// A zero shutdown timeout would close displaced tunnels without
    /// letting anything drain.
    #[error("client_proxy: shutdown timeout must be greater than zero")]
    ZeroShutdownTimeout,
}

/// Failures of a registration attempt, from the upgrade until the
/// tunnel is closed again.
#[derive(Debug, Error)]
pub enum ClientProxyError {
    /// The proxy could not be built from its configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The registration did not arrive over a connection that can be
    /// taken over for full duplex use.
    #[error("client_proxy: must connect using HTTP/1.1: {0}")]
    ProtocolViolation(&'static str),

    /// hyper failed to hand the connection over.
    #[error("client_proxy: must connect using HTTP/1.1: {0}")]
    Upgrade(#[source] hyper::Error),

    /// Pending writes could not be flushed before the handover.
    #[error("client_proxy: unexpected flush error: {0}")]
    Flush(#[source] io::Error),

    /// The HTTP/2 handshake failed on the donated connection.
    #[error("client_proxy: unable to create client connection: {0}")]
    TransportInit(#[source] hyper::Error),

    /// The displaced connection failed while draining.
    #[error("client_proxy: error shutting down client connection: {0}")]
    Shutdown(#[source] hyper::Error),

    /// The displaced connection did not drain in time and was closed.
    #[error("client_proxy: client connection did not drain within {0:?}")]
    ShutdownTimeout(Duration),

    /// The active connection failed before it was displaced.
    #[error("client_proxy: client connection lost: {0}")]
    ConnectionLost(#[source] hyper::Error),
}

/// Failure to relay one request over the active tunnel.
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Neither the configuration, the `Host` header nor the request
    /// target named an authority.
    #[error("client_proxy: request has no authority to forward to")]
    MissingAuthority,

    /// The rewritten request target is not a valid URI.
    #[error("client_proxy: invalid forward target: {0}")]
    InvalidTarget(#[from] http::Error),

    /// The tunnel failed while relaying the request.
    #[error("client_proxy: tunnel error: {0}")]
    Transport(#[source] hyper::Error),
}

/// Reports whether `err` only says that the connection was already
/// gone, which is the expected end of a tunnel.
pub(crate) fn is_connection_closed(err: &hyper::Error) -> bool {
    if err.is_closed() || err.is_canceled() || err.is_incomplete_message() {
        return true;
    }
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return matches!(
                io_err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::UnexpectedEof
            );
        }
        source = cause.source();
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_display_names_component() {
        let err = ClientProxyError::from(ConfigError::MissingSecret);
        assert_eq!(err.to_string(), "client_proxy: no secret");
    }

    #[test]
    fn shutdown_timeout_display_includes_bound() {
        let err = ClientProxyError::ShutdownTimeout(Duration::from_secs(60));
        assert!(err.to_string().contains("60s"));
    }
}
