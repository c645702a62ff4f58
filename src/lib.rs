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

//! This library lets a client that cannot be dialed (because it sits
//! behind a NAT or a firewall) dial a hyper server instead and donate
//! that connection. The client sends an HTTP/1.1 upgrade request that
//! carries a shared secret. The server answers `101 Switching Protocols`,
//! takes the underlying connection and starts an HTTP/2 handshake on it
//! in the *client* role. From then on every ordinary request that
//! reaches the server is forwarded over that connection to the client.
//!
//! Only one client connection is active at a time. When a new client
//! registers, it becomes the active upstream immediately and the
//! previous connection is drained and closed within a bounded time.
//!
//! The server half is [`ClientProxy`], usually mounted in front of
//! another service with [`ClientProxyLayer`]. The client half lives in
//! [`client`].

#![deny(
    clippy::all,
    clippy::restriction,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo
)]
#![allow(
    clippy::implicit_return,
    clippy::question_mark_used,
    clippy::blanket_clippy_restriction_lints,
    clippy::std_instead_of_core,
    clippy::std_instead_of_alloc,
    clippy::single_call_fn,
    clippy::pub_use,
    clippy::exhaustive_enums,
    clippy::exhaustive_structs,
    clippy::mod_module_files,
    clippy::arbitrary_source_item_ordering,
    clippy::missing_trait_methods,
    clippy::multiple_crate_versions
)]
#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::indexing_slicing,
        clippy::missing_docs_in_private_items,
        clippy::default_numeric_fallback,
        clippy::let_underscore_must_use
    )
)]

pub mod client;
pub mod config;
pub mod error;
pub mod forward;
pub mod promote;
pub mod proxy;
pub mod service;
pub mod slot;
pub mod transport;
pub mod tunnel;

use http::header::HeaderName;

pub use config::ClientProxyConfig;
pub use error::{ClientProxyError, ConfigError, ForwardError};
pub use proxy::{ClientProxy, Dispatch};
pub use service::{ClientProxyLayer, ClientProxyService};
pub use transport::ProxyBody;
pub use tunnel::{RegisteredTransport, TunnelState};

/// The header a client uses to present the shared secret when it
/// wants to register its connection.
pub const REGISTRATION_HEADER: HeaderName = HeaderName::from_static("x-client-proxy");

/// The value of the `upgrade` header that is used to signal
/// that the connection should be handed over.
pub const UPGRADE_HEADER_VALUE: &str = "client-proxy";

/// Boxed error used at the edges where hyper and tower want one.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
