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

use std::time::Duration;

use http::uri::Authority;
use http::HeaderValue;
use serde::Deserialize;

use crate::error::ConfigError;

/// How long a displaced tunnel may take to drain before it is closed.
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 60;

/// Settings for a [`crate::ClientProxy`].
///
/// Loading is left to the embedding server; this type only needs to
/// deserialize and validate.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientProxyConfig {
    /// The secret a client must present to register its connection.
    pub secret: String,

    /// Upper bound for draining a displaced tunnel, in seconds.
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Authority to put on forwarded requests instead of the inbound
    /// `Host`.
    #[serde(default)]
    pub authority: Option<String>,

    /// Interval of HTTP/2 keep-alive pings sent over the tunnel.
    #[serde(default)]
    pub keep_alive_interval_secs: Option<u64>,
}

/// Serde default for [`ClientProxyConfig::shutdown_timeout_secs`].
const fn default_shutdown_timeout_secs() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_SECS
}

/// `duration` in whole seconds, rounded up.
const fn whole_secs_up(duration: Duration) -> u64 {
    if duration.subsec_nanos() > 0 {
        duration.as_secs().saturating_add(1)
    } else {
        duration.as_secs()
    }
}

impl ClientProxyConfig {
    /// Create a configuration with the given secret and defaults for
    /// everything else.
    #[inline]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            authority: None,
            keep_alive_interval_secs: None,
        }
    }

    /// Set the drain bound for displaced tunnels. Fractions of a second
    /// round up.
    #[inline]
    #[must_use]
    pub const fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_secs = whole_secs_up(timeout);
        self
    }

    /// Send HTTP/2 pings over tunnels every `interval`. Fractions of a
    /// second round up.
    #[inline]
    #[must_use]
    pub const fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval_secs = Some(whole_secs_up(interval));
        self
    }

    /// Override the authority of forwarded requests.
    #[inline]
    #[must_use]
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    /// The drain bound for displaced tunnels.
    #[inline]
    pub const fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// The keep-alive ping interval, if enabled.
    #[inline]
    pub fn keep_alive_interval(&self) -> Option<Duration> {
        self.keep_alive_interval_secs.map(Duration::from_secs)
    }

    /// Check that the configuration can be used.
    ///
    /// # Errors
    ///
    /// Returns the first problem found: a missing or unusable secret,
    /// an unparsable authority or a zero shutdown timeout.
    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.parsed_authority().map(|_| ())
    }

    /// Validate and return the parsed authority override.
    pub(crate) fn parsed_authority(&self) -> Result<Option<Authority>, ConfigError> {
        if self.secret.is_empty() {
            return Err(ConfigError::MissingSecret);
        }
        if HeaderValue::from_str(&self.secret).is_err() {
            return Err(ConfigError::InvalidSecret);
        }
        if self.shutdown_timeout_secs == 0 {
            return Err(ConfigError::ZeroShutdownTimeout);
        }
        self.authority
            .as_deref()
            .map(|authority| {
                authority
                    .parse::<Authority>()
                    .map_err(|source| ConfigError::InvalidAuthority {
                        authority: authority.to_owned(),
                        source,
                    })
            })
            .transpose()
    }
}
