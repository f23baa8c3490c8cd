//! Endpoint address strings of the form `[authkey@][host:]port[+]`.
//!
//! The first `@` ends the authentication token and the first `:` after it
//! ends the host. A trailing `+` asks the endpoint to search upwards from
//! `port` for a free one.

use std::fmt;
use std::str::FromStr;

/// Token used when an address carries no `authkey@` prefix.
pub const DEFAULT_AUTHKEY: &str = "sph";

/// Host used when an address carries no `host:` prefix.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// The pool endpoint a run starts unless told otherwise.
pub const DEFAULT_POOL_ADDRESS: &str = "sph@0.0.0.0:8800+";

/// Errors from parsing an endpoint address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    /// The address string was empty.
    #[error("empty endpoint address")]
    Empty,

    /// The port component is not an integer in `0..=65535`.
    #[error("invalid port {port:?} in endpoint address {input:?}")]
    InvalidPort {
        /// The whole address string.
        input: String,
        /// The offending port component.
        port: String,
    },
}

/// A parsed transport endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddress {
    /// Shared authentication token.
    pub authkey: String,
    /// Interface to bind.
    pub host: String,
    /// First port to try.
    pub port: u16,
    /// Try successive ports when `port` is taken.
    pub search: bool,
}

impl EndpointAddress {
    /// Parse an address string.
    ///
    /// ```
    /// use sph_net::EndpointAddress;
    ///
    /// let addr = EndpointAddress::parse("secret@host:9000+").unwrap();
    /// assert_eq!(addr.authkey, "secret");
    /// assert_eq!(addr.host, "host");
    /// assert_eq!(addr.port, 9000);
    /// assert!(addr.search);
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`AddressError::Empty`] for a blank string and
    /// [`AddressError::InvalidPort`] if the port does not parse.
    pub fn parse(input: &str) -> Result<Self, AddressError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(AddressError::Empty);
        }

        let (authkey, rest) = input.split_once('@').unwrap_or((DEFAULT_AUTHKEY, input));
        let (rest, search) = match rest.strip_suffix('+') {
            Some(rest) => (rest, true),
            None => (rest, false),
        };
        let (host, port) = rest.split_once(':').unwrap_or(("", rest));
        let host = if host.is_empty() { DEFAULT_HOST } else { host };

        let port = port.parse::<u16>().map_err(|_| AddressError::InvalidPort {
            input: input.to_string(),
            port: port.to_string(),
        })?;

        Ok(Self {
            authkey: authkey.to_string(),
            host: host.to_string(),
            port,
            search,
        })
    }

    /// `host:port` for the given candidate port.
    #[must_use]
    pub fn bind_target(&self, port: u16) -> String {
        format!("{}:{port}", self.host)
    }
}

impl FromStr for EndpointAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.authkey, self.host, self.port)?;
        if self.search {
            f.write_str("+")?;
        }
        Ok(())
    }
}
