//! Destination keys, identifying a server endpoint.
//!
//! A [`Destination`] is derived once from a request URI and is used both as
//! the connection pool key and as the admission control accounting key.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// The scheme of a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    /// Plain HTTP.
    Http,
    /// HTTP over TLS.
    Https,
    /// Plain WebSocket.
    Ws,
    /// WebSocket over TLS.
    Wss,
}

impl Scheme {
    /// The default port for this scheme.
    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http | Scheme::Ws => 80,
            Scheme::Https | Scheme::Wss => 443,
        }
    }

    /// The scheme as it appears in a URI.
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
        }
    }

    /// Returns `true` for schemes which run over TLS.
    pub fn is_secure(&self) -> bool {
        matches!(self, Scheme::Https | Scheme::Wss)
    }

    /// Returns `true` for WebSocket schemes.
    pub fn is_websocket(&self) -> bool {
        matches!(self, Scheme::Ws | Scheme::Wss)
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            "ws" => Ok(Scheme::Ws),
            "wss" => Ok(Scheme::Wss),
            other => Err(Error::InvalidUri(format!("unsupported scheme: {other}"))),
        }
    }
}

/// A server endpoint: scheme, host and port.
///
/// Two destinations are equal when scheme, host and port are equal. Hosts are
/// compared case-insensitively (they are stored lower case).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Destination {
    /// Create a destination from its parts.
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into().to_ascii_lowercase(),
            port,
        }
    }

    /// Derive the destination of a URI.
    ///
    /// The URI must be absolute, with a supported scheme and a host. A missing
    /// port is filled in from the scheme default.
    pub fn from_uri(uri: &http::Uri) -> Result<Self, Error> {
        let scheme: Scheme = uri
            .scheme_str()
            .ok_or_else(|| Error::InvalidUri(format!("missing scheme in uri: {uri}")))?
            .parse()?;

        let host = uri
            .host()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::InvalidUri(format!("missing host in uri: {uri}")))?;

        let port = uri.port_u16().unwrap_or_else(|| scheme.default_port());
        Ok(Self::new(scheme, host, port))
    }

    /// The scheme of this destination.
    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// The host name or address literal.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port, defaulted from the scheme when the URI did not carry one.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns `true` if the destination requires TLS.
    pub fn is_secure(&self) -> bool {
        self.scheme.is_secure()
    }

    /// Returns `true` if the destination is a WebSocket endpoint.
    pub fn is_websocket(&self) -> bool {
        self.scheme.is_websocket()
    }

    /// The value for a `Host` header, omitting the default port.
    pub fn host_header(&self) -> String {
        if self.port == self.scheme.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl TryFrom<&http::Uri> for Destination {
    type Error = Error;

    fn try_from(uri: &http::Uri) -> Result<Self, Self::Error> {
        Destination::from_uri(uri)
    }
}

impl FromStr for Destination {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let uri = http::Uri::from_str(s).map_err(|error| Error::InvalidUri(error.to_string()))?;
        Destination::from_uri(&uri)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_from_uri() {
        let uri = http::Uri::from_static("http://Example.com/path?q=1");
        let destination = Destination::from_uri(&uri).unwrap();
        assert_eq!(destination.scheme(), Scheme::Http);
        assert_eq!(destination.host(), "example.com");
        assert_eq!(destination.port(), 80);
        assert!(!destination.is_secure());
        assert!(!destination.is_websocket());
    }

    #[test]
    fn destination_default_ports() {
        let https: Destination = "https://example.com/".parse().unwrap();
        assert_eq!(https.port(), 443);
        assert!(https.is_secure());

        let wss: Destination = "wss://example.com:8443/chat".parse().unwrap();
        assert_eq!(wss.port(), 8443);
        assert!(wss.is_secure());
        assert!(wss.is_websocket());
    }

    #[test]
    fn destination_identity() {
        let a: Destination = "http://localhost:8080/a".parse().unwrap();
        let b: Destination = "http://LOCALHOST:8080/b?x".parse().unwrap();
        let c: Destination = "https://localhost:8080/a".parse().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn destination_display() {
        let destination = Destination::new(Scheme::Ws, "localhost", 9000);
        assert_eq!(destination.to_string(), "ws://localhost:9000");
        assert_eq!(destination.host_header(), "localhost:9000");

        let destination = Destination::new(Scheme::Https, "example.com", 443);
        assert_eq!(destination.host_header(), "example.com");
    }

    #[test]
    fn destination_rejects_relative() {
        assert!(matches!(
            "/just/a/path".parse::<Destination>(),
            Err(Error::InvalidUri(_))
        ));
        assert!(matches!(
            "ftp://example.com/".parse::<Destination>(),
            Err(Error::InvalidUri(_))
        ));
    }
}
