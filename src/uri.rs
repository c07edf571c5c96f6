use crate::error::Error;
use std::fmt;
use url::Url;

pub const DEFAULT_PORT: u16 = 80;
pub const DEFAULT_SECURE_PORT: u16 = 443;

pub fn default_port(secure: bool) -> u16 {
    if secure {
        DEFAULT_SECURE_PORT
    } else {
        DEFAULT_PORT
    }
}

/// A parsed `ws://` or `wss://` URI.
///
/// IPv6 literal hosts are stored without the surrounding brackets; they are
/// re-added whenever the URI or a `Host` header value is formatted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsUri {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    pub resource: String,
}

impl WsUri {
    pub fn parse(input: &str) -> Result<Self, Error> {
        let parsed = Url::parse(input)?;

        let secure = match parsed.scheme() {
            "ws" => false,
            "wss" => true,
            _ => return Err(Error::InvalidSchemeURL),
        };

        if parsed.fragment().is_some() {
            return Err(Error::URLHasFragment);
        }

        let raw_host = parsed.host_str().ok_or(Error::URLNoHost)?;
        // The url crate keeps IPv6 literals bracketed; strip for storage.
        let host = raw_host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        if host.is_empty() {
            return Err(Error::URLNoHost);
        }

        let port = match parsed.port() {
            Some(0) => return Err(Error::URLInvalidPort),
            Some(p) => p,
            None => default_port(secure),
        };

        let resource = match parsed.query() {
            Some(query) => format!("{}?{}", parsed.path(), query),
            None => parsed.path().to_string(),
        };
        let resource = if resource.is_empty() {
            "/".to_string()
        } else {
            resource
        };

        Ok(WsUri {
            secure,
            host,
            port,
            resource,
        })
    }

    /// Build a `WsUri` from handshake parts: the `Host` request header and
    /// the request-uri, as seen by a server.
    pub fn from_host_header(secure: bool, host_header: &str, resource: &str) -> Result<Self, Error> {
        let (host, port) = split_host_port(host_header)?;
        Ok(WsUri {
            secure,
            host,
            port: port.unwrap_or_else(|| default_port(secure)),
            resource: resource.to_string(),
        })
    }

    fn host_is_ipv6(&self) -> bool {
        self.host.contains(':')
    }

    /// Value suitable for a `Host` request header.
    pub fn host_header(&self) -> String {
        let host = if self.host_is_ipv6() {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        if self.port == default_port(self.secure) {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    /// `host:port` pair for establishing the TCP connection.
    pub fn authority(&self) -> String {
        if self.host_is_ipv6() {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for WsUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "wss" } else { "ws" };
        write!(f, "{}://{}{}", scheme, self.host_header(), self.resource)
    }
}

// Splits a `Host` header value into host and optional port, preserving IPv6
// literals in brackets (stripped for storage).
fn split_host_port(value: &str) -> Result<(String, Option<u16>), Error> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::URLNoHost);
    }

    if let Some(rest) = value.strip_prefix('[') {
        let end = rest.find(']').ok_or(Error::URLNoHost)?;
        let host = rest[..end].to_string();
        let tail = &rest[end + 1..];
        if tail.is_empty() {
            return Ok((host, None));
        }
        let port_str = tail.strip_prefix(':').ok_or(Error::URLInvalidPort)?;
        return Ok((host, Some(parse_port(port_str)?)));
    }

    match value.rsplit_once(':') {
        Some((host, port_str)) => {
            if host.is_empty() {
                return Err(Error::URLNoHost);
            }
            Ok((host.to_string(), Some(parse_port(port_str)?)))
        }
        None => Ok((value.to_string(), None)),
    }
}

fn parse_port(s: &str) -> Result<u16, Error> {
    let port: u16 = s.parse().map_err(|_| Error::URLInvalidPort)?;
    if port == 0 {
        return Err(Error::URLInvalidPort);
    }
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_plain() {
        let uri = WsUri::parse("ws://example.com/chat").unwrap();
        assert!(!uri.secure);
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, 80);
        assert_eq!(uri.resource, "/chat");
    }

    #[test]
    fn parse_secure_with_port_and_query() {
        let uri = WsUri::parse("wss://example.com:9000/chat?room=1").unwrap();
        assert!(uri.secure);
        assert_eq!(uri.port, 9000);
        assert_eq!(uri.resource, "/chat?room=1");
    }

    #[test]
    fn parse_defaults() {
        assert_eq!(WsUri::parse("ws://example.com").unwrap().resource, "/");
        assert_eq!(WsUri::parse("wss://example.com").unwrap().port, 443);
    }

    #[test]
    fn parse_ipv6_literal() {
        let uri = WsUri::parse("ws://[::1]:9002/").unwrap();
        assert_eq!(uri.host, "::1");
        assert_eq!(uri.port, 9002);
        assert_eq!(uri.host_header(), "[::1]:9002");
        assert_eq!(uri.authority(), "[::1]:9002");
    }

    #[test]
    fn rejects_bad_inputs() {
        assert!(WsUri::parse("http://example.com/").is_err());
        assert!(WsUri::parse("ws://example.com/#frag").is_err());
        assert!(WsUri::parse("ws://example.com:0/").is_err());
        assert!(WsUri::parse("ws:///nohost").is_err());
    }

    #[test]
    fn round_trip_is_identity() {
        for input in [
            "ws://example.com/",
            "wss://example.com:9000/chat",
            "ws://[::1]:9002/echo?x=1",
            "wss://example.com/",
        ] {
            let first = WsUri::parse(input).unwrap();
            let second = WsUri::parse(&first.to_string()).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn host_header_parsing() {
        let uri = WsUri::from_host_header(false, "example.com:9000", "/chat").unwrap();
        assert_eq!(uri.host, "example.com");
        assert_eq!(uri.port, 9000);

        let uri = WsUri::from_host_header(true, "example.com", "/").unwrap();
        assert_eq!(uri.port, 443);

        let uri = WsUri::from_host_header(false, "[2001:db8::1]:8080", "/").unwrap();
        assert_eq!(uri.host, "2001:db8::1");
        assert_eq!(uri.port, 8080);
    }
}
