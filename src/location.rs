//! Request location parsing.
//!
//! A location is `scheme://[userinfo@]host[:port][/path[?query]]`. The
//! userinfo part carries optional `cert=<path>;key=<path>` pairs used to pin
//! a client certificate for one request, or to configure the server-side
//! identity when binding.

use crate::error::Error;

/// Default port for all TLS schemes.
const DEFAULT_TLS_PORT: u16 = 443;

/// A parsed request location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    scheme: String,
    userinfo: Option<String>,
    host: String,
    port: u16,
    path: String,
    query: Option<String>,
}

impl Location {
    /// Parse an address of the form `scheme://[userinfo@]host[:port][/path[?query]]`.
    ///
    /// IPv6 literals use the usual bracket form (`https://[::1]:8443/svc`).
    pub fn parse(addr: &str) -> Result<Self, Error> {
        let (scheme, rest) = addr
            .split_once("://")
            .ok_or_else(|| Error::message(format!("can not parse location: {addr}")))?;

        // Userinfo may carry file paths (`cert=/etc/…`), so the authority
        // extends to the first `/` after the last `@` preceding the query.
        let head = rest.split('?').next().unwrap_or(rest);
        let split_at = match head.rfind('@') {
            Some(at) => rest[at..].find('/').map(|idx| at + idx),
            None => rest.find('/'),
        };
        let (authority, path_and_query) = match split_at {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, ""),
        };

        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((user, hostport)) => (Some(user.to_owned()), hostport),
            None => (None, authority),
        };

        let (host, port) = split_host_port(hostport)
            .ok_or_else(|| Error::message(format!("can not parse location: {addr}")))?;

        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (path_and_query.to_owned(), None),
        };

        Ok(Self {
            scheme: scheme.to_owned(),
            userinfo,
            host: host.to_owned(),
            port: port.unwrap_or(DEFAULT_TLS_PORT),
            path,
            query,
        })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Path including the leading `/`; empty when the location has none.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Service name: the path with the leading `/` stripped.
    pub fn service(&self) -> &str {
        self.path.strip_prefix('/').unwrap_or(&self.path)
    }

    /// `cert=…;key=…` pairs from the userinfo, if any.
    pub fn identity(&self) -> ClientIdentity {
        let mut identity = ClientIdentity::default();

        let Some(userinfo) = self.userinfo.as_deref() else {
            return identity;
        };

        for kv in userinfo.split(';') {
            if let Some((name, value)) = kv.split_once('=') {
                match name {
                    "cert" => identity.cert = Some(value.to_owned()),
                    "key" => identity.key = Some(value.to_owned()),
                    _ => {}
                }
            }
        }

        identity
    }
}

/// Certificate/key file pair from a location's userinfo.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientIdentity {
    pub cert: Option<String>,
    pub key: Option<String>,
}

impl ClientIdentity {
    pub fn is_empty(&self) -> bool {
        self.cert.is_none() && self.key.is_none()
    }
}

fn split_host_port(hostport: &str) -> Option<(&str, Option<u16>)> {
    if let Some(rest) = hostport.strip_prefix('[') {
        // IPv6 literal
        let (host, rest) = rest.split_once(']')?;
        match rest.strip_prefix(':') {
            Some(port) => Some((host, Some(port.parse().ok()?))),
            None if rest.is_empty() => Some((host, None)),
            None => None,
        }
    } else {
        match hostport.rsplit_once(':') {
            Some((host, port)) => Some((host, Some(port.parse().ok()?))),
            None => Some((hostport, None)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_full() {
        let loc = Location::parse("https://example.com:8443/ping?x=1").unwrap();
        assert_eq!(loc.scheme(), "https");
        assert_eq!(loc.host(), "example.com");
        assert_eq!(loc.port(), 8443);
        assert_eq!(loc.path(), "/ping");
        assert_eq!(loc.service(), "ping");
        assert_eq!(loc.query(), Some("x=1"));
    }

    #[test]
    fn parse_defaults() {
        let loc = Location::parse("posts://example.com").unwrap();
        assert_eq!(loc.port(), 443);
        assert_eq!(loc.path(), "");
        assert_eq!(loc.service(), "");
        assert_eq!(loc.query(), None);
        assert!(loc.identity().is_empty());
    }

    #[test]
    fn parse_ipv6() {
        let loc = Location::parse("https://[::1]:9443/svc").unwrap();
        assert_eq!(loc.host(), "::1");
        assert_eq!(loc.port(), 9443);
    }

    #[test]
    fn parse_userinfo_identity() {
        let loc =
            Location::parse("https://cert=/etc/pki/c.pem;key=/etc/pki/k.pem@example.com/svc")
                .unwrap();
        let identity = loc.identity();
        assert_eq!(identity.cert.as_deref(), Some("/etc/pki/c.pem"));
        assert_eq!(identity.key.as_deref(), Some("/etc/pki/k.pem"));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Location::parse("example.com/ping").is_err());
        assert!(Location::parse("https://example.com:notaport/x").is_err());
    }
}
