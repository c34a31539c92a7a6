//! Endpoint descriptors for the three supported transport schemes.

use std::fmt;
use std::str::FromStr;

use crate::error::TransportError;

/// Transport scheme of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Tcp,
    Ipc,
    Inproc,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::Ipc => "ipc",
            Scheme::Inproc => "inproc",
        }
    }
}

impl FromStr for Scheme {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Scheme::Tcp),
            "ipc" => Ok(Scheme::Ipc),
            "inproc" => Ok(Scheme::Inproc),
            other => Err(TransportError::InvalidEndpoint(format!(
                "unknown scheme '{other}'"
            ))),
        }
    }
}

/// A bindable or connectable address.
///
/// For `tcp` the host is an interface or hostname and the port is
/// meaningful; for `ipc` the host holds a filesystem path and for `inproc`
/// a context-local name, with the port unused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme: Scheme::Tcp,
            host: host.into(),
            port,
        }
    }

    pub fn ipc(path: impl Into<String>) -> Self {
        Self {
            scheme: Scheme::Ipc,
            host: path.into(),
            port: 0,
        }
    }

    pub fn inproc(name: impl Into<String>) -> Self {
        Self {
            scheme: Scheme::Inproc,
            host: name.into(),
            port: 0,
        }
    }

    /// Same endpoint with a different TCP port.
    pub(crate) fn with_port(&self, port: u16) -> Self {
        Self {
            scheme: self.scheme,
            host: self.host.clone(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.scheme {
            Scheme::Tcp => write!(f, "tcp://{}:{}", self.host, self.port),
            Scheme::Ipc => write!(f, "ipc://{}", self.host),
            Scheme::Inproc => write!(f, "inproc://{}", self.host),
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme_str, rest) = s
            .split_once("://")
            .ok_or_else(|| TransportError::InvalidEndpoint(format!("missing scheme in '{s}'")))?;
        let scheme: Scheme = scheme_str.parse()?;

        match scheme {
            Scheme::Tcp => {
                let (host, port_str) = rest.rsplit_once(':').ok_or_else(|| {
                    TransportError::InvalidEndpoint(format!("missing port in '{s}'"))
                })?;
                let port: u16 = port_str.parse().map_err(|_| {
                    TransportError::InvalidEndpoint(format!("bad port '{port_str}' in '{s}'"))
                })?;
                if host.is_empty() {
                    return Err(TransportError::InvalidEndpoint(format!(
                        "missing host in '{s}'"
                    )));
                }
                Ok(Endpoint::tcp(host, port))
            }
            Scheme::Ipc => {
                if rest.is_empty() {
                    return Err(TransportError::InvalidEndpoint(format!(
                        "missing path in '{s}'"
                    )));
                }
                Ok(Endpoint::ipc(rest))
            }
            Scheme::Inproc => {
                if rest.is_empty() {
                    return Err(TransportError::InvalidEndpoint(format!(
                        "missing name in '{s}'"
                    )));
                }
                Ok(Endpoint::inproc(rest))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_roundtrip() {
        for text in [
            "tcp://127.0.0.1:50505",
            "ipc:///tmp/remus.sock",
            "inproc://broker-worker",
        ] {
            let endpoint: Endpoint = text.parse().unwrap();
            assert_eq!(endpoint.to_string(), text);
        }
    }

    #[test]
    fn test_tcp_fields() {
        let endpoint: Endpoint = "tcp://0.0.0.0:50510".parse().unwrap();
        assert_eq!(endpoint.scheme, Scheme::Tcp);
        assert_eq!(endpoint.host, "0.0.0.0");
        assert_eq!(endpoint.port, 50510);
    }

    #[test]
    fn test_rejects_malformed() {
        for text in ["127.0.0.1:50505", "tcp://127.0.0.1", "tcp://:50505", "udp://x:1", "ipc://", "tcp://h:notaport"] {
            assert!(
                text.parse::<Endpoint>().is_err(),
                "'{text}' should not parse"
            );
        }
    }

    #[test]
    fn test_with_port() {
        let endpoint = Endpoint::tcp("127.0.0.1", 50505);
        let next = endpoint.with_port(50506);
        assert_eq!(next.to_string(), "tcp://127.0.0.1:50506");
    }
}
