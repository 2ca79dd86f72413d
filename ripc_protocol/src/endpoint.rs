use std::fmt;
use std::str::FromStr;

use qstring::QString;
use serde::{Deserialize, Serialize};

use crate::{Error, ErrorKind};

/// A network address a connection can be established to.
///
/// The textual form is `transport@host:port?timeout=ms&compress=bool&connection_id=id`;
/// the transport defaults to `tcp` and every query option is optional.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    transport: String,
    host: String,
    port: u16,
    timeout_ms: i32,
    compress: bool,
    connection_id: String,
}

impl Endpoint {
    pub fn new(transport: &str, host: &str, port: u16) -> Self {
        Endpoint {
            transport: transport.to_owned(),
            host: host.to_owned(),
            port,
            timeout_ms: -1,
            compress: false,
            connection_id: String::new(),
        }
    }

    pub fn tcp(host: &str, port: u16) -> Self {
        Endpoint::new("tcp", host, port)
    }

    pub fn transport(&self) -> &str {
        &self.transport
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn timeout_ms(&self) -> i32 {
        self.timeout_ms
    }

    pub fn compress(&self) -> bool {
        self.compress
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn datagram(&self) -> bool {
        self.transport == "udp"
    }

    pub fn secure(&self) -> bool {
        matches!(self.transport.as_str(), "ssl" | "wss")
    }

    pub fn with_compress(&self, compress: bool) -> Endpoint {
        Endpoint {
            compress,
            ..self.clone()
        }
    }

    pub fn with_connection_id(&self, connection_id: &str) -> Endpoint {
        Endpoint {
            connection_id: connection_id.to_owned(),
            ..self.clone()
        }
    }

    pub fn with_timeout(&self, timeout_ms: i32) -> Endpoint {
        Endpoint {
            timeout_ms,
            ..self.clone()
        }
    }

    /// The address part of the endpoint, ignoring options.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.transport, self.address())?;
        let mut options: Vec<(&str, String)> = Vec::new();
        if self.timeout_ms >= 0 {
            options.push(("timeout", self.timeout_ms.to_string()));
        }
        if self.compress {
            options.push(("compress", "true".to_owned()));
        }
        if !self.connection_id.is_empty() {
            options.push(("connection_id", self.connection_id.clone()));
        }
        if !options.is_empty() {
            write!(f, "?{}", QString::new(options))?;
        }
        Ok(())
    }
}

fn invalid(s: &str, why: &str) -> Error {
    Error::new(
        ErrorKind::InvalidArgument,
        format!("invalid endpoint `{}': {}", s, why),
    )
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, query) = match s.find('?') {
            Some(pos) => (&s[..pos], &s[pos + 1..]),
            None => (s, ""),
        };
        let mut items: Vec<&str> = addr.split('@').collect();
        if items.len() == 1 {
            items.insert(0, "tcp");
        }
        if items.len() != 2 || items[0].is_empty() {
            return Err(invalid(s, "expected transport@host:port"));
        }
        let pos = items[1]
            .rfind(':')
            .ok_or_else(|| invalid(s, "missing port"))?;
        let host = &items[1][..pos];
        let port = items[1][pos + 1..]
            .parse::<u16>()
            .map_err(|err| invalid(s, &err.to_string()))?;
        if host.is_empty() {
            return Err(invalid(s, "missing host"));
        }

        let mut endpoint = Endpoint::new(items[0], host, port);
        let options = QString::from(query);
        if let Some(timeout) = options.get("timeout") {
            endpoint.timeout_ms = timeout
                .parse()
                .map_err(|_| invalid(s, "timeout must be an integer"))?;
        }
        if let Some(compress) = options.get("compress") {
            endpoint.compress = compress
                .parse()
                .map_err(|_| invalid(s, "compress must be true or false"))?;
        }
        if let Some(connection_id) = options.get("connection_id") {
            endpoint.connection_id = connection_id.to_owned();
        }
        Ok(endpoint)
    }
}
