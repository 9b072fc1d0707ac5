//! Outbound application dialer
//!
//! Some applications listen on a known address instead of connecting in.
//! The first request routed to such an address dials it; the resulting entry
//! is cached in the registry under the target uri and reused until it
//! closes, after which the next request dials again.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::connection::{HandshakeSettings, LinkChannels, establish};
use crate::entry::{Direction, EntryHandle, TransportKind};
use crate::error::DialError;
use crate::link::BoxedStream;
use crate::registry::Registry;

/// Parsed outbound dial target
///
/// Accepts `host:port`, `sip:[user@]host:port[;transport=tcp|tls]` and
/// `sips:` uris; IPv6 hosts are written in brackets. The port is required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundTarget {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
}

impl OutboundTarget {
    pub fn parse(uri: &str) -> Result<Self, DialError> {
        let invalid = || DialError::InvalidTarget(uri.to_string());
        let trimmed = uri.trim();

        let (mut transport, rest) = if let Some(rest) = strip_prefix_ignore_case(trimmed, "sips:") {
            (TransportKind::Tls, rest)
        } else if let Some(rest) = strip_prefix_ignore_case(trimmed, "sip:") {
            (TransportKind::Plain, rest)
        } else {
            (TransportKind::Plain, trimmed)
        };

        let mut parts = rest.split(';');
        let addr = parts.next().unwrap_or_default();
        for param in parts {
            match param.split_once('=') {
                Some((name, value)) if name.eq_ignore_ascii_case("transport") => {
                    transport = match value.to_ascii_lowercase().as_str() {
                        "tls" => TransportKind::Tls,
                        "tcp" => TransportKind::Plain,
                        _ => return Err(invalid()),
                    };
                }
                _ => {}
            }
        }

        let hostport = addr.rsplit_once('@').map(|(_, hostport)| hostport).unwrap_or(addr);
        let (host, port) = if let Some(bracketed) = hostport.strip_prefix('[') {
            let (host, tail) = bracketed.split_once(']').ok_or_else(invalid)?;
            (host, tail.strip_prefix(':').ok_or_else(invalid)?)
        } else {
            hostport.rsplit_once(':').ok_or_else(invalid)?
        };
        if host.is_empty() {
            return Err(invalid());
        }
        let port = port.parse::<u16>().ok().filter(|port| *port != 0).ok_or_else(invalid)?;

        Ok(Self {
            host: host.to_string(),
            port,
            transport,
        })
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

impl fmt::Display for OutboundTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Dials applications on demand and registers the resulting entries
pub struct Dialer {
    registry: Arc<Registry>,
    settings: HandshakeSettings,
    channels: LinkChannels,
    dial_timeout: Duration,
    // one gate per target so concurrent requests share a single dial
    in_flight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    #[cfg(feature = "tls")]
    tls: Option<tokio_rustls::TlsConnector>,
}

impl Dialer {
    pub fn new(
        registry: Arc<Registry>,
        settings: HandshakeSettings,
        channels: LinkChannels,
        dial_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            settings,
            channels,
            dial_timeout,
            in_flight: DashMap::new(),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    #[cfg(feature = "tls")]
    pub fn with_tls_connector(mut self, connector: tokio_rustls::TlsConnector) -> Self {
        self.tls = Some(connector);
        self
    }

    /// Return the cached entry for `uri`, dialing it first if needed
    pub async fn dial_outbound(&self, uri: &str) -> Result<EntryHandle, DialError> {
        if let Some(entry) = self.registry.find_by_outbound_target(uri) {
            return Ok(entry);
        }

        let gate = self.in_flight.entry(uri.to_string()).or_default().clone();
        let result = {
            let _dialing = gate.lock().await;
            match self.registry.find_by_outbound_target(uri) {
                Some(entry) => Ok(entry),
                None => self.dial(uri).await,
            }
        };
        // the map holds one reference and this call another
        self.in_flight.remove_if(uri, |_, gate| Arc::strong_count(gate) <= 2);
        result
    }

    async fn dial(&self, uri: &str) -> Result<EntryHandle, DialError> {
        let target = OutboundTarget::parse(uri)?;
        if target.transport == TransportKind::Tls && !self.tls_available() {
            warn!(uri, "No TLS connector configured for outbound applications");
            return Err(DialError::TransportUnavailable(target.to_string()));
        }
        info!(uri, transport = %target.transport, "Dialing application at {}", target);

        let connect = TcpStream::connect((target.host.as_str(), target.port));
        let tcp = match tokio::time::timeout(self.dial_timeout, connect).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                warn!(uri, "Application refused connection");
                return Err(DialError::ConnectRefused(target.to_string()));
            }
            Ok(Err(e)) => return Err(DialError::Io(e)),
            Err(_) => {
                warn!(uri, "Timed out dialing application after {:?}", self.dial_timeout);
                return Err(DialError::Timeout(target.to_string()));
            }
        };
        let peer = tcp.peer_addr()?;
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(%peer, "Failed to set TCP_NODELAY: {}", e);
        }

        let stream = self.wrap(tcp, &target).await?;
        let pending =
            establish(stream, peer, Direction::Outbound, target.transport, &self.settings).await?;
        let handle = pending
            .with_outbound_target(uri)
            .register(&self.registry, &self.channels)?;
        info!(entry_id = %handle.id(), uri, "Outbound application connected");
        Ok(handle)
    }

    async fn wrap(
        &self,
        tcp: TcpStream,
        target: &OutboundTarget,
    ) -> Result<BoxedStream, DialError> {
        match target.transport {
            TransportKind::Plain => Ok(Box::new(tcp)),
            TransportKind::Tls => self.wrap_tls(tcp, target).await,
        }
    }

    #[cfg(feature = "tls")]
    async fn wrap_tls(
        &self,
        tcp: TcpStream,
        target: &OutboundTarget,
    ) -> Result<BoxedStream, DialError> {
        let Some(connector) = &self.tls else {
            return Err(DialError::TransportUnavailable(target.to_string()));
        };
        let server_name = rustls::ServerName::try_from(target.host.as_str())
            .map_err(|_| DialError::InvalidTarget(target.host.clone()))?;
        use crate::connection::within;

        let handshake = async {
            connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| {
                    DialError::Handshake(format!("TLS connect to {} failed: {}", target, e))
                })
        };
        let stream = within(self.dial_timeout, &target.to_string(), handshake).await?;
        Ok(Box::new(stream))
    }

    #[cfg(feature = "tls")]
    fn tls_available(&self) -> bool {
        self.tls.is_some()
    }

    #[cfg(not(feature = "tls"))]
    fn tls_available(&self) -> bool {
        false
    }

    #[cfg(not(feature = "tls"))]
    async fn wrap_tls(
        &self,
        _tcp: TcpStream,
        target: &OutboundTarget,
    ) -> Result<BoxedStream, DialError> {
        Err(DialError::TransportUnavailable(target.to_string()))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }
}

impl fmt::Debug for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dialer")
            .field("dial_timeout", &self.dial_timeout)
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_targets() {
        let target = OutboundTarget::parse("127.0.0.1:9022").unwrap();
        assert_eq!(target.host, "127.0.0.1");
        assert_eq!(target.port, 9022);
        assert_eq!(target.transport, TransportKind::Plain);

        let target = OutboundTarget::parse("sip:app@10.0.0.7:5070;transport=tls").unwrap();
        assert_eq!(target.host, "10.0.0.7");
        assert_eq!(target.port, 5070);
        assert_eq!(target.transport, TransportKind::Tls);

        let target = OutboundTarget::parse("sips:[::1]:9022").unwrap();
        assert_eq!(target.host, "::1");
        assert_eq!(target.transport, TransportKind::Tls);
        assert_eq!(target.to_string(), "[::1]:9022");
    }

    #[test]
    fn test_parse_invalid_targets() {
        let invalid = [
            "10.0.0.7",
            "sip:10.0.0.7",
            ":9022",
            "10.0.0.7:0",
            "10.0.0.7:port",
            "[::1]9022",
            "sip:h:1;transport=udp",
        ];
        for uri in invalid {
            let result = OutboundTarget::parse(uri);
            assert!(matches!(result, Err(DialError::InvalidTarget(_))), "{}", uri);
        }
    }
}
