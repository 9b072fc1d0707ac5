//! Configuration for the application dispatcher
//!
//! ## Quick Start
//!
//! ```rust
//! use rvoip_app_dispatch::DispatcherConfig;
//! use std::time::Duration;
//!
//! let config = DispatcherConfig::new()
//!     .with_tcp_listen("127.0.0.1:9022".parse().unwrap())
//!     .with_secret("s3cret")
//!     .with_route("INVITE", "GET", "http://127.0.0.1:3000/route")
//!     .with_dial_timeout(Duration::from_secs(2));
//!
//! assert!(config.validate().is_ok());
//! ```
//!
//! The same configuration can be loaded from JSON, durations given in
//! milliseconds:
//!
//! ```json
//! {
//!   "tcp_listen": "0.0.0.0:9022",
//!   "secret": "s3cret",
//!   "dial_timeout": 2000,
//!   "routes": [{ "sip_method": "*", "url": "http://127.0.0.1:3000/route" }]
//! }
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ResolverError;
use crate::policy::RequestRouter;

/// Default port applications connect to
pub const DEFAULT_APP_PORT: u16 = 9022;

/// Default shared secret applications authenticate with
pub const DEFAULT_SECRET: &str = "cymru";

/// Default capacity of the internal event channels
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// SIP method to routing service mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteConfig {
    /// SIP method, or `*` for every method without a route of its own
    pub sip_method: String,
    #[serde(default = "default_http_method")]
    pub http_method: String,
    pub url: String,
}

fn default_http_method() -> String {
    "GET".to_string()
}

/// Dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Plain TCP address applications connect to
    pub tcp_listen: Option<SocketAddr>,

    /// TLS address applications connect to
    pub tls_listen: Option<SocketAddr>,

    /// Shared secret presented by applications during the handshake
    pub secret: String,

    /// Time an application has to authenticate after connecting
    #[serde(with = "duration_ms")]
    pub handshake_timeout: Duration,

    /// Connect timeout for outbound applications
    #[serde(with = "duration_ms")]
    pub dial_timeout: Duration,

    /// Longest a draining application is kept for its remaining calls
    #[serde(with = "duration_ms")]
    pub drain_timeout: Duration,

    /// Timeout of a routing service query
    #[serde(with = "duration_ms")]
    pub resolver_timeout: Duration,

    /// How often dead links and expired drains are swept
    #[serde(with = "duration_ms")]
    pub liveness_interval: Duration,

    /// Routing service lookups per SIP method
    pub routes: Vec<RouteConfig>,

    pub event_channel_capacity: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            tcp_listen: Some(SocketAddr::from(([0, 0, 0, 0], DEFAULT_APP_PORT))),
            tls_listen: None,
            secret: DEFAULT_SECRET.to_string(),
            handshake_timeout: Duration::from_secs(5),
            dial_timeout: Duration::from_secs(3),
            drain_timeout: Duration::from_secs(300),
            resolver_timeout: Duration::from_secs(2),
            liveness_interval: Duration::from_secs(5),
            routes: Vec::new(),
            event_channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl DispatcherConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON document, filling in defaults for missing fields
    pub fn from_json_str(json: &str) -> Result<Self, String> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| format!("Invalid configuration: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_tcp_listen(mut self, addr: SocketAddr) -> Self {
        self.tcp_listen = Some(addr);
        self
    }

    pub fn without_tcp_listen(mut self) -> Self {
        self.tcp_listen = None;
        self
    }

    pub fn with_tls_listen(mut self, addr: SocketAddr) -> Self {
        self.tls_listen = Some(addr);
        self
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn with_resolver_timeout(mut self, timeout: Duration) -> Self {
        self.resolver_timeout = timeout;
        self
    }

    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    pub fn with_route(mut self, sip_method: &str, http_method: &str, url: &str) -> Self {
        self.routes.push(RouteConfig {
            sip_method: sip_method.to_string(),
            http_method: http_method.to_string(),
            url: url.to_string(),
        });
        self
    }

    pub fn with_event_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    /// Build the routing table described by `routes`
    pub fn request_router(&self) -> Result<RequestRouter, ResolverError> {
        let mut router = RequestRouter::new();
        for route in &self.routes {
            router.add_route(&route.sip_method, &route.http_method, &route.url)?;
        }
        Ok(router)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.secret.is_empty() {
            return Err("Secret must not be empty".to_string());
        }
        if self.secret.contains(['|', '\r', '\n']) {
            return Err("Secret must not contain '|' or line breaks".to_string());
        }

        for (name, value) in [
            ("Handshake timeout", self.handshake_timeout),
            ("Dial timeout", self.dial_timeout),
            ("Resolver timeout", self.resolver_timeout),
            ("Liveness interval", self.liveness_interval),
        ] {
            if value.is_zero() {
                return Err(format!("{} must be greater than 0", name));
            }
        }

        if self.event_channel_capacity == 0 {
            return Err("Event channel capacity must be greater than 0".to_string());
        }

        if let (Some(tcp), Some(tls)) = (self.tcp_listen, self.tls_listen) {
            if tcp == tls && tcp.port() != 0 {
                return Err(format!("TCP and TLS listeners both bound to {}", tcp));
            }
        }

        self.request_router().map_err(|e| e.to_string())?;
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
