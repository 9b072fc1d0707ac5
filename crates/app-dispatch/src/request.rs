//! Incoming request descriptor handed over by the transaction layer

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::entry::TransportKind;

/// Methods that can start a request outside of a dialog
pub const ROUTABLE_METHODS: &[&str] = &[
    "INVITE", "REGISTER", "OPTIONS", "MESSAGE", "SUBSCRIBE", "NOTIFY", "PUBLISH", "INFO", "REFER",
    "UPDATE",
];

/// Whether applications may subscribe to new requests of `method`
pub fn is_routable_method(method: &str) -> bool {
    ROUTABLE_METHODS.iter().any(|known| known.eq_ignore_ascii_case(method))
}

/// A new request arriving outside of any dialog
///
/// Carries the addressing fields the routing service is queried with, the
/// transport an application link must offer to take the request, and the raw
/// message forwarded to the selected application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundRequest {
    /// Transaction id assigned by the transaction layer
    pub transaction_id: String,
    pub method: String,
    pub request_uri: String,
    pub from_user: Option<String>,
    pub to_user: Option<String>,
    pub domain: Option<String>,
    /// Network protocol the request arrived on (udp, tcp, tls, ws...)
    pub protocol: String,
    pub source_address: Option<SocketAddr>,
    pub required_transport: Option<TransportKind>,
    pub raw_message: String,
}

impl InboundRequest {
    pub fn new(
        transaction_id: impl Into<String>,
        method: impl Into<String>,
        request_uri: impl Into<String>,
    ) -> Self {
        let request_uri = request_uri.into();
        let domain = uri_host(&request_uri).map(str::to_string);
        Self {
            transaction_id: transaction_id.into(),
            method: method.into().to_ascii_uppercase(),
            request_uri,
            from_user: None,
            to_user: None,
            domain,
            protocol: "udp".to_string(),
            source_address: None,
            required_transport: None,
            raw_message: String::new(),
        }
    }

    pub fn with_from_user(mut self, user: impl Into<String>) -> Self {
        self.from_user = Some(user.into());
        self
    }

    pub fn with_to_user(mut self, user: impl Into<String>) -> Self {
        self.to_user = Some(user.into());
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    pub fn with_source(mut self, addr: SocketAddr) -> Self {
        self.source_address = Some(addr);
        self
    }

    pub fn with_required_transport(mut self, transport: TransportKind) -> Self {
        self.required_transport = Some(transport);
        self
    }

    pub fn with_raw_message(mut self, raw: impl Into<String>) -> Self {
        self.raw_message = raw.into();
        self
    }

    /// User part of the request uri, e.g. `blue` for `sip:blue@10.0.0.1`
    pub fn uri_user(&self) -> Option<&str> {
        uri_user(&self.request_uri)
    }
}

fn strip_scheme(uri: &str) -> &str {
    match uri.split_once(':') {
        Some((scheme, rest))
            if scheme.eq_ignore_ascii_case("sip") || scheme.eq_ignore_ascii_case("sips") =>
        {
            rest
        }
        _ => uri,
    }
}

pub(crate) fn uri_user(uri: &str) -> Option<&str> {
    let rest = strip_scheme(uri);
    let (user, _) = rest.split_once('@')?;
    let user = user.split(':').next().unwrap_or(user);
    (!user.is_empty()).then_some(user)
}

fn uri_host(uri: &str) -> Option<&str> {
    let rest = strip_scheme(uri);
    let hostport = rest.rsplit_once('@').map(|(_, h)| h).unwrap_or(rest);
    let hostport = hostport.split([';', '?']).next().unwrap_or(hostport);
    let host = if let Some(stripped) = hostport.strip_prefix('[') {
        stripped.split(']').next().unwrap_or(stripped)
    } else {
        hostport.split(':').next().unwrap_or(hostport)
    };
    (!host.is_empty()).then_some(host)
}
