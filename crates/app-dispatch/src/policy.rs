//! Routing policy resolution
//!
//! Before a new request is dispatched, an external routing service may be
//! asked how to classify it. The service is selected per SIP method through
//! a [`RequestRouter`] (with a `*` wildcard fallback) and answers with a
//! small JSON instruction:
//!
//! ```text
//! {"action": "route",  "data": {"tag": "blue"}}
//! {"action": "route",  "data": {"uri": "10.0.0.7:9022"}}
//! {"action": "reject", "data": {"status": 603}}
//! ```
//!
//! Methods without a configured route are dispatched to the default pool.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::ResolverError;
use crate::request::InboundRequest;

/// How a request should be dispatched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyOutcome {
    /// Round robin over the untagged pool; no policy applied
    RouteDefault,
    /// Round robin over the entries advertising this tag
    RouteByTag(String),
    /// Direct dispatch to the application listening at this address
    RouteByUri(String),
    /// Final rejection with this status
    Reject(u16),
}

impl fmt::Display for PolicyOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyOutcome::RouteDefault => write!(f, "route(default)"),
            PolicyOutcome::RouteByTag(tag) => write!(f, "route(tag={})", tag),
            PolicyOutcome::RouteByUri(uri) => write!(f, "route(uri={})", uri),
            PolicyOutcome::Reject(status) => write!(f, "reject({})", status),
        }
    }
}

/// Classifies incoming requests
#[async_trait]
pub trait PolicyResolver: Send + Sync {
    async fn resolve(&self, request: &InboundRequest) -> Result<PolicyOutcome, ResolverError>;
}

/// Resolver that answers every request the same way
#[derive(Debug, Clone)]
pub struct FixedPolicy(pub PolicyOutcome);

#[async_trait]
impl PolicyResolver for FixedPolicy {
    async fn resolve(&self, _request: &InboundRequest) -> Result<PolicyOutcome, ResolverError> {
        Ok(self.0.clone())
    }
}

/// HTTP endpoint consulted for one SIP method
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRoute {
    pub http_method: reqwest::Method,
    pub url: Url,
}

/// SIP method → routing service lookup table
#[derive(Debug, Clone, Default)]
pub struct RequestRouter {
    routes: HashMap<String, HttpRoute>,
}

impl RequestRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route; `sip_method` may be `*` to match every method
    pub fn add_route(
        &mut self,
        sip_method: &str,
        http_method: &str,
        url: &str,
    ) -> Result<(), ResolverError> {
        let url =
            Url::parse(url).map_err(|e| ResolverError::InvalidUrl(format!("{}: {}", url, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ResolverError::InvalidUrl(format!("unsupported scheme in {}", url)));
        }
        let http_method = reqwest::Method::from_bytes(http_method.to_ascii_uppercase().as_bytes())
            .map_err(|_| {
                ResolverError::InvalidUrl(format!("invalid http method {}", http_method))
            })?;

        self.routes
            .insert(sip_method.to_ascii_uppercase(), HttpRoute { http_method, url });
        Ok(())
    }

    pub fn route_for(&self, sip_method: &str) -> Option<&HttpRoute> {
        self.routes
            .get(&sip_method.to_ascii_uppercase())
            .or_else(|| self.routes.get("*"))
    }

    /// Human readable listing of every route
    pub fn describe_routes(&self) -> Vec<String> {
        let mut routes: Vec<String> = self
            .routes
            .iter()
            .map(|(sip_method, route)| {
                format!(
                    "sip-method: {}, http-method: {}, http-url: {}",
                    sip_method, route.http_method, route.url
                )
            })
            .collect();
        routes.sort();
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn clear(&mut self) {
        self.routes.clear();
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "lowercase")]
enum RoutingInstruction {
    Route(RouteData),
    Reject(RejectData),
}

#[derive(Debug, Deserialize)]
struct RouteData {
    tag: Option<String>,
    uri: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RejectData {
    status: u16,
    reason: Option<String>,
}

/// Turn a routing service response body into an outcome
pub fn parse_instruction(body: &str) -> Result<PolicyOutcome, ResolverError> {
    let instruction: RoutingInstruction =
        serde_json::from_str(body).map_err(|e| ResolverError::InvalidResponse(e.to_string()))?;

    match instruction {
        // uri wins over tag
        RoutingInstruction::Route(RouteData { uri: Some(uri), .. }) if !uri.is_empty() => {
            Ok(PolicyOutcome::RouteByUri(uri))
        }
        RoutingInstruction::Route(RouteData { tag: Some(tag), .. }) if !tag.is_empty() => {
            Ok(PolicyOutcome::RouteByTag(tag))
        }
        RoutingInstruction::Route(_) => Err(ResolverError::InvalidResponse(
            "route instruction carries neither tag nor uri".into(),
        )),
        RoutingInstruction::Reject(RejectData { status, reason }) => {
            if !(300..=699).contains(&status) {
                let message = format!("invalid reject status {}", status);
                return Err(ResolverError::InvalidResponse(message));
            }
            if let Some(reason) = reason {
                debug!("Routing service rejected request: {} {}", status, reason);
            }
            Ok(PolicyOutcome::Reject(status))
        }
    }
}

/// Query parameters describing a request to the routing service
pub fn routing_query(request: &InboundRequest) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("method", request.method.clone()),
        ("protocol", request.protocol.clone()),
        ("uri", request.request_uri.clone()),
    ];
    let optional = [
        ("domain", request.domain.clone()),
        ("source_address", request.source_address.map(|addr| addr.ip().to_string())),
        ("fromUser", request.from_user.clone()),
        ("toUser", request.to_user.clone()),
        ("uriUser", request.uri_user().map(str::to_string)),
    ];
    params.extend(optional.into_iter().filter_map(|(key, value)| value.map(|value| (key, value))));
    params
}

/// Resolver backed by the HTTP routing service
#[derive(Debug, Clone)]
pub struct HttpPolicyResolver {
    client: reqwest::Client,
    router: RequestRouter,
    timeout: Duration,
}

impl HttpPolicyResolver {
    pub fn new(router: RequestRouter, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            router,
            timeout,
        }
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn router(&self) -> &RequestRouter {
        &self.router
    }
}

#[async_trait]
impl PolicyResolver for HttpPolicyResolver {
    async fn resolve(&self, request: &InboundRequest) -> Result<PolicyOutcome, ResolverError> {
        let Some(route) = self.router.route_for(&request.method) else {
            return Ok(PolicyOutcome::RouteDefault);
        };

        info!(
            transaction_id = %request.transaction_id,
            "Querying routing service: {} {}",
            route.http_method,
            route.url
        );
        let response = self
            .client
            .request(route.http_method.clone(), route.url.clone())
            .query(&routing_query(request))
            .header(ACCEPT, "application/json")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                warn!(
                    transaction_id = %request.transaction_id,
                    "Routing service request failed: {}",
                    e
                );
                ResolverError::Unreachable(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(
                transaction_id = %request.transaction_id,
                "Routing service returned status {}",
                status
            );
            let code = status.as_u16();
            return Ok(PolicyOutcome::Reject(if (400..=699).contains(&code) { code } else { 500 }));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ResolverError::Unreachable(e.to_string()))?;
        debug!(transaction_id = %request.transaction_id, "Routing instruction: {}", body);
        parse_instruction(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_falls_back_to_wildcard() {
        let mut router = RequestRouter::new();
        router.add_route("invite", "get", "http://127.0.0.1:3000/invite").unwrap();
        router.add_route("*", "GET", "http://127.0.0.1:3000/").unwrap();

        assert_eq!(router.route_for("INVITE").unwrap().url.path(), "/invite");
        assert_eq!(router.route_for("OPTIONS").unwrap().url.path(), "/");
        assert_eq!(router.len(), 2);
        assert_eq!(router.describe_routes().len(), 2);

        router.clear();
        assert!(router.route_for("INVITE").is_none());
    }

    #[test]
    fn test_router_rejects_bad_urls() {
        let mut router = RequestRouter::new();
        for url in ["not a url", "ftp://host/"] {
            let result = router.add_route("INVITE", "GET", url);
            assert!(matches!(result, Err(ResolverError::InvalidUrl(_))), "{}", url);
        }
        assert!(router.is_empty());
    }

    #[test]
    fn test_parse_instructions() {
        assert_eq!(
            parse_instruction(r#"{"action":"route","data":{"tag":"blue"}}"#).unwrap(),
            PolicyOutcome::RouteByTag("blue".into())
        );
        assert_eq!(
            parse_instruction(r#"{"action":"route","data":{"uri":"10.0.0.7:9022"}}"#).unwrap(),
            PolicyOutcome::RouteByUri("10.0.0.7:9022".into())
        );
        assert_eq!(
            parse_instruction(r#"{"action":"reject","data":{"status":603,"reason":"Decline"}}"#)
                .unwrap(),
            PolicyOutcome::Reject(603)
        );
        assert!(parse_instruction(r#"{"action":"route","data":{}}"#).is_err());
        assert!(parse_instruction(r#"{"action":"reject","data":{"status":200}}"#).is_err());
        assert!(parse_instruction(r#"{"action":"teleport","data":{}}"#).is_err());
        assert!(parse_instruction("<html>").is_err());
    }

    #[test]
    fn test_routing_query_includes_uri_user() {
        let request = InboundRequest::new("t1", "INVITE", "sip:orange@127.0.0.1:5090")
            .with_from_user("alice")
            .with_source("10.1.1.1:5060".parse().unwrap());
        let query = routing_query(&request);
        assert!(query.contains(&("uriUser", "orange".to_string())));
        assert!(query.contains(&("fromUser", "alice".to_string())));
        assert!(query.contains(&("source_address", "10.1.1.1".to_string())));
        assert!(!query.iter().any(|(key, _)| *key == "toUser"));
    }
}
