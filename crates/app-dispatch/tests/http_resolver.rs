//! Routing service lookups against a mock HTTP server

mod common;

use std::time::Duration;

use common::{connect_app, invite};
use rvoip_app_dispatch::prelude::*;
use rvoip_app_dispatch::{HttpPolicyResolver, RequestRouter, ResolverError};
use serde_json::json;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn resolver_for(server: &MockServer) -> HttpPolicyResolver {
    let mut router = RequestRouter::new();
    router
        .add_route("INVITE", "GET", &format!("{}/route", server.uri()))
        .unwrap();
    HttpPolicyResolver::new(router, Duration::from_secs(2))
}

async fn mount_json(server: &MockServer, status: u16, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/route"))
        .respond_with(ResponseTemplate::new(status).set_body_json(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_query_carries_addressing_fields() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/route"))
        .and(header("accept", "application/json"))
        .and(query_param("method", "INVITE"))
        .and(query_param("uriUser", "blue"))
        .and(query_param("fromUser", "alice"))
        .and(query_param("domain", "127.0.0.1"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"action": "route", "data": {"tag": "blue"}})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let request =
        InboundRequest::new("t1", "INVITE", "sip:blue@127.0.0.1:5090").with_from_user("alice");
    let outcome = resolver_for(&server).resolve(&request).await.unwrap();
    assert_eq!(outcome, PolicyOutcome::RouteByTag("blue".into()));
}

#[tokio::test]
async fn test_route_and_reject_instructions() {
    let server = MockServer::start().await;
    mount_json(&server, 200, json!({"action": "route", "data": {"uri": "127.0.0.1:9023"}})).await;
    let outcome = resolver_for(&server).resolve(&invite("t1")).await.unwrap();
    assert_eq!(outcome, PolicyOutcome::RouteByUri("127.0.0.1:9023".into()));

    let server = MockServer::start().await;
    let reject = json!({"action": "reject", "data": {"status": 603, "reason": "Spam"}});
    mount_json(&server, 200, reject).await;
    let outcome = resolver_for(&server).resolve(&invite("t2")).await.unwrap();
    assert_eq!(outcome, PolicyOutcome::Reject(603));
}

#[tokio::test]
async fn test_http_error_status_becomes_rejection() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let outcome = resolver_for(&server).resolve(&invite("t1")).await.unwrap();
    assert_eq!(outcome, PolicyOutcome::Reject(404));

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(302))
        .mount(&server)
        .await;
    let outcome = resolver_for(&server).resolve(&invite("t2")).await.unwrap();
    assert_eq!(outcome, PolicyOutcome::Reject(500));
}

#[tokio::test]
async fn test_unrouted_method_uses_default_pool() {
    let server = MockServer::start().await;
    mount_json(&server, 200, json!({"action": "route", "data": {"tag": "blue"}})).await;

    let request = InboundRequest::new("t1", "OPTIONS", "sip:blue@127.0.0.1");
    let outcome = resolver_for(&server).resolve(&request).await.unwrap();
    assert_eq!(outcome, PolicyOutcome::RouteDefault);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_undecodable_body_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;
    let result = resolver_for(&server).resolve(&invite("t1")).await;
    assert!(matches!(result, Err(ResolverError::InvalidResponse(_))));
}

#[tokio::test]
async fn test_slow_service_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"action": "route", "data": {"tag": "blue"}}))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let mut router = RequestRouter::new();
    router.add_route("*", "GET", &format!("{}/route", server.uri())).unwrap();
    let resolver = HttpPolicyResolver::new(router, Duration::from_millis(50));
    let result = resolver.resolve(&invite("t1")).await;
    assert!(matches!(result, Err(ResolverError::Unreachable(_))));
}

#[tokio::test]
async fn test_server_routes_by_service_decision() {
    let server = MockServer::start().await;
    mount_json(&server, 200, json!({"action": "route", "data": {"tag": "blue"}})).await;

    let config = DispatcherConfig::new()
        .without_tcp_listen()
        .with_route("INVITE", "GET", &format!("{}/route", server.uri()));
    let app_server = AppServer::new(config).unwrap();
    let (red, _) = connect_app(app_server.registry(), "red", "red");
    let (blue, blue_link) = connect_app(app_server.registry(), "blue", "blue");

    let action = app_server.handle_request(invite("t1")).await;
    assert_eq!(action, DispatchAction::Deliver { entry: blue });
    assert_ne!(blue, red);
    assert_eq!(blue_link.delivered(), vec!["t1"]);

    assert_eq!(app_server.call_ended("t1"), Some(blue));
}

#[tokio::test]
async fn test_server_answers_500_when_service_is_down() {
    let config = DispatcherConfig::new()
        .without_tcp_listen()
        .with_resolver_timeout(Duration::from_millis(200))
        .with_route("*", "GET", "http://127.0.0.1:1/route");
    let app_server = AppServer::new(config).unwrap();
    connect_app(app_server.registry(), "general", "");

    let action = app_server.handle_request(invite("t1")).await;
    assert_eq!(
        action,
        DispatchAction::Respond { status: 500, reason: "Server Internal Error".into() }
    );
}
