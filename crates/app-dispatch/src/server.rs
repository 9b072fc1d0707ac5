//! Application server facade
//!
//! [`AppServer`] wires the pieces together for the transaction layer: it
//! owns the registry, accepts and dials application connections, consults
//! the routing policy for every new request and turns the dispatch result
//! into a [`DispatchAction`].
//!
//! ```text
//!  listeners ──PendingConnection──┐
//!                                 ├──► driver ──► Registry ◄── sweeper
//!  link readers ──LinkEvent───────┘                  ▲
//!                                                    │
//!  transaction layer ──handle_request──► resolver ──► Dispatcher
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::connection::{HandshakeSettings, LinkChannels, PendingConnection};
use crate::dialer::Dialer;
use crate::dispatcher::{DispatchAction, DispatchResult, Dispatcher};
use crate::entry::EntryId;
use crate::error::{DialError, DispatchError, Error, RegistryError, Result};
use crate::link::{AppMessage, LinkEvent};
use crate::listener::AppListener;
use crate::logging::log_startup;
use crate::policy::{HttpPolicyResolver, PolicyOutcome, PolicyResolver};
use crate::registry::{Registry, RegistryStats};
use crate::request::InboundRequest;

/// Addresses the server is accepting application connections on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerAddrs {
    pub tcp: Option<SocketAddr>,
    pub tls: Option<SocketAddr>,
}

struct Receivers {
    established_rx: mpsc::Receiver<PendingConnection>,
    events_rx: mpsc::Receiver<LinkEvent>,
}

/// Application connection server and call dispatcher
pub struct AppServer {
    config: DispatcherConfig,
    server_id: String,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    resolver: Arc<dyn PolicyResolver>,
    dialer: Dialer,
    settings: HandshakeSettings,
    channels: LinkChannels,
    established_tx: mpsc::Sender<PendingConnection>,
    receivers: Mutex<Option<Receivers>>,
    messages_rx: Mutex<Option<mpsc::Receiver<AppMessage>>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    #[cfg(feature = "tls")]
    tls_acceptor: Option<tokio_rustls::TlsAcceptor>,
}

impl AppServer {
    /// Create a server; routes in the configuration select the HTTP resolver
    pub fn new(config: DispatcherConfig) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        let router = config.request_router()?;
        let resolver = Arc::new(HttpPolicyResolver::new(router, config.resolver_timeout));

        let server_id = format!("{}-{}", env!("CARGO_PKG_NAME"), Uuid::new_v4());
        let capacity = config.event_channel_capacity;
        let (established_tx, established_rx) = mpsc::channel(capacity);
        let (events_tx, events_rx) = mpsc::channel(capacity);
        let (messages_tx, messages_rx) = mpsc::channel(capacity);

        let registry = Arc::new(Registry::new());
        let settings =
            HandshakeSettings::new(&config.secret, server_id.clone(), config.handshake_timeout);
        let channels = LinkChannels { messages_tx, events_tx };
        let dialer = Dialer::new(
            registry.clone(),
            settings.clone(),
            channels.clone(),
            config.dial_timeout,
        );

        Ok(Self {
            server_id,
            dispatcher: Arc::new(Dispatcher::new(registry.clone())),
            registry,
            resolver,
            dialer,
            settings,
            channels,
            established_tx,
            receivers: Mutex::new(Some(Receivers { established_rx, events_rx })),
            messages_rx: Mutex::new(Some(messages_rx)),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            #[cfg(feature = "tls")]
            tls_acceptor: None,
            config,
        })
    }

    /// Replace the routing policy resolver
    pub fn with_resolver(mut self, resolver: Arc<dyn PolicyResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Server-side TLS used by the `tls_listen` listener
    #[cfg(feature = "tls")]
    pub fn with_tls_acceptor(mut self, acceptor: tokio_rustls::TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    /// Client-side TLS used to dial `sips:` or `;transport=tls` targets
    #[cfg(feature = "tls")]
    pub fn with_tls_connector(mut self, connector: tokio_rustls::TlsConnector) -> Self {
        self.dialer = self.dialer.with_tls_connector(connector);
        self
    }

    /// Bind the configured listeners and start the background tasks
    pub async fn start(&self) -> Result<ServerAddrs> {
        let receivers = self
            .receivers
            .lock()
            .take()
            .ok_or_else(|| Error::Config("server already started".into()))?;
        log_startup(&self.config);

        let mut addrs = ServerAddrs::default();
        let mut tasks = Vec::new();

        if let Some(addr) = self.config.tcp_listen {
            let listener = AppListener::bind(addr).await?;
            addrs.tcp = Some(listener.local_addr());
            tasks.push(self.spawn_listener(listener));
        }
        if let Some(addr) = self.config.tls_listen {
            let listener = self.bind_tls(addr).await?;
            addrs.tls = Some(listener.local_addr());
            tasks.push(self.spawn_listener(listener));
        }

        tasks.push(tokio::spawn(run_driver(
            receivers,
            self.registry.clone(),
            self.dispatcher.clone(),
            self.channels.clone(),
            self.cancel.clone(),
        )));
        tasks.push(tokio::spawn(run_sweeper(
            self.registry.clone(),
            self.dispatcher.clone(),
            self.config.clone(),
            self.cancel.clone(),
        )));

        self.tasks.lock().extend(tasks);
        info!(server_id = %self.server_id, "Application server started");
        Ok(addrs)
    }

    fn spawn_listener(&self, listener: AppListener) -> JoinHandle<()> {
        listener.spawn(
            self.settings.clone(),
            self.established_tx.clone(),
            self.cancel.clone(),
        )
    }

    #[cfg(feature = "tls")]
    async fn bind_tls(&self, addr: SocketAddr) -> Result<AppListener> {
        let acceptor = self
            .tls_acceptor
            .clone()
            .ok_or_else(|| Error::Config("tls_listen requires a TLS acceptor".into()))?;
        Ok(AppListener::bind_tls(addr, acceptor).await?)
    }

    #[cfg(not(feature = "tls"))]
    async fn bind_tls(&self, _addr: SocketAddr) -> Result<AppListener> {
        Err(Error::Config("built without TLS support".into()))
    }

    /// Decide what happens to a new request
    pub async fn handle_request(&self, request: InboundRequest) -> DispatchAction {
        let outcome = match self.resolver.resolve(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    transaction_id = %request.transaction_id,
                    "Routing policy unavailable: {}",
                    e
                );
                let unreachable = DispatchError::ResolverUnreachable(e.to_string());
                return DispatchResult::Rejected(unreachable).into();
            }
        };
        debug!(transaction_id = %request.transaction_id, "Routing policy outcome: {}", outcome);

        if let PolicyOutcome::RouteByUri(uri) = &outcome {
            match self.dialer.dial_outbound(uri).await {
                Ok(_) => {}
                Err(DialError::TransportUnavailable(target)) => {
                    let unavailable = DispatchError::TransportUnavailable(target);
                    return DispatchResult::Rejected(unavailable).into();
                }
                // the dispatcher answers 480 for a target with no entry
                Err(e) => {
                    warn!(
                        transaction_id = %request.transaction_id,
                        uri = %uri,
                        "Could not reach application: {}",
                        e
                    );
                }
            }
        }

        self.dispatcher.dispatch(&request, outcome).await.into()
    }

    /// The transaction layer reports a dispatched call has ended
    pub fn call_ended(&self, transaction_id: &str) -> Option<EntryId> {
        self.dispatcher.call_ended(transaction_id)
    }

    /// The transaction layer reports an application transport went away
    pub fn peer_disconnected(&self, id: EntryId) -> std::result::Result<(), RegistryError> {
        self.dispatcher.peer_disconnected(id)
    }

    /// Receiver for frames sent by applications after their handshake
    ///
    /// Can only be taken once.
    pub fn take_app_messages(&self) -> Option<mpsc::Receiver<AppMessage>> {
        self.messages_rx.lock().take()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn dialer(&self) -> &Dialer {
        &self.dialer
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Stop accepting connections and close every application link
    pub async fn shutdown(&self) {
        info!("Shutting down application server");
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        for entry in self.registry.clear() {
            entry.link().close().await;
        }
        info!("Application server stopped");
    }
}

/// Apply connection events to the registry
async fn run_driver(
    mut receivers: Receivers,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    channels: LinkChannels,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some(pending) = receivers.established_rx.recv() => {
                let id = pending.id();
                if let Err(e) = pending.register(&registry, &channels) {
                    warn!(entry_id = %id, "Failed to register application: {}", e);
                }
            }
            Some(event) = receivers.events_rx.recv() => match event {
                LinkEvent::Disconnected(id) => match dispatcher.peer_disconnected(id) {
                    Ok(()) => {}
                    Err(RegistryError::NotFound(_)) => {
                        debug!(entry_id = %id, "Disconnected application already removed")
                    }
                    Err(e) => warn!(entry_id = %id, "Failed to drain application: {}", e),
                },
            },
            else => break,
        }
    }
    debug!("Connection driver stopped");
}

/// Periodically drain dead links, force-close expired drains and forget
/// the calls of closed entries
async fn run_sweeper(
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    config: DispatcherConfig,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(config.liveness_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let pruned = registry.prune();
                if !pruned.is_empty() {
                    info!("Drained {} unresponsive applications", pruned.len());
                }
                for entry in registry.expire_drained(config.drain_timeout) {
                    entry.link().close().await;
                }
                dispatcher.purge_closed();
            }
        }
    }
    debug!("Liveness sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResolverError;
    use crate::policy::FixedPolicy;
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl PolicyResolver for Unreachable {
        async fn resolve(
            &self,
            _request: &InboundRequest,
        ) -> std::result::Result<PolicyOutcome, ResolverError> {
            Err(ResolverError::Unreachable("connection refused".into()))
        }
    }

    fn config() -> DispatcherConfig {
        DispatcherConfig::new().without_tcp_listen()
    }

    #[tokio::test]
    async fn test_unreachable_resolver_responds_500() {
        let server = AppServer::new(config()).unwrap().with_resolver(Arc::new(Unreachable));
        let action = server.handle_request(InboundRequest::new("t1", "INVITE", "sip:a@b")).await;
        assert_eq!(
            action,
            DispatchAction::Respond { status: 500, reason: "Server Internal Error".into() }
        );
    }

    #[tokio::test]
    async fn test_policy_reject_is_passed_through() {
        let server = AppServer::new(config())
            .unwrap()
            .with_resolver(Arc::new(FixedPolicy(PolicyOutcome::Reject(603))));
        let action = server.handle_request(InboundRequest::new("t1", "INVITE", "sip:a@b")).await;
        assert_eq!(action, DispatchAction::Respond { status: 603, reason: "Decline".into() });
    }

    #[tokio::test]
    async fn test_unknown_tls_target_is_transport_unavailable() {
        let server = AppServer::new(config())
            .unwrap()
            .with_resolver(Arc::new(FixedPolicy(PolicyOutcome::RouteByUri(
                "sips:127.0.0.1:1".into(),
            ))));
        let action = server.handle_request(InboundRequest::new("t1", "INVITE", "sip:a@b")).await;
        assert!(matches!(action, DispatchAction::Respond { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let config = config().with_tcp_listen("127.0.0.1:0".parse().unwrap());
        let server = AppServer::new(config).unwrap();
        let addrs = server.start().await.unwrap();
        assert!(addrs.tcp.is_some());
        assert!(matches!(server.start().await, Err(Error::Config(_))));
        server.shutdown().await;
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(matches!(AppServer::new(config().with_secret("")), Err(Error::Config(_))));
    }
}
