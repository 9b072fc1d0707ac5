//! Application links
//!
//! [`AppLink`] is the seam between dispatch logic and the network: the
//! dispatcher only ever delivers requests through it and asks whether the
//! peer is still alive. [`FramedAppLink`] is the stream-backed
//! implementation used for real TCP/TLS application connections.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::codec::{AppFrame, FrameCodec, MAX_FRAME_LENGTH};
use crate::entry::EntryId;
use crate::error::LinkError;
use crate::registry::Registry;
use crate::request::{InboundRequest, is_routable_method};

/// Delivery channel to one connected application
#[async_trait]
pub trait AppLink: Send + Sync + fmt::Debug {
    /// Hand a new request to the application
    ///
    /// An error for which [`LinkError::is_peer_failure`] holds means the
    /// peer has failed and the caller must treat the entry as dead. Any
    /// other error concerns the request alone.
    async fn deliver(&self, request: &InboundRequest) -> Result<(), LinkError>;

    /// Liveness check, cheap enough to call while holding the registry lock
    fn is_alive(&self) -> bool;

    /// Close the underlying transport
    async fn close(&self);
}

/// Any byte stream an application link can run over
pub trait AppStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AppStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedStream = Box<dyn AppStream>;

pub(crate) type FramedStream = Framed<BoxedStream, FrameCodec>;

/// Frame received from an active application
#[derive(Debug, Clone)]
pub struct AppMessage {
    pub entry_id: EntryId,
    pub frame: AppFrame,
}

/// Notifications raised by application link tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// The peer closed the transport or sent something unparseable
    Disconnected(EntryId),
}

/// Stream-backed application link
pub struct FramedAppLink {
    id: EntryId,
    peer: String,
    sink: Mutex<SplitSink<FramedStream, String>>,
    alive: Arc<AtomicBool>,
}

impl FramedAppLink {
    /// Split a handshaked stream into a link and its reader half
    pub(crate) fn split(
        id: EntryId,
        peer: String,
        framed: FramedStream,
    ) -> (Arc<Self>, LinkReader) {
        let (sink, stream) = framed.split();
        let alive = Arc::new(AtomicBool::new(true));
        let link = Arc::new(Self {
            id,
            peer,
            sink: Mutex::new(sink),
            alive: alive.clone(),
        });
        let reader = LinkReader {
            id,
            stream,
            alive,
            link: link.clone(),
        };
        (link, reader)
    }

    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    async fn send_payload(&self, payload: String) -> Result<(), LinkError> {
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.send(payload).await {
            if e.is_peer_failure() {
                self.alive.store(false, Ordering::Relaxed);
            }
            warn!(entry_id = %self.id, "Failed to write to application at {}: {}", self.peer, e);
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl AppLink for FramedAppLink {
    async fn deliver(&self, request: &InboundRequest) -> Result<(), LinkError> {
        if !self.is_alive() {
            return Err(LinkError::Closed);
        }

        let payload = AppFrame::sip(request).to_payload();
        if payload.len() > MAX_FRAME_LENGTH {
            return Err(LinkError::TooLarge(payload.len()));
        }
        debug!(
            entry_id = %self.id,
            transaction_id = %request.transaction_id,
            "Delivering {} to {}",
            request.method,
            self.peer
        );
        self.send_payload(payload).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::Relaxed);
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!(entry_id = %self.id, "Error closing application link: {}", e);
        }
    }
}

impl fmt::Debug for FramedAppLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FramedAppLink({}, {})", self.id, self.peer)
    }
}

/// Read half of an application link
///
/// Spawned only once the entry is registered, so a disconnect can never be
/// reported before the entry it refers to exists. Method subscriptions
/// (`route` frames) are applied to the registry here and answered directly;
/// every other frame is forwarded as an [`AppMessage`].
pub struct LinkReader {
    id: EntryId,
    stream: SplitStream<FramedStream>,
    alive: Arc<AtomicBool>,
    link: Arc<FramedAppLink>,
}

impl LinkReader {
    pub fn spawn(
        self,
        registry: Arc<Registry>,
        messages_tx: mpsc::Sender<AppMessage>,
        events_tx: mpsc::Sender<LinkEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(registry, messages_tx, events_tx))
    }

    async fn run(
        mut self,
        registry: Arc<Registry>,
        messages_tx: mpsc::Sender<AppMessage>,
        events_tx: mpsc::Sender<LinkEvent>,
    ) {
        while let Some(item) = self.stream.next().await {
            let frame = match item.and_then(|payload| AppFrame::parse(&payload)) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(entry_id = %self.id, "Dropping application link: {}", e);
                    break;
                }
            };

            if let Some(verb) = frame.route_verb() {
                let reply = self.subscribe(&registry, &frame.msg_id, verb);
                if self.link.send_payload(reply.to_payload()).await.is_err() {
                    break;
                }
                continue;
            }

            let message = AppMessage { entry_id: self.id, frame };
            if let Err(e) = messages_tx.try_send(message) {
                warn!(entry_id = %self.id, "Application message dropped: {}", e);
            }
        }

        self.alive.store(false, Ordering::Relaxed);
        info!(entry_id = %self.id, "Application disconnected");
        let _ = events_tx.send(LinkEvent::Disconnected(self.id)).await;
    }

    fn subscribe(&self, registry: &Registry, msg_id: &str, verb: &str) -> AppFrame {
        if !is_routable_method(verb) {
            warn!(entry_id = %self.id, "Route request includes unsupported verb: {}", verb);
            let reason = "Route request includes unsupported verb";
            return AppFrame::response(msg_id, false, Some(reason));
        }
        match registry.subscribe(self.id, verb) {
            Ok(_) => AppFrame::response(msg_id, true, None),
            Err(e) => {
                debug!(entry_id = %self.id, "Subscription for {} ignored: {}", verb, e);
                AppFrame::response(msg_id, false, Some("application is not registered"))
            }
        }
    }
}
