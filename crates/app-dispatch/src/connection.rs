//! Application connection establishment
//!
//! Both accepted and dialed connections go through the same startup
//! handshake before they become registry entries: the application
//! authenticates with the shared secret and optionally advertises its tags.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::codec::{AppFrame, FrameCodec};
use crate::entry::{ConnectionEntry, Direction, EntryHandle, EntryId, TagSet, TransportKind};
use crate::error::{DialError, RegistryError};
use crate::link::{AppMessage, BoxedStream, FramedAppLink, FramedStream, LinkEvent, LinkReader};
use crate::registry::Registry;

const AUTHENTICATE: &str = "authenticate";

/// Parameters of the startup handshake
#[derive(Debug, Clone)]
pub struct HandshakeSettings {
    pub secret: Arc<str>,
    /// Identity reported back to applications in the `OK` response
    pub server_id: String,
    pub timeout: Duration,
}

impl HandshakeSettings {
    pub fn new(secret: &str, server_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            secret: Arc::from(secret),
            server_id: server_id.into(),
            timeout,
        }
    }
}

/// Senders every registered link reports through
#[derive(Debug, Clone)]
pub struct LinkChannels {
    pub messages_tx: mpsc::Sender<AppMessage>,
    pub events_tx: mpsc::Sender<LinkEvent>,
}

/// A handshaked connection waiting to be registered
pub struct PendingConnection {
    entry: ConnectionEntry,
    reader: LinkReader,
}

impl PendingConnection {
    pub fn id(&self) -> EntryId {
        self.entry.id()
    }

    pub fn entry(&self) -> &ConnectionEntry {
        &self.entry
    }

    /// Cache the entry under the uri it was dialed at
    pub fn with_outbound_target(mut self, uri: &str) -> Self {
        self.entry = self.entry.with_outbound_target(uri);
        self
    }

    /// Add the entry to the registry, then start reading from its link
    pub fn register(
        self,
        registry: &Arc<Registry>,
        channels: &LinkChannels,
    ) -> Result<EntryHandle, RegistryError> {
        let handle = registry.add(self.entry)?;
        self.reader.spawn(
            registry.clone(),
            channels.messages_tx.clone(),
            channels.events_tx.clone(),
        );
        Ok(handle)
    }
}

impl std::fmt::Debug for PendingConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingConnection").field("entry", &self.entry).finish()
    }
}

/// Bound one connection setup step, such as a TLS handshake, by `timeout`
pub(crate) async fn within<T>(
    timeout: Duration,
    peer: &str,
    step: impl Future<Output = Result<T, DialError>>,
) -> Result<T, DialError> {
    match tokio::time::timeout(timeout, step).await {
        Ok(result) => result,
        Err(_) => {
            warn!(peer, "Connection setup did not complete within {:?}", timeout);
            Err(DialError::Timeout(peer.to_string()))
        }
    }
}

/// Run the startup handshake on a fresh stream
///
/// On success the connection is ready to be registered. On failure the
/// stream is dropped, which closes it.
pub async fn establish(
    stream: BoxedStream,
    peer: SocketAddr,
    direction: Direction,
    transport: TransportKind,
    settings: &HandshakeSettings,
) -> Result<PendingConnection, DialError> {
    let mut framed = Framed::new(stream, FrameCodec::new());
    debug!(%peer, ?direction, "Awaiting application handshake");

    let handshake = authenticate(&mut framed, settings);
    let tags = match tokio::time::timeout(settings.timeout, handshake).await {
        Ok(Ok(tags)) => tags,
        Ok(Err(e)) => {
            warn!(%peer, "Application handshake failed: {}", e);
            return Err(e);
        }
        Err(_) => {
            warn!(%peer, "Application did not authenticate within {:?}", settings.timeout);
            return Err(DialError::Timeout(peer.to_string()));
        }
    };

    let id = EntryId::next();
    let (link, reader) = FramedAppLink::split(id, peer.to_string(), framed);
    let entry = ConnectionEntry::new(direction, transport, link)
        .with_id(id)
        .with_tags(tags)
        .with_remote_addr(peer);
    info!(entry_id = %id, %peer, tags = %entry.tags(), "Application authenticated");
    Ok(PendingConnection { entry, reader })
}

async fn authenticate(
    framed: &mut FramedStream,
    settings: &HandshakeSettings,
) -> Result<TagSet, DialError> {
    let payload = match framed.next().await {
        Some(payload) => payload?,
        None => return Err(DialError::Handshake("connection closed before authenticating".into())),
    };
    let frame = AppFrame::parse(&payload)?;

    if frame.kind != AUTHENTICATE {
        reject(framed, &frame.msg_id, "authenticate first").await;
        return Err(DialError::Handshake(format!(
            "unexpected '{}' message before authenticating",
            frame.kind
        )));
    }
    let secret = frame.args.first().map(String::as_str).unwrap_or_default();
    if secret != &*settings.secret {
        reject(framed, &frame.msg_id, "incorrect secret").await;
        return Err(DialError::Handshake("incorrect secret".into()));
    }

    let tags = frame.args.get(1).map(|list| TagSet::parse_list(list)).unwrap_or_default();
    let ok = AppFrame::response(&frame.msg_id, true, Some(&settings.server_id));
    framed.send(ok.to_payload()).await?;
    Ok(tags)
}

async fn reject(framed: &mut FramedStream, msg_id: &str, reason: &str) {
    let no = AppFrame::response(msg_id, false, Some(reason));
    if let Err(e) = framed.send(no.to_payload()).await {
        debug!("Failed to send handshake rejection: {}", e);
    }
}
