//! Application connection entries
//!
//! A [`ConnectionEntry`] describes one live link to a downstream
//! call-handling application. It is created in [`EntryState::Connecting`]
//! when the transport connection completes, and handed to the
//! [`Registry`](crate::registry::Registry), which owns its mutable
//! bookkeeping (state, round-robin sequence, active call count) from then on.
//! Callers only ever see [`EntryHandle`]s: cheap, immutable views of the
//! entry's identity and link.

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::link::AppLink;

static NEXT_ENTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of an application connection
///
/// Ids are allocated in increasing order, so comparing ids compares
/// registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(u64);

impl EntryId {
    /// Allocate the next id
    pub fn next() -> Self {
        EntryId(NEXT_ENTRY_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "app-{}", self.0)
    }
}

/// Who initiated the connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// The application dialed into the server
    Inbound,
    /// The server dialed out to a listening application
    Outbound,
}

/// Stream transport carrying the application link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Plain,
    Tls,
}

impl TransportKind {
    /// Whether this transport can carry a request that requires `required`
    pub fn satisfies(&self, required: Option<TransportKind>) -> bool {
        match required {
            None => true,
            Some(required) => *self == required,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Plain => write!(f, "tcp"),
            TransportKind::Tls => write!(f, "tls"),
        }
    }
}

/// Lifecycle state of an application connection
///
/// States only ever move forward: `Connecting → Active → Draining → Closed`,
/// with `Closed` reachable from any other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryState {
    Connecting,
    Active,
    Draining,
    Closed,
}

impl EntryState {
    fn rank(&self) -> u8 {
        match self {
            EntryState::Connecting => 0,
            EntryState::Active => 1,
            EntryState::Draining => 2,
            EntryState::Closed => 3,
        }
    }

    pub fn can_transition_to(&self, next: EntryState) -> bool {
        match (self, next) {
            // handshake failure skips straight to closed
            (EntryState::Connecting, EntryState::Draining) => false,
            _ => next.rank() > self.rank(),
        }
    }

    pub fn is_selectable(&self) -> bool {
        matches!(self, EntryState::Active)
    }
}

/// Normalized set of capability tags
///
/// A single tag and a list of tags are the same construct: both
/// `"red"` and `["red"]` deserialize to the same set. Tags are trimmed and
/// empty tags are dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "TagsInput", into = "Vec<String>")]
pub struct TagSet(BTreeSet<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum TagsInput {
    One(String),
    Many(Vec<String>),
}

impl From<TagsInput> for TagSet {
    fn from(input: TagsInput) -> Self {
        match input {
            TagsInput::One(tag) => TagSet::parse_list(&tag),
            TagsInput::Many(tags) => tags.into_iter().collect(),
        }
    }
}

impl From<TagSet> for Vec<String> {
    fn from(tags: TagSet) -> Self {
        tags.0.into_iter().collect()
    }
}

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a comma separated tag list, e.g. `"blue,green"`
    pub fn parse_list(list: &str) -> Self {
        list.split(',').collect()
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: AsRef<str>> FromIterator<S> for TagSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        TagSet(
            iter.into_iter()
                .map(|tag| tag.as_ref().trim().to_string())
                .filter(|tag| !tag.is_empty())
                .collect(),
        )
    }
}

impl From<&str> for TagSet {
    fn from(tag: &str) -> Self {
        TagSet::parse_list(tag)
    }
}

impl From<Vec<String>> for TagSet {
    fn from(tags: Vec<String>) -> Self {
        tags.into_iter().collect()
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags: Vec<&str> = self.iter().collect();
        write!(f, "{{{}}}", tags.join(","))
    }
}

struct EntryInfo {
    id: EntryId,
    direction: Direction,
    transport: TransportKind,
    tags: TagSet,
    outbound_target: Option<String>,
    remote_addr: Option<SocketAddr>,
    link: Arc<dyn AppLink>,
}

/// Immutable, cheaply cloned view of a registered entry
#[derive(Clone)]
pub struct EntryHandle {
    inner: Arc<EntryInfo>,
}

impl EntryHandle {
    pub fn id(&self) -> EntryId {
        self.inner.id
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn transport(&self) -> TransportKind {
        self.inner.transport
    }

    pub fn tags(&self) -> &TagSet {
        &self.inner.tags
    }

    /// Dial target for outbound entries
    pub fn outbound_target(&self) -> Option<&str> {
        self.inner.outbound_target.as_deref()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    pub fn link(&self) -> &Arc<dyn AppLink> {
        &self.inner.link
    }

    /// Whether this entry may receive a request routed with `tag`
    ///
    /// Untagged entries form the default pool and only receive untagged
    /// traffic; tagged entries only receive traffic for one of their tags.
    pub fn accepts(&self, tag: Option<&str>) -> bool {
        match tag {
            Some(tag) => self.inner.tags.contains(tag),
            None => self.inner.tags.is_empty(),
        }
    }
}

impl PartialEq for EntryHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for EntryHandle {}

impl fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryHandle")
            .field("id", &self.inner.id)
            .field("direction", &self.inner.direction)
            .field("transport", &self.inner.transport)
            .field("tags", &self.inner.tags)
            .field("outbound_target", &self.inner.outbound_target)
            .finish()
    }
}

/// A newly established application connection, not yet registered
pub struct ConnectionEntry {
    info: EntryInfo,
    state: EntryState,
}

impl ConnectionEntry {
    /// Create an entry in the `Connecting` state with a fresh id
    pub fn new(direction: Direction, transport: TransportKind, link: Arc<dyn AppLink>) -> Self {
        Self {
            info: EntryInfo {
                id: EntryId::next(),
                direction,
                transport,
                tags: TagSet::new(),
                outbound_target: None,
                remote_addr: None,
                link,
            },
            state: EntryState::Connecting,
        }
    }

    /// Keep an id allocated before the link existed
    pub fn with_id(mut self, id: EntryId) -> Self {
        self.info.id = id;
        self
    }

    pub fn with_tags(mut self, tags: impl Into<TagSet>) -> Self {
        self.info.tags = tags.into();
        self
    }

    pub fn with_outbound_target(mut self, target: impl Into<String>) -> Self {
        self.info.outbound_target = Some(target.into());
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.info.remote_addr = Some(addr);
        self
    }

    pub fn id(&self) -> EntryId {
        self.info.id
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn tags(&self) -> &TagSet {
        &self.info.tags
    }

    pub fn outbound_target(&self) -> Option<&str> {
        self.info.outbound_target.as_deref()
    }

    /// Move the entry forward through its lifecycle
    pub fn transition(&mut self, next: EntryState) -> Result<(), RegistryError> {
        if !self.state.can_transition_to(next) {
            return Err(RegistryError::InvalidTransition { from: self.state, to: next });
        }
        self.state = next;
        Ok(())
    }

    pub(crate) fn into_handle(self) -> EntryHandle {
        EntryHandle { inner: Arc::new(self.info) }
    }
}

impl fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("id", &self.info.id)
            .field("direction", &self.info.direction)
            .field("transport", &self.info.transport)
            .field("tags", &self.info.tags)
            .field("state", &self.state)
            .finish()
    }
}
