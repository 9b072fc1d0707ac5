//! Error types for the application dispatch layer
//!
//! Each concern carries its own error enum. [`DispatchError`] is the
//! dispatch-time taxonomy: every variant maps onto the SIP status code that is
//! returned to the requester, so nothing ever crosses the transaction-layer
//! boundary as a failure without a definite final response.

use thiserror::Error;

use crate::entry::{EntryId, EntryState};

/// Errors raised by the connection registry
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Entry {0} is already registered")]
    DuplicateId(EntryId),

    #[error("Entry {0} not found")]
    NotFound(EntryId),

    #[error("Invalid state transition {from:?} -> {to:?}")]
    InvalidTransition { from: EntryState, to: EntryState },
}

/// Errors raised while querying the routing policy service
#[derive(Debug, Clone, Error)]
pub enum ResolverError {
    #[error("Routing service unreachable: {0}")]
    Unreachable(String),

    #[error("Invalid routing instruction: {0}")]
    InvalidResponse(String),

    #[error("Invalid routing url: {0}")]
    InvalidUrl(String),
}

/// Errors on an established application link
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Application link closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message of {0} bytes does not fit in a frame")]
    TooLarge(usize),
}

impl LinkError {
    /// Whether the error means the peer itself has failed
    ///
    /// An oversized message is a property of the request; the link stays
    /// usable.
    pub fn is_peer_failure(&self) -> bool {
        !matches!(self, LinkError::TooLarge(_))
    }
}

/// Errors raised while establishing an application connection
#[derive(Debug, Error)]
pub enum DialError {
    #[error("Invalid outbound target: {0}")]
    InvalidTarget(String),

    #[error("Connection refused by {0}")]
    ConnectRefused(String),

    #[error("Timed out connecting to {0}")]
    Timeout(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("No transport available to reach {0}")]
    TransportUnavailable(String),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Dispatch-time failures, each converted to a final SIP status
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("No applications connected")]
    NoAppsConnected,

    #[error("Request rejected by routing policy with status {status}")]
    PolicyRejected { status: u16 },

    #[error("No application advertises tag '{0}'")]
    NoMatchingTag(String),

    #[error("No application connected at {0}")]
    NoSuchOutboundTarget(String),

    #[error("No transport available: {0}")]
    TransportUnavailable(String),

    #[error("Routing service unreachable: {0}")]
    ResolverUnreachable(String),

    #[error("Request of {0} bytes is too large to hand to an application")]
    MessageTooLarge(usize),
}

impl DispatchError {
    /// SIP status code sent back to the requester
    pub fn status_code(&self) -> u16 {
        match self {
            DispatchError::NoAppsConnected => 503,
            DispatchError::PolicyRejected { status } => *status,
            DispatchError::NoMatchingTag(_) | DispatchError::NoSuchOutboundTarget(_) => 480,
            DispatchError::TransportUnavailable(_) | DispatchError::ResolverUnreachable(_) => 500,
            DispatchError::MessageTooLarge(_) => 513,
        }
    }
}

/// Crate-level error
#[derive(Debug, Error)]
pub enum Error {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Resolver error: {0}")]
    Resolver(#[from] ResolverError),

    #[error("Dial error: {0}")]
    Dial(#[from] DialError),

    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
