//! # RVoIP App Dispatch
//!
//! Application connection registry and call dispatcher for the rvoip
//! signaling server.
//!
//! Call-handling applications either connect to the server or listen on a
//! known address and get dialed. Every new request arriving outside of a
//! dialog is classified by an optional HTTP routing service and then bound
//! to exactly one application connection, or answered with a final status.
//!
//! ## Features
//!
//! - **Round robin**: even, strictly cyclic distribution over the default pool
//! - **Tag routing**: applications advertise capability tags at handshake
//! - **Direct routing**: requests routed to an application's address, dialed on demand
//! - **Failure handling**: dead peers are skipped, drained and never handed work
//!
//! ## Architecture
//!
//! - `entry`: application connection entries and their lifecycle
//! - `registry`: the pool of entries and round-robin selection
//! - `dispatcher`: binds a request to an entry for a resolved policy
//! - `policy`: routing service lookup
//! - `codec`, `link`, `connection`: the application link protocol
//! - `listener`, `dialer`: inbound and outbound connection establishment
//! - `server`: the facade used by the transaction layer
//!
//! ## Example
//!
//! ```rust,no_run
//! use rvoip_app_dispatch::prelude::*;
//!
//! # async fn example() -> rvoip_app_dispatch::Result<()> {
//! let config = DispatcherConfig::new()
//!     .with_tcp_listen("0.0.0.0:9022".parse().unwrap())
//!     .with_route("INVITE", "GET", "http://127.0.0.1:3000/route");
//! let server = AppServer::new(config)?;
//! server.start().await?;
//!
//! let request = InboundRequest::new("z9hG4bK-1", "INVITE", "sip:alice@example.com");
//! match server.handle_request(request).await {
//!     DispatchAction::Deliver { entry } => println!("handed to {}", entry),
//!     DispatchAction::Respond { status, reason } => println!("answer {} {}", status, reason),
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod dialer;
pub mod dispatcher;
pub mod entry;
pub mod error;
pub mod link;
pub mod listener;
pub mod logging;
pub mod policy;
pub mod registry;
pub mod request;
pub mod server;
pub mod status;

pub use config::{DispatcherConfig, RouteConfig};
pub use dialer::{Dialer, OutboundTarget};
pub use dispatcher::{DispatchAction, DispatchResult, Dispatcher};
pub use entry::{
    ConnectionEntry, Direction, EntryHandle, EntryId, EntryState, TagSet, TransportKind,
};
pub use error::{DialError, DispatchError, Error, LinkError, RegistryError, ResolverError, Result};
pub use link::{AppLink, AppMessage, LinkEvent};
pub use policy::{FixedPolicy, HttpPolicyResolver, PolicyOutcome, PolicyResolver, RequestRouter};
pub use registry::{Registry, RegistryStats, Selector};
pub use request::InboundRequest;
pub use server::{AppServer, ServerAddrs};

pub mod prelude {
    pub use crate::config::DispatcherConfig;
    pub use crate::dispatcher::{DispatchAction, DispatchResult, Dispatcher};
    pub use crate::entry::{ConnectionEntry, Direction, EntryHandle, EntryId, TagSet, TransportKind};
    pub use crate::error::{DispatchError, Error, Result};
    pub use crate::link::AppLink;
    pub use crate::policy::{PolicyOutcome, PolicyResolver};
    pub use crate::registry::{Registry, Selector};
    pub use crate::request::InboundRequest;
    pub use crate::server::AppServer;
}
