//! Call dispatcher
//!
//! Binds one incoming request to exactly one application connection, or
//! produces a terminal rejection. Selection and reservation happen inside
//! the registry's critical section; delivery happens outside of it. If the
//! chosen peer turns out to be dead when the request is handed over, the
//! entry is drained and selection is retried against the remaining pool, at
//! most once per entry observed when dispatch started. A request that is too
//! large to frame is rejected outright and leaves the entry untouched.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::entry::{EntryHandle, EntryId};
use crate::error::{DispatchError, LinkError, RegistryError};
use crate::policy::PolicyOutcome;
use crate::registry::{Registry, Reservation, Selector};
use crate::request::InboundRequest;
use crate::status::reason_phrase;

/// Outcome of a dispatch attempt
#[derive(Debug, Clone)]
pub enum DispatchResult {
    /// The request was handed to this application
    Delivered(EntryHandle),
    /// The request must be answered with a final error response
    Rejected(DispatchError),
}

impl DispatchResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DispatchResult::Delivered(_))
    }

    pub fn entry(&self) -> Option<&EntryHandle> {
        match self {
            DispatchResult::Delivered(entry) => Some(entry),
            DispatchResult::Rejected(_) => None,
        }
    }

    /// Status of the synthesized rejection, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            DispatchResult::Delivered(_) => None,
            DispatchResult::Rejected(e) => Some(e.status_code()),
        }
    }
}

/// Instruction returned to the transaction layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchAction {
    Deliver { entry: EntryId },
    Respond { status: u16, reason: String },
}

impl From<DispatchResult> for DispatchAction {
    fn from(result: DispatchResult) -> Self {
        match result {
            DispatchResult::Delivered(entry) => DispatchAction::Deliver { entry: entry.id() },
            DispatchResult::Rejected(e) => {
                let status = e.status_code();
                let reason = reason_phrase(status)
                    .map(str::to_string)
                    .unwrap_or_else(|| e.to_string());
                DispatchAction::Respond { status, reason }
            }
        }
    }
}

/// Why a delivery attempt did not go through
enum DeliveryFailure {
    /// The peer is gone; its entry has been drained
    PeerFailed(EntryId),
    /// The request itself cannot be delivered to anyone
    Rejected(DispatchError),
}

/// Matches new requests to application connections
pub struct Dispatcher {
    registry: Arc<Registry>,
    // transaction id -> entry handling the call
    calls: DashMap<String, EntryId>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            calls: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Dispatch a request according to a resolved policy outcome
    ///
    /// Never fails: every problem becomes a [`DispatchResult::Rejected`]
    /// carrying the status to answer with. Cancelling the returned future
    /// rolls back any call reserved on an entry.
    pub async fn dispatch(
        &self,
        request: &InboundRequest,
        outcome: PolicyOutcome,
    ) -> DispatchResult {
        let result = match outcome {
            PolicyOutcome::Reject(status) => {
                DispatchResult::Rejected(DispatchError::PolicyRejected { status })
            }
            PolicyOutcome::RouteByUri(uri) => self.dispatch_direct(request, &uri).await,
            PolicyOutcome::RouteByTag(tag) => {
                self.dispatch_pooled(request, Selector::Tag(tag.as_str())).await
            }
            PolicyOutcome::RouteDefault => self.dispatch_pooled(request, Selector::Default).await,
        };

        match &result {
            DispatchResult::Delivered(entry) => {
                info!(
                    transaction_id = %request.transaction_id,
                    entry_id = %entry.id(),
                    "Dispatched {} request",
                    request.method
                );
            }
            DispatchResult::Rejected(e) => {
                info!(
                    transaction_id = %request.transaction_id,
                    status = e.status_code(),
                    "Rejecting {} request: {}",
                    request.method,
                    e
                );
            }
        }
        result
    }

    async fn dispatch_pooled(
        &self,
        request: &InboundRequest,
        selector: Selector<'_>,
    ) -> DispatchResult {
        if self.registry.active_count() == 0 {
            return DispatchResult::Rejected(DispatchError::NoAppsConnected);
        }

        let method = request.method.as_str();
        let observed = self.registry.selectable_snapshot_for(selector, method).len();
        if observed == 0 {
            return DispatchResult::Rejected(match selector {
                Selector::Tag(tag) => DispatchError::NoMatchingTag(tag.to_string()),
                Selector::Default => DispatchError::NoAppsConnected,
            });
        }

        let mut excluded = HashSet::new();
        for attempt in 0..observed {
            let Some(reservation) = self.registry.reserve_next_for(selector, method, &excluded)
            else {
                break;
            };
            match self.deliver(request, reservation).await {
                Ok(entry) => return DispatchResult::Delivered(entry),
                Err(DeliveryFailure::Rejected(e)) => return DispatchResult::Rejected(e),
                Err(DeliveryFailure::PeerFailed(id)) => {
                    debug!(
                        transaction_id = %request.transaction_id,
                        attempt,
                        "Retrying selection without {}",
                        id
                    );
                    excluded.insert(id);
                }
            }
        }

        warn!(
            transaction_id = %request.transaction_id,
            "Every selected application failed, giving up"
        );
        DispatchResult::Rejected(DispatchError::NoAppsConnected)
    }

    async fn dispatch_direct(&self, request: &InboundRequest, uri: &str) -> DispatchResult {
        let Some(entry) = self.registry.find_by_outbound_target(uri) else {
            return DispatchResult::Rejected(DispatchError::NoSuchOutboundTarget(uri.to_string()));
        };
        if !entry.transport().satisfies(request.required_transport) {
            return DispatchResult::Rejected(DispatchError::TransportUnavailable(format!(
                "{} cannot carry a request requiring {:?}",
                entry.transport(),
                request.required_transport
            )));
        }

        // a peer lost between lookup and delivery leaves nothing to fall back to
        let Some(reservation) = self.registry.reserve_entry(entry.id()) else {
            return DispatchResult::Rejected(DispatchError::NoSuchOutboundTarget(uri.to_string()));
        };
        match self.deliver(request, reservation).await {
            Ok(entry) => DispatchResult::Delivered(entry),
            Err(DeliveryFailure::Rejected(e)) => DispatchResult::Rejected(e),
            Err(DeliveryFailure::PeerFailed(_)) => {
                DispatchResult::Rejected(DispatchError::NoSuchOutboundTarget(uri.to_string()))
            }
        }
    }

    /// Hand the request over, settling the reservation either way
    async fn deliver(
        &self,
        request: &InboundRequest,
        reservation: Reservation,
    ) -> Result<EntryHandle, DeliveryFailure> {
        let id = reservation.handle().id();
        match reservation.handle().link().deliver(request).await {
            Ok(()) => {
                let entry = reservation.commit();
                if let Some(previous) = self.calls.insert(request.transaction_id.clone(), id) {
                    warn!(
                        transaction_id = %request.transaction_id,
                        "Transaction was already assigned to {}",
                        previous
                    );
                    self.registry.release(previous);
                }
                Ok(entry)
            }
            Err(LinkError::TooLarge(len)) => {
                warn!(
                    entry_id = %id,
                    transaction_id = %request.transaction_id,
                    "Request of {} bytes cannot be framed",
                    len
                );
                // dropping the reservation rolls the call back
                drop(reservation);
                Err(DeliveryFailure::Rejected(DispatchError::MessageTooLarge(len)))
            }
            Err(e) => {
                warn!(
                    entry_id = %id,
                    transaction_id = %request.transaction_id,
                    "Delivery failed, dropping stale application: {}",
                    e
                );
                reservation.abandon_dead();
                Err(DeliveryFailure::PeerFailed(id))
            }
        }
    }

    /// The transaction layer reports a dispatched call has ended
    pub fn call_ended(&self, transaction_id: &str) -> Option<EntryId> {
        let (_, id) = self.calls.remove(transaction_id)?;
        self.registry.release(id);
        debug!(transaction_id, entry_id = %id, "Call ended");
        Some(id)
    }

    /// The transport of an application went away
    pub fn peer_disconnected(&self, id: EntryId) -> Result<(), RegistryError> {
        self.registry.begin_drain(id).map(|_| ())
    }

    /// Forget calls whose entry has closed without reporting their end
    ///
    /// Returns the number of transactions dropped.
    pub fn purge_closed(&self) -> usize {
        let before = self.calls.len();
        self.calls.retain(|_, id| self.registry.contains(*id));
        let purged = before.saturating_sub(self.calls.len());
        if purged > 0 {
            debug!("Forgot {} calls of closed applications", purged);
        }
        purged
    }

    /// Entry currently handling a transaction
    pub fn entry_for_call(&self, transaction_id: &str) -> Option<EntryId> {
        self.calls.get(transaction_id).map(|entry| *entry)
    }

    pub fn active_calls(&self) -> usize {
        self.calls.len()
    }
}
