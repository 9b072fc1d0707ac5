//! Shared helpers for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use rvoip_app_dispatch::prelude::*;
use rvoip_app_dispatch::LinkError;

/// In-memory application link recording what it was handed
#[derive(Debug)]
pub struct RecordingLink {
    pub name: &'static str,
    alive: AtomicBool,
    // never completes delivery while set
    hang: AtomicBool,
    delivered: Mutex<Vec<String>>,
}

impl RecordingLink {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            alive: AtomicBool::new(true),
            hang: AtomicBool::new(false),
            delivered: Mutex::new(Vec::new()),
        })
    }

    /// Simulate a peer whose transport failed without anyone noticing yet
    pub fn kill(&self) {
        self.alive.store(false, Ordering::Relaxed);
    }

    pub fn hang(&self) {
        self.hang.store(true, Ordering::Relaxed);
    }

    pub fn delivered(&self) -> Vec<String> {
        self.delivered.lock().clone()
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().len()
    }
}

#[async_trait]
impl AppLink for RecordingLink {
    async fn deliver(&self, request: &InboundRequest) -> std::result::Result<(), LinkError> {
        if self.hang.load(Ordering::Relaxed) {
            futures::future::pending::<()>().await;
        }
        if !self.alive.load(Ordering::Relaxed) {
            return Err(LinkError::Closed);
        }
        self.delivered.lock().push(request.transaction_id.clone());
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        self.kill();
    }
}

/// Register an inbound application advertising `tags`
pub fn connect_app(
    registry: &Registry,
    name: &'static str,
    tags: &str,
) -> (EntryId, Arc<RecordingLink>) {
    let link = RecordingLink::new(name);
    let entry = ConnectionEntry::new(Direction::Inbound, TransportKind::Plain, link.clone())
        .with_tags(TagSet::parse_list(tags));
    let id = registry.add(entry).expect("entry should register").id();
    (id, link)
}

/// Register an outbound application dialed at `uri`
pub fn connect_outbound(
    registry: &Registry,
    name: &'static str,
    uri: &str,
) -> (EntryId, Arc<RecordingLink>) {
    let link = RecordingLink::new(name);
    let entry = ConnectionEntry::new(Direction::Outbound, TransportKind::Plain, link.clone())
        .with_outbound_target(uri);
    let id = registry.add(entry).expect("entry should register").id();
    (id, link)
}

pub fn invite(transaction_id: &str) -> InboundRequest {
    let raw = format!(
        "INVITE sip:test@127.0.0.1:5060 SIP/2.0\r\nVia: SIP/2.0/UDP 127.0.0.1;branch={}\r\n\r\n",
        transaction_id
    );
    InboundRequest::new(transaction_id, "INVITE", "sip:test@127.0.0.1:5060").with_raw_message(raw)
}
