//! Change events broadcast by the backing store
//!
//! Provides the change event definitions and the EventBus used to fan them
//! out to every subscribed client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ids::ServiceId;
use crate::models::{EntryRecord, ServiceRecord};

/// Kind of entity a change event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Entry,
    Service,
}

/// What happened to the entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeOperation::Create => write!(f, "create"),
            ChangeOperation::Update => write!(f, "update"),
            ChangeOperation::Delete => write!(f, "delete"),
        }
    }
}

/// Full resulting record carried by an event
///
/// For deletes this is the last state of the record with the version the
/// delete was assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entity", content = "data", rename_all = "lowercase")]
pub enum ChangeRecord {
    Entry(EntryRecord),
    Service(ServiceRecord),
}

/// One broadcast change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    pub record: ChangeRecord,
    /// Server timestamp of the write
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn entity(&self) -> EntityKind {
        match self.record {
            ChangeRecord::Entry(_) => EntityKind::Entry,
            ChangeRecord::Service(_) => EntityKind::Service,
        }
    }

    /// Raw id of the entity the event describes
    pub fn entity_id(&self) -> Uuid {
        match &self.record {
            ChangeRecord::Entry(r) => r.id.0,
            ChangeRecord::Service(r) => r.id.0,
        }
    }

    /// Service the event belongs to
    pub fn service_id(&self) -> ServiceId {
        match &self.record {
            ChangeRecord::Entry(r) => r.service_id,
            ChangeRecord::Service(r) => r.id,
        }
    }

    /// Key under which redeliveries are recognised
    pub fn dedup_key(&self) -> (Uuid, DateTime<Utc>) {
        (self.entity_id(), self.timestamp)
    }
}

/// Central distribution bus for store change events
///
/// The EventBus uses tokio::broadcast internally, providing:
/// - Non-blocking publish (slow subscribers don't block the store)
/// - Multiple concurrent subscribers
/// - Automatic cleanup when subscribers drop
/// - Lagged message detection for slow subscribers
///
/// # Capacity Recommendations
///
/// - Interactive clients: 1000
/// - Testing: 10-100
///
/// # Examples
///
/// ```
/// use setlist_common::events::EventBus;
///
/// let event_bus = EventBus::new(100);
/// let _rx = event_bus.subscribe();
/// assert_eq!(event_bus.subscriber_count(), 1);
/// ```
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ChangeEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before lagging subscribers
    ///   start losing the oldest ones
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: ChangeEvent,
    ) -> Result<usize, broadcast::error::SendError<ChangeEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: ChangeEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
