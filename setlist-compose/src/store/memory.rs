//! In-process backing store
//!
//! Holds services and entries in memory, authorizes every write against the
//! same role model clients use locally, and broadcasts every change on an
//! [`EventBus`]. Each simulated client talks to it through its own
//! [`StoreLink`], which can be taken offline to simulate a partition.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use setlist_common::events::{ChangeEvent, ChangeOperation, ChangeRecord, EventBus};
use setlist_common::models::{
    Capability, DeleteAck, EntryPatch, EntryRecord, NewEntry, ServiceRecord, ServiceStatus,
};
use setlist_common::{ClientId, EntryId, ServiceId, TenantId, UserId};

use super::{BackingStore, EventStream, RequestContext, StoreError, StoreResult};
use crate::authz::{CapabilitySet, Role};
use crate::mutation::OpKind;

struct StoredEntry {
    record: EntryRecord,
    /// Record version at which the overrides last changed
    overrides_version: u64,
}

#[derive(Default)]
struct StoreInner {
    services: HashMap<ServiceId, ServiceRecord>,
    entries: HashMap<EntryId, StoredEntry>,
    /// Final acknowledgement of every deleted entry
    deleted: HashMap<EntryId, DeleteAck>,
    /// (client, client_ref) of every create, for retry deduplication
    created: HashMap<(ClientId, EntryId), EntryId>,
    grants: HashMap<(UserId, TenantId), CapabilitySet>,
    last_timestamp: Option<DateTime<Utc>>,
}

impl StoreInner {
    /// Strictly increasing write timestamp
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let mut ts = Utc::now();
        if let Some(last) = self.last_timestamp {
            if ts <= last {
                ts = last + ChronoDuration::microseconds(1);
            }
        }
        self.last_timestamp = Some(ts);
        ts
    }

    fn authorize(
        &self,
        ctx: &RequestContext,
        service_id: ServiceId,
        required: Capability,
    ) -> StoreResult<&ServiceRecord> {
        let service = self
            .services
            .get(&service_id)
            .ok_or_else(|| StoreError::NotFound(format!("service {}", service_id)))?;
        let allowed = self
            .grants
            .get(&(ctx.user, service.tenant_id))
            .map(|caps| caps.contains(required))
            .unwrap_or(false);
        if !allowed {
            return Err(StoreError::PermissionDenied(format!(
                "user {} lacks {}",
                ctx.user, required
            )));
        }
        Ok(service)
    }

    fn authorize_write(
        &self,
        ctx: &RequestContext,
        service_id: ServiceId,
        required: Capability,
    ) -> StoreResult<()> {
        let service = self.authorize(ctx, service_id, required)?;
        if service.status == ServiceStatus::Completed {
            return Err(StoreError::PermissionDenied(format!(
                "service {} is completed",
                service_id
            )));
        }
        Ok(())
    }
}

/// Shared in-memory store
pub struct InMemoryStore {
    inner: Mutex<StoreInner>,
    bus: EventBus,
}

impl InMemoryStore {
    pub fn new(event_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(StoreInner::default()),
            bus: EventBus::new(event_capacity),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Give `user` the capabilities of `role` in `tenant`
    pub fn grant(&self, user: UserId, tenant: TenantId, role: Role) {
        self.grant_capabilities(user, tenant, role.capabilities());
    }

    pub fn grant_capabilities(&self, user: UserId, tenant: TenantId, capabilities: CapabilitySet) {
        self.lock().grants.insert((user, tenant), capabilities);
    }

    /// Create a service in planning state
    pub fn create_service(
        &self,
        tenant_id: TenantId,
        title: impl Into<String>,
        scheduled_for: DateTime<Utc>,
    ) -> ServiceRecord {
        let mut inner = self.lock();
        let record = ServiceRecord {
            id: ServiceId::new(),
            tenant_id,
            title: title.into(),
            scheduled_for,
            status: ServiceStatus::Planning,
            version: 1,
            updated_at: inner.next_timestamp(),
        };
        inner.services.insert(record.id, record.clone());
        info!(service = %record.id, title = %record.title, "Created service");
        record
    }

    pub fn service(&self, id: ServiceId) -> Option<ServiceRecord> {
        self.lock().services.get(&id).cloned()
    }

    /// Live entries of a service in order
    pub fn entries(&self, service_id: ServiceId) -> Vec<EntryRecord> {
        let mut records: Vec<EntryRecord> = self
            .lock()
            .entries
            .values()
            .filter(|e| e.record.service_id == service_id)
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
        records
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Per-client connection to this store
    pub fn link(self: &Arc<Self>) -> StoreLink {
        StoreLink {
            store: Arc::clone(self),
            online: Arc::new(AtomicBool::new(true)),
            fail_next: Arc::new(AtomicU32::new(0)),
            heartbeats: Arc::new(AtomicU32::new(0)),
            latency: Arc::new(Mutex::new(Duration::ZERO)),
            streams: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn publish(&self, operation: ChangeOperation, record: ChangeRecord, timestamp: DateTime<Utc>) {
        self.bus.emit_lossy(ChangeEvent {
            operation,
            record,
            timestamp,
        });
    }
}

#[async_trait]
impl BackingStore for InMemoryStore {
    async fn create(&self, ctx: &RequestContext, entry: NewEntry) -> StoreResult<EntryRecord> {
        let mut inner = self.lock();
        inner.authorize_write(ctx, entry.service_id, OpKind::Add.required_capability())?;

        if let Some(existing) = inner.created.get(&(ctx.client, entry.client_ref)).copied() {
            debug!(entry = %existing, client_ref = %entry.client_ref, "Duplicate create");
            return match inner.entries.get(&existing) {
                Some(stored) => Ok(stored.record.clone()),
                None => Err(StoreError::NotFound(format!("entry {} was deleted", existing))),
            };
        }

        let timestamp = inner.next_timestamp();
        let record = EntryRecord {
            id: EntryId::new(),
            service_id: entry.service_id,
            song_id: entry.song_id,
            position: entry.position,
            overrides: entry.overrides,
            version: 1,
            updated_at: timestamp,
            origin: ctx.origin(Some(entry.client_ref)),
        };
        inner.created.insert((ctx.client, entry.client_ref), record.id);
        inner.entries.insert(
            record.id,
            StoredEntry {
                record: record.clone(),
                overrides_version: 1,
            },
        );
        self.publish(ChangeOperation::Create, ChangeRecord::Entry(record.clone()), timestamp);
        Ok(record)
    }

    async fn update(
        &self,
        ctx: &RequestContext,
        id: EntryId,
        patch: EntryPatch,
        expected_version: Option<u64>,
    ) -> StoreResult<EntryRecord> {
        let mut inner = self.lock();
        let service_id = inner
            .entries
            .get(&id)
            .map(|e| e.record.service_id)
            .ok_or_else(|| StoreError::NotFound(format!("entry {}", id)))?;

        if patch.position.is_some() {
            inner.authorize_write(ctx, service_id, OpKind::Move.required_capability())?;
        }
        let edits_overrides = !patch.overrides.is_empty();
        if edits_overrides {
            inner.authorize_write(ctx, service_id, OpKind::Edit.required_capability())?;
        }

        let timestamp = inner.next_timestamp();
        let stored = inner
            .entries
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("entry {}", id)))?;

        // Only override edits are version checked; positions are last-write-wins
        if let (true, Some(expected)) = (edits_overrides, expected_version) {
            if stored.overrides_version > expected {
                return Err(StoreError::Conflict {
                    current: stored.record.clone(),
                });
            }
        }

        if let Some(position) = patch.position {
            stored.record.position = position;
        }
        patch.overrides.apply(&mut stored.record.overrides);
        stored.record.version += 1;
        stored.record.updated_at = timestamp;
        stored.record.origin = ctx.origin(None);
        if edits_overrides {
            stored.overrides_version = stored.record.version;
        }

        let record = stored.record.clone();
        self.publish(ChangeOperation::Update, ChangeRecord::Entry(record.clone()), timestamp);
        Ok(record)
    }

    async fn delete(&self, ctx: &RequestContext, id: EntryId) -> StoreResult<DeleteAck> {
        let mut inner = self.lock();
        if let Some(ack) = inner.deleted.get(&id).cloned() {
            inner.authorize(ctx, ack.service_id, OpKind::Remove.required_capability())?;
            return Ok(ack);
        }

        let service_id = inner
            .entries
            .get(&id)
            .map(|e| e.record.service_id)
            .ok_or_else(|| StoreError::NotFound(format!("entry {}", id)))?;
        inner.authorize_write(ctx, service_id, OpKind::Remove.required_capability())?;

        let timestamp = inner.next_timestamp();
        let mut record = inner
            .entries
            .remove(&id)
            .map(|e| e.record)
            .ok_or_else(|| StoreError::NotFound(format!("entry {}", id)))?;
        record.version += 1;
        record.updated_at = timestamp;
        record.origin = ctx.origin(None);

        let ack = DeleteAck {
            id,
            service_id,
            version: record.version,
            timestamp,
        };
        inner.deleted.insert(id, ack.clone());
        self.publish(ChangeOperation::Delete, ChangeRecord::Entry(record), timestamp);
        Ok(ack)
    }

    async fn fetch_entries(
        &self,
        ctx: &RequestContext,
        service_id: ServiceId,
    ) -> StoreResult<Vec<EntryRecord>> {
        self.lock()
            .authorize(ctx, service_id, Capability::ServiceView)?;
        Ok(self.entries(service_id))
    }

    async fn set_service_status(
        &self,
        ctx: &RequestContext,
        service_id: ServiceId,
        status: ServiceStatus,
    ) -> StoreResult<ServiceRecord> {
        let mut inner = self.lock();
        inner.authorize(ctx, service_id, Capability::ServiceComplete)?;
        let timestamp = inner.next_timestamp();
        let service = inner
            .services
            .get_mut(&service_id)
            .ok_or_else(|| StoreError::NotFound(format!("service {}", service_id)))?;
        service.status = status;
        service.version += 1;
        service.updated_at = timestamp;
        let record = service.clone();
        info!(service = %service_id, %status, "Service status changed");
        self.publish(ChangeOperation::Update, ChangeRecord::Service(record.clone()), timestamp);
        Ok(record)
    }

    async fn subscribe(&self) -> StoreResult<EventStream> {
        Ok(self.bus.subscribe())
    }

    async fn heartbeat(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// One client's connection to an [`InMemoryStore`]
///
/// Taking the link offline fails every request with a transport error and
/// closes every event stream handed out through it.
#[derive(Clone)]
pub struct StoreLink {
    store: Arc<InMemoryStore>,
    online: Arc<AtomicBool>,
    fail_next: Arc<AtomicU32>,
    heartbeats: Arc<AtomicU32>,
    latency: Arc<Mutex<Duration>>,
    streams: Arc<Mutex<Vec<CancellationToken>>>,
}

impl StoreLink {
    pub fn store(&self) -> &Arc<InMemoryStore> {
        &self.store
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
        if !online {
            let streams = std::mem::take(
                &mut *self.streams.lock().unwrap_or_else(PoisonError::into_inner),
            );
            for token in streams {
                token.cancel();
            }
        }
        info!(online, "Store link state changed");
    }

    /// Fail the next `n` requests with a transport error
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Heartbeats sent through this link, answered or not
    pub fn heartbeat_count(&self) -> u32 {
        self.heartbeats.load(Ordering::SeqCst)
    }

    /// Delay applied before every request reaches the store
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    async fn gate(&self) -> StoreResult<()> {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if !self.is_online() {
            return Err(StoreError::Transport("link offline".to_string()));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Transport("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BackingStore for StoreLink {
    async fn create(&self, ctx: &RequestContext, entry: NewEntry) -> StoreResult<EntryRecord> {
        self.gate().await?;
        self.store.create(ctx, entry).await
    }

    async fn update(
        &self,
        ctx: &RequestContext,
        id: EntryId,
        patch: EntryPatch,
        expected_version: Option<u64>,
    ) -> StoreResult<EntryRecord> {
        self.gate().await?;
        self.store.update(ctx, id, patch, expected_version).await
    }

    async fn delete(&self, ctx: &RequestContext, id: EntryId) -> StoreResult<DeleteAck> {
        self.gate().await?;
        self.store.delete(ctx, id).await
    }

    async fn fetch_entries(
        &self,
        ctx: &RequestContext,
        service_id: ServiceId,
    ) -> StoreResult<Vec<EntryRecord>> {
        self.gate().await?;
        self.store.fetch_entries(ctx, service_id).await
    }

    async fn set_service_status(
        &self,
        ctx: &RequestContext,
        service_id: ServiceId,
        status: ServiceStatus,
    ) -> StoreResult<ServiceRecord> {
        self.gate().await?;
        self.store.set_service_status(ctx, service_id, status).await
    }

    /// Stream that forwards store events until the link goes offline
    async fn subscribe(&self) -> StoreResult<EventStream> {
        if !self.is_online() {
            return Err(StoreError::Transport("link offline".to_string()));
        }
        let mut upstream = self.store.bus.subscribe();
        let (tx, rx) = broadcast::channel(self.store.bus.capacity().max(1));
        let token = CancellationToken::new();
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(token.clone());

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = upstream.recv() => match received {
                        Ok(event) => {
                            if tx.send(event).is_err() {
                                break;
                            }
                        }
                        // Dropping the sender closes the stream; the
                        // subscriber resyncs from a snapshot
                        Err(_) => break,
                    },
                }
            }
        });
        Ok(rx)
    }

    async fn heartbeat(&self) -> StoreResult<()> {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        if !self.is_online() {
            return Err(StoreError::Transport("link offline".to_string()));
        }
        Ok(())
    }
}
