//! Setlist composer
//!
//! Cloneable handle to one composition session. UI code calls the propose
//! methods and subscribes to state changes; the dispatcher drives store
//! traffic through the crate-private methods below.
//!
//! The session lock is only held for one synchronous turn and never across
//! an `.await`. Observers are notified after the lock is released, under a
//! delivery lock taken before it, so they see changes in revision order.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;

use setlist_common::config::ComposerConfig;
use setlist_common::events::ChangeEvent;
use setlist_common::models::{
    Capability, EntryRecord, OverridesPatch, ServiceRecord, ServiceStatus,
};
use setlist_common::time;
use setlist_common::{ClientId, EntryId, Error, MutationId, Result, ServiceId, SongId};

use crate::authz::resolve_capabilities;
use crate::availability::{Availability, AvailabilityPolicy};
use crate::identity::IdentityProvider;
use crate::notify::{Notice, Notifier, StateChange, Subscription};
use crate::order::EntryView;
use crate::session::{CompositionSession, ConnectionState, Submission};
use crate::store::{BackingStore, RequestContext, StoreReply, StoreResult};
use crate::usage::UsageLedger;

/// Usage ledger shared by every composer of a tenant
pub type SharedLedger = Arc<Mutex<UsageLedger>>;

#[derive(Clone)]
pub struct Composer {
    session: Arc<Mutex<CompositionSession>>,
    /// Held from the end of a turn until its change is delivered
    delivery: Arc<Mutex<()>>,
    notifier: Notifier,
    wake: Arc<Notify>,
    policy: AvailabilityPolicy,
    ledger: SharedLedger,
}

impl Composer {
    /// Open a session on `service` for the current user
    ///
    /// Resolves the user's capabilities in the service's tenant and loads the
    /// current entries. The composer starts with an empty usage ledger; see
    /// [`Composer::with_ledger`].
    pub async fn connect(
        identity: &dyn IdentityProvider,
        store: &dyn BackingStore,
        service: &ServiceRecord,
        client_id: ClientId,
        config: &ComposerConfig,
    ) -> Result<Self> {
        let user = identity.current_user().await?;
        let capabilities = resolve_capabilities(identity, service.tenant_id).await?;
        capabilities.authorize(Capability::ServiceView)?;

        let ctx = RequestContext::new(user, client_id);
        let records = store.fetch_entries(&ctx, service.id).await?;

        let mut session = CompositionSession::new(service.id, client_id, user, capabilities);
        session.set_service_status(service.status);
        session.refresh(records);

        info!(
            service = %service.id,
            client = %client_id,
            user = %user,
            entries = session.ordered_entries().len(),
            "Composer connected"
        );

        Ok(Self {
            session: Arc::new(Mutex::new(session)),
            delivery: Arc::new(Mutex::new(())),
            notifier: Notifier::new(),
            wake: Arc::new(Notify::new()),
            policy: AvailabilityPolicy::from(&config.availability),
            ledger: Arc::new(Mutex::new(UsageLedger::new())),
        })
    }

    /// Share a usage ledger with other composers
    pub fn with_ledger(mut self, ledger: SharedLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn ledger(&self) -> SharedLedger {
        Arc::clone(&self.ledger)
    }

    fn lock(&self) -> MutexGuard<'_, CompositionSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run one session turn, then publish its change and wake the dispatcher
    fn turn<T>(&self, f: impl FnOnce(&mut CompositionSession) -> (T, Option<StateChange>)) -> T {
        let mut session = self.lock();
        let (value, change) = f(&mut *session);
        if let Some(change) = change {
            let delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
            drop(session);
            self.notifier.notify(&change);
            drop(delivery);
        } else {
            drop(session);
        }
        self.wake.notify_one();
        value
    }

    fn propose(
        &self,
        f: impl FnOnce(&mut CompositionSession) -> Result<(MutationId, StateChange)>,
    ) -> Result<MutationId> {
        self.turn(|session| match f(session) {
            Ok((mutation, change)) => (Ok(mutation), Some(change)),
            Err(err) => (Err(err), None),
        })
    }

    // ------------------------------------------------------------------
    // UI surface
    // ------------------------------------------------------------------

    pub fn service_id(&self) -> ServiceId {
        self.lock().service_id()
    }

    pub fn client_id(&self) -> ClientId {
        self.lock().client_id()
    }

    /// Visible entries in order
    pub fn ordered_entries(&self) -> Vec<EntryView> {
        self.lock().ordered_entries().as_ref().clone()
    }

    pub fn propose_add(&self, song_id: SongId, after: Option<EntryId>) -> Result<MutationId> {
        self.propose(|s| s.propose_add(song_id, after, time::now()))
    }

    pub fn propose_move(&self, entry: EntryId, after: Option<EntryId>) -> Result<MutationId> {
        self.propose(|s| s.propose_move(entry, after, time::now()))
    }

    pub fn propose_remove(&self, entry: EntryId) -> Result<MutationId> {
        self.propose(|s| s.propose_remove(entry, time::now()))
    }

    pub fn propose_edit(&self, entry: EntryId, patch: OverridesPatch) -> Result<MutationId> {
        self.propose(|s| s.propose_edit(entry, patch, time::now()))
    }

    /// Withdraw a pending mutation; false if it was no longer pending
    pub fn cancel(&self, mutation: MutationId) -> bool {
        self.turn(|s| {
            let change = s.cancel(mutation);
            (change.is_some(), change)
        })
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&StateChange) + Send + Sync + 'static,
    {
        self.notifier.subscribe(callback)
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.lock().notices().to_vec()
    }

    pub fn dismiss_notices(&self) {
        self.lock().dismiss_notices();
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending().len()
    }

    pub fn connection(&self) -> ConnectionState {
        self.lock().connection()
    }

    pub fn service_status(&self) -> ServiceStatus {
        self.lock().service_status()
    }

    /// Canonical id for an id returned by an earlier add
    pub fn resolve(&self, entry: EntryId) -> EntryId {
        self.lock().resolve(entry)
    }

    /// Availability of `song_id` at `now`
    pub fn availability_for(&self, song_id: SongId, now: DateTime<Utc>) -> Availability {
        let ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        self.policy.evaluate(ledger.history(song_id), now)
    }

    /// Mark the service completed and record its songs in the usage ledger
    pub async fn complete_service(
        &self,
        store: &dyn BackingStore,
        completed_at: DateTime<Utc>,
    ) -> Result<ServiceRecord> {
        let (ctx, service_id) = {
            let session = self.lock();
            session.capabilities().authorize(Capability::ServiceComplete)?;
            (session.request_context(), session.service_id())
        };

        let record = store
            .set_service_status(&ctx, service_id, ServiceStatus::Completed)
            .await?;

        let songs = self.turn(|s| {
            let change = s.set_service_status(ServiceStatus::Completed);
            (s.confirmed_song_ids(), change)
        });
        let recorded = self
            .ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record_completed_service(service_id, completed_at, songs);

        info!(service = %service_id, recorded, "Service completed");
        Ok(record)
    }

    // ------------------------------------------------------------------
    // Dispatcher surface
    // ------------------------------------------------------------------

    pub(crate) fn wake_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.wake)
    }

    pub(crate) fn request_context(&self) -> RequestContext {
        self.lock().request_context()
    }

    pub(crate) fn is_live(&self) -> bool {
        self.lock().is_live()
    }

    pub(crate) fn take_submittable(&self) -> (RequestContext, Vec<Submission>) {
        let mut session = self.lock();
        let ctx = session.request_context();
        (ctx, session.take_submittable())
    }

    pub(crate) fn complete(&self, mutation: MutationId, attempt: u32, result: StoreResult<StoreReply>) {
        self.turn(|s| ((), s.on_response(mutation, attempt, result, time::now())));
    }

    pub(crate) fn apply_event(&self, event: ChangeEvent) {
        self.turn(|s| ((), s.apply_event(event, time::now())));
    }

    pub(crate) fn refresh(&self, records: Vec<EntryRecord>) {
        self.turn(|s| ((), s.refresh(records)));
    }

    pub(crate) fn resync(&self, snapshot: Vec<EntryRecord>, retry_budget: Duration) {
        self.turn(|s| ((), Some(s.resync(snapshot, time::now(), retry_budget))));
    }

    pub(crate) fn mark_connection_lost(&self, cause: &Error) -> bool {
        self.lock().mark_connection_lost(cause)
    }

    pub(crate) fn note_resync_failure(&self, banner_after: u32) {
        self.turn(|s| ((), s.note_resync_failure(banner_after, time::now())));
    }
}
