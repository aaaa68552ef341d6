//! Composition session
//!
//! One client's view of one service. The session owns canonical state (what
//! the store confirmed) and the pending mutations proposed on top of it; the
//! list the UI sees is always canonical state with every pending mutation
//! re-applied in id order.
//!
//! Every method is one synchronous turn. Nothing here performs I/O: the
//! dispatcher pulls [`Submission`]s out, talks to the store, and feeds the
//! outcomes back in. A turn that changes what observers see returns a
//! [`StateChange`] for the caller to publish once the session lock is
//! released.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use setlist_common::events::{ChangeEvent, ChangeOperation, ChangeRecord};
use setlist_common::models::{
    EntryOverrides, EntryPatch, EntryRecord, NewEntry, OverridesPatch, PositionKey, ServiceStatus,
};
use setlist_common::time::elapsed_since;
use setlist_common::{ClientId, EntryId, Error, MutationId, Result, ServiceId, SongId, UserId};

use crate::authz::CapabilitySet;
use crate::mutation::{FieldGroup, MutationOp, MutationState, OpKind, PendingMutation, PendingSet};
use crate::notify::{ChangeCause, Notice, NoticeKind, StateChange};
use crate::order::{neighbours, CanonicalState, EntryView};
use crate::position::{key_between_in_lane, lane_suffix};
use crate::store::{RequestContext, StoreError, StoreReply, StoreRequest, StoreResult};

/// Automatic resubmissions after a transport failure or timeout
pub const MAX_AUTOMATIC_RETRIES: u32 = 1;

/// Oldest notices are dropped beyond this many
const MAX_NOTICES: usize = 64;

/// Redeliveries are only tracked this far behind the newest event seen;
/// anything older falls through to the version guards
const SEEN_EVENT_HORIZON_SECS: i64 = 300;

/// Health of the event stream as the session sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Live,
    /// Incremental processing suspended until a snapshot is applied
    Resyncing { failures: u32 },
}

/// One request the dispatcher should send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Submission {
    pub mutation: MutationId,
    pub attempt: u32,
    pub request: StoreRequest,
}

enum Readiness {
    Ready(StoreRequest),
    /// Target's create is still unconfirmed
    Blocked,
    /// Target no longer exists
    Gone,
}

pub struct CompositionSession {
    service_id: ServiceId,
    client_id: ClientId,
    user_id: UserId,
    lane: String,
    capabilities: CapabilitySet,
    service_status: ServiceStatus,

    canonical: CanonicalState,
    pending: PendingSet,
    visible: Arc<Vec<EntryView>>,

    /// Temporary ids whose create is not confirmed yet
    temp_ids: HashSet<EntryId>,
    /// Confirmed temporary id -> canonical id
    aliases: HashMap<EntryId, EntryId>,
    /// Create submissions awaiting a response, by (mutation, attempt)
    inflight_creates: HashMap<(MutationId, u32), EntryId>,
    /// Cancelled while in flight; the response is dropped on arrival
    cancelled: HashSet<(MutationId, u32)>,
    /// (server timestamp, entity) of recently applied events
    seen_events: BTreeSet<(DateTime<Utc>, Uuid)>,

    next_mutation: u64,
    revision: u64,
    connection: ConnectionState,
    notices: Vec<Notice>,
    turn_notices: Vec<Notice>,
}

impl CompositionSession {
    pub fn new(
        service_id: ServiceId,
        client_id: ClientId,
        user_id: UserId,
        capabilities: CapabilitySet,
    ) -> Self {
        Self {
            service_id,
            client_id,
            user_id,
            lane: lane_suffix(client_id),
            capabilities,
            service_status: ServiceStatus::Planning,
            canonical: CanonicalState::new(),
            pending: PendingSet::new(),
            visible: Arc::new(Vec::new()),
            temp_ids: HashSet::new(),
            aliases: HashMap::new(),
            inflight_creates: HashMap::new(),
            cancelled: HashSet::new(),
            seen_events: BTreeSet::new(),
            next_mutation: 1,
            revision: 0,
            connection: ConnectionState::Live,
            notices: Vec::new(),
            turn_notices: Vec::new(),
        }
    }

    pub fn service_id(&self) -> ServiceId {
        self.service_id
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn service_status(&self) -> ServiceStatus {
        self.service_status
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn is_live(&self) -> bool {
        self.connection == ConnectionState::Live
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn canonical(&self) -> &CanonicalState {
        &self.canonical
    }

    pub fn pending(&self) -> &PendingSet {
        &self.pending
    }

    /// Visible entries in order
    pub fn ordered_entries(&self) -> Arc<Vec<EntryView>> {
        Arc::clone(&self.visible)
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    /// Clear every notice except persistent ones
    pub fn dismiss_notices(&mut self) {
        self.notices.retain(|n| n.kind.is_persistent());
    }

    pub fn request_context(&self) -> RequestContext {
        RequestContext::new(self.user_id, self.client_id)
    }

    /// Canonical id for `id`, following confirmed temporary ids
    pub fn resolve(&self, id: EntryId) -> EntryId {
        self.aliases.get(&id).copied().unwrap_or(id)
    }

    /// Songs of the confirmed entries
    pub fn confirmed_song_ids(&self) -> Vec<SongId> {
        self.canonical.ordered().iter().map(|e| e.song_id).collect()
    }

    /// Replace canonical state without touching pending mutations
    pub fn refresh(&mut self, records: Vec<EntryRecord>) -> Option<StateChange> {
        let records = records
            .into_iter()
            .filter(|r| r.service_id == self.service_id)
            .collect();
        let diff = self.canonical.replace_with_snapshot(records);
        debug!(service = %self.service_id, ?diff, "Refreshed canonical state");
        self.finish(ChangeCause::Resynced { diff }, false)
    }

    pub fn set_service_status(&mut self, status: ServiceStatus) -> Option<StateChange> {
        if self.service_status == status {
            return None;
        }
        self.service_status = status;
        info!(service = %self.service_id, %status, "Service status changed");
        self.finish(ChangeCause::ServiceStatus { status }, true)
    }

    // ------------------------------------------------------------------
    // Proposals
    // ------------------------------------------------------------------

    /// Add `song_id` right after `after` (first when `None`)
    pub fn propose_add(
        &mut self,
        song_id: SongId,
        after: Option<EntryId>,
        now: DateTime<Utc>,
    ) -> Result<(MutationId, StateChange)> {
        self.authorize(OpKind::Add)?;
        self.ensure_planning()?;
        let after = after.map(|id| self.resolve(id));

        let (lower, upper) = neighbours(&self.visible, after, None)?;
        let position = self.next_key(lower, upper)?;
        let target = EntryId::new();
        self.temp_ids.insert(target);

        let op = MutationOp::Add {
            song_id,
            position,
            overrides: EntryOverrides::default(),
        };
        Ok(self.record_proposal(target, op, now))
    }

    /// Move `entry` right after `after` (first when `None`)
    pub fn propose_move(
        &mut self,
        entry: EntryId,
        after: Option<EntryId>,
        now: DateTime<Utc>,
    ) -> Result<(MutationId, StateChange)> {
        self.authorize(OpKind::Move)?;
        self.ensure_planning()?;
        let entry = self.resolve(entry);
        let after = after.map(|id| self.resolve(id));
        self.ensure_visible(entry)?;
        if after == Some(entry) {
            return Err(Error::Validation(format!(
                "cannot move entry {} after itself",
                entry
            )));
        }

        let (lower, upper) = neighbours(&self.visible, after, Some(entry))?;
        let position = self.next_key(lower, upper)?;
        Ok(self.record_proposal(entry, MutationOp::Move { position }, now))
    }

    pub fn propose_remove(
        &mut self,
        entry: EntryId,
        now: DateTime<Utc>,
    ) -> Result<(MutationId, StateChange)> {
        self.authorize(OpKind::Remove)?;
        self.ensure_planning()?;
        let entry = self.resolve(entry);
        self.ensure_visible(entry)?;

        // An add that never left this client cancels out with the remove
        let unsent_add = self
            .pending
            .in_slot(entry, FieldGroup::Presence)
            .filter(|m| m.op.is_add() && !m.is_in_flight())
            .map(|m| m.id);
        if let Some(add) = unsent_add {
            let id = self.next_mutation_id();
            self.abandon_temp(entry);
            debug!(mutation = %id, %add, entry = %entry, "Remove cancelled unsent add");
            return Ok((id, self.finish_forced(ChangeCause::Proposed { mutation: id })));
        }

        // Unsent moves and edits of a removed entry are pointless
        for id in self.pending.on_target(entry) {
            let droppable = self
                .pending
                .get(id)
                .map(|m| m.group() != FieldGroup::Presence && !m.is_in_flight())
                .unwrap_or(false);
            if droppable {
                self.pending.remove(id);
            }
        }

        Ok(self.record_proposal(entry, MutationOp::Remove, now))
    }

    pub fn propose_edit(
        &mut self,
        entry: EntryId,
        patch: OverridesPatch,
        now: DateTime<Utc>,
    ) -> Result<(MutationId, StateChange)> {
        self.authorize(OpKind::Edit)?;
        self.ensure_planning()?;
        if patch.is_empty() {
            return Err(Error::Validation("override patch is empty".to_string()));
        }
        let entry = self.resolve(entry);
        self.ensure_visible(entry)?;
        Ok(self.record_proposal(entry, MutationOp::Edit { patch }, now))
    }

    /// Withdraw a pending mutation; its in-flight response will be ignored
    ///
    /// If the store applies it anyway, the change arrives like any other
    /// remote change on the event stream.
    pub fn cancel(&mut self, mutation: MutationId) -> Option<StateChange> {
        let removed = self.rollback(mutation)?;
        if let MutationState::InFlight { attempt } = removed.state {
            self.cancelled.insert((mutation, attempt));
        }
        info!(%mutation, "Cancelled mutation");
        Some(self.finish_forced(ChangeCause::Cancelled { mutation }))
    }

    fn authorize(&self, kind: OpKind) -> Result<()> {
        self.capabilities.authorize(kind.required_capability())
    }

    fn ensure_planning(&self) -> Result<()> {
        if self.service_status == ServiceStatus::Completed {
            return Err(Error::Validation(format!(
                "service {} is completed",
                self.service_id
            )));
        }
        Ok(())
    }

    fn ensure_visible(&self, entry: EntryId) -> Result<()> {
        if self.visible.iter().any(|e| e.id == entry) {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "entry {} is not in the service",
                entry
            )))
        }
    }

    fn next_mutation_id(&mut self) -> MutationId {
        let id = MutationId(self.next_mutation);
        self.next_mutation += 1;
        id
    }

    /// Fresh key in this client's lane inside (lower, upper)
    ///
    /// Keys of confirmed entries are bounds of every gap they border, so only
    /// keys still held by pending mutations can collide.
    fn next_key(
        &self,
        lower: Option<PositionKey>,
        mut upper: Option<PositionKey>,
    ) -> Result<PositionKey> {
        loop {
            let key = key_between_in_lane(lower.as_ref(), upper.as_ref(), &self.lane)?;
            let taken = self.pending.iter().any(|m| m.op.position() == Some(&key));
            if !taken {
                return Ok(key);
            }
            // Held by a pending mutation; go deeper into the gap
            upper = Some(key);
        }
    }

    fn record_proposal(
        &mut self,
        target: EntryId,
        op: MutationOp,
        now: DateTime<Utc>,
    ) -> (MutationId, StateChange) {
        let superseded = self.pending.supersede(target, op.group());
        let op = match (op, superseded.predecessor().map(|p| &p.op)) {
            (MutationOp::Edit { patch }, Some(MutationOp::Edit { patch: earlier })) => {
                MutationOp::Edit {
                    patch: earlier.merged_with(&patch),
                }
            }
            (op, _) => op,
        };

        let id = self.next_mutation_id();
        let mut mutation = PendingMutation::new(id, target, op, now);
        mutation.state = superseded
            .inherited_state()
            .unwrap_or_else(|| self.initial_state(&mutation));
        if let Some(prev) = superseded.predecessor() {
            debug!(%id, superseded = %prev.id, "Coalesced with earlier proposal");
        }
        debug!(
            %id,
            op = mutation.op.name(),
            entry = %target,
            state = ?mutation.state,
            "Proposed mutation"
        );
        self.pending.insert(mutation);
        (id, self.finish_forced(ChangeCause::Proposed { mutation: id }))
    }

    fn initial_state(&self, mutation: &PendingMutation) -> MutationState {
        if !mutation.op.is_add() && self.temp_ids.contains(&mutation.target) {
            MutationState::Blocked
        } else {
            MutationState::Queued
        }
    }

    // ------------------------------------------------------------------
    // Submission and responses
    // ------------------------------------------------------------------

    /// Mark every ready mutation in flight and return the requests to send
    pub fn take_submittable(&mut self) -> Vec<Submission> {
        if !self.is_live() {
            return Vec::new();
        }

        let mut submissions = Vec::new();
        let mut gone = Vec::new();
        for id in self.pending.ids() {
            let Some(mutation) = self.pending.get(id) else {
                continue;
            };
            if mutation.state != MutationState::Queued {
                continue;
            }
            match self.readiness(mutation) {
                Readiness::Ready(request) => {
                    if let Some(mutation) = self.pending.get_mut(id) {
                        mutation.attempts += 1;
                        let attempt = mutation.attempts;
                        mutation.state = MutationState::InFlight { attempt };
                        if let StoreRequest::Create(entry) = &request {
                            self.inflight_creates.insert((id, attempt), entry.client_ref);
                        }
                        submissions.push(Submission {
                            mutation: id,
                            attempt,
                            request,
                        });
                    }
                }
                Readiness::Blocked => {
                    if let Some(mutation) = self.pending.get_mut(id) {
                        mutation.state = MutationState::Blocked;
                    }
                }
                Readiness::Gone => gone.push(id),
            }
        }

        if !gone.is_empty() {
            for id in gone {
                if let Some(mutation) = self.pending.remove(id) {
                    if self.temp_ids.contains(&mutation.target) && !self.create_outstanding(mutation.target) {
                        self.temp_ids.remove(&mutation.target);
                    }
                    debug!(%id, entry = %mutation.target, "Dropped mutation on vanished entry");
                }
            }
            self.recompute();
        }
        submissions
    }

    fn readiness(&self, mutation: &PendingMutation) -> Readiness {
        let target = mutation.target;
        if let MutationOp::Add {
            song_id,
            position,
            overrides,
        } = &mutation.op
        {
            return Readiness::Ready(StoreRequest::Create(NewEntry {
                service_id: self.service_id,
                song_id: *song_id,
                position: position.clone(),
                overrides: overrides.clone(),
                client_ref: target,
            }));
        }

        if self.temp_ids.contains(&target) {
            return if self.create_outstanding(target) {
                Readiness::Blocked
            } else {
                Readiness::Gone
            };
        }
        if self.canonical.is_deleted(&target) {
            return Readiness::Gone;
        }

        let request = match &mutation.op {
            MutationOp::Move { position } => StoreRequest::Update {
                id: target,
                patch: EntryPatch {
                    position: Some(position.clone()),
                    overrides: OverridesPatch::default(),
                },
                expected_version: None,
            },
            MutationOp::Edit { patch } => StoreRequest::Update {
                id: target,
                patch: EntryPatch {
                    position: None,
                    overrides: patch.clone(),
                },
                expected_version: self.canonical.get(&target).map(|r| r.version),
            },
            MutationOp::Remove => StoreRequest::Delete { id: target },
            MutationOp::Add { .. } => return Readiness::Gone,
        };
        Readiness::Ready(request)
    }

    /// Some create for `temp` is pending or awaiting a response
    fn create_outstanding(&self, temp: EntryId) -> bool {
        self.inflight_creates.values().any(|t| *t == temp)
            || self
                .pending
                .in_slot(temp, FieldGroup::Presence)
                .map(|m| m.op.is_add())
                .unwrap_or(false)
    }

    /// Feed back the outcome of one submission
    pub fn on_response(
        &mut self,
        mutation: MutationId,
        attempt: u32,
        result: StoreResult<StoreReply>,
        now: DateTime<Utc>,
    ) -> Option<StateChange> {
        let create_for = self.inflight_creates.remove(&(mutation, attempt));
        if self.cancelled.remove(&(mutation, attempt)) {
            debug!(%mutation, attempt, ok = result.is_ok(), "Ignoring response to cancelled mutation");
            self.release_waiters(mutation);
            return None;
        }
        let awaited = self
            .pending
            .get(mutation)
            .map(|m| m.awaits(attempt))
            .unwrap_or(false);

        let mut cause = None;
        match result {
            Ok(reply) => {
                if let Some(resolved) = self.pending.get(mutation) {
                    debug!(%mutation, attempt, op = resolved.op.name(), "Confirmed");
                }
                self.absorb_reply(reply);
                self.pending.remove(mutation);
                cause = Some(ChangeCause::Confirmed { mutation });
            }
            Err(err) if awaited => {
                cause = self.handle_failure(mutation, err, now);
            }
            Err(err) => {
                debug!(%mutation, attempt, error = %err, "Ignoring failure of superseded submission");
            }
        }

        // A superseded create failed and nothing else will create its entry
        if let Some(temp) = create_for {
            if self.temp_ids.contains(&temp) && !self.create_outstanding(temp) {
                self.abandon_temp(temp);
                cause.get_or_insert(ChangeCause::RolledBack { mutation });
            }
        }

        self.release_waiters(mutation);

        let cause = cause?;
        self.finish(cause, true)
    }

    /// Successors queued behind `predecessor` may now be submitted
    fn release_waiters(&mut self, predecessor: MutationId) {
        for waiter in self.pending.waiting_on(predecessor) {
            if let Some(next) = self.pending.get(waiter).cloned() {
                let state = self.initial_state(&next);
                if let Some(m) = self.pending.get_mut(waiter) {
                    m.state = state;
                }
            }
        }
    }

    fn handle_failure(
        &mut self,
        mutation: MutationId,
        err: StoreError,
        now: DateTime<Utc>,
    ) -> Option<ChangeCause> {
        let live = self.is_live();
        let pending = self.pending.get_mut(mutation)?;
        let target = pending.target;
        let op_name = pending.op.name();

        match err {
            _ if err.is_transient() && !live => {
                // Reissued or rolled back by the resync
                pending.state = MutationState::Queued;
                debug!(%mutation, error = %err, "Submission failed while resyncing");
                None
            }
            _ if err.is_transient() && pending.retries < MAX_AUTOMATIC_RETRIES => {
                pending.retries += 1;
                pending.state = MutationState::Queued;
                warn!(%mutation, op = op_name, error = %err, "Submission failed, retrying");
                None
            }
            StoreError::Transport(_) | StoreError::Timeout => {
                self.rollback(mutation);
                self.raise(
                    NoticeKind::RetryAvailable,
                    Some(mutation),
                    Some(target),
                    format!("Could not reach the server to {} the entry", op_name),
                    now,
                );
                Some(ChangeCause::RolledBack { mutation })
            }
            StoreError::PermissionDenied(reason) => {
                self.rollback(mutation);
                self.raise(
                    NoticeKind::Blocked,
                    Some(mutation),
                    Some(target),
                    format!("Not allowed: {}", reason),
                    now,
                );
                Some(ChangeCause::RolledBack { mutation })
            }
            StoreError::Conflict { current } => {
                self.rollback(mutation);
                self.absorb_record(current);
                self.raise(
                    NoticeKind::Conflict,
                    Some(mutation),
                    Some(target),
                    "Someone else changed this entry first".to_string(),
                    now,
                );
                Some(ChangeCause::RolledBack { mutation })
            }
            StoreError::NotFound(_) if matches!(pending.op, MutationOp::Remove) => {
                // Already gone is as good as deleted
                self.pending.remove(mutation);
                self.canonical.remove(target, u64::MAX);
                Some(ChangeCause::Confirmed { mutation })
            }
            StoreError::NotFound(what) => {
                let rolled_back = self.rollback(mutation);
                let removing = self
                    .pending
                    .in_slot(target, FieldGroup::Presence)
                    .map(|m| matches!(m.op, MutationOp::Remove))
                    .unwrap_or(false);
                if !rolled_back.map(|m| m.op.is_add()).unwrap_or(false) {
                    self.canonical.remove(target, u64::MAX);
                }
                if !removing {
                    self.raise(
                        NoticeKind::Stale,
                        Some(mutation),
                        Some(target),
                        format!("Entry no longer exists ({})", what),
                        now,
                    );
                }
                Some(ChangeCause::RolledBack { mutation })
            }
        }
    }

    /// Remove a pending mutation; a rolled back add takes its dependents along
    fn rollback(&mut self, mutation: MutationId) -> Option<PendingMutation> {
        let removed = self.pending.remove(mutation)?;
        if removed.op.is_add() {
            self.abandon_temp(removed.target);
        }
        warn!(%mutation, op = removed.op.name(), entry = %removed.target, "Rolled back");
        Some(removed)
    }

    /// Forget a temporary entry and everything proposed against it
    fn abandon_temp(&mut self, temp: EntryId) {
        for id in self.pending.on_target(temp) {
            self.pending.remove(id);
        }
        self.temp_ids.remove(&temp);
    }

    fn absorb_reply(&mut self, reply: StoreReply) {
        match reply {
            StoreReply::Record(record) => {
                self.absorb_record(record);
            }
            StoreReply::Deleted(ack) => {
                self.canonical.remove(ack.id, ack.version);
            }
        }
    }

    /// Merge a store record, mapping our own temporary id first
    fn absorb_record(&mut self, record: EntryRecord) {
        if record.service_id != self.service_id {
            return;
        }
        if let Some(origin) = record.origin.filter(|o| o.client == self.client_id) {
            if let Some(temp) = origin.client_ref {
                if self.temp_ids.contains(&temp) {
                    self.alias(temp, record.id);
                }
            }
        }
        let id = record.id;
        let outcome = self.canonical.merge(record);
        if outcome.changed() {
            debug!(entry = %id, ?outcome, "Merged record");
        } else {
            debug!(entry = %id, ?outcome, "Kept held record");
        }
    }

    fn alias(&mut self, temp: EntryId, canonical: EntryId) {
        self.temp_ids.remove(&temp);
        self.aliases.insert(temp, canonical);
        for id in self.pending.retarget(temp, canonical) {
            if let Some(m) = self.pending.get_mut(id) {
                if m.state == MutationState::Blocked {
                    m.state = MutationState::Queued;
                }
            }
        }
        debug!(%temp, %canonical, "Mapped temporary id");
    }

    // ------------------------------------------------------------------
    // Change events
    // ------------------------------------------------------------------

    /// Merge one broadcast change
    pub fn apply_event(&mut self, event: ChangeEvent, now: DateTime<Utc>) -> Option<StateChange> {
        if event.service_id() != self.service_id {
            return None;
        }
        if !self.first_delivery(&event) {
            debug!(entity = %event.entity_id(), "Duplicate event ignored");
            return None;
        }

        let ChangeEvent {
            operation, record, ..
        } = event;
        let record = match record {
            ChangeRecord::Service(service) => return self.set_service_status(service.status),
            ChangeRecord::Entry(record) => record,
        };

        let resolved = record
            .origin
            .filter(|o| o.client == self.client_id)
            .map(|o| o.mutation)
            .filter(|m| self.pending.contains(*m));

        match operation {
            ChangeOperation::Delete => {
                let id = record.id;
                self.canonical.remove(id, record.version);
                let mut lost_edit = false;
                for pending_id in self.pending.on_target(id) {
                    if let Some(dropped) = self.pending.remove(pending_id) {
                        lost_edit |= Some(pending_id) != resolved
                            && !matches!(dropped.op, MutationOp::Remove);
                    }
                }
                if lost_edit && resolved.is_none() {
                    self.raise(
                        NoticeKind::Stale,
                        None,
                        Some(id),
                        "Entry was removed by someone else".to_string(),
                        now,
                    );
                }
            }
            ChangeOperation::Create | ChangeOperation::Update => {
                self.absorb_record(record);
                if let Some(mutation) = resolved {
                    self.pending.remove(mutation);
                }
            }
        }

        match resolved {
            Some(mutation) => self.finish(ChangeCause::Confirmed { mutation }, true),
            None => self.finish(ChangeCause::Remote, false),
        }
    }

    /// Record an event as seen; false if it was already applied
    ///
    /// Keys more than [`SEEN_EVENT_HORIZON_SECS`] behind the newest event are
    /// forgotten.
    fn first_delivery(&mut self, event: &ChangeEvent) -> bool {
        let (entity, timestamp) = event.dedup_key();
        if !self.seen_events.insert((timestamp, entity)) {
            return false;
        }
        if let Some(&(newest, _)) = self.seen_events.last() {
            let horizon = newest - chrono::Duration::seconds(SEEN_EVENT_HORIZON_SECS);
            while self
                .seen_events
                .first()
                .map(|(t, _)| *t < horizon)
                .unwrap_or(false)
            {
                self.seen_events.pop_first();
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Connection health
    // ------------------------------------------------------------------

    /// Suspend incremental processing until the next resync
    pub fn mark_connection_lost(&mut self, cause: &Error) -> bool {
        if self.connection != ConnectionState::Live {
            return false;
        }
        self.connection = ConnectionState::Resyncing { failures: 0 };
        warn!(service = %self.service_id, error = %cause, "Connection lost, resyncing");
        true
    }

    /// Count a failed resync; raises a persistent notice once `banner_after`
    /// attempts have failed
    pub fn note_resync_failure(&mut self, banner_after: u32, now: DateTime<Utc>) -> Option<StateChange> {
        let ConnectionState::Resyncing { failures } = self.connection else {
            return None;
        };
        let failures = failures + 1;
        self.connection = ConnectionState::Resyncing { failures };
        let raised = self.notices.iter().any(|n| n.kind == NoticeKind::ResyncFailing);
        if failures < banner_after || raised {
            return None;
        }
        self.raise(
            NoticeKind::ResyncFailing,
            None,
            None,
            format!("Still reconnecting after {} attempts", failures),
            now,
        );
        Some(self.finish_forced(ChangeCause::Connection))
    }

    /// Replace canonical state with a snapshot and settle pending mutations
    ///
    /// Pending mutations younger than `retry_budget` are resubmitted once;
    /// older ones, and ones already resubmitted, are rolled back.
    pub fn resync(
        &mut self,
        snapshot: Vec<EntryRecord>,
        now: DateTime<Utc>,
        retry_budget: Duration,
    ) -> StateChange {
        let snapshot: Vec<EntryRecord> = snapshot
            .into_iter()
            .filter(|r| r.service_id == self.service_id)
            .collect();

        // Own writes that landed while we were not listening
        for record in &snapshot {
            let Some(origin) = record.origin.filter(|o| o.client == self.client_id) else {
                continue;
            };
            if let Some(temp) = origin.client_ref.filter(|t| self.temp_ids.contains(t)) {
                self.alias(temp, record.id);
            }
            if self.pending.remove(origin.mutation).is_some() {
                debug!(mutation = %origin.mutation, "Mutation landed before resync");
            }
        }

        let diff = self.canonical.replace_with_snapshot(snapshot);

        let mut reissued = 0;
        let mut rolled_back = 0;
        for id in self.pending.ids() {
            let Some(mutation) = self.pending.get(id).cloned() else {
                continue;
            };

            let vanished = !mutation.op.is_add()
                && !self.temp_ids.contains(&mutation.target)
                && !self.canonical.contains(&mutation.target);
            if vanished {
                self.pending.remove(id);
                if !matches!(mutation.op, MutationOp::Remove) {
                    self.raise(
                        NoticeKind::Stale,
                        Some(id),
                        Some(mutation.target),
                        "Entry was removed while offline".to_string(),
                        now,
                    );
                }
                continue;
            }

            let young = elapsed_since(mutation.proposed_at, now) < retry_budget;
            if young && !mutation.reissued {
                let state = self.initial_state(&mutation);
                if let Some(m) = self.pending.get_mut(id) {
                    m.reissued = true;
                    m.retries = 0;
                    m.state = state;
                }
                reissued += 1;
            } else {
                self.rollback(id);
                self.raise(
                    NoticeKind::ManualRetry,
                    Some(id),
                    Some(mutation.target),
                    format!("Could not {} the entry while offline; try again", mutation.op.name()),
                    now,
                );
                rolled_back += 1;
            }
        }

        self.connection = ConnectionState::Live;
        self.notices.retain(|n| n.kind != NoticeKind::ResyncFailing);
        info!(
            service = %self.service_id,
            added = diff.added,
            removed = diff.removed,
            changed = diff.changed,
            reissued,
            rolled_back,
            "Resynced"
        );
        self.finish_forced(ChangeCause::Resynced { diff })
    }

    // ------------------------------------------------------------------
    // Turn bookkeeping
    // ------------------------------------------------------------------

    fn raise(
        &mut self,
        kind: NoticeKind,
        mutation: Option<MutationId>,
        entry: Option<EntryId>,
        message: String,
        now: DateTime<Utc>,
    ) {
        let notice = Notice {
            kind,
            mutation,
            entry,
            message,
            raised_at: now,
        };
        self.notices.push(notice.clone());
        if self.notices.len() > MAX_NOTICES {
            let excess = self.notices.len() - MAX_NOTICES;
            self.notices.drain(..excess);
        }
        self.turn_notices.push(notice);
    }

    fn recompute(&mut self) {
        let mut entries: HashMap<EntryId, EntryView> = self
            .canonical
            .records()
            .map(|r| (r.id, EntryView::from_record(r)))
            .collect();
        for mutation in self.pending.iter() {
            mutation.op.apply(mutation.target, &mut entries);
        }
        let mut ordered: Vec<EntryView> = entries.into_values().collect();
        crate::order::sort_entries(&mut ordered);
        self.visible = Arc::new(ordered);
    }

    fn finish_forced(&mut self, cause: ChangeCause) -> StateChange {
        self.recompute();
        self.revision += 1;
        StateChange {
            revision: self.revision,
            cause,
            entries: Arc::clone(&self.visible),
            notices: std::mem::take(&mut self.turn_notices),
        }
    }

    /// End a turn; unforced turns that changed nothing visible report nothing
    fn finish(&mut self, cause: ChangeCause, force: bool) -> Option<StateChange> {
        let before = Arc::clone(&self.visible);
        self.recompute();
        if !force && self.turn_notices.is_empty() && *before == *self.visible {
            return None;
        }
        self.revision += 1;
        Some(StateChange {
            revision: self.revision,
            cause,
            entries: Arc::clone(&self.visible),
            notices: std::mem::take(&mut self.turn_notices),
        })
    }
}
