//! Pending optimistic mutations
//!
//! A pending mutation is a local change the store has not confirmed yet.
//! At most one is pending per (entry, field group); proposing another on the
//! same slot supersedes the first. The visible list is recomputed from
//! canonical state plus every pending mutation in id order, so removing one
//! mutation reverts exactly its own effect.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use setlist_common::models::{Capability, EntryOverrides, OverridesPatch, PositionKey};
use setlist_common::{EntryId, MutationId, SongId};

use crate::order::EntryView;

/// Independently mergeable part of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldGroup {
    /// Existence of the entry (add/remove)
    Presence,
    Position,
    Overrides,
}

/// Kind of change, known before its payload is computed
///
/// The capability table lives here so the local gate and the store check
/// the same thing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Add,
    Move,
    Remove,
    Edit,
}

impl OpKind {
    pub fn required_capability(self) -> Capability {
        match self {
            OpKind::Add | OpKind::Remove => Capability::ServiceEdit,
            OpKind::Move => Capability::ServiceArrange,
            OpKind::Edit => Capability::EntryAnnotate,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OpKind::Add => "add",
            OpKind::Move => "move",
            OpKind::Remove => "remove",
            OpKind::Edit => "edit",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum MutationOp {
    Add {
        song_id: SongId,
        position: PositionKey,
        overrides: EntryOverrides,
    },
    Move {
        position: PositionKey,
    },
    Remove,
    Edit {
        patch: OverridesPatch,
    },
}

impl MutationOp {
    pub fn group(&self) -> FieldGroup {
        match self {
            MutationOp::Add { .. } | MutationOp::Remove => FieldGroup::Presence,
            MutationOp::Move { .. } => FieldGroup::Position,
            MutationOp::Edit { .. } => FieldGroup::Overrides,
        }
    }

    pub fn kind(&self) -> OpKind {
        match self {
            MutationOp::Add { .. } => OpKind::Add,
            MutationOp::Move { .. } => OpKind::Move,
            MutationOp::Remove => OpKind::Remove,
            MutationOp::Edit { .. } => OpKind::Edit,
        }
    }

    pub fn required_capability(&self) -> Capability {
        self.kind().required_capability()
    }

    pub fn is_add(&self) -> bool {
        matches!(self, MutationOp::Add { .. })
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Position key this op places its entry at
    pub fn position(&self) -> Option<&PositionKey> {
        match self {
            MutationOp::Add { position, .. } | MutationOp::Move { position } => Some(position),
            MutationOp::Remove | MutationOp::Edit { .. } => None,
        }
    }

    /// Apply to a visible entry map
    pub(crate) fn apply(&self, target: EntryId, entries: &mut HashMap<EntryId, EntryView>) {
        match self {
            MutationOp::Add {
                song_id,
                position,
                overrides,
            } => {
                entries.entry(target).or_insert_with(|| EntryView {
                    id: target,
                    song_id: *song_id,
                    position: position.clone(),
                    overrides: overrides.clone(),
                    pending: true,
                    confirmed: false,
                });
            }
            MutationOp::Move { position } => {
                if let Some(entry) = entries.get_mut(&target) {
                    entry.position = position.clone();
                    entry.pending = true;
                }
            }
            MutationOp::Remove => {
                entries.remove(&target);
            }
            MutationOp::Edit { patch } => {
                if let Some(entry) = entries.get_mut(&target) {
                    patch.apply(&mut entry.overrides);
                    entry.pending = true;
                }
            }
        }
    }
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Submission state of a pending mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MutationState {
    /// Ready to submit
    Queued,
    /// Target is an entry whose create is not confirmed yet
    Blocked,
    /// A superseded predecessor on the same slot is still in flight
    Waiting { on: MutationId },
    InFlight { attempt: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingMutation {
    pub id: MutationId,
    pub target: EntryId,
    pub op: MutationOp,
    pub proposed_at: DateTime<Utc>,
    pub state: MutationState,
    /// Submissions made so far; the latest one is the awaited attempt
    pub attempts: u32,
    /// Automatic resubmissions spent since the last reissue
    pub retries: u32,
    /// Already resubmitted once after a resync
    pub reissued: bool,
}

impl PendingMutation {
    pub fn new(id: MutationId, target: EntryId, op: MutationOp, proposed_at: DateTime<Utc>) -> Self {
        Self {
            id,
            target,
            op,
            proposed_at,
            state: MutationState::Queued,
            attempts: 0,
            retries: 0,
            reissued: false,
        }
    }

    pub fn group(&self) -> FieldGroup {
        self.op.group()
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.state, MutationState::InFlight { .. })
    }

    /// Whether `attempt` is the submission currently awaited
    pub fn awaits(&self, attempt: u32) -> bool {
        self.state == MutationState::InFlight { attempt }
    }
}

/// What superseding a slot left behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Superseded {
    /// Slot was free
    Nothing,
    /// Predecessor was never submitted and is gone
    Dropped(PendingMutation),
    /// Predecessor is still awaiting the store; the successor must wait
    InFlight(PendingMutation),
}

impl Superseded {
    /// State the successor should start in, if constrained by its predecessor
    pub fn inherited_state(&self) -> Option<MutationState> {
        match self {
            Superseded::Nothing => None,
            Superseded::InFlight(prev) => Some(MutationState::Waiting { on: prev.id }),
            Superseded::Dropped(prev) => match prev.state {
                MutationState::Waiting { on } => Some(MutationState::Waiting { on }),
                _ => None,
            },
        }
    }

    pub fn predecessor(&self) -> Option<&PendingMutation> {
        match self {
            Superseded::Nothing => None,
            Superseded::Dropped(prev) | Superseded::InFlight(prev) => Some(prev),
        }
    }
}

/// Pending mutations in submission order, indexed by slot
#[derive(Debug, Default)]
pub struct PendingSet {
    by_id: BTreeMap<MutationId, PendingMutation>,
    by_slot: HashMap<(EntryId, FieldGroup), MutationId>,
}

impl PendingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get(&self, id: MutationId) -> Option<&PendingMutation> {
        self.by_id.get(&id)
    }

    pub fn get_mut(&mut self, id: MutationId) -> Option<&mut PendingMutation> {
        self.by_id.get_mut(&id)
    }

    pub fn contains(&self, id: MutationId) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn in_slot(&self, target: EntryId, group: FieldGroup) -> Option<&PendingMutation> {
        self.by_slot
            .get(&(target, group))
            .and_then(|id| self.by_id.get(id))
    }

    /// In submission order
    pub fn iter(&self) -> impl Iterator<Item = &PendingMutation> {
        self.by_id.values()
    }

    pub fn ids(&self) -> Vec<MutationId> {
        self.by_id.keys().copied().collect()
    }

    /// Ids of mutations targeting `target`
    pub fn on_target(&self, target: EntryId) -> Vec<MutationId> {
        self.by_id
            .values()
            .filter(|m| m.target == target)
            .map(|m| m.id)
            .collect()
    }

    /// Ids of mutations waiting on `predecessor`
    pub fn waiting_on(&self, predecessor: MutationId) -> Vec<MutationId> {
        self.by_id
            .values()
            .filter(|m| m.state == MutationState::Waiting { on: predecessor })
            .map(|m| m.id)
            .collect()
    }

    /// Free the slot `(target, group)` for a new proposal
    pub fn supersede(&mut self, target: EntryId, group: FieldGroup) -> Superseded {
        let Some(prev_id) = self.by_slot.get(&(target, group)).copied() else {
            return Superseded::Nothing;
        };
        match self.remove(prev_id) {
            Some(prev) if prev.is_in_flight() => Superseded::InFlight(prev),
            Some(prev) => Superseded::Dropped(prev),
            None => Superseded::Nothing,
        }
    }

    /// Insert a mutation whose slot is already free
    pub fn insert(&mut self, mutation: PendingMutation) {
        self.by_slot
            .insert((mutation.target, mutation.group()), mutation.id);
        self.by_id.insert(mutation.id, mutation);
    }

    pub fn remove(&mut self, id: MutationId) -> Option<PendingMutation> {
        let mutation = self.by_id.remove(&id)?;
        let slot = (mutation.target, mutation.group());
        if self.by_slot.get(&slot) == Some(&id) {
            self.by_slot.remove(&slot);
        }
        Some(mutation)
    }

    /// Point every mutation on `from` at `to`
    ///
    /// Returns the ids that were moved.
    pub fn retarget(&mut self, from: EntryId, to: EntryId) -> Vec<MutationId> {
        let moved = self.on_target(from);
        for id in &moved {
            if let Some(mut mutation) = self.remove(*id) {
                mutation.target = to;
                self.insert(mutation);
            }
        }
        moved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> PositionKey {
        PositionKey::parse(s).unwrap()
    }

    fn move_to(id: u64, target: EntryId, position: &str) -> PendingMutation {
        PendingMutation::new(
            MutationId(id),
            target,
            MutationOp::Move {
                position: key(position),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_required_capabilities() {
        assert_eq!(OpKind::Add.required_capability(), Capability::ServiceEdit);
        assert_eq!(MutationOp::Remove.required_capability(), Capability::ServiceEdit);
        assert_eq!(
            MutationOp::Move { position: key("V") }.required_capability(),
            Capability::ServiceArrange
        );
        assert_eq!(
            MutationOp::Edit {
                patch: OverridesPatch::default()
            }
            .required_capability(),
            Capability::EntryAnnotate
        );
    }

    #[test]
    fn test_supersede_queued_drops_predecessor() {
        let entry = EntryId::new();
        let mut set = PendingSet::new();
        set.insert(move_to(1, entry, "a"));

        let superseded = set.supersede(entry, FieldGroup::Position);
        assert!(matches!(superseded, Superseded::Dropped(ref m) if m.id == MutationId(1)));
        assert_eq!(superseded.inherited_state(), None);
        assert!(set.is_empty());
    }

    #[test]
    fn test_supersede_in_flight_makes_successor_wait() {
        let entry = EntryId::new();
        let mut set = PendingSet::new();
        let mut first = move_to(1, entry, "a");
        first.state = MutationState::InFlight { attempt: 1 };
        set.insert(first);

        let superseded = set.supersede(entry, FieldGroup::Position);
        assert_eq!(
            superseded.inherited_state(),
            Some(MutationState::Waiting { on: MutationId(1) })
        );

        let mut second = move_to(2, entry, "b");
        second.state = superseded.inherited_state().unwrap();
        set.insert(second);

        // A third proposal replaces the waiting one and keeps waiting on the first
        let superseded = set.supersede(entry, FieldGroup::Position);
        assert_eq!(
            superseded.inherited_state(),
            Some(MutationState::Waiting { on: MutationId(1) })
        );
    }

    #[test]
    fn test_one_pending_per_slot() {
        let entry = EntryId::new();
        let mut set = PendingSet::new();
        set.insert(move_to(1, entry, "a"));
        set.insert(PendingMutation::new(
            MutationId(2),
            entry,
            MutationOp::Edit {
                patch: OverridesPatch {
                    tempo_bpm: Some(Some(80)),
                    ..Default::default()
                },
            },
            Utc::now(),
        ));
        assert_eq!(set.len(), 2);
        assert_eq!(set.in_slot(entry, FieldGroup::Position).unwrap().id, MutationId(1));
        assert_eq!(set.in_slot(entry, FieldGroup::Overrides).unwrap().id, MutationId(2));
        assert!(set.in_slot(entry, FieldGroup::Presence).is_none());
    }

    #[test]
    fn test_retarget_moves_slots() {
        let temp = EntryId::new();
        let canonical = EntryId::new();
        let mut set = PendingSet::new();
        set.insert(move_to(1, temp, "a"));

        assert_eq!(set.retarget(temp, canonical), vec![MutationId(1)]);
        assert!(set.in_slot(temp, FieldGroup::Position).is_none());
        assert_eq!(set.in_slot(canonical, FieldGroup::Position).unwrap().target, canonical);
    }

    #[test]
    fn test_iteration_in_submission_order() {
        let mut set = PendingSet::new();
        set.insert(move_to(5, EntryId::new(), "a"));
        set.insert(move_to(2, EntryId::new(), "b"));
        set.insert(move_to(9, EntryId::new(), "c"));
        let ids: Vec<u64> = set.iter().map(|m| m.id.0).collect();
        assert_eq!(ids, vec![2, 5, 9]);
    }

    #[test]
    fn test_apply_edit_marks_pending() {
        let id = EntryId::new();
        let mut entries = HashMap::new();
        entries.insert(
            id,
            EntryView {
                id,
                song_id: SongId::new(),
                position: key("V"),
                overrides: EntryOverrides::default(),
                pending: false,
                confirmed: true,
            },
        );
        MutationOp::Edit {
            patch: OverridesPatch {
                key: Some(Some("A".to_string())),
                ..Default::default()
            },
        }
        .apply(id, &mut entries);
        let entry = &entries[&id];
        assert!(entry.pending);
        assert_eq!(entry.overrides.key.as_deref(), Some("A"));

        MutationOp::Remove.apply(id, &mut entries);
        assert!(entries.is_empty());
    }
}
