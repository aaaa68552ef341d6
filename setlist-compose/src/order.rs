//! Order reconciliation
//!
//! Canonical state is the client's copy of what the store has confirmed.
//! Merges are guarded by the per-entry version the store assigns, and a
//! delete leaves a tombstone, so the canonical state reached after a set of
//! events does not depend on the order they were delivered in.
//!
//! Order is always the sort order of `(position, id)`. Array indices are
//! only used for presentation, never for reconciliation.

use serde::Serialize;
use std::collections::HashMap;

use setlist_common::models::{EntryOverrides, EntryRecord, PositionKey};
use setlist_common::{EntryId, Error, Result, SongId};

/// Read-only view of one entry as the UI sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryView {
    pub id: EntryId,
    pub song_id: SongId,
    pub position: PositionKey,
    pub overrides: EntryOverrides,
    /// A local mutation on this entry awaits confirmation
    pub pending: bool,
    /// The store has confirmed this entry exists
    pub confirmed: bool,
}

impl EntryView {
    pub(crate) fn from_record(record: &EntryRecord) -> Self {
        Self {
            id: record.id,
            song_id: record.song_id,
            position: record.position.clone(),
            overrides: record.overrides.clone(),
            pending: false,
            confirmed: true,
        }
    }
}

/// Result of merging one record into canonical state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Updated,
    /// Held version is the same or newer
    Stale,
    /// Entry was deleted; deletes are final
    Tombstoned,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        matches!(self, MergeOutcome::Inserted | MergeOutcome::Updated)
    }
}

/// Differences found when a snapshot replaces canonical state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotDiff {
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.changed == 0
    }
}

/// Confirmed entries of one service
#[derive(Debug, Default)]
pub struct CanonicalState {
    entries: HashMap<EntryId, EntryRecord>,
    tombstones: HashMap<EntryId, u64>,
}

impl CanonicalState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &EntryId) -> Option<&EntryRecord> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &EntryId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn is_deleted(&self, id: &EntryId) -> bool {
        self.tombstones.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &EntryRecord> {
        self.entries.values()
    }

    /// Merge a record, keeping whichever version is newer
    pub fn merge(&mut self, record: EntryRecord) -> MergeOutcome {
        if self.tombstones.contains_key(&record.id) {
            return MergeOutcome::Tombstoned;
        }
        match self.entries.get(&record.id) {
            Some(held) if held.version >= record.version => MergeOutcome::Stale,
            Some(_) => {
                self.entries.insert(record.id, record);
                MergeOutcome::Updated
            }
            None => {
                self.entries.insert(record.id, record);
                MergeOutcome::Inserted
            }
        }
    }

    /// Apply a delete; returns true if an entry was removed
    pub fn remove(&mut self, id: EntryId, version: u64) -> bool {
        let tomb = self.tombstones.entry(id).or_insert(version);
        *tomb = (*tomb).max(version);
        self.entries.remove(&id).is_some()
    }

    /// Replace everything with an authoritative snapshot
    ///
    /// Entries missing from the snapshot were deleted while this client was
    /// not listening and are tombstoned.
    pub fn replace_with_snapshot(&mut self, records: Vec<EntryRecord>) -> SnapshotDiff {
        let mut diff = SnapshotDiff::default();
        let mut next: HashMap<EntryId, EntryRecord> = HashMap::with_capacity(records.len());

        for record in records {
            match self.entries.get(&record.id) {
                None => diff.added += 1,
                Some(held) if held != &record => diff.changed += 1,
                Some(_) => {}
            }
            self.tombstones.remove(&record.id);
            next.insert(record.id, record);
        }

        for (id, held) in &self.entries {
            if !next.contains_key(id) {
                diff.removed += 1;
                self.tombstones.insert(*id, u64::MAX.max(held.version));
            }
        }

        self.entries = next;
        diff
    }

    /// Canonical entries in order, without any local overlay
    pub fn ordered(&self) -> Vec<EntryView> {
        let mut views: Vec<EntryView> = self.entries.values().map(EntryView::from_record).collect();
        sort_entries(&mut views);
        views
    }
}

/// Sort by position key, breaking ties by id
pub fn sort_entries(entries: &mut [EntryView]) {
    entries.sort_by(|a, b| a.position.cmp(&b.position).then_with(|| a.id.cmp(&b.id)));
}

/// Keys bounding the slot right after `after` (or the front when `None`)
///
/// `exclude` is left out of the lookup so moving an entry does not use its
/// own current key as a bound.
pub fn neighbours(
    ordered: &[EntryView],
    after: Option<EntryId>,
    exclude: Option<EntryId>,
) -> Result<(Option<PositionKey>, Option<PositionKey>)> {
    let remaining: Vec<&EntryView> = ordered
        .iter()
        .filter(|e| Some(e.id) != exclude)
        .collect();

    match after {
        None => Ok((None, remaining.first().map(|e| e.position.clone()))),
        Some(after_id) => {
            let idx = remaining
                .iter()
                .position(|e| e.id == after_id)
                .ok_or_else(|| Error::Validation(format!("anchor entry {} is not in the service", after_id)))?;
            let lower = remaining[idx].position.clone();
            let upper = remaining.get(idx + 1).map(|e| e.position.clone());
            Ok((Some(lower), upper))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use setlist_common::ServiceId;

    fn record(id: EntryId, key: &str, version: u64) -> EntryRecord {
        EntryRecord {
            id,
            service_id: ServiceId::new(),
            song_id: SongId::new(),
            position: PositionKey::parse(key).unwrap(),
            overrides: EntryOverrides::default(),
            version,
            updated_at: Utc::now(),
            origin: None,
        }
    }

    #[test]
    fn test_merge_keeps_newest_version() {
        let id = EntryId::new();
        let mut state = CanonicalState::new();
        assert_eq!(state.merge(record(id, "V", 1)), MergeOutcome::Inserted);
        assert_eq!(state.merge(record(id, "a", 3)), MergeOutcome::Updated);
        assert_eq!(state.merge(record(id, "b", 2)), MergeOutcome::Stale);
        assert_eq!(state.get(&id).unwrap().position.as_str(), "a");
    }

    #[test]
    fn test_delete_is_final() {
        let id = EntryId::new();
        let mut state = CanonicalState::new();
        state.merge(record(id, "V", 1));
        assert!(state.remove(id, 2));
        assert_eq!(state.merge(record(id, "V", 5)), MergeOutcome::Tombstoned);
        assert!(state.is_deleted(&id));
        assert!(state.is_empty());
    }

    #[test]
    fn test_delete_before_create_still_wins() {
        let id = EntryId::new();
        let mut state = CanonicalState::new();
        assert!(!state.remove(id, 2));
        assert_eq!(state.merge(record(id, "V", 1)), MergeOutcome::Tombstoned);
    }

    #[test]
    fn test_snapshot_diff() {
        let kept = EntryId::new();
        let changed = EntryId::new();
        let gone = EntryId::new();
        let added = EntryId::new();

        let mut state = CanonicalState::new();
        let kept_record = record(kept, "1", 1);
        state.merge(kept_record.clone());
        state.merge(record(changed, "2", 1));
        state.merge(record(gone, "3", 1));

        let diff = state.replace_with_snapshot(vec![
            kept_record,
            record(changed, "4", 2),
            record(added, "5", 1),
        ]);
        assert_eq!(
            diff,
            SnapshotDiff {
                added: 1,
                removed: 1,
                changed: 1
            }
        );
        assert!(state.is_deleted(&gone));
        assert_eq!(state.len(), 3);
    }

    #[test]
    fn test_ordering_ties_broken_by_id() {
        let mut state = CanonicalState::new();
        let a = EntryId::new();
        let b = EntryId::new();
        state.merge(record(a, "V", 1));
        state.merge(record(b, "V", 1));
        let ordered = state.ordered();
        assert_eq!(ordered.len(), 2);
        assert!(ordered[0].id < ordered[1].id);
    }

    #[test]
    fn test_neighbours() {
        let mut state = CanonicalState::new();
        let a = EntryId::new();
        let b = EntryId::new();
        let c = EntryId::new();
        state.merge(record(a, "1", 1));
        state.merge(record(b, "2", 1));
        state.merge(record(c, "3", 1));
        let ordered = state.ordered();

        let (lo, hi) = neighbours(&ordered, None, None).unwrap();
        assert_eq!((lo, hi.unwrap().as_str()), (None, "1"));

        let (lo, hi) = neighbours(&ordered, Some(a), None).unwrap();
        assert_eq!(lo.unwrap().as_str(), "1");
        assert_eq!(hi.unwrap().as_str(), "2");

        // Moving b to just after a skips b's own key
        let (lo, hi) = neighbours(&ordered, Some(a), Some(b)).unwrap();
        assert_eq!(lo.unwrap().as_str(), "1");
        assert_eq!(hi.unwrap().as_str(), "3");

        let (_, hi) = neighbours(&ordered, Some(c), None).unwrap();
        assert!(hi.is_none());

        assert!(neighbours(&ordered, Some(EntryId::new()), None).is_err());
    }
}
