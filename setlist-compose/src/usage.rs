//! Usage ledger
//!
//! Append-only record of which songs were used in which completed services.
//! Records are never edited or removed.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use setlist_common::models::UsageRecord;
use setlist_common::{ServiceId, SongId};

#[derive(Debug, Default)]
pub struct UsageLedger {
    by_song: HashMap<SongId, Vec<UsageRecord>>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one use per distinct song of a completed service
    ///
    /// A (song, service) pair already present is skipped, so completing the
    /// same service twice leaves the ledger unchanged. Returns the number of
    /// records appended.
    pub fn record_completed_service(
        &mut self,
        service_id: ServiceId,
        completed_at: DateTime<Utc>,
        song_ids: impl IntoIterator<Item = SongId>,
    ) -> usize {
        let mut appended = 0;
        for song_id in song_ids {
            let record = UsageRecord {
                song_id,
                service_id,
                used_at: completed_at,
            };
            if self.append(record) {
                appended += 1;
            }
        }
        debug!(service = %service_id, appended, "Recorded service usage");
        appended
    }

    /// Append one record unless its (song, service) pair is already present
    pub fn append(&mut self, record: UsageRecord) -> bool {
        let records = self.by_song.entry(record.song_id).or_default();
        if records.iter().any(|r| r.service_id == record.service_id) {
            return false;
        }
        records.push(record);
        true
    }

    /// Usage history of one song
    pub fn history(&self, song_id: SongId) -> &[UsageRecord] {
        self.by_song.get(&song_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.by_song.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_record_per_distinct_song() {
        let mut ledger = UsageLedger::new();
        let service = ServiceId::new();
        let a = SongId::new();
        let b = SongId::new();
        let now = Utc::now();

        assert_eq!(ledger.record_completed_service(service, now, [a, b, a]), 2);
        assert_eq!(ledger.history(a).len(), 1);
        assert_eq!(ledger.history(b)[0].service_id, service);
    }

    #[test]
    fn test_completing_twice_is_ignored() {
        let mut ledger = UsageLedger::new();
        let service = ServiceId::new();
        let song = SongId::new();
        let now = Utc::now();

        ledger.record_completed_service(service, now, [song]);
        assert_eq!(ledger.record_completed_service(service, now, [song]), 0);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_unknown_song_has_empty_history() {
        let ledger = UsageLedger::new();
        assert!(ledger.history(SongId::new()).is_empty());
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_append_dedups() {
        let mut ledger = UsageLedger::new();
        let record = UsageRecord {
            song_id: SongId::new(),
            service_id: ServiceId::new(),
            used_at: Utc::now(),
        };
        assert!(ledger.append(record.clone()));
        assert!(!ledger.append(record));
    }
}
