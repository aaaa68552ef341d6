//! Store record models
//!
//! Shapes exchanged with the backing store and carried in change events.
//! The store owns `version` and `updated_at`; clients only ever propose
//! positions, overrides, and new entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::ids::{ClientId, EntryId, MutationId, ServiceId, SongId, TenantId};

/// Digit alphabet for position keys, in ascending byte order
pub const POSITION_DIGITS: &[u8; 62] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Index of a byte within [`POSITION_DIGITS`]
pub fn digit_index(byte: u8) -> Option<usize> {
    match byte {
        b'0'..=b'9' => Some((byte - b'0') as usize),
        b'A'..=b'Z' => Some((byte - b'A') as usize + 10),
        b'a'..=b'z' => Some((byte - b'a') as usize + 36),
        _ => None,
    }
}

/// Fractional position of an entry within its service
///
/// A base62 string read as the digits of a fraction in (0, 1). Keys compare
/// bytewise, which matches numeric order because the alphabet is ASCII
/// sorted. A key never ends in `0`, so there is always room below it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PositionKey(String);

impl PositionKey {
    /// Validate and wrap a key
    pub fn parse(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(Error::Validation("position key is empty".to_string()));
        }
        if let Some(bad) = s.bytes().find(|b| digit_index(*b).is_none()) {
            return Err(Error::Validation(format!(
                "position key {:?} contains invalid byte {:#04x}",
                s, bad
            )));
        }
        if s.ends_with('0') {
            return Err(Error::Validation(format!(
                "position key {:?} ends with the minimum digit",
                s
            )));
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl TryFrom<String> for PositionKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        PositionKey::parse(&value)
    }
}

impl From<PositionKey> for String {
    fn from(key: PositionKey) -> Self {
        key.0
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Capability tags gating mutations
///
/// Closed set; the identity collaborator hands out kebab-case strings which
/// are parsed into this enum and compared by set membership only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    ServiceView,
    ServiceEdit,
    ServiceArrange,
    EntryAnnotate,
    ServiceComplete,
}

impl Capability {
    pub const ALL: [Capability; 5] = [
        Capability::ServiceView,
        Capability::ServiceEdit,
        Capability::ServiceArrange,
        Capability::EntryAnnotate,
        Capability::ServiceComplete,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Capability::ServiceView => "service-view",
            Capability::ServiceEdit => "service-edit",
            Capability::ServiceArrange => "service-arrange",
            Capability::EntryAnnotate => "entry-annotate",
            Capability::ServiceComplete => "service-complete",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Capability::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown capability tag {:?}", s)))
    }
}

/// Per-entry overrides of the song's defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryOverrides {
    /// Musical key, e.g. "G" or "Bb"
    pub key: Option<String>,
    pub tempo_bpm: Option<u16>,
    pub notes: Option<String>,
}

/// Partial update of [`EntryOverrides`]
///
/// Outer `None` leaves a field untouched, `Some(None)` clears it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverridesPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempo_bpm: Option<Option<u16>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<Option<String>>,
}

impl OverridesPatch {
    pub fn is_empty(&self) -> bool {
        self.key.is_none() && self.tempo_bpm.is_none() && self.notes.is_none()
    }

    pub fn apply(&self, overrides: &mut EntryOverrides) {
        if let Some(key) = &self.key {
            overrides.key = key.clone();
        }
        if let Some(tempo) = self.tempo_bpm {
            overrides.tempo_bpm = tempo;
        }
        if let Some(notes) = &self.notes {
            overrides.notes = notes.clone();
        }
    }

    /// Combine with a later patch; fields set in `later` win
    pub fn merged_with(&self, later: &OverridesPatch) -> OverridesPatch {
        OverridesPatch {
            key: later.key.clone().or_else(|| self.key.clone()),
            tempo_bpm: later.tempo_bpm.or(self.tempo_bpm),
            notes: later.notes.clone().or_else(|| self.notes.clone()),
        }
    }
}

/// Identifies the client mutation that produced a record version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationOrigin {
    pub client: ClientId,
    pub mutation: MutationId,
    /// Temporary id the client used for a created entry
    pub client_ref: Option<EntryId>,
}

/// Entry as held by the backing store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryRecord {
    pub id: EntryId,
    pub service_id: ServiceId,
    pub song_id: SongId,
    pub position: PositionKey,
    #[serde(default)]
    pub overrides: EntryOverrides,
    /// Monotonic per entry, assigned by the store
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub origin: Option<MutationOrigin>,
}

/// Create request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEntry {
    pub service_id: ServiceId,
    pub song_id: SongId,
    pub position: PositionKey,
    #[serde(default)]
    pub overrides: EntryOverrides,
    /// Client-local id; lets the store deduplicate a retried create
    pub client_ref: EntryId,
}

/// Update request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<PositionKey>,
    #[serde(default)]
    pub overrides: OverridesPatch,
}

/// Acknowledgement of a delete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteAck {
    pub id: EntryId,
    pub service_id: ServiceId,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

/// Lifecycle of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Planning,
    Completed,
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceStatus::Planning => write!(f, "planning"),
            ServiceStatus::Completed => write!(f, "completed"),
        }
    }
}

/// Service as held by the backing store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: ServiceId,
    pub tenant_id: TenantId,
    pub title: String,
    pub scheduled_for: DateTime<Utc>,
    pub status: ServiceStatus,
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Append-only fact: `song_id` was used in completed service `service_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub song_id: SongId,
    pub service_id: ServiceId,
    pub used_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_key_rejects_malformed() {
        assert!(PositionKey::parse("").is_err());
        assert!(PositionKey::parse("V0").is_err());
        assert!(PositionKey::parse("a-b").is_err());
        assert!(PositionKey::parse("Vx3").is_ok());
    }

    #[test]
    fn test_position_key_order_matches_digit_order() {
        let a = PositionKey::parse("9").unwrap();
        let b = PositionKey::parse("A").unwrap();
        let c = PositionKey::parse("a").unwrap();
        assert!(a < b && b < c);
        assert!(PositionKey::parse("V").unwrap() < PositionKey::parse("V1").unwrap());
    }

    #[test]
    fn test_position_key_deserialize_validates() {
        let ok: PositionKey = serde_json::from_str("\"Vk\"").unwrap();
        assert_eq!(ok.as_str(), "Vk");
        assert!(serde_json::from_str::<PositionKey>("\"V0\"").is_err());
    }

    #[test]
    fn test_digit_index_covers_alphabet() {
        for (i, b) in POSITION_DIGITS.iter().enumerate() {
            assert_eq!(digit_index(*b), Some(i));
        }
        assert_eq!(digit_index(b'_'), None);
    }

    #[test]
    fn test_capability_parses_kebab_case() {
        assert_eq!("service-arrange".parse::<Capability>().unwrap(), Capability::ServiceArrange);
        assert!("ServiceEdit".parse::<Capability>().is_err());
        for cap in Capability::ALL {
            assert_eq!(cap.as_str().parse::<Capability>().unwrap(), cap);
        }
    }

    #[test]
    fn test_overrides_patch_apply_and_clear() {
        let mut overrides = EntryOverrides {
            key: Some("G".to_string()),
            tempo_bpm: Some(72),
            notes: None,
        };
        let patch = OverridesPatch {
            key: Some(None),
            notes: Some(Some("capo 2".to_string())),
            ..Default::default()
        };
        patch.apply(&mut overrides);
        assert_eq!(overrides.key, None);
        assert_eq!(overrides.tempo_bpm, Some(72));
        assert_eq!(overrides.notes.as_deref(), Some("capo 2"));
    }

    #[test]
    fn test_overrides_patch_merge_prefers_later() {
        let first = OverridesPatch {
            key: Some(Some("D".to_string())),
            tempo_bpm: Some(Some(90)),
            ..Default::default()
        };
        let later = OverridesPatch {
            key: Some(Some("E".to_string())),
            ..Default::default()
        };
        let merged = first.merged_with(&later);
        assert_eq!(merged.key, Some(Some("E".to_string())));
        assert_eq!(merged.tempo_bpm, Some(Some(90)));
        assert!(merged.notes.is_none());
        assert!(OverridesPatch::default().is_empty());
    }
}
