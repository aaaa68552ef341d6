//! Fractional position keys
//!
//! Keys are base62 digit strings read as fractions in (0, 1). A key strictly
//! between any two keys always exists, so inserting or moving an entry never
//! renumbers its siblings.
//!
//! Every key a client generates ends in that client's lane suffix. Two
//! clients inserting into the same gap at the same time compute the same
//! midpoint but append different suffixes, so their keys differ and the
//! final order is decided by the keys alone.

use setlist_common::models::{digit_index, PositionKey, POSITION_DIGITS};
use setlist_common::{ClientId, Error, Result};

const BASE: usize = POSITION_DIGITS.len();
const ZERO: u8 = POSITION_DIGITS[0];

/// Characters in a lane suffix
pub const LANE_LEN: usize = 3;

/// Per-client lane suffix
///
/// Derived from the random tail of the client's UUID. The last character is
/// never the minimum digit, which keeps generated keys valid.
pub fn lane_suffix(client: ClientId) -> String {
    let bytes = client.as_bytes();
    let c1 = POSITION_DIGITS[bytes[10] as usize % BASE];
    let c2 = POSITION_DIGITS[bytes[11] as usize % BASE];
    let c3 = POSITION_DIGITS[1 + bytes[12] as usize % (BASE - 1)];
    String::from_utf8_lossy(&[c1, c2, c3]).into_owned()
}

/// Shortest key strictly between `lower` and `upper`
///
/// `None` means unbounded on that side.
pub fn key_between(lower: Option<&PositionKey>, upper: Option<&PositionKey>) -> Result<PositionKey> {
    let a = lower.map(PositionKey::as_bytes).unwrap_or_default();
    let digits = midpoint(a, upper.map(PositionKey::as_bytes))?;
    into_key(digits)
}

/// Key strictly between `lower` and `upper` ending in `lane`
pub fn key_between_in_lane(
    lower: Option<&PositionKey>,
    upper: Option<&PositionKey>,
    lane: &str,
) -> Result<PositionKey> {
    if lane.is_empty() || lane.ends_with(ZERO as char) || lane.bytes().any(|b| digit_index(b).is_none()) {
        return Err(Error::Validation(format!("invalid lane suffix {:?}", lane)));
    }
    let a = lower.map(PositionKey::as_bytes).unwrap_or_default();
    let digits = between_in_lane(a, upper.map(PositionKey::as_bytes), lane.as_bytes())?;
    into_key(digits)
}

fn into_key(digits: Vec<u8>) -> Result<PositionKey> {
    let text = String::from_utf8(digits)
        .map_err(|e| Error::Internal(format!("position key not ASCII: {}", e)))?;
    PositionKey::parse(&text)
}

fn between_in_lane(a: &[u8], b: Option<&[u8]>, lane: &[u8]) -> Result<Vec<u8>> {
    let mut out = midpoint(a, b)?;
    if let Some(b) = b {
        // A midpoint that prefixes `b` would overshoot once extended, so
        // keep descending into the remainder of `b`. `a` sits below the
        // midpoint and cannot share that prefix.
        if b.len() > out.len() && b.starts_with(&out) {
            let rest = &b[out.len()..];
            out.extend(between_in_lane(&[], Some(rest), lane)?);
            return Ok(out);
        }
    }
    out.extend_from_slice(lane);
    Ok(out)
}

/// Digits strictly between `a` and `b`
///
/// `a` may be empty (the lower end of the key space); `b = None` is the
/// upper end. Neither may end in the minimum digit.
fn midpoint(a: &[u8], b: Option<&[u8]>) -> Result<Vec<u8>> {
    if a.last() == Some(&ZERO) || b.and_then(|b| b.last()) == Some(&ZERO) {
        return Err(Error::Validation("position key ends with the minimum digit".to_string()));
    }

    if let Some(b) = b {
        if a >= b {
            return Err(Error::Validation(format!(
                "lower bound {:?} is not below upper bound {:?}",
                String::from_utf8_lossy(a),
                String::from_utf8_lossy(b)
            )));
        }
        // Shared prefix, treating a missing digit of `a` as zero
        let mut n = 0;
        while n < b.len() && a.get(n).copied().unwrap_or(ZERO) == b[n] {
            n += 1;
        }
        if n > 0 {
            let mut out = b[..n].to_vec();
            out.extend(midpoint(a.get(n..).unwrap_or_default(), Some(&b[n..]))?);
            return Ok(out);
        }
    }

    let digit_a = match a.first() {
        Some(byte) => index_of(*byte)?,
        None => 0,
    };
    let digit_b = match b {
        Some(b) => index_of(*b.first().ok_or_else(|| {
            Error::Internal("upper bound exhausted while splitting".to_string())
        })?)?,
        None => BASE,
    };

    if digit_b - digit_a > 1 {
        Ok(vec![POSITION_DIGITS[(digit_a + digit_b + 1) / 2]])
    } else if let Some(b) = b.filter(|b| b.len() > 1) {
        Ok(vec![b[0]])
    } else {
        let mut out = vec![POSITION_DIGITS[digit_a]];
        out.extend(midpoint(a.get(1..).unwrap_or_default(), None)?);
        Ok(out)
    }
}

fn index_of(byte: u8) -> Result<usize> {
    digit_index(byte)
        .ok_or_else(|| Error::Validation(format!("invalid position digit {:#04x}", byte)))
}
