//! Change Sequence Numbers.
//!
//! A CSN is the totally ordered identifier attached to every committed
//! change; replicas converge by comparing them. The string form is 28 hex
//! characters with no separator: 16 for the timestamp, then 4 each for the
//! sequence number, the replica id, and the sub-sequence number.

use std::fmt;

use thiserror::Error;

/// Length of the canonical CSN string form.
pub const CSN_STRSIZE: usize = 28;

/// Error parsing a CSN string.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CsnParseError {
    #[error("CSN string must be {CSN_STRSIZE} hex characters, got {0}")]
    BadLength(usize),
    #[error("CSN string contains a non-hex character")]
    BadDigit,
}

/// A change sequence number. Field order matters: deriving `Ord` here yields
/// the same ordering as a byte comparison of the string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Csn {
    pub tstamp: i64,
    pub seq: u16,
    pub rid: u16,
    pub subseq: u16,
}

impl Csn {
    #[must_use]
    pub fn new(tstamp: i64, seq: u16, rid: u16) -> Self {
        Self {
            tstamp,
            seq,
            rid,
            subseq: 0,
        }
    }

    /// Parses the 28-character hex string form.
    pub fn parse(s: &str) -> Result<Self, CsnParseError> {
        if s.len() != CSN_STRSIZE {
            return Err(CsnParseError::BadLength(s.len()));
        }
        let field = |range: std::ops::Range<usize>| {
            u64::from_str_radix(&s[range], 16).map_err(|_| CsnParseError::BadDigit)
        };
        Ok(Self {
            tstamp: field(0..16)? as i64,
            seq: field(16..20)? as u16,
            rid: field(20..24)? as u16,
            subseq: field(24..28)? as u16,
        })
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:016x}{:04x}{:04x}{:04x}",
            self.tstamp as u64, self.seq, self.rid, self.subseq
        )
    }
}

/// The logical change a CSN records for one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CsnType {
    ValueDistinguished,
    ValueUpdated,
    ValueDeletedOnSubtype,
}

/// The per-value CSN set: at most one CSN per logical change type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CsnSet {
    distinguished: Option<Csn>,
    updated: Option<Csn>,
    deleted_on_subtype: Option<Csn>,
}

impl CsnSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, t: CsnType) -> Option<Csn> {
        match t {
            CsnType::ValueDistinguished => self.distinguished,
            CsnType::ValueUpdated => self.updated,
            CsnType::ValueDeletedOnSubtype => self.deleted_on_subtype,
        }
    }

    pub fn set(&mut self, t: CsnType, csn: Csn) {
        match t {
            CsnType::ValueDistinguished => self.distinguished = Some(csn),
            CsnType::ValueUpdated => self.updated = Some(csn),
            CsnType::ValueDeletedOnSubtype => self.deleted_on_subtype = Some(csn),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.distinguished.is_none() && self.updated.is_none() && self.deleted_on_subtype.is_none()
    }

    /// The most recent CSN in the set, if any.
    #[must_use]
    pub fn newest(&self) -> Option<Csn> {
        [self.distinguished, self.updated, self.deleted_on_subtype]
            .into_iter()
            .flatten()
            .max()
    }

    /// Drops every CSN strictly older than `csn`.
    pub fn purge_older_than(&mut self, csn: &Csn) {
        for slot in [
            &mut self.distinguished,
            &mut self.updated,
            &mut self.deleted_on_subtype,
        ] {
            if slot.is_some_and(|c| c < *csn) {
                *slot = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_form_roundtrips() {
        let csn = Csn {
            tstamp: 0x1234_5678,
            seq: 7,
            rid: 255,
            subseq: 1,
        };
        let s = csn.to_string();
        assert_eq!(s.len(), CSN_STRSIZE);
        assert_eq!(s, "0000000012345678000700ff0001");
        assert_eq!(Csn::parse(&s).unwrap(), csn);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(Csn::parse("abc"), Err(CsnParseError::BadLength(3))));
        assert!(Csn::parse(&"z".repeat(CSN_STRSIZE)).is_err());
    }

    #[test]
    fn ordering_matches_string_ordering() {
        let a = Csn::new(100, 5, 9);
        let b = Csn::new(100, 6, 1);
        let c = Csn::new(101, 0, 0);
        assert!(a < b && b < c);
        assert!(a.to_string() < b.to_string() && b.to_string() < c.to_string());
    }

    #[test]
    fn csn_set_purges_old_entries() {
        let mut set = CsnSet::new();
        set.set(CsnType::ValueUpdated, Csn::new(100, 0, 1));
        set.set(CsnType::ValueDistinguished, Csn::new(200, 0, 1));
        set.purge_older_than(&Csn::new(150, 0, 1));
        assert_eq!(set.get(CsnType::ValueUpdated), None);
        assert_eq!(set.get(CsnType::ValueDistinguished), Some(Csn::new(200, 0, 1)));
        assert!(!set.is_empty());
    }
}
