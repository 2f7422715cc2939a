//! Attribute values.

use bytes::Bytes;

use crate::csn::{Csn, CsnSet, CsnType};

/// One attribute value: a byte string plus the CSNs of the logical changes
/// that touched it. Operational values are maintained by the server rather
/// than the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Value {
    data: Bytes,
    csns: CsnSet,
    operational: bool,
}

impl Value {
    #[must_use]
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            csns: CsnSet::new(),
            operational: false,
        }
    }

    /// Attaches a CSN for the given change type, builder style.
    #[must_use]
    pub fn with_csn(mut self, t: CsnType, csn: Csn) -> Self {
        self.csns.set(t, csn);
        self
    }

    #[must_use]
    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    /// The value as UTF-8 text, if it is UTF-8.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }

    #[must_use]
    pub fn csns(&self) -> &CsnSet {
        &self.csns
    }

    pub fn set_csn(&mut self, t: CsnType, csn: Csn) {
        self.csns.set(t, csn);
    }

    pub fn set_csns(&mut self, csns: CsnSet) {
        self.csns = csns;
    }

    /// Removes and returns the CSN set, leaving the value with none.
    pub fn take_csns(&mut self) -> CsnSet {
        std::mem::take(&mut self.csns)
    }

    #[must_use]
    pub fn is_operational(&self) -> bool {
        self.operational
    }

    pub fn set_operational(&mut self, operational: bool) {
        self.operational = operational;
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::new(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::new(Bytes::from(s.into_bytes()))
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Self::new(b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_carry_csns() {
        let mut v = Value::from("top").with_csn(CsnType::ValueUpdated, Csn::new(9, 0, 1));
        assert_eq!(v.as_str(), Some("top"));
        assert_eq!(v.csns().get(CsnType::ValueUpdated), Some(Csn::new(9, 0, 1)));
        let taken = v.take_csns();
        assert!(v.csns().is_empty());
        assert_eq!(taken.get(CsnType::ValueUpdated), Some(Csn::new(9, 0, 1)));
    }
}
