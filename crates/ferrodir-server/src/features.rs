//! Registries of supported features, SASL mechanisms, and extended
//! operations, surfaced through the root DSE.

use parking_lot::RwLock;
use tracing::debug;

/// "All Operational Attributes" feature.
pub const FEATURE_ALL_OP_ATTRS: &str = "1.3.6.1.4.1.4203.1.5.1";

/// Bulk import extended operations.
pub const EXTOP_BULK_IMPORT_START: &str = "2.16.840.1.113730.3.5.7";
pub const EXTOP_BULK_IMPORT_DONE: &str = "2.16.840.1.113730.3.5.8";

/// The rwlock-guarded support registries.
#[derive(Default)]
pub struct SupportRegistry {
    features: RwLock<Vec<String>>,
    sasl_mechanisms: RwLock<Vec<String>>,
    extended_ops: RwLock<Vec<String>>,
}

impl SupportRegistry {
    /// Builds the registry seeded with the built-in entries.
    #[must_use]
    pub fn new() -> Self {
        let reg = Self::default();
        reg.register_feature(FEATURE_ALL_OP_ATTRS);
        reg.register_sasl_mechanism("EXTERNAL");
        reg.register_extended_op(EXTOP_BULK_IMPORT_START);
        reg.register_extended_op(EXTOP_BULK_IMPORT_DONE);
        reg
    }

    fn register(list: &RwLock<Vec<String>>, value: &str) {
        let mut list = list.write();
        if list.iter().any(|v| v == value) {
            debug!(value, "already registered");
            return;
        }
        list.push(value.to_owned());
    }

    pub fn register_feature(&self, oid: &str) {
        Self::register(&self.features, oid);
    }

    pub fn register_sasl_mechanism(&self, mechanism: &str) {
        Self::register(&self.sasl_mechanisms, mechanism);
    }

    pub fn register_extended_op(&self, oid: &str) {
        Self::register(&self.extended_ops, oid);
    }

    #[must_use]
    pub fn supported_features(&self) -> Vec<String> {
        self.features.read().clone()
    }

    #[must_use]
    pub fn supported_sasl_mechanisms(&self) -> Vec<String> {
        self.sasl_mechanisms.read().clone()
    }

    #[must_use]
    pub fn supported_extended_ops(&self) -> Vec<String> {
        self.extended_ops.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_seeded() {
        let reg = SupportRegistry::new();
        assert!(reg.supported_features().contains(&FEATURE_ALL_OP_ATTRS.to_owned()));
        assert!(reg
            .supported_sasl_mechanisms()
            .contains(&"EXTERNAL".to_owned()));
        assert_eq!(reg.supported_extended_ops().len(), 2);
    }

    #[test]
    fn duplicate_registration_is_a_no_op() {
        let reg = SupportRegistry::new();
        reg.register_sasl_mechanism("EXTERNAL");
        reg.register_sasl_mechanism("EXTERNAL");
        assert_eq!(
            reg.supported_sasl_mechanisms()
                .iter()
                .filter(|m| m.as_str() == "EXTERNAL")
                .count(),
            1
        );
    }

    #[test]
    fn copies_are_snapshots() {
        let reg = SupportRegistry::new();
        let snapshot = reg.supported_sasl_mechanisms();
        reg.register_sasl_mechanism("GSSAPI");
        assert!(!snapshot.contains(&"GSSAPI".to_owned()));
        assert!(reg.supported_sasl_mechanisms().contains(&"GSSAPI".to_owned()));
    }
}
