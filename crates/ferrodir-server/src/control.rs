//! The LDAP control registry and the BER codec for request controls.

use bytes::Bytes;
use parking_lot::RwLock;
use rasn::prelude::*;
use tracing::debug;

use ferrodir_core::error::{LdapError, LdapResult};

use crate::operation::{OpType, OPS_ALL, OPS_NONE};

/// Control OIDs the server knows out of the box.
pub mod oids {
    pub const MANAGEDSAIT: &str = "2.16.840.1.113730.3.4.2";
    pub const PERSISTENT_SEARCH: &str = "2.16.840.1.113730.3.4.3";
    pub const PWEXPIRED: &str = "2.16.840.1.113730.3.4.4";
    pub const PWEXPIRING: &str = "2.16.840.1.113730.3.4.5";
    pub const SORT_REQUEST: &str = "1.2.840.113556.1.4.473";
    pub const VLV_REQUEST: &str = "2.16.840.1.113730.3.4.9";
    pub const AUTH_REQUEST: &str = "2.16.840.1.113730.3.4.16";
    pub const AUTH_RESPONSE: &str = "2.16.840.1.113730.3.4.15";
    pub const REAL_ATTRS_ONLY: &str = "2.16.840.1.113730.3.4.17";
    pub const VIRT_ATTRS_ONLY: &str = "2.16.840.1.113730.3.4.19";
    pub const PWPOLICY_REQUEST: &str = "1.3.6.1.4.1.42.2.27.8.5.1";
    pub const GET_EFFECTIVE_RIGHTS: &str = "1.3.6.1.4.1.42.2.27.9.5.2";
    pub const PROXIED_AUTH_V1: &str = "2.16.840.1.113730.3.4.12";
    pub const PROXIED_AUTH_V2: &str = "2.16.840.1.113730.3.4.18";
}

/// A decoded request or response control.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapControl {
    pub oid: String,
    pub criticality: bool,
    pub value: Option<Bytes>,
}

impl LdapControl {
    #[must_use]
    pub fn new(oid: impl Into<String>, criticality: bool, value: Option<Bytes>) -> Self {
        Self {
            oid: oid.into(),
            criticality,
            value,
        }
    }
}

/// Wire form of one control. `criticality` defaults to FALSE and is omitted
/// from the encoding when false, per RFC 4511.
#[derive(AsnType, Decode, Encode, Debug, Clone, PartialEq)]
struct BerControl {
    control_type: OctetString,
    #[rasn(default)]
    criticality: bool,
    control_value: Option<OctetString>,
}

/// Registered controls with the operations each applies to.
#[derive(Default)]
pub struct ControlRegistry {
    inner: RwLock<Vec<(String, u32)>>,
}

impl ControlRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a control OID with its applicable-operation bitmap.
    /// Re-registering an OID replaces its bitmap.
    pub fn register(&self, oid: &str, ops: u32) {
        let mut inner = self.inner.write();
        if let Some(slot) = inner.iter_mut().find(|(o, _)| o == oid) {
            slot.1 = ops;
        } else {
            inner.push((oid.to_owned(), ops));
        }
    }

    #[must_use]
    pub fn lookup(&self, oid: &str) -> Option<u32> {
        self.inner
            .read()
            .iter()
            .find(|(o, _)| o == oid)
            .map(|(_, ops)| *ops)
    }

    /// Snapshot of the registered controls, for the root DSE.
    #[must_use]
    pub fn supported_copy(&self) -> Vec<(String, u32)> {
        self.inner.read().clone()
    }
}

/// Registers the controls the server supports out of the box.
pub fn init_controls(reg: &ControlRegistry) {
    let writes = OpType::Add.bit()
        | OpType::Delete.bit()
        | OpType::Modify.bit()
        | OpType::ModDn.bit();
    let dsait = OpType::Search.bit() | OpType::Compare.bit() | writes;
    reg.register(oids::MANAGEDSAIT, dsait);
    reg.register(oids::PERSISTENT_SEARCH, OpType::Search.bit());
    reg.register(oids::PWEXPIRED, OPS_NONE);
    reg.register(oids::PWEXPIRING, OPS_NONE);
    reg.register(oids::SORT_REQUEST, OpType::Search.bit());
    reg.register(oids::VLV_REQUEST, OpType::Search.bit());
    reg.register(oids::AUTH_REQUEST, OpType::Bind.bit());
    reg.register(oids::AUTH_RESPONSE, OPS_NONE);
    reg.register(oids::REAL_ATTRS_ONLY, OpType::Search.bit());
    reg.register(oids::VIRT_ATTRS_ONLY, OpType::Search.bit());
    reg.register(
        oids::PWPOLICY_REQUEST,
        writes | OpType::Search.bit() | OpType::Compare.bit(),
    );
    reg.register(oids::GET_EFFECTIVE_RIGHTS, OpType::Search.bit());
    reg.register(oids::PROXIED_AUTH_V2, OPS_ALL);
}

/// Finds a control by OID, returning it if present.
#[must_use]
pub fn find_control<'a>(controls: &'a [LdapControl], oid: &str) -> Option<&'a LdapControl> {
    controls.iter().find(|c| c.oid == oid)
}

/// Decodes a BER `SEQUENCE OF Control`.
pub fn decode_controls(raw: &[u8]) -> LdapResult<Vec<LdapControl>> {
    if raw.is_empty() {
        return Ok(Vec::new());
    }
    let decoded: Vec<BerControl> = rasn::ber::decode(raw)
        .map_err(|e| LdapError::MalformedMessage(format!("bad controls encoding: {e}")))?;
    let mut out = Vec::with_capacity(decoded.len());
    for c in decoded {
        let oid = String::from_utf8(c.control_type.to_vec())
            .map_err(|_| LdapError::MalformedMessage("control OID is not UTF-8".into()))?;
        out.push(LdapControl {
            oid,
            criticality: c.criticality,
            value: c.control_value.map(Into::into),
        });
    }
    Ok(out)
}

/// Encodes controls as a BER `SEQUENCE OF Control`, omitting `criticality`
/// when false.
pub fn write_controls(controls: &[LdapControl]) -> LdapResult<Vec<u8>> {
    let wire: Vec<BerControl> = controls
        .iter()
        .map(|c| BerControl {
            control_type: Bytes::copy_from_slice(c.oid.as_bytes()).into(),
            criticality: c.criticality,
            control_value: c.value.clone().map(Into::into),
        })
        .collect();
    rasn::ber::encode(&wire)
        .map_err(|e| LdapError::operations_error(format!("control encoding failed: {e}")))
}

/// Rejects any critical control that is unknown or inapplicable to the
/// operation. Unbind requests ignore criticality entirely.
pub fn vet_controls(
    reg: &ControlRegistry,
    controls: &[LdapControl],
    op: OpType,
    ignore_criticality: bool,
) -> LdapResult<()> {
    if ignore_criticality {
        return Ok(());
    }
    for c in controls {
        if !c.criticality {
            continue;
        }
        match reg.lookup(&c.oid) {
            Some(ops) if ops & op.bit() != 0 => {}
            Some(_) => {
                debug!(oid = %c.oid, op = op.name(), "critical control not applicable");
                return Err(LdapError::UnavailableCriticalExtension(c.oid.clone()));
            }
            None => {
                debug!(oid = %c.oid, "critical control not registered");
                return Err(LdapError::UnavailableCriticalExtension(c.oid.clone()));
            }
        }
    }
    Ok(())
}

/// Decodes and vets request controls in one step.
pub fn get_ldapmessage_controls(
    reg: &ControlRegistry,
    raw: &[u8],
    op: OpType,
    ignore_criticality: bool,
) -> LdapResult<Vec<LdapControl>> {
    let controls = decode_controls(raw)?;
    vet_controls(reg, &controls, op, ignore_criticality)?;
    Ok(controls)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded() -> ControlRegistry {
        let reg = ControlRegistry::new();
        init_controls(&reg);
        reg
    }

    #[test]
    fn registry_lookup() {
        let reg = seeded();
        assert_eq!(reg.lookup(oids::PERSISTENT_SEARCH), Some(OpType::Search.bit()));
        assert_eq!(reg.lookup(oids::PROXIED_AUTH_V2), Some(OPS_ALL));
        assert_eq!(reg.lookup("1.2.3.4"), None);
    }

    #[test]
    fn codec_roundtrips_and_omits_false_criticality() {
        let controls = vec![
            LdapControl::new(oids::MANAGEDSAIT, true, None),
            LdapControl::new(
                oids::SORT_REQUEST,
                false,
                Some(Bytes::from_static(b"\x30\x00")),
            ),
        ];
        let encoded = write_controls(&controls).unwrap();
        // Exactly one BER TRUE (0xFF) appears: the FALSE criticality is
        // omitted from the encoding per RFC 4511.
        assert_eq!(encoded.iter().filter(|&&b| b == 0xff).count(), 1);
        let decoded = decode_controls(&encoded).unwrap();
        assert_eq!(decoded, controls);
    }

    #[test]
    fn critical_unknown_control_is_rejected() {
        let reg = seeded();
        let controls = vec![LdapControl::new("1.2.3.4.5.6.7", true, None)];
        let err = vet_controls(&reg, &controls, OpType::Search, false).unwrap_err();
        assert!(matches!(err, LdapError::UnavailableCriticalExtension(_)));
    }

    #[test]
    fn critical_control_on_wrong_operation_is_rejected() {
        let reg = seeded();
        let controls = vec![LdapControl::new(oids::PERSISTENT_SEARCH, true, None)];
        assert!(vet_controls(&reg, &controls, OpType::Search, false).is_ok());
        let err = vet_controls(&reg, &controls, OpType::Modify, false).unwrap_err();
        assert!(matches!(err, LdapError::UnavailableCriticalExtension(_)));
    }

    #[test]
    fn unbind_ignores_criticality() {
        let reg = seeded();
        let controls = vec![LdapControl::new("1.2.3.4.5.6.7", true, None)];
        assert!(vet_controls(&reg, &controls, OpType::Unbind, true).is_ok());
    }

    #[test]
    fn non_critical_unknown_controls_pass() {
        let reg = seeded();
        let controls = vec![LdapControl::new("1.2.3.4.5.6.7", false, None)];
        assert!(vet_controls(&reg, &controls, OpType::Search, false).is_ok());
    }
}
