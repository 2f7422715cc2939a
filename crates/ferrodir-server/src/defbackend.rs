//! The backend of last resort.
//!
//! Selected when no registered suffix matches the target DN. It answers
//! "no such object" for everything except anonymous simple binds, which it
//! accepts without binding an identity.

use std::sync::Arc;

use tracing::trace;

use ferrodir_core::entry::Entry;
use ferrodir_core::error::{LdapError, LdapResult};

use crate::backend::{be_flags, Backend, BackendOps, BeState, BindDisposition};
use crate::metrics;
use crate::operation::LDAP_AUTH_SIMPLE;
use crate::pblock::{PbKey, PbValue, Pblock};

pub const DEFBACKEND_TYPE: &str = "default";

struct DefaultBackendOps;

impl DefaultBackendOps {
    fn no_backend(pb: &Pblock) -> LdapError {
        let target = pb
            .target_sdn()
            .map(|s| s.as_dn().to_owned())
            .unwrap_or_default();
        LdapError::no_such_object(target)
    }
}

impl BackendOps for DefaultBackendOps {
    fn bind(&self, pb: &mut Pblock) -> LdapResult<BindDisposition> {
        let method = match pb.get(PbKey::BindMethod) {
            Some(PbValue::Int(m)) => *m,
            _ => 0,
        };
        let empty_creds = match pb.get(PbKey::BindCredentials) {
            Some(PbValue::Bytes(b)) => b.is_empty(),
            None => true,
            _ => false,
        };
        if method == LDAP_AUTH_SIMPLE && empty_creds {
            // A null bind succeeds but grants nothing and binds no identity.
            metrics::ANONYMOUS_BINDS.inc();
            return Ok(BindDisposition::Anonymous);
        }
        Err(Self::no_backend(pb))
    }

    fn search(&self, pb: &mut Pblock) -> LdapResult<()> {
        trace!("default backend search");
        Err(Self::no_backend(pb))
    }

    fn next_search_entry(&self, _pb: &mut Pblock) -> LdapResult<Option<Entry>> {
        Ok(None)
    }

    fn compare(&self, pb: &mut Pblock) -> LdapResult<bool> {
        Err(Self::no_backend(pb))
    }

    fn modify(&self, pb: &mut Pblock) -> LdapResult<()> {
        Err(Self::no_backend(pb))
    }

    fn modrdn(&self, pb: &mut Pblock) -> LdapResult<()> {
        Err(Self::no_backend(pb))
    }

    fn add(&self, pb: &mut Pblock) -> LdapResult<()> {
        Err(Self::no_backend(pb))
    }

    fn delete(&self, pb: &mut Pblock) -> LdapResult<()> {
        Err(Self::no_backend(pb))
    }
}

/// Builds the default backend, started and flagged as fronting remote data.
#[must_use]
pub fn create_default_backend() -> Arc<Backend> {
    let be = Arc::new(Backend::new(
        DEFBACKEND_TYPE,
        DEFBACKEND_TYPE,
        true,
        false,
    ));
    be.set_flag(be_flags::REMOTE_DATA);
    be.set_ops(Arc::new(DefaultBackendOps));
    be.set_state(BeState::Started);
    be
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn anonymous_simple_bind_is_accepted() {
        let be = create_default_backend();
        let mut pb = Pblock::new();
        pb.set(PbKey::BindMethod, PbValue::Int(LDAP_AUTH_SIMPLE));
        pb.set(PbKey::BindCredentials, PbValue::Bytes(Bytes::new()));
        let ops = be.ops().unwrap();
        assert_eq!(ops.bind(&mut pb).unwrap(), BindDisposition::Anonymous);
    }

    #[test]
    fn bind_with_credentials_is_refused() {
        let be = create_default_backend();
        let mut pb = Pblock::new();
        pb.set(PbKey::BindMethod, PbValue::Int(LDAP_AUTH_SIMPLE));
        pb.set(PbKey::BindCredentials, PbValue::Bytes(Bytes::from_static(b"secret")));
        let ops = be.ops().unwrap();
        assert!(matches!(
            ops.bind(&mut pb),
            Err(LdapError::NoSuchObject(_))
        ));
    }

    #[test]
    fn search_reports_no_such_object_and_streams_nothing() {
        let be = create_default_backend();
        let mut pb = Pblock::new();
        let ops = be.ops().unwrap();
        assert!(matches!(ops.search(&mut pb), Err(LdapError::NoSuchObject(_))));
        assert!(ops.next_search_entry(&mut pb).unwrap().is_none());
    }
}
