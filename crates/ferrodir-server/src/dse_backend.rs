//! The DSE store mounted as a backend, serving `cn=config` and the root
//! DSE through the regular dispatch pipeline.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::debug;

use ferrodir_core::dn::Scope;
use ferrodir_core::entry::Entry;
use ferrodir_core::error::{LdapError, LdapResult};
use ferrodir_core::filter::Filter;
use ferrodir_core::value::Value;
use ferrodir_dse::{DseOpFlags, DseStore};

use crate::backend::{BackendOps, BindDisposition};
use crate::metrics;
use crate::operation::LDAP_AUTH_SIMPLE;
use crate::pblock::{PbKey, PbValue, Pblock};

/// Backend adapter over the DSE store.
pub struct DseBackend {
    store: Arc<DseStore>,
}

impl DseBackend {
    #[must_use]
    pub fn new(store: Arc<DseStore>) -> Self {
        Self { store }
    }

    fn target(pb: &Pblock) -> LdapResult<ferrodir_core::dn::Sdn> {
        pb.target_sdn()
            .cloned()
            .ok_or(LdapError::InvalidKey("target-sdn"))
    }

    fn op_flags(pb: &Pblock) -> DseOpFlags {
        let get_bool = |key| matches!(pb.get(key), Some(PbValue::Bool(true)));
        DseOpFlags {
            dont_write_file: get_bool(PbKey::DseDontWriteWhenAdding),
            merge: get_bool(PbKey::DseMergeWhenAdding),
        }
    }
}

impl BackendOps for DseBackend {
    fn bind(&self, pb: &mut Pblock) -> LdapResult<BindDisposition> {
        let method = match pb.get(PbKey::BindMethod) {
            Some(PbValue::Int(m)) => *m,
            _ => 0,
        };
        let creds = match pb.get(PbKey::BindCredentials) {
            Some(PbValue::Bytes(b)) => b.clone(),
            _ => bytes::Bytes::new(),
        };
        if method != LDAP_AUTH_SIMPLE {
            return Err(LdapError::InappropriateAuth(
                "only simple binds reach the DSE backend".into(),
            ));
        }
        if creds.is_empty() {
            metrics::ANONYMOUS_BINDS.inc();
            return Ok(BindDisposition::Anonymous);
        }
        let target = Self::target(pb)?;
        let entry = self
            .store
            .get_entry(&target)
            .ok_or_else(|| LdapError::no_such_object(target.as_ndn()))?;
        let probe = Value::new(creds);
        let matched = entry
            .attr("userPassword")
            .is_some_and(|a| a.find_value(&probe).is_some());
        if matched {
            pb.set(PbKey::BindTargetEntry, PbValue::Entry(Box::new(entry)));
            Ok(BindDisposition::Success)
        } else {
            debug!(dn = target.as_ndn(), "DSE bind credential mismatch");
            Err(LdapError::InvalidCredentials)
        }
    }

    fn search(&self, pb: &mut Pblock) -> LdapResult<()> {
        let base = Self::target(pb)?;
        let scope = match pb.get(PbKey::SearchScope) {
            Some(PbValue::Scope(s)) => *s,
            _ => Scope::Subtree,
        };
        let filter = match pb.get(PbKey::SearchFilter) {
            Some(PbValue::Filter(f)) => (**f).clone(),
            _ => Filter::Present("objectclass".into()),
        };
        let results = self.store.search(&base, scope, &filter)?;
        debug!(base = base.as_ndn(), hits = results.len(), "DSE search");
        pb.set(
            PbKey::SearchResultSet,
            PbValue::EntryList(VecDeque::from(results)),
        );
        Ok(())
    }

    fn next_search_entry(&self, pb: &mut Pblock) -> LdapResult<Option<Entry>> {
        Ok(pb.pop_search_entry())
    }

    fn compare(&self, pb: &mut Pblock) -> LdapResult<bool> {
        let target = Self::target(pb)?;
        let (ty, value) = match pb.get(PbKey::CompareAva) {
            Some(PbValue::Ava(ty, v)) => (ty.clone(), v.clone()),
            _ => return Err(LdapError::InvalidKey("compare-ava")),
        };
        let entry = self
            .store
            .get_entry(&target)
            .ok_or_else(|| LdapError::no_such_object(target.as_ndn()))?;
        let attr = entry
            .attr(&ty)
            .ok_or_else(|| LdapError::NoSuchAttribute(ty.clone()))?;
        Ok(attr.find_value(&value).is_some())
    }

    fn modify(&self, pb: &mut Pblock) -> LdapResult<()> {
        let target = Self::target(pb)?;
        let mods = match pb.get(PbKey::ModifyMods) {
            Some(PbValue::Mods(m)) => m.clone(),
            _ => return Err(LdapError::InvalidKey("modify-mods")),
        };
        self.store.modify_entry(&target, &mods, Self::op_flags(pb))
    }

    fn modrdn(&self, _pb: &mut Pblock) -> LdapResult<()> {
        Err(LdapError::unwilling(
            "modrdn is not supported on the DSE backend",
        ))
    }

    fn add(&self, pb: &mut Pblock) -> LdapResult<()> {
        let entry = match pb.get(PbKey::AddEntry) {
            Some(PbValue::Entry(e)) => (**e).clone(),
            _ => return Err(LdapError::InvalidKey("add-entry")),
        };
        self.store.add_entry(entry, Self::op_flags(pb))
    }

    fn delete(&self, pb: &mut Pblock) -> LdapResult<()> {
        let target = Self::target(pb)?;
        self.store.delete_entry(&target, Self::op_flags(pb))
    }
}
