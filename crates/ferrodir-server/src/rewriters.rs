//! Filter and computed-attribute rewriters, configured under
//! `cn=rewriters,cn=config`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use ferrodir_core::dn::{Scope, Sdn};
use ferrodir_core::entry::Entry;
use ferrodir_core::error::LdapResult;
use ferrodir_core::filter::Filter;
use ferrodir_core::value::Value;
use ferrodir_dse::{DseOpFlags, DseStore};

/// DN of the rewriter container.
pub const REWRITERS_CONTAINER_DN: &str = "cn=rewriters,cn=config";

/// Rewrites a search filter in place; returns zero when it applied.
pub type FilterRewriterFn = Arc<dyn Fn(&mut Filter) -> i32 + Send + Sync>;

/// Computes a virtual attribute value for an entry.
pub type ComputedAttrFn = Arc<dyn Fn(&str, &Entry) -> Option<Value> + Send + Sync>;

enum RewriterKind {
    Filter(FilterRewriterFn),
    ComputedAttr(ComputedAttrFn),
}

/// Named rewriter implementations plus the instances configured from the
/// DSE.
#[derive(Default)]
pub struct RewriterRegistry {
    factories: RwLock<HashMap<String, RewriterKind>>,
    filter_rewriters: RwLock<Vec<(String, FilterRewriterFn)>>,
    computed_attr_rewriters: RwLock<Vec<(String, ComputedAttrFn)>>,
}

impl RewriterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a filter rewriter implementation available under a name that
    /// config entries can reference.
    pub fn register_filter_factory(&self, name: &str, f: FilterRewriterFn) {
        self.factories
            .write()
            .insert(name.to_owned(), RewriterKind::Filter(f));
    }

    /// Makes a computed-attribute implementation available under a name.
    pub fn register_computed_attr_factory(&self, name: &str, f: ComputedAttrFn) {
        self.factories
            .write()
            .insert(name.to_owned(), RewriterKind::ComputedAttr(f));
    }

    /// Instantiates the rewriters named by one config entry.
    pub fn register_from_entry(&self, entry: &Entry) {
        let factories = self.factories.read();
        for name in entry
            .attr("nsslapd-filterrewriter")
            .into_iter()
            .flat_map(|a| a.values().iter())
            .filter_map(Value::as_str)
        {
            match factories.get(name) {
                Some(RewriterKind::Filter(f)) => {
                    self.filter_rewriters
                        .write()
                        .push((name.to_owned(), f.clone()));
                    info!(rewriter = name, "filter rewriter registered");
                }
                _ => warn!(rewriter = name, "unknown filter rewriter"),
            }
        }
        for name in entry
            .attr("nsslapd-returnedattrrewriter")
            .into_iter()
            .flat_map(|a| a.values().iter())
            .filter_map(Value::as_str)
        {
            match factories.get(name) {
                Some(RewriterKind::ComputedAttr(f)) => {
                    self.computed_attr_rewriters
                        .write()
                        .push((name.to_owned(), f.clone()));
                    info!(rewriter = name, "computed attribute rewriter registered");
                }
                _ => warn!(rewriter = name, "unknown computed attribute rewriter"),
            }
        }
    }

    /// Runs every filter rewriter over a filter.
    pub fn rewrite_filter(&self, filter: &mut Filter) {
        for (_, f) in self.filter_rewriters.read().iter() {
            f(filter);
        }
    }

    /// Asks the computed-attribute rewriters for a value.
    #[must_use]
    pub fn compute_attr(&self, ty: &str, entry: &Entry) -> Option<Value> {
        for (_, f) in self.computed_attr_rewriters.read().iter() {
            if let Some(v) = f(ty, entry) {
                return Some(v);
            }
        }
        None
    }

    #[must_use]
    pub fn filter_rewriter_count(&self) -> usize {
        self.filter_rewriters.read().len()
    }
}

/// Ensures the rewriter container entry exists, then instantiates
/// rewriters from its children.
pub fn rewriters_init(registry: &RewriterRegistry, dse: &DseStore) -> LdapResult<()> {
    let container = Sdn::new(REWRITERS_CONTAINER_DN)?;
    if dse.get_entry(&container).is_none() {
        let mut e = Entry::new(container.clone());
        e.add_values(
            "objectClass",
            vec!["top".into(), "nsContainer".into()],
            false,
        )?;
        e.add_values("cn", vec!["rewriters".into()], false)?;
        dse.add_entry(e, DseOpFlags::default())?;
    }
    let children = dse.search(
        &container,
        Scope::OneLevel,
        &Filter::parse("(objectclass=*)")?,
    )?;
    for child in &children {
        registry.register_from_entry(child);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_the_container_and_registers_children() {
        let dse = DseStore::new_in_memory();
        let mut config = Entry::new(Sdn::new("cn=config").unwrap());
        config.add_values("cn", vec!["config".into()], false).unwrap();
        dse.add_entry(config, DseOpFlags::default()).unwrap();

        let reg = RewriterRegistry::new();
        reg.register_filter_factory(
            "uid2cn",
            Arc::new(|f| {
                if let Filter::Equality(ty, _) = f {
                    if ty == "uid" {
                        *ty = "cn".into();
                    }
                }
                0
            }),
        );
        rewriters_init(&reg, &dse).unwrap();
        assert!(dse.get_entry(&Sdn::new(REWRITERS_CONTAINER_DN).unwrap()).is_some());
        assert_eq!(reg.filter_rewriter_count(), 0);

        let mut child = Entry::new(Sdn::new("cn=uid rewrite,cn=rewriters,cn=config").unwrap());
        child.add_values("cn", vec!["uid rewrite".into()], false).unwrap();
        child
            .add_values("nsslapd-filterrewriter", vec!["uid2cn".into()], false)
            .unwrap();
        dse.add_entry(child, DseOpFlags::default()).unwrap();
        rewriters_init(&reg, &dse).unwrap();
        assert_eq!(reg.filter_rewriter_count(), 1);

        let mut f = Filter::parse("(uid=bob)").unwrap();
        reg.rewrite_filter(&mut f);
        assert_eq!(f, Filter::Equality("cn".into(), "bob".into()));
    }

    #[test]
    fn computed_attrs_consult_rewriters_in_order() {
        let reg = RewriterRegistry::new();
        reg.register_computed_attr_factory(
            "echo-dn",
            Arc::new(|ty, e| {
                (ty == "entrydn").then(|| Value::from(e.sdn().as_ndn()))
            }),
        );
        let mut entry = Entry::new(Sdn::new("cn=container,cn=rewriters,cn=config").unwrap());
        entry
            .add_values("nsslapd-returnedattrrewriter", vec!["echo-dn".into()], false)
            .unwrap();
        reg.register_from_entry(&entry);
        let target = Entry::new(Sdn::new("cn=x").unwrap());
        assert_eq!(
            reg.compute_attr("entrydn", &target).and_then(|v| v.as_str().map(str::to_owned)),
            Some("cn=x".to_owned())
        );
        assert!(reg.compute_attr("other", &target).is_none());
    }
}
