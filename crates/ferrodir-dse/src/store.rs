//! The DSE store: the server's own configuration entries.
//!
//! An ordered in-memory tree of entries keyed by normalized DN, paired with
//! a text record file. The tree's ordering puts ancestors before
//! descendants so that a dump reloads correctly; equality is still plain
//! normalized-DN equality.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use ferrodir_core::dn::{self, Scope, Sdn};
use ferrodir_core::entry::{Entry, Mod};
use ferrodir_core::error::{LdapError, LdapResult};
use ferrodir_core::filter::Filter;
use ferrodir_core::value::Value;

use crate::callback::{
    CallbackStatus, DseCallback, DseCallbackResult, DseOperation, DsePhase,
};

const NUMSUBORDINATES: &str = "numsubordinates";

/// File set backing a DSE store.
#[derive(Debug, Clone)]
pub struct DsePaths {
    pub file: PathBuf,
    pub tmpfile: PathBuf,
    pub backfile: PathBuf,
    pub startokfile: PathBuf,
}

impl DsePaths {
    /// The conventional file set inside a configuration directory.
    #[must_use]
    pub fn in_config_dir(dir: &Path) -> Self {
        Self {
            file: dir.join("dse.ldif"),
            tmpfile: dir.join("dse.ldif.tmp"),
            backfile: dir.join("dse.ldif.bak"),
            startokfile: dir.join("dse.ldif.startOK"),
        }
    }
}

/// Tree key: equality is normalized-DN equality, but the order puts an
/// ancestor before every entry in its subtree so the serialized file loads
/// back correctly.
#[derive(Debug, Clone, PartialEq, Eq)]
struct DseKey(Sdn);

impl PartialOrd for DseKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DseKey {
    fn cmp(&self, other: &Self) -> Ordering {
        let a = self.0.as_ndn();
        let b = other.0.as_ndn();
        if a == b {
            return Ordering::Equal;
        }
        if dn::issuffix(a, b) {
            return Ordering::Greater;
        }
        if dn::issuffix(b, a) {
            return Ordering::Less;
        }
        let ra = dn::split_rdns(a);
        let rb = dn::split_rdns(b);
        match ra.len().cmp(&rb.len()) {
            Ordering::Equal => {
                // Same depth: compare from the suffix end inward.
                for (x, y) in ra.iter().rev().zip(rb.iter().rev()) {
                    match x.cmp(y) {
                        Ordering::Equal => {}
                        o => return o,
                    }
                }
                Ordering::Equal
            }
            o => o,
        }
    }
}

/// Per-request flags for DSE mutations.
#[derive(Debug, Clone, Copy, Default)]
pub struct DseOpFlags {
    /// Update the tree but skip the file rewrite.
    pub dont_write_file: bool,
    /// On a duplicate add, merge attributes into the resident entry.
    pub merge: bool,
}

/// The in-memory configuration store.
pub struct DseStore {
    paths: Option<DsePaths>,
    filelist: Vec<PathBuf>,
    tree: RwLock<BTreeMap<DseKey, Entry>>,
    callbacks: RwLock<Vec<DseCallback>>,
    dont_ever_write: AtomicBool,
    is_updateable: AtomicBool,
    readonly: AtomicBool,
    write_operational_attrs: AtomicBool,
    warned_not_updateable: AtomicBool,
}

impl DseStore {
    /// Creates a store backed by files, probing whether they are writable.
    #[must_use]
    pub fn new(paths: DsePaths, filelist: Vec<PathBuf>) -> Self {
        let updateable = [&paths.file, &paths.backfile, &paths.tmpfile]
            .iter()
            .all(|p| can_write(p));
        if !updateable {
            warn!(file = %paths.file.display(), "DSE files are not writable; updates will be refused");
        }
        Self {
            paths: Some(paths),
            filelist,
            tree: RwLock::new(BTreeMap::new()),
            callbacks: RwLock::new(Vec::new()),
            dont_ever_write: AtomicBool::new(false),
            is_updateable: AtomicBool::new(updateable),
            readonly: AtomicBool::new(false),
            write_operational_attrs: AtomicBool::new(true),
            warned_not_updateable: AtomicBool::new(false),
        }
    }

    /// Creates a store with no backing files; every write is a no-op. Used
    /// by offline tools and tests.
    #[must_use]
    pub fn new_in_memory() -> Self {
        Self {
            paths: None,
            filelist: Vec::new(),
            tree: RwLock::new(BTreeMap::new()),
            callbacks: RwLock::new(Vec::new()),
            dont_ever_write: AtomicBool::new(false),
            is_updateable: AtomicBool::new(true),
            readonly: AtomicBool::new(false),
            write_operational_attrs: AtomicBool::new(true),
            warned_not_updateable: AtomicBool::new(false),
        }
    }

    /// Inhibits every file write. Used by offline tooling.
    pub fn set_dont_ever_write(&self, v: bool) {
        self.dont_ever_write.store(v, AtomicOrdering::SeqCst);
    }

    pub fn set_readonly(&self, v: bool) {
        self.readonly.store(v, AtomicOrdering::SeqCst);
    }

    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.readonly.load(AtomicOrdering::SeqCst)
    }

    pub fn set_write_operational_attrs(&self, v: bool) {
        self.write_operational_attrs.store(v, AtomicOrdering::SeqCst);
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.tree.read().len()
    }

    // ---- callback registry ----

    pub fn register_callback(&self, cb: DseCallback) -> Uuid {
        let id = cb.id;
        self.callbacks.write().push(cb);
        id
    }

    pub fn unregister_callback(&self, id: Uuid) {
        self.callbacks.write().retain(|cb| cb.id != id);
    }

    /// Runs matching callbacks. The first veto wins; `DoNotApply` is
    /// reported so entry-shaping paths (read, write, search) can skip.
    fn call_callbacks(
        &self,
        operation: DseOperation,
        phase: DsePhase,
        sdn: &Sdn,
        before: Option<&Entry>,
        after: Option<&mut Entry>,
    ) -> DseCallbackResult {
        let callbacks = self.callbacks.read();
        let mut after = after;
        for cb in callbacks.iter() {
            let match_entry = match (&after, before) {
                (Some(e), _) => Some(&**e),
                (None, Some(e)) => Some(e),
                (None, None) => None,
            };
            if !cb.applies(operation, phase, sdn, match_entry) {
                continue;
            }
            let result = (cb.func)(before, after.as_deref_mut());
            match result.status {
                CallbackStatus::Ok => {}
                CallbackStatus::DoNotApply | CallbackStatus::Error => return result,
            }
        }
        DseCallbackResult::ok()
    }

    fn veto_to_error(result: &DseCallbackResult, what: &str) -> LdapError {
        let code = result
            .code
            .unwrap_or(ferrodir_core::error::ResultCode::UnwillingToPerform);
        let text = result
            .text
            .clone()
            .unwrap_or_else(|| format!("{what} vetoed by DSE callback"));
        LdapError::from_code(code, text)
    }

    fn check_writable(&self) -> LdapResult<()> {
        if self.is_readonly() {
            return Err(LdapError::unwilling(
                "DSE backend is in read-only mode",
            ));
        }
        Ok(())
    }

    // ---- load ----

    /// Loads the primary file (falling back to the backup copy when the
    /// primary is missing or empty) and then any auxiliary files, which
    /// merge into resident entries. After a successful primary load the
    /// start-OK copy is refreshed.
    pub fn load(&self) -> LdapResult<()> {
        let Some(paths) = self.paths.clone() else {
            return Ok(());
        };
        check_file(&paths.file, &paths.backfile);
        if paths.file.exists() {
            let text = fs::read_to_string(&paths.file)?;
            self.load_records(&text, false)?;
            if let Err(e) = fs::copy(&paths.file, &paths.startokfile) {
                warn!(error = %e, "could not refresh the startOK copy");
            }
        }
        for aux in &self.filelist {
            if aux.exists() {
                let text = fs::read_to_string(aux)?;
                self.load_records(&text, true)?;
            }
        }
        info!(entries = self.entry_count(), "DSE load complete");
        Ok(())
    }

    fn load_records(&self, text: &str, merge: bool) -> LdapResult<()> {
        for record in split_records(text) {
            let mut entry = match Entry::from_ldif(record) {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "skipping unparseable DSE record");
                    continue;
                }
            };
            // numSubordinates is recomputed, never trusted from the file.
            if entry.has_attr(NUMSUBORDINATES) {
                let _ = entry.delete_values(NUMSUBORDINATES, &[]);
            }
            let sdn = entry.sdn().clone();
            let result = self.call_callbacks(
                DseOperation::Read,
                DsePhase::Pre,
                &sdn,
                None,
                Some(&mut entry),
            );
            match result.status {
                CallbackStatus::Ok => {}
                CallbackStatus::DoNotApply => continue,
                CallbackStatus::Error => {
                    warn!(dn = sdn.as_ndn(), "read callback rejected entry");
                    continue;
                }
            }
            let mut tree = self.tree.write();
            Self::insert_locked(&mut tree, entry, merge);
        }
        Ok(())
    }

    fn insert_locked(tree: &mut BTreeMap<DseKey, Entry>, entry: Entry, merge: bool) {
        let key = DseKey(entry.sdn().clone());
        if let Some(resident) = tree.get_mut(&key) {
            if merge {
                for attr in entry.attrs() {
                    let values: Vec<Value> = attr.values().iter().cloned().collect();
                    let _ = resident.add_values(attr.name(), values, true);
                }
            } else {
                warn!(dn = entry.sdn().as_ndn(), "ignoring duplicate DSE entry");
            }
            return;
        }
        let ndn = entry.sdn().as_ndn().to_owned();
        tree.insert(key, entry);
        Self::update_numsub_locked(tree, &ndn, 1);
    }

    // ---- operations ----

    /// Adds an entry. Pre callbacks may veto; `numSubordinates` of a
    /// resident parent is maintained; the file is rewritten unless the
    /// flags say otherwise.
    pub fn add_entry(&self, mut entry: Entry, flags: DseOpFlags) -> LdapResult<()> {
        self.check_writable()?;
        let sdn = entry.sdn().clone();
        let result = self.call_callbacks(
            DseOperation::Add,
            DsePhase::Pre,
            &sdn,
            None,
            Some(&mut entry),
        );
        if result.status == CallbackStatus::Error {
            return Err(Self::veto_to_error(&result, "add"));
        }
        let added = {
            let mut tree = self.tree.write();
            let key = DseKey(sdn.clone());
            if tree.contains_key(&key) {
                if !flags.merge {
                    return Err(LdapError::AlreadyExists(sdn.as_ndn().to_owned()));
                }
                Self::insert_locked(&mut tree, entry.clone(), true);
            } else {
                Self::insert_locked(&mut tree, entry.clone(), false);
            }
            if !flags.dont_write_file {
                self.write_file_locked(&tree)?;
            }
            true
        };
        if added {
            self.call_callbacks(DseOperation::Add, DsePhase::Post, &sdn, None, Some(&mut entry));
        }
        Ok(())
    }

    /// Applies a modification list to an entry.
    pub fn modify_entry(&self, sdn: &Sdn, mods: &[Mod], flags: DseOpFlags) -> LdapResult<()> {
        self.check_writable()?;
        let before = self
            .get_entry(sdn)
            .ok_or_else(|| LdapError::no_such_object(sdn.as_ndn()))?;
        let mut after = before.clone();
        after.apply_mods(mods)?;
        let result = self.call_callbacks(
            DseOperation::Modify,
            DsePhase::Pre,
            sdn,
            Some(&before),
            Some(&mut after),
        );
        if result.status == CallbackStatus::Error {
            return Err(Self::veto_to_error(&result, "modify"));
        }
        {
            let mut tree = self.tree.write();
            tree.insert(DseKey(sdn.clone()), after.clone());
            if !flags.dont_write_file {
                self.write_file_locked(&tree)?;
            }
        }
        self.call_callbacks(
            DseOperation::Modify,
            DsePhase::Post,
            sdn,
            Some(&before),
            Some(&mut after),
        );
        Ok(())
    }

    /// Deletes an entry.
    pub fn delete_entry(&self, sdn: &Sdn, flags: DseOpFlags) -> LdapResult<()> {
        self.check_writable()?;
        let before = self
            .get_entry(sdn)
            .ok_or_else(|| LdapError::no_such_object(sdn.as_ndn()))?;
        let result =
            self.call_callbacks(DseOperation::Delete, DsePhase::Pre, sdn, Some(&before), None);
        if result.status == CallbackStatus::Error {
            return Err(Self::veto_to_error(&result, "delete"));
        }
        {
            let mut tree = self.tree.write();
            tree.remove(&DseKey(sdn.clone()));
            Self::update_numsub_locked(&mut tree, sdn.as_ndn(), -1);
            if !flags.dont_write_file {
                self.write_file_locked(&tree)?;
            }
        }
        self.call_callbacks(DseOperation::Delete, DsePhase::Post, sdn, Some(&before), None);
        Ok(())
    }

    /// Fetches a copy of an entry.
    #[must_use]
    pub fn get_entry(&self, sdn: &Sdn) -> Option<Entry> {
        self.tree.read().get(&DseKey(sdn.clone())).cloned()
    }

    /// Searches the store. Search Pre callbacks may drop individual entries
    /// from the candidate set before the filter applies.
    pub fn search(&self, base: &Sdn, scope: Scope, filter: &Filter) -> LdapResult<Vec<Entry>> {
        let tree = self.tree.read();
        let mut out = Vec::new();
        for entry in tree.values() {
            if !entry.sdn().in_scope(base, scope) {
                continue;
            }
            let mut candidate = entry.clone();
            let sdn = candidate.sdn().clone();
            let result = self.call_callbacks(
                DseOperation::Search,
                DsePhase::Pre,
                &sdn,
                None,
                Some(&mut candidate),
            );
            if result.status != CallbackStatus::Ok {
                continue;
            }
            if filter.matches(&candidate) {
                out.push(candidate);
            }
        }
        Ok(out)
    }

    // ---- file writing ----

    /// Rewrites the record file from the tree.
    pub fn write_file(&self) -> LdapResult<()> {
        let tree = self.tree.write();
        self.write_file_locked(&tree)
    }

    /// The write itself; the caller holds the tree lock so the dump cannot
    /// interleave with a mutation.
    fn write_file_locked(&self, tree: &BTreeMap<DseKey, Entry>) -> LdapResult<()> {
        if self.dont_ever_write.load(AtomicOrdering::SeqCst) {
            return Ok(());
        }
        let Some(paths) = &self.paths else {
            return Ok(());
        };
        if !self.is_updateable.load(AtomicOrdering::SeqCst) {
            if !self.warned_not_updateable.swap(true, AtomicOrdering::SeqCst) {
                error!(
                    file = %paths.file.display(),
                    "cannot write DSE file: files are not updateable"
                );
            }
            return Err(LdapError::unwilling("DSE files are not updateable"));
        }

        let write_operational = self.write_operational_attrs.load(AtomicOrdering::SeqCst);
        let mut out = match fs::File::create(&paths.tmpfile) {
            Ok(f) => f,
            Err(e) => {
                error!(file = %paths.tmpfile.display(), error = %e, "cannot open temporary DSE file");
                return Err(e.into());
            }
        };
        for entry in tree.values() {
            // Work on a copy: the write callback may rewrite the entry, and
            // the resident tree data must not change under a dump.
            let mut copy = entry.clone();
            let sdn = copy.sdn().clone();
            let result = self.call_callbacks(
                DseOperation::Write,
                DsePhase::Pre,
                &sdn,
                None,
                Some(&mut copy),
            );
            if result.status != CallbackStatus::Ok {
                continue;
            }
            out.write_all(copy.to_ldif(write_operational).as_bytes())?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        drop(out);

        if paths.file.exists() {
            if let Err(e) = fs::rename(&paths.file, &paths.backfile) {
                warn!(error = %e, "cannot back up DSE file");
            }
        }
        if let Err(e) = fs::rename(&paths.tmpfile, &paths.file) {
            error!(error = %e, "cannot install new DSE file");
            return Err(e.into());
        }
        debug!(file = %paths.file.display(), "DSE file rewritten");
        Ok(())
    }

    /// Adjusts the parent's `numSubordinates` when a child appears or goes
    /// away. The attribute is removed entirely when the count reaches zero.
    fn update_numsub_locked(tree: &mut BTreeMap<DseKey, Entry>, child_ndn: &str, delta: i64) {
        let Some(parent_ndn) = dn::parent(child_ndn) else {
            return;
        };
        let key = DseKey(Sdn::from_ndn(parent_ndn));
        let Some(parent) = tree.get_mut(&key) else {
            return;
        };
        let count = parent
            .first_value_str(NUMSUBORDINATES)
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        let updated = count + delta;
        if updated <= 0 {
            let _ = parent.delete_values(NUMSUBORDINATES, &[]);
        } else {
            let mut v = Value::from(updated.to_string());
            v.set_operational(true);
            let _ = parent.replace_values(NUMSUBORDINATES, vec![v]);
        }
    }
}

fn can_write(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(md) => !md.permissions().readonly(),
        Err(_) => path
            .parent()
            .map(|p| if p.as_os_str().is_empty() { Path::new(".") } else { p })
            .is_some_and(|p| fs::metadata(p).map_or(false, |md| !md.permissions().readonly())),
    }
}

/// Falls back to the backup copy when the primary file is missing or empty.
fn check_file(file: &Path, backup: &Path) {
    let primary_ok = fs::metadata(file).map_or(false, |md| md.len() > 0);
    if primary_ok {
        return;
    }
    let backup_ok = fs::metadata(backup).map_or(false, |md| md.len() > 0);
    if backup_ok {
        warn!(
            file = %file.display(),
            backup = %backup.display(),
            "primary DSE file missing or empty; restoring from backup"
        );
        if let Err(e) = fs::copy(backup, file) {
            error!(error = %e, "could not restore DSE file from backup");
        }
    }
}

/// Splits file text into records separated by blank lines.
fn split_records(text: &str) -> impl Iterator<Item = &str> {
    text.split("\n\n")
        .flat_map(|chunk| chunk.split("\r\n\r\n"))
        .map(str::trim)
        .filter(|chunk| {
            // A chunk of nothing but comments is not a record.
            !chunk.is_empty() && chunk.lines().any(|l| !l.starts_with('#'))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entry(dn: &str, attrs: &[(&str, &str)]) -> Entry {
        let mut e = Entry::new(Sdn::new(dn).unwrap());
        for (ty, val) in attrs {
            e.add_values(ty, vec![Value::from(*val)], false).unwrap();
        }
        e
    }

    fn seeded_store() -> DseStore {
        let store = DseStore::new_in_memory();
        store
            .add_entry(entry("cn=config", &[("cn", "config")]), DseOpFlags::default())
            .unwrap();
        store
            .add_entry(
                entry("cn=plugins,cn=config", &[("cn", "plugins")]),
                DseOpFlags::default(),
            )
            .unwrap();
        store
    }

    #[test]
    fn ancestors_sort_before_descendants() {
        let mut keys = vec![
            DseKey(Sdn::new("cn=acl,cn=plugins,cn=config").unwrap()),
            DseKey(Sdn::new("cn=config").unwrap()),
            DseKey(Sdn::new("cn=plugins,cn=config").unwrap()),
        ];
        keys.sort();
        let order: Vec<&str> = keys.iter().map(|k| k.0.as_ndn()).collect();
        assert_eq!(
            order,
            vec![
                "cn=config",
                "cn=plugins,cn=config",
                "cn=acl,cn=plugins,cn=config"
            ]
        );
    }

    #[test]
    fn add_and_get_roundtrip() {
        let store = seeded_store();
        let got = store.get_entry(&Sdn::new("CN=Plugins, CN=Config").unwrap()).unwrap();
        assert_eq!(got.first_value_str("cn"), Some("plugins"));
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let store = seeded_store();
        let err = store
            .add_entry(entry("cn=config", &[("cn", "config")]), DseOpFlags::default())
            .unwrap_err();
        assert!(matches!(err, LdapError::AlreadyExists(_)));
    }

    #[test]
    fn numsubordinates_tracks_children() {
        let store = seeded_store();
        let config = store.get_entry(&Sdn::new("cn=config").unwrap()).unwrap();
        assert_eq!(config.first_value_str(NUMSUBORDINATES), Some("1"));

        store
            .add_entry(
                entry("cn=backends,cn=config", &[("cn", "backends")]),
                DseOpFlags::default(),
            )
            .unwrap();
        let config = store.get_entry(&Sdn::new("cn=config").unwrap()).unwrap();
        assert_eq!(config.first_value_str(NUMSUBORDINATES), Some("2"));

        store
            .delete_entry(&Sdn::new("cn=backends,cn=config").unwrap(), DseOpFlags::default())
            .unwrap();
        store
            .delete_entry(&Sdn::new("cn=plugins,cn=config").unwrap(), DseOpFlags::default())
            .unwrap();
        let config = store.get_entry(&Sdn::new("cn=config").unwrap()).unwrap();
        assert!(!config.has_attr(NUMSUBORDINATES));
    }

    #[test]
    fn modify_applies_mods() {
        let store = seeded_store();
        let sdn = Sdn::new("cn=config").unwrap();
        store
            .modify_entry(
                &sdn,
                &[Mod::new(
                    ferrodir_core::entry::ModOp::Replace,
                    "nsslapd-readonly",
                    vec!["on".into()],
                )],
                DseOpFlags::default(),
            )
            .unwrap();
        let e = store.get_entry(&sdn).unwrap();
        assert_eq!(e.first_value_str("nsslapd-readonly"), Some("on"));
    }

    #[test]
    fn pre_callback_can_veto_add() {
        let store = seeded_store();
        store.register_callback(DseCallback::new(
            DseOperation::Add,
            DsePhase::Pre,
            Sdn::new("cn=config").unwrap(),
            Scope::Subtree,
            None,
            Arc::new(|_, _| {
                DseCallbackResult::veto(
                    ferrodir_core::error::ResultCode::UnwillingToPerform,
                    "config is frozen",
                )
            }),
        ));
        let err = store
            .add_entry(entry("cn=frozen,cn=config", &[("cn", "frozen")]), DseOpFlags::default())
            .unwrap_err();
        assert!(matches!(err, LdapError::UnwillingToPerform(_)));
        assert!(store.get_entry(&Sdn::new("cn=frozen,cn=config").unwrap()).is_none());
    }

    #[test]
    fn search_honors_scope_and_filter() {
        let store = seeded_store();
        let base = Sdn::new("cn=config").unwrap();
        let all = store
            .search(&base, Scope::Subtree, &Filter::parse("(cn=*)").unwrap())
            .unwrap();
        assert_eq!(all.len(), 2);
        let one = store
            .search(&base, Scope::OneLevel, &Filter::parse("(cn=plugins)").unwrap())
            .unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].sdn().as_ndn(), "cn=plugins,cn=config");
        let none = store
            .search(&base, Scope::Base, &Filter::parse("(cn=plugins)").unwrap())
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn readonly_store_refuses_writes() {
        let store = seeded_store();
        store.set_readonly(true);
        let err = store
            .add_entry(entry("cn=x,cn=config", &[("cn", "x")]), DseOpFlags::default())
            .unwrap_err();
        assert!(matches!(err, LdapError::UnwillingToPerform(_)));
    }

    #[test]
    fn records_split_on_blank_lines() {
        let text = "# comment only\n\ndn: cn=a\ncn: a\n\ndn: cn=b\ncn: b\n";
        let records: Vec<&str> = split_records(text).collect();
        assert_eq!(records.len(), 2);
    }
}
