//! Backends: named storage providers owning DN suffixes.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use ferrodir_core::dn::Sdn;
use ferrodir_core::entry::Entry;
use ferrodir_core::error::{LdapError, LdapResult};

use crate::pblock::Pblock;

/// Backend lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeState {
    Stopped,
    Started,
    Deleted,
}

/// How a backend resolved a bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindDisposition {
    /// Credentials verified; the connection is authenticated.
    Success,
    /// Anonymous simple bind; succeed without binding an identity.
    Anonymous,
    /// The backend refused; the result is already on the pblock.
    Fail,
}

/// Entry-point slots a backend may implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendSlot {
    Bind,
    Unbind,
    Search,
    NextSearchEntry,
    Compare,
    Modify,
    ModRdn,
    Add,
    Delete,
    Abandon,
    Start,
    Close,
}

/// The database entry points. The dispatcher invokes these after the preop
/// stages; a backend reports failure by returning the error (the dispatcher
/// folds it into the result).
pub trait BackendOps: Send + Sync {
    fn bind(&self, pb: &mut Pblock) -> LdapResult<BindDisposition>;

    fn unbind(&self, _pb: &mut Pblock) -> LdapResult<()> {
        Ok(())
    }

    fn search(&self, pb: &mut Pblock) -> LdapResult<()>;

    /// Streams the next entry of the current result set.
    fn next_search_entry(&self, pb: &mut Pblock) -> LdapResult<Option<Entry>>;

    fn compare(&self, pb: &mut Pblock) -> LdapResult<bool>;

    fn modify(&self, pb: &mut Pblock) -> LdapResult<()>;

    fn modrdn(&self, pb: &mut Pblock) -> LdapResult<()>;

    fn add(&self, pb: &mut Pblock) -> LdapResult<()>;

    fn delete(&self, pb: &mut Pblock) -> LdapResult<()>;

    fn abandon(&self, _pb: &mut Pblock) -> LdapResult<()> {
        Ok(())
    }

    fn start(&self, _pb: &mut Pblock) -> LdapResult<()> {
        Ok(())
    }

    fn close(&self, _pb: &mut Pblock) -> LdapResult<()> {
        Ok(())
    }

    fn supports(&self, _slot: BackendSlot) -> bool {
        true
    }
}

/// Backend flag bits.
pub mod be_flags {
    /// The backend fronts data held elsewhere.
    pub const REMOTE_DATA: u32 = 1 << 0;
}

const DEFAULT_SIZELIMIT: i64 = 2000;
const DEFAULT_TIMELIMIT: i64 = 3600;

/// A backend descriptor. Suffixes are append-only for the descriptor's
/// lifetime: an `Arc<Sdn>` handed to a reader stays valid as the array
/// grows.
pub struct Backend {
    name: String,
    be_type: String,
    private: bool,
    log_changes: AtomicBool,
    suffixes: RwLock<Vec<Arc<Sdn>>>,
    state: Mutex<BeState>,
    readonly: AtomicBool,
    flags: AtomicU32,
    sizelimit: AtomicI64,
    timelimit: AtomicI64,
    ops: RwLock<Option<Arc<dyn BackendOps>>>,
    /// Serializes backend-wide maintenance (import, reindex) against
    /// concurrent readers.
    maint_lock: RwLock<()>,
}

impl Backend {
    #[must_use]
    pub fn new(name: &str, be_type: &str, private: bool, log_changes: bool) -> Self {
        Self {
            name: name.to_owned(),
            be_type: be_type.to_owned(),
            private,
            log_changes: AtomicBool::new(log_changes),
            suffixes: RwLock::new(Vec::new()),
            state: Mutex::new(BeState::Stopped),
            readonly: AtomicBool::new(false),
            flags: AtomicU32::new(0),
            sizelimit: AtomicI64::new(DEFAULT_SIZELIMIT),
            timelimit: AtomicI64::new(DEFAULT_TIMELIMIT),
            ops: RwLock::new(None),
            maint_lock: RwLock::new(()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The backend type, unless the backend is deleted.
    #[must_use]
    pub fn be_type(&self) -> Option<&str> {
        if self.is_deleted() {
            None
        } else {
            Some(&self.be_type)
        }
    }

    #[must_use]
    pub fn is_private(&self) -> bool {
        self.private
    }

    /// Whether changes in this backend feed the changelog.
    #[must_use]
    pub fn log_changes(&self) -> bool {
        !self.is_deleted() && self.log_changes.load(AtomicOrdering::SeqCst)
    }

    #[must_use]
    pub fn state(&self) -> BeState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: BeState) {
        *self.state.lock() = state;
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.state() == BeState::Deleted
    }

    /// Appends a suffix. Suffixes are never removed.
    pub fn add_suffix(&self, sdn: Sdn) {
        if self.is_deleted() {
            return;
        }
        self.suffixes.write().push(Arc::new(sdn));
    }

    /// Snapshot of the owned suffixes; empty once deleted.
    #[must_use]
    pub fn suffixes(&self) -> Vec<Arc<Sdn>> {
        if self.is_deleted() {
            return Vec::new();
        }
        self.suffixes.read().clone()
    }

    /// Whether `sdn` exactly matches one of the registered suffixes.
    #[must_use]
    pub fn issuffix(&self, sdn: &Sdn) -> bool {
        !self.is_deleted() && self.suffixes.read().iter().any(|s| s.as_ref() == sdn)
    }

    /// Longest registered suffix that `target` falls under, with its length
    /// in RDNs, for backend selection.
    #[must_use]
    pub fn best_suffix_match(&self, target: &Sdn) -> Option<usize> {
        if self.is_deleted() {
            return None;
        }
        self.suffixes
            .read()
            .iter()
            .filter(|s| target.issuffix(s))
            .map(|s| s.rdn_count())
            .max()
    }

    pub fn set_readonly(&self, v: bool) {
        self.readonly.store(v, AtomicOrdering::SeqCst);
    }

    #[must_use]
    pub fn is_readonly(&self) -> bool {
        !self.is_deleted() && self.readonly.load(AtomicOrdering::SeqCst)
    }

    pub fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, AtomicOrdering::SeqCst);
    }

    #[must_use]
    pub fn is_flag_set(&self, flag: u32) -> bool {
        !self.is_deleted() && self.flags.load(AtomicOrdering::SeqCst) & flag != 0
    }

    pub fn set_sizelimit(&self, v: i64) {
        self.sizelimit.store(v, AtomicOrdering::SeqCst);
    }

    #[must_use]
    pub fn sizelimit(&self) -> i64 {
        self.sizelimit.load(AtomicOrdering::SeqCst)
    }

    pub fn set_timelimit(&self, v: i64) {
        self.timelimit.store(v, AtomicOrdering::SeqCst);
    }

    #[must_use]
    pub fn timelimit(&self) -> i64 {
        self.timelimit.load(AtomicOrdering::SeqCst)
    }

    /// Installs the database entry points.
    pub fn set_ops(&self, ops: Arc<dyn BackendOps>) {
        *self.ops.write() = Some(ops);
    }

    /// The entry points; `None` once deleted or before installation.
    #[must_use]
    pub fn ops(&self) -> Option<Arc<dyn BackendOps>> {
        if self.is_deleted() {
            return None;
        }
        self.ops.read().clone()
    }

    /// Whether a specific entry-point slot is available.
    #[must_use]
    pub fn entrypoint(&self, slot: BackendSlot) -> bool {
        self.ops().is_some_and(|o| o.supports(slot))
    }

    /// Runs the start entry point and transitions Stopped to Started.
    pub fn start(&self, pb: &mut Pblock) -> LdapResult<()> {
        if self.state() != BeState::Stopped {
            return Ok(());
        }
        if let Some(ops) = self.ops() {
            ops.start(pb)?;
        }
        self.set_state(BeState::Started);
        debug!(backend = %self.name, "backend started");
        Ok(())
    }

    /// Takes the maintenance write lock for whole-backend operations.
    pub fn maintenance_guard(&self) -> parking_lot::RwLockWriteGuard<'_, ()> {
        self.maint_lock.write()
    }

    /// Takes the shared side of the maintenance lock for normal reads.
    pub fn read_guard(&self) -> parking_lot::RwLockReadGuard<'_, ()> {
        self.maint_lock.read()
    }
}

/// The set of registered backends plus the backend of last resort.
pub struct BackendRegistry {
    backends: RwLock<Vec<Arc<Backend>>>,
    default_backend: Arc<Backend>,
}

impl BackendRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            backends: RwLock::new(Vec::new()),
            default_backend: crate::defbackend::create_default_backend(),
        }
    }

    /// Creates and registers a backend.
    pub fn be_new(
        &self,
        name: &str,
        be_type: &str,
        private: bool,
        log_changes: bool,
    ) -> LdapResult<Arc<Backend>> {
        let mut backends = self.backends.write();
        if backends.iter().any(|b| b.name() == name) {
            return Err(LdapError::AlreadyExists(format!("backend {name}")));
        }
        let be = Arc::new(Backend::new(name, be_type, private, log_changes));
        backends.push(be.clone());
        Ok(be)
    }

    /// Selects the backend owning the longest suffix of `target`; ties go
    /// to the earliest registration. Falls back to the default backend.
    #[must_use]
    pub fn select(&self, target: &Sdn) -> Arc<Backend> {
        let backends = self.backends.read();
        let mut best: Option<(usize, &Arc<Backend>)> = None;
        for be in backends.iter() {
            if let Some(len) = be.best_suffix_match(target) {
                let better = match best {
                    Some((best_len, _)) => len > best_len,
                    None => true,
                };
                if better {
                    best = Some((len, be));
                }
            }
        }
        best.map(|(_, be)| be.clone())
            .unwrap_or_else(|| self.default_backend.clone())
    }

    #[must_use]
    pub fn select_by_name(&self, name: &str) -> Option<Arc<Backend>> {
        self.backends
            .read()
            .iter()
            .find(|b| b.name() == name)
            .cloned()
    }

    #[must_use]
    pub fn default_backend(&self) -> Arc<Backend> {
        self.default_backend.clone()
    }

    #[must_use]
    pub fn all(&self) -> Vec<Arc<Backend>> {
        self.backends.read().clone()
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
