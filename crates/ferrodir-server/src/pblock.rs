//! The parameter block: the dynamically keyed operation context handed
//! through every pipeline stage.
//!
//! Well-known keys live in a fixed dense table; plugin-private keys spill
//! into a side map. Values own their contents, so releasing a pblock frees
//! exactly what it holds.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;

use ferrodir_core::dn::{Scope, Sdn};
use ferrodir_core::entry::{Entry, Mod};
use ferrodir_core::error::{LdapError, LdapResult, ResultCode};
use ferrodir_core::filter::Filter;
use ferrodir_core::value::Value;

use crate::backend::Backend;
use crate::control::LdapControl;
use crate::operation::Operation;
use crate::plugin::{Plugin, PluginIdentity};

/// Receiver for operation results. The wire layer implements this over a
/// BER writer; internal operations implement it over closures.
pub trait ResultHandler: Send + Sync {
    fn on_result(
        &self,
        code: ResultCode,
        matched: Option<&str>,
        text: Option<&str>,
        controls: &[LdapControl],
    );

    fn on_entry(&self, entry: &Entry);

    fn on_referral(&self, _url: &str) {}
}

/// Keys addressing pblock slots. The named keys occupy the dense table;
/// `PluginPrivate` keys spill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PbKey {
    Operation,
    TargetSdn,
    AddEntry,
    ModifyMods,
    ResultCode,
    ResultText,
    ResultMatched,
    PluginIdentity,
    Backend,
    RequestorSdn,
    SearchAttrs,
    SearchScope,
    SearchFilter,
    SearchSizeLimit,
    SearchTimeLimit,
    BindMethod,
    BindCredentials,
    BindTargetEntry,
    ReqControls,
    ResControls,
    ManagedSait,
    PwPolicyRequested,
    Plugin,
    DseDontWriteWhenAdding,
    DseMergeWhenAdding,
    SearchResultSet,
    CompareAva,
    /// A key private to one plugin.
    PluginPrivate(u16),
}

const PB_HEAD: usize = 27;

impl PbKey {
    const fn dense_index(self) -> Option<usize> {
        Some(match self {
            Self::Operation => 0,
            Self::TargetSdn => 1,
            Self::AddEntry => 2,
            Self::ModifyMods => 3,
            Self::ResultCode => 4,
            Self::ResultText => 5,
            Self::ResultMatched => 6,
            Self::PluginIdentity => 7,
            Self::Backend => 8,
            Self::RequestorSdn => 9,
            Self::SearchAttrs => 10,
            Self::SearchScope => 11,
            Self::SearchFilter => 12,
            Self::SearchSizeLimit => 13,
            Self::SearchTimeLimit => 14,
            Self::BindMethod => 15,
            Self::BindCredentials => 16,
            Self::BindTargetEntry => 17,
            Self::ReqControls => 18,
            Self::ResControls => 19,
            Self::ManagedSait => 20,
            Self::PwPolicyRequested => 21,
            Self::Plugin => 22,
            Self::DseDontWriteWhenAdding => 23,
            Self::DseMergeWhenAdding => 24,
            Self::SearchResultSet => 25,
            Self::CompareAva => 26,
            Self::PluginPrivate(_) => return None,
        })
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Operation => "operation",
            Self::TargetSdn => "target-sdn",
            Self::AddEntry => "add-entry",
            Self::ModifyMods => "modify-mods",
            Self::ResultCode => "result-code",
            Self::ResultText => "result-text",
            Self::ResultMatched => "result-matched",
            Self::PluginIdentity => "plugin-identity",
            Self::Backend => "backend",
            Self::RequestorSdn => "requestor-sdn",
            Self::SearchAttrs => "search-attrs",
            Self::SearchScope => "search-scope",
            Self::SearchFilter => "search-filter",
            Self::SearchSizeLimit => "search-sizelimit",
            Self::SearchTimeLimit => "search-timelimit",
            Self::BindMethod => "bind-method",
            Self::BindCredentials => "bind-credentials",
            Self::BindTargetEntry => "bind-target-entry",
            Self::ReqControls => "request-controls",
            Self::ResControls => "response-controls",
            Self::ManagedSait => "managedsait",
            Self::PwPolicyRequested => "pwpolicy",
            Self::Plugin => "plugin",
            Self::DseDontWriteWhenAdding => "dse-dont-write-when-adding",
            Self::DseMergeWhenAdding => "dse-merge-when-adding",
            Self::SearchResultSet => "search-result-set",
            Self::CompareAva => "compare-ava",
            Self::PluginPrivate(_) => "plugin-private",
        }
    }
}

/// A pblock slot value.
#[derive(Clone)]
pub enum PbValue {
    Int(i64),
    Bool(bool),
    Str(String),
    Bytes(Bytes),
    Sdn(Sdn),
    Entry(Box<Entry>),
    EntryList(VecDeque<Entry>),
    Mods(Vec<Mod>),
    Controls(Vec<LdapControl>),
    Scope(Scope),
    Filter(Box<Filter>),
    StrList(Vec<String>),
    Code(ResultCode),
    Ava(String, Value),
    Backend(Arc<Backend>),
    Plugin(Arc<Plugin>),
    Operation(Arc<Operation>),
    Identity(PluginIdentity),
    Opaque(Arc<dyn Any + Send + Sync>),
}

impl std::fmt::Debug for PbValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int(v) => f.debug_tuple("Int").field(v).finish(),
            Self::Bool(v) => f.debug_tuple("Bool").field(v).finish(),
            Self::Str(v) => f.debug_tuple("Str").field(v).finish(),
            Self::Bytes(v) => f.debug_tuple("Bytes").field(v).finish(),
            Self::Sdn(v) => f.debug_tuple("Sdn").field(v).finish(),
            Self::Entry(v) => f.debug_tuple("Entry").field(v).finish(),
            Self::EntryList(v) => f.debug_tuple("EntryList").field(v).finish(),
            Self::Mods(v) => f.debug_tuple("Mods").field(v).finish(),
            Self::Controls(v) => f.debug_tuple("Controls").field(v).finish(),
            Self::Scope(v) => f.debug_tuple("Scope").field(v).finish(),
            Self::Filter(v) => f.debug_tuple("Filter").field(v).finish(),
            Self::StrList(v) => f.debug_tuple("StrList").field(v).finish(),
            Self::Code(v) => f.debug_tuple("Code").field(v).finish(),
            Self::Ava(k, v) => f.debug_tuple("Ava").field(k).field(v).finish(),
            Self::Backend(_) => f.debug_tuple("Backend").finish(),
            Self::Plugin(_) => f.debug_tuple("Plugin").finish(),
            Self::Operation(_) => f.debug_tuple("Operation").finish(),
            Self::Identity(v) => f.debug_tuple("Identity").field(v).finish(),
            Self::Opaque(_) => f.debug_tuple("Opaque").finish(),
        }
    }
}

/// The per-operation parameter block.
pub struct Pblock {
    head: [Option<PbValue>; PB_HEAD],
    spill: HashMap<u16, PbValue>,
    handler: Option<Arc<dyn ResultHandler>>,
    result_sent: bool,
}

impl Default for Pblock {
    fn default() -> Self {
        Self::new()
    }
}

impl Pblock {
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: std::array::from_fn(|_| None),
            spill: HashMap::new(),
            handler: None,
            result_sent: false,
        }
    }

    /// Stores a value. Writes are always accepted.
    pub fn set(&mut self, key: PbKey, value: PbValue) {
        match key.dense_index() {
            Some(i) => self.head[i] = Some(value),
            None => {
                if let PbKey::PluginPrivate(k) = key {
                    self.spill.insert(k, value);
                }
            }
        }
    }

    #[must_use]
    pub fn get(&self, key: PbKey) -> Option<&PbValue> {
        match key.dense_index() {
            Some(i) => self.head[i].as_ref(),
            None => match key {
                PbKey::PluginPrivate(k) => self.spill.get(&k),
                _ => None,
            },
        }
    }

    pub fn take(&mut self, key: PbKey) -> Option<PbValue> {
        match key.dense_index() {
            Some(i) => self.head[i].take(),
            None => match key {
                PbKey::PluginPrivate(k) => self.spill.remove(&k),
                _ => None,
            },
        }
    }

    /// A read that must succeed; absent keys surface as `InvalidKey`.
    pub fn require(&self, key: PbKey) -> LdapResult<&PbValue> {
        self.get(key).ok_or(LdapError::InvalidKey(key.name()))
    }

    pub fn set_handler(&mut self, handler: Arc<dyn ResultHandler>) {
        self.handler = Some(handler);
    }

    #[must_use]
    pub fn handler(&self) -> Option<Arc<dyn ResultHandler>> {
        self.handler.clone()
    }

    #[must_use]
    pub fn result_sent(&self) -> bool {
        self.result_sent
    }

    pub fn mark_result_sent(&mut self) {
        self.result_sent = true;
    }

    // ---- typed accessors ----

    #[must_use]
    pub fn operation(&self) -> Option<Arc<Operation>> {
        match self.get(PbKey::Operation) {
            Some(PbValue::Operation(op)) => Some(op.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn target_sdn(&self) -> Option<&Sdn> {
        match self.get(PbKey::TargetSdn) {
            Some(PbValue::Sdn(sdn)) => Some(sdn),
            _ => None,
        }
    }

    #[must_use]
    pub fn requestor_sdn(&self) -> Option<&Sdn> {
        match self.get(PbKey::RequestorSdn) {
            Some(PbValue::Sdn(sdn)) => Some(sdn),
            _ => None,
        }
    }

    #[must_use]
    pub fn backend(&self) -> Option<Arc<Backend>> {
        match self.get(PbKey::Backend) {
            Some(PbValue::Backend(be)) => Some(be.clone()),
            _ => None,
        }
    }

    #[must_use]
    pub fn plugin_identity(&self) -> Option<&PluginIdentity> {
        match self.get(PbKey::PluginIdentity) {
            Some(PbValue::Identity(id)) => Some(id),
            _ => None,
        }
    }

    #[must_use]
    pub fn req_controls(&self) -> &[LdapControl] {
        match self.get(PbKey::ReqControls) {
            Some(PbValue::Controls(c)) => c,
            _ => &[],
        }
    }

    /// Appends a control to the response set.
    pub fn add_response_control(&mut self, control: LdapControl) {
        if let Some(PbValue::Controls(c)) = self.get_mut(PbKey::ResControls) {
            c.push(control);
            return;
        }
        self.set(PbKey::ResControls, PbValue::Controls(vec![control]));
    }

    fn get_mut(&mut self, key: PbKey) -> Option<&mut PbValue> {
        match key.dense_index() {
            Some(i) => self.head[i].as_mut(),
            None => match key {
                PbKey::PluginPrivate(k) => self.spill.get_mut(&k),
                _ => None,
            },
        }
    }

    /// Pops the next entry of the backend's staged search result set.
    pub fn pop_search_entry(&mut self) -> Option<Entry> {
        if let Some(PbValue::EntryList(list)) = self.get_mut(PbKey::SearchResultSet) {
            list.pop_front()
        } else {
            None
        }
    }

    /// Records the operation outcome the final response will carry.
    pub fn set_result(&mut self, code: ResultCode, text: impl Into<String>) {
        self.set(PbKey::ResultCode, PbValue::Code(code));
        let text = text.into();
        if !text.is_empty() {
            self.set(PbKey::ResultText, PbValue::Str(text));
        }
    }

    /// Records an error as the operation outcome.
    pub fn set_result_err(&mut self, err: &LdapError) {
        self.set_result(err.result_code(), err.to_string());
    }

    #[must_use]
    pub fn result_code(&self) -> Option<ResultCode> {
        match self.get(PbKey::ResultCode) {
            Some(PbValue::Code(c)) => Some(*c),
            _ => None,
        }
    }

    #[must_use]
    pub fn result_text(&self) -> Option<&str> {
        match self.get(PbKey::ResultText) {
            Some(PbValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// Frees the keys the dispatcher owns, in key-specific order: mods
    /// before the target SDN before the operation, then everything else.
    pub fn done(&mut self) {
        self.take(PbKey::ModifyMods);
        self.take(PbKey::AddEntry);
        self.take(PbKey::TargetSdn);
        self.take(PbKey::Operation);
        self.head = std::array::from_fn(|_| None);
        self.spill.clear();
        self.handler = None;
        self.result_sent = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{OpFlags, OpType};

    #[test]
    fn set_get_take_roundtrip() {
        let mut pb = Pblock::new();
        pb.set(PbKey::ResultText, PbValue::Str("diag".into()));
        assert!(matches!(pb.get(PbKey::ResultText), Some(PbValue::Str(s)) if s == "diag"));
        assert!(pb.take(PbKey::ResultText).is_some());
        assert!(pb.get(PbKey::ResultText).is_none());
    }

    #[test]
    fn unknown_key_read_is_invalid_key() {
        let pb = Pblock::new();
        let err = pb.require(PbKey::TargetSdn).unwrap_err();
        assert!(matches!(err, LdapError::InvalidKey("target-sdn")));
    }

    #[test]
    fn plugin_private_keys_spill() {
        let mut pb = Pblock::new();
        pb.set(PbKey::PluginPrivate(7), PbValue::Int(99));
        assert!(matches!(pb.get(PbKey::PluginPrivate(7)), Some(PbValue::Int(99))));
        assert!(pb.get(PbKey::PluginPrivate(8)).is_none());
    }

    #[test]
    fn typed_accessors() {
        let mut pb = Pblock::new();
        let op = Arc::new(Operation::new(OpType::Search, OpFlags::empty()));
        pb.set(PbKey::Operation, PbValue::Operation(op));
        pb.set(PbKey::TargetSdn, PbValue::Sdn(Sdn::new("cn=config").unwrap()));
        assert_eq!(pb.operation().unwrap().op_type(), OpType::Search);
        assert_eq!(pb.target_sdn().unwrap().as_ndn(), "cn=config");
    }

    #[test]
    fn done_clears_everything() {
        let mut pb = Pblock::new();
        pb.set(PbKey::ResultCode, PbValue::Code(ResultCode::Success));
        pb.set(PbKey::PluginPrivate(1), PbValue::Bool(true));
        pb.mark_result_sent();
        pb.done();
        assert!(pb.get(PbKey::ResultCode).is_none());
        assert!(pb.get(PbKey::PluginPrivate(1)).is_none());
        assert!(!pb.result_sent());
    }

    #[test]
    fn response_controls_accumulate() {
        let mut pb = Pblock::new();
        pb.add_response_control(LdapControl::new("1.2.3", false, None));
        pb.add_response_control(LdapControl::new("4.5.6", false, None));
        match pb.get(PbKey::ResControls) {
            Some(PbValue::Controls(c)) => assert_eq!(c.len(), 2),
            _ => panic!("controls missing"),
        }
    }
}
