//! Internal operations: the same-process path through the full pipeline.
//!
//! Results are delivered to callback handlers instead of a wire writer,
//! and connection-local limits do not apply.

use std::sync::Arc;

use parking_lot::Mutex;

use ferrodir_core::dn::{Scope, Sdn};
use ferrodir_core::entry::{Entry, Mod};
use ferrodir_core::error::{LdapError, LdapResult, ResultCode};
use ferrodir_core::filter::Filter;

use crate::control::LdapControl;
use crate::core::ServerCore;
use crate::dispatch::dispatch_operation;
use crate::operation::{OpFlags, OpType, Operation};
use crate::pblock::{PbKey, PbValue, Pblock, ResultHandler};

/// Handler collecting entries and the final result.
#[derive(Default)]
struct CollectHandler {
    entries: Mutex<Vec<Entry>>,
    outcome: Mutex<Option<(ResultCode, String)>>,
}

impl ResultHandler for CollectHandler {
    fn on_result(
        &self,
        code: ResultCode,
        _matched: Option<&str>,
        text: Option<&str>,
        _controls: &[LdapControl],
    ) {
        *self.outcome.lock() = Some((code, text.unwrap_or_default().to_owned()));
    }

    fn on_entry(&self, entry: &Entry) {
        self.entries.lock().push(entry.clone());
    }
}

fn finish(handler: &CollectHandler) -> LdapResult<()> {
    match handler.outcome.lock().clone() {
        Some((code, text)) if !code.is_success() => Err(LdapError::from_code(code, text)),
        _ => Ok(()),
    }
}

fn internal_pb(op_type: OpType, flags: OpFlags, target: &Sdn) -> (Pblock, Arc<CollectHandler>) {
    let handler = Arc::new(CollectHandler::default());
    let mut pb = Pblock::new();
    pb.set(
        PbKey::Operation,
        PbValue::Operation(Arc::new(Operation::internal(op_type, flags))),
    );
    pb.set(PbKey::TargetSdn, PbValue::Sdn(target.clone()));
    pb.set_handler(handler.clone());
    (pb, handler)
}

/// Synchronous in-process search; returns the matching entries.
pub fn search_internal(
    core: &ServerCore,
    base: &Sdn,
    scope: Scope,
    filter: &str,
    attrs: Option<Vec<String>>,
    flags: OpFlags,
) -> LdapResult<Vec<Entry>> {
    let filter = Filter::parse(filter)?;
    let (mut pb, handler) = internal_pb(OpType::Search, flags, base);
    pb.set(PbKey::SearchScope, PbValue::Scope(scope));
    pb.set(PbKey::SearchFilter, PbValue::Filter(Box::new(filter)));
    if let Some(attrs) = attrs {
        pb.set(PbKey::SearchAttrs, PbValue::StrList(attrs));
    }
    dispatch_operation(core, &mut pb)?;
    finish(&handler)?;
    let entries = std::mem::take(&mut *handler.entries.lock());
    Ok(entries)
}

/// Synchronous in-process add.
pub fn add_internal(core: &ServerCore, entry: Entry, flags: OpFlags) -> LdapResult<()> {
    let (mut pb, handler) = internal_pb(OpType::Add, flags, entry.sdn());
    pb.set(PbKey::AddEntry, PbValue::Entry(Box::new(entry)));
    dispatch_operation(core, &mut pb)?;
    finish(&handler)
}

/// Synchronous in-process modify.
pub fn modify_internal(
    core: &ServerCore,
    target: &Sdn,
    mods: Vec<Mod>,
    flags: OpFlags,
) -> LdapResult<()> {
    let (mut pb, handler) = internal_pb(OpType::Modify, flags, target);
    pb.set(PbKey::ModifyMods, PbValue::Mods(mods));
    dispatch_operation(core, &mut pb)?;
    finish(&handler)
}

/// Synchronous in-process delete.
pub fn delete_internal(core: &ServerCore, target: &Sdn, flags: OpFlags) -> LdapResult<()> {
    let (mut pb, handler) = internal_pb(OpType::Delete, flags, target);
    dispatch_operation(core, &mut pb)?;
    finish(&handler)
}

/// Fetches a single entry by DN, or `NoSuchObject`.
pub fn search_internal_get_entry(
    core: &ServerCore,
    dn: &Sdn,
    attrs: Option<Vec<String>>,
) -> LdapResult<Entry> {
    let mut entries = search_internal(
        core,
        dn,
        Scope::Base,
        "(objectclass=*)",
        attrs,
        OpFlags::empty(),
    )?;
    entries
        .pop()
        .ok_or_else(|| LdapError::no_such_object(dn.as_ndn()))
}
