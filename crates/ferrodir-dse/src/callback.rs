//! DSE callback registration.
//!
//! Callbacks attach to an `(operation, phase, base, scope, filter)` tuple.
//! Pre callbacks may veto an add/modify/delete or transform entries during
//! load and dump; Post callbacks are advisory.

use std::sync::Arc;

use uuid::Uuid;

use ferrodir_core::dn::{Scope, Sdn};
use ferrodir_core::entry::Entry;
use ferrodir_core::error::ResultCode;
use ferrodir_core::filter::Filter;

/// The DSE operation a callback hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DseOperation {
    Read,
    Add,
    Delete,
    Modify,
    ModRdn,
    Search,
    Write,
}

/// Whether the callback runs before or after the operation applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DsePhase {
    Pre,
    Post,
}

/// What a callback decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    /// Proceed normally.
    Ok,
    /// Skip this entry without failing the operation.
    DoNotApply,
    /// Veto the operation.
    Error,
}

/// Callback outcome plus the result code and text a veto carries.
#[derive(Debug, Clone)]
pub struct DseCallbackResult {
    pub status: CallbackStatus,
    pub code: Option<ResultCode>,
    pub text: Option<String>,
}

impl DseCallbackResult {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: CallbackStatus::Ok,
            code: None,
            text: None,
        }
    }

    #[must_use]
    pub fn do_not_apply() -> Self {
        Self {
            status: CallbackStatus::DoNotApply,
            code: None,
            text: None,
        }
    }

    #[must_use]
    pub fn veto(code: ResultCode, text: impl Into<String>) -> Self {
        Self {
            status: CallbackStatus::Error,
            code: Some(code),
            text: Some(text.into()),
        }
    }
}

/// Callback body. Receives the entry before the change (when one exists)
/// and a mutable view of the entry being produced (when one exists).
pub type DseCallbackFn =
    Arc<dyn Fn(Option<&Entry>, Option<&mut Entry>) -> DseCallbackResult + Send + Sync>;

/// A registered callback.
#[derive(Clone)]
pub struct DseCallback {
    pub id: Uuid,
    pub operation: DseOperation,
    pub phase: DsePhase,
    pub base: Sdn,
    pub scope: Scope,
    pub filter: Option<Filter>,
    pub func: DseCallbackFn,
}

impl DseCallback {
    #[must_use]
    pub fn new(
        operation: DseOperation,
        phase: DsePhase,
        base: Sdn,
        scope: Scope,
        filter: Option<Filter>,
        func: DseCallbackFn,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            phase,
            base,
            scope,
            filter,
            func,
        }
    }

    /// Whether this callback applies to an entry at `sdn` matching `entry`
    /// for the given operation and phase.
    #[must_use]
    pub fn applies(
        &self,
        operation: DseOperation,
        phase: DsePhase,
        sdn: &Sdn,
        entry: Option<&Entry>,
    ) -> bool {
        if self.operation != operation || self.phase != phase {
            return false;
        }
        if !sdn.in_scope(&self.base, self.scope) {
            return false;
        }
        match (&self.filter, entry) {
            (Some(f), Some(e)) => f.matches(e),
            (Some(_), None) => false,
            (None, _) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn applies_respects_scope_and_filter() {
        let cb = DseCallback::new(
            DseOperation::Add,
            DsePhase::Pre,
            Sdn::new("cn=plugins,cn=config").unwrap(),
            Scope::Subtree,
            Some(Filter::parse("(objectclass=nsslapdplugin)").unwrap()),
            Arc::new(|_, _| DseCallbackResult::ok()),
        );
        let sdn = Sdn::new("cn=acl,cn=plugins,cn=config").unwrap();
        let mut entry = Entry::new(sdn.clone());
        entry
            .add_values("objectClass", vec!["nsSlapdPlugin".into()], false)
            .unwrap();
        assert!(cb.applies(DseOperation::Add, DsePhase::Pre, &sdn, Some(&entry)));
        assert!(!cb.applies(DseOperation::Delete, DsePhase::Pre, &sdn, Some(&entry)));
        let outside = Sdn::new("cn=elsewhere,cn=config").unwrap();
        assert!(!cb.applies(DseOperation::Add, DsePhase::Pre, &outside, Some(&entry)));
    }
}
