//! The staged operation dispatcher.
//!
//! Every request, wire or internal, runs preop plugins, then the backend
//! transaction preops, then the backend entry point, then the transaction
//! and backend postops, then the postop plugins. Preop failures veto the
//! operation; postop failures only get logged.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::{debug, warn};

use ferrodir_core::dn::Sdn;
use ferrodir_core::error::{LdapError, ResultCode};

use crate::backend::{Backend, BindDisposition};
use crate::control::{self, oids, LdapControl};
use crate::core::ServerCore;
use crate::metrics;
use crate::operation::{OpFlags, OpType, Operation, LDAP_AUTH_SIMPLE};
use crate::pblock::{PbKey, PbValue, Pblock};
use crate::plugin::FnSlot;
use crate::proxyauth::{self, ProxyIdentity};
use crate::pwpolicy::{self, PwVerdict};

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Maps a plugin integer return onto a result code.
fn code_from_rc(rc: i32) -> ResultCode {
    match rc {
        2 => ResultCode::ProtocolError,
        3 => ResultCode::TimeLimitExceeded,
        4 => ResultCode::SizeLimitExceeded,
        11 => ResultCode::AdminLimitExceeded,
        12 => ResultCode::UnavailableCriticalExtension,
        16 => ResultCode::NoSuchAttribute,
        19 => ResultCode::ConstraintViolation,
        20 => ResultCode::TypeOrValueExists,
        21 => ResultCode::InvalidSyntax,
        32 => ResultCode::NoSuchObject,
        34 => ResultCode::InvalidDnSyntax,
        48 => ResultCode::InappropriateAuth,
        49 => ResultCode::InvalidCredentials,
        50 => ResultCode::InsufficientAccess,
        51 => ResultCode::Busy,
        52 => ResultCode::Unavailable,
        53 => ResultCode::UnwillingToPerform,
        65 => ResultCode::ObjectClassViolation,
        68 => ResultCode::AlreadyExists,
        _ => ResultCode::OperationsError,
    }
}

fn pre_slot(op: OpType, internal: bool) -> Option<FnSlot> {
    Some(match (op, internal) {
        (OpType::Add, true) => FnSlot::InternalPreAdd,
        (OpType::Modify, true) => FnSlot::InternalPreModify,
        (OpType::Delete, true) => FnSlot::InternalPreDelete,
        (OpType::ModDn, true) => FnSlot::InternalPreModRdn,
        (OpType::Bind, _) => FnSlot::PreBind,
        (OpType::Unbind, _) => FnSlot::PreUnbind,
        (OpType::Search, _) => FnSlot::PreSearch,
        (OpType::Compare, _) => FnSlot::PreCompare,
        (OpType::Modify, _) => FnSlot::PreModify,
        (OpType::Add, _) => FnSlot::PreAdd,
        (OpType::Delete, _) => FnSlot::PreDelete,
        (OpType::ModDn, _) => FnSlot::PreModRdn,
        (OpType::Abandon, _) => FnSlot::PreAbandon,
        (OpType::Extended, _) => return None,
    })
}

fn post_slot(op: OpType, internal: bool) -> Option<FnSlot> {
    Some(match (op, internal) {
        (OpType::Add, true) => FnSlot::InternalPostAdd,
        (OpType::Modify, true) => FnSlot::InternalPostModify,
        (OpType::Delete, true) => FnSlot::InternalPostDelete,
        (OpType::ModDn, true) => FnSlot::InternalPostModRdn,
        (OpType::Bind, _) => FnSlot::PostBind,
        (OpType::Unbind, _) => FnSlot::PostUnbind,
        (OpType::Search, _) => FnSlot::PostSearch,
        (OpType::Compare, _) => FnSlot::PostCompare,
        (OpType::Modify, _) => FnSlot::PostModify,
        (OpType::Add, _) => FnSlot::PostAdd,
        (OpType::Delete, _) => FnSlot::PostDelete,
        (OpType::ModDn, _) => FnSlot::PostModRdn,
        (OpType::Abandon, _) => FnSlot::PostAbandon,
        (OpType::Extended, _) => return None,
    })
}

fn betxn_pre_slot(op: OpType) -> Option<FnSlot> {
    Some(match op {
        OpType::Modify => FnSlot::BeTxnPreModify,
        OpType::ModDn => FnSlot::BeTxnPreModRdn,
        OpType::Add => FnSlot::BeTxnPreAdd,
        OpType::Delete => FnSlot::BeTxnPreDelete,
        _ => return None,
    })
}

fn betxn_post_slot(op: OpType) -> Option<FnSlot> {
    Some(match op {
        OpType::Modify => FnSlot::BeTxnPostModify,
        OpType::ModDn => FnSlot::BeTxnPostModRdn,
        OpType::Add => FnSlot::BeTxnPostAdd,
        OpType::Delete => FnSlot::BeTxnPostDelete,
        _ => return None,
    })
}

fn bepost_slot(op: OpType) -> Option<FnSlot> {
    Some(match op {
        OpType::Modify => FnSlot::BePostModify,
        OpType::ModDn => FnSlot::BePostModRdn,
        OpType::Add => FnSlot::BePostAdd,
        OpType::Delete => FnSlot::BePostDelete,
        _ => return None,
    })
}

/// Sends the accumulated result through the pblock's handler, once.
pub fn send_result(pb: &mut Pblock) {
    if pb.result_sent() {
        return;
    }
    let code = pb.result_code().unwrap_or(ResultCode::Success);
    let text = pb.result_text().map(str::to_owned);
    let matched = match pb.get(PbKey::ResultMatched) {
        Some(PbValue::Str(s)) => Some(s.clone()),
        _ => None,
    };
    let controls = match pb.get(PbKey::ResControls) {
        Some(PbValue::Controls(c)) => c.clone(),
        _ => Vec::new(),
    };
    if let Some(handler) = pb.handler() {
        handler.on_result(code, matched.as_deref(), text.as_deref(), &controls);
    }
    pb.mark_result_sent();
}

/// Runs one operation through the full pipeline. The pblock must carry the
/// operation and target; the result is delivered through the handler.
pub fn dispatch_operation(core: &ServerCore, pb: &mut Pblock) -> ferrodir_core::error::LdapResult<()> {
    let op = pb
        .operation()
        .ok_or(LdapError::InvalidKey("operation"))?;
    let op_type = op.op_type();
    metrics::OPS_INITIATED.with_label_values(&[op_type.name()]).inc();

    // Read-only gate: writes are refused unless the issuing component is
    // marked as permitted.
    if op_type.is_write()
        && core.is_readonly()
        && !op.flags().contains(OpFlags::BYPASS_READONLY)
    {
        let permitted = pb.plugin_identity().is_some_and(|id| id.allow_updates);
        if !permitted {
            pb.set_result(ResultCode::UnwillingToPerform, "server is read-only");
            send_result(pb);
            return Ok(());
        }
    }

    // Backend selection by longest matching suffix.
    let target = pb.target_sdn().cloned().unwrap_or_else(Sdn::root);
    let be = match pb.backend() {
        Some(be) => be,
        None => {
            let be = core.backends().select(&target);
            pb.set(PbKey::Backend, PbValue::Backend(be.clone()));
            be
        }
    };
    if be.is_deleted() {
        pb.set_result(ResultCode::Unavailable, "backend has been deleted");
        send_result(pb);
        return Ok(());
    }
    debug!(op = op_type.name(), target = target.as_ndn(), backend = be.name(), "dispatching");

    // Controls: a critical control must be registered and applicable.
    let controls: Vec<LdapControl> = pb.req_controls().to_vec();
    if let Err(e) = control::vet_controls(
        core.controls(),
        &controls,
        op_type,
        op_type == OpType::Unbind,
    ) {
        pb.set_result_err(&e);
        send_result(pb);
        return Ok(());
    }
    pb.set(
        PbKey::ManagedSait,
        PbValue::Bool(control::find_control(&controls, oids::MANAGEDSAIT).is_some()),
    );
    pb.set(
        PbKey::PwPolicyRequested,
        PbValue::Bool(control::find_control(&controls, oids::PWPOLICY_REQUEST).is_some()),
    );

    // Proxied authorization replaces the effective requestor.
    match proxyauth::proxyauth_get_dn(&controls, core.rootdn_ndn()) {
        Ok(ProxyIdentity::None) => {}
        Ok(ProxyIdentity::Anonymous) => {
            pb.set(PbKey::RequestorSdn, PbValue::Sdn(Sdn::root()));
        }
        Ok(ProxyIdentity::Dn(sdn)) => {
            pb.set(PbKey::RequestorSdn, PbValue::Sdn(sdn));
        }
        Err(e) => {
            pb.set_result_err(&e);
            send_result(pb);
            return Ok(());
        }
    }

    // Access control, unless the operation explicitly waives it.
    if !op.flags().contains(OpFlags::NO_ACCESS_CHECK) {
        let rc = core.plugins().call_plugins(pb, FnSlot::AclAllowAccess);
        if rc != 0 {
            if pb.result_code().is_none() {
                pb.set_result(code_from_rc(rc), "access denied");
            }
            send_result(pb);
            return Ok(());
        }
    }

    // Preop: the first failing plugin vetoes the operation; the backend and
    // postops never run.
    if let Some(slot) = pre_slot(op_type, op.is_internal()) {
        let rc = core.plugins().call_plugins(pb, slot);
        if rc != 0 {
            if pb.result_code().is_none() {
                pb.set_result(code_from_rc(rc), "operation vetoed by preoperation plugin");
            }
            send_result(pb);
            return Ok(());
        }
    }

    match op_type {
        OpType::Bind => dispatch_bind(core, pb, &be),
        OpType::Search => dispatch_search(core, pb, &be, &op),
        _ => dispatch_generic(core, pb, &be, op_type),
    }

    // Postop: advisory only.
    if let Some(slot) = post_slot(op_type, op.is_internal()) {
        let rc = core.plugins().call_plugins(pb, slot);
        if rc != 0 {
            warn!(rc, "postoperation plugins reported failure");
        }
    }

    send_result(pb);
    Ok(())
}

fn dispatch_generic(core: &ServerCore, pb: &mut Pblock, be: &Arc<Backend>, op_type: OpType) {
    if op_type.is_write() {
        if let Some(slot) = betxn_pre_slot(op_type) {
            let rc = core.plugins().call_plugins(pb, slot);
            if rc != 0 {
                // The transaction rolls back; the error carries into postop.
                if pb.result_code().is_none() {
                    pb.set_result(code_from_rc(rc), "transaction preoperation failed");
                }
                return;
            }
        }
    }
    let Some(ops) = be.ops() else {
        pb.set_result(ResultCode::Unavailable, "backend not started");
        return;
    };
    let _guard = be.read_guard();
    let outcome = match op_type {
        OpType::Compare => ops.compare(pb).map(|matched| {
            let code = if matched {
                ResultCode::CompareTrue
            } else {
                ResultCode::CompareFalse
            };
            pb.set_result(code, "");
        }),
        OpType::Modify => ops.modify(pb),
        OpType::Add => ops.add(pb),
        OpType::Delete => ops.delete(pb),
        OpType::ModDn => ops.modrdn(pb),
        OpType::Unbind => ops.unbind(pb),
        OpType::Abandon => ops.abandon(pb),
        _ => Err(LdapError::operations_error("unroutable operation")),
    };
    if let Err(e) = outcome {
        pb.set_result_err(&e);
    }
    if op_type.is_write() {
        // Informational from here on: nothing can un-commit.
        if let Some(slot) = betxn_post_slot(op_type) {
            core.plugins().call_plugins(pb, slot);
        }
        if let Some(slot) = bepost_slot(op_type) {
            core.plugins().call_plugins(pb, slot);
        }
    }
}

fn dispatch_bind(core: &ServerCore, pb: &mut Pblock, be: &Arc<Backend>) {
    let method = match pb.get(PbKey::BindMethod) {
        Some(PbValue::Int(m)) => *m,
        _ => 0,
    };
    let empty_creds = match pb.get(PbKey::BindCredentials) {
        Some(PbValue::Bytes(b)) => b.is_empty(),
        None => true,
        _ => false,
    };
    // An anonymous simple bind always succeeds and binds no identity.
    if method == LDAP_AUTH_SIMPLE && empty_creds {
        metrics::ANONYMOUS_BINDS.inc();
        pb.set_result(ResultCode::Success, "");
        return;
    }
    let Some(ops) = be.ops() else {
        pb.set_result(ResultCode::Unavailable, "backend not started");
        return;
    };
    match ops.bind(pb) {
        Ok(BindDisposition::Anonymous) => {
            pb.set_result(ResultCode::Success, "");
        }
        Ok(BindDisposition::Fail) => {
            if pb.result_code().is_none() {
                pb.set_result(ResultCode::InvalidCredentials, "");
            }
        }
        Err(e) => pb.set_result_err(&e),
        Ok(BindDisposition::Success) => {
            let is_root = pb
                .target_sdn()
                .is_some_and(|s| core.is_rootdn(s.as_ndn()));
            if !is_root {
                let entry = match pb.take(PbKey::BindTargetEntry) {
                    Some(PbValue::Entry(e)) => Some(*e),
                    _ => None,
                };
                if let Some(mut entry) = entry {
                    let now = now_secs();
                    let policy = core.password_policy();
                    if let Err(e) = pwpolicy::check_account_lock(&entry, policy, now) {
                        pb.set_result_err(&e);
                        return;
                    }
                    match pwpolicy::need_new_pw(&mut entry, policy, now) {
                        Err(e) => {
                            pb.add_response_control(LdapControl::new(oids::PWEXPIRED, false, None));
                            pb.set_result_err(&e);
                            return;
                        }
                        Ok(PwVerdict::Warning { seconds_left }) => {
                            pb.add_response_control(LdapControl::new(
                                oids::PWEXPIRING,
                                false,
                                Some(Bytes::from(seconds_left.to_string())),
                            ));
                        }
                        Ok(PwVerdict::Grace { .. }) => {
                            pb.add_response_control(LdapControl::new(oids::PWEXPIRED, false, None));
                        }
                        Ok(PwVerdict::Ok) => {}
                    }
                    // The hooks may have consumed grace logins or set the
                    // warned flag; keep the updated entry for persistence.
                    pb.set(PbKey::BindTargetEntry, PbValue::Entry(Box::new(entry)));
                }
            }
            pb.set_result(ResultCode::Success, "");
        }
    }
}

fn dispatch_search(core: &ServerCore, pb: &mut Pblock, be: &Arc<Backend>, op: &Arc<Operation>) {
    let Some(ops) = be.ops() else {
        pb.set_result(ResultCode::Unavailable, "backend not started");
        return;
    };
    let _guard = be.read_guard();
    if let Err(e) = ops.search(pb) {
        pb.set_result_err(&e);
        return;
    }

    // The effective limit is the lowest of the backend default, the
    // operation's requested limit, and the configured maximum. Internal
    // operations are exempt from the connection-local defaults.
    let op_sizelimit = match pb.get(PbKey::SearchSizeLimit) {
        Some(PbValue::Int(n)) => Some(*n),
        _ => None,
    };
    let op_timelimit = match pb.get(PbKey::SearchTimeLimit) {
        Some(PbValue::Int(n)) => Some(*n),
        _ => None,
    };
    let sizelimit = if op.is_internal() {
        op_sizelimit.filter(|n| *n >= 0)
    } else {
        [
            Some(be.sizelimit()),
            op_sizelimit,
            Some(core.config().limits.sizelimit),
        ]
        .into_iter()
        .flatten()
        .filter(|n| *n >= 0)
        .min()
    };
    let timelimit = if op.is_internal() {
        op_timelimit.filter(|n| *n >= 0)
    } else {
        [
            Some(be.timelimit()),
            op_timelimit,
            Some(core.config().limits.timelimit),
        ]
        .into_iter()
        .flatten()
        .filter(|n| *n >= 0)
        .min()
    };
    let deadline = timelimit.map(|t| now_secs() + t);

    let mut count: i64 = 0;
    loop {
        if op.is_abandoned() {
            // Abandoned operations end quietly; no response goes out.
            debug!("search abandoned");
            pb.mark_result_sent();
            return;
        }
        match ops.next_search_entry(pb) {
            Err(e) => {
                pb.set_result_err(&e);
                return;
            }
            Ok(None) => {
                pb.set_result(ResultCode::Success, "");
                return;
            }
            Ok(Some(entry)) => {
                if sizelimit.is_some_and(|lim| count >= lim) {
                    pb.set_result(ResultCode::SizeLimitExceeded, "size limit exceeded");
                    return;
                }
                if deadline.is_some_and(|d| now_secs() > d) {
                    pb.set_result(ResultCode::TimeLimitExceeded, "time limit exceeded");
                    return;
                }
                if let Some(handler) = pb.handler() {
                    handler.on_entry(&entry);
                }
                count += 1;
            }
        }
    }
}
