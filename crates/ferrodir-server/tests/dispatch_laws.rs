//! End-to-end dispatcher behavior over a DSE-backed core.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use ferrodir_core::config::ServerConfig;
use ferrodir_core::dn::{Scope, Sdn};
use ferrodir_core::entry::Entry;
use ferrodir_core::error::{LdapError, ResultCode};
use ferrodir_dse::{DseOpFlags, DseStore};
use ferrodir_server::{
    add_internal, dispatch_operation, oids, search_internal, search_internal_get_entry,
    FnSlot, LdapControl, OpFlags, OpType, Operation, PbKey, PbValue, Pblock, Plugin,
    PluginConfig, PluginType, ResultHandler, ServerCore, LDAP_AUTH_SIMPLE,
};

fn entry(dn: &str, attrs: &[(&str, &str)]) -> Entry {
    let mut e = Entry::new(Sdn::new(dn).unwrap());
    for (ty, val) in attrs {
        e.add_values(ty, vec![(*val).into()], false).unwrap();
    }
    e
}

fn make_core() -> ServerCore {
    let core = ServerCore::new(ServerConfig::default()).unwrap();
    let dse = Arc::new(DseStore::new_in_memory());
    dse.add_entry(
        entry("cn=config", &[("objectClass", "top"), ("cn", "config")]),
        DseOpFlags::default(),
    )
    .unwrap();
    dse.add_entry(
        entry(
            "cn=plugins,cn=config",
            &[("objectClass", "nsContainer"), ("cn", "plugins")],
        ),
        DseOpFlags::default(),
    )
    .unwrap();
    core.init_dse(dse).unwrap();
    core
}

fn test_plugin(name: &str, ptype: PluginType, precedence: i32) -> Arc<Plugin> {
    Arc::new(Plugin::new(
        name,
        Sdn::new(&format!("cn={name},cn=plugins,cn=config")).unwrap(),
        ptype,
        precedence,
        PluginConfig::default(),
    ))
}

#[derive(Default)]
struct RecordingHandler {
    entries: Mutex<Vec<Entry>>,
    result: Mutex<Option<(ResultCode, Option<String>)>>,
    controls: Mutex<Vec<LdapControl>>,
}

impl ResultHandler for RecordingHandler {
    fn on_result(
        &self,
        code: ResultCode,
        _matched: Option<&str>,
        text: Option<&str>,
        controls: &[LdapControl],
    ) {
        *self.result.lock() = Some((code, text.map(str::to_owned)));
        *self.controls.lock() = controls.to_vec();
    }

    fn on_entry(&self, entry: &Entry) {
        self.entries.lock().push(entry.clone());
    }
}

fn search_pb(
    base: &str,
    scope: Scope,
    filter: &str,
    handler: Arc<RecordingHandler>,
    controls: Vec<LdapControl>,
) -> Pblock {
    let mut pb = Pblock::new();
    pb.set(
        PbKey::Operation,
        PbValue::Operation(Arc::new(Operation::new(OpType::Search, OpFlags::empty()))),
    );
    pb.set(PbKey::TargetSdn, PbValue::Sdn(Sdn::new(base).unwrap()));
    pb.set(PbKey::SearchScope, PbValue::Scope(scope));
    pb.set(
        PbKey::SearchFilter,
        PbValue::Filter(Box::new(ferrodir_core::filter::Filter::parse(filter).unwrap())),
    );
    if !controls.is_empty() {
        pb.set(PbKey::ReqControls, PbValue::Controls(controls));
    }
    pb.set_handler(handler);
    pb
}

#[test]
fn internal_search_reaches_the_dse_backend() {
    let core = make_core();
    let found = search_internal(
        &core,
        &Sdn::new("cn=config").unwrap(),
        Scope::Subtree,
        "(cn=*)",
        None,
        OpFlags::empty(),
    )
    .unwrap();
    // cn=config, cn=plugins, and the rewriters container.
    assert_eq!(found.len(), 3);
}

#[test]
fn internal_add_then_get_entry() {
    let core = make_core();
    add_internal(
        &core,
        entry(
            "cn=backends,cn=config",
            &[("objectClass", "nsContainer"), ("cn", "backends")],
        ),
        OpFlags::empty(),
    )
    .unwrap();
    let got = search_internal_get_entry(&core, &Sdn::new("cn=backends,cn=config").unwrap(), None)
        .unwrap();
    assert_eq!(got.first_value_str("cn"), Some("backends"));
}

#[test]
fn preop_veto_skips_backend_and_postop() {
    let core = make_core();
    let postop_calls = Arc::new(AtomicUsize::new(0));

    let veto = test_plugin("veto", PluginType::InternalPreOperation, 10);
    veto.set_func(FnSlot::InternalPreAdd, Arc::new(|_| 53));
    veto.set_started(true);
    core.plugins().insert_plugin(veto);

    let post = test_plugin("post-recorder", PluginType::InternalPostOperation, 50);
    let calls = postop_calls.clone();
    post.set_func(
        FnSlot::InternalPostAdd,
        Arc::new(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            0
        }),
    );
    post.set_started(true);
    core.plugins().insert_plugin(post);

    let err = add_internal(
        &core,
        entry("cn=vetoed,cn=config", &[("cn", "vetoed")]),
        OpFlags::empty(),
    )
    .unwrap_err();
    assert!(matches!(err, LdapError::UnwillingToPerform(_)));

    // The backend never ran: the entry does not exist.
    assert!(
        search_internal_get_entry(&core, &Sdn::new("cn=vetoed,cn=config").unwrap(), None).is_err()
    );
    // Postop plugins never ran either.
    assert_eq!(postop_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn no_access_check_flag_skips_acl_but_not_other_preops() {
    let core = make_core();
    let acl_calls = Arc::new(AtomicUsize::new(0));
    let preop_calls = Arc::new(AtomicUsize::new(0));

    let acl = test_plugin("test-acl", PluginType::AccessControl, 10);
    let calls = acl_calls.clone();
    acl.set_func(
        FnSlot::AclAllowAccess,
        Arc::new(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            50
        }),
    );
    acl.set_started(true);
    core.plugins().insert_plugin(acl);

    let preop = test_plugin("pre-recorder", PluginType::InternalPreOperation, 20);
    let calls = preop_calls.clone();
    preop.set_func(
        FnSlot::InternalPreAdd,
        Arc::new(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            0
        }),
    );
    preop.set_started(true);
    core.plugins().insert_plugin(preop);

    // Without the flag: the ACL plugin denies the operation.
    let err = add_internal(
        &core,
        entry("cn=a,cn=config", &[("cn", "a")]),
        OpFlags::empty(),
    )
    .unwrap_err();
    assert!(matches!(err, LdapError::InsufficientAccess(_)));
    assert_eq!(acl_calls.load(Ordering::SeqCst), 1);
    assert_eq!(preop_calls.load(Ordering::SeqCst), 0);

    // With the flag: ACL is skipped, the other preop still runs.
    add_internal(
        &core,
        entry("cn=a,cn=config", &[("objectClass", "top"), ("cn", "a")]),
        OpFlags::NO_ACCESS_CHECK,
    )
    .unwrap();
    assert_eq!(acl_calls.load(Ordering::SeqCst), 1);
    assert_eq!(preop_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn critical_unknown_control_stops_the_search() {
    let core = make_core();
    let postop_calls = Arc::new(AtomicUsize::new(0));
    let post = test_plugin("post-search", PluginType::PostOperation, 50);
    let calls = postop_calls.clone();
    post.set_func(
        FnSlot::PostSearch,
        Arc::new(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            0
        }),
    );
    post.set_started(true);
    core.plugins().insert_plugin(post);

    let handler = Arc::new(RecordingHandler::default());
    let mut pb = search_pb(
        "cn=config",
        Scope::Subtree,
        "(cn=*)",
        handler.clone(),
        vec![LdapControl::new("1.2.3.4.5.6.7", true, None)],
    );
    dispatch_operation(&core, &mut pb).unwrap();

    let (code, _) = handler.result.lock().clone().unwrap();
    assert_eq!(code, ResultCode::UnavailableCriticalExtension);
    assert!(handler.entries.lock().is_empty());
    assert_eq!(postop_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn wire_search_enforces_the_size_limit() {
    let core = make_core();
    let be = core.backends().select_by_name("DSE").unwrap();
    be.set_sizelimit(1);

    let handler = Arc::new(RecordingHandler::default());
    let mut pb = search_pb("cn=config", Scope::Subtree, "(cn=*)", handler.clone(), vec![]);
    dispatch_operation(&core, &mut pb).unwrap();

    let (code, _) = handler.result.lock().clone().unwrap();
    assert_eq!(code, ResultCode::SizeLimitExceeded);
    assert_eq!(handler.entries.lock().len(), 1);
}

#[test]
fn anonymous_simple_bind_succeeds_without_identity() {
    let core = make_core();
    let handler = Arc::new(RecordingHandler::default());
    let mut pb = Pblock::new();
    pb.set(
        PbKey::Operation,
        PbValue::Operation(Arc::new(Operation::new(OpType::Bind, OpFlags::empty()))),
    );
    pb.set(PbKey::TargetSdn, PbValue::Sdn(Sdn::root()));
    pb.set(PbKey::BindMethod, PbValue::Int(LDAP_AUTH_SIMPLE));
    pb.set(PbKey::BindCredentials, PbValue::Bytes(Bytes::new()));
    pb.set_handler(handler.clone());
    dispatch_operation(&core, &mut pb).unwrap();
    let (code, _) = handler.result.lock().clone().unwrap();
    assert_eq!(code, ResultCode::Success);
}

#[test]
fn simple_bind_checks_userpassword() {
    let core = make_core();
    add_internal(
        &core,
        entry(
            "cn=admin,cn=config",
            &[("objectClass", "person"), ("cn", "admin"), ("userPassword", "sekrit")],
        ),
        OpFlags::empty(),
    )
    .unwrap();

    let bind = |password: &'static str| {
        let handler = Arc::new(RecordingHandler::default());
        let mut pb = Pblock::new();
        pb.set(
            PbKey::Operation,
            PbValue::Operation(Arc::new(Operation::new(OpType::Bind, OpFlags::empty()))),
        );
        pb.set(
            PbKey::TargetSdn,
            PbValue::Sdn(Sdn::new("cn=admin,cn=config").unwrap()),
        );
        pb.set(PbKey::BindMethod, PbValue::Int(LDAP_AUTH_SIMPLE));
        pb.set(
            PbKey::BindCredentials,
            PbValue::Bytes(Bytes::from_static(password.as_bytes())),
        );
        pb.set_handler(handler.clone());
        dispatch_operation(&core, &mut pb).unwrap();
        let (code, _) = handler.result.lock().clone().unwrap();
        code
    };

    assert_eq!(bind("sekrit"), ResultCode::Success);
    assert_eq!(bind("wrong"), ResultCode::InvalidCredentials);
}

#[test]
fn proxied_authorization_replaces_the_requestor() {
    let core = make_core();
    let seen = Arc::new(Mutex::new(None::<String>));
    let preop = test_plugin("requestor-probe", PluginType::PreOperation, 50);
    let seen2 = seen.clone();
    preop.set_func(
        FnSlot::PreSearch,
        Arc::new(move |pb| {
            *seen2.lock() = pb.requestor_sdn().map(|s| s.as_ndn().to_owned());
            0
        }),
    );
    preop.set_started(true);
    core.plugins().insert_plugin(preop);

    let handler = Arc::new(RecordingHandler::default());
    let mut pb = search_pb(
        "cn=config",
        Scope::Base,
        "(cn=*)",
        handler.clone(),
        vec![LdapControl::new(
            oids::PROXIED_AUTH_V2,
            true,
            Some(Bytes::from_static(b"dn:cn=App Account,cn=config")),
        )],
    );
    dispatch_operation(&core, &mut pb).unwrap();
    assert_eq!(seen.lock().clone(), Some("cn=app account,cn=config".to_owned()));

    // Proxying to the root DN is refused.
    let handler = Arc::new(RecordingHandler::default());
    let mut pb = search_pb(
        "cn=config",
        Scope::Base,
        "(cn=*)",
        handler.clone(),
        vec![LdapControl::new(
            oids::PROXIED_AUTH_V2,
            true,
            Some(Bytes::from_static(b"dn:cn=Directory Manager")),
        )],
    );
    dispatch_operation(&core, &mut pb).unwrap();
    let (code, _) = handler.result.lock().clone().unwrap();
    assert_eq!(code, ResultCode::UnwillingToPerform);
}

#[test]
fn readonly_core_refuses_external_writes() {
    let core = make_core();
    core.set_readonly(true);
    let err = add_internal(
        &core,
        entry("cn=nope,cn=config", &[("cn", "nope")]),
        OpFlags::empty(),
    )
    .unwrap_err();
    assert!(matches!(err, LdapError::UnwillingToPerform(_)));

    // A component marked as permitted may still write.
    let mut pb = Pblock::new();
    pb.set(
        PbKey::Operation,
        PbValue::Operation(Arc::new(Operation::internal(OpType::Add, OpFlags::empty()))),
    );
    pb.set(
        PbKey::TargetSdn,
        PbValue::Sdn(Sdn::new("cn=allowed,cn=config").unwrap()),
    );
    pb.set(
        PbKey::AddEntry,
        PbValue::Entry(Box::new(entry(
            "cn=allowed,cn=config",
            &[("objectClass", "top"), ("cn", "allowed")],
        ))),
    );
    pb.set(
        PbKey::PluginIdentity,
        PbValue::Identity(ferrodir_server::PluginIdentity::new("config-writer", true)),
    );
    let handler = Arc::new(RecordingHandler::default());
    pb.set_handler(handler.clone());
    dispatch_operation(&core, &mut pb).unwrap();
    let (code, _) = handler.result.lock().clone().unwrap();
    assert_eq!(code, ResultCode::Success);
}

#[test]
fn abandoned_search_sends_no_response() {
    let core = make_core();
    let handler = Arc::new(RecordingHandler::default());
    let op = Arc::new(Operation::new(OpType::Search, OpFlags::empty()));
    op.abandon();
    let mut pb = Pblock::new();
    pb.set(PbKey::Operation, PbValue::Operation(op));
    pb.set(PbKey::TargetSdn, PbValue::Sdn(Sdn::new("cn=config").unwrap()));
    pb.set(PbKey::SearchScope, PbValue::Scope(Scope::Subtree));
    pb.set(
        PbKey::SearchFilter,
        PbValue::Filter(Box::new(ferrodir_core::filter::Filter::parse("(cn=*)").unwrap())),
    );
    pb.set_handler(handler.clone());
    dispatch_operation(&core, &mut pb).unwrap();
    assert!(handler.result.lock().is_none());
    assert!(handler.entries.lock().is_empty());
}

#[test]
fn unmatched_suffix_hits_the_default_backend() {
    let core = make_core();
    let err = search_internal(
        &core,
        &Sdn::new("dc=nowhere").unwrap(),
        Scope::Base,
        "(objectclass=*)",
        None,
        OpFlags::empty(),
    )
    .unwrap_err();
    assert!(matches!(err, LdapError::NoSuchObject(_)));
}
