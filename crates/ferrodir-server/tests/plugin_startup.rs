//! Dependency-ordered plugin startup, shutdown, and restart equivalence.

use std::sync::Arc;

use parking_lot::Mutex;

use ferrodir_core::dn::Sdn;
use ferrodir_core::entry::Entry;
use ferrodir_server::{
    plugin_add, plugin_delete, plugin_dependency_closeall, plugin_dependency_startall,
    plugin_restart, FnSlot, PluginInitFn, PluginRegistry, PluginType,
};

fn plugin_entry(name: &str, ptype: &str, init: &str) -> Entry {
    let mut e = Entry::new(Sdn::new(&format!("cn={name},cn=plugins,cn=config")).unwrap());
    e.add_values("cn", vec![name.into()], false).unwrap();
    e.add_values("nsslapd-pluginType", vec![ptype.into()], false)
        .unwrap();
    e.add_values("nsslapd-pluginInitfunc", vec![init.into()], false)
        .unwrap();
    e.add_values("nsslapd-pluginEnabled", vec!["on".into()], false)
        .unwrap();
    e
}

fn with_named_dep(mut e: Entry, dep: &str) -> Entry {
    e.add_values("nsslapd-plugin-depends-on-named", vec![dep.into()], false)
        .unwrap();
    e
}

fn with_type_dep(mut e: Entry, dep: &str) -> Entry {
    e.add_values("nsslapd-plugin-depends-on-type", vec![dep.into()], false)
        .unwrap();
    e
}

/// A factory whose start/close functions record the call order.
fn recording_factory(log: Arc<Mutex<Vec<String>>>) -> PluginInitFn {
    Arc::new(move |plugin, entry| {
        let name = entry.first_value_str("cn").unwrap_or("?").to_owned();
        let start_log = log.clone();
        let start_name = name.clone();
        plugin.set_func(
            FnSlot::Start,
            Arc::new(move |_| {
                start_log.lock().push(format!("start:{start_name}"));
                0
            }),
        );
        let close_log = log.clone();
        plugin.set_func(
            FnSlot::Close,
            Arc::new(move |_| {
                close_log.lock().push(format!("close:{name}"));
                0
            }),
        );
        0
    })
}

#[test]
fn named_dependencies_order_startup() {
    let reg = PluginRegistry::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    reg.register_factory("init", recording_factory(log.clone()));

    let entries = vec![
        with_named_dep(plugin_entry("needs-base", "postoperation", "init"), "base"),
        plugin_entry("base", "preoperation", "init"),
    ];
    plugin_dependency_startall(&reg, &entries).unwrap();

    assert_eq!(*log.lock(), vec!["start:base", "start:needs-base"]);
    assert!(reg.find_by_name("base").unwrap().is_started());
    assert!(reg.find_by_name("needs-base").unwrap().is_started());
}

#[test]
fn type_dependencies_wait_for_the_whole_type() {
    let reg = PluginRegistry::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    reg.register_factory("init", recording_factory(log.clone()));

    let entries = vec![
        with_type_dep(plugin_entry("consumer", "postoperation", "init"), "syntax"),
        plugin_entry("syntax-a", "syntax", "init"),
        plugin_entry("syntax-b", "syntax", "init"),
    ];
    plugin_dependency_startall(&reg, &entries).unwrap();

    let order = log.lock().clone();
    let consumer_at = order.iter().position(|s| s == "start:consumer").unwrap();
    assert!(order.iter().position(|s| s == "start:syntax-a").unwrap() < consumer_at);
    assert!(order.iter().position(|s| s == "start:syntax-b").unwrap() < consumer_at);
}

#[test]
fn disabled_plugins_satisfy_type_dependencies_without_starting() {
    let reg = PluginRegistry::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    reg.register_factory("init", recording_factory(log.clone()));

    let mut disabled = plugin_entry("off-syntax", "syntax", "init");
    disabled
        .replace_values("nsslapd-pluginEnabled", vec!["off".into()])
        .unwrap();
    let entries = vec![
        with_type_dep(plugin_entry("consumer", "postoperation", "init"), "syntax"),
        disabled,
    ];
    plugin_dependency_startall(&reg, &entries).unwrap();
    assert_eq!(*log.lock(), vec!["start:consumer"]);
    assert!(reg.find_by_name("off-syntax").is_none());
}

#[test]
fn dependency_cycle_fails_and_leaves_nothing_registered() {
    let reg = PluginRegistry::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    reg.register_factory("init", recording_factory(log.clone()));

    let entries = vec![
        with_named_dep(plugin_entry("a", "preoperation", "init"), "b"),
        with_named_dep(plugin_entry("b", "postoperation", "init"), "a"),
    ];
    let err = plugin_dependency_startall(&reg, &entries).unwrap_err();
    assert!(err.to_string().contains("dependencies"));
    assert!(reg.all().is_empty());
    assert!(log.lock().iter().all(|l| !l.starts_with("start:")));
}

#[test]
fn shutdown_runs_in_reverse_startup_order() {
    let reg = PluginRegistry::new();
    let log = Arc::new(Mutex::new(Vec::new()));
    reg.register_factory("init", recording_factory(log.clone()));

    let entries = vec![
        plugin_entry("first", "preoperation", "init"),
        with_named_dep(plugin_entry("second", "postoperation", "init"), "first"),
    ];
    plugin_dependency_startall(&reg, &entries).unwrap();
    plugin_dependency_closeall(&reg);

    assert_eq!(
        *log.lock(),
        vec!["start:first", "start:second", "close:second", "close:first"]
    );
    assert!(reg.find_by_name("first").unwrap().is_closed());
}

#[test]
fn delete_then_add_matches_restart() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let entry = plugin_entry("replaceable", "preoperation", "init");

    // Path one: explicit delete followed by add.
    let reg_a = PluginRegistry::new();
    reg_a.register_factory("init", recording_factory(log.clone()));
    plugin_add(&reg_a, &entry).unwrap();
    plugin_delete(&reg_a, "replaceable").unwrap();
    plugin_add(&reg_a, &entry).unwrap();

    // Path two: restart.
    let reg_b = PluginRegistry::new();
    reg_b.register_factory("init", recording_factory(log.clone()));
    plugin_add(&reg_b, &entry).unwrap();
    plugin_restart(&reg_b, &entry, &entry).unwrap();

    let names = |reg: &PluginRegistry| {
        reg.list(PluginType::PreOperation)
            .iter()
            .map(|p| (p.name().to_owned(), p.is_started(), p.precedence()))
            .collect::<Vec<_>>()
    };
    assert_eq!(names(&reg_a), names(&reg_b));
    assert_eq!(names(&reg_a).len(), 1);
}
