//! File-level tests for the DSE store: load, dump, reload.

use std::fs;
use std::sync::Arc;

use tempfile::TempDir;

use ferrodir_core::dn::{Scope, Sdn};
use ferrodir_core::entry::Entry;
use ferrodir_core::filter::Filter;
use ferrodir_core::value::Value;
use ferrodir_dse::{
    DseCallback, DseCallbackResult, DseOpFlags, DseOperation, DsePaths, DsePhase, DseStore,
};

fn entry(dn: &str, attrs: &[(&str, &str)]) -> Entry {
    let mut e = Entry::new(Sdn::new(dn).unwrap());
    for (ty, val) in attrs {
        e.add_values(ty, vec![Value::from(*val)], false).unwrap();
    }
    e
}

fn populate(store: &DseStore) {
    store
        .add_entry(
            entry("cn=config", &[("objectClass", "top"), ("cn", "config")]),
            DseOpFlags::default(),
        )
        .unwrap();
    store
        .add_entry(
            entry("cn=plugins,cn=config", &[("cn", "plugins")]),
            DseOpFlags::default(),
        )
        .unwrap();
    store
        .add_entry(
            entry(
                "cn=Case Sensitive String Syntax,cn=plugins,cn=config",
                &[("cn", "Case Sensitive String Syntax"), ("description", "values: a, b")],
            ),
            DseOpFlags::default(),
        )
        .unwrap();
}

#[test]
fn load_write_load_yields_the_same_tree() {
    let dir = TempDir::new().unwrap();
    let paths = DsePaths::in_config_dir(dir.path());

    let store = DseStore::new(paths.clone(), Vec::new());
    populate(&store);
    store.write_file().unwrap();

    let reloaded = DseStore::new(paths.clone(), Vec::new());
    reloaded.load().unwrap();
    assert_eq!(reloaded.entry_count(), 3);

    let base = Sdn::new("cn=config").unwrap();
    let filter = Filter::parse("(cn=*)").unwrap();
    let before = store.search(&base, Scope::Subtree, &filter).unwrap();
    let after = reloaded.search(&base, Scope::Subtree, &filter).unwrap();
    assert_eq!(before.len(), after.len());
    for e in &before {
        let twin = after.iter().find(|x| x.sdn() == e.sdn()).unwrap();
        assert_eq!(twin, e);
    }

    // The startOK copy appears after a successful load.
    assert!(paths.startokfile.exists());
}

#[test]
fn parents_precede_children_in_the_file() {
    let dir = TempDir::new().unwrap();
    let paths = DsePaths::in_config_dir(dir.path());
    let store = DseStore::new(paths.clone(), Vec::new());
    populate(&store);
    store.write_file().unwrap();

    let text = fs::read_to_string(&paths.file).unwrap();
    let config_at = text.find("dn: cn=config").unwrap();
    let plugins_at = text.find("dn: cn=plugins,cn=config").unwrap();
    let leaf_at = text.find("cn=Case Sensitive String Syntax").unwrap();
    assert!(config_at < plugins_at && plugins_at < leaf_at);
}

#[test]
fn rewrite_keeps_a_backup_of_the_previous_file() {
    let dir = TempDir::new().unwrap();
    let paths = DsePaths::in_config_dir(dir.path());
    let store = DseStore::new(paths.clone(), Vec::new());
    populate(&store);
    store.write_file().unwrap();
    store
        .add_entry(entry("cn=extra,cn=config", &[("cn", "extra")]), DseOpFlags::default())
        .unwrap();

    assert!(paths.backfile.exists());
    let backup = fs::read_to_string(&paths.backfile).unwrap();
    assert!(!backup.contains("cn=extra"));
    let current = fs::read_to_string(&paths.file).unwrap();
    assert!(current.contains("cn=extra"));
}

#[test]
fn missing_primary_falls_back_to_backup() {
    let dir = TempDir::new().unwrap();
    let paths = DsePaths::in_config_dir(dir.path());
    let store = DseStore::new(paths.clone(), Vec::new());
    populate(&store);
    store.write_file().unwrap();

    fs::rename(&paths.file, &paths.backfile).unwrap();
    let reloaded = DseStore::new(paths.clone(), Vec::new());
    reloaded.load().unwrap();
    assert_eq!(reloaded.entry_count(), 3);
}

#[test]
fn numsubordinates_is_recomputed_on_load() {
    let dir = TempDir::new().unwrap();
    let paths = DsePaths::in_config_dir(dir.path());
    // Hand-write a file claiming a bogus count.
    fs::write(
        &paths.file,
        "dn: cn=config\ncn: config\nnumSubordinates: 42\n\ndn: cn=one,cn=config\ncn: one\n\n",
    )
    .unwrap();

    let store = DseStore::new(paths, Vec::new());
    store.load().unwrap();
    let config = store.get_entry(&Sdn::new("cn=config").unwrap()).unwrap();
    assert_eq!(config.first_value_str("numSubordinates"), Some("1"));
}

#[test]
fn auxiliary_files_merge_and_only_the_primary_is_rewritten() {
    let dir = TempDir::new().unwrap();
    let paths = DsePaths::in_config_dir(dir.path());
    fs::write(&paths.file, "dn: cn=config\ncn: config\n\n").unwrap();
    let aux = dir.path().join("extra.ldif");
    fs::write(&aux, "dn: cn=config\ndescription: from aux\n\n").unwrap();

    let store = DseStore::new(paths.clone(), vec![aux.clone()]);
    store.load().unwrap();
    let config = store.get_entry(&Sdn::new("cn=config").unwrap()).unwrap();
    assert_eq!(config.first_value_str("description"), Some("from aux"));

    let aux_before = fs::read_to_string(&aux).unwrap();
    store.write_file().unwrap();
    assert_eq!(fs::read_to_string(&aux).unwrap(), aux_before);
    assert!(fs::read_to_string(&paths.file).unwrap().contains("from aux"));
}

#[test]
fn dont_ever_write_inhibits_the_file() {
    let dir = TempDir::new().unwrap();
    let paths = DsePaths::in_config_dir(dir.path());
    let store = DseStore::new(paths.clone(), Vec::new());
    store.set_dont_ever_write(true);
    populate(&store);
    store.write_file().unwrap();
    assert!(!paths.file.exists());
}

#[test]
fn write_callback_can_suppress_an_entry() {
    let dir = TempDir::new().unwrap();
    let paths = DsePaths::in_config_dir(dir.path());
    let store = DseStore::new(paths.clone(), Vec::new());
    populate(&store);
    store.register_callback(DseCallback::new(
        DseOperation::Write,
        DsePhase::Pre,
        Sdn::new("cn=plugins,cn=config").unwrap(),
        Scope::Base,
        None,
        Arc::new(|_, _| DseCallbackResult::do_not_apply()),
    ));
    store.write_file().unwrap();
    let text = fs::read_to_string(&paths.file).unwrap();
    assert!(!text.contains("dn: cn=plugins,cn=config"));
    assert!(text.contains("dn: cn=config"));
}
