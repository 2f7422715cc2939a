//! Dependency-ordered plugin startup and the reverse shutdown walk.

use std::collections::HashMap;

use tracing::{debug, error, info};

use ferrodir_core::entry::Entry;
use ferrodir_core::error::{LdapError, LdapResult};

use crate::pblock::Pblock;
use crate::plugin::{
    plugin_add, plugin_entry_enabled, FnSlot, PluginRegistry,
};

struct DepState<'a> {
    entry: &'a Entry,
    name: String,
    type_str: String,
    enabled: bool,
    depends_named: Vec<String>,
    depends_type: Vec<String>,
    done: bool,
}

fn dep_values(entry: &Entry, ty: &str) -> Vec<String> {
    entry
        .attr(ty)
        .map(|a| {
            a.values()
                .iter()
                .filter_map(|v| v.as_str().map(|s| s.to_ascii_lowercase()))
                .collect()
        })
        .unwrap_or_default()
}

/// Starts every enabled plugin from its config entry, resolving
/// `depends-on-named` and `depends-on-type` edges in waves. A wave that
/// starts nothing while plugins remain is a dependency stall: the stall is
/// logged per plugin, everything already started is torn down, and the
/// call fails.
pub fn plugin_dependency_startall(
    registry: &PluginRegistry,
    entries: &[Entry],
) -> LdapResult<()> {
    let mut configs: Vec<DepState<'_>> = entries
        .iter()
        .filter_map(|entry| {
            let name = entry.first_value_str("cn")?.to_owned();
            let type_str = entry
                .first_value_str("nsslapd-pluginType")
                .unwrap_or_default()
                .to_ascii_lowercase();
            Some(DepState {
                entry,
                name,
                type_str,
                enabled: plugin_entry_enabled(entry),
                depends_named: dep_values(entry, "nsslapd-plugin-depends-on-named"),
                depends_type: dep_values(entry, "nsslapd-plugin-depends-on-type"),
                done: false,
            })
        })
        .collect();

    // How many plugins of each type have not completed startup processing.
    let mut not_started: HashMap<String, usize> = HashMap::new();
    for c in &configs {
        if !c.type_str.is_empty() {
            *not_started.entry(c.type_str.clone()).or_insert(0) += 1;
        }
    }

    let mut started_names: Vec<String> = Vec::new();
    let total = configs.len();
    let mut num_done = 0;

    while num_done < total {
        let mut progressed = false;
        for i in 0..configs.len() {
            if configs[i].done {
                continue;
            }
            if configs[i].enabled {
                let named_ok = configs[i]
                    .depends_named
                    .iter()
                    .all(|d| started_names.iter().any(|s| s.eq_ignore_ascii_case(d)));
                if !named_ok {
                    continue;
                }
                let type_ok = configs[i]
                    .depends_type
                    .iter()
                    .all(|t| not_started.get(t).copied().unwrap_or(0) == 0);
                if !type_ok {
                    continue;
                }
                debug!(plugin = %configs[i].name, "starting plugin");
                match plugin_add(registry, configs[i].entry) {
                    Ok(_) => {
                        started_names.push(configs[i].name.clone());
                    }
                    Err(e) => {
                        // Leave the plugin pending: a later wave may clear a
                        // transient configuration problem, and a stall ends
                        // startup anyway.
                        error!(plugin = %configs[i].name, error = %e, "failed to start plugin");
                        continue;
                    }
                }
            }
            if let Some(n) = not_started.get_mut(&configs[i].type_str) {
                *n = n.saturating_sub(1);
            }
            configs[i].done = true;
            num_done += 1;
            progressed = true;
        }
        if !progressed {
            for c in configs.iter().filter(|c| !c.done) {
                error!(
                    plugin = %c.name,
                    ptype = %c.type_str,
                    "plugin is not started: unresolved dependencies"
                );
            }
            teardown_started(registry);
            return Err(LdapError::unwilling(
                "failed to resolve plugin dependencies",
            ));
        }
    }
    info!(started = started_names.len(), "plugin startup complete");
    Ok(())
}

/// Closes every started plugin in reverse startup order: mark it stopped,
/// wait for in-flight calls to drain, run its close function, mark it
/// closed so dispatch skips it from now on.
pub fn plugin_dependency_closeall(registry: &PluginRegistry) {
    for plugin in registry.shutdown_order().iter().rev() {
        if plugin.is_closed() {
            continue;
        }
        plugin.set_stopped(true);
        plugin.wait_for_ops_to_finish();
        let mut pb = Pblock::new();
        let rc = registry.call_one(plugin, &mut pb, FnSlot::Close);
        if rc != 0 {
            error!(plugin = plugin.name(), rc, "plugin close function failed");
        }
        plugin.set_closed(true);
        debug!(plugin = plugin.name(), "plugin closed");
    }
}

/// Removes every plugin registered so far; used when startup aborts so no
/// partial plugin state remains.
fn teardown_started(registry: &PluginRegistry) {
    plugin_dependency_closeall(registry);
    for plugin in registry.shutdown_order() {
        registry.remove_plugin(&plugin);
    }
    for plugin in registry.all() {
        registry.remove_plugin(&plugin);
    }
}
