//! Plugins: typed, precedence-ordered handler lists wired into the
//! operation pipeline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use ferrodir_core::dn::Sdn;
use ferrodir_core::entry::Entry;
use ferrodir_core::error::{LdapError, LdapResult};

use crate::metrics;
use crate::pblock::Pblock;

/// A plugin function failed fatally; for backend pre/post lists this wins
/// over every other return value.
pub const PLUGIN_FAILURE: i32 = -1;

/// Default precedence when a plugin configures none.
pub const PLUGIN_DEFAULT_PRECEDENCE: i32 = 50;
pub const PLUGIN_MIN_PRECEDENCE: i32 = 1;
pub const PLUGIN_MAX_PRECEDENCE: i32 = 99;

/// Plugins that keep the server coherent; they cannot be disabled or
/// removed at runtime.
const CRITICAL_PLUGINS: &[&str] = &[
    "ldbm database",
    "acl",
    "acl preoperation",
    "chaining database",
    "multimaster replication plugin",
];

/// The plugin lists, one per type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PluginType {
    PreOperation,
    PostOperation,
    InternalPreOperation,
    InternalPostOperation,
    BePreOperation,
    BePostOperation,
    BeTxnPreOperation,
    BeTxnPostOperation,
    ExtendedOperation,
    MatchingRule,
    Syntax,
    Database,
    PwdStorageScheme,
    VattrServiceProvider,
    Object,
    AccessControl,
}

impl PluginType {
    /// Parses the `nsslapd-pluginType` attribute value.
    #[must_use]
    pub fn from_config_str(s: &str) -> Option<Self> {
        Some(match s.to_ascii_lowercase().as_str() {
            "preoperation" => Self::PreOperation,
            "postoperation" => Self::PostOperation,
            "internalpreoperation" => Self::InternalPreOperation,
            "internalpostoperation" => Self::InternalPostOperation,
            "bepreoperation" => Self::BePreOperation,
            "bepostoperation" => Self::BePostOperation,
            "betxnpreoperation" => Self::BeTxnPreOperation,
            "betxnpostoperation" => Self::BeTxnPostOperation,
            "extendedop" => Self::ExtendedOperation,
            "matchingrule" => Self::MatchingRule,
            "syntax" => Self::Syntax,
            "database" => Self::Database,
            "pwdstoragescheme" => Self::PwdStorageScheme,
            "vattrsp" => Self::VattrServiceProvider,
            "object" => Self::Object,
            "accesscontrol" => Self::AccessControl,
            _ => return None,
        })
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PreOperation => "preoperation",
            Self::PostOperation => "postoperation",
            Self::InternalPreOperation => "internalpreoperation",
            Self::InternalPostOperation => "internalpostoperation",
            Self::BePreOperation => "bepreoperation",
            Self::BePostOperation => "bepostoperation",
            Self::BeTxnPreOperation => "betxnpreoperation",
            Self::BeTxnPostOperation => "betxnpostoperation",
            Self::ExtendedOperation => "extendedop",
            Self::MatchingRule => "matchingrule",
            Self::Syntax => "syntax",
            Self::Database => "database",
            Self::PwdStorageScheme => "pwdstoragescheme",
            Self::VattrServiceProvider => "vattrsp",
            Self::Object => "object",
            Self::AccessControl => "accesscontrol",
        }
    }

    /// Types whose removal is accepted but deferred until restart.
    #[must_use]
    pub const fn removal_deferred(self) -> bool {
        matches!(self, Self::Syntax | Self::MatchingRule | Self::Database)
    }
}

/// Function slots a plugin can register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FnSlot {
    Start,
    Close,
    PreBind,
    PreUnbind,
    PreSearch,
    PreCompare,
    PreModify,
    PreModRdn,
    PreAdd,
    PreDelete,
    PreAbandon,
    PostBind,
    PostUnbind,
    PostSearch,
    PostCompare,
    PostModify,
    PostModRdn,
    PostAdd,
    PostDelete,
    PostAbandon,
    InternalPreAdd,
    InternalPreModify,
    InternalPreModRdn,
    InternalPreDelete,
    InternalPostAdd,
    InternalPostModify,
    InternalPostModRdn,
    InternalPostDelete,
    BePreModify,
    BePreModRdn,
    BePreAdd,
    BePreDelete,
    BePostModify,
    BePostModRdn,
    BePostAdd,
    BePostDelete,
    BeTxnPreModify,
    BeTxnPreModRdn,
    BeTxnPreAdd,
    BeTxnPreDelete,
    BeTxnPostModify,
    BeTxnPostModRdn,
    BeTxnPostAdd,
    BeTxnPostDelete,
    AclAllowAccess,
    ExtendedOp,
    PwdStorageCompare,
    PwdStorageEncode,
}

impl FnSlot {
    /// The plugin list a slot dispatches over.
    #[must_use]
    pub const fn list_type(self) -> PluginType {
        use FnSlot::*;
        match self {
            PreBind | PreUnbind | PreSearch | PreCompare | PreModify | PreModRdn | PreAdd
            | PreDelete | PreAbandon => PluginType::PreOperation,
            PostBind | PostUnbind | PostSearch | PostCompare | PostModify | PostModRdn
            | PostAdd | PostDelete | PostAbandon => PluginType::PostOperation,
            InternalPreAdd | InternalPreModify | InternalPreModRdn | InternalPreDelete => {
                PluginType::InternalPreOperation
            }
            InternalPostAdd | InternalPostModify | InternalPostModRdn | InternalPostDelete => {
                PluginType::InternalPostOperation
            }
            BePreModify | BePreModRdn | BePreAdd | BePreDelete => PluginType::BePreOperation,
            BePostModify | BePostModRdn | BePostAdd | BePostDelete => PluginType::BePostOperation,
            BeTxnPreModify | BeTxnPreModRdn | BeTxnPreAdd | BeTxnPreDelete => {
                PluginType::BeTxnPreOperation
            }
            BeTxnPostModify | BeTxnPostModRdn | BeTxnPostAdd | BeTxnPostDelete => {
                PluginType::BeTxnPostOperation
            }
            AclAllowAccess => PluginType::AccessControl,
            ExtendedOp => PluginType::ExtendedOperation,
            PwdStorageCompare | PwdStorageEncode => PluginType::PwdStorageScheme,
            Start | Close => PluginType::Object,
        }
    }
}

/// A plugin stage function.
pub type PluginFn = Arc<dyn Fn(&mut Pblock) -> i32 + Send + Sync>;

/// Initializer looked up by `nsslapd-pluginInitfunc`; it registers the
/// plugin's stage functions and returns zero on success.
pub type PluginInitFn = Arc<dyn Fn(&Arc<Plugin>, &Entry) -> i32 + Send + Sync>;

/// Tri-state for per-plugin action overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActionPolicy {
    Off,
    #[default]
    On,
    Defer,
}

/// The four special-data admission flags of a subtree rule set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialData {
    pub local: bool,
    pub remote: bool,
    pub anonymous_bind: bool,
    pub root_bind: bool,
}

impl SpecialData {
    #[must_use]
    pub const fn all() -> Self {
        Self {
            local: true,
            remote: true,
            anonymous_bind: true,
            root_bind: true,
        }
    }

    #[must_use]
    pub const fn is_all(&self) -> bool {
        self.local && self.remote && self.anonymous_bind && self.root_bind
    }
}

/// Allow/deny subtree sets plus special-data flags.
#[derive(Debug, Clone)]
pub struct TargetRules {
    pub allow: Vec<Sdn>,
    pub deny: Vec<Sdn>,
    pub special: SpecialData,
}

impl Default for TargetRules {
    fn default() -> Self {
        Self {
            allow: Vec::new(),
            deny: Vec::new(),
            special: SpecialData::all(),
        }
    }
}

/// Per-plugin configuration.
#[derive(Debug, Clone, Default)]
pub struct PluginConfig {
    pub schema_check: ActionPolicy,
    pub log_access: ActionPolicy,
    pub log_audit: ActionPolicy,
    pub log_change: ActionPolicy,
    pub invoke_for_replop: ActionPolicy,
    pub target: TargetRules,
    pub bind: TargetRules,
}

impl PluginConfig {
    /// A plugin is global when all four special-data flags are set on its
    /// target subtree set.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.target.special.is_all() && self.target.allow.is_empty() && self.target.deny.is_empty()
    }
}

/// Identity a component presents when issuing internal operations.
#[derive(Debug, Clone)]
pub struct PluginIdentity {
    pub name: String,
    pub allow_updates: bool,
}

impl PluginIdentity {
    #[must_use]
    pub fn new(name: impl Into<String>, allow_updates: bool) -> Self {
        Self {
            name: name.into(),
            allow_updates,
        }
    }
}

/// One registered plugin.
pub struct Plugin {
    name: String,
    dn: Sdn,
    ptype: PluginType,
    precedence: i32,
    argv: Vec<String>,
    depends_named: Vec<String>,
    depends_type: Vec<String>,
    config: PluginConfig,
    funcs: RwLock<HashMap<FnSlot, PluginFn>>,
    op_counter: AtomicU64,
    started: AtomicBool,
    stopped: AtomicBool,
    closed: AtomicBool,
}

impl Plugin {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        dn: Sdn,
        ptype: PluginType,
        precedence: i32,
        config: PluginConfig,
    ) -> Self {
        Self {
            name: name.into(),
            dn,
            ptype,
            precedence,
            argv: Vec::new(),
            depends_named: Vec::new(),
            depends_type: Vec::new(),
            config,
            funcs: RwLock::new(HashMap::new()),
            op_counter: AtomicU64::new(0),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn dn(&self) -> &Sdn {
        &self.dn
    }

    #[must_use]
    pub fn ptype(&self) -> PluginType {
        self.ptype
    }

    #[must_use]
    pub fn precedence(&self) -> i32 {
        self.precedence
    }

    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    #[must_use]
    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    #[must_use]
    pub fn depends_named(&self) -> &[String] {
        &self.depends_named
    }

    #[must_use]
    pub fn depends_type(&self) -> &[String] {
        &self.depends_type
    }

    /// Registers a stage function.
    pub fn set_func(&self, slot: FnSlot, f: PluginFn) {
        self.funcs.write().insert(slot, f);
    }

    #[must_use]
    pub fn func(&self, slot: FnSlot) -> Option<PluginFn> {
        self.funcs.read().get(&slot).cloned()
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.started.load(AtomicOrdering::SeqCst)
    }

    pub fn set_started(&self, v: bool) {
        self.started.store(v, AtomicOrdering::SeqCst);
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(AtomicOrdering::SeqCst)
    }

    /// Prevents new entries into the plugin's functions.
    pub fn set_stopped(&self, v: bool) {
        self.stopped.store(v, AtomicOrdering::SeqCst);
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(AtomicOrdering::SeqCst)
    }

    pub fn set_closed(&self, v: bool) {
        self.closed.store(v, AtomicOrdering::SeqCst);
    }

    pub fn op_started(&self) {
        self.op_counter.fetch_add(1, AtomicOrdering::SeqCst);
    }

    pub fn op_finished(&self) {
        self.op_counter.fetch_sub(1, AtomicOrdering::SeqCst);
    }

    #[must_use]
    pub fn ops_active(&self) -> u64 {
        self.op_counter.load(AtomicOrdering::SeqCst)
    }

    /// Blocks until no operation is inside this plugin.
    pub fn wait_for_ops_to_finish(&self) {
        while self.ops_active() > 0 {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    #[must_use]
    pub fn is_critical(&self) -> bool {
        CRITICAL_PLUGINS
            .iter()
            .any(|c| self.name.eq_ignore_ascii_case(c))
    }
}

/// Whether a plugin's subtree and special-data rules admit this operation.
#[must_use]
pub fn plugin_matches_operation(
    config: &PluginConfig,
    target: Option<&Sdn>,
    bind_ndn: Option<&str>,
    is_root: bool,
) -> bool {
    if config.is_global() && config.bind.special.is_all() {
        return true;
    }
    if let Some(t) = target {
        if config.target.deny.iter().any(|s| t.issuffix(s)) {
            return false;
        }
        if !config.target.allow.is_empty() && !config.target.allow.iter().any(|s| t.issuffix(s)) {
            return false;
        }
    }
    match bind_ndn {
        None => {
            if !config.bind.special.anonymous_bind {
                return false;
            }
        }
        Some("") => {
            if !config.bind.special.anonymous_bind {
                return false;
            }
        }
        Some(b) => {
            if is_root {
                if !config.bind.special.root_bind {
                    return false;
                }
            } else {
                let bound = Sdn::from_ndn(b);
                if config.bind.deny.iter().any(|s| bound.issuffix(s)) {
                    return false;
                }
                if !config.bind.allow.is_empty()
                    && !config.bind.allow.iter().any(|s| bound.issuffix(s))
                {
                    return false;
                }
            }
        }
    }
    true
}

/// The typed plugin lists, startup factories, and shutdown order.
pub struct PluginRegistry {
    lists: RwLock<HashMap<PluginType, Vec<Arc<Plugin>>>>,
    shutdown_order: RwLock<Vec<Arc<Plugin>>>,
    factories: RwLock<HashMap<String, PluginInitFn>>,
    rootdn_ndn: RwLock<Option<String>>,
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            lists: RwLock::new(HashMap::new()),
            shutdown_order: RwLock::new(Vec::new()),
            factories: RwLock::new(HashMap::new()),
            rootdn_ndn: RwLock::new(None),
        }
    }

    /// Sets the rootdn used by bind-subtree gating.
    pub fn set_rootdn(&self, ndn: impl Into<String>) {
        *self.rootdn_ndn.write() = Some(ndn.into());
    }

    /// Registers a named initializer, the analogue of an init symbol in a
    /// loadable module.
    pub fn register_factory(&self, name: &str, f: PluginInitFn) {
        self.factories.write().insert(name.to_owned(), f);
    }

    #[must_use]
    pub fn factory(&self, name: &str) -> Option<PluginInitFn> {
        self.factories.read().get(name).cloned()
    }

    /// Inserts a plugin into its type list, ascending by precedence with
    /// ties in insertion order.
    pub fn insert_plugin(&self, plugin: Arc<Plugin>) {
        let mut lists = self.lists.write();
        let list = lists.entry(plugin.ptype()).or_default();
        let at = list
            .iter()
            .position(|p| p.precedence() > plugin.precedence())
            .unwrap_or(list.len());
        list.insert(at, plugin);
    }

    pub fn remove_plugin(&self, plugin: &Arc<Plugin>) {
        let mut lists = self.lists.write();
        if let Some(list) = lists.get_mut(&plugin.ptype()) {
            list.retain(|p| !Arc::ptr_eq(p, plugin));
        }
        self.shutdown_order
            .write()
            .retain(|p| !Arc::ptr_eq(p, plugin));
    }

    /// Snapshot of one type's list in call order.
    #[must_use]
    pub fn list(&self, ptype: PluginType) -> Vec<Arc<Plugin>> {
        self.lists.read().get(&ptype).cloned().unwrap_or_default()
    }

    /// Every registered plugin.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Plugin>> {
        self.lists.read().values().flatten().cloned().collect()
    }

    #[must_use]
    pub fn find_by_name(&self, name: &str) -> Option<Arc<Plugin>> {
        self.all()
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
    }

    pub fn push_shutdown(&self, plugin: Arc<Plugin>) {
        self.shutdown_order.write().push(plugin);
    }

    #[must_use]
    pub fn shutdown_order(&self) -> Vec<Arc<Plugin>> {
        self.shutdown_order.read().clone()
    }

    /// Invokes a slot across its plugin list. The fold depends on the
    /// stage:
    ///
    /// - preop (LDAP and internal) and backend-txn-preop: the first
    ///   non-zero return aborts the walk and is returned;
    /// - postop: errors are logged, the overall result is zero;
    /// - backend pre/post and txn-post: bitwise OR, except that
    ///   `PLUGIN_FAILURE` wins outright.
    pub fn call_plugins(&self, pb: &mut Pblock, slot: FnSlot) -> i32 {
        let ptype = slot.list_type();
        // Snapshot under the read lock, call outside it: a plugin body may
        // itself issue internal operations that walk these lists.
        let list = self.list(ptype);
        let rootdn = self.rootdn_ndn.read().clone();
        let bind_ndn = pb.requestor_sdn().map(|s| s.as_ndn().to_owned());
        let is_root = match (&rootdn, &bind_ndn) {
            (Some(r), Some(b)) => r == b,
            _ => false,
        };
        let target = pb.target_sdn().cloned();

        let mut return_value = 0;
        for plugin in &list {
            if plugin.is_closed() || plugin.is_stopped() || !plugin.is_started() {
                continue;
            }
            let Some(func) = plugin.func(slot) else {
                continue;
            };
            if !plugin_matches_operation(
                plugin.config(),
                target.as_ref(),
                bind_ndn.as_deref(),
                is_root,
            ) {
                continue;
            }
            debug!(plugin = plugin.name(), ?slot, "calling plugin");
            metrics::PLUGIN_CALLS.with_label_values(&[plugin.name()]).inc();
            plugin.op_started();
            let rc = func(pb);
            plugin.op_finished();
            if rc == 0 {
                continue;
            }
            match ptype {
                PluginType::PreOperation
                | PluginType::InternalPreOperation
                | PluginType::AccessControl
                | PluginType::BeTxnPreOperation => {
                    return rc;
                }
                PluginType::PostOperation | PluginType::InternalPostOperation => {
                    warn!(plugin = plugin.name(), rc, "postop plugin failed");
                }
                PluginType::BePreOperation
                | PluginType::BePostOperation
                | PluginType::BeTxnPostOperation => {
                    if rc == PLUGIN_FAILURE {
                        return PLUGIN_FAILURE;
                    }
                    return_value |= rc;
                }
                _ => {
                    return rc;
                }
            }
        }
        match ptype {
            PluginType::PostOperation | PluginType::InternalPostOperation => 0,
            _ => return_value,
        }
    }

    /// Calls one plugin's slot function directly (start/close paths).
    /// Start runs only on a plugin not yet started; close runs only on one
    /// not yet closed. This spares plugin bodies from double-start and
    /// double-stop checks.
    pub fn call_one(&self, plugin: &Arc<Plugin>, pb: &mut Pblock, slot: FnSlot) -> i32 {
        let should_call = match slot {
            FnSlot::Start => !plugin.is_started(),
            FnSlot::Close => !plugin.is_closed(),
            _ => plugin.is_started() && !plugin.is_stopped() && !plugin.is_closed(),
        };
        let Some(func) = plugin.func(slot) else {
            return 0;
        };
        if !should_call {
            return 0;
        }
        plugin.op_started();
        let rc = func(pb);
        plugin.op_finished();
        rc
    }
}

// ---- setup / start / delete / restart ----

fn attr_values(entry: &Entry, ty: &str) -> Vec<String> {
    entry
        .attr(ty)
        .map(|a| {
            a.values()
                .iter()
                .filter_map(|v| v.as_str().map(str::to_owned))
                .collect()
        })
        .unwrap_or_default()
}

/// Whether a plugin config entry is enabled.
#[must_use]
pub fn plugin_entry_enabled(entry: &Entry) -> bool {
    entry
        .first_value_str("nsslapd-pluginEnabled")
        .is_some_and(|v| v.eq_ignore_ascii_case("on"))
}

/// Builds a plugin from its config entry, runs its initializer, and
/// registers it. The entry supplies name, type, init function, precedence,
/// arguments, and dependency lists.
pub fn plugin_setup(registry: &PluginRegistry, entry: &Entry) -> LdapResult<Arc<Plugin>> {
    let name = entry
        .first_value_str("cn")
        .ok_or_else(|| LdapError::unwilling("plugin entry has no cn"))?
        .to_owned();
    let type_str = entry
        .first_value_str("nsslapd-pluginType")
        .ok_or_else(|| LdapError::unwilling(format!("plugin {name} has no type")))?;
    let ptype = PluginType::from_config_str(type_str).ok_or_else(|| {
        LdapError::InvalidSyntax(format!("unknown plugin type {type_str:?} for {name}"))
    })?;
    let init_name = entry
        .first_value_str("nsslapd-pluginInitfunc")
        .ok_or_else(|| LdapError::unwilling(format!("plugin {name} has no init function")))?
        .to_owned();

    let precedence = match entry.first_value_str("nsslapd-pluginPrecedence") {
        Some(raw) => {
            let p: i32 = raw.parse().map_err(|_| {
                LdapError::InvalidSyntax(format!("bad precedence {raw:?} for {name}"))
            })?;
            if !(PLUGIN_MIN_PRECEDENCE..=PLUGIN_MAX_PRECEDENCE).contains(&p) {
                return Err(LdapError::unwilling(format!(
                    "precedence {p} for {name} outside [{PLUGIN_MIN_PRECEDENCE},{PLUGIN_MAX_PRECEDENCE}]"
                )));
            }
            p
        }
        None => match entry
            .first_value_str("nsslapd-plugin-group")
            .and_then(|g| registry.find_by_name(g))
        {
            // A grouped plugin inherits the group's precedence unless it
            // sets its own.
            Some(group) => group.precedence(),
            None => PLUGIN_DEFAULT_PRECEDENCE,
        },
    };

    let mut plugin = Plugin::new(
        name.as_str(),
        entry.sdn().clone(),
        ptype,
        precedence,
        PluginConfig::default(),
    );
    let mut argv = Vec::new();
    let mut n = 0;
    while let Some(v) = entry.first_value_str(&format!("nsslapd-pluginArg{n}")) {
        argv.push(v.to_owned());
        n += 1;
    }
    plugin.argv = argv;
    plugin.depends_named = attr_values(entry, "nsslapd-plugin-depends-on-named");
    plugin.depends_type = attr_values(entry, "nsslapd-plugin-depends-on-type");
    let plugin = Arc::new(plugin);

    let init = registry.factory(&init_name).ok_or_else(|| {
        LdapError::unwilling(format!("unknown plugin init function {init_name:?}"))
    })?;
    let rc = init(&plugin, entry);
    if rc != 0 {
        return Err(LdapError::unwilling(format!(
            "plugin {name} init function failed ({rc})"
        )));
    }
    registry.insert_plugin(plugin.clone());
    debug!(plugin = %name, ptype = ptype.as_str(), precedence, "plugin set up");
    Ok(plugin)
}

/// Starts a plugin: runs its start function and marks it started.
pub fn plugin_start(registry: &PluginRegistry, plugin: &Arc<Plugin>) -> LdapResult<()> {
    if plugin.is_started() {
        return Ok(());
    }
    let mut pb = Pblock::new();
    let rc = registry.call_one(plugin, &mut pb, FnSlot::Start);
    if rc != 0 {
        error!(plugin = plugin.name(), rc, "failed to start plugin");
        return Err(LdapError::unwilling(format!(
            "plugin {} failed to start",
            plugin.name()
        )));
    }
    plugin.set_started(true);
    plugin.set_stopped(false);
    info!(plugin = plugin.name(), "plugin started");
    Ok(())
}

/// Removes a plugin: refuses for critical plugins and for plugins others
/// depend on, except the deferred types whose removal waits for restart.
pub fn plugin_delete(registry: &PluginRegistry, name: &str) -> LdapResult<()> {
    let plugin = registry
        .find_by_name(name)
        .ok_or_else(|| LdapError::no_such_object(format!("plugin {name}")))?;
    if plugin.is_critical() {
        return Err(LdapError::unwilling(format!(
            "plugin {name} is critical and cannot be removed at runtime"
        )));
    }
    if plugin.ptype().removal_deferred() {
        info!(plugin = name, "removal of this plugin type takes effect at restart");
        return Ok(());
    }
    for other in registry.all() {
        if Arc::ptr_eq(&other, &plugin) {
            continue;
        }
        if other
            .depends_named()
            .iter()
            .any(|d| d.eq_ignore_ascii_case(name))
        {
            return Err(LdapError::unwilling(format!(
                "plugin {} depends on {name}",
                other.name()
            )));
        }
    }
    // Removing the last plugin of a type breaks type dependencies.
    let same_type = registry.list(plugin.ptype());
    if same_type.len() == 1 {
        let tname = plugin.ptype().as_str();
        for other in registry.all() {
            if Arc::ptr_eq(&other, &plugin) {
                continue;
            }
            if other
                .depends_type()
                .iter()
                .any(|d| d.eq_ignore_ascii_case(tname))
            {
                return Err(LdapError::unwilling(format!(
                    "plugin {} depends on type {tname}",
                    other.name()
                )));
            }
        }
    }

    plugin.set_stopped(true);
    plugin.wait_for_ops_to_finish();
    let mut pb = Pblock::new();
    let rc = registry.call_one(&plugin, &mut pb, FnSlot::Close);
    if rc != 0 {
        warn!(plugin = name, rc, "plugin close function failed");
    }
    plugin.set_closed(true);
    plugin.set_started(false);
    registry.remove_plugin(&plugin);
    info!(plugin = name, "plugin removed");
    Ok(())
}

/// Sets up and starts a plugin from its entry; a start failure rolls the
/// setup back.
pub fn plugin_add(registry: &PluginRegistry, entry: &Entry) -> LdapResult<Arc<Plugin>> {
    let plugin = plugin_setup(registry, entry)?;
    if let Err(e) = plugin_start(registry, &plugin) {
        registry.remove_plugin(&plugin);
        return Err(e);
    }
    registry.push_shutdown(plugin.clone());
    Ok(plugin)
}

/// Replaces a plugin: delete the old, add the new; on failure, the old
/// plugin is put back.
pub fn plugin_restart(
    registry: &PluginRegistry,
    before: &Entry,
    after: &Entry,
) -> LdapResult<()> {
    let name = before
        .first_value_str("cn")
        .ok_or_else(|| LdapError::unwilling("plugin entry has no cn"))?;
    plugin_delete(registry, name)?;
    match plugin_add(registry, after) {
        Ok(_) => Ok(()),
        Err(e) => {
            error!(plugin = name, error = %e, "plugin restart failed, restoring previous plugin");
            if let Err(undo) = plugin_add(registry, before) {
                error!(plugin = name, error = %undo, "could not restore previous plugin");
            }
            Err(e)
        }
    }
}
