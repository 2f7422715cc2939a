//! `ServerCore`: the explicit context holding everything that was
//! process-global in older directory servers -- the sampled-time cell, the
//! registries, the DSE, and the event queue.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::info;

use ferrodir_core::config::{PasswordSection, ServerConfig};
use ferrodir_core::csngen::SampledTime;
use ferrodir_core::dn::{Scope, Sdn};
use ferrodir_core::entry::Entry;
use ferrodir_core::error::{LdapError, LdapResult};
use ferrodir_core::filter::Filter;
use ferrodir_dse::DseStore;

use crate::backend::{Backend, BackendRegistry, BeState};
use crate::control::{init_controls, ControlRegistry};
use crate::dse_backend::DseBackend;
use crate::eventq::EventQueue;
use crate::features::SupportRegistry;
use crate::house::Housekeeping;
use crate::plugin::PluginRegistry;
use crate::plugin_start::{plugin_dependency_closeall, plugin_dependency_startall};
use crate::rewriters::{rewriters_init, RewriterRegistry};

/// DN of the plugin configuration container.
pub const PLUGIN_CONTAINER_DN: &str = "cn=plugins,cn=config";

/// The server context, constructed once at startup and threaded through
/// the dispatcher.
pub struct ServerCore {
    config: ServerConfig,
    rootdn_ndn: String,
    readonly: AtomicBool,
    time: SampledTime,
    backends: BackendRegistry,
    plugins: PluginRegistry,
    controls: ControlRegistry,
    support: SupportRegistry,
    rewriters: RewriterRegistry,
    dse: RwLock<Option<Arc<DseStore>>>,
    eventq: EventQueue,
    housekeeping: Mutex<Option<Housekeeping>>,
}

impl ServerCore {
    /// Builds the context from a validated configuration.
    pub fn new(config: ServerConfig) -> LdapResult<Self> {
        config
            .validate()
            .map_err(|e| LdapError::operations_error(e.to_string()))?;
        let rootdn_ndn = config.rootdn_ndn();
        let controls = ControlRegistry::new();
        init_controls(&controls);
        let plugins = PluginRegistry::new();
        plugins.set_rootdn(rootdn_ndn.clone());
        let readonly = config.server.readonly;
        Ok(Self {
            config,
            rootdn_ndn,
            readonly: AtomicBool::new(readonly),
            time: SampledTime::new(),
            backends: BackendRegistry::new(),
            plugins,
            controls,
            support: SupportRegistry::new(),
            rewriters: RewriterRegistry::new(),
            dse: RwLock::new(None),
            eventq: EventQueue::new(),
            housekeeping: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn password_policy(&self) -> &PasswordSection {
        &self.config.password
    }

    #[must_use]
    pub fn backends(&self) -> &BackendRegistry {
        &self.backends
    }

    #[must_use]
    pub fn plugins(&self) -> &PluginRegistry {
        &self.plugins
    }

    #[must_use]
    pub fn controls(&self) -> &ControlRegistry {
        &self.controls
    }

    #[must_use]
    pub fn support(&self) -> &SupportRegistry {
        &self.support
    }

    #[must_use]
    pub fn rewriters(&self) -> &RewriterRegistry {
        &self.rewriters
    }

    #[must_use]
    pub fn time(&self) -> &SampledTime {
        &self.time
    }

    #[must_use]
    pub fn eventq(&self) -> &EventQueue {
        &self.eventq
    }

    #[must_use]
    pub fn dse(&self) -> Option<Arc<DseStore>> {
        self.dse.read().clone()
    }

    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.readonly.load(AtomicOrdering::SeqCst)
    }

    pub fn set_readonly(&self, v: bool) {
        self.readonly.store(v, AtomicOrdering::SeqCst);
    }

    #[must_use]
    pub fn rootdn_ndn(&self) -> &str {
        &self.rootdn_ndn
    }

    /// Byte-equality rootdn identity test against a normalized DN.
    #[must_use]
    pub fn is_rootdn(&self, ndn: &str) -> bool {
        !ndn.is_empty() && ndn == self.rootdn_ndn
    }

    /// Mounts the DSE store as the backend serving `cn=config`, and wires
    /// the rewriter container.
    pub fn init_dse(&self, store: Arc<DseStore>) -> LdapResult<Arc<Backend>> {
        store.set_write_operational_attrs(self.config.dse.write_operational_attrs);
        *self.dse.write() = Some(store.clone());
        let be = self.backends.be_new("DSE", "dse", true, false)?;
        be.add_suffix(Sdn::new("cn=config")?);
        be.set_ops(Arc::new(DseBackend::new(store.clone())));
        be.set_state(BeState::Started);
        rewriters_init(&self.rewriters, &store)?;
        info!("DSE backend mounted at cn=config");
        Ok(be)
    }

    /// Plugin config entries under `cn=plugins,cn=config`.
    pub fn plugin_entries(&self) -> LdapResult<Vec<Entry>> {
        let Some(dse) = self.dse() else {
            return Ok(Vec::new());
        };
        dse.search(
            &Sdn::new(PLUGIN_CONTAINER_DN)?,
            Scope::OneLevel,
            &Filter::parse("(objectclass=*)")?,
        )
    }

    /// Starts every enabled plugin in dependency order.
    pub fn start_plugins(&self) -> LdapResult<()> {
        let entries = self.plugin_entries()?;
        plugin_dependency_startall(&self.plugins, &entries)
    }

    /// Starts background services: the event queue and the housekeeping
    /// tick that refreshes sampled time.
    pub fn start(&self) {
        self.eventq.start();
        let hk = Housekeeping::start(
            &self.eventq,
            self.time.clone(),
            self.config.server.housekeeping_interval_secs,
        );
        *self.housekeeping.lock() = Some(hk);
        info!("server core services started");
    }

    /// Stops background services and closes plugins in reverse startup
    /// order.
    pub fn stop(&self) {
        if let Some(mut hk) = self.housekeeping.lock().take() {
            hk.stop(&self.eventq);
        }
        self.eventq.stop();
        plugin_dependency_closeall(&self.plugins);
        info!("server core services stopped");
    }
}
