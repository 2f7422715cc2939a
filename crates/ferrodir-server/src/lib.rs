//! The FerroDir server fabric: the parameter block, backend and plugin
//! registries, the staged operation dispatcher, the control registry, the
//! internal-op API, and the event queue, all tied together by
//! [`core::ServerCore`].

pub mod backend;
pub mod control;
pub mod core;
pub mod defbackend;
pub mod dispatch;
pub mod dse_backend;
pub mod eventq;
pub mod features;
pub mod house;
pub mod internal_op;
pub mod metrics;
pub mod operation;
pub mod pblock;
pub mod plugin;
pub mod plugin_start;
pub mod proxyauth;
pub mod pwpolicy;
pub mod rewriters;

pub use backend::{
    be_flags, Backend, BackendOps, BackendRegistry, BackendSlot, BeState, BindDisposition,
};
pub use control::{
    decode_controls, find_control, get_ldapmessage_controls, init_controls, oids, vet_controls,
    write_controls, ControlRegistry, LdapControl,
};
pub use crate::core::ServerCore;
pub use dispatch::{dispatch_operation, send_result};
pub use dse_backend::DseBackend;
pub use eventq::{EventArg, EventFn, EventId, EventQueue};
pub use features::SupportRegistry;
pub use house::Housekeeping;
pub use internal_op::{
    add_internal, delete_internal, modify_internal, search_internal, search_internal_get_entry,
};
pub use operation::{OpFlags, OpType, Operation, LDAP_AUTH_SIMPLE, OPS_ALL, OPS_NONE};
pub use pblock::{PbKey, PbValue, Pblock, ResultHandler};
pub use plugin::{
    plugin_add, plugin_delete, plugin_matches_operation, plugin_restart, plugin_setup,
    plugin_start, FnSlot, Plugin, PluginConfig, PluginFn, PluginIdentity, PluginInitFn,
    PluginRegistry, PluginType, PLUGIN_FAILURE,
};
pub use plugin_start::{plugin_dependency_closeall, plugin_dependency_startall};
pub use proxyauth::{proxyauth_get_dn, ProxyIdentity};
pub use pwpolicy::{check_account_lock, need_new_pw, PwVerdict};
pub use rewriters::{rewriters_init, RewriterRegistry};
