//! Server operation counters.
//!
//! Metrics register lazily on first access.

use once_cell::sync::Lazy;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

/// Operations entering the dispatcher, by operation type.
pub static OPS_INITIATED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ferrodir_ops_initiated_total",
        "Operations entering the dispatcher",
        &["op"]
    )
    .expect("Failed to register operation counter")
});

/// Anonymous simple binds accepted (including by the default backend).
pub static ANONYMOUS_BINDS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "ferrodir_anonymous_binds_total",
        "Anonymous simple binds accepted"
    )
    .expect("Failed to register anonymous bind counter")
});

/// Plugin functions invoked, by plugin name.
pub static PLUGIN_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "ferrodir_plugin_calls_total",
        "Plugin functions invoked",
        &["plugin"]
    )
    .expect("Failed to register plugin call counter")
});
