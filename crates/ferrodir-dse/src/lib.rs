//! The DSE store: the server's configuration entries (`cn=config` and
//! friends), kept in an ordered in-memory tree and persisted as a text
//! record file.

pub mod callback;
pub mod store;

pub use callback::{
    CallbackStatus, DseCallback, DseCallbackFn, DseCallbackResult, DseOperation, DsePhase,
};
pub use store::{DseOpFlags, DsePaths, DseStore};
