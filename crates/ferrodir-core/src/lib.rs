//! Core domain types for the FerroDir directory server: DNs, attribute
//! values and value sets, entries, the LDIF record codec, LDAP filters, the
//! CSN generator, and server configuration.

pub mod attr;
pub mod config;
pub mod csn;
pub mod csngen;
pub mod dn;
pub mod entry;
pub mod error;
pub mod filter;
pub mod value;
pub mod valueset;

pub use attr::{is_operational_type, value_cmp, Attr, AttrSyntax};
pub use config::ServerConfig;
pub use csn::{Csn, CsnSet, CsnType, CSN_STRSIZE};
pub use csngen::{
    CsnCallback, CsnError, CsnGenerator, SampledTime, ATTR_CSN_GENERATOR_STATE,
    CSN_MAX_SEQNUM, CSN_MAX_TIME_ADJUST,
};
pub use dn::{DnError, Scope, Sdn, DN_MAX_LEN};
pub use entry::{Entry, Mod, ModOp};
pub use error::{LdapError, LdapResult, ResultCode};
pub use filter::Filter;
pub use value::Value;
pub use valueset::{ValueSet, ValueSetError, SORT_THRESHOLD};
