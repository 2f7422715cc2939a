//! The operation descriptor carried through the dispatch pipeline.

use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

/// Simple bind method value from the wire.
pub const LDAP_AUTH_SIMPLE: i64 = 0x80;
/// No authentication supplied.
pub const LDAP_AUTH_NONE: i64 = 0x00;

/// The LDAP operation kinds the dispatcher routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpType {
    Bind,
    Unbind,
    Search,
    Compare,
    Modify,
    Add,
    Delete,
    ModDn,
    Abandon,
    Extended,
}

impl OpType {
    /// The bit used in control applicability bitmaps.
    #[must_use]
    pub const fn bit(self) -> u32 {
        match self {
            Self::Bind => 1 << 0,
            Self::Unbind => 1 << 1,
            Self::Search => 1 << 2,
            Self::Compare => 1 << 3,
            Self::Add => 1 << 4,
            Self::Delete => 1 << 5,
            Self::Modify => 1 << 6,
            Self::ModDn => 1 << 7,
            Self::Abandon => 1 << 8,
            Self::Extended => 1 << 9,
        }
    }

    /// Whether the operation mutates the directory.
    #[must_use]
    pub const fn is_write(self) -> bool {
        matches!(self, Self::Add | Self::Delete | Self::Modify | Self::ModDn)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bind => "bind",
            Self::Unbind => "unbind",
            Self::Search => "search",
            Self::Compare => "compare",
            Self::Modify => "modify",
            Self::Add => "add",
            Self::Delete => "delete",
            Self::ModDn => "moddn",
            Self::Abandon => "abandon",
            Self::Extended => "extended",
        }
    }
}

/// Bitmap of operation bits covering every operation.
pub const OPS_ALL: u32 = 0x3ff;
/// Bitmap matching no operation (response-only controls).
pub const OPS_NONE: u32 = 0;

/// Operation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpFlags(pub u32);

impl OpFlags {
    /// The operation originated inside the process, not on the wire.
    pub const INTERNAL: OpFlags = OpFlags(1 << 0);
    /// Skip access-control evaluation for this operation.
    pub const NO_ACCESS_CHECK: OpFlags = OpFlags(1 << 1);
    /// The operation replays a change received from a replica.
    pub const REPLICATED: OpFlags = OpFlags(1 << 2);
    /// The issuing component may write even in read-only mode.
    pub const BYPASS_READONLY: OpFlags = OpFlags(1 << 3);

    #[must_use]
    pub const fn empty() -> Self {
        OpFlags(0)
    }

    #[must_use]
    pub const fn contains(self, other: OpFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for OpFlags {
    type Output = OpFlags;

    fn bitor(self, rhs: OpFlags) -> OpFlags {
        OpFlags(self.0 | rhs.0)
    }
}

/// One in-flight operation. Abandonment is a hint checked at suspension
/// boundaries; nothing is forcibly interrupted.
#[derive(Debug)]
pub struct Operation {
    op_type: OpType,
    flags: OpFlags,
    abandoned: AtomicBool,
    deadline: Option<i64>,
}

impl Operation {
    #[must_use]
    pub fn new(op_type: OpType, flags: OpFlags) -> Self {
        Self {
            op_type,
            flags,
            abandoned: AtomicBool::new(false),
            deadline: None,
        }
    }

    /// An internal operation: same pipeline, no wire layer, no
    /// connection-local limits.
    #[must_use]
    pub fn internal(op_type: OpType, flags: OpFlags) -> Self {
        Self::new(op_type, flags | OpFlags::INTERNAL)
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline_secs: i64) -> Self {
        self.deadline = Some(deadline_secs);
        self
    }

    #[must_use]
    pub fn op_type(&self) -> OpType {
        self.op_type
    }

    #[must_use]
    pub fn flags(&self) -> OpFlags {
        self.flags
    }

    #[must_use]
    pub fn is_internal(&self) -> bool {
        self.flags.contains(OpFlags::INTERNAL)
    }

    /// Marks the operation abandoned.
    pub fn abandon(&self) {
        self.abandoned.store(true, AtomicOrdering::SeqCst);
    }

    #[must_use]
    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(AtomicOrdering::SeqCst)
    }

    #[must_use]
    pub fn deadline(&self) -> Option<i64> {
        self.deadline
    }

    #[must_use]
    pub fn deadline_expired(&self, now_secs: i64) -> bool {
        self.deadline.is_some_and(|d| now_secs > d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_compose() {
        let f = OpFlags::INTERNAL | OpFlags::NO_ACCESS_CHECK;
        assert!(f.contains(OpFlags::INTERNAL));
        assert!(f.contains(OpFlags::NO_ACCESS_CHECK));
        assert!(!f.contains(OpFlags::REPLICATED));
    }

    #[test]
    fn op_bits_are_distinct() {
        let all = [
            OpType::Bind,
            OpType::Unbind,
            OpType::Search,
            OpType::Compare,
            OpType::Add,
            OpType::Delete,
            OpType::Modify,
            OpType::ModDn,
            OpType::Abandon,
            OpType::Extended,
        ];
        let mut seen = 0u32;
        for op in all {
            assert_eq!(seen & op.bit(), 0);
            seen |= op.bit();
        }
        assert_eq!(seen, OPS_ALL);
    }

    #[test]
    fn abandonment_is_sticky() {
        let op = Operation::new(OpType::Search, OpFlags::empty());
        assert!(!op.is_abandoned());
        op.abandon();
        assert!(op.is_abandoned());
    }
}
