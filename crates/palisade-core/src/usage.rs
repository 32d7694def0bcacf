//! Argument usage notifications
//!
//! When a rule is accepted the collection reports which arguments of the
//! syscall are inspected, so a runtime decision cache can tell which calls
//! are cacheable by syscall number alone.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Receiver of argument usage for accepted rules
pub trait ArgUsageSink: fmt::Debug + Send + Sync {
    /// `arg_mask` has bit `i` set when argument `i` is constrained.
    fn rule_accepted(&self, syscall: i32, arg_mask: u8);
}

/// Shared table of argument masks per syscall
///
/// Clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct ArgUsageTable {
    inner: Arc<RwLock<BTreeMap<i32, u8>>>,
}

impl ArgUsageTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulated mask for `syscall`, if any rule mentioned it.
    #[must_use]
    pub fn arg_mask(&self, syscall: i32) -> Option<u8> {
        self.inner.read().get(&syscall).copied()
    }

    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<i32, u8> {
        self.inner.read().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }
}

impl ArgUsageSink for ArgUsageTable {
    fn rule_accepted(&self, syscall: i32, arg_mask: u8) {
        *self.inner.write().entry(syscall).or_default() |= arg_mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_accumulate() {
        let table = ArgUsageTable::new();
        let shared = table.clone();
        table.rule_accepted(1, 0b001);
        shared.rule_accepted(1, 0b100);
        table.rule_accepted(7, 0);

        assert_eq!(table.arg_mask(1), Some(0b101));
        assert_eq!(table.arg_mask(7), Some(0));
        assert_eq!(table.arg_mask(2), None);
        assert_eq!(shared.len(), 2);
    }
}
