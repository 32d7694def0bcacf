//! Filter collections
//!
//! A collection owns one filter per architecture, the attributes shared by
//! all of them and a stack of transaction snapshots. Rules and priority hints
//! are given in the native architecture's syscall numbering and fanned out
//! to every filter.

use crate::arch::{self, ArchRef, ArchToken, Endian};
use crate::filter::Filter;
use crate::host::{HostSupport, SystemHost};
use crate::rule::{ARG_COUNT_MAX, ArgChain};
use crate::usage::ArgUsageSink;
use crate::{Action, ArgCmp, FilterError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// Attributes shared by every filter of a collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attributes {
    /// Action for calls no rule decides. Fixed at creation.
    pub default_action: Action,
    /// Action for calls from an architecture without a filter.
    pub bad_arch_action: Action,
    pub no_new_privs: bool,
    pub thread_sync: bool,
}

impl Attributes {
    #[must_use]
    pub const fn new(default_action: Action) -> Self {
        Self {
            default_action,
            bad_arch_action: Action::KILL,
            no_new_privs: true,
            thread_sync: false,
        }
    }
}

/// Attribute identifiers used by the C ABI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum FilterAttr {
    DefaultAction = 1,
    BadArchAction = 2,
    NoNewPrivs = 3,
    ThreadSync = 4,
}

impl FilterAttr {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::DefaultAction => "default_action",
            Self::BadArchAction => "bad_arch_action",
            Self::NoNewPrivs => "no_new_privs",
            Self::ThreadSync => "thread_sync",
        }
    }
}

impl TryFrom<u32> for FilterAttr {
    type Error = FilterError;

    fn try_from(value: u32) -> Result<Self> {
        Ok(match value {
            1 => Self::DefaultAction,
            2 => Self::BadArchAction,
            3 => Self::NoNewPrivs,
            4 => Self::ThreadSync,
            other => return Err(FilterError::NotFound(format!("attribute {other}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionState {
    Valid,
    Freed,
}

/// Filters for every architecture a policy targets
#[derive(Debug)]
pub struct FilterCollection {
    state: CollectionState,
    native: ArchRef,
    endian: Option<Endian>,
    filters: Vec<Filter>,
    attrs: Attributes,
    /// Most recent last.
    snapshots: Vec<Vec<Filter>>,
    host: Arc<dyn HostSupport>,
    usage: Option<Arc<dyn ArgUsageSink>>,
}

impl FilterCollection {
    /// Create a collection with one filter for the build architecture.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` when the build architecture has no built-in
    /// description.
    pub fn new(default_action: Action) -> Result<Self> {
        let native = arch::native().ok_or_else(|| {
            FilterError::Unsupported(format!(
                "no built-in description for {}",
                std::env::consts::ARCH
            ))
        })?;
        Ok(Self::with_native(default_action, native))
    }

    /// Create a collection treating `native` as the native architecture.
    #[must_use]
    pub fn with_native(default_action: Action, native: ArchRef) -> Self {
        info!(arch = native.name(), default = %default_action, "filter collection created");
        Self {
            state: CollectionState::Valid,
            native,
            endian: Some(native.endian()),
            filters: vec![Filter::new(native)],
            attrs: Attributes::new(default_action),
            snapshots: Vec::new(),
            host: Arc::new(SystemHost),
            usage: None,
        }
    }

    /// Replace the kernel capability source.
    #[must_use]
    pub fn with_host(mut self, host: Arc<dyn HostSupport>) -> Self {
        self.host = host;
        self
    }

    /// Receive argument usage for every accepted rule.
    pub fn set_usage_sink(&mut self, sink: Option<Arc<dyn ArgUsageSink>>) {
        self.usage = sink;
    }

    /// Drop every filter and snapshot and start over with the native filter.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` on a released collection.
    pub fn reset(&mut self, default_action: Action) -> Result<()> {
        self.check_live()?;
        self.filters = vec![Filter::new(self.native)];
        self.endian = Some(self.native.endian());
        self.snapshots.clear();
        self.attrs = Attributes::new(default_action);
        info!(arch = self.native.name(), default = %default_action, "filter collection reset");
        Ok(())
    }

    /// Free everything; the collection rejects all later calls.
    pub fn release(&mut self) {
        self.filters.clear();
        self.snapshots.clear();
        self.endian = None;
        self.state = CollectionState::Freed;
        info!("filter collection released");
    }

    #[must_use]
    pub const fn state(&self) -> CollectionState {
        self.state
    }

    /// Check that the collection is live and has at least one filter.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` otherwise.
    pub fn validate(&self) -> Result<()> {
        self.check_live()?;
        if self.filters.is_empty() {
            return Err(FilterError::InvalidArgument(
                "collection has no architectures".into(),
            ));
        }
        Ok(())
    }

    fn check_live(&self) -> Result<()> {
        match self.state {
            CollectionState::Valid => Ok(()),
            CollectionState::Freed => Err(FilterError::InvalidArgument(
                "collection has been released".into(),
            )),
        }
    }

    #[must_use]
    pub fn native(&self) -> ArchRef {
        self.native
    }

    /// Byte order shared by all filters, `None` while there are none.
    #[must_use]
    pub const fn endian(&self) -> Option<Endian> {
        self.endian
    }

    #[must_use]
    pub const fn attributes(&self) -> &Attributes {
        &self.attrs
    }

    #[must_use]
    pub fn filters(&self) -> &[Filter] {
        &self.filters
    }

    #[must_use]
    pub fn filter(&self, token: ArchToken) -> Option<&Filter> {
        self.filters.iter().find(|f| f.arch().token() == token)
    }

    #[must_use]
    pub fn has_architecture(&self, token: ArchToken) -> bool {
        self.filter(token).is_some()
    }

    /// Number of open transactions.
    #[must_use]
    pub fn transaction_depth(&self) -> usize {
        self.snapshots.len()
    }

    /// Add an empty filter for `arch`.
    ///
    /// # Errors
    ///
    /// Returns `Exists` if `arch` is already present or its byte order
    /// differs from the collection's.
    pub fn add_architecture(&mut self, arch: ArchRef) -> Result<()> {
        self.check_live()?;
        if self.has_architecture(arch.token()) {
            return Err(FilterError::Exists(format!(
                "architecture {} already present",
                arch.name()
            )));
        }
        if self.endian.is_some_and(|endian| endian != arch.endian()) {
            return Err(FilterError::Exists(format!(
                "architecture {} has a different byte order",
                arch.name()
            )));
        }
        self.filters.try_reserve(1)?;
        self.filters.push(Filter::new(arch));
        self.endian = Some(arch.endian());
        info!(arch = arch.name(), "architecture added");
        Ok(())
    }

    /// Remove the filter for `token`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if there is no such filter.
    pub fn remove_architecture(&mut self, token: ArchToken) -> Result<()> {
        self.check_live()?;
        let pos = self
            .filters
            .iter()
            .position(|f| f.arch().token() == token)
            .ok_or_else(|| FilterError::NotFound(format!("architecture {token}")))?;
        let filter = self.filters.remove(pos);
        if self.filters.is_empty() {
            self.endian = None;
        }
        info!(arch = filter.arch().name(), "architecture removed");
        Ok(())
    }

    /// Read an attribute in its C ABI encoding.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` on a released collection.
    pub fn attribute(&self, attr: FilterAttr) -> Result<u32> {
        self.check_live()?;
        Ok(match attr {
            FilterAttr::DefaultAction => self.attrs.default_action.raw(),
            FilterAttr::BadArchAction => self.attrs.bad_arch_action.raw(),
            FilterAttr::NoNewPrivs => u32::from(self.attrs.no_new_privs),
            FilterAttr::ThreadSync => u32::from(self.attrs.thread_sync),
        })
    }

    /// Set an attribute from its C ABI encoding.
    ///
    /// # Errors
    ///
    /// Returns `ReadOnly` for the default action, `InvalidArgument` for an
    /// invalid bad-architecture action and `Unsupported` when thread sync is
    /// requested on a kernel without it.
    pub fn set_attribute(&mut self, attr: FilterAttr, value: u32) -> Result<()> {
        self.check_live()?;
        match attr {
            FilterAttr::DefaultAction => return Err(FilterError::ReadOnly(attr.name())),
            FilterAttr::BadArchAction => self.attrs.bad_arch_action = Action::from_raw(value)?,
            FilterAttr::NoNewPrivs => self.attrs.no_new_privs = value != 0,
            FilterAttr::ThreadSync => {
                let enable = value != 0;
                if enable && !self.host.supports_thread_sync() {
                    return Err(FilterError::Unsupported(
                        "kernel cannot synchronize filters across threads".into(),
                    ));
                }
                self.attrs.thread_sync = enable;
            }
        }
        info!(attr = attr.name(), value, "attribute set");
        Ok(())
    }

    /// Add a rule to every filter.
    ///
    /// `syscall` uses the native architecture's numbering. Filters are
    /// updated independently: each either takes the rule or is left as it
    /// was, and the first failure is returned after all were tried.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for malformed comparisons, otherwise the
    /// first per-architecture error.
    pub fn add_rule(&mut self, strict: bool, action: Action, syscall: i32, args: &[ArgCmp]) -> Result<()> {
        self.validate()?;
        let chain = ArgChain::from_cmps(args)?;

        let mut first_err = None;
        let mut accepted = false;
        for filter in &mut self.filters {
            match filter.add_rule(self.native, strict, action, syscall, &chain) {
                Ok(applied) => accepted |= applied,
                Err(err) => {
                    warn!(arch = filter.arch().name(), syscall, "rule rejected: {err}");
                    first_err.get_or_insert(err);
                }
            }
        }

        if accepted {
            if let Some(sink) = &self.usage {
                sink.rule_accepted(syscall, chain.arg_mask());
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Raise the priority hint of `syscall` on every filter that has it.
    ///
    /// # Errors
    ///
    /// Returns the first per-architecture error other than a missing
    /// syscall.
    pub fn set_syscall_priority(&mut self, syscall: i32, hint: u16) -> Result<()> {
        self.validate()?;
        let mut first_err = None;
        for filter in &mut self.filters {
            if let Err(err) = filter.set_priority(self.native, syscall, hint) {
                warn!(arch = filter.arch().name(), syscall, "priority rejected: {err}");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Move every filter of `src` into this collection and release `src`.
    ///
    /// # Errors
    ///
    /// Returns `Exists` when the byte orders differ or an architecture is
    /// present in both; neither collection changes in that case.
    pub fn merge(&mut self, src: &mut Self) -> Result<()> {
        self.check_live()?;
        src.check_live()?;
        if let (Some(ours), Some(theirs)) = (self.endian, src.endian) {
            if ours != theirs {
                return Err(FilterError::Exists("collections differ in byte order".into()));
            }
        }
        if let Some(dup) = src
            .filters
            .iter()
            .find(|f| self.has_architecture(f.arch().token()))
        {
            return Err(FilterError::Exists(format!(
                "architecture {} present in both collections",
                dup.arch().name()
            )));
        }

        self.filters.try_reserve(src.filters.len())?;
        let moved = src.filters.len();
        self.filters.append(&mut src.filters);
        self.endian = self.endian.or(src.endian);
        src.release();
        info!(moved, "collections merged");
        Ok(())
    }

    /// Snapshot every filter by replaying its history.
    ///
    /// # Errors
    ///
    /// Any replay failure leaves the collection untouched.
    pub fn transaction_start(&mut self) -> Result<()> {
        self.validate()?;
        let mut snapshot = Vec::new();
        snapshot.try_reserve_exact(self.filters.len())?;
        for filter in &self.filters {
            snapshot.push(filter.replay()?);
        }
        self.snapshots.try_reserve(1)?;
        self.snapshots.push(snapshot);
        info!(depth = self.snapshots.len(), "transaction started");
        Ok(())
    }

    /// Restore the filters saved by the latest `transaction_start`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no transaction is open.
    pub fn transaction_abort(&mut self) -> Result<()> {
        self.check_live()?;
        let snapshot = self.pop_snapshot()?;
        self.filters = snapshot;
        self.endian = self.filters.first().map(Filter::endian);
        info!(depth = self.snapshots.len(), "transaction aborted");
        Ok(())
    }

    /// Keep the current filters and drop the latest snapshot.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no transaction is open.
    pub fn transaction_commit(&mut self) -> Result<()> {
        self.check_live()?;
        self.pop_snapshot()?;
        info!(depth = self.snapshots.len(), "transaction committed");
        Ok(())
    }

    fn pop_snapshot(&mut self) -> Result<Vec<Filter>> {
        self.snapshots
            .pop()
            .ok_or_else(|| FilterError::NotFound("no open transaction".into()))
    }

    /// Decide a call from `token` given in that architecture's numbering.
    #[must_use]
    pub fn simulate(&self, token: ArchToken, syscall: i32, args: &[u64; ARG_COUNT_MAX]) -> Action {
        self.filter(token).map_or(self.attrs.bad_arch_action, |filter| {
            filter.simulate(syscall, args, self.attrs.default_action)
        })
    }
}
