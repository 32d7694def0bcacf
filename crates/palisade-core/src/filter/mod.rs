//! Per-architecture filters
//!
//! A [`Filter`] holds the compiled rules for one architecture: a syscall
//! entry per syscall number, kept sorted, each owning a decision tree. Every
//! accepted rule and priority hint is recorded so a filter can be rebuilt
//! from scratch when a transaction snapshot is taken.

mod generate;
mod merge;
mod tree;

pub use tree::{ChainNode, ChainTree, Comparison, Edge, Level, LevelId, NodeId, Op};

use crate::arch::{self, ArchRef, Endian, PSEUDO_SYSCALL_MAX, Rewrite};
use crate::rule::{ARG_COUNT_MAX, ArgChain, RuleRecord};
use crate::{Action, FilterError, Result};
use merge::MergeOutcome;
use tracing::{debug, warn};

/// Low priority bits ranking smaller trees first.
const PRIORITY_SIZE_BITS: u32 = 0xffff;

/// Compiled rules for one syscall
#[derive(Debug, Clone)]
pub struct SyscallEntry {
    number: i32,
    tree: ChainTree,
    placeholder: bool,
    hint: u16,
    priority: u32,
    sequence: u64,
}

impl SyscallEntry {
    fn new(number: i32, tree: ChainTree, placeholder: bool, sequence: u64) -> Self {
        let mut entry = Self {
            number,
            tree,
            placeholder,
            hint: 0,
            priority: 0,
            sequence,
        };
        entry.refresh_priority();
        entry
    }

    /// Syscall number in this filter's architecture.
    #[must_use]
    pub const fn number(&self) -> i32 {
        self.number
    }

    /// True for an entry created only to carry a priority hint.
    #[must_use]
    pub const fn is_placeholder(&self) -> bool {
        self.placeholder
    }

    #[must_use]
    pub const fn tree(&self) -> &ChainTree {
        &self.tree
    }

    /// The unconditional action, for an entry without argument tests.
    #[must_use]
    pub const fn action(&self) -> Option<Action> {
        match self.tree.root() {
            Edge::Action(action) => Some(action),
            _ => None,
        }
    }

    #[must_use]
    pub const fn node_count(&self) -> usize {
        self.tree.node_count()
    }

    /// User hint in the upper 16 bits, smaller trees rank higher below it.
    #[must_use]
    pub const fn priority(&self) -> u32 {
        self.priority
    }

    #[must_use]
    pub const fn hint(&self) -> u16 {
        self.hint
    }

    /// Creation order, the tie-break between equal priorities.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Decide a call with concrete arguments.
    #[must_use]
    pub fn simulate(&self, args: &[u64; ARG_COUNT_MAX], default: Action) -> Action {
        self.tree.simulate(args).unwrap_or(default)
    }

    fn refresh_priority(&mut self) {
        let size = u32::try_from(self.tree.node_count())
            .unwrap_or(u32::MAX)
            .min(PRIORITY_SIZE_BITS);
        self.priority = (u32::from(self.hint) << 16) | (PRIORITY_SIZE_BITS - size);
    }

    fn raise_hint(&mut self, hint: u16) {
        if hint > self.hint {
            self.hint = hint;
        }
        self.refresh_priority();
    }

    /// Fold a candidate tree into this entry.
    fn absorb(&mut self, candidate: ChainTree, strict: bool) -> Result<()> {
        if self.placeholder {
            debug!(syscall = self.number, "rule replaces priority placeholder");
            self.tree = candidate;
            self.placeholder = false;
            self.refresh_priority();
            return Ok(());
        }

        match (self.tree.root(), candidate.root()) {
            (Edge::Action(old), Edge::Action(new)) => {
                if old != new {
                    if strict {
                        return Err(FilterError::Exists(format!(
                            "syscall {} already has action {old}",
                            self.number
                        )));
                    }
                    debug!(syscall = self.number, %old, %new, "replaced unconditional action");
                    self.tree = ChainTree::bare(new);
                }
            }
            (Edge::Action(old), root) => {
                if strict && !candidate.actions_all(root, old) {
                    return Err(FilterError::Exists(format!(
                        "syscall {} already has unconditional action {old}",
                        self.number
                    )));
                }
                debug!(syscall = self.number, "rule shadowed by unconditional action");
            }
            (root, Edge::Action(new)) => {
                if strict && !self.tree.actions_all(root, new) {
                    return Err(FilterError::Exists(format!(
                        "unconditional action {new} conflicts with rules on syscall {}",
                        self.number
                    )));
                }
                debug!(syscall = self.number, %new, "unconditional action replaces argument rules");
                self.tree = ChainTree::bare(new);
            }
            _ => {
                let mut scratch = self.tree.try_clone()?;
                if merge::merge(&mut scratch, &candidate, strict)? == MergeOutcome::Merged {
                    self.tree = scratch.compact()?;
                }
            }
        }
        self.refresh_priority();
        Ok(())
    }
}

/// Something a filter accepted, replayed when the filter is rebuilt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryRecord {
    Rule(RuleRecord),
    Priority { syscall: i32, hint: u16 },
}

/// Compiled rules for one architecture
#[derive(Debug, Clone)]
pub struct Filter {
    arch: ArchRef,
    syscalls: Vec<SyscallEntry>,
    history: Vec<HistoryRecord>,
    sequence: u64,
}

impl Filter {
    #[must_use]
    pub const fn new(arch: ArchRef) -> Self {
        Self {
            arch,
            syscalls: Vec::new(),
            history: Vec::new(),
            sequence: 0,
        }
    }

    #[must_use]
    pub fn arch(&self) -> ArchRef {
        self.arch
    }

    #[must_use]
    pub fn endian(&self) -> Endian {
        self.arch.endian()
    }

    /// Entries sorted by syscall number.
    #[must_use]
    pub fn syscalls(&self) -> &[SyscallEntry] {
        &self.syscalls
    }

    #[must_use]
    pub fn syscall(&self, number: i32) -> Option<&SyscallEntry> {
        self.position(number).ok().map(|pos| &self.syscalls[pos])
    }

    #[must_use]
    pub fn history(&self) -> &[HistoryRecord] {
        &self.history
    }

    /// Entries in evaluation order: highest priority first, earlier entries
    /// first among equals.
    #[must_use]
    pub fn by_priority(&self) -> Vec<&SyscallEntry> {
        let mut entries: Vec<&SyscallEntry> = self.syscalls.iter().collect();
        entries.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.sequence.cmp(&b.sequence))
        });
        entries
    }

    /// Decide a call given in this architecture's numbering.
    #[must_use]
    pub fn simulate(&self, syscall: i32, args: &[u64; ARG_COUNT_MAX], default: Action) -> Action {
        self.syscall(syscall)
            .map_or(default, |entry| entry.simulate(args, default))
    }

    /// Translate, rewrite and insert a rule expressed in native numbering.
    ///
    /// Returns `false` when the architecture has no use for the rule.
    pub(crate) fn add_rule(
        &mut self,
        native: ArchRef,
        strict: bool,
        action: Action,
        syscall: i32,
        args: &ArgChain,
    ) -> Result<bool> {
        reject_reserved(syscall)?;
        let number = arch::translate(native, self.arch, syscall)?;
        let mut rule = RuleRecord {
            strict,
            action,
            syscall: number,
            args: *args,
        };
        if self.arch.rewrite_rule(&mut rule)? == Rewrite::Skip {
            debug!(arch = self.arch.name(), syscall = number, "rule skipped");
            return Ok(false);
        }

        self.history.try_reserve(1)?;
        self.insert(&rule)?;
        self.history.push(HistoryRecord::Rule(rule));
        Ok(true)
    }

    /// Apply a priority hint given in native numbering.
    ///
    /// Architectures without the syscall are skipped.
    pub(crate) fn set_priority(&mut self, native: ArchRef, syscall: i32, hint: u16) -> Result<()> {
        reject_reserved(syscall)?;
        let number = match arch::translate(native, self.arch, syscall) {
            Ok(number) => number,
            Err(err) if err.is_out_of_domain() => {
                warn!(arch = self.arch.name(), syscall, "priority not applied: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        let number = if number <= PSEUDO_SYSCALL_MAX {
            if let Some(real) = self.arch.rewrite_syscall(number) {
                real
            } else {
                warn!(
                    arch = self.arch.name(),
                    syscall,
                    "priority not applied: pseudo syscall has no equivalent"
                );
                return Ok(());
            }
        } else {
            number
        };

        self.history.try_reserve(1)?;
        self.raise_priority(number, hint)?;
        self.history.push(HistoryRecord::Priority {
            syscall: number,
            hint,
        });
        Ok(())
    }

    /// Rebuild this filter from its history.
    pub(crate) fn replay(&self) -> Result<Self> {
        let mut copy = Self::new(self.arch);
        copy.history.try_reserve_exact(self.history.len())?;
        for record in &self.history {
            match record {
                HistoryRecord::Rule(rule) => copy.insert(rule)?,
                HistoryRecord::Priority { syscall, hint } => copy.raise_priority(*syscall, *hint)?,
            }
            copy.history.push(record.clone());
        }
        Ok(copy)
    }

    fn insert(&mut self, rule: &RuleRecord) -> Result<()> {
        let candidate = generate::generate(self.arch, rule)?.compact()?;
        match self.position(rule.syscall) {
            Ok(pos) => self.syscalls[pos].absorb(candidate, rule.strict),
            Err(pos) => {
                self.syscalls.try_reserve(1)?;
                let entry = SyscallEntry::new(rule.syscall, candidate, false, self.next_sequence());
                debug!(
                    arch = self.arch.name(),
                    syscall = rule.syscall,
                    nodes = entry.node_count(),
                    "new syscall entry"
                );
                self.syscalls.insert(pos, entry);
                Ok(())
            }
        }
    }

    fn raise_priority(&mut self, number: i32, hint: u16) -> Result<()> {
        match self.position(number) {
            Ok(pos) => self.syscalls[pos].raise_hint(hint),
            Err(pos) => {
                self.syscalls.try_reserve(1)?;
                let mut entry =
                    SyscallEntry::new(number, ChainTree::new(), true, self.next_sequence());
                entry.raise_hint(hint);
                self.syscalls.insert(pos, entry);
            }
        }
        Ok(())
    }

    fn position(&self, number: i32) -> std::result::Result<usize, usize> {
        self.syscalls
            .binary_search_by_key(&number, SyscallEntry::number)
    }

    fn next_sequence(&mut self) -> u64 {
        let sequence = self.sequence;
        self.sequence += 1;
        sequence
    }
}

fn reject_reserved(syscall: i32) -> Result<()> {
    if (PSEUDO_SYSCALL_MAX + 1..0).contains(&syscall) {
        return Err(FilterError::InvalidArgument(format!(
            "syscall number {syscall} is reserved"
        )));
    }
    Ok(())
}
