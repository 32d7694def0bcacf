//! Merging a candidate tree into a syscall's existing tree
//!
//! Both trees are walked level by level in lock step, matching nodes by
//! comparison key. Where the trees line up, a shorter rule absorbs a longer
//! one with the same action: an existing terminal edge keeps a candidate
//! branch out, and a terminal candidate edge replaces an existing branch.
//! Branches the existing tree lacks are grafted and unmatched comparisons are
//! spliced into the level at their ordinal position.
//!
//! Rules are never pruned away from the matched prefix. Siblings are tried
//! in order and the first decision wins, so clearing a path elsewhere could
//! hand its calls to an earlier sibling with another action.
//!
//! Shared levels are copied before they are edited. A copy that ends up
//! identical to its original is discarded so merging a rule twice leaves the
//! tree untouched.

use super::tree::{ChainNode, ChainTree, Edge, LevelId, NodeId};
use crate::{Action, FilterError, Result};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MergeOutcome {
    Merged,
    /// Existing rules already decide every call the candidate matches.
    Redundant,
}

/// Merge `incoming` into `tree`.
///
/// `tree` is left in an unspecified state on error; callers merge into a
/// scratch copy.
pub(crate) fn merge(tree: &mut ChainTree, incoming: &ChainTree, strict: bool) -> Result<MergeOutcome> {
    let root = tree.root();
    let mut walk = Walk {
        tree: &mut *tree,
        cand: incoming,
        strict,
        changed: false,
        imported: HashMap::new(),
        merged: HashMap::new(),
    };
    let root = walk.merge_edge(root, incoming.root())?;
    let changed = walk.changed;
    tree.set_root(root);

    if !changed {
        debug!("rule already decided by existing rules");
        return Ok(MergeOutcome::Redundant);
    }
    tree.normalize();
    Ok(MergeOutcome::Merged)
}

fn conflict(old: Action, new: Action) -> FilterError {
    FilterError::Exists(format!("rule action {new} conflicts with existing action {old}"))
}

struct Walk<'t> {
    tree: &'t mut ChainTree,
    cand: &'t ChainTree,
    strict: bool,
    /// Set once the existing tree decides some call differently.
    changed: bool,
    /// Candidate level to its grafted copy.
    imported: HashMap<LevelId, LevelId>,
    /// (existing, candidate) level pair to the merged result.
    merged: HashMap<(LevelId, LevelId), LevelId>,
}

impl Walk<'_> {
    /// Combine an existing edge with a candidate edge.
    ///
    /// The existing edge's reference is consumed; the returned edge is
    /// attached.
    fn merge_edge(&mut self, existing: Edge, incoming: Edge) -> Result<Edge> {
        match (existing, incoming) {
            (_, Edge::Fallthrough) => Ok(existing),
            (Edge::Fallthrough, Edge::Action(_)) => {
                self.changed = true;
                Ok(incoming)
            }
            (Edge::Fallthrough, Edge::Next(level)) => {
                self.changed = true;
                let copy = self.import_level(level)?;
                debug!(level = copy.index(), "grafted new branch");
                Ok(self.tree.attach(Edge::Next(copy)))
            }
            (Edge::Action(old), Edge::Action(new)) => {
                if old == new {
                    Ok(existing)
                } else {
                    Err(conflict(old, new))
                }
            }
            (Edge::Action(old), Edge::Next(_)) => {
                if self.cand.actions_all(incoming, old) {
                    debug!(%old, "existing rule is shorter, candidate branch dropped");
                    Ok(existing)
                } else {
                    Err(FilterError::Exists(format!(
                        "existing shorter rule with action {old} shadows a rule with a different action"
                    )))
                }
            }
            (Edge::Next(_), Edge::Action(new)) => {
                if !self.tree.actions_all(existing, new) {
                    return Err(FilterError::Exists(format!(
                        "rule with action {new} would replace longer rules with other actions"
                    )));
                }
                self.tree.release(existing);
                self.changed = true;
                debug!(%new, "candidate rule is shorter, existing branch replaced");
                Ok(incoming)
            }
            (Edge::Next(old), Edge::Next(new)) => self.merge_level(old, new).map(Edge::Next),
        }
    }

    fn merge_level(&mut self, old: LevelId, new: LevelId) -> Result<LevelId> {
        if let Some(&done) = self.merged.get(&(old, new)) {
            if done != old {
                self.tree.attach(Edge::Next(done));
                self.tree.release_level(old);
            }
            return Ok(done);
        }

        let target = if self.tree.level(old).refs() > 1 {
            self.tree.fork_level(old)?
        } else {
            old
        };
        self.merge_into(target, new)?;

        let result = if target == old {
            old
        } else if self.tree.same_shape(Edge::Next(target), Edge::Next(old)) {
            // unattached copy, releasing frees it
            self.tree.release_level(target);
            old
        } else {
            debug!(from = old.index(), to = target.index(), "split shared level");
            self.tree.attach(Edge::Next(target));
            self.tree.release_level(old);
            target
        };
        self.merged.insert((old, new), result);
        Ok(result)
    }

    fn merge_into(&mut self, level: LevelId, new: LevelId) -> Result<()> {
        let cand = self.cand;
        for &id in cand.level(new).nodes() {
            let incoming = cand.node(id);
            match self.tree.find(level, &incoming.cmp) {
                Ok(pos) => {
                    let existing = self.tree.level(level).nodes()[pos];
                    self.check_complement(existing, incoming)?;
                    let (on_true, on_false) = {
                        let node = self.tree.node(existing);
                        (node.on_true, node.on_false)
                    };
                    let on_true = self.merge_edge(on_true, incoming.on_true)?;
                    self.tree.node_mut(existing).on_true = on_true;
                    let on_false = self.merge_edge(on_false, incoming.on_false)?;
                    self.tree.node_mut(existing).on_false = on_false;
                }
                Err(pos) => {
                    let copy = self.import_node(id)?;
                    self.tree.insert_node(level, pos, copy)?;
                    self.changed = true;
                    debug!(
                        arg = incoming.cmp.arg,
                        datum = incoming.cmp.datum,
                        pos,
                        "spliced new comparison into level"
                    );
                }
            }
        }
        Ok(())
    }

    /// In strict mode a terminal candidate edge may not sit opposite an
    /// existing edge with another action on the same comparison.
    fn check_complement(&self, existing: NodeId, incoming: &ChainNode) -> Result<()> {
        if !self.strict {
            return Ok(());
        }
        let node = self.tree.node(existing);
        for (new, old) in [
            (incoming.on_true, node.on_false),
            (incoming.on_false, node.on_true),
        ] {
            match (new, old) {
                (Edge::Action(new), Edge::Action(old)) if new != old => {
                    return Err(conflict(old, new));
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn import_level(&mut self, level: LevelId) -> Result<LevelId> {
        if let Some(&copy) = self.imported.get(&level) {
            return Ok(copy);
        }
        let cand = self.cand;
        let originals = cand.level(level).nodes();
        let mut nodes = Vec::new();
        nodes.try_reserve_exact(originals.len())?;
        for &id in originals {
            nodes.push(self.import_node(id)?);
        }
        let copy = self.tree.alloc_level(nodes)?;
        self.imported.insert(level, copy);
        Ok(copy)
    }

    fn import_node(&mut self, id: NodeId) -> Result<NodeId> {
        let node = self.cand.node(id).clone();
        let on_true = self.import_edge(node.on_true)?;
        let on_false = self.import_edge(node.on_false)?;
        self.tree.alloc_node(ChainNode {
            on_true,
            on_false,
            ..node
        })
    }

    fn import_edge(&mut self, edge: Edge) -> Result<Edge> {
        match edge {
            Edge::Next(level) => {
                let copy = self.import_level(level)?;
                Ok(self.tree.attach(Edge::Next(copy)))
            }
            other => Ok(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{ArchRef, X86, X86_64};
    use crate::filter::generate::generate;
    use crate::rule::{ArgChain, RuleRecord};
    use crate::{ArgCmp, CompareOp};

    fn candidate(arch: ArchRef, action: Action, cmps: &[ArgCmp]) -> ChainTree {
        let rule = RuleRecord {
            strict: true,
            action,
            syscall: 0,
            args: ArgChain::from_cmps(cmps).unwrap(),
        };
        generate(arch, &rule).unwrap()
    }

    fn eq(arg: u32, datum: u64) -> ArgCmp {
        ArgCmp::new(arg, CompareOp::Eq, datum)
    }

    #[test]
    fn disjoint_rules_become_siblings() {
        let mut tree = candidate(&X86, Action::ALLOW, &[eq(0, 1)]);
        let other = candidate(&X86, Action::ALLOW, &[eq(0, 2)]);
        assert_eq!(merge(&mut tree, &other, true).unwrap(), MergeOutcome::Merged);
        assert_eq!(tree.node_count(), 2);
        assert_eq!(tree.simulate(&[1, 0, 0, 0, 0, 0]), Some(Action::ALLOW));
        assert_eq!(tree.simulate(&[2, 0, 0, 0, 0, 0]), Some(Action::ALLOW));
        assert_eq!(tree.simulate(&[3, 0, 0, 0, 0, 0]), None);
    }

    #[test]
    fn identical_rule_is_redundant() {
        let mut tree = candidate(&X86_64, Action::ALLOW, &[ArgCmp::new(0, CompareOp::Le, 9)]);
        let before = tree.clone();
        let same = candidate(&X86_64, Action::ALLOW, &[ArgCmp::new(0, CompareOp::Le, 9)]);
        assert_eq!(merge(&mut tree, &same, true).unwrap(), MergeOutcome::Redundant);
        assert_eq!(tree, before);
    }

    #[test]
    fn shorter_rule_replaces_longer() {
        let mut tree = candidate(&X86, Action::ALLOW, &[eq(0, 5), eq(1, 9)]);
        let shorter = candidate(&X86, Action::ALLOW, &[eq(0, 5)]);
        merge(&mut tree, &shorter, true).unwrap();
        let tree = tree.compact().unwrap();
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.simulate(&[5, 0, 0, 0, 0, 0]), Some(Action::ALLOW));
    }

    #[test]
    fn conflicting_terminal_actions() {
        let mut tree = candidate(&X86, Action::ALLOW, &[eq(0, 5)]);
        let other = candidate(&X86, Action::TRAP, &[eq(0, 5)]);
        assert!(matches!(
            merge(&mut tree, &other, false),
            Err(FilterError::Exists(_))
        ));
    }

    #[test]
    fn complementary_edges_only_conflict_when_strict() {
        let base = candidate(&X86, Action::KILL, &[ArgCmp::new(0, CompareOp::Ne, 3)]);
        let other = candidate(&X86, Action::ALLOW, &[eq(0, 3)]);

        let mut strict = base.clone();
        assert!(matches!(
            merge(&mut strict, &other, true),
            Err(FilterError::Exists(_))
        ));

        let mut lax = base;
        merge(&mut lax, &other, false).unwrap();
        assert_eq!(lax.compact().unwrap().node_count(), 1);
        assert_eq!(lax.simulate(&[3, 0, 0, 0, 0, 0]), Some(Action::ALLOW));
        assert_eq!(lax.simulate(&[4, 0, 0, 0, 0, 0]), Some(Action::KILL));
    }

    #[test]
    fn shared_level_is_split_before_edit() {
        // arg0 != 3 shares the arg1 continuation between two exits
        let mut tree = candidate(&X86_64, Action::ALLOW, &[ArgCmp::new(0, CompareOp::Ne, 3), eq(1, 9)]);
        let widened = candidate(&X86_64, Action::ALLOW, &[ArgCmp::new(0, CompareOp::Ne, 3), eq(1, 8)]);
        merge(&mut tree, &widened, true).unwrap();

        let shared = tree.levels().filter(|(_, level)| level.refs() == 2).count();
        assert_eq!(shared, 1);
        assert_eq!(tree.simulate(&[0x1_0000_0003, 8, 0, 0, 0, 0]), Some(Action::ALLOW));
        assert_eq!(tree.simulate(&[0x1_0000_0003, 9, 0, 0, 0, 0]), Some(Action::ALLOW));
        assert_eq!(tree.simulate(&[4, 9, 0, 0, 0, 0]), Some(Action::ALLOW));
        assert_eq!(tree.simulate(&[4, 8, 0, 0, 0, 0]), Some(Action::ALLOW));
        assert_eq!(tree.simulate(&[4, 7, 0, 0, 0, 0]), None);
        assert_eq!(tree.simulate(&[3, 9, 0, 0, 0, 0]), None);
        assert_eq!(tree.compact().unwrap().node_count(), 5);
    }
}
