//! Decision-tree storage
//!
//! A syscall's rules compile into a tree of comparison nodes held in an arena.
//! A *level* is the ordered list of sibling nodes tested one after another;
//! each node has a true and a false edge that either ends in an action, falls
//! through to the next sibling, or descends into another level. Levels are the
//! unit of sharing: several edges may point at one level, which counts them.
//!
//! Slots are never reused while a tree is being edited, so identifiers stay
//! unambiguous inside one merge. [`ChainTree::compact`] rebuilds a dense copy
//! once editing is done.

use crate::arch::ArgHalf;
use crate::rule::ARG_COUNT_MAX;
use crate::{Action, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LevelId(u32);

impl NodeId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl LevelId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Canonical comparison operator evaluated by a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Eq,
    Ge,
    Gt,
    MaskedEq,
}

/// What a node tests
///
/// The derived ordering is the sibling order inside a level: argument, half,
/// operator, mask, datum, compared lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Comparison {
    pub arg: u32,
    pub half: ArgHalf,
    pub op: Op,
    pub mask: u32,
    pub datum: u32,
}

impl Comparison {
    /// Evaluate against one 32-bit argument word.
    #[must_use]
    pub const fn test(&self, word: u32) -> bool {
        match self.op {
            Op::Eq | Op::MaskedEq => word & self.mask == self.datum,
            Op::Ge => word >= self.datum,
            Op::Gt => word > self.datum,
        }
    }

    /// Evaluate against full syscall arguments.
    #[must_use]
    pub fn matches(&self, args: &[u64; ARG_COUNT_MAX]) -> bool {
        let value = args.get(self.arg as usize).copied().unwrap_or_default();
        self.test(self.half.of(value))
    }
}

/// Where evaluation goes after a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Edge {
    /// Continue with the next sibling.
    Fallthrough,
    Action(Action),
    Next(LevelId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainNode {
    pub cmp: Comparison,
    /// Byte offset of the tested word in `struct seccomp_data`.
    pub offset: u32,
    pub on_true: Edge,
    pub on_false: Edge,
}

impl ChainNode {
    #[must_use]
    pub const fn edge(&self, taken: bool) -> Edge {
        if taken { self.on_true } else { self.on_false }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Level {
    nodes: Vec<NodeId>,
    refs: u32,
}

impl Level {
    /// Sibling nodes in evaluation order.
    #[must_use]
    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    /// Number of edges pointing at this level.
    #[must_use]
    pub const fn refs(&self) -> u32 {
        self.refs
    }
}

/// Arena-backed decision tree for one syscall
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTree {
    nodes: Vec<Option<ChainNode>>,
    levels: Vec<Option<Level>>,
    live: usize,
    root: Edge,
}

impl Default for ChainTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainTree {
    /// An empty tree: every call falls through to the filter default.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            levels: Vec::new(),
            live: 0,
            root: Edge::Fallthrough,
        }
    }

    /// A tree that applies `action` unconditionally.
    #[must_use]
    pub const fn bare(action: Action) -> Self {
        Self {
            nodes: Vec::new(),
            levels: Vec::new(),
            live: 0,
            root: Edge::Action(action),
        }
    }

    #[must_use]
    pub const fn root(&self) -> Edge {
        self.root
    }

    /// Number of live nodes.
    #[must_use]
    pub const fn node_count(&self) -> usize {
        self.live
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> &ChainNode {
        let Some(node) = self.nodes.get(id.index()).and_then(Option::as_ref) else {
            unreachable!("dangling chain node {id:?}");
        };
        node
    }

    #[must_use]
    pub fn level(&self, id: LevelId) -> &Level {
        let Some(level) = self.levels.get(id.index()).and_then(Option::as_ref) else {
            unreachable!("dangling chain level {id:?}");
        };
        level
    }

    /// Live levels in arena order.
    pub fn levels(&self) -> impl Iterator<Item = (LevelId, &Level)> {
        (0u32..)
            .zip(&self.levels)
            .filter_map(|(idx, slot)| slot.as_ref().map(|level| (LevelId(idx), level)))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> &mut ChainNode {
        let Some(node) = self.nodes.get_mut(id.index()).and_then(Option::as_mut) else {
            unreachable!("dangling chain node {id:?}");
        };
        node
    }

    pub(crate) fn level_mut(&mut self, id: LevelId) -> &mut Level {
        let Some(level) = self.levels.get_mut(id.index()).and_then(Option::as_mut) else {
            unreachable!("dangling chain level {id:?}");
        };
        level
    }

    pub(crate) fn alloc_node(&mut self, node: ChainNode) -> Result<NodeId> {
        let id = NodeId(slot_index(self.nodes.len())?);
        self.nodes.try_reserve(1)?;
        self.nodes.push(Some(node));
        self.live += 1;
        Ok(id)
    }

    /// Allocate an unreferenced level; storing an edge to it must `attach`.
    pub(crate) fn alloc_level(&mut self, nodes: Vec<NodeId>) -> Result<LevelId> {
        let id = LevelId(slot_index(self.levels.len())?);
        self.levels.try_reserve(1)?;
        self.levels.push(Some(Level { nodes, refs: 0 }));
        Ok(id)
    }

    /// Account for `edge` being stored somewhere.
    pub(crate) fn attach(&mut self, edge: Edge) -> Edge {
        if let Edge::Next(id) = edge {
            self.level_mut(id).refs += 1;
        }
        edge
    }

    /// Drop one stored reference to `edge`, freeing what becomes unreachable.
    pub(crate) fn release(&mut self, edge: Edge) {
        if let Edge::Next(id) = edge {
            self.release_level(id);
        }
    }

    pub(crate) fn release_level(&mut self, id: LevelId) {
        let level = self.level_mut(id);
        level.refs = level.refs.saturating_sub(1);
        if level.refs > 0 {
            return;
        }
        if let Some(level) = self.levels.get_mut(id.index()).and_then(Option::take) {
            for node in level.nodes {
                self.free_node(node);
            }
        }
    }

    pub(crate) fn free_node(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(id.index()).and_then(Option::take) {
            self.live -= 1;
            self.release(node.on_true);
            self.release(node.on_false);
        }
    }

    /// Install a root edge whose reference is already accounted for.
    pub(crate) fn set_root(&mut self, edge: Edge) {
        self.root = edge;
    }

    /// Position of `cmp` in level `id`, or where it would be inserted.
    pub(crate) fn find(&self, id: LevelId, cmp: &Comparison) -> std::result::Result<usize, usize> {
        self.level(id)
            .nodes
            .binary_search_by(|&node| self.node(node).cmp.cmp(cmp))
    }

    pub(crate) fn insert_node(&mut self, level: LevelId, pos: usize, node: NodeId) -> Result<()> {
        let nodes = &mut self.level_mut(level).nodes;
        nodes.try_reserve(1)?;
        nodes.insert(pos, node);
        Ok(())
    }

    /// Copy a level and its nodes, sharing every child level.
    pub(crate) fn fork_level(&mut self, id: LevelId) -> Result<LevelId> {
        let originals = self.level(id).nodes.clone();
        let mut copies = Vec::new();
        copies.try_reserve_exact(originals.len())?;
        for original in originals {
            let node = self.node(original).clone();
            self.attach(node.on_true);
            self.attach(node.on_false);
            copies.push(self.alloc_node(node)?);
        }
        self.alloc_level(copies)
    }

    /// Structural equality of two subtrees.
    #[must_use]
    pub fn same_shape(&self, a: Edge, b: Edge) -> bool {
        match (a, b) {
            (Edge::Next(x), Edge::Next(y)) => {
                if x == y {
                    return true;
                }
                let (lx, ly) = (self.level(x), self.level(y));
                lx.nodes.len() == ly.nodes.len()
                    && lx.nodes.iter().zip(&ly.nodes).all(|(&p, &q)| {
                        let (p, q) = (self.node(p), self.node(q));
                        p.cmp == q.cmp
                            && p.offset == q.offset
                            && self.same_shape(p.on_true, q.on_true)
                            && self.same_shape(p.on_false, q.on_false)
                    })
            }
            _ => a == b,
        }
    }

    /// True when every action reachable from `edge` equals `action`.
    #[must_use]
    pub fn actions_all(&self, edge: Edge, action: Action) -> bool {
        match edge {
            Edge::Fallthrough => true,
            Edge::Action(a) => a == action,
            Edge::Next(id) => self.level(id).nodes.iter().all(|&node| {
                let node = self.node(node);
                self.actions_all(node.on_true, action) && self.actions_all(node.on_false, action)
            }),
        }
    }

    /// Evaluate the tree for concrete arguments.
    ///
    /// Returns `None` when every path falls through, in which case the filter
    /// default applies.
    #[must_use]
    pub fn simulate(&self, args: &[u64; ARG_COUNT_MAX]) -> Option<Action> {
        self.eval(self.root, args)
    }

    fn eval(&self, edge: Edge, args: &[u64; ARG_COUNT_MAX]) -> Option<Action> {
        match edge {
            Edge::Fallthrough => None,
            Edge::Action(action) => Some(action),
            Edge::Next(id) => self.level(id).nodes.iter().find_map(|&node| {
                let node = self.node(node);
                self.eval(node.edge(node.cmp.matches(args)), args)
            }),
        }
    }

    /// Apply the outcome-preserving simplifications.
    ///
    /// Nodes whose edges both fall through are dropped. A node whose edges end
    /// in the same action decides every call reaching it, so its later
    /// siblings are dropped, and when it is the first node the whole level
    /// becomes that action. A level left empty becomes a fallthrough.
    pub(crate) fn normalize(&mut self) {
        let mut memo = HashMap::new();
        let root = self.root;
        self.root = self.normalize_edge(root, &mut memo);
    }

    fn normalize_edge(&mut self, edge: Edge, memo: &mut HashMap<LevelId, Edge>) -> Edge {
        let Edge::Next(id) = edge else {
            return edge;
        };
        let result = if let Some(&done) = memo.get(&id) {
            done
        } else {
            let done = self.normalize_level(id, memo);
            memo.insert(id, done);
            done
        };
        if result != edge {
            self.attach(result);
            self.release_level(id);
        }
        result
    }

    fn normalize_level(&mut self, id: LevelId, memo: &mut HashMap<LevelId, Edge>) -> Edge {
        let original = std::mem::take(&mut self.level_mut(id).nodes);
        let mut kept = Vec::with_capacity(original.len());
        let mut constant = None;
        let mut rest = original.into_iter();

        while let Some(node) = rest.next() {
            let (t, f) = {
                let n = self.node(node);
                (n.on_true, n.on_false)
            };
            let t = self.normalize_edge(t, memo);
            let f = self.normalize_edge(f, memo);
            let n = self.node_mut(node);
            n.on_true = t;
            n.on_false = f;

            match (t, f) {
                (Edge::Fallthrough, Edge::Fallthrough) => self.free_node(node),
                (Edge::Action(a), Edge::Action(b)) if a == b => {
                    if kept.is_empty() {
                        self.free_node(node);
                        constant = Some(a);
                    } else {
                        kept.push(node);
                    }
                    for dead in rest.by_ref() {
                        self.free_node(dead);
                    }
                }
                _ => kept.push(node),
            }
        }

        if let Some(action) = constant {
            return Edge::Action(action);
        }
        if kept.is_empty() {
            return Edge::Fallthrough;
        }
        self.level_mut(id).nodes = kept;
        Edge::Next(id)
    }

    /// Copy the tree.
    ///
    /// # Errors
    ///
    /// Returns `ResourceExhausted` if the arena cannot be allocated.
    pub fn try_clone(&self) -> Result<Self> {
        let mut nodes = Vec::new();
        nodes.try_reserve_exact(self.nodes.len())?;
        nodes.extend(self.nodes.iter().cloned());
        let mut levels = Vec::new();
        levels.try_reserve_exact(self.levels.len())?;
        levels.extend(self.levels.iter().cloned());
        Ok(Self {
            nodes,
            levels,
            live: self.live,
            root: self.root,
        })
    }

    /// Rebuild a dense arena holding only reachable nodes, preserving sharing.
    ///
    /// Levels are numbered in pre-order, so the root level is always `0`.
    ///
    /// # Errors
    ///
    /// Returns `ResourceExhausted` if the arena cannot be allocated.
    pub fn compact(&self) -> Result<Self> {
        let mut out = Self::new();
        let mut memo = HashMap::new();
        let root = self.copy_into(self.root, &mut out, &mut memo)?;
        out.root = out.attach(root);
        Ok(out)
    }

    fn copy_into(&self, edge: Edge, out: &mut Self, memo: &mut HashMap<LevelId, LevelId>) -> Result<Edge> {
        let Edge::Next(id) = edge else {
            return Ok(edge);
        };
        if let Some(&copy) = memo.get(&id) {
            return Ok(Edge::Next(copy));
        }
        let copy = out.alloc_level(Vec::new())?;
        memo.insert(id, copy);

        let originals = &self.level(id).nodes;
        let mut nodes = Vec::new();
        nodes.try_reserve_exact(originals.len())?;
        for &original in originals {
            let node = self.node(original);
            let on_true = self.copy_into(node.on_true, out, memo)?;
            let on_false = self.copy_into(node.on_false, out, memo)?;
            let node = ChainNode {
                cmp: node.cmp,
                offset: node.offset,
                on_true: out.attach(on_true),
                on_false: out.attach(on_false),
            };
            nodes.push(out.alloc_node(node)?);
        }
        out.level_mut(copy).nodes = nodes;
        Ok(Edge::Next(copy))
    }
}

fn slot_index(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| crate::FilterError::ResourceExhausted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmp(arg: u32, datum: u32) -> Comparison {
        Comparison {
            arg,
            half: ArgHalf::Low,
            op: Op::Eq,
            mask: u32::MAX,
            datum,
        }
    }

    fn leaf(tree: &mut ChainTree, c: Comparison, on_true: Edge, on_false: Edge) -> NodeId {
        let on_true = tree.attach(on_true);
        let on_false = tree.attach(on_false);
        tree.alloc_node(ChainNode {
            cmp: c,
            offset: 16 + c.arg * 8,
            on_true,
            on_false,
        })
        .unwrap()
    }

    fn rooted(tree: &mut ChainTree, nodes: Vec<NodeId>) -> LevelId {
        let level = tree.alloc_level(nodes).unwrap();
        let root = tree.attach(Edge::Next(level));
        tree.set_root(root);
        level
    }

    #[test]
    fn comparison_order_is_lexicographic() {
        let a = cmp(0, 9);
        let b = Comparison {
            op: Op::Ge,
            datum: 0,
            ..cmp(0, 0)
        };
        let c = cmp(1, 0);
        assert!(a < b);
        assert!(b < c);
        let high = Comparison {
            half: ArgHalf::High,
            ..cmp(0, 9)
        };
        assert!(high < a);
    }

    #[test]
    fn bare_tree_is_const_constructible() {
        const TRAP_ALL: ChainTree = ChainTree::bare(Action::TRAP);
        let tree = TRAP_ALL;
        assert_eq!(tree.root(), Edge::Action(Action::TRAP));
        assert_eq!(tree.node_count(), 0);
        assert_eq!(tree.simulate(&[9; ARG_COUNT_MAX]), Some(Action::TRAP));
    }

    #[test]
    fn simulate_falls_through_siblings() {
        let mut tree = ChainTree::new();
        let first = leaf(&mut tree, cmp(0, 1), Edge::Action(Action::ALLOW), Edge::Fallthrough);
        let second = leaf(&mut tree, cmp(1, 2), Edge::Action(Action::TRAP), Edge::Fallthrough);
        rooted(&mut tree, vec![first, second]);

        assert_eq!(tree.simulate(&[1, 0, 0, 0, 0, 0]), Some(Action::ALLOW));
        assert_eq!(tree.simulate(&[0, 2, 0, 0, 0, 0]), Some(Action::TRAP));
        assert_eq!(tree.simulate(&[0, 0, 0, 0, 0, 0]), None);
    }

    #[test]
    fn normalize_collapses_constant_level() {
        let mut tree = ChainTree::new();
        let allow = Edge::Action(Action::ALLOW);
        let first = leaf(&mut tree, cmp(0, 1), allow, allow);
        let dead = leaf(&mut tree, cmp(1, 1), Edge::Action(Action::TRAP), Edge::Fallthrough);
        rooted(&mut tree, vec![first, dead]);

        tree.normalize();
        assert_eq!(tree.root(), allow);
        assert_eq!(tree.node_count(), 0);
    }

    #[test]
    fn normalize_drops_zombies_and_empty_levels() {
        let mut tree = ChainTree::new();
        let zombie = leaf(&mut tree, cmp(1, 1), Edge::Fallthrough, Edge::Fallthrough);
        let inner = tree.alloc_level(vec![zombie]).unwrap();
        let outer = leaf(&mut tree, cmp(0, 1), Edge::Next(inner), Edge::Action(Action::KILL));
        rooted(&mut tree, vec![outer]);

        tree.normalize();
        assert_eq!(tree.node_count(), 1);
        let Edge::Next(root) = tree.root() else {
            panic!("root should stay a level");
        };
        let node = tree.node(tree.level(root).nodes()[0]);
        assert_eq!(node.on_true, Edge::Fallthrough);
        assert_eq!(node.on_false, Edge::Action(Action::KILL));
    }

    #[test]
    fn release_frees_shared_level_once() {
        let mut tree = ChainTree::new();
        let shared_node = leaf(&mut tree, cmp(1, 7), Edge::Action(Action::ALLOW), Edge::Fallthrough);
        let shared = tree.alloc_level(vec![shared_node]).unwrap();
        let top = leaf(&mut tree, cmp(0, 3), Edge::Next(shared), Edge::Next(shared));
        rooted(&mut tree, vec![top]);
        assert_eq!(tree.level(shared).refs(), 2);
        assert_eq!(tree.node_count(), 2);

        let root = tree.root();
        tree.release(root);
        assert_eq!(tree.node_count(), 0);
    }

    #[test]
    fn compact_preserves_sharing() {
        let mut tree = ChainTree::new();
        let garbage = leaf(&mut tree, cmp(5, 5), Edge::Action(Action::TRAP), Edge::Fallthrough);
        tree.free_node(garbage);
        let shared_node = leaf(&mut tree, cmp(1, 7), Edge::Action(Action::ALLOW), Edge::Fallthrough);
        let shared = tree.alloc_level(vec![shared_node]).unwrap();
        let top = leaf(&mut tree, cmp(0, 3), Edge::Next(shared), Edge::Next(shared));
        rooted(&mut tree, vec![top]);

        let dense = tree.compact().unwrap();
        assert_eq!(dense.node_count(), 2);
        assert_eq!(dense.levels().count(), 2);
        assert_eq!(dense.root(), Edge::Next(LevelId(0)));
        let (_, inner) = dense.levels().nth(1).unwrap();
        assert_eq!(inner.refs(), 2);
        assert!(tree.same_shape(tree.root(), tree.root()));
    }
}
