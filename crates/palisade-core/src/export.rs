//! Serializable view of compiled filters
//!
//! Consumers that render BPF or persist a compiled policy read this view
//! instead of walking the arenas. Syscalls appear in evaluation order and
//! level identifiers are dense within each syscall.

use crate::arch::{ArchToken, ArgHalf, Endian, WordSize};
use crate::collection::{Attributes, FilterCollection};
use crate::filter::{ChainTree, Edge, Filter, Op, SyscallEntry};
use crate::Action;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionExport {
    pub attributes: Attributes,
    pub filters: Vec<FilterExport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterExport {
    pub arch: String,
    pub token: ArchToken,
    pub endian: Endian,
    pub word_size: WordSize,
    pub syscalls: Vec<SyscallExport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyscallExport {
    pub number: i32,
    pub name: Option<String>,
    pub priority: u32,
    pub hint: u16,
    pub placeholder: bool,
    pub node_count: usize,
    pub root: EdgeExport,
    pub levels: Vec<LevelExport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeExport {
    Fallthrough,
    Action(Action),
    Next(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelExport {
    pub id: usize,
    pub nodes: Vec<NodeExport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeExport {
    pub arg: u32,
    pub half: ArgHalf,
    /// Byte offset of the tested word in `struct seccomp_data`.
    pub offset: u32,
    pub op: Op,
    pub mask: u32,
    pub datum: u32,
    pub on_true: EdgeExport,
    pub on_false: EdgeExport,
}

impl From<Edge> for EdgeExport {
    fn from(edge: Edge) -> Self {
        match edge {
            Edge::Fallthrough => Self::Fallthrough,
            Edge::Action(action) => Self::Action(action),
            Edge::Next(level) => Self::Next(level.index()),
        }
    }
}

impl CollectionExport {
    #[must_use]
    pub fn from_collection(col: &FilterCollection) -> Self {
        Self {
            attributes: *col.attributes(),
            filters: col.filters().iter().map(FilterExport::from_filter).collect(),
        }
    }

    /// Find the filter for `token`.
    #[must_use]
    pub fn filter(&self, token: ArchToken) -> Option<&FilterExport> {
        self.filters.iter().find(|f| f.token == token)
    }
}

impl FilterExport {
    #[must_use]
    pub fn from_filter(filter: &Filter) -> Self {
        let arch = filter.arch();
        Self {
            arch: arch.name().to_owned(),
            token: arch.token(),
            endian: arch.endian(),
            word_size: arch.word_size(),
            syscalls: filter
                .by_priority()
                .into_iter()
                .map(|entry| SyscallExport::from_entry(entry, arch.resolve_num(entry.number())))
                .collect(),
        }
    }
}

impl SyscallExport {
    fn from_entry(entry: &SyscallEntry, name: Option<&str>) -> Self {
        let tree = entry.tree();
        Self {
            number: entry.number(),
            name: name.map(str::to_owned),
            priority: entry.priority(),
            hint: entry.hint(),
            placeholder: entry.is_placeholder(),
            node_count: entry.node_count(),
            root: tree.root().into(),
            levels: export_levels(tree),
        }
    }
}

fn export_levels(tree: &ChainTree) -> Vec<LevelExport> {
    tree.levels()
        .map(|(id, level)| LevelExport {
            id: id.index(),
            nodes: level
                .nodes()
                .iter()
                .map(|&node| {
                    let node = tree.node(node);
                    NodeExport {
                        arg: node.cmp.arg,
                        half: node.cmp.half,
                        offset: node.offset,
                        op: node.cmp.op,
                        mask: node.cmp.mask,
                        datum: node.cmp.datum,
                        on_true: node.on_true.into(),
                        on_false: node.on_false.into(),
                    }
                })
                .collect(),
        })
        .collect()
}

/// Encode a value to msgpack with field names.
///
/// # Errors
///
/// Returns the encoder error if the value cannot be serialized.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec_named(value)
}

/// Decode a value from msgpack.
///
/// # Errors
///
/// Returns the decoder error for malformed or mismatched input.
pub fn decode<'a, T: Deserialize<'a>>(data: &'a [u8]) -> Result<T, rmp_serde::decode::Error> {
    rmp_serde::from_slice(data)
}

/// Render a value as pretty-printed JSON.
///
/// # Errors
///
/// Returns the serializer error if the value cannot be serialized.
pub fn to_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{X86, X86_64};
    use crate::{ArgCmp, CompareOp};

    fn sample() -> FilterCollection {
        let mut col = FilterCollection::with_native(Action::KILL, &X86_64);
        col.add_architecture(&X86).unwrap();
        col.add_rule(true, Action::ALLOW, 0, &[]).unwrap();
        // the 64-bit datum cannot be expressed on x86, which rejects the rule
        let wide = [ArgCmp::new(2, CompareOp::Gt, 0x1_0000_0000)];
        let err = col.add_rule(true, Action::errno(13).unwrap(), 257, &wide).unwrap_err();
        assert!(matches!(err, crate::FilterError::InvalidArgument(_)));
        col.set_syscall_priority(1, 4).unwrap();
        col
    }

    #[test]
    fn export_lists_syscalls_in_evaluation_order() {
        let export = CollectionExport::from_collection(&sample());
        let x86_64 = export.filter(X86_64.token).unwrap();
        let numbers: Vec<i32> = x86_64.syscalls.iter().map(|s| s.number).collect();
        assert_eq!(numbers, vec![1, 0, 257]);
        assert!(x86_64.syscalls[0].placeholder);
        assert_eq!(x86_64.syscalls[1].root, EdgeExport::Action(Action::ALLOW));
        assert_eq!(x86_64.syscalls[2].name.as_deref(), Some("openat"));
        assert_eq!(x86_64.syscalls[2].root, EdgeExport::Next(0));
        assert_eq!(x86_64.syscalls[2].levels[0].nodes[0].half, ArgHalf::High);
        assert_eq!(x86_64.syscalls[2].levels[0].nodes[0].offset, 16 + 2 * 8 + 4);

        let x86 = export.filter(X86.token).unwrap();
        assert_eq!(x86.word_size, WordSize::Bits32);
        assert!(x86.syscalls.iter().all(|s| s.name.as_deref() != Some("openat")));
    }

    #[test]
    fn msgpack_and_json_round_trip() {
        let export = CollectionExport::from_collection(&sample());
        let bytes = encode(&export).unwrap();
        let decoded: CollectionExport = decode(&bytes).unwrap();
        assert_eq!(decoded, export);

        let json = to_json(&export).unwrap();
        let parsed: CollectionExport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, export);
        assert!(json.contains("\"errno(13)\""));
    }
}
