//! # palisade-core
//!
//! Syscall filter rule database and decision-tree compiler.
//!
//! This crate turns syscall filtering rules into per-architecture decision
//! trees ready for a BPF code generator:
//! - Rules with up to six argument comparisons, split into 32-bit word tests
//! - Merging into a shared tree per syscall, with conflict detection and
//!   pruning of redundant branches
//! - One filter per target architecture, syscalls translated by name
//! - Nested transactions backed by replayable rule history
//! - Priority hints ordering syscalls for evaluation
//! - JSON policies, and a MessagePack/JSON export of the compiled state

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod action;
pub mod arch;
pub mod collection;
pub mod config;
pub mod error;
pub mod export;
pub mod filter;
pub mod host;
pub mod rule;
pub mod usage;

pub use action::{Action, ActionKind};
pub use arch::{ArchRef, ArchToken, Architecture};
pub use collection::{Attributes, CollectionState, FilterAttr, FilterCollection};
pub use config::PolicyConfig;
pub use error::FilterError;
pub use rule::{ARG_COUNT_MAX, ArgCmp, CompareOp};

/// Crate-level result type
pub type Result<T> = std::result::Result<T, FilterError>;
