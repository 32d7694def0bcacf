//! Architecture descriptions
//!
//! An architecture supplies what the rule generator needs to know about the
//! target ABI: its audit token, word size, byte order, where each argument
//! word lives inside `struct seccomp_data`, and its syscall numbering.
//! Syscall numbers are always expressed in the native architecture's
//! numbering and translated by name for every other filter.

mod tables;

pub use tables::{AARCH64, ARM, BUILTIN, BuiltinArch, S390X, X86, X86_64};

use crate::rule::{ARG_COUNT_MAX, RuleRecord};
use crate::{FilterError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Offset of `args[0]` inside `struct seccomp_data`.
const SECCOMP_DATA_ARGS: u32 = 16;

/// Lowest pseudo syscall number; `-1..=-99` are reserved.
pub const PSEUDO_SYSCALL_MAX: i32 = -100;

/// Audit architecture token (`AUDIT_ARCH_*`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchToken(pub u32);

impl fmt::Display for ArchToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Endian {
    Little,
    Big,
}

/// Width of a syscall argument register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WordSize {
    #[serde(rename = "32")]
    Bits32,
    #[serde(rename = "64")]
    Bits64,
}

/// Which 32-bit half of an argument a comparison loads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArgHalf {
    High,
    Low,
}

impl ArgHalf {
    /// Extract this half from a full argument value.
    #[must_use]
    pub const fn of(self, value: u64) -> u32 {
        match self {
            Self::High => (value >> 32) as u32,
            Self::Low => value as u32,
        }
    }
}

/// What an architecture did with a rule before generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rewrite {
    /// Generate the (possibly rewritten) rule.
    Apply,
    /// The rule has no meaning here and is silently dropped.
    Skip,
}

/// Architecture interface consumed by filters and the rule generator
pub trait Architecture: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn token(&self) -> ArchToken;

    fn word_size(&self) -> WordSize;

    fn endian(&self) -> Endian;

    fn arg_count_max(&self) -> usize {
        ARG_COUNT_MAX
    }

    /// Byte offset of one half of argument `arg` in `struct seccomp_data`.
    fn arg_offset(&self, arg: u32, half: ArgHalf) -> u32 {
        let base = SECCOMP_DATA_ARGS + arg * 8;
        match (self.endian(), half) {
            (Endian::Little, ArgHalf::Low) | (Endian::Big, ArgHalf::High) => base,
            (Endian::Little, ArgHalf::High) | (Endian::Big, ArgHalf::Low) => base + 4,
        }
    }

    fn resolve_name(&self, name: &str) -> Option<i32>;

    fn resolve_num(&self, num: i32) -> Option<&'static str>;

    /// Real syscall number that a pseudo syscall multiplexes onto.
    fn rewrite_syscall(&self, _syscall: i32) -> Option<i32> {
        None
    }

    /// Architecture-specific rule adjustment ahead of generation.
    ///
    /// The default accepts real syscalls untouched and has no meaning for
    /// pseudo syscalls: strict rules fail, others are skipped.
    ///
    /// # Errors
    ///
    /// Returns `OutOfDomain` for a strict pseudo syscall rule.
    fn rewrite_rule(&self, rule: &mut RuleRecord) -> Result<Rewrite> {
        if rule.syscall > PSEUDO_SYSCALL_MAX {
            return Ok(Rewrite::Apply);
        }
        if rule.strict {
            Err(self.out_of_domain(rule.syscall))
        } else {
            Ok(Rewrite::Skip)
        }
    }

    fn out_of_domain(&self, syscall: i32) -> FilterError {
        FilterError::OutOfDomain {
            syscall,
            arch: self.name().to_owned(),
        }
    }
}

/// Shared handle to an architecture description
pub type ArchRef = &'static dyn Architecture;

/// Look up a built-in architecture by name.
#[must_use]
pub fn by_name(name: &str) -> Option<ArchRef> {
    let name = match name {
        "amd64" => "x86_64",
        "i386" | "i686" => "x86",
        "arm64" => "aarch64",
        other => other,
    };
    BUILTIN.iter().copied().find(|arch| arch.name() == name)
}

/// Look up a built-in architecture by audit token.
#[must_use]
pub fn by_token(token: ArchToken) -> Option<ArchRef> {
    BUILTIN.iter().copied().find(|arch| arch.token() == token)
}

/// The architecture this crate was compiled for, if it is built in.
#[must_use]
pub fn native() -> Option<ArchRef> {
    let name = if cfg!(target_arch = "x86_64") {
        "x86_64"
    } else if cfg!(target_arch = "x86") {
        "x86"
    } else if cfg!(target_arch = "aarch64") {
        "aarch64"
    } else if cfg!(target_arch = "arm") {
        "arm"
    } else if cfg!(target_arch = "s390x") {
        "s390x"
    } else {
        return None;
    };
    by_name(name)
}

/// Translate a native syscall number into `arch`'s numbering.
///
/// Pseudo syscalls are matched by name like any other call, so an
/// architecture that lists a multiplexed call receives its pseudo number.
///
/// # Errors
///
/// Returns `OutOfDomain` when `arch` has no syscall of the same name.
pub fn translate(native: ArchRef, arch: ArchRef, syscall: i32) -> Result<i32> {
    if native.token() == arch.token() {
        return Ok(syscall);
    }
    native
        .resolve_num(syscall)
        .and_then(|name| arch.resolve_name(name))
        .ok_or_else(|| arch.out_of_domain(syscall))
}
