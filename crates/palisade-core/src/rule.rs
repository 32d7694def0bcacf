//! Rule descriptions: argument comparisons and per-architecture rule records

use crate::{Action, FilterError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of syscall arguments a filter can inspect.
pub const ARG_COUNT_MAX: usize = 6;

/// Comparison operator as written by a policy author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum CompareOp {
    Ne = 1,
    Lt = 2,
    Le = 3,
    Eq = 4,
    Ge = 5,
    Gt = 6,
    MaskedEq = 7,
}

impl CompareOp {
    /// Decode the numeric operator used by the C ABI.
    #[must_use]
    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => Self::Ne,
            2 => Self::Lt,
            3 => Self::Le,
            4 => Self::Eq,
            5 => Self::Ge,
            6 => Self::Gt,
            7 => Self::MaskedEq,
            _ => return None,
        })
    }

    const fn symbol(self) -> &'static str {
        match self {
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Eq => "==",
            Self::Ge => ">=",
            Self::Gt => ">",
            Self::MaskedEq => "&==",
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for CompareOp {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "!=" | "ne" => Self::Ne,
            "<" | "lt" => Self::Lt,
            "<=" | "le" => Self::Le,
            "==" | "eq" => Self::Eq,
            ">=" | "ge" => Self::Ge,
            ">" | "gt" => Self::Gt,
            "&==" | "masked_eq" => Self::MaskedEq,
            other => {
                return Err(FilterError::InvalidArgument(format!(
                    "unknown comparison operator '{other}'"
                )));
            }
        })
    }
}

/// One argument comparison
///
/// For [`CompareOp::MaskedEq`] `datum_a` is the mask and `datum_b` the value;
/// every other operator compares against `datum_a` and ignores `datum_b`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgCmp {
    pub arg: u32,
    pub op: CompareOp,
    pub datum_a: u64,
    #[serde(default)]
    pub datum_b: u64,
}

impl ArgCmp {
    #[must_use]
    pub const fn new(arg: u32, op: CompareOp, datum: u64) -> Self {
        Self {
            arg,
            op,
            datum_a: datum,
            datum_b: 0,
        }
    }

    #[must_use]
    pub const fn masked_eq(arg: u32, mask: u64, datum: u64) -> Self {
        Self {
            arg,
            op: CompareOp::MaskedEq,
            datum_a: mask,
            datum_b: datum,
        }
    }
}

/// A validated comparison attached to one argument slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArgConstraint {
    pub op: CompareOp,
    pub mask: u64,
    pub datum: u64,
}

impl From<ArgCmp> for ArgConstraint {
    fn from(cmp: ArgCmp) -> Self {
        match cmp.op {
            CompareOp::MaskedEq => Self {
                op: cmp.op,
                mask: cmp.datum_a,
                datum: cmp.datum_b,
            },
            op => Self {
                op,
                mask: u64::MAX,
                datum: cmp.datum_a,
            },
        }
    }
}

/// Argument constraints of a rule, indexed by argument position
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ArgChain([Option<ArgConstraint>; ARG_COUNT_MAX]);

impl ArgChain {
    /// Build a chain from user comparisons.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for an argument index out of range or for two
    /// comparisons on the same argument.
    pub fn from_cmps(cmps: &[ArgCmp]) -> Result<Self> {
        let mut chain = Self::default();
        for cmp in cmps {
            let slot = usize::try_from(cmp.arg)
                .ok()
                .and_then(|idx| chain.0.get_mut(idx))
                .ok_or_else(|| {
                    FilterError::InvalidArgument(format!("argument index {} out of range", cmp.arg))
                })?;
            if slot.is_some() {
                return Err(FilterError::InvalidArgument(format!(
                    "argument {} constrained more than once",
                    cmp.arg
                )));
            }
            *slot = Some(ArgConstraint::from(*cmp));
        }
        Ok(chain)
    }

    /// Constraints in ascending argument order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = (u32, ArgConstraint)> + '_ {
        self.0.iter().enumerate().filter_map(|(idx, slot)| {
            slot.and_then(|c| u32::try_from(idx).ok().map(|arg| (arg, c)))
        })
    }

    #[must_use]
    pub fn get(&self, arg: u32) -> Option<ArgConstraint> {
        usize::try_from(arg).ok().and_then(|idx| self.0.get(idx).copied().flatten())
    }

    pub(crate) fn set(&mut self, arg: usize, constraint: Option<ArgConstraint>) {
        if let Some(slot) = self.0.get_mut(arg) {
            *slot = constraint;
        }
    }

    pub(crate) fn clear(&mut self) {
        self.0 = [None; ARG_COUNT_MAX];
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.iter().filter(|slot| slot.is_some()).count()
    }

    /// Bit `i` is set when argument `i` is constrained.
    #[must_use]
    pub fn arg_mask(&self) -> u8 {
        self.iter().fold(0, |mask, (arg, _)| mask | (1 << arg))
    }
}

/// A rule as applied to one architecture, after translation and rewriting
///
/// Filters keep these in their history so snapshots can be rebuilt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleRecord {
    pub strict: bool,
    pub action: Action,
    pub syscall: i32,
    pub args: ArgChain,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_rejects_duplicates_and_range() {
        let dup = [ArgCmp::new(0, CompareOp::Eq, 1), ArgCmp::new(0, CompareOp::Ne, 2)];
        assert!(matches!(
            ArgChain::from_cmps(&dup),
            Err(FilterError::InvalidArgument(_))
        ));
        let far = [ArgCmp::new(6, CompareOp::Eq, 1)];
        assert!(ArgChain::from_cmps(&far).is_err());
    }

    #[test]
    fn chain_orders_by_argument() {
        let chain = ArgChain::from_cmps(&[
            ArgCmp::new(3, CompareOp::Gt, 9),
            ArgCmp::masked_eq(1, 0xff, 0x12),
        ])
        .unwrap();
        let args: Vec<u32> = chain.iter().map(|(arg, _)| arg).collect();
        assert_eq!(args, vec![1, 3]);
        assert_eq!(chain.arg_mask(), 0b1010);
        assert_eq!(chain.get(1).unwrap().mask, 0xff);
        assert_eq!(chain.get(3).unwrap().mask, u64::MAX);
    }

    #[test]
    fn operator_names() {
        assert_eq!("masked_eq".parse::<CompareOp>().unwrap(), CompareOp::MaskedEq);
        assert_eq!("<=".parse::<CompareOp>().unwrap(), CompareOp::Le);
        assert_eq!(CompareOp::from_raw(4), Some(CompareOp::Eq));
        assert_eq!(CompareOp::from_raw(0), None);
    }
}
