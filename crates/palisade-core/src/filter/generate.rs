//! Rule generation
//!
//! A rule becomes a candidate tree: one single-node level per 32-bit word
//! test, built from the last constraint back to the first so every segment
//! can point at its continuation. On 64-bit architectures a constraint
//! splits into high and low word tests:
//!
//! | op   | shape (k = continuation)                         |
//! |------|--------------------------------------------------|
//! | `==` | hi `==` t→ lo `==` t→ k                          |
//! | `!=` | hi `==` f→k, t→ lo `==` f→k                      |
//! | `>`  | hi `>` t→k, f→ hi `==` t→ lo `>` t→k             |
//! | `>=` | hi `>` t→k, f→ hi `==` t→ lo `>=` t→k            |
//! | `<`  | hi `>` f→ hi `==` f→k, t→ lo `>=` f→k            |
//! | `<=` | hi `>` f→ hi `==` f→k, t→ lo `>` f→k             |
//!
//! Masked equality tests each half under its part of the mask and skips a
//! half whose mask is zero.

use super::tree::{ChainNode, ChainTree, Comparison, Edge, Op};
use crate::arch::{ArchRef, ArgHalf, WordSize};
use crate::rule::{ARG_COUNT_MAX, ArgConstraint, RuleRecord};
use crate::{CompareOp, FilterError, Result};

/// Build the candidate tree for `rule` on `arch`.
pub(crate) fn generate(arch: ArchRef, rule: &RuleRecord) -> Result<ChainTree> {
    let max_args = arch.arg_count_max();
    if max_args > ARG_COUNT_MAX {
        return Err(FilterError::Unsupported(format!(
            "{} inspects {max_args} arguments, at most {ARG_COUNT_MAX} are supported",
            arch.name()
        )));
    }

    let mut tree = ChainTree::new();
    let mut next = Edge::Action(rule.action);
    let mut builder = Builder {
        arch,
        tree: &mut tree,
    };
    for (arg, constraint) in rule.args.iter().rev() {
        if arg as usize >= max_args {
            return Err(FilterError::InvalidArgument(format!(
                "argument {arg} is out of range on {}",
                arch.name()
            )));
        }
        next = match arch.word_size() {
            WordSize::Bits32 => builder.word32(arg, constraint, rule.strict, next)?,
            WordSize::Bits64 => builder.word64(arg, constraint, next)?,
        };
    }

    let root = tree.attach(next);
    tree.set_root(root);
    Ok(tree)
}

/// Canonical operator and the branch that carries the continuation.
const fn canonical(op: CompareOp) -> (Op, bool) {
    match op {
        CompareOp::Eq => (Op::Eq, true),
        CompareOp::Ne => (Op::Eq, false),
        CompareOp::Gt => (Op::Gt, true),
        CompareOp::Le => (Op::Gt, false),
        CompareOp::Ge => (Op::Ge, true),
        CompareOp::Lt => (Op::Ge, false),
        CompareOp::MaskedEq => (Op::MaskedEq, true),
    }
}

struct Builder<'a> {
    arch: ArchRef,
    tree: &'a mut ChainTree,
}

impl Builder<'_> {
    /// A fresh single-node level; the returned edge is not yet attached.
    #[allow(clippy::too_many_arguments)]
    fn test(
        &mut self,
        arg: u32,
        half: ArgHalf,
        op: Op,
        mask: u32,
        datum: u32,
        on_true: Edge,
        on_false: Edge,
    ) -> Result<Edge> {
        let node = ChainNode {
            cmp: Comparison {
                arg,
                half,
                op,
                mask,
                datum: datum & mask,
            },
            offset: self.arch.arg_offset(arg, half),
            on_true: self.tree.attach(on_true),
            on_false: self.tree.attach(on_false),
        };
        let id = self.tree.alloc_node(node)?;
        Ok(Edge::Next(self.tree.alloc_level(vec![id])?))
    }

    fn word32(&mut self, arg: u32, c: ArgConstraint, strict: bool, next: Edge) -> Result<Edge> {
        let datum = c.datum & c.mask;
        if strict && datum > u64::from(u32::MAX) {
            return Err(FilterError::InvalidArgument(format!(
                "datum {datum:#x} for argument {arg} does not fit a 32-bit word on {}",
                self.arch.name()
            )));
        }

        let (op, taken) = canonical(c.op);
        let mask = match op {
            Op::MaskedEq => ArgHalf::Low.of(c.mask),
            _ => u32::MAX,
        };
        if mask == 0 {
            return Ok(next);
        }

        let datum = ArgHalf::Low.of(datum);
        let (on_true, on_false) = if taken {
            (next, Edge::Fallthrough)
        } else {
            (Edge::Fallthrough, next)
        };
        self.test(arg, ArgHalf::Low, op, mask, datum, on_true, on_false)
    }

    fn word64(&mut self, arg: u32, c: ArgConstraint, next: Edge) -> Result<Edge> {
        use ArgHalf::{High, Low};
        const ALL: u32 = u32::MAX;
        let ft = Edge::Fallthrough;
        let datum = c.datum & c.mask;
        let (hi, lo) = (High.of(datum), Low.of(datum));

        match c.op {
            CompareOp::Eq | CompareOp::MaskedEq => {
                let op = canonical(c.op).0;
                let (mask_hi, mask_lo) = (High.of(c.mask), Low.of(c.mask));
                let mut edge = next;
                if mask_lo != 0 {
                    edge = self.test(arg, Low, op, mask_lo, lo, edge, ft)?;
                }
                if mask_hi != 0 {
                    edge = self.test(arg, High, op, mask_hi, hi, edge, ft)?;
                }
                Ok(edge)
            }
            CompareOp::Ne => {
                let low = self.test(arg, Low, Op::Eq, ALL, lo, ft, next)?;
                self.test(arg, High, Op::Eq, ALL, hi, low, next)
            }
            CompareOp::Gt | CompareOp::Ge => {
                let low = self.test(arg, Low, canonical(c.op).0, ALL, lo, next, ft)?;
                let equal = self.test(arg, High, Op::Eq, ALL, hi, low, ft)?;
                self.test(arg, High, Op::Gt, ALL, hi, next, equal)
            }
            CompareOp::Lt | CompareOp::Le => {
                let low = self.test(arg, Low, canonical(c.op).0, ALL, lo, ft, next)?;
                let equal = self.test(arg, High, Op::Eq, ALL, hi, low, next)?;
                self.test(arg, High, Op::Gt, ALL, hi, ft, equal)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{S390X, X86, X86_64};
    use crate::rule::ArgChain;
    use crate::{Action, ArgCmp};

    const SAMPLES: [u64; 9] = [
        0,
        1,
        0xffff_ffff,
        0x1_0000_0000,
        0x1_0000_0001,
        0x2_0000_0000,
        0x7fff_ffff_ffff_ffff,
        0xffff_ffff_0000_0000,
        u64::MAX,
    ];

    fn rule(strict: bool, cmps: &[ArgCmp]) -> RuleRecord {
        RuleRecord {
            strict,
            action: Action::ALLOW,
            syscall: 0,
            args: ArgChain::from_cmps(cmps).unwrap(),
        }
    }

    fn reference(op: CompareOp, value: u64, datum: u64, mask: u64) -> bool {
        match op {
            CompareOp::Ne => value != datum,
            CompareOp::Lt => value < datum,
            CompareOp::Le => value <= datum,
            CompareOp::Eq => value == datum,
            CompareOp::Ge => value >= datum,
            CompareOp::Gt => value > datum,
            CompareOp::MaskedEq => value & mask == datum & mask,
        }
    }

    const OPS: [CompareOp; 6] = [
        CompareOp::Ne,
        CompareOp::Lt,
        CompareOp::Le,
        CompareOp::Eq,
        CompareOp::Ge,
        CompareOp::Gt,
    ];

    #[test]
    fn split_comparisons_are_exact_on_64_bit() {
        for op in OPS {
            for datum in SAMPLES {
                let tree = generate(&X86_64, &rule(true, &[ArgCmp::new(2, op, datum)])).unwrap();
                for value in SAMPLES {
                    let expected = reference(op, value, datum, u64::MAX).then_some(Action::ALLOW);
                    assert_eq!(
                        tree.simulate(&[0, 0, value, 0, 0, 0]),
                        expected,
                        "{value:#x} {op} {datum:#x}"
                    );
                }
            }
        }
    }

    #[test]
    fn masked_equality_on_64_bit() {
        let mask = 0xff00_0000_0000_00ff;
        let tree = generate(&S390X, &rule(true, &[ArgCmp::masked_eq(0, mask, 0x1200_0000_0000_0034)])).unwrap();
        assert_eq!(tree.node_count(), 2);
        for value in [0x12ab_cdef_0000_0034_u64, 0x1200_0000_0000_0035, 0x1300_0000_0000_0034] {
            let expected = reference(CompareOp::MaskedEq, value, 0x1200_0000_0000_0034, mask);
            assert_eq!(
                tree.simulate(&[value, 0, 0, 0, 0, 0]).is_some(),
                expected,
                "{value:#x}"
            );
        }
    }

    #[test]
    fn zero_mask_halves_are_skipped() {
        let low_only = generate(&X86_64, &rule(true, &[ArgCmp::masked_eq(0, 0xf0, 0x30)])).unwrap();
        assert_eq!(low_only.node_count(), 1);

        let tautology = generate(&X86_64, &rule(true, &[ArgCmp::masked_eq(0, 0, 0)])).unwrap();
        assert_eq!(tautology.root(), Edge::Action(Action::ALLOW));
    }

    #[test]
    fn shape_of_greater_than() {
        let tree = generate(&X86_64, &rule(true, &[ArgCmp::new(0, CompareOp::Gt, 5)])).unwrap();
        assert_eq!(tree.node_count(), 3);
        let Edge::Next(top) = tree.root() else {
            panic!("expected a chain");
        };
        let hi = tree.node(tree.level(top).nodes()[0]);
        assert_eq!(hi.cmp.half, ArgHalf::High);
        assert_eq!(hi.cmp.op, Op::Gt);
        assert_eq!(hi.offset, 20);
        assert_eq!(hi.on_true, Edge::Action(Action::ALLOW));
        assert!(matches!(hi.on_false, Edge::Next(_)));
    }

    #[test]
    fn not_equal_shares_its_continuation() {
        let tree = generate(
            &X86_64,
            &rule(
                true,
                &[ArgCmp::new(0, CompareOp::Ne, 3), ArgCmp::new(1, CompareOp::Eq, 9)],
            ),
        )
        .unwrap();
        let shared = tree.levels().filter(|(_, level)| level.refs() == 2).count();
        assert_eq!(shared, 1);
        assert_eq!(tree.simulate(&[4, 9, 0, 0, 0, 0]), Some(Action::ALLOW));
        assert_eq!(tree.simulate(&[3, 9, 0, 0, 0, 0]), None);
        assert_eq!(tree.simulate(&[1 << 32 | 3, 9, 0, 0, 0, 0]), Some(Action::ALLOW));
        assert_eq!(tree.simulate(&[4, 8, 0, 0, 0, 0]), None);
    }

    #[test]
    fn single_word_comparisons_on_32_bit() {
        for op in OPS {
            for datum in [0_u64, 1, 7, 0xffff_ffff] {
                let tree = generate(&X86, &rule(true, &[ArgCmp::new(0, op, datum)])).unwrap();
                assert_eq!(tree.node_count(), 1);
                for value in [0_u64, 1, 7, 8, 0xffff_fffe, 0xffff_ffff] {
                    let expected = reference(op, value, datum, u64::MAX).then_some(Action::ALLOW);
                    assert_eq!(tree.simulate(&[value, 0, 0, 0, 0, 0]), expected);
                }
            }
        }
    }

    #[test]
    fn wide_datum_on_32_bit() {
        let wide = [ArgCmp::new(0, CompareOp::Eq, 0x1_0000_0005)];
        assert!(matches!(
            generate(&X86, &rule(true, &wide)),
            Err(FilterError::InvalidArgument(_))
        ));
        let tree = generate(&X86, &rule(false, &wide)).unwrap();
        assert_eq!(tree.simulate(&[5, 0, 0, 0, 0, 0]), Some(Action::ALLOW));

        let masked = [ArgCmp::masked_eq(0, 0xffff, 0x1_0000_0005)];
        assert!(generate(&X86, &rule(true, &masked)).is_ok());
    }
}
