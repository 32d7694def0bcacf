//! Built-in architecture tables

use super::{ArchToken, Architecture, Endian, PSEUDO_SYSCALL_MAX, Rewrite, WordSize};
use crate::rule::{ArgConstraint, RuleRecord};
use crate::{CompareOp, FilterError, Result};
use tracing::warn;

/// Pseudo numbers of the socket family multiplexed through `socketcall(2)`.
const SOCKET_PSEUDO: std::ops::RangeInclusive<i32> = -120..=-101;

/// A statically described architecture
#[derive(Debug)]
pub struct BuiltinArch {
    pub name: &'static str,
    pub token: ArchToken,
    pub word_size: WordSize,
    pub endian: Endian,
    pub syscalls: &'static [(&'static str, i32)],
    /// `socketcall` number when socket calls are multiplexed.
    pub socketcall: Option<i32>,
}

impl Architecture for BuiltinArch {
    fn name(&self) -> &'static str {
        self.name
    }

    fn token(&self) -> ArchToken {
        self.token
    }

    fn word_size(&self) -> WordSize {
        self.word_size
    }

    fn endian(&self) -> Endian {
        self.endian
    }

    fn resolve_name(&self, name: &str) -> Option<i32> {
        self.syscalls
            .iter()
            .find(|(n, _)| *n == name)
            .map(|&(_, num)| num)
    }

    fn resolve_num(&self, num: i32) -> Option<&'static str> {
        self.syscalls
            .iter()
            .find(|&&(_, n)| n == num)
            .map(|&(name, _)| name)
    }

    fn rewrite_syscall(&self, syscall: i32) -> Option<i32> {
        self.socketcall.filter(|_| SOCKET_PSEUDO.contains(&syscall))
    }

    fn rewrite_rule(&self, rule: &mut RuleRecord) -> Result<Rewrite> {
        let Some(socketcall) = self.rewrite_syscall(rule.syscall) else {
            if rule.syscall > PSEUDO_SYSCALL_MAX {
                return Ok(Rewrite::Apply);
            }
            return if rule.strict {
                Err(self.out_of_domain(rule.syscall))
            } else {
                Ok(Rewrite::Skip)
            };
        };

        // socketcall passes the real arguments through a pointer
        if !rule.args.is_empty() {
            if rule.strict {
                return Err(FilterError::InvalidArgument(format!(
                    "argument filters on syscall {} cannot be expressed through socketcall on {}",
                    rule.syscall, self.name
                )));
            }
            warn!(
                arch = self.name,
                syscall = rule.syscall,
                "dropping argument filters for multiplexed socket call"
            );
        }

        let call = u64::from((-rule.syscall % 100).unsigned_abs());
        rule.args.clear();
        rule.args.set(
            0,
            Some(ArgConstraint {
                op: CompareOp::Eq,
                mask: u64::MAX,
                datum: call,
            }),
        );
        rule.syscall = socketcall;
        Ok(Rewrite::Apply)
    }
}

pub static X86_64: BuiltinArch = BuiltinArch {
    name: "x86_64",
    token: ArchToken(0xC000_003E),
    word_size: WordSize::Bits64,
    endian: Endian::Little,
    syscalls: &[
        ("read", 0),
        ("write", 1),
        ("open", 2),
        ("close", 3),
        ("stat", 4),
        ("fstat", 5),
        ("mmap", 9),
        ("mprotect", 10),
        ("munmap", 11),
        ("brk", 12),
        ("ioctl", 16),
        ("getpid", 39),
        ("socket", 41),
        ("connect", 42),
        ("accept", 43),
        ("sendto", 44),
        ("recvfrom", 45),
        ("bind", 49),
        ("listen", 50),
        ("clone", 56),
        ("fork", 57),
        ("execve", 59),
        ("exit", 60),
        ("kill", 62),
        ("futex", 202),
        ("exit_group", 231),
        ("openat", 257),
        ("getrandom", 318),
    ],
    socketcall: None,
};

pub static X86: BuiltinArch = BuiltinArch {
    name: "x86",
    token: ArchToken(0x4000_0003),
    word_size: WordSize::Bits32,
    endian: Endian::Little,
    syscalls: &[
        ("exit", 1),
        ("fork", 2),
        ("read", 3),
        ("write", 4),
        ("open", 5),
        ("close", 6),
        ("execve", 11),
        ("getpid", 20),
        ("kill", 37),
        ("brk", 45),
        ("ioctl", 54),
        ("mmap", 90),
        ("munmap", 91),
        ("socketcall", 102),
        ("stat", 106),
        ("fstat", 108),
        ("clone", 120),
        ("mprotect", 125),
        ("futex", 240),
        ("exit_group", 252),
        ("openat", 295),
        ("getrandom", 355),
        ("socket", -101),
        ("bind", -102),
        ("connect", -103),
        ("listen", -104),
        ("accept", -105),
        ("sendto", -111),
        ("recvfrom", -112),
    ],
    socketcall: Some(102),
};

pub static AARCH64: BuiltinArch = BuiltinArch {
    name: "aarch64",
    token: ArchToken(0xC000_00B7),
    word_size: WordSize::Bits64,
    endian: Endian::Little,
    syscalls: &[
        ("ioctl", 29),
        ("openat", 56),
        ("close", 57),
        ("read", 63),
        ("write", 64),
        ("fstat", 80),
        ("exit", 93),
        ("exit_group", 94),
        ("futex", 98),
        ("kill", 129),
        ("getpid", 172),
        ("socket", 198),
        ("bind", 200),
        ("listen", 201),
        ("accept", 202),
        ("connect", 203),
        ("sendto", 206),
        ("recvfrom", 207),
        ("brk", 214),
        ("munmap", 215),
        ("clone", 220),
        ("execve", 221),
        ("mmap", 222),
        ("mprotect", 226),
        ("getrandom", 278),
    ],
    socketcall: None,
};

pub static ARM: BuiltinArch = BuiltinArch {
    name: "arm",
    token: ArchToken(0x4000_0028),
    word_size: WordSize::Bits32,
    endian: Endian::Little,
    syscalls: &[
        ("exit", 1),
        ("fork", 2),
        ("read", 3),
        ("write", 4),
        ("open", 5),
        ("close", 6),
        ("execve", 11),
        ("getpid", 20),
        ("kill", 37),
        ("brk", 45),
        ("ioctl", 54),
        ("munmap", 91),
        ("stat", 106),
        ("fstat", 108),
        ("clone", 120),
        ("mprotect", 125),
        ("futex", 240),
        ("exit_group", 248),
        ("socket", 281),
        ("bind", 282),
        ("connect", 283),
        ("listen", 284),
        ("accept", 285),
        ("sendto", 290),
        ("recvfrom", 292),
        ("openat", 322),
        ("getrandom", 384),
    ],
    socketcall: None,
};

pub static S390X: BuiltinArch = BuiltinArch {
    name: "s390x",
    token: ArchToken(0x8000_0016),
    word_size: WordSize::Bits64,
    endian: Endian::Big,
    syscalls: &[
        ("exit", 1),
        ("fork", 2),
        ("read", 3),
        ("write", 4),
        ("open", 5),
        ("close", 6),
        ("execve", 11),
        ("getpid", 20),
        ("kill", 37),
        ("brk", 45),
        ("ioctl", 54),
        ("mmap", 90),
        ("munmap", 91),
        ("stat", 106),
        ("fstat", 108),
        ("clone", 120),
        ("mprotect", 125),
        ("futex", 238),
        ("exit_group", 248),
        ("openat", 288),
        ("getrandom", 349),
        ("socket", 359),
        ("bind", 361),
        ("connect", 362),
        ("listen", 363),
        ("sendto", 369),
        ("recvfrom", 371),
    ],
    socketcall: None,
};

/// Every built-in architecture
pub static BUILTIN: [&dyn Architecture; 5] = [&X86_64, &X86, &AARCH64, &ARM, &S390X];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::ArgChain;
    use crate::{Action, ArgCmp};

    fn record(strict: bool, syscall: i32, args: &[ArgCmp]) -> RuleRecord {
        RuleRecord {
            strict,
            action: Action::ALLOW,
            syscall,
            args: ArgChain::from_cmps(args).unwrap(),
        }
    }

    #[test]
    fn tables_have_unique_entries() {
        for arch in BUILTIN {
            let syscalls = by_table(arch.name()).syscalls;
            for (i, (name, num)) in syscalls.iter().enumerate() {
                for (other, other_num) in &syscalls[i + 1..] {
                    assert_ne!(name, other, "{}", arch.name());
                    assert_ne!(num, other_num, "{}", arch.name());
                }
            }
        }
    }

    fn by_table(name: &str) -> &'static BuiltinArch {
        [&X86_64, &X86, &AARCH64, &ARM, &S390X]
            .into_iter()
            .find(|arch| arch.name == name)
            .unwrap()
    }

    #[test]
    fn x86_rewrites_socket_calls() {
        let mut rule = record(false, -101, &[]);
        assert_eq!(X86.rewrite_rule(&mut rule).unwrap(), Rewrite::Apply);
        assert_eq!(rule.syscall, 102);
        let arg0 = rule.args.get(0).unwrap();
        assert_eq!(arg0.op, CompareOp::Eq);
        assert_eq!(arg0.datum, 1);
    }

    #[test]
    fn strict_socket_rule_with_args_is_rejected() {
        let mut rule = record(true, -103, &[ArgCmp::new(1, CompareOp::Eq, 4)]);
        assert!(matches!(
            X86.rewrite_rule(&mut rule),
            Err(FilterError::InvalidArgument(_))
        ));

        let mut widened = record(false, -103, &[ArgCmp::new(1, CompareOp::Eq, 4)]);
        X86.rewrite_rule(&mut widened).unwrap();
        assert_eq!(widened.args.len(), 1);
        assert_eq!(widened.args.get(0).unwrap().datum, 3);
    }

    #[test]
    fn pseudo_syscalls_without_rewrite() {
        let mut strict = record(true, -101, &[]);
        assert!(matches!(
            X86_64.rewrite_rule(&mut strict),
            Err(FilterError::OutOfDomain { .. })
        ));
        let mut lax = record(false, -101, &[]);
        assert_eq!(X86_64.rewrite_rule(&mut lax).unwrap(), Rewrite::Skip);
        let mut real = record(true, 0, &[]);
        assert_eq!(X86_64.rewrite_rule(&mut real).unwrap(), Rewrite::Apply);
    }
}
