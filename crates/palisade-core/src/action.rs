//! Filter actions
//!
//! Actions use the kernel's `SECCOMP_RET_*` encoding: the upper 16 bits select
//! the action, the lower 16 bits carry its data (errno value or trace message).

use crate::{FilterError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Largest errno value an ERRNO action may carry, exclusive.
pub const MAX_ERRNO: u32 = 4095;

const RET_KILL: u32 = 0x0000_0000;
const RET_TRAP: u32 = 0x0003_0000;
const RET_ERRNO: u32 = 0x0005_0000;
const RET_TRACE: u32 = 0x7ff0_0000;
const RET_ALLOW: u32 = 0x7fff_0000;
const RET_DATA: u32 = 0x0000_ffff;

/// Decoded form of an [`Action`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Kill,
    Trap,
    Errno(u16),
    Trace(u16),
    Allow,
}

/// A filter action in kernel encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Action(u32);

impl Action {
    pub const KILL: Self = Self(RET_KILL);
    pub const TRAP: Self = Self(RET_TRAP);
    pub const ALLOW: Self = Self(RET_ALLOW);

    /// Fail the syscall with `errno`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `errno` is not below [`MAX_ERRNO`].
    pub fn errno(errno: u16) -> Result<Self> {
        Self::from_raw(RET_ERRNO | u32::from(errno))
    }

    /// Notify a tracer, passing `msg` through `PTRACE_GETEVENTMSG`.
    #[must_use]
    pub const fn trace(msg: u16) -> Self {
        Self(RET_TRACE | msg as u32)
    }

    /// Validate a raw kernel encoding.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for encodings that are not a known action.
    pub fn from_raw(raw: u32) -> Result<Self> {
        let action = Self(raw);
        if action.kind().is_some() {
            Ok(action)
        } else {
            Err(FilterError::InvalidArgument(format!(
                "invalid action encoding {raw:#010x}"
            )))
        }
    }

    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn kind(self) -> Option<ActionKind> {
        let data = self.0 & RET_DATA;
        match self.0 & !RET_DATA {
            RET_KILL if data == 0 => Some(ActionKind::Kill),
            RET_TRAP if data == 0 => Some(ActionKind::Trap),
            RET_ALLOW if data == 0 => Some(ActionKind::Allow),
            RET_ERRNO if data < MAX_ERRNO => Some(ActionKind::Errno(data as u16)),
            RET_TRACE => Some(ActionKind::Trace(data as u16)),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            Some(ActionKind::Kill) => f.write_str("kill"),
            Some(ActionKind::Trap) => f.write_str("trap"),
            Some(ActionKind::Allow) => f.write_str("allow"),
            Some(ActionKind::Errno(n)) => write!(f, "errno({n})"),
            Some(ActionKind::Trace(n)) => write!(f, "trace({n})"),
            None => write!(f, "{:#010x}", self.0),
        }
    }
}

impl FromStr for Action {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        let invalid = || FilterError::InvalidArgument(format!("unknown action '{s}'"));

        match s.as_str() {
            "kill" => return Ok(Self::KILL),
            "trap" => return Ok(Self::TRAP),
            "allow" => return Ok(Self::ALLOW),
            _ => {}
        }

        if let Some(hex) = s.strip_prefix("0x") {
            let raw = u32::from_str_radix(hex, 16).map_err(|_| invalid())?;
            return Self::from_raw(raw);
        }

        let (name, rest) = s.split_once('(').ok_or_else(invalid)?;
        let data: u16 = rest
            .strip_suffix(')')
            .and_then(|n| n.trim().parse().ok())
            .ok_or_else(invalid)?;
        match name.trim() {
            "errno" => Self::errno(data),
            "trace" => Ok(Self::trace(data)),
            _ => Err(invalid()),
        }
    }
}

impl TryFrom<String> for Action {
    type Error = FilterError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        action.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_encodings() {
        assert_eq!(Action::KILL.raw(), 0);
        assert_eq!(Action::ALLOW.raw(), 0x7fff_0000);
        assert_eq!(Action::errno(13).unwrap().raw(), 0x0005_000d);
        assert_eq!(Action::trace(7).raw(), 0x7ff0_0007);
    }

    #[test]
    fn rejects_invalid_encodings() {
        assert!(Action::from_raw(0x0003_0001).is_err());
        assert!(Action::from_raw(0x1234_0000).is_err());
        assert!(Action::errno(4095).is_err());
        assert!(Action::errno(4094).is_ok());
    }

    #[test]
    fn parses_and_prints() {
        for text in ["kill", "trap", "allow", "errno(1)", "trace(42)"] {
            let action: Action = text.parse().unwrap();
            assert_eq!(action.to_string(), text);
        }
        assert_eq!("ERRNO( 2 )".parse::<Action>().unwrap(), Action::errno(2).unwrap());
        assert_eq!("0x7fff0000".parse::<Action>().unwrap(), Action::ALLOW);
        assert!("deny".parse::<Action>().is_err());
        assert!("errno(x)".parse::<Action>().is_err());
    }

    #[test]
    fn serializes_as_string() {
        let json = serde_json::to_string(&Action::errno(1).unwrap()).unwrap();
        assert_eq!(json, "\"errno(1)\"");
        let back: Action = serde_json::from_str("\"trap\"").unwrap();
        assert_eq!(back, Action::TRAP);
    }
}
