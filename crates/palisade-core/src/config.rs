//! Policy configuration
//!
//! A policy is a JSON document naming the default action, the extra target
//! architectures, the rules and the priority hints. Syscalls may be given by
//! name or by native number; names resolve against the native architecture.

use crate::arch::{self, ArchRef};
use crate::collection::{FilterAttr, FilterCollection};
use crate::host::{HostSupport, SystemHost};
use crate::{Action, ArgCmp, CompareOp, FilterError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// A syscall given by name or by native number
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SyscallRef {
    Number(i32),
    Name(String),
}

impl SyscallRef {
    /// Native syscall number.
    ///
    /// # Errors
    ///
    /// Returns `Config` for a name the native architecture does not know.
    pub fn resolve(&self, native: ArchRef) -> Result<i32> {
        match self {
            Self::Number(num) => Ok(*num),
            Self::Name(name) => native.resolve_name(name).ok_or_else(|| {
                FilterError::Config(format!("unknown syscall '{name}' on {}", native.name()))
            }),
        }
    }
}

impl fmt::Display for SyscallRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(num) => write!(f, "{num}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

impl From<&str> for SyscallRef {
    fn from(name: &str) -> Self {
        Self::Name(name.to_owned())
    }
}

impl From<i32> for SyscallRef {
    fn from(num: i32) -> Self {
        Self::Number(num)
    }
}

/// One argument comparison of a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgConfig {
    pub arg: u32,
    pub op: CompareOp,
    pub datum: u64,
    /// Required for `masked_eq`, rejected otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mask: Option<u64>,
}

impl ArgConfig {
    fn to_cmp(&self) -> Result<ArgCmp> {
        match (self.op, self.mask) {
            (CompareOp::MaskedEq, Some(mask)) => Ok(ArgCmp::masked_eq(self.arg, mask, self.datum)),
            (CompareOp::MaskedEq, None) => Err(FilterError::Config(format!(
                "argument {} uses masked_eq without a mask",
                self.arg
            ))),
            (op, None) => Ok(ArgCmp::new(self.arg, op, self.datum)),
            (op, Some(_)) => Err(FilterError::Config(format!(
                "argument {} sets a mask for operator {op}",
                self.arg
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub syscall: SyscallRef,
    pub action: Action,
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub args: Vec<ArgConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityConfig {
    pub syscall: SyscallRef,
    pub priority: u16,
}

/// A complete filter policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Action for calls no rule decides
    pub default_action: Action,

    /// Action for calls from architectures without a filter
    pub bad_arch_action: Action,

    /// Set no-new-privileges before loading
    pub no_new_privs: bool,

    /// Synchronize the filter across all threads on load
    pub thread_sync: bool,

    /// Target architectures besides the native one
    pub architectures: Vec<String>,

    pub rules: Vec<RuleConfig>,

    pub priorities: Vec<PriorityConfig>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            default_action: Action::KILL,
            bad_arch_action: Action::KILL,
            no_new_privs: true,
            thread_sync: false,
            architectures: vec![],
            rules: vec![],
            priorities: vec![],
        }
    }
}

impl PolicyConfig {
    /// Create a new config builder
    #[must_use]
    pub fn builder() -> PolicyConfigBuilder {
        PolicyConfigBuilder::default()
    }

    /// Parse a JSON policy.
    ///
    /// # Errors
    ///
    /// Returns `Config` for malformed JSON or unknown actions.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| FilterError::Config(e.to_string()))
    }

    /// Read and parse a JSON policy file.
    ///
    /// # Errors
    ///
    /// Returns `Io` if the file cannot be read, `Config` if it cannot be
    /// parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&json)?;
        info!(path = %path.display(), rules = config.rules.len(), "policy loaded");
        Ok(config)
    }

    /// Compile the policy for the build architecture.
    ///
    /// # Errors
    ///
    /// See [`PolicyConfig::build_with`].
    pub fn build(&self) -> Result<FilterCollection> {
        let native = arch::native().ok_or_else(|| {
            FilterError::Unsupported(format!(
                "no built-in description for {}",
                std::env::consts::ARCH
            ))
        })?;
        self.build_with(native, Arc::new(SystemHost))
    }

    /// Compile the policy treating `native` as the native architecture.
    ///
    /// Rules and priorities apply to every architecture that can express
    /// them; a syscall missing on some architecture is skipped there with a
    /// warning.
    ///
    /// # Errors
    ///
    /// Returns `Config` for unknown names or malformed comparisons and
    /// propagates any other rule or attribute failure.
    pub fn build_with(&self, native: ArchRef, host: Arc<dyn HostSupport>) -> Result<FilterCollection> {
        let mut col = FilterCollection::with_native(self.default_action, native).with_host(host);
        col.set_attribute(FilterAttr::BadArchAction, self.bad_arch_action.raw())?;
        col.set_attribute(FilterAttr::NoNewPrivs, u32::from(self.no_new_privs))?;
        if self.thread_sync {
            col.set_attribute(FilterAttr::ThreadSync, 1)?;
        }

        for name in &self.architectures {
            let arch = arch::by_name(name)
                .ok_or_else(|| FilterError::Config(format!("unknown architecture '{name}'")))?;
            if !col.has_architecture(arch.token()) {
                col.add_architecture(arch)?;
            }
        }

        for rule in &self.rules {
            let syscall = rule.syscall.resolve(native)?;
            let args = rule
                .args
                .iter()
                .map(ArgConfig::to_cmp)
                .collect::<Result<Vec<_>>>()?;
            skip_out_of_domain(
                col.add_rule(rule.strict, rule.action, syscall, &args),
                &rule.syscall,
            )?;
        }

        for hint in &self.priorities {
            let syscall = hint.syscall.resolve(native)?;
            col.set_syscall_priority(syscall, hint.priority)?;
        }

        Ok(col)
    }
}

fn skip_out_of_domain(result: Result<()>, syscall: &SyscallRef) -> Result<()> {
    match result {
        Err(err) if err.is_out_of_domain() => {
            warn!(%syscall, "rule not applied everywhere: {err}");
            Ok(())
        }
        other => other,
    }
}

/// Builder for PolicyConfig
#[derive(Debug, Default)]
pub struct PolicyConfigBuilder {
    config: PolicyConfig,
}

impl PolicyConfigBuilder {
    #[must_use]
    pub fn default_action(mut self, action: Action) -> Self {
        self.config.default_action = action;
        self
    }

    #[must_use]
    pub fn bad_arch_action(mut self, action: Action) -> Self {
        self.config.bad_arch_action = action;
        self
    }

    #[must_use]
    pub fn no_new_privs(mut self, enable: bool) -> Self {
        self.config.no_new_privs = enable;
        self
    }

    #[must_use]
    pub fn thread_sync(mut self, enable: bool) -> Self {
        self.config.thread_sync = enable;
        self
    }

    #[must_use]
    pub fn architecture(mut self, name: impl Into<String>) -> Self {
        self.config.architectures.push(name.into());
        self
    }

    /// Add a best-effort rule.
    #[must_use]
    pub fn rule(mut self, action: Action, syscall: impl Into<SyscallRef>, args: Vec<ArgConfig>) -> Self {
        self.config.rules.push(RuleConfig {
            syscall: syscall.into(),
            action,
            strict: false,
            args,
        });
        self
    }

    /// Add a rule that must apply exactly as written.
    #[must_use]
    pub fn exact_rule(mut self, action: Action, syscall: impl Into<SyscallRef>, args: Vec<ArgConfig>) -> Self {
        self.config.rules.push(RuleConfig {
            syscall: syscall.into(),
            action,
            strict: true,
            args,
        });
        self
    }

    #[must_use]
    pub fn priority(mut self, syscall: impl Into<SyscallRef>, priority: u16) -> Self {
        self.config.priorities.push(PriorityConfig {
            syscall: syscall.into(),
            priority,
        });
        self
    }

    #[must_use]
    pub fn build(self) -> PolicyConfig {
        self.config
    }
}

/// Get default policy path from PALISADE_POLICY env var or system default
///
/// Returns:
/// - `$PALISADE_POLICY` if set (for development)
/// - `/etc/palisade/policy.json` otherwise (production)
#[must_use]
pub fn default_policy_path() -> PathBuf {
    std::env::var("PALISADE_POLICY")
        .map_or_else(|_| PathBuf::from("/etc/palisade/policy.json"), PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{X86, X86_64};
    use crate::host::StaticHost;

    const POLICY: &str = r#"{
        "default_action": "errno(1)",
        "bad_arch_action": "trap",
        "architectures": ["i386"],
        "rules": [
            { "syscall": "read", "action": "allow" },
            { "syscall": "openat", "action": "allow",
              "args": [{ "arg": 2, "op": "masked_eq", "datum": 0, "mask": 3 }] },
            { "syscall": 231, "action": "allow", "strict": true }
        ],
        "priorities": [{ "syscall": "read", "priority": 10 }]
    }"#;

    fn host() -> Arc<dyn HostSupport> {
        Arc::new(StaticHost::default())
    }

    #[test]
    fn defaults() {
        let config = PolicyConfig::from_json_str("{}").unwrap();
        assert_eq!(config, PolicyConfig::default());
        assert_eq!(config.default_action, Action::KILL);
        assert!(config.no_new_privs);
    }

    #[test]
    fn parses_and_builds() {
        let config = PolicyConfig::from_json_str(POLICY).unwrap();
        assert_eq!(config.rules[2].syscall, SyscallRef::Number(231));

        let col = config.build_with(&X86_64, host()).unwrap();
        assert_eq!(col.attributes().default_action, Action::errno(1).unwrap());
        assert_eq!(col.attributes().bad_arch_action, Action::TRAP);
        assert_eq!(col.filters().len(), 2);

        let x86 = col.filter(X86.token).unwrap();
        assert_eq!(x86.syscall(3).unwrap().hint(), 10);
        assert_eq!(x86.syscall(252).unwrap().action(), Some(Action::ALLOW));
        assert_eq!(col.filter(X86_64.token).unwrap().syscall(257).unwrap().node_count(), 1);
    }

    #[test]
    fn rejects_bad_policies() {
        let unknown = PolicyConfig::builder().rule(Action::ALLOW, "frobnicate", vec![]).build();
        assert!(matches!(unknown.build_with(&X86_64, host()), Err(FilterError::Config(_))));

        let maskless = PolicyConfig::builder()
            .rule(
                Action::ALLOW,
                "ioctl",
                vec![ArgConfig { arg: 1, op: CompareOp::MaskedEq, datum: 4, mask: None }],
            )
            .build();
        assert!(matches!(maskless.build_with(&X86_64, host()), Err(FilterError::Config(_))));

        let arch = PolicyConfig::builder().architecture("vax").build();
        assert!(matches!(arch.build_with(&X86_64, host()), Err(FilterError::Config(_))));

        let tsync = PolicyConfig::builder().thread_sync(true).build();
        assert!(matches!(tsync.build_with(&X86_64, host()), Err(FilterError::Unsupported(_))));

        assert!(matches!(
            PolicyConfig::from_json_str(r#"{ "default_action": "deny" }"#),
            Err(FilterError::Config(_))
        ));
    }

    #[test]
    fn arch_specific_syscalls_are_skipped_elsewhere() {
        let config = PolicyConfig::builder()
            .architecture("aarch64")
            .rule(Action::ALLOW, "open", vec![])
            .build();
        let col = config.build_with(&X86_64, host()).unwrap();
        assert!(col.filter(X86_64.token).unwrap().syscall(2).is_some());
        assert!(col.filter(crate::arch::AARCH64.token).unwrap().syscalls().is_empty());
    }
}
