//! Host kernel capability checks

use once_cell::sync::OnceCell;
use std::fmt;

/// Kernel features a collection may depend on
pub trait HostSupport: fmt::Debug + Send + Sync {
    /// Whether filters can be synchronized across all threads on load.
    fn supports_thread_sync(&self) -> bool;
}

/// Probes the running kernel, caching the answer for the process lifetime
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHost;

static THREAD_SYNC: OnceCell<bool> = OnceCell::new();

impl HostSupport for SystemHost {
    fn supports_thread_sync(&self) -> bool {
        *THREAD_SYNC.get_or_init(probe_thread_sync)
    }
}

/// Fixed answers, for hosts known in advance and for tests
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticHost {
    pub thread_sync: bool,
}

impl HostSupport for StaticHost {
    fn supports_thread_sync(&self) -> bool {
        self.thread_sync
    }
}

#[cfg(target_os = "linux")]
fn probe_thread_sync() -> bool {
    use nix::errno::Errno;

    const SECCOMP_SET_MODE_FILTER: libc::c_ulong = 1;
    const SECCOMP_FILTER_FLAG_TSYNC: libc::c_ulong = 1;

    // SAFETY: a NULL program is rejected with EFAULT once the flags are
    // accepted, so no filter is ever installed.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_seccomp,
            SECCOMP_SET_MODE_FILTER,
            SECCOMP_FILTER_FLAG_TSYNC,
            std::ptr::null::<libc::c_void>(),
        )
    };
    let supported = rc < 0 && Errno::last() == Errno::EFAULT;
    tracing::debug!(supported, "probed seccomp thread sync");
    supported
}

#[cfg(not(target_os = "linux"))]
fn probe_thread_sync() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_probe_is_stable() {
        let host = SystemHost;
        assert_eq!(host.supports_thread_sync(), host.supports_thread_sync());
    }

    #[test]
    fn static_host() {
        assert!(StaticHost { thread_sync: true }.supports_thread_sync());
        assert!(!StaticHost::default().supports_thread_sync());
    }
}
