use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use nix::sched::{setns, CloneFlags};
use tracing::warn;

use crate::socket::NetlinkSocket;

/// The runtime directory where named network namespaces live.
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

/// A handle on the network namespace an operation targets.
///
/// A context owns the namespace file descriptor for its whole lifetime and
/// releases it on drop. It carries no socket: every operation dials its own
/// routing socket through [`Context::dial`] and releases it when done.
///
/// # Examples
///
/// ```
/// use rtlink::context::Context;
/// # use rtlink::test_setup;
///
/// # test_setup!();
/// let ctx = Context::open_default().unwrap();
/// assert_eq!(ctx.fd(), 0);
/// ```
pub struct Context {
    ns: Option<File>,
    target: String,
}

impl Context {
    /// Open a context on the caller's current namespace.
    pub fn open_default() -> Result<Self> {
        Ok(Self {
            ns: None,
            target: "default".to_string(),
        })
    }

    /// Open a context on the named namespace under `/var/run/netns`.
    /// A namespace that does not exist surfaces as the open failure.
    pub fn open(name: &str) -> Result<Self> {
        Self::open_path(PathBuf::from(NETNS_RUN_DIR).join(name))
    }

    /// Open a context on a namespace file path, e.g. `/proc/<pid>/ns/net`.
    pub fn open_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let ns = File::open(path)
            .with_context(|| format!("open namespace {}", path.display()))?;

        Ok(Self {
            ns: Some(ns),
            target: path.display().to_string(),
        })
    }

    /// The raw namespace descriptor, or 0 for the default namespace.
    /// Nonzero values double as the link namespace-move target.
    pub fn fd(&self) -> RawFd {
        match &self.ns {
            Some(f) => f.as_raw_fd(),
            None => 0,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Release the namespace descriptor. Dropping the context does the
    /// same; this form just makes the release point explicit.
    pub fn close(self) {}

    /// Dial a netlink socket inside this context's namespace.
    ///
    /// Namespace membership is thread-local kernel state: the guard enters
    /// the target namespace on the calling thread, the socket is created
    /// while the guard is live, and the guard restores the original
    /// namespace before this function returns, on success and on every
    /// error path. The whole dial therefore runs pinned to one thread.
    pub(crate) fn dial(&self, protocol: i32) -> Result<NetlinkSocket> {
        match &self.ns {
            None => NetlinkSocket::new(protocol, 0, 0),
            Some(ns) => {
                let _guard = NsGuard::enter(ns.as_raw_fd())
                    .with_context(|| format!("enter namespace {}", self.target))?;
                NetlinkSocket::new(protocol, 0, 0)
            }
        }
    }
}

/// Scoped namespace membership for the calling thread. Construction moves
/// the thread into the target namespace; drop moves it back.
struct NsGuard {
    original: File,
}

impl NsGuard {
    fn enter(target: RawFd) -> Result<Self> {
        let original =
            File::open("/proc/self/ns/net").context("open current namespace")?;

        setns(target, CloneFlags::CLONE_NEWNET).context("setns to target namespace")?;

        Ok(Self { original })
    }
}

impl Drop for NsGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(self.original.as_raw_fd(), CloneFlags::CLONE_NEWNET) {
            // nothing to propagate from drop, but this thread is now in
            // the wrong namespace
            warn!("failed to restore namespace: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_setup;

    #[test]
    fn test_open_default() {
        let ctx = Context::open_default().unwrap();
        assert_eq!(ctx.fd(), 0);
        assert_eq!(ctx.target(), "default");
    }

    #[test]
    fn test_open_missing_namespace() {
        let res = Context::open("definitely-not-a-namespace");
        assert!(res.is_err());
    }

    #[test]
    fn test_dial_default() {
        test_setup!();
        let ctx = Context::open_default().unwrap();
        let socket = ctx.dial(libc::NETLINK_ROUTE).unwrap();
        assert!(socket.pid().is_ok());
    }

    #[test]
    fn test_ns_guard_restores() {
        test_setup!();
        let before = std::fs::read_link("/proc/self/ns/net").unwrap();

        {
            let ns = File::open("/proc/self/ns/net").unwrap();
            let _guard = NsGuard::enter(ns.as_raw_fd()).unwrap();
        }

        let after = std::fs::read_link("/proc/self/ns/net").unwrap();
        assert_eq!(before, after);
    }
}
