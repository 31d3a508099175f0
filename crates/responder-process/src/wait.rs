//! Reaping children and classifying how they ended.

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use responder_common::{ProcessError, ProcessResult};
use std::fmt;

/// What the OS reported about a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitInfo {
    /// Normal exit with a status code.
    Exited(i32),
    /// Terminated by a signal.
    Killed(i32),
    /// Terminated by a signal and dumped core.
    Dumped(i32),
    /// Stopped by a signal; the child is still alive.
    Stopped(i32),
    /// Resumed after a stop.
    Continued,
}

impl ExitInfo {
    /// True if the child is gone (and has been reaped).
    pub fn is_terminal(self) -> bool {
        matches!(self, ExitInfo::Exited(_) | ExitInfo::Killed(_) | ExitInfo::Dumped(_))
    }

    fn from_status(status: WaitStatus) -> Option<Self> {
        match status {
            WaitStatus::Exited(_, code) => Some(ExitInfo::Exited(code)),
            WaitStatus::Signaled(_, signal, true) => Some(ExitInfo::Dumped(signal as i32)),
            WaitStatus::Signaled(_, signal, false) => Some(ExitInfo::Killed(signal as i32)),
            WaitStatus::Stopped(_, signal) => Some(ExitInfo::Stopped(signal as i32)),
            WaitStatus::Continued(_) => Some(ExitInfo::Continued),
            _ => None,
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = |sig: i32| {
            Signal::try_from(sig)
                .map(|s| s.as_str().to_string())
                .unwrap_or_else(|_| sig.to_string())
        };
        match self {
            ExitInfo::Exited(code) => write!(f, "exited with {}", code),
            ExitInfo::Killed(sig) => write!(f, "killed by {}", name(*sig)),
            ExitInfo::Dumped(sig) => write!(f, "dumped core on {}", name(*sig)),
            ExitInfo::Stopped(sig) => write!(f, "stopped by {}", name(*sig)),
            ExitInfo::Continued => write!(f, "continued"),
        }
    }
}

/// Poll one child without blocking.
///
/// Returns `Ok(None)` while nothing happened. Stop / continue notifications are
/// reported too; callers that only care about termination should check
/// [`ExitInfo::is_terminal`] and keep polling otherwise.
pub fn try_reap(pid: u32) -> ProcessResult<Option<ExitInfo>> {
    let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
    loop {
        match waitpid(Pid::from_raw(pid as i32), Some(flags)) {
            Ok(WaitStatus::StillAlive) => return Ok(None),
            Ok(status) => return Ok(ExitInfo::from_status(status)),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(ProcessError::wait_failed(pid.to_string(), e.to_string())),
        }
    }
}

/// Block until the child terminates and reap it.
pub fn reap_blocking(pid: u32) -> ProcessResult<ExitInfo> {
    loop {
        match waitpid(Pid::from_raw(pid as i32), None) {
            Ok(status) => {
                if let Some(info) = ExitInfo::from_status(status).filter(|i| i.is_terminal()) {
                    return Ok(info);
                }
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(ProcessError::wait_failed(pid.to_string(), e.to_string())),
        }
    }
}
