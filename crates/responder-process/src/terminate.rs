//! Process termination primitives.

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use responder_common::{ProcessError, ProcessResult};

/// Force kill a process (SIGKILL).
pub fn force_kill(pid: u32) -> ProcessResult<()> {
    send_signal(pid, Signal::SIGKILL)
}

fn send_signal(pid: u32, signal: Signal) -> ProcessResult<()> {
    if pid == 0 {
        // kill(0, ..) would signal our whole process group.
        return Err(ProcessError::stop_failed("0", "refusing to signal pid 0"));
    }
    kill(Pid::from_raw(pid as i32), signal)
        .map_err(|e| ProcessError::stop_failed(pid.to_string(), e.to_string()))
}
