//! Process execution primitives.
//!
//! This module spawns detached children whose exit is collected later by the
//! supervisor's reaping thread (see [`crate::wait`]). The `std::process::Child`
//! handle is dropped right after spawning; dropping it neither waits nor kills.

use responder_common::{ProcessError, ProcessResult, SpawnFailure};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::debug;

/// Everything needed to start one child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnSpec {
    /// `argv[0]` is the executable, resolved through `PATH` if it has no slash.
    pub argv: Vec<String>,
    /// Variables added to (or overriding) the inherited environment.
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

impl SpawnSpec {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            ..Default::default()
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Executable name, for log and error messages.
    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }
}

/// Spawn a process and return its pid.
///
/// A missing executable is reported as [`SpawnFailure::NotFound`]; every other
/// failure (bad working directory, permission, exec error) as
/// [`SpawnFailure::Exec`].
pub fn spawn_process(spec: &SpawnSpec) -> ProcessResult<u32> {
    let program = spec.program();
    if program.is_empty() {
        return Err(ProcessError::spawn_failed("", SpawnFailure::Exec, "empty command line"));
    }

    // chdir failures surface as ENOENT too; check first so they are not
    // mistaken for a missing executable.
    if let Some(dir) = &spec.working_dir {
        if !dir.is_dir() {
            return Err(ProcessError::spawn_failed(
                program,
                SpawnFailure::Exec,
                format!("working directory not found: {}", dir.display()),
            ));
        }
    }

    let mut cmd = Command::new(program);
    cmd.args(&spec.argv[1..]).stdin(Stdio::null());
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    match cmd.spawn() {
        Ok(child) => {
            let pid = child.id();
            debug!("Spawned {} (PID: {})", program, pid);
            Ok(pid)
        }
        Err(e) => {
            let kind = if e.kind() == ErrorKind::NotFound {
                SpawnFailure::NotFound
            } else {
                SpawnFailure::Exec
            };
            Err(ProcessError::spawn_failed(program, kind, e.to_string()))
        }
    }
}
