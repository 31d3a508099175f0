//! ChildProcessManager - spawn and reap authority.
//!
//! One dedicated thread reaps children. It parks on a small semaphore that is
//! posted both for "a new child exists" and for "please reset"; between posts it
//! sweeps every `reap_interval`.
//!
//! The reaper only waits on pids this manager spawned, so several managers can
//! coexist in one process without stealing each other's children.
//!
//! ## Reset
//!
//! [`ChildProcessManager::reset`] marks a reset in progress, force-kills every
//! tracked child, lets the reaper reap them all and acknowledge, then clears the
//! map. Children swept up by a reset receive [`ChildEvents::on_reset`] and never
//! `on_collected` / `on_finalized`. Children spawned while the reset is running
//! are killed as soon as they exist and are included in the same reset.

use parking_lot::{Condvar, Mutex};
use responder_common::{ProcessError, ProcessResult};
use responder_process::{force_kill, reap_blocking, spawn_process, try_reap, ExitInfo, SpawnSpec};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Default sweep period of the reaping thread.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle notifications for one child.
///
/// `on_executed` runs on the spawning thread while the manager's lock is held.
/// The other methods run on the reaping thread (or the resetting thread for
/// `on_reset`) without the manager's lock.
pub trait ChildEvents: Send + Sync {
    /// The spawn attempt finished; `Ok(pid)` on success.
    fn on_executed(&self, _result: Result<u32, &ProcessError>) {}

    /// The child terminated (exit, kill or core dump).
    fn on_collected(&self, _pid: u32, _info: ExitInfo) {}

    /// Called right after `on_collected`, once the child is untracked. Also
    /// called alone if the child can no longer be waited for.
    fn on_finalized(&self, _pid: u32) {}

    /// The child was killed and discarded by a global reset.
    fn on_reset(&self, _pid: u32) {}
}

struct TrackedChild {
    events: Arc<dyn ChildEvents>,
    killed: AtomicBool,
    /// Set once a reset-time wait consumed the exit status.
    reaped: bool,
}

impl TrackedChild {
    /// Send SIGKILL unless an earlier kill already did.
    fn kill_once(&self, pid: u32) {
        if !self.killed.swap(true, Ordering::SeqCst) {
            if let Err(e) = force_kill(pid) {
                debug!("Kill of PID {} failed (likely already gone): {}", pid, e);
            }
        }
    }
}

/// Counting semaphore the reaper parks on.
#[derive(Default)]
struct WakeSemaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl WakeSemaphore {
    fn post(&self) {
        *self.count.lock() += 1;
        self.cond.notify_one();
    }

    /// Wait for a post or the timeout, consuming all pending posts.
    fn wait_timeout(&self, timeout: Duration) {
        let mut count = self.count.lock();
        if *count == 0 {
            self.cond.wait_for(&mut count, timeout);
        }
        *count = 0;
    }
}

struct Shared {
    children: Mutex<HashMap<u32, TrackedChild>>,
    resetting: AtomicBool,
    wake: WakeSemaphore,
    /// Generation counter bumped by the reaper after each reset drain.
    reset_ack: Mutex<u64>,
    reset_cond: Condvar,
    /// Serializes concurrent `reset()` callers.
    reset_gate: Mutex<()>,
}

/// Spawns child processes and reaps them on a dedicated thread.
///
/// Cheap to clone; all clones share one child map and one reaping thread. The
/// thread exits once every clone has been dropped.
#[derive(Clone)]
pub struct ChildProcessManager {
    shared: Arc<Shared>,
}

impl ChildProcessManager {
    pub fn new() -> std::io::Result<Self> {
        Self::with_reap_interval(DEFAULT_REAP_INTERVAL)
    }

    pub fn with_reap_interval(reap_interval: Duration) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            children: Mutex::new(HashMap::new()),
            resetting: AtomicBool::new(false),
            wake: WakeSemaphore::default(),
            reset_ack: Mutex::new(0),
            reset_cond: Condvar::new(),
            reset_gate: Mutex::new(()),
        });

        let weak = Arc::downgrade(&shared);
        std::thread::Builder::new()
            .name("responder-reaper".to_string())
            .spawn(move || reaper_loop(weak, reap_interval))?;

        Ok(Self { shared })
    }

    /// Spawn one child.
    ///
    /// On success `events.on_executed(Ok(pid))` runs before this returns, still
    /// inside the spawn critical section. On failure `on_executed(Err(..))` runs
    /// and the error is returned as well.
    pub fn create(&self, spec: &SpawnSpec, events: Arc<dyn ChildEvents>) -> ProcessResult<u32> {
        let mut children = self.shared.children.lock();
        match spawn_process(spec) {
            Ok(pid) => {
                let child = TrackedChild {
                    events: Arc::clone(&events),
                    killed: AtomicBool::new(false),
                    reaped: false,
                };
                if self.shared.resetting.load(Ordering::SeqCst) {
                    warn!("Spawned PID {} during reset; killing it", pid);
                    child.kill_once(pid);
                }
                if children.insert(pid, child).is_some() {
                    // A tracked pid is never reaped behind our back, so it cannot be reused.
                    error!("PID {} was already tracked; replacing stale entry", pid);
                }
                events.on_executed(Ok(pid));
                drop(children);
                self.shared.wake.post();
                Ok(pid)
            }
            Err(e) => {
                warn!("Failed to spawn {}: {}", spec.program(), e);
                events.on_executed(Err(&e));
                Err(e)
            }
        }
    }

    /// Force-kill one tracked child. Returns `false` if the pid is not tracked.
    ///
    /// Idempotent: a child is signalled at most once, whether by this method or
    /// by a reset.
    pub fn kill(&self, pid: u32) -> bool {
        let children = self.shared.children.lock();
        match children.get(&pid) {
            Some(child) => {
                child.kill_once(pid);
                true
            }
            None => false,
        }
    }

    pub fn is_tracking(&self, pid: u32) -> bool {
        self.shared.children.lock().contains_key(&pid)
    }

    pub fn tracked_count(&self) -> usize {
        self.shared.children.lock().len()
    }

    /// Kill and discard every tracked child, blocking until they are reaped.
    ///
    /// Must not be called from a [`ChildEvents`] callback.
    pub fn reset(&self) {
        let _gate = self.shared.reset_gate.lock();
        {
            let children = self.shared.children.lock();
            self.shared.resetting.store(true, Ordering::SeqCst);
            for (pid, child) in children.iter() {
                child.kill_once(*pid);
            }
            info!("Resetting child process manager ({} children)", children.len());
        }

        let discarded = loop {
            let generation = *self.shared.reset_ack.lock();
            self.shared.wake.post();
            {
                let mut ack = self.shared.reset_ack.lock();
                while *ack == generation {
                    self.shared.reset_cond.wait(&mut ack);
                }
            }

            let mut children = self.shared.children.lock();
            if children.values().all(|c| c.reaped) {
                self.shared.resetting.store(false, Ordering::SeqCst);
                break children.drain().collect::<Vec<_>>();
            }
            // Something was spawned after the reaper's last pass; go again.
        };

        for (pid, child) in discarded {
            child.events.on_reset(pid);
        }
    }
}

fn reaper_loop(weak: Weak<Shared>, reap_interval: Duration) {
    debug!("Reaper thread started");
    loop {
        let Some(shared) = weak.upgrade() else {
            break;
        };
        shared.wake.wait_timeout(reap_interval);

        if shared.resetting.load(Ordering::SeqCst) {
            shared.drain_for_reset();
            continue;
        }
        shared.sweep();
    }
    debug!("Reaper thread exiting: manager dropped");
}

impl Shared {
    /// Reap every child that terminated and deliver its callbacks.
    fn sweep(&self) {
        let mut collected = Vec::new();
        {
            let mut children = self.children.lock();
            if self.resetting.load(Ordering::SeqCst) {
                return;
            }
            let pids: Vec<u32> = children.keys().copied().collect();
            for pid in pids {
                match try_reap(pid) {
                    Ok(Some(info)) if info.is_terminal() => {
                        if let Some(child) = children.remove(&pid) {
                            collected.push((pid, child.events, Some(info)));
                        }
                    }
                    Ok(Some(info)) => {
                        debug!("PID {} {}; still waiting", pid, info);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // Not waitable any more; finalize without an exit status.
                        error!("Lost track of PID {}: {}", pid, e);
                        if let Some(child) = children.remove(&pid) {
                            collected.push((pid, child.events, None));
                        }
                    }
                }
            }
        }

        for (pid, events, info) in collected {
            if let Some(info) = info {
                debug!("Collected PID {}: {}", pid, info);
                events.on_collected(pid, info);
            }
            events.on_finalized(pid);
        }
    }

    /// Kill and reap everything tracked, then acknowledge the reset.
    fn drain_for_reset(&self) {
        loop {
            let pending: Vec<u32> = {
                let children = self.children.lock();
                children
                    .iter()
                    .filter(|(_, c)| !c.reaped)
                    .map(|(pid, c)| {
                        c.kill_once(*pid);
                        *pid
                    })
                    .collect()
            };
            if pending.is_empty() {
                break;
            }
            for pid in pending {
                match reap_blocking(pid) {
                    Ok(info) => debug!("Reset reaped PID {}: {}", pid, info),
                    Err(e) => debug!("Reset could not reap PID {}: {}", pid, e),
                }
                if let Some(child) = self.children.lock().get_mut(&pid) {
                    child.reaped = true;
                }
            }
        }

        let mut ack = self.reset_ack.lock();
        *ack += 1;
        self.reset_cond.notify_all();
    }
}
