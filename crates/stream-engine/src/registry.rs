use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A process group leader spawned on behalf of a stream, tracked by pid only.
/// The registry never owns the `Child` handle itself (the orchestrator does,
/// so it can `wait()` on it); it only needs the pid to signal the group.
#[derive(Clone, Copy)]
struct Handle {
    pid: i32,
}

struct Inner {
    by_stream: HashMap<String, Vec<Handle>>,
}

/// Tracks external child processes per stream and terminates them on demand.
pub struct ProcessRegistry {
    inner: Mutex<Inner>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { by_stream: HashMap::new() }),
        }
    }

    pub fn register(&self, stream_id: &str, pid: i32) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        inner.by_stream.entry(stream_id.to_string()).or_default().push(Handle { pid });
    }

    /// Removes one pid from a stream's handle list, e.g. once the orchestrator
    /// has observed that process exit naturally. A no-op if already removed.
    pub fn deregister(&self, stream_id: &str, pid: i32) {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        if let Some(handles) = inner.by_stream.get_mut(stream_id) {
            handles.retain(|h| h.pid != pid);
            if handles.is_empty() {
                inner.by_stream.remove(stream_id);
            }
        }
    }

    fn take(&self, stream_id: &str) -> Vec<Handle> {
        let mut inner = self.inner.lock().expect("registry mutex poisoned");
        inner.by_stream.remove(stream_id).unwrap_or_default()
    }

    /// Stops every process registered for a stream: SIGTERM to the process
    /// group, a bounded wait, then SIGKILL on expiry. Cancellation-aware: if
    /// `cancel` fires first, skips straight to a forceful kill. The whole
    /// operation is capped at `CLEANUP_DEADLINE`; handles still alive past it
    /// are abandoned (left for the OS to reap once their parent exits).
    pub async fn cleanup_stream(&self, stream_id: &str, cancel: &CancellationToken) {
        let handles = self.take(stream_id);
        if handles.is_empty() {
            return;
        }
        let swept = tokio::time::timeout(CLEANUP_DEADLINE, async {
            for handle in handles {
                terminate(stream_id, handle.pid, cancel).await;
            }
        })
        .await;
        if swept.is_err() {
            warn!(stream_id, "cleanup did not finish within the cleanup deadline");
        }
    }

    /// Stops every process currently tracked, across all streams, capped at
    /// `CLEANUP_DEADLINE` overall.
    pub async fn cleanup_all(&self, cancel: &CancellationToken) {
        let ids: Vec<String> = {
            let inner = self.inner.lock().expect("registry mutex poisoned");
            inner.by_stream.keys().cloned().collect()
        };
        let swept = tokio::time::timeout(CLEANUP_DEADLINE, async {
            for id in ids {
                self.cleanup_stream(&id, cancel).await;
            }
        })
        .await;
        if swept.is_err() {
            warn!("cleanup_all did not finish within the cleanup deadline");
        }
    }
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

const SIGTERM_WAIT: Duration = Duration::from_secs(2);
const SIGKILL_WAIT: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const CLEANUP_DEADLINE: Duration = Duration::from_secs(3);

async fn terminate(stream_id: &str, pid: i32, cancel: &CancellationToken) {
    send_signal(pid, libc::SIGTERM);

    let graceful = tokio::select! {
        exited = wait_until_gone(pid, SIGTERM_WAIT) => exited,
        _ = cancel.cancelled() => false,
    };

    if graceful {
        info!(stream_id, pid, "process exited after SIGTERM");
        return;
    }

    send_signal(pid, libc::SIGKILL);
    let killed = wait_until_gone(pid, SIGKILL_WAIT).await;
    if killed {
        warn!(stream_id, pid, "process required SIGKILL to exit");
    } else {
        warn!(stream_id, pid, "process did not exit after SIGKILL within budget");
    }
}

/// Sends `signal` to the process group led by `pid` (negated pid), so that
/// helper processes spawned by a transcoder are reached too.
fn send_signal(pid: i32, signal: i32) {
    // SAFETY: kill() with a negative pid targets the process group; this is
    // a plain signal-send syscall with no memory-safety implications.
    unsafe {
        libc::kill(-pid, signal);
    }
}

/// Polls `kill(pid, 0)` until the process is gone or `budget` elapses.
async fn wait_until_gone(pid: i32, budget: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + budget;
    loop {
        if !process_exists(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

fn process_exists(pid: i32) -> bool {
    // SAFETY: signal 0 performs no action beyond existence/permission checks.
    let result = unsafe { libc::kill(pid, 0) };
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cleanup_of_unknown_stream_is_a_noop() {
        let registry = ProcessRegistry::new();
        let cancel = CancellationToken::new();
        registry.cleanup_stream("nope", &cancel).await;
    }

    #[tokio::test]
    async fn register_then_deregister_empties_the_stream_entry() {
        let registry = ProcessRegistry::new();
        registry.register("s1", 999_999);
        registry.deregister("s1", 999_999);
        let handles = registry.take("s1");
        assert!(handles.is_empty());
    }

    #[test]
    fn process_exists_is_false_for_a_pid_unlikely_to_be_alive() {
        assert!(!process_exists(i32::MAX - 1));
    }

    #[tokio::test]
    async fn cleanup_stream_is_wrapped_in_the_deadline_timeout() {
        // A pid already gone exits the sweep well under the deadline; this
        // guards against the timeout wrapper itself adding latency to the
        // common case.
        let registry = ProcessRegistry::new();
        registry.register("s1", i32::MAX - 2);

        let start = tokio::time::Instant::now();
        let cancel = CancellationToken::new();
        registry.cleanup_stream("s1", &cancel).await;
        assert!(tokio::time::Instant::now() - start < CLEANUP_DEADLINE);
    }
}
