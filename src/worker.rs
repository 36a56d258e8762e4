//! Named background threads with bounded shutdown

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Collaborator hook invoked when peers or the pending offer change
pub type ChangeCallback = Arc<dyn Fn() + Send + Sync>;

/// How long a cooperative stop waits for one loop to exit
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Spawn a named thread
pub fn spawn<F, T>(name: &str, f: F) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    thread::Builder::new().name(name.to_string()).spawn(f)
}

/// Join `handle`, giving up after `timeout`
///
/// A thread that has not finished by the deadline is left detached and
/// `None` is returned; so is the result of a thread that panicked.
pub fn join_bounded<T>(handle: JoinHandle<T>, timeout: Duration) -> Option<T> {
    let name = handle.thread().name().unwrap_or("unnamed").to_string();
    let deadline = Instant::now() + timeout;

    while !handle.is_finished() {
        if Instant::now() >= deadline {
            tracing::warn!("Thread {} did not stop within {:?}, detaching", name, timeout);
            return None;
        }
        thread::sleep(Duration::from_millis(5));
    }

    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::error!("Thread {} panicked", name);
            None
        }
    }
}

/// Invoke a change callback from inside a loop
///
/// A panicking callback is logged and otherwise ignored.
pub fn notify(callback: Option<&ChangeCallback>) {
    if let Some(callback) = callback {
        if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
            tracing::warn!("Change callback panicked");
        }
    }
}
