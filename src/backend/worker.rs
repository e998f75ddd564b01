//! Background worker thread handles
//!
//! Every long-lived loop in the engine runs on its own named thread and
//! observes a shared running flag. Sleeps are sliced into
//! [`STOP_CHECK_INTERVAL`] steps so a stop request is seen within 10 ms.

use crate::config::STOP_CHECK_INTERVAL;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Sleep for `duration` while `running` stays set
///
/// Returns `false` as soon as the flag is cleared.
pub fn sleep_while_running(running: &AtomicBool, duration: Duration) -> bool {
    sleep_until(running, Instant::now() + duration)
}

/// Sleep until `deadline` while `running` stays set
pub fn sleep_until(running: &AtomicBool, deadline: Instant) -> bool {
    loop {
        if !running.load(Ordering::SeqCst) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(STOP_CHECK_INTERVAL));
    }
}

/// Handle to a periodic background loop
pub struct WorkerHandle {
    name: String,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerHandle {
    /// Spawn `tick` every `interval` until stopped
    ///
    /// The first tick runs immediately.
    pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut(&AtomicBool) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let thread_name = name.to_string();

        let handle = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                tracing::info!("{} started", thread_name);
                while flag.load(Ordering::SeqCst) {
                    tick(&flag);
                    if !sleep_while_running(&flag, interval) {
                        break;
                    }
                }
                tracing::info!("{} stopped", thread_name);
            })
            .map_err(|e| tracing::error!("Failed to spawn {}: {}", name, e))
            .ok();

        if handle.is_none() {
            running.store(false, Ordering::SeqCst);
        }

        Self {
            name: name.to_string(),
            running,
            handle: Mutex::new(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Clear the running flag and join the thread
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("{} panicked", self.name);
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
