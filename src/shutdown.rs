//! Signal-driven shutdown
//!
//! A [`ShutdownCoordinator`] turns `SIGINT`/`SIGTERM` into a graceful
//! shutdown request that the run loop polls. The engine then stops the
//! replay (which saves its results) and restores the heartbeat baseline.
//! A second `SIGINT` within [`FORCE_EXIT_WINDOW`] asks for an immediate exit.

use crate::error::{CanAssureError, Result};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(not(unix))]
const SIGINT: i32 = 2;
#[cfg(not(unix))]
const SIGTERM: i32 = 15;

/// Time window where a second `SIGINT` forces immediate exit
pub const FORCE_EXIT_WINDOW: Duration = Duration::from_secs(3);
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Exit code used after a forced exit
pub const FORCE_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    ForceExit,
}

impl ShutdownState {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::ShuttingDown => 1,
            Self::ForceExit => 2,
        }
    }

    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Running,
            1 => Self::ShuttingDown,
            _ => Self::ForceExit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(i32),
    UserRequest,
}

#[cfg(unix)]
type SignalHandle = signal_hook::iterator::Handle;
#[cfg(not(unix))]
struct SignalHandle;

#[cfg(not(unix))]
impl SignalHandle {
    fn close(self) {}
}

pub struct ShutdownCoordinator {
    state: AtomicU8,
    reason: Mutex<Option<ShutdownReason>>,
    first_sigint_at: Mutex<Option<Instant>>,
    registered: AtomicBool,
    signal_handle: Mutex<Option<SignalHandle>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ShutdownState::Running.as_u8()),
            reason: Mutex::new(None),
            first_sigint_at: Mutex::new(None),
            registered: AtomicBool::new(false),
            signal_handle: Mutex::new(None),
            listener: Mutex::new(None),
        }
    }

    /// Route `SIGINT` and `SIGTERM` to this coordinator
    ///
    /// Calling this again while registered does nothing.
    pub fn register_signals(self: &Arc<Self>) -> Result<()> {
        if self
            .registered
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(());
        }

        #[cfg(not(unix))]
        tracing::warn!("Signal listener not supported on this platform");

        #[cfg(unix)]
        {
            let mut signals = signal_hook::iterator::Signals::new([SIGINT, SIGTERM]).map_err(|e| {
                self.registered.store(false, Ordering::Release);
                CanAssureError::Io(e)
            })?;
            let handle = signals.handle();

            let coordinator = Arc::clone(self);
            let listener = std::thread::Builder::new()
                .name("signal-listener".into())
                .spawn(move || {
                    for signal in signals.forever() {
                        coordinator.handle_signal(signal);
                    }
                    tracing::debug!("Signal listener exiting");
                })
                .map_err(|e| {
                    self.registered.store(false, Ordering::Release);
                    CanAssureError::Io(e)
                })?;

            *self.signal_handle.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            *self.listener.lock().unwrap_or_else(PoisonError::into_inner) = Some(listener);
        }

        Ok(())
    }

    /// Close the signal iterator and join the listener thread
    pub fn stop_signal_listener(&self) {
        let handle = self
            .signal_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.close();
        }

        let listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(listener) = listener {
            if listener.join().is_err() {
                tracing::warn!("Signal listener thread panicked");
            }
        }
        self.registered.store(false, Ordering::Release);
    }

    /// Ask for a graceful shutdown; only the first request is recorded
    pub fn request_shutdown(&self, reason: ShutdownReason) {
        if self
            .state
            .compare_exchange(
                ShutdownState::Running.as_u8(),
                ShutdownState::ShuttingDown.as_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            *self.reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);
            tracing::info!(?reason, "Shutdown requested");
        }
    }

    pub fn state(&self) -> ShutdownState {
        ShutdownState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() != ShutdownState::Running
    }

    pub fn is_force_exit(&self) -> bool {
        self.state() == ShutdownState::ForceExit
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Block until a shutdown is requested
    pub fn wait_for_shutdown(&self) -> Option<ShutdownReason> {
        while !self.is_shutting_down() {
            std::thread::sleep(WAIT_POLL_INTERVAL);
        }
        self.reason()
    }

    fn handle_signal(&self, signal: i32) {
        match signal {
            SIGINT => self.handle_sigint(),
            SIGTERM => {
                self.request_shutdown(ShutdownReason::Signal(SIGTERM));
                tracing::info!("Received SIGTERM, stopping");
            }
            _ => tracing::debug!(signal, "Ignoring signal"),
        }
    }

    fn handle_sigint(&self) {
        let now = Instant::now();
        let mut first = self
            .first_sigint_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match self.state() {
            ShutdownState::Running => {
                *first = Some(now);
                self.request_shutdown(ShutdownReason::Signal(SIGINT));
                tracing::info!("Received SIGINT, stopping (press Ctrl+C again to force)");
            }
            ShutdownState::ShuttingDown => {
                if first.is_some_and(|at| now.saturating_duration_since(at) <= FORCE_EXIT_WINDOW) {
                    self.state
                        .store(ShutdownState::ForceExit.as_u8(), Ordering::Release);
                    tracing::warn!("Second SIGINT, forcing exit");
                } else {
                    *first = Some(now);
                }
            }
            ShutdownState::ForceExit => {}
        }
    }
}

impl Drop for ShutdownCoordinator {
    fn drop(&mut self) {
        self.stop_signal_listener();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_first_sigint_requests_graceful_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        assert!(!coordinator.is_shutting_down());

        coordinator.handle_signal(SIGINT);
        assert_eq!(coordinator.state(), ShutdownState::ShuttingDown);
        assert_eq!(coordinator.reason(), Some(ShutdownReason::Signal(SIGINT)));
        assert!(!coordinator.is_force_exit());
    }

    #[test]
    fn test_second_sigint_within_window_forces_exit() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.handle_signal(SIGINT);
        coordinator.handle_signal(SIGINT);
        assert!(coordinator.is_force_exit());
    }

    #[test]
    fn test_sigterm_never_forces_exit() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.handle_signal(SIGTERM);
        coordinator.handle_signal(SIGTERM);
        assert_eq!(coordinator.state(), ShutdownState::ShuttingDown);
        assert_eq!(coordinator.reason(), Some(ShutdownReason::Signal(SIGTERM)));
    }

    #[test]
    fn test_first_reason_wins() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.request_shutdown(ShutdownReason::UserRequest);
        coordinator.handle_signal(SIGTERM);
        assert_eq!(coordinator.reason(), Some(ShutdownReason::UserRequest));
    }

    #[test]
    fn test_wait_for_shutdown_returns_requested_reason() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        let trigger = coordinator.clone();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            trigger.request_shutdown(ShutdownReason::UserRequest);
        });

        assert_eq!(coordinator.wait_for_shutdown(), Some(ShutdownReason::UserRequest));
        worker.join().unwrap();
    }

    #[cfg(unix)]
    #[test]
    #[serial]
    fn test_delivered_sigterm_reaches_coordinator() {
        let coordinator = Arc::new(ShutdownCoordinator::new());
        coordinator.register_signals().unwrap();
        coordinator.register_signals().unwrap();

        // SAFETY: raising a signal the listener has a handler for
        unsafe {
            libc::raise(libc::SIGTERM);
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while !coordinator.is_shutting_down() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(coordinator.reason(), Some(ShutdownReason::Signal(SIGTERM)));

        coordinator.stop_signal_listener();
    }
}
