//! Telemetry channel for observers of the engine
//!
//! The engine publishes TX, RX and link events into a bounded channel. Publishing
//! never blocks a real-time loop: when the channel is full the oldest event is
//! dropped to make room.

use crate::types::{DeviceSnapshot, LinkState, SignalValues};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default telemetry channel capacity
pub const DEFAULT_TELEMETRY_CAPACITY: usize = 1024;

/// An event emitted by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    /// Scripted values applied for a delay
    Tx {
        delay_ms: u64,
        values: SignalValues,
    },
    /// Device state captured for a delay
    Rx {
        delay_ms: u64,
        snapshot: DeviceSnapshot,
    },
    /// Bus interface changed state
    LinkStatus { interface: String, state: LinkState },
}

/// A timestamped telemetry event
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    /// Wall clock time of publication
    pub timestamp: DateTime<Utc>,
    /// The event
    pub event: TelemetryEvent,
}

/// Publishing side of the telemetry channel
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    tx: Sender<Telemetry>,
    /// Receiver clone used only to evict the oldest event
    evict: Receiver<Telemetry>,
    dropped: Arc<AtomicU64>,
}

/// Observer side of the telemetry channel
#[derive(Debug)]
pub struct TelemetryReceiver {
    rx: Receiver<Telemetry>,
    dropped: Arc<AtomicU64>,
}

/// Create a telemetry channel with the given capacity
pub fn telemetry_channel(capacity: usize) -> (TelemetrySink, TelemetryReceiver) {
    let (tx, rx) = bounded(capacity.max(1));
    let dropped = Arc::new(AtomicU64::new(0));
    (
        TelemetrySink {
            tx,
            evict: rx.clone(),
            dropped: dropped.clone(),
        },
        TelemetryReceiver { rx, dropped },
    )
}

impl TelemetrySink {
    /// Publish an event, dropping the oldest one if the channel is full
    pub fn publish(&self, event: TelemetryEvent) {
        let mut item = Telemetry {
            timestamp: Utc::now(),
            event,
        };

        loop {
            match self.tx.try_send(item) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    if self.evict.try_recv().is_ok() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                    item = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Number of events dropped so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TelemetryReceiver {
    /// Try to receive an event without blocking
    pub fn try_recv(&self) -> Option<Telemetry> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next event
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Telemetry> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drain every pending event
    pub fn drain(&self) -> impl Iterator<Item = Telemetry> + '_ {
        std::iter::from_fn(move || self.try_recv())
    }

    /// Number of events dropped because the observer fell behind
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
