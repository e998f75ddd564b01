//! # CAN Assure: Scripted CAN Test Vector Replay
//!
//! Drives a CAN network through a time-indexed sequence of signal values while
//! the device under test is polled for its resulting internal state, and
//! records both side by side.
//!
//! ## Architecture
//!
//! - **Heartbeat Transmitter**: Sends privileged and scripted frames on a fixed period
//! - **Device State Poller**: Dumps device properties into a shared snapshot
//! - **Replay Worker**: Applies each delay's values and captures the device's response
//! - **Result Sink**: Writes readbacks into the `Results` sheet, saved once per run
//! - **Cache Layer**: Memoized lookups shared by all of the above
//!
//! ## Configuration
//!
//! Bench configuration is a TOML file. Without `--config`, the binary uses the
//! platform data directory under `dev.canassure.can-assure`:
//!
//! - **Linux**: `~/.local/share/dev.canassure.can-assure/`
//! - **macOS**: `~/Library/Application Support/dev.canassure.can-assure/`
//! - **Windows**: `%APPDATA%\dev.canassure.can-assure\`
//!
//! ## Example
//!
//! ```ignore
//! use can_assure::{
//!     backend::{Engine, EngineParts},
//!     config::ConfigStore,
//! };
//! use std::sync::Arc;
//!
//! fn main() -> can_assure::Result<()> {
//!     let config = Arc::new(ConfigStore::load("bench.toml")?);
//!     let (engine, _telemetry) = Engine::new(EngineParts::from_config(config, false)?);
//!
//!     engine.start_background();
//!     engine.start_replay();
//!     if let Some(summary) = engine.wait_replay() {
//!         println!("{} cycles", summary.cycles_completed);
//!     }
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod shutdown;
pub mod types;

// Re-export commonly used types
pub use backend::{Engine, EngineParts, ReplaySummary, TelemetryEvent};
pub use config::{AppConfig, ConfigStore};
pub use error::{CanAssureError, Result};
pub use shutdown::{ShutdownCoordinator, ShutdownReason};
pub use types::{CanId, DeviceSnapshot, PropertyId, SnapshotValue};
