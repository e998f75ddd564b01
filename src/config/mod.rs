//! Configuration module for CAN Assure
//!
//! This module handles the persisted configuration of a test bench:
//! - The delay list and heartbeat set used by the replay
//! - Paths to the catalog, vector workbook and property header
//! - Bus interface, device bridge command and timing settings
//!
//! # Snapshots
//!
//! Configuration is loaded into immutable [`ConfigSnapshot`] values tagged
//! with a version number. Readers hold an `Arc` to the snapshot they loaded;
//! a reload or update publishes a new snapshot without touching the old one.
//! [`ConfigStore::reload_if_changed`] only reports edits made by someone else:
//! writes made through [`ConfigStore::update`] are remembered and ignored.
//!
//! # App Data Location
//!
//! The default configuration and log files live in the platform data
//! directory under `dev.canassure.can-assure`:
//!
//! - **Linux**: `~/.local/share/dev.canassure.can-assure/`
//! - **macOS**: `~/Library/Application Support/dev.canassure.can-assure/`
//! - **Windows**: `%APPDATA%\dev.canassure.can-assure\`
//!
//! # Example
//!
//! ```ignore
//! use can_assure::config::ConfigStore;
//!
//! let store = ConfigStore::load("bench.toml")?;
//! let snapshot = store.snapshot();
//! println!("{} delays", snapshot.config.delays.len());
//!
//! store.update(|cfg| cfg.delays = vec![1000, 2000])?;
//! ```

pub mod settings;

pub use settings::*;

use crate::error::{CanAssureError, Result};
use crate::types::{CanId, HeartbeatEntry, ValueKind};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::SystemTime;

/// Application identifier for data directories
pub const APP_ID: &str = "dev.canassure.can-assure";

/// Default configuration filename
pub const CONFIG_FILE: &str = "config.toml";

/// Default bus bitrate
pub const DEFAULT_BITRATE: u32 = 500_000;

/// Interface name that requests auto-detection
pub const AUTO_INTERFACE: &str = "auto";

// ==================== App Data Directory ====================

/// Get the application data directory path
pub fn app_data_dir() -> Option<PathBuf> {
    dirs_next::data_dir().map(|p| p.join(APP_ID))
}

/// Ensure the app data directory exists
pub fn ensure_app_data_dir() -> Result<PathBuf> {
    let dir = app_data_dir().ok_or_else(|| {
        CanAssureError::Config("Could not determine app data directory".to_string())
    })?;

    if !dir.exists() {
        std::fs::create_dir_all(&dir).map_err(|e| {
            CanAssureError::Config(format!("Failed to create app data directory: {}", e))
        })?;
    }

    Ok(dir)
}

/// Get the path to the default configuration file
pub fn default_config_path() -> Option<PathBuf> {
    app_data_dir().map(|p| p.join(CONFIG_FILE))
}

// ==================== App Config ====================

/// Persisted configuration of a test bench
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Schedule points in milliseconds, absolute offsets from the run start
    #[serde(default)]
    pub delays: Vec<u64>,

    /// Frames sent every transmitter period
    #[serde(default)]
    pub heartbeat: Vec<HeartbeatEntry>,

    /// Frame/signal catalog (JSON)
    #[serde(default = "default_catalog_path")]
    pub catalog_path: PathBuf,

    /// Test vector workbook (JSON)
    #[serde(default = "default_vector_path")]
    pub vector_path: PathBuf,

    /// Optional property header listing `Message__Signal_RX_V = id` lines
    #[serde(default)]
    pub property_header_path: Option<PathBuf>,

    /// Property id → value kind overrides
    #[serde(default)]
    pub property_kinds: BTreeMap<String, ValueKind>,

    /// Property reporting the vehicle drive mode
    #[serde(default)]
    pub drive_mode_property: Option<String>,

    /// Bus interface configuration
    #[serde(default)]
    pub bus: BusConfig,

    /// Device bridge command configuration
    #[serde(default)]
    pub device: DeviceConfig,

    /// Timing knobs
    #[serde(default)]
    pub timing: TimingSettings,
}

fn default_catalog_path() -> PathBuf {
    PathBuf::from("catalog.json")
}

fn default_vector_path() -> PathBuf {
    PathBuf::from("vector.json")
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            delays: Vec::new(),
            heartbeat: Vec::new(),
            catalog_path: default_catalog_path(),
            vector_path: default_vector_path(),
            property_header_path: None,
            property_kinds: BTreeMap::new(),
            drive_mode_property: None,
            bus: BusConfig::default(),
            device: DeviceConfig::default(),
            timing: TimingSettings::default(),
        }
    }
}

impl AppConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CanAssureError::Config(format!("Failed to read config {:?}: {}", path, e))
        })?;

        toml::from_str(&content).map_err(|e| {
            CanAssureError::Config(format!("Failed to parse config {:?}: {}", path, e))
        })
    }

    /// Save the configuration, replacing the file atomically
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| CanAssureError::Config(format!("Failed to serialize config: {}", e)))?;
        write_atomically(path, content.as_bytes())
            .map_err(|e| CanAssureError::Config(format!("Failed to write config {:?}: {}", path, e)))
    }

    /// Value kind override for a property id, if configured
    pub fn kind_override(&self, property: &crate::types::PropertyId) -> Option<ValueKind> {
        self.property_kinds.iter().find_map(|(raw, kind)| {
            crate::types::PropertyId::new(raw)
                .filter(|id| id == property)
                .map(|_| *kind)
        })
    }

    /// Resolve relative paths against the directory holding the config file
    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.catalog_path);
        resolve(&mut self.vector_path);
        if let Some(header) = self.property_header_path.as_mut() {
            resolve(header);
        }
    }

    /// Create a sample configuration with an example heartbeat frame
    pub fn sample() -> Self {
        Self {
            delays: vec![1000, 2000, 3000],
            heartbeat: vec![HeartbeatEntry::new("VCU_Status", Some(CanId(0x12D)))
                .with_signal("VCU_Ready", 1.0)
                .with_signal("VCU_Alive_Counter", 0.0)],
            drive_mode_property: Some("0x21400106".to_string()),
            ..Self::default()
        }
    }
}

// ==================== Bus Config ====================

/// CAN interface configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Interface name (e.g. `can0`) or `auto` to pick the first CAN interface
    pub interface: String,

    /// Bitrate applied when bringing the interface up
    pub bitrate: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            interface: "can0".to_string(),
            bitrate: DEFAULT_BITRATE,
        }
    }
}

// ==================== Device Config ====================

/// Command used to reach the device under test
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Bridge executable
    pub program: String,

    /// Arguments listing connected devices
    pub devices_args: Vec<String>,

    /// Arguments dumping every property value
    pub dump_args: Vec<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            program: "adb".to_string(),
            devices_args: vec!["devices".to_string()],
            dump_args: ["shell", "dumpsys", "car_service", "get-property-value"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

// ==================== Config Store ====================

/// An immutable, versioned view of the configuration
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    /// Monotonic version, bumped on every publish
    pub version: u64,
    /// The configuration itself
    pub config: AppConfig,
}

/// Owner of the current configuration snapshot
#[derive(Debug)]
pub struct ConfigStore {
    path: Option<PathBuf>,
    current: RwLock<Arc<ConfigSnapshot>>,
    /// Modification time of the last version we loaded or wrote ourselves
    seen_modified: Mutex<Option<SystemTime>>,
    /// Serializes writers so file and snapshot stay in step
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// Load configuration from a file
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = AppConfig::load(&path)?;
        let modified = modified_time(&path);

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(Self {
            path: Some(path),
            current: RwLock::new(Arc::new(ConfigSnapshot { version: 1, config })),
            seen_modified: Mutex::new(modified),
            write_lock: Mutex::new(()),
        })
    }

    /// Keep configuration in memory only
    pub fn in_memory(config: AppConfig) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(ConfigSnapshot { version: 1, config })),
            seen_modified: Mutex::new(None),
            write_lock: Mutex::new(()),
        }
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<ConfigSnapshot> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Current version
    pub fn version(&self) -> u64 {
        self.snapshot().version
    }

    /// Re-read the backing file and publish it
    pub fn reload(&self) -> Result<Arc<ConfigSnapshot>> {
        let Some(path) = self.path.as_deref() else {
            return Ok(self.snapshot());
        };

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.load_locked(path)
    }

    /// Reload only if the file was modified by someone else
    ///
    /// The modification time is compared under the write lock, so a write
    /// from [`ConfigStore::update`] that is still recording its own time is
    /// never mistaken for an external edit.
    pub fn reload_if_changed(&self) -> Result<Option<Arc<ConfigSnapshot>>> {
        let Some(path) = self.path.as_deref() else {
            return Ok(None);
        };
        if !self.changed_externally(path) {
            return Ok(None);
        }

        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.changed_externally(path) {
            return Ok(None);
        }
        tracing::debug!("Configuration file {:?} changed, reloading", path);
        self.load_locked(path).map(Some)
    }

    fn changed_externally(&self, path: &Path) -> bool {
        let modified = modified_time(path);
        let seen = *self
            .seen_modified
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        modified.is_some() && modified != seen
    }

    /// Load and publish; the caller holds `write_lock`
    fn load_locked(&self, path: &Path) -> Result<Arc<ConfigSnapshot>> {
        let config = AppConfig::load(path)?;
        *self
            .seen_modified
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = modified_time(path);
        Ok(self.publish(config))
    }

    /// Apply a change, publish it and write it back to the file
    pub fn update<F>(&self, change: F) -> Result<Arc<ConfigSnapshot>>
    where
        F: FnOnce(&mut AppConfig),
    {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut config = self.snapshot().config.clone();
        change(&mut config);

        if let Some(path) = self.path.as_deref() {
            config.save(path)?;
            *self
                .seen_modified
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = modified_time(path);
        }

        Ok(self.publish(config))
    }

    fn publish(&self, config: AppConfig) -> Arc<ConfigSnapshot> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let next = Arc::new(ConfigSnapshot {
            version: current.version + 1,
            config,
        });
        *current = next.clone();
        next
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Write a file through a sibling temp file and rename
pub(crate) fn write_atomically(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, content)?;
    std::fs::rename(&tmp, path)
}

// ==================== Heartbeat Persister ====================

/// Background writer for heartbeat state
///
/// Submitting never blocks: a pending write that has not started yet is
/// replaced by the newer one.
pub struct HeartbeatPersister {
    sender: Mutex<Option<Sender<Vec<HeartbeatEntry>>>>,
    overflow: Receiver<Vec<HeartbeatEntry>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl HeartbeatPersister {
    /// Spawn the writer thread
    pub fn spawn(store: Arc<ConfigStore>) -> Self {
        let (tx, rx) = bounded::<Vec<HeartbeatEntry>>(1);
        let overflow = rx.clone();

        let handle = std::thread::Builder::new()
            .name("heartbeat-persist".to_string())
            .spawn(move || {
                for entries in rx.iter() {
                    if let Err(e) = store.update(|cfg| cfg.heartbeat = entries) {
                        tracing::warn!("Failed to persist heartbeat state: {}", e);
                    }
                }
                tracing::debug!("Heartbeat persister stopped");
            })
            .map_err(|e| tracing::error!("Failed to spawn heartbeat persister: {}", e))
            .ok();

        Self {
            sender: Mutex::new(Some(tx)),
            overflow,
            handle: Mutex::new(handle),
        }
    }

    /// Queue the latest heartbeat state for writing
    pub fn submit(&self, entries: Vec<HeartbeatEntry>) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = sender.as_ref() else {
            return;
        };

        match tx.try_send(entries) {
            Ok(()) => {}
            Err(TrySendError::Full(entries)) => {
                let _ = self.overflow.try_recv();
                let _ = tx.try_send(entries);
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Flush pending writes and stop the thread
    pub fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for HeartbeatPersister {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ==================== Tests ====================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PropertyId;

    #[test]
    fn test_config_roundtrip_toml() {
        let config = AppConfig::sample();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let parsed: AppConfig = toml::from_str("delays = [1000, 2000]").unwrap();
        assert_eq!(parsed.delays, vec![1000, 2000]);
        assert_eq!(parsed.bus.interface, "can0");
        assert_eq!(parsed.device.program, "adb");
        assert_eq!(parsed.timing.transmit_period_ms, 80);
    }

    #[test]
    fn test_kind_override_normalizes_ids() {
        let mut config = AppConfig::default();
        config
            .property_kinds
            .insert("0x21608350".to_string(), ValueKind::Int32);

        let id = PropertyId::new("21608350").unwrap();
        assert_eq!(config.kind_override(&id), Some(ValueKind::Int32));
        let other = PropertyId::new("1").unwrap();
        assert_eq!(config.kind_override(&other), None);
    }

    #[test]
    fn test_update_publishes_new_version() {
        let store = ConfigStore::in_memory(AppConfig::default());
        let before = store.snapshot();
        let after = store.update(|cfg| cfg.delays = vec![5]).unwrap();

        assert_eq!(after.version, before.version + 1);
        assert!(before.config.delays.is_empty());
        assert_eq!(store.snapshot().config.delays, vec![5]);
    }

    #[test]
    fn test_own_writes_do_not_trigger_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        AppConfig::sample().save(&path).unwrap();

        let store = ConfigStore::load(&path).unwrap();
        store.update(|cfg| cfg.delays = vec![10, 20]).unwrap();

        assert!(store.reload_if_changed().unwrap().is_none());
        assert_eq!(AppConfig::load(&path).unwrap().delays, vec![10, 20]);
    }

    #[test]
    fn test_concurrent_own_writes_never_reload() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        AppConfig::sample().save(&path).unwrap();
        let store = ConfigStore::load(&path).unwrap();
        let writing = AtomicBool::new(true);

        let reloads = std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..200u64 {
                    store.update(|cfg| cfg.delays = vec![i]).unwrap();
                }
                writing.store(false, Ordering::SeqCst);
            });

            let mut reloads = 0;
            while writing.load(Ordering::SeqCst) {
                if store.reload_if_changed().unwrap().is_some() {
                    reloads += 1;
                }
            }
            reloads
        });

        assert_eq!(reloads, 0);
        assert!(store.reload_if_changed().unwrap().is_none());
        assert_eq!(store.snapshot().config.delays, vec![199]);
    }

    #[test]
    fn test_resolve_paths() {
        let mut config = AppConfig::default();
        config.property_header_path = Some(PathBuf::from("types.h"));
        config.resolve_paths(Path::new("/bench"));
        assert_eq!(config.catalog_path, PathBuf::from("/bench/catalog.json"));
        assert_eq!(config.vector_path, PathBuf::from("/bench/vector.json"));
        assert_eq!(
            config.property_header_path,
            Some(PathBuf::from("/bench/types.h"))
        );
    }

    #[test]
    fn test_persister_writes_latest_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        AppConfig::sample().save(&path).unwrap();
        let store = Arc::new(ConfigStore::load(&path).unwrap());

        let persister = HeartbeatPersister::spawn(store.clone());
        let entry = HeartbeatEntry::new("VCU_Status", Some(CanId(0x12D))).with_signal("VCU_Ready", 0.0);
        persister.submit(vec![entry.clone()]);
        persister.shutdown();

        assert_eq!(store.snapshot().config.heartbeat, vec![entry.clone()]);
        assert_eq!(AppConfig::load(&path).unwrap().heartbeat, vec![entry]);
    }
}
