//! CAN bus access
//!
//! The bus is a single-writer frame sink. Every sender in the process goes
//! through one [`SharedBus`] so frames from different threads never
//! interleave inside a send.
//!
//! - [`SocketCanBus`] writes raw frames to a Linux SocketCAN interface
//! - [`RecordingBus`] keeps sent frames in memory (dry runs and tests)
//! - [`ReopeningBus`] opens its interface on first use and again after the
//!   interface goes away

use crate::error::{CanAssureError, Result};
use crate::types::CanId;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

/// Maximum classic CAN payload
pub const MAX_DLC: usize = 8;

/// A classic CAN data frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    pub id: CanId,
    pub extended: bool,
    pub data: Vec<u8>,
}

impl CanFrame {
    /// Create a frame, using the extended format when the id needs it
    pub fn new(id: CanId, data: Vec<u8>) -> Self {
        Self {
            id,
            extended: id.requires_extended(),
            data,
        }
    }

    /// Force the extended format
    pub fn with_extended(mut self, extended: bool) -> Self {
        self.extended = extended || self.id.requires_extended();
        self
    }
}

/// A frame sink
#[cfg_attr(test, mockall::automock)]
pub trait CanBus: Send {
    /// Transmit one frame
    fn send(&mut self, frame: &CanFrame) -> Result<()>;
}

/// The process-wide bus handle
#[derive(Clone)]
pub struct SharedBus {
    inner: Arc<Mutex<Box<dyn CanBus>>>,
}

impl SharedBus {
    pub fn new(bus: Box<dyn CanBus>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(bus)),
        }
    }

    /// Send one frame under the bus mutex
    pub fn send(&self, frame: &CanFrame) -> Result<()> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(frame)
    }

    /// Replace the underlying bus
    pub fn replace(&self, bus: Box<dyn CanBus>) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = bus;
    }
}

impl std::fmt::Debug for SharedBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedBus").finish_non_exhaustive()
    }
}

// ==================== Reopening Bus ====================

type Opener = Box<dyn FnMut(&str) -> Result<Box<dyn CanBus>> + Send>;

/// Bus that opens lazily and drops its socket on [`CanAssureError::LinkDown`]
///
/// A send while closed tries to open first and fails with the open error, so
/// the engine starts even when the interface is missing.
pub struct ReopeningBus {
    interface: String,
    opener: Opener,
    current: Option<Box<dyn CanBus>>,
}

impl ReopeningBus {
    /// Use the platform bus for `interface`
    pub fn new(interface: impl Into<String>) -> Self {
        Self::with_opener(interface, open_bus)
    }

    pub fn with_opener(
        interface: impl Into<String>,
        opener: impl FnMut(&str) -> Result<Box<dyn CanBus>> + Send + 'static,
    ) -> Self {
        Self {
            interface: interface.into(),
            opener: Box::new(opener),
            current: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }
}

impl CanBus for ReopeningBus {
    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        let bus = match self.current.take() {
            Some(bus) => bus,
            None => (self.opener)(&self.interface)?,
        };
        let bus = self.current.insert(bus);
        let result = bus.send(frame);
        if let Err(CanAssureError::LinkDown(reason)) = &result {
            tracing::warn!("Closing {}: {}", self.interface, reason);
            self.current = None;
        }
        result
    }
}

impl std::fmt::Debug for ReopeningBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReopeningBus")
            .field("interface", &self.interface)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

// ==================== Recording Bus ====================

/// A frame captured by [`RecordingBus`]
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub at: Instant,
    pub frame: CanFrame,
}

/// In-memory bus; clones share the same record
#[derive(Debug, Clone, Default)]
pub struct RecordingBus {
    sent: Arc<Mutex<Vec<SentFrame>>>,
    failing: Arc<Mutex<BTreeSet<CanId>>>,
}

impl RecordingBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every frame with this id
    pub fn fail_on(&self, id: CanId) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
    }

    /// All frames sent so far
    pub fn sent(&self) -> Vec<SentFrame> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Frames sent so far, without timestamps
    pub fn frames(&self) -> Vec<CanFrame> {
        self.sent().into_iter().map(|s| s.frame).collect()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Time of the most recent send
    pub fn last_sent_at(&self) -> Option<Instant> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .map(|s| s.at)
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl CanBus for RecordingBus {
    fn send(&mut self, frame: &CanFrame) -> Result<()> {
        if frame.data.len() > MAX_DLC {
            return Err(CanAssureError::Transmit(format!(
                "payload of {} bytes exceeds {}",
                frame.data.len(),
                MAX_DLC
            )));
        }
        if self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&frame.id)
        {
            return Err(CanAssureError::Transmit(format!("bus rejected {}", frame.id)));
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SentFrame {
                at: Instant::now(),
                frame: frame.clone(),
            });
        Ok(())
    }
}

// ==================== SocketCAN ====================

#[cfg(target_os = "linux")]
pub use socketcan::SocketCanBus;

#[cfg(target_os = "linux")]
mod socketcan {
    use super::{CanBus, CanFrame, MAX_DLC};
    use crate::error::{CanAssureError, Result};
    use std::ffi::CString;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    const CAN_EFF_FLAG: u32 = 0x8000_0000;

    #[repr(C)]
    struct SockAddrCan {
        can_family: libc::sa_family_t,
        can_ifindex: libc::c_int,
        can_addr: [u64; 2],
    }

    #[repr(C, align(8))]
    struct RawCanFrame {
        can_id: u32,
        can_dlc: u8,
        pad: u8,
        res0: u8,
        res1: u8,
        data: [u8; MAX_DLC],
    }

    /// Raw SocketCAN writer bound to one interface
    #[derive(Debug)]
    pub struct SocketCanBus {
        fd: OwnedFd,
        interface: String,
    }

    impl SocketCanBus {
        /// Open a raw CAN socket bound to `interface`
        pub fn open(interface: &str) -> Result<Self> {
            let name = CString::new(interface).map_err(|_| {
                CanAssureError::LinkDown(format!("Invalid interface name {:?}", interface))
            })?;

            // SAFETY: `name` is a valid NUL-terminated string
            let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
            if index == 0 {
                return Err(CanAssureError::LinkDown(format!(
                    "Interface {} not found",
                    interface
                )));
            }

            // SAFETY: plain socket(2) call; the result is checked below
            let raw = unsafe { libc::socket(libc::PF_CAN, libc::SOCK_RAW, libc::CAN_RAW) };
            if raw < 0 {
                return Err(std::io::Error::last_os_error().into());
            }
            // SAFETY: `raw` is a freshly created descriptor we own
            let fd = unsafe { OwnedFd::from_raw_fd(raw) };

            let addr = SockAddrCan {
                can_family: libc::AF_CAN as libc::sa_family_t,
                can_ifindex: index as libc::c_int,
                can_addr: [0; 2],
            };
            // SAFETY: `addr` is a properly initialized sockaddr_can of the given size
            let rc = unsafe {
                libc::bind(
                    fd.as_raw_fd(),
                    &addr as *const SockAddrCan as *const libc::sockaddr,
                    std::mem::size_of::<SockAddrCan>() as libc::socklen_t,
                )
            };
            if rc < 0 {
                return Err(std::io::Error::last_os_error().into());
            }

            tracing::info!("Opened SocketCAN interface {}", interface);
            Ok(Self {
                fd,
                interface: interface.to_string(),
            })
        }

        pub fn interface(&self) -> &str {
            &self.interface
        }
    }

    impl CanBus for SocketCanBus {
        fn send(&mut self, frame: &CanFrame) -> Result<()> {
            if frame.data.len() > MAX_DLC {
                return Err(CanAssureError::Transmit(format!(
                    "payload of {} bytes exceeds {}",
                    frame.data.len(),
                    MAX_DLC
                )));
            }

            let mut raw = RawCanFrame {
                can_id: frame.id.raw(),
                can_dlc: frame.data.len() as u8,
                pad: 0,
                res0: 0,
                res1: 0,
                data: [0; MAX_DLC],
            };
            if frame.extended {
                raw.can_id |= CAN_EFF_FLAG;
            }
            raw.data[..frame.data.len()].copy_from_slice(&frame.data);

            let size = std::mem::size_of::<RawCanFrame>();
            // SAFETY: `raw` lives for the duration of the call and is `size` bytes long
            let written = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    &raw as *const RawCanFrame as *const libc::c_void,
                    size,
                )
            };
            if written < 0 {
                let error = std::io::Error::last_os_error();
                let message = format!("{}: {}", self.interface, error);
                return Err(match error.raw_os_error() {
                    Some(libc::ENODEV | libc::ENXIO | libc::ENETDOWN) => {
                        CanAssureError::LinkDown(message)
                    }
                    _ => CanAssureError::Transmit(message),
                });
            }
            if written as usize != size {
                return Err(CanAssureError::Transmit(format!(
                    "{}: short write of {} bytes",
                    self.interface, written
                )));
            }
            Ok(())
        }
    }

}

/// Open the platform bus for an interface
pub fn open_bus(interface: &str) -> Result<Box<dyn CanBus>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Box::new(SocketCanBus::open(interface)?))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(CanAssureError::Transmit(format!(
            "SocketCAN is not available on this platform ({})",
            interface
        )))
    }
}
