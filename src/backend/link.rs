//! Bus interface control
//!
//! [`SocketCanLink`] inspects and configures a SocketCAN interface with the
//! `ip` tool. Bringing the link up needs the privileges to run
//! `ip link set`; the process is expected to have them.

use crate::config::BusConfig;
use crate::error::{CanAssureError, Result};
use std::path::Path;
use std::process::{Command, Stdio};

/// Where Linux lists network interfaces
pub const SYS_NET_DIR: &str = "/sys/class/net";

/// Interface used when `auto` finds nothing at startup
pub const FALLBACK_INTERFACE: &str = "can0";

/// Collaborator reporting and restoring the bus interface state
#[cfg_attr(test, mockall::automock)]
pub trait LinkControl: Send + Sync {
    /// Interface name
    fn interface(&self) -> String;

    /// Whether the interface is present and up
    fn is_up(&self) -> bool;

    /// Bring the interface down, apply the bitrate and bring it up
    fn bring_up(&self) -> Result<()>;
}

/// Link control through `ip link`
#[derive(Debug, Clone)]
pub struct SocketCanLink {
    interface: String,
    bitrate: u32,
}

impl SocketCanLink {
    pub fn new(interface: impl Into<String>, bitrate: u32) -> Self {
        Self {
            interface: interface.into(),
            bitrate,
        }
    }

    /// Build from configuration, resolving `auto` to a detected interface
    pub fn from_config(config: &BusConfig) -> Result<Self> {
        let interface = resolve_interface(&config.interface, Path::new(SYS_NET_DIR))?;
        Ok(Self::new(interface, config.bitrate))
    }

    fn ip(&self, args: &[&str]) -> Result<std::process::Output> {
        Command::new("ip")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| CanAssureError::LinkDown(format!("Failed to run ip: {}", e)))
    }
}

impl LinkControl for SocketCanLink {
    fn interface(&self) -> String {
        self.interface.clone()
    }

    fn is_up(&self) -> bool {
        match self.ip(&["link", "show", self.interface.as_str()]) {
            Ok(output) if output.status.success() => {
                link_flags_up(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(_) => false,
            Err(e) => {
                tracing::debug!("Link check failed: {}", e);
                false
            }
        }
    }

    fn bring_up(&self) -> Result<()> {
        let bitrate = self.bitrate.to_string();
        let name = self.interface.as_str();
        let steps: [&[&str]; 3] = [
            &["link", "set", name, "down"],
            &["link", "set", name, "type", "can", "bitrate", bitrate.as_str()],
            &["link", "set", name, "up"],
        ];

        for args in steps {
            let output = self.ip(args)?;
            if !output.status.success() {
                return Err(CanAssureError::LinkDown(format!(
                    "ip {} failed: {}",
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                )));
            }
        }
        tracing::info!("Brought up {} at {} bit/s", self.interface, self.bitrate);
        Ok(())
    }
}

/// Whether `ip link show` output lists the UP flag
pub fn link_flags_up(output: &str) -> bool {
    output
        .lines()
        .next()
        .and_then(|line| {
            let start = line.find('<')?;
            let end = line[start..].find('>')? + start;
            Some(line[start + 1..end].split(',').any(|flag| flag == "UP"))
        })
        .unwrap_or(false)
}

/// First `can*` interface listed under `sys_net`
pub fn detect_interface(sys_net: &Path) -> Option<String> {
    let mut names: Vec<String> = std::fs::read_dir(sys_net)
        .ok()?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.starts_with("can"))
        .collect();
    names.sort();
    names.into_iter().next()
}

/// Resolve the configured interface name
pub fn resolve_interface(configured: &str, sys_net: &Path) -> Result<String> {
    if configured != crate::config::AUTO_INTERFACE {
        return Ok(configured.to_string());
    }
    let detected = detect_interface(sys_net)
        .ok_or_else(|| CanAssureError::LinkDown("No CAN interface found".to_string()))?;
    tracing::info!("Detected CAN interface {}", detected);
    Ok(detected)
}
