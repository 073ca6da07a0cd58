//! Worker and device descriptors.

use serde::{Deserialize, Serialize};

/// Snapshot of one compute device on a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    /// Human-readable device name.
    pub name: String,
    /// Runtime handle for the device (e.g. `cuda:0`).
    #[serde(rename = "int_name")]
    pub internal_name: String,
    /// Total device memory in bytes.
    #[serde(rename = "memory")]
    pub memory_bytes: u64,
}

impl DeviceDescriptor {
    /// Create a new device descriptor.
    #[must_use]
    pub fn new(name: impl Into<String>, internal_name: impl Into<String>, memory_bytes: u64) -> Self {
        Self {
            name: name.into(),
            internal_name: internal_name.into(),
            memory_bytes,
        }
    }
}

/// Machine metadata a worker announces during the handshake.
///
/// This is also the value stored per host in the worker registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Machine name of the worker.
    pub machine: String,
    /// Devices in enumeration order.
    #[serde(default)]
    pub devices: Vec<DeviceDescriptor>,
}

impl NodeInfo {
    /// Create node info with no devices.
    #[must_use]
    pub fn new(machine: impl Into<String>) -> Self {
        Self {
            machine: machine.into(),
            devices: Vec::new(),
        }
    }

    /// Append a device.
    #[must_use]
    pub fn with_device(mut self, device: DeviceDescriptor) -> Self {
        self.devices.push(device);
        self
    }
}

/// A worker as seen by the coordinator.
///
/// `host` is the address the coordinator dialled and the key used in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub machine_name: String,
    pub host: String,
    pub devices: Vec<DeviceDescriptor>,
}

impl WorkerDescriptor {
    /// Combine announced node info with the host it was reached at.
    #[must_use]
    pub fn from_node_info(host: impl Into<String>, info: NodeInfo) -> Self {
        Self {
            machine_name: info.machine,
            host: host.into(),
            devices: info.devices,
        }
    }

    /// Registry value for this worker.
    #[must_use]
    pub fn node_info(&self) -> NodeInfo {
        NodeInfo {
            machine: self.machine_name.clone(),
            devices: self.devices.clone(),
        }
    }

    /// Total memory across all devices.
    #[must_use]
    pub fn total_memory(&self) -> u64 {
        self.devices.iter().map(|d| d.memory_bytes).sum()
    }
}

/// Source of a worker's hardware description.
///
/// Real enumeration lives outside this crate; workers plug in whatever probe fits.
pub trait DeviceProbe: Send + Sync {
    /// Describe the local machine.
    fn probe(&self) -> NodeInfo;
}

/// Probe that always reports a fixed description.
#[derive(Debug, Clone)]
pub struct StaticProbe {
    info: NodeInfo,
}

impl StaticProbe {
    #[must_use]
    pub const fn new(info: NodeInfo) -> Self {
        Self { info }
    }
}

impl DeviceProbe for StaticProbe {
    fn probe(&self) -> NodeInfo {
        self.info.clone()
    }
}
