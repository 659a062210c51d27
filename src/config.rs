//! Start configuration
//!
//! Device identity, the set of enabled services and the busy-retry tunables.
//! Loadable from JSON; validated before `Instance::start` allocates anything.

use core::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::platform::Platform;

/// Default upper bound for a single inbound request, in bytes.
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 64 * 1024;

/// Everything `Instance::start` needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartConfig {
    pub vendor_id: u32,
    pub device_id: [u8; 16],
    pub device_type: String,
    pub cloud_url: String,
    #[serde(default)]
    pub services: ServiceConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
}

/// One optional section per service. `None` means disabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Data delivery: outbound `send_data` plus inbound device requests.
    #[serde(default)]
    pub data: Option<DataConfig>,
    #[serde(default)]
    pub command: Option<CommandConfig>,
    #[serde(default)]
    pub remote_config: Option<RemoteConfigConfig>,
    #[serde(default)]
    pub firmware: Option<FirmwareConfig>,
    #[serde(default)]
    pub file_system: Option<FileSystemConfig>,
    #[serde(default)]
    pub short_message: Option<ShortMessageConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfigConfig {
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
}

impl Default for RemoteConfigConfig {
    fn default() -> Self {
        Self {
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FirmwareConfig {
    pub targets: Vec<FirmwareTarget>,
}

/// One updatable image on the device, addressed by its position in
/// `FirmwareConfig::targets`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareTarget {
    pub version: [u8; 4],
    pub description: String,
    /// Regular expression of accepted file names, reported to the cloud.
    #[serde(default)]
    pub filespec: String,
    pub maximum_size: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileSystemConfig {
    /// Virtual directories mapped at start.
    #[serde(default)]
    pub virtual_dirs: Vec<VirtualDirConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VirtualDirConfig {
    pub name: String,
    pub local_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShortMessageConfig {
    #[serde(default)]
    pub udp: bool,
    #[serde(default)]
    pub sms: bool,
}

fn default_max_request_size() -> usize {
    DEFAULT_MAX_REQUEST_SIZE
}

// ---------------------------------------------------------------------------
// Busy-retry policy
// ---------------------------------------------------------------------------

/// Pacing for every place the core waits on someone else: engine `Busy`
/// answers and worker start/stop handshakes.
///
/// Handshake waits never give up; only engine `Busy` retries honour
/// `max_busy_retries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// `None` retries for as long as the engine answers `Busy`.
    #[serde(default)]
    pub max_busy_retries: Option<u32>,
    /// Cooperative yields before falling back to sleeping.
    #[serde(default = "default_spins")]
    pub spins_before_sleep: u32,
    #[serde(default = "default_sleep_ms")]
    pub sleep_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_busy_retries: None,
            spins_before_sleep: default_spins(),
            sleep_ms: default_sleep_ms(),
        }
    }
}

fn default_spins() -> u32 {
    64
}

fn default_sleep_ms() -> u64 {
    1
}

impl RetryPolicy {
    /// Whether another `Busy` retry is allowed after `attempt` failures.
    pub fn allows(&self, attempt: u32) -> bool {
        self.max_busy_retries.is_none_or(|max| attempt < max)
    }

    /// Give way before retry number `attempt`.
    pub fn pause(&self, platform: &dyn Platform, attempt: u32) {
        if attempt < self.spins_before_sleep {
            platform.yield_now();
        } else {
            std::thread::sleep(Duration::from_millis(self.sleep_ms));
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// The configuration field that failed validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigField {
    VendorId,
    DeviceId,
    CloudUrl,
    DeviceType,
    FirmwareTargets,
    VirtualDir,
}

impl fmt::Display for ConfigField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VendorId => write!(f, "vendor_id"),
            Self::DeviceId => write!(f, "device_id"),
            Self::CloudUrl => write!(f, "cloud_url"),
            Self::DeviceType => write!(f, "device_type"),
            Self::FirmwareTargets => write!(f, "firmware.targets"),
            Self::VirtualDir => write!(f, "file_system.virtual_dirs"),
        }
    }
}

impl StartConfig {
    /// Minimal configuration with every service disabled.
    pub fn new(
        vendor_id: u32,
        device_id: [u8; 16],
        device_type: impl Into<String>,
        cloud_url: impl Into<String>,
    ) -> Self {
        Self {
            vendor_id,
            device_id,
            device_type: device_type.into(),
            cloud_url: cloud_url.into(),
            services: ServiceConfig::default(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// First invalid field, checked in a fixed order.
    pub fn validate(&self) -> Result<(), ConfigField> {
        if self.vendor_id == 0 {
            return Err(ConfigField::VendorId);
        }
        if self.device_id.iter().all(|b| *b == 0) {
            return Err(ConfigField::DeviceId);
        }
        if self.cloud_url.is_empty() {
            return Err(ConfigField::CloudUrl);
        }
        if self.device_type.is_empty() {
            return Err(ConfigField::DeviceType);
        }
        if let Some(fw) = &self.services.firmware {
            if fw.targets.is_empty() || fw.targets.len() > usize::from(u8::MAX) + 1 {
                return Err(ConfigField::FirmwareTargets);
            }
        }
        if let Some(fs) = &self.services.file_system {
            if fs
                .virtual_dirs
                .iter()
                .any(|d| !crate::services::filesystem::is_valid_dir_name(&d.name))
            {
                return Err(ConfigField::VirtualDir);
            }
        }
        Ok(())
    }

    /// Whether UDP or SMS can be used at all.
    pub fn short_message_enabled(&self) -> bool {
        self.services.short_message.is_some()
    }
}
