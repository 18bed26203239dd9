//! The hardware module contains simplified API's for the hardware a fleet is diagnosed through.
//!
//! A [Hardware] implementation hands out one [CanChannel] per vehicle. Channels are
//! independent of each other, so the fleet scheduler can diagnose vehicles in parallel.

use std::sync::Arc;

use crate::{channel::CanChannel, vehicle::VehicleHandle};

pub mod simulation;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

/// Hardware API result
pub type HardwareResult<T> = Result<T, HardwareError>;

/// The hardware trait defines functions supported by all adapters
pub trait Hardware: Send + Sync + std::fmt::Debug {
    /// Creates a raw CAN channel to talk to `vehicle`.
    ///
    /// The channel is returned closed. It is opened by the transport above it
    fn create_can_channel(&self, vehicle: &VehicleHandle) -> HardwareResult<Box<dyn CanChannel>>;

    /// Returns information about the hardware
    fn get_info(&self) -> &HardwareInfo;

    /// Returns true if the hardware is still present
    fn is_connected(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Device hardware info
pub struct HardwareInfo {
    /// Name of the hardware
    pub name: String,
    /// Optional vendor of the hardware
    pub vendor: Option<String>,
    /// Listed capabilities of the hardware
    pub capabilities: HardwareCapabilities,
}

/// Contains details about what communication protocols
/// are supported by the physical hardware
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HardwareCapabilities {
    /// Supports classic CAN frames
    pub can: bool,
    /// Supports CAN-FD frames
    pub can_fd: bool,
    /// Supports 29 bit arbitration IDs
    pub extended_ids: bool,
}

#[derive(Debug, thiserror::Error)]
/// Represents error that can be returned by Hardware API
pub enum HardwareError {
    /// Low level driver error
    #[error("Hardware API Error. Code {code}, Description: {desc}")]
    APIError {
        /// API Error code
        code: u32,
        /// API Error description
        desc: String,
    },
    /// Indicates a channel type is not supported by the API
    #[error("Channel type is not supported by hardware")]
    ChannelNotSupported,
    /// Hardware (or the vehicle behind it) not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),
    /// Function called on device that has not been opened
    #[error("Hardware device not open")]
    DeviceNotOpen,
    /// IO error from the OS
    #[error("IO error")]
    IOError(
        #[from]
        #[source]
        Arc<std::io::Error>,
    ),
}

impl From<std::io::Error> for HardwareError {
    fn from(err: std::io::Error) -> Self {
        Self::IOError(Arc::new(err))
    }
}
