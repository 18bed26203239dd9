//! Module for the raw CAN / CAN-FD channel between the tester and a vehicle
//!
//! A [CanChannel] only moves single frames. Segmentation of diagnostic messages
//! happens above it in [crate::isotp].

use std::{sync::Arc, time::Duration};

use bitflags::bitflags;

/// Largest payload of a classic CAN frame
pub const MAX_CLASSIC_PAYLOAD: usize = 8;
/// Largest payload of a CAN-FD frame
pub const MAX_FD_PAYLOAD: usize = 64;
/// Largest 11 bit arbitration ID. Anything above requires extended (29 bit) addressing
pub const MAX_STANDARD_ID: u32 = 0x7FF;
/// Largest 29 bit arbitration ID
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Clone, Debug, thiserror::Error)]
/// Error produced by a communication channel
pub enum ChannelError {
    /// Underlying IO Error with channel
    #[error("IO error")]
    IOError(
        #[from]
        #[source]
        Arc<std::io::Error>,
    ),
    /// Timeout when writing data to the channel
    #[error("Timeout writing to channel")]
    WriteTimeout,
    /// The channels Tx buffer is full
    #[error("Channel's transmit buffer is full")]
    BufferFull,
    /// The interface is not open
    #[error("Channel's interface is not open")]
    InterfaceNotOpen,
    /// Frame cannot be represented on the bus
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),
    /// Unsupported channel request
    #[error("Unsupported channel request")]
    UnsupportedRequest,
    /// Underlying API error with hardware
    #[error("Underlying {api_name} API error ({code}): {desc}")]
    APIError {
        /// Name of the API EG: 'socketCAN', 'Simulation'
        api_name: String,
        /// Internal API error code
        code: u32,
        /// API error description
        desc: String,
    },
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        Self::IOError(Arc::new(err))
    }
}

bitflags! {
    /// Flags of a [RawFrame]
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct FrameFlags: u8 {
        /// Frame uses the CAN-FD format
        const FD = 0b0000_0001;
        /// Frame uses a 29 bit arbitration ID
        const EXTENDED = 0b0000_0010;
    }
}

/// A single frame on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    id: u32,
    data: Vec<u8>,
    flags: FrameFlags,
}

impl RawFrame {
    /// Creates a new frame, checking the payload fits the frame format.
    ///
    /// IDs above 0x7FF are marked as extended automatically
    pub fn new(id: u32, data: &[u8], is_fd: bool) -> ChannelResult<Self> {
        if id > MAX_EXTENDED_ID {
            return Err(ChannelError::InvalidFrame(format!(
                "arbitration ID 0x{id:08X} exceeds 29 bits"
            )));
        }
        let max = if is_fd {
            MAX_FD_PAYLOAD
        } else {
            MAX_CLASSIC_PAYLOAD
        };
        if data.len() > max {
            return Err(ChannelError::InvalidFrame(format!(
                "payload of {} bytes exceeds {max}",
                data.len()
            )));
        }
        let mut flags = FrameFlags::empty();
        flags.set(FrameFlags::FD, is_fd);
        flags.set(FrameFlags::EXTENDED, id > MAX_STANDARD_ID);
        Ok(Self {
            id,
            data: data.to_vec(),
            flags,
        })
    }

    /// Arbitration ID of the frame
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Payload of the frame
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Frame flags
    pub fn flags(&self) -> FrameFlags {
        self.flags
    }

    /// True if the frame is a CAN-FD frame
    pub fn is_fd(&self) -> bool {
        self.flags.contains(FrameFlags::FD)
    }

    /// True if the frame uses 29 bit addressing
    pub fn is_extended(&self) -> bool {
        self.flags.contains(FrameFlags::EXTENDED)
    }
}

impl std::fmt::Display for RawFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_extended() {
            write!(f, "{:08X}", self.id)?;
        } else {
            write!(f, "{:03X}", self.id)?;
        }
        write!(f, " [{}] {:02X?}", self.data.len(), self.data)
    }
}

/// Raw CAN-FD transport to one vehicle.
///
/// Implementations must tolerate one open channel per addressing context, as the fleet
/// scheduler opens a channel for every vehicle it diagnoses concurrently.
pub trait CanChannel: Send + std::fmt::Debug {
    /// Opens the channel on an interface
    ///
    /// ## Parameters
    /// * interface_name - Name of the interface, EG: `can0`
    /// * bitrate - Nominal (arbitration phase) bitrate
    /// * data_bitrate - CAN-FD data phase bitrate
    fn connect(&mut self, interface_name: &str, bitrate: u32, data_bitrate: u32)
    -> ChannelResult<()>;

    /// Closes the channel. Calling this on a closed channel is not an error
    fn disconnect(&mut self) -> ChannelResult<()>;

    /// Writes a single frame to the bus
    ///
    /// ## Parameters
    /// * arbitration_id - CAN ID. IDs above 0x7FF are sent as extended frames
    /// * payload - Up to 64 bytes. Must already be a valid CAN-FD DLC length
    /// * is_fd - Send as a CAN-FD frame
    fn send(&mut self, arbitration_id: u32, payload: &[u8], is_fd: bool) -> ChannelResult<()>;

    /// Waits up to `timeout` for the next frame from the bus.
    ///
    /// Returns `Ok(None)` if no frame arrived in time
    fn recv(&mut self, timeout: Duration) -> ChannelResult<Option<RawFrame>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_flags() {
        let f = RawFrame::new(0x7E8, &[0x02, 0x50, 0x03], false).unwrap();
        assert!(!f.is_extended());
        assert!(!f.is_fd());
        let f = RawFrame::new(0x18DA_F110, &[0u8; 64], true).unwrap();
        assert!(f.is_extended());
        assert!(f.is_fd());
        assert_eq!(f.flags(), FrameFlags::FD | FrameFlags::EXTENDED);
    }

    #[test]
    fn frame_limits() {
        assert!(RawFrame::new(0x7E0, &[0u8; 9], false).is_err());
        assert!(RawFrame::new(0x7E0, &[0u8; 65], true).is_err());
        assert!(RawFrame::new(0x2000_0000, &[], false).is_err());
    }

    #[test]
    fn frame_display() {
        let f = RawFrame::new(0x7E0, &[0x02, 0x10, 0x03], false).unwrap();
        assert_eq!(f.to_string(), "7E0 [3] [02, 10, 03]");
    }
}
