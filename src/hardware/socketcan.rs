//! SocketCAN module
//!
//! Every vehicle gets its own raw CAN-FD socket on its interface. The socket is filtered on
//! the response ID of the vehicle, so channels of vehicles sharing a bus never see each
//! other's traffic.

use std::{io::ErrorKind, path::PathBuf, time::Duration};

use socketcan::{
    CanAnyFrame, CanFdFrame, CanFdSocket, CanFilter, CanFrame, EmbeddedFrame, ExtendedId, Frame,
    Id, Socket, SocketOptions, StandardId,
};

use crate::{
    channel::{CanChannel, ChannelError, ChannelResult, MAX_STANDARD_ID, RawFrame},
    vehicle::VehicleHandle,
};

use super::{Hardware, HardwareCapabilities, HardwareError, HardwareInfo, HardwareResult};

const SOCKET_CAN_CAPABILITIES: HardwareCapabilities = HardwareCapabilities {
    can: true,
    can_fd: true,
    extended_ids: true,
};

const STANDARD_MASK: u32 = 0x7FF;
const EXTENDED_MASK: u32 = 0x1FFF_FFFF;

/// SocketCAN device.
///
/// `interface` is the default interface of vehicles that do not name their own
#[derive(Clone, Debug)]
pub struct SocketCanHardware {
    info: HardwareInfo,
}

impl SocketCanHardware {
    /// Creates the device for `interface`, EG: `can0`
    pub fn new(interface: &str) -> HardwareResult<Self> {
        let dev = Self {
            info: HardwareInfo {
                name: interface.to_string(),
                vendor: Some("Linux SocketCAN".into()),
                capabilities: SOCKET_CAN_CAPABILITIES,
            },
        };
        if !dev.is_connected() {
            return Err(HardwareError::DeviceNotFound(interface.to_string()));
        }
        Ok(dev)
    }
}

impl Hardware for SocketCanHardware {
    fn create_can_channel(&self, vehicle: &VehicleHandle) -> HardwareResult<Box<dyn CanChannel>> {
        Ok(Box::new(SocketCanChannel {
            rx_id: vehicle.ta_rx,
            socket: None,
        }))
    }

    fn get_info(&self) -> &HardwareInfo {
        &self.info
    }

    fn is_connected(&self) -> bool {
        PathBuf::from(format!("/sys/class/net/{}", self.info.name)).exists()
    }
}

/// Raw CAN-FD socket to one vehicle
#[derive(Debug)]
pub struct SocketCanChannel {
    rx_id: u32,
    socket: Option<CanFdSocket>,
}

impl SocketCanChannel {
    fn safe_with_iface<X, T: FnOnce(&CanFdSocket) -> ChannelResult<X>>(
        &self,
        function: T,
    ) -> ChannelResult<X> {
        match self.socket {
            Some(ref socket) => function(socket),
            None => Err(ChannelError::InterfaceNotOpen),
        }
    }
}

fn to_id(arbitration_id: u32) -> ChannelResult<Id> {
    let id = if arbitration_id > MAX_STANDARD_ID {
        ExtendedId::new(arbitration_id).map(Id::Extended)
    } else {
        StandardId::new(arbitration_id as u16).map(Id::Standard)
    };
    id.ok_or_else(|| ChannelError::InvalidFrame(format!("0x{arbitration_id:X} is not a CAN ID")))
}

impl CanChannel for SocketCanChannel {
    /// Bitrates are ignored, as the kernel configures the interface
    fn connect(
        &mut self,
        interface_name: &str,
        _bitrate: u32,
        _data_bitrate: u32,
    ) -> ChannelResult<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let socket = CanFdSocket::open(interface_name)?;
        let mask = if self.rx_id > MAX_STANDARD_ID {
            EXTENDED_MASK
        } else {
            STANDARD_MASK
        };
        socket.set_filters(&[CanFilter::new(self.rx_id, mask)])?;
        self.socket = Some(socket);
        Ok(())
    }

    fn disconnect(&mut self) -> ChannelResult<()> {
        self.socket = None;
        Ok(())
    }

    fn send(&mut self, arbitration_id: u32, payload: &[u8], is_fd: bool) -> ChannelResult<()> {
        let id = to_id(arbitration_id)?;
        self.safe_with_iface(|socket| {
            if is_fd {
                let frame = CanFdFrame::new(id, payload)
                    .ok_or_else(|| ChannelError::InvalidFrame("CAN-FD payload".into()))?;
                socket.write_frame(&frame)?;
            } else {
                let frame = CanFrame::new(id, payload)
                    .ok_or_else(|| ChannelError::InvalidFrame("CAN payload".into()))?;
                socket.write_frame(&frame)?;
            }
            Ok(())
        })
    }

    fn recv(&mut self, timeout: Duration) -> ChannelResult<Option<RawFrame>> {
        self.safe_with_iface(|socket| {
            socket.set_read_timeout(timeout.max(Duration::from_millis(1)))?;
            match socket.read_frame() {
                Ok(CanAnyFrame::Fd(f)) => RawFrame::new(f.raw_id(), f.data(), true).map(Some),
                Ok(CanAnyFrame::Normal(f)) => RawFrame::new(f.raw_id(), f.data(), false).map(Some),
                // Remote and error frames carry no diagnostics
                Ok(_) => Ok(None),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    Ok(None)
                }
                Err(e) => Err(e.into()),
            }
        })
    }
}
