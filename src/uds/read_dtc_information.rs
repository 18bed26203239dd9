//!  Provides methods to read and query DTCs on the ECU

use automotive_diag::uds::UdsCommand;

use super::UdsSessionEngine;
use crate::{
    DiagServerResult, ProtocolError,
    dtc::{DtcCode, DtcRecord},
};

/// Status mask matching every DTC the ECU has stored
pub const ALL_DTC_STATUS_BITS: u8 = 0xFF;

/// ReadDTCInformation sub-functions used by the engine
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum DtcSubFunction {
    /// This function takes a 1 byte DTCStatusMask
    ReportDTCByStatusMask = 0x02,
}

impl UdsSessionEngine {
    /// Returns a list of DTCs stored on the ECU
    /// matching the provided status_mask.
    ///
    /// Descriptions are filled in from the engine's DTC lookup
    pub fn read_dtc(&mut self, status_mask: u8) -> DiagServerResult<Vec<DtcRecord>> {
        let sub = DtcSubFunction::ReportDTCByStatusMask as u8;
        let resp =
            self.send_command_with_response(UdsCommand::ReadDTCInformation, &[sub, status_mask])?;
        // sub function echo + DTCStatusAvailabilityMask
        if resp.len() < 2 || (resp.len() - 2) % 4 != 0 {
            return Err(ProtocolError::InvalidResponseLength {
                sid: UdsCommand::ReadDTCInformation.into(),
                len: resp.len(),
            }
            .into());
        }
        if resp[0] != sub {
            return Err(ProtocolError::MismatchedEcho {
                want: sub,
                received: resp[0],
            }
            .into());
        }

        let records = resp[2..]
            .chunks_exact(4)
            .map(|x| {
                let code = DtcCode::from_bytes(x[0], x[1], x[2]);
                let description = self.dtc_lookup().lookup(code);
                DtcRecord::new(self.vehicle_id(), code, x[3], description)
            })
            .collect::<Vec<_>>();
        log::info!(
            "'{}' reported {} DTC(s) for status mask 0x{status_mask:02X}",
            self.vehicle_id(),
            records.len()
        );
        Ok(records)
    }
}
