//! Clears diagnostic information (DTCs) stored on the ECU

use automotive_diag::uds::UdsCommand;

use super::UdsSessionEngine;
use crate::{DiagError, DiagServerResult};

/// DTC group covering every DTC of the ECU
pub const ALL_DTC_GROUPS: u32 = 0x00FF_FFFF;

impl UdsSessionEngine {
    /// Clears DTCs of a DTC group. Use [ALL_DTC_GROUPS] to clear every DTC
    pub fn clear_dtc(&mut self, group: u32) -> DiagServerResult<()> {
        if group > ALL_DTC_GROUPS {
            return Err(DiagError::ParameterInvalid(format!(
                "DTC group 0x{group:08X} does not fit into 3 bytes"
            )));
        }
        let [_, hi, mid, lo] = group.to_be_bytes();
        self.send_command_with_response(UdsCommand::ClearDiagnosticInformation, &[hi, mid, lo])?;
        log::info!(
            "Cleared DTC group 0x{group:06X} of '{}'",
            self.vehicle_id()
        );
        Ok(())
    }
}
