//! Keeps a non default diagnostic session alive with tester present messages

use automotive_diag::uds::UdsCommand;

use super::{UdsRequest, UdsSessionEngine};
use crate::DiagServerResult;

/// Sub function bit asking the ECU not to answer
const SUPPRESS_POSITIVE_RESPONSE: u8 = 0x80;

impl UdsSessionEngine {
    /// Sends tester present, keeping the current session alive
    pub fn tester_present(&mut self) -> DiagServerResult<()> {
        let request = if self.options().tester_present_require_response {
            UdsRequest::new(UdsCommand::TesterPresent, &[0x00])
        } else {
            UdsRequest::new(UdsCommand::TesterPresent, &[SUPPRESS_POSITIVE_RESPONSE])
                .without_response()
        };
        self.transact(&request)?;
        log::debug!("Tester present sent to '{}'", self.vehicle_id());
        Ok(())
    }
}
