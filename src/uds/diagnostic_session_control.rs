//!  Provides methods to manipulate the ECUs diagnostic session mode

use std::time::{Duration, Instant};

use automotive_diag::uds::UdsCommand;

use super::{DiagnosticSession, SessionError, UdsSessionEngine};
use crate::{DiagError, DiagServerResult, ProtocolError};

/// Timing parameters returned by the ECU when a session is entered
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SessionTiming {
    /// P2 server max. Time the ECU takes to start a response
    pub p2: Duration,
    /// P2* server max. Time the ECU takes after a response pending reply
    pub p2_star: Duration,
}

impl SessionTiming {
    /// Decodes the 4 byte session parameter record (`P2 hi, P2 lo, P2* hi, P2* lo`).
    /// P2 is in 1ms steps, P2* in 10ms steps
    pub fn from_record(record: &[u8]) -> Option<Self> {
        let [p2_hi, p2_lo, p2s_hi, p2s_lo, ..] = *record else {
            return None;
        };
        Some(Self {
            p2: Duration::from_millis(u16::from_be_bytes([p2_hi, p2_lo]) as u64),
            p2_star: Duration::from_millis(u16::from_be_bytes([p2s_hi, p2s_lo]) as u64 * 10),
        })
    }
}

impl UdsSessionEngine {
    /// Requests the ECU to go into a specific diagnostic session mode.
    ///
    /// The session only changes if the ECU accepts the request and echoes `target`.
    /// Any failure is reported as [SessionError::ControlRejected]
    pub fn session_control(&mut self, target: DiagnosticSession) -> DiagServerResult<()> {
        let reject = |reason: DiagError| -> DiagError {
            SessionError::ControlRejected {
                target,
                reason: Box::new(reason),
            }
            .into()
        };
        let data = self
            .send_command_with_response(UdsCommand::DiagnosticSessionControl, &[target.id()])
            .map_err(reject)?;
        match data.first() {
            Some(echo) if *echo == target.id() => {}
            Some(echo) => {
                return Err(reject(
                    ProtocolError::MismatchedEcho {
                        want: target.id(),
                        received: *echo,
                    }
                    .into(),
                ));
            }
            None => {
                return Err(reject(
                    ProtocolError::InvalidResponseLength {
                        sid: UdsCommand::DiagnosticSessionControl.into(),
                        len: 0,
                    }
                    .into(),
                ));
            }
        }
        let next = self.current_session().transition(target, true);
        self.set_session(next);
        self.timing = SessionTiming::from_record(&data[1..]);
        self.last_activity = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timing_record() {
        let t = SessionTiming::from_record(&[0x00, 0x32, 0x01, 0xF4]).unwrap();
        assert_eq!(t.p2, Duration::from_millis(50));
        assert_eq!(t.p2_star, Duration::from_millis(5000));
        assert!(SessionTiming::from_record(&[0x00, 0x32]).is_none());
    }
}
