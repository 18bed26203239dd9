//! Module for UDS (Unified diagnostic services - ISO14229)
//!
//! [UdsSessionEngine] owns the diagnostic session of one ECU. It sends requests through an
//! [IsoTpSegmenter], validates the replies and applies the response pending (NRC 0x78) policy.
//! Each supported service lives in its own submodule as an extension of the engine.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use automotive_diag::uds::{UdsCommand, UdsErrorByte};
use log::{debug, info, warn};
use strum_macros::{Display, EnumString, IntoStaticStr};

use crate::{
    DiagError, DiagServerResult, ProtocolError,
    dtc::{DtcLookup, DtcTable},
    isotp::{ChannelStatistics, IsoTpSegmenter, LogicalMessage},
};

mod clear_diagnostic_information;
mod diagnostic_session_control;
mod read_data_by_identifier;
mod read_dtc_information;
mod security_access;
mod tester_present;

pub use clear_diagnostic_information::*;
pub use diagnostic_session_control::*;
pub use read_data_by_identifier::*;
pub use read_dtc_information::*;
pub use security_access::*;

/// SID of a negative response
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;
/// Offset between a request SID and its positive response SID
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// NRC 0x31 - Request out of range
pub const NRC_REQUEST_OUT_OF_RANGE: u8 = 0x31;
/// NRC 0x78 - Request correctly received, response pending
pub const NRC_RESPONSE_PENDING: u8 = 0x78;
/// NRC 0x7E - Sub function not supported in active session
pub const NRC_SUB_FUNCTION_NOT_SUPPORTED_IN_ACTIVE_SESSION: u8 = 0x7E;
/// NRC 0x7F - Service not supported in active session
pub const NRC_SERVICE_NOT_SUPPORTED_IN_ACTIVE_SESSION: u8 = 0x7F;

/// Name of a negative response code according to ISO14229
pub fn lookup_uds_nrc(code: u8) -> String {
    format!("{:?}", UdsErrorByte::from(code))
}

/// Builds the error for a negative response
pub fn negative_response(code: u8) -> DiagError {
    DiagError::NegativeResponse {
        code,
        def: Some(lookup_uds_nrc(code)),
    }
}

/// UDS diagnostic session
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Display, EnumString, IntoStaticStr,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DiagnosticSession {
    /// Default session (0x01). Entered on power up and after S3 expires
    #[default]
    Default,
    /// Programming session (0x02)
    Programming,
    /// Extended diagnostic session (0x03)
    Extended,
}

impl DiagnosticSession {
    /// Session ID sent in DiagnosticSessionControl
    pub const fn id(self) -> u8 {
        match self {
            Self::Default => 0x01,
            Self::Programming => 0x02,
            Self::Extended => 0x03,
        }
    }

    /// Session for a session ID
    pub const fn from_id(id: u8) -> Option<Self> {
        match id {
            0x01 => Some(Self::Default),
            0x02 => Some(Self::Programming),
            0x03 => Some(Self::Extended),
            _ => None,
        }
    }

    /// State after a DiagnosticSessionControl request to `target`.
    /// Only an accepted request changes the session
    pub const fn transition(self, target: Self, accepted: bool) -> Self {
        if accepted { target } else { self }
    }

    /// State after the S3 timer lapsed
    pub const fn on_s3_expired(self) -> Self {
        Self::Default
    }

    /// True if the ECU drops this session without tester present messages
    pub const fn needs_keep_alive(self) -> bool {
        !matches!(self, Self::Default)
    }
}

#[derive(Clone, Debug, thiserror::Error)]
/// Diagnostic session state errors
pub enum SessionError {
    /// DiagnosticSessionControl failed. The session is unchanged
    #[error("ECU rejected the change to the {target} session")]
    ControlRejected {
        /// Requested session
        target: DiagnosticSession,
        /// Why the change failed
        #[source]
        reason: Box<DiagError>,
    },
    /// The ECU no longer accepts requests of the session, it has fallen back to default
    #[error("ECU left the {session} session (NRC 0x{nrc:02X})")]
    Lost {
        /// Session the engine believed to be in
        session: DiagnosticSession,
        /// Negative response which revealed the loss
        nrc: u8,
    },
    /// The engine was disconnected
    #[error("Diagnostic session is disconnected")]
    Disconnected,
}

/// UDS request PDU
#[derive(Clone, PartialEq, Eq)]
pub struct UdsRequest {
    bytes: Vec<u8>,
    response_required: bool,
}

impl std::fmt::Debug for UdsRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdsRequest")
            .field("sid", &format_args!("0x{:02X}", self.sid()))
            .field("params", &format_args!("{:02X?}", self.params()))
            .field("response_required", &self.response_required)
            .finish()
    }
}

impl UdsRequest {
    /// Creates a request for a service
    pub fn new<T: Into<u8>>(sid: T, params: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(params.len() + 1);
        bytes.push(sid.into());
        bytes.extend_from_slice(params);
        Self {
            bytes,
            response_required: true,
        }
    }

    /// Marks the request as one the ECU does not answer
    pub fn without_response(mut self) -> Self {
        self.response_required = false;
        self
    }

    /// Service ID
    pub fn sid(&self) -> u8 {
        self.bytes[0]
    }

    /// Parameters after the SID
    pub fn params(&self) -> &[u8] {
        &self.bytes[1..]
    }

    /// Encoded PDU
    pub fn to_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// True if a response is expected
    pub fn requires_response(&self) -> bool {
        self.response_required
    }
}

/// UDS response PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdsResponse {
    /// Positive response
    Positive {
        /// Response SID (request SID + 0x40)
        sid: u8,
        /// Data after the SID
        data: Vec<u8>,
    },
    /// Negative response `7F sid nrc`
    Negative {
        /// SID of the rejected request
        sid: u8,
        /// Negative response code
        nrc: u8,
    },
}

impl UdsResponse {
    /// Decodes a response PDU
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        match bytes {
            [] => Err(ProtocolError::EmptyResponse),
            [NEGATIVE_RESPONSE_SID, sid, nrc, ..] => Ok(Self::Negative {
                sid: *sid,
                nrc: *nrc,
            }),
            [NEGATIVE_RESPONSE_SID, ..] => {
                Err(ProtocolError::MalformedNegativeResponse(bytes.to_vec()))
            }
            [sid, data @ ..] => Ok(Self::Positive {
                sid: *sid,
                data: data.to_vec(),
            }),
        }
    }

    /// Checks the response answers a request with `request_sid`.
    ///
    /// Returns the positive response data, or the NRC of a negative response
    pub fn for_request(self, request_sid: u8) -> Result<Result<Vec<u8>, u8>, ProtocolError> {
        match self {
            Self::Positive { sid, data } => {
                let expected = request_sid.wrapping_add(POSITIVE_RESPONSE_OFFSET);
                if sid == expected {
                    Ok(Ok(data))
                } else {
                    Err(ProtocolError::UnexpectedSid { expected, got: sid })
                }
            }
            Self::Negative { sid, nrc } => {
                if sid == request_sid {
                    Ok(Err(nrc))
                } else {
                    Err(ProtocolError::UnexpectedSid {
                        expected: request_sid,
                        got: sid,
                    })
                }
            }
        }
    }
}

/// How many response pending (NRC 0x78) replies are tolerated per request
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RetryPolicy {
    /// Pending responses after which the request fails with NRC 0x78
    pub response_pending_limit: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            response_pending_limit: 3,
        }
    }
}

impl RetryPolicy {
    /// True if the engine keeps waiting after `pending_seen` pending responses
    pub fn keep_waiting(&self, pending_seen: u32) -> bool {
        pending_seen < self.response_pending_limit
    }
}

/// UDS engine options
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UdsSessionOptions {
    /// How long to wait for each response, including each wait after a pending response
    pub response_timeout: Duration,
    /// Response pending policy
    pub retry_policy: RetryPolicy,
    /// S3 session timeout of the ECU
    pub s3_timeout: Duration,
    /// Tester present interval. Half of S3 if not set
    pub keep_alive_interval: Option<Duration>,
    /// Configures if tester present messages ask the ECU for a response
    pub tester_present_require_response: bool,
}

impl Default for UdsSessionOptions {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(1000),
            retry_policy: RetryPolicy::default(),
            s3_timeout: Duration::from_secs(5),
            keep_alive_interval: None,
            tester_present_require_response: true,
        }
    }
}

impl UdsSessionOptions {
    /// Interval between tester present messages
    pub fn keep_alive_interval(&self) -> Duration {
        self.keep_alive_interval.unwrap_or(self.s3_timeout / 2)
    }
}

/// UDS diagnostic session state machine for one ECU
pub struct UdsSessionEngine {
    transport: IsoTpSegmenter,
    options: UdsSessionOptions,
    session: DiagnosticSession,
    timing: Option<SessionTiming>,
    security_level: Option<u8>,
    last_activity: Instant,
    connected: bool,
    vehicle_id: String,
    dtc_lookup: Arc<dyn DtcLookup>,
}

impl std::fmt::Debug for UdsSessionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdsSessionEngine")
            .field("vehicle_id", &self.vehicle_id)
            .field("session", &self.session)
            .field("connected", &self.connected)
            .field("transport", &self.transport)
            .finish()
    }
}

impl UdsSessionEngine {
    /// Creates an engine over an already connected segmenter.
    /// The session starts as [DiagnosticSession::Default]
    pub fn new(transport: IsoTpSegmenter, options: UdsSessionOptions) -> Self {
        Self {
            transport,
            options,
            session: DiagnosticSession::Default,
            timing: None,
            security_level: None,
            last_activity: Instant::now(),
            connected: true,
            vehicle_id: String::new(),
            dtc_lookup: Arc::new(DtcTable::new()),
        }
    }

    /// Vehicle ID stamped on DTC records
    pub fn with_vehicle_id(mut self, vehicle_id: &str) -> Self {
        self.vehicle_id = vehicle_id.to_string();
        self
    }

    /// Source of DTC descriptions
    pub fn with_dtc_lookup(mut self, lookup: Arc<dyn DtcLookup>) -> Self {
        self.dtc_lookup = lookup;
        self
    }

    /// Engine options
    pub fn options(&self) -> &UdsSessionOptions {
        &self.options
    }

    /// Session the engine believes the ECU is in, accounting for S3 expiry
    pub fn current_session(&mut self) -> DiagnosticSession {
        self.check_s3();
        self.session
    }

    /// Timing parameters reported by the last accepted session change
    pub fn timing(&self) -> Option<SessionTiming> {
        self.timing
    }

    /// Security level unlocked in the current session, if any
    pub fn security_level(&self) -> Option<u8> {
        self.security_level
    }

    /// True until [UdsSessionEngine::disconnect] is called
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Traffic counters of the transport below
    pub fn statistics(&self) -> ChannelStatistics {
        self.transport.statistics()
    }

    /// Time until the next tester present is due, or `None` in the default session
    pub fn time_until_keep_alive(&self) -> Option<Duration> {
        if !self.connected || !self.session.needs_keep_alive() {
            return None;
        }
        Some(
            self.options
                .keep_alive_interval()
                .saturating_sub(self.last_activity.elapsed()),
        )
    }

    /// True if a tester present must be sent now to hold the session
    pub fn keep_alive_due(&self) -> bool {
        self.time_until_keep_alive().is_some_and(|d| d.is_zero())
    }

    /// Sends tester present if it is due.
    ///
    /// Returns true if one was sent
    pub fn keep_alive_if_due(&mut self) -> DiagServerResult<bool> {
        if !self.keep_alive_due() {
            return Ok(false);
        }
        match self.tester_present() {
            Ok(()) => Ok(true),
            Err(e) => {
                warn!("Tester present send failure. Assuming default diag session state");
                self.set_session(DiagnosticSession::Default);
                Err(e)
            }
        }
    }

    /// Ends the session and closes the transport. The engine cannot be used afterwards
    pub fn disconnect(&mut self) -> DiagServerResult<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.set_session(DiagnosticSession::Default);
        info!("Disconnecting diagnostic session of '{}'", self.vehicle_id);
        self.transport.disconnect()?;
        Ok(())
    }

    /// Sends a request and waits for its response.
    ///
    /// Response pending replies are waited out according to the [RetryPolicy]. Every other
    /// negative response is returned as [DiagError::NegativeResponse]. Returns the positive
    /// response data after the SID
    pub fn transact(&mut self, request: &UdsRequest) -> DiagServerResult<Vec<u8>> {
        if !self.connected {
            return Err(SessionError::Disconnected.into());
        }
        self.check_s3();
        debug!("Sending req to ECU: {:02X?}", request.to_bytes());
        let msg = LogicalMessage::try_from(request.to_bytes())?;
        self.transport.send(&msg)?;
        self.last_activity = Instant::now();
        if !request.requires_response() {
            return Ok(Vec::new());
        }

        let mut pending = 0u32;
        loop {
            let reply = self.transport.receive(self.options.response_timeout)?;
            self.last_activity = Instant::now();
            debug!("ECU Response: {:02X?}", reply.as_bytes());
            match UdsResponse::decode(reply.as_bytes())?.for_request(request.sid())? {
                Ok(data) => return Ok(data),
                Err(NRC_RESPONSE_PENDING) => {
                    pending += 1;
                    if !self.options.retry_policy.keep_waiting(pending) {
                        warn!(
                            "ECU still busy after {pending} response pending replies, giving up"
                        );
                        return Err(negative_response(NRC_RESPONSE_PENDING));
                    }
                    debug!("ECU is busy, awaiting response");
                }
                Err(nrc) => {
                    warn!("ECU Negative response {nrc:02X?}");
                    if self.session.needs_keep_alive()
                        && matches!(
                            nrc,
                            NRC_SERVICE_NOT_SUPPORTED_IN_ACTIVE_SESSION
                                | NRC_SUB_FUNCTION_NOT_SUPPORTED_IN_ACTIVE_SESSION
                        )
                    {
                        warn!("ECU no longer accepts {} session requests. Assuming default diag session state", self.session);
                        let session = self.session;
                        self.set_session(DiagnosticSession::Default);
                        return Err(SessionError::Lost { session, nrc }.into());
                    }
                    return Err(negative_response(nrc));
                }
            }
        }
    }

    /// Shorthand for [UdsSessionEngine::transact] with a service and parameters
    pub fn send_command_with_response(
        &mut self,
        cmd: UdsCommand,
        args: &[u8],
    ) -> DiagServerResult<Vec<u8>> {
        self.transact(&UdsRequest::new(cmd, args))
    }

    pub(crate) fn set_session(&mut self, session: DiagnosticSession) {
        if session != self.session {
            info!(
                "'{}' diagnostic session {} -> {}",
                self.vehicle_id, self.session, session
            );
            self.security_level = None;
            if session == DiagnosticSession::Default {
                self.timing = None;
            }
        }
        self.session = session;
    }

    pub(crate) fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    pub(crate) fn dtc_lookup(&self) -> &dyn DtcLookup {
        self.dtc_lookup.as_ref()
    }

    fn check_s3(&mut self) {
        if self.session.needs_keep_alive() && self.last_activity.elapsed() > self.options.s3_timeout
        {
            warn!(
                "S3 timer of '{}' lapsed without tester present",
                self.vehicle_id
            );
            self.set_session(self.session.on_s3_expired());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    #[test]
    fn session_ids_and_names() {
        assert_eq!(DiagnosticSession::Extended.id(), 0x03);
        assert_eq!(
            DiagnosticSession::from_id(0x02),
            Some(DiagnosticSession::Programming)
        );
        assert_eq!(DiagnosticSession::from_id(0x04), None);
        assert_eq!(
            DiagnosticSession::from_str("EXTENDED").unwrap(),
            DiagnosticSession::Extended
        );
        assert_eq!(DiagnosticSession::Programming.to_string(), "programming");
    }

    #[test]
    fn session_transitions() {
        let s = DiagnosticSession::Default;
        assert_eq!(
            s.transition(DiagnosticSession::Extended, false),
            DiagnosticSession::Default
        );
        let s = s.transition(DiagnosticSession::Extended, true);
        assert_eq!(s, DiagnosticSession::Extended);
        assert!(s.needs_keep_alive());
        assert_eq!(s.on_s3_expired(), DiagnosticSession::Default);
    }

    #[test]
    fn decode_responses() {
        assert_eq!(
            UdsResponse::decode(&[0x7F, 0x22, 0x31]).unwrap(),
            UdsResponse::Negative {
                sid: 0x22,
                nrc: 0x31
            }
        );
        assert!(matches!(
            UdsResponse::decode(&[0x7F, 0x22]),
            Err(ProtocolError::MalformedNegativeResponse(_))
        ));
        assert_eq!(UdsResponse::decode(&[]), Err(ProtocolError::EmptyResponse));
        let pos = UdsResponse::decode(&[0x50, 0x03, 0x00, 0x32, 0x01, 0xF4]).unwrap();
        assert_eq!(
            pos.clone().for_request(0x10).unwrap(),
            Ok(vec![0x03, 0x00, 0x32, 0x01, 0xF4])
        );
        assert_eq!(
            pos.for_request(0x22),
            Err(ProtocolError::UnexpectedSid {
                expected: 0x62,
                got: 0x50
            })
        );
    }

    #[test]
    fn retry_policy_limit() {
        let p = RetryPolicy::default();
        assert!(p.keep_waiting(1));
        assert!(p.keep_waiting(2));
        assert!(!p.keep_waiting(3));
    }

    #[test]
    fn request_encoding() {
        let r = UdsRequest::new(UdsCommand::ReadDataByIdentifier, &[0xF1, 0x90]);
        assert_eq!(r.to_bytes(), &[0x22, 0xF1, 0x90]);
        assert!(r.requires_response());
        assert!(!r.without_response().requires_response());
    }

    #[test]
    fn keep_alive_interval_defaults_to_half_s3() {
        let o = UdsSessionOptions::default();
        assert_eq!(o.keep_alive_interval(), Duration::from_millis(2500));
    }
}
