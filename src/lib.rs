#![warn(
    missing_docs,
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate for running UDS diagnostics across a fleet of vehicles over CAN-FD.
//!
//! ## Layers
//!
//! The crate is built from the bottom up out of the following layers
//!
//! ### Raw channel
//! [channel::CanChannel] is the boundary to the physical bus. It sends and receives single
//! CAN or CAN-FD frames (up to 64 bytes) and nothing more. [hardware::Hardware] implementations
//! hand out one channel per vehicle.
//!
//! ### Transport segmenter (ISO15765-2)
//! [isotp::IsoTpSegmenter] maps logical diagnostic messages of 1 to 4095 bytes onto
//! single, first, consecutive and flow control frames, and reassembles multi-frame responses.
//!
//! ### Unified diagnostic services (UDS)
//! ISO14229 - [uds::UdsSessionEngine] tracks the active diagnostic session of one ECU,
//! encodes requests, validates responses and applies the response pending (NRC 0x78) policy.
//! The services supported are
//! * DiagnosticSessionControl (0x10)
//! * ClearDiagnosticInformation (0x14)
//! * ReadDTCInformation (0x19)
//! * ReadDataByIdentifier (0x22)
//! * SecurityAccess (0x27)
//! * TesterPresent (0x3E)
//!
//! ### Vehicle session and fleet scheduler
//! [vehicle::VehicleSession] runs a [plan::DiagnosticPlan] against one vehicle and keeps its
//! diagnostic session alive with tester present messages. [fleet::FleetScheduler] runs plans
//! over many vehicles with bounded concurrency, so a failure of one vehicle never affects another.
//!
//! ### Aggregation
//! Every DTC and scan result ends up in the bounded [aggregator::DiagnosticsAggregator], which
//! can be exported as an immutable [aggregator::Snapshot].
//!
//! ## Hardware support
//!
//! * [hardware::simulation] - In process simulated ECUs, used for bench testing
//! * `hardware::socketcan` - Linux SocketCAN CAN-FD sockets (requires the `socketcan` feature)

use std::sync::Arc;

use hardware::HardwareError;
use isotp::TransportError;
use uds::SessionError;

pub mod aggregator;
pub mod channel;
pub mod config;
pub mod dtc;
pub mod fleet;
pub mod hardware;
mod helpers;
pub mod isotp;
pub mod plan;
pub mod uds;
pub mod vehicle;

pub use helpers::CancelToken;

/// Diagnostic server result
pub type DiagServerResult<T> = Result<T, DiagError>;

#[derive(Clone, Debug, thiserror::Error)]
/// Diagnostic server error
pub enum DiagError {
    /// The request is not supported
    #[error("Request is not supported: '{0}'")]
    NotSupported(String),
    /// Negative response code from the ECU itself
    #[error("ECU Negative response. Error 0x{:02X?}, definition: {:?}", code, def)]
    NegativeResponse {
        /// Raw Negative response code from ECU
        code: u8,
        /// Negative response code definition according to protocol
        def: Option<String>,
    },
    /// Error in the transport layer (ISO-TP or the CAN channel below it)
    #[error("Transport layer error")]
    Transport(
        #[from]
        #[source]
        TransportError,
    ),
    /// The ECU sent something that is not a valid reply to the request
    #[error("Protocol error")]
    Protocol(
        #[from]
        #[source]
        ProtocolError,
    ),
    /// Diagnostic session state error
    #[error("Diagnostic session error")]
    Session(
        #[from]
        #[source]
        SessionError,
    ),
    /// Device hardware error
    #[error("Diagnostic server hardware error")]
    HardwareError(
        #[from]
        #[source]
        Arc<HardwareError>,
    ),
    /// No vehicle is registered with the given identifier
    #[error("Vehicle '{0}' not found")]
    VehicleNotFound(String),
    /// The vehicle did not finish its diagnostics within its time budget
    #[error("Vehicle diagnostics timed out")]
    Timeout,
    /// The work was cancelled before it could complete
    #[error("Operation was cancelled")]
    Cancelled,
    /// A parameter given to the function is invalid
    #[error("Diagnostic function parameter invalid: {0}")]
    ParameterInvalid(String),
    /// Configuration is invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    /// A vehicle worker panicked. The vehicle is reported as failed
    #[error("Vehicle worker fault: {0}")]
    Fault(String),
}

impl DiagError {
    /// Returns the raw negative response code if this error is an ECU negative response
    pub fn nrc(&self) -> Option<u8> {
        match self {
            Self::NegativeResponse { code, .. } => Some(*code),
            Self::Session(SessionError::ControlRejected { reason, .. }) => reason.nrc(),
            Self::Session(SessionError::Lost { nrc, .. }) => Some(*nrc),
            _ => None,
        }
    }

    /// Returns true if the error was caused by the time budget of the vehicle running out
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl From<HardwareError> for DiagError {
    fn from(err: HardwareError) -> Self {
        Self::HardwareError(Arc::new(err))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
/// Malformed or unexpected UDS payload
pub enum ProtocolError {
    /// ECU response was empty
    #[error("ECU response was empty")]
    EmptyResponse,
    /// Response service ID does not belong to the request
    #[error("Expected response SID 0x{expected:02X}, got 0x{got:02X}")]
    UnexpectedSid {
        /// Expected response SID
        expected: u8,
        /// Response SID received from the ECU
        got: u8,
    },
    /// Negative response too short to carry an NRC
    #[error("Negative response is malformed: {0:02X?}")]
    MalformedNegativeResponse(Vec<u8>),
    /// The response length does not match the service layout
    #[error("Response of service 0x{sid:02X} has an invalid length of {len} bytes")]
    InvalidResponseLength {
        /// Request service ID
        sid: u8,
        /// Length of the response payload
        len: usize,
    },
    /// The response echoed a different sub function or parameter than requested
    #[error("Requested 0x{want:02X}, but the ECU echoed 0x{received:02X}")]
    MismatchedEcho {
        /// Requested sub function
        want: u8,
        /// Echo received from the ECU
        received: u8,
    },
    /// An identifier requested by ReadDataByIdentifier was missing from the response
    #[error("Identifier 0x{0:04X} was missing from the response")]
    MissingIdentifier(u16),
    /// Data could not be decoded as text
    #[error("{0} is not valid ASCII")]
    InvalidText(&'static str),
}
