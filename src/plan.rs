//! Diagnostic plans and the results of running them

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use crate::{
    DiagError,
    dtc::DtcRecord,
    isotp::ChannelStatistics,
    uds::{ALL_DTC_GROUPS, ALL_DTC_STATUS_BITS, DiagnosticSession, KeyFunction},
};

/// One step of a [DiagnosticPlan]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdsOperation {
    /// DiagnosticSessionControl
    SessionControl(DiagnosticSession),
    /// ReadDTCInformation by status mask
    ReadDtc {
        /// DTC status mask
        status_mask: u8,
    },
    /// ReadDataByIdentifier
    ReadDataByIdentifier(Vec<u16>),
    /// Read the VIN (DID 0xF190)
    ReadVin,
    /// ClearDiagnosticInformation
    ClearDtc {
        /// DTC group
        group: u32,
    },
    /// TesterPresent
    TesterPresent,
    /// SecurityAccess seed/key exchange using the plan's key function
    SecurityAccess {
        /// Odd seed request level
        level: u8,
    },
    /// Hold the session idle. Tester present keeps running meanwhile
    Wait(Duration),
}

impl fmt::Display for UdsOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SessionControl(s) => write!(f, "SessionControl({s})"),
            Self::ReadDtc { status_mask } => write!(f, "ReadDtc(0x{status_mask:02X})"),
            Self::ReadDataByIdentifier(ids) => write!(f, "ReadDataByIdentifier({ids:04X?})"),
            Self::ReadVin => write!(f, "ReadVin"),
            Self::ClearDtc { group } => write!(f, "ClearDtc(0x{group:06X})"),
            Self::TesterPresent => write!(f, "TesterPresent"),
            Self::SecurityAccess { level } => write!(f, "SecurityAccess(0x{level:02X})"),
            Self::Wait(d) => write!(f, "Wait({d:?})"),
        }
    }
}

/// Ordered list of operations run against each vehicle
#[derive(Clone, Default)]
pub struct DiagnosticPlan {
    operations: Vec<UdsOperation>,
    key_fn: Option<Arc<KeyFunction>>,
}

impl fmt::Debug for DiagnosticPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticPlan")
            .field("operations", &self.operations)
            .field("key_fn", &self.key_fn.is_some())
            .finish()
    }
}

impl DiagnosticPlan {
    /// Creates an empty plan
    pub fn new() -> Self {
        Self::default()
    }

    /// The usual fleet scan: enter `session`, read the VIN, then read every stored DTC
    pub fn standard_scan(session: DiagnosticSession) -> Self {
        Self::new()
            .session_control(session)
            .read_vin()
            .read_dtc(ALL_DTC_STATUS_BITS)
    }

    /// Appends an operation
    pub fn then(mut self, op: UdsOperation) -> Self {
        self.operations.push(op);
        self
    }

    /// Appends [UdsOperation::SessionControl]
    pub fn session_control(self, session: DiagnosticSession) -> Self {
        self.then(UdsOperation::SessionControl(session))
    }

    /// Appends [UdsOperation::ReadDtc]
    pub fn read_dtc(self, status_mask: u8) -> Self {
        self.then(UdsOperation::ReadDtc { status_mask })
    }

    /// Appends [UdsOperation::ReadDataByIdentifier]
    pub fn read_data_by_identifier(self, ids: &[u16]) -> Self {
        self.then(UdsOperation::ReadDataByIdentifier(ids.to_vec()))
    }

    /// Appends [UdsOperation::ReadVin]
    pub fn read_vin(self) -> Self {
        self.then(UdsOperation::ReadVin)
    }

    /// Appends [UdsOperation::ClearDtc] for every DTC group
    pub fn clear_dtc(self) -> Self {
        self.then(UdsOperation::ClearDtc {
            group: ALL_DTC_GROUPS,
        })
    }

    /// Appends [UdsOperation::TesterPresent]
    pub fn tester_present(self) -> Self {
        self.then(UdsOperation::TesterPresent)
    }

    /// Appends [UdsOperation::SecurityAccess]
    pub fn security_access(self, level: u8) -> Self {
        self.then(UdsOperation::SecurityAccess { level })
    }

    /// Appends [UdsOperation::Wait]
    pub fn wait(self, duration: Duration) -> Self {
        self.then(UdsOperation::Wait(duration))
    }

    /// Sets the key function used by [UdsOperation::SecurityAccess]
    pub fn with_key_function<F>(mut self, key_fn: F) -> Self
    where
        F: Fn(u8, &[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        let key_fn: Arc<KeyFunction> = Arc::new(key_fn);
        self.key_fn = Some(key_fn);
        self
    }

    /// Operations in execution order
    pub fn operations(&self) -> &[UdsOperation] {
        &self.operations
    }

    /// Key function, if one was set
    pub fn key_function(&self) -> Option<&KeyFunction> {
        self.key_fn.as_deref()
    }

    /// Number of operations
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// True if the plan does nothing
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Number of operations that talk to the ECU
    pub fn request_count(&self) -> usize {
        self.operations
            .iter()
            .filter(|op| !matches!(op, UdsOperation::Wait(_)))
            .count()
    }

    /// Sum of all [UdsOperation::Wait] durations
    pub fn total_wait(&self) -> Duration {
        self.operations
            .iter()
            .filter_map(|op| match op {
                UdsOperation::Wait(d) => Some(*d),
                _ => None,
            })
            .sum()
    }
}

/// Output of one successful operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutput {
    /// The session changed
    SessionChanged(DiagnosticSession),
    /// DTCs read from the ECU
    Dtcs(Vec<DtcRecord>),
    /// Identifiers that could be read
    Data(BTreeMap<u16, Vec<u8>>),
    /// Vehicle identification number
    Vin(String),
    /// DTCs were cleared
    Cleared,
    /// Tester present was acknowledged
    TesterPresent,
    /// Security access was granted
    SecurityUnlocked {
        /// Unlocked level
        level: u8,
        /// False if the ECU was already unlocked
        key_sent: bool,
    },
    /// The session was held idle
    Waited(Duration),
}

/// Everything gathered by a plan
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanData {
    /// Outputs in operation order
    pub outputs: Vec<OperationOutput>,
}

impl ScanData {
    /// Every DTC read by the plan
    pub fn dtcs(&self) -> impl Iterator<Item = &DtcRecord> {
        self.outputs.iter().flat_map(|o| match o {
            OperationOutput::Dtcs(d) => d.as_slice(),
            _ => &[][..],
        })
    }

    /// Value of an identifier, if it was read
    pub fn data(&self, id: u16) -> Option<&[u8]> {
        self.outputs.iter().rev().find_map(|o| match o {
            OperationOutput::Data(d) => d.get(&id).map(Vec::as_slice),
            _ => None,
        })
    }

    /// VIN, if it was read
    pub fn vin(&self) -> Option<&str> {
        self.outputs.iter().find_map(|o| match o {
            OperationOutput::Vin(v) => Some(v.as_str()),
            _ => None,
        })
    }
}

/// A failed operation, or a single identifier that could not be read
#[derive(Debug, Clone)]
pub struct OperationFailure {
    /// Position of the operation in the plan
    pub index: usize,
    /// Operation, as text
    pub operation: String,
    /// What went wrong
    pub error: DiagError,
}

impl fmt::Display for OperationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}: {}", self.index, self.operation, self.error)
    }
}

/// How a plan went for one vehicle
#[derive(Debug, Clone)]
pub enum ScanOutcome {
    /// Every operation succeeded
    Success(ScanData),
    /// Some data was gathered before something failed
    PartialFailure(ScanData, Vec<OperationFailure>),
    /// Nothing was gathered
    Failure(DiagError),
}

/// Result of running a plan against one vehicle
#[derive(Debug, Clone)]
pub struct ScanResult {
    /// Vehicle the plan ran against
    pub vehicle_id: String,
    /// Outcome
    pub outcome: ScanOutcome,
    /// Wall time taken
    pub elapsed: Duration,
    /// Transport counters of the vehicle's channel
    pub statistics: ChannelStatistics,
}

impl ScanResult {
    /// A result for a vehicle that could not be scanned at all
    pub fn failure(vehicle_id: &str, error: DiagError, elapsed: Duration) -> Self {
        Self {
            vehicle_id: vehicle_id.to_string(),
            outcome: ScanOutcome::Failure(error),
            elapsed,
            statistics: ChannelStatistics::default(),
        }
    }

    /// True if every operation succeeded
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, ScanOutcome::Success(_))
    }

    /// True if some operations failed after data was gathered
    pub fn is_partial(&self) -> bool {
        matches!(self.outcome, ScanOutcome::PartialFailure(..))
    }

    /// True if nothing was gathered
    pub fn is_failure(&self) -> bool {
        matches!(self.outcome, ScanOutcome::Failure(_))
    }

    /// Data gathered, if any
    pub fn data(&self) -> Option<&ScanData> {
        match &self.outcome {
            ScanOutcome::Success(d) | ScanOutcome::PartialFailure(d, _) => Some(d),
            ScanOutcome::Failure(_) => None,
        }
    }

    /// Every error of the scan as text
    pub fn errors(&self) -> Vec<String> {
        match &self.outcome {
            ScanOutcome::Success(_) => Vec::new(),
            ScanOutcome::PartialFailure(_, f) => f.iter().map(|e| e.to_string()).collect(),
            ScanOutcome::Failure(e) => vec![e.to_string()],
        }
    }

    /// Every DTC read by the scan
    pub fn dtcs(&self) -> Vec<DtcRecord> {
        self.data()
            .map(|d| d.dtcs().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_builder() {
        let plan = DiagnosticPlan::standard_scan(DiagnosticSession::Extended)
            .wait(Duration::from_millis(200))
            .wait(Duration::from_millis(300));
        assert_eq!(plan.len(), 5);
        assert_eq!(plan.request_count(), 3);
        assert_eq!(plan.total_wait(), Duration::from_millis(500));
        assert_eq!(
            plan.operations()[0],
            UdsOperation::SessionControl(DiagnosticSession::Extended)
        );
        assert!(plan.key_function().is_none());
    }

    #[test]
    fn operation_names() {
        assert_eq!(
            UdsOperation::ReadDataByIdentifier(vec![0xF190, 0xF187]).to_string(),
            "ReadDataByIdentifier([F190, F187])"
        );
        assert_eq!(
            UdsOperation::SessionControl(DiagnosticSession::Extended).to_string(),
            "SessionControl(extended)"
        );
    }

    #[test]
    fn scan_data_accessors() {
        let mut data = BTreeMap::new();
        data.insert(0xF187, vec![1, 2]);
        let d = ScanData {
            outputs: vec![
                OperationOutput::Vin("WVW123".into()),
                OperationOutput::Data(data),
            ],
        };
        assert_eq!(d.vin(), Some("WVW123"));
        assert_eq!(d.data(0xF187), Some(&[1u8, 2][..]));
        assert_eq!(d.dtcs().count(), 0);
    }
}
