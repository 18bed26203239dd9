//! A diagnostic session with one vehicle.
//!
//! [VehicleSession] binds one ISO-TP segmenter and one [UdsSessionEngine] to the addressing
//! of a single vehicle. It is the unit of concurrency of the fleet scheduler: a session runs
//! its plan sequentially on the calling thread, with a second thread sending tester present
//! messages whenever the ECU is outside of the default session.

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Condvar, Mutex, PoisonError, mpsc},
    thread,
    time::{Duration, Instant},
};

use log::{debug, info, warn};

use crate::{
    DiagError, DiagServerResult,
    config::FleetConfig,
    dtc::DtcLookup,
    hardware::Hardware,
    helpers::{CANCEL_POLL_INTERVAL, CancelToken, lock},
    isotp::IsoTpSegmenter,
    plan::{
        DiagnosticPlan, OperationFailure, OperationOutput, ScanData, ScanOutcome, ScanResult,
        UdsOperation,
    },
    uds::{KeyFunction, UdsSessionEngine},
};

/// Default physical request ID of an engine ECU
pub const DEFAULT_REQUEST_ID: u32 = 0x7E0;
/// Default physical response ID of an engine ECU
pub const DEFAULT_RESPONSE_ID: u32 = 0x7E8;

/// A vehicle of the fleet and how to reach it
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VehicleHandle {
    /// Fleet wide unique ID
    pub vehicle_id: String,
    /// Vehicle identification number, if known
    pub vin: Option<String>,
    /// Manufacturer
    pub make: Option<String>,
    /// Model
    pub model: Option<String>,
    /// Model year
    pub year: Option<u16>,
    /// Request (tester to ECU) CAN ID
    pub ta: u32,
    /// Response (ECU to tester) CAN ID
    pub ta_rx: u32,
    /// Interface to use instead of `can.interface`
    pub interface: Option<String>,
}

impl VehicleHandle {
    /// Creates a handle using the default engine ECU addressing
    pub fn new(vehicle_id: &str) -> Self {
        Self {
            vehicle_id: vehicle_id.to_string(),
            vin: None,
            make: None,
            model: None,
            year: None,
            ta: DEFAULT_REQUEST_ID,
            ta_rx: DEFAULT_RESPONSE_ID,
            interface: None,
        }
    }

    /// Sets the request and response CAN IDs
    pub fn with_addressing(mut self, ta: u32, ta_rx: u32) -> Self {
        self.ta = ta;
        self.ta_rx = ta_rx;
        self
    }

    /// Reaches the vehicle through `interface`
    pub fn with_interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.to_string());
        self
    }

    /// Sets the VIN
    pub fn with_vin(mut self, vin: &str) -> Self {
        self.vin = Some(vin.to_string());
        self
    }

    /// Sets make, model and model year
    pub fn with_model(mut self, make: &str, model: &str, year: u16) -> Self {
        self.make = Some(make.to_string());
        self.model = Some(model.to_string());
        self.year = Some(year);
        self
    }

    /// Interface the vehicle is reached through
    pub fn interface_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.interface.as_deref().unwrap_or(default)
    }

    /// Addressing context the vehicle occupies on the bus
    pub fn address_key(&self, default_interface: &str) -> AddressKey {
        AddressKey {
            interface: self.interface_or(default_interface).to_string(),
            ta: self.ta,
            ta_rx: self.ta_rx,
        }
    }
}

/// An interface and a TA / TA_RX pair
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AddressKey {
    /// Interface name
    pub interface: String,
    /// Request CAN ID
    pub ta: u32,
    /// Response CAN ID
    pub ta_rx: u32,
}

impl fmt::Display for AddressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} 0x{:03X}/0x{:03X}", self.interface, self.ta, self.ta_rx)
    }
}

/// Tracks which addressing contexts are in use.
///
/// Two sessions with the same [AddressKey] would read each other's responses, so a session
/// holds an [AddressLease] for its lifetime and a second session on the same key waits
#[derive(Debug, Default)]
pub struct AddressRegistry {
    leased: Mutex<HashSet<AddressKey>>,
    released: Condvar,
}

impl AddressRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Leases `key`, waiting for the current holder to release it.
    ///
    /// The wait ends with [DiagError::Timeout] or [DiagError::Cancelled] once `cancel` fires
    pub fn acquire(&self, key: AddressKey, cancel: &CancelToken) -> DiagServerResult<AddressLease<'_>> {
        let mut leased = lock(&self.leased);
        let mut waiting = false;
        loop {
            if cancel.is_cancelled() {
                return Err(cancel.error());
            }
            if leased.insert(key.clone()) {
                return Ok(AddressLease {
                    registry: self,
                    key,
                });
            }
            if !waiting {
                debug!("Waiting for {key} to be released");
                waiting = true;
            }
            leased = self
                .released
                .wait_timeout(leased, CANCEL_POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Leases `key` if it is free
    pub fn try_acquire(&self, key: AddressKey) -> Option<AddressLease<'_>> {
        lock(&self.leased)
            .insert(key.clone())
            .then(|| AddressLease {
                registry: self,
                key,
            })
    }

    /// True if `key` is leased
    pub fn is_leased(&self, key: &AddressKey) -> bool {
        lock(&self.leased).contains(key)
    }

    /// Number of leases held
    pub fn len(&self) -> usize {
        lock(&self.leased).len()
    }

    /// True if no lease is held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An addressing context in use. Released on drop
#[derive(Debug)]
pub struct AddressLease<'a> {
    registry: &'a AddressRegistry,
    key: AddressKey,
}

impl AddressLease<'_> {
    /// Leased key
    pub fn key(&self) -> &AddressKey {
        &self.key
    }
}

impl Drop for AddressLease<'_> {
    fn drop(&mut self) {
        lock(&self.registry.leased).remove(&self.key);
        self.registry.released.notify_all();
    }
}

/// An open diagnostic session with one vehicle
pub struct VehicleSession<'a> {
    handle: VehicleHandle,
    engine: UdsSessionEngine,
    cancel: CancelToken,
    lease: AddressLease<'a>,
    opened: Instant,
}

impl fmt::Debug for VehicleSession<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VehicleSession")
            .field("vehicle", &self.handle.vehicle_id)
            .field("address", &self.lease.key())
            .field("engine", &self.engine)
            .finish()
    }
}

impl<'a> VehicleSession<'a> {
    /// Leases the vehicle's addressing, opens a channel to it through `hardware` and
    /// connects the transport.
    ///
    /// Every blocking wait of the session, including the wait for the lease, is bound by `cancel`
    pub fn open(
        handle: &VehicleHandle,
        hardware: &dyn Hardware,
        config: &FleetConfig,
        leases: &'a AddressRegistry,
        lookup: Arc<dyn DtcLookup>,
        cancel: CancelToken,
    ) -> DiagServerResult<Self> {
        let lease = leases.acquire(handle.address_key(&config.can.interface), &cancel)?;
        Self::with_lease(handle, hardware, config, lease, lookup, cancel)
    }

    /// Opens a session on addressing already leased for the vehicle
    pub fn with_lease(
        handle: &VehicleHandle,
        hardware: &dyn Hardware,
        config: &FleetConfig,
        lease: AddressLease<'a>,
        lookup: Arc<dyn DtcLookup>,
        cancel: CancelToken,
    ) -> DiagServerResult<Self> {
        let opened = Instant::now();
        let channel = hardware.create_can_channel(handle)?;
        let mut transport = IsoTpSegmenter::new(
            channel,
            handle.ta,
            handle.ta_rx,
            config.isotp_settings(),
        )
        .with_cancel_token(cancel.clone());
        transport.connect(
            handle.interface_or(&config.can.interface),
            config.can.bitrate,
            config.can.data_bitrate,
        )?;
        info!(
            "Opened diagnostic session with '{}' on {}",
            handle.vehicle_id,
            lease.key()
        );
        let engine = UdsSessionEngine::new(transport, config.uds_options())
            .with_vehicle_id(&handle.vehicle_id)
            .with_dtc_lookup(lookup);
        Ok(Self {
            handle: handle.clone(),
            engine,
            cancel,
            lease,
            opened,
        })
    }

    /// Vehicle of the session
    pub fn handle(&self) -> &VehicleHandle {
        &self.handle
    }

    /// Engine of the session, for requests outside of a plan.
    ///
    /// No tester present messages are sent while the engine is used directly
    pub fn engine(&mut self) -> &mut UdsSessionEngine {
        &mut self.engine
    }

    /// Ends the session and releases the vehicle's addressing
    pub fn close(mut self) -> DiagServerResult<()> {
        self.engine.disconnect()
    }

    /// Runs every operation of `plan` in order and closes the session.
    ///
    /// Execution stops at the first failed operation. Identifiers that could not be read
    /// are reported without stopping the plan
    pub fn run_plan(self, plan: &DiagnosticPlan) -> ScanResult {
        let VehicleSession {
            handle,
            engine,
            cancel,
            lease,
            opened,
        } = self;
        info!(
            "Running {} operation(s) against '{}'",
            plan.len(),
            handle.vehicle_id
        );
        let engine = Mutex::new(engine);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (data, failures, fatal) = thread::scope(|s| {
            let engine = &engine;
            let cancel = &cancel;
            s.spawn(move || keep_alive(engine, stop_rx, cancel));
            let res = execute(engine, plan, cancel);
            drop(stop_tx);
            res
        });

        let mut engine = engine.into_inner().unwrap_or_else(PoisonError::into_inner);
        let statistics = engine.statistics();
        if let Err(e) = engine.disconnect() {
            warn!("Disconnecting '{}' failed: {e}", handle.vehicle_id);
        }
        // The channel must be gone before the next holder of the address opens its own
        drop(engine);
        drop(lease);

        let outcome = match fatal {
            // Whatever was collected before the deadline or cancellation is discarded
            Some(failure) if cancel.is_cancelled() => ScanOutcome::Failure(failure.error),
            None if failures.is_empty() => ScanOutcome::Success(data),
            Some(failure) if data.outputs.is_empty() => ScanOutcome::Failure(failure.error),
            Some(failure) => {
                let mut failures = failures;
                failures.push(failure);
                ScanOutcome::PartialFailure(data, failures)
            }
            None => ScanOutcome::PartialFailure(data, failures),
        };
        let result = ScanResult {
            vehicle_id: handle.vehicle_id,
            outcome,
            elapsed: opened.elapsed(),
            statistics,
        };
        match &result.outcome {
            ScanOutcome::Success(_) => info!(
                "Diagnostics of '{}' completed in {:?}",
                result.vehicle_id, result.elapsed
            ),
            ScanOutcome::PartialFailure(_, f) => warn!(
                "Diagnostics of '{}' completed with {} error(s)",
                result.vehicle_id,
                f.len()
            ),
            ScanOutcome::Failure(e) => warn!("Diagnostics of '{}' failed: {e}", result.vehicle_id),
        }
        result
    }
}

/// Sends tester present whenever it is due, until `stop` is dropped or `cancel` fires
fn keep_alive(engine: &Mutex<UdsSessionEngine>, stop: mpsc::Receiver<()>, cancel: &CancelToken) {
    loop {
        let wait = lock(engine)
            .time_until_keep_alive()
            .unwrap_or(CANCEL_POLL_INTERVAL * 5)
            .max(Duration::from_millis(1));
        match stop.recv_timeout(wait) {
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            _ => return,
        }
        if cancel.is_cancelled() {
            return;
        }
        if let Err(e) = lock(engine).keep_alive_if_due() {
            warn!("Keep alive failed: {e}");
        }
    }
}

type Execution = (ScanData, Vec<OperationFailure>, Option<OperationFailure>);

fn execute(engine: &Mutex<UdsSessionEngine>, plan: &DiagnosticPlan, cancel: &CancelToken) -> Execution {
    let mut data = ScanData::default();
    let mut failures = Vec::new();
    for (index, op) in plan.operations().iter().enumerate() {
        let failure = |error: DiagError| OperationFailure {
            index,
            operation: op.to_string(),
            error,
        };
        if cancel.is_cancelled() {
            return (data, failures, Some(failure(cancel.error())));
        }
        debug!("Operation #{index}: {op}");
        match run_operation(engine, op, plan.key_function(), cancel) {
            Ok((output, errors)) => {
                failures.extend(errors.into_iter().map(|(id, e)| OperationFailure {
                    index,
                    operation: format!("ReadDataByIdentifier(0x{id:04X})"),
                    error: e,
                }));
                data.outputs.push(output);
            }
            Err(e) => {
                // A failure caused by the token firing is reported as the token's error
                let e = if cancel.is_cancelled() { cancel.error() } else { e };
                return (data, failures, Some(failure(e)));
            }
        }
    }
    (data, failures, None)
}

type DidErrors = Vec<(u16, DiagError)>;

fn run_operation(
    engine: &Mutex<UdsSessionEngine>,
    op: &UdsOperation,
    key_fn: Option<&KeyFunction>,
    cancel: &CancelToken,
) -> DiagServerResult<(OperationOutput, DidErrors)> {
    let output = match op {
        // The engine is not locked while waiting, so tester present keeps running
        UdsOperation::Wait(d) => {
            if !cancel.sleep(*d) {
                return Err(cancel.error());
            }
            OperationOutput::Waited(*d)
        }
        UdsOperation::SessionControl(target) => {
            lock(engine).session_control(*target)?;
            OperationOutput::SessionChanged(*target)
        }
        UdsOperation::ReadDtc { status_mask } => {
            OperationOutput::Dtcs(lock(engine).read_dtc(*status_mask)?)
        }
        UdsOperation::ReadDataByIdentifier(ids) => {
            let readout = lock(engine).read_data_by_identifier(ids)?;
            return Ok((
                OperationOutput::Data(readout.values),
                readout.errors.into_iter().collect(),
            ));
        }
        UdsOperation::ReadVin => OperationOutput::Vin(lock(engine).read_vin()?),
        UdsOperation::ClearDtc { group } => {
            lock(engine).clear_dtc(*group)?;
            OperationOutput::Cleared
        }
        UdsOperation::TesterPresent => {
            lock(engine).tester_present()?;
            OperationOutput::TesterPresent
        }
        UdsOperation::SecurityAccess { level } => {
            let key_fn = key_fn.ok_or_else(|| {
                DiagError::ParameterInvalid("security access needs a key function".into())
            })?;
            let key_sent = lock(engine).security_access(*level, key_fn)?;
            OperationOutput::SecurityUnlocked {
                level: *level,
                key_sent,
            }
        }
    };
    Ok((output, Vec::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dtc::DtcTable,
        hardware::simulation::{SimulatedEcu, SimulationHardware},
    };

    #[test]
    fn lease_blocks_second_holder() {
        let reg = AddressRegistry::new();
        let key = VehicleHandle::new("a").address_key("can0");
        let lease = reg.acquire(key.clone(), &CancelToken::new()).unwrap();
        assert!(reg.is_leased(&key));
        assert!(reg.try_acquire(key.clone()).is_none());
        let err = reg
            .acquire(key.clone(), &CancelToken::with_timeout(Duration::from_millis(50)))
            .unwrap_err();
        assert!(err.is_timeout());
        drop(lease);
        assert!(reg.is_empty());
        assert!(reg.try_acquire(key).is_some());
    }

    #[test]
    fn lease_is_handed_over() {
        let reg = AddressRegistry::new();
        let key = VehicleHandle::new("a").address_key("can0");
        let lease = reg.acquire(key.clone(), &CancelToken::new()).unwrap();
        thread::scope(|s| {
            let t = s.spawn(|| reg.acquire(key.clone(), &CancelToken::new()).is_ok());
            thread::sleep(Duration::from_millis(30));
            drop(lease);
            assert!(t.join().unwrap());
        });
    }

    fn simulated(ecu: SimulatedEcu) -> (SimulationHardware, FleetConfig) {
        let hw = SimulationHardware::new();
        hw.add_vehicle("VEH001", ecu);
        let cfg = FleetConfig::from_pairs([("uds.timeout", "200"), ("can.timeout", "200")]).unwrap();
        (hw, cfg)
    }

    #[test]
    fn session_runs_plan_and_releases_lease() {
        let (hw, cfg) = simulated(SimulatedEcu::new(0x7E0, 0x7E8).with_vin("WVWZZZ1JZXW000001"));
        let reg = AddressRegistry::new();
        let handle = VehicleHandle::new("VEH001");
        let session = VehicleSession::open(
            &handle,
            &hw,
            &cfg,
            &reg,
            Arc::new(DtcTable::new()),
            CancelToken::new(),
        )
        .unwrap();
        assert!(reg.is_leased(&handle.address_key("can0")));
        let result = session.run_plan(&DiagnosticPlan::new().read_vin().tester_present());
        assert!(result.is_success(), "{result:?}");
        assert!(reg.is_empty());
    }

    #[test]
    fn expired_session_is_a_timeout_failure() {
        let (hw, cfg) = simulated(SimulatedEcu::new(0x7E0, 0x7E8));
        let reg = AddressRegistry::new();
        let session = VehicleSession::open(
            &VehicleHandle::new("VEH001"),
            &hw,
            &cfg,
            &reg,
            Arc::new(DtcTable::new()),
            CancelToken::with_timeout(Duration::from_millis(150)),
        )
        .unwrap();
        // The tester present answer is collected before the deadline hits the wait
        let result = session.run_plan(
            &DiagnosticPlan::new()
                .tester_present()
                .wait(Duration::from_secs(5)),
        );
        assert!(matches!(result.outcome, ScanOutcome::Failure(DiagError::Timeout)));
    }

    #[test]
    fn interface_override() {
        let h = VehicleHandle::new("a")
            .with_interface("vcan1")
            .with_addressing(0x18DA_10F1, 0x18DA_F110);
        let key = h.address_key("can0");
        assert_eq!(key.interface, "vcan1");
        assert_eq!(key.ta, 0x18DA_10F1);
        assert_eq!(VehicleHandle::new("b").address_key("can0").interface, "can0");
    }
}
