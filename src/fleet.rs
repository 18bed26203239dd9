//! Fleet scheduler.
//!
//! [FleetScheduler] keeps the registry of vehicles and runs diagnostic plans across them with
//! a fixed pool of worker threads. Each vehicle is diagnosed in its own [VehicleSession] under
//! its own time budget. Errors, timeouts and panics of one vehicle end up in that vehicle's
//! [ScanResult] and never abort the rest of the scan.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, mpsc},
    thread,
    time::{Duration, Instant, SystemTime},
};

use log::{error, info, warn};

use crate::{
    DiagError, DiagServerResult,
    aggregator::{AggregatorEntry, AggregatorSummary, DiagnosticsAggregator, ScanStatus, ScanSummary},
    config::FleetConfig,
    dtc::{DtcLookup, DtcTable},
    hardware::Hardware,
    helpers::{CancelToken, lock, panic_message},
    plan::{DiagnosticPlan, ScanResult},
    vehicle::{AddressRegistry, VehicleHandle, VehicleSession},
};

/// A vehicle known to the scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RegisteredVehicle {
    /// How to reach the vehicle
    pub handle: VehicleHandle,
    /// Last reported connectivity
    pub online: bool,
    /// Last time the vehicle was reported online or answered a scan
    pub last_seen: Option<SystemTime>,
    /// When the vehicle was registered
    pub registered_at: SystemTime,
}

/// Counters over the latest result of every vehicle
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FleetStatus {
    /// Vehicles registered or scanned
    pub total: usize,
    /// Registered vehicles reported online
    pub connected: usize,
    /// Vehicles with a scan in progress
    pub scanning: usize,
    /// Vehicles whose latest scan succeeded
    pub succeeded: usize,
    /// Vehicles whose latest scan partially failed
    pub partial: usize,
    /// Vehicles whose latest scan failed
    pub failed: usize,
}

/// Results of scanning many vehicles
#[derive(Debug, Clone)]
pub struct FleetScanReport {
    /// One result per vehicle, in the order the vehicles were given
    pub results: Vec<ScanResult>,
    /// Vehicles scanned
    pub vehicles_scanned: usize,
    /// Vehicles that reported DTCs or did not scan cleanly
    pub vehicles_with_issues: usize,
    /// DTCs found across the fleet
    pub total_dtcs: usize,
    /// Wall time of the whole scan
    pub elapsed: Duration,
}

impl FleetScanReport {
    fn new(results: Vec<ScanResult>, elapsed: Duration) -> Self {
        let dtcs: Vec<usize> = results.iter().map(|r| r.dtcs().len()).collect();
        Self {
            vehicles_scanned: results.len(),
            vehicles_with_issues: results
                .iter()
                .zip(&dtcs)
                .filter(|(r, n)| **n > 0 || !r.is_success())
                .count(),
            total_dtcs: dtcs.iter().sum(),
            results,
            elapsed,
        }
    }
}

/// Fleet level overview
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FleetSummary {
    /// Registered vehicles
    pub total_vehicles: usize,
    /// Registered vehicles reported online
    pub online_vehicles: usize,
    /// Vehicles with DTCs in the aggregator
    pub vehicles_with_dtcs: usize,
    /// Aggregator counters
    pub buffer: AggregatorSummary,
}

#[derive(Debug, Clone, Copy, Default)]
struct VehicleStatus {
    scanning: bool,
    last: Option<ScanStatus>,
}

/// Runs diagnostic plans across a fleet of vehicles
pub struct FleetScheduler {
    config: FleetConfig,
    hardware: Arc<dyn Hardware>,
    lookup: Arc<dyn DtcLookup>,
    registry: RwLock<BTreeMap<String, RegisteredVehicle>>,
    status: RwLock<HashMap<String, VehicleStatus>>,
    leases: AddressRegistry,
    aggregator: DiagnosticsAggregator,
}

impl std::fmt::Debug for FleetScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetScheduler")
            .field("hardware", &self.hardware.get_info().name)
            .field("vehicles", &read(&self.registry).len())
            .field("aggregator", &self.aggregator)
            .finish()
    }
}

fn read<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(PoisonError::into_inner)
}

impl FleetScheduler {
    /// Creates a scheduler diagnosing vehicles through `hardware`
    pub fn new(config: FleetConfig, hardware: Arc<dyn Hardware>) -> DiagServerResult<Self> {
        config.validate()?;
        let aggregator = DiagnosticsAggregator::new(config.fleet.max_buffer_size)?;
        info!(
            "Fleet scheduler on '{}', {} concurrent vehicle(s), buffer of {}",
            hardware.get_info().name,
            config.fleet.max_concurrent_diagnostics,
            config.fleet.max_buffer_size
        );
        Ok(Self {
            config,
            hardware,
            lookup: Arc::new(DtcTable::new()),
            registry: RwLock::new(BTreeMap::new()),
            status: RwLock::new(HashMap::new()),
            leases: AddressRegistry::new(),
            aggregator,
        })
    }

    /// Source of DTC descriptions for every scan
    pub fn with_dtc_lookup(mut self, lookup: Arc<dyn DtcLookup>) -> Self {
        self.lookup = lookup;
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    /// Results collected so far
    pub fn aggregator(&self) -> &DiagnosticsAggregator {
        &self.aggregator
    }

    /// The plan [FleetScheduler::scan_all] is usually given: enter `uds.session_type`,
    /// read the VIN and every DTC
    pub fn standard_plan(&self) -> DiagnosticPlan {
        DiagnosticPlan::standard_scan(self.config.uds.session_type)
    }

    /// Registers a vehicle. Returns the handle it replaced, if one was registered under the same ID
    pub fn register_vehicle(&self, handle: VehicleHandle) -> Option<VehicleHandle> {
        let id = handle.vehicle_id.clone();
        let entry = RegisteredVehicle {
            handle,
            online: false,
            last_seen: None,
            registered_at: SystemTime::now(),
        };
        let old = write(&self.registry).insert(id.clone(), entry);
        if old.is_some() {
            warn!("Vehicle '{id}' registered again, replacing it");
        } else {
            info!("Registered vehicle '{id}'");
        }
        old.map(|v| v.handle)
    }

    /// Removes a vehicle from the registry
    pub fn remove_vehicle(&self, vehicle_id: &str) -> DiagServerResult<VehicleHandle> {
        let removed = write(&self.registry)
            .remove(vehicle_id)
            .ok_or_else(|| DiagError::VehicleNotFound(vehicle_id.to_string()))?;
        write(&self.status).remove(vehicle_id);
        info!("Removed vehicle '{vehicle_id}'");
        Ok(removed.handle)
    }

    /// Records whether a vehicle is reachable
    pub fn update_vehicle_status(&self, vehicle_id: &str, online: bool) -> DiagServerResult<()> {
        let mut registry = write(&self.registry);
        let v = registry
            .get_mut(vehicle_id)
            .ok_or_else(|| DiagError::VehicleNotFound(vehicle_id.to_string()))?;
        v.online = online;
        if online {
            v.last_seen = Some(SystemTime::now());
        }
        Ok(())
    }

    /// A registered vehicle
    pub fn vehicle(&self, vehicle_id: &str) -> Option<RegisteredVehicle> {
        read(&self.registry).get(vehicle_id).cloned()
    }

    /// Every registered vehicle, ordered by ID
    pub fn vehicles(&self) -> Vec<RegisteredVehicle> {
        read(&self.registry).values().cloned().collect()
    }

    /// Runs `plan` against every registered vehicle with `fleet.max_concurrent_diagnostics`
    pub fn scan_all(&self, plan: &DiagnosticPlan) -> DiagServerResult<FleetScanReport> {
        let handles: Vec<VehicleHandle> = read(&self.registry)
            .values()
            .map(|v| v.handle.clone())
            .collect();
        let started = Instant::now();
        let results =
            self.scan_fleet(&handles, plan, self.config.fleet.max_concurrent_diagnostics)?;
        let report = FleetScanReport::new(results, started.elapsed());
        info!(
            "Fleet scan complete: {} vehicle(s), {} with issues, {} DTC(s)",
            report.vehicles_scanned, report.vehicles_with_issues, report.total_dtcs
        );
        Ok(report)
    }

    /// Runs `plan` against one registered vehicle
    pub fn perform_diagnostics(
        &self,
        vehicle_id: &str,
        plan: &DiagnosticPlan,
    ) -> DiagServerResult<ScanResult> {
        let handle = self
            .vehicle(vehicle_id)
            .ok_or_else(|| DiagError::VehicleNotFound(vehicle_id.to_string()))?
            .handle;
        let mut results = self.scan_fleet(&[handle], plan, 1)?;
        results
            .pop()
            .ok_or_else(|| DiagError::Fault(format!("no result for '{vehicle_id}'")))
    }

    /// Runs `plan` against `handles` with at most `max_concurrent` vehicles at a time.
    ///
    /// Returns one result per handle, in the order of `handles`. Only an invalid
    /// `max_concurrent` fails the call as a whole
    pub fn scan_fleet(
        &self,
        handles: &[VehicleHandle],
        plan: &DiagnosticPlan,
        max_concurrent: usize,
    ) -> DiagServerResult<Vec<ScanResult>> {
        self.scan_fleet_cancellable(handles, plan, max_concurrent, &CancelToken::new())
    }

    /// [FleetScheduler::scan_fleet] which stops early once `cancel` fires.
    ///
    /// Vehicles not finished by then are reported as failed with [DiagError::Cancelled]
    /// (or [DiagError::Timeout] if the token expired)
    pub fn scan_fleet_cancellable(
        &self,
        handles: &[VehicleHandle],
        plan: &DiagnosticPlan,
        max_concurrent: usize,
        cancel: &CancelToken,
    ) -> DiagServerResult<Vec<ScanResult>> {
        if max_concurrent == 0 {
            return Err(DiagError::InvalidConfig(
                "max_concurrent must be at least 1".into(),
            ));
        }
        if handles.is_empty() {
            return Ok(Vec::new());
        }
        let workers = max_concurrent.min(handles.len());
        info!(
            "Scanning {} vehicle(s) with {workers} worker(s)",
            handles.len()
        );
        let queue: Mutex<VecDeque<(usize, &VehicleHandle)>> =
            Mutex::new(handles.iter().enumerate().collect());
        let mut slots: Vec<Option<ScanResult>> = handles.iter().map(|_| None).collect();
        thread::scope(|s| {
            let (tx, rx) = mpsc::channel::<(usize, ScanResult)>();
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                s.spawn(move || {
                    loop {
                        // Release the queue before scanning
                        let next = self.next_job(&mut lock(queue));
                        let Some((idx, handle)) = next else {
                            return;
                        };
                        let result = self.scan_vehicle(handle, plan, cancel);
                        if tx.send((idx, result)).is_err() {
                            return;
                        }
                    }
                });
            }
            drop(tx);
            for (idx, result) in rx {
                slots[idx] = Some(result);
            }
        });
        Ok(slots
            .into_iter()
            .zip(handles)
            .map(|(r, h)| {
                r.unwrap_or_else(|| {
                    ScanResult::failure(
                        &h.vehicle_id,
                        DiagError::Fault("worker did not report a result".into()),
                        Duration::ZERO,
                    )
                })
            })
            .collect())
    }

    /// Counters over the latest result of every vehicle. Never waits for running scans
    pub fn get_fleet_status(&self) -> FleetStatus {
        let registry = read(&self.registry);
        let status = read(&self.status);
        let ids: HashSet<&str> = registry
            .keys()
            .chain(status.keys())
            .map(String::as_str)
            .collect();
        let mut s = FleetStatus {
            total: ids.len(),
            connected: registry.values().filter(|v| v.online).count(),
            ..Default::default()
        };
        for v in status.values() {
            if v.scanning {
                s.scanning += 1;
            }
            match v.last {
                Some(ScanStatus::Success) => s.succeeded += 1,
                Some(ScanStatus::PartialFailure) => s.partial += 1,
                Some(ScanStatus::Failure) => s.failed += 1,
                None => {}
            }
        }
        s
    }

    /// Registry and aggregator overview
    pub fn fleet_summary(&self) -> FleetSummary {
        let buffer = self.aggregator.summary();
        let registry = read(&self.registry);
        FleetSummary {
            total_vehicles: registry.len(),
            online_vehicles: registry.values().filter(|v| v.online).count(),
            vehicles_with_dtcs: buffer.vehicles_with_dtcs,
            buffer,
        }
    }

    /// The last `limit` aggregator entries of a vehicle, oldest first
    pub fn history(&self, vehicle_id: &str, limit: usize) -> Vec<AggregatorEntry> {
        self.aggregator.history(vehicle_id, limit)
    }

    /// Latest scan of a vehicle
    pub fn latest_scan(&self, vehicle_id: &str) -> Option<ScanSummary> {
        self.aggregator.latest_scan(vehicle_id)
    }

    /// Takes the first queued vehicle whose addressing is free, so workers do not sit on a
    /// lease wait while other vehicles could run
    fn next_job<'h>(
        &self,
        queue: &mut VecDeque<(usize, &'h VehicleHandle)>,
    ) -> Option<(usize, &'h VehicleHandle)> {
        let interface = &self.config.can.interface;
        let free = queue
            .iter()
            .position(|(_, h)| !self.leases.is_leased(&h.address_key(interface)))
            .unwrap_or(0);
        queue.remove(free)
    }

    fn scan_vehicle(
        &self,
        handle: &VehicleHandle,
        plan: &DiagnosticPlan,
        parent: &CancelToken,
    ) -> ScanResult {
        let id = handle.vehicle_id.as_str();
        let started = Instant::now();
        write(&self.status).entry(id.to_string()).or_default().scanning = true;

        let result = match panic::catch_unwind(AssertUnwindSafe(|| {
            self.run_vehicle(handle, plan, parent)
        })) {
            Ok(r) => r,
            Err(payload) => {
                let msg = panic_message(&*payload);
                error!("Diagnostics of '{id}' panicked: {msg}");
                ScanResult::failure(id, DiagError::Fault(msg), started.elapsed())
            }
        };

        let summary = ScanSummary::from(&result);
        write(&self.status).insert(
            id.to_string(),
            VehicleStatus {
                scanning: false,
                last: Some(summary.status),
            },
        );
        if summary.status != ScanStatus::Failure {
            if let Some(v) = write(&self.registry).get_mut(id) {
                v.online = true;
                v.last_seen = Some(SystemTime::now());
            }
        }
        self.aggregator.record_scan(&result);
        result
    }

    fn run_vehicle(
        &self,
        handle: &VehicleHandle,
        plan: &DiagnosticPlan,
        parent: &CancelToken,
    ) -> ScanResult {
        let started = Instant::now();
        // Waiting for another vehicle's lease is bound by the scan, not by this vehicle's budget
        let key = handle.address_key(&self.config.can.interface);
        let lease = match self.leases.acquire(key, parent) {
            Ok(lease) => lease,
            Err(e) => {
                warn!("'{}' never got its addressing: {e}", handle.vehicle_id);
                return ScanResult::failure(&handle.vehicle_id, e, started.elapsed());
            }
        };
        let cancel = parent.child(self.config.vehicle_timeout(plan));
        match VehicleSession::with_lease(
            handle,
            self.hardware.as_ref(),
            &self.config,
            lease,
            self.lookup.clone(),
            cancel.clone(),
        ) {
            Ok(session) => session.run_plan(plan),
            Err(e) => {
                let e = if cancel.is_cancelled() { cancel.error() } else { e };
                warn!("Could not open a session with '{}': {e}", handle.vehicle_id);
                ScanResult::failure(&handle.vehicle_id, e, started.elapsed())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::simulation::{SimulatedEcu, SimulationHardware};

    fn scheduler() -> (FleetScheduler, Arc<SimulationHardware>) {
        let hw = Arc::new(SimulationHardware::new());
        let cfg = FleetConfig::from_pairs([("uds.timeout", "200"), ("can.timeout", "200")]).unwrap();
        (FleetScheduler::new(cfg, hw.clone()).unwrap(), hw)
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let (fleet, _) = scheduler();
        let res = fleet.scan_fleet(&[VehicleHandle::new("a")], &DiagnosticPlan::new(), 0);
        assert!(matches!(res, Err(DiagError::InvalidConfig(_))));
        assert!(fleet.scan_fleet(&[], &DiagnosticPlan::new(), 1).unwrap().is_empty());
    }

    #[test]
    fn registry() {
        let (fleet, _) = scheduler();
        assert!(fleet.register_vehicle(VehicleHandle::new("VEH001")).is_none());
        assert!(fleet.register_vehicle(VehicleHandle::new("VEH001")).is_some());
        fleet.register_vehicle(VehicleHandle::new("VEH002"));
        assert_eq!(fleet.vehicles().len(), 2);

        fleet.update_vehicle_status("VEH002", true).unwrap();
        let v = fleet.vehicle("VEH002").unwrap();
        assert!(v.online);
        assert!(v.last_seen.is_some());
        assert_eq!(fleet.get_fleet_status().connected, 1);

        assert!(matches!(
            fleet.update_vehicle_status("VEH404", true),
            Err(DiagError::VehicleNotFound(_))
        ));
        fleet.remove_vehicle("VEH001").unwrap();
        assert!(fleet.remove_vehicle("VEH001").is_err());
        assert_eq!(fleet.fleet_summary().total_vehicles, 1);
    }

    #[test]
    fn unknown_vehicle_diagnostics() {
        let (fleet, _) = scheduler();
        assert!(matches!(
            fleet.perform_diagnostics("VEH404", &DiagnosticPlan::new()),
            Err(DiagError::VehicleNotFound(_))
        ));
    }

    #[test]
    fn missing_hardware_is_a_vehicle_failure() {
        let (fleet, hw) = scheduler();
        hw.add_vehicle("VEH001", SimulatedEcu::new(0x7E0, 0x7E8));
        fleet.register_vehicle(VehicleHandle::new("VEH001"));
        fleet.register_vehicle(VehicleHandle::new("VEH002").with_interface("can1"));
        let report = fleet
            .scan_all(&DiagnosticPlan::new().tester_present())
            .unwrap();
        assert_eq!(report.vehicles_scanned, 2);
        assert!(report.results[0].is_success());
        assert!(report.results[1].is_failure());
        assert_eq!(report.vehicles_with_issues, 1);
        let status = fleet.get_fleet_status();
        assert_eq!((status.succeeded, status.failed, status.scanning), (1, 1, 0));
        assert!(fleet.vehicle("VEH001").unwrap().online);
    }
}
