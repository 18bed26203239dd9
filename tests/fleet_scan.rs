use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use fleet_diagnostics::{
    CancelToken, DiagError,
    aggregator::{AggregatorEntry, ScanStatus},
    channel::{CanChannel, ChannelResult, RawFrame},
    config::FleetConfig,
    dtc::DtcCode,
    fleet::FleetScheduler,
    hardware::{
        Hardware, HardwareInfo, HardwareResult,
        simulation::{SimulatedEcu, SimulationHardware},
    },
    plan::{DiagnosticPlan, ScanOutcome},
    uds::DiagnosticSession,
    vehicle::VehicleHandle,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Simulation hardware which records how many channels are open at once
#[derive(Debug, Default)]
struct TrackingHardware {
    sim: SimulationHardware,
    open: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

#[derive(Debug)]
struct TrackedChannel {
    inner: Box<dyn CanChannel>,
    open: Arc<AtomicUsize>,
}

impl Drop for TrackedChannel {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

impl CanChannel for TrackedChannel {
    fn connect(&mut self, iface: &str, bitrate: u32, data_bitrate: u32) -> ChannelResult<()> {
        self.inner.connect(iface, bitrate, data_bitrate)
    }

    fn disconnect(&mut self) -> ChannelResult<()> {
        self.inner.disconnect()
    }

    fn send(&mut self, id: u32, payload: &[u8], is_fd: bool) -> ChannelResult<()> {
        self.inner.send(id, payload, is_fd)
    }

    fn recv(&mut self, timeout: Duration) -> ChannelResult<Option<RawFrame>> {
        self.inner.recv(timeout)
    }
}

impl Hardware for TrackingHardware {
    fn create_can_channel(&self, vehicle: &VehicleHandle) -> HardwareResult<Box<dyn CanChannel>> {
        let inner = self.sim.create_can_channel(vehicle)?;
        let now = self.open.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Ok(Box::new(TrackedChannel {
            inner,
            open: self.open.clone(),
        }))
    }

    fn get_info(&self) -> &HardwareInfo {
        self.sim.get_info()
    }
}

fn config(extra: &[(&str, &str)]) -> FleetConfig {
    let mut pairs = vec![("uds.timeout", "200"), ("can.timeout", "200")];
    pairs.extend_from_slice(extra);
    FleetConfig::from_pairs(pairs).unwrap()
}

fn p0101() -> DtcCode {
    "P0101".parse().unwrap()
}

fn p0300() -> DtcCode {
    "P0300".parse().unwrap()
}

/// Five vehicles on their own interfaces, two DTCs each
fn five_vehicles(hw: &SimulationHardware) -> Vec<VehicleHandle> {
    (1..=5)
        .map(|i| {
            let id = format!("VEH00{i}");
            hw.add_vehicle(
                &id,
                SimulatedEcu::new(0x7E0, 0x7E8)
                    .with_vin(&format!("WVWZZZ1JZXW00000{i}"))
                    .with_dtc(p0101(), 0x08)
                    .with_dtc(p0300(), 0x09),
            );
            VehicleHandle::new(&id).with_interface(&format!("vcan{i}"))
        })
        .collect()
}

#[test]
fn bounded_scan_with_one_offline_vehicle() {
    init();
    let hw = Arc::new(TrackingHardware::default());
    let handles = five_vehicles(&hw.sim);
    hw.sim.ecu("VEH003").unwrap().set_online(false);
    let fleet = FleetScheduler::new(config(&[]), hw.clone()).unwrap();

    let plan = fleet.standard_plan();
    let results = fleet.scan_fleet(&handles, &plan, 2).unwrap();

    assert_eq!(results.len(), 5);
    for (r, h) in results.iter().zip(&handles) {
        assert_eq!(r.vehicle_id, h.vehicle_id);
    }
    assert!(results[2].is_failure());
    for i in [0, 1, 3, 4] {
        assert!(results[i].is_success(), "{:?}", results[i]);
        assert_eq!(results[i].dtcs().len(), 2);
        assert!(results[i].data().unwrap().vin().is_some());
    }
    let peak = hw.peak.load(Ordering::SeqCst);
    assert!(peak <= 2, "{peak} vehicles were diagnosed at once");
    assert_eq!(hw.open.load(Ordering::SeqCst), 0);

    let status = fleet.get_fleet_status();
    assert_eq!(status.total, 5);
    assert_eq!((status.succeeded, status.partial, status.failed), (4, 0, 1));
    assert_eq!(status.scanning, 0);
    assert_eq!(fleet.aggregator().summary().vehicles_with_dtcs, 4);
}

#[test]
fn shared_addressing_is_serialized() {
    init();
    let hw = Arc::new(TrackingHardware::default());
    for id in ["VEH001", "VEH002", "VEH003"] {
        hw.sim.add_vehicle(id, SimulatedEcu::new(0x7E0, 0x7E8));
    }
    let fleet = FleetScheduler::new(config(&[]), hw.clone()).unwrap();
    let handles: Vec<VehicleHandle> = ["VEH001", "VEH002", "VEH003"]
        .iter()
        .map(|id| VehicleHandle::new(id))
        .collect();
    let plan = DiagnosticPlan::new()
        .tester_present()
        .wait(Duration::from_millis(50));
    let results = fleet.scan_fleet(&handles, &plan, 3).unwrap();
    assert!(results.iter().all(|r| r.is_success()));
    assert_eq!(hw.peak.load(Ordering::SeqCst), 1);
}

#[test]
fn keep_alive_holds_session_through_wait() {
    init();
    let hw = Arc::new(SimulationHardware::new());
    let ecu = hw.add_vehicle(
        "VEH001",
        SimulatedEcu::new(0x7E0, 0x7E8)
            .with_s3_timeout(Duration::from_millis(400))
            .with_session_locked(0x19)
            .with_dtc(p0101(), 0x08),
    );
    let fleet = FleetScheduler::new(config(&[("uds.s3_timeout", "400ms")]), hw.clone()).unwrap();
    let plan = DiagnosticPlan::new()
        .session_control(DiagnosticSession::Extended)
        .wait(Duration::from_millis(1000))
        .read_dtc(0xFF);
    let results = fleet
        .scan_fleet(&[VehicleHandle::new("VEH001")], &plan, 1)
        .unwrap();
    assert!(results[0].is_success(), "{:?}", results[0]);
    assert_eq!(results[0].dtcs().len(), 1);
    assert!(ecu.tester_present_count() >= 2);
    assert_eq!(ecu.session(), DiagnosticSession::Extended);
}

#[test]
fn panicking_vehicle_is_isolated() {
    init();
    let hw = Arc::new(SimulationHardware::new());
    let handles = five_vehicles(&hw);
    hw.remove_vehicle("VEH002");
    hw.add_vehicle(
        "VEH002",
        SimulatedEcu::new(0x7E0, 0x7E8)
            .with_vin("WVWZZZ1JZXW000002")
            .with_fault_on(0x19),
    );
    let fleet = FleetScheduler::new(config(&[]), hw.clone()).unwrap();
    let results = fleet
        .scan_fleet(&handles, &fleet.standard_plan(), 3)
        .unwrap();
    assert_eq!(results.len(), 5);
    match &results[1].outcome {
        ScanOutcome::Failure(DiagError::Fault(msg)) => assert!(msg.contains("simulated ECU fault")),
        other => panic!("unexpected outcome {other:?}"),
    }
    assert_eq!(results.iter().filter(|r| r.is_success()).count(), 4);
    assert_eq!(
        fleet.latest_scan("VEH002").unwrap().status,
        ScanStatus::Failure
    );
}

#[test]
fn vehicle_timeout_bounds_the_scan() {
    init();
    let hw = Arc::new(SimulationHardware::new());
    hw.add_vehicle("VEH001", SimulatedEcu::new(0x7E0, 0x7E8));
    let fleet =
        FleetScheduler::new(config(&[("fleet.vehicle_timeout", "300ms")]), hw.clone()).unwrap();
    let plan = DiagnosticPlan::new()
        .tester_present()
        .wait(Duration::from_secs(5));
    let started = Instant::now();
    let result = fleet
        .scan_fleet(&[VehicleHandle::new("VEH001")], &plan, 1)
        .unwrap()
        .remove(0);
    assert!(started.elapsed() < Duration::from_secs(2));
    // The tester present answer came back, but a timed out vehicle is a failure
    assert!(matches!(result.outcome, ScanOutcome::Failure(DiagError::Timeout)));
    assert_eq!(
        fleet.latest_scan("VEH001").unwrap().status,
        ScanStatus::Failure
    );
}

#[test]
fn lease_wait_does_not_use_vehicle_budget() {
    init();
    let hw = Arc::new(SimulationHardware::new());
    for id in ["VEH001", "VEH002"] {
        hw.add_vehicle(id, SimulatedEcu::new(0x7E0, 0x7E8));
    }
    // Each plan needs more than half of its vehicle's budget
    let fleet =
        FleetScheduler::new(config(&[("fleet.vehicle_timeout", "1s")]), hw.clone()).unwrap();
    let plan = DiagnosticPlan::new()
        .tester_present()
        .wait(Duration::from_millis(600));
    let handles = [VehicleHandle::new("VEH001"), VehicleHandle::new("VEH002")];
    let results = fleet.scan_fleet(&handles, &plan, 2).unwrap();
    for r in &results {
        assert!(r.is_success(), "{r:?}");
        assert!(r.elapsed < Duration::from_secs(1));
    }
}

#[test]
fn cancelled_scan_reports_every_vehicle() {
    init();
    let hw = Arc::new(SimulationHardware::new());
    let handles = five_vehicles(&hw);
    let fleet = FleetScheduler::new(config(&[]), hw.clone()).unwrap();
    let plan = DiagnosticPlan::new().wait(Duration::from_secs(10));
    let token = CancelToken::new();
    let canceller = {
        let token = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            token.cancel();
        })
    };
    let started = Instant::now();
    let results = fleet
        .scan_fleet_cancellable(&handles, &plan, 2, &token)
        .unwrap();
    canceller.join().unwrap();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| matches!(
        r.outcome,
        ScanOutcome::Failure(DiagError::Cancelled)
    )));
}

#[test]
fn aggregator_evicts_oldest_entries() {
    init();
    let hw = Arc::new(SimulationHardware::new());
    let handles = five_vehicles(&hw);
    let fleet = FleetScheduler::new(config(&[("fleet.max_buffer_size", "5")]), hw.clone()).unwrap();
    let plan = DiagnosticPlan::new().read_dtc(0xFF);
    fleet.scan_fleet(&handles[..3], &plan, 1).unwrap();

    // Two DTCs and one scan summary per vehicle
    let agg = fleet.aggregator();
    assert_eq!(agg.len(), 5);
    assert_eq!(agg.evicted(), 4);
    let snapshot = agg.export();
    assert_eq!(snapshot.dtcs.len() + snapshot.scans.len(), 5);
    assert_eq!(snapshot.evicted, 4);
    assert!(fleet.history("VEH001", 10).is_empty());
    let last = fleet.history("VEH003", 10);
    assert_eq!(last.len(), 3);
    assert!(matches!(last[2], AggregatorEntry::Scan(_)));
    assert_eq!(agg.summary().buffer_usage, 100.0);
}

#[test]
fn registry_scan_and_summary() {
    init();
    let hw = Arc::new(SimulationHardware::new());
    let handles = five_vehicles(&hw);
    let fleet = FleetScheduler::new(
        config(&[("fleet.max_concurrent_diagnostics", "3")]),
        hw.clone(),
    )
    .unwrap();
    for h in handles {
        fleet.register_vehicle(h);
    }
    hw.remove_vehicle("VEH005");

    let report = fleet.scan_all(&fleet.standard_plan()).unwrap();
    assert_eq!(report.vehicles_scanned, 5);
    assert_eq!(report.total_dtcs, 8);
    assert_eq!(report.vehicles_with_issues, 5);
    assert!(report.results[4].is_failure());

    let summary = fleet.fleet_summary();
    assert_eq!(summary.total_vehicles, 5);
    assert_eq!(summary.online_vehicles, 4);
    assert_eq!(summary.vehicles_with_dtcs, 4);
    assert_eq!(summary.buffer.entries, 4 * 3 + 1);

    let single = fleet
        .perform_diagnostics("VEH001", &DiagnosticPlan::new().clear_dtc())
        .unwrap();
    assert!(single.is_success());
    assert_eq!(hw.ecu("VEH001").unwrap().dtc_count(), 0);
}
