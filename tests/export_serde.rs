#![cfg(feature = "serde")]

use std::{sync::Arc, time::Duration};

use fleet_diagnostics::{
    aggregator::{ScanStatus, Snapshot},
    config::FleetConfig,
    fleet::FleetScheduler,
    hardware::simulation::{SimulatedEcu, SimulationHardware},
    uds::DiagnosticSession,
    vehicle::VehicleHandle,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn snapshot_to_json_and_back() {
    init();
    let hw = Arc::new(SimulationHardware::new());
    hw.add_vehicle(
        "VEH001",
        SimulatedEcu::new(0x7E0, 0x7E8)
            .with_vin("WVWZZZ1JZXW000001")
            .with_dtc("P0101".parse().unwrap(), 0x08),
    );
    let cfg = FleetConfig::from_pairs([("uds.timeout", "200"), ("can.timeout", "200")]).unwrap();
    let fleet = FleetScheduler::new(cfg, hw).unwrap();
    fleet
        .scan_fleet(&[VehicleHandle::new("VEH001")], &fleet.standard_plan(), 1)
        .unwrap();

    let snapshot = fleet.aggregator().export();
    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["dtcs"][0]["code"], "P0101");
    assert_eq!(json["dtcs"][0]["confirmed"], true);
    assert_eq!(json["scans"][0]["status"], "success");
    assert_eq!(json["scans"][0]["vin"], "WVWZZZ1JZXW000001");

    let back: Snapshot = serde_json::from_value(json).unwrap();
    assert_eq!(back, snapshot);
    assert_eq!(back.scans[0].status, ScanStatus::Success);
}

#[test]
fn config_from_json() {
    let cfg: FleetConfig = serde_json::from_str(
        r#"{
            "can": { "interface": "vcan0" },
            "uds": { "session_type": "programming", "timeout": { "secs": 2, "nanos": 0 } },
            "fleet": { "max_concurrent_diagnostics": 3 }
        }"#,
    )
    .unwrap();
    cfg.validate().unwrap();
    assert_eq!(cfg.can.interface, "vcan0");
    assert_eq!(cfg.can.bitrate, 500_000);
    assert_eq!(cfg.uds.session_type, DiagnosticSession::Programming);
    assert_eq!(cfg.uds.timeout, Duration::from_secs(2));
    assert_eq!(cfg.fleet.max_concurrent_diagnostics, 3);

    let json = serde_json::to_string(&cfg).unwrap();
    assert_eq!(serde_json::from_str::<FleetConfig>(&json).unwrap(), cfg);
}
