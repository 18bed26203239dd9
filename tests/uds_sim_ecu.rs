use std::time::Duration;

use fleet_diagnostics::{
    DiagError,
    dtc::DtcCode,
    hardware::{
        Hardware,
        simulation::{SimulatedEcu, SimulationHardware},
    },
    isotp::{IsoTpSegmenter, IsoTpSettings},
    uds::{
        ALL_DTC_GROUPS, ALL_DTC_STATUS_BITS, DiagnosticSession, SessionError, UdsSessionEngine,
        UdsSessionOptions,
    },
    vehicle::VehicleHandle,
};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn engine_for(ecu: SimulatedEcu) -> (UdsSessionEngine, SimulatedEcu) {
    init();
    let hw = SimulationHardware::new();
    let ecu = hw.add_vehicle("VEH001", ecu);
    let channel = hw
        .create_can_channel(&VehicleHandle::new("VEH001"))
        .unwrap();
    let mut transport = IsoTpSegmenter::new(channel, 0x7E0, 0x7E8, IsoTpSettings::default());
    transport.connect("sim0", 500_000, 2_000_000).unwrap();
    let options = UdsSessionOptions {
        response_timeout: Duration::from_millis(300),
        ..Default::default()
    };
    (
        UdsSessionEngine::new(transport, options).with_vehicle_id("VEH001"),
        ecu,
    )
}

#[test]
fn response_pending_within_limit() {
    let (mut engine, ecu) = engine_for(SimulatedEcu::new(0x7E0, 0x7E8).with_response_pending(2));
    engine.session_control(DiagnosticSession::Extended).unwrap();
    assert_eq!(engine.current_session(), DiagnosticSession::Extended);
    assert_eq!(ecu.session(), DiagnosticSession::Extended);
    assert_eq!(ecu.request_count(0x10), 1);
}

#[test]
fn response_pending_over_limit() {
    let (mut engine, ecu) = engine_for(SimulatedEcu::new(0x7E0, 0x7E8).with_response_pending(3));
    let err = engine.read_dtc(ALL_DTC_STATUS_BITS).unwrap_err();
    assert!(matches!(err, DiagError::NegativeResponse { code: 0x78, .. }));
    // The request was sent once, never repeated
    assert_eq!(ecu.request_count(0x19), 1);
}

#[test]
fn read_dtcs_in_extended_session() {
    let p0101: DtcCode = "P0101".parse().unwrap();
    let p0300: DtcCode = "P0300".parse().unwrap();
    let (mut engine, _ecu) = engine_for(
        SimulatedEcu::new(0x7E0, 0x7E8)
            .with_dtc(p0101, 0x08)
            .with_dtc(p0300, 0x09),
    );
    engine.session_control(DiagnosticSession::Extended).unwrap();
    let dtcs = engine.read_dtc(ALL_DTC_STATUS_BITS).unwrap();
    assert_eq!(dtcs.len(), 2);
    assert_eq!((dtcs[0].code, dtcs[0].status), (p0101, 0x08));
    assert_eq!((dtcs[1].code, dtcs[1].status), (p0300, 0x09));
    assert!(dtcs.iter().all(|d| d.vehicle_id == "VEH001"));
    assert!(dtcs[0].is_confirmed());
    assert!(dtcs[1].mil_on() || dtcs[1].is_confirmed());
}

#[test]
fn rejected_session_change_keeps_session() {
    let (mut engine, _ecu) = engine_for(SimulatedEcu::new(0x7E0, 0x7E8).with_session_reject(0x22));
    let err = engine
        .session_control(DiagnosticSession::Extended)
        .unwrap_err();
    assert_eq!(err.nrc(), Some(0x22));
    assert_eq!(engine.current_session(), DiagnosticSession::Default);
}

#[test]
fn session_lost_on_ecu_side() {
    let (mut engine, ecu) = engine_for(
        SimulatedEcu::new(0x7E0, 0x7E8)
            .with_s3_timeout(Duration::from_millis(100))
            .with_session_locked(0x19),
    );
    engine.session_control(DiagnosticSession::Extended).unwrap();
    std::thread::sleep(Duration::from_millis(200));
    assert_eq!(ecu.session(), DiagnosticSession::Default);
    let err = engine.read_dtc(ALL_DTC_STATUS_BITS).unwrap_err();
    assert!(matches!(
        err,
        DiagError::Session(SessionError::Lost {
            session: DiagnosticSession::Extended,
            nrc: 0x7F
        })
    ));
    assert_eq!(engine.current_session(), DiagnosticSession::Default);
}

#[test]
fn security_access_unlocks() {
    let (mut engine, ecu) = engine_for(
        SimulatedEcu::new(0x7E0, 0x7E8).with_security(&[0x12, 0x34], &[0xED, 0xCB]),
    );
    let key_fn = |_level: u8, seed: &[u8]| seed.iter().map(|b| !b).collect::<Vec<u8>>();
    assert!(engine.security_access(0x01, &key_fn).unwrap());
    assert_eq!(engine.security_level(), Some(0x01));
    assert_eq!(ecu.security_level(), Some(0x01));
    // Already unlocked, so the ECU sends a zero seed and no key follows
    assert!(!engine.security_access(0x01, &key_fn).unwrap());
}

#[test]
fn security_access_bad_key() {
    let (mut engine, ecu) = engine_for(
        SimulatedEcu::new(0x7E0, 0x7E8).with_security(&[0x12, 0x34], &[0xED, 0xCB]),
    );
    let key_fn = |_level: u8, _seed: &[u8]| vec![0x00, 0x00];
    let err = engine.security_access(0x01, &key_fn).unwrap_err();
    assert_eq!(err.nrc(), Some(0x35));
    assert_eq!(ecu.security_level(), None);
}

#[test]
fn read_identifiers_with_fallback() {
    let (mut engine, ecu) = engine_for(
        SimulatedEcu::new(0x7E0, 0x7E8)
            .with_vin("WVWZZZ1JZXW000001")
            .with_did(0xF187, b"8E0907115"),
    );
    let readout = engine
        .read_data_by_identifier(&[0xF190, 0xF187, 0x1234])
        .unwrap();
    assert_eq!(readout.values[&0xF190], b"WVWZZZ1JZXW000001");
    assert_eq!(readout.values[&0xF187], b"8E0907115");
    assert_eq!(readout.errors.len(), 1);
    assert_eq!(readout.errors[&0x1234].nrc(), Some(0x31));
    assert!(!readout.is_complete());
    assert!(ecu.request_count(0x22) > 1);
}

#[test]
fn vin_over_classic_can() {
    let (mut engine, _ecu) = engine_for(
        SimulatedEcu::new(0x7E0, 0x7E8)
            .classic()
            .with_vin("WVWZZZ1JZXW000001"),
    );
    assert_eq!(engine.read_vin().unwrap(), "WVWZZZ1JZXW000001");
    let stats = engine.statistics();
    assert!(stats.frames_received > 1);
    assert_eq!(stats.messages_received, 1);
}

#[test]
fn clear_and_tester_present() {
    let (mut engine, ecu) = engine_for(
        SimulatedEcu::new(0x7E0, 0x7E8).with_dtc("P0101".parse().unwrap(), 0x08),
    );
    engine.tester_present().unwrap();
    assert_eq!(ecu.tester_present_count(), 1);
    engine.clear_dtc(ALL_DTC_GROUPS).unwrap();
    assert_eq!(ecu.dtc_count(), 0);
    assert!(engine.read_dtc(ALL_DTC_STATUS_BITS).unwrap().is_empty());
}

#[test]
fn disconnected_engine_refuses_requests() {
    let (mut engine, ecu) = engine_for(SimulatedEcu::new(0x7E0, 0x7E8));
    engine.disconnect().unwrap();
    assert!(!engine.is_connected());
    assert!(engine.tester_present().is_err());
    assert!(ecu.requests().is_empty());
}
