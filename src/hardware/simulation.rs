//! Simulation hardware for testing diagnostic sessions without a vehicle.
//!
//! Every simulated vehicle has one [SimulatedEcu] which speaks ISO-TP and a subset of UDS
//! on its request and response IDs. Its behaviour (stored DTCs, data identifiers, response
//! pending replies, session rejection, S3 timeout, security access) is configured up front
//! and it records every request it receives, so tests can check what was sent.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{Arc, Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};

use log::{debug, warn};

use super::{Hardware, HardwareCapabilities, HardwareError, HardwareInfo, HardwareResult};
use crate::{
    channel::{CanChannel, ChannelError, ChannelResult, RawFrame},
    dtc::DtcCode,
    helpers::lock,
    isotp::{
        FlowControl, FlowStatus, IsoTpSettings, LogicalMessage, Reassembler, RxEvent, Segmented,
        segment,
    },
    uds::{
        DID_VIN, DiagnosticSession, NEGATIVE_RESPONSE_SID, NRC_RESPONSE_PENDING,
        NRC_SERVICE_NOT_SUPPORTED_IN_ACTIVE_SESSION, POSITIVE_RESPONSE_OFFSET,
    },
    vehicle::VehicleHandle,
};

const SIMULATION_CAPABILITIES: HardwareCapabilities = HardwareCapabilities {
    can: true,
    can_fd: true,
    extended_ids: true,
};

// NRCs the simulated ECU answers with
const NRC_SERVICE_NOT_SUPPORTED: u8 = 0x11;
const NRC_SUB_FUNCTION_NOT_SUPPORTED: u8 = 0x12;
const NRC_INCORRECT_LENGTH: u8 = 0x13;
const NRC_REQUEST_SEQUENCE_ERROR: u8 = 0x24;
const NRC_REQUEST_OUT_OF_RANGE: u8 = 0x31;
const NRC_INVALID_KEY: u8 = 0x35;

/// Hardware backed by simulated ECUs, one per vehicle ID
#[derive(Debug)]
pub struct SimulationHardware {
    info: HardwareInfo,
    ecus: Mutex<HashMap<String, SimulatedEcu>>,
}

impl Default for SimulationHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulationHardware {
    /// Creates simulation hardware without any vehicles
    pub fn new() -> Self {
        Self {
            info: HardwareInfo {
                name: "simulation".into(),
                vendor: None,
                capabilities: SIMULATION_CAPABILITIES,
            },
            ecus: Mutex::new(HashMap::new()),
        }
    }

    /// Puts `ecu` behind `vehicle_id`, replacing any ECU already there.
    /// Returns a handle to the ECU for inspection
    pub fn add_vehicle(&self, vehicle_id: &str, ecu: SimulatedEcu) -> SimulatedEcu {
        lock(&self.ecus).insert(vehicle_id.to_string(), ecu.clone());
        ecu
    }

    /// Removes the ECU of `vehicle_id`. New channels to it fail with
    /// [HardwareError::DeviceNotFound]
    pub fn remove_vehicle(&self, vehicle_id: &str) -> Option<SimulatedEcu> {
        lock(&self.ecus).remove(vehicle_id)
    }

    /// ECU of `vehicle_id`
    pub fn ecu(&self, vehicle_id: &str) -> Option<SimulatedEcu> {
        lock(&self.ecus).get(vehicle_id).cloned()
    }
}

impl Hardware for SimulationHardware {
    fn create_can_channel(&self, vehicle: &VehicleHandle) -> HardwareResult<Box<dyn CanChannel>> {
        let ecu = self
            .ecu(&vehicle.vehicle_id)
            .ok_or_else(|| HardwareError::DeviceNotFound(vehicle.vehicle_id.clone()))?;
        Ok(Box::new(SimulatedChannel { ecu, open: false }))
    }

    fn get_info(&self) -> &HardwareInfo {
        &self.info
    }
}

#[derive(Debug)]
struct EcuState {
    request_id: u32,
    response_id: u32,
    isotp: IsoTpSettings,
    online: bool,
    fault_on: Option<u8>,
    faulted: bool,
    rx: Reassembler,
    outbox: VecDeque<RawFrame>,
    held_frames: VecDeque<Vec<u8>>,
    session: DiagnosticSession,
    last_request: Instant,
    s3_timeout: Duration,
    session_reject: Option<u8>,
    response_pending: u32,
    session_locked: HashSet<u8>,
    loopback: HashSet<u8>,
    flow_waits: u8,
    flow_overflow: bool,
    consecutive_limit: Option<usize>,
    dtcs: Vec<(DtcCode, u8)>,
    dids: BTreeMap<u16, Vec<u8>>,
    security: Option<(Vec<u8>, Vec<u8>)>,
    seed_sent: Option<u8>,
    unlocked: Option<u8>,
    requests: Vec<Vec<u8>>,
    tester_present_count: usize,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<EcuState>,
    ready: Condvar,
}

/// A simulated UDS ECU. Clones share the same ECU
#[derive(Debug, Clone)]
pub struct SimulatedEcu {
    shared: Arc<Shared>,
}

impl SimulatedEcu {
    /// Creates a CAN-FD ECU listening on `request_id` and answering on `response_id`.
    ///
    /// The ECU starts in the default session with an S3 timeout of 5 seconds
    pub fn new(request_id: u32, response_id: u32) -> Self {
        let state = EcuState {
            request_id,
            response_id,
            isotp: IsoTpSettings {
                block_size: 0,
                ..IsoTpSettings::default()
            },
            online: true,
            fault_on: None,
            faulted: false,
            rx: Reassembler::new(0),
            outbox: VecDeque::new(),
            held_frames: VecDeque::new(),
            session: DiagnosticSession::Default,
            last_request: Instant::now(),
            s3_timeout: Duration::from_secs(5),
            session_reject: None,
            response_pending: 0,
            session_locked: HashSet::new(),
            loopback: HashSet::new(),
            flow_waits: 0,
            flow_overflow: false,
            consecutive_limit: None,
            dtcs: Vec::new(),
            dids: BTreeMap::new(),
            security: None,
            seed_sent: None,
            unlocked: None,
            requests: Vec::new(),
            tester_present_count: 0,
        };
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                ready: Condvar::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, EcuState> {
        lock(&self.shared.state)
    }

    /// Answers with classic 8 byte frames
    pub fn classic(self) -> Self {
        self.state().isotp.tx_dl = IsoTpSettings::classic().tx_dl;
        self
    }

    /// Stores a DTC with its status byte
    pub fn with_dtc(self, code: DtcCode, status: u8) -> Self {
        self.state().dtcs.push((code, status));
        self
    }

    /// Stores a data identifier
    pub fn with_did(self, id: u16, value: &[u8]) -> Self {
        self.state().dids.insert(id, value.to_vec());
        self
    }

    /// Stores the VIN (DID 0xF190)
    pub fn with_vin(self, vin: &str) -> Self {
        self.with_did(DID_VIN, vin.as_bytes())
    }

    /// Number of response pending replies sent before every response
    pub fn with_response_pending(self, count: u32) -> Self {
        self.set_response_pending(count);
        self
    }

    /// Time without requests after which the ECU falls back to the default session
    pub fn with_s3_timeout(self, timeout: Duration) -> Self {
        self.state().s3_timeout = timeout;
        self
    }

    /// Rejects every change to a non default session with `nrc`
    pub fn with_session_reject(self, nrc: u8) -> Self {
        self.state().session_reject = Some(nrc);
        self
    }

    /// Refuses service `sid` in the default session with NRC 0x7F
    pub fn with_session_locked(self, sid: u8) -> Self {
        self.state().session_locked.insert(sid);
        self
    }

    /// Enables security access with a fixed seed and the key expected for it
    pub fn with_security(self, seed: &[u8], key: &[u8]) -> Self {
        self.state().security = Some((seed.to_vec(), key.to_vec()));
        self
    }

    /// Answers service `sid` with a positive response carrying the request parameters back
    pub fn with_loopback(self, sid: u8) -> Self {
        self.state().loopback.insert(sid);
        self
    }

    /// Sends `count` wait flow control frames before letting a multi frame request through
    pub fn with_flow_control_waits(self, count: u8) -> Self {
        self.state().flow_waits = count;
        self
    }

    /// Answers every first frame with an overflow flow control frame
    pub fn with_flow_control_overflow(self) -> Self {
        self.state().flow_overflow = true;
        self
    }

    /// Stops multi frame responses after `count` consecutive frames
    pub fn with_consecutive_frame_limit(self, count: usize) -> Self {
        self.state().consecutive_limit = Some(count);
        self
    }

    /// Makes the channel panic once a request for `sid` arrives. Used to test fault isolation
    pub fn with_fault_on(self, sid: u8) -> Self {
        self.state().fault_on = Some(sid);
        self
    }

    /// An offline ECU ignores every frame
    pub fn set_online(&self, online: bool) {
        self.state().online = online;
    }

    /// Changes the number of response pending replies sent before every response
    pub fn set_response_pending(&self, count: u32) {
        self.state().response_pending = count;
    }

    /// Session the ECU is in. Accounts for S3 expiry
    pub fn session(&self) -> DiagnosticSession {
        let mut s = self.state();
        s.check_s3();
        s.session
    }

    /// Unlocked security level, if any
    pub fn security_level(&self) -> Option<u8> {
        self.state().unlocked
    }

    /// Every request received, oldest first
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.state().requests.clone()
    }

    /// Number of requests received for service `sid`
    pub fn request_count(&self, sid: u8) -> usize {
        self.state()
            .requests
            .iter()
            .filter(|r| r.first() == Some(&sid))
            .count()
    }

    /// Number of tester present requests received
    pub fn tester_present_count(&self) -> usize {
        self.state().tester_present_count
    }

    /// Number of stored DTCs
    pub fn dtc_count(&self) -> usize {
        self.state().dtcs.len()
    }

    fn on_tester_frame(&self, frame: &RawFrame) {
        let mut s = self.state();
        if !s.online || frame.id() != s.request_id {
            return;
        }
        let data = frame.data();
        if data.first().map(|pci| pci & 0xF0) == Some(0x30) {
            match FlowControl::parse(data) {
                Ok(fc) if fc.status == FlowStatus::ContinueToSend => s.release_block(fc.block_size),
                Ok(fc) => debug!("Simulated ECU ignoring flow control {fc:?}"),
                Err(e) => warn!("Simulated ECU received a bad flow control frame: {e}"),
            }
        } else {
            match s.rx.on_frame(data) {
                Ok(RxEvent::Completed(msg)) => s.on_request(msg.as_bytes()),
                Ok(RxEvent::SendFlowControl) => s.send_flow_control(),
                Ok(RxEvent::Pending | RxEvent::Ignored) => {}
                Err(e) => warn!("Simulated ECU dropped a transfer: {e}"),
            }
        }
        drop(s);
        self.shared.ready.notify_all();
    }

    fn next_frame(&self, timeout: Duration) -> Option<RawFrame> {
        let deadline = Instant::now() + timeout;
        let mut s = self.state();
        loop {
            if s.faulted {
                s.faulted = false;
                drop(s);
                panic!("simulated ECU fault");
            }
            if let Some(frame) = s.outbox.pop_front() {
                return Some(frame);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            s = self
                .shared
                .ready
                .wait_timeout(s, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    fn reset_link(&self) {
        let mut s = self.state();
        s.outbox.clear();
        s.held_frames.clear();
        s.rx.reset();
    }
}

impl EcuState {
    fn check_s3(&mut self) {
        if self.session != DiagnosticSession::Default && self.last_request.elapsed() > self.s3_timeout
        {
            debug!("Simulated ECU S3 timer lapsed, back to the default session");
            self.session = DiagnosticSession::Default;
            self.unlocked = None;
        }
    }

    fn queue_frame(&mut self, data: &[u8]) {
        match RawFrame::new(self.response_id, data, self.isotp.is_fd()) {
            Ok(f) => self.outbox.push_back(f),
            Err(e) => warn!("Simulated ECU cannot send {data:02X?}: {e}"),
        }
    }

    fn send_flow_control(&mut self) {
        if self.flow_overflow {
            self.rx.reset();
            let fc = FlowControl {
                status: FlowStatus::Overflow,
                ..FlowControl::continue_to_send(0, 0)
            };
            self.queue_frame(&fc.to_bytes());
            return;
        }
        let wait = FlowControl {
            status: FlowStatus::Wait,
            ..FlowControl::continue_to_send(0, 0)
        };
        for _ in 0..self.flow_waits {
            self.queue_frame(&wait.to_bytes());
        }
        self.queue_frame(&FlowControl::continue_to_send(0, 0).to_bytes());
    }

    fn release_block(&mut self, block_size: u8) {
        let n = match block_size {
            0 => self.held_frames.len(),
            bs => (bs as usize).min(self.held_frames.len()),
        };
        for _ in 0..n {
            if let Some(cf) = self.held_frames.pop_front() {
                self.queue_frame(&cf);
            }
        }
    }

    fn send_message(&mut self, data: Vec<u8>) {
        let msg = match LogicalMessage::new(data) {
            Ok(m) => m,
            Err(e) => {
                warn!("Simulated ECU cannot send response: {e}");
                return;
            }
        };
        match segment(&msg, &self.isotp) {
            Segmented::Single(sf) => self.queue_frame(&sf),
            Segmented::Multi { first, consecutive } => {
                self.queue_frame(&first);
                let limit = self.consecutive_limit.unwrap_or(consecutive.len());
                self.held_frames.extend(consecutive.into_iter().take(limit));
            }
        }
    }

    fn on_request(&mut self, request: &[u8]) {
        self.requests.push(request.to_vec());
        let sid = request[0];
        if self.fault_on == Some(sid) {
            self.faulted = true;
            return;
        }
        self.check_s3();
        self.last_request = Instant::now();
        let Some(response) = self.respond(sid, &request[1..]) else {
            return;
        };
        if sid != 0x3E {
            for _ in 0..self.response_pending {
                self.send_message(vec![NEGATIVE_RESPONSE_SID, sid, NRC_RESPONSE_PENDING]);
            }
        }
        self.send_message(response);
    }

    fn respond(&mut self, sid: u8, params: &[u8]) -> Option<Vec<u8>> {
        let nrc = |code: u8| Some(vec![NEGATIVE_RESPONSE_SID, sid, code]);
        let positive = sid.wrapping_add(POSITIVE_RESPONSE_OFFSET);
        if self.session == DiagnosticSession::Default && self.session_locked.contains(&sid) {
            return nrc(NRC_SERVICE_NOT_SUPPORTED_IN_ACTIVE_SESSION);
        }
        if self.loopback.contains(&sid) {
            let mut r = vec![positive];
            r.extend_from_slice(params);
            return Some(r);
        }
        match sid {
            // DiagnosticSessionControl
            0x10 => {
                let Some(sub) = params.first() else {
                    return nrc(NRC_INCORRECT_LENGTH);
                };
                let id = sub & 0x7F;
                let Some(target) = DiagnosticSession::from_id(id) else {
                    return nrc(NRC_SUB_FUNCTION_NOT_SUPPORTED);
                };
                if target != DiagnosticSession::Default {
                    if let Some(code) = self.session_reject {
                        return nrc(code);
                    }
                }
                if target != self.session {
                    self.unlocked = None;
                }
                self.session = target;
                // P2 = 50ms, P2* = 5000ms
                Some(vec![positive, id, 0x00, 0x32, 0x01, 0xF4])
            }
            // TesterPresent
            0x3E => {
                let Some(sub) = params.first() else {
                    return nrc(NRC_INCORRECT_LENGTH);
                };
                if sub & 0x7F != 0 {
                    return nrc(NRC_SUB_FUNCTION_NOT_SUPPORTED);
                }
                self.tester_present_count += 1;
                (sub & 0x80 == 0).then(|| vec![positive, 0x00])
            }
            // ReadDTCInformation
            0x19 => match params {
                [0x02, mask] => {
                    let mut r = vec![positive, 0x02, 0xFF];
                    for (code, status) in self.dtcs.iter().filter(|(_, s)| s & mask != 0) {
                        r.extend_from_slice(&code.raw().to_be_bytes()[1..]);
                        r.push(*status);
                    }
                    Some(r)
                }
                [] | [0x02, ..] => nrc(NRC_INCORRECT_LENGTH),
                _ => nrc(NRC_SUB_FUNCTION_NOT_SUPPORTED),
            },
            // ReadDataByIdentifier
            0x22 => {
                if params.is_empty() || params.len() % 2 != 0 {
                    return nrc(NRC_INCORRECT_LENGTH);
                }
                let mut r = vec![positive];
                for id in params.chunks_exact(2) {
                    let Some(value) = self.dids.get(&u16::from_be_bytes([id[0], id[1]])) else {
                        return nrc(NRC_REQUEST_OUT_OF_RANGE);
                    };
                    r.extend_from_slice(id);
                    r.push(value.len() as u8);
                    r.extend_from_slice(value);
                }
                Some(r)
            }
            // ClearDiagnosticInformation
            0x14 => {
                if params.len() != 3 {
                    return nrc(NRC_INCORRECT_LENGTH);
                }
                self.dtcs.clear();
                Some(vec![positive])
            }
            // SecurityAccess
            0x27 => {
                let Some(&level) = params.first() else {
                    return nrc(NRC_INCORRECT_LENGTH);
                };
                let Some((seed, key)) = self.security.clone() else {
                    return nrc(NRC_SERVICE_NOT_SUPPORTED);
                };
                if level == 0 || level >= 0x7F {
                    return nrc(NRC_SUB_FUNCTION_NOT_SUPPORTED);
                }
                let mut r = vec![positive, level];
                if level % 2 == 1 {
                    self.seed_sent = Some(level);
                    if self.unlocked == Some(level) {
                        r.resize(2 + seed.len(), 0);
                    } else {
                        r.extend_from_slice(&seed);
                    }
                    return Some(r);
                }
                if self.seed_sent.take() != Some(level - 1) {
                    return nrc(NRC_REQUEST_SEQUENCE_ERROR);
                }
                if params[1..] != key[..] {
                    return nrc(NRC_INVALID_KEY);
                }
                self.unlocked = Some(level - 1);
                Some(r)
            }
            _ => nrc(NRC_SERVICE_NOT_SUPPORTED),
        }
    }
}

/// Raw channel between the tester and a [SimulatedEcu]
#[derive(Debug)]
pub struct SimulatedChannel {
    ecu: SimulatedEcu,
    open: bool,
}

impl CanChannel for SimulatedChannel {
    fn connect(&mut self, interface_name: &str, bitrate: u32, data_bitrate: u32) -> ChannelResult<()> {
        debug!("Simulated channel open on {interface_name} ({bitrate}/{data_bitrate} bps)");
        self.ecu.reset_link();
        self.open = true;
        Ok(())
    }

    fn disconnect(&mut self) -> ChannelResult<()> {
        self.open = false;
        Ok(())
    }

    fn send(&mut self, arbitration_id: u32, payload: &[u8], is_fd: bool) -> ChannelResult<()> {
        if !self.open {
            return Err(ChannelError::InterfaceNotOpen);
        }
        let frame = RawFrame::new(arbitration_id, payload, is_fd)?;
        self.ecu.on_tester_frame(&frame);
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> ChannelResult<Option<RawFrame>> {
        if !self.open {
            return Err(ChannelError::InterfaceNotOpen);
        }
        Ok(self.ecu.next_frame(timeout))
    }
}
