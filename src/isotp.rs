//! Software ISO-TP (ISO15765-2) layer for CAN-FD.
//!
//! Logical messages of 1 to 4095 bytes are mapped onto the four ISO-TP frame types:
//!
//! | Frame | PCI | Layout |
//! |-|-|-|
//! | Single | `0x0L` (or `0x00 LL` on CAN-FD) | length + payload |
//! | First | `0x1L LL` | 12 bit length + first bytes |
//! | Consecutive | `0x2N` | 4 bit sequence number + next bytes |
//! | Flow control | `0x3S BS STmin` | flow status, block size, separation time |
//!
//! [segment] and [Reassembler] are pure and do no I/O. [IsoTpSegmenter] drives them over
//! a [CanChannel] for one pair of arbitration IDs.

use std::{
    cmp::min,
    time::{Duration, Instant},
};

use log::{debug, error, warn};

use crate::{
    channel::{CanChannel, ChannelError, MAX_CLASSIC_PAYLOAD, MAX_FD_PAYLOAD, RawFrame},
    helpers::{CANCEL_POLL_INTERVAL, CancelToken},
};

/// Largest message ISO-TP can carry with a 12 bit first frame length
pub const MAX_MESSAGE_LEN: usize = 4095;

/// Frame lengths a CAN-FD controller can put on the bus
pub const FD_FRAME_LENGTHS: [usize; 8] = [8, 12, 16, 20, 24, 32, 48, 64];

const PCI_SINGLE: u8 = 0x00;
const PCI_FIRST: u8 = 0x10;
const PCI_CONSECUTIVE: u8 = 0x20;
const PCI_FLOW_CONTROL: u8 = 0x30;

/// Transport layer result
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Clone, Debug, thiserror::Error)]
/// ISO-TP transport error
pub enum TransportError {
    /// Error from the CAN channel below
    #[error("CAN channel error")]
    Channel(
        #[from]
        #[source]
        ChannelError,
    ),
    /// Nothing arrived in time
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),
    /// Consecutive frame arrived out of order
    #[error("Consecutive frame out of sequence. Expected SN {expected}, got {got}")]
    SequenceError {
        /// Sequence number the receiver was waiting for
        expected: u8,
        /// Sequence number of the frame received
        got: u8,
    },
    /// Message is larger than ISO-TP can carry
    #[error("Message of {0} bytes exceeds the {MAX_MESSAGE_LEN} byte limit")]
    MessageTooLarge(usize),
    /// Messages must carry at least one byte
    #[error("Message is empty")]
    EmptyMessage,
    /// Receiver reported it cannot buffer the message
    #[error("Receiver reported a buffer overflow")]
    Overflow,
    /// Receiver kept asking to wait
    #[error("Receiver sent more than {0} wait frames")]
    TooManyWaitFrames(u8),
    /// Frame could not be decoded
    #[error("Malformed ISO-TP frame: {0}")]
    MalformedFrame(String),
    /// Cancelled by the owner of the segmenter
    #[error("Transfer was cancelled")]
    Cancelled,
    /// Settings are not usable
    #[error("Invalid ISO-TP settings: {0}")]
    InvalidSettings(String),
}

/// ISO-TP configuration options
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct IsoTpSettings {
    /// Transmit data length of a frame. 8 for classic CAN, up to 64 for CAN-FD
    pub tx_dl: usize,
    /// Block size advertised in our flow control frames. 0 means no further flow control
    pub block_size: u8,
    /// Separation time advertised in our flow control frames (raw STmin byte)
    pub st_min: u8,
    /// Pad frames to full length
    pub pad_frame: bool,
    /// Byte used for padding
    pub padding_byte: u8,
    /// How long to wait for a flow control frame after a first frame or block (N_Bs)
    pub n_bs: Duration,
    /// Longest allowed gap between two consecutive frames (N_Cr)
    pub n_cr: Duration,
    /// Maximum number of wait flow control frames accepted in a row (N_WFTmax)
    pub max_wait_frames: u8,
}

impl Default for IsoTpSettings {
    fn default() -> Self {
        Self {
            tx_dl: MAX_FD_PAYLOAD,
            block_size: 8,
            st_min: 0,
            pad_frame: true,
            padding_byte: 0xCC,
            n_bs: Duration::from_millis(1000),
            n_cr: Duration::from_millis(1000),
            max_wait_frames: 10,
        }
    }
}

impl IsoTpSettings {
    /// Settings for a classic 8 byte CAN link
    pub fn classic() -> Self {
        Self {
            tx_dl: MAX_CLASSIC_PAYLOAD,
            ..Default::default()
        }
    }

    /// True if frames are sent as CAN-FD frames
    pub fn is_fd(&self) -> bool {
        self.tx_dl > MAX_CLASSIC_PAYLOAD
    }

    /// Largest payload that still fits into a single frame
    pub fn single_frame_limit(&self) -> usize {
        if self.is_fd() {
            self.tx_dl - 2
        } else {
            self.tx_dl - 1
        }
    }

    /// Checks the settings describe a link that exists
    pub fn validate(&self) -> TransportResult<()> {
        if !FD_FRAME_LENGTHS.contains(&self.tx_dl) {
            return Err(TransportError::InvalidSettings(format!(
                "tx_dl {} is not a valid CAN-FD frame length",
                self.tx_dl
            )));
        }
        if self.n_bs.is_zero() || self.n_cr.is_zero() {
            return Err(TransportError::InvalidSettings(
                "N_Bs and N_Cr must be non zero".into(),
            ));
        }
        Ok(())
    }
}

/// A complete diagnostic message, 1 to 4095 bytes long
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalMessage(Vec<u8>);

impl LogicalMessage {
    /// Wraps `data`, checking its length
    pub fn new(data: Vec<u8>) -> TransportResult<Self> {
        match data.len() {
            0 => Err(TransportError::EmptyMessage),
            l if l > MAX_MESSAGE_LEN => Err(TransportError::MessageTooLarge(l)),
            _ => Ok(Self(data)),
        }
    }

    /// Message bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Takes the bytes out of the message
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Message length
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl TryFrom<&[u8]> for LogicalMessage {
    type Error = TransportError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Self::new(value.to_vec())
    }
}

impl AsRef<[u8]> for LogicalMessage {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Frame length the controller has to put on the bus for `len` payload bytes
pub fn frame_length_for(len: usize) -> usize {
    if len <= MAX_CLASSIC_PAYLOAD {
        return len;
    }
    FD_FRAME_LENGTHS
        .iter()
        .copied()
        .find(|l| *l >= len)
        .unwrap_or(MAX_FD_PAYLOAD)
}

fn pad(frame: &mut Vec<u8>, settings: &IsoTpSettings) {
    let target = if settings.pad_frame {
        frame_length_for(frame.len()).max(MAX_CLASSIC_PAYLOAD)
    } else {
        frame_length_for(frame.len())
    };
    frame.resize(target, settings.padding_byte);
}

/// Converts a raw STmin byte into a separation time.
///
/// 0x00-0x7F are milliseconds, 0xF1-0xF9 are 100-900 microseconds. Reserved values
/// are treated as the longest separation time (127ms)
pub fn st_min_to_duration(raw: u8) -> Duration {
    match raw {
        0x00..=0x7F => Duration::from_millis(raw as u64),
        0xF1..=0xF9 => Duration::from_micros((raw - 0xF0) as u64 * 100),
        _ => Duration::from_millis(0x7F),
    }
}

/// Flow status of a flow control frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FlowStatus {
    /// Sender may continue with the next block
    ContinueToSend,
    /// Sender must wait for another flow control frame
    Wait,
    /// Receiver cannot take the message
    Overflow,
}

/// Decoded flow control frame
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FlowControl {
    /// Flow status
    pub status: FlowStatus,
    /// Number of consecutive frames before the next flow control. 0 = all of them
    pub block_size: u8,
    /// Raw STmin byte
    pub st_min: u8,
}

impl FlowControl {
    /// Flow control that lets the sender continue
    pub fn continue_to_send(block_size: u8, st_min: u8) -> Self {
        Self {
            status: FlowStatus::ContinueToSend,
            block_size,
            st_min,
        }
    }

    /// Decodes a flow control frame
    pub fn parse(frame: &[u8]) -> TransportResult<Self> {
        if frame.len() < 3 || frame[0] & 0xF0 != PCI_FLOW_CONTROL {
            return Err(TransportError::MalformedFrame(format!(
                "not a flow control frame: {frame:02X?}"
            )));
        }
        let status = match frame[0] & 0x0F {
            0 => FlowStatus::ContinueToSend,
            1 => FlowStatus::Wait,
            2 => FlowStatus::Overflow,
            x => {
                return Err(TransportError::MalformedFrame(format!(
                    "invalid flow status {x}"
                )));
            }
        };
        Ok(Self {
            status,
            block_size: frame[1],
            st_min: frame[2],
        })
    }

    /// Encodes the frame payload (unpadded)
    pub fn to_bytes(&self) -> [u8; 3] {
        let fs = match self.status {
            FlowStatus::ContinueToSend => 0,
            FlowStatus::Wait => 1,
            FlowStatus::Overflow => 2,
        };
        [PCI_FLOW_CONTROL | fs, self.block_size, self.st_min]
    }

    /// Separation time the sender must keep between consecutive frames
    pub fn separation_time(&self) -> Duration {
        st_min_to_duration(self.st_min)
    }
}

/// A message cut into frames, ready to go on the bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segmented {
    /// Message fits into one single frame
    Single(Vec<u8>),
    /// Message needs a first frame and consecutive frames
    Multi {
        /// First frame
        first: Vec<u8>,
        /// Consecutive frames in transmission order
        consecutive: Vec<Vec<u8>>,
    },
}

/// Cuts a message into padded frames according to `settings`
pub fn segment(message: &LogicalMessage, settings: &IsoTpSettings) -> Segmented {
    let data = message.as_bytes();
    let len = data.len();
    if len <= MAX_CLASSIC_PAYLOAD - 1 {
        let mut sf = Vec::with_capacity(MAX_CLASSIC_PAYLOAD);
        sf.push(PCI_SINGLE | len as u8);
        sf.extend_from_slice(data);
        pad(&mut sf, settings);
        return Segmented::Single(sf);
    }
    if len <= settings.single_frame_limit() {
        // CAN-FD escape single frame
        let mut sf = Vec::with_capacity(len + 2);
        sf.push(PCI_SINGLE);
        sf.push(len as u8);
        sf.extend_from_slice(data);
        pad(&mut sf, settings);
        return Segmented::Single(sf);
    }

    let ff_payload = settings.tx_dl - 2;
    let mut first = Vec::with_capacity(settings.tx_dl);
    first.push(PCI_FIRST | ((len >> 8) & 0x0F) as u8);
    first.push((len & 0xFF) as u8);
    first.extend_from_slice(&data[..ff_payload]);

    let cf_payload = settings.tx_dl - 1;
    let mut consecutive = Vec::with_capacity((len - ff_payload).div_ceil(cf_payload));
    let mut sn: u8 = 1;
    for chunk in data[ff_payload..].chunks(cf_payload) {
        let mut cf = Vec::with_capacity(settings.tx_dl);
        cf.push(PCI_CONSECUTIVE | sn);
        cf.extend_from_slice(chunk);
        pad(&mut cf, settings);
        consecutive.push(cf);
        sn = (sn + 1) & 0x0F;
    }
    Segmented::Multi { first, consecutive }
}

/// Reassembly state of the receiving side
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SegmentState {
    /// No message in progress
    #[default]
    Idle,
    /// A first frame was received, waiting for consecutive frames
    AwaitingConsecutive {
        /// Length announced by the first frame
        expected_length: usize,
        /// Bytes received so far
        received_so_far: Vec<u8>,
        /// Sequence number the next consecutive frame must carry
        next_sequence_number: u8,
        /// Consecutive frames received since the last flow control
        frames_in_block: u8,
    },
}

impl SegmentState {
    /// True if no message is in progress
    pub fn is_idle(&self) -> bool {
        *self == SegmentState::Idle
    }
}

/// What the receiver has to do after a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxEvent {
    /// Frame was not part of a transfer
    Ignored,
    /// Frame was consumed, more are needed
    Pending,
    /// A flow control frame must be sent to the sender
    SendFlowControl,
    /// A message is complete
    Completed(LogicalMessage),
}

/// Receiving half of ISO-TP. Turns frames into messages
#[derive(Debug, Clone)]
pub struct Reassembler {
    state: SegmentState,
    block_size: u8,
    last_frame: Instant,
}

impl Reassembler {
    /// Creates an idle reassembler which asks for flow control every `block_size` frames
    pub fn new(block_size: u8) -> Self {
        Self {
            state: SegmentState::Idle,
            block_size,
            last_frame: Instant::now(),
        }
    }

    /// Current state
    pub fn state(&self) -> &SegmentState {
        &self.state
    }

    /// True if no message is in progress
    pub fn is_idle(&self) -> bool {
        self.state == SegmentState::Idle
    }

    /// Drops any partially received message
    pub fn reset(&mut self) {
        self.state = SegmentState::Idle;
    }

    /// Time by which the next consecutive frame must arrive, if one is expected
    pub fn consecutive_deadline(&self, n_cr: Duration) -> Option<Instant> {
        match self.state {
            SegmentState::Idle => None,
            SegmentState::AwaitingConsecutive { .. } => Some(self.last_frame + n_cr),
        }
    }

    /// Feeds one frame payload into the reassembler
    pub fn on_frame(&mut self, frame: &[u8]) -> TransportResult<RxEvent> {
        let Some(pci) = frame.first() else {
            return Ok(RxEvent::Ignored);
        };
        match pci & 0xF0 {
            PCI_SINGLE => {
                self.abort_in_progress("single frame");
                let (len, start) = if pci & 0x0F != 0 {
                    ((pci & 0x0F) as usize, 1)
                } else if frame.len() > 2 {
                    (frame[1] as usize, 2)
                } else {
                    (0, 1)
                };
                if len == 0 || start + len > frame.len() {
                    return Err(TransportError::MalformedFrame(format!(
                        "single frame length {len} does not fit frame {frame:02X?}"
                    )));
                }
                Ok(RxEvent::Completed(LogicalMessage(
                    frame[start..start + len].to_vec(),
                )))
            }
            PCI_FIRST => {
                self.abort_in_progress("first frame");
                if frame.len() < 3 {
                    return Err(TransportError::MalformedFrame(format!(
                        "first frame too short: {frame:02X?}"
                    )));
                }
                let expected_length = (((pci & 0x0F) as usize) << 8) | frame[1] as usize;
                if expected_length == 0 {
                    // 32 bit escape length, only needed above 4095 bytes
                    return Err(TransportError::MessageTooLarge(MAX_MESSAGE_LEN + 1));
                }
                let take = min(expected_length, frame.len() - 2);
                self.last_frame = Instant::now();
                self.state = SegmentState::AwaitingConsecutive {
                    expected_length,
                    received_so_far: frame[2..2 + take].to_vec(),
                    next_sequence_number: 1,
                    frames_in_block: 0,
                };
                Ok(RxEvent::SendFlowControl)
            }
            PCI_CONSECUTIVE => {
                let SegmentState::AwaitingConsecutive {
                    expected_length,
                    received_so_far,
                    next_sequence_number,
                    frames_in_block,
                } = &mut self.state
                else {
                    debug!("Consecutive frame without a transfer in progress, ignoring");
                    return Ok(RxEvent::Ignored);
                };
                let sn = pci & 0x0F;
                if sn != *next_sequence_number {
                    let expected = *next_sequence_number;
                    self.state = SegmentState::Idle;
                    return Err(TransportError::SequenceError { expected, got: sn });
                }
                let take = min(*expected_length - received_so_far.len(), frame.len() - 1);
                received_so_far.extend_from_slice(&frame[1..1 + take]);
                *next_sequence_number = (sn + 1) & 0x0F;
                self.last_frame = Instant::now();
                // Block size 0 means the whole message follows without further flow control
                if self.block_size != 0 {
                    *frames_in_block += 1;
                }
                if received_so_far.len() == *expected_length {
                    let data = std::mem::take(received_so_far);
                    self.state = SegmentState::Idle;
                    Ok(RxEvent::Completed(LogicalMessage(data)))
                } else if self.block_size != 0 && *frames_in_block == self.block_size {
                    *frames_in_block = 0;
                    Ok(RxEvent::SendFlowControl)
                } else {
                    Ok(RxEvent::Pending)
                }
            }
            // Flow control is only meaningful to a sender
            _ => Ok(RxEvent::Ignored),
        }
    }

    fn abort_in_progress(&mut self, by: &str) {
        if let SegmentState::AwaitingConsecutive {
            expected_length,
            received_so_far,
            ..
        } = &self.state
        {
            warn!(
                "Aborting reception of {expected_length} byte message after {} bytes, new {by} received",
                received_so_far.len()
            );
            self.state = SegmentState::Idle;
        }
    }
}

/// Traffic counters of one segmenter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelStatistics {
    /// Frames written to the channel
    pub frames_sent: u64,
    /// Frames read from the channel for our receive ID
    pub frames_received: u64,
    /// Complete messages sent
    pub messages_sent: u64,
    /// Complete messages received
    pub messages_received: u64,
    /// Payload bytes sent
    pub bytes_sent: u64,
    /// Payload bytes received
    pub bytes_received: u64,
    /// Failed send or receive calls
    pub errors: u64,
}

/// ISO-TP endpoint over a raw [CanChannel], bound to one pair of arbitration IDs
#[derive(Debug)]
pub struct IsoTpSegmenter {
    channel: Box<dyn CanChannel>,
    settings: IsoTpSettings,
    tx_id: u32,
    rx_id: u32,
    reassembler: Reassembler,
    cancel: CancelToken,
    stats: ChannelStatistics,
}

impl IsoTpSegmenter {
    /// Creates a segmenter that sends to `tx_id` and listens on `rx_id`
    pub fn new(
        channel: Box<dyn CanChannel>,
        tx_id: u32,
        rx_id: u32,
        settings: IsoTpSettings,
    ) -> Self {
        Self {
            channel,
            reassembler: Reassembler::new(settings.block_size),
            settings,
            tx_id,
            rx_id,
            cancel: CancelToken::new(),
            stats: ChannelStatistics::default(),
        }
    }

    /// Binds every blocking wait of the segmenter to `token`
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Settings in use
    pub fn settings(&self) -> &IsoTpSettings {
        &self.settings
    }

    /// (send ID, receive ID)
    pub fn ids(&self) -> (u32, u32) {
        (self.tx_id, self.rx_id)
    }

    /// Traffic counters
    pub fn statistics(&self) -> ChannelStatistics {
        self.stats
    }

    /// Current reassembly state
    pub fn state(&self) -> &SegmentState {
        self.reassembler.state()
    }

    /// Opens the underlying channel
    pub fn connect(
        &mut self,
        interface_name: &str,
        bitrate: u32,
        data_bitrate: u32,
    ) -> TransportResult<()> {
        self.settings.validate()?;
        self.channel.connect(interface_name, bitrate, data_bitrate)?;
        Ok(())
    }

    /// Closes the underlying channel
    pub fn disconnect(&mut self) -> TransportResult<()> {
        self.reassembler.reset();
        self.channel.disconnect()?;
        Ok(())
    }

    /// Sends a complete message, waiting for flow control as required
    pub fn send(&mut self, message: &LogicalMessage) -> TransportResult<()> {
        let res = self.send_inner(message);
        match &res {
            Ok(()) => {
                self.stats.messages_sent += 1;
                self.stats.bytes_sent += message.len() as u64;
            }
            Err(e) => {
                self.stats.errors += 1;
                debug!("ISO-TP send to 0x{:03X} failed: {e}", self.tx_id);
            }
        }
        res
    }

    /// Waits up to `timeout` for a complete message.
    ///
    /// Once a first frame arrives the transfer is bound by N_Cr rather than `timeout`,
    /// so a long response is not cut off half way through
    pub fn receive(&mut self, timeout: Duration) -> TransportResult<LogicalMessage> {
        let res = self.receive_inner(timeout);
        match &res {
            Ok(msg) => {
                self.stats.messages_received += 1;
                self.stats.bytes_received += msg.len() as u64;
            }
            Err(_) => self.stats.errors += 1,
        }
        res
    }

    fn send_inner(&mut self, message: &LogicalMessage) -> TransportResult<()> {
        if !self.reassembler.is_idle() {
            debug!("Dropping partially received message before sending");
            self.reassembler.reset();
        }
        match segment(message, &self.settings) {
            Segmented::Single(sf) => self.write_frame(&sf),
            Segmented::Multi { first, consecutive } => {
                self.write_frame(&first)?;
                let mut frames = consecutive.iter();
                loop {
                    let fc = self.await_flow_control()?;
                    let sep = fc.separation_time();
                    let block = if fc.block_size == 0 {
                        usize::MAX
                    } else {
                        fc.block_size as usize
                    };
                    for i in 0..block {
                        let Some(cf) = frames.next() else {
                            return Ok(());
                        };
                        if i != 0 && !sep.is_zero() && !self.cancel.sleep(sep) {
                            return Err(TransportError::Cancelled);
                        }
                        self.write_frame(cf)?;
                    }
                    if frames.len() == 0 {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn await_flow_control(&mut self) -> TransportResult<FlowControl> {
        let mut waits = 0u8;
        let mut deadline = Instant::now() + self.settings.n_bs;
        loop {
            let Some(frame) = self.read_frame(deadline)? else {
                return Err(TransportError::Timeout("flow control"));
            };
            let data = frame.data();
            if data.first().map(|pci| pci & 0xF0) != Some(PCI_FLOW_CONTROL) {
                debug!("Ignoring {frame} while waiting for flow control");
                continue;
            }
            let fc = FlowControl::parse(data)?;
            match fc.status {
                FlowStatus::ContinueToSend => return Ok(fc),
                FlowStatus::Wait => {
                    waits += 1;
                    if waits > self.settings.max_wait_frames {
                        return Err(TransportError::TooManyWaitFrames(
                            self.settings.max_wait_frames,
                        ));
                    }
                    deadline = Instant::now() + self.settings.n_bs;
                }
                FlowStatus::Overflow => return Err(TransportError::Overflow),
            }
        }
    }

    fn receive_inner(&mut self, timeout: Duration) -> TransportResult<LogicalMessage> {
        let deadline = Instant::now() + timeout;
        loop {
            let (wait_until, waiting_for) =
                match self.reassembler.consecutive_deadline(self.settings.n_cr) {
                    Some(d) => (d, "consecutive frame"),
                    None => (deadline, "response"),
                };
            let Some(frame) = self.read_frame(wait_until)? else {
                self.reassembler.reset();
                return Err(TransportError::Timeout(waiting_for));
            };
            match self.reassembler.on_frame(frame.data())? {
                RxEvent::Completed(msg) => return Ok(msg),
                RxEvent::SendFlowControl => {
                    let fc =
                        FlowControl::continue_to_send(self.settings.block_size, self.settings.st_min);
                    self.write_frame(&fc.to_bytes())?;
                }
                RxEvent::Pending | RxEvent::Ignored => {}
            }
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> TransportResult<()> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let mut buf = frame.to_vec();
        pad(&mut buf, &self.settings);
        debug!("ISO-TP TX 0x{:03X}: {buf:02X?}", self.tx_id);
        if let Err(e) = self.channel.send(self.tx_id, &buf, self.settings.is_fd()) {
            error!("Channel send error: {e}");
            return Err(e.into());
        }
        self.stats.frames_sent += 1;
        Ok(())
    }

    /// Reads the next frame for our receive ID, or `None` once `deadline` passes
    fn read_frame(&mut self, deadline: Instant) -> TransportResult<Option<RawFrame>> {
        let deadline = self.cancel.bound(deadline);
        loop {
            if self.cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let slice = (deadline - now).min(CANCEL_POLL_INTERVAL * 5);
            match self.channel.recv(slice) {
                Ok(Some(frame)) if frame.id() == self.rx_id => {
                    self.stats.frames_received += 1;
                    debug!("ISO-TP RX 0x{:03X}: {:02X?}", self.rx_id, frame.data());
                    return Ok(Some(frame));
                }
                Ok(Some(frame)) => debug!("Ignoring frame for another address: {frame}"),
                Ok(None) => {}
                Err(e) => {
                    error!("Error reading from channel: {e}");
                    return Err(e.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(len: usize) -> LogicalMessage {
        LogicalMessage::new((0..len).map(|i| i as u8).collect()).unwrap()
    }

    fn reassemble(seg: Segmented, block_size: u8) -> LogicalMessage {
        let mut r = Reassembler::new(block_size);
        let frames = match seg {
            Segmented::Single(sf) => vec![sf],
            Segmented::Multi { first, consecutive } => {
                let mut v = vec![first];
                v.extend(consecutive);
                v
            }
        };
        for f in frames {
            if let RxEvent::Completed(m) = r.on_frame(&f).unwrap() {
                assert!(r.is_idle());
                return m;
            }
        }
        panic!("message never completed");
    }

    #[test]
    fn message_length_limits() {
        assert!(matches!(
            LogicalMessage::new(vec![]),
            Err(TransportError::EmptyMessage)
        ));
        assert!(matches!(
            LogicalMessage::new(vec![0; 4096]),
            Err(TransportError::MessageTooLarge(4096))
        ));
        assert!(LogicalMessage::new(vec![0; 4095]).is_ok());
    }

    #[test]
    fn classic_single_frame() {
        let s = IsoTpSettings::classic();
        let Segmented::Single(sf) = segment(&msg(7), &s) else {
            panic!("expected single frame")
        };
        assert_eq!(sf, vec![0x07, 0, 1, 2, 3, 4, 5, 6]);
        assert!(matches!(segment(&msg(8), &s), Segmented::Multi { .. }));
    }

    #[test]
    fn fd_escape_single_frame() {
        let s = IsoTpSettings::default();
        let Segmented::Single(sf) = segment(&msg(62), &s) else {
            panic!("expected single frame")
        };
        assert_eq!(sf.len(), 64);
        assert_eq!(&sf[..3], &[0x00, 62, 0]);
        // 20 bytes of payload + 2 byte PCI pads up to 24
        let Segmented::Single(sf) = segment(&msg(20), &s) else {
            panic!("expected single frame")
        };
        assert_eq!(sf.len(), 24);
        assert!(matches!(segment(&msg(63), &s), Segmented::Multi { .. }));
    }

    #[test]
    fn first_and_consecutive_layout() {
        let s = IsoTpSettings::classic();
        let Segmented::Multi { first, consecutive } = segment(&msg(300), &s) else {
            panic!("expected multi frame")
        };
        assert_eq!(&first[..2], &[0x11, 0x2C]);
        assert_eq!(first.len(), 8);
        // 294 bytes remaining, 7 per frame
        assert_eq!(consecutive.len(), 42);
        assert_eq!(consecutive[0][0], 0x21);
        assert_eq!(consecutive[14][0], 0x2F);
        assert_eq!(consecutive[15][0], 0x20);
        assert_eq!(consecutive[16][0], 0x21);
    }

    #[test]
    fn reassembles_boundary_lengths() {
        for s in [IsoTpSettings::classic(), IsoTpSettings::default()] {
            for len in [1, 6, 7, 8, 61, 62, 63, 64, 125, 126, 127, 4094, 4095] {
                let m = msg(len);
                assert_eq!(reassemble(segment(&m, &s), 0), m, "len {len} tx_dl {}", s.tx_dl);
            }
        }
    }

    #[test]
    fn unlimited_block_over_many_sequence_wraps() {
        // 2000 bytes over classic CAN is 285 consecutive frames
        let m = msg(2000);
        let Segmented::Multi { first, consecutive } = segment(&m, &IsoTpSettings::classic()) else {
            panic!()
        };
        assert!(consecutive.len() > u8::MAX as usize);
        let mut r = Reassembler::new(0);
        assert_eq!(r.on_frame(&first).unwrap(), RxEvent::SendFlowControl);
        let (last, rest) = consecutive.split_last().unwrap();
        for cf in rest {
            assert_eq!(r.on_frame(cf).unwrap(), RxEvent::Pending);
        }
        assert_eq!(r.on_frame(last).unwrap(), RxEvent::Completed(m));
    }

    #[test]
    fn sequence_error_resets() {
        let s = IsoTpSettings::classic();
        let Segmented::Multi { first, consecutive } = segment(&msg(30), &s) else {
            panic!()
        };
        let mut r = Reassembler::new(0);
        assert_eq!(r.on_frame(&first).unwrap(), RxEvent::SendFlowControl);
        r.on_frame(&consecutive[0]).unwrap();
        let err = r.on_frame(&consecutive[2]).unwrap_err();
        assert!(matches!(
            err,
            TransportError::SequenceError {
                expected: 2,
                got: 3
            }
        ));
        assert!(r.is_idle());
        let m = msg(12);
        let Segmented::Multi { first, consecutive } = segment(&m, &s) else {
            panic!()
        };
        r.on_frame(&first).unwrap();
        assert_eq!(r.on_frame(&consecutive[0]).unwrap(), RxEvent::Completed(m));
    }

    #[test]
    fn block_size_requests_flow_control() {
        let s = IsoTpSettings::classic();
        let Segmented::Multi { first, consecutive } = segment(&msg(100), &s) else {
            panic!()
        };
        let mut r = Reassembler::new(4);
        r.on_frame(&first).unwrap();
        let events: Vec<_> = consecutive[..8]
            .iter()
            .map(|cf| r.on_frame(cf).unwrap())
            .collect();
        assert_eq!(events[3], RxEvent::SendFlowControl);
        assert_eq!(events[4], RxEvent::Pending);
        assert_eq!(events[7], RxEvent::SendFlowControl);
    }

    #[test]
    fn new_first_frame_aborts_transfer() {
        let s = IsoTpSettings::classic();
        let Segmented::Multi { first, .. } = segment(&msg(40), &s) else {
            panic!()
        };
        let mut r = Reassembler::new(0);
        r.on_frame(&first).unwrap();
        let done = r.on_frame(&[0x02, 0x50, 0x03]).unwrap();
        assert_eq!(done, RxEvent::Completed(LogicalMessage(vec![0x50, 0x03])));
        assert!(r.is_idle());
    }

    #[test]
    fn stray_consecutive_frame_is_ignored() {
        let mut r = Reassembler::new(0);
        assert_eq!(r.on_frame(&[0x21, 1, 2, 3]).unwrap(), RxEvent::Ignored);
    }

    #[test]
    fn st_min_decoding() {
        assert_eq!(st_min_to_duration(0x00), Duration::ZERO);
        assert_eq!(st_min_to_duration(0x14), Duration::from_millis(20));
        assert_eq!(st_min_to_duration(0xF1), Duration::from_micros(100));
        assert_eq!(st_min_to_duration(0xF9), Duration::from_micros(900));
        assert_eq!(st_min_to_duration(0x80), Duration::from_millis(127));
        assert_eq!(st_min_to_duration(0xFA), Duration::from_millis(127));
    }

    #[test]
    fn flow_control_frames() {
        let fc = FlowControl::parse(&[0x30, 0x08, 0x14, 0xCC, 0xCC]).unwrap();
        assert_eq!(fc, FlowControl::continue_to_send(8, 0x14));
        assert_eq!(FlowControl::parse(&[0x32, 0, 0]).unwrap().status, FlowStatus::Overflow);
        assert!(FlowControl::parse(&[0x35, 0, 0]).is_err());
        assert_eq!(fc.to_bytes(), [0x30, 0x08, 0x14]);
    }

    #[test]
    fn fd_frame_lengths() {
        assert_eq!(frame_length_for(3), 3);
        assert_eq!(frame_length_for(9), 12);
        assert_eq!(frame_length_for(33), 48);
        assert_eq!(frame_length_for(64), 64);
    }
}
