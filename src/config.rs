//! Configuration of the CAN link, the UDS engine and the fleet scheduler.
//!
//! Loading the configuration from disk is left to the caller. Options can either be filled in
//! through the structs directly, deserialized (with the `serde` feature), or set one at a time
//! by their dotted key with [FleetConfig::set]:
//!
//! | Key | Default |
//! |-|-|
//! | `can.interface` | `can0` |
//! | `can.bitrate` | `500000` |
//! | `can.data_bitrate` | `2000000` |
//! | `can.timeout` | `1000` (ms) |
//! | `can.fd` | `true` |
//! | `isotp.block_size` | `8` |
//! | `isotp.st_min` | `0` |
//! | `isotp.padding` | `true` |
//! | `isotp.max_wait_frames` | `10` |
//! | `uds.ta` | `0x7E0` |
//! | `uds.ta_rx` | `0x7E8` |
//! | `uds.timeout` | `1000` (ms) |
//! | `uds.session_type` | `extended` |
//! | `uds.retry_limit` | `3` |
//! | `uds.s3_timeout` | `5000` (ms) |
//! | `uds.keep_alive_interval` | half of `uds.s3_timeout` |
//! | `uds.tester_present_require_response` | `true` |
//! | `fleet.max_concurrent_diagnostics` | `5` |
//! | `fleet.max_buffer_size` | `1000` |
//! | `fleet.vehicle_timeout` | derived from the plan |

use std::{str::FromStr, time::Duration};

use crate::{
    DiagError, DiagServerResult,
    channel::{MAX_CLASSIC_PAYLOAD, MAX_EXTENDED_ID, MAX_FD_PAYLOAD},
    helpers::parse_u32,
    isotp::IsoTpSettings,
    plan::DiagnosticPlan,
    uds::{DiagnosticSession, RetryPolicy, UdsSessionOptions},
    vehicle::VehicleHandle,
};

/// Added on top of the request and wait time of a plan to get the default vehicle timeout
pub const VEHICLE_TIMEOUT_MARGIN: Duration = Duration::from_secs(2);

/// CAN link options
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CanSettings {
    /// Interface name, EG: `can0`
    pub interface: String,
    /// Nominal bitrate
    pub bitrate: u32,
    /// CAN-FD data phase bitrate
    pub data_bitrate: u32,
    /// Frame level timeout (flow control and consecutive frame gaps)
    pub timeout: Duration,
    /// Use CAN-FD frames (64 bytes) rather than classic frames (8 bytes)
    pub fd: bool,
}

impl Default for CanSettings {
    fn default() -> Self {
        Self {
            interface: "can0".into(),
            bitrate: 500_000,
            data_bitrate: 2_000_000,
            timeout: Duration::from_millis(1000),
            fd: true,
        }
    }
}

/// ISO-TP options that are not derived from the CAN link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct IsoTpOptions {
    /// Block size we ask senders for
    pub block_size: u8,
    /// Separation time we ask senders for (raw STmin)
    pub st_min: u8,
    /// Pad frames
    pub padding: bool,
    /// Maximum wait frames accepted in a row
    pub max_wait_frames: u8,
}

impl Default for IsoTpOptions {
    fn default() -> Self {
        let d = IsoTpSettings::default();
        Self {
            block_size: d.block_size,
            st_min: d.st_min,
            padding: d.pad_frame,
            max_wait_frames: d.max_wait_frames,
        }
    }
}

/// UDS options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct UdsSettings {
    /// Default request (tester to ECU) CAN ID
    pub ta: u32,
    /// Default response (ECU to tester) CAN ID
    pub ta_rx: u32,
    /// Response timeout, applied again after each response pending reply
    pub timeout: Duration,
    /// Session entered by [DiagnosticPlan::standard_scan] plans built from this config
    pub session_type: DiagnosticSession,
    /// Response pending replies after which a request fails
    pub retry_limit: u32,
    /// S3 session timeout
    pub s3_timeout: Duration,
    /// Tester present interval. Half of S3 if not set
    pub keep_alive_interval: Option<Duration>,
    /// Ask for tester present responses
    pub tester_present_require_response: bool,
}

impl Default for UdsSettings {
    fn default() -> Self {
        let o = UdsSessionOptions::default();
        Self {
            ta: 0x7E0,
            ta_rx: 0x7E8,
            timeout: o.response_timeout,
            session_type: DiagnosticSession::Extended,
            retry_limit: o.retry_policy.response_pending_limit,
            s3_timeout: o.s3_timeout,
            keep_alive_interval: None,
            tester_present_require_response: o.tester_present_require_response,
        }
    }
}

/// Fleet scheduler options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FleetSettings {
    /// Vehicles diagnosed at the same time
    pub max_concurrent_diagnostics: usize,
    /// Capacity of the diagnostics aggregator
    pub max_buffer_size: usize,
    /// Time budget of one vehicle. Derived from the plan if not set
    pub vehicle_timeout: Option<Duration>,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            max_concurrent_diagnostics: 5,
            max_buffer_size: 1000,
            vehicle_timeout: None,
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct FleetConfig {
    /// CAN link
    pub can: CanSettings,
    /// ISO-TP
    pub isotp: IsoTpOptions,
    /// UDS
    pub uds: UdsSettings,
    /// Scheduler
    pub fleet: FleetSettings,
}

fn invalid(key: &str, value: &str) -> DiagError {
    DiagError::InvalidConfig(format!("invalid value '{value}' for '{key}'"))
}

fn parse_num<T: TryFrom<u32>>(key: &str, value: &str) -> DiagServerResult<T> {
    parse_u32(value)
        .and_then(|v| T::try_from(v).ok())
        .ok_or_else(|| invalid(key, value))
}

/// Parses `1500`, `1500ms` or `2s`. Bare numbers are milliseconds
fn parse_duration(key: &str, value: &str) -> DiagServerResult<Duration> {
    let v = value.trim();
    let (num, scale) = if let Some(ms) = v.strip_suffix("ms") {
        (ms, 1)
    } else if let Some(s) = v.strip_suffix('s') {
        (s, 1000)
    } else {
        (v, 1)
    };
    let n: u64 = num.trim().parse().map_err(|_| invalid(key, value))?;
    n.checked_mul(scale)
        .map(Duration::from_millis)
        .ok_or_else(|| invalid(key, value))
}

fn parse_bool(key: &str, value: &str) -> DiagServerResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

impl FleetConfig {
    /// Builds a config from the defaults and `key = value` pairs, then validates it
    pub fn from_pairs<I, K, V>(pairs: I) -> DiagServerResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut cfg = Self::default();
        for (k, v) in pairs {
            cfg.set(k.as_ref(), v.as_ref())?;
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Sets one option by its dotted key. Unknown keys are rejected
    pub fn set(&mut self, key: &str, value: &str) -> DiagServerResult<()> {
        match key {
            "can.interface" => self.can.interface = value.trim().to_string(),
            "can.bitrate" => self.can.bitrate = parse_num(key, value)?,
            "can.data_bitrate" => self.can.data_bitrate = parse_num(key, value)?,
            "can.timeout" => self.can.timeout = parse_duration(key, value)?,
            "can.fd" => self.can.fd = parse_bool(key, value)?,
            "isotp.block_size" => self.isotp.block_size = parse_num(key, value)?,
            "isotp.st_min" => self.isotp.st_min = parse_num(key, value)?,
            "isotp.padding" => self.isotp.padding = parse_bool(key, value)?,
            "isotp.max_wait_frames" => self.isotp.max_wait_frames = parse_num(key, value)?,
            "uds.ta" => self.uds.ta = parse_num(key, value)?,
            "uds.ta_rx" => self.uds.ta_rx = parse_num(key, value)?,
            "uds.timeout" => self.uds.timeout = parse_duration(key, value)?,
            "uds.session_type" => {
                self.uds.session_type =
                    DiagnosticSession::from_str(value.trim()).map_err(|_| invalid(key, value))?
            }
            "uds.retry_limit" => self.uds.retry_limit = parse_num(key, value)?,
            "uds.s3_timeout" => self.uds.s3_timeout = parse_duration(key, value)?,
            "uds.keep_alive_interval" => {
                self.uds.keep_alive_interval = Some(parse_duration(key, value)?)
            }
            "uds.tester_present_require_response" => {
                self.uds.tester_present_require_response = parse_bool(key, value)?
            }
            "fleet.max_concurrent_diagnostics" => {
                self.fleet.max_concurrent_diagnostics = parse_num(key, value)?
            }
            "fleet.max_buffer_size" => self.fleet.max_buffer_size = parse_num(key, value)?,
            "fleet.vehicle_timeout" => {
                self.fleet.vehicle_timeout = Some(parse_duration(key, value)?)
            }
            _ => {
                return Err(DiagError::InvalidConfig(format!(
                    "unknown configuration key '{key}'"
                )));
            }
        }
        Ok(())
    }

    /// Checks the options are usable together
    pub fn validate(&self) -> DiagServerResult<()> {
        let fail = |msg: String| Err(DiagError::InvalidConfig(msg));
        if self.can.interface.is_empty() {
            return fail("can.interface is empty".into());
        }
        if self.can.bitrate == 0 || (self.can.fd && self.can.data_bitrate == 0) {
            return fail("CAN bitrates must be non zero".into());
        }
        if self.can.timeout.is_zero() || self.uds.timeout.is_zero() {
            return fail("timeouts must be non zero".into());
        }
        if self.uds.ta > MAX_EXTENDED_ID || self.uds.ta_rx > MAX_EXTENDED_ID {
            return fail("uds.ta and uds.ta_rx must fit into 29 bits".into());
        }
        if self.uds.ta == self.uds.ta_rx {
            return fail("uds.ta and uds.ta_rx must differ".into());
        }
        if self.uds_options().keep_alive_interval().is_zero() {
            return fail("uds.keep_alive_interval must be non zero".into());
        }
        if self.uds_options().keep_alive_interval() >= self.uds.s3_timeout {
            return fail("uds.keep_alive_interval must be shorter than uds.s3_timeout".into());
        }
        if self.fleet.max_concurrent_diagnostics == 0 {
            return fail("fleet.max_concurrent_diagnostics must be at least 1".into());
        }
        if self.fleet.max_buffer_size == 0 {
            return fail("fleet.max_buffer_size must be at least 1".into());
        }
        self.isotp_settings()
            .validate()
            .map_err(|e| DiagError::InvalidConfig(e.to_string()))
    }

    /// ISO-TP settings for a vehicle channel
    pub fn isotp_settings(&self) -> IsoTpSettings {
        IsoTpSettings {
            tx_dl: if self.can.fd {
                MAX_FD_PAYLOAD
            } else {
                MAX_CLASSIC_PAYLOAD
            },
            block_size: self.isotp.block_size,
            st_min: self.isotp.st_min,
            pad_frame: self.isotp.padding,
            n_bs: self.can.timeout,
            n_cr: self.can.timeout,
            max_wait_frames: self.isotp.max_wait_frames,
            ..IsoTpSettings::default()
        }
    }

    /// UDS engine options
    pub fn uds_options(&self) -> UdsSessionOptions {
        UdsSessionOptions {
            response_timeout: self.uds.timeout,
            retry_policy: RetryPolicy {
                response_pending_limit: self.uds.retry_limit,
            },
            s3_timeout: self.uds.s3_timeout,
            keep_alive_interval: self.uds.keep_alive_interval,
            tester_present_require_response: self.uds.tester_present_require_response,
        }
    }

    /// Handle for `vehicle_id` addressed with `uds.ta` and `uds.ta_rx`
    pub fn vehicle_handle(&self, vehicle_id: &str) -> VehicleHandle {
        VehicleHandle::new(vehicle_id).with_addressing(self.uds.ta, self.uds.ta_rx)
    }

    /// Time budget of one vehicle running `plan`.
    ///
    /// `fleet.vehicle_timeout` if set, otherwise one `uds.timeout` per request plus the
    /// waits of the plan plus [VEHICLE_TIMEOUT_MARGIN]
    pub fn vehicle_timeout(&self, plan: &DiagnosticPlan) -> Duration {
        self.fleet.vehicle_timeout.unwrap_or_else(|| {
            self.uds.timeout * plan.request_count() as u32 + plan.total_wait() + VEHICLE_TIMEOUT_MARGIN
        })
    }
}
