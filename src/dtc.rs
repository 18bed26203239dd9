//! Module for common Diagnostic trouble code data

use std::{collections::HashMap, fmt, str::FromStr, time::SystemTime};

use bitflags::bitflags;

/// System a DTC belongs to, encoded in the top two bits of the DTC
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DtcCategory {
    /// P - Powertrain
    Powertrain,
    /// C - Chassis
    Chassis,
    /// B - Body
    Body,
    /// U - Network
    Network,
}

impl DtcCategory {
    /// Letter the category is displayed with
    pub const fn letter(self) -> char {
        match self {
            Self::Powertrain => 'P',
            Self::Chassis => 'C',
            Self::Body => 'B',
            Self::Network => 'U',
        }
    }

    const fn bits(self) -> u32 {
        match self {
            Self::Powertrain => 0b00,
            Self::Chassis => 0b01,
            Self::Body => 0b10,
            Self::Network => 0b11,
        }
    }
}

/// A 3 byte ISO14229-1 DTC. The upper two bytes are the
/// displayed code, the lowest byte is the failure type
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DtcCode(u32);

impl DtcCode {
    /// Creates a DTC from its raw 24 bit value
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw & 0x00FF_FFFF)
    }

    /// Creates a DTC from the 3 bytes sent by the ECU
    pub const fn from_bytes(high: u8, middle: u8, low: u8) -> Self {
        Self(((high as u32) << 16) | ((middle as u32) << 8) | low as u32)
    }

    /// Raw 24 bit value
    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Category from the top two bits
    pub const fn category(&self) -> DtcCategory {
        match (self.0 >> 22) & 0b11 {
            0b00 => DtcCategory::Powertrain,
            0b01 => DtcCategory::Chassis,
            0b10 => DtcCategory::Body,
            _ => DtcCategory::Network,
        }
    }

    /// 14 bit code number displayed after the category letter
    pub const fn number(&self) -> u16 {
        ((self.0 >> 8) & 0x3FFF) as u16
    }

    /// Failure type byte
    pub const fn failure_type(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }

    /// The DTC without its failure type, as it is shown on generic scan tools
    pub const fn base(&self) -> Self {
        Self(self.0 & 0x00FF_FF00)
    }
}

impl fmt::Display for DtcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:04X}", self.category().letter(), self.number())?;
        if self.failure_type() != 0 {
            write!(f, "-{:02X}", self.failure_type())?;
        }
        Ok(())
    }
}

/// Error parsing a DTC from text
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{0}' is not a valid DTC")]
pub struct ParseDtcError(String);

impl FromStr for DtcCode {
    type Err = ParseDtcError;

    /// Parses `P0101` or `P0101-1A` style codes
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseDtcError(s.to_string());
        let (code, ft) = match s.split_once('-') {
            Some((c, ft)) => (c, u8::from_str_radix(ft, 16).map_err(|_| err())?),
            None => (s, 0),
        };
        let mut chars = code.chars();
        let category = match chars.next().map(|c| c.to_ascii_uppercase()) {
            Some('P') => DtcCategory::Powertrain,
            Some('C') => DtcCategory::Chassis,
            Some('B') => DtcCategory::Body,
            Some('U') => DtcCategory::Network,
            _ => return Err(err()),
        };
        let digits = chars.as_str();
        if digits.len() != 4 {
            return Err(err());
        }
        let number = u16::from_str_radix(digits, 16).map_err(|_| err())?;
        if number > 0x3FFF {
            return Err(err());
        }
        Ok(Self(
            (category.bits() << 22) | ((number as u32) << 8) | ft as u32,
        ))
    }
}

bitflags! {
    /// ISO14229-1 DTC status byte
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct DtcStatus: u8 {
        /// Most recent test failed
        const TEST_FAILED = 0x01;
        /// Test failed during the current operation cycle
        const TEST_FAILED_THIS_OPERATION_CYCLE = 0x02;
        /// Pending DTC
        const PENDING = 0x04;
        /// Confirmed DTC
        const CONFIRMED = 0x08;
        /// Test has not completed since DTCs were last cleared
        const TEST_NOT_COMPLETED_SINCE_LAST_CLEAR = 0x10;
        /// Test has failed since DTCs were last cleared
        const TEST_FAILED_SINCE_LAST_CLEAR = 0x20;
        /// Test has not completed this operation cycle
        const TEST_NOT_COMPLETED_THIS_OPERATION_CYCLE = 0x40;
        /// The DTC requests the MIL (check engine light)
        const WARNING_INDICATOR_REQUESTED = 0x80;
    }
}

/// A DTC read from one vehicle.
///
/// Two records describe the same fault if they share `(vehicle_id, code)`
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DtcRecord {
    /// Vehicle the DTC was read from
    pub vehicle_id: String,
    /// The DTC
    pub code: DtcCode,
    /// Raw status byte
    pub status: u8,
    /// Description from a [DtcLookup], if one knew the code
    pub description: Option<String>,
    /// When the DTC was read
    pub timestamp: SystemTime,
}

impl DtcRecord {
    /// Creates a record stamped with the current time
    pub fn new(vehicle_id: &str, code: DtcCode, status: u8, description: Option<String>) -> Self {
        Self {
            vehicle_id: vehicle_id.to_string(),
            code,
            status,
            description,
            timestamp: SystemTime::now(),
        }
    }

    /// Decoded status byte
    pub fn status_flags(&self) -> DtcStatus {
        DtcStatus::from_bits_retain(self.status)
    }

    /// Identity of the fault described by this record
    pub fn identity(&self) -> (&str, DtcCode) {
        (&self.vehicle_id, self.code)
    }

    /// Indication if the DTC turns on the MIL lamp (Malfunction indicator lamp)
    pub fn mil_on(&self) -> bool {
        self.status_flags()
            .contains(DtcStatus::WARNING_INDICATOR_REQUESTED)
    }

    /// True if the DTC is confirmed and stored by the ECU
    pub fn is_confirmed(&self) -> bool {
        self.status_flags().contains(DtcStatus::CONFIRMED)
    }
}

/// Looks up human readable descriptions of DTCs
pub trait DtcLookup: Send + Sync {
    /// Description of `code`, if known
    fn lookup(&self, code: DtcCode) -> Option<String>;
}

impl<F> DtcLookup for F
where
    F: Fn(DtcCode) -> Option<String> + Send + Sync,
{
    fn lookup(&self, code: DtcCode) -> Option<String> {
        self(code)
    }
}

/// In memory DTC description table.
///
/// Codes are matched exactly first, then without their failure type
#[derive(Debug, Clone, Default)]
pub struct DtcTable {
    entries: HashMap<DtcCode, String>,
}

impl DtcTable {
    /// Creates an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a description
    pub fn insert(&mut self, code: DtcCode, description: impl Into<String>) {
        self.entries.insert(code, description.into());
    }

    /// Number of known codes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if the table knows no codes
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(DtcCode, S)> for DtcTable {
    fn from_iter<T: IntoIterator<Item = (DtcCode, S)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().map(|(c, d)| (c, d.into())).collect(),
        }
    }
}

impl DtcLookup for DtcTable {
    fn lookup(&self, code: DtcCode) -> Option<String> {
        self.entries
            .get(&code)
            .or_else(|| self.entries.get(&code.base()))
            .cloned()
    }
}
