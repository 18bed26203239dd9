//! Bounded FIFO store of DTCs and scan results collected from the fleet.
//!
//! The buffer never holds more than its capacity. Once it is full, every new entry evicts the
//! oldest one. Entries are also indexed per vehicle so the history of one vehicle is found
//! without walking the whole buffer.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    DiagError, DiagServerResult,
    dtc::{DtcCode, DtcRecord},
    isotp::ChannelStatistics,
    plan::{ScanOutcome, ScanResult},
};

/// Default capacity, matching `fleet.max_buffer_size`
pub const DEFAULT_CAPACITY: usize = 1000;

/// Outcome of a scan without its data
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, strum_macros::Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
#[strum(serialize_all = "snake_case")]
pub enum ScanStatus {
    /// Every operation succeeded
    Success,
    /// Data was gathered, but something failed
    PartialFailure,
    /// Nothing was gathered
    Failure,
}

/// Condensed form of a [ScanResult] as it is kept by the aggregator
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanSummary {
    /// Vehicle ID
    pub vehicle_id: String,
    /// Outcome
    pub status: ScanStatus,
    /// VIN, if the plan read it
    pub vin: Option<String>,
    /// DTCs found
    pub dtc_count: usize,
    /// Errors as text
    pub errors: Vec<String>,
    /// Wall time of the scan in milliseconds
    pub elapsed_ms: u64,
    /// When the result was recorded, in milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    /// Transport counters
    pub statistics: ChannelStatistics,
}

impl From<&ScanResult> for ScanSummary {
    fn from(r: &ScanResult) -> Self {
        let status = match r.outcome {
            ScanOutcome::Success(_) => ScanStatus::Success,
            ScanOutcome::PartialFailure(..) => ScanStatus::PartialFailure,
            ScanOutcome::Failure(_) => ScanStatus::Failure,
        };
        let data = r.data();
        Self {
            vehicle_id: r.vehicle_id.clone(),
            status,
            vin: data.and_then(|d| d.vin()).map(str::to_string),
            dtc_count: data.map(|d| d.dtcs().count()).unwrap_or(0),
            errors: r.errors(),
            elapsed_ms: r.elapsed.as_millis() as u64,
            timestamp_ms: unix_ms(SystemTime::now()),
            statistics: r.statistics,
        }
    }
}

/// One entry of the aggregator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregatorEntry {
    /// A DTC
    Dtc(DtcRecord),
    /// The result of a scan
    Scan(ScanSummary),
}

impl AggregatorEntry {
    /// Vehicle the entry belongs to
    pub fn vehicle_id(&self) -> &str {
        match self {
            Self::Dtc(d) => &d.vehicle_id,
            Self::Scan(s) => &s.vehicle_id,
        }
    }
}

impl From<DtcRecord> for AggregatorEntry {
    fn from(d: DtcRecord) -> Self {
        Self::Dtc(d)
    }
}

impl From<ScanSummary> for AggregatorEntry {
    fn from(s: ScanSummary) -> Self {
        Self::Scan(s)
    }
}

impl From<&ScanResult> for AggregatorEntry {
    fn from(r: &ScanResult) -> Self {
        Self::Scan(r.into())
    }
}

/// A DTC in export form
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DtcExport {
    /// Vehicle ID
    pub vehicle_id: String,
    /// Code as text, EG: `P0101`
    pub code: String,
    /// Raw 24 bit code
    pub raw: u32,
    /// Status byte
    pub status: u8,
    /// Description, if known
    pub description: Option<String>,
    /// MIL requested
    pub mil_on: bool,
    /// Confirmed DTC
    pub confirmed: bool,
    /// Discovery time, in milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

impl From<&DtcRecord> for DtcExport {
    fn from(d: &DtcRecord) -> Self {
        Self {
            vehicle_id: d.vehicle_id.clone(),
            code: d.code.to_string(),
            raw: d.code.raw(),
            status: d.status,
            description: d.description.clone(),
            mil_on: d.mil_on(),
            confirmed: d.is_confirmed(),
            timestamp_ms: unix_ms(d.timestamp),
        }
    }
}

/// Immutable copy of the aggregator contents, oldest entry first
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Snapshot {
    /// DTCs
    pub dtcs: Vec<DtcExport>,
    /// Scan results
    pub scans: Vec<ScanSummary>,
    /// Capacity of the buffer
    pub capacity: usize,
    /// Entries evicted since the aggregator was created
    pub evicted: u64,
}

/// Fleet level view of the aggregator
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AggregatorSummary {
    /// Vehicles with at least one entry
    pub vehicles_seen: usize,
    /// Vehicles with at least one DTC entry
    pub vehicles_with_dtcs: usize,
    /// Entries held
    pub entries: usize,
    /// Capacity of the buffer
    pub capacity: usize,
    /// Fill level in percent
    pub buffer_usage: f64,
    /// Entries evicted since the aggregator was created
    pub evicted: u64,
}

#[derive(Debug)]
struct Inner {
    capacity: usize,
    // Sequence numbers are contiguous, the front entry has the lowest
    entries: VecDeque<(u64, AggregatorEntry)>,
    next_seq: u64,
    by_vehicle: HashMap<String, VecDeque<u64>>,
    evicted: u64,
}

impl Inner {
    fn get(&self, seq: u64) -> Option<&AggregatorEntry> {
        let front = self.entries.front()?.0;
        let idx = seq.checked_sub(front)? as usize;
        self.entries.get(idx).map(|(_, e)| e)
    }

    fn vehicle_entries(
        &self,
        vehicle_id: &str,
    ) -> impl DoubleEndedIterator<Item = &AggregatorEntry> {
        self.by_vehicle
            .get(vehicle_id)
            .into_iter()
            .flatten()
            .filter_map(|seq| self.get(*seq))
    }

    fn push(&mut self, entry: AggregatorEntry) {
        if self.entries.len() == self.capacity {
            if let Some((seq, old)) = self.entries.pop_front() {
                let id = old.vehicle_id();
                if let Some(idx) = self.by_vehicle.get_mut(id) {
                    // The evicted entry is the oldest of its vehicle
                    debug_assert_eq!(idx.front(), Some(&seq));
                    idx.pop_front();
                    if idx.is_empty() {
                        self.by_vehicle.remove(id);
                    }
                }
                self.evicted += 1;
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_vehicle
            .entry(entry.vehicle_id().to_string())
            .or_default()
            .push_back(seq);
        self.entries.push_back((seq, entry));
    }
}

/// Thread safe bounded store of diagnostics results
#[derive(Debug)]
pub struct DiagnosticsAggregator {
    inner: RwLock<Inner>,
}

impl Default for DiagnosticsAggregator {
    fn default() -> Self {
        Self {
            inner: RwLock::new(Inner {
                capacity: DEFAULT_CAPACITY,
                entries: VecDeque::new(),
                next_seq: 0,
                by_vehicle: HashMap::new(),
                evicted: 0,
            }),
        }
    }
}

impl DiagnosticsAggregator {
    /// Creates an aggregator holding at most `capacity` entries
    pub fn new(capacity: usize) -> DiagServerResult<Self> {
        if capacity == 0 {
            return Err(DiagError::InvalidConfig(
                "aggregator capacity must be at least 1".into(),
            ));
        }
        let s = Self::default();
        s.write().capacity = capacity;
        Ok(s)
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores an entry, evicting the oldest one if the buffer is full
    pub fn record(&self, entry: impl Into<AggregatorEntry>) {
        self.write().push(entry.into());
    }

    /// Stores every DTC of a scan followed by the scan itself
    pub fn record_scan(&self, result: &ScanResult) {
        let dtcs = result.dtcs();
        let summary = ScanSummary::from(result);
        let mut inner = self.write();
        for d in dtcs {
            inner.push(AggregatorEntry::Dtc(d));
        }
        inner.push(AggregatorEntry::Scan(summary));
    }

    /// Number of entries held
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    /// True if no entries are held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Capacity of the buffer
    pub fn capacity(&self) -> usize {
        self.read().capacity
    }

    /// Entries evicted since creation
    pub fn evicted(&self) -> u64 {
        self.read().evicted
    }

    /// Every entry, oldest first
    pub fn entries(&self) -> Vec<AggregatorEntry> {
        self.read().entries.iter().map(|(_, e)| e.clone()).collect()
    }

    /// Copies the buffer into an immutable [Snapshot]
    pub fn export(&self) -> Snapshot {
        let inner = self.read();
        let mut snapshot = Snapshot {
            dtcs: Vec::new(),
            scans: Vec::new(),
            capacity: inner.capacity,
            evicted: inner.evicted,
        };
        for (_, e) in &inner.entries {
            match e {
                AggregatorEntry::Dtc(d) => snapshot.dtcs.push(d.into()),
                AggregatorEntry::Scan(s) => snapshot.scans.push(s.clone()),
            }
        }
        snapshot
    }

    /// The last `limit` entries of a vehicle, oldest first
    pub fn history(&self, vehicle_id: &str, limit: usize) -> Vec<AggregatorEntry> {
        let inner = self.read();
        let mut last: Vec<AggregatorEntry> = inner
            .vehicle_entries(vehicle_id)
            .rev()
            .take(limit)
            .cloned()
            .collect();
        last.reverse();
        last
    }

    /// The latest record of every DTC of a vehicle, ordered by code
    pub fn dtcs_for(&self, vehicle_id: &str) -> Vec<DtcRecord> {
        let inner = self.read();
        let mut latest: BTreeMap<DtcCode, &DtcRecord> = BTreeMap::new();
        for e in inner.vehicle_entries(vehicle_id) {
            if let AggregatorEntry::Dtc(d) = e {
                latest.insert(d.code, d);
            }
        }
        latest.into_values().cloned().collect()
    }

    /// Most recent scan of a vehicle
    pub fn latest_scan(&self, vehicle_id: &str) -> Option<ScanSummary> {
        self.read()
            .vehicle_entries(vehicle_id)
            .rev()
            .find_map(|e| match e {
                AggregatorEntry::Scan(s) => Some(s.clone()),
                AggregatorEntry::Dtc(_) => None,
            })
    }

    /// Fleet level counters
    pub fn summary(&self) -> AggregatorSummary {
        let inner = self.read();
        let with_dtcs: HashSet<&str> = inner
            .entries
            .iter()
            .filter_map(|(_, e)| match e {
                AggregatorEntry::Dtc(d) => Some(d.vehicle_id.as_str()),
                AggregatorEntry::Scan(_) => None,
            })
            .collect();
        AggregatorSummary {
            vehicles_seen: inner.by_vehicle.len(),
            vehicles_with_dtcs: with_dtcs.len(),
            entries: inner.entries.len(),
            capacity: inner.capacity,
            buffer_usage: inner.entries.len() as f64 / inner.capacity as f64 * 100.0,
            evicted: inner.evicted,
        }
    }

    /// Drops every entry. The eviction counter is kept
    pub fn clear(&self) {
        let mut inner = self.write();
        inner.entries.clear();
        inner.by_vehicle.clear();
    }
}

fn unix_ms(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn dtc(vehicle: &str, code: &str, status: u8) -> DtcRecord {
        DtcRecord::new(vehicle, code.parse().unwrap(), status, None)
    }

    #[test]
    fn evicts_oldest_first() {
        let agg = DiagnosticsAggregator::new(3).unwrap();
        for i in 0..5u8 {
            agg.record(dtc("VEH001", &format!("P010{i}"), 0x08));
        }
        assert_eq!(agg.len(), 3);
        assert_eq!(agg.evicted(), 2);
        let codes: Vec<String> = agg.export().dtcs.into_iter().map(|d| d.code).collect();
        assert_eq!(codes, ["P0102", "P0103", "P0104"]);
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(DiagnosticsAggregator::new(0).is_err());
    }

    #[test]
    fn per_vehicle_index_survives_eviction() {
        let agg = DiagnosticsAggregator::new(4).unwrap();
        agg.record(dtc("A", "P0101", 0x08));
        agg.record(dtc("B", "P0300", 0x09));
        agg.record(dtc("A", "P0101", 0x09));
        agg.record(dtc("B", "U0100", 0x08));
        agg.record(dtc("A", "C0123", 0x01));
        // First A entry evicted
        let hist = agg.history("A", 10);
        assert_eq!(hist.len(), 2);
        let AggregatorEntry::Dtc(last) = &agg.history("A", 1)[0] else {
            panic!("expected a DTC entry");
        };
        assert_eq!(last.code.to_string(), "C0123");
        assert_eq!(hist[1].vehicle_id(), "A");
        let latest = agg.dtcs_for("A");
        assert_eq!(latest.len(), 2);
        assert_eq!(latest[0].code.to_string(), "P0101");
        assert_eq!(latest[0].status, 0x09);
        assert!(agg.history("C", 10).is_empty());
    }

    #[test]
    fn scans_and_summary() {
        let agg = DiagnosticsAggregator::new(10).unwrap();
        let failed = ScanResult::failure("B", DiagError::Timeout, Duration::from_millis(5));
        agg.record_scan(&failed);
        agg.record(dtc("A", "P0101", 0x08));
        let s = agg.latest_scan("B").unwrap();
        assert_eq!(s.status, ScanStatus::Failure);
        assert_eq!(s.errors.len(), 1);
        assert!(agg.latest_scan("A").is_none());

        let sum = agg.summary();
        assert_eq!(sum.vehicles_seen, 2);
        assert_eq!(sum.vehicles_with_dtcs, 1);
        assert_eq!(sum.entries, 2);
        assert!((sum.buffer_usage - 20.0).abs() < f64::EPSILON);

        let before = sum;
        agg.clear();
        assert!(agg.is_empty());
        assert_eq!(agg.summary().vehicles_seen, 0);
        assert_eq!(before, sum);
    }
}
