//! Provides methods to read data identifiers (DIDs) from the ECU

use std::collections::BTreeMap;

use automotive_diag::uds::UdsCommand;

use super::{NRC_REQUEST_OUT_OF_RANGE, UdsSessionEngine};
use crate::{DiagError, DiagServerResult, ProtocolError};

/// Vehicle identification number
pub const DID_VIN: u16 = 0xF190;

/// Result of a ReadDataByIdentifier request.
///
/// Identifiers the ECU answered end up in `values`, the rest in `errors`
#[derive(Debug, Clone, Default)]
pub struct DataReadout {
    /// Raw data per identifier
    pub values: BTreeMap<u16, Vec<u8>>,
    /// Why an identifier could not be read
    pub errors: BTreeMap<u16, DiagError>,
}

impl DataReadout {
    /// True if every requested identifier was read
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Splits a ReadDataByIdentifier response body into `(identifier, value)` records.
///
/// Each record is laid out as `id hi, id lo, length, value[length]`
pub fn parse_did_records(data: &[u8]) -> Result<Vec<(u16, Vec<u8>)>, ProtocolError> {
    let invalid = || ProtocolError::InvalidResponseLength {
        sid: UdsCommand::ReadDataByIdentifier.into(),
        len: data.len(),
    };
    let mut records = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let [hi, lo, len, tail @ ..] = rest else {
            return Err(invalid());
        };
        let len = *len as usize;
        if tail.len() < len {
            return Err(invalid());
        }
        records.push((u16::from_be_bytes([*hi, *lo]), tail[..len].to_vec()));
        rest = &tail[len..];
    }
    Ok(records)
}

impl UdsSessionEngine {
    /// Reads one or more data identifiers.
    ///
    /// If the ECU rejects a batched request as out of range, every identifier is asked for
    /// on its own so one unsupported identifier does not hide the others. Negative responses
    /// for single identifiers are reported in [DataReadout::errors]; transport failures
    /// fail the whole call
    pub fn read_data_by_identifier(&mut self, ids: &[u16]) -> DiagServerResult<DataReadout> {
        if ids.is_empty() {
            return Err(DiagError::ParameterInvalid(
                "no data identifiers requested".into(),
            ));
        }
        let args: Vec<u8> = ids.iter().flat_map(|id| id.to_be_bytes()).collect();
        let mut readout = DataReadout::default();
        match self.send_command_with_response(UdsCommand::ReadDataByIdentifier, &args) {
            Ok(data) => self.collect_records(ids, &data, &mut readout)?,
            Err(e) if ids.len() > 1 && e.nrc() == Some(NRC_REQUEST_OUT_OF_RANGE) => {
                log::debug!("Batched DID read rejected, reading identifiers one at a time");
                for id in ids {
                    match self
                        .send_command_with_response(UdsCommand::ReadDataByIdentifier, &id.to_be_bytes())
                    {
                        Ok(data) => self.collect_records(&[*id], &data, &mut readout)?,
                        Err(e) if e.nrc().is_some() => {
                            readout.errors.insert(*id, e);
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            Err(e) if e.nrc().is_some() && ids.len() == 1 => {
                readout.errors.insert(ids[0], e);
            }
            Err(e) => return Err(e),
        }
        Ok(readout)
    }

    /// Reads the vehicle identification number (DID 0xF190)
    pub fn read_vin(&mut self) -> DiagServerResult<String> {
        let mut readout = self.read_data_by_identifier(&[DID_VIN])?;
        if let Some(e) = readout.errors.remove(&DID_VIN) {
            return Err(e);
        }
        let raw = readout
            .values
            .remove(&DID_VIN)
            .ok_or(ProtocolError::MissingIdentifier(DID_VIN))?;
        let vin = raw
            .iter()
            .copied()
            .take_while(|b| *b != 0x00 && *b != 0xFF)
            .collect::<Vec<u8>>();
        if !vin.iter().all(|b| b.is_ascii_graphic()) {
            return Err(ProtocolError::InvalidText("VIN").into());
        }
        Ok(String::from_utf8_lossy(&vin).trim().to_string())
    }

    fn collect_records(
        &self,
        ids: &[u16],
        data: &[u8],
        readout: &mut DataReadout,
    ) -> DiagServerResult<()> {
        for (id, value) in parse_did_records(data)? {
            if ids.contains(&id) {
                readout.values.insert(id, value);
            } else {
                log::warn!("ECU returned unrequested identifier 0x{id:04X}, ignoring");
            }
        }
        for id in ids {
            if !readout.values.contains_key(id) {
                readout
                    .errors
                    .insert(*id, ProtocolError::MissingIdentifier(*id).into());
            }
        }
        Ok(())
    }
}
