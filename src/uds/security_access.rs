//! Provides methods for security seed/key access to the ECU in order to unlock functions which
//! are considered secure.
//!
//! The key algorithm is vehicle specific, so it is supplied by the caller as a [KeyFunction]

use automotive_diag::uds::UdsCommand;

use super::UdsSessionEngine;
use crate::{DiagError, DiagServerResult, ProtocolError};

/// Computes the key for a seed. Called with the requested security level and the seed
pub type KeyFunction = dyn Fn(u8, &[u8]) -> Vec<u8> + Send + Sync;

impl UdsSessionEngine {
    /// Requests a seed from the ECU for security access.
    ///
    /// ## Parameters
    /// * level - Odd security level (0x01, 0x03, ...)
    ///
    /// ## Returns
    /// Returns the security key's seed
    pub fn request_seed(&mut self, level: u8) -> DiagServerResult<Vec<u8>> {
        check_level(level)?;
        let mut resp = self.send_command_with_response(UdsCommand::SecurityAccess, &[level])?;
        match resp.first() {
            Some(echo) if *echo == level => {}
            Some(echo) => {
                return Err(ProtocolError::MismatchedEcho {
                    want: level,
                    received: *echo,
                }
                .into());
            }
            None => {
                return Err(ProtocolError::InvalidResponseLength {
                    sid: UdsCommand::SecurityAccess.into(),
                    len: 0,
                }
                .into());
            }
        }
        resp.drain(0..1); // Remove the level echo, so just seed value left
        Ok(resp)
    }

    /// Sends the computed key for `level` to the ECU
    pub fn send_key(&mut self, level: u8, key: &[u8]) -> DiagServerResult<()> {
        check_level(level)?;
        let mut payload = Vec::with_capacity(key.len() + 1);
        payload.push(level + 1);
        payload.extend_from_slice(key);
        self.send_command_with_response(UdsCommand::SecurityAccess, &payload)?;
        self.security_level = Some(level);
        Ok(())
    }

    /// Runs the complete seed/key exchange for `level`.
    ///
    /// Returns false if the ECU reported the level as already unlocked (all zero seed)
    pub fn security_access(&mut self, level: u8, key_fn: &KeyFunction) -> DiagServerResult<bool> {
        let seed = self.request_seed(level)?;
        if seed.iter().all(|b| *b == 0) {
            log::debug!("Security level 0x{level:02X} already unlocked");
            self.security_level = Some(level);
            return Ok(false);
        }
        let key = key_fn(level, &seed);
        self.send_key(level, &key)?;
        log::info!(
            "Security level 0x{level:02X} unlocked on '{}'",
            self.vehicle_id()
        );
        Ok(true)
    }
}

fn check_level(level: u8) -> DiagServerResult<()> {
    if level % 2 == 1 && level < 0x7F {
        Ok(())
    } else {
        Err(DiagError::ParameterInvalid(format!(
            "0x{level:02X} is not a seed request level"
        )))
    }
}
