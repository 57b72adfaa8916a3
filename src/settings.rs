use crate::{
    error::H2Error,
    types::{ErrorType, SettingsParameter, MAX_FRAME_SIZE, MAX_WINDOW_SIZE, MIN_FRAME_SIZE},
};
use enum_map::{enum_map, EnumMap};
use num_traits::FromPrimitive;

/// One endpoint's view of the six recognized settings. Starts out at the
/// protocol defaults of RFC 7540 §6.5.2 and is mutated as SETTINGS frames
/// are applied in arrival order.
#[derive(Debug, Clone)]
pub struct Settings(EnumMap<SettingsParameter, u32>);

impl Settings {
    pub fn get(&self, param: SettingsParameter) -> u32 {
        self.0[param]
    }

    /// Set a parameter locally, without peer-value validation. Used for the
    /// settings this endpoint advertises.
    pub fn set(&mut self, param: SettingsParameter, value: u32) {
        self.0[param] = value;
    }

    /// Validate a single peer-sent parameter. Violations are connection
    /// errors with the code RFC 7540 §6.5.2 assigns to each parameter.
    pub fn validate(param: SettingsParameter, value: u32) -> Result<(), H2Error> {
        match param {
            SettingsParameter::EnablePush if value > 1 => Err(H2Error::connection(
                ErrorType::ProtocolError,
                format!("SETTINGS_ENABLE_PUSH must be 0 or 1, got {value}"),
            )),
            SettingsParameter::InitialWindowSize if i64::from(value) > MAX_WINDOW_SIZE => {
                Err(H2Error::connection(
                    ErrorType::FlowControlError,
                    format!("SETTINGS_INITIAL_WINDOW_SIZE {value} exceeds 2^31-1"),
                ))
            }
            SettingsParameter::MaxFrameSize
                if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE).contains(&value) =>
            {
                Err(H2Error::connection(
                    ErrorType::ProtocolError,
                    format!("SETTINGS_MAX_FRAME_SIZE {value} outside 2^14..2^24-1"),
                ))
            }
            _ => Ok(()),
        }
    }

    /// Apply peer parameters in order; the later value wins when an
    /// identifier repeats.
    pub fn apply(&mut self, params: &[(SettingsParameter, u32)]) -> Result<(), H2Error> {
        for &(param, value) in params {
            Self::validate(param, value)?;
            self.0[param] = value;
        }
        Ok(())
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self(enum_map! {
            SettingsParameter::HeaderTableSize => 4096,
            SettingsParameter::EnablePush => 1,
            SettingsParameter::MaxConcurrentStreams => u32::MAX,
            SettingsParameter::InitialWindowSize => 65_535,
            SettingsParameter::MaxFrameSize => 16_384,
            SettingsParameter::MaxHeaderListSize => u32::MAX,
        })
    }
}

/// Serialize parameters as the 6-octet entries of a SETTINGS payload. The
/// same bytes go into the `HTTP2-Settings` upgrade header.
pub fn encode_params(params: &[(SettingsParameter, u32)]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(params.len() * 6);
    for &(param, value) in params {
        payload.extend((param as u16).to_be_bytes());
        payload.extend(value.to_be_bytes());
    }
    payload
}

/// Parse a SETTINGS payload into identifier/value pairs, preserving order.
/// Unknown identifiers are dropped as the RFC requires. The caller has
/// already checked that the length is a multiple of six.
pub fn parse_params(payload: &[u8]) -> Vec<(SettingsParameter, u32)> {
    let mut params = Vec::with_capacity(payload.len() / 6);
    for chunk in payload.chunks_exact(6) {
        // unwrap: chunks_exact guarantees the slice lengths
        let id = u16::from_be_bytes(chunk[0..2].try_into().unwrap());
        let value = u32::from_be_bytes(chunk[2..6].try_into().unwrap());
        if let Some(param) = SettingsParameter::from_u16(id) {
            params.push((param, value));
        }
    }
    params
}
