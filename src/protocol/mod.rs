/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Wire-level vocabulary: request/response codes, versions, negotiated
//! algorithm identifiers, capability flags, and the connection/response
//! state machines. Byte layouts follow DMTF SPDM 1.0/1.1: little-endian
//! throughout, with a fixed two-byte `RequestResponseCode`/`Param1`/`Param2`
//! header on every message.

mod algorithms;
mod capabilities;
pub mod messages;
pub mod opaque;

pub use algorithms::*;
pub use capabilities::CapabilityFlags;

/// SPDM request/response codes (the `RequestResponseCode` byte of every
/// message header). Request codes have the high bit clear is not a rule of
/// the wire format; we just enumerate the verbs this core implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestResponseCode {
    GetVersion = 0x84,
    Version = 0x04,
    GetCapabilities = 0xE1,
    Capabilities = 0x61,
    NegotiateAlgorithms = 0xE3,
    Algorithms = 0x63,
    GetDigests = 0x81,
    Digests = 0x01,
    GetCertificate = 0x82,
    Certificate = 0x02,
    Challenge = 0x83,
    ChallengeAuth = 0x03,
    GetMeasurements = 0xE0,
    Measurements = 0x60,
    KeyExchange = 0xE4,
    KeyExchangeRsp = 0x64,
    Finish = 0xE5,
    FinishRsp = 0x65,
    PskExchange = 0xE6,
    PskExchangeRsp = 0x66,
    PskFinish = 0xE7,
    PskFinishRsp = 0x67,
    EndSession = 0xEC,
    EndSessionAck = 0x6C,
    GetEncapsulatedRequest = 0xE9,
    EncapsulatedRequest = 0xEA,
    DeliverEncapsulatedResponse = 0xEB,
    EncapsulatedResponseAck = 0x6A,
    RespondIfReady = 0xE8,
    Error = 0x7F,
    VendorDefinedRequest = 0xFE,
    VendorDefinedResponse = 0x7E,
}

impl RequestResponseCode {
    pub fn from_byte(b: u8) -> Option<Self> {
        use RequestResponseCode::*;
        Some(match b {
            0x84 => GetVersion,
            0x04 => Version,
            0xE1 => GetCapabilities,
            0x61 => Capabilities,
            0xE3 => NegotiateAlgorithms,
            0x63 => Algorithms,
            0x81 => GetDigests,
            0x01 => Digests,
            0x82 => GetCertificate,
            0x02 => Certificate,
            0x83 => Challenge,
            0x03 => ChallengeAuth,
            0xE0 => GetMeasurements,
            0x60 => Measurements,
            0xE4 => KeyExchange,
            0x64 => KeyExchangeRsp,
            0xE5 => Finish,
            0x65 => FinishRsp,
            0xE6 => PskExchange,
            0x66 => PskExchangeRsp,
            0xE7 => PskFinish,
            0x67 => PskFinishRsp,
            0xEC => EndSession,
            0x6C => EndSessionAck,
            0xE9 => GetEncapsulatedRequest,
            0xEA => EncapsulatedRequest,
            0xEB => DeliverEncapsulatedResponse,
            0x6A => EncapsulatedResponseAck,
            0xE8 => RespondIfReady,
            0x7F => Error,
            0xFE => VendorDefinedRequest,
            0x7E => VendorDefinedResponse,
            _ => return None,
        })
    }
}

/// SPDM ERROR response codes this core must react to specially (Busy,
/// ResponseNotReady); all other codes surface to the caller as `DeviceError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidRequest = 0x01,
    Busy = 0x03,
    UnexpectedRequest = 0x04,
    Unspecified = 0x05,
    DecryptError = 0x06,
    ResponseNotReady = 0x42,
    RequestResynch = 0x43,
    Other(u8),
}

impl ErrorCode {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => ErrorCode::InvalidRequest,
            0x03 => ErrorCode::Busy,
            0x04 => ErrorCode::UnexpectedRequest,
            0x05 => ErrorCode::Unspecified,
            0x06 => ErrorCode::DecryptError,
            0x42 => ErrorCode::ResponseNotReady,
            0x43 => ErrorCode::RequestResynch,
            other => ErrorCode::Other(other),
        }
    }
}

/// Connection state monotonically advances through this sequence; only a
/// full endpoint reset may regress it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    NotStarted,
    AfterVersion,
    AfterCapabilities,
    AfterNegotiateAlgorithms,
    AfterDigests,
    AfterCertificate,
    Authenticated,
}

/// Responder-side throttling state, tracked alongside the connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    Normal,
    Busy,
    NotReady,
    NeedResync,
}

/// What kind of measurement summary hash, if any, a CHALLENGE or
/// GET_MEASUREMENTS exchange should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementSummaryHashType {
    None,
    TcbComponent,
    All,
}

/// A single self-describing measurement block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeasurementBlockMeta {
    pub index: u8,
    pub dmtf_value_type: u8,
    pub is_immutable_rom: bool,
}

/// Secured-message session type, derived from negotiated MAC/ENCRYPT capability
/// flags (`SpdmSessionInfoInit` in the original C).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    None,
    MacOnly,
    EncryptMac,
}

pub const HEADER_SIZE: usize = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_response_code_roundtrip() {
        for &b in &[0x84u8, 0x04, 0xE4, 0x64, 0xE6, 0x66, 0x7F] {
            let code = RequestResponseCode::from_byte(b).unwrap();
            assert_eq!(code as u8, b);
        }
    }

    #[test]
    fn connection_state_is_ordered() {
        assert!(ConnectionState::NotStarted < ConnectionState::AfterVersion);
        assert!(ConnectionState::AfterCertificate < ConnectionState::Authenticated);
    }
}
