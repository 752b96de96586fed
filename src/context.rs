/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The endpoint context and its get/set data API, grounded
//! on the tagged-union dispatch of `SpdmSetData`/`SpdmGetData` in
//! `SpdmCommonLibContextData.c`: one routing function keyed on a
//! `(DataType, Location)` pair rather than a field per setting.

use arrayvec::ArrayVec;

use crate::error::Error;
use crate::limits::{
    MAX_CERT_CHAIN_SIZE, MAX_MEASUREMENT_BLOCK_COUNT, MAX_MEASUREMENT_BLOCK_SIZE, MAX_MEASUREMENT_RECORD_SIZE,
    MAX_PSK_HINT_SIZE, MAX_SLOT_COUNT, SLOT_ID_PROVISIONED_CHAIN,
};
use crate::protocol::{CapabilityFlags, ConnectionState, MeasurementBlockMeta, NegotiatedAlgorithms, ResponseState};
use crate::session::SessionRegistry;
use crate::transcript::TranscriptManager;

/// Which half of the context a data tag routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    Local,
    Connection,
    Session(u32),
}

/// A self-provisioned certificate chain slot.
#[derive(Clone)]
pub struct CertificateChainSlot {
    pub chain: ArrayVec<u8, MAX_CERT_CHAIN_SIZE>,
}

/// One locally-provisioned measurement block, pre-encoded to its DMTF wire
/// layout so GET_MEASUREMENTS only needs to concatenate or hash.
#[derive(Clone)]
pub struct MeasurementBlock {
    pub meta: MeasurementBlockMeta,
    pub encoded: ArrayVec<u8, MAX_MEASUREMENT_BLOCK_SIZE>,
}

/// Self-provisioned data the host sets up before the connection starts.
#[derive(Default)]
pub struct LocalContext {
    pub capability_flags: CapabilityFlags,
    pub ct_exponent: u8,
    pub supported_versions: ArrayVec<u8, 8>,
    pub cert_chains: [Option<CertificateChainSlot>; MAX_SLOT_COUNT],
    pub peer_root_cert_hash: Option<ArrayVec<u8, 64>>,
    pub peer_full_cert_chain: Option<ArrayVec<u8, MAX_CERT_CHAIN_SIZE>>,
    pub psk_hint: ArrayVec<u8, MAX_PSK_HINT_SIZE>,
    pub psk_value: ArrayVec<u8, 64>,
    pub opaque_challenge_auth: ArrayVec<u8, 128>,
    pub opaque_measurement: ArrayVec<u8, 128>,
    pub basic_mut_auth_required: bool,
    pub mut_auth_via_encap_required: bool,
    pub measurement_blocks: ArrayVec<MeasurementBlock, MAX_MEASUREMENT_BLOCK_COUNT>,
}

/// Parameters negotiated with the current peer.
#[derive(Default)]
pub struct ConnectionInfo {
    pub state: ConnectionStateCell,
    pub peer_versions: ArrayVec<u8, 8>,
    pub capability_flags: CapabilityFlags,
    pub algorithm: Option<NegotiatedAlgorithms>,
    pub peer_cert_chain: ArrayVec<u8, MAX_CERT_CHAIN_SIZE>,
    pub local_used_cert_slot: Option<u8>,
}

/// Wraps `ConnectionState` so the monotonic-advance invariant is enforced at
/// the one place that mutates it, rather than by convention at every call
/// site.
pub struct ConnectionStateCell(ConnectionState);

impl Default for ConnectionStateCell {
    fn default() -> Self {
        Self(ConnectionState::NotStarted)
    }
}

impl ConnectionStateCell {
    pub fn get(&self) -> ConnectionState {
        self.0
    }

    /// Advance to `next`. Fails with `InvalidParameter` if `next` would
    /// regress the state; use [`Self::reset`] for a full endpoint reset.
    pub fn advance(&mut self, next: ConnectionState) -> Result<(), Error> {
        if next < self.0 {
            return Err(Error::InvalidParameter);
        }
        self.0 = next;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.0 = ConnectionState::NotStarted;
    }
}

/// State for an in-progress encapsulated sub-dialogue.
#[derive(Default)]
pub struct EncapContext {
    pub in_progress: bool,
    pub step: EncapStep,
    pub current_request_id: u8,
    pub target_slot: u8,
    pub cert_chain_buffer: ArrayVec<u8, MAX_CERT_CHAIN_SIZE>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncapStep {
    #[default]
    NeedDigests,
    NeedCertificate,
    NeedChallenge,
    Done,
}

/// The most recent request's cached bytes and session routing, used by
/// RESPOND_IF_READY and to route a retried plaintext-vs-secured response
/// correctly.
#[derive(Default)]
pub struct LastRequest {
    pub bytes: ArrayVec<u8, MAX_MEASUREMENT_RECORD_SIZE>,
    pub session_id: Option<u32>,
}

/// A long-lived object per device link.
pub struct EndpointContext {
    pub version: u8,
    pub local: LocalContext,
    pub connection: ConnectionInfo,
    pub transcript: TranscriptManager,
    pub sessions: SessionRegistry,
    pub latest_session_id: u32,
    pub response_state: ResponseState,
    pub encap_context: EncapContext,
    pub last_request: LastRequest,
    pub retry_times: u8,
    pub current_token: u8,
    pub error_state: Option<Error>,
}

impl EndpointContext {
    pub fn new(version: u8) -> Self {
        Self {
            version,
            local: LocalContext::default(),
            connection: ConnectionInfo::default(),
            transcript: TranscriptManager::new(),
            sessions: SessionRegistry::new(),
            latest_session_id: 0,
            response_state: ResponseState::Normal,
            encap_context: EncapContext::default(),
            last_request: LastRequest::default(),
            retry_times: crate::limits::DEFAULT_RETRY_TIMES,
            current_token: 0,
            error_state: None,
        }
    }

    /// Full endpoint reset: the only path allowed to regress `connection.state`.
    pub fn reset_connection(&mut self) {
        self.connection = ConnectionInfo::default();
        self.transcript = TranscriptManager::new();
        self.encap_context = EncapContext::default();
    }
}

/// Tagged data values exchanged through [`EndpointContext::set_data`] /
/// [`EndpointContext::get_data`].
#[derive(Clone)]
pub enum DataValue {
    CapabilityFlags(CapabilityFlags),
    CtExponent(u8),
    SupportedVersions(ArrayVec<u8, 8>),
    CertificateChain(u8, ArrayVec<u8, MAX_CERT_CHAIN_SIZE>),
    PeerRootCertHash(ArrayVec<u8, 64>),
    PeerFullCertChain(ArrayVec<u8, MAX_CERT_CHAIN_SIZE>),
    PskHint(ArrayVec<u8, MAX_PSK_HINT_SIZE>),
    PskValue(ArrayVec<u8, 64>),
    OpaqueChallengeAuth(ArrayVec<u8, 128>),
    OpaqueMeasurement(ArrayVec<u8, 128>),
    BasicMutAuthRequired(bool),
    MutAuthViaEncapRequired(bool),
    MeasurementBlock(MeasurementBlockMeta, ArrayVec<u8, MAX_MEASUREMENT_BLOCK_SIZE>),
}

/// Tags accepted by [`EndpointContext::get_data`], mirroring the
/// `DataType`/`Location` pair `SpdmGetData` dispatches on. A few tags
/// (`CertificateChain`) carry a selector the way `Parameter` does in the
/// original rather than needing a second out-of-band argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    CapabilityFlags,
    CtExponent,
    SupportedVersions,
    CertificateChain(u8),
    PeerRootCertHash,
    PeerFullCertChain,
    PskHint,
    PskValue,
    OpaqueChallengeAuth,
    OpaqueMeasurement,
    BasicMutAuthRequired,
    MutAuthViaEncapRequired,
}

/// Copies `src` into `dst`, returning `src.len()` regardless of whether it
/// fit. Matches `SpdmGetData` always writing the true required size back
/// through its `DataSize` out-parameter even when the caller's buffer was
/// too small to hold it.
fn copy_truncated(src: &[u8], dst: &mut [u8]) -> usize {
    let n = src.len().min(dst.len());
    dst[..n].copy_from_slice(&src[..n]);
    src.len()
}

impl EndpointContext {
    /// Route `value` into `local` (the only writable location for every tag
    /// this endpoint exposes; `connection.algorithm` is populated solely by
    /// the protocol engine during NEGOTIATE_ALGORITHMS, never by `set_data`).
    pub fn set_data(&mut self, location: Location, value: DataValue) -> Result<(), Error> {
        if location != Location::Local {
            return Err(Error::InvalidParameter);
        }
        if self.connection.state.get() >= ConnectionState::AfterNegotiateAlgorithms
            && matches!(&value, DataValue::CapabilityFlags(_) | DataValue::SupportedVersions(_))
        {
            return Err(Error::AccessDenied);
        }
        match value {
            DataValue::CapabilityFlags(f) => self.local.capability_flags = f,
            DataValue::CtExponent(e) => self.local.ct_exponent = e,
            DataValue::SupportedVersions(v) => self.local.supported_versions = v,
            DataValue::CertificateChain(slot, chain) => {
                let idx = slot as usize;
                if idx >= MAX_SLOT_COUNT {
                    return Err(Error::InvalidParameter);
                }
                self.local.cert_chains[idx] = Some(CertificateChainSlot { chain });
            }
            DataValue::PeerRootCertHash(h) => self.local.peer_root_cert_hash = Some(h),
            DataValue::PeerFullCertChain(c) => self.local.peer_full_cert_chain = Some(c),
            DataValue::PskHint(h) => self.local.psk_hint = h,
            DataValue::PskValue(v) => self.local.psk_value = v,
            DataValue::OpaqueChallengeAuth(o) => self.local.opaque_challenge_auth = o,
            DataValue::OpaqueMeasurement(o) => self.local.opaque_measurement = o,
            DataValue::BasicMutAuthRequired(b) => self.local.basic_mut_auth_required = b,
            DataValue::MutAuthViaEncapRequired(b) => self.local.mut_auth_via_encap_required = b,
            DataValue::MeasurementBlock(meta, value) => {
                let encoded = crate::protocol::messages::encode_measurement_block(&meta, &value)?;
                if let Some(existing) = self.local.measurement_blocks.iter_mut().find(|b| b.meta.index == meta.index) {
                    existing.meta = meta;
                    existing.encoded = encoded;
                } else {
                    self.local
                        .measurement_blocks
                        .try_push(MeasurementBlock { meta, encoded })
                        .map_err(|_| Error::BufferOverflow)?;
                }
            }
        }
        Ok(())
    }

    /// Read a previously `set_data`'d value back out of `location`. Always
    /// returns the value's true length, even when `buf` is smaller than it:
    /// only `buf.len()` bytes are copied, but the caller can tell it was
    /// truncated by comparing the returned size against `buf.len()` and
    /// retry with a bigger buffer, the same contract `SpdmGetData` gives its
    /// `DataSize` out-parameter on `RETURN_BUFFER_TOO_SMALL`.
    pub fn get_data(&self, data_type: DataType, location: Location, buf: &mut [u8]) -> Result<usize, Error> {
        if location != Location::Local {
            return Err(Error::InvalidParameter);
        }
        match data_type {
            DataType::CapabilityFlags => Ok(copy_truncated(&self.local.capability_flags.0.to_le_bytes(), buf)),
            DataType::CtExponent => Ok(copy_truncated(&[self.local.ct_exponent], buf)),
            DataType::SupportedVersions => Ok(copy_truncated(&self.local.supported_versions, buf)),
            DataType::CertificateChain(slot) => {
                let idx = slot as usize;
                if idx >= MAX_SLOT_COUNT {
                    return Err(Error::InvalidParameter);
                }
                let chain = self.local.cert_chains[idx].as_ref().ok_or(Error::Unsupported)?;
                Ok(copy_truncated(&chain.chain, buf))
            }
            DataType::PeerRootCertHash => {
                let hash = self.local.peer_root_cert_hash.as_ref().ok_or(Error::Unsupported)?;
                Ok(copy_truncated(hash, buf))
            }
            DataType::PeerFullCertChain => {
                let chain = self.local.peer_full_cert_chain.as_ref().ok_or(Error::Unsupported)?;
                Ok(copy_truncated(chain, buf))
            }
            DataType::PskHint => Ok(copy_truncated(&self.local.psk_hint, buf)),
            DataType::PskValue => Ok(copy_truncated(&self.local.psk_value, buf)),
            DataType::OpaqueChallengeAuth => Ok(copy_truncated(&self.local.opaque_challenge_auth, buf)),
            DataType::OpaqueMeasurement => Ok(copy_truncated(&self.local.opaque_measurement, buf)),
            DataType::BasicMutAuthRequired => Ok(copy_truncated(&[self.local.basic_mut_auth_required as u8], buf)),
            DataType::MutAuthViaEncapRequired => Ok(copy_truncated(&[self.local.mut_auth_via_encap_required as u8], buf)),
        }
    }

    /// Fetch a certificate chain slot, resolving the `0xFF` "use the
    /// provisioned peer chain" sentinel.
    pub fn get_certificate_chain(&self, slot: u8) -> Result<&[u8], Error> {
        if slot == SLOT_ID_PROVISIONED_CHAIN {
            return self.local.peer_full_cert_chain.as_deref().ok_or(Error::Unsupported);
        }
        let idx = slot as usize;
        if idx >= MAX_SLOT_COUNT {
            return Err(Error::InvalidParameter);
        }
        self.local.cert_chains[idx].as_ref().map(|c| c.chain.as_slice()).ok_or(Error::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_state_cannot_regress_without_reset() {
        let mut ctx = EndpointContext::new(0x11);
        ctx.connection.state.advance(ConnectionState::AfterVersion).unwrap();
        ctx.connection.state.advance(ConnectionState::AfterCapabilities).unwrap();
        assert_eq!(ctx.connection.state.advance(ConnectionState::AfterVersion), Err(Error::InvalidParameter));
        ctx.connection.state.reset();
        assert_eq!(ctx.connection.state.get(), ConnectionState::NotStarted);
    }

    #[test]
    fn set_data_rejects_non_local_location() {
        let mut ctx = EndpointContext::new(0x11);
        let err = ctx.set_data(Location::Connection, DataValue::CtExponent(1)).unwrap_err();
        assert_eq!(err, Error::InvalidParameter);
    }

    #[test]
    fn capability_write_denied_after_negotiation() {
        let mut ctx = EndpointContext::new(0x11);
        ctx.connection.state.advance(ConnectionState::AfterNegotiateAlgorithms).unwrap();
        let err = ctx.set_data(Location::Local, DataValue::CapabilityFlags(CapabilityFlags(0))).unwrap_err();
        assert_eq!(err, Error::AccessDenied);
    }

    #[test]
    fn get_data_round_trips_psk_hint() {
        let mut ctx = EndpointContext::new(0x11);
        let mut hint = ArrayVec::new();
        hint.try_extend_from_slice(b"my-hint").unwrap();
        ctx.set_data(Location::Local, DataValue::PskHint(hint)).unwrap();

        let mut buf = [0u8; 32];
        let size = ctx.get_data(DataType::PskHint, Location::Local, &mut buf).unwrap();
        assert_eq!(size, 7);
        assert_eq!(&buf[..size], b"my-hint");
    }

    #[test]
    fn get_data_reports_true_size_on_undersized_buffer() {
        let mut ctx = EndpointContext::new(0x11);
        let mut hint = ArrayVec::new();
        hint.try_extend_from_slice(b"my-hint").unwrap();
        ctx.set_data(Location::Local, DataValue::PskHint(hint)).unwrap();

        let mut buf = [0u8; 3];
        let size = ctx.get_data(DataType::PskHint, Location::Local, &mut buf).unwrap();
        assert_eq!(size, 7);
        assert_eq!(&buf, b"my-");
    }

    #[test]
    fn get_data_rejects_non_local_location() {
        let ctx = EndpointContext::new(0x11);
        let mut buf = [0u8; 8];
        let err = ctx.get_data(DataType::CtExponent, Location::Connection, &mut buf).unwrap_err();
        assert_eq!(err, Error::InvalidParameter);
    }

    #[test]
    fn set_data_measurement_block_replaces_by_index() {
        let mut ctx = EndpointContext::new(0x11);
        let meta = MeasurementBlockMeta { index: 1, dmtf_value_type: 0, is_immutable_rom: true };
        let mut value = ArrayVec::new();
        value.try_extend_from_slice(&[1, 2, 3]).unwrap();
        ctx.set_data(Location::Local, DataValue::MeasurementBlock(meta, value)).unwrap();

        let mut value2 = ArrayVec::new();
        value2.try_extend_from_slice(&[4, 5]).unwrap();
        ctx.set_data(Location::Local, DataValue::MeasurementBlock(meta, value2)).unwrap();

        assert_eq!(ctx.local.measurement_blocks.len(), 1);
        assert_eq!(ctx.local.measurement_blocks[0].encoded.len(), 7 + 2);
    }
}
