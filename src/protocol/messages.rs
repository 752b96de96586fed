/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Wire structs for the SPDM request/response verbs this core implements.
//! Every message starts with a 4-byte header: `SPDMVersion`, `RequestResponse
//! Code`, `Param1`, `Param2`, little-endian throughout.

use arrayvec::ArrayVec;

use crate::error::Error;
use crate::limits::{MAX_ASYM_SIGNATURE_SIZE, MAX_DHE_EXCHANGE_SIZE, MAX_HASH_SIZE, MAX_MEASUREMENT_RECORD_SIZE, MAX_PSK_HINT_SIZE};
use crate::protocol::{MeasurementSummaryHashType, RequestResponseCode};

pub const MSG_HEADER_SIZE: usize = 4;
const MAX_OPAQUE_SIZE: usize = 128;
const MAX_SLOT_COUNT: usize = crate::limits::MAX_SLOT_COUNT;

/// Common 4-byte message header shared by every SPDM message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: u8,
    pub code: RequestResponseCode,
    pub param1: u8,
    pub param2: u8,
}

impl MessageHeader {
    pub fn new(version: u8, code: RequestResponseCode, param1: u8, param2: u8) -> Self {
        Self { version, code, param1, param2 }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.version);
        out.push(self.code as u8);
        out.push(self.param1);
        out.push(self.param2);
    }

    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8]), Error> {
        if bytes.len() < MSG_HEADER_SIZE {
            return Err(Error::InvalidParameter);
        }
        let code = RequestResponseCode::from_byte(bytes[1]).ok_or(Error::Unsupported)?;
        let header = MessageHeader { version: bytes[0], code, param1: bytes[2], param2: bytes[3] };
        Ok((header, &bytes[MSG_HEADER_SIZE..]))
    }
}

fn push_sized(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(data);
}

fn take<'a>(bytes: &'a [u8], n: usize) -> Result<(&'a [u8], &'a [u8]), Error> {
    if bytes.len() < n {
        return Err(Error::InvalidParameter);
    }
    Ok((&bytes[..n], &bytes[n..]))
}

// ---- GET_VERSION / VERSION ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetVersionRequest;

impl GetVersionRequest {
    pub fn encode(&self, out: &mut Vec<u8>) {
        MessageHeader::new(0x10, RequestResponseCode::GetVersion, 0, 0).encode(out);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionResponse {
    pub versions: ArrayVec<u8, 8>,
}

impl VersionResponse {
    pub fn encode(&self, out: &mut Vec<u8>) {
        MessageHeader::new(0x10, RequestResponseCode::Version, 0, 0).encode(out);
        out.push(0); // reserved
        out.push(self.versions.len() as u8);
        for &v in &self.versions {
            // Each version entry is a 2-byte (major/minor, alpha/build) field;
            // we only track the revision byte that scenarios key off of.
            out.push(0);
            out.push(v);
        }
    }

    pub fn decode(mut bytes: &[u8]) -> Result<Self, Error> {
        let (reserved, rest) = take(bytes, 1)?;
        let _ = reserved;
        bytes = rest;
        let (count, rest) = take(bytes, 1)?;
        let count = count[0] as usize;
        bytes = rest;
        let mut versions = ArrayVec::new();
        for _ in 0..count {
            let (entry, rest) = take(bytes, 2)?;
            versions.try_push(entry[1]).map_err(|_| Error::BufferOverflow)?;
            bytes = rest;
        }
        Ok(Self { versions })
    }
}

// ---- GET_CAPABILITIES / CAPABILITIES ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitiesMessage {
    pub ct_exponent: u8,
    pub flags: u32,
}

impl CapabilitiesMessage {
    pub fn encode(&self, out: &mut Vec<u8>, request: bool) {
        let code = if request { RequestResponseCode::GetCapabilities } else { RequestResponseCode::Capabilities };
        MessageHeader::new(0x11, code, 0, 0).encode(out);
        out.push(0);
        out.push(0);
        out.push(self.ct_exponent);
        out.push(0);
        push_sized(out, &self.flags.to_le_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let (reserved2, rest) = take(bytes, 2)?;
        let _ = reserved2;
        let (ct, rest) = take(rest, 1)?;
        let ct_exponent = ct[0];
        let (_reserved, rest) = take(rest, 1)?;
        let (flags_bytes, _rest) = take(rest, 4)?;
        let flags = u32::from_le_bytes(flags_bytes.try_into().unwrap());
        Ok(Self { ct_exponent, flags })
    }
}

// ---- NEGOTIATE_ALGORITHMS / ALGORITHMS ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmsMessage {
    pub measurement_hash_algo: u32,
    pub base_asym_algo: u32,
    pub base_hash_algo: u32,
    pub dhe_group: u16,
    pub aead_suite: u16,
    pub req_base_asym_algo: u16,
    pub key_schedule: u16,
}

impl AlgorithmsMessage {
    pub fn encode(&self, out: &mut Vec<u8>, request: bool) {
        let code = if request { RequestResponseCode::NegotiateAlgorithms } else { RequestResponseCode::Algorithms };
        MessageHeader::new(0x11, code, 0, 0).encode(out);
        push_sized(out, &self.measurement_hash_algo.to_le_bytes());
        push_sized(out, &self.base_asym_algo.to_le_bytes());
        push_sized(out, &self.base_hash_algo.to_le_bytes());
        push_sized(out, &self.dhe_group.to_le_bytes());
        push_sized(out, &self.aead_suite.to_le_bytes());
        push_sized(out, &self.req_base_asym_algo.to_le_bytes());
        push_sized(out, &self.key_schedule.to_le_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        let (mh, bytes) = take(bytes, 4)?;
        let (ba, bytes) = take(bytes, 4)?;
        let (bh, bytes) = take(bytes, 4)?;
        let (dhe, bytes) = take(bytes, 2)?;
        let (aead, bytes) = take(bytes, 2)?;
        let (rba, bytes) = take(bytes, 2)?;
        let (ks, _bytes) = take(bytes, 2)?;
        Ok(Self {
            measurement_hash_algo: u32::from_le_bytes(mh.try_into().unwrap()),
            base_asym_algo: u32::from_le_bytes(ba.try_into().unwrap()),
            base_hash_algo: u32::from_le_bytes(bh.try_into().unwrap()),
            dhe_group: u16::from_le_bytes(dhe.try_into().unwrap()),
            aead_suite: u16::from_le_bytes(aead.try_into().unwrap()),
            req_base_asym_algo: u16::from_le_bytes(rba.try_into().unwrap()),
            key_schedule: u16::from_le_bytes(ks.try_into().unwrap()),
        })
    }
}

// ---- GET_DIGESTS / DIGESTS ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetDigestsRequest;

impl GetDigestsRequest {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        MessageHeader::new(version, RequestResponseCode::GetDigests, 0, 0).encode(out);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestsResponse {
    pub slot_mask: u8,
    pub hash_size: usize,
    pub digests: ArrayVec<u8, { MAX_SLOT_COUNT * MAX_HASH_SIZE }>,
}

impl DigestsResponse {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        MessageHeader::new(version, RequestResponseCode::Digests, 0, self.slot_mask).encode(out);
        push_sized(out, &self.digests);
    }

    pub fn decode(bytes: &[u8], slot_mask: u8, hash_size: usize) -> Result<Self, Error> {
        let slots = slot_mask.count_ones() as usize;
        let (digests, _rest) = take(bytes, slots * hash_size)?;
        let mut out = ArrayVec::new();
        out.try_extend_from_slice(digests).map_err(|_| Error::BufferOverflow)?;
        Ok(Self { slot_mask, hash_size, digests: out })
    }
}

// ---- GET_CERTIFICATE / CERTIFICATE ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetCertificateRequest {
    pub slot: u8,
    pub offset: u16,
    pub length: u16,
}

impl GetCertificateRequest {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        MessageHeader::new(version, RequestResponseCode::GetCertificate, self.slot, 0).encode(out);
        push_sized(out, &self.offset.to_le_bytes());
        push_sized(out, &self.length.to_le_bytes());
    }

    pub fn decode(header: &MessageHeader, bytes: &[u8]) -> Result<Self, Error> {
        let (offset, rest) = take(bytes, 2)?;
        let (length, _rest) = take(rest, 2)?;
        Ok(Self {
            slot: header.param1,
            offset: u16::from_le_bytes(offset.try_into().unwrap()),
            length: u16::from_le_bytes(length.try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateResponse {
    pub slot: u8,
    pub portion_length: u16,
    pub remainder_length: u16,
    pub cert_chain: ArrayVec<u8, { crate::limits::MAX_CERT_CHAIN_SIZE }>,
}

impl CertificateResponse {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        MessageHeader::new(version, RequestResponseCode::Certificate, self.slot, 0).encode(out);
        push_sized(out, &self.portion_length.to_le_bytes());
        push_sized(out, &self.remainder_length.to_le_bytes());
        push_sized(out, &self.cert_chain);
    }

    pub fn decode(header: &MessageHeader, bytes: &[u8]) -> Result<Self, Error> {
        let (portion, rest) = take(bytes, 2)?;
        let (remainder, rest) = take(rest, 2)?;
        let portion_length = u16::from_le_bytes(portion.try_into().unwrap());
        let (chain, _rest) = take(rest, portion_length as usize)?;
        let mut cert_chain = ArrayVec::new();
        cert_chain.try_extend_from_slice(chain).map_err(|_| Error::BufferOverflow)?;
        Ok(Self {
            slot: header.param1,
            portion_length,
            remainder_length: u16::from_le_bytes(remainder.try_into().unwrap()),
            cert_chain,
        })
    }
}

// ---- CHALLENGE / CHALLENGE_AUTH ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChallengeRequest {
    pub slot: u8,
    pub measurement_summary_hash_type: MeasurementSummaryHashType,
    pub nonce: [u8; 32],
}

fn hash_type_to_byte(t: MeasurementSummaryHashType) -> u8 {
    match t {
        MeasurementSummaryHashType::None => 0,
        MeasurementSummaryHashType::TcbComponent => 1,
        MeasurementSummaryHashType::All => 0xFF,
    }
}

fn hash_type_from_byte(b: u8) -> Result<MeasurementSummaryHashType, Error> {
    Ok(match b {
        0 => MeasurementSummaryHashType::None,
        1 => MeasurementSummaryHashType::TcbComponent,
        0xFF => MeasurementSummaryHashType::All,
        _ => return Err(Error::InvalidParameter),
    })
}

impl ChallengeRequest {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        MessageHeader::new(version, RequestResponseCode::Challenge, self.slot, hash_type_to_byte(self.measurement_summary_hash_type)).encode(out);
        push_sized(out, &self.nonce);
    }

    pub fn decode(header: &MessageHeader, bytes: &[u8]) -> Result<Self, Error> {
        let (nonce, _rest) = take(bytes, 32)?;
        Ok(Self {
            slot: header.param1,
            measurement_summary_hash_type: hash_type_from_byte(header.param2)?,
            nonce: nonce.try_into().unwrap(),
        })
    }
}

/// `param2` bit 0 of CHALLENGE_AUTH carries `BasicMutAuthReq`. Slot `0xF` in
/// the low nibble of `param1` with `slot == 0xFF` on the request side means
/// "use provisioned peer chain".
pub const CHALLENGE_AUTH_BASIC_MUT_AUTH_REQ: u8 = 1 << 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChallengeAuthResponse {
    pub slot_in_mask: u8,
    pub basic_mut_auth_req: bool,
    pub cert_chain_hash: ArrayVec<u8, MAX_HASH_SIZE>,
    pub responder_nonce: [u8; 32],
    pub measurement_summary_hash: ArrayVec<u8, MAX_HASH_SIZE>,
    pub opaque: ArrayVec<u8, MAX_OPAQUE_SIZE>,
    pub signature: ArrayVec<u8, MAX_ASYM_SIGNATURE_SIZE>,
}

impl ChallengeAuthResponse {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        let param2 = (self.basic_mut_auth_req as u8) | (self.slot_in_mask << 4);
        MessageHeader::new(version, RequestResponseCode::ChallengeAuth, self.slot_in_mask, param2).encode(out);
        push_sized(out, &self.cert_chain_hash);
        push_sized(out, &self.responder_nonce);
        push_sized(out, &self.measurement_summary_hash);
        push_sized(out, &(self.opaque.len() as u16).to_le_bytes());
        push_sized(out, &self.opaque);
        push_sized(out, &self.signature);
    }

    /// Everything up to (but excluding) `signature`, used to verify the
    /// detached signature over `H(M1M2)`.
    pub fn signed_prefix_len(hash_size: usize) -> usize {
        MSG_HEADER_SIZE + hash_size + 32 + hash_size + 2
    }

    pub fn decode(header: &MessageHeader, bytes: &[u8], hash_size: usize, sig_size: usize) -> Result<Self, Error> {
        let (cert_hash, rest) = take(bytes, hash_size)?;
        let (nonce, rest) = take(rest, 32)?;
        let (meas_hash, rest) = take(rest, hash_size)?;
        let (opaque_len, rest) = take(rest, 2)?;
        let opaque_len = u16::from_le_bytes(opaque_len.try_into().unwrap()) as usize;
        let (opaque, rest) = take(rest, opaque_len)?;
        let (sig, _rest) = take(rest, sig_size)?;

        let mut cert_chain_hash = ArrayVec::new();
        cert_chain_hash.try_extend_from_slice(cert_hash).map_err(|_| Error::BufferOverflow)?;
        let mut measurement_summary_hash = ArrayVec::new();
        measurement_summary_hash.try_extend_from_slice(meas_hash).map_err(|_| Error::BufferOverflow)?;
        let mut opaque_out = ArrayVec::new();
        opaque_out.try_extend_from_slice(opaque).map_err(|_| Error::BufferOverflow)?;
        let mut signature = ArrayVec::new();
        signature.try_extend_from_slice(sig).map_err(|_| Error::BufferOverflow)?;

        Ok(Self {
            slot_in_mask: header.param1,
            basic_mut_auth_req: header.param2 & CHALLENGE_AUTH_BASIC_MUT_AUTH_REQ != 0,
            cert_chain_hash,
            responder_nonce: nonce.try_into().unwrap(),
            measurement_summary_hash,
            opaque: opaque_out,
            signature,
        })
    }
}

// ---- GET_MEASUREMENTS / MEASUREMENTS ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetMeasurementsRequest {
    pub signature_requested: bool,
    pub measurement_operation: u8,
    pub slot: u8,
    pub nonce: Option<[u8; 32]>,
}

impl GetMeasurementsRequest {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        let param1 = self.signature_requested as u8;
        MessageHeader::new(version, RequestResponseCode::GetMeasurements, param1, self.measurement_operation).encode(out);
        if let Some(nonce) = self.nonce {
            push_sized(out, &nonce);
            out.push(self.slot);
        }
    }

    pub fn decode(header: &MessageHeader, bytes: &[u8]) -> Result<Self, Error> {
        let signature_requested = header.param1 & 1 != 0;
        if signature_requested {
            let (nonce, rest) = take(bytes, 32)?;
            let (slot, _rest) = take(rest, 1)?;
            Ok(Self { signature_requested, measurement_operation: header.param2, slot: slot[0], nonce: Some(nonce.try_into().unwrap()) })
        } else {
            Ok(Self { signature_requested, measurement_operation: header.param2, slot: 0, nonce: None })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementsResponse {
    pub number_of_blocks: u8,
    pub measurement_record: ArrayVec<u8, MAX_MEASUREMENT_RECORD_SIZE>,
    pub responder_nonce: [u8; 32],
    pub opaque: ArrayVec<u8, MAX_OPAQUE_SIZE>,
    pub signature: ArrayVec<u8, MAX_ASYM_SIGNATURE_SIZE>,
}

impl MeasurementsResponse {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        MessageHeader::new(version, RequestResponseCode::Measurements, self.number_of_blocks, 0).encode(out);
        push_sized(out, &(self.measurement_record.len() as u32).to_le_bytes()[..3]);
        push_sized(out, &self.measurement_record);
        push_sized(out, &self.responder_nonce);
        push_sized(out, &(self.opaque.len() as u16).to_le_bytes());
        push_sized(out, &self.opaque);
        push_sized(out, &self.signature);
    }

    pub fn decode(header: &MessageHeader, bytes: &[u8], sig_size: usize) -> Result<Self, Error> {
        let (record_len, rest) = take(bytes, 3)?;
        let record_len = (record_len[0] as usize) | ((record_len[1] as usize) << 8) | ((record_len[2] as usize) << 16);
        let (record, rest) = take(rest, record_len)?;
        let (nonce, rest) = take(rest, 32)?;
        let (opaque_len, rest) = take(rest, 2)?;
        let opaque_len = u16::from_le_bytes(opaque_len.try_into().unwrap()) as usize;
        let (opaque, rest) = take(rest, opaque_len)?;
        let (sig, _rest) = take(rest, sig_size)?;

        let mut measurement_record = ArrayVec::new();
        measurement_record.try_extend_from_slice(record).map_err(|_| Error::BufferOverflow)?;
        let mut opaque_out = ArrayVec::new();
        opaque_out.try_extend_from_slice(opaque).map_err(|_| Error::BufferOverflow)?;
        let mut signature = ArrayVec::new();
        signature.try_extend_from_slice(sig).map_err(|_| Error::BufferOverflow)?;

        Ok(Self {
            number_of_blocks: header.param1,
            measurement_record,
            responder_nonce: nonce.try_into().unwrap(),
            opaque: opaque_out,
            signature,
        })
    }
}

/// DMTF is the only measurement specification this core emits blocks for.
pub const DMTF_MEASUREMENT_SPEC: u8 = 0x01;

/// Encodes one measurement block to its DMTF wire layout:
/// `Index(1) | MeasurementSpecification(1) | MeasurementSize(2 LE) |
/// DMTFSpecMeasurementValueType(1) | DMTFSpecMeasurementValueSize(2 LE) |
/// DMTFSpecMeasurementValue`.
pub fn encode_measurement_block(
    meta: &crate::protocol::MeasurementBlockMeta,
    value: &[u8],
) -> Result<ArrayVec<u8, { crate::limits::MAX_MEASUREMENT_BLOCK_SIZE }>, Error> {
    let value_size = value.len() as u16;
    let measurement_size = 3u16 + value_size;
    let mut out = ArrayVec::new();
    out.try_extend_from_slice(&[meta.index, DMTF_MEASUREMENT_SPEC]).map_err(|_| Error::BufferOverflow)?;
    out.try_extend_from_slice(&measurement_size.to_le_bytes()).map_err(|_| Error::BufferOverflow)?;
    out.try_extend_from_slice(&[meta.dmtf_value_type]).map_err(|_| Error::BufferOverflow)?;
    out.try_extend_from_slice(&value_size.to_le_bytes()).map_err(|_| Error::BufferOverflow)?;
    out.try_extend_from_slice(value).map_err(|_| Error::BufferOverflow)?;
    Ok(out)
}

// ---- KEY_EXCHANGE / KEY_EXCHANGE_RSP ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchangeRequest {
    pub session_policy: u8,
    pub slot: u8,
    pub measurement_summary_hash_type: MeasurementSummaryHashType,
    pub req_session_id_half: u16,
    pub random_nonce: [u8; 32],
    pub exchange_data: ArrayVec<u8, MAX_DHE_EXCHANGE_SIZE>,
    pub opaque: ArrayVec<u8, MAX_OPAQUE_SIZE>,
}

impl KeyExchangeRequest {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        MessageHeader::new(version, RequestResponseCode::KeyExchange, hash_type_to_byte(self.measurement_summary_hash_type), self.slot).encode(out);
        push_sized(out, &self.req_session_id_half.to_le_bytes());
        out.push(self.session_policy);
        out.push(0); // reserved
        push_sized(out, &self.random_nonce);
        push_sized(out, &self.exchange_data);
        push_sized(out, &(self.opaque.len() as u16).to_le_bytes());
        push_sized(out, &self.opaque);
    }

    pub fn decode(header: &MessageHeader, bytes: &[u8], exchange_size: usize) -> Result<Self, Error> {
        let (half, rest) = take(bytes, 2)?;
        let (policy, rest) = take(rest, 1)?;
        let (_reserved, rest) = take(rest, 1)?;
        let (nonce, rest) = take(rest, 32)?;
        let (ex, rest) = take(rest, exchange_size)?;
        let (opaque_len, rest) = take(rest, 2)?;
        let opaque_len = u16::from_le_bytes(opaque_len.try_into().unwrap()) as usize;
        let (opaque, _rest) = take(rest, opaque_len)?;

        let mut exchange_data = ArrayVec::new();
        exchange_data.try_extend_from_slice(ex).map_err(|_| Error::BufferOverflow)?;
        let mut opaque_out = ArrayVec::new();
        opaque_out.try_extend_from_slice(opaque).map_err(|_| Error::BufferOverflow)?;

        Ok(Self {
            session_policy: policy[0],
            slot: header.param2,
            measurement_summary_hash_type: hash_type_from_byte(header.param1)?,
            req_session_id_half: u16::from_le_bytes(half.try_into().unwrap()),
            random_nonce: nonce.try_into().unwrap(),
            exchange_data,
            opaque: opaque_out,
        })
    }
}

/// `MutAuthRequested` values carried in KEY_EXCHANGE_RSP's `param1` byte
/// (`SpdmDataMutAuthRequested` in the original C).
pub const MUT_AUTH_REQUESTED: u8 = 1 << 0;
pub const MUT_AUTH_REQUESTED_WITH_ENCAP_REQUEST: u8 = 1 << 1;
pub const MUT_AUTH_REQUESTED_WITH_GET_DIGESTS: u8 = 1 << 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyExchangeResponse {
    pub heartbeat_period: u8,
    pub mut_auth_requested: u8,
    pub req_slot_id: u8,
    pub rsp_session_id_half: u16,
    pub responder_nonce: [u8; 32],
    pub exchange_data: ArrayVec<u8, MAX_DHE_EXCHANGE_SIZE>,
    pub measurement_summary_hash: ArrayVec<u8, MAX_HASH_SIZE>,
    pub opaque: ArrayVec<u8, MAX_OPAQUE_SIZE>,
    pub signature: ArrayVec<u8, MAX_ASYM_SIGNATURE_SIZE>,
    pub verify_data: ArrayVec<u8, MAX_HASH_SIZE>,
}

impl KeyExchangeResponse {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        MessageHeader::new(version, RequestResponseCode::KeyExchangeRsp, self.mut_auth_requested, self.req_slot_id).encode(out);
        push_sized(out, &self.rsp_session_id_half.to_le_bytes());
        out.push(self.heartbeat_period);
        out.push(0);
        push_sized(out, &self.responder_nonce);
        push_sized(out, &self.exchange_data);
        push_sized(out, &self.measurement_summary_hash);
        push_sized(out, &(self.opaque.len() as u16).to_le_bytes());
        push_sized(out, &self.opaque);
        push_sized(out, &self.signature);
        push_sized(out, &self.verify_data);
    }

    #[allow(clippy::too_many_arguments)]
    pub fn decode(
        header: &MessageHeader,
        bytes: &[u8],
        exchange_size: usize,
        meas_hash_size: usize,
        sig_size: usize,
        hmac_size: usize,
    ) -> Result<Self, Error> {
        let (half, rest) = take(bytes, 2)?;
        let (hb, rest) = take(rest, 1)?;
        let (_reserved, rest) = take(rest, 1)?;
        let (nonce, rest) = take(rest, 32)?;
        let (ex, rest) = take(rest, exchange_size)?;
        let (mh, rest) = take(rest, meas_hash_size)?;
        let (opaque_len, rest) = take(rest, 2)?;
        let opaque_len = u16::from_le_bytes(opaque_len.try_into().unwrap()) as usize;
        let (opaque, rest) = take(rest, opaque_len)?;
        let (sig, rest) = take(rest, sig_size)?;
        let (verify, _rest) = take(rest, hmac_size)?;

        let mut exchange_data = ArrayVec::new();
        exchange_data.try_extend_from_slice(ex).map_err(|_| Error::BufferOverflow)?;
        let mut measurement_summary_hash = ArrayVec::new();
        measurement_summary_hash.try_extend_from_slice(mh).map_err(|_| Error::BufferOverflow)?;
        let mut opaque_out = ArrayVec::new();
        opaque_out.try_extend_from_slice(opaque).map_err(|_| Error::BufferOverflow)?;
        let mut signature = ArrayVec::new();
        signature.try_extend_from_slice(sig).map_err(|_| Error::BufferOverflow)?;
        let mut verify_data = ArrayVec::new();
        verify_data.try_extend_from_slice(verify).map_err(|_| Error::BufferOverflow)?;

        Ok(Self {
            heartbeat_period: hb[0],
            mut_auth_requested: header.param1,
            req_slot_id: header.param2,
            rsp_session_id_half: u16::from_le_bytes(half.try_into().unwrap()),
            responder_nonce: nonce.try_into().unwrap(),
            exchange_data,
            measurement_summary_hash,
            opaque: opaque_out,
            signature,
            verify_data,
        })
    }
}

// ---- FINISH / FINISH_RSP ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishRequest {
    pub signature_included: bool,
    pub req_slot: u8,
    pub signature: ArrayVec<u8, MAX_ASYM_SIGNATURE_SIZE>,
    pub verify_data: ArrayVec<u8, MAX_HASH_SIZE>,
}

impl FinishRequest {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        let param1 = self.signature_included as u8;
        MessageHeader::new(version, RequestResponseCode::Finish, param1, self.req_slot).encode(out);
        push_sized(out, &self.signature);
        push_sized(out, &self.verify_data);
    }

    pub fn decode(header: &MessageHeader, bytes: &[u8], sig_size: usize, hmac_size: usize) -> Result<Self, Error> {
        let signature_included = header.param1 & 1 != 0;
        let sig_len = if signature_included { sig_size } else { 0 };
        let (sig, rest) = take(bytes, sig_len)?;
        let (verify, _rest) = take(rest, hmac_size)?;

        let mut signature = ArrayVec::new();
        signature.try_extend_from_slice(sig).map_err(|_| Error::BufferOverflow)?;
        let mut verify_data = ArrayVec::new();
        verify_data.try_extend_from_slice(verify).map_err(|_| Error::BufferOverflow)?;

        Ok(Self { signature_included, req_slot: header.param2, signature, verify_data })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishResponse {
    pub verify_data: ArrayVec<u8, MAX_HASH_SIZE>,
}

impl FinishResponse {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        MessageHeader::new(version, RequestResponseCode::FinishRsp, 0, 0).encode(out);
        push_sized(out, &self.verify_data);
    }

    pub fn decode(bytes: &[u8], hmac_size: usize) -> Result<Self, Error> {
        let mut verify_data = ArrayVec::new();
        if hmac_size > 0 {
            let (verify, _rest) = take(bytes, hmac_size)?;
            verify_data.try_extend_from_slice(verify).map_err(|_| Error::BufferOverflow)?;
        }
        Ok(Self { verify_data })
    }
}

// ---- PSK_EXCHANGE / PSK_EXCHANGE_RSP ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PskExchangeRequest {
    pub measurement_summary_hash_type: MeasurementSummaryHashType,
    pub psk_hint: ArrayVec<u8, MAX_PSK_HINT_SIZE>,
    pub requester_context: [u8; 32],
    pub opaque: ArrayVec<u8, MAX_OPAQUE_SIZE>,
}

impl PskExchangeRequest {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        MessageHeader::new(version, RequestResponseCode::PskExchange, hash_type_to_byte(self.measurement_summary_hash_type), 0).encode(out);
        push_sized(out, &(self.psk_hint.len() as u16).to_le_bytes());
        push_sized(out, &32u16.to_le_bytes());
        push_sized(out, &(self.opaque.len() as u16).to_le_bytes());
        push_sized(out, &self.psk_hint);
        push_sized(out, &self.requester_context);
        push_sized(out, &self.opaque);
    }

    pub fn decode(header: &MessageHeader, bytes: &[u8]) -> Result<Self, Error> {
        let (hint_len, rest) = take(bytes, 2)?;
        let hint_len = u16::from_le_bytes(hint_len.try_into().unwrap()) as usize;
        let (ctx_len, rest) = take(rest, 2)?;
        let ctx_len = u16::from_le_bytes(ctx_len.try_into().unwrap()) as usize;
        if ctx_len != 32 {
            return Err(Error::InvalidParameter);
        }
        let (opaque_len, rest) = take(rest, 2)?;
        let opaque_len = u16::from_le_bytes(opaque_len.try_into().unwrap()) as usize;
        let (hint, rest) = take(rest, hint_len)?;
        let (ctx, rest) = take(rest, 32)?;
        let (opaque, _rest) = take(rest, opaque_len)?;

        let mut psk_hint = ArrayVec::new();
        psk_hint.try_extend_from_slice(hint).map_err(|_| Error::BufferOverflow)?;
        let mut opaque_out = ArrayVec::new();
        opaque_out.try_extend_from_slice(opaque).map_err(|_| Error::BufferOverflow)?;

        Ok(Self {
            measurement_summary_hash_type: hash_type_from_byte(header.param1)?,
            psk_hint,
            requester_context: ctx.try_into().unwrap(),
            opaque: opaque_out,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PskExchangeResponse {
    pub heartbeat_period: u8,
    pub responder_context: [u8; 32],
    pub measurement_summary_hash: ArrayVec<u8, MAX_HASH_SIZE>,
    pub opaque: ArrayVec<u8, MAX_OPAQUE_SIZE>,
    pub verify_data: ArrayVec<u8, MAX_HASH_SIZE>,
}

impl PskExchangeResponse {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        MessageHeader::new(version, RequestResponseCode::PskExchangeRsp, 0, 0).encode(out);
        push_sized(out, &32u16.to_le_bytes());
        push_sized(out, &(self.opaque.len() as u16).to_le_bytes());
        out.push(self.heartbeat_period);
        out.push(0);
        push_sized(out, &self.responder_context);
        push_sized(out, &self.measurement_summary_hash);
        push_sized(out, &self.opaque);
        push_sized(out, &self.verify_data);
    }

    pub fn decode(bytes: &[u8], meas_hash_size: usize, hmac_size: usize) -> Result<Self, Error> {
        let (ctx_len, rest) = take(bytes, 2)?;
        let ctx_len = u16::from_le_bytes(ctx_len.try_into().unwrap()) as usize;
        if ctx_len != 32 {
            return Err(Error::InvalidParameter);
        }
        let (opaque_len, rest) = take(rest, 2)?;
        let opaque_len = u16::from_le_bytes(opaque_len.try_into().unwrap()) as usize;
        let (hb, rest) = take(rest, 1)?;
        let (_reserved, rest) = take(rest, 1)?;
        let (ctx, rest) = take(rest, 32)?;
        let (mh, rest) = take(rest, meas_hash_size)?;
        let (opaque, rest) = take(rest, opaque_len)?;
        let (verify, _rest) = take(rest, hmac_size)?;

        let mut measurement_summary_hash = ArrayVec::new();
        measurement_summary_hash.try_extend_from_slice(mh).map_err(|_| Error::BufferOverflow)?;
        let mut opaque_out = ArrayVec::new();
        opaque_out.try_extend_from_slice(opaque).map_err(|_| Error::BufferOverflow)?;
        let mut verify_data = ArrayVec::new();
        verify_data.try_extend_from_slice(verify).map_err(|_| Error::BufferOverflow)?;

        Ok(Self {
            heartbeat_period: hb[0],
            responder_context: ctx.try_into().unwrap(),
            measurement_summary_hash,
            opaque: opaque_out,
            verify_data,
        })
    }
}

// ---- PSK_FINISH / PSK_FINISH_RSP ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PskFinishRequest {
    pub verify_data: ArrayVec<u8, MAX_HASH_SIZE>,
}

impl PskFinishRequest {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        MessageHeader::new(version, RequestResponseCode::PskFinish, 0, 0).encode(out);
        push_sized(out, &self.verify_data);
    }

    pub fn decode(bytes: &[u8], hmac_size: usize) -> Result<Self, Error> {
        let (verify, _rest) = take(bytes, hmac_size)?;
        let mut verify_data = ArrayVec::new();
        verify_data.try_extend_from_slice(verify).map_err(|_| Error::BufferOverflow)?;
        Ok(Self { verify_data })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PskFinishResponse;

impl PskFinishResponse {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        MessageHeader::new(version, RequestResponseCode::PskFinishRsp, 0, 0).encode(out);
    }
}

// ---- END_SESSION / END_SESSION_ACK ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndSessionRequest {
    pub preserve_negotiated_state: bool,
}

impl EndSessionRequest {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        let param1 = self.preserve_negotiated_state as u8;
        MessageHeader::new(version, RequestResponseCode::EndSession, param1, 0).encode(out);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndSessionAckResponse;

impl EndSessionAckResponse {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        MessageHeader::new(version, RequestResponseCode::EndSessionAck, 0, 0).encode(out);
    }
}

// ---- GET_ENCAPSULATED_REQUEST / ENCAPSULATED_REQUEST ----

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetEncapsulatedRequestMessage;

impl GetEncapsulatedRequestMessage {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        MessageHeader::new(version, RequestResponseCode::GetEncapsulatedRequest, 0, 0).encode(out);
    }
}

/// A tunneled inner SPDM request, carried inside an `ENCAPSULATED_REQUEST`
/// envelope. `request_id` lets the two sides match a later
/// `DELIVER_ENCAPSULATED_RESPONSE` to this leg of the nested dialogue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncapsulatedRequestMessage {
    pub request_id: u8,
    pub payload: Vec<u8>,
}

impl EncapsulatedRequestMessage {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        MessageHeader::new(version, RequestResponseCode::EncapsulatedRequest, self.request_id, 0).encode(out);
        push_sized(out, &self.payload);
    }

    pub fn decode(header: &MessageHeader, bytes: &[u8]) -> Result<Self, Error> {
        Ok(Self { request_id: header.param1, payload: bytes.to_vec() })
    }
}

// ---- DELIVER_ENCAPSULATED_RESPONSE / ENCAPSULATED_RESPONSE_ACK ----

/// No further encapsulated request follows this ACK.
pub const ACK_PAYLOAD_ABSENT: u8 = 1;
/// `payload` carries the next tunneled request.
pub const ACK_PAYLOAD_PRESENT: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliverEncapsulatedResponseMessage {
    pub request_id: u8,
    pub payload: Vec<u8>,
}

impl DeliverEncapsulatedResponseMessage {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        MessageHeader::new(version, RequestResponseCode::DeliverEncapsulatedResponse, self.request_id, 0).encode(out);
        push_sized(out, &self.payload);
    }

    pub fn decode(header: &MessageHeader, bytes: &[u8]) -> Result<Self, Error> {
        Ok(Self { request_id: header.param1, payload: bytes.to_vec() })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncapsulatedResponseAckMessage {
    pub request_id: u8,
    pub payload_type: u8,
    pub payload: Vec<u8>,
}

impl EncapsulatedResponseAckMessage {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        MessageHeader::new(version, RequestResponseCode::EncapsulatedResponseAck, self.request_id, self.payload_type).encode(out);
        push_sized(out, &self.payload);
    }

    pub fn decode(header: &MessageHeader, bytes: &[u8]) -> Result<Self, Error> {
        Ok(Self { request_id: header.param1, payload_type: header.param2, payload: bytes.to_vec() })
    }
}

// ---- ERROR ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorResponse {
    pub error_code: crate::protocol::ErrorCode,
    pub error_data: u8,
    pub extended_data: ArrayVec<u8, 32>,
}

impl ErrorResponse {
    pub fn encode(&self, version: u8, out: &mut Vec<u8>) {
        let code_byte = match self.error_code {
            crate::protocol::ErrorCode::InvalidRequest => 0x01,
            crate::protocol::ErrorCode::Busy => 0x03,
            crate::protocol::ErrorCode::UnexpectedRequest => 0x04,
            crate::protocol::ErrorCode::Unspecified => 0x05,
            crate::protocol::ErrorCode::DecryptError => 0x06,
            crate::protocol::ErrorCode::ResponseNotReady => 0x42,
            crate::protocol::ErrorCode::RequestResynch => 0x43,
            crate::protocol::ErrorCode::Other(b) => b,
        };
        MessageHeader::new(version, RequestResponseCode::Error, code_byte, self.error_data).encode(out);
        push_sized(out, &self.extended_data);
    }

    pub fn decode(header: &MessageHeader, bytes: &[u8]) -> Result<Self, Error> {
        let mut extended_data = ArrayVec::new();
        extended_data.try_extend_from_slice(bytes).map_err(|_| Error::BufferOverflow)?;
        Ok(Self {
            error_code: crate::protocol::ErrorCode::from_byte(header.param1),
            error_data: header.param2,
            extended_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_response_roundtrip() {
        let resp = VersionResponse { versions: ArrayVec::from_iter([0x10, 0x11]) };
        let mut buf = Vec::new();
        resp.encode(&mut buf);
        let (header, rest) = MessageHeader::decode(&buf).unwrap();
        assert_eq!(header.code, RequestResponseCode::Version);
        let decoded = VersionResponse::decode(rest).unwrap();
        assert_eq!(decoded, resp);
    }

    #[test]
    fn capabilities_roundtrip() {
        let msg = CapabilitiesMessage { ct_exponent: 5, flags: 0xABCD };
        let mut buf = Vec::new();
        msg.encode(&mut buf, false);
        let (header, rest) = MessageHeader::decode(&buf).unwrap();
        assert_eq!(header.code, RequestResponseCode::Capabilities);
        let decoded = CapabilitiesMessage::decode(rest).unwrap();
        assert_eq!(decoded, msg);
    }
}
