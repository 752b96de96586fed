/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Responder-side verb handling: one dispatch entry point
//! ([`Responder::process_request`]) that decodes a request, routes it to a
//! per-verb handler, and always produces response bytes — internal failures
//! become an `ERROR` response rather than propagating to the caller, mirroring
//! the "never leave the wire silent" posture of `Context::receive` in
//! `zssp.rs`.

use arrayvec::ArrayVec;

use crate::context::EndpointContext;
use crate::crypto::CryptoProvider;
use crate::error::Error;
use crate::event::{log, Event, EventSink};
use crate::protocol::messages::*;
use crate::protocol::{ConnectionState, ErrorCode, MeasurementSummaryHashType, RequestResponseCode, ResponseState};
use crate::session::{secured_messages, SessionState};
use crate::transcript::Ledger;

/// A verb handled over a secured session rather than in the clear.
/// `process_request` hands these bytes straight through unless the host
/// wants measurement re-collection or a custom app handler — neither is
/// modeled here; the host owns that logic and calls [`Self::decode_secured`]/
/// [`Self::encode_secured`] directly.
pub struct Responder<'a> {
    pub ctx: &'a mut EndpointContext,
    pub crypto: &'a mut dyn CryptoProvider,
    pub sink: &'a mut dyn EventSink,
    pub secured_message_callbacks: &'a dyn secured_messages::SecuredMessageCallbacks,
}

impl<'a> Responder<'a> {
    /// Dispatch one plaintext SPDM request, returning the encoded response.
    /// Never returns `Err`: protocol failures are folded into an `ERROR`
    /// response so the wire always gets a reply.
    pub fn process_request(&mut self, request: &[u8]) -> Vec<u8> {
        match self.dispatch(request) {
            Ok(resp) => resp,
            Err(e) => {
                log!(self.sink, Event::Fault(e));
                self.error_response(error_code_for(e), 0)
            }
        }
    }

    fn dispatch(&mut self, request: &[u8]) -> Result<Vec<u8>, Error> {
        match self.ctx.response_state {
            ResponseState::Normal => {}
            ResponseState::Busy => return Ok(self.error_response(ErrorCode::Busy, 0)),
            ResponseState::NotReady => return Ok(self.error_response(ErrorCode::ResponseNotReady, self.ctx.current_token)),
            ResponseState::NeedResync => return Ok(self.error_response(ErrorCode::RequestResynch, 0)),
        }

        let (header, rest) = MessageHeader::decode(request)?;
        self.ctx.last_request.bytes.clear();
        let _ = self.ctx.last_request.bytes.try_extend_from_slice(request);

        match header.code {
            RequestResponseCode::GetVersion => self.handle_get_version(request),
            RequestResponseCode::GetCapabilities => self.handle_get_capabilities(&header, rest, request),
            RequestResponseCode::NegotiateAlgorithms => self.handle_negotiate_algorithms(rest, request),
            RequestResponseCode::GetDigests => self.handle_get_digests(request),
            RequestResponseCode::GetCertificate => self.handle_get_certificate(&header, rest, request),
            RequestResponseCode::Challenge => self.handle_challenge(&header, rest, request),
            RequestResponseCode::GetMeasurements => self.handle_get_measurements(&header, rest, request),
            RequestResponseCode::KeyExchange => self.handle_key_exchange(&header, rest, request),
            RequestResponseCode::Finish => self.handle_finish(&header, rest, request),
            RequestResponseCode::PskExchange => self.handle_psk_exchange(&header, rest, request),
            RequestResponseCode::PskFinish => self.handle_psk_finish(rest, request),
            RequestResponseCode::EndSession => self.handle_end_session(&header),
            RequestResponseCode::RespondIfReady => self.handle_respond_if_ready(&header),
            RequestResponseCode::GetEncapsulatedRequest => self.handle_get_encapsulated_request(&header),
            RequestResponseCode::DeliverEncapsulatedResponse => self.handle_deliver_encapsulated_response(&header, rest),
            _ => Err(Error::Unsupported),
        }
    }

    fn error_response(&self, code: ErrorCode, data: u8) -> Vec<u8> {
        let mut out = Vec::new();
        ErrorResponse { error_code: code, error_data: data, extended_data: ArrayVec::new() }.encode(self.ctx.version, &mut out);
        out
    }

    // ---- GET_VERSION ----

    fn handle_get_version(&mut self, request: &[u8]) -> Result<Vec<u8>, Error> {
        self.ctx.transcript.append(Ledger::A, request)?;
        let mut versions = ArrayVec::new();
        versions.try_extend_from_slice(&self.ctx.local.supported_versions).map_err(|_| Error::BufferOverflow)?;
        let resp_msg = VersionResponse { versions };
        let mut out = Vec::new();
        resp_msg.encode(&mut out);
        self.ctx.transcript.append(Ledger::A, &out)?;
        self.ctx.connection.state.advance(ConnectionState::AfterVersion)?;
        log!(self.sink, Event::ReceivedResponse(RequestResponseCode::GetVersion));
        Ok(out)
    }

    // ---- GET_CAPABILITIES ----

    fn handle_get_capabilities(&mut self, header: &MessageHeader, rest: &[u8], request: &[u8]) -> Result<Vec<u8>, Error> {
        if self.ctx.connection.state.get() < ConnectionState::AfterVersion {
            return Err(Error::DeviceError);
        }
        let peer = CapabilitiesMessage::decode(rest)?;
        let _ = header;
        self.ctx.connection.capability_flags = crate::protocol::CapabilityFlags(peer.flags);
        self.ctx.transcript.append(Ledger::A, request)?;

        let resp_msg = CapabilitiesMessage { ct_exponent: self.ctx.local.ct_exponent, flags: self.ctx.local.capability_flags.0 };
        let mut out = Vec::new();
        resp_msg.encode(&mut out, false);
        self.ctx.transcript.append(Ledger::A, &out)?;
        self.ctx.connection.state.advance(ConnectionState::AfterCapabilities)?;
        Ok(out)
    }

    // ---- NEGOTIATE_ALGORITHMS ----

    fn handle_negotiate_algorithms(&mut self, rest: &[u8], request: &[u8]) -> Result<Vec<u8>, Error> {
        if self.ctx.connection.state.get() < ConnectionState::AfterCapabilities {
            return Err(Error::DeviceError);
        }
        let peer = AlgorithmsMessage::decode(rest)?;
        self.ctx.transcript.append(Ledger::A, request)?;

        // This endpoint has no algorithm preference list of its own in this
        // simplified model: it echoes back whatever the requester proposed.
        let mut out = Vec::new();
        peer.encode(&mut out, false);
        self.ctx.transcript.append(Ledger::A, &out)?;
        self.ctx.connection.algorithm = Some(crate::requester::decode_negotiated(&peer)?);
        self.ctx.connection.state.advance(ConnectionState::AfterNegotiateAlgorithms)?;
        Ok(out)
    }

    // ---- GET_DIGESTS ----

    fn handle_get_digests(&mut self, request: &[u8]) -> Result<Vec<u8>, Error> {
        if self.ctx.connection.state.get() < ConnectionState::AfterNegotiateAlgorithms {
            return Err(Error::DeviceError);
        }
        let algo = self.ctx.connection.algorithm.ok_or(Error::DeviceError)?;
        self.ctx.transcript.append(Ledger::B, request)?;

        let mut slot_mask = 0u8;
        let mut digests = ArrayVec::new();
        for (i, slot) in self.ctx.local.cert_chains.iter().enumerate() {
            if let Some(slot) = slot {
                slot_mask |= 1 << i;
                let digest = self.crypto.hash_all(algo.base_hash, &slot.chain)?;
                digests.try_extend_from_slice(&digest).map_err(|_| Error::BufferOverflow)?;
            }
        }
        let resp_msg = DigestsResponse { slot_mask, hash_size: algo.hash_size(), digests };
        let mut out = Vec::new();
        resp_msg.encode(self.ctx.version, &mut out);
        self.ctx.transcript.append(Ledger::B, &out)?;
        self.ctx.connection.state.advance(ConnectionState::AfterDigests)?;
        Ok(out)
    }

    // ---- GET_CERTIFICATE ----

    fn handle_get_certificate(&mut self, header: &MessageHeader, rest: &[u8], request: &[u8]) -> Result<Vec<u8>, Error> {
        let req = GetCertificateRequest::decode(header, rest)?;
        self.ctx.transcript.append(Ledger::B, request)?;

        let chain = self.ctx.get_certificate_chain(req.slot)?.to_vec();
        let offset = (req.offset as usize).min(chain.len());
        let remaining = chain.len() - offset;
        let portion = remaining.min(req.length as usize);
        let mut cert_chain = ArrayVec::new();
        cert_chain.try_extend_from_slice(&chain[offset..offset + portion]).map_err(|_| Error::BufferOverflow)?;
        let resp_msg = CertificateResponse { slot: req.slot, portion_length: portion as u16, remainder_length: (remaining - portion) as u16, cert_chain };
        let mut out = Vec::new();
        resp_msg.encode(self.ctx.version, &mut out);
        self.ctx.transcript.append(Ledger::B, &out)?;
        if remaining == portion {
            self.ctx.connection.local_used_cert_slot = Some(req.slot);
            self.ctx.connection.state.advance(ConnectionState::AfterCertificate)?;
        }
        Ok(out)
    }

    // ---- CHALLENGE ----

    fn handle_challenge(&mut self, header: &MessageHeader, rest: &[u8], request: &[u8]) -> Result<Vec<u8>, Error> {
        if self.ctx.connection.state.get() < ConnectionState::AfterCertificate {
            return Err(Error::DeviceError);
        }
        let algo = self.ctx.connection.algorithm.ok_or(Error::DeviceError)?;
        let req = ChallengeRequest::decode(header, rest)?;
        self.ctx.transcript.append(Ledger::C, request)?;

        let chain = self.ctx.get_certificate_chain(req.slot)?;
        let cert_digest = self.crypto.hash_all(algo.base_hash, chain)?;
        let mut cert_chain_hash = ArrayVec::new();
        cert_chain_hash.try_extend_from_slice(&cert_digest).map_err(|_| Error::BufferOverflow)?;

        let mut responder_nonce = [0u8; 32];
        self.crypto.random(&mut responder_nonce)?;

        let measurement_summary_hash = self.measurement_summary_hash(algo.base_hash, req.measurement_summary_hash_type)?;

        let basic_mut_auth_req = self.ctx.local.basic_mut_auth_required;
        let mut unsigned = ChallengeAuthResponse {
            slot_in_mask: crate::limits::slot_mask_bit(req.slot),
            basic_mut_auth_req,
            cert_chain_hash,
            responder_nonce,
            measurement_summary_hash,
            opaque: ArrayVec::new(),
            signature: ArrayVec::new(),
        };
        let mut prefix = Vec::new();
        unsigned.encode(self.ctx.version, &mut prefix);
        let prefix_len = ChallengeAuthResponse::signed_prefix_len(algo.hash_size()).min(prefix.len());
        self.ctx.transcript.append(Ledger::C, &prefix[..prefix_len])?;

        let m1m2 = self.ctx.transcript.build_m1m2(false);
        let digest = self.crypto.hash_all(algo.base_hash, &m1m2)?;
        let signature = self.crypto.asym_sign(algo.base_asym, &digest)?;
        unsigned.signature = signature;

        let mut out = Vec::new();
        unsigned.encode(self.ctx.version, &mut out);
        self.ctx.transcript.append(Ledger::C, &unsigned.signature)?;

        self.ctx.connection.state.advance(ConnectionState::Authenticated)?;
        self.ctx.transcript.reset(Ledger::M1M2);
        if basic_mut_auth_req {
            crate::encap::begin(self.ctx, 0);
        }
        Ok(out)
    }

    /// Folds the selected measurement blocks into one digest. `TcbComponent`
    /// excludes blocks flagged immutable-ROM (firmware that cannot change and
    /// so adds nothing a verifier needs re-checked on every connection);
    /// `All` includes every block.
    fn measurement_summary_hash(&self, algo: crate::protocol::BaseHashAlgo, hash_type: MeasurementSummaryHashType) -> Result<ArrayVec<u8, { crate::limits::MAX_HASH_SIZE }>, Error> {
        if hash_type == MeasurementSummaryHashType::None {
            return Ok(ArrayVec::new());
        }
        let mut concatenated = Vec::new();
        for block in &self.ctx.local.measurement_blocks {
            if hash_type == MeasurementSummaryHashType::TcbComponent && block.meta.is_immutable_rom {
                continue;
            }
            concatenated.extend_from_slice(&block.encoded);
        }
        let digest = self.crypto.hash_all(algo, &concatenated)?;
        let mut out = ArrayVec::new();
        out.try_extend_from_slice(&digest).map_err(|_| Error::BufferOverflow)?;
        Ok(out)
    }

    // ---- GET_MEASUREMENTS ----

    fn handle_get_measurements(&mut self, header: &MessageHeader, rest: &[u8], request: &[u8]) -> Result<Vec<u8>, Error> {
        let algo = self.ctx.connection.algorithm.ok_or(Error::DeviceError)?;
        let req = GetMeasurementsRequest::decode(header, rest)?;
        self.ctx.transcript.append(Ledger::L1L2, request)?;

        let mut responder_nonce = [0u8; 32];
        if let Some(nonce) = req.nonce {
            responder_nonce = nonce;
        }

        // `measurement_operation`: 0x00 reports the block count only, 0xFF
        // returns every block, anything else selects that one block index.
        let total = self.ctx.local.measurement_blocks.len() as u8;
        let mut measurement_record = ArrayVec::new();
        let number_of_blocks = match req.measurement_operation {
            0x00 => total,
            0xFF => {
                for block in &self.ctx.local.measurement_blocks {
                    measurement_record.try_extend_from_slice(&block.encoded).map_err(|_| Error::BufferOverflow)?;
                }
                total
            }
            idx => {
                let block = self.ctx.local.measurement_blocks.iter().find(|b| b.meta.index == idx).ok_or(Error::InvalidParameter)?;
                measurement_record.try_extend_from_slice(&block.encoded).map_err(|_| Error::BufferOverflow)?;
                1
            }
        };

        let resp_msg = MeasurementsResponse { number_of_blocks, measurement_record, responder_nonce, opaque: ArrayVec::new(), signature: ArrayVec::new() };
        let mut out = Vec::new();
        if req.signature_requested {
            let mut prefix = resp_msg.clone();
            let mut prefix_bytes = Vec::new();
            prefix.encode(self.ctx.version, &mut prefix_bytes);
            self.ctx.transcript.append(Ledger::L1L2, &prefix_bytes)?;
            let l1l2 = self.ctx.transcript.build_l1l2().to_vec();
            let digest = self.crypto.hash_all(algo.base_hash, &l1l2)?;
            let signature = self.crypto.asym_sign(algo.base_asym, &digest)?;
            let mut signed = resp_msg;
            signed.signature = signature;
            signed.encode(self.ctx.version, &mut out);
            self.ctx.transcript.append(Ledger::L1L2, &signed.signature)?;
            self.ctx.transcript.reset(Ledger::L1L2);
        } else {
            resp_msg.encode(self.ctx.version, &mut out);
            self.ctx.transcript.append(Ledger::L1L2, &out)?;
        }
        Ok(out)
    }

    // ---- KEY_EXCHANGE ----

    fn handle_key_exchange(&mut self, header: &MessageHeader, rest: &[u8], request: &[u8]) -> Result<Vec<u8>, Error> {
        let algo = self.ctx.connection.algorithm.ok_or(Error::DeviceError)?;
        let req = KeyExchangeRequest::decode(header, rest, algo.dhe_exchange_size())?;

        let rsp_half = self.ctx.sessions.allocate_rsp_half_id()?;
        let session_id = ((rsp_half as u32) << 16) | req.req_session_id_half as u32;
        let local_cert = self.ctx.connection.local_used_cert_slot.and_then(|slot| self.ctx.get_certificate_chain(slot).ok()).map(|c| c.to_vec());

        let dhe = self.crypto.dhe_generate(algo.dhe_group)?;
        let exchange_data = dhe.public_bytes();
        let shared_secret = dhe.agree(&req.exchange_data)?;

        let mut responder_nonce = [0u8; 32];
        self.crypto.random(&mut responder_nonce)?;
        let measurement_summary_hash = self.measurement_summary_hash(algo.base_hash, req.measurement_summary_hash_type)?;

        let mut_auth_requested =
            if self.ctx.local.mut_auth_via_encap_required { MUT_AUTH_REQUESTED | MUT_AUTH_REQUESTED_WITH_ENCAP_REQUEST } else { 0 };

        let session = self.ctx.sessions.assign(session_id, false)?;
        session.mut_auth.requested = mut_auth_requested & MUT_AUTH_REQUESTED != 0;
        session.mut_auth.with_encap_request = mut_auth_requested & MUT_AUTH_REQUESTED_WITH_ENCAP_REQUEST != 0;
        session.message_k.append(request)?;

        let run = (|| -> Result<Vec<u8>, Error> {
            let unsigned = KeyExchangeResponse {
                heartbeat_period: 0,
                mut_auth_requested,
                req_slot_id: req.slot,
                rsp_session_id_half: rsp_half,
                responder_nonce,
                exchange_data: exchange_data.clone(),
                measurement_summary_hash,
                opaque: ArrayVec::new(),
                signature: ArrayVec::new(),
                verify_data: ArrayVec::new(),
            };
            let mut prefix = Vec::new();
            unsigned.encode(self.ctx.version, &mut prefix);

            let session = self.ctx.sessions.lookup_mut(session_id)?;
            session.message_k.append(&prefix)?;

            let th1 = self.ctx.transcript.th1(self.crypto, algo.base_hash, local_cert.as_deref(), self.ctx.sessions.lookup(session_id)?.message_k.data())?;
            let digest = self.crypto.hash_all(algo.base_hash, &th1)?;
            let signature = self.crypto.asym_sign(algo.base_asym, &digest)?;

            let session = self.ctx.sessions.lookup_mut(session_id)?;
            session.message_k.append(&signature)?;
            session.keys.derive_handshake(self.crypto, algo.base_hash, algo.aead_suite, &shared_secret, &th1)?;
            let response_finished_key = session.keys.response_handshake.as_ref().ok_or(Error::InvalidParameter)?.finished_key.clone();
            let verify_data = self.crypto.hmac_all(algo.base_hash, &response_finished_key, &th1)?;
            let mut verify_arr = ArrayVec::new();
            verify_arr.try_extend_from_slice(&verify_data).map_err(|_| Error::BufferOverflow)?;
            session.message_k.append(&verify_arr)?;
            session.state = SessionState::Handshaking;

            let mut signed = unsigned;
            signed.signature = signature;
            signed.verify_data = verify_arr;
            let mut out = Vec::new();
            signed.encode(self.ctx.version, &mut out);
            Ok(out)
        })();

        match run {
            Ok(out) => {
                self.ctx.latest_session_id = session_id;
                if self.ctx.local.mut_auth_via_encap_required {
                    crate::encap::begin(self.ctx, 0);
                }
                log!(self.sink, Event::SessionHandshaking(session_id));
                Ok(out)
            }
            Err(e) => {
                let _ = self.ctx.sessions.free(session_id);
                Err(e)
            }
        }
    }

    // ---- FINISH ----

    fn handle_finish(&mut self, header: &MessageHeader, rest: &[u8], request: &[u8]) -> Result<Vec<u8>, Error> {
        let algo = self.ctx.connection.algorithm.ok_or(Error::DeviceError)?;
        let session_id = self.ctx.latest_session_id;
        let hmac_size = algo.hash_size();
        let req = FinishRequest::decode(header, rest, 0, hmac_size)?;

        let session = self.ctx.sessions.lookup_mut(session_id)?;
        session.message_f.append(&request[..MSG_HEADER_SIZE])?;
        session.message_f.append(&req.verify_data)?;

        let request_finished_key = session.keys.request_handshake.as_ref().ok_or(Error::InvalidParameter)?.finished_key.clone();
        let th2_partial =
            self.ctx
                .transcript
                .th_for_signing_akf(self.crypto, algo.base_hash, None, session.message_k.data(), None, session.message_f.data())?;
        let expected = self.crypto.hmac_all(algo.base_hash, &request_finished_key, &th2_partial)?;
        if expected.as_slice() != req.verify_data.as_slice() {
            return Err(Error::SecurityViolation);
        }

        let response_finished_key = session.keys.response_handshake.as_ref().ok_or(Error::InvalidParameter)?.finished_key.clone();
        let verify_data = self.crypto.hmac_all(algo.base_hash, &response_finished_key, &th2_partial)?;
        let mut verify_arr = ArrayVec::new();
        verify_arr.try_extend_from_slice(&verify_data).map_err(|_| Error::BufferOverflow)?;
        let resp_msg = FinishResponse { verify_data: verify_arr };
        let mut out = Vec::new();
        resp_msg.encode(self.ctx.version, &mut out);

        let session = self.ctx.sessions.lookup_mut(session_id)?;
        session.message_f.append(&out)?;
        let th2 = self.ctx.transcript.th2(self.crypto, algo.base_hash, None, session.message_k.data(), None, session.message_f.data())?;

        let session = self.ctx.sessions.lookup_mut(session_id)?;
        session.keys.derive_data(self.crypto, algo.base_hash, algo.aead_suite, &th2)?;
        session.state = SessionState::Established;
        log!(self.sink, Event::SessionEstablished(session_id));
        Ok(out)
    }

    // ---- PSK_EXCHANGE ----

    fn handle_psk_exchange(&mut self, header: &MessageHeader, rest: &[u8], request: &[u8]) -> Result<Vec<u8>, Error> {
        let algo = self.ctx.connection.algorithm.ok_or(Error::DeviceError)?;
        let req = PskExchangeRequest::decode(header, rest)?;
        if req.psk_hint != self.ctx.local.psk_hint {
            return Err(Error::SecurityViolation);
        }

        let rsp_half = self.ctx.sessions.allocate_rsp_half_id()?;
        let session_id = rsp_half as u32;
        let psk_value = self.ctx.local.psk_value.clone();
        let measurement_summary_hash = self.measurement_summary_hash(algo.base_hash, req.measurement_summary_hash_type)?;

        let mut responder_context = [0u8; 32];
        self.crypto.random(&mut responder_context)?;

        let session = self.ctx.sessions.assign(session_id, true)?;
        session.message_k.append(request)?;

        let run = (|| -> Result<Vec<u8>, Error> {
            let unsigned = PskExchangeResponse { heartbeat_period: 0, responder_context, measurement_summary_hash, opaque: ArrayVec::new(), verify_data: ArrayVec::new() };
            let mut prefix = Vec::new();
            unsigned.encode(self.ctx.version, &mut prefix);

            let session = self.ctx.sessions.lookup_mut(session_id)?;
            session.message_k.append(&prefix)?;

            let th1 = self.ctx.transcript.th1(self.crypto, algo.base_hash, None, self.ctx.sessions.lookup(session_id)?.message_k.data())?;

            let session = self.ctx.sessions.lookup_mut(session_id)?;
            session.keys.derive_handshake(self.crypto, algo.base_hash, algo.aead_suite, &psk_value, &th1)?;
            let response_finished_key = session.keys.response_handshake.as_ref().ok_or(Error::InvalidParameter)?.finished_key.clone();
            let verify_data = self.crypto.hmac_all(algo.base_hash, &response_finished_key, &th1)?;
            let mut verify_arr = ArrayVec::new();
            verify_arr.try_extend_from_slice(&verify_data).map_err(|_| Error::BufferOverflow)?;
            session.message_k.append(&verify_arr)?;
            session.state = SessionState::Handshaking;

            let mut signed = unsigned;
            signed.verify_data = verify_arr;
            let mut out = Vec::new();
            signed.encode(self.ctx.version, &mut out);
            Ok(out)
        })();

        match run {
            Ok(out) => {
                self.ctx.latest_session_id = session_id;
                log!(self.sink, Event::SessionHandshaking(session_id));
                Ok(out)
            }
            Err(e) => {
                let _ = self.ctx.sessions.free(session_id);
                Err(e)
            }
        }
    }

    // ---- PSK_FINISH ----

    fn handle_psk_finish(&mut self, rest: &[u8], request: &[u8]) -> Result<Vec<u8>, Error> {
        let algo = self.ctx.connection.algorithm.ok_or(Error::DeviceError)?;
        let session_id = self.ctx.latest_session_id;
        let req = PskFinishRequest::decode(rest, algo.hash_size())?;

        let header_len = MSG_HEADER_SIZE;
        let session = self.ctx.sessions.lookup_mut(session_id)?;
        session.message_f.append(&request[..header_len])?;
        session.message_f.append(&req.verify_data)?;

        let request_finished_key = session.keys.request_handshake.as_ref().ok_or(Error::InvalidParameter)?.finished_key.clone();
        let th2_partial =
            self.ctx
                .transcript
                .th_for_signing_akf(self.crypto, algo.base_hash, None, session.message_k.data(), None, session.message_f.data())?;
        let expected = self.crypto.hmac_all(algo.base_hash, &request_finished_key, &th2_partial)?;
        if expected.as_slice() != req.verify_data.as_slice() {
            return Err(Error::SecurityViolation);
        }

        let mut out = Vec::new();
        PskFinishResponse.encode(self.ctx.version, &mut out);

        let session = self.ctx.sessions.lookup_mut(session_id)?;
        session.message_f.append(&out)?;
        let th2 = self.ctx.transcript.th2(self.crypto, algo.base_hash, None, session.message_k.data(), None, session.message_f.data())?;

        let session = self.ctx.sessions.lookup_mut(session_id)?;
        session.keys.derive_data(self.crypto, algo.base_hash, algo.aead_suite, &th2)?;
        session.state = SessionState::Established;
        log!(self.sink, Event::SessionEstablished(session_id));
        Ok(out)
    }

    // ---- END_SESSION ----

    fn handle_end_session(&mut self, _header: &MessageHeader) -> Result<Vec<u8>, Error> {
        let session_id = self.ctx.latest_session_id;
        let _ = self.ctx.sessions.free(session_id);
        log!(self.sink, Event::SessionClosed(session_id));
        let mut out = Vec::new();
        EndSessionAckResponse.encode(self.ctx.version, &mut out);
        Ok(out)
    }

    // ---- RESPOND_IF_READY ----

    fn handle_respond_if_ready(&mut self, _header: &MessageHeader) -> Result<Vec<u8>, Error> {
        if self.ctx.response_state != ResponseState::NotReady {
            return Err(Error::DeviceError);
        }
        self.ctx.response_state = ResponseState::Normal;
        let cached = self.ctx.last_request.bytes.clone();
        self.dispatch(&cached)
    }

    // ---- GET_ENCAPSULATED_REQUEST / DELIVER_ENCAPSULATED_RESPONSE ----

    /// Hands back the next tunneled request for the nested mutual-auth
    /// dialogue a prior CHALLENGE or KEY_EXCHANGE started.
    fn handle_get_encapsulated_request(&mut self, _header: &MessageHeader) -> Result<Vec<u8>, Error> {
        if !self.ctx.encap_context.in_progress {
            return Err(Error::DeviceError);
        }
        let request_id = self.ctx.encap_context.current_request_id;
        let payload = crate::encap::next_request(self.ctx, self.crypto)?;
        let resp_msg = EncapsulatedRequestMessage { request_id, payload };
        let mut out = Vec::new();
        resp_msg.encode(self.ctx.version, &mut out);
        Ok(out)
    }

    /// Consumes the peer's answer to a tunneled request, verifying it and
    /// either asking for the next leg or acknowledging completion.
    fn handle_deliver_encapsulated_response(&mut self, header: &MessageHeader, rest: &[u8]) -> Result<Vec<u8>, Error> {
        if !self.ctx.encap_context.in_progress {
            return Err(Error::DeviceError);
        }
        let req = DeliverEncapsulatedResponseMessage::decode(header, rest)?;
        if req.request_id != self.ctx.encap_context.current_request_id {
            return Err(Error::DeviceError);
        }
        let done = crate::encap::handle_inner_response(self.ctx, self.crypto, &req.payload)?;

        if done {
            let resp_msg = EncapsulatedResponseAckMessage { request_id: req.request_id, payload_type: ACK_PAYLOAD_ABSENT, payload: Vec::new() };
            let mut out = Vec::new();
            resp_msg.encode(self.ctx.version, &mut out);
            Ok(out)
        } else {
            self.ctx.encap_context.current_request_id = req.request_id.wrapping_add(1);
            let payload = crate::encap::next_request(self.ctx, self.crypto)?;
            let resp_msg = EncapsulatedResponseAckMessage { request_id: self.ctx.encap_context.current_request_id, payload_type: ACK_PAYLOAD_PRESENT, payload };
            let mut out = Vec::new();
            resp_msg.encode(self.ctx.version, &mut out);
            Ok(out)
        }
    }

    // ---- Secured application data ----

    /// Decrypts one secured-message record for `session_id`, verifying its
    /// AEAD tag and advancing the session's inbound sequence number.
    pub fn decode_secured(&mut self, session_id: u32, record: &[u8]) -> Result<Vec<u8>, Error> {
        let algo = self.ctx.connection.algorithm.ok_or(Error::DeviceError)?;
        let session = self.ctx.sessions.lookup_mut(session_id)?;
        secured_messages::decode(session, self.crypto, algo.base_hash, algo.aead_suite, false, session_id, record, 0, self.secured_message_callbacks)
    }

    /// Seals an application response for `session_id`.
    pub fn encode_secured(&mut self, session_id: u32, app_msg: &[u8]) -> Result<Vec<u8>, Error> {
        let algo = self.ctx.connection.algorithm.ok_or(Error::DeviceError)?;
        let session = self.ctx.sessions.lookup_mut(session_id)?;
        secured_messages::encode(session, self.crypto, algo.base_hash, algo.aead_suite, false, session_id, app_msg, self.secured_message_callbacks)
    }
}

fn error_code_for(e: Error) -> ErrorCode {
    match e {
        Error::SecurityViolation => ErrorCode::UnexpectedRequest,
        Error::Unsupported => ErrorCode::Unspecified,
        Error::NotReady => ErrorCode::ResponseNotReady,
        _ => ErrorCode::InvalidRequest,
    }
}
