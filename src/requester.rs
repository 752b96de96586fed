/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Requester-side protocol flows, grounded on the
//! dispatch-then-verify shape of `Context::receive`/`send_with_fragmentation`
//! in `zssp.rs`: build a message, append it to the transcript, hand it to
//! the transport, verify the reply against the transcript, advance state.

use arrayvec::ArrayVec;

use crate::context::EndpointContext;
use crate::crypto::CryptoProvider;
use crate::error::Error;
use crate::event::{log, Event, EventSink};
use crate::protocol::messages::*;
use crate::protocol::{ConnectionState, MeasurementSummaryHashType, RequestResponseCode};
use crate::session::{secured_messages, SessionState};
use crate::transcript::Ledger;
use crate::transport::{DeviceIo, TransportLayer};

/// Bundles the collaborators a requester call needs; constructed fresh per
/// call since the host owns their lifetimes (all operations on one endpoint
/// are serialized by the caller, so no internal locking is needed).
pub struct Requester<'a> {
    pub ctx: &'a mut EndpointContext,
    pub crypto: &'a mut dyn CryptoProvider,
    pub io: &'a mut dyn DeviceIo,
    pub transport: &'a dyn TransportLayer,
    pub sink: &'a mut dyn EventSink,
    pub secured_message_callbacks: &'a dyn secured_messages::SecuredMessageCallbacks,
}

const DEFAULT_TIMEOUT_MS: u32 = 1000;

impl<'a> Requester<'a> {
    /// Send `request` and return the decoded SPDM response bytes, retrying
    /// on Busy/ResponseNotReady up to `retry_times`.
    fn send_receive_spdm(&mut self, request: &[u8]) -> Result<Vec<u8>, Error> {
        let mut attempts_left = self.ctx.retry_times;
        let mut framed = Vec::new();
        self.transport.encode(None, true, false, request, &mut framed)?;
        loop {
            self.io.send_message(&framed, DEFAULT_TIMEOUT_MS)?;
            let mut buf = vec![0u8; crate::limits::MAX_MESSAGE_LARGE_SIZE];
            let n = self.io.receive_message(&mut buf, DEFAULT_TIMEOUT_MS)?;
            buf.truncate(n);
            let frame = self.transport.decode(&buf)?;

            if frame.payload.len() >= MSG_HEADER_SIZE {
                let (header, rest) = MessageHeader::decode(&frame.payload)?;
                if header.code == RequestResponseCode::Error {
                    let err = ErrorResponse::decode(&header, rest)?;
                    match err.error_code {
                        crate::protocol::ErrorCode::Busy | crate::protocol::ErrorCode::ResponseNotReady => {
                            if attempts_left == 0 {
                                return Err(Error::NotReady);
                            }
                            attempts_left -= 1;
                            continue;
                        }
                        _ => return Err(Error::DeviceError),
                    }
                }
            }
            return Ok(frame.payload);
        }
    }

    // ---- GET_VERSION ----

    pub fn get_version(&mut self) -> Result<(), Error> {
        let mut req = Vec::new();
        GetVersionRequest.encode(&mut req);
        self.ctx.transcript.append(Ledger::A, &req)?;
        log!(self.sink, Event::SentRequest(RequestResponseCode::GetVersion));

        let resp_bytes = self.send_receive_spdm(&req)?;
        let (header, rest) = MessageHeader::decode(&resp_bytes)?;
        if header.code != RequestResponseCode::Version {
            return Err(Error::DeviceError);
        }
        let resp = VersionResponse::decode(rest)?;
        self.ctx.transcript.append(Ledger::A, &resp_bytes)?;
        self.ctx.connection.peer_versions = resp.versions;
        self.ctx.connection.state.advance(ConnectionState::AfterVersion)?;
        log!(self.sink, Event::ReceivedResponse(RequestResponseCode::Version));
        Ok(())
    }

    // ---- GET_CAPABILITIES ----

    pub fn get_capabilities(&mut self) -> Result<(), Error> {
        if self.ctx.connection.state.get() < ConnectionState::AfterVersion {
            return Err(Error::DeviceError);
        }
        let msg = CapabilitiesMessage { ct_exponent: self.ctx.local.ct_exponent, flags: self.ctx.local.capability_flags.0 };
        let mut req = Vec::new();
        msg.encode(&mut req, true);
        self.ctx.transcript.append(Ledger::A, &req)?;
        log!(self.sink, Event::SentRequest(RequestResponseCode::GetCapabilities));

        let resp_bytes = self.send_receive_spdm(&req)?;
        let (header, rest) = MessageHeader::decode(&resp_bytes)?;
        if header.code != RequestResponseCode::Capabilities {
            return Err(Error::DeviceError);
        }
        let resp = CapabilitiesMessage::decode(rest)?;
        self.ctx.transcript.append(Ledger::A, &resp_bytes)?;
        self.ctx.connection.capability_flags = crate::protocol::CapabilityFlags(resp.flags);
        self.ctx.connection.state.advance(ConnectionState::AfterCapabilities)?;
        log!(self.sink, Event::ReceivedResponse(RequestResponseCode::Capabilities));
        Ok(())
    }

    // ---- NEGOTIATE_ALGORITHMS ----

    pub fn negotiate_algorithms(&mut self, preferred: AlgorithmsMessage) -> Result<(), Error> {
        if self.ctx.connection.state.get() < ConnectionState::AfterCapabilities {
            return Err(Error::DeviceError);
        }
        let mut req = Vec::new();
        preferred.encode(&mut req, true);
        self.ctx.transcript.append(Ledger::A, &req)?;
        log!(self.sink, Event::SentRequest(RequestResponseCode::NegotiateAlgorithms));

        let resp_bytes = self.send_receive_spdm(&req)?;
        let (header, rest) = MessageHeader::decode(&resp_bytes)?;
        if header.code != RequestResponseCode::Algorithms {
            return Err(Error::DeviceError);
        }
        let resp = AlgorithmsMessage::decode(rest)?;
        self.ctx.transcript.append(Ledger::A, &resp_bytes)?;
        self.ctx.connection.algorithm = Some(decode_negotiated(&resp)?);
        self.ctx.connection.state.advance(ConnectionState::AfterNegotiateAlgorithms)?;
        log!(self.sink, Event::ReceivedResponse(RequestResponseCode::Algorithms));
        Ok(())
    }

    // ---- GET_DIGESTS ----

    pub fn get_digests(&mut self) -> Result<DigestsResponse, Error> {
        if self.ctx.connection.state.get() < ConnectionState::AfterNegotiateAlgorithms {
            return Err(Error::DeviceError);
        }
        let algo = self.ctx.connection.algorithm.ok_or(Error::DeviceError)?;
        let mut req = Vec::new();
        GetDigestsRequest.encode(self.ctx.version, &mut req);
        self.ctx.transcript.append(Ledger::B, &req)?;

        let resp_bytes = self.send_receive_spdm(&req)?;
        let (header, rest) = MessageHeader::decode(&resp_bytes)?;
        if header.code != RequestResponseCode::Digests {
            return Err(Error::DeviceError);
        }
        let resp = DigestsResponse::decode(rest, header.param2, algo.hash_size())?;
        self.ctx.transcript.append(Ledger::B, &resp_bytes)?;
        self.ctx.connection.state.advance(ConnectionState::AfterDigests)?;
        Ok(resp)
    }

    // ---- GET_CERTIFICATE ----

    /// Fetches the full certificate chain for `slot` by repeating
    /// GET_CERTIFICATE with growing offsets until `remainder_length == 0`.
    pub fn get_certificate(&mut self, slot: u8) -> Result<Vec<u8>, Error> {
        let algo = self.ctx.connection.algorithm.ok_or(Error::DeviceError)?;
        let mut chain = Vec::new();
        let mut offset: u16 = 0;
        loop {
            let req_msg = GetCertificateRequest { slot, offset, length: u16::MAX };
            let mut req = Vec::new();
            req_msg.encode(self.ctx.version, &mut req);
            self.ctx.transcript.append(Ledger::B, &req)?;

            let resp_bytes = self.send_receive_spdm(&req)?;
            let (header, rest) = MessageHeader::decode(&resp_bytes)?;
            if header.code != RequestResponseCode::Certificate {
                return Err(Error::DeviceError);
            }
            let resp = CertificateResponse::decode(&header, rest)?;
            self.ctx.transcript.append(Ledger::B, &resp_bytes)?;
            chain.extend_from_slice(&resp.cert_chain);
            if resp.remainder_length == 0 {
                break;
            }
            offset = offset.saturating_add(resp.portion_length);
        }

        // Verify the reassembled chain against the provider's trust anchors
        // before caching it as the chain every subsequent signature check
        // (CHALLENGE, KEY_EXCHANGE, GET_MEASUREMENTS) is verified against.
        let chain_digest = self.crypto.x509_verify_chain(algo.base_hash, &chain)?;
        if let Some(expected) = self.ctx.local.peer_root_cert_hash.as_ref() {
            if chain_digest.as_slice() != expected.as_slice() {
                return Err(Error::SecurityViolation);
            }
        }

        self.ctx.connection.peer_cert_chain.clear();
        self.ctx
            .connection
            .peer_cert_chain
            .try_extend_from_slice(&chain)
            .map_err(|_| Error::BufferOverflow)?;
        self.ctx.connection.state.advance(ConnectionState::AfterCertificate)?;
        Ok(chain)
    }

    // ---- CHALLENGE ----

    pub fn challenge(&mut self, slot: u8, hash_type: MeasurementSummaryHashType) -> Result<ChallengeAuthResponse, Error> {
        if self.ctx.connection.state.get() < ConnectionState::AfterCertificate {
            return Err(Error::DeviceError);
        }
        let algo = self.ctx.connection.algorithm.ok_or(Error::DeviceError)?;
        let mut nonce = [0u8; 32];
        self.crypto.random(&mut nonce)?;
        let req_msg = ChallengeRequest { slot, measurement_summary_hash_type: hash_type, nonce };
        let mut req = Vec::new();
        req_msg.encode(self.ctx.version, &mut req);
        self.ctx.transcript.append(Ledger::C, &req)?;

        let resp_bytes = self.send_receive_spdm(&req)?;
        let (header, rest) = MessageHeader::decode(&resp_bytes)?;
        if header.code != RequestResponseCode::ChallengeAuth {
            return Err(Error::DeviceError);
        }
        let sig_size = self.crypto.asym_signature_size(algo.base_asym);
        let resp = ChallengeAuthResponse::decode(&header, rest, algo.hash_size(), sig_size)?;

        if slot != crate::limits::SLOT_ID_PROVISIONED_CHAIN && resp.slot_in_mask & crate::limits::slot_mask_bit(slot) == 0 {
            return Err(Error::DeviceError);
        }

        // The signature covers H(M1M2); M1M2 is A||B||C with everything up
        // to (but excluding) the signature bytes folded into C.
        let prefix_len = ChallengeAuthResponse::signed_prefix_len(algo.hash_size()).min(resp_bytes.len());
        self.ctx.transcript.append(Ledger::C, &resp_bytes[..prefix_len])?;
        let m1m2 = self.ctx.transcript.build_m1m2(false);
        let digest = self.crypto.hash_all(algo.base_hash, &m1m2)?;
        self.crypto.asym_verify(algo.base_asym, &self.ctx.connection.peer_cert_chain, &digest, &resp.signature)?;

        self.ctx.transcript.append(Ledger::C, &resp.signature)?;
        self.ctx.connection.state.advance(ConnectionState::Authenticated)?;
        self.ctx.transcript.reset(Ledger::M1M2);

        if resp.basic_mut_auth_req {
            if !self.ctx.local.capability_flags.has(crate::protocol::CapabilityFlags::MUT_AUTH_CAP) {
                return Err(Error::DeviceError);
            }
            self.run_encapsulated_mutual_auth(slot)?;
        }
        Ok(resp)
    }

    // ---- Encapsulated mutual-auth dialogue ----

    /// Drives GET_ENCAPSULATED_REQUEST / DELIVER_ENCAPSULATED_RESPONSE to
    /// completion after a CHALLENGE or KEY_EXCHANGE asked for mutual auth,
    /// answering the peer's tunneled GET_DIGESTS/GET_CERTIFICATE/CHALLENGE
    /// against this endpoint's own `target_slot` identity.
    fn run_encapsulated_mutual_auth(&mut self, target_slot: u8) -> Result<(), Error> {
        crate::encap::begin(self.ctx, target_slot);

        let mut req = Vec::new();
        GetEncapsulatedRequestMessage.encode(self.ctx.version, &mut req);
        let mut resp_bytes = self.send_receive_spdm(&req)?;

        loop {
            let (header, rest) = MessageHeader::decode(&resp_bytes)?;
            if header.code != RequestResponseCode::EncapsulatedRequest {
                return Err(Error::DeviceError);
            }
            let envelope = EncapsulatedRequestMessage::decode(&header, rest)?;
            let (inner_response, done) = crate::encap::answer_inner_request(self.ctx, self.crypto, &envelope.payload)?;

            let deliver = DeliverEncapsulatedResponseMessage { request_id: envelope.request_id, payload: inner_response };
            let mut deliver_bytes = Vec::new();
            deliver.encode(self.ctx.version, &mut deliver_bytes);
            let ack_bytes = self.send_receive_spdm(&deliver_bytes)?;
            let (ack_header, ack_rest) = MessageHeader::decode(&ack_bytes)?;
            if ack_header.code != RequestResponseCode::EncapsulatedResponseAck {
                return Err(Error::DeviceError);
            }
            let ack = EncapsulatedResponseAckMessage::decode(&ack_header, ack_rest)?;

            if done || ack.payload_type == ACK_PAYLOAD_ABSENT {
                return Ok(());
            }
            let mut wrapped = Vec::new();
            EncapsulatedRequestMessage { request_id: ack.request_id, payload: ack.payload }.encode(self.ctx.version, &mut wrapped);
            resp_bytes = wrapped;
        }
    }

    // ---- GET_MEASUREMENTS ----

    pub fn get_measurements(&mut self, slot: u8, signature_requested: bool, measurement_operation: u8) -> Result<MeasurementsResponse, Error> {
        let algo = self.ctx.connection.algorithm.ok_or(Error::DeviceError)?;
        let mut nonce = [0u8; 32];
        if signature_requested {
            self.crypto.random(&mut nonce)?;
        }
        let req_msg = GetMeasurementsRequest {
            signature_requested,
            measurement_operation,
            slot,
            nonce: if signature_requested { Some(nonce) } else { None },
        };
        let mut req = Vec::new();
        req_msg.encode(self.ctx.version, &mut req);
        self.ctx.transcript.append(Ledger::L1L2, &req)?;

        let resp_bytes = self.send_receive_spdm(&req)?;
        let (header, rest) = MessageHeader::decode(&resp_bytes)?;
        if header.code != RequestResponseCode::Measurements {
            return Err(Error::DeviceError);
        }
        let sig_size = if signature_requested { self.crypto.asym_signature_size(algo.base_asym) } else { 0 };
        let resp = MeasurementsResponse::decode(&header, rest, sig_size)?;
        self.ctx.transcript.append(Ledger::L1L2, &resp_bytes)?;

        if signature_requested {
            let l1l2 = self.ctx.transcript.build_l1l2().to_vec();
            let digest = self.crypto.hash_all(algo.base_hash, &l1l2)?;
            self.crypto.asym_verify(algo.base_asym, &self.ctx.connection.peer_cert_chain, &digest, &resp.signature)?;
            self.ctx.transcript.reset(Ledger::L1L2);
        }
        Ok(resp)
    }

    // ---- KEY_EXCHANGE / FINISH ----

    /// Runs KEY_EXCHANGE to completion, returning the new session id.
    /// FINISH is a separate call ([`Self::finish`]) so a caller that needs
    /// mutual auth can run an encapsulated request in between.
    pub fn start_session_key_exchange(&mut self, slot: u8, session_policy: u8) -> Result<u32, Error> {
        let algo = self.ctx.connection.algorithm.ok_or(Error::DeviceError)?;
        let req_half = self.ctx.sessions.allocate_req_half_id()?;

        let mut dhe = self.crypto.dhe_generate(algo.dhe_group)?;
        let exchange_data = dhe.public_bytes();
        let mut nonce = [0u8; 32];
        self.crypto.random(&mut nonce)?;

        let req_msg = KeyExchangeRequest {
            session_policy,
            slot,
            measurement_summary_hash_type: MeasurementSummaryHashType::None,
            req_session_id_half: req_half,
            random_nonce: nonce,
            exchange_data,
            opaque: ArrayVec::new(),
        };
        let mut req = Vec::new();
        req_msg.encode(self.ctx.version, &mut req);

        let resp_bytes = self.send_receive_spdm(&req)?;
        self.complete_key_exchange(&req, &resp_bytes, req_half, algo, dhe.as_mut())
    }

    fn complete_key_exchange(
        &mut self,
        req_bytes: &[u8],
        resp_bytes: &[u8],
        req_half: u16,
        algo: crate::protocol::NegotiatedAlgorithms,
        dhe: &mut dyn crate::crypto::DheSecret,
    ) -> Result<u32, Error> {
        let (header, rest) = MessageHeader::decode(resp_bytes)?;
        if header.code != RequestResponseCode::KeyExchangeRsp {
            return Err(Error::DeviceError);
        }
        let sig_size = self.crypto.asym_signature_size(algo.base_asym);
        let resp = KeyExchangeResponse::decode(&header, rest, algo.dhe_exchange_size(), 0, sig_size, algo.hash_size())?;

        let session_id = ((resp.rsp_session_id_half as u32) << 16) | req_half as u32;
        // TH1 hashes in the *responder's* cert (the one its KEY_EXCHANGE_RSP
        // signature covers), cached from GET_CERTIFICATE, not anything this
        // endpoint provisioned locally.
        let peer_cert = if self.ctx.connection.peer_cert_chain.is_empty() { None } else { Some(self.ctx.connection.peer_cert_chain.to_vec()) };

        let session = self.ctx.sessions.assign(session_id, false)?;
        session.message_k.append(req_bytes)?;
        let signed_len = resp_bytes.len().saturating_sub(sig_size + algo.hash_size());
        session.message_k.append(&resp_bytes[..signed_len])?;

        let run = (|| -> Result<(), Error> {
            let shared_secret = dhe.agree(&resp.exchange_data)?;
            let session = self.ctx.sessions.lookup(session_id)?;
            let th1 = self.ctx.transcript.th1(self.crypto, algo.base_hash, peer_cert.as_deref(), session.message_k.data())?;

            let peer_chain = self.ctx.connection.peer_cert_chain.clone();
            let digest = self.crypto.hash_all(algo.base_hash, &th1)?;
            self.crypto.asym_verify(algo.base_asym, &peer_chain, &digest, &resp.signature)?;

            let session = self.ctx.sessions.lookup_mut(session_id)?;
            session.message_k.append(&resp_bytes[signed_len..resp_bytes.len() - algo.hash_size()])?;
            session.keys.derive_handshake(self.crypto, algo.base_hash, algo.aead_suite, &shared_secret, &th1)?;

            let response_finished_key = session.keys.response_handshake.as_ref().ok_or(Error::InvalidParameter)?.finished_key.clone();
            let expected_verify = self.crypto.hmac_all(algo.base_hash, &response_finished_key, &th1)?;
            if expected_verify.as_slice() != resp.verify_data.as_slice() {
                return Err(Error::SecurityViolation);
            }
            session.message_k.append(&resp.verify_data)?;
            session.state = SessionState::Handshaking;
            Ok(())
        })();

        match run {
            Ok(()) => {
                self.ctx.latest_session_id = session_id;
                log!(self.sink, Event::SessionHandshaking(session_id));
                Ok(session_id)
            }
            Err(e) => {
                let _ = self.ctx.sessions.free(session_id);
                Err(e)
            }
        }
    }

    /// Completes the handshake with FINISH, deriving data keys from `TH2`.
    pub fn finish(&mut self, session_id: u32) -> Result<(), Error> {
        let algo = self.ctx.connection.algorithm.ok_or(Error::DeviceError)?;
        let mut header_bytes = Vec::new();
        MessageHeader::new(self.ctx.version, RequestResponseCode::Finish, 0, 0).encode(&mut header_bytes);

        let session = self.ctx.sessions.lookup_mut(session_id)?;
        session.message_f.append(&header_bytes)?;
        let request_finished_key = session.keys.request_handshake.as_ref().ok_or(Error::InvalidParameter)?.finished_key.clone();
        let th2_partial =
            self.ctx
                .transcript
                .th_for_signing_akf(self.crypto, algo.base_hash, None, session.message_k.data(), None, session.message_f.data())?;
        let verify_data = self.crypto.hmac_all(algo.base_hash, &request_finished_key, &th2_partial)?;

        let mut verify_arr: ArrayVec<u8, { crate::limits::MAX_HASH_SIZE }> = ArrayVec::new();
        verify_arr.try_extend_from_slice(&verify_data).map_err(|_| Error::BufferOverflow)?;
        let req_msg = FinishRequest { signature_included: false, req_slot: 0, signature: ArrayVec::new(), verify_data: verify_arr.clone() };
        let mut req = Vec::new();
        req_msg.encode(self.ctx.version, &mut req);

        let session = self.ctx.sessions.lookup_mut(session_id)?;
        session.message_f.append(&verify_arr)?;

        let resp_bytes = self.send_receive_spdm(&req)?;
        let (header, rest) = MessageHeader::decode(&resp_bytes)?;
        if header.code != RequestResponseCode::FinishRsp {
            return Err(Error::DeviceError);
        }
        let resp = FinishResponse::decode(rest, algo.hash_size())?;

        let session = self.ctx.sessions.lookup_mut(session_id)?;
        session.message_f.append(&resp_bytes)?;
        let th2 = self.ctx.transcript.th2(self.crypto, algo.base_hash, None, session.message_k.data(), None, session.message_f.data())?;

        let session = self.ctx.sessions.lookup_mut(session_id)?;
        if !resp.verify_data.is_empty() {
            let response_finished_key = session.keys.response_handshake.as_ref().ok_or(Error::InvalidParameter)?.finished_key.clone();
            let expected = self.crypto.hmac_all(algo.base_hash, &response_finished_key, &th2)?;
            if expected.as_slice() != resp.verify_data.as_slice() {
                return Err(Error::SecurityViolation);
            }
        }
        let session = self.ctx.sessions.lookup_mut(session_id)?;
        session.keys.derive_data(self.crypto, algo.base_hash, algo.aead_suite, &th2)?;
        session.state = SessionState::Established;
        log!(self.sink, Event::SessionEstablished(session_id));
        Ok(())
    }

    // ---- PSK_EXCHANGE / PSK_FINISH ----

    pub fn start_session_psk(&mut self) -> Result<u32, Error> {
        let algo = self.ctx.connection.algorithm.ok_or(Error::DeviceError)?;
        let req_half = self.ctx.sessions.allocate_req_half_id()?;
        let mut ctx_bytes = [0u8; 32];
        self.crypto.random(&mut ctx_bytes)?;

        let req_msg = PskExchangeRequest {
            measurement_summary_hash_type: MeasurementSummaryHashType::None,
            psk_hint: self.ctx.local.psk_hint.clone(),
            requester_context: ctx_bytes,
            opaque: ArrayVec::new(),
        };
        let mut req = Vec::new();
        req_msg.encode(self.ctx.version, &mut req);

        let resp_bytes = self.send_receive_spdm(&req)?;
        let (header, rest) = MessageHeader::decode(&resp_bytes)?;
        if header.code != RequestResponseCode::PskExchangeRsp {
            return Err(Error::DeviceError);
        }
        let resp = PskExchangeResponse::decode(rest, 0, algo.hash_size())?;

        // This exchange's session id is the requester's half alone: unlike
        // KEY_EXCHANGE, PSK_EXCHANGE_RSP echoes back no responder half to
        // combine with it.
        let session_id = req_half as u32;
        let psk_value = self.ctx.local.psk_value.clone();

        let session = self.ctx.sessions.assign(session_id, true)?;
        session.message_k.append(&req)?;
        session.message_k.append(&resp_bytes[..resp_bytes.len() - algo.hash_size()])?;

        let run = (|| -> Result<(), Error> {
            let session = self.ctx.sessions.lookup(session_id)?;
            let th1 = self.ctx.transcript.th1(self.crypto, algo.base_hash, None, session.message_k.data())?;
            let session = self.ctx.sessions.lookup_mut(session_id)?;
            session.keys.derive_handshake(self.crypto, algo.base_hash, algo.aead_suite, &psk_value, &th1)?;

            let response_finished_key = session.keys.response_handshake.as_ref().ok_or(Error::InvalidParameter)?.finished_key.clone();
            let expected = self.crypto.hmac_all(algo.base_hash, &response_finished_key, &th1)?;
            if expected.as_slice() != resp.verify_data.as_slice() {
                return Err(Error::SecurityViolation);
            }
            session.message_k.append(&resp.verify_data)?;
            session.state = SessionState::Handshaking;
            Ok(())
        })();

        match run {
            Ok(()) => {
                self.ctx.latest_session_id = session_id;
                log!(self.sink, Event::SessionHandshaking(session_id));
                Ok(session_id)
            }
            Err(e) => {
                let _ = self.ctx.sessions.free(session_id);
                Err(e)
            }
        }
    }

    pub fn psk_finish(&mut self, session_id: u32) -> Result<(), Error> {
        let algo = self.ctx.connection.algorithm.ok_or(Error::DeviceError)?;
        let session = self.ctx.sessions.lookup_mut(session_id)?;
        let request_finished_key = session.keys.request_handshake.as_ref().ok_or(Error::InvalidParameter)?.finished_key.clone();
        let th2_partial =
            self.ctx
                .transcript
                .th_for_signing_akf(self.crypto, algo.base_hash, None, session.message_k.data(), None, session.message_f.data())?;
        let verify_data = self.crypto.hmac_all(algo.base_hash, &request_finished_key, &th2_partial)?;

        let mut verify_arr: ArrayVec<u8, { crate::limits::MAX_HASH_SIZE }> = ArrayVec::new();
        verify_arr.try_extend_from_slice(&verify_data).map_err(|_| Error::BufferOverflow)?;
        let req_msg = PskFinishRequest { verify_data: verify_arr.clone() };
        let mut req = Vec::new();
        req_msg.encode(self.ctx.version, &mut req);

        let session = self.ctx.sessions.lookup_mut(session_id)?;
        session.message_f.append(&req)?;

        let resp_bytes = self.send_receive_spdm(&req)?;
        let (header, _rest) = MessageHeader::decode(&resp_bytes)?;
        if header.code != RequestResponseCode::PskFinishRsp {
            return Err(Error::DeviceError);
        }
        let session = self.ctx.sessions.lookup_mut(session_id)?;
        session.message_f.append(&resp_bytes)?;
        let th2 = self.ctx.transcript.th2(self.crypto, algo.base_hash, None, session.message_k.data(), None, session.message_f.data())?;

        let session = self.ctx.sessions.lookup_mut(session_id)?;
        session.keys.derive_data(self.crypto, algo.base_hash, algo.aead_suite, &th2)?;
        session.state = SessionState::Established;
        log!(self.sink, Event::SessionEstablished(session_id));
        Ok(())
    }

    // ---- Secured application data ----

    pub fn send_receive_data(&mut self, session_id: u32, app_msg: &[u8]) -> Result<Vec<u8>, Error> {
        let algo = self.ctx.connection.algorithm.ok_or(Error::DeviceError)?;
        let session = self.ctx.sessions.lookup_mut(session_id)?;
        let record = secured_messages::encode(
            session,
            self.crypto,
            algo.base_hash,
            algo.aead_suite,
            true,
            session_id,
            app_msg,
            self.secured_message_callbacks,
        )?;

        let mut framed = Vec::new();
        self.transport.encode(Some(session_id), true, true, &record, &mut framed)?;
        self.io.send_message(&framed, DEFAULT_TIMEOUT_MS)?;
        let mut buf = vec![0u8; crate::limits::MAX_MESSAGE_LARGE_SIZE];
        let n = self.io.receive_message(&mut buf, DEFAULT_TIMEOUT_MS)?;
        buf.truncate(n);
        let frame = self.transport.decode(&buf)?;

        let session = self.ctx.sessions.lookup_mut(session_id)?;
        secured_messages::decode(
            session,
            self.crypto,
            algo.base_hash,
            algo.aead_suite,
            true,
            session_id,
            &frame.payload,
            0,
            self.secured_message_callbacks,
        )
    }

    pub fn end_session(&mut self, session_id: u32) -> Result<(), Error> {
        let req_msg = EndSessionRequest { preserve_negotiated_state: false };
        let mut req = Vec::new();
        req_msg.encode(self.ctx.version, &mut req);
        let _ = self.send_receive_spdm(&req);
        let result = self.ctx.sessions.free(session_id);
        log!(self.sink, Event::SessionClosed(session_id));
        result
    }
}

pub(crate) fn decode_negotiated(resp: &AlgorithmsMessage) -> Result<crate::protocol::NegotiatedAlgorithms, Error> {
    use crate::protocol::*;
    let base_hash = match resp.base_hash_algo {
        1 => BaseHashAlgo::Sha256,
        2 => BaseHashAlgo::Sha384,
        4 => BaseHashAlgo::Sha512,
        _ => return Err(Error::Unsupported),
    };
    let measurement_hash = match resp.measurement_hash_algo {
        0 => MeasurementHashAlgo::RawBitstream,
        1 => MeasurementHashAlgo::Sha256,
        2 => MeasurementHashAlgo::Sha384,
        4 => MeasurementHashAlgo::Sha512,
        _ => return Err(Error::Unsupported),
    };
    let base_asym = match resp.base_asym_algo {
        1 => BaseAsymAlgo::RsaSsa2048,
        2 => BaseAsymAlgo::RsaSsa3072,
        4 => BaseAsymAlgo::RsaSsa4096,
        16 => BaseAsymAlgo::EcdsaP256,
        32 => BaseAsymAlgo::EcdsaP384,
        _ => return Err(Error::Unsupported),
    };
    let dhe_group = match resp.dhe_group {
        1 => DheNamedGroup::Ffdhe2048,
        2 => DheNamedGroup::Ffdhe3072,
        4 => DheNamedGroup::Ffdhe4096,
        8 => DheNamedGroup::SecP256R1,
        16 => DheNamedGroup::SecP384R1,
        _ => return Err(Error::Unsupported),
    };
    let aead_suite = match resp.aead_suite {
        1 => AeadCipherSuite::Aes128Gcm,
        2 => AeadCipherSuite::Aes256Gcm,
        4 => AeadCipherSuite::ChaCha20Poly1305,
        _ => return Err(Error::Unsupported),
    };
    Ok(NegotiatedAlgorithms {
        measurement_hash,
        base_hash,
        base_asym,
        req_base_asym: base_asym,
        dhe_group,
        aead_suite,
        key_schedule: KeyScheduleAlgo::SpdmKeySchedule,
    })
}
