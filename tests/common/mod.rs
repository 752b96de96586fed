/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Shared harness for the integration tests: a crypto provider that layers a
//! toy asymmetric-signature scheme over the bundled software backend (which
//! deliberately implements neither), a tagging transport that can tell
//! application data from protocol messages without any MCTP/PCI-DOE
//! framing, and a loopback `DeviceIo` that drives a responder synchronously
//! out of a requester's send.

use arrayvec::ArrayVec;
use rand_core::OsRng;

use spdm_core::context::EndpointContext;
use spdm_core::crypto::default_impl::SoftwareCryptoProvider;
use spdm_core::crypto::{CryptoProvider, DheSecret, Digest, Signature};
use spdm_core::error::Error;
use spdm_core::event::EventSink;
use spdm_core::limits::MAX_HASH_SIZE;
use spdm_core::protocol::{AeadCipherSuite, BaseAsymAlgo, BaseHashAlgo, DheNamedGroup};
use spdm_core::responder::Responder;
use spdm_core::session::secured_messages::ImplicitSequenceCallbacks;
use spdm_core::transport::{DecodedFrame, DeviceIo, TransportLayer};

/// A provider that defers hashing, HKDF, AEAD and DHE to the real software
/// backend, and answers `asym_sign`/`asym_verify`/`x509_verify_chain` (which
/// that backend refuses, having no certificate library) with a symmetric
/// HMAC standing in for a signature. `cert_chain` bytes are expected to
/// literally be the peer's `signing_key`; this has no PKI properties
/// whatsoever and exists only so the handshake tests can exercise the
/// sign/verify call sites.
pub struct TestCrypto {
    inner: SoftwareCryptoProvider<OsRng>,
    pub signing_key: [u8; 48],
}

impl TestCrypto {
    pub fn new(signing_key: [u8; 48]) -> Self {
        Self { inner: SoftwareCryptoProvider::new(OsRng), signing_key }
    }
}

impl CryptoProvider for TestCrypto {
    fn random(&mut self, out: &mut [u8]) -> Result<(), Error> {
        self.inner.random(out)
    }

    fn hash_all(&self, algo: BaseHashAlgo, data: &[u8]) -> Result<Digest, Error> {
        self.inner.hash_all(algo, data)
    }

    fn hmac_all(&self, algo: BaseHashAlgo, key: &[u8], data: &[u8]) -> Result<Digest, Error> {
        self.inner.hmac_all(algo, key, data)
    }

    fn hkdf_extract(&self, algo: BaseHashAlgo, salt: &[u8], ikm: &[u8]) -> Result<Digest, Error> {
        self.inner.hkdf_extract(algo, salt, ikm)
    }

    fn hkdf_expand_label(&self, algo: BaseHashAlgo, prk: &[u8], label: &str, context: &[u8], out_len: usize) -> Result<ArrayVec<u8, MAX_HASH_SIZE>, Error> {
        self.inner.hkdf_expand_label(algo, prk, label, context, out_len)
    }

    fn dhe_generate(&mut self, group: DheNamedGroup) -> Result<Box<dyn DheSecret>, Error> {
        self.inner.dhe_generate(group)
    }

    fn aead_seal(&self, suite: AeadCipherSuite, key: &[u8], iv: &[u8], aad: &[u8], plaintext: &[u8], out: &mut [u8]) -> Result<(), Error> {
        self.inner.aead_seal(suite, key, iv, aad, plaintext, out)
    }

    fn aead_open(&self, suite: AeadCipherSuite, key: &[u8], iv: &[u8], aad: &[u8], ciphertext: &[u8], out: &mut [u8]) -> Result<(), Error> {
        self.inner.aead_open(suite, key, iv, aad, ciphertext, out)
    }

    fn asym_sign(&self, _algo: BaseAsymAlgo, message: &[u8]) -> Result<Signature, Error> {
        let mac = self.inner.hmac_all(BaseHashAlgo::Sha384, &self.signing_key, message)?;
        let mut sig = ArrayVec::new();
        sig.try_extend_from_slice(&mac).map_err(|_| Error::BufferOverflow)?;
        sig.try_extend_from_slice(&mac).map_err(|_| Error::BufferOverflow)?;
        Ok(sig)
    }

    fn asym_verify(&self, _algo: BaseAsymAlgo, cert_chain: &[u8], message: &[u8], signature: &[u8]) -> Result<(), Error> {
        let mac = self.inner.hmac_all(BaseHashAlgo::Sha384, cert_chain, message)?;
        let mut expected = ArrayVec::<u8, { spdm_core::limits::MAX_ASYM_SIGNATURE_SIZE }>::new();
        expected.try_extend_from_slice(&mac).map_err(|_| Error::BufferOverflow)?;
        expected.try_extend_from_slice(&mac).map_err(|_| Error::BufferOverflow)?;
        if expected.as_slice() == signature {
            Ok(())
        } else {
            Err(Error::SecurityViolation)
        }
    }

    fn x509_verify_chain(&self, algo: BaseHashAlgo, cert_chain: &[u8]) -> Result<Digest, Error> {
        self.inner.hash_all(algo, cert_chain)
    }
}

/// A minimal transport that tags every record with a flags byte and a
/// session id so a host loop can tell a plain SPDM message from secured
/// application data without any real link framing. `session_id == 0` means
/// "none" (session ids are never 0 once assigned).
pub struct TaggingTransport;

impl TransportLayer for TaggingTransport {
    fn encode(&self, session_id: Option<u32>, is_requester: bool, is_app: bool, spdm_msg: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
        let flags = (is_app as u8) | ((is_requester as u8) << 1);
        out.push(flags);
        out.extend_from_slice(&session_id.unwrap_or(0).to_be_bytes());
        out.extend_from_slice(spdm_msg);
        Ok(())
    }

    fn decode(&self, transport_msg: &[u8]) -> Result<DecodedFrame, Error> {
        if transport_msg.len() < 5 {
            return Err(Error::DeviceError);
        }
        let flags = transport_msg[0];
        let session_id = u32::from_be_bytes(transport_msg[1..5].try_into().unwrap());
        Ok(DecodedFrame {
            session_id: if session_id == 0 { None } else { Some(session_id) },
            is_requester: flags & 0x2 != 0,
            is_app_message: flags & 0x1 != 0,
            payload: transport_msg[5..].to_vec(),
        })
    }
}

/// Stands in for the link between two endpoints: a requester's
/// `send_message` runs straight into a responder built from the fields
/// here, and the reply is buffered for the matching `receive_message`.
/// Application-data records are routed to `decode_secured`/`encode_secured`
/// instead of `process_request`, mirroring how a real host would branch on
/// `TransportLayer::decode`'s `is_app_message` before calling into this
/// crate.
pub struct LoopbackIo<'b> {
    ctx: &'b mut EndpointContext,
    crypto: &'b mut dyn CryptoProvider,
    sink: &'b mut dyn EventSink,
    transport: TaggingTransport,
    pending: Vec<u8>,
}

impl<'b> LoopbackIo<'b> {
    pub fn new(ctx: &'b mut EndpointContext, crypto: &'b mut dyn CryptoProvider, sink: &'b mut dyn EventSink) -> Self {
        Self { ctx, crypto, sink, transport: TaggingTransport, pending: Vec::new() }
    }
}

impl<'b> DeviceIo for LoopbackIo<'b> {
    fn send_message(&mut self, msg: &[u8], _timeout_ms: u32) -> Result<(), Error> {
        let frame = self.transport.decode(msg)?;

        let out_payload = if frame.is_app_message {
            let session_id = frame.session_id.ok_or(Error::DeviceError)?;
            let mut responder =
                Responder { ctx: &mut *self.ctx, crypto: &mut *self.crypto, sink: &mut *self.sink, secured_message_callbacks: &ImplicitSequenceCallbacks };
            let app_msg = responder.decode_secured(session_id, &frame.payload)?;
            responder.encode_secured(session_id, &app_msg)?
        } else {
            let mut responder =
                Responder { ctx: &mut *self.ctx, crypto: &mut *self.crypto, sink: &mut *self.sink, secured_message_callbacks: &ImplicitSequenceCallbacks };
            responder.process_request(&frame.payload)
        };

        let mut framed = Vec::new();
        self.transport.encode(frame.session_id, false, frame.is_app_message, &out_payload, &mut framed)?;
        self.pending = framed;
        Ok(())
    }

    fn receive_message(&mut self, buf: &mut [u8], _timeout_ms: u32) -> Result<usize, Error> {
        let n = self.pending.len();
        if n > buf.len() {
            return Err(Error::BufferOverflow);
        }
        buf[..n].copy_from_slice(&self.pending);
        Ok(n)
    }
}

/// A fresh endpoint context with the version and capability set the
/// handshake tests need, optionally provisioned with `signing_key` as its
/// sole certificate chain at slot 0.
pub fn new_ctx(signing_key: Option<[u8; 48]>) -> EndpointContext {
    let mut ctx = EndpointContext::new(0x11);
    ctx.local.supported_versions.try_extend_from_slice(&[0x11]).unwrap();
    ctx.local.capability_flags = spdm_core::protocol::CapabilityFlags(
        spdm_core::protocol::CapabilityFlags::CERT_CAP
            | spdm_core::protocol::CapabilityFlags::CHAL_CAP
            | spdm_core::protocol::CapabilityFlags::KEY_EX_CAP
            | spdm_core::protocol::CapabilityFlags::ENCRYPT_CAP
            | spdm_core::protocol::CapabilityFlags::MAC_CAP
            | spdm_core::protocol::CapabilityFlags::PSK_CAP
            | spdm_core::protocol::CapabilityFlags::MUT_AUTH_CAP
            | spdm_core::protocol::CapabilityFlags::ENCAP_CAP,
    );
    if let Some(key) = signing_key {
        let mut chain = ArrayVec::new();
        chain.try_extend_from_slice(&key).unwrap();
        ctx.local.cert_chains[0] = Some(spdm_core::context::CertificateChainSlot { chain });
    }
    ctx
}

pub fn negotiated_algorithms_message() -> spdm_core::protocol::messages::AlgorithmsMessage {
    spdm_core::protocol::messages::AlgorithmsMessage {
        measurement_hash_algo: 2,
        base_asym_algo: 32,
        base_hash_algo: 2,
        dhe_group: 16,
        aead_suite: 2,
        req_base_asym_algo: 32,
        key_schedule: 1,
    }
}
