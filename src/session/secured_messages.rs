/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! AEAD-protected Secured Messages codec, grounded on the
//! seal/open shape of `SymmetricState::encrypt_and_hash_in_place`/
//! `decrypt_and_hash_in_place` in `symmetric_state.rs`, generalized to
//! SPDM's explicit AAD header and transport-supplied sequence-number
//! encoding instead of an implicit Noise nonce counter.

use crate::crypto::CryptoProvider;
use crate::error::Error;
use crate::protocol::{AeadCipherSuite, BaseHashAlgo};
use crate::session::registry::SessionSlot;
use crate::session::SessionState;

/// Transport-supplied hooks for the two transport-specific knobs the codec
/// needs but must not hardcode: how many bytes the wire uses to
/// carry a sequence number, and how much random padding to add.
pub trait SecuredMessageCallbacks {
    /// Encode `seq` into `buf`, returning the number of bytes written (0..=8).
    fn encode_sequence_number(&self, seq: u64, buf: &mut [u8; 8]) -> usize;
    /// Decode a sequence number from the first `len` bytes of `buf`.
    fn decode_sequence_number(&self, buf: &[u8]) -> u64;
    /// Upper bound on random padding bytes appended before sealing.
    fn max_random_number_count(&self) -> u32;
}

/// A transport that carries no explicit sequence number on the wire and
/// appends no padding; both endpoints track sequence numbers implicitly.
pub struct ImplicitSequenceCallbacks;

impl SecuredMessageCallbacks for ImplicitSequenceCallbacks {
    fn encode_sequence_number(&self, _seq: u64, _buf: &mut [u8; 8]) -> usize {
        0
    }
    fn decode_sequence_number(&self, _buf: &[u8]) -> u64 {
        0
    }
    fn max_random_number_count(&self) -> u32 {
        0
    }
}

fn direction_key_iv<'a>(session: &'a SessionSlot, is_requester: bool) -> Result<(&'a [u8], &'a [u8]), Error> {
    match session.state {
        SessionState::NotStarted => Err(Error::InvalidParameter),
        SessionState::Handshaking => {
            let dir = if is_requester { session.keys.request_handshake.as_ref() } else { session.keys.response_handshake.as_ref() };
            let dir = dir.ok_or(Error::InvalidParameter)?;
            Ok((&dir.key, &dir.iv))
        }
        SessionState::Established => {
            let dir = if is_requester { session.keys.request_data.as_ref() } else { session.keys.response_data.as_ref() };
            let dir = dir.ok_or(Error::InvalidParameter)?;
            Ok((&dir.key, &dir.iv))
        }
    }
}

fn xor_nonce(iv: &[u8], seq: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..iv.len().min(12)].copy_from_slice(&iv[..iv.len().min(12)]);
    let seq_bytes = seq.to_be_bytes();
    for i in 0..8 {
        nonce[11 - i] ^= seq_bytes[7 - i];
    }
    nonce
}

fn build_aad(session_id: u32, seq_encoded: &[u8], plaintext_len_with_pad: u16) -> Vec<u8> {
    let mut aad = Vec::with_capacity(4 + seq_encoded.len() + 2);
    aad.extend_from_slice(&session_id.to_le_bytes());
    aad.extend_from_slice(seq_encoded);
    aad.extend_from_slice(&plaintext_len_with_pad.to_le_bytes());
    aad
}

/// Seal `app_msg` for `session`, advancing its sequence number for
/// `is_requester`'s direction. Returns the full secured record (AAD is not
/// re-returned; the caller reconstructs it identically on decode from
/// `session_id` and the advancing sequence number).
pub fn encode(
    session: &mut SessionSlot,
    crypto: &dyn CryptoProvider,
    hash_algo: BaseHashAlgo,
    aead_suite: AeadCipherSuite,
    is_requester: bool,
    session_id: u32,
    app_msg: &[u8],
    callbacks: &dyn SecuredMessageCallbacks,
) -> Result<Vec<u8>, Error> {
    let _ = hash_algo;
    let seq = if is_requester { session.request_sequence } else { session.response_sequence };
    let next_seq = seq.checked_add(1).ok_or(Error::SequenceExhausted)?;

    let (key, iv) = direction_key_iv(session, is_requester)?;
    let nonce = xor_nonce(iv, seq);

    let mut seq_buf = [0u8; 8];
    let seq_len = callbacks.encode_sequence_number(seq, &mut seq_buf);
    let aad = build_aad(session_id, &seq_buf[..seq_len], app_msg.len() as u16);

    let mut out = vec![0u8; app_msg.len() + 16];
    crypto.aead_seal(aead_suite, key, &nonce, &aad, app_msg, &mut out)?;

    if is_requester {
        session.request_sequence = next_seq;
    } else {
        session.response_sequence = next_seq;
    }

    let mut record = Vec::with_capacity(aad.len() + out.len());
    record.extend_from_slice(&aad);
    record.extend_from_slice(&out);
    Ok(record)
}

/// Inverse of [`encode`]. `seq_len` is the number of sequence-number bytes
/// the transport carries on the wire (matching `callbacks`); pass 0 for a
/// transport that tracks sequence numbers implicitly.
pub fn decode(
    session: &mut SessionSlot,
    crypto: &dyn CryptoProvider,
    hash_algo: BaseHashAlgo,
    aead_suite: AeadCipherSuite,
    is_requester: bool,
    session_id: u32,
    record: &[u8],
    seq_len: usize,
    callbacks: &dyn SecuredMessageCallbacks,
) -> Result<Vec<u8>, Error> {
    let _ = hash_algo;
    if record.len() < 4 + seq_len + 2 {
        return Err(Error::DeviceError);
    }
    let recv_session_id = u32::from_le_bytes(record[0..4].try_into().unwrap());
    if recv_session_id != session_id {
        return Err(crate::error::decrypt_failed());
    }
    let seq_bytes = &record[4..4 + seq_len];
    let seq = if seq_len == 0 {
        if is_requester {
            session.response_sequence
        } else {
            session.request_sequence
        }
    } else {
        callbacks.decode_sequence_number(seq_bytes)
    };
    let aad = &record[..4 + seq_len + 2];
    let ciphertext = &record[4 + seq_len + 2..];

    let (key, iv) = direction_key_iv(session, !is_requester)?;
    let nonce = xor_nonce(iv, seq);

    if ciphertext.len() < 16 {
        return Err(crate::error::decrypt_failed());
    }
    let mut out = vec![0u8; ciphertext.len() - 16];
    crypto.aead_open(aead_suite, key, &nonce, aad, ciphertext, &mut out)?;

    let next_seq = seq.checked_add(1).ok_or(Error::SequenceExhausted)?;
    if is_requester {
        session.response_sequence = next_seq;
    } else {
        session.request_sequence = next_seq;
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_xor_is_deterministic_per_sequence() {
        let iv = [1u8; 12];
        let n0 = xor_nonce(&iv, 0);
        let n1 = xor_nonce(&iv, 1);
        assert_ne!(n0, n1);
        assert_eq!(xor_nonce(&iv, 0), n0);
    }
}
