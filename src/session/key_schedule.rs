/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! TH1/TH2-keyed derivation of handshake and data secrets, grounded on the
//! HKDF-chain shape of `SymmetricState::kbkdf`/`mix_key` in
//! `symmetric_state.rs`, generalized from that type's fixed two-party ratchet
//! to SPDM's two separate handshake/data phases with runtime-negotiated hash
//! and AEAD sizes.

use arrayvec::ArrayVec;

use crate::crypto::CryptoProvider;
use crate::error::Error;
use crate::limits::MAX_HASH_SIZE;
use crate::protocol::{AeadCipherSuite, BaseHashAlgo};

type Secret = ArrayVec<u8, MAX_HASH_SIZE>;
type TrafficKey = ArrayVec<u8, 32>;
type TrafficIv = ArrayVec<u8, 12>;

fn zeroes(n: usize) -> ArrayVec<u8, MAX_HASH_SIZE> {
    let mut v = ArrayVec::new();
    for _ in 0..n {
        v.push(0);
    }
    v
}

/// One direction's handshake-phase traffic secret, finished key, and AEAD key+IV.
#[derive(Clone, Default)]
pub struct HandshakeDirection {
    pub secret: Secret,
    pub finished_key: Secret,
    pub key: TrafficKey,
    pub iv: TrafficIv,
}

/// One direction's data-phase traffic secret and AEAD key+IV.
#[derive(Clone, Default)]
pub struct DataDirection {
    pub secret: Secret,
    pub key: TrafficKey,
    pub iv: TrafficIv,
}

/// The full set of derived secrets for one session. Handshake secrets are
/// derivable exactly once (at `TH1` time),
/// data secrets exactly once (at `TH2` time); re-deriving either is a logic
/// error the caller must not trigger, enforced here by consuming `self`.
#[derive(Clone, Default)]
pub struct KeySchedule {
    pub handshake_secret: Option<Secret>,
    pub request_handshake: Option<HandshakeDirection>,
    pub response_handshake: Option<HandshakeDirection>,
    pub master_secret: Option<Secret>,
    pub request_data: Option<DataDirection>,
    pub response_data: Option<DataDirection>,
    pub export_master_secret: Option<Secret>,
}

impl KeySchedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive `handshake_secret` and both directions' handshake traffic
    /// material from the DHE shared secret (or PSK) and `TH1`. Fails with
    /// `Error::InvalidParameter` if handshake keys were already derived for
    /// this session; this must only ever run once per session.
    pub fn derive_handshake(
        &mut self,
        crypto: &dyn CryptoProvider,
        hash_algo: BaseHashAlgo,
        aead_suite: AeadCipherSuite,
        shared_secret_or_psk: &[u8],
        th1: &[u8],
    ) -> Result<(), Error> {
        if self.handshake_secret.is_some() {
            return Err(Error::InvalidParameter);
        }
        let hash_size = crypto.hash_size(hash_algo);
        let key_size = crypto.aead_key_size(aead_suite);
        let iv_size = 12;

        let handshake_secret = crypto.hkdf_extract(hash_algo, &zeroes(hash_size), shared_secret_or_psk)?;

        let request_secret = crypto.hkdf_expand_label(hash_algo, &handshake_secret, "req hs data", th1, hash_size)?;
        let response_secret = crypto.hkdf_expand_label(hash_algo, &handshake_secret, "res hs data", th1, hash_size)?;

        let request_finished_key = crypto.hkdf_expand_label(hash_algo, &request_secret, "finished", &[], hash_size)?;
        let response_finished_key = crypto.hkdf_expand_label(hash_algo, &response_secret, "finished", &[], hash_size)?;

        let mut request_key = ArrayVec::new();
        request_key.try_extend_from_slice(&crypto.hkdf_expand_label(hash_algo, &request_secret, "key", &[], key_size)?).unwrap();
        let mut request_iv = ArrayVec::new();
        request_iv.try_extend_from_slice(&crypto.hkdf_expand_label(hash_algo, &request_secret, "iv", &[], iv_size)?).unwrap();
        let mut response_key = ArrayVec::new();
        response_key.try_extend_from_slice(&crypto.hkdf_expand_label(hash_algo, &response_secret, "key", &[], key_size)?).unwrap();
        let mut response_iv = ArrayVec::new();
        response_iv.try_extend_from_slice(&crypto.hkdf_expand_label(hash_algo, &response_secret, "iv", &[], iv_size)?).unwrap();

        self.handshake_secret = Some(handshake_secret);
        self.request_handshake = Some(HandshakeDirection { secret: request_secret, finished_key: request_finished_key, key: request_key, iv: request_iv });
        self.response_handshake =
            Some(HandshakeDirection { secret: response_secret, finished_key: response_finished_key, key: response_key, iv: response_iv });
        Ok(())
    }

    /// Derive `master_secret` and both directions' data traffic material
    /// from `TH2`, once the handshake secret exists. Fails if data keys were
    /// already derived, or if `derive_handshake` has not run yet.
    pub fn derive_data(&mut self, crypto: &dyn CryptoProvider, hash_algo: BaseHashAlgo, aead_suite: AeadCipherSuite, th2: &[u8]) -> Result<(), Error> {
        if self.master_secret.is_some() {
            return Err(Error::InvalidParameter);
        }
        let handshake_secret = self.handshake_secret.as_ref().ok_or(Error::InvalidParameter)?;
        let hash_size = crypto.hash_size(hash_algo);
        let key_size = crypto.aead_key_size(aead_suite);
        let iv_size = 12;

        let master_secret = crypto.hkdf_extract(hash_algo, handshake_secret, &zeroes(hash_size))?;

        let request_secret = crypto.hkdf_expand_label(hash_algo, &master_secret, "req app data", th2, hash_size)?;
        let response_secret = crypto.hkdf_expand_label(hash_algo, &master_secret, "res app data", th2, hash_size)?;
        let export_master_secret = crypto.hkdf_expand_label(hash_algo, &master_secret, "exp master", th2, hash_size)?;

        let mut request_key = ArrayVec::new();
        request_key.try_extend_from_slice(&crypto.hkdf_expand_label(hash_algo, &request_secret, "key", &[], key_size)?).unwrap();
        let mut request_iv = ArrayVec::new();
        request_iv.try_extend_from_slice(&crypto.hkdf_expand_label(hash_algo, &request_secret, "iv", &[], iv_size)?).unwrap();
        let mut response_key = ArrayVec::new();
        response_key.try_extend_from_slice(&crypto.hkdf_expand_label(hash_algo, &response_secret, "key", &[], key_size)?).unwrap();
        let mut response_iv = ArrayVec::new();
        response_iv.try_extend_from_slice(&crypto.hkdf_expand_label(hash_algo, &response_secret, "iv", &[], iv_size)?).unwrap();

        self.master_secret = Some(master_secret);
        self.request_data = Some(DataDirection { secret: request_secret, key: request_key, iv: request_iv });
        self.response_data = Some(DataDirection { secret: response_secret, key: response_key, iv: response_iv });
        self.export_master_secret = Some(export_master_secret);
        Ok(())
    }

    /// Re-derive a direction's data traffic key+IV from a rolled label, for
    /// `KEY_UPDATE`.
    pub fn update_data_key(
        &self,
        crypto: &dyn CryptoProvider,
        hash_algo: BaseHashAlgo,
        aead_suite: AeadCipherSuite,
        requester_direction: bool,
    ) -> Result<DataDirection, Error> {
        let current = if requester_direction { self.request_data.as_ref() } else { self.response_data.as_ref() }.ok_or(Error::InvalidParameter)?;
        let key_size = crypto.aead_key_size(aead_suite);
        let iv_size = 12;
        let hash_size = crypto.hash_size(hash_algo);
        let next_secret = crypto.hkdf_expand_label(hash_algo, &current.secret, "key upd", &[], hash_size)?;
        let mut key = ArrayVec::new();
        key.try_extend_from_slice(&crypto.hkdf_expand_label(hash_algo, &next_secret, "key", &[], key_size)?).unwrap();
        let mut iv = ArrayVec::new();
        iv.try_extend_from_slice(&crypto.hkdf_expand_label(hash_algo, &next_secret, "iv", &[], iv_size)?).unwrap();
        Ok(DataDirection { secret: next_secret, key, iv })
    }
}
