/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The host-supplied crypto capability surface, grounded on the
//! `P384PublicKey`/`P384KeyPair` trait split in `crypto/p384.rs`: the host
//! owns key material and RNG, this crate only calls through trait objects.
//! The negotiated algorithm is chosen at runtime, once NEGOTIATE_ALGORITHMS
//! completes, so each method takes an algorithm selector instead of being
//! generic over a single fixed suite.

use arrayvec::ArrayVec;

use crate::error::Error;
use crate::limits::{MAX_ASYM_SIGNATURE_SIZE, MAX_DHE_EXCHANGE_SIZE, MAX_HASH_SIZE};
use crate::protocol::{BaseAsymAlgo, BaseHashAlgo, DheNamedGroup, AeadCipherSuite};

pub type Digest = ArrayVec<u8, MAX_HASH_SIZE>;
pub type Signature = ArrayVec<u8, MAX_ASYM_SIGNATURE_SIZE>;
pub type DheExchange = ArrayVec<u8, MAX_DHE_EXCHANGE_SIZE>;

/// A single DHE key exchange in progress (ephemeral private material the
/// host must not expose, matching `P384KeyPair::agree`'s design: the secret
/// never leaves the trait object).
pub trait DheSecret {
    /// Raw public value to put on the wire (`exchange_data`).
    fn public_bytes(&self) -> DheExchange;
    /// Perform the agreement against the peer's public value, returning the
    /// raw (un-hashed) shared secret. `false`/`Err` if `peer_public` is not a
    /// valid point for the negotiated group.
    fn agree(&self, peer_public: &[u8]) -> Result<ArrayVec<u8, MAX_DHE_EXCHANGE_SIZE>, Error>;
}

/// Everything this crate needs from the host's cryptography stack. The host
/// implements this once against whatever library it trusts (a hardware
/// root of trust, an HSM, or the bundled `default-impl` software backend)
/// and the protocol state machines never touch a primitive directly.
pub trait CryptoProvider {
    /// RNG used for nonces and ephemeral DHE keys. Must be a CSPRNG.
    fn random(&mut self, out: &mut [u8]) -> Result<(), Error>;

    fn hash_size(&self, algo: BaseHashAlgo) -> usize {
        match algo {
            BaseHashAlgo::Sha256 => 32,
            BaseHashAlgo::Sha384 => 48,
            BaseHashAlgo::Sha512 => 64,
        }
    }

    /// One-shot digest of `data` under `algo`.
    fn hash_all(&self, algo: BaseHashAlgo, data: &[u8]) -> Result<Digest, Error>;

    /// HMAC(`key`, `data`) under `algo`'s hash function.
    fn hmac_all(&self, algo: BaseHashAlgo, key: &[u8], data: &[u8]) -> Result<Digest, Error>;

    /// HKDF-Extract(salt=`salt`, ikm=`ikm`).
    fn hkdf_extract(&self, algo: BaseHashAlgo, salt: &[u8], ikm: &[u8]) -> Result<Digest, Error>;

    /// HKDF-Expand-Label (`"spdm " || label`, bound to `context`), producing
    /// `out_len` bytes.
    fn hkdf_expand_label(
        &self,
        algo: BaseHashAlgo,
        prk: &[u8],
        label: &str,
        context: &[u8],
        out_len: usize,
    ) -> Result<ArrayVec<u8, MAX_HASH_SIZE>, Error>;

    /// Start a fresh ephemeral DHE exchange for `group`.
    fn dhe_generate(&mut self, group: DheNamedGroup) -> Result<Box<dyn DheSecret>, Error>;

    fn aead_key_size(&self, suite: AeadCipherSuite) -> usize {
        match suite {
            AeadCipherSuite::Aes128Gcm => 16,
            AeadCipherSuite::Aes256Gcm => 32,
            AeadCipherSuite::ChaCha20Poly1305 => 32,
        }
    }

    /// Seal `plaintext` in place, appending the tag. `out` must have room
    /// for `plaintext.len() + tag_size`.
    fn aead_seal(
        &self,
        suite: AeadCipherSuite,
        key: &[u8],
        iv: &[u8],
        aad: &[u8],
        plaintext: &[u8],
        out: &mut [u8],
    ) -> Result<(), Error>;

    /// Open `ciphertext` (tag included) into `out`, which must have room for
    /// `ciphertext.len() - tag_size`. Returns `Error::SecurityViolation` on
    /// tag mismatch without distinguishing it from a parse failure.
    fn aead_open(
        &self,
        suite: AeadCipherSuite,
        key: &[u8],
        iv: &[u8],
        aad: &[u8],
        ciphertext: &[u8],
        out: &mut [u8],
    ) -> Result<(), Error>;

    fn asym_signature_size(&self, algo: BaseAsymAlgo) -> usize {
        match algo {
            BaseAsymAlgo::RsaSsa2048 => 256,
            BaseAsymAlgo::RsaSsa3072 => 384,
            BaseAsymAlgo::RsaSsa4096 => 512,
            BaseAsymAlgo::EcdsaP256 => 64,
            BaseAsymAlgo::EcdsaP384 => 96,
        }
    }

    /// Sign `message` with the local endpoint's own private key (used by a
    /// requester doing mutual auth, or a responder answering CHALLENGE).
    fn asym_sign(&self, algo: BaseAsymAlgo, message: &[u8]) -> Result<Signature, Error>;

    /// Verify `signature` over `message` against the leaf public key
    /// extracted from `cert_chain` (the whole DER chain as received on the
    /// wire; the provider is responsible for walking to the leaf).
    fn asym_verify(&self, algo: BaseAsymAlgo, cert_chain: &[u8], message: &[u8], signature: &[u8]) -> Result<(), Error>;

    /// Validate `cert_chain` against the provider's trust anchors, and
    /// return the SHA digest (per `algo`) the responder/requester should
    /// compare against a received `cert_chain_hash`.
    fn x509_verify_chain(&self, algo: BaseHashAlgo, cert_chain: &[u8]) -> Result<Digest, Error>;
}

#[cfg(feature = "default-impl")]
pub mod default_impl {
    //! Pure-software [`CryptoProvider`] built on `sha2`/`hmac`/`aes-gcm`/
    //! `p384`, gated behind the `default-impl` feature the same way the
    //! underlying `sha2`/`hmac`/`aes-gcm` backends are gated.

    use super::*;
    use aes_gcm::aead::{Aead, KeyInit, Payload};
    use aes_gcm::{Aes128Gcm, Aes256Gcm, Nonce};
    use hmac::{Hmac, Mac};
    use p384::ecdh::EphemeralSecret;
    use p384::PublicKey;
    use rand_core::{CryptoRng, RngCore};
    use sha2::{Digest as _, Sha256, Sha384, Sha512};

    /// Software-only [`CryptoProvider`]. Does not implement asym sign/verify
    /// or X.509 chain walking (those need a certificate library this crate
    /// does not carry); callers that need auth verbs must supply their own
    /// provider for those two methods.
    pub struct SoftwareCryptoProvider<R: RngCore + CryptoRng> {
        pub rng: R,
    }

    impl<R: RngCore + CryptoRng> SoftwareCryptoProvider<R> {
        pub fn new(rng: R) -> Self {
            Self { rng }
        }
    }

    fn hash_bytes(algo: BaseHashAlgo, data: &[u8]) -> ArrayVec<u8, MAX_HASH_SIZE> {
        let mut out = ArrayVec::new();
        match algo {
            BaseHashAlgo::Sha256 => out.try_extend_from_slice(&Sha256::digest(data)).unwrap(),
            BaseHashAlgo::Sha384 => out.try_extend_from_slice(&Sha384::digest(data)).unwrap(),
            BaseHashAlgo::Sha512 => out.try_extend_from_slice(&Sha512::digest(data)).unwrap(),
        }
        out
    }

    fn hmac_bytes(algo: BaseHashAlgo, key: &[u8], data: &[u8]) -> Result<ArrayVec<u8, MAX_HASH_SIZE>, Error> {
        let mut out = ArrayVec::new();
        match algo {
            BaseHashAlgo::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(|_| Error::InvalidParameter)?;
                mac.update(data);
                out.try_extend_from_slice(&mac.finalize().into_bytes()).unwrap();
            }
            BaseHashAlgo::Sha384 => {
                let mut mac = Hmac::<Sha384>::new_from_slice(key).map_err(|_| Error::InvalidParameter)?;
                mac.update(data);
                out.try_extend_from_slice(&mac.finalize().into_bytes()).unwrap();
            }
            BaseHashAlgo::Sha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(key).map_err(|_| Error::InvalidParameter)?;
                mac.update(data);
                out.try_extend_from_slice(&mac.finalize().into_bytes()).unwrap();
            }
        }
        Ok(out)
    }

    struct P384Dhe {
        secret: EphemeralSecret,
        public_bytes: DheExchange,
    }

    impl DheSecret for P384Dhe {
        fn public_bytes(&self) -> DheExchange {
            self.public_bytes.clone()
        }

        fn agree(&self, peer_public: &[u8]) -> Result<ArrayVec<u8, MAX_DHE_EXCHANGE_SIZE>, Error> {
            let peer = PublicKey::from_sec1_bytes(peer_public).map_err(|_| Error::SecurityViolation)?;
            let shared = self.secret.diffie_hellman(&peer);
            let mut out = ArrayVec::new();
            out.try_extend_from_slice(shared.raw_secret_bytes()).map_err(|_| Error::BufferOverflow)?;
            Ok(out)
        }
    }

    impl<R: RngCore + CryptoRng> CryptoProvider for SoftwareCryptoProvider<R> {
        fn random(&mut self, out: &mut [u8]) -> Result<(), Error> {
            self.rng.fill_bytes(out);
            Ok(())
        }

        fn hash_all(&self, algo: BaseHashAlgo, data: &[u8]) -> Result<Digest, Error> {
            Ok(hash_bytes(algo, data))
        }

        fn hmac_all(&self, algo: BaseHashAlgo, key: &[u8], data: &[u8]) -> Result<Digest, Error> {
            hmac_bytes(algo, key, data)
        }

        fn hkdf_extract(&self, algo: BaseHashAlgo, salt: &[u8], ikm: &[u8]) -> Result<Digest, Error> {
            // HKDF-Extract is HMAC(salt, ikm); a zero-length salt becomes a
            // zero key of the hash's block size, per RFC 5869 §2.2.
            if salt.is_empty() {
                let zero_key = [0u8; 64];
                hmac_bytes(algo, &zero_key[..self.hash_size(algo)], ikm)
            } else {
                hmac_bytes(algo, salt, ikm)
            }
        }

        fn hkdf_expand_label(
            &self,
            algo: BaseHashAlgo,
            prk: &[u8],
            label: &str,
            context: &[u8],
            out_len: usize,
        ) -> Result<ArrayVec<u8, MAX_HASH_SIZE>, Error> {
            if out_len > MAX_HASH_SIZE {
                return Err(Error::InvalidParameter);
            }
            let hash_size = self.hash_size(algo);
            let mut info = Vec::with_capacity(2 + 1 + 5 + label.len() + 1 + context.len());
            info.extend_from_slice(&(out_len as u16).to_le_bytes());
            let full_label = format!("spdm {label}");
            info.push(full_label.len() as u8);
            info.extend_from_slice(full_label.as_bytes());
            info.push(context.len() as u8);
            info.extend_from_slice(context);

            let mut out = ArrayVec::new();
            let mut t = ArrayVec::<u8, MAX_HASH_SIZE>::new();
            let mut counter: u8 = 1;
            while out.len() < out_len {
                let mut block = t.to_vec();
                block.extend_from_slice(&info);
                block.push(counter);
                let next = hmac_bytes(algo, prk, &block)?;
                t = next;
                let take = (out_len - out.len()).min(hash_size);
                out.try_extend_from_slice(&t[..take]).map_err(|_| Error::BufferOverflow)?;
                counter = counter.checked_add(1).ok_or(Error::InvalidParameter)?;
            }
            Ok(out)
        }

        fn dhe_generate(&mut self, group: DheNamedGroup) -> Result<Box<dyn DheSecret>, Error> {
            match group {
                DheNamedGroup::SecP384R1 => {
                    let secret = EphemeralSecret::random(&mut self.rng);
                    let public = p384::EncodedPoint::from(secret.public_key());
                    let mut public_bytes = ArrayVec::new();
                    public_bytes.try_extend_from_slice(public.as_bytes()).map_err(|_| Error::BufferOverflow)?;
                    Ok(Box::new(P384Dhe { secret, public_bytes }))
                }
                _ => Err(Error::Unsupported),
            }
        }

        fn aead_seal(
            &self,
            suite: AeadCipherSuite,
            key: &[u8],
            iv: &[u8],
            aad: &[u8],
            plaintext: &[u8],
            out: &mut [u8],
        ) -> Result<(), Error> {
            let ciphertext = match suite {
                AeadCipherSuite::Aes128Gcm => {
                    let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| Error::InvalidParameter)?;
                    cipher
                        .encrypt(Nonce::from_slice(iv), Payload { msg: plaintext, aad })
                        .map_err(|_| Error::SecurityViolation)?
                }
                AeadCipherSuite::Aes256Gcm => {
                    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| Error::InvalidParameter)?;
                    cipher
                        .encrypt(Nonce::from_slice(iv), Payload { msg: plaintext, aad })
                        .map_err(|_| Error::SecurityViolation)?
                }
                AeadCipherSuite::ChaCha20Poly1305 => return Err(Error::Unsupported),
            };
            if out.len() != ciphertext.len() {
                return Err(Error::InvalidParameter);
            }
            out.copy_from_slice(&ciphertext);
            Ok(())
        }

        fn aead_open(
            &self,
            suite: AeadCipherSuite,
            key: &[u8],
            iv: &[u8],
            aad: &[u8],
            ciphertext: &[u8],
            out: &mut [u8],
        ) -> Result<(), Error> {
            let plaintext = match suite {
                AeadCipherSuite::Aes128Gcm => {
                    let cipher = Aes128Gcm::new_from_slice(key).map_err(|_| Error::InvalidParameter)?;
                    cipher
                        .decrypt(Nonce::from_slice(iv), Payload { msg: ciphertext, aad })
                        .map_err(|_| crate::error::decrypt_failed())?
                }
                AeadCipherSuite::Aes256Gcm => {
                    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| Error::InvalidParameter)?;
                    cipher
                        .decrypt(Nonce::from_slice(iv), Payload { msg: ciphertext, aad })
                        .map_err(|_| crate::error::decrypt_failed())?
                }
                AeadCipherSuite::ChaCha20Poly1305 => return Err(Error::Unsupported),
            };
            if out.len() != plaintext.len() {
                return Err(crate::error::decrypt_failed());
            }
            out.copy_from_slice(&plaintext);
            Ok(())
        }

        fn asym_sign(&self, _algo: BaseAsymAlgo, _message: &[u8]) -> Result<Signature, Error> {
            Err(Error::Unsupported)
        }

        fn asym_verify(&self, _algo: BaseAsymAlgo, _cert_chain: &[u8], _message: &[u8], _signature: &[u8]) -> Result<(), Error> {
            Err(Error::Unsupported)
        }

        fn x509_verify_chain(&self, _algo: BaseHashAlgo, _cert_chain: &[u8]) -> Result<Digest, Error> {
            Err(Error::Unsupported)
        }
    }
}
