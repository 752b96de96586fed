/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Negotiated algorithm identifiers, cached on the connection once
//! NEGOTIATE_ALGORITHMS completes. Each enum corresponds to one selector
//! field on that exchange.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseHashAlgo {
    Sha256,
    Sha384,
    Sha512,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MeasurementHashAlgo {
    RawBitstream,
    Sha256,
    Sha384,
    Sha512,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BaseAsymAlgo {
    RsaSsa2048,
    RsaSsa3072,
    RsaSsa4096,
    EcdsaP256,
    EcdsaP384,
}

/// Requester-side signing algorithm, mirrors [`BaseAsymAlgo`].
pub type ReqBaseAsymAlg = BaseAsymAlgo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DheNamedGroup {
    Ffdhe2048,
    Ffdhe3072,
    Ffdhe4096,
    SecP256R1,
    SecP384R1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AeadCipherSuite {
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyScheduleAlgo {
    SpdmKeySchedule,
}

/// The full negotiated algorithm set recorded in `connection.algorithm`
/// once NEGOTIATE_ALGORITHMS completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedAlgorithms {
    pub measurement_hash: MeasurementHashAlgo,
    pub base_hash: BaseHashAlgo,
    pub base_asym: BaseAsymAlgo,
    pub req_base_asym: ReqBaseAsymAlg,
    pub dhe_group: DheNamedGroup,
    pub aead_suite: AeadCipherSuite,
    pub key_schedule: KeyScheduleAlgo,
}

impl NegotiatedAlgorithms {
    pub const fn hash_size(&self) -> usize {
        match self.base_hash {
            BaseHashAlgo::Sha256 => 32,
            BaseHashAlgo::Sha384 => 48,
            BaseHashAlgo::Sha512 => 64,
        }
    }

    pub const fn aead_key_size(&self) -> usize {
        match self.aead_suite {
            AeadCipherSuite::Aes128Gcm => 16,
            AeadCipherSuite::Aes256Gcm => 32,
            AeadCipherSuite::ChaCha20Poly1305 => 32,
        }
    }

    pub const fn aead_iv_size(&self) -> usize {
        12
    }

    pub const fn aead_tag_size(&self) -> usize {
        16
    }

    /// Wire size of the DHE `exchange_data` field for the negotiated group.
    pub const fn dhe_exchange_size(&self) -> usize {
        match self.dhe_group {
            DheNamedGroup::Ffdhe2048 => 256,
            DheNamedGroup::Ffdhe3072 => 384,
            DheNamedGroup::Ffdhe4096 => 512,
            DheNamedGroup::SecP256R1 => 65,
            DheNamedGroup::SecP384R1 => 97,
        }
    }
}
