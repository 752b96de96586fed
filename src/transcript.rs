/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The nine append-only transcript ledgers, grouped behind
//! a small indexed table rather than nine distinct
//! struct fields, so a future protocol revision can add a ledger without an
//! intrusive change. Grounded on `SpdmCalculateTHCurrAK`/
//! `SpdmCalculateTHCurrAKF` in `SpdmCommonLibCryptoService.c` for the exact
//! concatenation order used by `th_for_signing_ak`/`th_for_signing_akf`.

use crate::buffer::ManagedBuffer;
use crate::crypto::CryptoProvider;
use crate::error::Error;
use crate::limits::{MAX_MESSAGE_LARGE_SIZE, MAX_MESSAGE_SMALL_SIZE};
use crate::protocol::BaseHashAlgo;

/// One of the seven endpoint-scoped transcript ledgers. `MessageK` and
/// `MessageF` complete the nine total but are scoped to a single
/// session rather than the endpoint (a second, concurrent session must not
/// share a key-exchange transcript with the first) — they live in
/// [`crate::session::registry::SessionSlot`] as plain managed buffers
/// instead of in this table, and `th_for_signing_ak`/`th_for_signing_akf`
/// below take them as explicit parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Ledger {
    A,
    B,
    C,
    MutB,
    MutC,
    M1M2,
    L1L2,
}

const LEDGER_COUNT: usize = 7;
const LEDGER_ORDER: [Ledger; LEDGER_COUNT] = [Ledger::A, Ledger::B, Ledger::C, Ledger::MutB, Ledger::MutC, Ledger::M1M2, Ledger::L1L2];

fn small(ledger: Ledger) -> bool {
    matches!(ledger, Ledger::A | Ledger::C | Ledger::MutC)
}

/// A ledger's storage is either the "small" or "large" capacity; both are
/// `ManagedBuffer`s, just sized differently.
enum Slot {
    Small(ManagedBuffer<MAX_MESSAGE_SMALL_SIZE>),
    Large(ManagedBuffer<MAX_MESSAGE_LARGE_SIZE>),
}

impl Slot {
    fn append(&mut self, bytes: &[u8]) -> Result<(), Error> {
        match self {
            Slot::Small(b) => b.append(bytes),
            Slot::Large(b) => b.append(bytes),
        }
    }

    fn reset(&mut self) {
        match self {
            Slot::Small(b) => b.reset(),
            Slot::Large(b) => b.reset(),
        }
    }

    fn data(&self) -> &[u8] {
        match self {
            Slot::Small(b) => b.data(),
            Slot::Large(b) => b.data(),
        }
    }
}

/// Owns all nine ledgers for one endpoint (or one session slot, for
/// MessageK/MessageF — see `session::registry::SessionSlot`).
pub struct TranscriptManager {
    slots: [Slot; LEDGER_COUNT],
}

impl Default for TranscriptManager {
    fn default() -> Self {
        Self::new()
    }
}

fn index_of(ledger: Ledger) -> usize {
    LEDGER_ORDER.iter().position(|&l| l == ledger).expect("all ledgers listed")
}

impl TranscriptManager {
    pub fn new() -> Self {
        let slots = LEDGER_ORDER.map(|l| if small(l) { Slot::Small(ManagedBuffer::new()) } else { Slot::Large(ManagedBuffer::new()) });
        Self { slots }
    }

    pub fn append(&mut self, ledger: Ledger, bytes: &[u8]) -> Result<(), Error> {
        self.slots[index_of(ledger)].append(bytes)
    }

    pub fn reset(&mut self, ledger: Ledger) {
        self.slots[index_of(ledger)].reset();
    }

    pub fn snapshot_bytes(&self, ledger: Ledger) -> &[u8] {
        self.slots[index_of(ledger)].data()
    }

    /// Responder view: A||B||C. Requester (encap mutual-auth) view: A||MutB||MutC.
    pub fn build_m1m2(&self, is_requester: bool) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(self.snapshot_bytes(Ledger::A));
        if is_requester {
            out.extend_from_slice(self.snapshot_bytes(Ledger::MutB));
            out.extend_from_slice(self.snapshot_bytes(Ledger::MutC));
        } else {
            out.extend_from_slice(self.snapshot_bytes(Ledger::B));
            out.extend_from_slice(self.snapshot_bytes(Ledger::C));
        }
        out
    }

    pub fn build_l1l2(&self) -> &[u8] {
        self.snapshot_bytes(Ledger::L1L2)
    }

    /// `A || H(cert_chain) || MessageK`, used both to build `TH1` and as the
    /// message the responder's KEY_EXCHANGE_RSP signature covers. `MessageK`
    /// is the session's key-exchange transcript, not one of this table's
    /// ledgers — see the note on [`Ledger`].
    pub fn th_for_signing_ak(
        &self,
        crypto: &dyn CryptoProvider,
        hash_algo: BaseHashAlgo,
        cert_chain: Option<&[u8]>,
        message_k: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        out.extend_from_slice(self.snapshot_bytes(Ledger::A));
        if let Some(cert) = cert_chain {
            out.extend_from_slice(&crypto.hash_all(hash_algo, cert)?);
        }
        out.extend_from_slice(message_k);
        Ok(out)
    }

    /// `A || H(local_cert) || MessageK || H(peer_mut_cert) || MessageF`.
    /// Either cert hash is omitted for PSK or when mutual auth did not run.
    #[allow(clippy::too_many_arguments)]
    pub fn th_for_signing_akf(
        &self,
        crypto: &dyn CryptoProvider,
        hash_algo: BaseHashAlgo,
        local_cert: Option<&[u8]>,
        message_k: &[u8],
        peer_mut_cert: Option<&[u8]>,
        message_f: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        out.extend_from_slice(self.snapshot_bytes(Ledger::A));
        if let Some(cert) = local_cert {
            out.extend_from_slice(&crypto.hash_all(hash_algo, cert)?);
        }
        out.extend_from_slice(message_k);
        if let Some(cert) = peer_mut_cert {
            out.extend_from_slice(&crypto.hash_all(hash_algo, cert)?);
        }
        out.extend_from_slice(message_f);
        Ok(out)
    }

    /// `TH1 = H(th_for_signing_ak(...))`, computed once the key-exchange
    /// transcript is complete (before FINISH).
    pub fn th1(&self, crypto: &dyn CryptoProvider, hash_algo: BaseHashAlgo, local_cert: Option<&[u8]>, message_k: &[u8]) -> Result<Vec<u8>, Error> {
        let th = self.th_for_signing_ak(crypto, hash_algo, local_cert, message_k)?;
        Ok(crypto.hash_all(hash_algo, &th)?.to_vec())
    }

    /// `TH2 = H(th_for_signing_akf(...))`.
    #[allow(clippy::too_many_arguments)]
    pub fn th2(
        &self,
        crypto: &dyn CryptoProvider,
        hash_algo: BaseHashAlgo,
        local_cert: Option<&[u8]>,
        message_k: &[u8],
        peer_mut_cert: Option<&[u8]>,
        message_f: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let th = self.th_for_signing_akf(crypto, hash_algo, local_cert, message_k, peer_mut_cert, message_f)?;
        Ok(crypto.hash_all(hash_algo, &th)?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_reset_roundtrip() {
        let mut t = TranscriptManager::new();
        t.append(Ledger::A, b"hello").unwrap();
        t.append(Ledger::A, b" world").unwrap();
        assert_eq!(t.snapshot_bytes(Ledger::A), b"hello world");
        t.reset(Ledger::A);
        assert_eq!(t.snapshot_bytes(Ledger::A).len(), 0);
    }

    #[test]
    fn ledgers_are_independent() {
        let mut t = TranscriptManager::new();
        t.append(Ledger::A, b"a").unwrap();
        t.append(Ledger::B, b"b").unwrap();
        assert_eq!(t.snapshot_bytes(Ledger::A), b"a");
        assert_eq!(t.snapshot_bytes(Ledger::B), b"b");
    }

    #[test]
    fn build_m1m2_responder_vs_requester() {
        let mut t = TranscriptManager::new();
        t.append(Ledger::A, b"A").unwrap();
        t.append(Ledger::B, b"B").unwrap();
        t.append(Ledger::C, b"C").unwrap();
        t.append(Ledger::MutB, b"X").unwrap();
        t.append(Ledger::MutC, b"Y").unwrap();
        assert_eq!(t.build_m1m2(false), b"ABC");
        assert_eq!(t.build_m1m2(true), b"AXY");
    }
}
