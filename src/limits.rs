/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Compile-time maxima, mirroring the `#define MAX_SPDM_*`
//! constants in `SpdmCommonLibInternal.h`.

/// Number of concurrent sessions an endpoint can track.
pub const MAX_SESSION_COUNT: usize = 4;
/// Number of certificate chain slots an endpoint can provision (slots 0..7).
pub const MAX_SLOT_COUNT: usize = 8;
/// Upper bound on a provisioned or received certificate chain.
pub const MAX_CERT_CHAIN_SIZE: usize = 65536;
/// Cap for the "small" transcript ledgers (A, C, MutC).
pub const MAX_MESSAGE_SMALL_SIZE: usize = 4096;
/// Cap for the "large" transcript ledgers (B, MutB, M1M2, L1L2, MessageK, MessageF).
pub const MAX_MESSAGE_LARGE_SIZE: usize = 65536;
/// Cap for a provisioned PSK hint.
pub const MAX_PSK_HINT_SIZE: usize = 32;
/// Cap for a single measurement record.
pub const MAX_MEASUREMENT_RECORD_SIZE: usize = 4096;
/// Largest digest any supported base hash algorithm can produce.
pub const MAX_HASH_SIZE: usize = 64;
/// Largest signature any supported asym algorithm can produce.
pub const MAX_ASYM_SIGNATURE_SIZE: usize = 136;
/// Largest raw ECDH/DHE exchange value.
pub const MAX_DHE_EXCHANGE_SIZE: usize = 512;
/// Default bound on request retries when the peer reports Busy/NotReady.
pub const DEFAULT_RETRY_TIMES: u8 = 3;
/// `0xFF` means "use the provisioned full peer chain" rather than a single slot.
pub const SLOT_ID_PROVISIONED_CHAIN: u8 = 0xFF;
/// Number of measurement blocks an endpoint can hold locally.
pub const MAX_MEASUREMENT_BLOCK_COUNT: usize = 16;
/// Cap on a single measurement block's encoded wire size.
pub const MAX_MEASUREMENT_BLOCK_SIZE: usize = 256;

/// Turns a slot index into its bit in a `DIGESTS`/`CHALLENGE_AUTH` slot mask.
/// `SLOT_ID_PROVISIONED_CHAIN` and any other out-of-range value have no bit
/// of their own in an 8-slot mask and map to `0` rather than wrapping onto a
/// real slot's bit or overflowing the shift.
pub fn slot_mask_bit(slot: u8) -> u8 {
    if (slot as usize) < MAX_SLOT_COUNT {
        1u8 << slot
    } else {
        0
    }
}
