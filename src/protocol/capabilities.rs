/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! GET_CAPABILITIES flag bits, kept as a raw bitset the way the original C
//! context stores `LocalContext.Capability.Flags`/`ConnectionInfo.Capability
//! .Flags` as a plain `UINT32`.

/// Bitset of CAPABILITIES flags. Stored as a `u32` (not an enum) because the
/// wire field is a freely combinable flag set, matching `SpdmSetData`'s
/// handling of `SpdmDataCapabilityFlags` as an opaque `UINT32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilityFlags(pub u32);

impl CapabilityFlags {
    pub const CACHE_CAP: u32 = 1 << 0;
    pub const CERT_CAP: u32 = 1 << 1;
    pub const CHAL_CAP: u32 = 1 << 2;
    pub const MEAS_CAP_NO_SIG: u32 = 1 << 3;
    pub const MEAS_CAP_SIG: u32 = 1 << 4;
    pub const MEAS_FRESH_CAP: u32 = 1 << 5;
    pub const ENCRYPT_CAP: u32 = 1 << 6;
    pub const MAC_CAP: u32 = 1 << 7;
    pub const MUT_AUTH_CAP: u32 = 1 << 8;
    pub const KEY_EX_CAP: u32 = 1 << 9;
    pub const PSK_CAP: u32 = 1 << 10;
    pub const ENCAP_CAP: u32 = 1 << 11;
    pub const HBEAT_CAP: u32 = 1 << 12;
    pub const KEY_UPD_CAP: u32 = 1 << 13;
    pub const HANDSHAKE_IN_THE_CLEAR_CAP: u32 = 1 << 14;

    pub const fn has(&self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    pub const fn intersection(&self, other: CapabilityFlags) -> CapabilityFlags {
        CapabilityFlags(self.0 & other.0)
    }
}
