/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! The "general opaque data table" carried inside KEY_EXCHANGE/
//! PSK_EXCHANGE and their responses, grounded on
//! `SpdmBuildOpaqueDataSupportedVersionData` /
//! `SpdmProcessOpaqueDataVersionSelectionData` in
//! `Include/Library/SpdmSecuredMessageLib.h`.

use arrayvec::ArrayVec;

use crate::error::Error;

/// `SpecId = 0x444D5446` ("DMTF" in ASCII), little-endian on the wire.
pub const DMTF_SPEC_ID: u32 = 0x4656_4D44;
pub const OPAQUE_VERSION: u8 = 0x01;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SmDataId {
    VersionSelection = 0x00,
    SupportedVersion = 0x01,
}

const MAX_OPAQUE_SIZE: usize = 128;

/// Build the "supported version" opaque element set a requester sends in
/// KEY_EXCHANGE/PSK_EXCHANGE.
pub fn build_supported_version(versions: &[u8]) -> ArrayVec<u8, MAX_OPAQUE_SIZE> {
    let mut out = ArrayVec::new();
    out.try_extend_from_slice(&DMTF_SPEC_ID.to_le_bytes()).unwrap();
    out.push(OPAQUE_VERSION);
    out.push(1); // element count
    out.push(0); // registry id (DMTF)
    out.push(SmDataId::SupportedVersion as u8);
    out.push(versions.len() as u8);
    out.try_extend_from_slice(versions).unwrap();
    out
}

/// Build the "version selection" opaque element a responder sends back.
pub fn build_version_selection(selected_version: u8) -> ArrayVec<u8, MAX_OPAQUE_SIZE> {
    let mut out = ArrayVec::new();
    out.try_extend_from_slice(&DMTF_SPEC_ID.to_le_bytes()).unwrap();
    out.push(OPAQUE_VERSION);
    out.push(1);
    out.push(0);
    out.push(SmDataId::VersionSelection as u8);
    out.push(1);
    out.push(selected_version);
    out
}

/// Parse a "version selection" opaque blob a requester receives back from
/// KEY_EXCHANGE_RSP/PSK_EXCHANGE_RSP, returning the selected version byte.
pub fn parse_version_selection(data: &[u8]) -> Result<u8, Error> {
    if data.len() < 8 {
        return Err(Error::InvalidParameter);
    }
    let spec_id = u32::from_le_bytes(data[0..4].try_into().unwrap());
    if spec_id != DMTF_SPEC_ID {
        return Err(Error::Unsupported);
    }
    let element_count = data[5];
    if element_count == 0 {
        return Err(Error::InvalidParameter);
    }
    if data[7] != SmDataId::VersionSelection as u8 {
        return Err(Error::Unsupported);
    }
    let len = data[8] as usize;
    if len != 1 || data.len() < 9 + len {
        return Err(Error::InvalidParameter);
    }
    Ok(data[9])
}

/// Parse the "supported version" opaque blob a responder receives in
/// KEY_EXCHANGE/PSK_EXCHANGE, returning the list of offered versions.
pub fn parse_supported_version(data: &[u8]) -> Result<ArrayVec<u8, 16>, Error> {
    if data.len() < 8 {
        return Err(Error::InvalidParameter);
    }
    let spec_id = u32::from_le_bytes(data[0..4].try_into().unwrap());
    if spec_id != DMTF_SPEC_ID {
        return Err(Error::Unsupported);
    }
    if data[7] != SmDataId::SupportedVersion as u8 {
        return Err(Error::Unsupported);
    }
    let len = data[8] as usize;
    if data.len() < 9 + len {
        return Err(Error::InvalidParameter);
    }
    let mut out = ArrayVec::new();
    out.try_extend_from_slice(&data[9..9 + len])
        .map_err(|_| Error::BufferOverflow)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_selection_roundtrip() {
        let built = build_version_selection(0x11);
        let parsed = parse_version_selection(&built).unwrap();
        assert_eq!(parsed, 0x11);
    }

    #[test]
    fn supported_version_roundtrip() {
        let built = build_supported_version(&[0x10, 0x11]);
        let parsed = parse_supported_version(&built).unwrap();
        assert_eq!(parsed.as_slice(), &[0x10, 0x11]);
    }

    #[test]
    fn rejects_wrong_spec_id() {
        let mut bad = build_version_selection(0x11);
        bad[0] ^= 0xFF;
        assert_eq!(parse_version_selection(&bad), Err(Error::Unsupported));
    }
}
