/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Fixed-capacity session table, grounded on the linear-search
//! cache shape of `UnassociatedHandshakeCache` in `handshake_cache.rs`. Half
//! id allocation (`0xFFFF - index`) follows `SpdmAllocateReqSessionId`/
//! `SpdmAllocateRspSessionId` in `SpdmCommonLibContextData.c`.

use crate::buffer::ManagedBuffer;
use crate::error::Error;
use crate::limits::{MAX_MESSAGE_LARGE_SIZE, MAX_SESSION_COUNT};
use crate::protocol::SessionType;
use crate::session::{KeySchedule, SessionState};

/// `MutAuthRequested*` bits negotiated for this session (mirrors the wire
/// flags in `messages::MUT_AUTH_REQUESTED*`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MutAuthFlags {
    pub requested: bool,
    pub with_encap_request: bool,
    pub with_get_digests: bool,
}

/// One session's state: id, PSK/DHE flag, the session-local key-exchange
/// transcript (`MessageK`/`MessageF` — see the note on
/// [`crate::transcript::Ledger`]), and the derived key schedule.
pub struct SessionSlot {
    pub id: u32,
    pub use_psk: bool,
    pub mut_auth: MutAuthFlags,
    pub session_type: SessionType,
    pub state: SessionState,
    pub message_k: ManagedBuffer<MAX_MESSAGE_LARGE_SIZE>,
    pub message_f: ManagedBuffer<MAX_MESSAGE_LARGE_SIZE>,
    pub keys: KeySchedule,
    pub request_sequence: u64,
    pub response_sequence: u64,
}

impl SessionSlot {
    fn free() -> Self {
        Self {
            id: 0,
            use_psk: false,
            mut_auth: MutAuthFlags::default(),
            session_type: SessionType::None,
            state: SessionState::NotStarted,
            message_k: ManagedBuffer::new(),
            message_f: ManagedBuffer::new(),
            keys: KeySchedule::new(),
            request_sequence: 0,
            response_sequence: 0,
        }
    }

    pub fn is_free(&self) -> bool {
        self.id == 0
    }
}

/// `0` is the sentinel "free slot / no session" id.
pub const FREE_SESSION_ID: u32 = 0;

pub struct SessionRegistry {
    slots: [SessionSlot; MAX_SESSION_COUNT],
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self { slots: std::array::from_fn(|_| SessionSlot::free()) }
    }

    /// Allocate a session id by placing `0xFFFF - index` in the requester
    /// (upper) half.
    pub fn allocate_req_half_id(&self) -> Result<u16, Error> {
        let index = self.slots.iter().position(SessionSlot::is_free).ok_or(Error::SessionFull)?;
        Ok(0xFFFFu16.wrapping_sub(index as u16))
    }

    /// Symmetric allocation for the responder (lower) half.
    pub fn allocate_rsp_half_id(&self) -> Result<u16, Error> {
        self.allocate_req_half_id()
    }

    /// Assign `id` to the first free slot. Fails with `SessionDuplicate` if
    /// `id` is already assigned, `SessionFull` if no slot is free.
    pub fn assign(&mut self, id: u32, use_psk: bool) -> Result<&mut SessionSlot, Error> {
        if id == FREE_SESSION_ID {
            return Err(Error::InvalidParameter);
        }
        if self.slots.iter().any(|s| s.id == id) {
            return Err(Error::SessionDuplicate);
        }
        let index = self.slots.iter().position(SessionSlot::is_free).ok_or(Error::SessionFull)?;
        self.slots[index] = SessionSlot::free();
        self.slots[index].id = id;
        self.slots[index].use_psk = use_psk;
        Ok(&mut self.slots[index])
    }

    pub fn lookup(&self, id: u32) -> Result<&SessionSlot, Error> {
        self.slots.iter().find(|s| s.id == id).ok_or(Error::SessionNotFound)
    }

    pub fn lookup_mut(&mut self, id: u32) -> Result<&mut SessionSlot, Error> {
        self.slots.iter_mut().find(|s| s.id == id).ok_or(Error::SessionNotFound)
    }

    /// Reset the slot to free and zero its secured-message context.
    pub fn free(&mut self, id: u32) -> Result<(), Error> {
        let slot = self.slots.iter_mut().find(|s| s.id == id).ok_or(Error::SessionNotFound)?;
        *slot = SessionSlot::free();
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.slots.iter().filter(|s| !s.is_free()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_lookup_free_roundtrip() {
        let mut reg = SessionRegistry::new();
        reg.assign(0x0001_0002, false).unwrap();
        assert!(reg.lookup(0x0001_0002).is_ok());
        reg.free(0x0001_0002).unwrap();
        assert_eq!(reg.lookup(0x0001_0002), Err(Error::SessionNotFound));
    }

    #[test]
    fn assign_duplicate_rejected() {
        let mut reg = SessionRegistry::new();
        reg.assign(5, false).unwrap();
        assert_eq!(reg.assign(5, false).err(), Some(Error::SessionDuplicate));
    }

    #[test]
    fn registry_full_rejects_further_assigns() {
        let mut reg = SessionRegistry::new();
        for i in 1..=MAX_SESSION_COUNT as u32 {
            reg.assign(i, false).unwrap();
        }
        assert_eq!(reg.assign(999, false).err(), Some(Error::SessionFull));
    }

    #[test]
    fn half_id_allocation_matches_formula() {
        let reg = SessionRegistry::new();
        assert_eq!(reg.allocate_req_half_id().unwrap(), 0xFFFF);
    }
}
