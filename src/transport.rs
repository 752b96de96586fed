/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Collaborator interfaces the host registers: raw I/O and transport
//! framing (MCTP, PCI DOE, ...) are injected rather than built in, via an
//! `ApplicationLayer`-style trait object for everything outside the
//! protocol core itself.

use crate::error::Error;

/// Raw send/receive, analogous to `register_io(send, receive)`.
pub trait DeviceIo {
    fn send_message(&mut self, msg: &[u8], timeout_ms: u32) -> Result<(), Error>;
    /// Receive into `buf`, returning the number of bytes written.
    fn receive_message(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, Error>;
}

/// A decoded transport frame: the session id it was secured under (if any),
/// whether it came from the requester, whether it carries an application
/// payload (vs. an SPDM control message), and the inner SPDM bytes.
pub struct DecodedFrame {
    pub session_id: Option<u32>,
    pub is_requester: bool,
    pub is_app_message: bool,
    pub payload: Vec<u8>,
}

/// Transport framing, analogous to `register_transport(encode, decode)`.
pub trait TransportLayer {
    fn encode(&self, session_id: Option<u32>, is_requester: bool, is_app: bool, spdm_msg: &[u8], out: &mut Vec<u8>) -> Result<(), Error>;
    fn decode(&self, transport_msg: &[u8]) -> Result<DecodedFrame, Error>;
}

/// A transport that does no framing at all: the SPDM message bytes are the
/// wire bytes. Useful for tests and for transports with no envelope of
/// their own.
pub struct IdentityTransport;

impl TransportLayer for IdentityTransport {
    fn encode(&self, _session_id: Option<u32>, _is_requester: bool, _is_app: bool, spdm_msg: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
        out.extend_from_slice(spdm_msg);
        Ok(())
    }

    fn decode(&self, transport_msg: &[u8]) -> Result<DecodedFrame, Error> {
        Ok(DecodedFrame { session_id: None, is_requester: false, is_app_message: false, payload: transport_msg.to_vec() })
    }
}
