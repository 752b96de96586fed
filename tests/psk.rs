/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Drives PSK_EXCHANGE/PSK_FINISH to an established session and a round of
//! secured application data. No certificates or signatures are involved, so
//! this exercises the key schedule and AEAD path independently of the
//! asymmetric-auth flows covered in `handshake.rs`.

mod common;

use common::{negotiated_algorithms_message, new_ctx, LoopbackIo, TaggingTransport, TestCrypto};
use spdm_core::requester::Requester;
use spdm_core::session::secured_messages::ImplicitSequenceCallbacks;

fn provision_psk(ctx: &mut spdm_core::context::EndpointContext) {
    ctx.local.psk_hint.try_extend_from_slice(b"device-psk").unwrap();
    ctx.local.psk_value.try_extend_from_slice(&[0x7A; 32]).unwrap();
}

#[test]
fn psk_handshake_establishes_a_secured_session() {
    let mut req_ctx = new_ctx(None);
    let mut resp_ctx = new_ctx(None);
    provision_psk(&mut req_ctx);
    provision_psk(&mut resp_ctx);
    let mut req_crypto = TestCrypto::new([0u8; 48]);
    let mut resp_crypto = TestCrypto::new([0u8; 48]);
    let mut req_sink = ();
    let mut resp_sink = ();
    let transport = TaggingTransport;

    let mut io = LoopbackIo::new(&mut resp_ctx, &mut resp_crypto, &mut resp_sink);
    let mut requester = Requester {
        ctx: &mut req_ctx,
        crypto: &mut req_crypto,
        io: &mut io,
        transport: &transport,
        sink: &mut req_sink,
        secured_message_callbacks: &ImplicitSequenceCallbacks,
    };

    requester.get_version().unwrap();
    requester.get_capabilities().unwrap();
    requester.negotiate_algorithms(negotiated_algorithms_message()).unwrap();

    let session_id = requester.start_session_psk().unwrap();
    requester.psk_finish(session_id).unwrap();

    let reply = requester.send_receive_data(session_id, b"hello over psk").unwrap();
    assert_eq!(reply, b"hello over psk");

    requester.end_session(session_id).unwrap();
    assert_eq!(resp_ctx.sessions.active_count(), 0);
}

#[test]
fn mismatched_psk_hint_is_rejected() {
    let mut req_ctx = new_ctx(None);
    let mut resp_ctx = new_ctx(None);
    req_ctx.local.psk_hint.try_extend_from_slice(b"wrong-hint").unwrap();
    req_ctx.local.psk_value.try_extend_from_slice(&[0x7A; 32]).unwrap();
    resp_ctx.local.psk_hint.try_extend_from_slice(b"device-psk").unwrap();
    resp_ctx.local.psk_value.try_extend_from_slice(&[0x7A; 32]).unwrap();
    let mut req_crypto = TestCrypto::new([0u8; 48]);
    let mut resp_crypto = TestCrypto::new([0u8; 48]);
    let mut req_sink = ();
    let mut resp_sink = ();
    let transport = TaggingTransport;

    let mut io = LoopbackIo::new(&mut resp_ctx, &mut resp_crypto, &mut resp_sink);
    let mut requester = Requester {
        ctx: &mut req_ctx,
        crypto: &mut req_crypto,
        io: &mut io,
        transport: &transport,
        sink: &mut req_sink,
        secured_message_callbacks: &ImplicitSequenceCallbacks,
    };

    requester.get_version().unwrap();
    requester.get_capabilities().unwrap();
    requester.negotiate_algorithms(negotiated_algorithms_message()).unwrap();

    let err = requester.start_session_psk().unwrap_err();
    assert_eq!(err, spdm_core::Error::DeviceError);
}
