/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Drives a full certificate-based handshake between two endpoints wired
//! together by [`common::LoopbackIo`]: version/capability/algorithm
//! negotiation, digest/certificate retrieval, CHALLENGE, KEY_EXCHANGE,
//! FINISH, one round of secured application data, and END_SESSION.

mod common;

use common::{negotiated_algorithms_message, new_ctx, LoopbackIo, TaggingTransport, TestCrypto};
use spdm_core::protocol::MeasurementSummaryHashType;
use spdm_core::requester::Requester;
use spdm_core::session::secured_messages::ImplicitSequenceCallbacks;

const RESPONDER_KEY: [u8; 48] = [0x42; 48];

#[test]
fn full_handshake_establishes_a_secured_session() {
    let mut req_ctx = new_ctx(None);
    let mut resp_ctx = new_ctx(Some(RESPONDER_KEY));
    let mut req_crypto = TestCrypto::new([0u8; 48]);
    let mut resp_crypto = TestCrypto::new(RESPONDER_KEY);
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
    requester.get_digests().unwrap();
    let chain = requester.get_certificate(0).unwrap();
    assert_eq!(chain, RESPONDER_KEY.to_vec());

    let auth = requester.challenge(0, MeasurementSummaryHashType::None).unwrap();
    assert!(!auth.basic_mut_auth_req);

    let session_id = requester.start_session_key_exchange(0, 0).unwrap();
    requester.finish(session_id).unwrap();

    let reply = requester.send_receive_data(session_id, b"ping").unwrap();
    assert_eq!(reply, b"ping");

    requester.end_session(session_id).unwrap();
    assert_eq!(resp_ctx.sessions.active_count(), 0);
}

#[test]
fn challenge_before_certificate_is_rejected() {
    let mut req_ctx = new_ctx(None);
    let mut resp_ctx = new_ctx(Some(RESPONDER_KEY));
    let mut req_crypto = TestCrypto::new([0u8; 48]);
    let mut resp_crypto = TestCrypto::new(RESPONDER_KEY);
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

    let err = requester.challenge(0, MeasurementSummaryHashType::None).unwrap_err();
    assert_eq!(err, spdm_core::Error::DeviceError);
}
