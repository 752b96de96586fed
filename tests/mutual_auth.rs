/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Drives a CHALLENGE that asks for encapsulated mutual authentication: the
//! outer responder tunnels its own GET_DIGESTS/GET_CERTIFICATE/CHALLENGE
//! back at the requester via GET_ENCAPSULATED_REQUEST, and the requester
//! answers against its own provisioned identity before the outer CHALLENGE
//! call returns.

mod common;

use common::{negotiated_algorithms_message, new_ctx, LoopbackIo, TaggingTransport, TestCrypto};
use spdm_core::protocol::{ConnectionState, MeasurementSummaryHashType};
use spdm_core::requester::Requester;
use spdm_core::session::secured_messages::ImplicitSequenceCallbacks;

const RESPONDER_KEY: [u8; 48] = [0x42; 48];
const REQUESTER_KEY: [u8; 48] = [0x17; 48];

#[test]
fn challenge_with_mutual_auth_authenticates_both_directions() {
    let mut req_ctx = new_ctx(Some(REQUESTER_KEY));
    let mut resp_ctx = new_ctx(Some(RESPONDER_KEY));
    resp_ctx.local.basic_mut_auth_required = true;
    let mut req_crypto = TestCrypto::new(REQUESTER_KEY);
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
    assert!(auth.basic_mut_auth_req);
    assert_eq!(req_ctx.connection.state.get(), ConnectionState::Authenticated);

    // The encapsulated dialogue ran to completion on both sides: neither
    // endpoint is left mid-dialogue, and the responder reassembled the
    // requester's own certificate chain along the way.
    assert!(!req_ctx.encap_context.in_progress);
    assert!(!resp_ctx.encap_context.in_progress);
    assert_eq!(resp_ctx.encap_context.cert_chain_buffer.as_slice(), &REQUESTER_KEY[..]);
}

#[test]
fn mutual_auth_rejected_without_requester_capability() {
    let mut req_ctx = new_ctx(Some(REQUESTER_KEY));
    req_ctx.local.capability_flags = spdm_core::protocol::CapabilityFlags(
        req_ctx.local.capability_flags.0 & !spdm_core::protocol::CapabilityFlags::MUT_AUTH_CAP,
    );
    let mut resp_ctx = new_ctx(Some(RESPONDER_KEY));
    resp_ctx.local.basic_mut_auth_required = true;
    let mut req_crypto = TestCrypto::new(REQUESTER_KEY);
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
    requester.get_certificate(0).unwrap();

    let err = requester.challenge(0, MeasurementSummaryHashType::None).unwrap_err();
    assert_eq!(err, spdm_core::Error::DeviceError);
}
