/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! A `no_std`-friendly-in-spirit (but currently `std`-using) core
//! implementation of an SPDM-style device authentication, attestation, and
//! session-establishment endpoint.
//!
//! The host embeds [`context::EndpointContext`], implements
//! [`crypto::CryptoProvider`] and [`transport::TransportLayer`]/
//! [`transport::DeviceIo`] against its platform, and drives the protocol
//! through [`requester::Requester`] or [`responder::Responder`] depending on
//! which role this endpoint plays. Everything here is single-threaded and
//! allocation-light: transcripts and certificate buffers are fixed-capacity
//! (see [`limits`]), and the crate never spawns a task or holds a lock.

pub mod buffer;
pub mod context;
pub mod crypto;
pub mod encap;
pub mod error;
pub mod event;
pub mod limits;
pub mod protocol;
pub mod requester;
pub mod responder;
pub mod session;
pub mod transcript;
pub mod transport;

pub use context::EndpointContext;
pub use error::{Error, Result};
pub use requester::Requester;
pub use responder::Responder;
