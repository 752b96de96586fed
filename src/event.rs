/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Host-observable event log, compiled out entirely unless `feature =
//! "logging"` is enabled. Mirrors a `LogEvent` + `log!` pattern:
//! production code calls [`log!`] at each protocol milestone and the macro
//! either vanishes or forwards to [`EventSink::event`].

use crate::protocol::RequestResponseCode;

/// A protocol milestone a host may want to observe for debugging or tracing.
///
/// Faults are reported with the raw [`crate::error::Error`] that was about to
/// be returned; an unauthenticated peer can force any of these to fire, so a
/// host should not treat them as trusted telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A request was sent to the transport encoder.
    SentRequest(RequestResponseCode),
    /// A response was received and passed transcript/signature verification.
    ReceivedResponse(RequestResponseCode),
    /// A transcript ledger was reset.
    TranscriptReset(crate::transcript::Ledger),
    /// A session moved to `Handshaking`.
    SessionHandshaking(u32),
    /// A session moved to `Established`.
    SessionEstablished(u32),
    /// A session was freed.
    SessionClosed(u32),
    /// A fault was observed while processing a request or response.
    Fault(crate::error::Error),
}

/// Implemented by the host to receive [`Event`]s. The default impl drops
/// everything, so hosts that don't care about observability pay nothing.
pub trait EventSink {
    fn event(&mut self, _event: Event) {}
}

/// A sink that discards every event; used when the host has none to offer.
impl EventSink for () {}

/// Log a protocol milestone. Compiles to nothing unless `feature = "logging"`.
macro_rules! log {
    ($sink:expr, $event:expr) => {
        #[cfg(feature = "logging")]
        {
            $crate::event::EventSink::event($sink, $event);
        }
    };
}
pub(crate) use log;
