/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Session establishment, the key schedule, and the Secured Messages codec.

pub mod key_schedule;
pub mod registry;
pub mod secured_messages;

pub use key_schedule::KeySchedule;
pub use registry::{SessionRegistry, SessionSlot};

/// A session's lifecycle: `NotStarted → Handshaking → Established`; a
/// closed session is freed rather than tracked as a fourth state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Handshaking,
    Established,
}
