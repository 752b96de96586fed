/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
use std::fmt;

/// Every way a call into this crate can fail.
///
/// Per the propagation policy: `SecurityViolation` is never retried silently
/// and is fatal to the session (and, for the core auth verbs, to the
/// connection). `NotReady` is the only variant a caller should retry
/// automatically, bounded by `retry_times`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Caller supplied the wrong size, wrong location, or a malformed argument.
    InvalidParameter,
    /// Unknown data type tag, or a negotiated algorithm this build does not implement.
    Unsupported,
    /// A managed buffer would exceed its fixed capacity.
    BufferOverflow,
    /// Transport failure, or the peer returned a protocol ERROR that is not Busy/NotReady.
    DeviceError,
    /// Signature, HMAC, certificate chain, or AEAD tag check failed.
    SecurityViolation,
    /// Peer signalled Busy or ResponseNotReady; may be retried via RESPOND_IF_READY.
    NotReady,
    /// The session registry has no free slots.
    SessionFull,
    /// A session id is already in use.
    SessionDuplicate,
    /// No session slot matches the requested id.
    SessionNotFound,
    /// A session's AEAD sequence number would wrap.
    SequenceExhausted,
    /// The host tried to set a data tag it is not permitted to write at the
    /// endpoint's current connection state.
    AccessDenied,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Error::InvalidParameter => "invalid parameter",
            Error::Unsupported => "unsupported data type or algorithm",
            Error::BufferOverflow => "managed buffer overflow",
            Error::DeviceError => "transport or peer protocol error",
            Error::SecurityViolation => "signature, HMAC, certificate, or AEAD verification failed",
            Error::NotReady => "peer is busy or not ready",
            Error::SessionFull => "session registry is full",
            Error::SessionDuplicate => "session id already assigned",
            Error::SessionNotFound => "no session with that id",
            Error::SequenceExhausted => "session sequence number exhausted",
            Error::AccessDenied => "data tag not writable in the current connection state",
        };
        f.write_str(s)
    }
}
impl std::error::Error for Error {}

/// Decryption never distinguishes MAC failure from a parse failure to the
/// caller, to avoid giving an attacker an oracle. Internally we still
/// collapse both into `Error::SecurityViolation`; this alias documents the
/// call sites where that collapsing is deliberate rather than incidental.
pub(crate) fn decrypt_failed() -> Error {
    Error::SecurityViolation
}

pub type Result<T> = std::result::Result<T, Error>;
