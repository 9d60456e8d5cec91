//! Room code generation and validation
//!
//! A room is one signaling session, keyed by a short code the offering user
//! reads out, pastes, or shows as a QR code. Instead of exchanging SDP blobs
//! by hand, users share a 6-digit number like "482913".
//!
//! # How a drop works
//!
//! 1. The sender creates a room and displays its code
//! 2. The user shares the code with the receiver out of band
//! 3. The receiver enters the code and joins the room
//! 4. Both sides negotiate through the room's directory record
//! 5. Either side deletes the room when the session ends
//!
//! Codes are drawn uniformly from the six-digit range, so roughly 900 000
//! values exist. The offerer additionally checks the directory for an
//! existing room before claiming a code (see `Session::offer`), so a rare
//! collision is regenerated rather than silently shared.

use std::fmt;

use rand::Rng;
use thiserror::Error;

/// Smallest valid room code value.
const CODE_MIN: u32 = 100_000;

/// Largest valid room code value.
const CODE_MAX: u32 = 999_999;

/// Errors that can occur while handling room codes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomCodeError {
    /// The input is not a 6-digit code in the valid range
    #[error("room code must be exactly 6 digits")]
    InvalidCode,
}

/// A human-typeable room identifier
///
/// Always exactly six ASCII digits in `100000..=999999`.
///
/// # Example
///
/// ```rust
/// use ghostdrop::net::room::RoomCode;
///
/// let code = RoomCode::generate();
/// assert_eq!(code.as_str().len(), 6);
/// assert_eq!(RoomCode::parse(code.as_str()).unwrap(), code);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomCode(String);

impl RoomCode {
    /// Generates a new random room code.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        Self(rng.gen_range(CODE_MIN..=CODE_MAX).to_string())
    }

    /// Parses a room code from user input.
    ///
    /// Surrounding whitespace is tolerated; anything but exactly six digits
    /// in the valid range is rejected.
    pub fn parse(s: &str) -> Result<Self, RoomCodeError> {
        let s = s.trim();
        if s.len() != 6 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RoomCodeError::InvalidCode);
        }
        let value: u32 = s.parse().map_err(|_| RoomCodeError::InvalidCode)?;
        if !(CODE_MIN..=CODE_MAX).contains(&value) {
            return Err(RoomCodeError::InvalidCode);
        }
        Ok(Self(s.to_owned()))
    }

    /// Returns the code as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Directory path of the room record.
    pub(crate) fn path(&self) -> String {
        format!("rooms/{}", self.0)
    }

    /// Directory path of the joiner's answer.
    pub(crate) fn answer_path(&self) -> String {
        format!("rooms/{}/answer", self.0)
    }

    /// Directory path of the offerer's candidate collection.
    pub(crate) fn caller_candidates_path(&self) -> String {
        format!("rooms/{}/callerCandidates", self.0)
    }

    /// Directory path of the joiner's candidate collection.
    pub(crate) fn callee_candidates_path(&self) -> String {
        format!("rooms/{}/calleeCandidates", self.0)
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
