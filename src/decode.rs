//! Decoding of command replies.
//!
//! The device reserves bit 7 of every byte as a marker bit, so payload values
//! are always read through [`mask`]. Replies carry no length prefix or
//! checksum; a reply is simply everything that arrived before the read timed out.

use std::time::Duration;

use crate::errors::DecodeError;

/// Index of the session-count byte in a get-session-count reply.
const SESSION_COUNT_INDEX: usize = 3;

/// A get-session-duration reply must reach masked byte 6.
const SESSION_DURATION_LEN: usize = 7;

/// Clear the marker bit.
#[inline]
pub const fn mask(byte: u8) -> u8 {
    byte & 0x7F
}

fn require(resp: &[u8], needed: usize) -> Result<(), DecodeError> {
    if resp.len() < needed {
        return Err(DecodeError::Truncated {
            needed,
            got: resp.len(),
        });
    }
    Ok(())
}

/// Decode a vendor/model/user text reply.
///
/// Framing and marker bytes mask to control or punctuation characters and are
/// dropped along with anything else that is not ASCII alphanumeric.
pub fn decode_text(resp: &[u8]) -> String {
    resp.iter()
        .map(|&b| char::from(mask(b)))
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

/// Whether the device holds a recorded session.
pub fn decode_session_count(resp: &[u8]) -> Result<bool, DecodeError> {
    require(resp, SESSION_COUNT_INDEX + 1)?;
    Ok(mask(resp[SESSION_COUNT_INDEX]) == 1)
}

/// Raw duration field of a get-session-duration reply, in half seconds.
///
/// Byte 1 carries the high bits of the three value bytes:
///
/// ```text
/// bit 2 -> result bit 7   (low byte high bit)
/// bit 3 -> result bit 15  (via << 4 inside the middle byte)
/// bit 4 -> result bit 23  (via << 3 inside the top byte)
/// ```
pub fn session_duration_half_seconds(resp: &[u8]) -> Result<u32, DecodeError> {
    require(resp, SESSION_DURATION_LEN)?;
    let m: Vec<u32> = resp[..SESSION_DURATION_LEN]
        .iter()
        .map(|&b| u32::from(mask(b)))
        .collect();

    let mut half_seconds = (m[1] & 0x04) << 5;
    half_seconds |= m[4];
    half_seconds |= (m[5] | ((m[1] & 0x08) << 4)) << 8;
    half_seconds |= (m[6] | ((m[1] & 0x10) << 3)) << 16;
    Ok(half_seconds)
}

/// Length of the stored session.
pub fn decode_session_duration(resp: &[u8]) -> Result<Duration, DecodeError> {
    let half_seconds = session_duration_half_seconds(resp)?;
    Ok(Duration::from_millis(u64::from(half_seconds) * 500))
}
