//! NMEA 4.0 TAG block formatting for outbound sentences.
//!
//! A TAG block is `\s:<source>,c:<unix-seconds>*hh\` prepended to a
//! sentence. Which parameters are emitted is controlled per interface.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::sentence::checksum;

/// Longest rendered TAG block. `s:` sources are capped at 15 characters
/// by the standard; the timestamp and checksum are bounded.
pub const TAG_MAX: usize = 48;

/// Per-interface selection of TAG block parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TagFlags {
    /// Emit the `s:` source parameter.
    pub source: bool,
    /// Emit the `c:` UNIX timestamp parameter.
    pub timestamp: bool,
}

impl TagFlags {
    pub fn any(&self) -> bool {
        self.source || self.timestamp
    }
}

/// Renders the TAG block for one outbound sentence. Returns `None` when
/// the source name cannot be carried in a TAG block (too long or
/// containing reserved characters); the caller is expected to disable
/// tag output for the interface.
pub fn gettag(name: &str, flags: &TagFlags) -> Option<Vec<u8>> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()?
        .as_secs();
    gettag_at(name, flags, now)
}

/// As [`gettag`] with an explicit timestamp, for deterministic tests.
pub fn gettag_at(name: &str, flags: &TagFlags, unix_secs: u64) -> Option<Vec<u8>> {
    if !flags.any() {
        return None;
    }
    let mut body = String::new();
    if flags.source {
        if name.is_empty()
            || name.len() > 15
            || !name.bytes().all(|b| b.is_ascii_alphanumeric())
        {
            return None;
        }
        body.push_str("s:");
        body.push_str(name);
    }
    if flags.timestamp {
        if !body.is_empty() {
            body.push(',');
        }
        body.push_str("c:");
        body.push_str(&unix_secs.to_string());
    }
    let sum = checksum(body.as_bytes());
    let tag = format!("\\{}*{:02X}\\", body, sum);
    if tag.len() > TAG_MAX {
        return None;
    }
    Some(tag.into_bytes())
}
