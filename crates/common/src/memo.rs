//! Memo codec
//!
//! Contributions paid to the shared shielded address are told apart by the
//! memo text `Contribution {id} on {service}`. On the wire the memo is UTF-8
//! hex. The on-chain memo field is a fixed 512 bytes, zero padded, so decoding
//! drops trailing zero bytes.

use crate::{ContributionId, Error, Result};

/// Width of the on-chain memo field in bytes
pub const MEMO_FIELD_BYTES: usize = 512;

const MEMO_PREFIX: &str = "Contribution ";

/// Plain-text memo for a contribution
pub fn make_memo(id: ContributionId, service: &str) -> String {
    format!("{}{} on {}", MEMO_PREFIX, id, service)
}

pub fn encode_memo(text: &str) -> String {
    hex::encode(text.as_bytes())
}

pub fn decode_memo(memo_hex: &str) -> Result<String> {
    let mut bytes = hex::decode(memo_hex.trim())
        .map_err(|e| Error::InvalidMemo(format!("not hex: {}", e)))?;

    while bytes.last() == Some(&0) {
        bytes.pop();
    }

    String::from_utf8(bytes).map_err(|e| Error::InvalidMemo(format!("not UTF-8: {}", e)))
}

/// Recover the contribution id from a hex memo, if it names one
pub fn contribution_id_from_memo(memo_hex: &str) -> Option<ContributionId> {
    let text = decode_memo(memo_hex).ok()?;
    let rest = text.strip_prefix(MEMO_PREFIX)?;
    let digits = rest.split_whitespace().next()?;
    digits.parse().ok()
}
