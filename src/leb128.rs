//! Unsigned LEB128, as used for numbers in the representation-independent
//! hash and for the `/time` leaf of the state tree.
//!
//! Thin wrapper over the `leb128` crate; decoding additionally insists
//! that the value spans the whole input, since a state-tree leaf carries
//! exactly one number.

use crate::error::AgentError;

pub(crate) fn encode(value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    ::leb128::write::unsigned(&mut out, value).expect("writing to a Vec cannot fail");
    out
}

/// Decodes a single LEB128 value spanning the whole input.
pub(crate) fn decode(mut bytes: &[u8]) -> Result<u64, AgentError> {
    let value = ::leb128::read::unsigned(&mut bytes)
        .map_err(|e| AgentError::MalformedResponse(format!("invalid LEB128 value: {e}")))?;
    if !bytes.is_empty() {
        return Err(AgentError::MalformedResponse(
            "trailing bytes after LEB128 value".to_string(),
        ));
    }
    Ok(value)
}
