//! # Backend ABI Encoding
//!
//! Tag-length-value framing for values crossing into `add`/`del`. Tag
//! is always `0x04`; length is short-form (one byte, high bit clear)
//! for values under 128 bytes, long-form otherwise (a length-of-length
//! byte with the high bit set, followed by that many big-endian length
//! bytes).

const TAG: u8 = 0x04;
const LONG_FORM_BIT: u8 = 0x80;

/// Encode one value as a single TLV record.
pub fn encode_value(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 6);
    out.push(TAG);
    encode_length(value.len(), &mut out);
    out.extend_from_slice(value);
    out
}

fn encode_length(len: usize, out: &mut Vec<u8>) {
    if len < 128 {
        out.push(len as u8);
        return;
    }
    let bytes = len.to_be_bytes();
    let first_nonzero = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len() - 1);
    let significant = &bytes[first_nonzero..];
    out.push(LONG_FORM_BIT | significant.len() as u8);
    out.extend_from_slice(significant);
}

/// Encode a driver's full output row as the concatenation of its
/// per-column TLV records (the shape `add`/`del` pass to a backend).
pub fn encode_row(values: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for value in values {
        out.extend_from_slice(&encode_value(value));
    }
    out
}

/// Decode a sequence of TLV records back into their values. Used by
/// tests and the stub backend; production backends do their own
/// decoding on the far side of the ABI boundary.
pub fn decode_records(mut buf: &[u8]) -> Result<Vec<Vec<u8>>, DecodeError> {
    let mut values = Vec::new();
    while !buf.is_empty() {
        let tag = buf[0];
        if tag != TAG {
            return Err(DecodeError::UnknownTag(tag));
        }
        buf = &buf[1..];
        let (len, rest) = decode_length(buf)?;
        buf = rest;
        if buf.len() < len {
            return Err(DecodeError::Truncated);
        }
        values.push(buf[..len].to_vec());
        buf = &buf[len..];
    }
    Ok(values)
}

fn decode_length(buf: &[u8]) -> Result<(usize, &[u8]), DecodeError> {
    let first = *buf.first().ok_or(DecodeError::Truncated)?;
    if first & LONG_FORM_BIT == 0 {
        return Ok((first as usize, &buf[1..]));
    }
    let n = (first & !LONG_FORM_BIT) as usize;
    let rest = &buf[1..];
    if rest.len() < n || n > std::mem::size_of::<usize>() {
        return Err(DecodeError::Truncated);
    }
    let mut len_bytes = [0u8; std::mem::size_of::<usize>()];
    len_bytes[std::mem::size_of::<usize>() - n..].copy_from_slice(&rest[..n]);
    Ok((usize::from_be_bytes(len_bytes), &rest[n..]))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("unexpected TLV tag {0:#x}")]
    UnknownTag(u8),
    #[error("truncated TLV record")]
    Truncated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_form_round_trips() {
        let row = vec![b"hello".to_vec(), Vec::new(), b"x".to_vec()];
        let encoded = encode_row(&row);
        assert_eq!(decode_records(&encoded).unwrap(), row);
    }

    #[test]
    fn long_form_used_above_127_bytes() {
        let long = vec![b'a'; 200];
        let encoded = encode_value(&long);
        assert_eq!(encoded[0], TAG);
        assert_eq!(encoded[1] & LONG_FORM_BIT, LONG_FORM_BIT);
        assert_eq!(decode_records(&encoded).unwrap(), vec![long]);
    }

    #[test]
    fn boundary_value_127_is_short_form() {
        let v = vec![b'x'; 127];
        let encoded = encode_value(&v);
        assert_eq!(encoded[1], 127);
    }

    #[test]
    fn boundary_value_128_is_long_form() {
        let v = vec![b'x'; 128];
        let encoded = encode_value(&v);
        assert_eq!(encoded[1] & LONG_FORM_BIT, LONG_FORM_BIT);
    }
}
