//! Minimal CBOR framing: a single definite-length byte string (major type 2).

use crate::{Result, UrError};

const MAJOR_BYTES: u8 = 0x40;

/// Wrap a payload as a CBOR byte string.
pub fn wrap(payload: &[u8]) -> Result<Vec<u8>> {
    let len = payload.len();
    let mut out = Vec::with_capacity(len + 5);

    if len < 24 {
        out.push(MAJOR_BYTES | len as u8);
    } else if let Ok(len) = u8::try_from(len) {
        out.push(MAJOR_BYTES | 24);
        out.push(len);
    } else if let Ok(len) = u16::try_from(len) {
        out.push(MAJOR_BYTES | 25);
        out.extend_from_slice(&len.to_be_bytes());
    } else if let Ok(len) = u32::try_from(len) {
        out.push(MAJOR_BYTES | 26);
        out.extend_from_slice(&len.to_be_bytes());
    } else {
        return Err(UrError::PayloadTooLarge(len));
    }

    out.extend_from_slice(payload);
    Ok(out)
}

/// Unwrap a CBOR byte string, requiring the header length to cover the
/// remaining bytes exactly.
pub fn unwrap(bytes: &[u8]) -> Result<Vec<u8>> {
    let (&head, rest) = bytes
        .split_first()
        .ok_or_else(|| UrError::Cbor("empty input".into()))?;

    if head & 0xe0 != MAJOR_BYTES {
        return Err(UrError::Cbor(format!("expected byte string, found header {head:#04x}")));
    }

    let (len, body) = match head & 0x1f {
        n @ 0..=23 => (usize::from(n), rest),
        24 => read_len::<1>(rest)?,
        25 => read_len::<2>(rest)?,
        26 => read_len::<4>(rest)?,
        n => return Err(UrError::Cbor(format!("unsupported length encoding {n}"))),
    };

    if body.len() != len {
        return Err(UrError::Cbor(format!(
            "length mismatch: header says {len}, found {}",
            body.len()
        )));
    }

    Ok(body.to_vec())
}

fn read_len<const N: usize>(bytes: &[u8]) -> Result<(usize, &[u8])> {
    if bytes.len() < N {
        return Err(UrError::Cbor("truncated length".into()));
    }
    let (len_bytes, body) = bytes.split_at(N);
    let len = len_bytes
        .iter()
        .fold(0usize, |acc, b| (acc << 8) | usize::from(*b));
    Ok((len, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_sizes() {
        assert_eq!(wrap(&[0u8; 5]).unwrap()[0], 0x45);
        assert_eq!(&wrap(&[0u8; 24]).unwrap()[..2], &[0x58, 24]);
        assert_eq!(&wrap(&[0u8; 300]).unwrap()[..3], &[0x59, 0x01, 0x2c]);
        assert_eq!(&wrap(&[0u8; 70_000]).unwrap()[..5], &[0x5a, 0x00, 0x01, 0x11, 0x70]);
    }

    #[test]
    fn test_unwrap_restores_payload() {
        for len in [0usize, 23, 24, 255, 256, 65_536] {
            let payload = vec![0xab; len];
            assert_eq!(unwrap(&wrap(&payload).unwrap()).unwrap(), payload);
        }
    }

    #[test]
    fn test_unwrap_rejects_wrong_major_type() {
        // text string "a"
        assert!(matches!(unwrap(&[0x61, 0x61]), Err(UrError::Cbor(_))));
    }

    #[test]
    fn test_unwrap_rejects_trailing_bytes() {
        assert!(unwrap(&[0x41, 0x01, 0x02]).is_err());
        assert!(unwrap(&[0x58]).is_err());
    }
}
