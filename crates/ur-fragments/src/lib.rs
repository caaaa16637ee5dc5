//! UR Fragments
//!
//! Encodes an arbitrary byte payload into a sequence of QR-sized text
//! fragments and reassembles them, in any order and with repeats, back into
//! the original payload.
//!
//! Fragment grammar:
//! - bare: `ur:bytes/<bc32-body>` for payloads that fit in one fragment
//! - multi-part: `ur:bytes/<k>of<n>/<digest>/<bc32-segment>`
//!
//! The body is the payload wrapped as a CBOR byte string and encoded as bc32.
//! The digest is the bc32-encoded SHA-256 of the CBOR bytes, so every
//! fragment identifies the payload it belongs to and the reassembled body
//! can be verified before it is handed out.

pub mod bc32;
mod cbor;
mod session;

pub use session::{DecodeSession, DecodeState};

use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Scheme and type prefix carried by every fragment.
pub const UR_PREFIX: &str = "ur:bytes/";

/// Fragment capacity used when a caller has no preference.
pub const DEFAULT_FRAGMENT_CAPACITY: usize = 200;

/// Codec error types
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrError {
    #[error("Fragment capacity must be at least 1")]
    InvalidCapacity,
    #[error("Malformed fragment: {0}")]
    Malformed(String),
    #[error("Unsupported UR type: {0}")]
    UnsupportedType(String),
    #[error("bc32 error: {0}")]
    Bc32(String),
    #[error("CBOR error: {0}")]
    Cbor(String),
    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("Fragment belongs to another payload: expected digest {expected}, found {found}")]
    DigestConflict { expected: String, found: String },
    #[error("Fragment total changed mid-session: expected {expected}, found {found}")]
    InconsistentTotal { expected: usize, found: usize },
    #[error("Reassembled payload is corrupted: {0}")]
    Corrupted(String),
    #[error("Digest mismatch after reassembly: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },
}

impl UrError {
    /// Text that is not a usable fragment at all. The session is untouched.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            UrError::Malformed(_)
                | UrError::UnsupportedType(_)
                | UrError::Bc32(_)
                | UrError::Cbor(_)
                | UrError::InconsistentTotal { .. }
        )
    }

    /// Reassembly failed and the session was discarded. The whole payload
    /// has to be scanned again.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, UrError::Corrupted(_) | UrError::DigestMismatch { .. })
    }
}

pub type Result<T> = std::result::Result<T, UrError>;

/// One scannable piece of an encoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// Zero-based position of this segment
    pub index: usize,
    /// Number of fragments for the whole payload
    pub total: usize,
    /// Digest of the whole payload; `None` for the bare single-fragment form
    pub digest: Option<String>,
    /// bc32 text segment
    pub segment: String,
}

impl Fragment {
    /// Whether this is the header-less single-fragment form.
    pub fn is_bare(&self) -> bool {
        self.digest.is_none()
    }

    /// Parse fragment text. Input is case-insensitive.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim().to_ascii_lowercase();
        let rest = match text.strip_prefix("ur:") {
            Some(rest) => rest,
            None => return Err(UrError::Malformed("missing ur: scheme".into())),
        };
        let rest = match rest.strip_prefix("bytes/") {
            Some(rest) => rest,
            None => {
                let kind = rest.split('/').next().unwrap_or_default();
                return Err(UrError::UnsupportedType(kind.to_string()));
            }
        };

        let parts: Vec<&str> = rest.split('/').collect();
        match parts.as_slice() {
            [body] => {
                if !bc32::is_bc32(body) {
                    return Err(UrError::Malformed("body is not bc32".into()));
                }
                Ok(Fragment {
                    index: 0,
                    total: 1,
                    digest: None,
                    segment: body.to_string(),
                })
            }
            [sequence, digest, segment] => {
                let (index, total) = parse_sequence(sequence)?;
                if !bc32::is_bc32(digest) {
                    return Err(UrError::Malformed("digest is not bc32".into()));
                }
                if !bc32::is_bc32(segment) {
                    return Err(UrError::Malformed("segment is not bc32".into()));
                }
                Ok(Fragment {
                    index,
                    total,
                    digest: Some(digest.to_string()),
                    segment: segment.to_string(),
                })
            }
            _ => Err(UrError::Malformed(format!(
                "expected 1 or 3 path components, found {}",
                parts.len()
            ))),
        }
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.digest {
            None => write!(f, "{}{}", UR_PREFIX, self.segment),
            Some(digest) => write!(
                f,
                "{}{}of{}/{}/{}",
                UR_PREFIX,
                self.index + 1,
                self.total,
                digest,
                self.segment
            ),
        }
    }
}

impl FromStr for Fragment {
    type Err = UrError;

    fn from_str(s: &str) -> Result<Self> {
        Fragment::parse(s)
    }
}

fn parse_sequence(sequence: &str) -> Result<(usize, usize)> {
    let (k, n) = sequence
        .split_once("of")
        .ok_or_else(|| UrError::Malformed(format!("bad sequence {sequence:?}")))?;
    let k: usize = k
        .parse()
        .map_err(|_| UrError::Malformed(format!("bad sequence index {k:?}")))?;
    let n: usize = n
        .parse()
        .map_err(|_| UrError::Malformed(format!("bad sequence total {n:?}")))?;

    if n < 2 || k == 0 || k > n {
        return Err(UrError::Malformed(format!("sequence {k}of{n} out of range")));
    }

    Ok((k - 1, n))
}

/// The bc32 body a payload encodes to, before splitting.
pub fn encode_body(payload: &[u8]) -> Result<String> {
    Ok(bc32::encode(&cbor::wrap(payload)?))
}

/// bc32-encoded SHA-256 of the CBOR-wrapped payload.
pub fn digest(payload: &[u8]) -> Result<String> {
    Ok(digest_of_cbor(&cbor::wrap(payload)?))
}

fn digest_of_cbor(cbor_bytes: &[u8]) -> String {
    bc32::encode(Sha256::digest(cbor_bytes).as_slice())
}

/// Encode a payload into fragments of at most `capacity` body characters.
///
/// A payload whose body fits in one fragment is emitted in the bare form
/// without sequencing or digest header.
pub fn encode(payload: &[u8], capacity: usize) -> Result<Vec<Fragment>> {
    if capacity == 0 {
        return Err(UrError::InvalidCapacity);
    }

    let cbor_bytes = cbor::wrap(payload)?;
    let body = bc32::encode(&cbor_bytes);

    if body.len() <= capacity {
        return Ok(vec![Fragment {
            index: 0,
            total: 1,
            digest: None,
            segment: body,
        }]);
    }

    let digest = digest_of_cbor(&cbor_bytes);
    let chunks: Vec<String> = body
        .as_bytes()
        .chunks(capacity)
        .map(|chunk| chunk.iter().map(|&b| char::from(b)).collect())
        .collect();
    let total = chunks.len();

    tracing::debug!(
        payload_len = payload.len(),
        body_len = body.len(),
        fragments = total,
        "Payload encoded"
    );

    Ok(chunks
        .into_iter()
        .enumerate()
        .map(|(index, segment)| Fragment {
            index,
            total,
            digest: Some(digest.clone()),
            segment,
        })
        .collect())
}

/// Encode a payload straight to fragment text.
pub fn encode_to_strings(payload: &[u8], capacity: usize) -> Result<Vec<String>> {
    Ok(encode(payload, capacity)?
        .iter()
        .map(ToString::to_string)
        .collect())
}

/// Decode a full body and check it against the digest it was announced with.
pub(crate) fn reassemble(body: &str, expected_digest: Option<&str>) -> Result<Vec<u8>> {
    let cbor_bytes = bc32::decode(body).map_err(|e| match expected_digest {
        Some(_) => UrError::Corrupted(e.to_string()),
        None => e,
    })?;

    if let Some(expected) = expected_digest {
        let actual = digest_of_cbor(&cbor_bytes);
        if actual != expected {
            return Err(UrError::DigestMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        return cbor::unwrap(&cbor_bytes).map_err(|e| UrError::Corrupted(e.to_string()));
    }

    cbor::unwrap(&cbor_bytes)
}
