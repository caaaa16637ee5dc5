//! Reassembly of a fragment stream.

use crate::{digest, reassemble, Fragment, Result, UrError};
use std::collections::BTreeMap;
use tracing::debug;

/// Progress reported after each accepted fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// More fragments are needed
    InProgress { received: usize, expected: usize },
    /// The payload has been reassembled and verified
    Complete,
}

/// Accumulator for the fragments of one payload.
///
/// The session binds to the digest of the first fragment it accepts. A
/// fragment carrying a different digest is rejected rather than merged.
/// Repeated fragments are accepted without changing state.
///
/// When the last missing fragment arrives the body is decoded and checked
/// against the digest. On failure the session discards everything it has
/// collected and returns the error, so the caller starts over.
#[derive(Debug, Default)]
pub struct DecodeSession {
    digest: Option<String>,
    total: Option<usize>,
    parts: BTreeMap<usize, String>,
    result: Option<Vec<u8>>,
}

impl DecodeSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed scanned text into the session.
    ///
    /// Malformed text returns an error for which [`UrError::is_malformed`]
    /// holds and leaves the session untouched.
    pub fn receive(&mut self, text: &str) -> Result<DecodeState> {
        let fragment = Fragment::parse(text)?;
        self.receive_fragment(fragment)
    }

    /// Feed an already parsed fragment into the session.
    pub fn receive_fragment(&mut self, fragment: Fragment) -> Result<DecodeState> {
        let Fragment {
            index,
            total,
            digest: fragment_digest,
            segment,
        } = fragment;

        match fragment_digest {
            None => self.receive_bare(&segment),
            Some(fragment_digest) => self.receive_part(fragment_digest, index, total, segment),
        }
    }

    fn receive_bare(&mut self, body: &str) -> Result<DecodeState> {
        let payload = reassemble(body, None)?;
        let payload_digest = digest(&payload)?;

        if let Some(active) = &self.digest {
            if *active != payload_digest {
                return Err(UrError::DigestConflict {
                    expected: active.clone(),
                    found: payload_digest,
                });
            }
            if self.result.is_some() {
                return Ok(DecodeState::Complete);
            }
        }

        debug!(len = payload.len(), "Single-fragment payload received");
        self.digest = Some(payload_digest);
        self.total = Some(1);
        self.parts.insert(0, body.to_string());
        self.result = Some(payload);
        Ok(DecodeState::Complete)
    }

    fn receive_part(
        &mut self,
        fragment_digest: String,
        index: usize,
        total: usize,
        segment: String,
    ) -> Result<DecodeState> {
        if let Some(active) = &self.digest {
            if *active != fragment_digest {
                return Err(UrError::DigestConflict {
                    expected: active.clone(),
                    found: fragment_digest,
                });
            }
        }
        if let Some(expected) = self.total {
            if expected != total {
                return Err(UrError::InconsistentTotal {
                    expected,
                    found: total,
                });
            }
        }
        if self.result.is_some() {
            return Ok(DecodeState::Complete);
        }

        self.digest.get_or_insert_with(|| fragment_digest.clone());
        self.total = Some(total);

        if self.parts.contains_key(&index) {
            debug!(index, total, "Duplicate fragment ignored");
            return Ok(self.progress());
        }
        self.parts.insert(index, segment);
        debug!(index, received = self.parts.len(), total, "Fragment accepted");

        if self.parts.len() < total {
            return Ok(self.progress());
        }

        let body: String = self.parts.values().map(String::as_str).collect();
        match reassemble(&body, Some(&fragment_digest)) {
            Ok(payload) => {
                self.result = Some(payload);
                Ok(DecodeState::Complete)
            }
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    fn progress(&self) -> DecodeState {
        DecodeState::InProgress {
            received: self.parts.len(),
            expected: self.expected_count(),
        }
    }

    /// Number of fragments the payload consists of, 0 before the first one.
    pub fn expected_count(&self) -> usize {
        self.total.unwrap_or(0)
    }

    /// Zero-based indexes received so far, ascending.
    pub fn received_indexes(&self) -> Vec<usize> {
        self.parts.keys().copied().collect()
    }

    /// Fraction of fragments received, in `0.0..=1.0`.
    pub fn estimated_percent_complete(&self) -> f64 {
        match self.total {
            Some(total) if total > 0 => self.parts.len() as f64 / total as f64,
            _ => 0.0,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.result.is_some()
    }

    /// Whether any fragment has been accepted.
    pub fn is_started(&self) -> bool {
        self.digest.is_some()
    }

    /// The reassembled payload, once complete.
    pub fn result(&self) -> Option<&[u8]> {
        self.result.as_deref()
    }

    /// Take the reassembled payload, leaving a fresh session behind.
    pub fn take_result(&mut self) -> Option<Vec<u8>> {
        let result = self.result.take();
        if result.is_some() {
            self.reset();
        }
        result
    }

    /// Discard all collected state.
    pub fn reset(&mut self) {
        self.digest = None;
        self.total = None;
        self.parts.clear();
        self.result = None;
    }
}
