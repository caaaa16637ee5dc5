//! Scan aggregation: feeds camera text into a decode session

use crate::{Error, Result};
use tracing::{debug, warn};
use ur_fragments::{DecodeSession, DecodeState, UrError};

/// Progress snapshot for the scanner UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanProgress {
    pub received: Vec<usize>,
    pub expected: usize,
    /// Whole percent of fragments received
    pub percent: u8,
}

/// Result of one scan event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Fragment accepted, payload not complete yet
    Progress(ScanProgress),
    /// Not a fragment; nothing changed
    Ignored,
    /// Reassembly failed verification; everything must be scanned again
    Restarted,
    /// Payload reassembled and verified. The aggregator is fresh again.
    Complete(Vec<u8>),
}

/// One scan stream. Owned by the flow that opened the camera and dropped
/// with it.
#[derive(Debug, Default)]
pub struct ScanAggregator {
    session: DecodeSession,
}

impl ScanAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one scanned string.
    ///
    /// Transport problems are absorbed here. The only error surfaced is a
    /// fragment from a different payload arriving mid-session.
    pub fn scan(&mut self, text: &str) -> Result<ScanOutcome> {
        match self.session.receive(text) {
            Ok(DecodeState::Complete) => match self.session.take_result() {
                Some(payload) => {
                    debug!(len = payload.len(), "Scan complete");
                    Ok(ScanOutcome::Complete(payload))
                }
                None => Ok(ScanOutcome::Ignored),
            },
            Ok(DecodeState::InProgress { .. }) => {
                let progress = self.progress();
                debug!(percent = progress.percent, "Fragment accepted");
                Ok(ScanOutcome::Progress(progress))
            }
            Err(e) if e.is_malformed() => {
                warn!(error = %e, "Ignoring scan that is not a usable fragment");
                Ok(ScanOutcome::Ignored)
            }
            Err(e) if e.is_session_fatal() => {
                warn!(error = %e, "Reassembled payload failed verification, rescan required");
                self.session.reset();
                Ok(ScanOutcome::Restarted)
            }
            Err(e @ UrError::DigestConflict { .. }) => Err(Error::Codec(e)),
            Err(e) => {
                warn!(error = %e, "Ignoring undecodable scan");
                Ok(ScanOutcome::Ignored)
            }
        }
    }

    pub fn progress(&self) -> ScanProgress {
        ScanProgress {
            received: self.session.received_indexes(),
            expected: self.session.expected_count(),
            percent: (self.session.estimated_percent_complete() * 100.0).round() as u8,
        }
    }

    pub fn is_started(&self) -> bool {
        self.session.is_started()
    }

    /// Drop any partial payload
    pub fn reset(&mut self) {
        self.session.reset();
    }
}
