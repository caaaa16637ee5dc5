//! Offline side of an air-gapped signing flow
//!
//! The cold signer scans an unsigned payload, signs it with a key selected by
//! the payload's derivation suffix under its own root path, and shows the
//! signature back as rotating fragments.

use crate::chain;
use crate::display::{RotatingDisplay, DEFAULT_DISPLAY_PERIOD};
use crate::error::Failure;
use crate::keys::KeyDeriver;
use crate::proposal::UnsignedPayload;
use crate::scan::{ScanAggregator, ScanOutcome, ScanProgress};
use crate::types::ChainKind;
use crate::{Error, Result, ACCOUNT_SIGNATURE_CAPACITY, UTXO_SIGNATURE_CAPACITY};
use std::fmt;
use std::time::Duration;
use tracing::{error, info, instrument};

/// Cold signer settings
#[derive(Debug, Clone)]
pub struct ColdSignerConfig {
    /// Overrides the per-chain fragment capacity
    pub fragment_capacity: Option<usize>,
    pub display_period: Duration,
}

impl Default for ColdSignerConfig {
    fn default() -> Self {
        Self {
            fragment_capacity: None,
            display_period: DEFAULT_DISPLAY_PERIOD,
        }
    }
}

impl ColdSignerConfig {
    pub fn capacity_for(&self, kind: ChainKind) -> usize {
        self.fragment_capacity.unwrap_or(match kind {
            ChainKind::AccountModel => ACCOUNT_SIGNATURE_CAPACITY,
            ChainKind::Utxo => UTXO_SIGNATURE_CAPACITY,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColdSignerState {
    Scanning,
    Signing,
    DisplayingResult,
    Done,
    Failed,
}

impl ColdSignerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColdSignerState::Scanning => "scanning",
            ColdSignerState::Signing => "signing",
            ColdSignerState::DisplayingResult => "displaying result",
            ColdSignerState::Done => "done",
            ColdSignerState::Failed => "failed",
        }
    }
}

impl fmt::Display for ColdSignerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColdSignerEvent {
    Progress(ScanProgress),
    Ignored,
    Restarted,
    /// Signature ready; these fragments are now on screen
    Signed { fragments: Vec<String> },
}

/// State machine for the offline device
pub struct ColdSigner<D> {
    deriver: D,
    root_path: String,
    config: ColdSignerConfig,
    state: ColdSignerState,
    scanner: Option<ScanAggregator>,
    request: Option<UnsignedPayload>,
    display: Option<RotatingDisplay>,
    failure: Option<Failure>,
}

impl<D: KeyDeriver> ColdSigner<D> {
    /// Open the scanner for a wallet rooted at `root_path`
    pub fn new(deriver: D, root_path: impl Into<String>, config: ColdSignerConfig) -> Result<Self> {
        if config.fragment_capacity == Some(0) {
            return Err(Error::InvalidConfig("fragment capacity must be at least 1".into()));
        }
        let root_path = root_path.into();
        info!(%root_path, "Cold signer scanning");

        Ok(Self {
            deriver,
            root_path,
            config,
            state: ColdSignerState::Scanning,
            scanner: Some(ScanAggregator::new()),
            request: None,
            display: None,
            failure: None,
        })
    }

    pub fn state(&self) -> ColdSignerState {
        self.state
    }

    pub fn root_path(&self) -> &str {
        &self.root_path
    }

    /// The payload that was signed
    pub fn request(&self) -> Option<&UnsignedPayload> {
        self.request.as_ref()
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub fn current_fragment(&self) -> Option<&str> {
        self.display.as_ref().map(RotatingDisplay::current_fragment)
    }

    pub fn display(&self) -> Option<&RotatingDisplay> {
        self.display.as_ref()
    }

    pub fn progress(&self) -> Option<ScanProgress> {
        self.scanner.as_ref().map(ScanAggregator::progress)
    }

    fn transition(&mut self, next: ColdSignerState) {
        info!(from = %self.state, to = %next, "Cold signer transition");
        self.state = next;
    }

    fn fail(&mut self, e: &Error) {
        error!(state = %self.state, error = %e, "Cold signing failed");
        self.scanner = None;
        self.request = None;
        if let Some(mut display) = self.display.take() {
            display.stop();
        }
        self.failure = Some(Failure::from(e));
        self.state = ColdSignerState::Failed;
    }

    /// Feed one camera scan
    pub fn on_scan(&mut self, text: &str) -> Result<ColdSignerEvent> {
        if self.state != ColdSignerState::Scanning {
            return Err(Error::InvalidState {
                state: self.state.as_str(),
                operation: "scan",
            });
        }
        let scanner = self.scanner.get_or_insert_with(ScanAggregator::new);

        let payload = match scanner.scan(text) {
            Ok(ScanOutcome::Progress(p)) => return Ok(ColdSignerEvent::Progress(p)),
            Ok(ScanOutcome::Ignored) => return Ok(ColdSignerEvent::Ignored),
            Ok(ScanOutcome::Restarted) => return Ok(ColdSignerEvent::Restarted),
            Ok(ScanOutcome::Complete(payload)) => payload,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        // camera is released once the payload is in
        self.scanner = None;
        self.transition(ColdSignerState::Signing);

        match self.sign_payload(&payload) {
            Ok(fragments) => {
                self.transition(ColdSignerState::DisplayingResult);
                Ok(ColdSignerEvent::Signed { fragments })
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    #[instrument(skip_all, fields(len = payload.len()))]
    fn sign_payload(&mut self, payload: &[u8]) -> Result<Vec<String>> {
        let request = UnsignedPayload::from_bytes(payload)?;
        if request.root_path.trim() != self.root_path {
            return Err(Error::ForeignRootPath {
                expected: self.root_path.clone(),
                requested: request.root_path,
            });
        }
        if request.round.remaining == 0 {
            return Err(Error::NothingToSign);
        }

        let kind = request.txp.kind();
        info!(
            %kind,
            coin = request.txp.coin(),
            required = request.round.required,
            total = request.round.total,
            remaining = request.round.remaining,
            "Signing request received"
        );

        let share = chain::sign(&request.txp, &self.deriver, &self.root_path)?;
        let bytes = share.to_payload()?;
        let fragments = ur_fragments::encode_to_strings(&bytes, self.config.capacity_for(kind))?;

        let mut display = RotatingDisplay::new(fragments.clone(), self.config.display_period)?;
        display.start()?;
        self.display = Some(display);
        self.request = Some(request);
        Ok(fragments)
    }

    /// User dismissed the signature display
    pub fn finish(&mut self) -> Result<()> {
        if self.state != ColdSignerState::DisplayingResult {
            return Err(Error::InvalidState {
                state: self.state.as_str(),
                operation: "finish",
            });
        }
        if let Some(mut display) = self.display.take() {
            display.stop();
        }
        self.transition(ColdSignerState::Done);
        Ok(())
    }

    pub fn cancel(&mut self) {
        if matches!(self.state, ColdSignerState::Done | ColdSignerState::Failed) {
            return;
        }
        self.fail(&Error::Cancelled);
    }
}

impl<D> fmt::Debug for ColdSigner<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ColdSigner")
            .field("state", &self.state)
            .field("root_path", &self.root_path)
            .finish_non_exhaustive()
    }
}
