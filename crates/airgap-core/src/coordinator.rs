//! Watch-only side of an air-gapped signing flow
//!
//! The coordinator shows the unsigned payload as rotating fragments, scans
//! back one signature per round, and hands the collected shares to a
//! finalizer once the threshold is met. Each round re-encodes the payload
//! with the updated `remaining` counter so the next cold device knows how
//! many signatures are still expected.

use crate::chain;
use crate::display::{RotatingDisplay, DEFAULT_DISPLAY_PERIOD};
use crate::error::{ErrorKind, Failure};
use crate::finalize::{FinalizeOutcome, Finalizer};
use crate::keys::KeyDeriver;
use crate::proposal::{TransactionProposal, UnsignedPayload};
use crate::round::SigningRound;
use crate::scan::{ScanAggregator, ScanOutcome, ScanProgress};
use crate::types::{ChainKind, SignatureShare};
use crate::{Error, Result, ACCOUNT_PAYLOAD_CAPACITY, UTXO_PROPOSAL_CAPACITY};
use std::fmt;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Coordinator settings
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Overrides the per-chain fragment capacity
    pub fragment_capacity: Option<usize>,
    pub display_period: Duration,
    /// Open the scanner as soon as the payload is shown, keeping the
    /// display running until the signature comes back
    pub auto_advance: bool,
    /// The wallet holds no private key
    pub read_only: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            fragment_capacity: None,
            display_period: DEFAULT_DISPLAY_PERIOD,
            auto_advance: false,
            read_only: true,
        }
    }
}

impl CoordinatorConfig {
    pub fn capacity_for(&self, kind: ChainKind) -> usize {
        self.fragment_capacity.unwrap_or(match kind {
            ChainKind::AccountModel => ACCOUNT_PAYLOAD_CAPACITY,
            ChainKind::Utxo => UTXO_PROPOSAL_CAPACITY,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Building,
    Displaying,
    AwaitingScan,
    Finalizing,
    Done,
    Failed,
}

impl CoordinatorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoordinatorState::Building => "building",
            CoordinatorState::Displaying => "displaying",
            CoordinatorState::AwaitingScan => "awaiting scan",
            CoordinatorState::Finalizing => "finalizing",
            CoordinatorState::Done => "done",
            CoordinatorState::Failed => "failed",
        }
    }
}

impl fmt::Display for CoordinatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a scan did to the flow
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    Progress(ScanProgress),
    /// Not a fragment
    Ignored,
    /// Corrupted reassembly, scan the signature again
    Restarted,
    /// A signature that was already collected
    Duplicate,
    /// New signature counted; build the next round
    SignatureAccepted { remaining: usize },
    /// Threshold met
    ReadyToFinalize,
}

/// State machine for the watch-only device
pub struct SigningCoordinator {
    proposal: TransactionProposal,
    root_path: String,
    round: SigningRound,
    config: CoordinatorConfig,
    state: CoordinatorState,
    display: Option<RotatingDisplay>,
    scanner: Option<ScanAggregator>,
    outcome: Option<FinalizeOutcome>,
    failure: Option<Failure>,
}

impl SigningCoordinator {
    /// Start a fresh `required`-of-`total` flow
    pub fn new(
        proposal: TransactionProposal,
        root_path: impl Into<String>,
        required: usize,
        total: usize,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        Self::resume(proposal, root_path, required, total, Vec::new(), config)
    }

    /// Start from signatures collected earlier for the same proposal
    pub fn resume(
        proposal: TransactionProposal,
        root_path: impl Into<String>,
        required: usize,
        total: usize,
        collected: Vec<SignatureShare>,
        config: CoordinatorConfig,
    ) -> Result<Self> {
        if config.fragment_capacity == Some(0) {
            return Err(Error::InvalidConfig("fragment capacity must be at least 1".into()));
        }
        if let Some(share) = collected.iter().find(|s| s.kind() != proposal.kind()) {
            return Err(Error::InvalidConfig(format!(
                "collected {} signature for a {} proposal",
                share.kind(),
                proposal.kind()
            )));
        }
        let round = SigningRound::resume(required, total, collected)?;

        info!(
            round = %round.id(),
            kind = %proposal.kind(),
            required,
            total,
            remaining = round.remaining(),
            "Signing flow created"
        );

        Ok(Self {
            proposal,
            root_path: root_path.into(),
            round,
            config,
            state: CoordinatorState::Building,
            display: None,
            scanner: None,
            outcome: None,
            failure: None,
        })
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    pub fn round(&self) -> &SigningRound {
        &self.round
    }

    pub fn proposal(&self) -> &TransactionProposal {
        &self.proposal
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub fn outcome(&self) -> Option<&FinalizeOutcome> {
        self.outcome.as_ref()
    }

    /// Fragment to render right now. Also set while scanning when the flow
    /// auto-advances.
    pub fn current_fragment(&self) -> Option<&str> {
        self.display.as_ref().map(RotatingDisplay::current_fragment)
    }

    pub fn display(&self) -> Option<&RotatingDisplay> {
        self.display.as_ref()
    }

    /// Scan progress, while awaiting a signature
    pub fn progress(&self) -> Option<ScanProgress> {
        self.scanner.as_ref().map(ScanAggregator::progress)
    }

    /// The unsigned payload for the current round
    pub fn unsigned_payload(&self) -> UnsignedPayload {
        UnsignedPayload {
            txp: self.proposal.clone(),
            root_path: self.root_path.clone(),
            round: self.round.counters(),
        }
    }

    fn expect_state(&self, expected: CoordinatorState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(Error::InvalidState {
                state: self.state.as_str(),
                operation,
            })
        }
    }

    fn transition(&mut self, next: CoordinatorState) {
        info!(round = %self.round.id(), from = %self.state, to = %next, "Coordinator transition");
        self.state = next;
    }

    fn fail(&mut self, e: &Error) {
        error!(round = %self.round.id(), state = %self.state, error = %e, "Signing flow failed");
        self.release();
        self.failure = Some(Failure::from(e));
        self.state = CoordinatorState::Failed;
    }

    fn release(&mut self) {
        if let Some(mut display) = self.display.take() {
            display.stop();
        }
        self.scanner = None;
    }

    /// Encode this round's payload and start showing it.
    ///
    /// Returns the fragments being displayed. When the round already holds
    /// every signature the flow moves straight to finalizing.
    #[instrument(skip(self), fields(round = %self.round.id()))]
    pub fn build(&mut self) -> Result<Vec<String>> {
        self.expect_state(CoordinatorState::Building, "build")?;

        if self.round.is_complete() {
            self.transition(CoordinatorState::Finalizing);
            return Ok(Vec::new());
        }

        match self.encode_round() {
            Ok(fragments) => {
                self.transition(CoordinatorState::Displaying);
                if self.config.auto_advance {
                    self.open_scanner();
                }
                Ok(fragments)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    fn encode_round(&mut self) -> Result<Vec<String>> {
        let bytes = self.unsigned_payload().to_bytes()?;
        let capacity = self.config.capacity_for(self.proposal.kind());
        let fragments = ur_fragments::encode_to_strings(&bytes, capacity)?;

        info!(
            remaining = self.round.remaining(),
            fragments = fragments.len(),
            "Unsigned payload encoded"
        );

        match self.display.as_mut() {
            Some(display) => display.replace(fragments.clone())?,
            None => {
                self.display = Some(RotatingDisplay::new(
                    fragments.clone(),
                    self.config.display_period,
                )?)
            }
        }
        if let Some(display) = self.display.as_mut() {
            display.start()?;
        }
        Ok(fragments)
    }

    /// User is done showing the payload; open the scanner
    pub fn next_step(&mut self) -> Result<()> {
        self.expect_state(CoordinatorState::Displaying, "open scanner")?;
        if let Some(mut display) = self.display.take() {
            display.stop();
        }
        self.open_scanner();
        Ok(())
    }

    fn open_scanner(&mut self) {
        self.scanner = Some(ScanAggregator::new());
        self.transition(CoordinatorState::AwaitingScan);
    }

    /// Feed one camera scan.
    ///
    /// Noise, corrupted reassembly and repeated signatures are absorbed.
    /// Any other error ends the flow.
    pub fn on_scan(&mut self, text: &str) -> Result<CoordinatorEvent> {
        self.expect_state(CoordinatorState::AwaitingScan, "scan")?;
        let scanner = self.scanner.get_or_insert_with(ScanAggregator::new);

        let payload = match scanner.scan(text) {
            Ok(ScanOutcome::Progress(p)) => return Ok(CoordinatorEvent::Progress(p)),
            Ok(ScanOutcome::Ignored) => return Ok(CoordinatorEvent::Ignored),
            Ok(ScanOutcome::Restarted) => return Ok(CoordinatorEvent::Restarted),
            Ok(ScanOutcome::Complete(payload)) => payload,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        let accepted = SignatureShare::from_payload(self.proposal.kind(), &payload)
            .and_then(|share| self.round.accept(share));
        match accepted {
            Ok(0) => {
                self.release();
                self.transition(CoordinatorState::Finalizing);
                Ok(CoordinatorEvent::ReadyToFinalize)
            }
            Ok(remaining) => {
                self.release();
                self.transition(CoordinatorState::Building);
                Ok(CoordinatorEvent::SignatureAccepted { remaining })
            }
            Err(Error::DuplicateSignature) => {
                warn!(round = %self.round.id(), "Signature already collected, scan the next signer");
                Ok(CoordinatorEvent::Duplicate)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Single-signer shortcut: sign with a key held on this device and skip
    /// the QR exchange
    pub fn sign_locally<D: KeyDeriver + ?Sized>(&mut self, deriver: &D) -> Result<()> {
        if !matches!(
            self.state,
            CoordinatorState::Building | CoordinatorState::Displaying
        ) {
            return Err(Error::InvalidState {
                state: self.state.as_str(),
                operation: "sign locally",
            });
        }
        if self.config.read_only || self.round.required() != 1 {
            return Err(Error::InvalidState {
                state: "not a single-signer wallet with a local key",
                operation: "sign locally",
            });
        }

        let signed = chain::sign(&self.proposal, deriver, &self.root_path)
            .and_then(|share| self.round.accept(share));
        match signed {
            Ok(_) => {
                self.release();
                self.transition(CoordinatorState::Finalizing);
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Validate and submit the collected signatures.
    ///
    /// A network failure keeps the flow in finalizing so the same
    /// signatures can be submitted again.
    #[instrument(skip(self, finalizer), fields(round = %self.round.id()))]
    pub async fn finalize(&mut self, finalizer: &dyn Finalizer) -> Result<FinalizeOutcome> {
        self.expect_state(CoordinatorState::Finalizing, "finalize")?;

        match finalizer.finalize(&self.proposal, self.round.collected()).await {
            Ok(outcome) => {
                info!(?outcome, "Signing flow finished");
                self.outcome = Some(outcome.clone());
                self.transition(CoordinatorState::Done);
                Ok(outcome)
            }
            Err(e) if e.kind() == ErrorKind::Network => {
                error!(error = %e, "Submission rejected, signatures kept for retry");
                Err(e)
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Close the flow. Collected signatures are discarded with it.
    pub fn cancel(&mut self) {
        if matches!(self.state, CoordinatorState::Done | CoordinatorState::Failed) {
            return;
        }
        self.fail(&Error::Cancelled);
    }
}

impl fmt::Debug for SigningCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCoordinator")
            .field("state", &self.state)
            .field("round", &self.round)
            .field("root_path", &self.root_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finalize::{AccountFinalizer, MemoryContract};
    use crate::keys::{DerivationSuffix, HdWallet};
    use crate::proposal::AccountCall;
    use crate::types::{Address, HexData};
    use ur_fragments::{encode_to_strings, Fragment};

    const ROOT: &str = "m/44'/60'/0'";

    fn wallets() -> Vec<HdWallet> {
        (1..=3u8).map(|i| HdWallet::from_seed(&[i; 32]).unwrap()).collect()
    }

    fn signer(wallet: &HdWallet) -> Address {
        wallet
            .derive(ROOT, &"0/0".parse::<DerivationSuffix>().unwrap())
            .unwrap()
            .address()
    }

    fn call(contract: Address) -> AccountCall {
        AccountCall {
            coin: "eth".into(),
            receive_address: contract,
            destination: "0x9dc9a9a2a753c13b63526d628b1bf43cabb468fe".parse().unwrap(),
            value: 0,
            data: HexData(vec![0xa9, 0x05, 0x9c, 0xbb]),
            nonce: 0,
            path: "0/0".into(),
            gas_price: None,
            gas_limit: None,
        }
    }

    fn signature_fragments(call: &AccountCall, wallet: &HdWallet) -> Vec<String> {
        let share = chain::sign(&TransactionProposal::Account(call.clone()), wallet, ROOT).unwrap();
        encode_to_strings(&share.to_payload().unwrap(), 30).unwrap()
    }

    fn coordinator(call: &AccountCall, required: usize) -> SigningCoordinator {
        SigningCoordinator::new(
            TransactionProposal::Account(call.clone()),
            ROOT,
            required,
            3,
            CoordinatorConfig::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_two_of_three() {
        let wallets = wallets();
        let contract = MemoryContract::default();
        let address = contract.deploy(wallets.iter().map(signer).collect(), 2);
        let call = call(address);
        let mut flow = coordinator(&call, 2);

        let first = flow.build().unwrap();
        assert_eq!(flow.state(), CoordinatorState::Displaying);
        let payload = UnsignedPayload::from_bytes(&decode_all(&first)).unwrap();
        assert_eq!(payload.round.remaining, 2);
        flow.next_step().unwrap();

        let mut event = CoordinatorEvent::Ignored;
        for text in signature_fragments(&call, &wallets[2]).iter().rev() {
            event = flow.on_scan(text).unwrap();
        }
        assert_eq!(event, CoordinatorEvent::SignatureAccepted { remaining: 1 });
        assert_eq!(flow.state(), CoordinatorState::Building);

        // next round carries the decremented counter
        let second = flow.build().unwrap();
        let payload = UnsignedPayload::from_bytes(&decode_all(&second)).unwrap();
        assert_eq!(payload.round.remaining, 1);
        flow.next_step().unwrap();

        for text in signature_fragments(&call, &wallets[0]) {
            event = flow.on_scan(&text).unwrap();
        }
        assert_eq!(event, CoordinatorEvent::ReadyToFinalize);

        let outcome = flow.finalize(&AccountFinalizer::new(contract.clone())).await.unwrap();
        assert!(matches!(outcome, FinalizeOutcome::Broadcast(_)));
        assert_eq!(flow.state(), CoordinatorState::Done);
        assert_eq!(contract.spends().len(), 1);
    }

    fn decode_all(fragments: &[String]) -> Vec<u8> {
        let mut session = ur_fragments::DecodeSession::new();
        for text in fragments {
            session.receive(text).unwrap();
        }
        session.take_result().unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_signature_not_counted() {
        let wallets = wallets();
        let call = call(Address([7; 20]));
        let mut flow = coordinator(&call, 2);
        flow.build().unwrap();
        flow.next_step().unwrap();

        let fragments = signature_fragments(&call, &wallets[1]);
        for text in &fragments {
            flow.on_scan(text).unwrap();
        }
        flow.build().unwrap();
        flow.next_step().unwrap();

        let mut event = CoordinatorEvent::Ignored;
        for text in &fragments {
            event = flow.on_scan(text).unwrap();
        }
        assert_eq!(event, CoordinatorEvent::Duplicate);
        assert_eq!(flow.round().remaining(), 1);
        assert_eq!(flow.state(), CoordinatorState::AwaitingScan);
    }

    #[tokio::test]
    async fn test_noise_while_scanning_is_ignored() {
        let call = call(Address([7; 20]));
        let mut flow = coordinator(&call, 2);
        flow.build().unwrap();
        flow.next_step().unwrap();

        assert_eq!(flow.on_scan("WIFI:S:cafe;;").unwrap(), CoordinatorEvent::Ignored);
        assert_eq!(flow.state(), CoordinatorState::AwaitingScan);
    }

    #[tokio::test]
    async fn test_foreign_payload_fails_round() {
        let wallets = wallets();
        let call = call(Address([7; 20]));
        let mut flow = coordinator(&call, 2);
        flow.build().unwrap();
        flow.next_step().unwrap();

        let ours = signature_fragments(&call, &wallets[0]);
        let theirs = signature_fragments(&call, &wallets[1]);
        assert!(Fragment::parse(&ours[0]).unwrap().digest.is_some());
        flow.on_scan(&ours[0]).unwrap();

        let err = flow.on_scan(&theirs[1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
        assert_eq!(flow.state(), CoordinatorState::Failed);
        assert!(flow.on_scan(&ours[1]).is_err());
    }

    #[tokio::test]
    async fn test_network_error_keeps_signatures_for_retry() {
        let wallets = wallets();
        let contract = MemoryContract::default();
        let address = contract.deploy(wallets.iter().map(signer).collect(), 1);
        let call = call(address);
        let mut flow = coordinator(&call, 1);
        flow.build().unwrap();
        flow.next_step().unwrap();
        for text in signature_fragments(&call, &wallets[1]) {
            flow.on_scan(&text).unwrap();
        }

        contract.fail_next_spends(1);
        let finalizer = AccountFinalizer::new(contract.clone());
        let err = flow.finalize(&finalizer).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(flow.state(), CoordinatorState::Finalizing);

        flow.finalize(&finalizer).await.unwrap();
        assert_eq!(flow.state(), CoordinatorState::Done);
    }

    #[tokio::test]
    async fn test_cancel_stops_display_and_rejects_events() {
        let call = call(Address([7; 20]));
        let mut flow = coordinator(&call, 2);
        flow.build().unwrap();
        assert!(flow.display().is_some_and(RotatingDisplay::is_running));

        flow.cancel();
        assert_eq!(flow.state(), CoordinatorState::Failed);
        assert!(flow.display().is_none());
        assert_eq!(flow.failure().unwrap().kind, ErrorKind::Cancelled);
        assert!(matches!(flow.next_step(), Err(Error::InvalidState { .. })));
    }

    #[tokio::test]
    async fn test_auto_advance_keeps_payload_on_screen() {
        let wallets = wallets();
        let call = call(Address([7; 20]));
        let mut flow = SigningCoordinator::new(
            TransactionProposal::Account(call.clone()),
            ROOT,
            2,
            3,
            CoordinatorConfig {
                auto_advance: true,
                ..Default::default()
            },
        )
        .unwrap();

        let shown = flow.build().unwrap();
        assert_eq!(flow.state(), CoordinatorState::AwaitingScan);
        assert!(shown.len() > 1);
        assert!(flow.current_fragment().is_some());
        assert!(flow.display().is_some_and(RotatingDisplay::is_running));
        assert!(flow.progress().is_some());

        let mut event = CoordinatorEvent::Ignored;
        for text in signature_fragments(&call, &wallets[0]) {
            event = flow.on_scan(&text).unwrap();
        }
        assert_eq!(event, CoordinatorEvent::SignatureAccepted { remaining: 1 });
        assert!(flow.current_fragment().is_none());

        // the next round is shown again while scanning
        flow.build().unwrap();
        assert!(flow.current_fragment().is_some());
        flow.cancel();
        assert!(flow.display().is_none());
    }

    #[tokio::test]
    async fn test_local_shortcut_for_single_signer() {
        let wallets = wallets();
        let contract = MemoryContract::default();
        let address = contract.deploy(vec![signer(&wallets[0])], 1);
        let call = call(address);
        let config = CoordinatorConfig {
            read_only: false,
            ..Default::default()
        };

        let mut flow = SigningCoordinator::new(
            TransactionProposal::Account(call.clone()),
            ROOT,
            1,
            1,
            config,
        )
        .unwrap();
        flow.sign_locally(&wallets[0]).unwrap();
        assert_eq!(flow.state(), CoordinatorState::Finalizing);
        flow.finalize(&AccountFinalizer::new(contract)).await.unwrap();

        // read-only or multi-signer wallets must go through the air gap
        let mut multi = coordinator(&call, 2);
        assert!(multi.sign_locally(&wallets[0]).is_err());
        assert_eq!(multi.state(), CoordinatorState::Building);
    }

    #[test]
    fn test_resume_with_all_signatures_goes_to_finalizing() {
        let wallets = wallets();
        let call = call(Address([7; 20]));
        let collected: Vec<SignatureShare> = wallets[..2]
            .iter()
            .map(|w| chain::sign(&TransactionProposal::Account(call.clone()), w, ROOT).unwrap())
            .collect();

        let mut flow = SigningCoordinator::resume(
            TransactionProposal::Account(call),
            ROOT,
            2,
            3,
            collected,
            CoordinatorConfig::default(),
        )
        .unwrap();
        assert!(flow.build().unwrap().is_empty());
        assert_eq!(flow.state(), CoordinatorState::Finalizing);
    }
}
