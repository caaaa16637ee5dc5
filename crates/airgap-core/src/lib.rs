//! # Airgap Core
//!
//! Multisig signing between a watch-only wallet and an offline signer, using
//! a screen and a camera as the only transport.
//!
//! This crate provides:
//! - Rotating display and scan aggregation over [`ur_fragments`]
//! - The watch-only [`SigningCoordinator`] and the offline [`ColdSigner`]
//! - Chain signing for UTXO inputs and multisig contract spends
//! - Finalizers that validate collected signatures before anything is sent
//!
//! ## Example
//!
//! ```rust,ignore
//! use airgap_core::{SigningCoordinator, CoordinatorConfig};
//!
//! let mut flow = SigningCoordinator::new(proposal, "m/44'/60'/0'", 2, 3, CoordinatorConfig::default())?;
//! let fragments = flow.build()?;
//! flow.next_step()?;
//! for text in camera {
//!     if flow.on_scan(&text)? == CoordinatorEvent::ReadyToFinalize {
//!         break;
//!     }
//! }
//! flow.finalize(&finalizer).await?;
//! ```

pub mod chain;
pub mod cold;
pub mod coordinator;
pub mod display;
pub mod error;
pub mod finalize;
pub mod keys;
pub mod proposal;
pub mod round;
pub mod scan;
pub mod types;

pub use cold::{ColdSigner, ColdSignerConfig, ColdSignerEvent, ColdSignerState};
pub use coordinator::{CoordinatorConfig, CoordinatorEvent, CoordinatorState, SigningCoordinator};
pub use display::{RotatingDisplay, DEFAULT_DISPLAY_PERIOD};
pub use error::{Error, ErrorKind, Failure, Result};
pub use finalize::{
    AccountFinalizer, FinalizeOutcome, Finalizer, MultisigContract, ProposalService,
    ProposalStatus, SpendCall, UtxoFinalizer,
};
pub use keys::{DerivationSuffix, DerivedKey, ExtendedPrivateKey, HdWallet, KeyDeriver};
pub use proposal::{AccountCall, TransactionProposal, UnsignedPayload, UtxoProposal};
pub use round::{RoundCounters, SigningRound};
pub use scan::{ScanAggregator, ScanOutcome, ScanProgress};
pub use types::{Address, ChainKind, HexData, RecoverableSignature, SignatureShare, TxId};

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Fragment capacity for unsigned contract-call payloads
pub const ACCOUNT_PAYLOAD_CAPACITY: usize = 100;

/// Fragment capacity for unsigned UTXO proposals
pub const UTXO_PROPOSAL_CAPACITY: usize = ur_fragments::DEFAULT_FRAGMENT_CAPACITY;

/// Fragment capacity for returned UTXO signatures
pub const UTXO_SIGNATURE_CAPACITY: usize = 80;

/// Fragment capacity for returned contract signatures
pub const ACCOUNT_SIGNATURE_CAPACITY: usize = 100;
