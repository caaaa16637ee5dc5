//! Signature validation and submission
//!
//! Finalizers take the shares collected by a coordinator and move funds.
//! For multisig contracts every signature is recovered and checked against
//! the owner set before the spend call is made; nothing reaches the network
//! unless all checks pass.

use crate::chain::{evm, utxo};
use crate::proposal::{AccountCall, TransactionProposal, UtxoProposal};
use crate::types::{Address, HexData, RecoverableSignature, SignatureShare, TxId};
use crate::{Error, Result};
use std::collections::HashSet;
use tracing::{debug, info, instrument};

pub use ::async_trait::async_trait;

/// In-memory collaborators for tests and simulation
pub mod memory;

pub use memory::{MemoryContract, MemoryProposalService};

/// Gas limit for the multisig `spend` call
pub const DEFAULT_SPEND_GAS_LIMIT: u64 = 150_000;

/// Arguments of the multisig contract's `spend` entry point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendCall {
    pub destination: Address,
    pub value: u128,
    /// `27 + recovery id` per signature
    pub vs: Vec<u8>,
    pub rs: Vec<[u8; 32]>,
    pub ss: Vec<[u8; 32]>,
    pub data: HexData,
}

impl SpendCall {
    fn new(call: &AccountCall, signatures: &[RecoverableSignature]) -> Self {
        Self {
            destination: call.destination,
            value: call.value,
            vs: signatures.iter().map(RecoverableSignature::contract_v).collect(),
            rs: signatures.iter().map(|s| s.r).collect(),
            ss: signatures.iter().map(|s| s.s).collect(),
            data: call.data.clone(),
        }
    }
}

/// Account-model multisig contract, as seen through a node
#[async_trait]
pub trait MultisigContract: Send + Sync {
    async fn owners(&self, contract: &Address) -> Result<Vec<Address>>;

    async fn required(&self, contract: &Address) -> Result<usize>;

    /// Nonce the next spend must be signed over
    async fn spend_nonce(&self, contract: &Address) -> Result<u64>;

    /// Balance of the account paying gas
    async fn fee_balance(&self) -> Result<u128>;

    /// Submit the spend call
    async fn spend(&self, contract: &Address, call: SpendCall, gas_limit: u64) -> Result<TxId>;

    /// Wait until the submitted transaction is mined
    async fn wait_for_confirmation(&self, tx: &TxId) -> Result<()>;
}

/// Signature count reported by the proposal service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposalStatus {
    pub signed: usize,
    pub required: usize,
}

impl ProposalStatus {
    pub fn is_fully_signed(&self) -> bool {
        self.signed >= self.required
    }
}

/// Server holding UTXO transaction proposals
#[async_trait]
pub trait ProposalService: Send + Sync {
    /// Attach one signer's signatures; returns the updated count
    async fn add_signatures(&self, proposal_id: &str, signatures: &[String]) -> Result<ProposalStatus>;

    async fn broadcast(&self, proposal_id: &str) -> Result<TxId>;
}

/// How a finalization ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Transaction submitted and confirmed
    Broadcast(TxId),
    /// Signatures attached; someone else broadcasts
    Pending { signed: usize, required: usize },
}

/// Validates collected shares and submits the transaction
#[async_trait]
pub trait Finalizer: Send + Sync {
    async fn finalize(
        &self,
        proposal: &TransactionProposal,
        shares: &[SignatureShare],
    ) -> Result<FinalizeOutcome>;
}

/// Finalizer for multisig contract spends
pub struct AccountFinalizer<C> {
    contract: C,
    gas_limit: u64,
}

impl<C: MultisigContract> AccountFinalizer<C> {
    pub fn new(contract: C) -> Self {
        Self {
            contract,
            gas_limit: DEFAULT_SPEND_GAS_LIMIT,
        }
    }

    pub fn with_gas_limit(mut self, gas_limit: u64) -> Self {
        self.gas_limit = gas_limit;
        self
    }

    pub fn contract(&self) -> &C {
        &self.contract
    }

    /// Run every pre-submission check and build the spend call
    pub async fn validate(
        &self,
        call: &AccountCall,
        signatures: &[RecoverableSignature],
    ) -> Result<SpendCall> {
        let contract = &call.receive_address;

        let required = self.contract.required(contract).await?;
        if signatures.len() < required {
            return Err(Error::ThresholdNotMet {
                required,
                actual: signatures.len(),
            });
        }

        let owners = self.contract.owners(contract).await?;
        let mut seen = HashSet::new();
        for signature in signatures {
            let signer = evm::recover_address(call, signature)?;
            if !owners.contains(&signer) {
                return Err(Error::UnauthorizedSigner(signer));
            }
            if !seen.insert(signer) {
                return Err(Error::RepeatedSigner(signer));
            }
            debug!(%signer, "Signature recovered to owner");
        }

        let nonce = self.contract.spend_nonce(contract).await?;
        if nonce != call.nonce {
            return Err(Error::NonceMismatch {
                expected: nonce,
                found: call.nonce,
            });
        }

        if let Some(gas_price) = call.gas_price {
            let fee = gas_price.saturating_mul(u128::from(self.gas_limit_for(call)));
            let balance = self.contract.fee_balance().await?;
            if fee > balance {
                return Err(Error::InsufficientBalance { balance, fee });
            }
        }

        Ok(SpendCall::new(call, signatures))
    }

    fn gas_limit_for(&self, call: &AccountCall) -> u64 {
        call.gas_limit.unwrap_or(self.gas_limit)
    }
}

#[async_trait]
impl<C: MultisigContract> Finalizer for AccountFinalizer<C> {
    #[instrument(skip_all, fields(kind = %proposal.kind()))]
    async fn finalize(
        &self,
        proposal: &TransactionProposal,
        shares: &[SignatureShare],
    ) -> Result<FinalizeOutcome> {
        let call = match proposal {
            TransactionProposal::Account(call) => call,
            TransactionProposal::Utxo(_) => {
                return Err(Error::UnsupportedChain(
                    "contract finalizer cannot spend a UTXO proposal".into(),
                ))
            }
        };

        let signatures = shares
            .iter()
            .map(|share| match share {
                SignatureShare::Account(sig) => Ok(*sig),
                SignatureShare::Utxo(_) => Err(Error::InvalidSignature(
                    "UTXO signatures in a contract spend".into(),
                )),
            })
            .collect::<Result<Vec<_>>>()?;

        let spend = self.validate(call, &signatures).await?;
        info!(
            contract = %call.receive_address,
            destination = %call.destination,
            signatures = signatures.len(),
            "Submitting multisig spend"
        );

        let tx = self
            .contract
            .spend(&call.receive_address, spend, self.gas_limit_for(call))
            .await?;
        self.contract.wait_for_confirmation(&tx).await?;

        info!(%tx, "Spend confirmed");
        Ok(FinalizeOutcome::Broadcast(tx))
    }
}

/// Finalizer for UTXO proposals held by a proposal service
pub struct UtxoFinalizer<S> {
    service: S,
    broadcaster: bool,
}

impl<S: ProposalService> UtxoFinalizer<S> {
    /// `broadcaster` marks the wallet that sends the transaction once the
    /// last signature is in
    pub fn new(service: S, broadcaster: bool) -> Self {
        Self {
            service,
            broadcaster,
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    fn check(proposal: &UtxoProposal, shares: &[SignatureShare]) -> Result<Vec<Vec<String>>> {
        shares
            .iter()
            .map(|share| match share {
                SignatureShare::Utxo(signatures) => {
                    utxo::check_share(proposal, signatures)?;
                    Ok(signatures.clone())
                }
                SignatureShare::Account(_) => Err(Error::InvalidSignature(
                    "contract signature in a UTXO proposal".into(),
                )),
            })
            .collect()
    }
}

#[async_trait]
impl<S: ProposalService> Finalizer for UtxoFinalizer<S> {
    #[instrument(skip_all, fields(kind = %proposal.kind()))]
    async fn finalize(
        &self,
        proposal: &TransactionProposal,
        shares: &[SignatureShare],
    ) -> Result<FinalizeOutcome> {
        let proposal = match proposal {
            TransactionProposal::Utxo(p) => p,
            TransactionProposal::Account(_) => {
                return Err(Error::UnsupportedChain(
                    "UTXO finalizer cannot spend a contract call".into(),
                ))
            }
        };
        if shares.is_empty() {
            return Err(Error::ThresholdNotMet {
                required: 1,
                actual: 0,
            });
        }

        let mut status = ProposalStatus {
            signed: 0,
            required: 0,
        };
        for signatures in Self::check(proposal, shares)? {
            status = self.service.add_signatures(&proposal.id, &signatures).await?;
            debug!(proposal = %proposal.id, signed = status.signed, required = status.required, "Signatures attached");
        }

        if status.is_fully_signed() && self.broadcaster {
            let tx = self.service.broadcast(&proposal.id).await?;
            info!(proposal = %proposal.id, %tx, "Proposal broadcast");
            return Ok(FinalizeOutcome::Broadcast(tx));
        }

        info!(
            proposal = %proposal.id,
            signed = status.signed,
            required = status.required,
            "Proposal left for broadcast elsewhere"
        );
        Ok(FinalizeOutcome::Pending {
            signed: status.signed,
            required: status.required,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::DerivedKey;
    use crate::proposal::{UtxoInput, UtxoOutput};

    fn keys() -> Vec<DerivedKey> {
        (1..=3u8).map(|i| DerivedKey::from_bytes(&[i; 32]).unwrap()).collect()
    }

    fn call(contract: Address, nonce: u64) -> AccountCall {
        AccountCall {
            coin: "eth".into(),
            receive_address: contract,
            destination: "0x9dc9a9a2a753c13b63526d628b1bf43cabb468fe".parse().unwrap(),
            value: 250_000_000_000_000_000,
            data: HexData::default(),
            nonce,
            path: "0/0".into(),
            gas_price: None,
            gas_limit: None,
        }
    }

    fn setup() -> (MemoryContract, Address, Vec<DerivedKey>) {
        let keys = keys();
        let contract = MemoryContract::new(10u128.pow(18));
        let address = contract.deploy(keys.iter().map(DerivedKey::address).collect(), 2);
        (contract, address, keys)
    }

    fn shares(call: &AccountCall, keys: &[&DerivedKey]) -> Vec<SignatureShare> {
        keys.iter()
            .map(|k| SignatureShare::Account(evm::sign(call, k).unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn test_spend_after_validation() {
        let (contract, address, keys) = setup();
        let call = call(address, 0);
        let finalizer = AccountFinalizer::new(contract.clone());

        let outcome = finalizer
            .finalize(
                &TransactionProposal::Account(call.clone()),
                &shares(&call, &[&keys[2], &keys[0]]),
            )
            .await
            .unwrap();

        assert!(matches!(outcome, FinalizeOutcome::Broadcast(_)));
        let spends = contract.spends();
        assert_eq!(spends.len(), 1);
        assert_eq!(spends[0].gas_limit, DEFAULT_SPEND_GAS_LIMIT);
        assert!(spends[0].call.vs.iter().all(|v| *v == 27 || *v == 28));
        assert_eq!(contract.spend_nonce(&address).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_signer_never_spends() {
        let (contract, address, keys) = setup();
        let outsider = DerivedKey::from_bytes(&[9; 32]).unwrap();
        let call = call(address, 0);
        let finalizer = AccountFinalizer::new(contract.clone());

        let err = finalizer
            .finalize(
                &TransactionProposal::Account(call.clone()),
                &shares(&call, &[&keys[0], &outsider]),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::UnauthorizedSigner(a) if a == outsider.address()));
        assert!(contract.spends().is_empty());
    }

    #[tokio::test]
    async fn test_same_owner_twice_rejected() {
        let (contract, address, keys) = setup();
        let call = call(address, 0);
        let finalizer = AccountFinalizer::new(contract.clone());

        // identical share counted twice
        let share = shares(&call, &[&keys[1]]).remove(0);
        let err = finalizer
            .finalize(&TransactionProposal::Account(call), &[share.clone(), share])
            .await
            .unwrap_err();

        assert!(matches!(err, Error::RepeatedSigner(_)));
        assert!(contract.spends().is_empty());
    }

    #[tokio::test]
    async fn test_threshold_and_nonce_checks() {
        let (contract, address, keys) = setup();
        let finalizer = AccountFinalizer::new(contract.clone());

        let fresh = call(address, 0);
        let err = finalizer
            .finalize(
                &TransactionProposal::Account(fresh.clone()),
                &shares(&fresh, &[&keys[0]]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ThresholdNotMet { required: 2, actual: 1 }));

        let stale = call(address, 4);
        let err = finalizer
            .finalize(
                &TransactionProposal::Account(stale.clone()),
                &shares(&stale, &[&keys[0], &keys[1]]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NonceMismatch { expected: 0, found: 4 }));
        assert!(contract.spends().is_empty());
    }

    #[tokio::test]
    async fn test_fee_must_fit_balance() {
        let keys = keys();
        let contract = MemoryContract::new(1_000);
        let address = contract.deploy(keys.iter().map(DerivedKey::address).collect(), 1);
        let mut call = call(address, 0);
        call.gas_price = Some(1);

        let err = AccountFinalizer::new(contract.clone())
            .finalize(
                &TransactionProposal::Account(call.clone()),
                &shares(&call, &[&keys[0]]),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            Error::InsufficientBalance { balance: 1_000, fee: 150_000 }
        ));
        assert_eq!(err.kind(), crate::ErrorKind::Validation);
    }

    fn utxo_proposal(id: &str) -> UtxoProposal {
        UtxoProposal {
            id: id.into(),
            coin: "btc".into(),
            inputs: vec![UtxoInput {
                txid: "11".repeat(32),
                vout: 0,
                satoshis: 100_000,
                path: "0/3".into(),
                sighash: HexData(vec![5; 32]),
            }],
            outputs: vec![UtxoOutput {
                address: "bc1qexample".into(),
                amount: 95_000,
            }],
            fee: 5_000,
        }
    }

    fn utxo_share(proposal: &UtxoProposal, seed: u8) -> SignatureShare {
        let wallet = crate::keys::HdWallet::from_seed(&[seed; 32]).unwrap();
        SignatureShare::Utxo(utxo::sign(proposal, &wallet, "m/48'/0'/0'").unwrap())
    }

    #[tokio::test]
    async fn test_utxo_broadcasts_only_when_full_and_designated() {
        let proposal = utxo_proposal("txp-7");
        let service = MemoryProposalService::new();
        service.register("txp-7", 2);

        let passive = UtxoFinalizer::new(service.clone(), false);
        let outcome = passive
            .finalize(
                &TransactionProposal::Utxo(proposal.clone()),
                &[utxo_share(&proposal, 1), utxo_share(&proposal, 2)],
            )
            .await
            .unwrap();
        assert_eq!(outcome, FinalizeOutcome::Pending { signed: 2, required: 2 });
        assert!(service.broadcasts("txp-7").is_empty());

        let active = UtxoFinalizer::new(service.clone(), true);
        let outcome = active
            .finalize(
                &TransactionProposal::Utxo(proposal.clone()),
                &[utxo_share(&proposal, 1)],
            )
            .await
            .unwrap();
        assert!(matches!(outcome, FinalizeOutcome::Broadcast(_)));
        assert_eq!(service.broadcasts("txp-7").len(), 1);
    }

    #[tokio::test]
    async fn test_utxo_partial_stays_pending() {
        let proposal = utxo_proposal("txp-8");
        let service = MemoryProposalService::new();
        service.register("txp-8", 3);

        let outcome = UtxoFinalizer::new(service.clone(), true)
            .finalize(
                &TransactionProposal::Utxo(proposal.clone()),
                &[utxo_share(&proposal, 1)],
            )
            .await
            .unwrap();

        assert_eq!(outcome, FinalizeOutcome::Pending { signed: 1, required: 3 });
    }

    #[tokio::test]
    async fn test_utxo_bad_share_rejected_before_service() {
        let proposal = utxo_proposal("txp-9");
        let service = MemoryProposalService::new();
        service.register("txp-9", 1);

        let err = UtxoFinalizer::new(service.clone(), true)
            .finalize(
                &TransactionProposal::Utxo(proposal),
                &[SignatureShare::Utxo(vec!["3044".into(), "3045".into()])],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidSignature(_)));
        assert_eq!(service.status("txp-9").unwrap().signed, 0);
    }
}
