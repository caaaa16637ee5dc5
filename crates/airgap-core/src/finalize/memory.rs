//! In-memory contract and proposal service for local testing

use super::{async_trait, MultisigContract, ProposalService, ProposalStatus, SpendCall};
use crate::chain::evm::keccak256;
use crate::types::{Address, TxId};
use crate::{Error, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// A spend the contract accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpendRecord {
    pub contract: Address,
    pub call: SpendCall,
    pub gas_limit: u64,
    pub tx: TxId,
}

#[derive(Debug, Default)]
struct ContractAccount {
    owners: Vec<Address>,
    required: usize,
    nonce: u64,
    spends: Vec<SpendRecord>,
}

/// In-memory multisig contracts sharing one fee-paying account
#[derive(Clone)]
pub struct MemoryContract {
    contracts: Arc<DashMap<Address, ContractAccount>>,
    fee_balance: u128,
    /// Upcoming spends to reject, as a node would on a nonce race
    failing_spends: Arc<AtomicUsize>,
}

impl MemoryContract {
    pub fn new(fee_balance: u128) -> Self {
        Self {
            contracts: Arc::new(DashMap::new()),
            fee_balance,
            failing_spends: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a contract with the given owners and threshold
    pub fn deploy(&self, owners: Vec<Address>, required: usize) -> Address {
        let hash = keccak256(Uuid::new_v4().as_bytes());
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(&hash[12..]);
        let address = Address(bytes);

        self.contracts.insert(
            address,
            ContractAccount {
                owners,
                required,
                ..Default::default()
            },
        );
        address
    }

    /// Reject the next `count` spend calls with a network error
    pub fn fail_next_spends(&self, count: usize) {
        self.failing_spends.store(count, Ordering::SeqCst);
    }

    /// All accepted spends, per contract in submission order
    pub fn spends(&self) -> Vec<SpendRecord> {
        self.contracts
            .iter()
            .flat_map(|entry| entry.spends.clone())
            .collect()
    }

    fn account<T>(&self, contract: &Address, f: impl FnOnce(&ContractAccount) -> T) -> Result<T> {
        self.contracts
            .get(contract)
            .map(|entry| f(entry.value()))
            .ok_or_else(|| Error::Network(format!("no contract at {contract}")))
    }
}

impl Default for MemoryContract {
    fn default() -> Self {
        Self::new(u128::MAX)
    }
}

#[async_trait]
impl MultisigContract for MemoryContract {
    async fn owners(&self, contract: &Address) -> Result<Vec<Address>> {
        self.account(contract, |a| a.owners.clone())
    }

    async fn required(&self, contract: &Address) -> Result<usize> {
        self.account(contract, |a| a.required)
    }

    async fn spend_nonce(&self, contract: &Address) -> Result<u64> {
        self.account(contract, |a| a.nonce)
    }

    async fn fee_balance(&self) -> Result<u128> {
        Ok(self.fee_balance)
    }

    async fn spend(&self, contract: &Address, call: SpendCall, gas_limit: u64) -> Result<TxId> {
        let pending_failures = self.failing_spends.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.failing_spends.store(pending_failures - 1, Ordering::SeqCst);
            return Err(Error::Network("replacement transaction underpriced".into()));
        }

        let mut account = self
            .contracts
            .get_mut(contract)
            .ok_or_else(|| Error::Network(format!("no contract at {contract}")))?;
        if call.vs.len() < account.required {
            return Err(Error::Network("execution reverted".into()));
        }

        let tx = TxId(format!("0x{}", Uuid::new_v4().simple()));
        account.nonce += 1;
        account.spends.push(SpendRecord {
            contract: *contract,
            call,
            gas_limit,
            tx: tx.clone(),
        });
        Ok(tx)
    }

    async fn wait_for_confirmation(&self, tx: &TxId) -> Result<()> {
        let known = self
            .contracts
            .iter()
            .any(|entry| entry.spends.iter().any(|s| &s.tx == tx));
        if known {
            Ok(())
        } else {
            Err(Error::Network(format!("unknown transaction {tx}")))
        }
    }
}

#[derive(Debug, Default)]
struct ProposalRecord {
    required: usize,
    signatures: Vec<Vec<String>>,
    broadcasts: Vec<TxId>,
}

/// In-memory proposal server
#[derive(Clone, Default)]
pub struct MemoryProposalService {
    proposals: Arc<DashMap<String, ProposalRecord>>,
}

impl MemoryProposalService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a proposal needing `required` signers
    pub fn register(&self, proposal_id: &str, required: usize) {
        self.proposals.insert(
            proposal_id.to_string(),
            ProposalRecord {
                required,
                ..Default::default()
            },
        );
    }

    pub fn status(&self, proposal_id: &str) -> Option<ProposalStatus> {
        self.proposals.get(proposal_id).map(|p| ProposalStatus {
            signed: p.signatures.len(),
            required: p.required,
        })
    }

    pub fn broadcasts(&self, proposal_id: &str) -> Vec<TxId> {
        self.proposals
            .get(proposal_id)
            .map(|p| p.broadcasts.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProposalService for MemoryProposalService {
    async fn add_signatures(&self, proposal_id: &str, signatures: &[String]) -> Result<ProposalStatus> {
        let mut record = self
            .proposals
            .get_mut(proposal_id)
            .ok_or_else(|| Error::Network(format!("unknown proposal {proposal_id}")))?;

        // the same signer posting again does not add a signature
        if !record.signatures.iter().any(|s| s.as_slice() == signatures) {
            record.signatures.push(signatures.to_vec());
        }

        Ok(ProposalStatus {
            signed: record.signatures.len(),
            required: record.required,
        })
    }

    async fn broadcast(&self, proposal_id: &str) -> Result<TxId> {
        let mut record = self
            .proposals
            .get_mut(proposal_id)
            .ok_or_else(|| Error::Network(format!("unknown proposal {proposal_id}")))?;
        if record.signatures.len() < record.required {
            return Err(Error::Network("proposal is not fully signed".into()));
        }

        let tx = TxId(Uuid::new_v4().simple().to_string());
        record.broadcasts.push(tx.clone());
        Ok(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_contract_tracks_nonce_and_failures() {
        let contract = MemoryContract::default();
        let owner = Address([1; 20]);
        let address = contract.deploy(vec![owner], 1);
        let call = SpendCall {
            destination: owner,
            value: 1,
            vs: vec![27],
            rs: vec![[1; 32]],
            ss: vec![[2; 32]],
            data: Default::default(),
        };

        contract.fail_next_spends(1);
        let err = contract.spend(&address, call.clone(), 150_000).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Network);
        assert_eq!(contract.spend_nonce(&address).await.unwrap(), 0);

        let tx = contract.spend(&address, call, 150_000).await.unwrap();
        contract.wait_for_confirmation(&tx).await.unwrap();
        assert_eq!(contract.spend_nonce(&address).await.unwrap(), 1);
        assert!(contract.owners(&Address([9; 20])).await.is_err());
    }

    #[tokio::test]
    async fn test_service_counts_distinct_signers() {
        let service = MemoryProposalService::new();
        service.register("p", 2);

        let sigs = vec!["3044".to_string()];
        assert_eq!(service.add_signatures("p", &sigs).await.unwrap().signed, 1);
        assert_eq!(service.add_signatures("p", &sigs).await.unwrap().signed, 1);
        assert!(service.broadcast("p").await.is_err());

        let status = service.add_signatures("p", &["3045".to_string()]).await.unwrap();
        assert!(status.is_fully_signed());
        service.broadcast("p").await.unwrap();
        assert_eq!(service.broadcasts("p").len(), 1);
    }
}
