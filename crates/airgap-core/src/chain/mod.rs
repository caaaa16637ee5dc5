//! Chain-specific signing, dispatched on the proposal family

pub mod evm;
pub mod utxo;

use crate::keys::{DerivationSuffix, KeyDeriver};
use crate::proposal::TransactionProposal;
use crate::types::SignatureShare;
use crate::Result;
use tracing::instrument;

/// Produce this signer's share for a proposal
#[instrument(skip(proposal, deriver), fields(kind = %proposal.kind()))]
pub fn sign<D: KeyDeriver + ?Sized>(
    proposal: &TransactionProposal,
    deriver: &D,
    root_path: &str,
) -> Result<SignatureShare> {
    match proposal {
        TransactionProposal::Utxo(p) => Ok(SignatureShare::Utxo(utxo::sign(p, deriver, root_path)?)),
        TransactionProposal::Account(call) => {
            let suffix: DerivationSuffix = call.path.parse()?;
            let key = deriver.derive(root_path, &suffix)?;
            Ok(SignatureShare::Account(evm::sign(call, &key)?))
        }
    }
}
