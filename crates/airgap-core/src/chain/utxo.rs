//! UTXO input signing and signature checks

use crate::keys::{DerivationSuffix, KeyDeriver};
use crate::proposal::UtxoProposal;
use crate::{Error, Result};
use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::Signature;
use tracing::debug;

/// Sign every input's sighash with the key at `root_path` + the input path.
/// Returns hex DER signatures in input order.
pub fn sign<D: KeyDeriver + ?Sized>(
    proposal: &UtxoProposal,
    deriver: &D,
    root_path: &str,
) -> Result<Vec<String>> {
    if proposal.inputs.is_empty() {
        return Err(Error::MalformedPayload("proposal has no inputs".into()));
    }

    let mut signatures = Vec::with_capacity(proposal.inputs.len());
    for (i, input) in proposal.inputs.iter().enumerate() {
        let sighash = input.sighash.as_slice();
        if sighash.len() != 32 {
            return Err(Error::MalformedPayload(format!(
                "input {i} sighash must be 32 bytes, got {}",
                sighash.len()
            )));
        }

        let suffix: DerivationSuffix = input.path.parse()?;
        let key = deriver.derive(root_path, &suffix)?;
        let signature: Signature = key
            .signing_key()
            .sign_prehash(sighash)
            .map_err(|e| Error::Crypto(e.to_string()))?;

        debug!(input = i, path = %suffix, "Input signed");
        signatures.push(hex::encode(signature.to_der().as_bytes()));
    }

    Ok(signatures)
}

/// Check that a share covers each input once with a well-formed DER signature
pub fn check_share(proposal: &UtxoProposal, signatures: &[String]) -> Result<()> {
    if signatures.len() != proposal.inputs.len() {
        return Err(Error::InvalidSignature(format!(
            "expected {} input signatures, got {}",
            proposal.inputs.len(),
            signatures.len()
        )));
    }

    for (i, sig) in signatures.iter().enumerate() {
        let der = hex::decode(sig)
            .map_err(|e| Error::InvalidSignature(format!("input {i}: {e}")))?;
        Signature::from_der(&der)
            .map_err(|e| Error::InvalidSignature(format!("input {i}: {e}")))?;
    }
    Ok(())
}
