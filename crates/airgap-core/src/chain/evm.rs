//! Account-model multisig contract message hashing, signing and recovery

use crate::keys::DerivedKey;
use crate::proposal::AccountCall;
use crate::types::{Address, RecoverableSignature};
use crate::{Error, Result};
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use tiny_keccak::{Hasher, Keccak};

/// Prefix applied by `personal_sign` to a 32-byte message
const PERSONAL_MESSAGE_PREFIX: &[u8] = b"\x19Ethereum Signed Message:\n32";

pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut out = [0u8; 32];
    hasher.finalize(&mut out);
    out
}

fn uint256(value: u128) -> [u8; 32] {
    let mut word = [0u8; 32];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Hash of the tightly packed spend arguments the contract rebuilds:
/// `receiveAddress ‖ destination ‖ value ‖ data ‖ nonce`.
pub fn message_hash(call: &AccountCall) -> [u8; 32] {
    let data = call.data.as_slice();
    let mut packed = Vec::with_capacity(20 + 20 + 32 + data.len() + 32);
    packed.extend_from_slice(&call.receive_address.0);
    packed.extend_from_slice(&call.destination.0);
    packed.extend_from_slice(&uint256(call.value));
    packed.extend_from_slice(data);
    packed.extend_from_slice(&uint256(u128::from(call.nonce)));
    keccak256(&packed)
}

/// The digest actually signed: the message hash under the personal-message
/// prefix.
pub fn signing_digest(call: &AccountCall) -> [u8; 32] {
    let mut prefixed = Vec::with_capacity(PERSONAL_MESSAGE_PREFIX.len() + 32);
    prefixed.extend_from_slice(PERSONAL_MESSAGE_PREFIX);
    prefixed.extend_from_slice(&message_hash(call));
    keccak256(&prefixed)
}

/// Address controlled by a public key
pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let hash = keccak256(&point.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash[12..]);
    Address(address)
}

/// Sign the spend message for `call`
pub fn sign(call: &AccountCall, key: &DerivedKey) -> Result<RecoverableSignature> {
    let digest = signing_digest(call);
    let (signature, recovery_id) = key
        .signing_key()
        .sign_prehash_recoverable(&digest)
        .map_err(|e| Error::Crypto(e.to_string()))?;

    let (r, s) = signature.split_bytes();
    let mut r_bytes = [0u8; 32];
    let mut s_bytes = [0u8; 32];
    r_bytes.copy_from_slice(&r);
    s_bytes.copy_from_slice(&s);

    Ok(RecoverableSignature::new(r_bytes, s_bytes, recovery_id.to_byte()))
}

/// Recover the address that produced `signature` over `call`
pub fn recover_address(call: &AccountCall, signature: &RecoverableSignature) -> Result<Address> {
    let digest = signing_digest(call);
    let sig = Signature::from_scalars(signature.r, signature.s)
        .map_err(|e| Error::InvalidSignature(e.to_string()))?;
    let recovery_id = RecoveryId::from_byte(signature.v)
        .ok_or_else(|| Error::InvalidSignature(format!("bad recovery id {}", signature.v)))?;

    let key = VerifyingKey::recover_from_prehash(&digest, &sig, recovery_id)
        .map_err(|e| Error::InvalidSignature(e.to_string()))?;
    Ok(address_of(&key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HexData;

    fn call(nonce: u64) -> AccountCall {
        AccountCall {
            coin: "eth".into(),
            receive_address: "0x9d71037b73b6a23f40a1241e4a34a2054258b9bb".parse().unwrap(),
            destination: "0x9dc9a9a2a753c13b63526d628b1bf43cabb468fe".parse().unwrap(),
            value: 1_000_000_000_000_000,
            data: HexData::default(),
            nonce,
            path: "0/0".into(),
            gas_price: None,
            gas_limit: None,
        }
    }

    #[test]
    fn test_keccak_empty() {
        assert_eq!(
            hex::encode(keccak256(b"")),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_known_key_address() {
        // private key 1 controls the generator point's address
        let mut secret = [0u8; 32];
        secret[31] = 1;
        let key = DerivedKey::from_bytes(&secret).unwrap();

        assert_eq!(
            key.address().to_string(),
            "0x7E5F4552091A69125d5DfCb7b8C2659029395Bdf"
        );
    }

    #[test]
    fn test_sign_then_recover() {
        let key = DerivedKey::from_bytes(&[0x42; 32]).unwrap();
        let call = call(5);

        let signature = sign(&call, &key).unwrap();
        assert!(signature.v <= 1);
        assert_eq!(recover_address(&call, &signature).unwrap(), key.address());
    }

    #[test]
    fn test_nonce_is_part_of_message() {
        assert_ne!(signing_digest(&call(5)), signing_digest(&call(6)));

        let key = DerivedKey::from_bytes(&[0x42; 32]).unwrap();
        let signature = sign(&call(5), &key).unwrap();

        // recovery over a different message yields some other address
        let recovered = recover_address(&call(6), &signature).unwrap();
        assert_ne!(recovered, key.address());
    }

    #[test]
    fn test_zero_signature_rejected() {
        let signature = RecoverableSignature::new([0; 32], [0; 32], 0);
        assert!(matches!(
            recover_address(&call(1), &signature),
            Err(Error::InvalidSignature(_))
        ));
    }
}
