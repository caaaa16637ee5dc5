//! Hierarchical deterministic keys for the cold signer
//!
//! The signer holds a master extended private key. Scanned payloads carry a
//! root path and a short suffix; the suffix only ever selects a child below
//! the root and cannot walk anywhere else in the tree.

use crate::chain::evm;
use crate::types::Address;
use crate::{Error, Result};
use derivation_path::{ChildIndex, DerivationPath};
use hmac::{Hmac, Mac};
use k256::ecdsa::{SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::elliptic_curve::{Field, PrimeField};
use k256::Scalar;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Version bytes of a mainnet `xprv`
const XPRV_VERSION: [u8; 4] = [0x04, 0x88, 0xad, 0xe4];

/// Serialized extended key length, without checksum
const EXTENDED_KEY_LEN: usize = 78;

/// Components a scanned suffix may contain
pub const MAX_SUFFIX_DEPTH: usize = 3;

const HARDENED_OFFSET: u32 = 0x8000_0000;

/// Derives signing keys from a root path plus a scanned suffix
pub trait KeyDeriver: Send + Sync {
    fn derive(&self, root_path: &str, suffix: &DerivationSuffix) -> Result<DerivedKey>;
}

/// Relative, non-hardened path below a wallet root, e.g. `0/0`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationSuffix(Vec<u32>);

impl DerivationSuffix {
    pub fn indexes(&self) -> &[u32] {
        &self.0
    }
}

impl FromStr for DerivationSuffix {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.starts_with('m') || s.starts_with('/') {
            return Err(Error::Derivation(format!("suffix {s:?} must be relative")));
        }
        if s.is_empty() {
            return Ok(DerivationSuffix(Vec::new()));
        }

        let path: DerivationPath = format!("m/{s}")
            .parse()
            .map_err(|e| Error::Derivation(format!("Invalid suffix {s:?}: {e}")))?;

        let mut indexes = Vec::new();
        for child in &path {
            match child {
                ChildIndex::Normal(index) => indexes.push(*index),
                ChildIndex::Hardened(_) => {
                    return Err(Error::Derivation(format!(
                        "suffix {s:?} may not contain hardened steps"
                    )))
                }
            }
        }
        if indexes.len() > MAX_SUFFIX_DEPTH {
            return Err(Error::Derivation(format!(
                "suffix {s:?} is deeper than {MAX_SUFFIX_DEPTH} levels"
            )));
        }

        Ok(DerivationSuffix(indexes))
    }
}

impl fmt::Display for DerivationSuffix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        f.write_str(&parts.join("/"))
    }
}

/// Private key ready to sign. Never serialized; wiped on drop.
pub struct DerivedKey {
    signing_key: SigningKey,
}

impl DerivedKey {
    pub fn from_bytes(secret: &[u8; 32]) -> Result<Self> {
        let signing_key =
            SigningKey::from_slice(secret).map_err(|e| Error::Derivation(e.to_string()))?;
        Ok(Self { signing_key })
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.signing_key
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Account-model address of this key
    pub fn address(&self) -> Address {
        evm::address_of(self.verifying_key())
    }
}

impl ZeroizeOnDrop for DerivedKey {}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DerivedKey")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

/// BIP32 extended private key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ExtendedPrivateKey {
    #[zeroize(skip)]
    depth: u8,
    #[zeroize(skip)]
    parent_fingerprint: [u8; 4],
    #[zeroize(skip)]
    child_number: u32,
    chain_code: [u8; 32],
    secret: [u8; 32],
}

impl ExtendedPrivateKey {
    /// Master key from a BIP32 seed
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        if !(16..=64).contains(&seed.len()) {
            return Err(Error::Derivation(format!(
                "seed must be 16 to 64 bytes, got {}",
                seed.len()
            )));
        }

        let mut mac = Hmac::<Sha512>::new_from_slice(b"Bitcoin seed")
            .map_err(|e| Error::Derivation(e.to_string()))?;
        mac.update(seed);
        let output = mac.finalize().into_bytes();

        let mut secret = [0u8; 32];
        let mut chain_code = [0u8; 32];
        secret.copy_from_slice(&output[..32]);
        chain_code.copy_from_slice(&output[32..]);
        scalar_from_bytes(&secret)?;

        Ok(Self {
            depth: 0,
            parent_fingerprint: [0; 4],
            child_number: 0,
            chain_code,
            secret,
        })
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn chain_code(&self) -> &[u8; 32] {
        &self.chain_code
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret
    }

    /// Compressed SEC1 public key
    pub fn public_key(&self) -> Result<[u8; 33]> {
        let key = SigningKey::from_slice(&self.secret)
            .map_err(|e| Error::Derivation(e.to_string()))?;
        let point = key.verifying_key().to_encoded_point(true);
        let mut out = [0u8; 33];
        out.copy_from_slice(point.as_bytes());
        Ok(out)
    }

    /// First four bytes of HASH160 of the public key
    pub fn fingerprint(&self) -> Result<[u8; 4]> {
        let public = self.public_key()?;
        let hash = Ripemd160::digest(Sha256::digest(public));
        let mut out = [0u8; 4];
        out.copy_from_slice(&hash[..4]);
        Ok(out)
    }

    /// One child step; indexes at or above 2^31 are hardened
    pub fn derive_child(&self, index: u32) -> Result<Self> {
        let mut mac = Hmac::<Sha512>::new_from_slice(&self.chain_code)
            .map_err(|e| Error::Derivation(e.to_string()))?;
        if index >= HARDENED_OFFSET {
            mac.update(&[0u8]);
            mac.update(&self.secret);
        } else {
            mac.update(&self.public_key()?);
        }
        mac.update(&index.to_be_bytes());
        let output = mac.finalize().into_bytes();

        let mut tweak_bytes = [0u8; 32];
        tweak_bytes.copy_from_slice(&output[..32]);
        let tweak = scalar_from_bytes(&tweak_bytes)?;
        tweak_bytes.zeroize();

        let child = tweak + scalar_from_bytes(&self.secret)?;
        if bool::from(child.is_zero()) {
            return Err(Error::Derivation(format!("child {index} is invalid")));
        }

        let mut secret = [0u8; 32];
        secret.copy_from_slice(&child.to_bytes());
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&output[32..]);

        Ok(Self {
            depth: self.depth.checked_add(1).ok_or_else(|| {
                Error::Derivation("maximum derivation depth reached".into())
            })?,
            parent_fingerprint: self.fingerprint()?,
            child_number: index,
            chain_code,
            secret,
        })
    }

    /// Walk an absolute path such as `m/44'/60'/0'/0/0`
    pub fn derive_path(&self, path: &str) -> Result<Self> {
        let path: DerivationPath = path
            .parse()
            .map_err(|e| Error::Derivation(format!("Invalid path {path:?}: {e}")))?;

        let mut current = self.clone();
        for child in &path {
            let index = match child {
                ChildIndex::Normal(index) => *index,
                ChildIndex::Hardened(index) => *index | HARDENED_OFFSET,
            };
            current = current.derive_child(index)?;
        }
        Ok(current)
    }

    /// The signing key at this node
    pub fn to_derived_key(&self) -> Result<DerivedKey> {
        DerivedKey::from_bytes(&self.secret)
    }

    /// Base58check `xprv` form
    pub fn to_xprv(&self) -> String {
        let mut data = Vec::with_capacity(EXTENDED_KEY_LEN);
        data.extend_from_slice(&XPRV_VERSION);
        data.push(self.depth);
        data.extend_from_slice(&self.parent_fingerprint);
        data.extend_from_slice(&self.child_number.to_be_bytes());
        data.extend_from_slice(&self.chain_code);
        data.push(0);
        data.extend_from_slice(&self.secret);

        let encoded = bs58::encode(&data).with_check().into_string();
        data.zeroize();
        encoded
    }
}

impl FromStr for ExtendedPrivateKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut data = bs58::decode(s.trim())
            .with_check(None)
            .into_vec()
            .map_err(|e| Error::Derivation(format!("Invalid extended key: {e}")))?;

        let parsed = parse_extended(&data);
        data.zeroize();
        parsed
    }
}

fn parse_extended(data: &[u8]) -> Result<ExtendedPrivateKey> {
    if data.len() != EXTENDED_KEY_LEN {
        return Err(Error::Derivation(format!(
            "extended key must be {EXTENDED_KEY_LEN} bytes, got {}",
            data.len()
        )));
    }
    if data[..4] != XPRV_VERSION {
        return Err(Error::Derivation("not an xprv extended key".into()));
    }
    if data[45] != 0 {
        return Err(Error::Derivation("missing private key marker".into()));
    }

    let mut parent_fingerprint = [0u8; 4];
    parent_fingerprint.copy_from_slice(&data[5..9]);
    let mut child_number = [0u8; 4];
    child_number.copy_from_slice(&data[9..13]);
    let mut chain_code = [0u8; 32];
    chain_code.copy_from_slice(&data[13..45]);
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&data[46..78]);
    scalar_from_bytes(&secret)?;

    Ok(ExtendedPrivateKey {
        depth: data[4],
        parent_fingerprint,
        child_number: u32::from_be_bytes(child_number),
        chain_code,
        secret,
    })
}

impl fmt::Debug for ExtendedPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedPrivateKey")
            .field("depth", &self.depth)
            .field("child_number", &self.child_number)
            .finish_non_exhaustive()
    }
}

/// Non-zero scalar below the curve order
fn scalar_from_bytes(bytes: &[u8; 32]) -> Result<Scalar> {
    let scalar: Option<Scalar> = Scalar::from_repr((*bytes).into()).into();
    match scalar {
        Some(s) if !bool::from(s.is_zero()) => Ok(s),
        _ => Err(Error::Derivation("key material out of range".into())),
    }
}

/// Default [`KeyDeriver`]: BIP32 below a master extended private key
#[derive(Clone)]
pub struct HdWallet {
    master: ExtendedPrivateKey,
}

impl HdWallet {
    pub fn new(master: ExtendedPrivateKey) -> Self {
        Self { master }
    }

    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        Ok(Self::new(ExtendedPrivateKey::from_seed(seed)?))
    }

    pub fn master(&self) -> &ExtendedPrivateKey {
        &self.master
    }
}

impl FromStr for HdWallet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(Self::new(s.parse()?))
    }
}

impl fmt::Debug for HdWallet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HdWallet").finish_non_exhaustive()
    }
}

impl KeyDeriver for HdWallet {
    fn derive(&self, root_path: &str, suffix: &DerivationSuffix) -> Result<DerivedKey> {
        let mut node = self.master.derive_path(root_path)?;
        for &index in suffix.indexes() {
            node = node.derive_child(index)?;
        }
        node.to_derived_key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // BIP32 test vector 1
    const SEED: &str = "000102030405060708090a0b0c0d0e0f";
    const MASTER_XPRV: &str = "xprv9s21ZrQH143K3QTDL4LXw2F7HEK3wJUD2nW2nRk4stbPy6cq3jPPqjiChkVvvNKmPGJxWUtg6LnF5kejMRNNU3TGtRBeJgk33yuGBxrMPHi";
    const CHILD_0H_XPRV: &str = "xprv9uHRZZhk6KAJC1avXpDAp4MDc3sQKNxDiPvvkX8Br5ngLNv1TxvUxt4cV1rGL5hj6KCesnDYUhd7oWgT11eZG7XnxHrnYeSvkzY7d2bhkJ7";
    const CHILD_0H_1_XPRV: &str = "xprv9wTYmMFdV23N2TdNG573QoEsfRrWKQgWeibmLntzniatZvR9BmLnvSxqu53Kw1UmYPxLgboyZQaXwTCg8MSY3H2EU4pWcQDnRnrVA1xe8fs";

    fn master() -> ExtendedPrivateKey {
        ExtendedPrivateKey::from_seed(&hex::decode(SEED).unwrap()).unwrap()
    }

    #[test]
    fn test_master_from_seed() {
        let master = master();
        assert_eq!(
            hex::encode(master.secret_bytes()),
            "e8f32e723decf4051aefac8e2c93c9c5b214313817cdb01a1494b917c8436b35"
        );
        assert_eq!(
            hex::encode(master.chain_code()),
            "873dff81c02f525623fd1fe5167eac3a55a049de3d314bb42ee227ffed37d508"
        );
        assert_eq!(master.to_xprv(), MASTER_XPRV);
    }

    #[test]
    fn test_hardened_then_normal_child() {
        let child = master().derive_path("m/0'").unwrap();
        assert_eq!(
            hex::encode(child.secret_bytes()),
            "edb2e14f9ee77d26dd93b4ecede8d16ed408ce149b6cd80b0715a2d911a0afea"
        );
        assert_eq!(child.to_xprv(), CHILD_0H_XPRV);

        let grandchild = child.derive_child(1).unwrap();
        assert_eq!(grandchild.depth(), 2);
        assert_eq!(grandchild.to_xprv(), CHILD_0H_1_XPRV);
    }

    #[test]
    fn test_xprv_parse_round_trip() {
        let parsed: ExtendedPrivateKey = CHILD_0H_XPRV.parse().unwrap();
        assert_eq!(parsed.depth(), 1);
        assert_eq!(parsed.to_xprv(), CHILD_0H_XPRV);

        let mut broken = CHILD_0H_XPRV.to_string();
        broken.replace_range(20..21, "1");
        assert!(broken.parse::<ExtendedPrivateKey>().is_err());
    }

    #[test]
    fn test_wallet_derives_root_plus_suffix() {
        let wallet = HdWallet::new(master());
        let suffix: DerivationSuffix = "1".parse().unwrap();

        let key = wallet.derive("m/0'", &suffix).unwrap();
        let expected = master().derive_path("m/0'/1").unwrap().to_derived_key().unwrap();
        assert_eq!(key.address(), expected.address());
    }

    #[test]
    fn test_suffix_rules() {
        assert_eq!("0/0".parse::<DerivationSuffix>().unwrap().indexes(), &[0, 0]);
        assert!("".parse::<DerivationSuffix>().unwrap().indexes().is_empty());

        for bad in ["0'/0", "m/0/0", "/0", "0/0/0/0", "zero"] {
            assert!(bad.parse::<DerivationSuffix>().is_err(), "{bad}");
        }
    }

    #[test]
    fn test_debug_output_is_redacted() {
        let key = master().to_derived_key().unwrap();
        let rendered = format!("{key:?} {:?}", master());
        assert!(!rendered.contains("e8f32e72"));
    }
}
