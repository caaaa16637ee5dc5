//! Core types shared by both sides of the air gap

use crate::chain::evm::keccak256;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 20-byte account address
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(pub [u8; 20]);

impl Address {
    /// Mixed-case checksummed form (EIP-55)
    pub fn to_checksum(&self) -> String {
        let lower = hex::encode(self.0);
        let hash = keccak256(lower.as_bytes());

        let mut out = String::with_capacity(42);
        out.push_str("0x");
        for (i, c) in lower.chars().enumerate() {
            let nibble = (hash[i / 2] >> (if i % 2 == 0 { 4 } else { 0 })) & 0x0f;
            if c.is_ascii_alphabetic() && nibble >= 8 {
                out.push(c.to_ascii_uppercase());
            } else {
                out.push(c);
            }
        }
        out
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
        let bytes = hex::decode(digits)
            .map_err(|e| Error::MalformedPayload(format!("Invalid address {s:?}: {e}")))?;
        let array: [u8; 20] = bytes
            .try_into()
            .map_err(|_| Error::MalformedPayload(format!("Invalid address length: {s:?}")))?;
        Ok(Address(array))
    }
}

impl TryFrom<String> for Address {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<Address> for String {
    fn from(a: Address) -> Self {
        a.to_checksum()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_checksum())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_checksum())
    }
}

/// `0x`-prefixed byte string
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HexData(pub Vec<u8>);

impl HexData {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for HexData {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
        hex::decode(digits)
            .map(HexData)
            .map_err(|e| Error::MalformedPayload(format!("Invalid hex data: {e}")))
    }
}

impl TryFrom<String> for HexData {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<HexData> for String {
    fn from(d: HexData) -> Self {
        format!("0x{}", hex::encode(d.0))
    }
}

impl From<Vec<u8>> for HexData {
    fn from(bytes: Vec<u8>) -> Self {
        HexData(bytes)
    }
}

/// Transaction identifier returned by the network
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxId(pub String);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Chain family, selecting signing and validation rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainKind {
    /// Bitcoin-style inputs and outputs
    Utxo,
    /// Multisig contract call on an account-model chain
    AccountModel,
}

impl fmt::Display for ChainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainKind::Utxo => f.write_str("utxo"),
            ChainKind::AccountModel => f.write_str("account-model"),
        }
    }
}

/// ECDSA signature (r, s) with recovery id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SignatureWire", into = "SignatureWire")]
pub struct RecoverableSignature {
    /// R component
    pub r: [u8; 32],
    /// S component
    pub s: [u8; 32],
    /// Recovery ID (0 or 1)
    pub v: u8,
}

impl RecoverableSignature {
    /// Create a new signature
    pub fn new(r: [u8; 32], s: [u8; 32], v: u8) -> Self {
        Self { r, s, v }
    }

    /// Convert to bytes (r || s)
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.r);
        bytes[32..].copy_from_slice(&self.s);
        bytes
    }

    /// The `v` value expected by the multisig contract
    pub fn contract_v(&self) -> u8 {
        27 + self.v
    }
}

/// Wire shape `{ r: "0x..", s: "0x..", v: 0 }`
#[derive(Serialize, Deserialize)]
struct SignatureWire {
    r: String,
    s: String,
    v: u8,
}

impl TryFrom<SignatureWire> for RecoverableSignature {
    type Error = Error;

    fn try_from(wire: SignatureWire) -> Result<Self> {
        let v = match wire.v {
            0 | 1 => wire.v,
            27 | 28 => wire.v - 27,
            other => {
                return Err(Error::InvalidSignature(format!("recovery id {other} out of range")))
            }
        };
        Ok(Self {
            r: parse_word(&wire.r)?,
            s: parse_word(&wire.s)?,
            v,
        })
    }
}

impl From<RecoverableSignature> for SignatureWire {
    fn from(sig: RecoverableSignature) -> Self {
        Self {
            r: format!("0x{}", hex::encode(sig.r)),
            s: format!("0x{}", hex::encode(sig.s)),
            v: sig.v,
        }
    }
}

fn parse_word(s: &str) -> Result<[u8; 32]> {
    let data: HexData = s.parse()?;
    data.0
        .try_into()
        .map_err(|_| Error::InvalidSignature(format!("expected 32-byte word, got {s:?}")))
}

/// Signature contribution returned by one cold signer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureShare {
    /// DER signatures, hex encoded, one per input in input order
    Utxo(Vec<String>),
    /// Signature over the contract's spend message
    Account(RecoverableSignature),
}

impl SignatureShare {
    pub fn kind(&self) -> ChainKind {
        match self {
            SignatureShare::Utxo(_) => ChainKind::Utxo,
            SignatureShare::Account(_) => ChainKind::AccountModel,
        }
    }

    /// Encode for the return trip across the air gap
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        match self {
            SignatureShare::Utxo(signatures) => Ok(signatures.join(",").into_bytes()),
            SignatureShare::Account(sig) => Ok(serde_json::to_vec(sig)?),
        }
    }

    /// Decode a scanned signature payload for the given chain family
    pub fn from_payload(kind: ChainKind, payload: &[u8]) -> Result<Self> {
        match kind {
            ChainKind::Utxo => {
                let text = std::str::from_utf8(payload)
                    .map_err(|e| Error::MalformedPayload(e.to_string()))?;
                let signatures: Vec<String> =
                    text.split(',').map(|s| s.trim().to_string()).collect();
                if signatures
                    .iter()
                    .any(|s| s.is_empty() || hex::decode(s).is_err())
                {
                    return Err(Error::MalformedPayload(
                        "expected comma-separated hex signatures".into(),
                    ));
                }
                Ok(SignatureShare::Utxo(signatures))
            }
            ChainKind::AccountModel => {
                let sig: RecoverableSignature = serde_json::from_slice(payload)
                    .map_err(|e| Error::MalformedPayload(e.to_string()))?;
                Ok(SignatureShare::Account(sig))
            }
        }
    }
}
