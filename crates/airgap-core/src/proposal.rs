//! Unsigned transaction proposals and their wire payload

use crate::round::RoundCounters;
use crate::types::{Address, ChainKind, HexData};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Suffix under the wallet root used for account-model signing keys
pub const DEFAULT_ACCOUNT_PATH: &str = "0/0";

/// Chain-specific unsigned transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum TransactionProposal {
    Utxo(UtxoProposal),
    Account(AccountCall),
}

impl TransactionProposal {
    pub fn kind(&self) -> ChainKind {
        match self {
            TransactionProposal::Utxo(_) => ChainKind::Utxo,
            TransactionProposal::Account(_) => ChainKind::AccountModel,
        }
    }

    pub fn coin(&self) -> &str {
        match self {
            TransactionProposal::Utxo(p) => &p.coin,
            TransactionProposal::Account(c) => &c.coin,
        }
    }
}

/// UTXO spend proposal, as held by the proposal service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoProposal {
    /// Proposal identifier at the proposal service
    pub id: String,
    pub coin: String,
    pub inputs: Vec<UtxoInput>,
    pub outputs: Vec<UtxoOutput>,
    pub fee: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoInput {
    pub txid: String,
    pub vout: u32,
    pub satoshis: u64,
    /// Derivation suffix of the key that owns this input
    pub path: String,
    /// 32-byte signature hash of this input
    pub sighash: HexData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoOutput {
    pub address: String,
    pub amount: u64,
}

/// Spend call against an account-model multisig contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountCall {
    pub coin: String,
    /// The multisig contract holding the funds
    pub receive_address: Address,
    pub destination: Address,
    #[serde(with = "amount")]
    pub value: u128,
    pub data: HexData,
    /// Contract spend nonce the signatures commit to
    pub nonce: u64,
    /// Derivation suffix of the signing key
    #[serde(default = "default_account_path")]
    pub path: String,
    #[serde(default, with = "amount::option", skip_serializing_if = "Option::is_none")]
    pub gas_price: Option<u128>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<u64>,
}

fn default_account_path() -> String {
    DEFAULT_ACCOUNT_PATH.to_string()
}

/// Wei amounts: a JSON number when it fits in 64 bits, a decimal string
/// otherwise. Both forms are accepted on input.
mod amount {
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        match u64::try_from(*value) {
            Ok(small) => serializer.serialize_u64(small),
            Err(_) => serializer.serialize_str(&value.to_string()),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        deserializer.deserialize_any(AmountVisitor)
    }

    struct AmountVisitor;

    impl<'de> Visitor<'de> for AmountVisitor {
        type Value = u128;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a non-negative integer or decimal string")
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<u128, E> {
            Ok(u128::from(v))
        }

        fn visit_u128<E: de::Error>(self, v: u128) -> Result<u128, E> {
            Ok(v)
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<u128, E> {
            u128::try_from(v).map_err(|_| E::custom("negative amount"))
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<u128, E> {
            v.parse().map_err(E::custom)
        }
    }

    pub mod option {
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(value: &Option<u128>, serializer: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => super::serialize(v, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u128>, D::Error> {
            #[derive(Deserialize)]
            struct Wrapper(#[serde(with = "super")] u128);

            Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(v)| v))
        }
    }
}

/// What the watch-only side shows to a cold signer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsignedPayload {
    pub txp: TransactionProposal,
    /// Wallet root the signing key hangs off
    pub root_path: String,
    pub round: RoundCounters,
}

impl UnsignedPayload {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::MalformedPayload(e.to_string()))
    }
}
