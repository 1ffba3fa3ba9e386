//! Core protocol types: accounts, transactions, blocks.
//!
//! Balances and transfer amounts are signed 64-bit integers so that a
//! malformed negative amount can be represented and rejected at admission.
//! Block hashes use SHA-256; transaction content hashes use BLAKE3.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::constants::NETWORK_SENDER;
use crate::error::TransactionError;

/// A 32-byte hash value.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
    bincode::Encode, bincode::Decode,
)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    /// The zero hash. Used as the genesis block's parent.
    pub const ZERO: Self = Self([0u8; 32]);

    /// Return the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Check if this is the zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Parse a 64-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Short prefix for log output.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl From<[u8; 32]> for Hash256 {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Hash256 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Ledger entry for one address.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub address: String,
    /// Spendable balance.
    pub balance: i64,
    /// Count of applied sending transactions.
    pub nonce: u64,
    pub is_validator: bool,
    /// Balance moved out of `balance` into validator or delegated stake.
    pub staked_amount: u64,
}

impl Account {
    /// A fresh account with zero balance and nonce.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            balance: 0,
            nonce: 0,
            is_validator: false,
            staked_amount: 0,
        }
    }
}

/// Transaction type discriminant, as carried on the legacy wire form.
#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default,
    bincode::Encode, bincode::Decode,
)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    #[default]
    Regular,
    Stake,
    Deploy,
    Call,
    Proposal,
    Vote,
}

impl TxType {
    fn tag(self) -> u8 {
        match self {
            TxType::Regular => 0,
            TxType::Stake => 1,
            TxType::Deploy => 2,
            TxType::Call => 3,
            TxType::Proposal => 4,
            TxType::Vote => 5,
        }
    }
}

/// Contract deployment payload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct DeployPayload {
    /// Opaque contract source handed to the VM.
    pub code: String,
}

/// Contract call payload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct CallPayload {
    pub function: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Governance proposal payload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ProposalPayload {
    pub description: String,
    #[serde(default)]
    pub actions: String,
    /// Voting period in blocks.
    pub duration: u64,
}

/// A vote direction.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
#[serde(rename_all = "lowercase")]
pub enum VoteChoice {
    For,
    Against,
}

/// Governance vote payload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct VotePayload {
    #[serde(rename = "proposalID")]
    pub proposal_id: String,
    pub choice: VoteChoice,
    pub weight: i64,
}

/// Typed transaction body, one variant per transaction type.
#[derive(
    Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default,
    bincode::Encode, bincode::Decode,
)]
pub enum TxPayload {
    /// Plain value transfer.
    #[default]
    Regular,
    /// Move `amount` into validator stake.
    Stake,
    Deploy(DeployPayload),
    Call(CallPayload),
    Proposal(ProposalPayload),
    Vote(VotePayload),
}

impl TxPayload {
    /// The discriminant of this payload.
    pub fn tx_type(&self) -> TxType {
        match self {
            TxPayload::Regular => TxType::Regular,
            TxPayload::Stake => TxType::Stake,
            TxPayload::Deploy(_) => TxType::Deploy,
            TxPayload::Call(_) => TxType::Call,
            TxPayload::Proposal(_) => TxType::Proposal,
            TxPayload::Vote(_) => TxType::Vote,
        }
    }

    /// Decode the legacy `(type, JSON data)` representation.
    ///
    /// Regular and Stake transactions ignore `data`. The remaining types
    /// require a JSON object matching their payload struct; anything else is
    /// rejected here so the ledger never sees an untyped payload.
    pub fn decode(tx_type: TxType, data: &str) -> Result<Self, TransactionError> {
        fn parse<T: serde::de::DeserializeOwned>(data: &str) -> Result<T, TransactionError> {
            serde_json::from_str(data).map_err(|e| TransactionError::InvalidPayload(e.to_string()))
        }

        match tx_type {
            TxType::Regular => Ok(TxPayload::Regular),
            TxType::Stake => Ok(TxPayload::Stake),
            TxType::Deploy => Ok(TxPayload::Deploy(parse(data)?)),
            TxType::Call => {
                // Call args arrive as arbitrary JSON values.
                #[derive(Deserialize)]
                struct RawCall {
                    function: String,
                    #[serde(default)]
                    args: Vec<serde_json::Value>,
                }
                let raw: RawCall = parse(data)?;
                let args = raw
                    .args
                    .into_iter()
                    .map(|v| match v {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .collect();
                Ok(TxPayload::Call(CallPayload { function: raw.function, args }))
            }
            TxType::Proposal => Ok(TxPayload::Proposal(parse(data)?)),
            TxType::Vote => Ok(TxPayload::Vote(parse(data)?)),
        }
    }

    fn write_signing_bytes(&self, out: &mut Vec<u8>) {
        out.push(self.tx_type().tag());
        match self {
            TxPayload::Regular | TxPayload::Stake => {}
            TxPayload::Deploy(p) => put_str(out, &p.code),
            TxPayload::Call(p) => {
                put_str(out, &p.function);
                out.extend_from_slice(&(p.args.len() as u64).to_le_bytes());
                for arg in &p.args {
                    put_str(out, arg);
                }
            }
            TxPayload::Proposal(p) => {
                put_str(out, &p.description);
                put_str(out, &p.actions);
                out.extend_from_slice(&p.duration.to_le_bytes());
            }
            TxPayload::Vote(p) => {
                put_str(out, &p.proposal_id);
                out.push(matches!(p.choice, VoteChoice::For) as u8);
                out.extend_from_slice(&p.weight.to_le_bytes());
            }
        }
    }
}

/// Append a length-prefixed string.
fn put_str(out: &mut Vec<u8>, s: &str) {
    put_bytes(out, s.as_bytes());
}

fn put_bytes(out: &mut Vec<u8>, b: &[u8]) {
    out.extend_from_slice(&(b.len() as u64).to_le_bytes());
    out.extend_from_slice(b);
}

/// A signed account transaction.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Transaction {
    pub payload: TxPayload,
    pub sender: String,
    pub recipient: String,
    pub amount: i64,
    pub fee: i64,
    pub nonce: u64,
    /// Unix seconds at creation.
    pub timestamp: i64,
    /// Free-form note, e.g. "block reward".
    pub memo: String,
    /// Ed25519 public key of the sender. Empty for network transactions.
    pub sender_public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Transaction {
    /// An unsigned regular transfer.
    pub fn transfer(
        sender: impl Into<String>,
        recipient: impl Into<String>,
        amount: i64,
        fee: i64,
        nonce: u64,
        timestamp: i64,
    ) -> Self {
        Self {
            payload: TxPayload::Regular,
            sender: sender.into(),
            recipient: recipient.into(),
            amount,
            fee,
            nonce,
            timestamp,
            memo: String::new(),
            sender_public_key: Vec::new(),
            signature: Vec::new(),
        }
    }

    /// The type discriminant of this transaction.
    pub fn tx_type(&self) -> TxType {
        self.payload.tx_type()
    }

    /// Whether this transaction is issued by the protocol itself.
    pub fn is_network(&self) -> bool {
        self.sender == NETWORK_SENDER
    }

    /// `amount + fee`, or `None` on overflow.
    pub fn total_debit(&self) -> Option<i64> {
        self.amount.checked_add(self.fee)
    }

    /// Canonical bytes covered by the signature and the content hash.
    ///
    /// Every field except `signature` is committed to, length-prefixed so
    /// that field boundaries cannot be shifted.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(128);
        self.payload.write_signing_bytes(&mut data);
        put_str(&mut data, &self.sender);
        put_str(&mut data, &self.recipient);
        data.extend_from_slice(&self.amount.to_le_bytes());
        data.extend_from_slice(&self.fee.to_le_bytes());
        data.extend_from_slice(&self.nonce.to_le_bytes());
        data.extend_from_slice(&self.timestamp.to_le_bytes());
        put_str(&mut data, &self.memo);
        put_bytes(&mut data, &self.sender_public_key);
        data
    }

    /// Content hash (BLAKE3 of the signing bytes). Used for pool dedup.
    pub fn hash(&self) -> Hash256 {
        Hash256(blake3::hash(&self.signing_bytes()).into())
    }
}

/// A block in the chain.
///
/// `hash` is a pure function of the other fields; see [`Block::calculate_hash`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Block {
    pub index: u64,
    /// Unix seconds.
    pub timestamp: i64,
    pub transactions: Vec<Transaction>,
    pub prev_hash: Hash256,
    /// Address of the forging validator.
    pub validator: String,
    /// Ed25519 public key of the forging validator. Empty for genesis.
    pub validator_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub hash: Hash256,
}

impl Block {
    /// Hash of every field except `signature` and `hash`. This is what the
    /// validator signs.
    pub fn signing_hash(&self) -> Hash256 {
        let mut hasher = Sha256::new();
        hasher.update(self.index.to_le_bytes());
        hasher.update(self.timestamp.to_le_bytes());
        hasher.update((self.transactions.len() as u64).to_le_bytes());
        for tx in &self.transactions {
            hasher.update(tx.hash().as_bytes());
            hasher.update((tx.signature.len() as u64).to_le_bytes());
            hasher.update(&tx.signature);
        }
        hasher.update(self.prev_hash.as_bytes());
        hasher.update((self.validator.len() as u64).to_le_bytes());
        hasher.update(self.validator.as_bytes());
        hasher.update((self.validator_key.len() as u64).to_le_bytes());
        hasher.update(&self.validator_key);
        Hash256(hasher.finalize().into())
    }

    /// Recompute the block hash from its fields.
    pub fn calculate_hash(&self) -> Hash256 {
        let mut hasher = Sha256::new();
        hasher.update(self.signing_hash().as_bytes());
        hasher.update(&self.signature);
        Hash256(hasher.finalize().into())
    }

    /// Whether the stored hash matches the recomputed one.
    pub fn has_valid_hash(&self) -> bool {
        !self.hash.is_zero() && self.hash == self.calculate_hash()
    }

    /// Fill in `hash` from the other fields.
    pub fn seal(mut self) -> Self {
        self.hash = self.calculate_hash();
        self
    }

    /// Sum of fees across all transactions.
    pub fn total_fees(&self) -> i64 {
        self.transactions.iter().map(|tx| tx.fee).sum()
    }
}
