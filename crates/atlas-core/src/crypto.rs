//! Ed25519 keys, address derivation, and transaction/block signatures.
//!
//! An address is `0x` followed by the hex of the last 20 bytes of
//! SHA-256(public key). Transactions are signed over
//! [`Transaction::signing_bytes`]; blocks over [`Block::signing_hash`].

use ed25519_dalek::{Signer, Verifier};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::constants::{ADDRESS_HEX_LEN, GENESIS_VALIDATOR, NETWORK_SENDER};
use crate::error::CryptoError;
use crate::traits::{BlockSigner, SignatureVerifier};
use crate::types::{Block, Transaction};

/// Ed25519 keypair.
pub struct KeyPair {
    signing_key: ed25519_dalek::SigningKey,
}

impl KeyPair {
    /// Generate a random keypair using the OS RNG.
    pub fn generate() -> Self {
        let mut csprng = rand::rngs::OsRng;
        Self {
            signing_key: ed25519_dalek::SigningKey::generate(&mut csprng),
        }
    }

    /// Create a keypair from 32-byte secret key material.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self {
            signing_key: ed25519_dalek::SigningKey::from_bytes(&bytes),
        }
    }

    /// Parse a hex-encoded 32-byte secret.
    pub fn from_secret_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim()).map_err(|_| CryptoError::InvalidPublicKey)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self::from_secret_bytes(arr))
    }

    /// Raw public key bytes.
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The address controlled by this key.
    pub fn address(&self) -> String {
        address_from_public_key(&self.public_key_bytes())
    }

    /// Sign a message, returning the raw 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Fill in the sender public key and signature of `tx`.
    pub fn sign_transaction(&self, tx: &mut Transaction) {
        tx.sender_public_key = self.public_key_bytes().to_vec();
        tx.signature = self.sign(&tx.signing_bytes()).to_vec();
    }
}

impl Clone for KeyPair {
    fn clone(&self) -> Self {
        Self::from_secret_bytes(self.signing_key.to_bytes())
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("address", &self.address())
            .finish_non_exhaustive()
    }
}

impl BlockSigner for KeyPair {
    fn address(&self) -> String {
        KeyPair::address(self)
    }

    fn public_key(&self) -> Vec<u8> {
        self.public_key_bytes().to_vec()
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        KeyPair::sign(self, message).to_vec()
    }
}

/// Derive the address for a raw public key.
pub fn address_from_public_key(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    format!("0x{}", hex::encode(&digest[digest.len() - 20..]))
}

/// Whether `s` is a well-formed address: 40 hex digits with an optional
/// `0x` prefix.
pub fn is_valid_address(s: &str) -> bool {
    let body = s.strip_prefix("0x").unwrap_or(s);
    body.len() == ADDRESS_HEX_LEN && body.bytes().all(|b| b.is_ascii_hexdigit())
}

fn verify_raw(public_key: &[u8], message: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
    let pk: [u8; 32] = public_key
        .try_into()
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let vk = ed25519_dalek::VerifyingKey::from_bytes(&pk).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig: [u8; 64] = signature
        .try_into()
        .map_err(|_| CryptoError::InvalidSignature)?;
    vk.verify(message, &ed25519_dalek::Signature::from_bytes(&sig))
        .map_err(|_| CryptoError::VerificationFailed)
}

/// Ed25519 implementation of [`SignatureVerifier`].
///
/// Network-issued transactions and the genesis block carry sentinel
/// signatures and are accepted without a key.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify_transaction(&self, tx: &Transaction) -> Result<(), CryptoError> {
        if tx.sender == NETWORK_SENDER {
            return Ok(());
        }
        if address_from_public_key(&tx.sender_public_key) != tx.sender {
            return Err(CryptoError::AddressMismatch(tx.sender.clone()));
        }
        verify_raw(&tx.sender_public_key, &tx.signing_bytes(), &tx.signature)
    }

    fn verify_block(&self, block: &Block) -> Result<(), CryptoError> {
        if block.index == 0 && block.validator == GENESIS_VALIDATOR {
            return Ok(());
        }
        if address_from_public_key(&block.validator_key) != block.validator {
            return Err(CryptoError::AddressMismatch(block.validator.clone()));
        }
        verify_raw(
            &block.validator_key,
            block.signing_hash().as_bytes(),
            &block.signature,
        )?;
        block
            .transactions
            .iter()
            .try_for_each(|tx| self.verify_transaction(tx))
    }
}
