//! Wire message types for the Atlas sync protocol.
//!
//! All messages are serialized as MAGIC_BYTES prefix + bincode payload.
//! Requests and responses are correlated strictly by `request_id`.

use atlas_core::constants::MAGIC_BYTES;
use atlas_core::error::NetworkError;
use atlas_core::types::{Block, Hash256};
use serde::{Deserialize, Serialize};

/// Maximum encoded message size (a full block response with framing).
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Discriminant used to route inbound messages to their handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    ChainStatusRequest,
    ChainStatusResponse,
    BlockRequest,
    BlockResponse,
    ForkResolution,
}

/// A peer's view of its chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ChainStatus {
    pub height: u64,
    pub latest_hash: Hash256,
    pub genesis_hash: Hash256,
    pub total_blocks: u64,
    pub is_syncing: bool,
    pub peer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ChainStatusRequest {
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ChainStatusResponse {
    pub status: ChainStatus,
    pub request_id: String,
}

/// Request for blocks `from_index..=to_index`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct BlockRequest {
    pub from_index: u64,
    pub to_index: u64,
    pub request_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct BlockResponse {
    pub blocks: Vec<Block>,
    pub request_id: String,
    /// Set when the peer could not serve the range.
    pub error: Option<String>,
}

/// Notification that a peer resolved a fork.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ForkResolution {
    pub fork_height: u64,
    pub canonical_chain_hashes: Vec<Hash256>,
    pub forked_chain_hashes: Vec<Hash256>,
    pub reason: String,
}

/// A message exchanged between Atlas peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum SyncMessage {
    ChainStatusRequest(ChainStatusRequest),
    ChainStatusResponse(ChainStatusResponse),
    BlockRequest(BlockRequest),
    BlockResponse(BlockResponse),
    ForkResolution(ForkResolution),
}

impl SyncMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            SyncMessage::ChainStatusRequest(_) => MessageType::ChainStatusRequest,
            SyncMessage::ChainStatusResponse(_) => MessageType::ChainStatusResponse,
            SyncMessage::BlockRequest(_) => MessageType::BlockRequest,
            SyncMessage::BlockResponse(_) => MessageType::BlockResponse,
            SyncMessage::ForkResolution(_) => MessageType::ForkResolution,
        }
    }

    /// Correlation ID, if this message is part of a request/response pair.
    pub fn request_id(&self) -> Option<&str> {
        match self {
            SyncMessage::ChainStatusRequest(m) => Some(&m.request_id),
            SyncMessage::ChainStatusResponse(m) => Some(&m.request_id),
            SyncMessage::BlockRequest(m) => Some(&m.request_id),
            SyncMessage::BlockResponse(m) => Some(&m.request_id),
            SyncMessage::ForkResolution(_) => None,
        }
    }

    /// Encode this message as MAGIC_BYTES + bincode payload.
    ///
    /// Returns an error if the encoded size exceeds [`MAX_MESSAGE_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>, NetworkError> {
        let payload = bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| NetworkError::Encode(e.to_string()))?;
        let total_size = MAGIC_BYTES.len() + payload.len();
        if total_size > MAX_MESSAGE_SIZE {
            return Err(NetworkError::MessageTooLarge { size: total_size });
        }
        let mut buf = Vec::with_capacity(total_size);
        buf.extend_from_slice(&MAGIC_BYTES);
        buf.extend_from_slice(&payload);
        Ok(buf)
    }

    /// Decode a message from MAGIC_BYTES + bincode payload.
    pub fn decode(data: &[u8]) -> Result<Self, NetworkError> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(NetworkError::MessageTooLarge { size: data.len() });
        }
        let payload = data
            .strip_prefix(&MAGIC_BYTES[..])
            .ok_or_else(|| NetworkError::Decode("bad magic bytes".into()))?;
        let (msg, read): (Self, usize) =
            bincode::decode_from_slice(payload, bincode::config::standard())
                .map_err(|e| NetworkError::Decode(e.to_string()))?;
        if read != payload.len() {
            return Err(NetworkError::Decode(format!(
                "{} trailing bytes",
                payload.len() - read
            )));
        }
        Ok(msg)
    }
}
