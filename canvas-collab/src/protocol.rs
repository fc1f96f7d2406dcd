//! Binary envelope for document deltas and presence broadcasts.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ room     │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ varlen   │ varint   │ varlen   │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! Two payload classes travel in the same envelope: opaque Yrs updates
//! (`SyncStep2`, `Delta`), which are safe to re-apply or reorder, and
//! bincode-encoded [`AwarenessMessage`]s, last-write-wins per participant.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::AwarenessMessage;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector, asks the other side for what it is missing
    SyncStep1 = 1,
    /// Yrs diff answering a `SyncStep1`
    SyncStep2 = 2,
    /// Incremental update from a committed transaction
    Delta = 3,
    /// Presence broadcast
    Awareness = 4,
    /// A connection in the room closed
    PeerLeft = 5,
    /// Heartbeat ping, `clock` carries the sender's timestamp
    Ping = 6,
    /// Heartbeat pong, echoes the ping's `clock`
    Pong = 7,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub room: String,
    /// Per-peer sequence number, or a timestamp for heartbeats
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, room: &str, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            room: room.to_string(),
            clock,
            payload,
        }
    }

    pub fn sync_step1(peer_id: Uuid, room: &str, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, room, 0, state_vector)
    }

    pub fn sync_step2(peer_id: Uuid, room: &str, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, room, 0, diff)
    }

    pub fn delta(peer_id: Uuid, room: &str, clock: u64, update: Vec<u8>) -> Self {
        Self::new(MessageType::Delta, peer_id, room, clock, update)
    }

    pub fn awareness(
        peer_id: Uuid,
        room: &str,
        clock: u64,
        message: &AwarenessMessage,
    ) -> Result<Self, ProtocolError> {
        let payload = message.encode()?;
        Ok(Self::new(MessageType::Awareness, peer_id, room, clock, payload))
    }

    pub fn peer_left(peer_id: Uuid, room: &str) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, room, 0, Vec::new())
    }

    pub fn ping(peer_id: Uuid, room: &str, sent_at: u64) -> Self {
        Self::new(MessageType::Ping, peer_id, room, sent_at, Vec::new())
    }

    /// Answer a ping, echoing its timestamp.
    pub fn pong(peer_id: Uuid, ping: &SyncMessage) -> Self {
        Self::new(MessageType::Pong, peer_id, &ping.room, ping.clock, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the awareness payload.
    pub fn awareness_message(&self) -> Result<AwarenessMessage, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType);
        }
        AwarenessMessage::decode(&self.payload)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::{PresenceRecord, UserProfile};

    #[test]
    fn test_delta_envelope_roundtrip() {
        let peer = Uuid::new_v4();
        let payload = vec![1, 2, 3, 4, 5];

        let msg = SyncMessage::delta(peer, "design-review", 42, payload.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded, msg);
        assert_eq!(decoded.room, "design-review");
        assert_eq!(decoded.clock, 42);
    }

    #[test]
    fn test_awareness_payload() {
        let peer = Uuid::new_v4();
        let profile = UserProfile::new("u1", "Alice");
        let record = PresenceRecord::new(&profile);
        let message = AwarenessMessage::State { record, clock: 3 };

        let msg = SyncMessage::awareness(peer, "room", 3, &message).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.awareness_message().unwrap(), message);
    }

    #[test]
    fn test_pong_echoes_ping_clock() {
        let ping = SyncMessage::ping(Uuid::new_v4(), "room", 123_456);
        let pong = SyncMessage::pong(Uuid::nil(), &ping);

        assert_eq!(pong.msg_type, MessageType::Pong);
        assert_eq!(pong.clock, 123_456);
        assert_eq!(pong.room, "room");
    }

    #[test]
    fn test_invalid_message_type_error() {
        let msg = SyncMessage::peer_left(Uuid::new_v4(), "room");
        assert_eq!(msg.awareness_message(), Err(ProtocolError::InvalidMessageType));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_delta_header_is_small() {
        let msg = SyncMessage::delta(Uuid::new_v4(), "default", 1, vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        assert!(encoded.len() < 100, "Encoded size {} too large", encoded.len());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::SyncStep1 as u8, 1);
        assert_eq!(MessageType::Delta as u8, 3);
        assert_eq!(MessageType::Pong as u8, 7);
    }
}
