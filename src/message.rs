// SPDX-License-Identifier: MIT OR Apache-2.0

//! Framing, signing and parsing of protocol messages.
//!
//! Every protocol broadcast is a base64-encoded binary frame:
//!
//! ```text
//! magic || version_u8 || type_u8 || session_id_32B? ||
//!   sender_nickname_len_u16 || sender_nickname || body || sig_64B
//! ```
//!
//! The signature is produced by the sender's session ephemeral key over all preceding bytes.
//! The session id is omitted for JOIN_REQUEST only, since a joiner does not know the id of the
//! session their request will create. Bodies are CBOR.
use std::collections::BTreeMap;
use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cbor::{decode_cbor, encode_cbor, DecodeError, EncodeError};
use crate::crypto::aead::AeadNonce;
use crate::crypto::identity::{
    IdentityError, PrivateKey, PublicKey, Signature, PUBLIC_KEY_SIZE, SIGNATURE_SIZE,
};
use crate::participant::{ParticipantId, UnauthenticatedParticipant, AUTH_TOKEN_SIZE};
use crate::session_id::{SessionId, SESSION_ID_SIZE};
use crate::transcript::TranscriptHash;

/// Frame prefix identifying protocol broadcasts among arbitrary room strings.
pub const MAGIC: [u8; 3] = *b":o3";

/// Wire format version.
pub const VERSION: u8 = 1;

/// Protocol message types.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    JoinRequest = 1,
    ParticipantInfo = 2,
    JoinerAuth = 3,
    ReShare = 4,
    SessionConfirmation = 5,
    User = 6,
    Farewell = 7,
    Heartbeat = 8,
    Ack = 9,
    AckQuery = 10,
}

impl MessageType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::JoinRequest),
            2 => Some(Self::ParticipantInfo),
            3 => Some(Self::JoinerAuth),
            4 => Some(Self::ReShare),
            5 => Some(Self::SessionConfirmation),
            6 => Some(Self::User),
            7 => Some(Self::Farewell),
            8 => Some(Self::Heartbeat),
            9 => Some(Self::Ack),
            10 => Some(Self::AckQuery),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                MessageType::JoinRequest => "join_request",
                MessageType::ParticipantInfo => "participant_info",
                MessageType::JoinerAuth => "joiner_auth",
                MessageType::ReShare => "re_share",
                MessageType::SessionConfirmation => "session_confirmation",
                MessageType::User => "user",
                MessageType::Farewell => "farewell",
                MessageType::Heartbeat => "heartbeat",
                MessageType::Ack => "ack",
                MessageType::AckQuery => "ack_query",
            }
        )
    }
}

/// One member as transmitted inside JOIN_REQUEST and PARTICIPANT_INFO bodies.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub nickname: String,
    #[serde(with = "serde_bytes")]
    pub long_term_key: [u8; PUBLIC_KEY_SIZE],
    #[serde(with = "serde_bytes")]
    pub ephemeral_key: [u8; PUBLIC_KEY_SIZE],
}

impl RosterEntry {
    pub fn new(id: &ParticipantId, ephemeral_key: &PublicKey) -> Self {
        Self {
            nickname: id.nickname.clone(),
            long_term_key: *id.long_term_key.as_bytes(),
            ephemeral_key: *ephemeral_key.as_bytes(),
        }
    }

    /// Parses the transmitted keys back into a host-facing roster entry.
    pub fn to_unauthenticated(&self) -> Result<UnauthenticatedParticipant, IdentityError> {
        Ok(UnauthenticatedParticipant {
            id: ParticipantId::new(&self.nickname, PublicKey::from_bytes(&self.long_term_key)?),
            ephemeral_key: PublicKey::from_bytes(&self.ephemeral_key)?,
        })
    }
}

/// Typed message bodies, CBOR-encoded on the wire.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum Body {
    /// A joiner announces themselves with their identity and fresh ephemeral key.
    JoinRequest { joiner: RosterEntry },

    /// An incumbent replies to a join with their session view, an authentication token for the
    /// joiner and their own key share.
    ParticipantInfo {
        roster: Vec<RosterEntry>,
        #[serde(with = "serde_bytes")]
        joiner_auth: [u8; AUTH_TOKEN_SIZE],
        #[serde(with = "serde_bytes")]
        key_share: [u8; 32],
    },

    /// The joiner authenticates to every incumbent, keyed by participant index, and contributes
    /// their key share.
    JoinerAuth {
        auth_tokens: BTreeMap<u32, [u8; AUTH_TOKEN_SIZE]>,
        #[serde(with = "serde_bytes")]
        key_share: [u8; 32],
    },

    /// An incumbent publishes a fresh key share after a member left.
    ReShare {
        #[serde(with = "serde_bytes")]
        key_share: [u8; 32],
    },

    /// Proof of group-key derivation: `SHA256(group_key || sender_id)`.
    SessionConfirmation {
        #[serde(with = "serde_bytes")]
        confirmation: [u8; 32],
    },

    /// Chat message: the sender's transcript head plus the AEAD-wrapped plaintext.
    User {
        #[serde(with = "serde_bytes")]
        transcript_hash: TranscriptHash,
        #[serde(with = "serde_bytes")]
        nonce: AeadNonce,
        #[serde(with = "serde_bytes")]
        ciphertext: Vec<u8>,
    },

    /// Graceful exit carrying the leaver's final transcript head.
    Farewell {
        #[serde(with = "serde_bytes")]
        transcript_hash: TranscriptHash,
        farewell: String,
    },

    Heartbeat,
    Ack,
    AckQuery,
}

impl Body {
    pub fn message_type(&self) -> MessageType {
        match self {
            Body::JoinRequest { .. } => MessageType::JoinRequest,
            Body::ParticipantInfo { .. } => MessageType::ParticipantInfo,
            Body::JoinerAuth { .. } => MessageType::JoinerAuth,
            Body::ReShare { .. } => MessageType::ReShare,
            Body::SessionConfirmation { .. } => MessageType::SessionConfirmation,
            Body::User { .. } => MessageType::User,
            Body::Farewell { .. } => MessageType::Farewell,
            Body::Heartbeat => MessageType::Heartbeat,
            Body::Ack => MessageType::Ack,
            Body::AckQuery => MessageType::AckQuery,
        }
    }
}

/// Serializes, signs and base64-encodes a protocol broadcast.
///
/// `session_id` must be `None` exactly for JOIN_REQUEST bodies.
pub fn encode(
    session_id: Option<&SessionId>,
    sender: &str,
    body: &Body,
    ephemeral_key: &PrivateKey,
) -> Result<String, MessageError> {
    let is_join_request = matches!(body, Body::JoinRequest { .. });
    if is_join_request == session_id.is_some() {
        return Err(MessageError::SessionIdMismatch);
    }

    let nickname_len =
        u16::try_from(sender.len()).map_err(|_| MessageError::NicknameTooLong(sender.len()))?;

    let mut frame = Vec::new();
    frame.extend_from_slice(&MAGIC);
    frame.push(VERSION);
    frame.push(body.message_type() as u8);
    if let Some(session_id) = session_id {
        frame.extend_from_slice(session_id.as_bytes());
    }
    frame.extend_from_slice(&nickname_len.to_be_bytes());
    frame.extend_from_slice(sender.as_bytes());
    frame.extend_from_slice(&encode_cbor(body)?);

    let signature = ephemeral_key.sign(&frame);
    frame.extend_from_slice(&signature.to_bytes());

    Ok(BASE64.encode(frame))
}

/// A decoded protocol broadcast whose signature has not been checked yet.
///
/// The caller looks up the sender's ephemeral public key and calls [`ParsedMessage::verify`]
/// before acting on the content.
#[derive(Clone, Debug)]
pub struct ParsedMessage {
    pub session_id: Option<SessionId>,
    pub sender: String,
    pub body: Body,
    signed: Vec<u8>,
    signature: Signature,
}

impl ParsedMessage {
    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    /// Checks the frame signature against the sender's session ephemeral key.
    pub fn verify(&self, ephemeral_key: &PublicKey) -> bool {
        ephemeral_key.verify(&self.signed, &self.signature)
    }
}

/// Parses a base64 frame into a [`ParsedMessage`].
pub fn decode(raw: &str) -> Result<ParsedMessage, MessageError> {
    let frame = BASE64.decode(raw)?;

    // Fixed header plus trailing signature; the session id and body lengths vary.
    if frame.len() < MAGIC.len() + 2 + 2 + SIGNATURE_SIZE {
        return Err(MessageError::TooShort(frame.len()));
    }

    let (signed, signature_bytes) = frame.split_at(frame.len() - SIGNATURE_SIZE);
    let signature = Signature::from_bytes(
        signature_bytes
            .try_into()
            .expect("signature split is exactly 64 bytes"),
    );

    let mut offset = 0;
    if signed[offset..offset + MAGIC.len()] != MAGIC {
        return Err(MessageError::BadMagic);
    }
    offset += MAGIC.len();

    let version = signed[offset];
    if version != VERSION {
        return Err(MessageError::UnsupportedVersion(version));
    }
    offset += 1;

    let type_byte = signed[offset];
    let message_type =
        MessageType::from_u8(type_byte).ok_or(MessageError::UnknownType(type_byte))?;
    offset += 1;

    let session_id = if message_type == MessageType::JoinRequest {
        None
    } else {
        let end = offset + SESSION_ID_SIZE;
        let bytes: [u8; SESSION_ID_SIZE] = signed
            .get(offset..end)
            .ok_or(MessageError::TooShort(frame.len()))?
            .try_into()
            .expect("session id slice is exactly 32 bytes");
        offset = end;
        Some(SessionId::from_bytes(bytes))
    };

    let nickname_len = {
        let bytes: [u8; 2] = signed
            .get(offset..offset + 2)
            .ok_or(MessageError::TooShort(frame.len()))?
            .try_into()
            .expect("nickname length is exactly 2 bytes");
        offset += 2;
        u16::from_be_bytes(bytes) as usize
    };
    let sender = {
        let bytes = signed
            .get(offset..offset + nickname_len)
            .ok_or(MessageError::TooShort(frame.len()))?;
        offset += nickname_len;
        std::str::from_utf8(bytes)
            .map_err(|_| MessageError::InvalidNickname)?
            .to_owned()
    };

    let body: Body = decode_cbor(&signed[offset..])?;
    if body.message_type() != message_type {
        return Err(MessageError::TypeMismatch(message_type, body.message_type()));
    }

    Ok(ParsedMessage {
        session_id,
        sender,
        body,
        signed: signed.to_vec(),
        signature,
    })
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("frame of {0} bytes is too short to be a protocol message")]
    TooShort(usize),

    #[error("frame does not start with the protocol magic")]
    BadMagic,

    #[error("unsupported wire format version {0}")]
    UnsupportedVersion(u8),

    #[error("unknown message type {0}")]
    UnknownType(u8),

    #[error("header claims type \"{0}\" but body is of type \"{1}\"")]
    TypeMismatch(MessageType, MessageType),

    #[error("sender nickname of {0} bytes exceeds the wire format limit")]
    NicknameTooLong(usize),

    #[error("sender nickname is not valid utf-8")]
    InvalidNickname,

    #[error("session id must be present on every message except join requests")]
    SessionIdMismatch,

    #[error(transparent)]
    Base64(#[from] base64::DecodeError),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

#[cfg(test)]
mod tests {
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;

    use crate::crypto::identity::PrivateKey;
    use crate::crypto::Rng;
    use crate::participant::ParticipantId;
    use crate::session_id::SessionId;

    use super::{decode, encode, Body, MessageError, MessageType, RosterEntry};

    fn test_keys() -> (PrivateKey, PrivateKey) {
        let rng = Rng::from_seed([1; 32]);
        (
            PrivateKey::from_rng(&rng).unwrap(),
            PrivateKey::from_rng(&rng).unwrap(),
        )
    }

    #[test]
    fn roundtrip_with_session_id() {
        let (ephemeral, _) = test_keys();
        let session_id = SessionId::from_bytes([9; 32]);

        let body = Body::SessionConfirmation {
            confirmation: [3; 32],
        };
        let raw = encode(Some(&session_id), "alice", &body, &ephemeral).unwrap();

        let parsed = decode(&raw).unwrap();
        assert_eq!(parsed.sender, "alice");
        assert_eq!(parsed.session_id, Some(session_id));
        assert_eq!(parsed.message_type(), MessageType::SessionConfirmation);
        assert!(parsed.verify(&ephemeral.public_key()));
    }

    #[test]
    fn roundtrip_join_request() {
        let (ephemeral, longterm) = test_keys();

        let id = ParticipantId::new("bob", longterm.public_key());
        let body = Body::JoinRequest {
            joiner: RosterEntry::new(&id, &ephemeral.public_key()),
        };
        let raw = encode(None, "bob", &body, &ephemeral).unwrap();

        let parsed = decode(&raw).unwrap();
        assert_eq!(parsed.session_id, None);
        assert!(parsed.verify(&ephemeral.public_key()));

        let Body::JoinRequest { joiner } = parsed.body else {
            panic!("expected join request body");
        };
        let unauthenticated = joiner.to_unauthenticated().unwrap();
        assert_eq!(unauthenticated.id.nickname, "bob");
        assert_eq!(unauthenticated.ephemeral_key, ephemeral.public_key());
    }

    #[test]
    fn session_id_presence_is_enforced() {
        let (ephemeral, longterm) = test_keys();
        let session_id = SessionId::from_bytes([9; 32]);

        let id = ParticipantId::new("bob", longterm.public_key());
        let join = Body::JoinRequest {
            joiner: RosterEntry::new(&id, &ephemeral.public_key()),
        };
        assert!(matches!(
            encode(Some(&session_id), "bob", &join, &ephemeral),
            Err(MessageError::SessionIdMismatch)
        ));
        assert!(matches!(
            encode(None, "bob", &Body::Heartbeat, &ephemeral),
            Err(MessageError::SessionIdMismatch)
        ));
    }

    #[test]
    fn wrong_key_fails_verification() {
        let (ephemeral, other) = test_keys();
        let session_id = SessionId::from_bytes([9; 32]);

        let raw = encode(Some(&session_id), "alice", &Body::Heartbeat, &ephemeral).unwrap();
        let parsed = decode(&raw).unwrap();

        assert!(parsed.verify(&ephemeral.public_key()));
        assert!(!parsed.verify(&other.public_key()));
    }

    #[test]
    fn tampering_breaks_the_signature() {
        let (ephemeral, _) = test_keys();
        let session_id = SessionId::from_bytes([9; 32]);

        let raw = encode(
            Some(&session_id),
            "alice",
            &Body::User {
                transcript_hash: [0; 32],
                nonce: [0; 24],
                ciphertext: vec![1, 2, 3],
            },
            &ephemeral,
        )
        .unwrap();

        // Flip a bit inside the session id.
        let mut frame = BASE64.decode(&raw).unwrap();
        frame[6] ^= 0x01;
        let tampered = BASE64.encode(frame);

        let parsed = decode(&tampered).unwrap();
        assert!(!parsed.verify(&ephemeral.public_key()));
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(decode("not base64 !!!").is_err());
        assert!(matches!(
            decode(&BASE64.encode(b"tiny")),
            Err(MessageError::TooShort(_))
        ));

        let (ephemeral, _) = test_keys();
        let session_id = SessionId::from_bytes([9; 32]);
        let raw = encode(Some(&session_id), "alice", &Body::Heartbeat, &ephemeral).unwrap();
        let mut frame = BASE64.decode(&raw).unwrap();
        frame[0] = b'x';
        assert!(matches!(
            decode(&BASE64.encode(frame)),
            Err(MessageError::BadMagic)
        ));
    }
}
