//! Wire messages exchanged between nodes.
//!
//! Every connection carries one request and at most one reply. A frame is a
//! big-endian `u32` length, a one byte [`MessageKind`] tag and the bincode
//! encoded [`Message`].

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    time::{Duration, SystemTime},
};

use crate::{
    error::{Error, Result},
    identity::Identity,
    key::Key,
    MAX_MESSAGE_SIZE,
};

/// Random id correlating a reply with its request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId([u8; 16]);

impl MessageId {
    pub fn random() -> Self {
        MessageId(rand::thread_rng().gen())
    }
}

impl fmt::Debug for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageId({})", bs58::encode(self.0).into_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Ping = 1,
    Store = 2,
    FindNode = 3,
    FindValue = 4,
}

impl TryFrom<u8> for MessageKind {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(MessageKind::Ping),
            2 => Ok(MessageKind::Store),
            3 => Ok(MessageKind::FindNode),
            4 => Ok(MessageKind::FindValue),
            other => Err(Error::UnknownMessageKind(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FindValueReply {
    Value(Vec<u8>),
    /// The responder does not hold the value, these are its closest contacts to the key.
    Nodes(Vec<Identity>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Body {
    /// `pong` is set on the reply.
    Ping {
        pong: bool,
    },
    Store {
        key: Key,
        data: Vec<u8>,
        #[serde(with = "serde_millis")]
        expiration_time: SystemTime,
        replication_interval: Duration,
    },
    StoreReply {
        closest: Vec<Identity>,
    },
    FindNode {
        target: Key,
    },
    FindNodeReply {
        closest: Vec<Identity>,
    },
    FindValue {
        key: Key,
    },
    FindValueReply(FindValueReply),
}

impl Body {
    pub fn kind(&self) -> MessageKind {
        match self {
            Body::Ping { .. } => MessageKind::Ping,
            Body::Store { .. } | Body::StoreReply { .. } => MessageKind::Store,
            Body::FindNode { .. } | Body::FindNodeReply { .. } => MessageKind::FindNode,
            Body::FindValue { .. } | Body::FindValueReply(_) => MessageKind::FindValue,
        }
    }

    pub fn is_reply(&self) -> bool {
        match self {
            Body::Ping { pong } => *pong,
            Body::StoreReply { .. } | Body::FindNodeReply { .. } | Body::FindValueReply(_) => true,
            Body::Store { .. } | Body::FindNode { .. } | Body::FindValue { .. } => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender: Identity,
    pub body: Body,
}

impl Message {
    pub fn request(sender: Identity, body: Body) -> Self {
        Self {
            id: MessageId::random(),
            sender,
            body,
        }
    }

    /// A message answering `self`, carrying the same id.
    pub fn reply(&self, sender: Identity, body: Body) -> Self {
        Self {
            id: self.id,
            sender,
            body,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.body.kind()
    }

    pub fn is_reply(&self) -> bool {
        self.body.is_reply()
    }

    /// Whether `reply` is a valid answer to this request.
    pub fn is_answered_by(&self, reply: &Message) -> bool {
        reply.id == self.id && reply.kind() == self.kind() && reply.is_reply()
    }

    /// Length-prefixed frame ready to be written to a stream.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self)?;
        let len = body.len() + 1;
        if len > MAX_MESSAGE_SIZE {
            return Err(Error::FrameTooLarge(len));
        }

        let mut frame = Vec::with_capacity(4 + len);
        frame.extend_from_slice(&(len as u32).to_be_bytes());
        frame.push(self.kind() as u8);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decodes a frame with its length prefix already stripped.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        let (&tag, body) = frame.split_first().ok_or_else(|| {
            Error::Decode(Box::new(bincode::ErrorKind::Custom("empty frame".into())))
        })?;
        let tagged = MessageKind::try_from(tag)?;

        let message: Message = bincode::deserialize(body)?;
        let actual = message.kind();
        if actual != tagged {
            return Err(Error::KindMismatch { tagged, actual });
        }

        Ok(message)
    }
}
