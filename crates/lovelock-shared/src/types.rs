use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::IdentifierError;

// Participant = stable identifier issued by the identity provider (opaque string)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Result<Self, IdentifierError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdentifierError::Empty);
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl TryFrom<String> for ParticipantId {
    type Error = IdentifierError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ParticipantId> for String {
    fn from(id: ParticipantId) -> Self {
        id.0
    }
}

impl FromStr for ParticipantId {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The exclusive two-participant relationship that scopes a conversation,
/// seen from the local participant's side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pairing {
    local: ParticipantId,
    remote: ParticipantId,
}

impl Pairing {
    pub fn new(local: ParticipantId, remote: ParticipantId) -> Result<Self, IdentifierError> {
        if local == remote {
            return Err(IdentifierError::SelfPairing);
        }
        Ok(Self { local, remote })
    }

    /// Build a pairing straight from raw identifiers.
    pub fn from_ids(local: &str, remote: &str) -> Result<Self, IdentifierError> {
        Self::new(ParticipantId::new(local)?, ParticipantId::new(remote)?)
    }

    pub fn local(&self) -> &ParticipantId {
        &self.local
    }

    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    /// Both identifiers in ascending lexicographic order.
    pub fn canonical(&self) -> (&ParticipantId, &ParticipantId) {
        if self.local <= self.remote {
            (&self.local, &self.remote)
        } else {
            (&self.remote, &self.local)
        }
    }

    /// Whether a sender/receiver pair belongs to this conversation, in either direction.
    pub fn involves(&self, sender: &ParticipantId, receiver: &ParticipantId) -> bool {
        (sender == &self.local && receiver == &self.remote)
            || (sender == &self.remote && receiver == &self.local)
    }

    /// The same conversation seen from the other participant.
    pub fn reversed(&self) -> Self {
        Self {
            local: self.remote.clone(),
            remote: self.local.clone(),
        }
    }
}

impl fmt::Display for Pairing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}<->{}", self.local.short(), self.remote.short())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
