//! Continuation tokens for in-flight provider operations.
//!
//! A continuation is stored in the object's status so that a poll can resume
//! after a process restart. It is either absent or pending with a non-empty
//! opaque token; there is no "empty placeholder" state.

use serde::{Deserialize, Serialize};

/// The kind of provider operation a token belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Continuation {
    #[default]
    Absent,
    Pending {
        operation: OperationKind,
        #[serde(with = "token_base64")]
        token: Vec<u8>,
    },
}

impl Continuation {
    /// Build a pending continuation. An empty token carries nothing to resume,
    /// so it collapses to `Absent`.
    pub fn pending(operation: OperationKind, token: Vec<u8>) -> Self {
        if token.is_empty() {
            Self::Absent
        } else {
            Self::Pending { operation, token }
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending { .. })
    }

    pub fn operation(&self) -> Option<OperationKind> {
        match self {
            Self::Pending { operation, .. } => Some(*operation),
            Self::Absent => None,
        }
    }

    /// Token of a pending operation of the given kind.
    pub fn token_for(&self, kind: OperationKind) -> Option<&[u8]> {
        match self {
            Self::Pending { operation, token } if *operation == kind => Some(token),
            _ => None,
        }
    }

    /// Remove and return the pending operation, leaving `Absent`.
    pub fn take(&mut self) -> Option<(OperationKind, Vec<u8>)> {
        match std::mem::take(self) {
            Self::Pending { operation, token } => Some((operation, token)),
            Self::Absent => None,
        }
    }

    pub fn clear(&mut self) {
        *self = Self::Absent;
    }
}

mod token_base64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(token: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(token))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let token = STANDARD.decode(encoded.as_bytes()).map_err(D::Error::custom)?;
        if token.is_empty() {
            return Err(D::Error::custom("empty continuation token"));
        }
        Ok(token)
    }
}
