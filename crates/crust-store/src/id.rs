use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Content hash identifying an immutable node.
///
/// Identity is structural: two nodes with identical canonical bytes always
/// produce the same id, no matter when or where they were created.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NodeId::LENGTH]);

impl NodeId {
    pub const LENGTH: usize = 32;

    pub(crate) fn digest(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; NodeId::LENGTH] {
        &self.0
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("node id must be {} lowercase hex characters", NodeId::LENGTH * 2)]
pub struct ParseNodeIdError;

impl FromStr for NodeId {
    type Err = ParseNodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != NodeId::LENGTH * 2 {
            return Err(ParseNodeIdError);
        }
        let raw = hex::decode(s).map_err(|_| ParseNodeIdError)?;
        let mut bytes = [0u8; NodeId::LENGTH];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }
}

impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let id = NodeId::digest(b"hello");
        let parsed: NodeId = id.to_hex().parse().expect("parse hex");
        assert_eq!(id, parsed);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!("abcd".parse::<NodeId>().is_err());
    }

    #[test]
    fn rejects_non_hex() {
        let text = "z".repeat(NodeId::LENGTH * 2);
        assert!(text.parse::<NodeId>().is_err());
    }

    #[test]
    fn serde_uses_hex_string() {
        let id = NodeId::digest(b"x");
        let json = serde_json::to_string(&id).expect("serialize");
        assert_eq!(json, format!("\"{id}\""));
        let back: NodeId = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(id, back);
    }
}
