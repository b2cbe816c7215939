use crate::id::NodeId;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("node {0} not found in store")]
    NotFound(NodeId),
    #[error("node references missing child {child} via `{key}`")]
    DanglingReference { key: String, child: NodeId },
    #[error("tag `{0}` is not set")]
    UnknownTag(String),
    #[error("invalid tag name `{0}`")]
    InvalidTag(String),
    #[error("tag `{tag}` moved: expected {expected:?}, found {actual:?}")]
    Conflict {
        tag: String,
        expected: Option<NodeId>,
        actual: Option<NodeId>,
    },
    #[error("stored node {id} is corrupt: content hashes to {actual}")]
    Corrupt { id: NodeId, actual: NodeId },
    #[error("expected a {expected} node, but {id} is a {actual}")]
    WrongKind {
        id: NodeId,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("no node id starts with `{0}`")]
    UnknownPrefix(String),
    #[error("node id prefix `{0}` is ambiguous")]
    AmbiguousPrefix(String),
    #[error("malformed node data: {0}")]
    Decode(String),
    #[error("refusing unsafe relative path `{0}`")]
    UnsafePath(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
