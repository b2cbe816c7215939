use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::id::NodeId;

/// Leaf node holding raw file bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    pub body: Vec<u8>,
}

/// Directory snapshot mapping relative paths to child node ids.
///
/// The map is a `BTreeMap` so that two trees with the same path→id mapping
/// always serialize, and therefore hash, identically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub files: BTreeMap<String, NodeId>,
}

/// Outcome of a recorded pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Failure,
    Partial,
}

/// Provenance record: a named step applied to input nodes, with parameters,
/// producing an optional output node. The body carries captured logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepNode {
    pub step: String,
    pub inputs: BTreeMap<String, NodeId>,
    pub params: Value,
    pub output: Option<NodeId>,
    pub status: StepStatus,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    File(FileNode),
    Tree(TreeNode),
    Step(StepNode),
}

/// Canonical header, serialized as one compact JSON line ahead of the body.
#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Header {
    File,
    Tree {
        files: BTreeMap<String, NodeId>,
    },
    Step {
        step: String,
        inputs: BTreeMap<String, NodeId>,
        params: Value,
        output: Option<NodeId>,
        status: StepStatus,
    },
}

impl Node {
    pub fn file(body: impl Into<Vec<u8>>) -> Self {
        Node::File(FileNode { body: body.into() })
    }

    #[must_use]
    pub fn tree(files: BTreeMap<String, NodeId>) -> Self {
        Node::Tree(TreeNode { files })
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Node::File(_) => "file",
            Node::Tree(_) => "tree",
            Node::Step(_) => "step",
        }
    }

    /// Node ids this node refers to, with the referencing key for diagnostics.
    #[must_use]
    pub fn child_refs(&self) -> Vec<(String, NodeId)> {
        match self {
            Node::File(_) => Vec::new(),
            Node::Tree(tree) => tree
                .files
                .iter()
                .map(|(path, id)| (path.clone(), *id))
                .collect(),
            Node::Step(step) => {
                let mut refs: Vec<(String, NodeId)> = step
                    .inputs
                    .iter()
                    .map(|(key, id)| (key.clone(), *id))
                    .collect();
                if let Some(output) = step.output {
                    refs.push(("output".to_string(), output));
                }
                refs
            }
        }
    }

    /// Canonical byte serialization: header JSON, a newline, then the body.
    ///
    /// The header is compact JSON with sorted object keys, so equal content
    /// always yields equal bytes. The body may contain arbitrary bytes; the
    /// header line is the only line that is parsed.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let (header, body): (Header, &[u8]) = match self {
            Node::File(file) => (Header::File, &file.body),
            Node::Tree(tree) => (
                Header::Tree {
                    files: tree.files.clone(),
                },
                &[],
            ),
            Node::Step(step) => (
                Header::Step {
                    step: step.step.clone(),
                    inputs: step.inputs.clone(),
                    params: step.params.clone(),
                    output: step.output,
                    status: step.status,
                },
                &step.body,
            ),
        };
        let mut bytes = serde_json::to_vec(&header).expect("node header serializes");
        bytes.push(b'\n');
        bytes.extend_from_slice(body);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let split = bytes
            .iter()
            .position(|&b| b == b'\n')
            .ok_or_else(|| StoreError::Decode("missing header line".to_string()))?;
        let header: Header = serde_json::from_slice(&bytes[..split])
            .map_err(|err| StoreError::Decode(err.to_string()))?;
        let body = bytes[split + 1..].to_vec();
        Ok(match header {
            Header::File => Node::File(FileNode { body }),
            Header::Tree { files } => Node::Tree(TreeNode { files }),
            Header::Step {
                step,
                inputs,
                params,
                output,
                status,
            } => Node::Step(StepNode {
                step,
                inputs,
                params,
                output,
                status,
                body,
            }),
        })
    }

    /// Content hash of the canonical serialization.
    #[must_use]
    pub fn id(&self) -> NodeId {
        NodeId::digest(&self.encode())
    }
}
