//! Content-addressed object store for migration pipeline state.
//!
//! Every intermediate artifact (source snapshot, translated tree, tool log)
//! is an immutable node identified by the hash of its content. Mutable state
//! lives exclusively in the tag registry, which maps short names to node ids.

#![deny(clippy::all, warnings)]

mod error;
mod id;
mod node;
mod store;
mod tags;
mod workdir;

pub use error::StoreError;
pub use id::{NodeId, ParseNodeIdError};
pub use node::{FileNode, Node, StepNode, StepStatus, TreeNode};
pub use store::Store;
pub use tags::{ReflogEntry, TagRegistry};
pub use workdir::{checkout_tree, commit_dir, commit_paths};
