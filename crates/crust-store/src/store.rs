use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tempfile::NamedTempFile;

use crate::error::StoreError;
use crate::id::NodeId;
use crate::node::{FileNode, Node, StepNode, TreeNode};

/// Durable, deduplicating node store.
///
/// Nodes live under `nodes/<first-byte-hex>/<remaining-hex>`, one read-only
/// file each. Inserts are idempotent and atomic (temp file + rename), and a
/// parent is only accepted once every child it references already exists.
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(root.join("nodes"))?;
        fs::create_dir_all(root.join("tags"))?;
        Ok(Self { root })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn node_path(&self, id: NodeId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join("nodes").join(&hex[..2]).join(&hex[2..])
    }

    #[must_use]
    pub fn contains(&self, id: NodeId) -> bool {
        self.node_path(id).exists()
    }

    /// Insert a node, returning its id. Submitting identical content twice
    /// returns the same id without writing a second copy.
    pub fn put(&self, node: &Node) -> Result<NodeId, StoreError> {
        for (key, child) in node.child_refs() {
            if !self.contains(child) {
                return Err(StoreError::DanglingReference { key, child });
            }
        }

        let bytes = node.encode();
        let id = NodeId::digest(&bytes);
        let path = self.node_path(id);
        if path.exists() {
            return Ok(id);
        }

        let dir = path.parent().expect("node path has a parent");
        fs::create_dir_all(dir)?;
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(&bytes)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o444))?;
        }
        tmp.persist(&path).map_err(|err| err.error)?;
        Ok(id)
    }

    pub fn put_file(&self, body: impl Into<Vec<u8>>) -> Result<NodeId, StoreError> {
        self.put(&Node::file(body))
    }

    pub fn put_tree(&self, files: BTreeMap<String, NodeId>) -> Result<NodeId, StoreError> {
        self.put(&Node::tree(files))
    }

    pub fn get(&self, id: NodeId) -> Result<Node, StoreError> {
        let bytes = match fs::read(self.node_path(id)) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id));
            }
            Err(err) => return Err(err.into()),
        };
        let actual = NodeId::digest(&bytes);
        if actual != id {
            return Err(StoreError::Corrupt { id, actual });
        }
        Node::decode(&bytes)
    }

    pub fn get_file(&self, id: NodeId) -> Result<FileNode, StoreError> {
        match self.get(id)? {
            Node::File(file) => Ok(file),
            other => Err(StoreError::WrongKind {
                id,
                expected: "file",
                actual: other.kind(),
            }),
        }
    }

    pub fn get_tree(&self, id: NodeId) -> Result<TreeNode, StoreError> {
        match self.get(id)? {
            Node::Tree(tree) => Ok(tree),
            other => Err(StoreError::WrongKind {
                id,
                expected: "tree",
                actual: other.kind(),
            }),
        }
    }

    pub fn get_step(&self, id: NodeId) -> Result<StepNode, StoreError> {
        match self.get(id)? {
            Node::Step(step) => Ok(step),
            other => Err(StoreError::WrongKind {
                id,
                expected: "step",
                actual: other.kind(),
            }),
        }
    }

    /// Resolve a unique node id from a hex prefix.
    pub fn find_by_prefix(&self, prefix: &str) -> Result<NodeId, StoreError> {
        if let Ok(id) = NodeId::from_str(prefix) {
            return if self.contains(id) {
                Ok(id)
            } else {
                Err(StoreError::NotFound(id))
            };
        }
        let prefix = prefix.to_ascii_lowercase();
        if prefix.len() < 2 || !prefix.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(StoreError::UnknownPrefix(prefix));
        }

        let dir = self.root.join("nodes").join(&prefix[..2]);
        let rest = &prefix[2..];
        let mut matches = Vec::new();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::UnknownPrefix(prefix));
            }
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(rest) {
                if let Ok(id) = NodeId::from_str(&format!("{}{name}", &prefix[..2])) {
                    matches.push(id);
                }
            }
        }
        match matches.len() {
            0 => Err(StoreError::UnknownPrefix(prefix)),
            1 => Ok(matches[0]),
            _ => Err(StoreError::AmbiguousPrefix(prefix)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::open(dir.path().join("store")).expect("open store");
        (dir, store)
    }

    #[test]
    fn put_is_idempotent_and_dedups() {
        let (_dir, store) = temp_store();
        let first = store.put_file(b"content".as_slice()).expect("first put");
        let second = store.put_file(b"content".as_slice()).expect("second put");
        assert_eq!(first, second);

        // Exactly one copy on disk.
        let nodes: Vec<_> = walkdir::WalkDir::new(store.root().join("nodes"))
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .collect();
        assert_eq!(nodes.len(), 1);
    }

    #[test]
    fn get_round_trips() {
        let (_dir, store) = temp_store();
        let id = store.put_file(b"hello\nworld".as_slice()).expect("put");
        let file = store.get_file(id).expect("get");
        assert_eq!(file.body, b"hello\nworld");
    }

    #[test]
    fn get_unknown_id_is_not_found() {
        let (_dir, store) = temp_store();
        let id = Node::file(b"never stored".as_slice()).id();
        assert!(matches!(store.get(id), Err(StoreError::NotFound(found)) if found == id));
    }

    #[test]
    fn tree_with_dangling_child_is_rejected() {
        let (_dir, store) = temp_store();
        let missing = Node::file(b"not yet stored".as_slice()).id();
        let files = BTreeMap::from([("main.rs".to_string(), missing)]);
        let err = store.put_tree(files.clone()).expect_err("dangling");
        assert!(matches!(err, StoreError::DanglingReference { child, .. } if child == missing));

        // Succeeds once the child is inserted first.
        store.put_file(b"not yet stored".as_slice()).expect("child");
        store.put_tree(files).expect("parent after child");
    }

    #[test]
    fn wrong_kind_is_reported() {
        let (_dir, store) = temp_store();
        let id = store.put_file(b"x".as_slice()).expect("put");
        assert!(matches!(
            store.get_tree(id),
            Err(StoreError::WrongKind { expected: "tree", actual: "file", .. })
        ));
    }

    #[test]
    fn prefix_lookup_finds_unique_match() {
        let (_dir, store) = temp_store();
        let id = store.put_file(b"alpha".as_slice()).expect("put");
        let hex = id.to_hex();
        assert_eq!(store.find_by_prefix(&hex[..8]).expect("prefix"), id);

        // A prefix that provably differs from the stored id finds nothing.
        let other_first = if &hex[..1] == "0" { "1" } else { "0" };
        let other = format!("{other_first}{}", &hex[1..4]);
        assert!(matches!(
            store.find_by_prefix(&other),
            Err(StoreError::UnknownPrefix(_))
        ));
    }
}
