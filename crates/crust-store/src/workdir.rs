use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::error::StoreError;
use crate::id::NodeId;
use crate::node::Node;
use crate::store::Store;

/// Materialize a tree to `dest`, creating parent directories as needed.
/// Nested tree children are resolved recursively.
pub fn checkout_tree(store: &Store, id: NodeId, dest: &Path) -> Result<(), StoreError> {
    let tree = store.get_tree(id)?;
    fs::create_dir_all(dest)?;
    for (rel_path, child_id) in &tree.files {
        let rel = safe_relative(rel_path)?;
        match store.get(*child_id)? {
            Node::File(file) => {
                let path = dest.join(&rel);
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&path, &file.body)?;
            }
            Node::Tree(_) => checkout_tree(store, *child_id, &dest.join(&rel))?,
            Node::Step(_) => {
                return Err(StoreError::WrongKind {
                    id: *child_id,
                    expected: "file or tree",
                    actual: "step",
                });
            }
        }
    }
    Ok(())
}

/// Snapshot a directory into the store, files first, then the tree.
///
/// The result is a flat tree: every regular file under `src` keyed by its
/// `/`-separated relative path. This is the canonical form produced by all
/// import paths, so export followed by commit reproduces the same id.
pub fn commit_dir(store: &Store, src: &Path) -> Result<NodeId, StoreError> {
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(src).sort_by_file_name() {
        let entry = entry.map_err(|err| {
            StoreError::Io(err.into_io_error().unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::Other, "walkdir loop")
            }))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under src");
        let key = path_key(rel)?;
        let body = fs::read(entry.path())?;
        let file_id = store.put_file(body)?;
        files.insert(key, file_id);
    }
    store.put_tree(files)
}

/// Commit an explicit set of files, keyed by their path relative to `base`.
pub fn commit_paths(store: &Store, base: &Path, paths: &[PathBuf]) -> Result<NodeId, StoreError> {
    let mut files = BTreeMap::new();
    for path in paths {
        let rel = path.strip_prefix(base).unwrap_or(path);
        let key = path_key(rel)?;
        let body = fs::read(path)?;
        let file_id = store.put_file(body)?;
        files.insert(key, file_id);
    }
    store.put_tree(files)
}

fn path_key(rel: &Path) -> Result<String, StoreError> {
    let checked = safe_relative(&rel.to_string_lossy())?;
    let parts: Vec<String> = checked
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect();
    Ok(parts.join("/"))
}

fn safe_relative(rel: &str) -> Result<PathBuf, StoreError> {
    let path = PathBuf::from(rel);
    let ok = !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if ok {
        Ok(path)
    } else {
        Err(StoreError::UnsafePath(rel.to_string()))
    }
}
