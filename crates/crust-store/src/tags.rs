use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs4::FileExt;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::StoreError;
use crate::id::NodeId;

/// One historical assignment of a tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReflogEntry {
    pub node: NodeId,
    pub timestamp: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Mutable named pointers into the node store.
///
/// Each tag is an append-only reflog file of JSON lines; the current value is
/// the last entry. Updates take an exclusive file lock so that
/// compare-and-swap semantics hold across concurrent processes.
pub struct TagRegistry {
    root: PathBuf,
}

impl TagRegistry {
    pub fn open(store_root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = store_root.into().join("tags");
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn tag_path(&self, tag: &str) -> Result<PathBuf, StoreError> {
        if tag.is_empty()
            || !tag
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-' || b == b'.')
        {
            return Err(StoreError::InvalidTag(tag.to_string()));
        }
        Ok(self.root.join(tag))
    }

    pub fn exists(&self, tag: &str) -> Result<bool, StoreError> {
        Ok(self.tag_path(tag)?.exists())
    }

    /// Current value of the tag, failing with `UnknownTag` if never set.
    pub fn resolve(&self, tag: &str) -> Result<NodeId, StoreError> {
        self.try_resolve(tag)?
            .ok_or_else(|| StoreError::UnknownTag(tag.to_string()))
    }

    pub fn try_resolve(&self, tag: &str) -> Result<Option<NodeId>, StoreError> {
        let path = self.tag_path(tag)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(last_entry(&path)?.map(|entry| entry.node))
    }

    /// Unconditional update: appends a reflog entry under the file lock.
    pub fn update(&self, tag: &str, node: NodeId, reason: Option<&str>) -> Result<(), StoreError> {
        let path = self.tag_path(tag)?;
        let file = open_locked(&path)?;
        append_entry(&file, node, reason)?;
        file.unlock()?;
        Ok(())
    }

    /// Atomic compare-and-swap. `expected` is the value observed by the
    /// caller before it started working; `None` asserts the tag is unset.
    /// Fails with `Conflict` if the tag has moved in the meantime, so a
    /// concurrent run's progress is never silently overwritten.
    pub fn compare_and_swap(
        &self,
        tag: &str,
        expected: Option<NodeId>,
        node: NodeId,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let path = self.tag_path(tag)?;
        let file = open_locked(&path)?;
        let actual = last_entry(&path)?.map(|entry| entry.node);
        if actual != expected {
            file.unlock()?;
            return Err(StoreError::Conflict {
                tag: tag.to_string(),
                expected,
                actual,
            });
        }
        append_entry(&file, node, reason)?;
        file.unlock()?;
        Ok(())
    }

    /// Full history of the tag, oldest first.
    pub fn reflog(&self, tag: &str) -> Result<Vec<ReflogEntry>, StoreError> {
        let path = self.tag_path(tag)?;
        if !path.exists() {
            return Err(StoreError::UnknownTag(tag.to_string()));
        }
        read_entries(&path)
    }
}

fn open_locked(path: &Path) -> Result<fs::File, StoreError> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    file.lock_exclusive()?;
    Ok(file)
}

fn append_entry(mut file: &fs::File, node: NodeId, reason: Option<&str>) -> Result<(), StoreError> {
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("unknown"));
    let entry = ReflogEntry {
        node,
        timestamp,
        reason: reason.map(ToOwned::to_owned),
    };
    let mut line = serde_json::to_vec(&entry).map_err(|err| StoreError::Decode(err.to_string()))?;
    line.push(b'\n');
    file.write_all(&line)?;
    Ok(())
}

fn read_entries(path: &Path) -> Result<Vec<ReflogEntry>, StoreError> {
    let contents = fs::read_to_string(path)?;
    let mut entries = Vec::new();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: ReflogEntry =
            serde_json::from_str(line).map_err(|err| StoreError::Decode(err.to_string()))?;
        entries.push(entry);
    }
    Ok(entries)
}

fn last_entry(path: &Path) -> Result<Option<ReflogEntry>, StoreError> {
    Ok(read_entries(path)?.into_iter().last())
}
