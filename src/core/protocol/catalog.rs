//! The session catalog: the ordered, immutable list of offered files.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use tracing::warn;

use super::messages::{ControlMessage, FileMetadata};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Catalog {
    files: Vec<FileMetadata>,
    index: HashMap<String, usize>,
}

/// What happened when a received `metadata` message was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adoption {
    /// First catalog of the session.
    Adopted,
    /// Same content as the catalog already held.
    Unchanged,
    /// A different catalog arrived after one was adopted; ignored.
    Conflict,
    /// Duplicate ids; ignored.
    Invalid,
}

impl Catalog {
    /// Build a catalog. Ids must be unique.
    pub fn new(files: Vec<FileMetadata>) -> Result<Self> {
        let mut index = HashMap::with_capacity(files.len());
        for (i, f) in files.iter().enumerate() {
            if index.insert(f.id.clone(), i).is_some() {
                bail!("duplicate file id {:?} in catalog", f.id);
            }
        }
        Ok(Self { files, index })
    }

    /// Apply a received catalog to the receiver's slot.
    ///
    /// The first valid catalog wins; it is never replaced afterwards.
    pub fn adopt(slot: &mut Option<Catalog>, files: Vec<FileMetadata>) -> Adoption {
        if let Some(current) = slot {
            return if current.files == files {
                Adoption::Unchanged
            } else {
                warn!(event = "catalog_conflict", "Ignoring second, different catalog");
                Adoption::Conflict
            };
        }
        match Self::new(files) {
            Ok(catalog) => {
                *slot = Some(catalog);
                Adoption::Adopted
            }
            Err(e) => {
                warn!(event = "catalog_invalid", %e, "Ignoring invalid catalog");
                Adoption::Invalid
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&FileMetadata> {
        self.index.get(id).map(|&i| &self.files[i])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    #[cfg(test)]
    pub fn files(&self) -> &[FileMetadata] {
        &self.files
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.id.as_str())
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }

    /// The `metadata` message publishing this catalog.
    pub fn to_message(&self) -> ControlMessage {
        ControlMessage::Metadata {
            files: self.files.clone(),
        }
    }
}

impl FileMetadata {
    /// Where this file lands under `root`. The peer-supplied relative path is
    /// sanitized so it can never escape `root`.
    pub fn destination(&self, root: &Path) -> PathBuf {
        let rel = if self.relative_path.is_empty() {
            &self.name
        } else {
            &self.relative_path
        };
        root.join(sanitize_relative_path(rel))
    }
}

/// Sanitize a (possibly adversarial) relative path for safe use as a file name.
///
/// - Normalizes `\` to `/`.
/// - Strips `.` and `..` components.
/// - Keeps only alphanumeric chars plus `.`, `-`, `_`, and ` ` per component.
/// - Falls back to `"file"` when the result would otherwise be empty.
pub fn sanitize_relative_path(name: &str) -> PathBuf {
    let normalized = name.replace('\\', "/");
    let mut result = PathBuf::new();

    for part in normalized.split('/').filter(|s| !s.is_empty()) {
        if matches!(part, "." | "..") {
            continue;
        }
        let safe: String = part
            .chars()
            .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
            .collect();
        if !safe.is_empty() && safe != "." && safe != ".." {
            result.push(safe);
        }
    }

    if result.as_os_str().is_empty() {
        PathBuf::from("file")
    } else {
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: &str, path: &str, size: u64) -> FileMetadata {
        FileMetadata {
            id: id.into(),
            name: path.rsplit('/').next().unwrap_or(path).into(),
            size,
            mime_type: "application/octet-stream".into(),
            relative_path: path.into(),
        }
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        assert!(Catalog::new(vec![entry("0", "a", 1), entry("0", "b", 2)]).is_err());
    }

    #[test]
    fn adopting_identical_metadata_twice_is_idempotent() {
        let files = vec![entry("0", "a.txt", 3), entry("1", "d/b.txt", 4)];
        let mut slot = None;
        assert_eq!(Catalog::adopt(&mut slot, files.clone()), Adoption::Adopted);
        let before = slot.clone();
        assert_eq!(Catalog::adopt(&mut slot, files), Adoption::Unchanged);
        assert_eq!(slot, before);
    }

    #[test]
    fn second_different_catalog_is_ignored() {
        let mut slot = None;
        Catalog::adopt(&mut slot, vec![entry("0", "a.txt", 3)]);
        assert_eq!(
            Catalog::adopt(&mut slot, vec![entry("0", "evil.txt", 3)]),
            Adoption::Conflict
        );
        assert_eq!(slot.unwrap().get("0").unwrap().relative_path, "a.txt");
    }

    #[test]
    fn lookup_and_totals() {
        let catalog = Catalog::new(vec![entry("0", "a", 10), entry("1", "b", 5)]).unwrap();
        assert_eq!(catalog.total_size(), 15);
        assert!(catalog.contains("1"));
        assert!(catalog.get("2").is_none());
        assert_eq!(catalog.ids().collect::<Vec<_>>(), vec!["0", "1"]);
    }

    #[test]
    fn destination_cannot_escape_root() {
        let root = Path::new("/tmp/out");
        assert_eq!(
            entry("0", "../../etc/passwd", 1).destination(root),
            root.join("etc/passwd")
        );
        assert_eq!(
            entry("0", "photos\\2024\\a b.jpg", 1).destination(root),
            root.join("photos/2024/a b.jpg")
        );
        assert_eq!(sanitize_relative_path("/../"), PathBuf::from("file"));
    }
}
