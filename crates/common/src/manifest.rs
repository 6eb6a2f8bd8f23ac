use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::identifier::ContentIdentifier;

/// Known manifest document formats. Anything else is rejected outright.
pub const MANIFEST_FORMAT_1_0: &str = "1.0.0";
pub const MANIFEST_FORMAT_1_1: &str = "1.1.0";

/// Reserved path suffix marking an empty directory in pre-1.1.0
/// documents: a zero-length file named `.` inside the directory.
pub const EMPTY_DIRECTORY_SUFFIX: &str = "/.";

#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("unsupported manifest format: {0}")]
    UnsupportedFormat(String),
    #[error("malformed manifest document: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifestItemType {
    #[serde(rename = "file")]
    File,
    #[serde(rename = "emptyDirectory")]
    EmptyDirectory,
}

/// The blob backing a file item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobInfo {
    pub id: ContentIdentifier,
    pub size: u64,
}

/// One entry in a manifest: a file backed by a blob, or an empty
/// directory. `blob` is present iff the type is `File`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestItem {
    pub path: String,
    #[serde(rename = "type")]
    pub item_type: ManifestItemType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<BlobInfo>,
}

impl ManifestItem {
    pub fn file(path: String, id: ContentIdentifier, size: u64) -> Self {
        Self {
            path,
            item_type: ManifestItemType::File,
            blob: Some(BlobInfo { id, size }),
        }
    }

    pub fn empty_directory(path: String) -> Self {
        Self {
            path,
            item_type: ManifestItemType::EmptyDirectory,
            blob: None,
        }
    }
}

/// A secondary manifest chained from the primary one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestReference {
    #[serde(rename = "manifestId")]
    pub manifest_id: ContentIdentifier,
}

/// The path -> blob mapping document for one published artifact.
/// Items are kept sorted by path (ordinal) so serialization is
/// reproducible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "manifestFormat")]
    pub manifest_format: String,
    pub items: Vec<ManifestItem>,
    #[serde(
        rename = "manifestReferences",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub manifest_references: Vec<ManifestReference>,
}

impl Manifest {
    pub fn new(mut items: Vec<ManifestItem>) -> Self {
        items.sort_by(|a, b| a.path.cmp(&b.path));
        Self {
            manifest_format: MANIFEST_FORMAT_1_1.to_string(),
            items,
            manifest_references: Vec::new(),
        }
    }

    pub fn to_json(&self) -> Result<String, ManifestError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and validate a manifest document. Rejects unknown format
    /// literals and fixes up the legacy empty-directory encoding.
    pub fn from_json(content: &str) -> Result<Self, ManifestError> {
        let mut manifest: Manifest = serde_json::from_str(content)?;
        if manifest.manifest_format != MANIFEST_FORMAT_1_0
            && manifest.manifest_format != MANIFEST_FORMAT_1_1
        {
            return Err(ManifestError::UnsupportedFormat(manifest.manifest_format));
        }
        manifest.fixup_legacy_empty_directories();
        Ok(manifest)
    }

    /// Pre-1.1.0 writers encoded an empty directory as a zero-length
    /// file named `.` inside it. The explicit `type` field is
    /// authoritative when present; this only rewrites old items.
    fn fixup_legacy_empty_directories(&mut self) {
        for item in &mut self.items {
            let is_marker = item.item_type == ManifestItemType::File
                && item.path.ends_with(EMPTY_DIRECTORY_SUFFIX)
                && item.blob.as_ref().map(|b| b.size) == Some(0);
            if is_marker {
                let dir = item.path[..item.path.len() - EMPTY_DIRECTORY_SUFFIX.len()].to_string();
                *item = ManifestItem::empty_directory(dir);
            }
        }
    }

    /// Keep exactly the items whose path matches any of the given
    /// patterns. When `artifact_prefix` is set, patterns are matched
    /// against the artifact-qualified path (multi-artifact downloads);
    /// otherwise against the path with any leading slash trimmed.
    pub fn filter(&self, patterns: &[Pattern], artifact_prefix: Option<&str>) -> Manifest {
        let items = self
            .items
            .iter()
            .filter(|item| {
                let candidate = match artifact_prefix {
                    Some(prefix) if !prefix.is_empty() => format!("{prefix}{}", item.path),
                    _ => item.path.trim_start_matches('/').to_string(),
                };
                patterns.iter().any(|p| p.matches(&candidate))
            })
            .cloned()
            .collect();
        Manifest {
            manifest_format: self.manifest_format.clone(),
            items,
            manifest_references: self.manifest_references.clone(),
        }
    }

    /// Total declared content bytes across file items.
    pub fn content_size(&self) -> u64 {
        self.items
            .iter()
            .filter_map(|i| i.blob.as_ref())
            .map(|b| b.size)
            .sum()
    }
}
