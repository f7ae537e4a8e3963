//! Ground-truth annotations for the screenshot corpus.
//!
//! The annotation file is a JSON array:
//! ```json
//! [
//!   {
//!     "image_id": "settings_01",
//!     "reference_description": "The screen shows ...",
//!     "must_include": ["toggle for Wi-Fi", "back arrow"]
//!   }
//! ]
//! ```

use crate::error::{EvalError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// One annotated screenshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationEntry {
    /// Unique key, also the image file stem (`images/{image_id}.png`).
    pub image_id: String,
    /// Human-written reference description.
    pub reference_description: String,
    /// Concepts a description must mention, in annotation order.
    pub must_include: Vec<String>,
}

/// Render a checklist as numbered lines, one item per line. Line breaks
/// inside an item are folded into single spaces.
pub fn render_checklist(items: &[String]) -> String {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let folded = item.split_whitespace().collect::<Vec<_>>().join(" ");
            format!("{}. {}", i + 1, folded)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Entry as it appears on disk; every field optional so the loader can name
/// the missing one.
#[derive(Debug, Deserialize)]
struct RawEntry {
    image_id: Option<String>,
    reference_description: Option<String>,
    must_include: Option<Vec<String>>,
}

/// All annotations for a run, keyed by image id.
#[derive(Debug, Clone, Default)]
pub struct AnnotationStore {
    entries: HashMap<String, AnnotationEntry>,
    /// Image ids in file order.
    order: Vec<String>,
}

impl AnnotationStore {
    /// Load and validate an annotation file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(EvalError::AnnotationsNotFound(path.to_path_buf()));
        }

        let content = fs::read_to_string(path).map_err(|e| EvalError::io(path, e))?;
        let raw: Vec<RawEntry> =
            serde_json::from_str(&content).map_err(|e| EvalError::MalformedAnnotations {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;

        let mut entries = Vec::with_capacity(raw.len());
        for (idx, entry) in raw.into_iter().enumerate() {
            let missing = |field: &str| EvalError::MalformedAnnotations {
                path: path.to_path_buf(),
                message: format!("entry {} is missing '{}'", idx, field),
            };

            let image_id = entry
                .image_id
                .filter(|id| !id.trim().is_empty())
                .ok_or_else(|| missing("image_id"))?;
            let reference_description = entry
                .reference_description
                .ok_or_else(|| missing("reference_description"))?;
            let must_include = entry.must_include.ok_or_else(|| missing("must_include"))?;

            entries.push(AnnotationEntry {
                image_id,
                reference_description,
                must_include,
            });
        }

        let store = Self::from_entries(entries)?;
        tracing::info!(path = %path.display(), entries = store.len(), "loaded annotations");
        Ok(store)
    }

    /// Build a store from entries, rejecting duplicate ids.
    pub fn from_entries(entries: Vec<AnnotationEntry>) -> Result<Self> {
        let mut store = Self::default();
        for entry in entries {
            if store.entries.contains_key(&entry.image_id) {
                return Err(EvalError::DuplicateImageId(entry.image_id));
            }
            store.order.push(entry.image_id.clone());
            store.entries.insert(entry.image_id.clone(), entry);
        }
        Ok(store)
    }

    /// Look up an entry by image id.
    pub fn get(&self, image_id: &str) -> Option<&AnnotationEntry> {
        self.entries.get(image_id)
    }

    pub fn contains(&self, image_id: &str) -> bool {
        self.entries.contains_key(image_id)
    }

    /// Number of annotated images.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in file order.
    pub fn iter(&self) -> impl Iterator<Item = &AnnotationEntry> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }
}
