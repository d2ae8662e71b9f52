//! Processed-files manifest for resumable dataset runs
//!
//! A JSON list of slide filenames in the output directory, read at dataset
//! start and appended after each slide completes successfully. Slides listed
//! here are skipped on re-runs.

use crate::error::Result;
use std::path::{Path, PathBuf};

/// Manifest filename inside the output directory
pub const MANIFEST_FILE: &str = "processed_files.json";

#[derive(Debug)]
pub struct ProcessedManifest {
    path: PathBuf,
    entries: Vec<String>,
}

impl ProcessedManifest {
    /// Load the manifest from an output directory; a missing file yields an
    /// empty manifest.
    pub fn load(outdir: &Path) -> Result<Self> {
        let path = outdir.join(MANIFEST_FILE);
        let entries = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            Vec::new()
        };
        Ok(Self { path, entries })
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.entries.iter().any(|entry| entry == filename)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a successfully processed slide and persist immediately, so an
    /// interrupted dataset run can resume where it stopped.
    pub fn mark_processed(&mut self, filename: &str) -> Result<()> {
        if self.contains(filename) {
            return Ok(());
        }
        self.entries.push(filename.to_string());
        let content = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_manifest_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = ProcessedManifest::load(dir.path()).unwrap();
        assert!(manifest.is_empty());
        assert!(!manifest.contains("slide.svs"));
    }

    #[test]
    fn test_append_and_reload() {
        let dir = tempfile::tempdir().unwrap();

        let mut manifest = ProcessedManifest::load(dir.path()).unwrap();
        manifest.mark_processed("a.svs").unwrap();
        manifest.mark_processed("b.svs").unwrap();
        // idempotent
        manifest.mark_processed("a.svs").unwrap();
        assert_eq!(manifest.len(), 2);

        let reloaded = ProcessedManifest::load(dir.path()).unwrap();
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains("a.svs"));
        assert!(reloaded.contains("b.svs"));
        assert!(!reloaded.contains("c.svs"));
    }
}
