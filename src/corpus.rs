//! Corpus binding: a manifest plus the directory images are stored in.
//!
//! The manifest says what should exist, the directory says what does. The
//! corpus holds no other state.
use crate::manifest::ManifestRow;
use crate::naming::image_rel_segments;
use crate::status::{classify, ImageStatus};
use crate::util::dir_has_entries;
use anyhow::{anyhow, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct Corpus {
    root: PathBuf,
    manifest: Vec<ManifestRow>,
}

impl Corpus {
    pub fn new(root: PathBuf, manifest: Vec<ManifestRow>) -> Self {
        Self { root, manifest }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest(&self) -> &[ManifestRow] {
        &self.manifest
    }

    /// Absolute location of `row` below the corpus root.
    pub fn image_path(&self, row: &ManifestRow) -> PathBuf {
        let mut path = self.root.clone();
        for segment in image_rel_segments(row) {
            path.push(segment);
        }
        path
    }

    /// Iterate manifest rows in order, optionally keeping only rows whose
    /// current on-disk status equals `filter`.
    ///
    /// Each call starts a fresh pass and re-reads the filesystem.
    pub fn iter_expected(
        &self,
        filter: Option<ImageStatus>,
    ) -> impl Iterator<Item = &ManifestRow> + '_ {
        self.manifest
            .iter()
            .filter(move |row| match filter {
                Some(wanted) => classify(row, self) == wanted,
                None => true,
            })
    }

    /// Rows that are on disk in some form: neither missing nor mid-transfer.
    pub fn iter_present(&self) -> impl Iterator<Item = &ManifestRow> + '_ {
        self.manifest.iter().filter(move |row| {
            !matches!(
                classify(row, self),
                ImageStatus::Missing | ImageStatus::DownloadStarted
            )
        })
    }
}

/// Check that a download run may use `root`, without touching the filesystem.
///
/// A non-empty directory is only reused with `allow_existing`.
pub fn check_download_root(root: &Path, allow_existing: bool) -> Result<()> {
    if root.is_dir() && !allow_existing && dir_has_entries(root)? {
        return Err(anyhow!(
            "{} exists and is not empty; use --continue or specify an empty or non-existent directory as --corpus-dir",
            root.display()
        ));
    }
    Ok(())
}

/// Create the corpus root if it does not exist yet. The parent directory
/// must already exist.
pub fn create_download_root(root: &Path) -> Result<()> {
    if root.is_dir() {
        return Ok(());
    }
    fs::create_dir(root).with_context(|| format!("create corpus dir {}", root.display()))?;
    Ok(())
}

/// Fail unless the corpus root exists.
pub fn require_existing_root(root: &Path) -> Result<()> {
    if !root.is_dir() {
        return Err(anyhow!("corpus directory {} does not exist", root.display()));
    }
    Ok(())
}
