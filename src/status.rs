//! Per-image download status.
//!
//! Status is derived from the filesystem on every call and never cached, so
//! interrupted runs resume from whatever is actually on disk.
use crate::corpus::Corpus;
use crate::manifest::ManifestRow;
use crate::naming::image_rel_path;
use crate::util::sha256_file_hex;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Suffix of the control file aria2 keeps beside an unfinished download.
pub const IN_PROGRESS_MARKER_SUFFIX: &str = ".aria2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ImageStatus {
    Missing,
    DownloadStarted,
    HashMismatch,
    Success,
}

impl ImageStatus {
    pub const ALL: [ImageStatus; 4] = [
        ImageStatus::Missing,
        ImageStatus::DownloadStarted,
        ImageStatus::HashMismatch,
        ImageStatus::Success,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ImageStatus::Missing => "missing",
            ImageStatus::DownloadStarted => "download-started",
            ImageStatus::HashMismatch => "hash-mismatch",
            ImageStatus::Success => "success",
        }
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Path of the in-progress marker for an image stored at `image_path`.
pub fn in_progress_marker_path(image_path: &Path) -> PathBuf {
    let mut marker = image_path.as_os_str().to_owned();
    marker.push(IN_PROGRESS_MARKER_SUFFIX);
    PathBuf::from(marker)
}

/// Classify `row` against the current contents of the corpus directory.
///
/// Checks run in order missing, download-started, hash-mismatch; the first
/// that holds wins. A file that exists but cannot be read counts as a hash
/// mismatch.
pub fn classify(row: &ManifestRow, corpus: &Corpus) -> ImageStatus {
    let image_path = corpus.image_path(row);
    if !image_path.exists() {
        return ImageStatus::Missing;
    }
    if in_progress_marker_path(&image_path).exists() {
        return ImageStatus::DownloadStarted;
    }
    match sha256_file_hex(&image_path) {
        Ok(digest) if digest == row.sha256 => ImageStatus::Success,
        Ok(_) => ImageStatus::HashMismatch,
        Err(err) => {
            tracing::warn!(path = %image_path.display(), error = %format!("{err:#}"), "image unreadable");
            ImageStatus::HashMismatch
        }
    }
}

/// Status of every expected image, keyed by relative path in manifest order.
#[derive(Debug, Default)]
pub struct StatusReport {
    entries: Vec<(String, ImageStatus)>,
}

impl StatusReport {
    pub fn build(corpus: &Corpus) -> Self {
        let entries = corpus
            .iter_expected(None)
            .map(|row| (image_rel_path(row), classify(row, corpus)))
            .collect();
        Self { entries }
    }

    /// Entries whose status is anything but success.
    pub fn problems(&self) -> impl Iterator<Item = &(String, ImageStatus)> {
        self.entries
            .iter()
            .filter(|(_, status)| *status != ImageStatus::Success)
    }

    /// Count of images per status; every status is present, possibly as zero.
    pub fn counts(&self) -> BTreeMap<ImageStatus, usize> {
        let mut counts: BTreeMap<ImageStatus, usize> =
            ImageStatus::ALL.iter().map(|status| (*status, 0)).collect();
        for (_, status) in &self.entries {
            *counts.entry(*status).or_default() += 1;
        }
        counts
    }
}

impl Serialize for StatusReport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (path, status) in &self.entries {
            map.serialize_entry(path, status)?;
        }
        map.end()
    }
}
