//! Corpus manifest loading.
//!
//! The manifest is the CSV published with the corpus. Rows are validated once
//! at load time and exposed as immutable [`ManifestRow`] values.
use anyhow::{anyhow, Context, Result};
use chrono::NaiveDate;
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use std::path::Path;

/// Release date the upstream scrapers record when the real date is unknown.
const UNKNOWN_RELEASE_SENTINEL: &str = "1970-01-01";

/// One expected firmware image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRow {
    pub row_id: String,
    pub vendor: String,
    pub device: String,
    pub version: Option<String>,
    pub release: Option<NaiveDate>,
    pub class: String,
    pub filename: String,
    pub size: u64,
    pub sha256: String,
    pub url: String,
    pub source: String,
    /// Archived copy of `url`, if one is known.
    pub wayback: Option<String>,
}

impl ManifestRow {
    /// Identifier the analysis service derives from content: `<sha256>_<size>`.
    pub fn content_uid(&self) -> String {
        format!("{}_{}", self.sha256, self.size)
    }
}

/// Column layout of the published corpus CSV.
#[derive(Debug, Deserialize)]
struct RawManifestRecord {
    manufacturer: String,
    device_name: String,
    #[serde(default)]
    firmware_version: Option<String>,
    #[serde(default)]
    release_date: Option<String>,
    device_class: String,
    filename: String,
    compressed_firmware_size: String,
    sha256: String,
    source_link: String,
    source_type: String,
    #[serde(default)]
    wayback: Option<String>,
}

/// Load and validate every row of the manifest at `path`, in file order.
pub fn load_manifest(path: &Path) -> Result<Vec<ManifestRow>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("open manifest {}", path.display()))?;
    let headers = reader
        .headers()
        .with_context(|| format!("read manifest header {}", path.display()))?
        .clone();

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let line = index + 2;
        let record = record.with_context(|| format!("read manifest line {line}"))?;
        let raw: RawManifestRecord = record
            .deserialize(Some(&headers))
            .with_context(|| format!("parse manifest line {line}"))?;
        let row_id = record.get(0).unwrap_or_default().trim().to_string();
        let row = row_from_raw(row_id, raw).with_context(|| format!("manifest line {line}"))?;
        rows.push(row);
    }
    tracing::debug!(rows = rows.len(), path = %path.display(), "manifest loaded");
    Ok(rows)
}

fn row_from_raw(row_id: String, raw: RawManifestRecord) -> Result<ManifestRow> {
    Ok(ManifestRow {
        row_id,
        vendor: required("manufacturer", raw.manufacturer)?,
        device: required("device_name", raw.device_name)?,
        version: optional(raw.firmware_version),
        release: parse_release(raw.release_date.as_deref())?,
        class: required("device_class", raw.device_class)?,
        filename: decode_filename(&required("filename", raw.filename)?),
        size: parse_size(&raw.compressed_firmware_size)?,
        sha256: normalize_sha256(&raw.sha256)?,
        url: required("source_link", raw.source_link)?,
        source: required("source_type", raw.source_type)?,
        wayback: optional(raw.wayback),
    })
}

/// Blank cells are rejected, but values are stored verbatim: they feed the
/// storage path, which must match the published layout byte for byte.
fn required(column: &str, value: String) -> Result<String> {
    if value.trim().is_empty() {
        return Err(anyhow!("column {column} must be non-empty"));
    }
    Ok(value)
}

fn optional(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

/// Percent-decode a filename; invalid UTF-8 is replaced rather than rejected.
pub fn decode_filename(raw: &str) -> String {
    percent_decode_str(raw).decode_utf8_lossy().into_owned()
}

/// Parse a release date, mapping empty values and the sentinel to unknown.
pub fn parse_release(raw: Option<&str>) -> Result<Option<NaiveDate>> {
    let Some(raw) = raw.map(str::trim).filter(|value| !value.is_empty()) else {
        return Ok(None);
    };
    if raw == UNKNOWN_RELEASE_SENTINEL {
        return Ok(None);
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("invalid release_date {raw:?}"))?;
    Ok(Some(date))
}

/// Parse a byte size. Whole-number floats (`123.0`) are accepted because
/// spreadsheet round trips produce them.
pub fn parse_size(raw: &str) -> Result<u64> {
    let raw = raw.trim();
    let integral = match raw.split_once('.') {
        Some((whole, fraction)) if fraction.bytes().all(|byte| byte == b'0') => whole,
        Some(_) => return Err(anyhow!("size {raw:?} is not a whole number of bytes")),
        None => raw,
    };
    integral
        .parse::<u64>()
        .with_context(|| format!("invalid compressed_firmware_size {raw:?}"))
}

/// Lower-case a SHA-256 digest and check that it is 64 hex characters.
pub fn normalize_sha256(raw: &str) -> Result<String> {
    let digest = raw.trim().to_ascii_lowercase();
    if digest.len() != 64 || !digest.bytes().all(|byte| byte.is_ascii_hexdigit()) {
        return Err(anyhow!("sha256 {raw:?} is not a 64 character hex digest"));
    }
    Ok(digest)
}

#[cfg(test)]
pub(crate) fn test_row(seed: &str) -> ManifestRow {
    ManifestRow {
        row_id: seed.to_string(),
        vendor: "AVM".to_string(),
        device: "FRITZ!Box 7590".to_string(),
        version: Some("7.57".to_string()),
        release: NaiveDate::from_ymd_opt(2023, 10, 4),
        class: "router".to_string(),
        filename: format!("{seed}.image"),
        size: 0,
        sha256: seed.repeat(64 / seed.len().max(1)),
        url: format!("https://download.avm.de/{seed}.image"),
        source: "vendor".to_string(),
        wayback: None,
    }
}

#[cfg(test)]
pub(crate) const TEST_MANIFEST_HEADER: &str = ",manufacturer,device_name,firmware_version,release_date,device_class,filename,compressed_firmware_size,sha256,source_link,source_type,wayback";
