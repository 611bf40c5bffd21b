//! Client for the FACT firmware analysis REST API.
use crate::manifest::ManifestRow;
use anyhow::{anyhow, Context, Result};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Analysis plugins FACT can be asked to run on an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum, Serialize)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum Plugin {
    FileSystemMetadata,
    CveLookup,
    KernelConfig,
    CryptoMaterial,
    ElfAnalysis,
    UsersAndPasswords,
    SourceCodeAnalysis,
    Binwalk,
    DummyPluginForTestingOnly,
    IpAndUriFinder,
    InterestingUris,
    CryptoHints,
    InputVectors,
    Tlsh,
    SoftwareComponents,
    InformationLeaks,
    PrintableStrings,
    DeviceTree,
    IpcAnalyzer,
    Hashlookup,
    ExploitMitigations,
    CpuArchitecture,
    CweChecker,
    InitSystems,
    FileType,
    HardwareAnalysis,
    StringEvaluator,
    FileHashes,
    KnownVulnerabilities,
    QemuExec,
}

/// Progress of one running analysis, as reported by `/rest/status`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AnalysisProgress {
    pub analyzed_count: u64,
    pub unpacked_count: u64,
}

/// Running analyses keyed by firmware uid.
pub type ProgressSnapshot = BTreeMap<String, AnalysisProgress>;

/// The operations the upload driver needs from an analysis service.
pub trait AnalysisService {
    /// Whether the service already holds `row`.
    fn is_uploaded(&self, row: &ManifestRow) -> Result<bool>;
    /// Analyses currently in progress.
    fn analysis_progress(&self) -> Result<ProgressSnapshot>;
    /// Submit the image stored at `image_path`; returns the service's uid.
    fn upload(&self, row: &ManifestRow, image_path: &Path, plugins: &[Plugin]) -> Result<String>;
}

#[derive(Debug)]
pub struct UploadRejected {
    pub status: u16,
}

impl fmt::Display for UploadRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "upload rejected with HTTP status {}", self.status)
    }
}

impl std::error::Error for UploadRejected {}

/// JSON body of `PUT /rest/firmware`.
#[derive(Debug, Serialize)]
pub struct UploadPayload<'a> {
    pub binary: String,
    pub device_class: &'a str,
    pub device_name: &'a str,
    pub device_part: &'a str,
    pub file_name: &'a str,
    pub requested_analysis_systems: &'a [Plugin],
    pub vendor: &'a str,
    pub version: &'a str,
    pub tags: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_date: Option<String>,
}

impl<'a> UploadPayload<'a> {
    pub fn new(row: &'a ManifestRow, image: &[u8], plugins: &'a [Plugin]) -> Self {
        Self {
            binary: base64::engine::general_purpose::STANDARD.encode(image),
            device_class: &row.class,
            device_name: &row.device,
            device_part: "Unknown",
            file_name: &row.filename,
            requested_analysis_systems: plugins,
            vendor: &row.vendor,
            version: row.version.as_deref().unwrap_or("Unknown"),
            tags: format!("source:{}", row.source),
            release_date: row.release.map(|date| date.format("%Y-%m-%d").to_string()),
        }
    }
}

#[derive(Deserialize)]
struct UploadAnswer {
    uid: String,
}

#[derive(Deserialize)]
struct StatusResponse {
    system_status: SystemStatus,
}

#[derive(Deserialize)]
struct SystemStatus {
    backend: BackendStatus,
}

#[derive(Deserialize)]
struct BackendStatus {
    analysis: AnalysisStatus,
}

#[derive(Deserialize)]
struct AnalysisStatus {
    #[serde(default)]
    current_analyses: ProgressSnapshot,
}

/// Extract running analyses from a `/rest/status` body.
pub fn parse_status_body(body: &str) -> Result<ProgressSnapshot> {
    let status: StatusResponse =
        serde_json::from_str(body).context("parse FACT status response")?;
    Ok(status.system_status.backend.analysis.current_analyses)
}

/// FACT instance reached over HTTP.
pub struct FactClient {
    base_url: String,
    agent: ureq::Agent,
}

impl FactClient {
    pub fn new(base_url: &str) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_connect(Some(Duration::from_secs(30)))
            .build()
            .into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/rest/{path}", self.base_url)
    }
}

impl AnalysisService for FactClient {
    fn is_uploaded(&self, row: &ManifestRow) -> Result<bool> {
        let url = self.endpoint(&format!("firmware/{}", row.content_uid()));
        let response = self
            .agent
            .get(&url)
            .call()
            .with_context(|| format!("query {url}"))?;
        Ok(response.status().as_u16() == 200)
    }

    fn analysis_progress(&self) -> Result<ProgressSnapshot> {
        let url = self.endpoint("status");
        let mut response = self
            .agent
            .get(&url)
            .call()
            .with_context(|| format!("query {url}"))?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "FACT status request failed with HTTP status {}",
                response.status().as_u16()
            ));
        }
        let body = response
            .body_mut()
            .read_to_string()
            .context("read FACT status response")?;
        parse_status_body(&body)
    }

    fn upload(&self, row: &ManifestRow, image_path: &Path, plugins: &[Plugin]) -> Result<String> {
        let image = std::fs::read(image_path)
            .with_context(|| format!("read {}", image_path.display()))?;
        let payload = UploadPayload::new(row, &image, plugins);
        let url = self.endpoint("firmware");
        let mut response = self
            .agent
            .put(&url)
            .send_json(&payload)
            .with_context(|| format!("upload to {url}"))?;
        if !response.status().is_success() {
            return Err(UploadRejected {
                status: response.status().as_u16(),
            }
            .into());
        }
        let answer: UploadAnswer = response
            .body_mut()
            .read_json()
            .context("parse FACT upload response")?;
        Ok(answer.uid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::test_row;

    #[test]
    fn status_body_yields_progress_by_uid() {
        let body = r#"{
            "system_status": {
                "backend": {
                    "analysis": {
                        "current_analyses": {
                            "abc_10": {"analyzed_count": 3, "unpacked_count": 7, "total_count": 9},
                            "def_20": {"analyzed_count": 0, "unpacked_count": 1}
                        }
                    },
                    "cpu_percentage": 12.5
                }
            }
        }"#;
        let snapshot = parse_status_body(body).expect("parse status");
        assert_eq!(snapshot.len(), 2);
        assert_eq!(
            snapshot["abc_10"],
            AnalysisProgress {
                analyzed_count: 3,
                unpacked_count: 7
            }
        );
    }

    #[test]
    fn status_body_without_analyses_section_is_an_error() {
        assert!(parse_status_body(r#"{"system_status": {}}"#).is_err());
    }

    #[test]
    fn payload_carries_metadata_and_base64_image() {
        let row = ManifestRow {
            version: None,
            ..test_row("a")
        };
        let plugins = [Plugin::CweChecker, Plugin::FileType];
        let payload = UploadPayload::new(&row, b"\x00\x01firmware", &plugins);
        let json = serde_json::to_value(&payload).expect("serialize payload");

        assert_eq!(json["binary"], "AAFmaXJtd2FyZQ==");
        assert_eq!(json["version"], "Unknown");
        assert_eq!(json["device_part"], "Unknown");
        assert_eq!(json["tags"], "source:vendor");
        assert_eq!(json["release_date"], "2023-10-04");
        assert_eq!(
            json["requested_analysis_systems"],
            serde_json::json!(["cwe_checker", "file_type"])
        );
    }

    #[test]
    fn payload_omits_unknown_release_date() {
        let row = ManifestRow {
            release: None,
            ..test_row("a")
        };
        let json = serde_json::to_value(UploadPayload::new(&row, b"", &[])).expect("serialize");
        assert!(json.get("release_date").is_none());
    }

    #[test]
    fn endpoints_ignore_trailing_slash() {
        let client = FactClient::new("http://localhost:5000/");
        assert_eq!(client.endpoint("status"), "http://localhost:5000/rest/status");
    }
}
