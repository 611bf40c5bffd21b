//! Wayback Machine lookups for manifest source links.
//!
//! Annotates a manifest CSV with a `wayback` column holding the closest
//! archived snapshot of each `source_link`, so downloads can fall back to the
//! archive when vendors remove files.
use crate::clock::Clock;
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use url::Url;

const SOURCE_LINK_COLUMN: &str = "source_link";
const WAYBACK_COLUMN: &str = "wayback";

/// Answer of one availability query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(String),
    NotArchived,
    RateLimited,
}

pub trait SnapshotLookup {
    fn closest_snapshot(&self, url: &str) -> Result<Lookup>;
}

#[derive(Deserialize)]
struct AvailabilityResponse {
    #[serde(default)]
    archived_snapshots: ArchivedSnapshots,
}

#[derive(Deserialize, Default)]
struct ArchivedSnapshots {
    closest: Option<Snapshot>,
}

#[derive(Deserialize)]
struct Snapshot {
    url: String,
}

/// Closest snapshot URL from an availability API body.
pub fn parse_availability_body(body: &str) -> Result<Option<String>> {
    let response: AvailabilityResponse =
        serde_json::from_str(body).context("parse availability response")?;
    Ok(response.archived_snapshots.closest.map(|snapshot| snapshot.url))
}

/// Links that never need a query: `Some(None)` for links that cannot be
/// archived, `Some(Some(url))` for links that already point at the archive.
pub fn resolve_without_query(link: &str) -> Option<Option<String>> {
    let Ok(parsed) = Url::parse(link) else {
        return Some(None);
    };
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Some(None);
    }
    if matches!(parsed.host_str(), Some("archive.org" | "www.archive.org")) {
        return Some(Some(link.to_string()));
    }
    None
}

/// Availability API client.
pub struct WaybackClient {
    endpoint: String,
    agent: ureq::Agent,
}

impl WaybackClient {
    pub fn new(endpoint: &str) -> Self {
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_global(Some(Duration::from_secs(60)))
            .build()
            .into();
        Self {
            endpoint: endpoint.to_string(),
            agent,
        }
    }
}

impl SnapshotLookup for WaybackClient {
    fn closest_snapshot(&self, url: &str) -> Result<Lookup> {
        let mut response = self
            .agent
            .get(&self.endpoint)
            .query("url", url)
            .call()
            .with_context(|| format!("query {}", self.endpoint))?;
        let status = response.status().as_u16();
        if status == 429 {
            return Ok(Lookup::RateLimited);
        }
        if !response.status().is_success() {
            return Err(anyhow!("availability query failed with HTTP status {status}"));
        }
        let body = response
            .body_mut()
            .read_to_string()
            .context("read availability response")?;
        Ok(match parse_availability_body(&body)? {
            Some(snapshot) => Lookup::Found(snapshot),
            None => Lookup::NotArchived,
        })
    }
}

/// Resolve one link, backing off while the archive rate-limits us.
///
/// Any failure other than rate limiting is logged and treated as "no
/// snapshot" so one bad link does not stop the annotation.
pub fn wayback_url_for(
    link: &str,
    lookup: &dyn SnapshotLookup,
    clock: &dyn Clock,
    backoff: Duration,
) -> Option<String> {
    if let Some(resolved) = resolve_without_query(link) {
        return resolved;
    }
    loop {
        match lookup.closest_snapshot(link) {
            Ok(Lookup::Found(snapshot)) => return Some(snapshot),
            Ok(Lookup::NotArchived) => return None,
            Ok(Lookup::RateLimited) => {
                tracing::info!(secs = backoff.as_secs(), "rate limited by archive, backing off");
                clock.sleep(backoff);
            }
            Err(err) => {
                tracing::warn!(%link, error = %format!("{err:#}"), "wayback lookup failed");
                return None;
            }
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct AnnotateSummary {
    pub rows: usize,
    pub archived: usize,
}

/// Copy the CSV at `input` to `output`, setting the `wayback` column of
/// every row. All other columns are preserved as-is.
pub fn annotate_csv(
    input: &Path,
    output: &Path,
    lookup: &dyn SnapshotLookup,
    clock: &dyn Clock,
    backoff: Duration,
) -> Result<AnnotateSummary> {
    let mut reader = csv::Reader::from_path(input)
        .with_context(|| format!("open manifest {}", input.display()))?;
    let mut headers = reader
        .headers()
        .with_context(|| format!("read manifest header {}", input.display()))?
        .clone();
    let link_index = headers
        .iter()
        .position(|name| name == SOURCE_LINK_COLUMN)
        .ok_or_else(|| anyhow!("manifest has no {SOURCE_LINK_COLUMN} column"))?;
    let wayback_index = headers.iter().position(|name| name == WAYBACK_COLUMN);
    if wayback_index.is_none() {
        headers.push_field(WAYBACK_COLUMN);
    }

    let mut writer = csv::Writer::from_path(output)
        .with_context(|| format!("create {}", output.display()))?;
    writer.write_record(&headers).context("write header")?;

    let mut summary = AnnotateSummary::default();
    for (index, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("read manifest line {}", index + 2))?;
        let link = record.get(link_index).unwrap_or_default().trim();
        let wayback = wayback_url_for(link, lookup, clock, backoff);
        summary.rows += 1;
        if wayback.is_some() {
            summary.archived += 1;
        }
        let wayback = wayback.unwrap_or_default();

        let fields: Vec<&str> = match wayback_index {
            Some(column) => record
                .iter()
                .enumerate()
                .map(|(i, field)| if i == column { wayback.as_str() } else { field })
                .collect(),
            None => record.iter().chain(std::iter::once(wayback.as_str())).collect(),
        };
        writer
            .write_record(&fields)
            .with_context(|| format!("write manifest line {}", index + 2))?;
        tracing::debug!(row = index, archived = !wayback.is_empty(), "annotated");
    }
    writer.flush().context("flush annotated manifest")?;
    Ok(summary)
}
