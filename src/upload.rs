//! Sequential upload of the corpus to an analysis service.
//!
//! The run can be interrupted at any time: already uploaded images are
//! detected through the service and skipped on the next run.
use crate::clock::Clock;
use crate::config::UploadConfig;
use crate::corpus::Corpus;
use crate::fact::{AnalysisService, Plugin, ProgressSnapshot};
use crate::manifest::ManifestRow;
use anyhow::Result;
use serde::Serialize;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    /// Images on disk that were considered.
    pub attempted: usize,
    /// Images the service already had.
    pub skipped: usize,
    pub succeeded: usize,
    /// Submissions the service did not accept.
    pub failed: usize,
}

/// How waiting for analysis capacity ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapacityWait {
    Available,
    /// Progress stopped changing while still over the ceiling.
    Stuck(ProgressSnapshot),
}

pub struct Uploader<'a> {
    service: &'a dyn AnalysisService,
    clock: &'a dyn Clock,
    config: &'a UploadConfig,
    plugins: &'a [Plugin],
}

impl<'a> Uploader<'a> {
    pub fn new(
        service: &'a dyn AnalysisService,
        clock: &'a dyn Clock,
        config: &'a UploadConfig,
        plugins: &'a [Plugin],
    ) -> Self {
        Self {
            service,
            clock,
            config,
            plugins,
        }
    }

    /// Upload every image that is on disk and not yet known to the service.
    ///
    /// Presence and progress queries that fail abort the run; a failed
    /// submission only counts against that image.
    pub fn run(&self, corpus: &Corpus) -> Result<UploadReport> {
        let candidates: Vec<&ManifestRow> = corpus.iter_present().collect();
        let mut report = UploadReport {
            attempted: candidates.len(),
            ..UploadReport::default()
        };
        tracing::info!(candidates = candidates.len(), "starting upload");

        for row in candidates {
            if self.service.is_uploaded(row)? {
                tracing::debug!(uid = %row.content_uid(), "already uploaded");
                report.skipped += 1;
                continue;
            }

            if let CapacityWait::Stuck(snapshot) = self.wait_for_capacity()? {
                tracing::warn!(analyses = ?snapshot, "analyses appear stuck, uploading anyway");
            }

            tracing::info!(
                vendor = %row.vendor,
                device = %row.device,
                version = row.version.as_deref().unwrap_or("unknown"),
                "uploading"
            );
            match self
                .service
                .upload(row, &corpus.image_path(row), self.plugins)
            {
                Ok(uid) => {
                    tracing::info!(%uid, "upload successful");
                    report.succeeded += 1;
                }
                Err(err) => {
                    tracing::warn!(uid = %row.content_uid(), error = %format!("{err:#}"), "upload failed");
                    report.failed += 1;
                }
            }

            self.clock.sleep(self.config.cooldown());
        }

        Ok(report)
    }

    /// Block while more analyses than allowed are running.
    ///
    /// Gives up once the progress snapshot has not changed for longer than the
    /// stuck timeout.
    pub fn wait_for_capacity(&self) -> Result<CapacityWait> {
        let mut snapshot = self.service.analysis_progress()?;
        let mut last_changed = self.clock.now();
        while snapshot.len() > self.config.max_concurrent_analyses {
            self.clock.sleep(self.config.poll_interval());
            let now = self.clock.now();
            let next = self.service.analysis_progress()?;
            if next != snapshot {
                last_changed = now;
                snapshot = next;
            } else if now.saturating_sub(last_changed) > self.config.stuck_timeout() {
                return Ok(CapacityWait::Stuck(snapshot));
            }
        }
        Ok(CapacityWait::Available)
    }
}
