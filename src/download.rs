//! Bulk download driver.
//!
//! Downloads are delegated to aria2c, which handles concurrency, retries,
//! checksums, and resumption. This module decides what to submit and paces
//! submissions to the Wayback Machine.
use crate::clock::Clock;
use crate::config::DownloadConfig;
use crate::corpus::Corpus;
use crate::manifest::ManifestRow;
use crate::naming::image_rel_path;
use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

/// Usage header printed above a standalone aria2 input file.
pub const ARIA2_INPUT_HEADER: &str = "\
# This file can be used with the aria2 download utility [1].
# To download the firmware corpus, we suggest the following invocation of aria2:
# ```
# aria2c \\
#     --connect-timeout=5 \\
#     --max-file-not-found=2 \\
#     --max-tries=2 \\
#     --lowest-speed-limit=1K \\
#     --timeout=5 \\
#     --auto-file-renaming=false \\
#     --save-session=session.aria2 \\
#     --dir=path/to/corpus \\
#     --input-file=firmwares.aria2c
# ```
#
# [1]: https://aria2.github.io/
";

/// One file for the downloader: where to fetch it, where to put it, and the
/// digest it must have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub url: String,
    pub out: String,
    pub sha256: String,
}

impl DownloadJob {
    /// Job for `row`, fetched from `url` instead of the manifest URL if given.
    pub fn for_row(row: &ManifestRow, url: Option<&str>) -> Self {
        Self {
            url: url.unwrap_or(&row.url).to_string(),
            out: image_rel_path(row),
            sha256: row.sha256.clone(),
        }
    }
}

/// Render jobs in aria2's input-file format.
pub fn render_job_list(jobs: &[DownloadJob]) -> String {
    let mut out = String::new();
    for job in jobs {
        out.push_str(&job.url);
        out.push('\n');
        out.push_str(&format!("  out={}\n", job.out));
        out.push_str(&format!("  checksum=sha-256={}\n", job.sha256));
    }
    out
}

/// Jobs submitted together under one concurrency limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadBatch {
    pub jobs: Vec<DownloadJob>,
    pub concurrency: usize,
}

/// Batches for one download run, in submission order.
#[derive(Debug, Default)]
pub struct DownloadPlan {
    /// Rows fetched from their original source.
    pub direct: Option<DownloadBatch>,
    /// Rows fetched from the Wayback Machine, one rate-limited batch each.
    pub archived: Vec<DownloadBatch>,
}

impl DownloadPlan {
    pub fn job_count(&self) -> usize {
        self.direct.iter().chain(&self.archived).map(|b| b.jobs.len()).sum()
    }
}

/// Rows that still need to be fetched or resumed.
///
/// A row is skipped when any row with the same digest is on disk and not
/// mid-transfer. Missing rows and rows with a partial download are returned;
/// rows with mismatching content are left to `verify`.
pub fn download_candidates(corpus: &Corpus) -> Vec<&ManifestRow> {
    let downloaded: HashSet<&str> = corpus
        .iter_present()
        .map(|row| row.sha256.as_str())
        .collect();
    corpus
        .iter_expected(None)
        .filter(|row| !downloaded.contains(row.sha256.as_str()))
        .collect()
}

/// Split candidates into the direct batch and the archived batches.
pub fn plan_downloads(
    candidates: &[&ManifestRow],
    use_wayback: bool,
    jobs: usize,
    wayback_batch_size: usize,
) -> DownloadPlan {
    let mut direct = Vec::new();
    let mut archived = Vec::new();
    for row in candidates {
        match row.wayback.as_deref() {
            Some(wayback) if use_wayback => archived.push(DownloadJob::for_row(row, Some(wayback))),
            _ => direct.push(DownloadJob::for_row(row, None)),
        }
    }
    let direct = if direct.is_empty() {
        None
    } else {
        Some(DownloadBatch {
            jobs: direct,
            concurrency: jobs.max(1),
        })
    };
    let archived = archived
        .chunks(wayback_batch_size.max(1))
        .map(|chunk| DownloadBatch {
            jobs: chunk.to_vec(),
            concurrency: 1,
        })
        .collect();
    DownloadPlan { direct, archived }
}

/// How a batch invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    pub success: bool,
    pub code: Option<i32>,
}

/// Runs a batch of jobs to completion.
pub trait BatchDownloader {
    fn run_batch(&self, batch: &DownloadBatch, dest: &Path) -> Result<BatchOutcome>;
}

/// aria2c invoked with the job list on stdin.
pub struct Aria2c {
    program: PathBuf,
    options: DownloadConfig,
}

impl Aria2c {
    /// Find aria2c on `PATH`.
    pub fn locate(options: DownloadConfig) -> Result<Self> {
        let program = which::which("aria2c")
            .map_err(|err| anyhow!("aria2c not found on PATH ({err}); install aria2 first"))?;
        Ok(Self::with_program(program, options))
    }

    pub fn with_program(program: PathBuf, options: DownloadConfig) -> Self {
        Self { program, options }
    }

    pub fn args(&self, concurrency: usize, dest: &Path) -> Vec<String> {
        let options = &self.options;
        vec![
            format!("--connect-timeout={}", options.connect_timeout_secs),
            format!("--max-file-not-found={}", options.max_file_not_found),
            format!("--max-tries={}", options.max_tries),
            format!("--lowest-speed-limit={}", options.lowest_speed_limit),
            format!("--timeout={}", options.timeout_secs),
            "--auto-file-renaming=false".to_string(),
            format!("--check-certificate={}", options.check_certificate),
            format!("--max-concurrent-downloads={concurrency}"),
            "--split=1".to_string(),
            format!("--dir={}", dest.display()),
            "--input-file=-".to_string(),
        ]
    }
}

impl BatchDownloader for Aria2c {
    fn run_batch(&self, batch: &DownloadBatch, dest: &Path) -> Result<BatchOutcome> {
        let mut child = Command::new(&self.program)
            .args(self.args(batch.concurrency, dest))
            .stdin(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn {}", self.program.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(render_job_list(&batch.jobs).as_bytes())
                .context("write job list to aria2c stdin")?;
        }

        let status = child.wait().context("wait for aria2c")?;
        Ok(BatchOutcome {
            success: status.success(),
            code: status.code(),
        })
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    pub batches: usize,
    pub jobs_submitted: usize,
    pub failed_batches: usize,
}

/// Submit every batch of `plan`, sleeping `backoff` between archived batches.
///
/// A batch that exits non-zero is logged and the run continues; the outcome
/// of individual files is only known after `verify`.
pub fn run_plan(
    plan: &DownloadPlan,
    downloader: &dyn BatchDownloader,
    clock: &dyn Clock,
    dest: &Path,
    backoff: Duration,
) -> Result<DownloadSummary> {
    let mut summary = DownloadSummary::default();

    if let Some(batch) = &plan.direct {
        tracing::info!(jobs = batch.jobs.len(), concurrency = batch.concurrency, "downloading from original sources");
        submit(batch, downloader, dest, &mut summary)?;
    }

    for (index, batch) in plan.archived.iter().enumerate() {
        if index > 0 {
            tracing::info!(secs = backoff.as_secs(), "waiting for archive rate limit");
            clock.sleep(backoff);
        }
        tracing::info!(
            batch = index + 1,
            of = plan.archived.len(),
            jobs = batch.jobs.len(),
            "downloading from the Wayback Machine"
        );
        submit(batch, downloader, dest, &mut summary)?;
    }

    Ok(summary)
}

fn submit(
    batch: &DownloadBatch,
    downloader: &dyn BatchDownloader,
    dest: &Path,
    summary: &mut DownloadSummary,
) -> Result<()> {
    let outcome = downloader.run_batch(batch, dest)?;
    summary.batches += 1;
    summary.jobs_submitted += batch.jobs.len();
    if !outcome.success {
        summary.failed_batches += 1;
        tracing::warn!(code = ?outcome.code, jobs = batch.jobs.len(), "download batch exited unsuccessfully");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::manifest::test_row;
    use crate::status::in_progress_marker_path;
    use crate::util::sha256_hex;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    /// Downloader that writes known content for every job it is given.
    #[derive(Default)]
    struct FakeDownloader {
        content_by_hash: HashMap<String, Vec<u8>>,
        batches: RefCell<Vec<DownloadBatch>>,
        fail: bool,
    }

    impl BatchDownloader for FakeDownloader {
        fn run_batch(&self, batch: &DownloadBatch, dest: &Path) -> Result<BatchOutcome> {
            self.batches.borrow_mut().push(batch.clone());
            for job in &batch.jobs {
                if let Some(content) = self.content_by_hash.get(&job.sha256) {
                    let path = dest.join(&job.out);
                    fs::create_dir_all(path.parent().expect("parent"))?;
                    fs::write(&path, content)?;
                }
            }
            Ok(BatchOutcome {
                success: !self.fail,
                code: Some(if self.fail { 7 } else { 0 }),
            })
        }
    }

    fn row_with_content(seed: &str, content: &[u8], wayback: Option<&str>) -> ManifestRow {
        ManifestRow {
            sha256: sha256_hex(content),
            size: content.len() as u64,
            wayback: wayback.map(str::to_string),
            ..test_row(seed)
        }
    }

    #[test]
    fn job_list_matches_aria2_input_format() {
        let row = test_row("a");
        let jobs = vec![DownloadJob::for_row(&row, None)];
        let rendered = render_job_list(&jobs);
        let expected = format!(
            "{}\n  out={}\n  checksum=sha-256={}\n",
            row.url,
            image_rel_path(&row),
            row.sha256
        );
        assert_eq!(rendered, expected);
    }

    #[test]
    fn wayback_rows_are_batched_by_five_with_single_concurrency() {
        let rows: Vec<ManifestRow> = (0..12)
            .map(|i| {
                let wayback = (i % 4 != 0).then(|| format!("https://web.archive.org/web/{i}"));
                ManifestRow {
                    wayback,
                    ..test_row(&format!("{:x}", i % 16))
                }
            })
            .collect();
        let candidates: Vec<&ManifestRow> = rows.iter().collect();

        let plan = plan_downloads(&candidates, true, 8, 5);
        let direct = plan.direct.as_ref().expect("direct batch");
        assert_eq!(direct.jobs.len(), 3);
        assert_eq!(direct.concurrency, 8);
        let sizes: Vec<_> = plan.archived.iter().map(|b| b.jobs.len()).collect();
        assert_eq!(sizes, vec![5, 4]);
        assert!(plan.archived.iter().all(|b| b.concurrency == 1));
        assert!(plan.archived[0].jobs[0].url.starts_with("https://web.archive.org/"));
        assert_eq!(plan.job_count(), 12);
    }

    #[test]
    fn without_wayback_every_candidate_uses_its_source_url() {
        let rows = [
            ManifestRow {
                wayback: Some("https://web.archive.org/web/1".to_string()),
                ..test_row("a")
            },
            test_row("b"),
        ];
        let candidates: Vec<&ManifestRow> = rows.iter().collect();
        let plan = plan_downloads(&candidates, false, 2, 5);
        assert!(plan.archived.is_empty());
        let direct = plan.direct.expect("direct batch");
        assert_eq!(direct.jobs[0].url, rows[0].url);
    }

    #[test]
    fn candidates_include_missing_and_partial_but_not_complete_rows() {
        let dir = TempDir::new().expect("temp dir");
        let rows = vec![
            row_with_content("a", b"done", None),
            row_with_content("b", b"partial", None),
            row_with_content("c", b"absent", None),
            row_with_content("d", b"expected", None),
        ];
        let corpus = Corpus::new(dir.path().to_path_buf(), rows);
        let write = |index: usize, bytes: &[u8]| {
            let path = corpus.image_path(&corpus.manifest()[index]);
            fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
            fs::write(&path, bytes).expect("write");
            path
        };
        write(0, b"done");
        let partial = write(1, b"part");
        fs::write(in_progress_marker_path(&partial), b"").expect("marker");
        write(3, b"corrupted");

        let ids: Vec<_> = download_candidates(&corpus)
            .iter()
            .map(|row| row.row_id.clone())
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn second_run_submits_nothing_after_a_complete_first_run() {
        let dir = TempDir::new().expect("temp dir");
        let contents: [&[u8]; 3] = [b"one", b"two", b"three"];
        let rows: Vec<ManifestRow> = ["a", "b", "c"]
            .iter()
            .zip(contents)
            .map(|(seed, content)| row_with_content(seed, content, None))
            .collect();
        let corpus = Corpus::new(dir.path().to_path_buf(), rows);
        let downloader = FakeDownloader {
            content_by_hash: contents
                .iter()
                .map(|content| (sha256_hex(content), content.to_vec()))
                .collect(),
            ..FakeDownloader::default()
        };
        let clock = ManualClock::default();

        let plan = plan_downloads(&download_candidates(&corpus), false, 4, 5);
        let first = run_plan(&plan, &downloader, &clock, corpus.root(), Duration::from_secs(60))
            .expect("first run");
        assert_eq!(first.jobs_submitted, 3);

        let plan = plan_downloads(&download_candidates(&corpus), false, 4, 5);
        let second = run_plan(&plan, &downloader, &clock, corpus.root(), Duration::from_secs(60))
            .expect("second run");
        assert_eq!(second, DownloadSummary::default());
        assert_eq!(downloader.batches.borrow().len(), 1);
    }

    #[test]
    fn archived_batches_are_paced_and_failures_do_not_stop_the_run() {
        let rows: Vec<ManifestRow> = (0..11)
            .map(|i| ManifestRow {
                wayback: Some(format!("https://web.archive.org/web/{i}")),
                ..test_row(&format!("{:x}", i))
            })
            .collect();
        let candidates: Vec<&ManifestRow> = rows.iter().collect();
        let plan = plan_downloads(&candidates, true, 4, 5);
        let downloader = FakeDownloader {
            fail: true,
            ..FakeDownloader::default()
        };
        let clock = ManualClock::default();

        let summary = run_plan(
            &plan,
            &downloader,
            &clock,
            Path::new("/nonexistent"),
            Duration::from_secs(60),
        )
        .expect("run continues past failed batches");
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.failed_batches, 3);
        assert_eq!(summary.jobs_submitted, 11);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(60); 2]);
    }

    #[test]
    fn aria2_arguments_follow_config() {
        let aria2 = Aria2c::with_program(PathBuf::from("aria2c"), DownloadConfig::default());
        let args = aria2.args(3, Path::new("/corpus"));
        assert!(args.contains(&"--max-concurrent-downloads=3".to_string()));
        assert!(args.contains(&"--check-certificate=false".to_string()));
        assert!(args.contains(&"--auto-file-renaming=false".to_string()));
        assert!(args.contains(&"--dir=/corpus".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--input-file=-"));
    }

    #[cfg(unix)]
    #[test]
    fn aria2_runner_feeds_jobs_on_stdin_and_reports_exit_code() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().expect("temp dir");
        let capture = dir.path().join("stdin.txt");
        let script = dir.path().join("fake-aria2c");
        fs::write(
            &script,
            format!("#!/bin/sh\ncat > '{}'\nexit 3\n", capture.display()),
        )
        .expect("write script");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");

        let row = test_row("a");
        let batch = DownloadBatch {
            jobs: vec![DownloadJob::for_row(&row, None)],
            concurrency: 1,
        };
        let aria2 = Aria2c::with_program(script, DownloadConfig::default());
        let outcome = aria2.run_batch(&batch, dir.path()).expect("run script");

        assert!(!outcome.success);
        assert_eq!(outcome.code, Some(3));
        let fed = fs::read_to_string(&capture).expect("read capture");
        assert_eq!(fed, render_job_list(&batch.jobs));
    }
}
