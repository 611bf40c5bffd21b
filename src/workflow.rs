//! Command implementations.
//!
//! Each step loads the manifest, binds it to a corpus directory, and hands off
//! to the driver for that command. Results meant for scripts go to stdout;
//! diagnostics go to stderr.
use crate::cli::{AnnotateArgs, DownloadArgs, UploadArgs, VerifyArgs};
use crate::clock::SystemClock;
use crate::config::ReplicationConfig;
use crate::corpus::{check_download_root, create_download_root, require_existing_root, Corpus};
use crate::download::{
    download_candidates, plan_downloads, render_job_list, run_plan, Aria2c, DownloadJob,
    ARIA2_INPUT_HEADER,
};
use crate::fact::FactClient;
use crate::manifest::load_manifest;
use crate::status::StatusReport;
use crate::upload::Uploader;
use crate::wayback::{annotate_csv, WaybackClient};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

/// Download every image that is missing or only partially downloaded.
pub fn run_download(manifest_path: &Path, config: &ReplicationConfig, args: DownloadArgs) -> Result<()> {
    let manifest = load_manifest(manifest_path)?;
    check_download_root(&args.corpus_dir, args.continue_)?;
    let downloader = Aria2c::locate(config.download.clone())?;
    create_download_root(&args.corpus_dir)?;
    let corpus = Corpus::new(args.corpus_dir, manifest);

    let candidates = download_candidates(&corpus);
    let plan = plan_downloads(
        &candidates,
        args.use_wayback_machine,
        args.jobs,
        config.download.wayback_batch_size,
    );
    tracing::info!(
        expected = corpus.manifest().len(),
        to_download = plan.job_count(),
        archived_batches = plan.archived.len(),
        "download plan ready"
    );

    let clock = SystemClock::new();
    let summary = run_plan(
        &plan,
        &downloader,
        &clock,
        corpus.root(),
        config.download.wayback_backoff(),
    )?;
    tracing::info!(
        batches = summary.batches,
        jobs = summary.jobs_submitted,
        failed_batches = summary.failed_batches,
        "downloading finished"
    );
    eprintln!("Downloading finished, check failed files with\n replicate-lfwc verify");
    Ok(())
}

/// Report the status of every expected image.
pub fn run_verify(manifest_path: &Path, args: VerifyArgs) -> Result<()> {
    let manifest = load_manifest(manifest_path)?;
    require_existing_root(&args.corpus_dir)?;
    let corpus = Corpus::new(args.corpus_dir, manifest);

    let report = StatusReport::build(&corpus);
    for (path, status) in report.problems() {
        eprintln!("{path}:{status}");
    }

    if args.json {
        let text = serde_json::to_string(&report).context("serialize status report")?;
        println!("{text}");
    } else {
        for (status, count) in report.counts() {
            println!("{status}: {count}");
        }
    }
    Ok(())
}

/// Upload every downloaded image to FACT.
pub fn run_upload(manifest_path: &Path, config: &ReplicationConfig, args: UploadArgs) -> Result<()> {
    let manifest = load_manifest(manifest_path)?;
    require_existing_root(&args.corpus_dir)
        .context("cannot upload a corpus that was never downloaded")?;
    let corpus = Corpus::new(args.corpus_dir, manifest);

    let service = FactClient::new(&args.url);
    let clock = SystemClock::new();
    let report = Uploader::new(&service, &clock, &config.upload, &args.plugins).run(&corpus)?;

    println!("Attempted: {}", report.attempted);
    println!("Already uploaded: {}", report.skipped);
    println!("Uploaded: {}", report.succeeded);
    println!("Failed: {}", report.failed);
    Ok(())
}

/// Print the whole manifest as an aria2 input file.
pub fn run_dump_aria2_input(manifest_path: &Path) -> Result<()> {
    let manifest = load_manifest(manifest_path)?;
    let jobs: Vec<DownloadJob> = manifest
        .iter()
        .map(|row| DownloadJob::for_row(row, None))
        .collect();
    print!("{ARIA2_INPUT_HEADER}{}", render_job_list(&jobs));
    Ok(())
}

/// Write a copy of the manifest with a `wayback` column.
pub fn run_annotate_wayback(
    manifest_path: &Path,
    config: &ReplicationConfig,
    args: AnnotateArgs,
) -> Result<()> {
    let out = args
        .out
        .unwrap_or_else(|| default_annotated_path(manifest_path));
    let client = WaybackClient::new(&config.wayback_lookup.endpoint);
    let clock = SystemClock::new();
    let backoff = std::time::Duration::from_secs(config.wayback_lookup.backoff_secs);
    let summary = annotate_csv(manifest_path, &out, &client, &clock, backoff)?;
    tracing::info!(rows = summary.rows, archived = summary.archived, "wayback annotation finished");
    eprintln!("wrote {}", out.display());
    Ok(())
}

fn default_annotated_path(manifest_path: &Path) -> PathBuf {
    let mut out = manifest_path.as_os_str().to_owned();
    out.push("-wayback");
    PathBuf::from(out)
}
