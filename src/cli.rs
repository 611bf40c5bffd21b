//! CLI argument parsing for the replication toolkit.
use crate::fact::Plugin;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Default address of a local FACT instance.
pub const DEFAULT_FACT_URL: &str = "http://localhost:5000";

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "replicate-lfwc",
    version,
    about = "Download, verify, and analyze the LFWC firmware corpus",
    after_help = "Examples:\n  replicate-lfwc --corpus-csv corpus.csv download --corpus-dir lfwc --jobs 8\n  replicate-lfwc --corpus-csv corpus.csv download --corpus-dir lfwc --continue --use-wayback-machine\n  replicate-lfwc --corpus-csv corpus.csv verify --corpus-dir lfwc --json\n  replicate-lfwc --corpus-csv corpus.csv upload-to-fact --corpus-dir lfwc --plugins cwe_checker",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    /// Path to corpus.csv, either the file published with the paper or a compatible file
    #[arg(long, value_name = "PATH")]
    pub corpus_csv: PathBuf,

    /// Optional JSON config overriding download and upload pacing
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Download(DownloadArgs),
    Verify(VerifyArgs),
    UploadToFact(UploadArgs),
    /// Print an input file that can be passed to aria2c directly
    #[command(name = "dump-aria2-input")]
    DumpAria2Input,
    AnnotateWayback(AnnotateArgs),
}

#[derive(Parser, Debug)]
#[command(about = "Download all missing files with aria2c")]
pub struct DownloadArgs {
    /// Path to the corpus directory
    #[arg(long, value_name = "DIR")]
    pub corpus_dir: PathBuf,

    /// Number of concurrent downloads
    #[arg(long, default_value_t = 1)]
    pub jobs: usize,

    /// Continue downloading into an existing corpus directory
    #[arg(long = "continue")]
    pub continue_: bool,

    /// Prefer archive.org links where available. Run once without this flag
    /// first; archived downloads are rate limited to 5 files per minute.
    #[arg(long)]
    pub use_wayback_machine: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Print the path and status of every firmware image that is not downloaded correctly")]
pub struct VerifyArgs {
    /// Path to the corpus directory
    #[arg(long, value_name = "DIR")]
    pub corpus_dir: PathBuf,

    /// Print a flat JSON object mapping relative paths to status (missing,
    /// download-started, hash-mismatch, success). Missing means the download
    /// failed or has not happened yet.
    #[arg(long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
#[command(about = "Upload the corpus to FACT; safe to cancel and resume")]
pub struct UploadArgs {
    /// Path to the corpus directory
    #[arg(long, value_name = "DIR")]
    pub corpus_dir: PathBuf,

    /// Base URL of the FACT instance
    #[arg(long, default_value = DEFAULT_FACT_URL)]
    pub url: String,

    /// Analysis plugins to run on every uploaded image
    #[arg(long, value_enum, hide_possible_values = true)]
    pub plugins: Vec<Plugin>,
}

#[derive(Parser, Debug)]
#[command(about = "Add a wayback column with archive.org snapshot links")]
pub struct AnnotateArgs {
    /// Output path [default: <corpus-csv>-wayback]
    #[arg(long, value_name = "PATH")]
    pub out: Option<PathBuf>,
}
