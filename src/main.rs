use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod clock;
mod config;
mod corpus;
mod download;
mod fact;
mod manifest;
mod naming;
mod status;
mod upload;
mod util;
mod wayback;
mod workflow;

use cli::{Command, RootArgs};

fn main() -> Result<()> {
    init_tracing();
    let args = RootArgs::parse();
    let config = config::load_config(args.config.as_deref())?;

    match args.command {
        Command::Download(download) => workflow::run_download(&args.corpus_csv, &config, download),
        Command::Verify(verify) => workflow::run_verify(&args.corpus_csv, verify),
        Command::UploadToFact(upload) => workflow::run_upload(&args.corpus_csv, &config, upload),
        Command::DumpAria2Input => workflow::run_dump_aria2_input(&args.corpus_csv),
        Command::AnnotateWayback(annotate) => {
            workflow::run_annotate_wayback(&args.corpus_csv, &config, annotate)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
