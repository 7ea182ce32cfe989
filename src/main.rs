mod cli;

use anyhow::{bail, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::path::{Path, PathBuf};

use rangedl::utils::get_filename_from_url;
use rangedl::{DownloadOutcome, DownloadPhase, Downloader, DownloaderConfig, FileValidator};

use crate::cli::Args;

fn main() -> Result<()> {
    let args = Args::parse();
    rangedl::logging::init(&args.log_level);

    let mut config = match &args.config {
        Some(path) => DownloaderConfig::load(path)?,
        None => DownloaderConfig::default(),
    };
    if let Some(threads) = args.threads {
        config.max_parallelism = threads;
    }
    if let Some(ms) = args.throttle_ms {
        config.throttle_interval_ms = ms;
    }
    config.validate()?;

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| PathBuf::from(get_filename_from_url(&args.url)));

    let rt = tokio::runtime::Runtime::new()?;
    let phase = rt.block_on(run(&args, config, output))?;

    match phase {
        DownloadPhase::Completed => Ok(()),
        DownloadPhase::Cancelled => bail!("Download cancelled, run the same command again to resume"),
        _ => bail!("Download of {} failed", args.url),
    }
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum JsonEvent<'a> {
    Progress {
        url: &'a str,
        downloaded_bytes: u64,
        total_bytes: u64,
    },
    Completed {
        url: &'a str,
        path: &'a Path,
    },
    Failed {
        url: &'a str,
        error: String,
    },
    Cancelled {
        url: &'a str,
    },
}

impl<'a> From<&'a DownloadOutcome> for JsonEvent<'a> {
    fn from(event: &'a DownloadOutcome) -> Self {
        match event {
            DownloadOutcome::Progress { url, progress } => JsonEvent::Progress {
                url,
                downloaded_bytes: progress.downloaded_bytes,
                total_bytes: progress.total_bytes,
            },
            DownloadOutcome::Completed { url, path } => JsonEvent::Completed { url, path },
            DownloadOutcome::Failed { url, error } => JsonEvent::Failed {
                url,
                error: error.to_string(),
            },
        }
    }
}

fn validator_from_args(args: &Args) -> Option<FileValidator> {
    let validator = match (&args.md5, &args.sha256) {
        (Some(digest), _) => FileValidator::md5(digest.clone()),
        (None, Some(digest)) => FileValidator::sha256(digest.clone()),
        (None, None) => return None,
    };
    Some(validator.with_encoding(args.digest_encoding.into()))
}

async fn run(args: &Args, config: DownloaderConfig, output: PathBuf) -> Result<DownloadPhase> {
    let mut downloader = Downloader::new(config)?;
    if let Some(validator) = validator_from_args(args) {
        downloader = downloader.with_validator(validator);
    }

    let mut handle = downloader.start(args.url.clone(), output.clone(), None);

    let cancel = handle.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let pb = (!args.json).then(|| {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        pb.set_message(format!("Downloading {}", output.display()));
        pb
    });

    while let Some(event) = handle.next().await {
        if args.json {
            println!("{}", serde_json::to_string(&JsonEvent::from(&event))?);
            continue;
        }
        let Some(pb) = &pb else { continue };
        match &event {
            DownloadOutcome::Progress { progress, .. } => {
                pb.set_length(progress.total_bytes);
                pb.set_position(progress.downloaded_bytes);
            }
            DownloadOutcome::Completed { path, .. } => {
                pb.finish_with_message(format!("Completed   {}", path.display()));
            }
            DownloadOutcome::Failed { error, .. } => {
                pb.abandon_with_message(format!("Failed      {}: {}", event.url(), error));
            }
        }
    }

    let phase = handle.finish().await;
    if phase == DownloadPhase::Cancelled {
        if args.json {
            println!(
                "{}",
                serde_json::to_string(&JsonEvent::Cancelled { url: &args.url })?
            );
        } else if let Some(pb) = &pb {
            pb.abandon_with_message("Cancelled, part files kept");
        }
    }
    Ok(phase)
}
