use clap::{Parser, ValueEnum};
use std::path::PathBuf;

use rangedl::DigestEncoding;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// URL to download
    #[arg(index = 1)]
    pub url: String,

    /// Output file (defaults to the file name in the URL)
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Maximum number of concurrent segments
    #[arg(short = 's', long)]
    pub threads: Option<usize>,

    /// Expected MD5 digest of the finished file
    #[arg(long, conflicts_with = "sha256")]
    pub md5: Option<String>,

    /// Expected SHA-256 digest of the finished file
    #[arg(long)]
    pub sha256: Option<String>,

    /// How the expected digest is written
    #[arg(long = "digest-encoding", value_enum, default_value = "hex")]
    pub digest_encoding: EncodingArg,

    /// Minimum milliseconds between progress updates
    #[arg(long = "throttle-ms")]
    pub throttle_ms: Option<u64>,

    /// TOML file with engine settings
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Print every event as a JSON line instead of a progress bar
    #[arg(long)]
    pub json: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long = "log-level", default_value = "warn")]
    pub log_level: String,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum EncodingArg {
    Hex,
    Base64,
}

impl From<EncodingArg> for DigestEncoding {
    fn from(arg: EncodingArg) -> Self {
        match arg {
            EncodingArg::Hex => DigestEncoding::Hex,
            EncodingArg::Base64 => DigestEncoding::Base64,
        }
    }
}
