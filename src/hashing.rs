//! Post-download digest validation.

use std::path::Path;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

const READ_BUFFER: usize = 8192;

/// A digest computed by streaming a file from disk.
#[async_trait]
pub trait DigestAlgorithm: Send + Sync {
    fn name(&self) -> &'static str;

    async fn compute_digest(&self, path: &Path) -> std::io::Result<Vec<u8>>;
}

/// Feeds the file at `path` to `update` in fixed-size reads.
async fn read_chunks<F>(path: &Path, mut update: F) -> std::io::Result<()>
where
    F: FnMut(&[u8]) + Send,
{
    let mut file = File::open(path).await?;
    let mut buffer = vec![0u8; READ_BUFFER];
    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        update(&buffer[..n]);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Md5Digest;

#[async_trait]
impl DigestAlgorithm for Md5Digest {
    fn name(&self) -> &'static str {
        "MD5"
    }

    async fn compute_digest(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        let mut context = md5::Context::new();
        read_chunks(path, |chunk| context.consume(chunk)).await?;
        Ok(context.compute().0.to_vec())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Digest;

#[async_trait]
impl DigestAlgorithm for Sha256Digest {
    fn name(&self) -> &'static str {
        "SHA-256"
    }

    async fn compute_digest(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        let mut hasher = Sha256::new();
        read_chunks(path, |chunk| hasher.update(chunk)).await?;
        Ok(hasher.finalize().to_vec())
    }
}

/// How the expected digest is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DigestEncoding {
    #[default]
    Hex,
    Base64,
}

impl DigestEncoding {
    pub fn encode(&self, digest: &[u8]) -> String {
        match self {
            DigestEncoding::Hex => hex::encode(digest),
            DigestEncoding::Base64 => STANDARD.encode(digest),
        }
    }
}

/// Compares the digest of `path` with `expected`, ignoring case.
///
/// A file that cannot be read yields `false`, the same as a mismatch.
pub async fn validate_digest(
    algorithm: &dyn DigestAlgorithm,
    path: &Path,
    expected: &str,
    expected_is_base64: bool,
) -> bool {
    let encoding = if expected_is_base64 {
        DigestEncoding::Base64
    } else {
        DigestEncoding::Hex
    };

    let digest = match algorithm.compute_digest(path).await {
        Ok(d) => d,
        Err(e) => {
            warn!("Cannot compute {} of {:?}: {}", algorithm.name(), path, e);
            return false;
        }
    };

    let actual = encoding.encode(&digest);
    let matched = actual.eq_ignore_ascii_case(expected.trim());
    if matched {
        debug!("{} of {:?} verified", algorithm.name(), path);
    } else {
        warn!(
            "{} mismatch for {:?}: expected {}, got {}",
            algorithm.name(),
            path,
            expected,
            actual
        );
    }
    matched
}

/// An expected digest bound to the algorithm that produces it.
pub struct FileValidator {
    algorithm: Box<dyn DigestAlgorithm>,
    expected: String,
    encoding: DigestEncoding,
}

impl FileValidator {
    pub fn new(algorithm: Box<dyn DigestAlgorithm>, expected: impl Into<String>) -> Self {
        Self {
            algorithm,
            expected: expected.into(),
            encoding: DigestEncoding::Hex,
        }
    }

    pub fn md5(expected: impl Into<String>) -> Self {
        Self::new(Box::new(Md5Digest), expected)
    }

    pub fn sha256(expected: impl Into<String>) -> Self {
        Self::new(Box::new(Sha256Digest), expected)
    }

    pub fn with_encoding(mut self, encoding: DigestEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn algorithm_name(&self) -> &'static str {
        self.algorithm.name()
    }

    pub async fn validate(&self, path: &Path) -> bool {
        validate_digest(
            self.algorithm.as_ref(),
            path,
            &self.expected,
            self.encoding == DigestEncoding::Base64,
        )
        .await
    }
}

impl std::fmt::Debug for FileValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileValidator")
            .field("algorithm", &self.algorithm.name())
            .field("expected", &self.expected)
            .field("encoding", &self.encoding)
            .finish()
    }
}
