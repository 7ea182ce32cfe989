//! On-disk layout of an in-progress download.
//!
//! Part files live in a working directory next to the output file, named after
//! the MD5 of the URL's file name, so a retried download of the same URL finds
//! the bytes of the previous attempt. The directory also holds the segment plan
//! the part files were written for.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use crate::state::SegmentPlan;
use crate::utils::{md5_hex, url_file_name};

const PLAN_FILE: &str = "plan.json";

pub fn work_dir_for(url: &str, output_path: &Path) -> PathBuf {
    let parent = match output_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    parent.join(md5_hex(&url_file_name(url)))
}

pub fn part_path(work_dir: &Path, index: usize) -> PathBuf {
    work_dir.join(format!("{}.part", index))
}

pub fn plan_path(work_dir: &Path) -> PathBuf {
    work_dir.join(PLAN_FILE)
}

/// Plan stored by a previous attempt. A missing or unreadable plan file yields
/// `None`.
pub async fn load_plan(work_dir: &Path) -> std::io::Result<Option<SegmentPlan>> {
    let content = match fs::read(plan_path(work_dir)).await {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    match serde_json::from_slice(&content) {
        Ok(plan) => Ok(Some(plan)),
        Err(e) => {
            debug!("Ignoring unreadable plan in {:?}: {}", work_dir, e);
            Ok(None)
        }
    }
}

pub async fn save_plan(work_dir: &Path, plan: &SegmentPlan) -> std::io::Result<()> {
    let content = serde_json::to_vec_pretty(plan)?;
    fs::write(plan_path(work_dir), content).await
}

pub async fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir).await
}

/// Size of the file at `path`, or 0 when it does not exist.
pub async fn existing_size(path: &Path) -> std::io::Result<u64> {
    match fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

pub async fn remove_file_if_exists(path: &Path) -> std::io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Concatenates `0.part..count.part` into `output` in index order, skipping
/// missing parts. Returns the number of bytes written.
pub async fn merge_parts(work_dir: &Path, count: usize, output: &Path) -> std::io::Result<u64> {
    remove_file_if_exists(output).await?;

    let mut writer = BufWriter::new(File::create(output).await?);
    let mut written = 0;
    for index in 0..count {
        let part = part_path(work_dir, index);
        let mut reader = match File::open(&part).await {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Part file {:?} missing, skipped", part);
                continue;
            }
            Err(e) => return Err(e),
        };
        let copied = tokio::io::copy(&mut reader, &mut writer).await?;
        debug!("Merged {:?} ({} bytes)", part, copied);
        written += copied;
    }
    writer.flush().await?;
    writer.into_inner().sync_all().await?;

    Ok(written)
}

/// Moves a single part file into place, replacing any existing output.
pub async fn move_into_place(part: &Path, output: &Path) -> std::io::Result<()> {
    fs::rename(part, output).await
}

pub async fn remove_work_dir(work_dir: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(work_dir).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
