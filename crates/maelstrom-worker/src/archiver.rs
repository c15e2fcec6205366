//! Artifact archiver (C3).
//!
//! Matches glob patterns against a task's work directory, bounds the total uncompressed size,
//! and produces an in-memory zip archive. Never writes the archive to disk; the caller uploads
//! the buffer and drops it.

use anyhow::{Context as _, Result};
use globset::Glob;
use slog::{info, o, warn, Logger};
use std::{
    collections::BTreeSet,
    io::Write as _,
    path::{Path, PathBuf},
};

/// Maximum total uncompressed size of matched artifacts, in bytes, before we give up and upload
/// a diagnostic sentinel instead.
pub const MAX_TOTAL_SIZE_BYTES: u64 = 200 * 1024 * 1024;

/// Name of the single entry uploaded in place of the real artifacts when they're too large.
pub const OVERSIZE_SENTINEL_NAME: &str = "_ARCHIVE_TOO_BIG_";

/// Expand `globs` (patterns relative to `work_dir`) into canonical absolute file paths,
/// discarding duplicates and any match that escapes `work_dir` via a symlink.
fn resolve_matches(log: &Logger, work_dir: &Path, globs: &[String]) -> Result<BTreeSet<PathBuf>> {
    let canonical_work_dir = work_dir
        .canonicalize()
        .with_context(|| format!("canonicalizing work dir {}", work_dir.display()))?;

    let mut matched = BTreeSet::new();
    for pattern in globs {
        let full_pattern = work_dir.join(pattern);
        let full_pattern_str = full_pattern.to_string_lossy().into_owned();
        let glob = match Glob::new(&full_pattern_str) {
            Ok(g) => g.compile_matcher(),
            Err(e) => {
                warn!(log, "invalid artifact glob"; "pattern" => pattern, "error" => %e);
                continue;
            }
        };
        let base_for_walk = glob_base_dir(work_dir, pattern);
        for entry in walkdir_files(&base_for_walk) {
            if !glob.is_match(&entry) {
                continue;
            }
            let canonical = match entry.canonicalize() {
                Ok(c) => c,
                Err(e) => {
                    warn!(log, "could not canonicalize match"; "path" => %entry.display(), "error" => %e);
                    continue;
                }
            };
            if !canonical.starts_with(&canonical_work_dir) {
                warn!(
                    log,
                    "glob matched file outside work dir, skipping";
                    "pattern" => pattern,
                    "path" => %canonical.display(),
                );
                continue;
            }
            matched.insert(canonical);
        }
    }
    Ok(matched)
}

/// The directory under which it's worth recursively walking for a given glob pattern: the
/// portion of the pattern before the first wildcard component, so e.g. `out/*.log` only walks
/// `work_dir/out`.
fn glob_base_dir(work_dir: &Path, pattern: &str) -> PathBuf {
    let mut base = work_dir.to_path_buf();
    for component in Path::new(pattern).components() {
        let s = component.as_os_str().to_string_lossy();
        if s.contains(['*', '?', '[']) {
            break;
        }
        base.push(component.as_os_str());
    }
    base
}

fn walkdir_files(root: &Path) -> Vec<PathBuf> {
    if !root.exists() {
        return Vec::new();
    }
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}

fn relative_arcname(work_dir: &Path, absolute: &Path) -> String {
    let rel = absolute.strip_prefix(work_dir).unwrap_or(absolute);
    let s = rel.to_string_lossy();
    s.trim_start_matches('/').to_string()
}

/// Build the archive for `task`'s matched artifacts. Returns `None` if no glob matched
/// anything (no archive is produced in that case).
pub fn build_archive(log: &Logger, work_dir: &Path, globs: &[String]) -> Result<Option<Vec<u8>>> {
    let log = log.new(o!("component" => "archiver"));
    if globs.is_empty() {
        return Ok(None);
    }
    let matched = resolve_matches(&log, work_dir, globs)?;
    if matched.is_empty() {
        return Ok(None);
    }

    let mut total_size: u64 = 0;
    for path in &matched {
        total_size += std::fs::metadata(path)
            .with_context(|| format!("stat-ing matched artifact {}", path.display()))?
            .len();
    }

    let mut buf = Vec::new();
    let cursor = std::io::Cursor::new(&mut buf);
    let mut zip = zip::ZipWriter::new(cursor);
    let options =
        zip::write::FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    if total_size > MAX_TOTAL_SIZE_BYTES {
        info!(
            log,
            "matched artifacts exceeded maximum size, uploading diagnostic sentinel instead";
            "total_size" => total_size,
            "max_size" => MAX_TOTAL_SIZE_BYTES,
        );
        zip.start_file(OVERSIZE_SENTINEL_NAME, options)?;
        let message = format!(
            "Size of matched uncompressed test artifacts exceeded maximum size \
             ({total_size} bytes > {MAX_TOTAL_SIZE_BYTES} bytes)!"
        );
        zip.write_all(message.as_bytes())?;
        zip.finish()?;
        return Ok(Some(buf));
    }

    for path in &matched {
        let arcname = relative_arcname(work_dir, path);
        zip.start_file(&arcname, options)?;
        let contents = std::fs::read(path)
            .with_context(|| format!("reading matched artifact {}", path.display()))?;
        zip.write_all(&contents)?;
    }
    zip.finish()?;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_logger() -> Logger {
        Logger::root(slog::Discard, o!())
    }

    fn write_file(path: &Path, contents: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn no_globs_no_archive() {
        let tmp = tempdir().unwrap();
        assert!(build_archive(&test_logger(), tmp.path(), &[]).unwrap().is_none());
    }

    #[test]
    fn no_matches_no_archive() {
        let tmp = tempdir().unwrap();
        let result = build_archive(&test_logger(), tmp.path(), &["out/*.log".to_string()]).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn matches_produce_archive_with_expected_entries() {
        let tmp = tempdir().unwrap();
        write_file(&tmp.path().join("out/a.log"), b"hello");
        write_file(&tmp.path().join("out/b.log"), b"world!!");
        let archive = build_archive(&test_logger(), tmp.path(), &["out/*.log".to_string()])
            .unwrap()
            .expect("expected an archive");
        let mut reader = zip::ZipArchive::new(std::io::Cursor::new(archive)).unwrap();
        let mut names: Vec<_> = (0..reader.len())
            .map(|i| reader.by_index(i).unwrap().name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["out/a.log".to_string(), "out/b.log".to_string()]);
    }

    #[test]
    fn symlink_escape_is_skipped() {
        let tmp = tempdir().unwrap();
        let outside = tempdir().unwrap();
        write_file(&outside.path().join("secret.txt"), b"nope");
        let work_dir = tmp.path().join("work");
        std::fs::create_dir_all(&work_dir).unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(outside.path().join("secret.txt"), work_dir.join("escape.txt"))
            .unwrap();
        let result = build_archive(&test_logger(), &work_dir, &["escape.txt".to_string()]).unwrap();
        assert!(result.is_none(), "symlink escape should not be archived");
    }

    #[test]
    fn exactly_200_mib_is_not_oversize() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("big.bin");
        let f = std::fs::File::create(&path).unwrap();
        f.set_len(MAX_TOTAL_SIZE_BYTES).unwrap();
        let archive = build_archive(&test_logger(), tmp.path(), &["big.bin".to_string()])
            .unwrap()
            .expect("expected an archive");
        let mut reader = zip::ZipArchive::new(std::io::Cursor::new(archive)).unwrap();
        assert_eq!(reader.len(), 1);
        assert_ne!(reader.by_index(0).unwrap().name(), OVERSIZE_SENTINEL_NAME);
    }

    #[test]
    fn oversize_yields_single_sentinel_entry() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("big.bin");
        let f = std::fs::File::create(&path).unwrap();
        f.set_len(MAX_TOTAL_SIZE_BYTES + 1).unwrap();
        let archive = build_archive(&test_logger(), tmp.path(), &["big.bin".to_string()])
            .unwrap()
            .expect("expected an archive");
        let mut reader = zip::ZipArchive::new(std::io::Cursor::new(archive)).unwrap();
        assert_eq!(reader.len(), 1);
        assert_eq!(reader.by_index(0).unwrap().name(), OVERSIZE_SENTINEL_NAME);
    }
}
