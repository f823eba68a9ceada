//! Atomic file writes: temp file + fsync + rename.
//!
//! Every durable artifact the system produces (run state, events, receipts,
//! manifests, price table cache, capability cache) goes through this path so
//! a concurrent reader never observes a torn write.

use anyhow::{Context, Result};
use camino::Utf8Path;
use std::fs;
use std::io::Write;

use tempfile::NamedTempFile;

/// Result of an atomic write operation.
#[derive(Debug, Clone, Default)]
pub struct AtomicWriteResult {
    /// Number of rename retries that occurred.
    pub rename_retry_count: u32,
    /// Whether a cross-filesystem copy fallback was used.
    pub used_cross_filesystem_fallback: bool,
    pub warnings: Vec<String>,
}

/// Atomically write `content` to `path` using temp file + fsync + rename.
///
/// Normalizes line endings to LF and creates parent directories as needed.
pub fn write_file_atomic(path: &Utf8Path, content: &str) -> Result<AtomicWriteResult> {
    let mut result = AtomicWriteResult::default();
    let normalized = normalize_line_endings(content);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create parent directory: {parent}"))?;
    }

    let temp_dir = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let mut temp_file = NamedTempFile::new_in(temp_dir)
        .with_context(|| format!("Failed to create temporary file in: {temp_dir}"))?;

    temp_file
        .write_all(normalized.as_bytes())
        .context("Failed to write content to temporary file")?;
    temp_file
        .as_file()
        .sync_all()
        .context("Failed to fsync temporary file")?;

    let temp_path = temp_file.path().to_path_buf();

    match temp_file.persist(path.as_std_path()) {
        Ok(_) => {}
        Err(e) if is_cross_filesystem_error(&e.error) => {
            result.used_cross_filesystem_fallback = true;
            result
                .warnings
                .push("Used cross-filesystem fallback (copy→fsync→replace)".to_string());
            cross_filesystem_copy_from_path(&temp_path, path)?;
        }
        Err(e) => {
            return Err(anyhow::anyhow!(e.error))
                .with_context(|| format!("Failed to atomically write file: {path}"));
        }
    }

    Ok(result)
}

fn normalize_line_endings(content: &str) -> String {
    content.replace("\r\n", "\n").replace('\r', "\n")
}

#[cfg(unix)]
fn is_cross_filesystem_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    if err.kind() != ErrorKind::Other {
        return false;
    }
    matches!(err.raw_os_error(), Some(18)) // EXDEV
}

#[cfg(not(unix))]
fn is_cross_filesystem_error(_err: &std::io::Error) -> bool {
    false
}

fn cross_filesystem_copy_from_path(
    temp_path: &std::path::Path,
    target: &Utf8Path,
) -> Result<()> {
    let content = fs::read(temp_path).context("Failed to read temp file for cross-fs copy")?;
    let target_dir = target.parent().unwrap_or_else(|| Utf8Path::new("."));
    let mut target_temp = NamedTempFile::new_in(target_dir)
        .with_context(|| format!("Failed to create temp file in target directory: {target_dir}"))?;
    target_temp
        .write_all(&content)
        .context("Failed to write content during cross-fs copy")?;
    target_temp
        .as_file()
        .sync_all()
        .context("Failed to fsync during cross-fs copy")?;
    target_temp
        .persist(target.as_std_path())
        .map_err(|e| anyhow::anyhow!(e.error))
        .context("Failed to persist during cross-fs copy")?;
    let _ = fs::remove_file(temp_path);
    Ok(())
}

/// Read a file tolerating CRLF line endings, normalizing to LF.
pub fn read_file_with_crlf_tolerance(path: &Utf8Path) -> Result<String> {
    let content = fs::read_to_string(path.as_std_path())
        .with_context(|| format!("Failed to read file: {path}"))?;
    Ok(normalize_line_endings(&content))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tmp() -> TempDir {
        TempDir::new().unwrap()
    }

    #[test]
    fn normalizes_crlf() {
        assert_eq!(normalize_line_endings("a\r\nb\rc"), "a\nb\nc");
    }

    #[test]
    fn writes_and_reads_back() {
        let dir = tmp();
        let path_buf = dir.path().join("f.txt");
        let path = Utf8Path::from_path(&path_buf).unwrap();
        write_file_atomic(path, "hello\r\nworld").unwrap();
        let content = fs::read_to_string(&path_buf).unwrap();
        assert_eq!(content, "hello\nworld");
    }

    #[test]
    fn creates_parent_dirs() {
        let dir = tmp();
        let path_buf = dir.path().join("a").join("b").join("f.txt");
        let path = Utf8Path::from_path(&path_buf).unwrap();
        write_file_atomic(path, "x").unwrap();
        assert!(path_buf.exists());
    }

    #[test]
    fn overwrites_existing() {
        let dir = tmp();
        let path_buf = dir.path().join("f.txt");
        let path = Utf8Path::from_path(&path_buf).unwrap();
        write_file_atomic(path, "first").unwrap();
        write_file_atomic(path, "second").unwrap();
        assert_eq!(fs::read_to_string(&path_buf).unwrap(), "second");
    }
}
