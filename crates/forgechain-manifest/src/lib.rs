//! Recursive tree walk, uploadability filtering, and manifest generation for
//! an IN directory (§4.4). Ports `filescan.py`'s `scan_tree` / `build_manifest`.

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use globset::{Glob, GlobSetBuilder};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;

const DEFAULT_MAX_SIZE_BYTES: u64 = 10 * 1024 * 1024;
const HASH_MAX_BYTES: u64 = 5 * 1024 * 1024;
const SECRET_SCAN_MAX_BYTES: usize = 20_000;

/// One scanned file, with its uploadability verdict and reason.
#[derive(Debug, Clone, Serialize)]
pub struct ScanItem {
    pub rel_path: String,
    #[serde(skip)]
    pub abs_path: Utf8PathBuf,
    pub size: u64,
    pub sha256: Option<String>,
    pub uploadable: bool,
    pub reason: String,
    pub sensitive: bool,
}

/// Filters applied while walking the tree. Mirrors
/// `security.{deny,allow}_extensions_in` / `{deny,allow}_globs_in` (§3).
#[derive(Debug, Clone, Default)]
pub struct ScanFilters {
    pub deny_dirs: Vec<String>,
    pub deny_extensions: Vec<String>,
    pub allow_extensions: Vec<String>,
    pub deny_globs: Vec<String>,
    pub allow_globs: Vec<String>,
    pub max_size_bytes: Option<u64>,
}

fn build_globset(patterns: &[String]) -> anyhow::Result<Option<globset::GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(Some(builder.build()?))
}

fn ext_of(rel_path: &str) -> String {
    Utf8Path::new(rel_path).extension().map(|e| format!(".{}", e.to_lowercase())).unwrap_or_default()
}

/// True if `data`'s first 4KiB look like binary content (§6 heuristic: more
/// than one NUL byte, or fewer than 75% printable bytes).
#[must_use]
pub fn is_probably_binary(data: &[u8]) -> bool {
    forgechain_redaction::looks_binary(data)
}

/// True if `dir_name` is a timestamp-suffixed snapshot directory of
/// `root_name` (`<root_name><12 digits>`), the pattern used by this tool's
/// own versioning snapshots and therefore always skipped during a rescan.
#[must_use]
pub fn is_versioning_snapshot_dir(dir_name: &str, root_name: &str) -> bool {
    match dir_name.strip_prefix(root_name) {
        Some(tail) if tail.len() == 12 => tail.chars().all(|c| c.is_ascii_digit()),
        _ => false,
    }
}

fn read_head(path: &Utf8Path, max_bytes: usize) -> std::io::Result<Vec<u8>> {
    let mut file = fs::File::open(path)?;
    let mut buf = vec![0u8; max_bytes];
    let n = file.read(&mut buf)?;
    buf.truncate(n);
    Ok(buf)
}

fn sha256_file(path: &Utf8Path, max_bytes: u64) -> std::io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut remaining = max_bytes;
    let mut buf = [0u8; 1024 * 1024];
    while remaining > 0 {
        let want = buf.len().min(remaining as usize);
        let n = file.read(&mut buf[..want])?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }
    Ok(hex::encode(hasher.finalize()))
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        bytes.as_ref().iter().map(|b| format!("{b:02x}")).collect()
    }
}

/// Recursively walk `root_dir`, classifying every file as uploadable or not.
/// Directories named in `deny_dirs`, and versioning snapshot directories of
/// `root_name`, are skipped entirely. Results are sorted by `rel_path`.
pub fn scan_tree(
    root_dir: &Utf8Path,
    root_name: &str,
    filters: &ScanFilters,
) -> anyhow::Result<Vec<ScanItem>> {
    let deny_globs = build_globset(&filters.deny_globs)?;
    let allow_globs = build_globset(&filters.allow_globs)?;
    let max_size = filters.max_size_bytes.unwrap_or(DEFAULT_MAX_SIZE_BYTES);

    let mut items = Vec::new();
    walk(root_dir, root_dir, root_name, filters, deny_globs.as_ref(), allow_globs.as_ref(), max_size, &mut items)?;
    items.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(items)
}

#[allow(clippy::too_many_arguments)]
fn walk(
    root_dir: &Utf8Path,
    cur: &Utf8Path,
    root_name: &str,
    filters: &ScanFilters,
    deny_globs: Option<&globset::GlobSet>,
    allow_globs: Option<&globset::GlobSet>,
    max_size: u64,
    items: &mut Vec<ScanItem>,
) -> anyhow::Result<()> {
    let entries = match fs::read_dir(cur) {
        Ok(e) => e,
        Err(_) => return Ok(()),
    };

    for entry in entries {
        let entry = entry?;
        let path = Utf8PathBuf::from_path_buf(entry.path())
            .map_err(|p| anyhow::anyhow!("non-UTF-8 path: {}", p.display()))?;
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            let name = path.file_name().unwrap_or_default();
            if filters.deny_dirs.iter().any(|d| d == name) {
                continue;
            }
            if is_versioning_snapshot_dir(name, root_name) {
                continue;
            }
            walk(root_dir, &path, root_name, filters, deny_globs, allow_globs, max_size, items)?;
            continue;
        }

        if !file_type.is_file() {
            continue;
        }

        let rel_path = path.strip_prefix(root_dir).unwrap_or(&path).as_str().replace('\\', "/");

        let size = match fs::metadata(&path) {
            Ok(m) => m.len(),
            Err(_) => {
                items.push(reject(rel_path, path, 0, "stat_failed", true));
                continue;
            }
        };

        if let Some(allow) = allow_globs {
            if !allow.is_match(&rel_path) {
                items.push(reject(rel_path, path, size, "not_in_allow_globs", false));
                continue;
            }
        }
        if let Some(deny) = deny_globs {
            if deny.is_match(&rel_path) {
                items.push(reject(rel_path, path, size, "deny_glob", false));
                continue;
            }
        }

        let ext = ext_of(&rel_path);
        if !filters.allow_extensions.is_empty()
            && !filters.allow_extensions.iter().any(|e| e.to_lowercase() == ext)
        {
            items.push(reject(rel_path, path, size, "ext_not_allowed", false));
            continue;
        }
        if filters.deny_extensions.iter().any(|e| e.to_lowercase() == ext) {
            items.push(reject(rel_path, path, size, "denied_extension", false));
            continue;
        }

        if size == 0 {
            items.push(reject(rel_path, path, size, "empty_file", false));
            continue;
        }

        let file_name = path.file_name().unwrap_or_default().to_lowercase();
        let sensitive =
            forgechain_redaction::is_sensitive_filename(&file_name) || rel_path.to_lowercase().ends_with(".env");

        if size > max_size {
            items.push(reject(rel_path, path, size, "too_large", sensitive));
            continue;
        }

        let head = read_head(&path, 4096).unwrap_or_default();
        if is_probably_binary(&head) {
            items.push(reject(rel_path, path, size, "binary", sensitive));
            continue;
        }

        let secret_hit = match read_head(&path, SECRET_SCAN_MAX_BYTES) {
            Ok(head) => {
                let text = String::from_utf8_lossy(&head);
                forgechain_redaction::default_redactor().has_secrets(&text)
            }
            Err(_) => true,
        };

        if sensitive || secret_hit {
            items.push(reject(rel_path, path, size, "sensitive_or_secret_detected", true));
            continue;
        }

        let sha256 = sha256_file(&path, HASH_MAX_BYTES).ok();
        items.push(ScanItem {
            rel_path,
            abs_path: path,
            size,
            sha256,
            uploadable: true,
            reason: "ok".to_string(),
            sensitive: false,
        });
    }

    Ok(())
}

fn reject(rel_path: String, abs_path: Utf8PathBuf, size: u64, reason: &str, sensitive: bool) -> ScanItem {
    ScanItem { rel_path, abs_path, size, sha256: None, uploadable: false, reason: reason.to_string(), sensitive }
}

/// Manifest entry as written to disk: everything in [`ScanItem`] except the
/// absolute path, which never leaves the local filesystem.
#[derive(Debug, Clone, Serialize)]
pub struct ManifestFileEntry {
    pub path: String,
    pub size: u64,
    pub sha256: Option<String>,
    pub uploadable: bool,
    pub reason: String,
    pub sensitive: bool,
}

/// The manifest document for one IN directory (§3).
#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub root: String,
    pub generated_at: f64,
    pub files: Vec<ManifestFileEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// Build a manifest document from previously scanned items.
#[must_use]
pub fn build_manifest(root_dir: &Utf8Path, items: &[ScanItem], extra: Option<serde_json::Value>) -> Manifest {
    Manifest {
        root: root_dir.to_string(),
        generated_at: Utc::now().timestamp() as f64,
        files: items
            .iter()
            .map(|it| ManifestFileEntry {
                path: it.rel_path.clone(),
                size: it.size,
                sha256: it.sha256.clone(),
                uploadable: it.uploadable,
                reason: it.reason.clone(),
                sensitive: it.sensitive,
            })
            .collect(),
        extra,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn scans_plain_text_file_as_uploadable() {
        let dir = tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        fs::write(root.join("main.rs"), "fn main() {}\n").unwrap();

        let items = scan_tree(root, "project", &ScanFilters::default()).unwrap();
        assert_eq!(items.len(), 1);
        assert!(items[0].uploadable);
        assert!(items[0].sha256.is_some());
    }

    #[test]
    fn rejects_sensitive_filename() {
        let dir = tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        fs::write(root.join(".env"), "SECRET=1\n").unwrap();

        let items = scan_tree(root, "project", &ScanFilters::default()).unwrap();
        assert_eq!(items.len(), 1);
        assert!(!items[0].uploadable);
        assert!(items[0].sensitive);
    }

    #[test]
    fn rejects_file_containing_api_key() {
        let dir = tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        fs::write(root.join("config.rs"), "let api_key = \"abcdefghijklmnop1234\";\n").unwrap();

        let items = scan_tree(root, "project", &ScanFilters::default()).unwrap();
        assert_eq!(items[0].reason, "sensitive_or_secret_detected");
    }

    #[test]
    fn skips_denied_directory() {
        let dir = tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        fs::create_dir(root.join("node_modules")).unwrap();
        fs::write(root.join("node_modules/pkg.js"), "module.exports = {}").unwrap();
        fs::write(root.join("main.rs"), "fn main() {}").unwrap();

        let filters = ScanFilters { deny_dirs: vec!["node_modules".into()], ..Default::default() };
        let items = scan_tree(root, "project", &filters).unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].rel_path, "main.rs");
    }

    #[test]
    fn skips_versioning_snapshot_dir() {
        assert!(is_versioning_snapshot_dir("myproject202507271030", "myproject"));
        assert!(!is_versioning_snapshot_dir("myproject_backup", "myproject"));
    }

    #[test]
    fn build_manifest_round_trips_through_json() {
        let dir = tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();
        fs::write(root.join("a.rs"), "fn a() {}").unwrap();
        let items = scan_tree(root, "project", &ScanFilters::default()).unwrap();
        let manifest = build_manifest(root, &items, None);
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"path\":\"a.rs\""));
    }
}
