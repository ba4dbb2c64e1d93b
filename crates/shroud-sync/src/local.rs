//! Local tree walk and the per-file record it produces

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::UNIX_EPOCH;

use shroud_core::config::SyncConfig;
use shroud_core::{ShroudError, ShroudResult};
use shroud_crypto::{digest_file, Digest};
use tracing::{debug, warn};

/// Which files the walk includes.
#[derive(Debug, Clone)]
pub struct WalkConfig {
    /// Glob patterns to exclude, matched against the file name and the
    /// root-relative name
    pub exclude_patterns: Vec<String>,
    /// Whether to include dotfiles and descend into dot-directories
    pub include_hidden: bool,
}

impl Default for WalkConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: Vec::new(),
            include_hidden: true,
        }
    }
}

impl From<&SyncConfig> for WalkConfig {
    fn from(cfg: &SyncConfig) -> Self {
        Self {
            exclude_patterns: cfg.exclude_patterns.clone(),
            include_hidden: cfg.include_hidden,
        }
    }
}

/// One scanned local file.
///
/// The content digest is computed on first request and cached.
#[derive(Debug)]
pub struct LocalRecord {
    pub path: PathBuf,
    /// Path relative to the sync root, `/`-separated
    pub local_name: String,
    pub size: u64,
    /// Modification time, milliseconds since the epoch
    pub timestamp_ms: i64,
    digest: OnceLock<Digest>,
}

impl LocalRecord {
    pub fn new(path: PathBuf, local_name: String, size: u64, timestamp_ms: i64) -> Self {
        Self {
            path,
            local_name,
            size,
            timestamp_ms,
            digest: OnceLock::new(),
        }
    }

    /// Stat `path` and build its record relative to `root`.
    pub fn from_path(root: &Path, path: &Path) -> ShroudResult<Self> {
        let meta = std::fs::metadata(path).map_err(|e| ShroudError::local_io(path, e))?;
        let local_name = local_name(root, path)?;
        let modified = meta.modified().map_err(|e| ShroudError::local_io(path, e))?;
        Ok(Self::new(
            path.to_path_buf(),
            local_name,
            meta.len(),
            millis_since_epoch(modified),
        ))
    }

    /// Salted content digest, read from disk at most once.
    pub fn digest(&self) -> ShroudResult<Digest> {
        if let Some(d) = self.digest.get() {
            return Ok(*d);
        }
        let computed = digest_file(&self.path)?;
        Ok(*self.digest.get_or_init(|| computed))
    }

    pub fn digest_computed(&self) -> bool {
        self.digest.get().is_some()
    }
}

fn millis_since_epoch(t: std::time::SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

fn local_name(root: &Path, path: &Path) -> ShroudResult<String> {
    let rel = path.strip_prefix(root).map_err(|_| {
        ShroudError::Config(format!(
            "{} is not under sync root {}",
            path.display(),
            root.display()
        ))
    })?;

    let mut parts = Vec::new();
    for component in rel.components() {
        let part = component.as_os_str().to_str().ok_or_else(|| {
            ShroudError::local_io(
                path,
                std::io::Error::new(std::io::ErrorKind::InvalidData, "file name is not UTF-8"),
            )
        })?;
        parts.push(part);
    }
    Ok(parts.join("/"))
}

/// Walk `root` and return every regular file, sorted by local name.
///
/// An unreadable root is an error. Anything below it that cannot be read
/// is logged and skipped.
pub fn walk_local(root: &Path, config: &WalkConfig) -> ShroudResult<Vec<LocalRecord>> {
    let meta = std::fs::metadata(root).map_err(|e| ShroudError::local_io(root, e))?;
    if !meta.is_dir() {
        return Err(ShroudError::Config(format!(
            "sync root {} is not a directory",
            root.display()
        )));
    }

    let excludes: Vec<glob::Pattern> = config
        .exclude_patterns
        .iter()
        .filter_map(|p| match glob::Pattern::new(p) {
            Ok(pat) => Some(pat),
            Err(e) => {
                warn!(pattern = %p, "ignoring invalid exclude pattern: {e}");
                None
            }
        })
        .collect();

    let mut out = Vec::new();
    walk_dir(root, root, config, &excludes, &mut out)?;
    out.sort_by(|a, b| a.local_name.cmp(&b.local_name));
    debug!(root = %root.display(), files = out.len(), "local walk complete");
    Ok(out)
}

fn walk_dir(
    root: &Path,
    dir: &Path,
    config: &WalkConfig,
    excludes: &[glob::Pattern],
    out: &mut Vec<LocalRecord>,
) -> ShroudResult<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if dir == root => return Err(ShroudError::local_io(dir, e)),
        Err(e) => {
            warn!(path = %dir.display(), "skipping unreadable directory: {e}");
            return Ok(());
        }
    };

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %dir.display(), "skipping unreadable entry: {e}");
                continue;
            }
        };
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            warn!(path = %path.display(), "skipping non-UTF-8 file name");
            continue;
        };

        if !config.include_hidden && name.starts_with('.') {
            continue;
        }
        if excludes.iter().any(|p| p.matches(name)) {
            continue;
        }
        if let Ok(rel) = path.strip_prefix(root) {
            let rel = rel.to_string_lossy().replace('\\', "/");
            if excludes.iter().any(|p| p.matches(&rel)) {
                continue;
            }
        }

        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(e) => {
                warn!(path = %path.display(), "skipping entry: {e}");
                continue;
            }
        };

        if file_type.is_dir() {
            walk_dir(root, &path, config, excludes, out)?;
        } else if file_type.is_file() {
            match LocalRecord::from_path(root, &path) {
                Ok(record) => out.push(record),
                Err(e) => warn!(path = %path.display(), "skipping file: {e}"),
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("docs/old")).unwrap();
        fs::create_dir_all(root.join(".cache")).unwrap();
        fs::write(root.join("a.txt"), b"alpha").unwrap();
        fs::write(root.join("docs/b.md"), b"bravo!").unwrap();
        fs::write(root.join("docs/old/c.tmp"), b"c").unwrap();
        fs::write(root.join(".hidden"), b"h").unwrap();
        fs::write(root.join(".cache/blob"), b"x").unwrap();
        dir
    }

    fn names(records: &[LocalRecord]) -> Vec<&str> {
        records.iter().map(|r| r.local_name.as_str()).collect()
    }

    #[test]
    fn walks_everything_sorted() {
        let dir = tree();
        let records = walk_local(dir.path(), &WalkConfig::default()).unwrap();
        assert_eq!(
            names(&records),
            vec![".cache/blob", ".hidden", "a.txt", "docs/b.md", "docs/old/c.tmp"]
        );
        let b = records.iter().find(|r| r.local_name == "docs/b.md").unwrap();
        assert_eq!(b.size, 6);
        assert!(b.timestamp_ms > 0);
    }

    #[test]
    fn hidden_and_excluded_skipped() {
        let dir = tree();
        let cfg = WalkConfig {
            exclude_patterns: vec!["*.tmp".into(), "docs/b.*".into()],
            include_hidden: false,
        };
        let records = walk_local(dir.path(), &cfg).unwrap();
        assert_eq!(names(&records), vec!["a.txt"]);
    }

    #[test]
    fn digest_is_memoized() {
        let dir = tree();
        let path = dir.path().join("a.txt");
        let record = LocalRecord::from_path(dir.path(), &path).unwrap();
        assert!(!record.digest_computed());

        let first = record.digest().unwrap();
        assert!(record.digest_computed());

        // Changing the file afterwards must not change the cached digest.
        fs::write(&path, b"changed").unwrap();
        assert_eq!(record.digest().unwrap(), first);
    }

    #[test]
    fn missing_root_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = walk_local(&dir.path().join("gone"), &WalkConfig::default()).unwrap_err();
        assert!(matches!(err, ShroudError::LocalIo { .. }), "got: {err:?}");
    }

    #[test]
    fn file_root_is_error() {
        let dir = tree();
        let err = walk_local(&dir.path().join("a.txt"), &WalkConfig::default()).unwrap_err();
        assert!(matches!(err, ShroudError::Config(_)));
    }

    #[test]
    fn local_name_uses_forward_slashes() {
        let root = Path::new("/data");
        let name = local_name(root, Path::new("/data/x/y/z.bin")).unwrap();
        assert_eq!(name, "x/y/z.bin");
    }
}
