//! Work directory layout and key escaping
//!
//! ```text
//! <workdir>/proc/<processTag>                  heartbeat marker, content = timestamp
//! <workdir>/queue/<timestamp>.<seq>-<tag>      queue marker, content = "1"
//! <workdir>/data/<escapedKey>                  JSON cache entry
//! <workdir>/staging/<processTag>/              scratch files renamed into place
//! ```

use crate::error::{CacheError, CacheResult};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;

/// Reserved characters and the tokens that replace them in file names
const ESCAPES: [(char, &str); 5] = [
    ('%', "%25"),
    ('/', "%2F"),
    ('#', "%23"),
    ('&', "%26"),
    (' ', "%20"),
];

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

/// Paths of the shared work directory tree
#[derive(Debug, Clone)]
pub struct WorkLayout {
    pub root: PathBuf,
    pub proc_dir: PathBuf,
    pub queue_dir: PathBuf,
    pub data_dir: PathBuf,
    pub staging_dir: PathBuf,
}

impl WorkLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            proc_dir: root.join("proc"),
            queue_dir: root.join("queue"),
            data_dir: root.join("data"),
            staging_dir: root.join("staging"),
            root,
        }
    }

    /// Create every directory of the tree
    pub async fn ensure(&self) -> CacheResult<()> {
        for dir in [
            &self.root,
            &self.proc_dir,
            &self.queue_dir,
            &self.data_dir,
            &self.staging_dir,
        ] {
            fs::create_dir_all(dir).await.map_err(|e| {
                CacheError::io(format!("creating directory {}", dir.display()), e)
            })?;
        }
        Ok(())
    }

    pub fn heartbeat_path(&self, tag: &str) -> PathBuf {
        self.proc_dir.join(tag)
    }

    pub fn staging_for(&self, tag: &str) -> PathBuf {
        self.staging_dir.join(tag)
    }

    /// Entry file for `key`
    pub fn entry_path(&self, key: &str) -> CacheResult<PathBuf> {
        Ok(self.data_dir.join(escape_key(key)?))
    }
}

/// Map a key to a single safe path segment
pub fn escape_key(key: &str) -> CacheResult<String> {
    if key.is_empty() || key.contains('\0') {
        return Err(CacheError::InvalidKey(key.to_string()));
    }

    let mut escaped = String::with_capacity(key.len());
    for c in key.chars() {
        match ESCAPES.iter().find(|(reserved, _)| *reserved == c) {
            Some((_, token)) => escaped.push_str(token),
            None => escaped.push(c),
        }
    }

    if escaped == "." || escaped == ".." || escaped.contains('\\') {
        return Err(CacheError::InvalidKey(key.to_string()));
    }
    Ok(escaped)
}

/// Reverse `escape_key`
pub fn unescape_key(name: &str) -> String {
    let mut key = String::with_capacity(name.len());
    let mut rest = name;
    'scan: while let Some(c) = rest.chars().next() {
        if c == '%' {
            for (reserved, token) in ESCAPES {
                if let Some(tail) = rest.strip_prefix(token) {
                    key.push(reserved);
                    rest = tail;
                    continue 'scan;
                }
            }
        }
        key.push(c);
        rest = &rest[c.len_utf8()..];
    }
    key
}

/// Write `contents` to `target` through a scratch file in `staging`, so a
/// reader sees either the previous file or the complete new one.
pub async fn write_atomic(staging: &Path, target: &Path, contents: &[u8]) -> CacheResult<()> {
    fs::create_dir_all(staging).await.map_err(|e| {
        CacheError::io(format!("creating staging directory {}", staging.display()), e)
    })?;

    let scratch = staging.join(format!(
        "{}.tmp",
        STAGING_SEQ.fetch_add(1, Ordering::Relaxed)
    ));
    fs::write(&scratch, contents)
        .await
        .map_err(|e| CacheError::io(format!("writing {}", scratch.display()), e))?;

    if let Err(e) = fs::rename(&scratch, target).await {
        let _ = fs::remove_file(&scratch).await;
        return Err(CacheError::io(
            format!("moving {} into place", target.display()),
            e,
        ));
    }
    Ok(())
}

/// Remove a file, treating "already gone" as success.
///
/// Returns whether this call removed it.
pub async fn remove_if_exists(path: &Path) -> CacheResult<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CacheError::io(format!("removing {}", path.display()), e)),
    }
}

/// File names in `dir`, skipping entries that are not valid UTF-8
pub async fn list_names(dir: &Path) -> CacheResult<Vec<String>> {
    let mut names = Vec::new();
    let mut entries = fs::read_dir(dir)
        .await
        .map_err(|e| CacheError::io(format!("reading directory {}", dir.display()), e))?;

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CacheError::io(format!("reading entry of {}", dir.display()), e))?
    {
        if let Ok(name) = entry.file_name().into_string() {
            names.push(name);
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn escape_reserved_characters() {
        assert_eq!(escape_key("key/1").unwrap(), "key%2F1");
        assert_eq!(escape_key("a b#c&d").unwrap(), "a%20b%23c%26d");
        assert_eq!(escape_key("plain").unwrap(), "plain");
        assert_eq!(escape_key("50%").unwrap(), "50%25");
    }

    #[test]
    fn unescape_reverses_escape() {
        for key in ["key/1", "a b#c&d", "a_#", "100%", "%#", "%2F", "/ /", "ünï code"] {
            let escaped = escape_key(key).unwrap();
            assert!(!escaped.contains('/'));
            assert_eq!(unescape_key(&escaped), key, "round trip of {key:?}");
        }
    }

    #[test]
    fn escape_rejects_unsafe_keys() {
        assert!(matches!(escape_key(""), Err(CacheError::InvalidKey(_))));
        assert!(matches!(escape_key("."), Err(CacheError::InvalidKey(_))));
        assert!(matches!(escape_key(".."), Err(CacheError::InvalidKey(_))));
        assert!(matches!(escape_key("a\0b"), Err(CacheError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn ensure_creates_tree() {
        let temp = TempDir::new().unwrap();
        let layout = WorkLayout::new(temp.path().join("work"));
        layout.ensure().await.unwrap();

        assert!(layout.proc_dir.is_dir());
        assert!(layout.queue_dir.is_dir());
        assert!(layout.data_dir.is_dir());
        assert!(layout.staging_dir.is_dir());
    }

    #[tokio::test]
    async fn write_atomic_replaces_target() {
        let temp = TempDir::new().unwrap();
        let staging = temp.path().join("staging");
        let target = temp.path().join("target");

        write_atomic(&staging, &target, b"one").await.unwrap();
        write_atomic(&staging, &target, b"two").await.unwrap();

        assert_eq!(fs::read_to_string(&target).await.unwrap(), "two");
        assert!(list_names(&staging).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn remove_if_exists_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("gone");
        fs::write(&path, "x").await.unwrap();

        assert!(remove_if_exists(&path).await.unwrap());
        assert!(!remove_if_exists(&path).await.unwrap());
    }
}
