use anyhow::{anyhow, Context, Result};
use serde::de::DeserializeOwned;
use std::{fs, path::Path};

/// Reads a file after refusing symlinks and anything larger than `max_bytes`.
///
/// Used for every file witgen reads back from disk: configuration, attestation
/// artifacts written by external tools, and datasets.
pub fn read_bounded(path: &Path, max_bytes: u64) -> Result<Vec<u8>> {
    let meta = fs::symlink_metadata(path).with_context(|| format!("stat {}", path.display()))?;
    if meta.file_type().is_symlink() {
        return Err(anyhow!("Refusing to read symlink: {}", path.display()));
    }
    if !meta.is_file() {
        return Err(anyhow!("Not a regular file: {}", path.display()));
    }
    if meta.len() > max_bytes {
        return Err(anyhow!(
            "File too large: {} ({} bytes, max {max_bytes} bytes)",
            path.display(),
            meta.len(),
        ));
    }
    fs::read(path).with_context(|| format!("read {}", path.display()))
}

/// Bounded read followed by JSON deserialization into `T`.
pub fn read_json<T: DeserializeOwned>(path: &Path, max_bytes: u64) -> Result<T> {
    let bytes = read_bounded(path, max_bytes)?;
    serde_json::from_slice(&bytes).with_context(|| format!("parse JSON {}", path.display()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_read_bounded_returns_contents() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("a.txt");
        fs::write(&p, b"hello").unwrap();
        assert_eq!(read_bounded(&p, 16).unwrap(), b"hello");
    }

    #[test]
    fn test_read_bounded_rejects_oversized() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("big.txt");
        fs::write(&p, vec![b'x'; 32]).unwrap();
        let err = read_bounded(&p, 8).unwrap_err().to_string();
        assert!(err.contains("too large"), "{err}");
    }

    #[test]
    fn test_read_bounded_rejects_directory() {
        let dir = TempDir::new().unwrap();
        assert!(read_bounded(dir.path(), 1024).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_read_bounded_rejects_symlink() {
        let dir = TempDir::new().unwrap();
        let real = dir.path().join("real.json");
        fs::write(&real, b"{}").unwrap();
        let link = dir.path().join("link.json");
        std::os::unix::fs::symlink(&real, &link).unwrap();
        let err = read_bounded(&link, 1024).unwrap_err().to_string();
        assert!(err.contains("symlink"), "{err}");
    }

    #[test]
    fn test_read_json_reports_parse_errors() {
        let dir = TempDir::new().unwrap();
        let p = dir.path().join("bad.json");
        fs::write(&p, b"not json").unwrap();
        let result: Result<serde_json::Value> = read_json(&p, 1024);
        assert!(result.is_err());
    }
}
