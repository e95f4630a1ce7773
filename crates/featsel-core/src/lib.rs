use chrono::Utc;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

pub mod memory;
pub mod settings;

pub use memory::{parse_memory, parse_memory_capped, MemoryError, Megabytes, DEFAULT_MAX_MB};
pub use settings::{SettingsError, SettingsStore};

pub fn ensure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Writes through a temp file in the same directory and renames it into place.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub fn timestamp() -> String {
    Utc::now().to_rfc3339()
}

pub fn bool_flag(value: bool) -> &'static str {
    if value {
        "y"
    } else {
        "n"
    }
}

pub fn parse_bool_flag(value: &str) -> Option<bool> {
    match value {
        "y" => Some(true),
        "n" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_file_matches_bytes_digest() {
        let dir = std::env::temp_dir().join(format!(
            "featsel_digest_test_{}_{}",
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        ensure_dir(&dir).expect("temp dir");
        let path = dir.join("blob.bin");
        atomic_write_bytes(&path, b"classpath payload").expect("write");
        assert_eq!(
            sha256_file(&path).expect("digest"),
            sha256_bytes(b"classpath payload")
        );
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn bool_flags_use_single_letters() {
        assert_eq!(bool_flag(true), "y");
        assert_eq!(parse_bool_flag(bool_flag(false)), Some(false));
        assert_eq!(parse_bool_flag("yes"), None);
    }
}
