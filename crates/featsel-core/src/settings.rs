//! Durable string-to-string settings backed by a tab-separated file.
//!
//! Each record is one line, `key<TAB>value`. The whole file is parsed when a
//! store is opened and rewritten on [`SettingsStore::flush`]; writes in between
//! only touch memory.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::atomic_write_bytes;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings_reserved_char: {field} {text:?} contains a tab or line break")]
    ReservedChar { field: &'static str, text: String },

    #[error("settings_key_exists: {key} = {existing}, cannot set to {requested}")]
    KeyExists {
        key: String,
        existing: String,
        requested: String,
    },

    #[error("settings_already_exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    #[error("settings_missing: {}", .0.display())]
    Missing(PathBuf),

    #[error("settings_malformed: {}:{line}: expected key<TAB>value", path.display())]
    Malformed { path: PathBuf, line: usize },

    #[error("settings_unflushed: {} has writes that were never flushed", .0.display())]
    Unflushed(PathBuf),

    #[error("settings_io: {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    entries: BTreeMap<String, String>,
    dirty: bool,
}

impl SettingsStore {
    /// Creates a new, empty store. The backing file must not exist yet.
    pub fn create(path: &Path) -> Result<Self, SettingsError> {
        if path.exists() {
            return Err(SettingsError::AlreadyExists(path.to_path_buf()));
        }
        fs::write(path, b"").map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            entries: BTreeMap::new(),
            dirty: false,
        })
    }

    /// Opens an existing store and parses it eagerly.
    pub fn open(path: &Path) -> Result<Self, SettingsError> {
        let entries = read_entries(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            entries,
            dirty: false,
        })
    }

    /// Builds an in-memory store from pairs. Nothing touches disk until `flush`.
    pub fn from_entries<I, K, V>(path: &Path, pairs: I) -> Result<Self, SettingsError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut entries = BTreeMap::new();
        for (k, v) in pairs {
            let (k, v) = (k.into(), v.into());
            check_field("key", &k)?;
            check_field("value", &v)?;
            entries.insert(k, v);
        }
        Ok(Self {
            path: path.to_path_buf(),
            entries,
            dirty: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).unwrap_or(default)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set(&mut self, key: &str, value: impl ToString) -> Result<(), SettingsError> {
        let value = value.to_string();
        check_field("key", key)?;
        check_field("value", &value)?;
        self.entries.insert(key.to_string(), value);
        self.dirty = true;
        Ok(())
    }

    /// Like `set`, but refuses to overwrite an existing key.
    pub fn set_new(&mut self, key: &str, value: impl ToString) -> Result<(), SettingsError> {
        let value = value.to_string();
        if let Some(existing) = self.entries.get(key) {
            return Err(SettingsError::KeyExists {
                key: key.to_string(),
                existing: existing.clone(),
                requested: value,
            });
        }
        self.set(key, value)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let removed = self.entries.remove(key);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    /// Drops every record. Like `set`, nothing reaches disk until `flush`.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            self.entries.clear();
            self.dirty = true;
        }
    }

    /// Appends one record to the backing file without rewriting it, so lines
    /// other writers append concurrently are kept. A later record for the
    /// same key wins on the next read.
    pub fn append(&mut self, key: &str, value: impl ToString) -> Result<(), SettingsError> {
        let value = value.to_string();
        check_field("key", key)?;
        check_field("value", &value)?;
        if self.dirty {
            return Err(SettingsError::Unflushed(self.path.clone()));
        }
        let io_err = |source| SettingsError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        file.write_all(format!("{}\t{}\n", key, value).as_bytes())
            .map_err(io_err)?;
        self.entries.insert(key.to_string(), value);
        Ok(())
    }

    pub fn set_flushed(&mut self, key: &str, value: impl ToString) -> Result<(), SettingsError> {
        self.set(key, value)?;
        self.flush()
    }

    pub fn flush(&mut self) -> Result<(), SettingsError> {
        let mut out = String::new();
        for (k, v) in &self.entries {
            out.push_str(k);
            out.push('\t');
            out.push_str(v);
            out.push('\n');
        }
        atomic_write_bytes(&self.path, out.as_bytes()).map_err(|source| SettingsError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.dirty = false;
        Ok(())
    }

    /// Re-reads the backing file, picking up records appended by other writers.
    pub fn reload(&mut self) -> Result<(), SettingsError> {
        if self.dirty {
            return Err(SettingsError::Unflushed(self.path.clone()));
        }
        self.entries = read_entries(&self.path)?;
        Ok(())
    }
}

fn check_field(field: &'static str, text: &str) -> Result<(), SettingsError> {
    if text.contains(['\t', '\n', '\r']) {
        return Err(SettingsError::ReservedChar {
            field,
            text: text.to_string(),
        });
    }
    Ok(())
}

fn read_entries(path: &Path) -> Result<BTreeMap<String, String>, SettingsError> {
    if !path.is_file() {
        return Err(SettingsError::Missing(path.to_path_buf()));
    }
    let data = fs::read_to_string(path).map_err(|source| SettingsError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut entries = BTreeMap::new();
    for (idx, line) in data.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            continue;
        }
        let mut parts = line.split('\t');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(k), Some(v), None) => {
                entries.insert(k.to_string(), v.to_string());
            }
            _ => {
                return Err(SettingsError::Malformed {
                    path: path.to_path_buf(),
                    line: idx + 1,
                })
            }
        }
    }
    Ok(entries)
}
