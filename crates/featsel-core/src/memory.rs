use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Largest request accepted by [`parse_memory`]: 80 GiB.
pub const DEFAULT_MAX_MB: u64 = 80 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("memory_unknown_format: {0:?}")]
    UnknownFormat(String),

    #[error("memory_too_large: requested {requested}MB, limit is {limit}MB")]
    TooLarge { requested: u64, limit: u64 },
}

/// A memory request normalised to whole megabytes. Displays as `<n>M`, the
/// form both the JVM (`-Xmx`) and the scheduler (`mem_free`) accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Megabytes(pub u64);

impl fmt::Display for Megabytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}M", self.0)
    }
}

impl FromStr for Megabytes {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_memory(s)
    }
}

pub fn parse_memory(text: &str) -> Result<Megabytes, MemoryError> {
    parse_memory_capped(text, DEFAULT_MAX_MB)
}

/// Accepts `<int>K|M|G` (any case), a bare integer in gigabytes, or a bare
/// decimal in gigabytes. Everything rounds up to whole megabytes.
pub fn parse_memory_capped(text: &str, max_mb: u64) -> Result<Megabytes, MemoryError> {
    let trimmed = text.trim();
    let unknown = || MemoryError::UnknownFormat(text.to_string());
    if trimmed.is_empty() {
        return Err(unknown());
    }

    let last = trimmed.chars().last().ok_or_else(unknown)?;
    let mb = if last.is_ascii_alphabetic() {
        let digits = &trimmed[..trimmed.len() - 1];
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(unknown());
        }
        let n: u64 = digits.parse().map_err(|_| unknown())?;
        match last.to_ascii_uppercase() {
            'K' => n.div_ceil(1024).max(1),
            'M' => n,
            'G' => n.checked_mul(1024).ok_or_else(unknown)?,
            _ => return Err(unknown()),
        }
    } else if trimmed.chars().all(|c| c.is_ascii_digit()) {
        let n: u64 = trimmed.parse().map_err(|_| unknown())?;
        n.checked_mul(1024).ok_or_else(unknown)?
    } else {
        let gb: f64 = trimmed.parse().map_err(|_| unknown())?;
        if !gb.is_finite() || gb < 0.0 {
            return Err(unknown());
        }
        let mb = (gb * 1024.0).ceil();
        if mb > u64::MAX as f64 {
            return Err(unknown());
        }
        mb as u64
    };

    if mb > max_mb {
        return Err(MemoryError::TooLarge {
            requested: mb,
            limit: max_mb,
        });
    }
    Ok(Megabytes(mb))
}
