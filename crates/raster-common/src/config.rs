//! Environment-driven configuration for the operation cache's bounds.
//!
//! Recognises the same environment variable names the source runtime
//! used, string form preserved verbatim for compatibility: `VIPS_TRACE`,
//! `VIPS_CACHE_MAX`, `VIPS_CACHE_MAX_MEM`, `VIPS_CACHE_MAX_FILES`.

/// The three size bounds the operation cache trims against, plus the
/// trace toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheBounds {
    pub max_entries: usize,
    pub max_mem_bytes: u64,
    pub max_files: usize,
    pub trace: bool,
}

const DEFAULT_MAX_ENTRIES: usize = 100;
const DEFAULT_MAX_MEM_BYTES: u64 = 100 * 1024 * 1024;
const DEFAULT_MAX_FILES: usize = 100;

impl Default for CacheBounds {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            max_mem_bytes: DEFAULT_MAX_MEM_BYTES,
            max_files: DEFAULT_MAX_FILES,
            trace: false,
        }
    }
}

impl CacheBounds {
    /// Load from `VIPS_CACHE_MAX`, `VIPS_CACHE_MAX_MEM`,
    /// `VIPS_CACHE_MAX_FILES`, `VIPS_TRACE`. Unset or unparseable values
    /// fall back to the default and log a warning.
    pub fn from_env() -> Self {
        let mut bounds = Self::default();

        if let Ok(val) = std::env::var("VIPS_CACHE_MAX") {
            match val.parse() {
                Ok(n) => bounds.max_entries = n,
                Err(_) => tracing::warn!(value = %val, "VIPS_CACHE_MAX is not a valid integer, using default"),
            }
        }

        if let Ok(val) = std::env::var("VIPS_CACHE_MAX_MEM") {
            match parse_byte_size(&val) {
                Some(n) => bounds.max_mem_bytes = n,
                None => tracing::warn!(value = %val, "VIPS_CACHE_MAX_MEM is not a valid size, using default"),
            }
        }

        if let Ok(val) = std::env::var("VIPS_CACHE_MAX_FILES") {
            match val.parse() {
                Ok(n) => bounds.max_files = n,
                Err(_) => tracing::warn!(value = %val, "VIPS_CACHE_MAX_FILES is not a valid integer, using default"),
            }
        }

        if std::env::var("VIPS_TRACE").is_ok() {
            bounds.trace = true;
        }

        bounds
    }
}

/// Parses a plain byte count or a `<n>m` / `<n>g` suffixed size (case
/// insensitive, binary multiples).
fn parse_byte_size(s: &str) -> Option<u64> {
    let s = s.trim();
    if let Ok(n) = s.parse::<u64>() {
        return Some(n);
    }
    let (digits, multiplier) = match s.chars().last()?.to_ascii_lowercase() {
        'k' => (&s[..s.len() - 1], 1024),
        'm' => (&s[..s.len() - 1], 1024 * 1024),
        'g' => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => return None,
    };
    digits.trim().parse::<u64>().ok().map(|n| n * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_defaults() {
        let bounds = CacheBounds::default();
        assert_eq!(bounds.max_entries, 100);
        assert_eq!(bounds.max_mem_bytes, 100 * 1024 * 1024);
        assert_eq!(bounds.max_files, 100);
        assert!(!bounds.trace);
    }

    #[test]
    fn parses_plain_and_suffixed_sizes() {
        assert_eq!(parse_byte_size("12345"), Some(12345));
        assert_eq!(parse_byte_size("4m"), Some(4 * 1024 * 1024));
        assert_eq!(parse_byte_size("2G"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_byte_size("1k"), Some(1024));
        assert_eq!(parse_byte_size("not-a-size"), None);
    }
}
