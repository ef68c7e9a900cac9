//! Blocklist of forbidden hosts.
//!
//! Loaded once from an operator-curated text file and never reloaded.
//! A host is blocked when it appears as a substring of any entry, so a
//! generic host such as `ads` matches an entry like `ads.example.net`.

use std::io;
use std::path::Path;

/// Ordered list of blocklist entries.
pub struct Blocklist {
    entries: Vec<String>,
}

impl Blocklist {
    /// Create an empty blocklist.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Build a blocklist from line-oriented text.
    ///
    /// Blank lines and `#` comments are skipped; entries are lowercased.
    pub fn from_lines(text: &str) -> Self {
        let entries = text
            .lines()
            .filter_map(|line| {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    return None;
                }
                Some(line.to_lowercase())
            })
            .collect();

        Self { entries }
    }

    /// Load a blocklist file. A missing file yields an empty blocklist.
    pub fn load(path: &Path) -> io::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(Self::from_lines(&text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e),
        }
    }

    /// Check if a host should be blocked.
    pub fn is_blocked(&self, host: &str) -> bool {
        if host.is_empty() {
            return false;
        }
        let host = host.to_lowercase();
        self.entries.iter().any(|entry| entry.contains(host.as_str()))
    }

    /// Returns the number of entries in the blocklist.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Blocklist {
    fn default() -> Self {
        Self::new()
    }
}
