//! Path-based sync filter.
//!
//! Restricts a sync to a set of subtrees, optionally excluding paths that
//! match regular expressions. Ancestors of an included subtree are kept so
//! the sync can reach it.

use regex::Regex;

use super::directory::SyncItem;
use super::engine::SyncFilterFn;
use super::index::EntryType;

/// Include-prefix / exclude-pattern filter over repository-relative paths.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    includes: Vec<String>,
    excludes: Vec<Regex>,
}

impl PathFilter {
    /// A filter accepting everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Limit the sync to the subtree at `prefix` (may be called repeatedly).
    pub fn include(mut self, prefix: &str) -> Self {
        let prefix = prefix.trim_matches('/');
        if !prefix.is_empty() {
            self.includes.push(prefix.to_string());
        }
        self
    }

    /// Skip every path matching `pattern`.
    ///
    /// # Errors
    ///
    /// Returns an error if `pattern` is not a valid regular expression.
    pub fn exclude(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.excludes.push(Regex::new(pattern)?);
        Ok(self)
    }

    /// Whether `path` passes the filter.
    pub fn matches(&self, path: &str, is_dir: bool) -> bool {
        if self.excludes.iter().any(|re| re.is_match(path)) {
            return false;
        }
        if self.includes.is_empty() {
            return true;
        }
        self.includes.iter().any(|prefix| {
            let inside = path == prefix
                || (path.starts_with(prefix.as_str())
                    && path.as_bytes().get(prefix.len()) == Some(&b'/'));
            let ancestor = is_dir
                && prefix.starts_with(path)
                && prefix.as_bytes().get(path.len()) == Some(&b'/');
            inside || ancestor
        })
    }

    /// Whether `item` passes the filter.
    pub fn accepts(&self, item: &SyncItem) -> bool {
        self.matches(
            &item.relative_path(),
            item.entry_type == EntryType::Directory,
        )
    }

    /// Convert into a predicate for
    /// [`HttpRepository::set_filter`](super::HttpRepository::set_filter).
    pub fn into_filter_fn(self) -> SyncFilterFn {
        Box::new(move |item: &SyncItem| self.accepts(item))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_accepts_everything() {
        let filter = PathFilter::new();
        assert!(filter.matches("anything/at/all", false));
    }

    #[test]
    fn test_include_keeps_subtree_and_ancestors() {
        let filter = PathFilter::new().include("/Terrain/e000n50/");

        assert!(filter.matches("Terrain", true));
        assert!(filter.matches("Terrain/e000n50", true));
        assert!(filter.matches("Terrain/e000n50/e007n50/a.stg", false));
        assert!(!filter.matches("Terrain/e010n50", true));
        assert!(!filter.matches("Terrain/e000n5", true));
        assert!(!filter.matches("Models", true));
        // A file named like an ancestor is not an ancestor
        assert!(!filter.matches("Terrain", false));
    }

    #[test]
    fn test_exclude_wins() {
        let filter = PathFilter::new()
            .include("Terrain")
            .exclude(r"\.btg\.gz$")
            .unwrap();

        assert!(filter.matches("Terrain/a.stg", false));
        assert!(!filter.matches("Terrain/a.btg.gz", false));
    }

    #[test]
    fn test_invalid_pattern() {
        assert!(PathFilter::new().exclude("(").is_err());
    }
}
