//! Configuration for a repository sync.

use std::path::PathBuf;
use std::time::Duration;

use crate::http::DEFAULT_USER_AGENT;

/// Configuration for an [`HttpRepository`](super::HttpRepository).
#[derive(Debug, Clone)]
pub struct RepoConfig {
    /// Remote root URL. Directory indexes live at `<base_url>/<path>/.dirindex`.
    pub base_url: String,

    /// Local root the remote tree is mirrored into.
    pub fs_base: PathBuf,

    /// Maximum number of requests active at once.
    pub concurrency_limit: usize,

    /// Attempts per request before a transport error becomes a failure.
    pub max_attempts: u32,

    /// Failures tolerated before the whole sync is aborted.
    pub max_permitted_failures: usize,

    /// How long a verified directory is trusted without refetching its index.
    pub recheck_timeout: Duration,

    /// Whether `recheck_timeout` is honoured.
    pub recheck_timeout_enabled: bool,

    /// Pre-seeded tree to copy missing files from.
    pub installed_copy_path: Option<PathBuf>,

    /// HTTP request timeout.
    pub request_timeout: Duration,

    /// `User-Agent` sent with every request.
    pub user_agent: String,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            fs_base: PathBuf::from("."),
            concurrency_limit: 4,
            max_attempts: 3,
            max_permitted_failures: 16,
            recheck_timeout: Duration::from_secs(24 * 60 * 60),
            recheck_timeout_enabled: true,
            installed_copy_path: None,
            request_timeout: Duration::from_secs(30),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl RepoConfig {
    /// Create a configuration syncing `base_url` into `fs_base`.
    pub fn new(base_url: impl Into<String>, fs_base: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into(),
            fs_base: fs_base.into(),
            ..Default::default()
        }
    }

    /// Set the maximum number of simultaneous requests (at least 1).
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit.max(1);
        self
    }

    /// Set the attempts per request (at least 1).
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the failure threshold.
    pub fn with_max_permitted_failures(mut self, max: usize) -> Self {
        self.max_permitted_failures = max;
        self
    }

    /// Set the recheck timeout.
    pub fn with_recheck_timeout(mut self, timeout: Duration) -> Self {
        self.recheck_timeout = timeout;
        self
    }

    /// Enable or disable the recheck timeout.
    pub fn with_recheck_timeout_enabled(mut self, enabled: bool) -> Self {
        self.recheck_timeout_enabled = enabled;
        self
    }

    /// Set the installed-copy fallback tree.
    pub fn with_installed_copy_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.installed_copy_path = Some(path.into());
        self
    }

    /// Set the HTTP timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Set the `User-Agent` header.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }
}
