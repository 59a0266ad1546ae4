use std::time::Duration;

use crate::{CleanupPolicy, RetryPolicy};

pub const DEFAULT_NAMESPACE: &str = "Learning-Management-System";
pub const DEFAULT_AVATAR_NAMESPACE: &str = "Learning-Management-System/avatars";

/// Key naming and cleanup settings for the media coordinator
#[derive(Debug, Clone)]
pub struct MediaConfig {
    /// Prefix for course thumbnails and lecture videos
    pub namespace: String,
    /// Prefix for user avatars
    pub avatar_namespace: String,
    /// Prefix object names with the upload time in milliseconds
    pub timestamp_keys: bool,
    /// Attempts per storage delete of a superseded or released object
    pub delete_attempts: u32,
    pub delete_backoff: Duration,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            avatar_namespace: DEFAULT_AVATAR_NAMESPACE.to_string(),
            timestamp_keys: true,
            delete_attempts: 3,
            delete_backoff: Duration::from_millis(200),
        }
    }
}

impl MediaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `LMS_MEDIA_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            namespace: env_var_or("LMS_MEDIA_NAMESPACE", defaults.namespace),
            avatar_namespace: env_var_or("LMS_MEDIA_AVATAR_NAMESPACE", defaults.avatar_namespace),
            timestamp_keys: env_var_or("LMS_MEDIA_TIMESTAMP_KEYS", defaults.timestamp_keys),
            delete_attempts: env_var_or("LMS_MEDIA_DELETE_ATTEMPTS", defaults.delete_attempts),
            delete_backoff: Duration::from_millis(env_var_or(
                "LMS_MEDIA_DELETE_BACKOFF_MS",
                defaults.delete_backoff.as_millis() as u64,
            )),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_avatar_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.avatar_namespace = namespace.into();
        self
    }

    pub fn with_timestamp_keys(mut self, enabled: bool) -> Self {
        self.timestamp_keys = enabled;
        self
    }

    pub fn with_delete_attempts(mut self, attempts: u32) -> Self {
        self.delete_attempts = attempts.max(1);
        self
    }

    pub fn with_delete_backoff(mut self, backoff: Duration) -> Self {
        self.delete_backoff = backoff;
        self
    }

    /// Cleanup policy derived from the delete settings
    pub fn cleanup_policy(&self) -> CleanupPolicy {
        CleanupPolicy {
            delete_retry: RetryPolicy::default()
                .with_max_attempts(self.delete_attempts)
                .with_backoff(self.delete_backoff, self.delete_backoff * 16),
            record_orphans: true,
        }
    }
}

fn env_var_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr,
{
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}
