/// Configuration for uploads
#[derive(Debug, Clone)]
pub struct BlobConfig {
    /// Absolute max size allowed for a single object (safety guard)
    pub max_blob_bytes: u64,

    /// Objects at or above this size go through the multipart protocol;
    /// smaller ones use a single put
    pub multipart_threshold_bytes: u64,

    /// Rules for part-based uploads
    pub upload_rules: UploadRules,
}

const MIB: u64 = 1024 * 1024;

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            max_blob_bytes: 5 * 1024 * MIB,        // 5GB
            multipart_threshold_bytes: 10 * MIB,   // 2x part size
            upload_rules: UploadRules::default(),
        }
    }
}

/// Rules for multipart uploads
#[derive(Debug, Clone)]
pub struct UploadRules {
    /// Size of every part except the last
    pub part_size: u64,

    /// Upper bound to protect memory/state
    pub max_parts: u32,

    /// How many parts of one upload may be in flight at once
    pub max_concurrent_parts: usize,
}

impl Default for UploadRules {
    fn default() -> Self {
        Self {
            part_size: 5 * MIB,
            max_parts: 10_000,
            max_concurrent_parts: 4,
        }
    }
}

impl BlobConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `LMS_BLOB_*` environment variables.
    ///
    /// Unparsable values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_blob_bytes: env_var_or("LMS_BLOB_MAX_BYTES", defaults.max_blob_bytes),
            multipart_threshold_bytes: env_var_or(
                "LMS_BLOB_MULTIPART_THRESHOLD",
                defaults.multipart_threshold_bytes,
            ),
            upload_rules: UploadRules {
                part_size: env_var_or("LMS_BLOB_PART_SIZE", defaults.upload_rules.part_size),
                max_parts: env_var_or("LMS_BLOB_MAX_PARTS", defaults.upload_rules.max_parts),
                max_concurrent_parts: env_var_or(
                    "LMS_BLOB_MAX_CONCURRENT_PARTS",
                    defaults.upload_rules.max_concurrent_parts,
                ),
            },
        }
    }

    /// Set max blob size
    pub fn with_max_blob_bytes(mut self, bytes: u64) -> Self {
        self.max_blob_bytes = bytes;
        self
    }

    /// Set multipart threshold
    pub fn with_multipart_threshold(mut self, bytes: u64) -> Self {
        self.multipart_threshold_bytes = bytes;
        self
    }

    /// Set upload rules
    pub fn with_upload_rules(mut self, rules: UploadRules) -> Self {
        self.upload_rules = rules;
        self
    }
}

impl UploadRules {
    /// Create new upload rules
    pub fn new() -> Self {
        Self::default()
    }

    /// Set part size
    pub fn with_part_size(mut self, bytes: u64) -> Self {
        self.part_size = bytes;
        self
    }

    /// Set max parts
    pub fn with_max_parts(mut self, max: u32) -> Self {
        self.max_parts = max;
        self
    }

    /// Set the part fan-out; 1 uploads parts strictly sequentially
    pub fn with_max_concurrent_parts(mut self, max: usize) -> Self {
        self.max_concurrent_parts = max.max(1);
        self
    }
}

pub(crate) fn env_var_or<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display,
{
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(default)
}
