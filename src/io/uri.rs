use std::fmt;
use std::path::{Path, PathBuf};

use crate::SentimentError;

const GCS_SCHEME: &str = "gs://";

/// Where an artifact lives: a Cloud Storage object/prefix or a local path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageUri {
    Gcs { bucket: String, key: String },
    Local(PathBuf),
}

impl StorageUri {
    pub fn parse(location: &str) -> crate::Result<Self> {
        let Some(rest) = location.strip_prefix(GCS_SCHEME) else {
            return Ok(StorageUri::Local(PathBuf::from(location)));
        };
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(SentimentError::Storage(format!("missing bucket name in {}", location)));
        }
        Ok(StorageUri::Gcs {
            bucket: bucket.to_string(),
            key: key.trim_matches('/').to_string(),
        })
    }

    pub fn is_remote(location: &str) -> bool {
        location.starts_with(GCS_SCHEME)
    }

    /// Bucket name of a `gs://` location
    pub fn bucket_of(location: &str) -> Option<String> {
        match Self::parse(location) {
            Ok(StorageUri::Gcs { bucket, .. }) => Some(bucket),
            _ => None,
        }
    }

    pub fn join(&self, name: &str) -> StorageUri {
        match self {
            StorageUri::Gcs { bucket, key } => StorageUri::Gcs {
                bucket: bucket.clone(),
                key: join_key(key, name),
            },
            StorageUri::Local(path) => StorageUri::Local(path.join(name)),
        }
    }

    /// Last path component
    pub fn file_name(&self) -> Option<String> {
        match self {
            StorageUri::Gcs { key, .. } => key.rsplit('/').next().filter(|s| !s.is_empty()).map(str::to_string),
            StorageUri::Local(path) => path.file_name().map(|n| n.to_string_lossy().to_string()),
        }
    }
}

impl fmt::Display for StorageUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageUri::Gcs { bucket, key } if key.is_empty() => write!(f, "{}{}", GCS_SCHEME, bucket),
            StorageUri::Gcs { bucket, key } => write!(f, "{}{}/{}", GCS_SCHEME, bucket, key),
            StorageUri::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Join object key segments with a single `/`
pub fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    let name = name.trim_start_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

/// Object key for a local file relative to `root`, using `/` separators
pub fn relative_key(root: &Path, file: &Path) -> Option<String> {
    let rel = file.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel.components().map(|c| c.as_os_str().to_string_lossy().to_string()).collect();
    Some(parts.join("/"))
}
