//! Pointers to objects the workflow reads or writes.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CbcError, Result};

/// Where an object lives: a bucket/key pair in the object store, or a plain
/// HTTPS URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ObjectLocator {
    Object { bucket: String, key: String },
    Url { url: String },
}

impl ObjectLocator {
    pub fn object(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Object {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    /// Parse `s3://bucket/key`, `bucket/key` or an `https://` URL.
    ///
    /// For object URIs the `s3://` prefix is stripped and the remainder is
    /// split on the first `/`: everything before is the bucket, everything
    /// after (slashes included) is the key.
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri.starts_with("https://") || uri.starts_with("http://") {
            return Ok(Self::Url {
                url: uri.to_string(),
            });
        }
        let path = uri.strip_prefix("s3://").unwrap_or(uri);
        match path.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => {
                Ok(Self::object(bucket, key))
            }
            _ => Err(CbcError::InvalidLocator(uri.to_string())),
        }
    }

    /// Build a locator from task input that carries either explicit
    /// `Bucket`/`Key` fields or a single URI. Explicit fields win.
    pub fn from_parts(bucket: Option<&str>, key: Option<&str>, uri: Option<&str>) -> Result<Self> {
        match (bucket, key, uri) {
            (Some(b), Some(k), _) if !b.is_empty() && !k.is_empty() => Ok(Self::object(b, k)),
            (_, _, Some(u)) => Self::parse(u),
            _ => Err(CbcError::InvalidLocator(format!(
                "bucket={bucket:?} key={key:?} uri={uri:?}"
            ))),
        }
    }
}

impl fmt::Display for ObjectLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectLocator::Object { bucket, key } => write!(f, "s3://{bucket}/{key}"),
            ObjectLocator::Url { url } => f.write_str(url),
        }
    }
}
