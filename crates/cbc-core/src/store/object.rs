//! Object store clients.
//!
//! # Absence semantics
//!
//! A `403 Forbidden` from the store is treated exactly like `404 Not Found`:
//! the object is reported as absent. Without `ListBucket` permission S3
//! answers 403 for missing keys, so this is the only way to observe absence
//! with a narrowly-scoped identity. The cost is that a genuine permission
//! problem looks like "not written yet" and is retried until the poll budget
//! runs out. Every 403 is logged at WARN so the two cases can be told apart
//! after the fact.

use reqwest::blocking::Client;
use reqwest::{Method, StatusCode, Url};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{CbcError, Result};
use crate::http::{build_client, error_body, send_signed};
use crate::sigv4::{uri_encode, Signer};

/// Durable storage for raw input records and results reports.
pub trait ObjectStore: Send + Sync {
    /// Whether `bucket/key` exists. Absence (404, and 403, see module docs)
    /// is `Ok(false)`; any other failure is an error.
    fn exists(&self, bucket: &str, key: &str) -> Result<bool>;

    /// Object body, or `None` when absent (same 403/404 rule as `exists`).
    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, bucket: &str, key: &str, body: &[u8]) -> Result<()>;

    /// Short backend name for logs.
    fn backend(&self) -> &'static str;
}

fn is_absent(status: StatusCode, what: &str) -> bool {
    match status {
        StatusCode::NOT_FOUND => true,
        StatusCode::FORBIDDEN => {
            warn!(object = %what, "403 treated as absent; may hide a permission problem");
            true
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// S3ObjectStore
// ---------------------------------------------------------------------------

/// S3 REST client using path-style addressing and SigV4.
pub struct S3ObjectStore {
    client: Client,
    endpoint: Url,
    signer: Signer,
}

impl S3ObjectStore {
    /// `endpoint` defaults to `https://s3.{region}.amazonaws.com`; a custom
    /// endpoint (e.g. a local S3-compatible server) may be supplied.
    pub fn new(signer: Signer, region: &str, endpoint: Option<&str>) -> Result<Self> {
        let raw = endpoint
            .map(str::to_string)
            .unwrap_or_else(|| format!("https://s3.{region}.amazonaws.com"));
        let endpoint = Url::parse(&raw)
            .map_err(|e| CbcError::Upstream(format!("invalid s3 endpoint '{raw}': {e}")))?;
        Ok(Self {
            client: build_client()?,
            endpoint,
            signer,
        })
    }

    fn object_url(&self, bucket: &str, key: &str) -> Url {
        let base = self.endpoint.path().trim_end_matches('/');
        let encoded_key = key
            .split('/')
            .map(|segment| uri_encode(segment, true))
            .collect::<Vec<_>>()
            .join("/");
        let mut url = self.endpoint.clone();
        url.set_path(&format!("{base}/{}/{encoded_key}", uri_encode(bucket, true)));
        url
    }

    fn describe(bucket: &str, key: &str) -> String {
        format!("s3://{bucket}/{key}")
    }
}

impl ObjectStore for S3ObjectStore {
    fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        let what = Self::describe(bucket, key);
        debug!(object = %what, "HEAD object");
        let url = self.object_url(bucket, key);
        let response = send_signed(&self.client, &self.signer, Method::HEAD, url, &[], Vec::new())?;
        let status = response.status();
        if status.is_success() {
            return Ok(true);
        }
        if is_absent(status, &what) {
            return Ok(false);
        }
        Err(CbcError::Upstream(format!("HEAD {what} returned {status}")))
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let what = Self::describe(bucket, key);
        debug!(object = %what, "GET object");
        let url = self.object_url(bucket, key);
        let response = send_signed(&self.client, &self.signer, Method::GET, url, &[], Vec::new())?;
        let status = response.status();
        if status.is_success() {
            return Ok(Some(response.bytes()?.to_vec()));
        }
        if is_absent(status, &what) {
            return Ok(None);
        }
        Err(CbcError::Upstream(format!(
            "GET {what} returned {status}: {}",
            error_body(response)
        )))
    }

    fn put(&self, bucket: &str, key: &str, body: &[u8]) -> Result<()> {
        let what = Self::describe(bucket, key);
        debug!(object = %what, bytes = body.len(), "PUT object");
        let url = self.object_url(bucket, key);
        let response = send_signed(
            &self.client,
            &self.signer,
            Method::PUT,
            url,
            &[("content-type", "application/json")],
            body.to_vec(),
        )?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(CbcError::Upstream(format!(
            "PUT {what} returned {status}: {}",
            error_body(response)
        )))
    }

    fn backend(&self) -> &'static str {
        "s3"
    }
}

// ---------------------------------------------------------------------------
// FsObjectStore
// ---------------------------------------------------------------------------

/// Filesystem-backed store: `{root}/{bucket}/{key}`.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let unsafe_part = |s: &str| s.is_empty() || s == "." || s == "..";
        if bucket.contains('/') || unsafe_part(bucket) || key.split('/').any(unsafe_part) {
            return Err(CbcError::InvalidLocator(format!("{bucket}/{key}")));
        }
        Ok(self.root.join(bucket).join(Path::new(key)))
    }
}

impl ObjectStore for FsObjectStore {
    fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self.object_path(bucket, key)?.is_file())
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.object_path(bucket, key)?;
        match std::fs::read(&path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, bucket: &str, key: &str, body: &[u8]) -> Result<()> {
        let path = self.object_path(bucket, key)?;
        crate::io::atomic_write(&path, body)
    }

    fn backend(&self) -> &'static str {
        "fs"
    }
}

// ---------------------------------------------------------------------------
// MemoryObjectStore
// ---------------------------------------------------------------------------

/// Process-local store, used by tests and dry runs.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(String, String), Vec<u8>>>> {
        self.objects
            .lock()
            .map_err(|_| CbcError::Upstream("memory object store lock poisoned".into()))
    }
}

impl ObjectStore for MemoryObjectStore {
    fn exists(&self, bucket: &str, key: &str) -> Result<bool> {
        Ok(self.lock()?.contains_key(&(bucket.to_string(), key.to_string())))
    }

    fn get(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .lock()?
            .get(&(bucket.to_string(), key.to_string()))
            .cloned())
    }

    fn put(&self, bucket: &str, key: &str, body: &[u8]) -> Result<()> {
        self.lock()?
            .insert((bucket.to_string(), key.to_string()), body.to_vec());
        Ok(())
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

// ---------------------------------------------------------------------------
// Plain HTTPS locators
// ---------------------------------------------------------------------------

/// Unsigned reader for results reports published at a plain URL.
/// Only a `200` counts as present; 403/404 are absence, as for the store.
pub struct UrlReader {
    client: Client,
}

impl UrlReader {
    pub fn new() -> Result<Self> {
        Ok(Self {
            client: build_client()?,
        })
    }

    pub fn exists(&self, url: &str) -> Result<bool> {
        let response = self.client.head(url).send()?;
        let status = response.status();
        if status == StatusCode::OK {
            return Ok(true);
        }
        if is_absent(status, url) {
            return Ok(false);
        }
        Err(CbcError::Upstream(format!("HEAD {url} returned {status}")))
    }

    pub fn get(&self, url: &str) -> Result<Option<Vec<u8>>> {
        let response = self.client.get(url).send()?;
        let status = response.status();
        if status == StatusCode::OK {
            return Ok(Some(response.bytes()?.to_vec()));
        }
        if is_absent(status, url) {
            return Ok(None);
        }
        Err(CbcError::Upstream(format!(
            "GET {url} returned {status}: {}",
            error_body(response)
        )))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
