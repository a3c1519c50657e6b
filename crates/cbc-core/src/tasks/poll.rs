//! Existence check and fetch for the evaluator's results report.
//!
//! Absence is reported as [`CbcError::ObjectDoesNotExist`], the one error
//! class the poll state retries on.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::{CbcError, Result};
use crate::locator::ObjectLocator;
use crate::store::{ObjectStore, UrlReader};

/// Resolves a locator against the object store or, for plain URLs, an
/// unsigned HTTPS reader.
#[derive(Clone)]
pub struct ReportSource {
    objects: Arc<dyn ObjectStore>,
    urls: Option<Arc<UrlReader>>,
}

impl ReportSource {
    pub fn new(objects: Arc<dyn ObjectStore>, urls: Option<Arc<UrlReader>>) -> Self {
        Self { objects, urls }
    }

    fn url_reader(&self, url: &str) -> Result<&UrlReader> {
        self.urls
            .as_deref()
            .ok_or_else(|| CbcError::InvalidLocator(format!("url locators are not enabled: {url}")))
    }

    fn exists(&self, locator: &ObjectLocator) -> Result<bool> {
        match locator {
            ObjectLocator::Object { bucket, key } => self.objects.exists(bucket, key),
            ObjectLocator::Url { url } => self.url_reader(url)?.exists(url),
        }
    }

    fn get(&self, locator: &ObjectLocator) -> Result<Option<Vec<u8>>> {
        match locator {
            ObjectLocator::Object { bucket, key } => self.objects.get(bucket, key),
            ObjectLocator::Url { url } => self.url_reader(url)?.get(url),
        }
    }
}

/// The evaluator's output document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultsReport(pub serde_json::Value);

impl ResultsReport {
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data)
            .map(Self)
            .map_err(|e| CbcError::InvalidReport(format!("not JSON: {e}")))
    }

    /// `Evaluation.IsCompliant`, falling back to the nested
    /// `EvalEngineLambdalith.Evaluation.IsCompliant` shape.
    pub fn is_compliant(&self) -> Result<bool> {
        ["/Evaluation/IsCompliant", "/EvalEngineLambdalith/Evaluation/IsCompliant"]
            .iter()
            .find_map(|p| self.0.pointer(p).and_then(|v| v.as_bool()))
            .ok_or_else(|| CbcError::InvalidReport("missing boolean Evaluation.IsCompliant".into()))
    }
}

pub struct ExistencePoller {
    source: ReportSource,
}

impl ExistencePoller {
    pub fn new(source: ReportSource) -> Self {
        Self { source }
    }

    /// `Ok(())` once the object exists; `ObjectDoesNotExist` otherwise.
    pub fn check_exists(&self, locator: &ObjectLocator) -> Result<()> {
        if self.source.exists(locator)? {
            debug!(locator = %locator, "results report present");
            Ok(())
        } else {
            debug!(locator = %locator, "results report not yet present");
            Err(CbcError::ObjectDoesNotExist(locator.to_string()))
        }
    }
}

pub struct ReportFetcher {
    source: ReportSource,
}

impl ReportFetcher {
    pub fn new(source: ReportSource) -> Self {
        Self { source }
    }

    pub fn fetch(&self, locator: &ObjectLocator) -> Result<ResultsReport> {
        let data = self
            .source
            .get(locator)?
            .ok_or_else(|| CbcError::ObjectDoesNotExist(locator.to_string()))?;
        ResultsReport::from_slice(&data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::MemoryObjectStore;
    use serde_json::json;

    fn source() -> (Arc<MemoryObjectStore>, ReportSource) {
        let objects = Arc::new(MemoryObjectStore::new());
        (objects.clone(), ReportSource::new(objects, None))
    }

    #[test]
    fn absence_is_reported_as_retryable_kind() {
        let (objects, source) = source();
        let poller = ExistencePoller::new(source);
        let locator = ObjectLocator::object("results", "q-1.json");

        let err = poller.check_exists(&locator).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ObjectDoesNotExist);

        objects.put("results", "q-1.json", b"{}").unwrap();
        poller.check_exists(&locator).unwrap();
    }

    #[test]
    fn fetch_parses_both_report_shapes() {
        let (objects, source) = source();
        let fetcher = ReportFetcher::new(source);
        objects
            .put("r", "flat", json!({"Evaluation": {"IsCompliant": true}}).to_string().as_bytes())
            .unwrap();
        objects
            .put(
                "r",
                "nested",
                json!({"EvalEngineLambdalith": {"Evaluation": {"IsCompliant": false}}})
                    .to_string()
                    .as_bytes(),
            )
            .unwrap();

        let flat = fetcher.fetch(&ObjectLocator::object("r", "flat")).unwrap();
        assert!(flat.is_compliant().unwrap());
        let nested = fetcher.fetch(&ObjectLocator::object("r", "nested")).unwrap();
        assert!(!nested.is_compliant().unwrap());
    }

    #[test]
    fn fetch_of_missing_object_is_absence() {
        let (_, source) = source();
        let err = ReportFetcher::new(source)
            .fetch(&ObjectLocator::object("r", "nope"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ObjectDoesNotExist);
    }

    #[test]
    fn non_json_report_is_invalid() {
        let (objects, source) = source();
        objects.put("r", "bad", b"<html/>").unwrap();
        let err = ReportFetcher::new(source)
            .fetch(&ObjectLocator::object("r", "bad"))
            .unwrap_err();
        assert!(matches!(err, CbcError::InvalidReport(_)), "{err}");
    }

    #[test]
    fn report_without_verdict_is_invalid() {
        let report = ResultsReport(json!({"Evaluation": {}}));
        assert!(matches!(report.is_compliant(), Err(CbcError::InvalidReport(_))));
    }

    #[test]
    fn url_locator_without_reader_is_rejected() {
        let (_, source) = source();
        let err = ExistencePoller::new(source)
            .check_exists(&ObjectLocator::Url {
                url: "https://example.com/r.json".into(),
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
