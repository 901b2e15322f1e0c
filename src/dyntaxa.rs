use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderValue, USER_AGENT};
use serde_json::{Value, json};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::taxon::{CATEGORY_ORDER, STATUS_ACCEPTED, TYPE_TAXONOMIC};

/// Batch detail calls can be slow on large chunks; the service-side work
/// scales with the number of ids.
const BATCH_TIMEOUT_FLOOR_SECS: u64 = 60;

/// The three taxon-service endpoints the pipeline consumes.
pub trait TaxonService: Send + Sync {
    /// Name search, `GET /taxa/names`.
    fn search_names(&self, query: &str) -> Result<Value, SyncError>;
    /// Child-id listing, `GET /taxa/{id}/childids`.
    fn child_ids(&self, taxon_id: i64) -> Result<Value, SyncError>;
    /// Batch detail fetch, `POST /taxa`. The returned objects are a subset
    /// of the requested ids.
    fn taxa_details(&self, ids: &[i64]) -> Result<Vec<Value>, SyncError>;
}

impl<T: TaxonService + ?Sized> TaxonService for std::sync::Arc<T> {
    fn search_names(&self, query: &str) -> Result<Value, SyncError> {
        (**self).search_names(query)
    }
    fn child_ids(&self, taxon_id: i64) -> Result<Value, SyncError> {
        (**self).child_ids(taxon_id)
    }
    fn taxa_details(&self, ids: &[i64]) -> Result<Vec<Value>, SyncError> {
        (**self).taxa_details(ids)
    }
}

#[derive(Clone)]
pub struct DyntaxaHttpClient {
    client: Client,
    base_url: String,
    culture: String,
    timeout_seconds: u64,
}

impl DyntaxaHttpClient {
    pub fn new(config: &SyncConfig) -> Result<Self, SyncError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("dyntaxa-sync/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| SyncError::ServiceHttp(err.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            "Ocp-Apim-Subscription-Key",
            HeaderValue::from_str(&config.api_key)
                .map_err(|err| SyncError::ServiceHttp(err.to_string()))?,
        );

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|err| SyncError::ServiceHttp(err.to_string()))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            culture: config.culture.clone(),
            timeout_seconds: config.timeout_seconds,
        })
    }

    fn handle_status(
        response: reqwest::blocking::Response,
    ) -> Result<reqwest::blocking::Response, SyncError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let url = response.url().to_string();
        let body = response
            .text()
            .unwrap_or_else(|_| "taxon service request failed".to_string());
        Err(SyncError::ServiceStatus { status, url, body })
    }

    fn long_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(BATCH_TIMEOUT_FLOOR_SECS))
    }
}

impl TaxonService for DyntaxaHttpClient {
    fn search_names(&self, query: &str) -> Result<Value, SyncError> {
        let url = format!("{}/taxa/names", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("searchString", query),
                ("searchFields", "Both"),
                ("isRecommended", "NotSet"),
                ("isOkForObservationSystems", "NotSet"),
                ("culture", self.culture.as_str()),
                ("page", "1"),
                ("pageSize", "100"),
            ])
            .send()
            .map_err(|err| SyncError::ServiceHttp(err.to_string()))?;
        let response = Self::handle_status(response)?;
        response
            .json()
            .map_err(|err| SyncError::ServiceHttp(err.to_string()))
    }

    fn child_ids(&self, taxon_id: i64) -> Result<Value, SyncError> {
        let url = format!("{}/taxa/{}/childids", self.base_url, taxon_id);
        let response = self
            .client
            .get(&url)
            .query(&[("useMainChildren", "false")])
            .timeout(self.long_timeout())
            .send()
            .map_err(|err| SyncError::ServiceHttp(err.to_string()))?;
        let response = Self::handle_status(response)?;
        response
            .json()
            .map_err(|err| SyncError::ServiceHttp(err.to_string()))
    }

    fn taxa_details(&self, ids: &[i64]) -> Result<Vec<Value>, SyncError> {
        let url = format!("{}/taxa", self.base_url);
        let response = self
            .client
            .post(&url)
            .query(&[("culture", self.culture.as_str())])
            .json(&json!({ "taxonIds": ids }))
            .header(CONTENT_TYPE, "application/json-patch+json")
            .timeout(self.long_timeout())
            .send()
            .map_err(|err| SyncError::ServiceHttp(err.to_string()))?;
        let response = Self::handle_status(response)?;
        let request_url = response.url().to_string();
        let payload: Value = response
            .json()
            .map_err(|err| SyncError::ServiceHttp(err.to_string()))?;
        match payload {
            Value::Array(items) => Ok(items),
            other => Err(SyncError::UnexpectedPayload {
                url: request_url,
                detail: format!("expected a taxon list, got {}", kind_of(&other)),
            }),
        }
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Picks the root taxon out of a name-search payload. Requires an accepted
/// taxonomic Order whose recommended scientific name matches; falls back to
/// an exact name match. Anything less is an ambiguous-root error.
pub fn resolve_root_id(payload: &Value, root_name: &str) -> Result<i64, SyncError> {
    let items = payload
        .get("data")
        .and_then(Value::as_array)
        .filter(|items| !items.is_empty())
        .ok_or_else(|| SyncError::AmbiguousRoot(format!("no candidates for {root_name}")))?;

    for item in items {
        let info = item.get("taxonInformation");
        let recommended = info
            .and_then(|v| v.get("recommendedScientificName"))
            .and_then(Value::as_str);
        let category = label(item, "category");
        let kind = label(item, "type");
        let status = label(item, "status");
        if recommended == Some(root_name)
            && category == Some(CATEGORY_ORDER)
            && kind == Some(TYPE_TAXONOMIC)
            && status == Some(STATUS_ACCEPTED)
        {
            if let Some(id) = info.and_then(|v| v.get("taxonId")).and_then(Value::as_i64) {
                return Ok(id);
            }
        }
    }

    for item in items {
        let info = item.get("taxonInformation");
        let recommended = info
            .and_then(|v| v.get("recommendedScientificName"))
            .and_then(Value::as_str);
        if item.get("name").and_then(Value::as_str) == Some(root_name)
            && recommended == Some(root_name)
        {
            if let Some(id) = info.and_then(|v| v.get("taxonId")).and_then(Value::as_i64) {
                return Ok(id);
            }
        }
    }

    Err(SyncError::AmbiguousRoot(root_name.to_string()))
}

/// Child-id payloads come in several shapes: a bare id list, or an object
/// carrying the list under `taxonIds` or `data`.
pub fn extract_child_ids(payload: &Value) -> Vec<i64> {
    let items = match payload {
        Value::Array(items) => Some(items),
        Value::Object(_) => payload
            .get("taxonIds")
            .and_then(Value::as_array)
            .or_else(|| payload.get("data").and_then(Value::as_array)),
        _ => None,
    };
    items
        .map(|items| items.iter().filter_map(Value::as_i64).collect())
        .unwrap_or_default()
}

fn label<'a>(item: &'a Value, key: &str) -> Option<&'a str> {
    item.get(key)
        .and_then(|v| v.get("value"))
        .and_then(Value::as_str)
}
