//! Content store contract plus REST and in-memory implementations.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use gcat_core::{EntityKind, RelationalEntity};
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("content store request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("content store returned http {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("validation failed: {message} [{}]", .errors.join("; "))]
    Validation { message: String, errors: Vec<String> },
    #[error("{kind} named {name:?} already exists")]
    Conflict { kind: EntityKind, name: String },
    #[error("content store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("unexpected content store payload: {0}")]
    Decode(String),
}

/// A record as returned by the content store, reduced to the fields the pipeline reads.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: u64,
    pub name: String,
    pub slug: String,
    pub attributes: JsonValue,
}

impl StoredRecord {
    pub fn into_entity(self, kind: EntityKind) -> RelationalEntity {
        RelationalEntity {
            id: self.id,
            kind,
            name: self.name,
            slug: self.slug,
        }
    }
}

/// Find/create surface of the content service, one logical repository per kind.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Exact, case-sensitive name match within `kind`.
    async fn find_by_name(
        &self,
        kind: EntityKind,
        name: &str,
    ) -> Result<Option<StoredRecord>, StoreError>;

    async fn create(&self, kind: EntityKind, data: JsonValue) -> Result<StoredRecord, StoreError>;
}

fn json_u64(value: &JsonValue) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

/// Accepts both `{id, attributes: {...}}` and flat `{id, name, slug, ...}` records.
fn record_from_value(value: &JsonValue) -> Result<StoredRecord, StoreError> {
    let id = value
        .get("id")
        .and_then(json_u64)
        .ok_or_else(|| StoreError::Decode(format!("record without numeric id: {value}")))?;
    let attributes = value
        .get("attributes")
        .filter(|a| a.is_object())
        .unwrap_or(value)
        .clone();
    let name = attributes
        .get("name")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| StoreError::Decode(format!("record {id} without name")))?
        .to_string();
    let slug = attributes
        .get("slug")
        .and_then(JsonValue::as_str)
        .unwrap_or_default()
        .to_string();
    Ok(StoredRecord {
        id,
        name,
        slug,
        attributes,
    })
}

fn validation_errors(body: &JsonValue) -> (String, Vec<String>) {
    let error = body.get("error").unwrap_or(body);
    let message = error
        .get("message")
        .and_then(JsonValue::as_str)
        .unwrap_or("validation error")
        .to_string();
    let errors = error
        .get("details")
        .and_then(|d| d.get("errors"))
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .map(|item| {
                    let path = item
                        .get("path")
                        .and_then(JsonValue::as_array)
                        .map(|p| {
                            p.iter()
                                .filter_map(JsonValue::as_str)
                                .collect::<Vec<_>>()
                                .join(".")
                        })
                        .unwrap_or_default();
                    let msg = item
                        .get("message")
                        .and_then(JsonValue::as_str)
                        .unwrap_or_default();
                    if path.is_empty() {
                        msg.to_string()
                    } else {
                        format!("{path}: {msg}")
                    }
                })
                .collect()
        })
        .unwrap_or_default();
    (message, errors)
}

/// Strapi-style REST client: `/api/{collection}` with `filters[name][$eq]` lookups.
#[derive(Debug, Clone)]
pub struct RestContentStore {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

impl RestContentStore {
    pub fn new(
        base_url: impl Into<String>,
        api_token: Option<String>,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building content store client")?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token,
        })
    }

    fn collection_url(&self, kind: EntityKind) -> String {
        format!("{}/api/{}", self.base_url, kind.collection())
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ContentStore for RestContentStore {
    async fn find_by_name(
        &self,
        kind: EntityKind,
        name: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let url = self.collection_url(kind);
        let resp = self
            .authorize(self.client.get(&url))
            .query(&[("filters[name][$eq]", name), ("pagination[pageSize]", "1")])
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StoreError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        let body: JsonValue = resp
            .json()
            .await
            .map_err(|e| StoreError::Decode(e.to_string()))?;
        let items = body
            .get("data")
            .or_else(|| body.get("results"))
            .and_then(JsonValue::as_array)
            .ok_or_else(|| StoreError::Decode(format!("{kind} lookup without data array")))?;
        items.first().map(record_from_value).transpose()
    }

    async fn create(&self, kind: EntityKind, data: JsonValue) -> Result<StoredRecord, StoreError> {
        let url = self.collection_url(kind);
        let resp = self
            .authorize(self.client.post(&url))
            .json(&json!({ "data": data }))
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            let body: JsonValue = resp
                .json()
                .await
                .map_err(|e| StoreError::Decode(e.to_string()))?;
            let record = body.get("data").unwrap_or(&body);
            return record_from_value(record);
        }

        if status == reqwest::StatusCode::BAD_REQUEST {
            let body: JsonValue = resp.json().await.unwrap_or(JsonValue::Null);
            let (message, errors) = validation_errors(&body);
            if errors.iter().any(|e| e.contains("unique")) || message.contains("unique") {
                let name = data
                    .get("name")
                    .and_then(JsonValue::as_str)
                    .unwrap_or_default()
                    .to_string();
                return Err(StoreError::Conflict { kind, name });
            }
            return Err(StoreError::Validation { message, errors });
        }

        Err(StoreError::HttpStatus {
            status: status.as_u16(),
            url,
        })
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: u64,
    records: BTreeMap<EntityKind, Vec<StoredRecord>>,
    failing: BTreeSet<EntityKind>,
}

/// Process-local store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct InMemoryContentStore {
    state: Mutex<MemoryState>,
    unique_names: bool,
    lookup_delay: Option<Duration>,
}

impl InMemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject a second record with the same name in a kind, like a unique index would.
    pub fn with_unique_names(mut self) -> Self {
        self.unique_names = true;
        self
    }

    /// Sleep inside every lookup, widening the window between find and create.
    pub fn with_lookup_delay(mut self, delay: Duration) -> Self {
        self.lookup_delay = Some(delay);
        self
    }

    /// Make every call for `kind` fail with a 503.
    pub async fn fail_kind(&self, kind: EntityKind) {
        self.state.lock().await.failing.insert(kind);
    }

    pub async fn records(&self, kind: EntityKind) -> Vec<StoredRecord> {
        self.state
            .lock()
            .await
            .records
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn count(&self, kind: EntityKind) -> usize {
        self.records(kind).await.len()
    }

    fn unavailable(kind: EntityKind) -> StoreError {
        StoreError::HttpStatus {
            status: 503,
            url: format!("memory://{}", kind.collection()),
        }
    }
}

#[async_trait]
impl ContentStore for InMemoryContentStore {
    async fn find_by_name(
        &self,
        kind: EntityKind,
        name: &str,
    ) -> Result<Option<StoredRecord>, StoreError> {
        let found = {
            let state = self.state.lock().await;
            if state.failing.contains(&kind) {
                return Err(Self::unavailable(kind));
            }
            state
                .records
                .get(&kind)
                .and_then(|records| records.iter().find(|r| r.name == name).cloned())
        };
        if let Some(delay) = self.lookup_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(found)
    }

    async fn create(&self, kind: EntityKind, data: JsonValue) -> Result<StoredRecord, StoreError> {
        let mut state = self.state.lock().await;
        if state.failing.contains(&kind) {
            return Err(Self::unavailable(kind));
        }
        let Some(name) = data.get("name").and_then(JsonValue::as_str) else {
            return Err(StoreError::Validation {
                message: format!("{kind} requires a name"),
                errors: vec!["name: required".to_string()],
            });
        };
        let name = name.to_string();
        if self.unique_names
            && state
                .records
                .get(&kind)
                .is_some_and(|records| records.iter().any(|r| r.name == name))
        {
            return Err(StoreError::Conflict { kind, name });
        }

        state.next_id += 1;
        let record = StoredRecord {
            id: state.next_id,
            slug: data
                .get("slug")
                .and_then(JsonValue::as_str)
                .unwrap_or_default()
                .to_string(),
            name,
            attributes: data,
        };
        state.records.entry(kind).or_default().push(record.clone());
        Ok(record)
    }
}
