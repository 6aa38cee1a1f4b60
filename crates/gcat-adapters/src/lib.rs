//! Upstream adapters: catalog feed, relational name extraction, detail-page enrichment.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use gcat_core::{
    normalize_entity_name, short_description, EntityKind, Enrichment, Product, DEFAULT_RATING,
};
use gcat_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "gcat-adapters";

pub const DEFAULT_PRODUCT_TYPES: [&str; 4] = ["game", "pack", "dlc", "extras"];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("upstream fetch failed: {0}")]
    UpstreamFetch(#[from] FetchError),
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("malformed catalog payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("parse error: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Catalog listing parameters. `Default` is the stock ingest query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogQuery {
    pub limit: u32,
    pub query: Option<String>,
    pub order: Option<String>,
    pub product_types: Vec<String>,
    pub release_statuses: Option<String>,
}

impl Default for CatalogQuery {
    fn default() -> Self {
        Self {
            limit: 8,
            query: Some("like:Horizon".to_string()),
            order: Some("desc:score".to_string()),
            product_types: DEFAULT_PRODUCT_TYPES.iter().map(|s| s.to_string()).collect(),
            release_statuses: None,
        }
    }
}

impl CatalogQuery {
    pub fn order_by(mut self, direction: SortDirection, key: &str) -> Self {
        let prefix = match direction {
            SortDirection::Asc => "asc",
            SortDirection::Desc => "desc",
        };
        self.order = Some(format!("{prefix}:{key}"));
        self
    }

    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![("limit", self.limit.to_string())];
        if let Some(query) = &self.query {
            pairs.push(("query", query.clone()));
        }
        if let Some(order) = &self.order {
            pairs.push(("order", order.clone()));
        }
        if !self.product_types.is_empty() {
            pairs.push(("productType", format!("in:{}", self.product_types.join(","))));
        }
        if let Some(statuses) = &self.release_statuses {
            pairs.push(("releaseStatuses", statuses.clone()));
        }
        pairs
    }
}

#[derive(Debug, Deserialize)]
struct CatalogPage {
    products: Vec<JsonValue>,
}

/// A catalog record that could not be decoded into a [`Product`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RejectedProduct {
    pub index: usize,
    pub title: Option<String>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CatalogBatch {
    pub products: Vec<Product>,
    pub rejected: Vec<RejectedProduct>,
}

/// Decodes a catalog response body. Only a malformed envelope is an error;
/// records that fail to decode are set aside and the rest are kept.
pub fn parse_catalog_page(body: &[u8]) -> Result<CatalogBatch, AdapterError> {
    let page: CatalogPage = serde_json::from_slice(body)?;
    let mut batch = CatalogBatch::default();
    for (index, raw) in page.products.into_iter().enumerate() {
        let title = raw.get("title").and_then(JsonValue::as_str).map(str::to_string);
        match serde_json::from_value::<Product>(raw) {
            Ok(product) => batch.products.push(product),
            Err(err) => {
                warn!(operation = "decode_product", index, title = ?title, error = %err, "catalog record skipped");
                batch.rejected.push(RejectedProduct {
                    index,
                    title,
                    reason: err.to_string(),
                });
            }
        }
    }
    Ok(batch)
}

#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch_products(&self, query: &CatalogQuery) -> Result<CatalogBatch, AdapterError>;
}

/// Single GET against the catalog endpoint; transient failures are retried by the fetcher.
pub struct CatalogFetcher {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl CatalogFetcher {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn catalog_url(&self, query: &CatalogQuery) -> Result<String, AdapterError> {
        let url = url::Url::parse_with_params(&self.base_url, query.query_pairs())?;
        Ok(url.to_string())
    }
}

#[async_trait]
impl CatalogSource for CatalogFetcher {
    async fn fetch_products(&self, query: &CatalogQuery) -> Result<CatalogBatch, AdapterError> {
        let url = self.catalog_url(query)?;
        let fetched = self.http.fetch_bytes(&url).await?;
        let batch = parse_catalog_page(&fetched.body)?;
        debug!(
            url,
            products = batch.products.len(),
            rejected = batch.rejected.len(),
            "catalog page decoded"
        );
        Ok(batch)
    }
}

/// De-duplicated relational names for one batch, grouped by kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityNames {
    by_kind: BTreeMap<EntityKind, BTreeSet<String>>,
}

impl EntityNames {
    pub fn insert(&mut self, kind: EntityKind, raw: &str) -> bool {
        match normalize_entity_name(raw) {
            Some(name) => self.by_kind.entry(kind).or_default().insert(name),
            None => false,
        }
    }

    pub fn names(&self, kind: EntityKind) -> impl Iterator<Item = &str> {
        self.by_kind
            .get(&kind)
            .into_iter()
            .flat_map(|names| names.iter().map(String::as_str))
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntityKind, &str)> {
        self.by_kind
            .iter()
            .flat_map(|(kind, names)| names.iter().map(move |n| (*kind, n.as_str())))
    }

    pub fn len(&self) -> usize {
        self.by_kind.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collects developer, publisher, category (genre) and platform (OS) names across a batch.
pub fn normalize_entities(products: &[Product]) -> EntityNames {
    let mut names = EntityNames::default();
    for product in products {
        for kind in EntityKind::RELATIONAL {
            for name in product.relation_names(kind) {
                names.insert(kind, name);
            }
        }
    }
    names
}

#[async_trait]
pub trait EnrichmentSource: Send + Sync {
    async fn enrich(&self, product_slug: &str) -> Result<Enrichment, AdapterError>;
}

/// Scrapes description and age rating from the store's product page.
pub struct DetailPageEnricher {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl DetailPageEnricher {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn detail_url(&self, product_slug: &str) -> String {
        format!("{}/game/{}", self.base_url, detail_slug(product_slug))
    }
}

#[async_trait]
impl EnrichmentSource for DetailPageEnricher {
    async fn enrich(&self, product_slug: &str) -> Result<Enrichment, AdapterError> {
        let url = self.detail_url(product_slug);
        let fetched = self.http.fetch_bytes(&url).await?;
        let html = String::from_utf8_lossy(&fetched.body);
        parse_detail_page(&html)
    }
}

/// Detail pages key products by the catalog slug with underscores instead of hyphens.
pub fn detail_slug(product_slug: &str) -> String {
    product_slug.replace('-', "_").to_lowercase()
}

fn selector(css: &str) -> Result<Selector, AdapterError> {
    Selector::parse(css).map_err(|e| AdapterError::Parse(e.to_string()))
}

fn first_match<'a>(document: &'a Html, css: &str) -> Result<Option<ElementRef<'a>>, AdapterError> {
    let sel = selector(css)?;
    Ok(document.select(&sel).next())
}

/// `xlink:href` surfaces as local name `href` inside SVG, or verbatim outside it.
fn link_target(element: ElementRef<'_>) -> Option<String> {
    element
        .value()
        .attrs()
        .find(|(name, _)| *name == "href" || *name == "xlink:href")
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn normalize_rating(href: &str) -> String {
    let stripped = href.replace('_', "");
    stripped.strip_prefix('#').unwrap_or(&stripped).to_string()
}

/// Both the description HTML and its plain text are trimmed at the ends, so the
/// short description is a prefix of the trimmed text.
pub fn parse_detail_page(html: &str) -> Result<Enrichment, AdapterError> {
    let document = Html::parse_document(html);

    let block = first_match(&document, ".description")?
        .ok_or_else(|| AdapterError::Parse("missing .description block".to_string()))?;
    let description = block.inner_html().trim().to_string();
    let text = block.text().collect::<String>();

    let rating = first_match(&document, ".age-restrictions__icon use")?
        .and_then(link_target)
        .map(|href| normalize_rating(&href))
        .filter(|code| !code.is_empty())
        .unwrap_or_else(|| DEFAULT_RATING.to_string());

    Ok(Enrichment {
        description,
        short_description: short_description(text.trim()),
        rating,
    })
}
