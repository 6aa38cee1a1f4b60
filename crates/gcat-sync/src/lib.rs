//! Catalog population orchestration.

mod entry;
mod media;
mod upsert;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use gcat_adapters::{
    normalize_entities, AdapterError, CatalogFetcher, CatalogQuery, CatalogSource,
    DetailPageEnricher, EnrichmentSource, RejectedProduct,
};
use gcat_core::Product;
use gcat_storage::{BackoffPolicy, ContentStore, HttpClientConfig, HttpFetcher, RestContentStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub use entry::{BuildOutcome, CatalogEntryBuilder, CreatedEntry, EntryError};
pub use media::{random_token, MediaUploader, UploadError, UploadTally};
pub use upsert::{EntityTally, IdempotentUpserter, KeyedLocks, KindTally, Resolved, UpsertError};

pub const CRATE_NAME: &str = "gcat-sync";

pub const SUMMARY_FILE: &str = "populate_summary.json";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub catalog_url: String,
    pub detail_url: String,
    pub app_url: String,
    pub api_token: Option<String>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub store_timeout_secs: u64,
    pub http_concurrency: usize,
    pub product_concurrency: usize,
    pub entity_concurrency: usize,
    pub max_retries: usize,
    pub reports_dir: Option<PathBuf>,
    pub scheduler_enabled: bool,
    pub populate_cron: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            catalog_url: "https://catalog.gog.com/v1/catalog".to_string(),
            detail_url: "https://www.gog.com".to_string(),
            app_url: "http://localhost:1337".to_string(),
            api_token: None,
            user_agent: "gcat-bot/0.1".to_string(),
            http_timeout_secs: 20,
            store_timeout_secs: 30,
            http_concurrency: 16,
            product_concurrency: 4,
            entity_concurrency: 8,
            max_retries: 3,
            reports_dir: None,
            scheduler_enabled: false,
            populate_cron: "0 6 * * *".to_string(),
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            catalog_url: std::env::var("GCAT_CATALOG_URL").unwrap_or(defaults.catalog_url),
            detail_url: std::env::var("GCAT_DETAIL_URL").unwrap_or(defaults.detail_url),
            app_url: std::env::var("GCAT_APP_URL").unwrap_or(defaults.app_url),
            api_token: std::env::var("GCAT_API_TOKEN").ok().filter(|v| !v.is_empty()),
            user_agent: std::env::var("GCAT_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_or("GCAT_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            store_timeout_secs: env_or("GCAT_STORE_TIMEOUT_SECS", defaults.store_timeout_secs),
            http_concurrency: env_or("GCAT_HTTP_CONCURRENCY", defaults.http_concurrency),
            product_concurrency: env_or("GCAT_PRODUCT_CONCURRENCY", defaults.product_concurrency),
            entity_concurrency: env_or("GCAT_ENTITY_CONCURRENCY", defaults.entity_concurrency),
            max_retries: env_or("GCAT_MAX_RETRIES", defaults.max_retries),
            reports_dir: std::env::var("GCAT_REPORTS_DIR").ok().map(PathBuf::from),
            scheduler_enabled: std::env::var("GCAT_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            populate_cron: std::env::var("GCAT_POPULATE_CRON").unwrap_or(defaults.populate_cron),
        }
    }

    pub fn upload_url(&self) -> String {
        format!("{}/api/upload/", self.app_url.trim_end_matches('/'))
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.http_concurrency,
            per_host_concurrency: (self.http_concurrency / 2).max(1),
            backoff: BackoffPolicy {
                max_retries: self.max_retries,
                ..BackoffPolicy::default()
            },
        }
    }
}

/// Per-run overrides on top of the stock catalog query. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulateParams {
    pub limit: Option<u32>,
    pub query: Option<String>,
    pub order: Option<String>,
    pub product_types: Option<Vec<String>>,
    pub release_statuses: Option<String>,
}

impl PopulateParams {
    pub fn apply(&self, mut query: CatalogQuery) -> CatalogQuery {
        if let Some(limit) = self.limit {
            query.limit = limit;
        }
        if let Some(text) = &self.query {
            query.query = Some(text.clone());
        }
        if let Some(order) = &self.order {
            query.order = Some(order.clone());
        }
        if let Some(types) = &self.product_types {
            query.product_types = types.clone();
        }
        if let Some(statuses) = &self.release_statuses {
            query.release_statuses = Some(statuses.clone());
        }
        query
    }
}

#[derive(Debug, Error)]
pub enum PopulateError {
    #[error("catalog fetch failed: {0}")]
    Catalog(#[from] AdapterError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProductOutcome {
    Created {
        title: String,
        entry_id: u64,
        enriched: bool,
        missing_relations: Vec<String>,
        uploads_ok: usize,
        uploads_failed: usize,
    },
    Skipped {
        title: String,
        existing_id: u64,
    },
    Failed {
        title: String,
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct PopulateSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub fetched_products: usize,
    /// Catalog records that could not be decoded and were left out of the run.
    pub rejected: Vec<RejectedProduct>,
    pub entities: EntityTally,
    pub created: usize,
    pub skipped: usize,
    pub failed: usize,
    pub uploads_ok: usize,
    pub uploads_failed: usize,
    pub outcomes: Vec<ProductOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_path: Option<String>,
}

impl PopulateSummary {
    /// True when anything below the catalog fetch failed.
    pub fn is_degraded(&self) -> bool {
        self.failed > 0
            || self.uploads_failed > 0
            || self.entities.failed() > 0
            || !self.rejected.is_empty()
    }

    fn tally(&mut self) {
        for outcome in &self.outcomes {
            match outcome {
                ProductOutcome::Created {
                    uploads_ok,
                    uploads_failed,
                    ..
                } => {
                    self.created += 1;
                    self.uploads_ok += uploads_ok;
                    self.uploads_failed += uploads_failed;
                }
                ProductOutcome::Skipped { .. } => self.skipped += 1,
                ProductOutcome::Failed { .. } => self.failed += 1,
            }
        }
    }
}

pub struct PopulatePipeline {
    config: SyncConfig,
    store: Arc<dyn ContentStore>,
    catalog: Arc<dyn CatalogSource>,
    upserter: Arc<IdempotentUpserter>,
    builder: CatalogEntryBuilder,
    uploader: MediaUploader,
}

impl PopulatePipeline {
    pub fn new(config: SyncConfig, store: Arc<dyn ContentStore>) -> Result<Self> {
        let http = Arc::new(
            HttpFetcher::new(config.http_client_config()).context("building http fetcher")?,
        );
        let catalog: Arc<dyn CatalogSource> =
            Arc::new(CatalogFetcher::new(http.clone(), config.catalog_url.clone()));
        let enricher: Arc<dyn EnrichmentSource> =
            Arc::new(DetailPageEnricher::new(http.clone(), config.detail_url.clone()));
        let upserter = Arc::new(IdempotentUpserter::new(store.clone(), config.store_timeout()));
        let builder = CatalogEntryBuilder::new(
            store.clone(),
            upserter.clone(),
            enricher,
            config.store_timeout(),
        );
        let uploader = MediaUploader::new(http, config.upload_url(), config.api_token.clone());
        Ok(Self {
            config,
            store,
            catalog,
            upserter,
            builder,
            uploader,
        })
    }

    pub fn with_sources(
        mut self,
        catalog: Arc<dyn CatalogSource>,
        enricher: Arc<dyn EnrichmentSource>,
    ) -> Self {
        self.catalog = catalog;
        self.builder = CatalogEntryBuilder::new(
            self.store.clone(),
            self.upserter.clone(),
            enricher,
            self.config.store_timeout(),
        );
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Fetches one catalog batch and ingests it. Only a failed catalog fetch is an error;
    /// everything downstream is reported per product in the summary.
    pub async fn populate(&self, params: &PopulateParams) -> Result<PopulateSummary, PopulateError> {
        let run_id = Uuid::new_v4();
        self.populate_run(run_id, params)
            .instrument(info_span!("populate", %run_id))
            .await
    }

    async fn populate_run(
        &self,
        run_id: Uuid,
        params: &PopulateParams,
    ) -> Result<PopulateSummary, PopulateError> {
        let started_at = Utc::now();
        let query = params.apply(CatalogQuery::default());

        let batch = match self.catalog.fetch_products(&query).await {
            Ok(batch) => batch,
            Err(err) => {
                error!(operation = "fetch_catalog", error = %err, "catalog fetch failed");
                return Err(err.into());
            }
        };
        let products = batch.products;
        let fetched_products = products.len() + batch.rejected.len();
        info!(
            products = products.len(),
            rejected = batch.rejected.len(),
            "catalog batch fetched"
        );

        let names = normalize_entities(&products);
        let entities = self
            .upserter
            .upsert_all(&names, self.config.entity_concurrency)
            .await;
        info!(
            names = names.len(),
            created = entities.created(),
            failed = entities.failed(),
            "relational entities upserted"
        );

        let outcomes = stream::iter(products)
            .map(|product| async move { self.process_product(&product).await })
            .buffer_unordered(self.config.product_concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut summary = PopulateSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            fetched_products,
            rejected: batch.rejected,
            entities,
            created: 0,
            skipped: 0,
            failed: 0,
            uploads_ok: 0,
            uploads_failed: 0,
            outcomes,
            report_path: None,
        };
        summary.tally();

        if let Some(dir) = &self.config.reports_dir {
            match write_report(dir, &summary).await {
                Ok(path) => summary.report_path = Some(path.display().to_string()),
                Err(err) => warn!(operation = "write_report", error = %err, "report not written"),
            }
        }

        info!(
            created = summary.created,
            skipped = summary.skipped,
            failed = summary.failed,
            uploads_ok = summary.uploads_ok,
            uploads_failed = summary.uploads_failed,
            "populate finished"
        );
        Ok(summary)
    }

    async fn process_product(&self, product: &Product) -> ProductOutcome {
        let title = product.title.clone();
        match self.builder.build(product).await {
            Ok(BuildOutcome::Created(created)) => {
                let uploads = self.uploader.upload_all(product, &created.entry).await;
                ProductOutcome::Created {
                    title,
                    entry_id: created.entry.id,
                    enriched: created.enriched,
                    missing_relations: created.missing_relations,
                    uploads_ok: uploads.uploaded.len(),
                    uploads_failed: uploads.failed,
                }
            }
            Ok(BuildOutcome::Skipped { existing_id }) => ProductOutcome::Skipped { title, existing_id },
            Err(err) => {
                warn!(operation = "build_entry", title = %title, error = %err, "catalog entry not created");
                ProductOutcome::Failed {
                    title,
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Cron job running `populate` with default params, when enabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.populate_cron.clone();
        let pipeline = Arc::clone(self);
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.populate(&PopulateParams::default()).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        created = summary.created,
                        "scheduled populate complete"
                    ),
                    Err(err) => error!(error = %err, "scheduled populate failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

async fn write_report(reports_dir: &Path, summary: &PopulateSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let path = run_dir.join(SUMMARY_FILE);
    let bytes = serde_json::to_vec_pretty(summary).context("serializing populate summary")?;
    fs::write(&path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Builds a pipeline against the REST content store configured in the environment.
pub fn pipeline_from_env() -> Result<PopulatePipeline> {
    let config = SyncConfig::from_env();
    let store = RestContentStore::new(
        config.app_url.clone(),
        config.api_token.clone(),
        Duration::from_secs(config.http_timeout_secs),
    )?;
    PopulatePipeline::new(config, Arc::new(store))
}

pub async fn run_populate_from_env(params: &PopulateParams) -> Result<PopulateSummary> {
    let pipeline = pipeline_from_env()?;
    Ok(pipeline.populate(params).await?)
}
