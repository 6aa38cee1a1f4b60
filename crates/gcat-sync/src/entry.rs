//! Catalog entry assembly and creation.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use gcat_adapters::EnrichmentSource;
use gcat_core::{
    normalize_entity_name, CatalogEntry, CatalogEntryDraft, EntityKind, Enrichment, Product,
};
use gcat_storage::{ContentStore, StoreError};
use thiserror::Error;
use tracing::{info, warn};

use crate::upsert::{store_call, IdempotentUpserter, KeyedLocks};

#[derive(Debug, Error)]
pub enum EntryError {
    #[error("product has no title")]
    MissingTitle,
    #[error("lookup of catalog entry {title:?} failed: {source}")]
    Lookup { title: String, source: StoreError },
    #[error("encoding catalog entry {title:?} failed: {source}")]
    Encode {
        title: String,
        source: serde_json::Error,
    },
    #[error("create of catalog entry {title:?} failed: {source}")]
    Create { title: String, source: StoreError },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedEntry {
    pub entry: CatalogEntry,
    pub enriched: bool,
    /// `kind:name` of every relation that could not be resolved.
    pub missing_relations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuildOutcome {
    Created(CreatedEntry),
    Skipped { existing_id: u64 },
}

#[derive(Debug, Default)]
struct ResolvedRelations {
    ids: Vec<(EntityKind, Vec<u64>)>,
    missing: Vec<String>,
}

pub struct CatalogEntryBuilder {
    store: Arc<dyn ContentStore>,
    upserter: Arc<IdempotentUpserter>,
    enricher: Arc<dyn EnrichmentSource>,
    titles: KeyedLocks,
    store_timeout: Duration,
}

impl CatalogEntryBuilder {
    pub fn new(
        store: Arc<dyn ContentStore>,
        upserter: Arc<IdempotentUpserter>,
        enricher: Arc<dyn EnrichmentSource>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            upserter,
            enricher,
            titles: KeyedLocks::default(),
            store_timeout,
        }
    }

    /// Creates the entry for `product` unless one with the same title already exists.
    pub async fn build(&self, product: &Product) -> Result<BuildOutcome, EntryError> {
        if product.title.trim().is_empty() {
            return Err(EntryError::MissingTitle);
        }
        self.titles
            .run(EntityKind::Game, &product.title, self.build_locked(product))
            .await
    }

    async fn build_locked(&self, product: &Product) -> Result<BuildOutcome, EntryError> {
        let title = product.title.as_str();
        let existing = store_call(
            self.store_timeout,
            self.store.find_by_name(EntityKind::Game, title),
        )
        .await
        .map_err(|source| EntryError::Lookup {
            title: title.to_string(),
            source,
        })?;
        if let Some(record) = existing {
            info!(title, id = record.id, "catalog entry exists; skipping");
            return Ok(BuildOutcome::Skipped {
                existing_id: record.id,
            });
        }

        info!(title, "creating catalog entry");
        let (relations, enrichment) =
            tokio::join!(self.resolve_relations(product), self.enrich(product));

        let release_date = product.parsed_release_date();
        if release_date.is_none() {
            warn!(title, raw = ?product.release_date, "release date missing or unparseable");
        }

        let mut draft = CatalogEntryDraft {
            name: product.title.clone(),
            slug: product.slug.clone(),
            price: product.price_or_zero(),
            release_date,
            developers: Vec::new(),
            publishers: Vec::new(),
            categories: Vec::new(),
            platforms: Vec::new(),
            description: None,
            short_description: None,
            rating: None,
            published_at: Utc::now(),
        };
        for (kind, ids) in relations.ids {
            if let Some(slot) = draft.relation_ids_mut(kind) {
                *slot = ids;
            }
        }
        let enriched = enrichment.is_some();
        if let Some(enrichment) = enrichment {
            draft.apply_enrichment(enrichment);
        }

        let data = serde_json::to_value(&draft).map_err(|source| EntryError::Encode {
            title: title.to_string(),
            source,
        })?;
        let record = store_call(self.store_timeout, self.store.create(EntityKind::Game, data))
            .await
            .map_err(|source| EntryError::Create {
                title: title.to_string(),
                source,
            })?;
        info!(title, id = record.id, enriched, "catalog entry created");

        Ok(BuildOutcome::Created(CreatedEntry {
            entry: draft.into_entry(record.id),
            enriched,
            missing_relations: relations.missing,
        }))
    }

    async fn resolve_relations(&self, product: &Product) -> ResolvedRelations {
        let per_kind = join_all(
            EntityKind::RELATIONAL
                .into_iter()
                .map(|kind| self.resolve_kind(product, kind)),
        )
        .await;

        let mut resolved = ResolvedRelations::default();
        for (kind, ids, missing) in per_kind {
            resolved.ids.push((kind, ids));
            resolved.missing.extend(missing);
        }
        resolved
    }

    async fn resolve_kind(
        &self,
        product: &Product,
        kind: EntityKind,
    ) -> (EntityKind, Vec<u64>, Vec<String>) {
        let mut names: Vec<String> = Vec::new();
        for raw in product.relation_names(kind) {
            if let Some(name) = normalize_entity_name(raw) {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }

        let results = join_all(names.iter().map(|name| self.upserter.resolve(kind, name))).await;

        let mut ids = Vec::new();
        let mut missing = Vec::new();
        for (name, result) in names.iter().zip(results) {
            match result {
                Ok(resolved) => {
                    let id = resolved.entity().id;
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
                Err(err) => {
                    warn!(
                        operation = "resolve_relation",
                        title = %product.title,
                        %kind,
                        error = %err,
                        "relation dropped from entry"
                    );
                    missing.push(format!("{kind}:{name}"));
                }
            }
        }
        (kind, ids, missing)
    }

    async fn enrich(&self, product: &Product) -> Option<Enrichment> {
        match self.enricher.enrich(&product.slug).await {
            Ok(enrichment) => Some(enrichment),
            Err(err) => {
                warn!(
                    operation = "enrich",
                    title = %product.title,
                    slug = %product.slug,
                    error = %err,
                    "enrichment unavailable; creating entry without it"
                );
                None
            }
        }
    }
}
