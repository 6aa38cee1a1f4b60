//! Get-or-create resolution of relational entities.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::stream::{self, StreamExt};
use gcat_adapters::EntityNames;
use gcat_core::{strict_slugify, EntityKind, RelationalEntity};
use gcat_storage::{ContentStore, StoreError, StoredRecord};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Bounds a content-store call by `deadline`.
pub(crate) async fn store_call<T, F>(deadline: Duration, call: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| StoreError::Timeout(deadline))?
}

type SlotKey = (EntityKind, String);

/// Serializes work per `(kind, name)` inside this process.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    slots: StdMutex<HashMap<SlotKey, Arc<Mutex<()>>>>,
}

/// Drops the map entry once no other task holds the slot, even when the
/// owning future is cancelled mid-work.
struct SlotRelease<'a> {
    locks: &'a KeyedLocks,
    key: SlotKey,
    slot: Arc<Mutex<()>>,
}

impl Drop for SlotRelease<'_> {
    fn drop(&mut self) {
        let mut slots = self.locks.slots();
        // The map and this task are the only holders.
        let idle = Arc::strong_count(&self.slot) <= 2;
        if idle && slots.get(&self.key).is_some_and(|s| Arc::ptr_eq(s, &self.slot)) {
            slots.remove(&self.key);
        }
    }
}

impl KeyedLocks {
    fn slots(&self) -> MutexGuard<'_, HashMap<SlotKey, Arc<Mutex<()>>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn run<F, T>(&self, kind: EntityKind, name: &str, work: F) -> T
    where
        F: Future<Output = T>,
    {
        let key = (kind, name.to_string());
        let slot = self.slots().entry(key.clone()).or_default().clone();
        let release = SlotRelease {
            locks: self,
            key,
            slot,
        };

        let _guard = release.slot.lock().await;
        work.await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.slots().len()
    }
}

#[derive(Debug, Error)]
pub enum UpsertError {
    #[error("lookup of {kind} {name:?} failed: {source}")]
    Lookup {
        kind: EntityKind,
        name: String,
        source: StoreError,
    },
    #[error("create of {kind} {name:?} failed: {source}")]
    Create {
        kind: EntityKind,
        name: String,
        source: StoreError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    Existing(RelationalEntity),
    Created(RelationalEntity),
}

impl Resolved {
    pub fn entity(&self) -> &RelationalEntity {
        match self {
            Resolved::Existing(entity) | Resolved::Created(entity) => entity,
        }
    }

    pub fn was_created(&self) -> bool {
        matches!(self, Resolved::Created(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindTally {
    pub created: usize,
    pub existing: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityTally {
    pub by_kind: BTreeMap<EntityKind, KindTally>,
}

impl EntityTally {
    fn record(&mut self, kind: EntityKind, result: &Result<Resolved, UpsertError>) {
        let slot = self.by_kind.entry(kind).or_default();
        match result {
            Ok(Resolved::Created(_)) => slot.created += 1,
            Ok(Resolved::Existing(_)) => slot.existing += 1,
            Err(_) => slot.failed += 1,
        }
    }

    pub fn kind(&self, kind: EntityKind) -> KindTally {
        self.by_kind.get(&kind).copied().unwrap_or_default()
    }

    pub fn created(&self) -> usize {
        self.by_kind.values().map(|t| t.created).sum()
    }

    pub fn failed(&self) -> usize {
        self.by_kind.values().map(|t| t.failed).sum()
    }
}

pub struct IdempotentUpserter {
    store: Arc<dyn ContentStore>,
    locks: KeyedLocks,
    store_timeout: Duration,
}

impl IdempotentUpserter {
    pub fn new(store: Arc<dyn ContentStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            locks: KeyedLocks::default(),
            store_timeout,
        }
    }

    /// Returns the entity named `name`, creating it with a derived slug if absent.
    /// Existing entities are returned untouched.
    pub async fn resolve(&self, kind: EntityKind, name: &str) -> Result<Resolved, UpsertError> {
        self.locks
            .run(kind, name, self.resolve_locked(kind, name))
            .await
    }

    async fn lookup(&self, kind: EntityKind, name: &str) -> Result<Option<StoredRecord>, UpsertError> {
        store_call(self.store_timeout, self.store.find_by_name(kind, name))
            .await
            .map_err(|source| UpsertError::Lookup {
                kind,
                name: name.to_string(),
                source,
            })
    }

    async fn resolve_locked(&self, kind: EntityKind, name: &str) -> Result<Resolved, UpsertError> {
        if let Some(found) = self.lookup(kind, name).await? {
            return Ok(Resolved::Existing(found.into_entity(kind)));
        }

        let data = json!({ "name": name, "slug": strict_slugify(name) });
        match store_call(self.store_timeout, self.store.create(kind, data)).await {
            Ok(record) => {
                info!(%kind, name, id = record.id, slug = %record.slug, "created relational entity");
                Ok(Resolved::Created(record.into_entity(kind)))
            }
            Err(StoreError::Conflict { .. }) => {
                debug!(%kind, name, "create conflicted; reading existing entity");
                match self.lookup(kind, name).await? {
                    Some(found) => Ok(Resolved::Existing(found.into_entity(kind))),
                    None => Err(UpsertError::Create {
                        kind,
                        name: name.to_string(),
                        source: StoreError::Conflict {
                            kind,
                            name: name.to_string(),
                        },
                    }),
                }
            }
            Err(source) => Err(UpsertError::Create {
                kind,
                name: name.to_string(),
                source,
            }),
        }
    }

    /// Resolves every name of a batch, at most `concurrency` at a time. Failures are logged and counted.
    pub async fn upsert_all(&self, names: &EntityNames, concurrency: usize) -> EntityTally {
        let pending = names
            .iter()
            .map(|(kind, name)| (kind, name.to_string()))
            .collect::<Vec<_>>();
        let results = stream::iter(pending)
            .map(|(kind, name)| async move {
                let result = self.resolve(kind, &name).await;
                (kind, result)
            })
            .buffer_unordered(concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut tally = EntityTally::default();
        for (kind, result) in &results {
            if let Err(err) = result {
                warn!(operation = "upsert_entity", %kind, error = %err, "relational upsert failed");
            }
            tally.record(*kind, result);
        }
        tally
    }
}
