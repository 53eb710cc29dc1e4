use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::RwLock;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

const CHANGE_CAPACITY: usize = 256;

/// Keys of the underlying key/value space that this crate understands.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum StorageKey {
    UrlHistory,
    HeaderHistory,
    RequestHistory,
    SavedRequests,
    OAuths,
    Settings,
    LegacySettings,
    LegacySavedRequests,
}

impl StorageKey {
    pub const ALL: [StorageKey; 8] = [
        StorageKey::UrlHistory,
        StorageKey::HeaderHistory,
        StorageKey::RequestHistory,
        StorageKey::SavedRequests,
        StorageKey::OAuths,
        StorageKey::Settings,
        StorageKey::LegacySettings,
        StorageKey::LegacySavedRequests,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKey::UrlHistory => "urlHistory",
            StorageKey::HeaderHistory => "headerHistory",
            StorageKey::RequestHistory => "requestHistory",
            StorageKey::SavedRequests => "savedRequests",
            StorageKey::OAuths => "oauths",
            StorageKey::Settings => "settings",
            StorageKey::LegacySettings => "legacySettings",
            StorageKey::LegacySavedRequests => "legacySavedRequests",
        }
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StorageKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| format!("{} is not a supported key.", s))
    }
}

/// A write seen by subscribers: the key and its new raw value, `None` when
/// the key was removed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CollectionChange {
    pub key: String,
    pub new_value: Option<String>,
}

#[derive(Clone, Debug)]
struct SharedChange {
    context: u64,
    change: CollectionChange,
}

/// Synchronous key/value string store shared by every execution context.
///
/// Writes happen under one lock, so a read-modify-write closure passed to
/// [`StorageContext::write`] is atomic. With a database attached the values
/// are persisted behind the writes.
#[derive(Clone, Debug)]
pub struct Storage(Arc<StorageInner>);

#[derive(Debug)]
struct StorageInner {
    items: RwLock<BTreeMap<String, String>>,
    changes: broadcast::Sender<SharedChange>,
    next_context: AtomicU64,
    pool: Option<SqlitePool>,
}

impl Storage {
    pub fn in_memory() -> Self {
        Self::build(BTreeMap::new(), None)
    }

    /// Load every stored item and keep the database in sync with later
    /// writes.
    pub async fn open(database_url: &str) -> Result<Self> {
        let pool = SqlitePool::connect(database_url).await?;
        ensure_schema(&pool).await?;
        let items = load_items(&pool).await?;
        tracing::debug!("loaded {} stored items", items.len());

        let storage = Self::build(items, Some(pool.clone()));
        let persister = Persister {
            storage: storage.downgrade(),
            pool,
            changes: storage.0.changes.subscribe(),
        };
        tokio::spawn(persister.run());

        Ok(storage)
    }

    fn build(items: BTreeMap<String, String>, pool: Option<SqlitePool>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self(Arc::new(StorageInner {
            items: RwLock::new(items),
            changes,
            next_context: AtomicU64::new(1),
            pool,
        }))
    }

    fn downgrade(&self) -> std::sync::Weak<StorageInner> {
        Arc::downgrade(&self.0)
    }

    /// A new execution context, comparable to one open tab.
    pub fn context(&self) -> StorageContext {
        let id = self.0.next_context.fetch_add(1, Ordering::Relaxed);
        let (local, _) = broadcast::channel(CHANGE_CAPACITY);
        StorageContext {
            id,
            storage: self.clone(),
            local: Arc::new(local),
        }
    }

    /// Write every item to the database.
    pub async fn flush(&self) -> Result<()> {
        let Some(pool) = &self.0.pool else {
            return Ok(());
        };
        let snapshot = self.0.items.read().clone();
        write_snapshot(pool, &snapshot).await
    }

    fn snapshot_of(&self, key: &str) -> Option<String> {
        self.0.items.read().get(key).cloned()
    }
}

/// Mutable view of the items handed to a write closure.
pub struct Items<'a> {
    map: &'a mut BTreeMap<String, String>,
    changed: Vec<CollectionChange>,
}

impl<'a> Items<'a> {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.map.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: String) {
        if self.map.get(key) == Some(&value) {
            return;
        }
        self.map.insert(key.to_string(), value.clone());
        self.changed.push(CollectionChange {
            key: key.to_string(),
            new_value: Some(value),
        });
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let removed = self.map.remove(key);
        if removed.is_some() {
            self.changed.push(CollectionChange {
                key: key.to_string(),
                new_value: None,
            });
        }
        removed
    }
}

/// One execution context's handle on the shared storage.
///
/// Subscribers of a context see its own writes and the writes of every other
/// context through the same [`ChangeSubscription`].
#[derive(Clone, Debug)]
pub struct StorageContext {
    id: u64,
    storage: Storage,
    local: Arc<broadcast::Sender<CollectionChange>>,
}

impl StorageContext {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn get_item(&self, key: &str) -> Option<String> {
        self.storage.snapshot_of(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.storage.0.items.read().keys().cloned().collect()
    }

    pub fn set_item(&self, key: &str, value: String) {
        self.write(|items| items.set(key, value));
    }

    pub fn remove_item(&self, key: &str) -> Option<String> {
        self.write(|items| items.remove(key))
    }

    pub fn remove_items(&self, keys: &[String]) {
        self.write(|items| {
            for key in keys {
                items.remove(key);
            }
        });
    }

    /// Run `f` atomically against the items and publish what it changed.
    pub fn write<R>(&self, f: impl FnOnce(&mut Items<'_>) -> R) -> R {
        let (result, changed) = {
            let mut map = self.storage.0.items.write();
            let mut items = Items {
                map: &mut map,
                changed: Vec::new(),
            };
            let result = f(&mut items);
            (result, items.changed)
        };

        for change in changed {
            tracing::trace!("context {} changed {}", self.id, change.key);
            // no receivers is fine
            let _ = self.local.send(change.clone());
            let _ = self.storage.0.changes.send(SharedChange {
                context: self.id,
                change,
            });
        }

        result
    }

    pub fn subscribe(&self) -> ChangeSubscription {
        ChangeSubscription {
            context: self.id,
            local: self.local.subscribe(),
            shared: self.storage.0.changes.subscribe(),
        }
    }
}

pub struct ChangeSubscription {
    context: u64,
    local: broadcast::Receiver<CollectionChange>,
    shared: broadcast::Receiver<SharedChange>,
}

impl ChangeSubscription {
    /// Next change from this context or another one. `None` once the storage
    /// is gone.
    pub async fn recv(&mut self) -> Option<CollectionChange> {
        loop {
            tokio::select! {
                local = self.local.recv() => match local {
                    Ok(change) => return Some(change),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("subscriber lagged by {} local changes", skipped);
                    }
                    Err(RecvError::Closed) => return None,
                },
                shared = self.shared.recv() => match shared {
                    Ok(shared) if shared.context != self.context => return Some(shared.change),
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!("subscriber lagged by {} shared changes", skipped);
                    }
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }

    /// Like [`recv`](Self::recv) without waiting.
    pub fn try_recv(&mut self) -> Option<CollectionChange> {
        loop {
            match self.local.try_recv() {
                Ok(change) => return Some(change),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }

        loop {
            match self.shared.try_recv() {
                Ok(shared) if shared.context != self.context => return Some(shared.change),
                Ok(_) | Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

struct Persister {
    storage: std::sync::Weak<StorageInner>,
    pool: SqlitePool,
    changes: broadcast::Receiver<SharedChange>,
}

impl Persister {
    async fn run(mut self) {
        loop {
            match self.changes.recv().await {
                Ok(shared) => {
                    let key = shared.change.key;
                    // always write the latest value so a late event never
                    // overwrites a newer one
                    let Some(inner) = self.storage.upgrade() else {
                        break;
                    };
                    let value = inner.items.read().get(&key).cloned();
                    drop(inner);

                    if let Err(err) = persist_item(&self.pool, &key, value.as_deref()).await {
                        tracing::error!("Failed to persist {}: {:?}", key, err);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("persister lagged by {} changes, writing snapshot", skipped);
                    let Some(inner) = self.storage.upgrade() else {
                        break;
                    };
                    let snapshot = inner.items.read().clone();
                    drop(inner);

                    if let Err(err) = write_snapshot(&self.pool, &snapshot).await {
                        tracing::error!("Failed to write snapshot: {:?}", err);
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
        tracing::trace!("persister stopped");
    }
}

pub async fn ensure_schema(pool: &SqlitePool) -> Result<()> {
    let mut conn = pool.acquire().await?;

    tracing::trace!("creating schema");
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS storage (
             key TEXT PRIMARY KEY,
             value TEXT NOT NULL,
             updated_at INTEGER NOT NULL DEFAULT 0
        )",
    )
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn load_items(pool: &SqlitePool) -> Result<BTreeMap<String, String>> {
    let mut conn = pool.acquire().await?;

    let rows = sqlx::query("SELECT key, value FROM storage")
        .fetch_all(&mut *conn)
        .await?;

    let mut items = BTreeMap::new();
    for row in rows {
        items.insert(row.try_get("key")?, row.try_get("value")?);
    }

    Ok(items)
}

async fn persist_item(pool: &SqlitePool, key: &str, value: Option<&str>) -> Result<()> {
    let mut conn = pool.acquire().await?;

    match value {
        Some(value) => {
            let query = r#"
                INSERT INTO storage (key, value, updated_at)
                VALUES (?, ?, strftime('%s','now'))
                ON CONFLICT(key) DO UPDATE SET
                    value = excluded.value,
                    updated_at = excluded.updated_at
            "#;
            sqlx::query(query)
                .bind(key)
                .bind(value)
                .execute(&mut *conn)
                .await?;
        }
        None => {
            sqlx::query("DELETE FROM storage WHERE key = ?")
                .bind(key)
                .execute(&mut *conn)
                .await?;
        }
    }

    Ok(())
}

async fn write_snapshot(pool: &SqlitePool, snapshot: &BTreeMap<String, String>) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("DELETE FROM storage").execute(&mut *tx).await?;
    for (key, value) in snapshot {
        sqlx::query(
            "INSERT INTO storage (key, value, updated_at) VALUES (?, ?, strftime('%s','now'))",
        )
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}
