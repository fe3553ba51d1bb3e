//! Caché de grafos: una entrada por `file_id`, con `share_id` como búsqueda
//! secundaria. Las entradas caducadas se comportan como ausentes.

use std::{collections::HashMap, sync::Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{CacheEntry, CacheStatus, ShareUpsert};

#[async_trait]
pub trait GraphCache: Send + Sync {
    /// Sustituye por completo la entrada de `entry.file_id`.
    async fn put_entry(&self, entry: &CacheEntry) -> Result<()>;

    /// Inserta o actualiza la entrada del enlace compartido en una sola
    /// operación. Sobre una entrada viva conserva `created_at` y las visitas;
    /// en cualquier caso la deja como `completed`.
    async fn upsert_share(&self, share: &ShareUpsert, now: i64) -> Result<CacheEntry>;

    /// Busca por `file_id` o `share_id`, suma una visita de forma atómica y
    /// devuelve la entrada ya incrementada.
    async fn record_view(&self, id: &str, now: i64) -> Result<Option<CacheEntry>>;

    /// Igual que `record_view` pero sin contar la visita.
    async fn get_entry(&self, id: &str, now: i64) -> Result<Option<CacheEntry>>;

    /// Borra las entradas caducadas y devuelve cuántas había.
    async fn purge_expired(&self, now: i64) -> Result<u64>;
}

/// Implementación en memoria, para desarrollo y tests.
#[derive(Default)]
pub struct MemoryGraphCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryGraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, CacheEntry>>> {
        self.entries
            .lock()
            .map_err(|_| anyhow!("La caché en memoria quedó envenenada"))
    }
}

fn find_live<'a>(
    entries: &'a mut HashMap<String, CacheEntry>,
    id: &str,
    now: i64,
) -> Option<&'a mut CacheEntry> {
    entries
        .values_mut()
        .find(|e| (e.file_id == id || e.share_id == id) && !e.is_expired(now))
}

#[async_trait]
impl GraphCache for MemoryGraphCache {
    async fn put_entry(&self, entry: &CacheEntry) -> Result<()> {
        self.lock()?.insert(entry.file_id.clone(), entry.clone());
        Ok(())
    }

    async fn upsert_share(&self, share: &ShareUpsert, now: i64) -> Result<CacheEntry> {
        let mut entries = self.lock()?;
        let entry = entries
            .entry(share.file_id.clone())
            .and_modify(|e| {
                if e.is_expired(now) {
                    e.created_at = now;
                    e.view_count = 0;
                }
            })
            .or_insert_with(|| CacheEntry {
                file_id: share.file_id.clone(),
                share_id: share.share_id.clone(),
                status: CacheStatus::Completed,
                graph_data: share.graph_data.clone(),
                error: None,
                created_at: now,
                expires_at: share.expires_at,
                view_count: 0,
            });
        entry.share_id = share.share_id.clone();
        entry.graph_data = share.graph_data.clone();
        entry.expires_at = share.expires_at;
        entry.status = CacheStatus::Completed;
        entry.error = None;
        Ok(entry.clone())
    }

    async fn record_view(&self, id: &str, now: i64) -> Result<Option<CacheEntry>> {
        let mut entries = self.lock()?;
        Ok(find_live(&mut entries, id, now).map(|e| {
            e.view_count += 1;
            e.clone()
        }))
    }

    async fn get_entry(&self, id: &str, now: i64) -> Result<Option<CacheEntry>> {
        let mut entries = self.lock()?;
        Ok(find_live(&mut entries, id, now).map(|e| e.clone()))
    }

    async fn purge_expired(&self, now: i64) -> Result<u64> {
        let mut entries = self.lock()?;
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        Ok((before - entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GraphPayload, NodeTuple};

    fn payload(id: &str) -> GraphPayload {
        GraphPayload {
            nodes: vec![NodeTuple(id.into(), "Person".into())],
            relationships: vec![],
        }
    }

    fn share(file_id: &str, node: &str, now: i64) -> ShareUpsert {
        ShareUpsert {
            file_id: file_id.into(),
            share_id: uuid::Uuid::new_v4().to_string(),
            graph_data: payload(node),
            expires_at: now + 100,
        }
    }

    #[tokio::test]
    async fn upsert_share_keeps_a_single_entry_with_latest_payload() {
        let cache = MemoryGraphCache::new();
        let first = cache.upsert_share(&share("f1", "Alice", 10), 10).await.unwrap();
        cache.record_view("f1", 11).await.unwrap();
        let second = cache.upsert_share(&share("f1", "Bob", 20), 20).await.unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(second.graph_data, payload("Bob"));
        assert_ne!(first.share_id, second.share_id);
        assert_eq!(second.created_at, 10);
        assert_eq!(second.view_count, 1);
    }

    #[tokio::test]
    async fn upsert_share_overrides_error_status() {
        let cache = MemoryGraphCache::new();
        cache.put_entry(&CacheEntry::failed("f1", "pdf roto", 0)).await.unwrap();
        let entry = cache.upsert_share(&share("f1", "Alice", 5), 5).await.unwrap();
        assert_eq!(entry.status, CacheStatus::Completed);
        assert!(entry.error.is_none());
    }

    #[tokio::test]
    async fn record_view_resolves_file_and_share_ids() {
        let cache = MemoryGraphCache::new();
        let entry = cache.upsert_share(&share("f1", "Alice", 0), 0).await.unwrap();

        let by_share = cache.record_view(&entry.share_id, 1).await.unwrap().unwrap();
        let by_file = cache.record_view("f1", 2).await.unwrap().unwrap();
        assert_eq!(by_share.view_count, 1);
        assert_eq!(by_file.view_count, 2);
        assert_eq!(cache.get_entry("f1", 3).await.unwrap().unwrap().view_count, 2);
        assert!(cache.record_view("unknown", 3).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_entries_are_invisible_and_purged() {
        let cache = MemoryGraphCache::new();
        cache.upsert_share(&share("f1", "Alice", 0), 0).await.unwrap();
        assert!(cache.record_view("f1", 100).await.unwrap().is_none());

        let revived = cache.upsert_share(&share("f1", "Bob", 150), 150).await.unwrap();
        assert_eq!(revived.created_at, 150);
        assert_eq!(revived.view_count, 0);

        assert_eq!(cache.purge_expired(1_000).await.unwrap(), 1);
        assert_eq!(cache.len(), 0);
    }
}
