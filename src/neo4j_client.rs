//! Caché de grafos sobre Neo4j: un nodo `:GraphCache` por fichero.
//!
//! El grafo aplanado se guarda como JSON en `graph_data`. Neo4j no caduca
//! nodos por sí mismo, así que las lecturas filtran por `expires_at` y una
//! tarea periódica borra los caducados.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use neo4rs::{query, Graph, Query, Row};
use tracing::info;
use url::Url;

use crate::{
    cache::GraphCache,
    config::Neo4jConfig,
    models::{CacheEntry, CacheStatus, ShareUpsert},
};

pub async fn connect_from_config(cfg: &Neo4jConfig) -> Result<Graph> {
    let url = Url::parse(&cfg.uri)?;
    let host = url.host_str().unwrap_or("localhost");
    let port = url.port().unwrap_or(7687);
    let addr = format!("{host}:{port}");

    info!("Conectando a Neo4j en {addr}...");
    let graph = Graph::new(&addr, &cfg.user, &cfg.password).await?;
    info!("Conexión a Neo4j OK");
    Ok(graph)
}

/// Crea los constraints e índices de `:GraphCache`.
pub async fn ensure_schema(graph: &Graph) -> Result<()> {
    let statements = [
        "CREATE CONSTRAINT graph_cache_file_id IF NOT EXISTS
         FOR (g:GraphCache)
         REQUIRE g.file_id IS UNIQUE",
        "CREATE CONSTRAINT graph_cache_share_id IF NOT EXISTS
         FOR (g:GraphCache)
         REQUIRE g.share_id IS UNIQUE",
        "CREATE INDEX graph_cache_expires_at IF NOT EXISTS
         FOR (g:GraphCache)
         ON (g.expires_at)",
    ];

    for stmt in statements {
        graph.run(query(stmt)).await?;
    }

    info!("Esquema de Neo4j asegurado (constraints de :GraphCache creados).");
    Ok(())
}

const RETURN_ENTRY: &str = "RETURN g.file_id AS file_id, g.share_id AS share_id, g.status AS status,
        g.graph_data AS graph_data, g.error AS error, g.created_at AS created_at,
        g.expires_at AS expires_at, g.view_count AS view_count";

pub struct Neo4jGraphCache {
    graph: Graph,
}

impl Neo4jGraphCache {
    pub fn new(graph: Graph) -> Self {
        Self { graph }
    }

    async fn fetch_one(&self, q: Query) -> Result<Option<CacheEntry>> {
        let mut cursor = self.graph.execute(q).await?;
        match cursor.next().await? {
            Some(row) => Ok(Some(entry_from_row(&row)?)),
            None => Ok(None),
        }
    }
}

fn entry_from_row(row: &Row) -> Result<CacheEntry> {
    let file_id: String = row
        .get("file_id")
        .ok_or_else(|| anyhow!("Falta campo 'file_id' en resultado de Neo4j"))?;
    let status_raw: String = row.get("status").unwrap_or_else(|| "completed".to_string());
    let status = CacheStatus::parse(&status_raw)
        .ok_or_else(|| anyhow!("Estado desconocido '{status_raw}' para {file_id}"))?;
    let graph_json: String = row.get("graph_data").unwrap_or_else(|| "{}".to_string());
    let graph_data = serde_json::from_str(&graph_json)
        .with_context(|| format!("graph_data corrupto para {file_id}"))?;
    let error: Option<String> = row.get::<String>("error").filter(|e| !e.is_empty());

    Ok(CacheEntry {
        share_id: row.get("share_id").unwrap_or_default(),
        status,
        graph_data,
        error,
        created_at: row.get("created_at").unwrap_or_default(),
        expires_at: row.get("expires_at").unwrap_or_default(),
        view_count: row.get("view_count").unwrap_or_default(),
        file_id,
    })
}

#[async_trait]
impl GraphCache for Neo4jGraphCache {
    async fn put_entry(&self, entry: &CacheEntry) -> Result<()> {
        let graph_json = serde_json::to_string(&entry.graph_data)?;
        self.graph
            .run(
                query(
                    "MERGE (g:GraphCache {file_id: $file_id})
                     SET g.share_id = $share_id, g.status = $status, g.graph_data = $graph_data,
                         g.error = $error, g.created_at = $created_at, g.expires_at = $expires_at,
                         g.view_count = $view_count",
                )
                .param("file_id", entry.file_id.clone())
                .param("share_id", entry.share_id.clone())
                .param("status", entry.status.as_str())
                .param("graph_data", graph_json)
                .param("error", entry.error.clone().unwrap_or_default())
                .param("created_at", entry.created_at)
                .param("expires_at", entry.expires_at)
                .param("view_count", entry.view_count),
            )
            .await?;
        Ok(())
    }

    async fn upsert_share(&self, share: &ShareUpsert, now: i64) -> Result<CacheEntry> {
        let graph_json = serde_json::to_string(&share.graph_data)?;
        let cypher = format!(
            "MERGE (g:GraphCache {{file_id: $file_id}})
             ON CREATE SET g.created_at = $now, g.view_count = 0
             ON MATCH SET g.created_at = CASE WHEN g.expires_at <= $now THEN $now ELSE g.created_at END,
                          g.view_count = CASE WHEN g.expires_at <= $now THEN 0 ELSE g.view_count END
             SET g.share_id = $share_id, g.graph_data = $graph_data, g.expires_at = $expires_at,
                 g.status = 'completed', g.error = ''
             {RETURN_ENTRY}"
        );
        self.fetch_one(
            query(&cypher)
                .param("file_id", share.file_id.clone())
                .param("share_id", share.share_id.clone())
                .param("graph_data", graph_json)
                .param("expires_at", share.expires_at)
                .param("now", now),
        )
        .await?
        .ok_or_else(|| anyhow!("Neo4j no devolvió la entrada de {}", share.file_id))
    }

    async fn record_view(&self, id: &str, now: i64) -> Result<Option<CacheEntry>> {
        let cypher = format!(
            "MATCH (g:GraphCache)
             WHERE (g.file_id = $id OR g.share_id = $id) AND g.expires_at > $now
             WITH g LIMIT 1
             SET g.view_count = coalesce(g.view_count, 0) + 1
             {RETURN_ENTRY}"
        );
        self.fetch_one(query(&cypher).param("id", id.to_string()).param("now", now))
            .await
    }

    async fn get_entry(&self, id: &str, now: i64) -> Result<Option<CacheEntry>> {
        let cypher = format!(
            "MATCH (g:GraphCache)
             WHERE (g.file_id = $id OR g.share_id = $id) AND g.expires_at > $now
             WITH g LIMIT 1
             {RETURN_ENTRY}"
        );
        self.fetch_one(query(&cypher).param("id", id.to_string()).param("now", now))
            .await
    }

    async fn purge_expired(&self, now: i64) -> Result<u64> {
        let mut cursor = self
            .graph
            .execute(
                query(
                    "MATCH (g:GraphCache) WHERE g.expires_at <= $now
                     DETACH DELETE g
                     RETURN count(*) AS removed",
                )
                .param("now", now),
            )
            .await?;
        let removed: i64 = match cursor.next().await? {
            Some(row) => row.get("removed").unwrap_or_default(),
            None => 0,
        };
        Ok(removed.max(0) as u64)
    }
}
