//! Modelos de dominio (ficheros subidos, grafo aplanado y entradas de la caché).

use serde::{Deserialize, Serialize};

/// Días de vida de una entrada completada.
pub const COMPLETED_TTL_DAYS: i64 = 30;
/// Días de vida de una entrada con error.
pub const ERROR_TTL_DAYS: i64 = 7;

/// Nodo aplanado: `(id, tipo)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeTuple(pub String, pub String);

/// Relación aplanada: `(origen, destino, tipo)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationshipTuple(pub String, pub String, pub String);

/// Grafo de conocimiento tal y como se guarda y se devuelve al cliente.
/// Se serializa como listas de tuplas: `{"nodes":[["Alice","Person"]], ...}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphPayload {
    #[serde(default)]
    pub nodes: Vec<NodeTuple>,
    #[serde(default)]
    pub relationships: Vec<RelationshipTuple>,
}

impl GraphPayload {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.relationships.is_empty()
    }
}

/// Metadatos de un fichero subido. El contenido y el texto extraído viven en
/// el almacenamiento de objetos.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub file_id: String,
    pub original_filename: String,
    pub content_type: String,
    pub text_length: usize,
}

impl FileRecord {
    pub fn original_key(&self) -> String {
        format!("uploads/{}/original/{}", self.file_id, self.original_filename)
    }

    pub fn text_key(&self) -> String {
        extracted_text_key(&self.file_id)
    }
}

pub fn extracted_text_key(file_id: &str) -> String {
    format!("uploads/{file_id}/extracted.txt")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Completed,
    Error,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

/// Entrada de la caché de grafos, indexada por `file_id` y con `share_id`
/// como búsqueda secundaria. Los instantes son segundos Unix.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub file_id: String,
    pub share_id: String,
    pub status: CacheStatus,
    pub graph_data: GraphPayload,
    pub error: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
    pub view_count: i64,
}

impl CacheEntry {
    pub fn completed(file_id: &str, graph_data: GraphPayload, now: i64) -> Self {
        Self {
            file_id: file_id.to_string(),
            share_id: uuid::Uuid::new_v4().to_string(),
            status: CacheStatus::Completed,
            graph_data,
            error: None,
            created_at: now,
            expires_at: now + COMPLETED_TTL_DAYS * 24 * 60 * 60,
            view_count: 0,
        }
    }

    pub fn failed(file_id: &str, error: impl Into<String>, now: i64) -> Self {
        Self {
            file_id: file_id.to_string(),
            share_id: uuid::Uuid::new_v4().to_string(),
            status: CacheStatus::Error,
            graph_data: GraphPayload::default(),
            error: Some(error.into()),
            created_at: now,
            expires_at: now + ERROR_TTL_DAYS * 24 * 60 * 60,
            view_count: 0,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.expires_at <= now
    }
}

/// Datos que el enlace compartido escribe sobre una entrada (nueva o existente).
#[derive(Debug, Clone)]
pub struct ShareUpsert {
    pub file_id: String,
    pub share_id: String,
    pub graph_data: GraphPayload,
    pub expires_at: i64,
}

/// Respuesta de la consulta de un grafo.
#[derive(Debug, Clone, Serialize)]
pub struct GraphView {
    pub status: CacheStatus,
    pub graph_data: GraphPayload,
    pub file_id: String,
    pub created_at: i64,
    pub view_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<CacheEntry> for GraphView {
    fn from(entry: CacheEntry) -> Self {
        Self {
            status: entry.status,
            graph_data: entry.graph_data,
            file_id: entry.file_id,
            created_at: entry.created_at,
            view_count: entry.view_count,
            error: entry.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graph_payload_serializes_as_tuple_lists() {
        let payload = GraphPayload {
            nodes: vec![NodeTuple("Alice".into(), "Person".into())],
            relationships: vec![RelationshipTuple(
                "Alice".into(),
                "Acme".into(),
                "WORKS_AT".into(),
            )],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "nodes": [["Alice", "Person"]],
                "relationships": [["Alice", "Acme", "WORKS_AT"]]
            })
        );
    }

    #[test]
    fn entry_lifetimes_depend_on_status() {
        let ok = CacheEntry::completed("f1", GraphPayload::default(), 1_000);
        let err = CacheEntry::failed("f1", "boom", 1_000);
        assert_eq!(ok.expires_at - 1_000, 30 * 86_400);
        assert_eq!(err.expires_at - 1_000, 7 * 86_400);
        assert_ne!(ok.share_id, err.share_id);
        assert!(err.is_expired(1_000 + 7 * 86_400));
    }
}
