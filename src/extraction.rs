//! Texto → chunks solapados → grafo por chunk → listas planas de tuplas.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::{stream, StreamExt, TryStreamExt};
use text_splitter::{Characters, ChunkConfig, TextSplitter};
use tracing::{debug, info};

use crate::{
    llm::{GraphDocument, GraphTransformer},
    models::{GraphPayload, NodeTuple, RelationshipTuple},
};

pub const DEFAULT_CHUNK_SIZE: usize = 2000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Extractor de grafos de conocimiento a partir de texto libre.
#[derive(Clone)]
pub struct KnowledgeGraphExtractor {
    transformer: Arc<dyn GraphTransformer>,
    chunk_size: usize,
    chunk_overlap: usize,
    concurrency: usize,
}

impl KnowledgeGraphExtractor {
    pub fn new(
        transformer: Arc<dyn GraphTransformer>,
        chunk_size: usize,
        chunk_overlap: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            transformer,
            chunk_size,
            chunk_overlap,
            concurrency: concurrency.max(1),
        }
    }

    /// Divide el texto respetando límites de párrafo, frase y palabra.
    pub fn split(&self, text: &str) -> Result<Vec<String>> {
        let config = ChunkConfig::new(self.chunk_size)
            .with_sizer(Characters)
            .with_trim(true)
            .with_overlap(self.chunk_overlap)
            .context("Configuración de chunking inválida")?;
        let splitter = TextSplitter::new(config);
        Ok(splitter.chunks(text).map(|s: &str| s.to_string()).collect())
    }

    /// Extrae el grafo completo. Los chunks pueden procesarse en paralelo,
    /// pero el resultado siempre se concatena en el orden de los chunks.
    pub async fn extract(&self, text: &str) -> Result<GraphPayload> {
        let chunks = self.split(text)?;
        let total = chunks.len();
        info!("Extrayendo grafo de {} caracteres en {} chunks.", text.chars().count(), total);

        let documents: Vec<GraphDocument> = stream::iter(chunks.into_iter().enumerate())
            .map(|(i, chunk)| {
                let transformer = self.transformer.clone();
                async move {
                    debug!("Chunk {}/{}: {} caracteres", i + 1, total, chunk.chars().count());
                    transformer
                        .convert(&chunk)
                        .await
                        .with_context(|| format!("Error extrayendo el grafo del chunk {}/{}", i + 1, total))
                }
            })
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        Ok(flatten(documents))
    }
}

/// Aplana los grafos de cada chunk a tuplas, descartando propiedades.
/// Los duplicados entre chunks se conservan.
pub fn flatten(documents: Vec<GraphDocument>) -> GraphPayload {
    let mut payload = GraphPayload::default();
    for doc in documents {
        payload
            .nodes
            .extend(doc.nodes.into_iter().map(|n| NodeTuple(n.id, n.node_type)));
        payload.relationships.extend(
            doc.relationships
                .into_iter()
                .map(|r| RelationshipTuple(r.source, r.target, r.rel_type)),
        );
    }
    payload
}
