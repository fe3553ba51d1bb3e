//! Transformación de texto en grafo mediante un LLM (Rig + OpenAI).
//!
//! El cliente se construye una única vez, de forma perezosa: la primera
//! llamada obtiene la clave del almacén de secretos y la deja cacheada
//! durante toda la vida del proceso.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rig::completion::Prompt;
use rig::providers::openai;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::secrets::{api_key_from_secret, SecretStore};

/// Nodo tal y como lo devuelve el LLM.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ExtractedNode {
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ExtractedRelationship {
    pub source: String,
    #[serde(default)]
    pub source_type: Option<String>,
    pub target: String,
    #[serde(default)]
    pub target_type: Option<String>,
    #[serde(rename = "type")]
    pub rel_type: String,
    #[serde(default)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

/// Grafo de un único chunk.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct GraphDocument {
    #[serde(default)]
    pub nodes: Vec<ExtractedNode>,
    #[serde(default)]
    pub relationships: Vec<ExtractedRelationship>,
}

/// Convierte un trozo de texto en un grafo tipado.
#[async_trait]
pub trait GraphTransformer: Send + Sync {
    async fn convert(&self, chunk: &str) -> Result<GraphDocument>;
}

const EXTRACTION_PROMPT: &str = r#"
You are a top-tier algorithm designed for extracting information in structured formats to build a knowledge graph.
- Nodes represent entities and concepts. Use basic, elementary types for node labels (e.g. "Person", "Organization", "Location", "Concept").
- Node ids must be human-readable names found in the text, never integers.
- Relationships connect two nodes. Relationship types must be concise UPPER_SNAKE_CASE verbs (e.g. "WORKS_AT", "PART_OF").
- Keep entities consistent: if an entity is mentioned several times with different names, always use the most complete identifier.

The output MUST be a single valid JSON object with two keys, "nodes" and "relationships":
- "nodes": a list of objects with "id", "type" and an optional "properties" object.
- "relationships": a list of objects with "source", "source_type", "target", "target_type", "type" and an optional "properties" object.

If nothing is found, return empty lists. Do not add explanations, only the JSON.
"#;

/// Transformador respaldado por un modelo de chat de OpenAI.
pub struct LlmGraphTransformer {
    model: String,
    secret_name: String,
    secrets: Arc<dyn SecretStore>,
    client: OnceCell<openai::Client>,
}

impl LlmGraphTransformer {
    pub fn new(model: impl Into<String>, secret_name: impl Into<String>, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            model: model.into(),
            secret_name: secret_name.into(),
            secrets,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<&openai::Client> {
        self.client
            .get_or_try_init(|| async {
                let secret = self
                    .secrets
                    .get_secret(&self.secret_name)
                    .await
                    .context("Error obteniendo la credencial del LLM")?;
                let api_key = api_key_from_secret(&secret)?;
                info!("Cliente LLM inicializado (modelo {}).", self.model);
                Ok::<_, anyhow::Error>(openai::Client::new(&api_key))
            })
            .await
    }
}

#[async_trait]
impl GraphTransformer for LlmGraphTransformer {
    async fn convert(&self, chunk: &str) -> Result<GraphDocument> {
        use rig::client::CompletionClient as _;

        let client = self.client().await?;
        let model_name = if self.model.is_empty() { "gpt-4-turbo" } else { self.model.as_str() };

        let agent = client
            .agent(model_name)
            .preamble(EXTRACTION_PROMPT)
            .temperature(0.0)
            .build();

        let response = agent
            .prompt(chunk)
            .await
            .context("Error invocando al LLM")?;

        Ok(parse_graph_response(&response))
    }
}

/// Limpia la respuesta del LLM y la interpreta como `GraphDocument`.
/// Una respuesta ilegible se registra y cuenta como grafo vacío.
pub fn parse_graph_response(response: &str) -> GraphDocument {
    let json_response = response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    match serde_json::from_str::<GraphDocument>(json_response) {
        Ok(doc) => doc,
        Err(e) => {
            warn!(
                "No se pudo parsear el JSON del grafo para un chunk. Error: {}. Respuesta LLM: '{}'",
                e, response
            );
            GraphDocument::default()
        }
    }
}
