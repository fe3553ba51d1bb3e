use std::{sync::Arc, time::Duration};

use tracing::{error, info};

use crate::{
    cache::GraphCache,
    config::AppConfig,
    extraction::KnowledgeGraphExtractor,
    llm::GraphTransformer,
    processor::{StorageEvent, UploadProcessor},
    storage::ObjectStore,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn ObjectStore>,
    pub cache: Arc<dyn GraphCache>,
    pub extractor: KnowledgeGraphExtractor,
    pub processor: UploadProcessor,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        storage: Arc<dyn ObjectStore>,
        cache: Arc<dyn GraphCache>,
        transformer: Arc<dyn GraphTransformer>,
    ) -> Self {
        let extractor = KnowledgeGraphExtractor::new(
            transformer,
            config.chunk_size,
            config.chunk_overlap,
            config.extraction_concurrency,
        );
        let processor = UploadProcessor::new(
            storage.clone(),
            cache.clone(),
            extractor.clone(),
            config.scratch_dir.clone(),
        );
        Self {
            config: Arc::new(config),
            storage,
            cache,
            extractor,
            processor,
        }
    }

    /// Hace de notificación de almacenamiento cuando el backend no la emite
    /// por sí mismo (backend local). El procesado corre en segundo plano.
    pub fn emit_object_created(&self, key: &str) {
        if !self.config.emit_storage_events {
            return;
        }
        let event = StorageEvent::object_created(self.storage.bucket(), key);
        let processor = self.processor.clone();
        tokio::spawn(async move {
            processor.process_event(event).await;
        });
    }
}

/// Borra periódicamente las entradas caducadas de la caché.
pub fn spawn_cache_sweeper(cache: Arc<dyn GraphCache>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            match cache.purge_expired(chrono::Utc::now().timestamp()).await {
                Ok(0) => {}
                Ok(removed) => info!("Caché: {removed} entradas caducadas eliminadas."),
                Err(e) => error!("Error purgando la caché: {e:#}"),
            }
        }
    })
}
