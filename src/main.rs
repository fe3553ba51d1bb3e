use std::{sync::Arc, time::Duration};

use kg_share_webapp::{
    app_state::{spawn_cache_sweeper, AppState},
    build_app,
    cache::{GraphCache, MemoryGraphCache},
    config::{AppConfig, CacheBackend, StorageBackend},
    llm::LlmGraphTransformer,
    neo4j_client,
    secrets::{EnvSecretStore, FileSecretStore, SecretStore},
    storage::{LocalObjectStore, ObjectStore, S3ObjectStore},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // 2. Cargar configuración
    let cfg = AppConfig::from_env().expect("Error al cargar la configuración");

    // 3. Almacenamiento de objetos
    let storage: Arc<dyn ObjectStore> = match cfg.storage_backend {
        StorageBackend::S3 => {
            Arc::new(S3ObjectStore::from_env(&cfg.bucket_name, &cfg.public_url.region).await)
        }
        StorageBackend::Local => {
            let public_base = cfg
                .public_url
                .base_url
                .clone()
                .unwrap_or_else(|| format!("http://{}", cfg.server_addr));
            Arc::new(
                LocalObjectStore::new(
                    &cfg.local_storage_dir,
                    &cfg.bucket_name,
                    &cfg.presign_secret,
                    &public_base,
                )
                .expect("Error inicializando el almacenamiento local"),
            )
        }
    };

    // 4. Caché de grafos (Neo4j con su esquema, o memoria)
    let cache: Arc<dyn GraphCache> = match (&cfg.cache_backend, &cfg.neo4j) {
        (CacheBackend::Neo4j, Some(neo4j_cfg)) => {
            let graph = neo4j_client::connect_from_config(neo4j_cfg)
                .await
                .expect("Error conectando a Neo4j");
            neo4j_client::ensure_schema(&graph)
                .await
                .expect("Error asegurando el esquema de Neo4j");
            Arc::new(neo4j_client::Neo4jGraphCache::new(graph))
        }
        _ => {
            info!("Usando caché de grafos en memoria.");
            Arc::new(MemoryGraphCache::new())
        }
    };
    spawn_cache_sweeper(cache.clone(), Duration::from_secs(cfg.cache_sweep_secs.max(1)));

    // 5. Transformador LLM (la credencial se pide en el primer uso)
    let secrets: Arc<dyn SecretStore> = match &cfg.secrets_file {
        Some(path) => Arc::new(FileSecretStore::new(path)),
        None => Arc::new(EnvSecretStore),
    };
    let transformer = Arc::new(LlmGraphTransformer::new(
        cfg.llm_chat_model.clone(),
        cfg.secret_name.clone(),
        secrets,
    ));

    // 6. Estado compartido y router
    let server_addr = cfg.server_addr.clone();
    let app_state = AppState::new(cfg, storage, cache, transformer);
    let app = build_app(app_state);

    // 7. Iniciar el servidor
    let listener = tokio::net::TcpListener::bind(&server_addr)
        .await
        .expect("No se pudo abrir el puerto del servidor");
    info!("🚀 Servidor escuchando en http://{}", server_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await
        .expect("Error en el servidor HTTP");

    info!("✅ Servidor cerrado correctamente.");
}
