//! Carga y gestión de configuración de la aplicación (almacenamiento, caché y LLM).

use std::{env, path::PathBuf, str::FromStr};
use anyhow::{anyhow, Result};

#[derive(Clone, Debug, PartialEq)]
pub enum StorageBackend {
    /// Sistema de ficheros local, con URLs prefirmadas servidas por este mismo servidor.
    Local,
    S3,
}

impl FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "s3" => Ok(Self::S3),
            other => Err(anyhow!("Backend de almacenamiento no soportado: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum CacheBackend {
    Neo4j,
    Memory,
}

impl FromStr for CacheBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "neo4j" => Ok(Self::Neo4j),
            "memory" => Ok(Self::Memory),
            other => Err(anyhow!("Backend de caché no soportado: {other}")),
        }
    }
}

/// Credenciales de Neo4j. Sólo son obligatorias con `CACHE_BACKEND=neo4j`.
#[derive(Clone, Debug)]
pub struct Neo4jConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
}

/// Datos con los que se construye la URL pública de un enlace compartido.
#[derive(Clone, Debug, Default)]
pub struct PublicUrlConfig {
    pub api_id: Option<String>,
    pub region: String,
    pub stage: String,
    pub base_url: Option<String>,
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,

    pub storage_backend: StorageBackend,
    pub bucket_name: String,
    pub local_storage_dir: PathBuf,
    pub presign_secret: String,
    pub emit_storage_events: bool,
    pub scratch_dir: PathBuf,

    pub cache_backend: CacheBackend,
    pub neo4j: Option<Neo4jConfig>,
    pub cache_sweep_secs: u64,

    pub llm_chat_model: String,
    pub secret_name: String,
    pub secrets_file: Option<PathBuf>,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub extraction_concurrency: usize,

    pub public_url: PublicUrlConfig,
    pub api_key: Option<String>,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        let server_addr =
            env::var("SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:3322".to_string());

        let storage_backend: StorageBackend = env::var("STORAGE_BACKEND")
            .unwrap_or_else(|_| "local".to_string())
            .parse()?;
        let bucket_name = match storage_backend {
            StorageBackend::S3 => env::var("BUCKET_NAME")
                .map_err(|_| anyhow!("Falta BUCKET_NAME en el entorno"))?,
            StorageBackend::Local => {
                env::var("BUCKET_NAME").unwrap_or_else(|_| "local-bucket".to_string())
            }
        };
        let local_storage_dir = env::var("LOCAL_STORAGE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data/objects"));
        let presign_secret = env::var("PRESIGN_SECRET").unwrap_or_default();
        if storage_backend == StorageBackend::Local && presign_secret.is_empty() {
            return Err(anyhow!(
                "Falta PRESIGN_SECRET en el entorno (obligatorio con STORAGE_BACKEND=local)"
            ));
        }
        let emit_storage_events = match env::var("EMIT_STORAGE_EVENTS") {
            Ok(v) => parse_bool(&v)?,
            Err(_) => storage_backend == StorageBackend::Local,
        };
        let scratch_dir = env::var("SCRATCH_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| env::temp_dir());

        let cache_backend: CacheBackend = env::var("CACHE_BACKEND")
            .unwrap_or_else(|_| "neo4j".to_string())
            .parse()?;
        let neo4j = match cache_backend {
            CacheBackend::Neo4j => Some(Neo4jConfig {
                uri: env::var("NEO4J_URI")
                    .map_err(|_| anyhow!("Falta NEO4J_URI en el entorno"))?,
                user: env::var("NEO4J_USER")
                    .map_err(|_| anyhow!("Falta NEO4J_USER en el entorno"))?,
                password: env::var("NEO4J_PASSWORD")
                    .map_err(|_| anyhow!("Falta NEO4J_PASSWORD en el entorno"))?,
            }),
            CacheBackend::Memory => None,
        };
        let cache_sweep_secs = parse_env("CACHE_SWEEP_SECS", 3600)?;

        let llm_chat_model =
            env::var("LLM_CHAT_MODEL").unwrap_or_else(|_| "gpt-4-turbo".to_string());
        let secret_name =
            env::var("SECRET_NAME").unwrap_or_else(|_| "OPENAI_API_KEY".to_string());
        let secrets_file = env::var("SECRETS_FILE").ok().map(PathBuf::from);

        let chunk_size = parse_env("CHUNK_SIZE", 2000)?;
        let chunk_overlap = parse_env("CHUNK_OVERLAP", 200)?;
        if chunk_overlap >= chunk_size {
            return Err(anyhow!(
                "CHUNK_OVERLAP ({chunk_overlap}) debe ser menor que CHUNK_SIZE ({chunk_size})"
            ));
        }
        let extraction_concurrency = parse_env::<usize>("EXTRACTION_CONCURRENCY", 1)?.max(1);

        let public_url = PublicUrlConfig {
            api_id: env::var("API_ID").ok().filter(|s| !s.is_empty()),
            region: env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            stage: env::var("API_STAGE").unwrap_or_else(|_| "Prod".to_string()),
            base_url: env::var("PUBLIC_BASE_URL").ok().filter(|s| !s.is_empty()),
        };
        let api_key = env::var("API_KEY").ok().filter(|s| !s.is_empty());

        Ok(Self {
            server_addr,
            storage_backend,
            bucket_name,
            local_storage_dir,
            presign_secret,
            emit_storage_events,
            scratch_dir,
            cache_backend,
            neo4j,
            cache_sweep_secs,
            llm_chat_model,
            secret_name,
            secrets_file,
            chunk_size,
            chunk_overlap,
            extraction_concurrency,
            public_url,
            api_key,
        })
    }
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow!("Valor inválido para {key}: '{raw}'")),
        Err(_) => Ok(default),
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("Valor booleano inválido: '{other}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backends_parse_case_insensitively() {
        assert_eq!("S3".parse::<StorageBackend>().unwrap(), StorageBackend::S3);
        assert_eq!("Memory".parse::<CacheBackend>().unwrap(), CacheBackend::Memory);
        assert!("dynamo".parse::<CacheBackend>().is_err());
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("TRUE").unwrap());
        assert!(!parse_bool("0").unwrap());
        assert!(parse_bool("maybe").is_err());
    }
}
