//! Origen de las credenciales del LLM.

use std::{collections::HashMap, env, path::PathBuf};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<String>;
}

/// Lee el secreto de una variable de entorno con el mismo nombre.
#[derive(Debug, Default, Clone)]
pub struct EnvSecretStore;

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get_secret(&self, name: &str) -> Result<String> {
        env::var(name).map_err(|_| anyhow!("Falta el secreto '{name}' en el entorno"))
    }
}

/// Fichero JSON `{ "nombre": "valor", ... }`, montado por el orquestador.
/// Se relee en cada consulta; quien lo usa ya cachea el resultado.
#[derive(Debug, Clone)]
pub struct FileSecretStore {
    path: PathBuf,
}

impl FileSecretStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get_secret(&self, name: &str) -> Result<String> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("No se pudo leer {}", self.path.display()))?;
        let secrets: HashMap<String, serde_json::Value> = serde_json::from_str(&raw)
            .with_context(|| format!("{} no es un objeto JSON válido", self.path.display()))?;
        match secrets.get(name) {
            Some(serde_json::Value::String(s)) => Ok(s.clone()),
            Some(other) => Ok(other.to_string()),
            None => Err(anyhow!("Secreto '{name}' no encontrado en {}", self.path.display())),
        }
    }
}

/// Un secreto puede ser la clave en bruto o un documento JSON con el campo
/// `OPENAI_API_KEY`.
pub fn api_key_from_secret(secret: &str) -> Result<String> {
    let trimmed = secret.trim();
    if trimmed.starts_with('{') {
        let value: serde_json::Value =
            serde_json::from_str(trimmed).context("El secreto parece JSON pero no lo es")?;
        return value
            .get("OPENAI_API_KEY")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("El secreto no contiene OPENAI_API_KEY"));
    }
    if trimmed.is_empty() {
        return Err(anyhow!("El secreto está vacío"));
    }
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn api_key_accepts_raw_and_json_secrets() {
        assert_eq!(api_key_from_secret(" sk-raw \n").unwrap(), "sk-raw");
        assert_eq!(
            api_key_from_secret(r#"{"OPENAI_API_KEY":"sk-json"}"#).unwrap(),
            "sk-json"
        );
        assert!(api_key_from_secret(r#"{"OTHER":"x"}"#).is_err());
        assert!(api_key_from_secret("   ").is_err());
    }

    #[tokio::test]
    async fn file_store_reads_named_secret() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"kg/openai": "{{\"OPENAI_API_KEY\":\"sk-file\"}}"}}"#).unwrap();

        let store = FileSecretStore::new(file.path());
        let secret = store.get_secret("kg/openai").await.unwrap();
        assert_eq!(api_key_from_secret(&secret).unwrap(), "sk-file");
        assert!(store.get_secret("missing").await.is_err());
    }
}
