//! Almacenamiento de objetos: S3 en producción, sistema de ficheros en local.
//!
//! El backend local también emite URLs prefirmadas (HMAC-SHA256) que apuntan
//! a `/direct-upload/...` de este mismo servidor.

use std::{
    collections::HashMap,
    path::{Component, Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::{error::SdkError, operation::get_object::GetObjectError};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info};
use url::Url;

/// Validez de las URLs de subida directa.
pub const PRESIGN_TTL: Duration = Duration::from_secs(3600);

type HmacSha256 = Hmac<Sha256>;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn bucket(&self) -> &str;

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()>;

    /// `Ok(None)` si la clave no existe.
    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Descarga un objeto a un fichero local.
    async fn download_to(&self, key: &str, path: &Path) -> Result<()> {
        let bytes = self
            .get_object(key)
            .await?
            .ok_or_else(|| anyhow!("El objeto '{key}' no existe en '{}'", self.bucket()))?;
        tokio::fs::write(path, bytes)
            .await
            .with_context(|| format!("No se pudo escribir {}", path.display()))
    }

    /// URL para subir un objeto con PUT sin pasar por la API.
    async fn presign_put(&self, key: &str, content_type: &str, expires_in: Duration) -> Result<String>;

    /// Sólo los backends que sirven sus propias URLs prefirmadas las validan.
    fn verify_direct_upload(&self, _key: &str, _content_type: &str, _expires: i64, _signature: &str) -> bool {
        false
    }
}

// ---------------------------------------------------------------------
// LOCAL
// ---------------------------------------------------------------------

pub struct LocalObjectStore {
    root: PathBuf,
    bucket: String,
    secret: Vec<u8>,
    public_base: Url,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>, bucket: &str, secret: &str, public_base: &str) -> Result<Self> {
        let public_base = Url::parse(public_base)
            .with_context(|| format!("URL base pública inválida: {public_base}"))?;
        Ok(Self {
            root: root.into(),
            bucket: bucket.to_string(),
            secret: secret.as_bytes().to_vec(),
            public_base,
        })
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(&self.bucket).join(safe_relative(key)?))
    }

    fn metadata_path(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.root.join(".meta").join(&self.bucket).join(safe_relative(key)?);
        path.as_mut_os_string().push(".json");
        Ok(path)
    }

    fn sign(&self, key: &str, content_type: &str, expires: i64) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| anyhow!("Clave de firma inválida: {e}"))?;
        mac.update(format!("PUT\n{}\n{key}\n{content_type}\n{expires}", self.bucket).as_bytes());
        Ok(mac)
    }
}

/// Rechaza claves absolutas o con `..`.
fn safe_relative(key: &str) -> Result<PathBuf> {
    let path = Path::new(key);
    if key.is_empty() || path.components().any(|c| !matches!(c, Component::Normal(_))) {
        return Err(anyhow!("Clave de objeto inválida: '{key}'"));
    }
    Ok(path.to_path_buf())
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        mut metadata: HashMap<String, String>,
    ) -> Result<()> {
        let path = self.object_path(key)?;
        let meta_path = self.metadata_path(key)?;
        for p in [&path, &meta_path] {
            if let Some(parent) = p.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&path, &body)
            .await
            .with_context(|| format!("No se pudo escribir {}", path.display()))?;
        metadata.insert("content_type".to_string(), content_type.to_string());
        tokio::fs::write(&meta_path, serde_json::to_vec_pretty(&metadata)?).await?;
        debug!("Objeto guardado: {}/{} ({} bytes)", self.bucket, key, body.len());
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("No se pudo leer {}", path.display())),
        }
    }

    async fn presign_put(&self, key: &str, content_type: &str, expires_in: Duration) -> Result<String> {
        safe_relative(key)?;
        let expires = chrono::Utc::now().timestamp() + expires_in.as_secs() as i64;
        let signature = hex::encode(self.sign(key, content_type, expires)?.finalize().into_bytes());

        let mut url = self.public_base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| anyhow!("La URL base pública no admite rutas"))?;
            segments.pop_if_empty().push("direct-upload");
            for segment in key.split('/') {
                segments.push(segment);
            }
        }
        url.query_pairs_mut()
            .append_pair("content_type", content_type)
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &signature);
        Ok(url.to_string())
    }

    fn verify_direct_upload(&self, key: &str, content_type: &str, expires: i64, signature: &str) -> bool {
        if expires < chrono::Utc::now().timestamp() {
            return false;
        }
        let (Ok(raw), Ok(mac)) = (hex::decode(signature), self.sign(key, content_type, expires)) else {
            return false;
        };
        mac.verify_slice(&raw).is_ok()
    }
}

// ---------------------------------------------------------------------
// S3
// ---------------------------------------------------------------------

pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn from_env(bucket: &str, region: &str) -> Self {
        use aws_config::meta::region::RegionProviderChain;
        use aws_sdk_s3::config::Region;

        let region_provider =
            RegionProviderChain::default_provider().or_else(Region::new(region.to_string()));
        let config = aws_config::from_env().region(region_provider).load().await;
        info!("Cliente S3 inicializado para el bucket '{bucket}'.");
        Self {
            client: aws_sdk_s3::Client::new(&config),
            bucket: bucket.to_string(),
        }
    }
}

fn is_no_such_key<R>(err: &SdkError<GetObjectError, R>) -> bool {
    matches!(err, SdkError::ServiceError(se) if se.err().is_no_such_key())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        use aws_sdk_s3::primitives::ByteStream;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .set_metadata(Some(metadata))
            .send()
            .await
            .with_context(|| format!("Error subiendo s3://{}/{key}", self.bucket))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let body = output.body.collect().await?;
                Ok(Some(body.into_bytes().to_vec()))
            }
            Err(e) if is_no_such_key(&e) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Error descargando s3://{}/{key}", self.bucket)),
        }
    }

    async fn presign_put(&self, key: &str, content_type: &str, expires_in: Duration) -> Result<String> {
        use aws_sdk_s3::presigning::PresigningConfig;

        let request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .presigned(PresigningConfig::expires_in(expires_in)?)
            .await
            .with_context(|| format!("Error prefirmando s3://{}/{key}", self.bucket))?;
        Ok(request.uri().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &Path) -> LocalObjectStore {
        LocalObjectStore::new(dir, "kg-bucket", "s3cr3t", "http://127.0.0.1:3322").unwrap()
    }

    #[tokio::test]
    async fn local_put_then_get_and_download() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let meta = HashMap::from([("file_id".to_string(), "f1".to_string())]);
        tokio_test::assert_ok!(
            store
                .put_object("uploads/f1/extracted.txt", b"hola".to_vec(), "text/plain", meta)
                .await
        );

        assert_eq!(store.get_object("uploads/f1/extracted.txt").await.unwrap().unwrap(), b"hola");
        assert!(store.get_object("uploads/f2/extracted.txt").await.unwrap().is_none());

        let target = dir.path().join("scratch.txt");
        store.download_to("uploads/f1/extracted.txt", &target).await.unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"hola");
        assert!(store.download_to("uploads/nope", &target).await.is_err());
    }

    #[tokio::test]
    async fn local_rejects_traversal_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        assert!(store
            .put_object("../escape.txt", vec![], "text/plain", HashMap::new())
            .await
            .is_err());
        assert!(store.get_object("/etc/passwd").await.is_err());
    }

    #[tokio::test]
    async fn local_presigned_urls_round_trip_through_verification() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let raw = store
            .presign_put("uploads/f1/my report.pdf", "application/pdf", PRESIGN_TTL)
            .await
            .unwrap();

        let url = Url::parse(&raw).unwrap();
        assert_eq!(url.path(), "/direct-upload/uploads/f1/my%20report.pdf");
        let query: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let expires: i64 = query["expires"].parse().unwrap();

        assert!(store.verify_direct_upload("uploads/f1/my report.pdf", "application/pdf", expires, &query["signature"]));
        assert!(!store.verify_direct_upload("uploads/f1/other.pdf", "application/pdf", expires, &query["signature"]));
        assert!(!store.verify_direct_upload("uploads/f1/my report.pdf", "text/plain", expires, &query["signature"]));
        assert!(!store.verify_direct_upload("uploads/f1/my report.pdf", "application/pdf", expires, "zz"));
    }

    #[tokio::test]
    async fn empty_secret_still_signs_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path(), "kg-bucket", "", "http://127.0.0.1:3322").unwrap();
        let raw = store.presign_put("uploads/f1/a.txt", "text/plain", PRESIGN_TTL).await.unwrap();
        let query: HashMap<String, String> = Url::parse(&raw).unwrap().query_pairs().into_owned().collect();
        let expires: i64 = query["expires"].parse().unwrap();
        assert!(store.verify_direct_upload("uploads/f1/a.txt", "text/plain", expires, &query["signature"]));
    }

    #[test]
    fn only_no_such_key_counts_as_missing_s3_object() {
        use aws_sdk_s3::types::error::NoSuchKey;

        let missing: SdkError<GetObjectError, ()> =
            SdkError::service_error(GetObjectError::NoSuchKey(NoSuchKey::builder().build()), ());
        assert!(is_no_such_key(&missing));

        let timeout: SdkError<GetObjectError, ()> = SdkError::timeout_error("tiempo agotado");
        assert!(!is_no_such_key(&timeout));
    }

    #[tokio::test]
    async fn expired_signatures_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(dir.path());
        let expires = chrono::Utc::now().timestamp() - 1;
        let signature = hex::encode(store.sign("k", "text/plain", expires).unwrap().finalize().into_bytes());
        assert!(!store.verify_direct_upload("k", "text/plain", expires, &signature));
    }
}
