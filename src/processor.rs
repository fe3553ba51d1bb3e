//! Procesado de los PDFs subidos a partir de notificaciones de creación de
//! objetos: descarga → texto → grafo → entrada en la caché.
//!
//! Cada registro del lote se procesa por separado; el fallo de uno se guarda
//! como entrada `error` y no detiene a los demás.

use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    cache::GraphCache,
    document,
    extraction::KnowledgeGraphExtractor,
    models::{extracted_text_key, CacheEntry, GraphPayload},
    storage::ObjectStore,
};

// --- Notificaciones con la forma de los eventos de S3 ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<StorageEventRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageEventRecord {
    pub s3: S3Entity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Entity {
    pub bucket: BucketRef,
    pub object: ObjectRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketRef {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRef {
    pub key: String,
}

impl StorageEvent {
    /// Notificación de un único objeto creado.
    pub fn object_created(bucket: &str, key: &str) -> Self {
        Self {
            records: vec![StorageEventRecord {
                s3: S3Entity {
                    bucket: BucketRef { name: bucket.to_string() },
                    object: ObjectRef { key: urlencoding::encode(key).replace("%2F", "/") },
                },
            }],
        }
    }
}

/// Fichero identificado a partir de `uploads/{file_id}/.../{filename}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadKey {
    pub file_id: String,
    pub file_name: String,
}

/// Devuelve `None` si la clave no tiene al menos tres segmentos bajo `uploads/`.
pub fn parse_upload_key(key: &str) -> Option<UploadKey> {
    let segments: Vec<&str> = key.split('/').collect();
    if segments.len() < 3 || segments[0] != "uploads" {
        return None;
    }
    let file_id = segments[1];
    let file_name = segments[segments.len() - 1];
    if file_id.is_empty() || file_name.is_empty() {
        return None;
    }
    Some(UploadKey {
        file_id: file_id.to_string(),
        file_name: file_name.to_string(),
    })
}

/// Las claves llegan codificadas como formulario (`+` es un espacio).
fn decode_event_key(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|k| k.into_owned())
        .unwrap_or(spaced)
}

/// Resumen de un lote de notificaciones.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessSummary {
    pub processed: u32,
    pub failed: u32,
    pub skipped: u32,
}

impl std::fmt::Display for ProcessSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Resumen: {} ficheros procesados, {} con error, {} omitidos.",
            self.processed, self.failed, self.skipped
        )
    }
}

enum RecordOutcome {
    Completed,
    Failed,
    Skipped,
}

#[derive(Clone)]
pub struct UploadProcessor {
    storage: Arc<dyn ObjectStore>,
    cache: Arc<dyn GraphCache>,
    extractor: KnowledgeGraphExtractor,
    scratch_dir: PathBuf,
}

impl UploadProcessor {
    pub fn new(
        storage: Arc<dyn ObjectStore>,
        cache: Arc<dyn GraphCache>,
        extractor: KnowledgeGraphExtractor,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            storage,
            cache,
            extractor,
            scratch_dir: scratch_dir.into(),
        }
    }

    pub async fn process_event(&self, event: StorageEvent) -> ProcessSummary {
        let mut summary = ProcessSummary::default();
        let total = event.records.len();

        for (index, record) in event.records.into_iter().enumerate() {
            let key = decode_event_key(&record.s3.object.key);
            info!("[{}/{}] Notificación: {}/{}", index + 1, total, record.s3.bucket.name, key);

            match self.process_record(&record.s3.bucket.name, &key).await {
                RecordOutcome::Completed => summary.processed += 1,
                RecordOutcome::Failed => summary.failed += 1,
                RecordOutcome::Skipped => summary.skipped += 1,
            }
        }

        info!("{summary}");
        summary
    }

    async fn process_record(&self, bucket: &str, key: &str) -> RecordOutcome {
        if !key.to_lowercase().ends_with(".pdf") {
            return RecordOutcome::Skipped;
        }
        if bucket != self.storage.bucket() {
            warn!("Saltando {key}: el bucket '{bucket}' no es '{}'", self.storage.bucket());
            return RecordOutcome::Skipped;
        }
        let Some(upload) = parse_upload_key(key) else {
            warn!("Saltando clave con formato inesperado: {key}");
            return RecordOutcome::Skipped;
        };

        let scratch = self.scratch_dir.join(format!("{}-{}.pdf", upload.file_id, Uuid::new_v4()));
        let result = self.graph_from_pdf(key, &scratch).await;
        if let Err(e) = tokio::fs::remove_file(&scratch).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("No se pudo borrar el fichero temporal {}: {e}", scratch.display());
            }
        }

        match self.persist(&upload.file_id, result).await {
            Ok(entry) if entry.error.is_none() => {
                info!("Grafo de {} ({}) guardado.", upload.file_id, upload.file_name);
                RecordOutcome::Completed
            }
            Ok(_) => RecordOutcome::Failed,
            Err(e) => {
                error!("No se pudo guardar el resultado de {}: {e:#}", upload.file_id);
                RecordOutcome::Failed
            }
        }
    }

    async fn graph_from_pdf(&self, key: &str, scratch: &std::path::Path) -> Result<GraphPayload> {
        self.storage.download_to(key, scratch).await?;
        let text = document::extract_pdf_file(scratch).await?;
        if text.trim().is_empty() {
            return Err(anyhow!("No text could be extracted from file"));
        }
        self.extractor.extract(&text).await
    }

    /// Procesa el texto ya extraído por la subida (`uploads/{id}/extracted.txt`).
    /// `Ok(None)` si ese fichero no existe.
    pub async fn process_extracted_text(&self, file_id: &str) -> Result<Option<CacheEntry>> {
        let Some(bytes) = self.storage.get_object(&extracted_text_key(file_id)).await? else {
            return Ok(None);
        };
        let result = match String::from_utf8(bytes) {
            Ok(text) if !text.trim().is_empty() => self.extractor.extract(&text).await,
            Ok(_) => Err(anyhow!("No text could be extracted from file")),
            Err(e) => Err(anyhow!("Failed to extract text: {e}")),
        };
        self.persist(file_id, result).await.map(Some)
    }

    /// Guarda el grafo o el error en la caché con una nueva `share_id`.
    async fn persist(&self, file_id: &str, result: Result<GraphPayload>) -> Result<CacheEntry> {
        let now = chrono::Utc::now().timestamp();
        let entry = match result {
            Ok(graph) => CacheEntry::completed(file_id, graph, now),
            Err(e) => {
                error!("Error procesando {file_id}: {e:#}");
                CacheEntry::failed(file_id, format!("{e:#}"), now)
            }
        };
        self.cache.put_entry(&entry).await?;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_keys_need_three_segments() {
        assert_eq!(
            parse_upload_key("uploads/abc/report.pdf"),
            Some(UploadKey { file_id: "abc".into(), file_name: "report.pdf".into() })
        );
        assert_eq!(
            parse_upload_key("uploads/abc/original/report.pdf").map(|k| k.file_name),
            Some("report.pdf".to_string())
        );
        assert_eq!(parse_upload_key("uploads/report.pdf"), None);
        assert_eq!(parse_upload_key("report.pdf"), None);
        assert_eq!(parse_upload_key("other/abc/report.pdf"), None);
        assert_eq!(parse_upload_key("uploads//report.pdf"), None);
    }

    #[test]
    fn event_keys_are_form_decoded() {
        assert_eq!(decode_event_key("uploads/a/my+report%281%29.pdf"), "uploads/a/my report(1).pdf");
    }

    #[test]
    fn object_created_event_round_trips_key() {
        let event = StorageEvent::object_created("b", "uploads/a/my report.pdf");
        let raw = &event.records[0].s3.object.key;
        assert_eq!(raw, "uploads/a/my%20report.pdf");
        assert_eq!(decode_event_key(raw), "uploads/a/my report.pdf");
    }

    #[test]
    fn event_batch_deserializes_from_s3_shape() {
        let raw = r#"{"Records":[{"eventName":"ObjectCreated:Put","s3":{"bucket":{"name":"kg"},"object":{"key":"uploads/a/b.pdf","size":10}}}]}"#;
        let event: StorageEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.records[0].s3.object.key, "uploads/a/b.pdf");
    }
}
