//! Extracción de texto de los ficheros subidos (texto plano, PDF y DOCX).

use std::{
    io::{Cursor, Read},
    path::Path,
    sync::OnceLock,
};

use regex::Regex;
use tracing::debug;

use crate::error::ApiError;

/// Formato detectado a partir del content type y de la extensión.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    PlainText,
    Pdf,
    Docx,
}

impl DocumentKind {
    /// El texto gana a la extensión; lo desconocido se trata como texto.
    pub fn detect(content_type: &str, file_name: &str) -> Self {
        let name = file_name.to_lowercase();
        if content_type.starts_with("text/") || name.ends_with(".txt") {
            Self::PlainText
        } else if name.ends_with(".pdf") {
            Self::Pdf
        } else if name.ends_with(".docx") {
            Self::Docx
        } else {
            Self::PlainText
        }
    }
}

/// Extrae el texto de un fichero en memoria. Los fallos de decodificación se
/// devuelven como `ApiError::Decode`; el texto vacío NO es un error aquí.
pub async fn extract_text(
    bytes: Vec<u8>,
    content_type: &str,
    file_name: &str,
) -> Result<String, ApiError> {
    let kind = DocumentKind::detect(content_type, file_name);
    debug!("Extrayendo texto de '{file_name}' como {kind:?}");

    // pdf-extract puede entrar en pánico con PDFs corruptos.
    tokio::task::spawn_blocking(move || match kind {
        DocumentKind::PlainText => decode_utf8(bytes),
        DocumentKind::Pdf => pdf_text_from_mem(&bytes),
        DocumentKind::Docx => docx_text(&bytes),
    })
    .await
    .map_err(|e| ApiError::Decode(format!("Failed to extract text: {e}")))?
}

/// Texto de un PDF en disco, como hace el procesador tras descargarlo.
pub async fn extract_pdf_file(path: &Path) -> anyhow::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || pdf_extract::extract_text(&path))
        .await
        .map_err(|e| anyhow::anyhow!("La extracción del PDF terminó de forma anómala: {e}"))?
        .map_err(|e| anyhow::anyhow!("No se pudo extraer texto del PDF: {e}"))
}

fn decode_utf8(bytes: Vec<u8>) -> Result<String, ApiError> {
    String::from_utf8(bytes)
        .map_err(|e| ApiError::Decode(format!("Failed to extract text: {e}")))
}

fn pdf_text_from_mem(bytes: &[u8]) -> Result<String, ApiError> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| ApiError::Decode(format!("Failed to extract text: {e}")))?;
    let mut text = String::new();
    for page in pages {
        text.push_str(&page);
        text.push('\n');
    }
    Ok(text.trim().to_string())
}

fn docx_text(bytes: &[u8]) -> Result<String, ApiError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .map_err(|e| ApiError::Decode(format!("Failed to extract text: {e}")))?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| ApiError::Decode(format!("Failed to extract text: {e}")))?
        .read_to_string(&mut xml)
        .map_err(|e| ApiError::Decode(format!("Failed to extract text: {e}")))?;

    let paragraphs: Vec<String> = docx_paragraphs(&xml);
    Ok(paragraphs.join("\n").trim().to_string())
}

fn docx_paragraphs(xml: &str) -> Vec<String> {
    static PARAGRAPH: OnceLock<Regex> = OnceLock::new();
    static RUN: OnceLock<Regex> = OnceLock::new();
    let paragraph = PARAGRAPH.get_or_init(|| {
        Regex::new(r"(?s)<w:p(?:\s[^>]*)?(?:/>|>(.*?)</w:p>)").expect("regex de párrafo válida")
    });
    let run = RUN.get_or_init(|| {
        Regex::new(r"(?s)<w:t(?:\s[^>]*)?>(.*?)</w:t>|(<w:tab/>)|<w:(?:br|cr)(?:\s[^>]*)?/>")
            .expect("regex de texto válida")
    });

    paragraph
        .captures_iter(xml)
        .map(|p| {
            let body = p.get(1).map(|m| m.as_str()).unwrap_or("");
            run.captures_iter(body)
                .map(|r| match (r.get(1), r.get(2)) {
                    (Some(t), _) => unescape_xml(t.as_str()),
                    (None, Some(_)) => "\t".to_string(),
                    (None, None) => "\n".to_string(),
                })
                .collect::<String>()
        })
        .collect()
}

/// Entidades con nombre y referencias numéricas (`&#8217;`, `&#xE9;`) en una sola pasada.
fn unescape_xml(s: &str) -> String {
    static ENTITY: OnceLock<Regex> = OnceLock::new();
    let entity = ENTITY.get_or_init(|| {
        Regex::new(r"&(lt|gt|quot|apos|amp|#[0-9]+|#[xX][0-9A-Fa-f]+);").expect("regex de entidad válida")
    });

    entity
        .replace_all(s, |caps: &regex::Captures| {
            let name = &caps[1];
            let decoded = match name {
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "amp" => Some('&'),
                _ => {
                    let code = match name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => name[1..].parse::<u32>().ok(),
                    };
                    code.and_then(char::from_u32)
                }
            };
            decoded.map_or_else(|| caps[0].to_string(), String::from)
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_docx(document_xml: &str) -> Vec<u8> {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            let options = zip::write::SimpleFileOptions::default();
            zip.start_file("word/document.xml", options).unwrap();
            zip.write_all(document_xml.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn detect_prefers_text_content_type() {
        assert_eq!(DocumentKind::detect("text/plain", "a.pdf"), DocumentKind::PlainText);
        assert_eq!(DocumentKind::detect("application/pdf", "A.PDF"), DocumentKind::Pdf);
        assert_eq!(DocumentKind::detect("application/octet-stream", "x.docx"), DocumentKind::Docx);
        assert_eq!(DocumentKind::detect("application/json", "x.json"), DocumentKind::PlainText);
    }

    #[tokio::test]
    async fn plain_text_is_decoded_as_utf8() {
        let text = extract_text("Alice works at Acme.".into(), "text/plain", "a.txt")
            .await
            .unwrap();
        assert_eq!(text, "Alice works at Acme.");
    }

    #[tokio::test]
    async fn invalid_utf8_is_a_decode_error() {
        let err = extract_text(vec![0xff, 0xfe, 0x00], "application/octet-stream", "blob.bin")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }

    #[tokio::test]
    async fn corrupt_pdf_is_a_decode_error() {
        let err = extract_text(b"not a pdf".to_vec(), "application/pdf", "broken.pdf")
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }

    #[tokio::test]
    async fn docx_paragraphs_are_joined_by_newlines() {
        let xml = r#"<w:document><w:body>
            <w:p w:rsidR="1"><w:pPr><w:jc w:val="left"/></w:pPr><w:r><w:t>Alice works</w:t></w:r><w:r><w:t xml:space="preserve"> at Acme &amp; Co.</w:t></w:r></w:p>
            <w:p/>
            <w:p><w:r><w:t>Bob too.</w:t></w:r></w:p>
        </w:body></w:document>"#;
        let text = extract_text(build_docx(xml), "application/octet-stream", "doc.docx")
            .await
            .unwrap();
        assert_eq!(text, "Alice works at Acme & Co.\n\nBob too.");
    }

    #[tokio::test]
    async fn docx_decodes_character_references_and_line_breaks() {
        let xml = r#"<w:document><w:body>
            <w:p><w:r><w:t>Alice&#8217;s caf&#xE9;</w:t><w:br/><w:t>&amp;#38; stays literal</w:t></w:r></w:p>
            <w:p><w:r><w:t>bad &#xD800; ref</w:t><w:br w:type="page"/></w:r></w:p>
        </w:body></w:document>"#;
        let text = extract_text(build_docx(xml), "application/octet-stream", "doc.docx")
            .await
            .unwrap();
        assert_eq!(text, "Alice\u{2019}s caf\u{e9}\n&#38; stays literal\nbad &#xD800; ref");
    }

    #[tokio::test]
    async fn docx_without_document_part_is_rejected() {
        let mut buf = Cursor::new(Vec::new());
        {
            let mut zip = zip::ZipWriter::new(&mut buf);
            zip.start_file("other.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"<x/>").unwrap();
            zip.finish().unwrap();
        }
        let err = extract_text(buf.into_inner(), "", "doc.docx").await.unwrap_err();
        assert!(matches!(err, ApiError::Decode(_)));
    }
}
