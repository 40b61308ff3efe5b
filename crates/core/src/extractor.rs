use crate::config::OcrEndpointConfig;
use crate::error::IngestError;
use crate::traits::TextExtractor;
use base64::{engine::general_purpose::STANDARD, Engine};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

pub const SUPPORTED_EXTENSIONS: &[&str] = &["pdf", "docx", "txt", "md", "markdown", "text"];

const PAGE_SEPARATOR: &str = "\n\n";
const DOCX_BODY: &str = "word/document.xml";

#[derive(Debug, Clone)]
pub struct PageText {
    pub number: u32,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
struct LlmOcrRequest {
    pdf_base64: String,
    source_path: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrResponse {
    pages: Option<Vec<LlmOcrPage>>,
    text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct LlmOcrPage {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    text: Option<String>,
}

pub fn file_extension(path: &Path) -> String {
    path.extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default()
}

pub fn is_supported(path: &Path) -> bool {
    SUPPORTED_EXTENSIONS.contains(&file_extension(path).as_str())
}

#[derive(Debug, Clone, Default)]
pub struct FileTextExtractor {
    ocr: Option<OcrEndpointConfig>,
    timeout: Option<Duration>,
}

impl FileTextExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ocr(mut self, ocr: Option<OcrEndpointConfig>, timeout: Duration) -> Self {
        self.ocr = ocr;
        self.timeout = Some(timeout);
        self
    }

    fn extract_pdf(&self, path: &Path) -> Result<String, IngestError> {
        let pages = match extract_pdf_pages(path) {
            Ok(pages) => pages,
            Err(IngestError::PdfParse(parse_error)) => match self.extract_with_llm_ocr(path) {
                Ok(Some(pages)) => pages,
                Ok(None) => return Err(IngestError::PdfParse(parse_error)),
                Err(ocr_error) => {
                    return Err(IngestError::PdfParse(format!(
                        "{parse_error}; multimodal OCR fallback failed: {ocr_error}"
                    )))
                }
            },
            Err(error) => return Err(error),
        };

        debug!(path = %path.display(), pages = pages.len(), "extracted pdf text");
        Ok(pages
            .into_iter()
            .map(|page| page.text)
            .collect::<Vec<_>>()
            .join(PAGE_SEPARATOR))
    }

    fn extract_with_llm_ocr(&self, path: &Path) -> Result<Option<Vec<PageText>>, IngestError> {
        let Some(cfg) = &self.ocr else {
            return Ok(None);
        };
        warn!(path = %path.display(), endpoint = %cfg.endpoint, "pdf has no text layer; trying multimodal OCR");

        let pdf = std::fs::read(path)?;
        let payload = LlmOcrRequest {
            pdf_base64: STANDARD.encode(pdf),
            source_path: path.to_string_lossy().to_string(),
        };

        let mut client = Client::builder();
        if let Some(timeout) = self.timeout {
            client = client.timeout(timeout);
        }
        let mut request = client
            .build()?
            .post(&cfg.endpoint)
            .header("content-type", "application/json")
            .json(&payload);

        if let Some(api_key) = &cfg.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send()?;

        if !response.status().is_success() {
            return Err(IngestError::OcrFailed(format!(
                "multimodal OCR request to {} returned {}",
                cfg.endpoint,
                response.status()
            )));
        }

        let payload: LlmOcrResponse = response.json()?;
        let pages = payload_to_pages(&payload, path)?;
        Ok(Some(pages))
    }
}

impl TextExtractor for FileTextExtractor {
    fn extract(&self, path: &Path) -> Result<String, IngestError> {
        match file_extension(path).as_str() {
            "pdf" => self.extract_pdf(path),
            "docx" => extract_docx(path),
            "txt" | "md" | "markdown" | "text" => {
                let bytes = std::fs::read(path)?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            other => Err(IngestError::UnsupportedFormat(if other.is_empty() {
                path.display().to_string()
            } else {
                other.to_string()
            })),
        }
    }
}

fn extract_pdf_pages(path: &Path) -> Result<Vec<PageText>, IngestError> {
    let document =
        lopdf::Document::load(path).map_err(|error| IngestError::PdfParse(error.to_string()))?;

    let mut pages = Vec::new();
    for (page_no, _page_id) in document.get_pages() {
        let text = document
            .extract_text(&[page_no])
            .map_err(|error| IngestError::PdfParse(error.to_string()))?;

        if !text.trim().is_empty() {
            pages.push(PageText {
                number: page_no,
                text,
            });
        }
    }

    if pages.is_empty() {
        return Err(IngestError::PdfParse(format!(
            "pdf had no readable page text: {}",
            path.display()
        )));
    }

    Ok(pages)
}

fn extract_docx(path: &Path) -> Result<String, IngestError> {
    let file = File::open(path)?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|error| IngestError::DocxParse(error.to_string()))?;
    let mut body = archive
        .by_name(DOCX_BODY)
        .map_err(|error| IngestError::DocxParse(format!("{DOCX_BODY}: {error}")))?;

    let mut xml = String::new();
    body.read_to_string(&mut xml)?;
    docx_xml_to_text(&xml)
}

fn docx_xml_to_text(xml: &str) -> Result<String, IngestError> {
    let mut reader = Reader::from_str(xml);
    let mut text = String::new();
    let mut in_run_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => {
                if element.name().as_ref() == b"w:t" {
                    in_run_text = true;
                }
            }
            Ok(Event::End(element)) => match element.name().as_ref() {
                b"w:t" => in_run_text = false,
                b"w:p" => text.push_str(PAGE_SEPARATOR),
                _ => {}
            },
            Ok(Event::Empty(element)) => match element.name().as_ref() {
                b"w:tab" => text.push('\t'),
                b"w:br" | b"w:cr" => text.push('\n'),
                b"w:p" => text.push_str(PAGE_SEPARATOR),
                _ => {}
            },
            Ok(Event::Text(run)) if in_run_text => {
                let unescaped = run
                    .unescape()
                    .map_err(|error| IngestError::DocxParse(error.to_string()))?;
                text.push_str(&unescaped);
            }
            Ok(Event::Eof) => break,
            Err(error) => return Err(IngestError::DocxParse(error.to_string())),
            _ => {}
        }
    }

    Ok(text.trim_end().to_string())
}

fn payload_to_pages(payload: &LlmOcrResponse, path: &Path) -> Result<Vec<PageText>, IngestError> {
    if let Some(listed) = &payload.pages {
        let listed = listed
            .iter()
            .filter_map(|page| {
                let text = page.text.as_deref().map(str::trim).unwrap_or_default();
                if text.is_empty() {
                    None
                } else {
                    Some(PageText {
                        number: page.page.unwrap_or(1),
                        text: text.to_string(),
                    })
                }
            })
            .collect::<Vec<_>>();

        if !listed.is_empty() {
            return Ok(listed);
        }
    }

    if let Some(raw_text) = &payload.text {
        let pages = raw_text
            .split('\u{000c}')
            .enumerate()
            .filter_map(|(index, chunk)| {
                let normalized = chunk.trim();
                if normalized.is_empty() {
                    None
                } else {
                    Some(PageText {
                        number: (index + 1) as u32,
                        text: normalized.to_string(),
                    })
                }
            })
            .collect::<Vec<_>>();

        if !pages.is_empty() {
            return Ok(pages);
        }
    }

    Err(IngestError::OcrFailed(format!(
        "multimodal OCR response was empty for {}",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    fn write_docx(path: &Path, document_xml: &str) {
        let file = File::create(path).unwrap();
        let mut archive = zip::ZipWriter::new(file);
        archive
            .start_file(DOCX_BODY, SimpleFileOptions::default())
            .unwrap();
        archive.write_all(document_xml.as_bytes()).unwrap();
        archive.finish().unwrap();
    }

    #[test]
    fn ocr_payload_with_pages_converts_only_nonempty_text() {
        let response = LlmOcrResponse {
            pages: Some(vec![
                LlmOcrPage {
                    page: Some(2),
                    text: Some("  ".to_string()),
                },
                LlmOcrPage {
                    page: Some(3),
                    text: Some("Page 3".to_string()),
                },
            ]),
            text: None,
        };

        let pages = payload_to_pages(&response, Path::new("x.pdf")).unwrap();

        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0].number, 3);
        assert_eq!(pages[0].text, "Page 3");
    }

    #[test]
    fn ocr_payload_fallback_text_split_by_form_feed() {
        let response = LlmOcrResponse {
            pages: None,
            text: Some("First\u{000C}Second\n".to_string()),
        };

        let pages = payload_to_pages(&response, Path::new("x.pdf")).unwrap();

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[1].number, 2);
        assert_eq!(pages[1].text, "Second");
    }

    #[test]
    fn plain_text_is_read_lossily() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("notes.MD");
        std::fs::write(&path, b"# Title\n\nBody \xff text")?;

        let text = FileTextExtractor::new().extract(&path)?;
        assert!(text.starts_with("# Title\n\nBody "));
        assert!(text.ends_with(" text"));
        Ok(())
    }

    #[test]
    fn docx_runs_and_paragraphs_become_text() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("report.docx");
        write_docx(
            &path,
            r#"<?xml version="1.0" encoding="UTF-8"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>Hello</w:t></w:r><w:r><w:t xml:space="preserve"> world &amp; friends</w:t></w:r></w:p>
    <w:p><w:r><w:t>Second</w:t><w:tab/><w:t>column</w:t></w:r></w:p>
  </w:body>
</w:document>"#,
        );

        let text = FileTextExtractor::new().extract(&path)?;
        assert_eq!(text, "Hello world & friends\n\nSecond\tcolumn");
        Ok(())
    }

    #[test]
    fn docx_without_body_is_a_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("broken.docx");
        std::fs::write(&path, b"not a zip archive")?;

        let result = FileTextExtractor::new().extract(&path);
        assert!(matches!(result, Err(IngestError::DocxParse(_))));
        Ok(())
    }

    #[test]
    fn unknown_extension_is_unsupported() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("slides.pptx");
        std::fs::write(&path, b"binary")?;

        let result = FileTextExtractor::new().extract(&path);
        assert!(matches!(result, Err(IngestError::UnsupportedFormat(ext)) if ext == "pptx"));
        Ok(())
    }

    #[test]
    fn unreadable_pdf_without_ocr_is_a_parse_error() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("scan.pdf");
        std::fs::write(&path, b"%PDF-1.4 garbage")?;

        let result = FileTextExtractor::new().extract(&path);
        assert!(matches!(result, Err(IngestError::PdfParse(_))));
        Ok(())
    }

    #[test]
    fn supported_extensions_are_case_insensitive() {
        assert!(is_supported(Path::new("a/B.PDF")));
        assert!(is_supported(Path::new("notes.markdown")));
        assert!(!is_supported(Path::new("archive.tar.gz")));
        assert!(!is_supported(Path::new("README")));
    }
}
