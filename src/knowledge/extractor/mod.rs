
use tracing::{debug, warn};

use crate::{RagError, Result};

/// Text of a single page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageText {
    /// 1-based page number
    pub number: u32,
    pub text: String,
}

/// A document reduced to its per-page text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedDocument {
    pub source_uri: String,
    /// Display name, usually the file name
    pub name: String,
    pub pages: Vec<PageText>,
}

impl ExtractedDocument {
    /// Total characters of text across all pages
    #[inline]
    pub fn char_count(&self) -> usize {
        self.pages.iter().map(|p| p.text.chars().count()).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pages.iter().all(|p| p.text.trim().is_empty())
    }
}

/// Detected payload format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceFormat {
    Pdf,
    Text,
}

/// Guess the format from magic bytes, then content type and file extension
#[inline]
pub fn detect_format(bytes: &[u8], content_type: Option<&str>, source_uri: &str) -> SourceFormat {
    if bytes.starts_with(b"%PDF") {
        return SourceFormat::Pdf;
    }
    if content_type.is_some_and(|ct| ct.contains("application/pdf")) {
        return SourceFormat::Pdf;
    }
    if source_uri.to_lowercase().ends_with(".pdf") {
        return SourceFormat::Pdf;
    }
    SourceFormat::Text
}

/// Extract per-page text from raw source bytes
#[inline]
pub fn extract_document(
    source_uri: &str,
    bytes: &[u8],
    content_type: Option<&str>,
) -> Result<ExtractedDocument> {
    let pages = match detect_format(bytes, content_type, source_uri) {
        SourceFormat::Pdf => extract_pdf_pages(source_uri, bytes)?,
        SourceFormat::Text => {
            let text = std::str::from_utf8(bytes).map_err(|e| {
                RagError::Fetch(format!("{source_uri} is neither a PDF nor UTF-8 text: {e}"))
            })?;
            split_text_pages(text)
        }
    };

    let document = ExtractedDocument {
        source_uri: source_uri.to_string(),
        name: document_name(source_uri),
        pages,
    };

    debug!(
        "Extracted {} pages ({} chars) from {}",
        document.pages.len(),
        document.char_count(),
        source_uri
    );

    Ok(document)
}

fn extract_pdf_pages(source_uri: &str, bytes: &[u8]) -> Result<Vec<PageText>> {
    let pdf = lopdf::Document::load_mem(bytes)
        .map_err(|e| RagError::Fetch(format!("Failed to parse PDF {source_uri}: {e}")))?;

    let mut pages = Vec::new();
    for &number in pdf.get_pages().keys() {
        let text = match pdf.extract_text(&[number]) {
            Ok(text) => normalize_whitespace(&text),
            Err(e) => {
                // Scanned pages carry no text layer
                warn!("Could not extract text from page {number} of {source_uri}: {e}");
                String::new()
            }
        };
        pages.push(PageText { number, text });
    }

    Ok(pages)
}

/// Split plain text into pages on form feed characters
#[inline]
pub fn split_text_pages(text: &str) -> Vec<PageText> {
    text.split('\u{c}')
        .enumerate()
        .map(|(i, page)| PageText {
            number: i as u32 + 1,
            text: normalize_whitespace(page),
        })
        .collect()
}

/// Normalize line endings, strip trailing spaces and collapse runs of blank lines
#[inline]
pub fn normalize_whitespace(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut blank_run = 0;

    for line in text.replace("\r\n", "\n").replace('\r', "\n").lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        result.push_str(line);
        result.push('\n');
    }

    result.trim().to_string()
}

/// Last path segment of a URI or path, without query string
#[inline]
pub fn document_name(source_uri: &str) -> String {
    let without_query = source_uri
        .split(['?', '#'])
        .next()
        .unwrap_or(source_uri)
        .trim_end_matches('/');
    without_query
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(source_uri)
        .to_string()
}
