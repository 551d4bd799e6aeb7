//! Text extraction from downloaded transcript documents.
//!
//! Providers serve transcripts as PDF, HTML, or plain text. Extraction
//! failures are permanent errors: retrying the same bytes cannot help.

use thiserror::Error;

/// Minimum plausible length for an extracted transcript. Anything shorter
/// is a scanned/image PDF or a provider error page.
const MIN_TRANSCRIPT_CHARS: usize = 200;

/// Column width for HTML-to-text rendering.
const RENDER_WIDTH: usize = 80;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("PDF text extraction failed: {0}")]
    Pdf(String),

    #[error("Document produced no usable text ({0} chars)")]
    TooShort(usize),

    #[error("Empty document")]
    Empty,
}

/// Detected document format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Pdf,
    Html,
    Text,
}

fn detect(bytes: &[u8]) -> Format {
    if bytes.starts_with(b"%PDF") {
        return Format::Pdf;
    }
    let head: String = String::from_utf8_lossy(&bytes[..bytes.len().min(512)])
        .trim_start()
        .to_lowercase();
    if head.starts_with("<!doctype html") || head.starts_with("<html") {
        Format::Html
    } else {
        Format::Text
    }
}

/// Extract transcript text from raw document bytes.
pub fn extract_text(bytes: &[u8]) -> Result<String, ExtractError> {
    if bytes.is_empty() {
        return Err(ExtractError::Empty);
    }

    let text = match detect(bytes) {
        Format::Pdf => extract_pdf(bytes)?,
        Format::Html => html2text::from_read(bytes, RENDER_WIDTH),
        Format::Text => String::from_utf8_lossy(bytes).into_owned(),
    };

    let normalized = normalize_whitespace(&text);
    if normalized.chars().count() < MIN_TRANSCRIPT_CHARS {
        return Err(ExtractError::TooShort(normalized.chars().count()));
    }
    Ok(normalized)
}

fn extract_pdf(bytes: &[u8]) -> Result<String, ExtractError> {
    // pdf-extract can panic on malformed PDFs — wrap in catch_unwind
    let owned = bytes.to_vec();
    let result = std::panic::catch_unwind(move || pdf_extract::extract_text_from_mem(&owned));
    match result {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(ExtractError::Pdf(e.to_string())),
        Err(_) => Err(ExtractError::Pdf("extractor panicked on document".into())),
    }
}

fn normalize_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;
    for line in text.lines() {
        let trimmed = line.trim_end();
        if trimmed.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
            out.push('\n');
        } else {
            blank_run = 0;
            out.push_str(trimmed);
            out.push('\n');
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_text(prefix: &str) -> String {
        format!("{}\n{}", prefix, "earnings call commentary. ".repeat(20))
    }

    #[test]
    fn test_plain_text_passes_through() {
        let input = long_text("Q2 FY26 Earnings Call");
        let out = extract_text(input.as_bytes()).expect("extract");
        assert!(out.starts_with("Q2 FY26 Earnings Call"));
    }

    #[test]
    fn test_html_tags_stripped() {
        let body = long_text("Management discussion");
        let html = format!(
            "<!DOCTYPE html><html><head><style>p{{color:red}}</style></head>\
             <body><p>{}</p><script>alert(1)</script></body></html>",
            body
        );
        let out = extract_text(html.as_bytes()).expect("extract");
        assert!(out.contains("Management discussion"));
        assert!(!out.contains("<p>"));
        assert!(!out.contains("alert(1)"));
        assert!(!out.contains("color:red"));
    }

    #[test]
    fn test_empty_document_rejected() {
        assert!(matches!(extract_text(b""), Err(ExtractError::Empty)));
    }

    #[test]
    fn test_short_document_rejected() {
        let err = extract_text(b"Not Found").unwrap_err();
        assert!(matches!(err, ExtractError::TooShort(_)));
    }

    #[test]
    fn test_malformed_pdf_is_error_not_panic() {
        let mut bytes = b"%PDF-1.7 garbage".to_vec();
        bytes.extend(std::iter::repeat(0u8).take(64));
        assert!(matches!(extract_text(&bytes), Err(ExtractError::Pdf(_))));
    }

    #[test]
    fn test_blank_runs_collapsed() {
        let input = format!("line one\n\n\n\n\nline two\n{}", long_text(""));
        let out = extract_text(input.as_bytes()).expect("extract");
        assert!(!out.contains("\n\n\n"));
    }
}
