//! MIME-aware file-to-document conversion.
//!
//! Sits between connectors that hand over raw file payloads (Drive, GitHub)
//! and the chunker. Decides whether a file is indexable at all, converts
//! binary and markup formats to markdown-ish text, and dispatches to the
//! code or text chunker.

use tracing::warn;

use crate::chunker::{self, ChunkOptions};
use crate::extract;

/// Raw payload handed over by a connector.
pub enum FileInput<'a> {
    Text(&'a str),
    Bytes(&'a [u8]),
}

/// Converted, chunk-ready file content.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessedFile {
    pub content: String,
    /// Present when the content split into more than one chunk.
    pub chunks: Option<Vec<String>>,
    pub language: Option<String>,
}

/// Archive subtypes that are never indexable.
const ARCHIVE_SUBTYPES: &[&str] = &[
    "zip",
    "x-zip-compressed",
    "octet-stream",
    "x-tar",
    "x-gzip",
    "x-bzip2",
    "x-7z-compressed",
    "x-compress",
    "x-compressed",
];

/// Convert a file to indexable content, or `None` to skip it.
///
/// Policy:
/// 1. Media and archive MIME types are skipped.
/// 2. Strings with NUL bytes are skipped; HTML (by MIME or content sniff)
///    is converted to markdown, everything else passes through verbatim.
/// 3. Byte buffers are converted when the format is known
///    (docx/xlsx/pptx/pdf/html/csv), otherwise skipped.
/// 4. The result is chunked — code-aware when the extension says so.
pub fn process_file(
    input: FileInput<'_>,
    file_path: &str,
    mime_type: Option<&str>,
) -> Option<ProcessedFile> {
    if let Some(mime) = mime_type {
        if is_skipped_mime(mime) {
            return None;
        }
    }

    let content = match input {
        FileInput::Text(text) => {
            if text.contains('\0') {
                warn!(path = file_path, "skipping file with NUL bytes");
                return None;
            }
            if looks_like_html(text, mime_type) {
                match extract::html_to_markdown(text) {
                    Ok(md) => md,
                    Err(e) => {
                        warn!(path = file_path, error = %e, "HTML conversion failed, skipping");
                        return None;
                    }
                }
            } else {
                text.to_string()
            }
        }
        FileInput::Bytes(bytes) => {
            let content_type = convertible_content_type(file_path, mime_type)?;
            match extract::extract_bytes(bytes, content_type) {
                Ok(text) => text,
                Err(e) => {
                    warn!(path = file_path, error = %e, "extraction failed, skipping");
                    return None;
                }
            }
        }
    };

    let opts = ChunkOptions::default();
    let language = chunker::language_for_path(file_path).map(|l| l.to_string());
    let chunks = if chunker::is_code_path(file_path) {
        chunker::chunk_code(&content, file_path, &opts)
    } else {
        chunker::chunk_text(&content, &opts)
    };

    Some(ProcessedFile {
        content,
        chunks: (chunks.len() > 1).then_some(chunks),
        language,
    })
}

fn is_skipped_mime(mime: &str) -> bool {
    let mime = mime.to_ascii_lowercase();
    if mime.starts_with("image/") || mime.starts_with("video/") || mime.starts_with("audio/") {
        return true;
    }
    match mime.split_once('/') {
        Some(("application", subtype)) => ARCHIVE_SUBTYPES.contains(&subtype),
        _ => false,
    }
}

fn looks_like_html(text: &str, mime_type: Option<&str>) -> bool {
    if matches!(mime_type, Some(m) if m.to_ascii_lowercase().contains("html")) {
        return true;
    }
    let head = &text[..text.len().min(2048)];
    let head = head.to_ascii_lowercase();
    head.contains("<html") || head.contains("<body")
}

/// Resolve the extraction content type from MIME or file extension.
fn convertible_content_type(file_path: &str, mime_type: Option<&str>) -> Option<&'static str> {
    if let Some(mime) = mime_type {
        match mime {
            extract::MIME_PDF => return Some(extract::MIME_PDF),
            extract::MIME_DOCX => return Some(extract::MIME_DOCX),
            extract::MIME_PPTX => return Some(extract::MIME_PPTX),
            extract::MIME_XLSX => return Some(extract::MIME_XLSX),
            m if m.contains("html") => return Some(extract::MIME_HTML),
            m if m.contains("csv") => return Some(extract::MIME_CSV),
            _ => {}
        }
    }
    let ext = file_path.rsplit('.').next()?.to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => Some(extract::MIME_PDF),
        "docx" => Some(extract::MIME_DOCX),
        "pptx" => Some(extract::MIME_PPTX),
        "xlsx" => Some(extract::MIME_XLSX),
        "html" | "htm" => Some(extract::MIME_HTML),
        "csv" => Some(extract::MIME_CSV),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_mimes_are_skipped() {
        for mime in ["image/png", "video/mp4", "audio/mpeg", "application/zip"] {
            assert!(
                process_file(FileInput::Text("hello"), "a.txt", Some(mime)).is_none(),
                "{} should be skipped",
                mime
            );
        }
    }

    #[test]
    fn nul_bytes_are_rejected() {
        assert!(process_file(FileInput::Text("bin\0ary"), "a.txt", None).is_none());
    }

    #[test]
    fn plain_text_passes_through() {
        let result = process_file(FileInput::Text("Just notes."), "notes.txt", None).unwrap();
        assert_eq!(result.content, "Just notes.");
        assert!(result.chunks.is_none());
        assert!(result.language.is_none());
    }

    #[test]
    fn html_is_converted() {
        let result = process_file(
            FileInput::Text("<html><body><h1>Doc</h1><p>Body</p></body></html>"),
            "page.txt",
            None,
        )
        .unwrap();
        assert!(result.content.starts_with("# Doc"));
        assert!(result.content.contains("Body"));
    }

    #[test]
    fn unknown_binary_is_skipped() {
        assert!(process_file(FileInput::Bytes(&[1, 2, 3]), "blob.dat", None).is_none());
    }

    #[test]
    fn code_files_get_language() {
        let code = "fn main() {}\n";
        let result = process_file(FileInput::Text(code), "src/main.rs", None).unwrap();
        assert_eq!(result.language.as_deref(), Some("rust"));
    }

    #[test]
    fn long_code_produces_chunks() {
        let code = (0..200)
            .map(|i| format!("fn f_{}() {{\n    body({});\n}}\n", i, i))
            .collect::<Vec<_>>()
            .join("\n");
        let result = process_file(FileInput::Text(&code), "src/lib.rs", None).unwrap();
        assert!(result.chunks.is_some());
        assert!(result.chunks.unwrap().len() > 1);
    }
}
