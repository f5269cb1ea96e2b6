use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::collab::chunker::TextChunker;
use crate::core::errors::StageError;

/// Number of CSV rows quoted verbatim in the summary text
const CSV_PREVIEW_ROWS: usize = 10;

/// A document decoded to text and split into chunks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedDocument {
    pub filename: String,
    pub file_type: String,
    pub raw_text: String,
    pub chunks: Vec<String>,
}

impl ParsedDocument {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

/// Turns uploaded bytes into chunked text
#[async_trait]
pub trait DocumentParser: Send + Sync + 'static {
    async fn parse(&self, filename: &str, content: &[u8]) -> Result<ParsedDocument, StageError>;
}

/// Parser for the plain-text formats: `txt`, `md`/`markdown` and `csv`.
///
/// Binary office formats are rejected as unsupported.
#[derive(Debug, Clone, Default)]
pub struct TextDocumentParser {
    chunker: TextChunker,
}

impl TextDocumentParser {
    pub fn new(chunker: TextChunker) -> Self {
        Self { chunker }
    }
}

#[async_trait]
impl DocumentParser for TextDocumentParser {
    async fn parse(&self, filename: &str, content: &[u8]) -> Result<ParsedDocument, StageError> {
        let file_type = extension(filename);
        let raw_text = match file_type.as_str() {
            "txt" => decode_text(content),
            "md" | "markdown" => strip_markdown(&decode_text(content)),
            "csv" => summarize_csv(&decode_text(content))?,
            _ => {
                return Err(StageError::parse(format!(
                    "Unsupported file type: .{file_type}"
                )))
            }
        };
        let raw_text = raw_text.trim().to_string();
        if raw_text.is_empty() {
            return Err(StageError::parse("Document contains no extractable text"));
        }

        let chunks = self.chunker.split(&raw_text);
        Ok(ParsedDocument {
            filename: filename.to_string(),
            file_type,
            raw_text,
            chunks,
        })
    }
}

/// Lowercased text after the last dot (the whole name when there is none)
pub fn extension(filename: &str) -> String {
    filename
        .rsplit('.')
        .next()
        .unwrap_or(filename)
        .to_lowercase()
}

/// UTF-8, falling back to Latin-1 which accepts any byte sequence
fn decode_text(content: &[u8]) -> String {
    match std::str::from_utf8(content) {
        Ok(text) => text.to_string(),
        Err(_) => content.iter().map(|&b| b as char).collect(),
    }
}

fn strip_markdown(markdown: &str) -> String {
    let mut lines = Vec::new();
    let mut in_fence = false;
    for line in markdown.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence {
            lines.push(line.to_string());
            continue;
        }
        let mut text = trimmed.trim_start_matches('#').trim_start();
        text = text.trim_start_matches('>').trim_start();
        for bullet in ["- ", "* ", "+ "] {
            if let Some(rest) = text.strip_prefix(bullet) {
                text = rest;
                break;
            }
        }
        lines.push(strip_inline(text));
    }
    lines.join("\n")
}

/// Drops emphasis markers, inline code ticks, HTML tags and link targets
fn strip_inline(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' | '`' => {}
            '<' => {
                // skip a tag up to the closing '>'
                for next in chars.by_ref() {
                    if next == '>' {
                        break;
                    }
                }
            }
            ']' if chars.peek() == Some(&'(') => {
                for next in chars.by_ref() {
                    if next == ')' {
                        break;
                    }
                }
            }
            '[' => {}
            '!' if chars.peek() == Some(&'[') => {}
            _ => out.push(c),
        }
    }
    out.replace("__", "")
}

fn summarize_csv(text: &str) -> Result<String, StageError> {
    let mut rows = text.lines().filter(|line| !line.trim().is_empty());
    let header = rows
        .next()
        .ok_or_else(|| StageError::parse("CSV file has no header row"))?;
    let columns: Vec<&str> = header.split(',').map(str::trim).collect();
    let body: Vec<&str> = rows.collect();

    let mut summary = format!(
        "CSV Columns: {}\nTotal Rows: {}\n\n",
        columns.join(", "),
        body.len()
    );
    summary.push_str(&columns.join(" | "));
    for row in body.iter().take(CSV_PREVIEW_ROWS) {
        summary.push('\n');
        let cells: Vec<&str> = row.split(',').map(str::trim).collect();
        summary.push_str(&cells.join(" | "));
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_txt_three_paragraphs() {
        let parser = TextDocumentParser::default();
        let content = b"Alpha is first.\n\nBeta is second.\n\nGamma is third.";
        let doc = parser.parse("notes.txt", content).await.unwrap();
        assert_eq!(doc.file_type, "txt");
        assert!(doc.chunk_count() >= 1);
        assert!(doc.raw_text.contains("Gamma"));
    }

    #[tokio::test]
    async fn test_latin1_fallback() {
        let parser = TextDocumentParser::default();
        let doc = parser.parse("caf\u{e9}.TXT", &[0x63, 0x61, 0x66, 0xe9]).await.unwrap();
        assert_eq!(doc.raw_text, "caf\u{e9}");
        assert_eq!(doc.file_type, "txt");
    }

    #[tokio::test]
    async fn test_unsupported_extension() {
        let parser = TextDocumentParser::default();
        let err = parser.parse("deck.pptx", b"PK\x03\x04").await.unwrap_err();
        assert_eq!(err, StageError::parse("Unsupported file type: .pptx"));
    }

    #[tokio::test]
    async fn test_empty_document_is_rejected() {
        let parser = TextDocumentParser::default();
        let err = parser.parse("blank.txt", b"   \n\n ").await.unwrap_err();
        assert_eq!(err.message(), "Document contains no extractable text");
    }

    #[tokio::test]
    async fn test_markdown_is_flattened() {
        let parser = TextDocumentParser::default();
        let md = b"# Title\n\nSome **bold** text with a [link](http://x.y).\n\n- item one";
        let doc = parser.parse("readme.md", md).await.unwrap();
        assert_eq!(doc.raw_text, "Title\n\nSome bold text with a link.\n\nitem one");
    }

    #[tokio::test]
    async fn test_csv_summary() {
        let parser = TextDocumentParser::default();
        let csv = b"name, qty\napple, 3\npear, 5\n";
        let doc = parser.parse("stock.csv", csv).await.unwrap();
        assert!(doc.raw_text.starts_with("CSV Columns: name, qty\nTotal Rows: 2"));
        assert!(doc.raw_text.contains("pear | 5"));
    }

    #[test]
    fn test_extension() {
        assert_eq!(extension("Report.Final.PDF"), "pdf");
        assert_eq!(extension("README"), "readme");
    }
}
